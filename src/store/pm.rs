//! Per-pair private conversation logs (`data/pm/<min_id>_<max_id>`).
//!
//! Push delivery is *not* performed here — that is the router's job; this
//! store only persists and retrieves.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::fileutil::{read_records, rewrite_records};
use super::msgid::MessageIdAllocator;
use crate::store::account::AccountStore;

const FIELD_COUNT: usize = 5;
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;

#[derive(Debug)]
pub enum PmError {
    SelfMessage,
    NotFound,
    Io(std::io::Error),
}

impl fmt::Display for PmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PmError::SelfMessage => write!(f, "cannot send a message to yourself"),
            PmError::NotFound => write!(f, "recipient not found"),
            PmError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for PmError {}

impl From<std::io::Error> for PmError {
    fn from(e: std::io::Error) -> Self {
        PmError::Io(e)
    }
}

#[derive(Debug, Clone)]
struct Record {
    msg_id: u64,
    from_id: u64,
    payload: String,
    ts: u64,
    read: bool,
}

pub struct HistoryEntry {
    pub msg_id: u64,
    pub from_username: String,
    pub payload: String,
    pub ts: u64,
}

pub struct PrivateMessageStore {
    dir: PathBuf,
    lock: Mutex<()>,
    ids: std::sync::Arc<MessageIdAllocator>,
}

impl PrivateMessageStore {
    pub fn new(data_dir: &Path, ids: std::sync::Arc<MessageIdAllocator>) -> Self {
        let dir = data_dir.join("pm");
        let _ = fs::create_dir_all(&dir);
        let max_seen = Self::scan_max_id(&dir);
        ids.observe_existing_max(max_seen);
        Self {
            dir,
            lock: Mutex::new(()),
            ids,
        }
    }

    fn scan_max_id(dir: &Path) -> u64 {
        let mut max_seen = 0;
        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.flatten() {
                if let Ok(records) = read_records(&entry.path(), FIELD_COUNT) {
                    for r in records {
                        if let Some(rec) = parse_record(&r) {
                            max_seen = max_seen.max(rec.msg_id);
                        }
                    }
                }
            }
        }
        max_seen
    }

    fn path_for_pair(&self, a: u64, b: u64) -> PathBuf {
        let (lo, hi) = if a < b { (a, b) } else { (b, a) };
        self.dir.join(format!("{lo}_{hi}"))
    }

    pub fn send(
        &self,
        accounts: &AccountStore,
        from_id: u64,
        to_username: &str,
        payload: &str,
    ) -> Result<u64, PmError> {
        let to_id = accounts.get_user_id(to_username).ok_or(PmError::NotFound)?;
        if to_id == from_id {
            return Err(PmError::SelfMessage);
        }
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let msg_id = self.ids.allocate();
        let ts = now();
        let path = self.path_for_pair(from_id, to_id);
        super::fileutil::append_record(
            &path,
            &[
                &msg_id.to_string(),
                &from_id.to_string(),
                payload,
                &ts.to_string(),
                "0",
            ],
        )?;
        Ok(msg_id)
    }

    pub fn history(
        &self,
        accounts: &AccountStore,
        viewer_id: u64,
        other_username: &str,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, PmError> {
        let other_id = accounts
            .get_user_id(other_username)
            .ok_or(PmError::NotFound)?;
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path_for_pair(viewer_id, other_id);
        let records = read_records(&path, FIELD_COUNT)?;
        let mut records: Vec<Record> = records.into_iter().filter_map(|f| parse_record(&f)).collect();
        records.sort_by(|a, b| b.msg_id.cmp(&a.msg_id));
        records.truncate(limit);
        let entries = records
            .into_iter()
            .map(|r| HistoryEntry {
                msg_id: r.msg_id,
                from_username: if r.from_id == viewer_id {
                    // The viewer's own sends are attributed to them directly;
                    // no store round-trip needed since we already know who "viewer" is.
                    accounts
                        .get_username(viewer_id)
                        .unwrap_or_else(|| viewer_id.to_string())
                } else {
                    other_username.to_owned()
                },
                payload: r.payload,
                ts: r.ts,
            })
            .collect();
        Ok(entries)
    }

    pub fn conversations(
        &self,
        accounts: &AccountStore,
        user_id: u64,
    ) -> Result<Vec<(String, u64)>, PmError> {
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut out = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Ok(out),
        };
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            let mut parts = name.splitn(2, '_');
            let (a, b) = match (parts.next(), parts.next()) {
                (Some(a), Some(b)) => (a.parse::<u64>(), b.parse::<u64>()),
                _ => continue,
            };
            let (a, b) = match (a, b) {
                (Ok(a), Ok(b)) => (a, b),
                _ => continue,
            };
            let other_id = if a == user_id {
                Some(b)
            } else if b == user_id {
                Some(a)
            } else {
                None
            };
            let other_id = match other_id {
                Some(id) => id,
                None => continue,
            };
            let records = read_records(&entry.path(), FIELD_COUNT)?;
            let unread = records
                .into_iter()
                .filter_map(|f| parse_record(&f))
                .filter(|r| r.from_id == other_id && !r.read)
                .count();
            if let Some(username) = accounts.get_username(other_id) {
                out.push((username, unread as u64));
            }
        }
        Ok(out)
    }

    pub fn mark_read(
        &self,
        accounts: &AccountStore,
        viewer_id: u64,
        other_username: &str,
    ) -> Result<(), PmError> {
        let other_id = accounts
            .get_user_id(other_username)
            .ok_or(PmError::NotFound)?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path_for_pair(viewer_id, other_id);
        let records = read_records(&path, FIELD_COUNT)?;
        let mut records: Vec<Record> = records.into_iter().filter_map(|f| parse_record(&f)).collect();
        for r in records.iter_mut() {
            if r.from_id == other_id {
                r.read = true;
            }
        }
        let lines: Vec<String> = records.iter().map(format_record).collect();
        rewrite_records(&path, &lines)?;
        Ok(())
    }
}

fn parse_record(fields: &[String]) -> Option<Record> {
    Some(Record {
        msg_id: fields[0].parse().ok()?,
        from_id: fields[1].parse().ok()?,
        payload: fields[2].clone(),
        ts: fields[3].parse().ok()?,
        read: fields[4] == "1",
    })
}

fn format_record(r: &Record) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        r.msg_id,
        r.from_id,
        r.payload,
        r.ts,
        if r.read { 1 } else { 0 }
    )
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, AccountStore, PrivateMessageStore) {
        let dir = tempdir().unwrap();
        let accounts = AccountStore::new(dir.path());
        let ids = Arc::new(MessageIdAllocator::new(dir.path()));
        let pm = PrivateMessageStore::new(dir.path(), ids);
        accounts.register("alice", "pw", "a@b.co").unwrap();
        accounts.register("bob", "pw", "b@b.co").unwrap();
        (dir, accounts, pm)
    }

    #[test]
    fn send_then_history_contains_exactly_one_entry() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        let msg_id = pm.send(&accounts, alice_id, "bob", "aGk=").unwrap();
        let history = pm.history(&accounts, alice_id, "bob", None).unwrap();
        assert_eq!(history.iter().filter(|h| h.msg_id == msg_id).count(), 1);
    }

    #[test]
    fn history_is_most_recent_first() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        pm.send(&accounts, alice_id, "bob", "first").unwrap();
        pm.send(&accounts, alice_id, "bob", "second").unwrap();
        let history = pm.history(&accounts, alice_id, "bob", None).unwrap();
        assert_eq!(history[0].payload, "second");
        assert_eq!(history[1].payload, "first");
    }

    #[test]
    fn history_limit_clamped() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        for i in 0..5 {
            pm.send(&accounts, alice_id, "bob", &format!("m{i}")).unwrap();
        }
        let history = pm.history(&accounts, alice_id, "bob", Some(2)).unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn missing_history_is_empty_not_error() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        let history = pm.history(&accounts, alice_id, "bob", None).unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn self_send_rejected() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        let err = pm.send(&accounts, alice_id, "alice", "x").unwrap_err();
        assert!(matches!(err, PmError::SelfMessage));
    }

    #[test]
    fn conversations_tracks_unread_count() {
        let (_d, accounts, pm) = setup();
        let alice_id = accounts.get_user_id("alice").unwrap();
        let bob_id = accounts.get_user_id("bob").unwrap();
        pm.send(&accounts, alice_id, "bob", "hi").unwrap();
        pm.send(&accounts, alice_id, "bob", "there").unwrap();
        let convos = pm.conversations(&accounts, bob_id).unwrap();
        assert_eq!(convos, vec![("alice".to_owned(), 2)]);
        pm.mark_read(&accounts, bob_id, "alice").unwrap();
        let convos = pm.conversations(&accounts, bob_id).unwrap();
        assert_eq!(convos, vec![("alice".to_owned(), 0)]);
    }

    #[test]
    fn msg_ids_unique_across_multiple_pairs() {
        let (_d, accounts, pm) = setup();
        accounts.register("carol", "pw", "c@b.co").unwrap();
        let alice_id = accounts.get_user_id("alice").unwrap();
        let m1 = pm.send(&accounts, alice_id, "bob", "x").unwrap();
        let m2 = pm.send(&accounts, alice_id, "carol", "y").unwrap();
        assert_ne!(m1, m2);
    }
}
