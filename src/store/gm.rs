//! Per-group message logs (`data/gm/<group_id>`).
//!
//! Shares its id sequence with [`super::pm::PrivateMessageStore`] via the
//! same [`MessageIdAllocator`].

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::fileutil::{append_record, read_records};
use super::group::{GroupError, GroupStore};
use super::msgid::MessageIdAllocator;

const FIELD_COUNT: usize = 4;
const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 100;

#[derive(Debug)]
pub enum GmError {
    Group(GroupError),
    Io(std::io::Error),
}

impl fmt::Display for GmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GmError::Group(e) => write!(f, "{e}"),
            GmError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for GmError {}

impl From<std::io::Error> for GmError {
    fn from(e: std::io::Error) -> Self {
        GmError::Io(e)
    }
}

impl From<GroupError> for GmError {
    fn from(e: GroupError) -> Self {
        GmError::Group(e)
    }
}

#[derive(Debug, Clone)]
struct Record {
    msg_id: u64,
    from_username: String,
    payload: String,
    ts: u64,
}

pub struct HistoryEntry {
    pub msg_id: u64,
    pub from_username: String,
    pub payload: String,
    pub ts: u64,
}

pub struct GroupMessageStore {
    dir: PathBuf,
    lock: Mutex<()>,
    ids: Arc<MessageIdAllocator>,
}

impl GroupMessageStore {
    pub fn new(data_dir: &Path, ids: Arc<MessageIdAllocator>) -> Self {
        let dir = data_dir.join("gm");
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

    fn path_for_group(&self, group_id: u64) -> PathBuf {
        self.dir.join(group_id.to_string())
    }

    pub fn send(
        &self,
        groups: &GroupStore,
        from_username: &str,
        group_id: u64,
        payload: &str,
    ) -> Result<u64, GmError> {
        groups.list_members(from_username, group_id)?;
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let msg_id = self.ids.allocate();
        let ts = now();
        let path = self.path_for_group(group_id);
        append_record(
            &path,
            &[&msg_id.to_string(), from_username, payload, &ts.to_string()],
        )?;
        Ok(msg_id)
    }

    pub fn history(
        &self,
        groups: &GroupStore,
        caller: &str,
        group_id: u64,
        limit: Option<usize>,
    ) -> Result<Vec<HistoryEntry>, GmError> {
        groups.list_members(caller, group_id)?;
        let limit = limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let _guard = self.lock.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.path_for_group(group_id);
        let records = read_records(&path, FIELD_COUNT)?;
        let mut records: Vec<Record> = records.into_iter().filter_map(|f| parse_record(&f)).collect();
        records.sort_by(|a, b| b.msg_id.cmp(&a.msg_id));
        records.truncate(limit);
        Ok(records
            .into_iter()
            .map(|r| HistoryEntry {
                msg_id: r.msg_id,
                from_username: r.from_username,
                payload: r.payload,
                ts: r.ts,
            })
            .collect())
    }
}

fn parse_record(fields: &[String]) -> Option<Record> {
    Some(Record {
        msg_id: fields[0].parse().ok()?,
        from_username: fields[1].clone(),
        payload: fields[2].clone(),
        ts: fields[3].parse().ok()?,
    })
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
