//! File-backed friendship edges (`data/friends.db`).
//!
//! One line per edge: `from_username|to_username|STATUS|ts`. ACCEPTED edges
//! are semantically undirected; everything else about the edge (who invited
//! whom, when) stays directional in storage.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::fileutil::{read_records, rewrite_records};
use crate::store::account::AccountStore;
use crate::store::session::SessionRegistry;

const FIELD_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Pending,
    Accepted,
    Rejected,
}

impl Status {
    fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "PENDING",
            Status::Accepted => "ACCEPTED",
            Status::Rejected => "REJECTED",
        }
    }

    fn parse(s: &str) -> Option<Status> {
        match s {
            "PENDING" => Some(Status::Pending),
            "ACCEPTED" => Some(Status::Accepted),
            "REJECTED" => Some(Status::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    to: String,
    status: Status,
    ts: u64,
}

#[derive(Debug)]
pub enum FriendshipError {
    SelfEdge,
    NotFound,
    Exists,
    Io(std::io::Error),
}

impl fmt::Display for FriendshipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FriendshipError::SelfEdge => write!(f, "cannot target self"),
            FriendshipError::NotFound => write!(f, "friend edge not found"),
            FriendshipError::Exists => write!(f, "edge already pending or accepted"),
            FriendshipError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FriendshipError {}

impl From<std::io::Error> for FriendshipError {
    fn from(e: std::io::Error) -> Self {
        FriendshipError::Io(e)
    }
}

pub struct FriendshipStore {
    path: Mutex<PathBuf>,
}

impl FriendshipStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: Mutex::new(data_dir.join("friends.db")),
        }
    }

    fn load(&self, path: &Path) -> Result<Vec<Edge>, FriendshipError> {
        let records = read_records(path, FIELD_COUNT)?;
        Ok(records.into_iter().filter_map(|f| parse_edge(&f)).collect())
    }

    fn save(&self, path: &Path, edges: &[Edge]) -> Result<(), FriendshipError> {
        let lines: Vec<String> = edges.iter().map(format_edge).collect();
        rewrite_records(path, &lines)?;
        Ok(())
    }

    pub fn invite(
        &self,
        accounts: &AccountStore,
        from_username: &str,
        to_username: &str,
    ) -> Result<(), FriendshipError> {
        if from_username == to_username {
            return Err(FriendshipError::SelfEdge);
        }
        if !accounts.exists(to_username) {
            return Err(FriendshipError::NotFound);
        }
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut edges = self.load(&path)?;
        if edges.iter().any(|e| {
            matches!(e.status, Status::Pending | Status::Accepted)
                && touches_pair(e, from_username, to_username)
        }) {
            return Err(FriendshipError::Exists);
        }
        edges.push(Edge {
            from: from_username.to_owned(),
            to: to_username.to_owned(),
            status: Status::Pending,
            ts: now(),
        });
        self.save(&path, &edges)
    }

    pub fn accept(
        &self,
        to_username: &str,
        from_username: &str,
    ) -> Result<(), FriendshipError> {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut edges = self.load(&path)?;
        let edge = edges
            .iter_mut()
            .find(|e| e.from == from_username && e.to == to_username && e.status == Status::Pending)
            .ok_or(FriendshipError::NotFound)?;
        edge.status = Status::Accepted;
        edge.ts = now();
        self.save(&path, &edges)
    }

    pub fn reject(
        &self,
        to_username: &str,
        from_username: &str,
    ) -> Result<(), FriendshipError> {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut edges = self.load(&path)?;
        let before = edges.len();
        edges.retain(|e| {
            !(e.from == from_username && e.to == to_username && e.status == Status::Pending)
        });
        if edges.len() == before {
            return Err(FriendshipError::NotFound);
        }
        self.save(&path, &edges)
    }

    pub fn pending(&self, username: &str) -> Result<Vec<String>, FriendshipError> {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let edges = self.load(&path)?;
        Ok(edges
            .into_iter()
            .filter(|e| e.to == username && e.status == Status::Pending)
            .map(|e| e.from)
            .collect())
    }

    pub async fn list(
        &self,
        sessions: &SessionRegistry,
        accounts: &AccountStore,
        username: &str,
    ) -> Result<Vec<String>, FriendshipError> {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let edges = self.load(&path)?;
        let mut out = Vec::new();
        for e in edges.into_iter().filter(|e| e.status == Status::Accepted) {
            let other = if e.from == username {
                Some(e.to)
            } else if e.to == username {
                Some(e.from)
            } else {
                None
            };
            if let Some(other) = other {
                let online = match accounts.get_user_id(&other) {
                    Some(id) => sessions.is_user_online(id).await,
                    None => false,
                };
                out.push(format!("{other}:{}", if online { "online" } else { "offline" }));
            }
        }
        Ok(out)
    }

    pub fn delete(&self, username: &str, other: &str) -> Result<(), FriendshipError> {
        let path = self.path.lock().unwrap_or_else(|p| p.into_inner()).clone();
        let mut edges = self.load(&path)?;
        let before = edges.len();
        edges.retain(|e| {
            !(e.status == Status::Accepted && touches_pair(e, username, other))
        });
        if edges.len() == before {
            return Err(FriendshipError::NotFound);
        }
        self.save(&path, &edges)
    }
}

fn touches_pair(edge: &Edge, a: &str, b: &str) -> bool {
    (edge.from == a && edge.to == b) || (edge.from == b && edge.to == a)
}

fn parse_edge(fields: &[String]) -> Option<Edge> {
    Some(Edge {
        from: fields[0].clone(),
        to: fields[1].clone(),
        status: Status::parse(&fields[2])?,
        ts: fields[3].parse().ok()?,
    })
}

fn format_edge(edge: &Edge) -> String {
    format!("{}|{}|{}|{}", edge.from, edge.to, edge.status.as_str(), edge.ts)
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
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, AccountStore, FriendshipStore) {
        let dir = tempdir().unwrap();
        let accounts = AccountStore::new(dir.path());
        let friends = FriendshipStore::new(dir.path());
        accounts.register("alice", "pw", "a@b.co").unwrap();
        accounts.register("bob", "pw", "b@b.co").unwrap();
        (dir, accounts, friends)
    }

    #[test]
    fn invite_rejects_self() {
        let (_d, accounts, friends) = setup();
        let err = friends.invite(&accounts, "alice", "alice").unwrap_err();
        assert!(matches!(err, FriendshipError::SelfEdge));
    }

    #[test]
    fn invite_rejects_unknown_recipient() {
        let (_d, accounts, friends) = setup();
        let err = friends.invite(&accounts, "alice", "carol").unwrap_err();
        assert!(matches!(err, FriendshipError::NotFound));
    }

    #[test]
    fn invite_accept_cycle() {
        let (_d, accounts, friends) = setup();
        friends.invite(&accounts, "alice", "bob").unwrap();
        assert_eq!(friends.pending("bob").unwrap(), vec!["alice"]);
        friends.accept("bob", "alice").unwrap();
        assert!(friends.pending("bob").unwrap().is_empty());
    }

    #[test]
    fn duplicate_invite_either_direction_rejected() {
        let (_d, accounts, friends) = setup();
        friends.invite(&accounts, "alice", "bob").unwrap();
        let err = friends.invite(&accounts, "bob", "alice").unwrap_err();
        assert!(matches!(err, FriendshipError::Exists));
    }

    #[test]
    fn reject_removes_edge() {
        let (_d, accounts, friends) = setup();
        friends.invite(&accounts, "alice", "bob").unwrap();
        friends.reject("bob", "alice").unwrap();
        assert!(friends.pending("bob").unwrap().is_empty());
        // Edge gone entirely: a fresh invite in either direction now succeeds.
        friends.invite(&accounts, "bob", "alice").unwrap();
    }

    #[tokio::test]
    async fn list_is_symmetric_after_accept() {
        let (_d, accounts, friends) = setup();
        let sessions = SessionRegistry::new(3600);
        friends.invite(&accounts, "alice", "bob").unwrap();
        friends.accept("bob", "alice").unwrap();
        let alice_list = friends.list(&sessions, &accounts, "alice").await.unwrap();
        let bob_list = friends.list(&sessions, &accounts, "bob").await.unwrap();
        assert_eq!(alice_list, vec!["bob:offline".to_owned()]);
        assert_eq!(bob_list, vec!["alice:offline".to_owned()]);
    }

    #[tokio::test]
    async fn list_reflects_online_status() {
        let (_d, accounts, friends) = setup();
        let sessions = SessionRegistry::new(3600);
        friends.invite(&accounts, "alice", "bob").unwrap();
        friends.accept("bob", "alice").unwrap();
        let bob_id = accounts.get_user_id("bob").unwrap();
        sessions.create(bob_id, 1).await.unwrap();
        let alice_list = friends.list(&sessions, &accounts, "alice").await.unwrap();
        assert_eq!(alice_list, vec!["bob:online".to_owned()]);
    }

    #[test]
    fn delete_removes_accepted_edge() {
        let (_d, accounts, friends) = setup();
        friends.invite(&accounts, "alice", "bob").unwrap();
        friends.accept("bob", "alice").unwrap();
        friends.delete("alice", "bob").unwrap();
        assert!(matches!(
            friends.delete("alice", "bob").unwrap_err(),
            FriendshipError::NotFound
        ));
    }
}
