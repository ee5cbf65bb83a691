//! File-backed groups and membership (`data/groups.db`, `data/group_members.db`).
//!
//! Group-id allocation uses a persisted counter file (`data/groups.id`)
//! rather than wall-clock seconds, which would collide if two groups were
//! created in the same second.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::fileutil::{append_record, read_counter, read_records, rewrite_records, write_counter};
use crate::store::account::AccountStore;

const GROUP_FIELDS: usize = 4;
const MEMBER_FIELDS: usize = 2;

#[derive(Debug)]
pub enum GroupError {
    /// The group id itself does not exist.
    GroupNotFound,
    /// The group exists but the named user is not a member of it (or, for
    /// `add_member`, does not exist as an account at all).
    NotFound,
    Permission,
    SelfLeave,
    Exists,
    Io(std::io::Error),
}

impl fmt::Display for GroupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupError::GroupNotFound => write!(f, "group not found"),
            GroupError::NotFound => write!(f, "member not found"),
            GroupError::Permission => write!(f, "caller is not the group owner"),
            GroupError::SelfLeave => write!(f, "owner cannot leave the group"),
            GroupError::Exists => write!(f, "already a member"),
            GroupError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for GroupError {}

impl From<std::io::Error> for GroupError {
    fn from(e: std::io::Error) -> Self {
        GroupError::Io(e)
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: u64,
    pub name: String,
    pub owner: String,
    pub created_at: u64,
}

struct Paths {
    groups: PathBuf,
    members: PathBuf,
    counter: PathBuf,
}

pub struct GroupStore {
    paths: Paths,
    next_id: Mutex<u64>,
}

impl GroupStore {
    pub fn new(data_dir: &Path) -> Self {
        let counter = data_dir.join("groups.id");
        let seed = read_counter(&counter, 1);
        Self {
            paths: Paths {
                groups: data_dir.join("groups.db"),
                members: data_dir.join("group_members.db"),
                counter,
            },
            next_id: Mutex::new(seed),
        }
    }

    fn load_groups(&self) -> Result<Vec<Group>, GroupError> {
        let records = read_records(&self.paths.groups, GROUP_FIELDS)?;
        Ok(records.into_iter().filter_map(|f| parse_group(&f)).collect())
    }

    fn load_members(&self) -> Result<Vec<(u64, String)>, GroupError> {
        let records = read_records(&self.paths.members, MEMBER_FIELDS)?;
        Ok(records
            .into_iter()
            .filter_map(|f| Some((f[0].parse().ok()?, f[1].clone())))
            .collect())
    }

    pub fn create(&self, owner: &str, name: &str) -> Result<u64, GroupError> {
        let mut next_id = self.next_id.lock().unwrap_or_else(|p| p.into_inner());
        let id = *next_id;
        *next_id += 1;
        write_counter(&self.paths.counter, *next_id)?;
        drop(next_id);

        let created_at = now();
        append_record(
            &self.paths.groups,
            &[&id.to_string(), name, owner, &created_at.to_string()],
        )?;
        append_record(&self.paths.members, &[&id.to_string(), owner])?;
        Ok(id)
    }

    pub fn list(&self, username: &str) -> Result<Vec<u64>, GroupError> {
        let members = self.load_members()?;
        Ok(members
            .into_iter()
            .filter(|(_, u)| u == username)
            .map(|(g, _)| g)
            .collect())
    }

    fn is_member(&self, group_id: u64, username: &str) -> Result<bool, GroupError> {
        Ok(self
            .load_members()?
            .iter()
            .any(|(g, u)| *g == group_id && u == username))
    }

    fn find_group(&self, group_id: u64) -> Result<Group, GroupError> {
        self.load_groups()?
            .into_iter()
            .find(|g| g.id == group_id)
            .ok_or(GroupError::GroupNotFound)
    }

    pub fn list_members(&self, caller: &str, group_id: u64) -> Result<Vec<String>, GroupError> {
        self.find_group(group_id)?;
        if !self.is_member(group_id, caller)? {
            return Err(GroupError::Permission);
        }
        Ok(self
            .load_members()?
            .into_iter()
            .filter(|(g, _)| *g == group_id)
            .map(|(_, u)| u)
            .collect())
    }

    pub fn add_member(
        &self,
        accounts: &AccountStore,
        caller: &str,
        group_id: u64,
        username: &str,
    ) -> Result<(), GroupError> {
        let group = self.find_group(group_id)?;
        if group.owner != caller {
            return Err(GroupError::Permission);
        }
        if !accounts.exists(username) {
            return Err(GroupError::NotFound);
        }
        if self.is_member(group_id, username)? {
            return Err(GroupError::Exists);
        }
        append_record(&self.paths.members, &[&group_id.to_string(), username])?;
        Ok(())
    }

    pub fn remove_member(
        &self,
        caller: &str,
        group_id: u64,
        username: &str,
    ) -> Result<(), GroupError> {
        let group = self.find_group(group_id)?;
        if group.owner != caller {
            return Err(GroupError::Permission);
        }
        let mut members = self.load_members()?;
        let before = members.len();
        members.retain(|(g, u)| !(*g == group_id && u == username));
        if members.len() == before {
            return Err(GroupError::NotFound);
        }
        self.save_members(&members)
    }

    pub fn leave(&self, username: &str, group_id: u64) -> Result<(), GroupError> {
        let group = self.find_group(group_id)?;
        if group.owner == username {
            return Err(GroupError::SelfLeave);
        }
        let mut members = self.load_members()?;
        let before = members.len();
        members.retain(|(g, u)| !(*g == group_id && u == username));
        if members.len() == before {
            return Err(GroupError::NotFound);
        }
        self.save_members(&members)
    }

    pub fn group_name(&self, group_id: u64) -> Result<String, GroupError> {
        Ok(self.find_group(group_id)?.name)
    }

    fn save_members(&self, members: &[(u64, String)]) -> Result<(), GroupError> {
        let lines: Vec<String> = members
            .iter()
            .map(|(g, u)| format!("{g}|{u}"))
            .collect();
        rewrite_records(&self.paths.members, &lines)?;
        Ok(())
    }
}

fn parse_group(fields: &[String]) -> Option<Group> {
    Some(Group {
        id: fields[0].parse().ok()?,
        name: fields[1].clone(),
        owner: fields[2].clone(),
        created_at: fields[3].parse().ok()?,
    })
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

    fn setup() -> (tempfile::TempDir, AccountStore, GroupStore) {
        let dir = tempdir().unwrap();
        let accounts = AccountStore::new(dir.path());
        let groups = GroupStore::new(dir.path());
        accounts.register("alice", "pw", "a@b.co").unwrap();
        accounts.register("bob", "pw", "b@b.co").unwrap();
        (dir, accounts, groups)
    }

    #[test]
    fn create_adds_owner_as_member() {
        let (_d, _accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        assert_eq!(groups.list_members("alice", gid).unwrap(), vec!["alice"]);
    }

    #[test]
    fn group_ids_strictly_increase() {
        let (_d, _accounts, groups) = setup();
        let g1 = groups.create("alice", "one").unwrap();
        let g2 = groups.create("alice", "two").unwrap();
        assert!(g2 > g1);
    }

    #[test]
    fn add_member_requires_ownership() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        let err = groups
            .add_member(&accounts, "bob", gid, "bob")
            .unwrap_err();
        assert!(matches!(err, GroupError::Permission));
    }

    #[test]
    fn add_member_rejects_unknown_user() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        let err = groups
            .add_member(&accounts, "alice", gid, "carol")
            .unwrap_err();
        assert!(matches!(err, GroupError::NotFound));
    }

    #[test]
    fn add_member_rejects_duplicate() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        groups.add_member(&accounts, "alice", gid, "bob").unwrap();
        let err = groups
            .add_member(&accounts, "alice", gid, "bob")
            .unwrap_err();
        assert!(matches!(err, GroupError::Exists));
    }

    #[test]
    fn owner_cannot_leave() {
        let (_d, _accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        let err = groups.leave("alice", gid).unwrap_err();
        assert!(matches!(err, GroupError::SelfLeave));
    }

    #[test]
    fn member_can_leave() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        groups.add_member(&accounts, "alice", gid, "bob").unwrap();
        groups.leave("bob", gid).unwrap();
        assert_eq!(groups.list("bob").unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn remove_member_requires_ownership() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        groups.add_member(&accounts, "alice", gid, "bob").unwrap();
        let err = groups.remove_member("bob", gid, "bob").unwrap_err();
        assert!(matches!(err, GroupError::Permission));
    }

    #[test]
    fn list_members_requires_membership() {
        let (_d, accounts, groups) = setup();
        let gid = groups.create("alice", "study").unwrap();
        accounts.register("carol", "pw", "c@b.co").unwrap();
        let err = groups.list_members("carol", gid).unwrap_err();
        assert!(matches!(err, GroupError::Permission));
    }
}
