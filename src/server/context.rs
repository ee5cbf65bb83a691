//! Shared server state: every store plus config and the activity log,
//! instantiated once at startup and handed to each connection worker.
//!
//! Lock ordering when a handler must touch more than one store mirrors the
//! construction order below — account, session, friendships, groups, pm,
//! gm — so that no two handlers can acquire two store locks in opposite
//! order.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::activity_log::ActivityLog;
use crate::config::ServerConfig;
use crate::store::account::AccountStore;
use crate::store::friendship::FriendshipStore;
use crate::store::gm::GroupMessageStore;
use crate::store::group::GroupStore;
use crate::store::msgid::MessageIdAllocator;
use crate::store::pm::PrivateMessageStore;
use crate::store::session::{ConnectionId, SessionRegistry};

pub struct AppContext {
    pub config: ServerConfig,
    pub accounts: AccountStore,
    pub sessions: SessionRegistry,
    pub friendships: FriendshipStore,
    pub groups: GroupStore,
    pub pm: PrivateMessageStore,
    pub gm: GroupMessageStore,
    pub activity_log: ActivityLog,
    next_connection_id: AtomicU64,
}

impl AppContext {
    pub fn new(config: ServerConfig) -> std::io::Result<Arc<Self>> {
        std::fs::create_dir_all(&config.data_dir)?;
        let data_dir: &Path = &config.data_dir;
        let ids = Arc::new(MessageIdAllocator::new(data_dir));
        Ok(Arc::new(Self {
            accounts: AccountStore::new(data_dir),
            sessions: SessionRegistry::new(config.session_timeout_secs),
            friendships: FriendshipStore::new(data_dir),
            groups: GroupStore::new(data_dir),
            pm: PrivateMessageStore::new(data_dir, ids.clone()),
            gm: GroupMessageStore::new(data_dir, ids),
            activity_log: ActivityLog::new(data_dir),
            config,
            next_connection_id: AtomicU64::new(1),
        }))
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
