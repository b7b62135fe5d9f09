#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use parley::gateway::Gateway;
use parley::identity::{InMemoryDirectory, Participant, Profile, Role};
use parley::presence::TypingTracker;
use parley::session::SessionManager;
use parley::store::MessageStore;

/// A store backed by a throwaway on-disk database, with a small directory of
/// known participants. The temp dir must outlive the pool.
pub struct TestStore {
    pub store: Arc<MessageStore>,
    pub directory: Arc<InMemoryDirectory>,
    pub db_path: PathBuf,
    _tmp: TempDir,
}

pub async fn store_with_directory() -> TestStore {
    let tmp = TempDir::new().expect("temp dir");
    let db_path = tmp.path().join("parley-test.db");
    let url = format!("sqlite://{}?mode=rwc", db_path.display());

    let directory = Arc::new(InMemoryDirectory::new());
    directory.insert(profile("cust-1", Role::Customer, "Alice"));
    directory.insert(profile("cust-2", Role::Customer, "Carol"));
    directory.insert(profile("biz-1", Role::Business, "Corner Bakery"));
    directory.insert(profile("biz-2", Role::Business, "Bike Repair"));

    let store = Arc::new(
        MessageStore::connect(&url, directory.clone(), 1000)
            .await
            .expect("store connects"),
    );

    TestStore {
        store,
        directory,
        db_path,
        _tmp: tmp,
    }
}

pub fn gateway(store: Arc<MessageStore>, typing_deadline: Duration) -> Gateway {
    Gateway::new(
        store,
        Arc::new(SessionManager::new()),
        Arc::new(TypingTracker::new(typing_deadline)),
        3,
    )
}

pub fn profile(id: &str, role: Role, name: &str) -> Profile {
    Profile {
        id: id.to_string(),
        role,
        name: name.to_string(),
        avatar: None,
    }
}

pub fn participant(id: &str, role: Role, name: &str) -> Participant {
    Participant {
        id: id.to_string(),
        role,
        name: name.to_string(),
    }
}

pub fn customer() -> Participant {
    participant("cust-1", Role::Customer, "Alice")
}

pub fn business() -> Participant {
    participant("biz-1", Role::Business, "Corner Bakery")
}
