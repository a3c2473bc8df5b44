use std::sync::Arc;

use cairn_state::backends::{LocalLockTable, LocalObjectStore, MemoryLockTable, MemoryObjectStore};
use cairn_state::{Backend, BackendConfig, BackendError, LockError, LockTable, StateManager};

fn config() -> BackendConfig {
    let mut config = BackendConfig::new("memory", "bucket");
    config.lock_table = "locks".to_string();
    config.lock_table_endpoint = "memory".to_string();
    config
}

/// A lost race may surface as a held lock; anything else is a failure
fn assert_ok_or_lock_held<T>(result: Result<T, BackendError>) -> bool {
    match result {
        Ok(_) => true,
        Err(BackendError::LockAcquisitionFailed {
            source: LockError::Held(_),
            ..
        }) => false,
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initializers_write_exactly_once() {
    let store = Arc::new(MemoryObjectStore::with_bucket("bucket"));
    let locks = Arc::new(MemoryLockTable::new("locks"));
    let backend = Arc::new(
        Backend::new(
            config(),
            store.clone(),
            Some(locks.clone() as Arc<dyn LockTable>),
        )
        .unwrap(),
    );

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let backend = backend.clone();
            tokio::spawn(async move { backend.state_mgr("brand-new").await })
        })
        .collect();

    let mut succeeded = 0;
    for task in tasks {
        if assert_ok_or_lock_held(task.await.unwrap()) {
            succeeded += 1;
        }
    }

    assert!(succeeded >= 1);
    assert_eq!(store.put_count(), 1);
    assert_eq!(locks.held_count(), 0);
    assert_eq!(
        backend.workspaces().await.unwrap(),
        vec!["default", "brand-new"]
    );
}

#[tokio::test]
async fn repeated_initialization_writes_once() {
    let store = Arc::new(MemoryObjectStore::with_bucket("bucket"));
    let backend = Backend::new(
        config(),
        store.clone(),
        Some(Arc::new(MemoryLockTable::new("locks")) as Arc<dyn LockTable>),
    )
    .unwrap();

    let first = backend.state_mgr("dev").await.unwrap();
    let mut second = backend.state_mgr("dev").await.unwrap();
    second.refresh_state().await.unwrap();

    assert_eq!(store.put_count(), 1);
    assert_eq!(first.state(), second.state());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn separate_backends_share_local_lock_table() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("bucket")).unwrap();
    std::fs::create_dir_all(dir.path().join("locks")).unwrap();

    // two independent backends over the same directory stand in for two processes
    let make_backend = || {
        let mut config = config();
        config.backend_type = "local".to_string();
        config.path = Some(dir.path().to_path_buf());
        Arc::new(
            Backend::new(
                config,
                Arc::new(LocalObjectStore::new(dir.path())),
                Some(Arc::new(LocalLockTable::new("locks", dir.path().join("locks")))
                    as Arc<dyn LockTable>),
            )
            .unwrap(),
        )
    };
    let backends = [make_backend(), make_backend()];

    let tasks: Vec<_> = backends
        .iter()
        .cloned()
        .map(|backend| tokio::spawn(async move { backend.state_mgr("shared").await }))
        .collect();
    let mut succeeded = 0;
    for task in tasks {
        if assert_ok_or_lock_held(task.await.unwrap()) {
            succeeded += 1;
        }
    }
    assert!(succeeded >= 1);

    assert!(
        !dir.path()
            .join("locks/env:/shared/terraform.tfstate.tflock")
            .exists()
    );
    assert!(
        dir.path()
            .join("bucket/env:/shared/terraform.tfstate")
            .is_file()
    );
    for backend in &backends {
        assert_eq!(
            backend.workspaces().await.unwrap(),
            vec!["default", "shared"]
        );
    }
}
