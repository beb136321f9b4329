//! Registry behaviour of the session manager.

use std::{sync::Arc, time::Duration};

use automatonic_core::{CommandError, ReadinessGate, RemoteTarget, SessionConfig};
use automatonic_session::{ManagerError, MemoryTarget, Page, SessionManager};
use tokio_test::{assert_err, assert_ok};
use uuid::Uuid;

const HOME: &str = "https://shop.test/";

fn target() -> Arc<dyn RemoteTarget> {
    Arc::new(MemoryTarget::new().with_page(HOME, Page::new("Shop")))
}

fn manager() -> SessionManager {
    SessionManager::new(SessionConfig::default().with_poll_interval(Duration::from_millis(10)))
}

/// Give the reaper tasks time to observe closed sessions.
async fn settle(manager: &SessionManager) -> usize {
    for _ in 0..50 {
        if manager.is_empty().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    manager.len().await
}

#[tokio::test(start_paused = true)]
async fn test_closed_session_is_removed() {
    let manager = manager();
    let session = manager.launch(target()).await;
    let id = session.id();

    assert_eq!(manager.ids().await, vec![id]);
    assert!(manager.get(id).await.is_some());

    assert_ok!(manager.close(id).await);
    session.closed().await;
    assert_eq!(settle(&manager).await, 0);
    assert!(manager.get(id).await.is_none());
}

#[tokio::test]
async fn test_close_unknown_session() {
    let manager = manager();
    let id = Uuid::new_v4();
    match assert_err!(manager.close(id).await) {
        ManagerError::NotFound(missing) => assert_eq!(missing, id),
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_gated_connect_is_reaped() {
    let manager = manager();
    let gate = ReadinessGate::opened();
    let session = manager
        .launch_gated(&gate, || async {
            Err(CommandError::Transport("no display".into()))
        })
        .await;

    session.closed().await;
    assert!(session.is_closed());
    assert_eq!(settle(&manager).await, 0);
    assert_ok!(manager.close_all().await);
}

#[tokio::test(start_paused = true)]
async fn test_close_all_skips_closed_sessions() {
    let manager = manager();
    let gate = ReadinessGate::opened();
    let failed = manager
        .launch_gated(&gate, || async {
            Err(CommandError::Transport("no display".into()))
        })
        .await;
    let live = manager.launch(target()).await;

    // The failed session may still be registered when `close_all` runs.
    failed.closed().await;
    assert_ok!(manager.close_all().await);
    live.closed().await;
    assert_eq!(settle(&manager).await, 0);
}
