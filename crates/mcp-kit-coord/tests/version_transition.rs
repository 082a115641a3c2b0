//! Cross-instance protocol against a scripted primary: joining an equal
//! version, displacing an older one, and being refused.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tokio::sync::{Mutex, oneshot};

use mcp_kit_coord::{
    Coordinator, CoordError, InstanceManager, LockRecord, PrimaryReason, RoleOutcome, now_ms,
};

#[derive(Clone)]
struct FakePrimary {
    version: String,
    lock_path: PathBuf,
    accept_transition: bool,
    shutdown: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

async fn fake_version(State(st): State<FakePrimary>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "version": st.version }))
}

async fn fake_transition(State(st): State<FakePrimary>) -> StatusCode {
    if !st.accept_transition {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    // Release the lock, then stop listening; the 200 goes out as part of
    // the graceful drain.
    let _ = std::fs::remove_file(&st.lock_path);
    if let Some(tx) = st.shutdown.lock().await.take() {
        let _ = tx.send(());
    }
    StatusCode::OK
}

/// Start a scripted primary and plant its lock. Returns the bound port.
async fn spawn_fake_primary(
    version: &str,
    lock_path: PathBuf,
    accept_transition: bool,
) -> u16 {
    let (tx, rx) = oneshot::channel::<()>();
    let state = FakePrimary {
        version: version.to_string(),
        lock_path: lock_path.clone(),
        accept_transition,
        shutdown: Arc::new(Mutex::new(Some(tx))),
    };
    let app = Router::new()
        .route("/", get(|| async { "primary root" }))
        .route("/__version", get(fake_version))
        .route("/__transition", post(fake_transition))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake primary");
    let port = listener.local_addr().expect("addr").port();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await;
    });

    // The lock names PID 1: always alive, never this process.
    std::fs::write(
        &lock_path,
        serde_json::to_vec(&LockRecord {
            pid: 1,
            version: version.to_string(),
            timestamp: now_ms(),
        })
        .expect("serialize lock"),
    )
    .expect("plant lock");

    port
}

#[tokio::test]
async fn equal_version_joins_as_secondary_and_proxies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("join.lock");
    let port = spawn_fake_primary("1.0.0", lock_path.clone(), true).await;

    let mut mgr =
        InstanceManager::new(port, "1.0.0", Some(lock_path)).expect("instance manager");
    let outcome = Coordinator::default().run(&mut mgr).await.expect("coordinate");
    assert_eq!(
        outcome,
        RoleOutcome::Secondary {
            main_version: "1.0.0".to_string(),
        }
    );

    // A request through the freshly started proxy lands on the primary.
    let proxy_port = mgr.start_proxy(Some("1.0.0")).await.expect("start proxy");
    let body = reqwest::get(format!("http://127.0.0.1:{proxy_port}/"))
        .await
        .expect("request")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "primary root");

    mgr.stop_proxy().await;
}

#[tokio::test]
async fn newer_version_displaces_the_old_primary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("upgrade.lock");
    let port = spawn_fake_primary("0.0.1", lock_path.clone(), true).await;

    let mut mgr =
        InstanceManager::new(port, "2.0.0", Some(lock_path)).expect("instance manager");
    let coordinator = Coordinator {
        wait_for_port_timeout: std::time::Duration::from_secs(3),
        ..Coordinator::default()
    };

    let outcome = coordinator.run(&mut mgr).await.expect("coordinate");
    assert_eq!(
        outcome,
        RoleOutcome::Primary {
            reason: PrimaryReason::VersionTransition,
            previous_version: Some("0.0.1".to_string()),
        }
    );

    // The winner holds the lock under its own PID.
    let rec = mgr.read_lock().await.expect("lock record");
    assert_eq!(rec.pid, std::process::id());
    assert_eq!(rec.version, "2.0.0");
}

#[tokio::test]
async fn refused_transition_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_path = dir.path().join("refused.lock");
    let port = spawn_fake_primary("0.0.1", lock_path.clone(), false).await;

    let mut mgr =
        InstanceManager::new(port, "2.0.0", Some(lock_path.clone())).expect("instance manager");
    let err = Coordinator::default()
        .run(&mut mgr)
        .await
        .expect_err("transition refused");
    assert!(matches!(err, CoordError::TransitionDenied));

    // The refusing primary keeps its lock.
    assert!(lock_path.exists());
}
