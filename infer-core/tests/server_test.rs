//! Server directory behavior: device validation, executor dedupe and
//! teardown, pool sizing, and model delegation.

mod common;

use std::sync::Mutex;

use common::{Identity, numbered_package, unique_model};
use infer_core::{BatchStrategy, InferServer, SessionDescriptor, Status};

// Pool sizes are process-global per device; serialize the tests that
// observe them.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn server() -> InferServer {
    InferServer::new(0).expect("device 0 must be valid")
}

fn static_desc(tag: &str, engine_num: usize) -> SessionDescriptor {
    let mut desc = SessionDescriptor::new(
        tag.to_string(),
        unique_model(tag),
        Box::new(Identity { name: "Pre" }),
        Box::new(Identity { name: "Post" }),
    );
    desc.strategy = BatchStrategy::Static;
    desc.engine_num = engine_num;
    desc
}

#[test]
fn invalid_device_is_rejected() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    assert!(InferServer::new(-1).is_none());
    assert!(InferServer::new(99).is_none());
    assert!(InferServer::new(0).is_some());
}

#[test]
fn sessions_with_equal_fingerprints_share_one_executor() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let server = server();
    let executors_before = server.executor_num();

    let first = server
        .create_session(static_desc("shared-exec", 1), None)
        .unwrap();
    let second = server
        .create_session(static_desc("shared-exec", 1), None)
        .unwrap();
    assert_eq!(server.executor_num(), executors_before + 1);

    // Both sessions run requests through the shared executor.
    for session in [&first, &second] {
        let output = server
            .request_sync(session, numbered_package(1, 2), Some(2_000))
            .unwrap();
        assert_eq!(output.data.len(), 2);
    }

    assert!(server.destroy_session(first));
    assert_eq!(server.executor_num(), executors_before + 1);
    assert!(server.destroy_session(second));
    assert_eq!(server.executor_num(), executors_before);
}

#[test]
fn executor_teardown_shrinks_the_pool() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let server = server();
    let engine_num = 2;

    let first = server
        .create_session(static_desc("teardown-pool", engine_num), None)
        .unwrap();
    let second = server
        .create_session(static_desc("teardown-pool", engine_num), None)
        .unwrap();
    let workers_after_create = server.worker_num();
    assert!(workers_after_create >= 2 * engine_num);

    // A request settles both sessions on the shared executor.
    let output = server
        .request_sync(&first, numbered_package(0, 1), Some(2_000))
        .unwrap();
    assert_eq!(output.data.len(), 1);

    assert!(server.destroy_session(first));
    assert_eq!(server.worker_num(), workers_after_create);

    // Let the last worker finish bookkeeping so every worker reads as
    // idle when the shrink decision is made.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while server.idle_worker_num() < server.worker_num()
        && std::time::Instant::now() < deadline
    {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    assert!(server.destroy_session(second));
    // Last unlink tears the executor down and releases 2 x engine_num
    // workers, all idle by then. Surplus workers exit asynchronously.
    let expected = workers_after_create - 2 * engine_num;
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while server.worker_num() != expected && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(server.worker_num(), expected);
}

#[test]
fn api_mode_must_match_session_mode() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let server = server();
    let sync_session = server
        .create_session(static_desc("mode-sync", 1), None)
        .unwrap();

    let result = server.request(
        &sync_session,
        numbered_package(0, 1),
        std::sync::Arc::new(()),
        Some(100),
    );
    assert_eq!(result.unwrap_err(), Status::WrongType);
    assert!(server.destroy_session(sync_session));

    let observer = common::Collector::new();
    let async_session = server
        .create_session(static_desc("mode-async", 1), Some(observer))
        .unwrap();
    let result = server.request_sync(&async_session, numbered_package(0, 1), Some(100));
    assert_eq!(result.unwrap_err(), Status::WrongType);
    assert!(server.destroy_session(async_session));
}

#[test]
fn empty_input_is_rejected_before_the_pipeline() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let server = server();
    let session = server
        .create_session(static_desc("empty-input", 1), None)
        .unwrap();

    let empty = infer_core::Package::from_data(Vec::<infer_core::InferData>::new());
    let result = server.request_sync(&session, empty, Some(100));
    assert_eq!(result.unwrap_err(), Status::InvalidParam);
    assert!(server.destroy_session(session));
}

#[test]
fn model_calls_delegate_to_the_manager() {
    let _lock = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let server = server();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lenet.model"), b"stub").unwrap();

    assert!(!server.set_model_dir("/no/such/dir"));
    assert!(server.set_model_dir(&dir.path().display().to_string()));

    let model = server.load_model("lenet.model", "subnet0").unwrap();
    let again = server.load_model("lenet.model", "subnet0").unwrap();
    assert!(std::sync::Arc::ptr_eq(&model, &again));
    assert_eq!(model.batch_size(), 4);

    assert!(server.unload_model(&model));
    assert!(!server.unload_model(&model));

    assert!(server
        .load_model("missing.model", "subnet0")
        .is_err());

    server.clear_model_cache();
    // Restore the default so other tests resolve against cwd.
    server.set_model_dir(".");
}
