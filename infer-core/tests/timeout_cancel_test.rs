//! Sync timeouts and cooperative cancellation through the public API.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{Collector, Identity, Sleeper, numbered_package, unique_model};
use infer_core::{BatchStrategy, InferServer, SessionDescriptor, Status, UserData};

fn server() -> InferServer {
    InferServer::new(0).expect("device 0 must be valid")
}

#[test]
fn sync_timeout_returns_before_the_processor_finishes() {
    let server = server();
    let mut desc = SessionDescriptor::new(
        "sync-timeout",
        unique_model("sync-timeout"),
        Box::new(Sleeper {
            name: "SlowPre",
            delay: Duration::from_millis(100),
        }),
        Box::new(Identity { name: "Post" }),
    );
    desc.strategy = BatchStrategy::Static;
    let session = server.create_session(desc, None).unwrap();

    let started = Instant::now();
    let result = server.request_sync(&session, numbered_package(0, 1), Some(10));
    let elapsed = started.elapsed();

    assert_eq!(result.unwrap_err(), Status::Timeout);
    assert!(
        elapsed < Duration::from_millis(60),
        "timed out after {elapsed:?}, expected well under the 100ms stage"
    );

    // The late completion happens internally and must not reach the
    // caller; destroying the session drains it without incident.
    std::thread::sleep(Duration::from_millis(150));
    assert!(server.destroy_session(session));
}

#[test]
fn discarded_requests_complete_without_output() {
    let server = server();
    let mut desc = SessionDescriptor::new(
        "discard-tag",
        unique_model("discard-tag"),
        Box::new(Sleeper {
            name: "SlowPre",
            delay: Duration::from_millis(40),
        }),
        Box::new(Identity { name: "Post" }),
    );
    desc.strategy = BatchStrategy::Static;
    desc.cache_capacity = 16;
    let observer = Collector::new();
    let session = server
        .create_session(desc, Some(observer.clone()))
        .unwrap();

    // The first request occupies the single engine; the tagged ones
    // queue up behind it.
    server
        .request(
            &session,
            numbered_package(0, 1),
            Arc::new(()) as UserData,
            Some(1_000),
        )
        .unwrap();
    for start in [10u32, 20, 30] {
        server
            .request(
                &session,
                numbered_package(start, 1).with_tag("batch-job"),
                Arc::new(()) as UserData,
                Some(1_000),
            )
            .unwrap();
    }

    server.discard_task(&session, "batch-job");
    // Blocks until every tagged request has completed (as discarded).
    server.wait_task_done(&session, "batch-job");

    // Only the untagged blocker may notify; discarded requests deliver
    // no output units.
    assert!(observer.wait_for(1, Duration::from_secs(3)));
    std::thread::sleep(Duration::from_millis(50));
    let log = observer.log.lock().unwrap().clone();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0], (Status::Success, Some(0)));

    assert!(server.destroy_session(session));
}

#[test]
fn wait_task_done_blocks_until_tagged_work_finishes() {
    let server = server();
    let stage_delay = Duration::from_millis(50);
    let mut desc = SessionDescriptor::new(
        "wait-tag",
        unique_model("wait-tag"),
        Box::new(Sleeper {
            name: "SlowPre",
            delay: stage_delay,
        }),
        Box::new(Identity { name: "Post" }),
    );
    desc.strategy = BatchStrategy::Static;
    let observer = Collector::new();
    let session = server
        .create_session(desc, Some(observer.clone()))
        .unwrap();

    let started = Instant::now();
    server
        .request(
            &session,
            numbered_package(7, 1).with_tag("barrier"),
            Arc::new(()) as UserData,
            Some(1_000),
        )
        .unwrap();
    server.wait_task_done(&session, "barrier");
    let elapsed = started.elapsed();

    assert!(
        elapsed >= stage_delay,
        "wait returned after {elapsed:?}, before the stage could finish"
    );
    assert_eq!(observer.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    assert!(server.destroy_session(session));
}

#[test]
fn cache_backpressure_times_out_the_caller() {
    let server = server();
    let mut desc = SessionDescriptor::new(
        "backpressure",
        unique_model("backpressure"),
        Box::new(Sleeper {
            name: "SlowPre",
            delay: Duration::from_millis(100),
        }),
        Box::new(Identity { name: "Post" }),
    );
    desc.strategy = BatchStrategy::Static;
    desc.cache_capacity = 1;
    let observer = Collector::new();
    let session = server
        .create_session(desc, Some(observer.clone()))
        .unwrap();

    // Saturate: one on the engine, one in the consumer's hand, one
    // filling the cache. More submissions must bounce on the timeout.
    let mut accepted = 0u32;
    let mut timed_out = false;
    for start in 0..8u32 {
        match server.request(
            &session,
            numbered_package(start * 10, 1),
            Arc::new(()) as UserData,
            Some(5),
        ) {
            Ok(()) => accepted += 1,
            Err(status) => {
                assert_eq!(status, Status::Timeout);
                timed_out = true;
                break;
            }
        }
    }
    assert!(timed_out, "cache never filled after {accepted} accepts");

    // Everything that was accepted still completes.
    assert!(observer.wait_for(accepted as usize, Duration::from_secs(5)));
    assert!(server.destroy_session(session));
}
