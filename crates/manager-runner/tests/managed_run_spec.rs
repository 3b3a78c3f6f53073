//! Integration tests for the managed run controller
//!
//! Tests cover:
//! - Lifecycle ordering and output normalization
//! - Conditional copy-out and result retrieval failures
//! - Exactly-once removal on every exit path
//! - Operator cancellation at every step after create
//! - Removal when the run future is abandoned

mod common;

use common::{runner, FakeEngine, StreamMode, TestInterrupt};
use manager_runner::{
    ArchiveInput, ContainerSpec, CopyFromContainer, CopyToContainer, ExitState, RunError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

fn spec() -> ContainerSpec {
    ContainerSpec::builder("manager:0.1", "/root/install.sh").build()
}

fn copy_in(dest: &str) -> CopyToContainer {
    CopyToContainer::new(ArchiveInput::new().file("/tmp/cluster.yaml", "in/cluster.yaml"), dest)
}

fn copy_out(src: &str) -> CopyFromContainer {
    CopyFromContainer::new(src, "/tmp/results")
}

#[tokio::test]
async fn test_successful_run_normalizes_output_and_removes_once() {
    let engine = Arc::new(FakeEngine::new(b"hello\r\nworld\r\n", 0));

    let result = runner(&engine).run(&spec(), &[], &[]).await.unwrap();

    assert_eq!(result.output, "hello\nworld\n");
    assert_eq!(result.exit, ExitState::Exited(0));
    assert!(result.succeeded());
    assert_eq!(
        engine.calls(),
        vec![
            "pull:manager:0.1",
            "create:manager:0.1",
            "start",
            "attach",
            "inspect",
            "remove",
        ]
    );
}

#[tokio::test]
async fn test_command_is_augmented_with_version_check() {
    let engine = Arc::new(FakeEngine::new(b"", 0));

    runner(&engine).run(&spec(), &[], &[]).await.unwrap();

    let created = engine.created.lock().unwrap().clone().unwrap();
    assert_eq!(
        created.command,
        "sleep 0.1 && /root/check_cortex_version.sh && /root/install.sh"
    );
    assert_eq!(
        created.env.get(manager_runner::VERSION_ENV),
        Some(manager_runner::VERSION)
    );
}

#[tokio::test]
async fn test_copy_directives_run_in_order_around_a_clean_exit() {
    let engine = Arc::new(FakeEngine::new(b"done\n", 0));

    runner(&engine)
        .run(
            &spec(),
            &[copy_in("/"), copy_in("/opt")],
            &[copy_out("/out/a"), copy_out("/out/b")],
        )
        .await
        .unwrap();

    assert_eq!(
        engine.calls(),
        vec![
            "pull:manager:0.1",
            "create:manager:0.1",
            "copy-in:/",
            "copy-in:/opt",
            "start",
            "attach",
            "inspect",
            "copy-out:/out/a",
            "copy-out:/out/b",
            "remove",
        ]
    );
}

#[tokio::test]
async fn test_non_zero_exit_skips_copy_out() {
    let engine = Arc::new(FakeEngine::new(b"boom\n", 1));

    let result = runner(&engine)
        .run(&spec(), &[], &[copy_out("/out/a")])
        .await
        .unwrap();

    assert_eq!(result.exit, ExitState::Exited(1));
    assert_eq!(result.output, "boom\n");
    assert_eq!(engine.count("copy-out"), 0);
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_copy_out_failure_is_a_result_retrieval_error() {
    let engine = Arc::new(FakeEngine::new(b"ok\r\n", 0).failing("copy-out"));

    let err = runner(&engine)
        .run(&spec(), &[], &[copy_out("/out/a"), copy_out("/out/b")])
        .await
        .unwrap_err();

    match err {
        RunError::ResultRetrieval { output, .. } => assert_eq!(output, "ok\n"),
        other => panic!("expected result retrieval error, got {:?}", other),
    }
    assert_eq!(engine.count("copy-out"), 1, "first failure aborts copy-out");
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_still_running_is_reported_without_an_exit_code() {
    let engine = Arc::new(FakeEngine::new(b"partial", 0).still_running());

    let result = runner(&engine)
        .run(&spec(), &[], &[copy_out("/out/a")])
        .await
        .unwrap();

    assert_eq!(result.exit, ExitState::StillRunning);
    assert_eq!(result.exit_code(), None);
    assert_eq!(result.output, "partial");
    assert_eq!(engine.count("copy-out"), 0);
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_auth_pull_failure_adds_guidance_and_creates_nothing() {
    let engine = Arc::new(
        FakeEngine::new(b"", 0).pull_failure("unauthorized: authentication required"),
    );

    let err = runner(&engine).run(&spec(), &[], &[]).await.unwrap_err();

    assert_eq!(err.code(), "MANAGER_RUN_IMAGE_PULL_ERROR");
    let message = err.to_string();
    assert!(message.contains("docker login"));
    assert!(message.contains("docker pull manager:0.1"));
    assert_eq!(engine.calls(), vec!["pull:manager:0.1"]);
}

#[tokio::test]
async fn test_create_failure_has_nothing_to_remove() {
    let engine = Arc::new(FakeEngine::new(b"", 0).failing("create"));

    let err = runner(&engine).run(&spec(), &[], &[]).await.unwrap_err();

    assert!(matches!(err, RunError::Engine { step: "create", .. }));
    assert_eq!(engine.count("remove"), 0);
}

#[tokio::test]
async fn test_copy_in_failure_aborts_before_start() {
    let engine = Arc::new(FakeEngine::new(b"", 0).failing("copy-in"));

    let err = runner(&engine)
        .run(&spec(), &[copy_in("/"), copy_in("/opt")], &[])
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::Staging { step: "copy-in", .. }));
    assert_eq!(
        engine.calls(),
        vec![
            "pull:manager:0.1",
            "create:manager:0.1",
            "copy-in:/",
            "remove",
        ]
    );
}

#[tokio::test]
async fn test_inspect_failure_still_removes_container() {
    let engine = Arc::new(FakeEngine::new(b"out", 0).failing("inspect"));

    let err = runner(&engine).run(&spec(), &[], &[]).await.unwrap_err();

    assert!(matches!(err, RunError::Engine { step: "inspect", .. }));
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_stream_read_error_is_fatal() {
    let engine = Arc::new(FakeEngine::new(b"", 0).stream(StreamMode::Broken));

    let err = runner(&engine).run(&spec(), &[], &[]).await.unwrap_err();

    assert_eq!(err.code(), "MANAGER_RUN_STREAM_ERROR");
    assert_eq!(engine.count("inspect"), 0);
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_removal_failure_does_not_mask_the_result() {
    let engine = Arc::new(FakeEngine::new(b"fine\n", 0).failing("remove"));

    let result = runner(&engine).run(&spec(), &[], &[]).await.unwrap();

    assert_eq!(result.exit, ExitState::Exited(0));
    assert_eq!(engine.count("remove"), 1);
}

#[tokio::test]
async fn test_interrupt_during_streaming_cancels_and_removes_once() {
    let signal = Arc::new(Notify::new());
    let engine = Arc::new(
        FakeEngine::new(b"", 0)
            .stream(StreamMode::Pending)
            .on_attach(Arc::clone(&signal)),
    );

    let err = runner(&engine)
        .with_interrupts(Arc::new(TestInterrupt { signal }))
        .run(&spec(), &[], &[copy_out("/out/a")])
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.code(), "MANAGER_RUN_CANCELLED");
    assert_eq!(engine.count("remove"), 1);
    assert_eq!(engine.count("inspect"), 0);
    assert_eq!(engine.count("copy-out"), 0);
}

async fn cancelled_during(operation: &'static str) -> Arc<FakeEngine> {
    let signal = Arc::new(Notify::new());
    let engine = Arc::new(
        FakeEngine::new(b"never read\n", 0).stall_during(operation, Arc::clone(&signal)),
    );

    let err = runner(&engine)
        .with_interrupts(Arc::new(TestInterrupt { signal }))
        .run(&spec(), &[copy_in("/")], &[copy_out("/out/a")])
        .await
        .unwrap_err();

    assert!(err.is_cancelled(), "expected cancellation, got {:?}", err);
    assert_eq!(engine.count("remove"), 1);
    engine
}

#[tokio::test]
async fn test_interrupt_during_copy_in_never_starts_the_container() {
    let engine = cancelled_during("copy-in").await;

    assert_eq!(engine.count("start"), 0);
    assert_eq!(engine.count("attach"), 0);
}

#[tokio::test]
async fn test_interrupt_during_start_never_attaches() {
    let engine = cancelled_during("start").await;

    assert_eq!(engine.count("start"), 1);
    assert_eq!(engine.count("attach"), 0);
    assert_eq!(engine.count("inspect"), 0);
}

#[tokio::test]
async fn test_interrupt_during_inspect_skips_copy_out() {
    let engine = cancelled_during("inspect").await;

    assert_eq!(engine.count("attach"), 1);
    assert_eq!(engine.count("copy-out"), 0);
}

#[tokio::test]
async fn test_abandoned_run_still_removes_container_once() {
    let engine = Arc::new(FakeEngine::new(b"", 0).stream(StreamMode::Pending));
    let runner = runner(&engine);
    let spec = spec();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        runner.run(&spec, &[], &[copy_out("/out/a")]),
    )
    .await;
    assert!(outcome.is_err(), "run should still be streaming");

    for _ in 0..20 {
        if engine.count("remove") > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(engine.count("attach"), 1);
    assert_eq!(engine.count("remove"), 1);
}
