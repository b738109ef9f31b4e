//! End-to-end scenarios: a scripted kernel talks to the real tool
//! service over HTTP, approvals flow through the real broker, and the
//! executor streams events to the test acting as host.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use common::{test_config, Behavior, FakeBackend, FakeKernelFactory, FakeTool, FAKE_PNG};
use sandcell::{Executor, ExecutorError, StreamEvent, StreamOptions};

struct Harness {
    executor: Executor,
    backend: Arc<FakeBackend>,
    factory: Arc<FakeKernelFactory>,
    workspace: tempfile::TempDir,
}

async fn harness(backend: FakeBackend, approval_timeout_ms: Option<u64>) -> Harness {
    common::init_tracing();
    let workspace = tempfile::tempdir().expect("tempdir");
    let backend = Arc::new(backend);
    let factory = FakeKernelFactory::new();

    let executor = Executor::with_kernel_factory(
        test_config(workspace.path(), approval_timeout_ms),
        Arc::clone(&factory) as Arc<dyn sandcell::KernelFactory>,
    )
    .with_tool_backend(Arc::clone(&backend) as Arc<dyn sandcell::service::ToolBackend>);
    executor.start().await.expect("start");

    Harness {
        executor,
        backend,
        factory,
        workspace,
    }
}

fn options(timeout_ms: Option<u64>) -> StreamOptions {
    StreamOptions {
        timeout: timeout_ms.map(Duration::from_millis),
        ..StreamOptions::default()
    }
}

#[tokio::test]
async fn s1_happy_path_typed_result() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let mut events = h
        .executor
        .stream(
            r#"call_field demo echo echoed {"input": "hi"}"#,
            options(None),
        )
        .await
        .unwrap();

    let mut approvals = 0;
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event.unwrap() {
            StreamEvent::ApprovalRequest(request) => {
                approvals += 1;
                assert_eq!(request.provider, "demo");
                assert_eq!(request.tool, "echo");
                assert_eq!(request.args, json!({"input": "hi"}));
                request.accept();
            }
            StreamEvent::Result(r) => result = Some(r),
            StreamEvent::Chunk(_) => panic!("chunks were not requested"),
        }
    }

    assert_eq!(approvals, 1);
    let result = result.expect("terminal result");
    assert_eq!(result.text.as_deref(), Some("hi\n"));
    assert!(result.error.is_none());
    assert_eq!(h.backend.invocation_count(), 1);

    h.executor.close().await;
}

#[tokio::test]
async fn s2_rejected_call_raises_in_kernel() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let mut events = h
        .executor
        .stream(r#"call demo echo {"input": "hi"}"#, options(None))
        .await
        .unwrap();

    let mut approvals = 0;
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event.unwrap() {
            StreamEvent::ApprovalRequest(request) => {
                approvals += 1;
                request.reject();
            }
            StreamEvent::Result(r) => result = Some(r),
            StreamEvent::Chunk(_) => {}
        }
    }

    assert_eq!(approvals, 1);
    let result = result.expect("terminal result");
    let error = result.error.expect("kernel error");
    assert_eq!(error.name, "ToolCallError");
    assert!(
        error.message.starts_with("approval_rejected"),
        "message: {}",
        error.message
    );
    // The traceback names the generated call site.
    assert!(error
        .traceback
        .iter()
        .any(|line| line.contains("tools/demo/echo.py") && line.contains("in run")));
    // Rejected: the provider was never invoked.
    assert_eq!(h.backend.invocation_count(), 0);

    h.executor.close().await;
}

#[tokio::test]
async fn s3_approval_timeout_does_not_consume_budget() {
    // Approval timeout 300 ms; execution budget only 150 ms. The
    // stream must NOT hit the budget, because the budget pauses during
    // the approval wait.
    let h = harness(FakeBackend::demo_echo(), Some(300)).await;
    let started = Instant::now();

    let mut events = h
        .executor
        .stream(r#"call demo echo {"input": "hi"}"#, options(Some(150)))
        .await
        .unwrap();

    let mut approvals = 0;
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event {
            Ok(StreamEvent::ApprovalRequest(_)) => approvals += 1, // never decide
            Ok(StreamEvent::Result(r)) => result = Some(r),
            Ok(StreamEvent::Chunk(_)) => {}
            Err(e) => panic!("stream must not fail: {e}"),
        }
    }

    assert_eq!(approvals, 1);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(290), "elapsed: {elapsed:?}");

    let error = result.expect("terminal result").error.expect("kernel error");
    assert!(
        error.message.starts_with("approval_timeout"),
        "message: {}",
        error.message
    );
    assert_eq!(h.backend.invocation_count(), 0);

    h.executor.close().await;
}

#[tokio::test]
async fn s4_budget_excludes_approval_wait() {
    let h = harness(FakeBackend::demo_echo(), None).await;
    let started = Instant::now();

    let code = "sleep_ms 150\ncall demo echo {\"input\": \"hi\"}\nsleep_ms 150\nprint done";
    let mut events = h.executor.stream(code, options(Some(500))).await.unwrap();

    let mut result = None;
    while let Some(event) = events.recv().await {
        match event.expect("no budget timeout expected") {
            StreamEvent::ApprovalRequest(request) => {
                // The host deliberates for 900 ms, well past the 500 ms
                // budget, before accepting.
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(900)).await;
                    request.accept();
                });
            }
            StreamEvent::Result(r) => result = Some(r),
            StreamEvent::Chunk(_) => {}
        }
    }

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(1100), "elapsed: {elapsed:?}");

    let result = result.expect("terminal result");
    assert!(result.error.is_none(), "error: {:?}", result.error);
    assert!(result.text.as_deref().unwrap_or("").contains("done"));

    h.executor.close().await;
}

#[tokio::test]
async fn s5_budget_includes_tool_time() {
    let backend = FakeBackend::new().with_tool(
        "demo",
        "slow",
        FakeTool {
            input_schema: json!({"type": "object", "properties": {}}),
            has_output_schema: false,
            behavior: Behavior::Slow(Duration::from_secs(2), "done".to_string()),
        },
    );
    let h = harness(backend, None).await;
    let started = Instant::now();

    let mut events = h
        .executor
        .stream("call demo slow {}", options(Some(300)))
        .await
        .unwrap();

    let mut outcome = None;
    while let Some(event) = events.recv().await {
        match event {
            Ok(StreamEvent::ApprovalRequest(request)) => request.accept(),
            Ok(StreamEvent::Result(_)) => panic!("expected budget timeout"),
            Ok(StreamEvent::Chunk(_)) => {}
            Err(e) => {
                outcome = Some(e);
                break;
            }
        }
    }

    assert!(matches!(outcome, Some(ExecutorError::BudgetTimeout)));
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(300) && elapsed < Duration::from_millis(1900),
        "elapsed: {elapsed:?}"
    );

    // The session stays usable after the timeout.
    let result = h.executor.execute("print ok", None).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("ok\n"));

    h.executor.close().await;
}

#[tokio::test]
async fn s6_transport_error_retried_on_fresh_session() {
    let backend = FakeBackend::new().with_tool(
        "demo",
        "flaky",
        FakeTool {
            input_schema: json!({"type": "object", "properties": {}}),
            has_output_schema: false,
            behavior: Behavior::TransportThen(1, "recovered".to_string()),
        },
    );
    let h = harness(backend, None).await;

    let mut events = h
        .executor
        .stream("call demo flaky {}", options(None))
        .await
        .unwrap();

    let mut approvals = 0;
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event.unwrap() {
            StreamEvent::ApprovalRequest(request) => {
                approvals += 1;
                request.accept();
            }
            StreamEvent::Result(r) => result = Some(r),
            StreamEvent::Chunk(_) => {}
        }
    }

    // Approval happens once; the retry is invisible to the host.
    assert_eq!(approvals, 1);
    assert_eq!(h.backend.invocation_count(), 2);
    let result = result.expect("terminal result");
    assert!(result.error.is_none());
    assert_eq!(result.text.as_deref(), Some("recovered\n"));

    h.executor.close().await;
}

#[tokio::test]
async fn zero_budget_times_out_immediately() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let mut events = h
        .executor
        .stream("print hi", options(Some(0)))
        .await
        .unwrap();

    let mut outcome = None;
    while let Some(event) = events.recv().await {
        if let Err(e) = event {
            outcome = Some(e);
            break;
        }
    }
    assert!(matches!(outcome, Some(ExecutorError::BudgetTimeout)));

    h.executor.close().await;
}

#[tokio::test]
async fn chunks_stream_in_emission_order() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let mut events = h
        .executor
        .stream(
            "print first\nstderr second\nprint third",
            StreamOptions {
                chunks: true,
                ..StreamOptions::default()
            },
        )
        .await
        .unwrap();

    let mut chunks = Vec::new();
    let mut result = None;
    while let Some(event) = events.recv().await {
        match event.unwrap() {
            StreamEvent::Chunk(chunk) => chunks.push(chunk),
            StreamEvent::Result(r) => result = Some(r),
            StreamEvent::ApprovalRequest(_) => panic!("no tool calls in this code"),
        }
    }

    use sandcell::ExecutionChunk;
    assert_eq!(
        chunks,
        vec![
            ExecutionChunk::Stdout("first\n".to_string()),
            ExecutionChunk::Stderr("second\n".to_string()),
            ExecutionChunk::Stdout("third\n".to_string()),
        ]
    );
    assert_eq!(
        result.unwrap().text.as_deref(),
        Some("first\nsecond\nthird\n")
    );

    h.executor.close().await;
}

#[tokio::test]
async fn inline_images_are_captured_and_written() {
    let h = harness(FakeBackend::demo_echo(), None).await;
    let images_dir = h.workspace.path().join("images");

    let mut events = h
        .executor
        .stream(
            "image",
            StreamOptions {
                images_dir: Some(images_dir.clone()),
                ..StreamOptions::default()
            },
        )
        .await
        .unwrap();

    let mut result = None;
    while let Some(event) = events.recv().await {
        if let StreamEvent::Result(r) = event.unwrap() {
            result = Some(r);
        }
    }

    let result = result.expect("terminal result");
    assert_eq!(result.images.len(), 1);
    let image = &result.images[0];
    assert_eq!(image.media_type, "image/png");
    assert_eq!(image.data, FAKE_PNG);

    let path = image.path.as_ref().expect("image written to disk");
    assert_eq!(std::fs::read(path).unwrap(), FAKE_PNG);

    h.executor.close().await;
}

#[tokio::test]
async fn kernel_env_is_applied_before_execution() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let mut events = h
        .executor
        .stream(
            "print_var MODE",
            StreamOptions {
                kernel_env: [("MODE".to_string(), "verbose".to_string())].into(),
                ..StreamOptions::default()
            },
        )
        .await
        .unwrap();

    let mut result = None;
    while let Some(event) = events.recv().await {
        if let StreamEvent::Result(r) = event.unwrap() {
            result = Some(r);
        }
    }
    assert_eq!(result.unwrap().text.as_deref(), Some("verbose\n"));

    h.executor.close().await;
}

#[tokio::test]
async fn kernel_state_persists_across_submissions() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    h.executor.execute("set x 42", None).await.unwrap();
    let result = h.executor.execute("print_var x", None).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("42\n"));

    h.executor.close().await;
}

#[tokio::test]
async fn execute_auto_accepts_approvals() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let result = h
        .executor
        .execute(r#"call_field demo echo echoed {"input": "auto"}"#, None)
        .await
        .unwrap();

    assert_eq!(result.text.as_deref(), Some("auto\n"));
    assert_eq!(h.backend.invocation_count(), 1);

    h.executor.close().await;
}

#[tokio::test]
async fn kernel_errors_are_reported_in_result() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    let result = h
        .executor
        .execute("print before\nraise ValueError boom", None)
        .await
        .unwrap();

    assert_eq!(result.text.as_deref(), Some("before\n"));
    let error = result.error.expect("kernel error");
    assert_eq!(error.name, "ValueError");
    assert_eq!(error.message, "boom");

    h.executor.close().await;
}

#[tokio::test]
async fn reset_restarts_kernel_and_rotates_secret() {
    let h = harness(FakeBackend::demo_echo(), None).await;

    h.executor.execute("set x 1", None).await.unwrap();
    let (_, secret_before) = common::read_preamble(h.workspace.path()).unwrap();
    assert_eq!(h.factory.launches.load(std::sync::atomic::Ordering::SeqCst), 1);

    h.executor.reset().await.unwrap();

    let (_, secret_after) = common::read_preamble(h.workspace.path()).unwrap();
    assert_ne!(secret_before, secret_after);
    assert_eq!(h.factory.launches.load(std::sync::atomic::Ordering::SeqCst), 2);

    // The fresh kernel works, tool calls still dispatch, and the new
    // secret authenticates them.
    let result = h
        .executor
        .execute(r#"call_field demo echo echoed {"input": "again"}"#, None)
        .await
        .unwrap();
    assert_eq!(result.text.as_deref(), Some("again\n"));

    h.executor.close().await;
}

#[tokio::test]
async fn submissions_are_serialized() {
    let h = harness(FakeBackend::demo_echo(), None).await;
    let executor = Arc::new(h.executor);

    let first = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute("sleep_ms 100\nprint one", None).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = {
        let executor = Arc::clone(&executor);
        tokio::spawn(async move { executor.execute("print two", None).await })
    };

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.text.as_deref(), Some("one\n"));
    assert_eq!(second.text.as_deref(), Some("two\n"));

    executor.close().await;
}

#[tokio::test]
async fn stream_before_start_fails() {
    let workspace = tempfile::tempdir().unwrap();
    let executor = Executor::with_kernel_factory(
        test_config(workspace.path(), None),
        FakeKernelFactory::new() as Arc<dyn sandcell::KernelFactory>,
    );

    let err = executor
        .stream("print hi", StreamOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ExecutorError::NotStarted));
}

#[tokio::test]
async fn wrong_secret_is_rejected_by_the_service() {
    let h = harness(FakeBackend::demo_echo(), None).await;
    let (base_url, _) = common::read_preamble(h.workspace.path()).unwrap();

    let status = reqwest::Client::new()
        .post(format!("{base_url}/run"))
        .bearer_auth("wrong-secret")
        .json(&json!({"provider": "demo", "tool": "echo", "args": {}}))
        .send()
        .await
        .unwrap()
        .status();
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);

    h.executor.close().await;
}
