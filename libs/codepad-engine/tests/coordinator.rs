/// Integration tests for the execution coordinator
///
/// These tests verify the request lifecycle end to end:
/// 1. Output capture and workspace cleanup on success
/// 2. Validation failures never touch the filesystem
/// 3. Timeouts, runtime failures and spawn failures still clean up
/// 4. Compile and run are separate phases
/// 5. Concurrent requests stay isolated and respect the slot limit
///
/// `/bin/sh` stands in for a real interpreter so the suite runs anywhere;
/// tests against installed toolchains are `#[ignore]`d.

use codepad_common::types::Phase;
use codepad_engine::{
    CommandTemplate, Coordinator, ExecutionError, ExecutionLimits, ExecutionRequest,
    LanguageDescriptor, LanguageRegistry, Outcome, WorkspaceManager,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn shell() -> LanguageDescriptor {
    LanguageDescriptor {
        id: "shell".into(),
        name: "POSIX shell".into(),
        aliases: vec!["sh".into()],
        file_extension: "sh".into(),
        source_stem: "main".into(),
        run: CommandTemplate::new("/bin/sh", &["{source}"]),
        compile: None,
        artifact: None,
        env: BTreeMap::new(),
    }
}

/// A pretend compiled language: "compiling" copies the script unless it
/// contains COMPILE_ERROR (fails) or COMPILE_HANG (never finishes).
fn fake_compiled() -> LanguageDescriptor {
    LanguageDescriptor {
        id: "fakec".into(),
        name: "Fake compiled".into(),
        aliases: vec![],
        file_extension: "fc".into(),
        source_stem: "main".into(),
        run: CommandTemplate::new("/bin/sh", &["{artifact}"]),
        compile: Some(CommandTemplate::new(
            "/bin/sh",
            &[
                "-c",
                "if grep -q COMPILE_HANG {source}; then echo 'compiling' >&2; sleep 30; fi; \
                 if grep -q COMPILE_ERROR {source}; then echo 'syntax error' >&2; exit 1; fi; \
                 cp {source} {artifact}",
            ],
        )),
        artifact: Some("prog".into()),
        env: BTreeMap::from([("FAKEC_MODE".to_string(), "release".to_string())]),
    }
}

fn missing_runtime() -> LanguageDescriptor {
    LanguageDescriptor {
        id: "ghost".into(),
        name: "Not installed".into(),
        aliases: vec![],
        file_extension: "gh".into(),
        source_stem: "main".into(),
        run: CommandTemplate::new("/nonexistent/bin/ghost", &["{source}"]),
        compile: None,
        artifact: None,
        env: BTreeMap::new(),
    }
}

fn limits() -> ExecutionLimits {
    ExecutionLimits {
        run_timeout: Duration::from_secs(5),
        compile_timeout: Duration::from_secs(5),
        max_source_bytes: 64 * 1024,
        max_stdin_bytes: 64 * 1024,
        max_output_bytes: 1024 * 1024,
        max_concurrent: 4,
        queue_wait: Duration::from_secs(2),
    }
}

fn coordinator(root: &Path, limits: ExecutionLimits) -> Coordinator {
    let registry =
        LanguageRegistry::from_descriptors(vec![shell(), fake_compiled(), missing_runtime()])
            .expect("test registry is valid");
    Coordinator::new(
        Arc::new(registry),
        WorkspaceManager::new(root),
        limits,
        &["PATH".to_string()],
    )
}

fn workspace_count(root: &Path) -> usize {
    std::fs::read_dir(root).map(|entries| entries.count()).unwrap_or(0)
}

async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_prints_literal_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "echo 'Hello, World!'"))
        .await
        .unwrap();

    let response = report.to_response();
    assert_eq!(response.output, "Hello, World!\n");
    assert_eq!(response.error, "");
    assert_eq!(response.exit_code, Some(0));
    assert!(!response.timed_out);
    assert_eq!(response.phase, Phase::Run);
    assert!(report.compile.is_none());
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_unsupported_language_creates_no_workspace() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let result = coordinator
        .execute(ExecutionRequest::new("ruby", "puts 'hi'"))
        .await;

    assert!(matches!(result, Err(ExecutionError::UnsupportedLanguage(ref l)) if l == "ruby"));
    assert_eq!(workspace_count(root.path()), 0);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_infinite_loop_is_killed_at_timeout() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(
        root.path(),
        ExecutionLimits {
            run_timeout: Duration::from_millis(500),
            ..limits()
        },
    );

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "echo spinning\nwhile :; do :; done"))
        .await
        .unwrap();

    let run = report.run.as_ref().unwrap();
    assert!(run.timed_out);
    assert_eq!(run.exit_code, None);
    assert_eq!(run.outcome(), Outcome::TimedOut);
    assert_eq!(run.stdout, b"spinning\n");
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_stdin_is_echoed() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "cat").with_stdin("alpha\nbeta\n"))
        .await
        .unwrap();

    assert_eq!(report.to_response().output, "alpha\nbeta\n");
}

#[tokio::test]
async fn test_omitted_stdin_is_closed_empty_input() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "read line || echo \"eof:[$line]\""))
        .await
        .unwrap();

    let response = report.to_response();
    assert!(!response.timed_out);
    assert_eq!(response.output, "eof:[]\n");
}

#[tokio::test]
async fn test_runtime_failure_is_a_normal_result() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "echo partial\necho boom >&2\nexit 7"))
        .await
        .unwrap();

    let response = report.to_response();
    assert_eq!(response.output, "partial\n");
    assert_eq!(response.error, "boom\n");
    assert_eq!(response.exit_code, Some(7));
    assert_eq!(report.outcome(), Some(Outcome::RuntimeFailure));
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_program_runs_inside_its_workspace() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("shell", "ls\necho \"$HOME\""))
        .await
        .unwrap();

    let output = report.run.unwrap().stdout_lossy();
    let mut lines = output.lines();
    assert_eq!(lines.next(), Some("main.sh"));
    let home = lines.next().unwrap();
    assert!(home.ends_with(&format!("codepad-{}", report.request_id)));
}

#[tokio::test]
async fn test_compile_then_run() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("fakec", "echo \"compiled in $FAKEC_MODE mode\""))
        .await
        .unwrap();

    let compile = report.compile.as_ref().unwrap();
    assert_eq!(compile.phase, Phase::Compile);
    assert!(compile.succeeded());
    let run = report.run.as_ref().unwrap();
    assert_eq!(run.stdout, b"compiled in release mode\n");
    assert_eq!(report.to_response().phase, Phase::Run);
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_compile_failure_skips_run() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new("fakec", "COMPILE_ERROR\necho never"))
        .await
        .unwrap();

    assert!(report.run.is_none());
    let response = report.to_response();
    assert_eq!(response.phase, Phase::Compile);
    assert_eq!(response.exit_code, Some(1));
    assert_eq!(response.error, "syntax error\n");
    assert_eq!(response.output, "");
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_compile_timeout_skips_run() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(
        root.path(),
        ExecutionLimits {
            compile_timeout: Duration::from_millis(300),
            ..limits()
        },
    );
    let started = Instant::now();

    let report = coordinator
        .execute(ExecutionRequest::new("fakec", "COMPILE_HANG\necho never"))
        .await
        .unwrap();

    let compile = report.compile.as_ref().expect("compile phase ran");
    assert!(compile.timed_out);
    assert_eq!(compile.exit_code, None);
    assert_eq!(compile.stderr, b"compiling\n");
    assert!(report.run.is_none());
    assert_eq!(report.outcome(), Some(Outcome::TimedOut));
    let response = report.to_response();
    assert_eq!(response.phase, Phase::Compile);
    assert!(response.timed_out);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_locked_subdirectory_does_not_block_cleanup() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let report = coordinator
        .execute(ExecutionRequest::new(
            "shell",
            "echo precious\nmkdir d\ntouch d/f\nchmod 000 d",
        ))
        .await
        .unwrap();

    let response = report.to_response();
    assert_eq!(response.output, "precious\n");
    assert_eq!(response.exit_code, Some(0));
    assert!(!report.cleanup_failed);
    assert_eq!(workspace_count(root.path()), 0);
}

#[cfg(unix)]
#[tokio::test]
async fn test_cleanup_failure_keeps_the_result() {
    use std::os::unix::fs::PermissionsExt;

    // Root ignores directory permissions, so removal would just succeed
    // SAFETY: geteuid(2) cannot fail and touches no memory.
    if unsafe { libc::geteuid() } == 0 {
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    // Write access to the workspace root is outside the tree cleanup repairs
    let report = coordinator
        .execute(ExecutionRequest::new("shell", "echo kept\nchmod 500 .."))
        .await
        .unwrap();

    std::fs::set_permissions(root.path(), std::fs::Permissions::from_mode(0o700)).unwrap();
    assert!(report.cleanup_failed);
    assert_eq!(report.to_response().output, "kept\n");
    assert_eq!(workspace_count(root.path()), 1);
}

#[tokio::test]
async fn test_missing_runtime_is_spawn_error_and_cleans_up() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());

    let result = coordinator
        .execute(ExecutionRequest::new("ghost", "boo"))
        .await;

    match result {
        Err(err @ ExecutionError::Spawn { .. }) => {
            assert!(!err.is_client_error());
            assert!(!err.public_message().contains(root.path().to_str().unwrap()));
        }
        other => panic!("expected spawn error, got {:?}", other),
    }
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_oversized_source_rejected_before_workspace() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(
        root.path(),
        ExecutionLimits {
            max_source_bytes: 16,
            ..limits()
        },
    );

    let result = coordinator
        .execute(ExecutionRequest::new("shell", "echo this source is far too long"))
        .await;

    assert!(matches!(result, Err(ExecutionError::SourceTooLarge { limit: 16, .. })));
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
async fn test_oversized_stdin_rejected() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(
        root.path(),
        ExecutionLimits {
            max_stdin_bytes: 4,
            ..limits()
        },
    );

    let result = coordinator
        .execute(ExecutionRequest::new("shell", "cat").with_stdin("12345"))
        .await;

    assert!(matches!(result, Err(ExecutionError::StdinTooLarge { size: 5, limit: 4 })));
}

#[tokio::test]
async fn test_same_request_twice_is_idempotent() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = coordinator(root.path(), limits());
    let request = ExecutionRequest::new("shell", "echo out; echo err >&2");

    let first = coordinator.execute(request.clone()).await.unwrap().to_response();
    let second = coordinator.execute(request).await.unwrap().to_response();

    assert_eq!(first.output, second.output);
    assert_eq!(first.error, second.error);
    assert_ne!(first.request_id, second.request_id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_are_isolated() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(coordinator(
        root.path(),
        ExecutionLimits {
            max_concurrent: 8,
            ..limits()
        },
    ));

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = Arc::clone(&coordinator);
        handles.push(tokio::spawn(async move {
            // Leave a file behind and list the directory after a pause, so
            // overlapping requests would see each other if they shared one.
            let source = format!("echo {i} > note.txt\nsleep 0.2\nls\ncat note.txt\n");
            let report = coordinator
                .execute(ExecutionRequest::new("shell", source))
                .await
                .unwrap();
            (i, report.to_response().output)
        }));
    }

    for handle in handles {
        let (i, output) = handle.await.unwrap();
        assert_eq!(output, format!("main.sh\nnote.txt\n{i}\n"));
    }
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_capacity_exhausted_without_queue() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(coordinator(
        root.path(),
        ExecutionLimits {
            max_concurrent: 1,
            queue_wait: Duration::ZERO,
            ..limits()
        },
    ));

    let busy = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .execute(ExecutionRequest::new("shell", "sleep 1; echo finished"))
                .await
        })
    };
    wait_until(|| coordinator.in_flight() == 1).await;

    let rejected = coordinator
        .execute(ExecutionRequest::new("shell", "echo hi"))
        .await;
    assert!(matches!(rejected, Err(ExecutionError::CapacityExhausted)));

    let finished = busy.await.unwrap().unwrap();
    assert_eq!(finished.to_response().output, "finished\n");
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_requests_queue_for_a_slot() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(coordinator(
        root.path(),
        ExecutionLimits {
            max_concurrent: 1,
            queue_wait: Duration::from_secs(5),
            ..limits()
        },
    ));

    let first = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .execute(ExecutionRequest::new("shell", "sleep 0.3; echo first"))
                .await
        })
    };
    wait_until(|| coordinator.in_flight() == 1).await;

    let second = coordinator
        .execute(ExecutionRequest::new("shell", "echo second"))
        .await
        .unwrap();

    assert_eq!(second.to_response().output, "second\n");
    assert_eq!(first.await.unwrap().unwrap().to_response().output, "first\n");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_request_removes_workspace() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Arc::new(coordinator(root.path(), limits()));
    let root_path = root.path().to_path_buf();

    let handle = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .execute(ExecutionRequest::new("shell", "sleep 30"))
                .await
        })
    };
    wait_until(|| workspace_count(&root_path) == 1 && coordinator.in_flight() == 1).await;

    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    assert_eq!(workspace_count(root.path()), 0);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
#[ignore] // Requires python3 on PATH
async fn test_builtin_python_hello_world() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        Arc::new(LanguageRegistry::builtin()),
        WorkspaceManager::new(root.path()),
        limits(),
        &["PATH".to_string()],
    );

    let report = coordinator
        .execute(ExecutionRequest::new("python", "print('Hello, World!')\nprint(input()[::-1])").with_stdin("abc\n"))
        .await
        .unwrap();

    let response = report.to_response();
    assert_eq!(response.output, "Hello, World!\ncba\n");
    assert_eq!(response.error, "");
    assert_eq!(workspace_count(root.path()), 0);
}

#[tokio::test]
#[ignore] // Requires node on PATH
async fn test_builtin_javascript_runs_out_of_process() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        Arc::new(LanguageRegistry::builtin()),
        WorkspaceManager::new(root.path()),
        limits(),
        &["PATH".to_string()],
    );

    let report = coordinator
        .execute(ExecutionRequest::new("javascript", "console.log(process.pid !== undefined ? 'child' : 'x')"))
        .await
        .unwrap();

    assert_eq!(report.to_response().output, "child\n");
}

#[tokio::test]
#[ignore] // Requires gcc on PATH
async fn test_builtin_c_compile_and_run() {
    let root = tempfile::tempdir().unwrap();
    let coordinator = Coordinator::new(
        Arc::new(LanguageRegistry::builtin()),
        WorkspaceManager::new(root.path()),
        limits(),
        &["PATH".to_string()],
    );

    let report = coordinator
        .execute(ExecutionRequest::new(
            "c",
            "#include <stdio.h>\nint main(void) { printf(\"2 + 3 = %d\\n\", 2 + 3); return 0; }\n",
        ))
        .await
        .unwrap();

    assert!(report.compile.as_ref().unwrap().succeeded());
    assert_eq!(report.to_response().output, "2 + 3 = 5\n");
    assert_eq!(workspace_count(root.path()), 0);
}
