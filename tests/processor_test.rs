//! Build processor phases against a scripted container runtime.

mod common;

use buildq::container::{ContainerSpec, ResourceLimits, WORKSPACE_MOUNT, run_container};
use buildq::error::Error;
use buildq::model::*;
use buildq::progress::{ProgressEvent, ProgressHub, Topic};
use buildq::worker::testing::{TestCounts, TestOutputParser, TestPlan, TestReportParsers};
use buildq::worker::{BuildProcessor, ProcessorConfig};
use common::{FakeRuntime, Script, node_job, vite_project};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn processor(runtime: Arc<FakeRuntime>, hub: Arc<ProgressHub>, dir: &std::path::Path) -> BuildProcessor {
    BuildProcessor::new(
        runtime,
        hub,
        ProcessorConfig {
            build_dir: dir.join("builds"),
            artifacts_dir: dir.join("artifacts"),
            timeout: Duration::from_secs(5),
            ..Default::default()
        },
    )
}

fn bare_spec(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: name.to_string(),
        image: "node:20-alpine".to_string(),
        cmd: vec!["true".to_string()],
        workdir: WORKSPACE_MOUNT.to_string(),
        binds: Vec::new(),
        env: Vec::new(),
        limits: ResourceLimits::default(),
    }
}

// ---------------------------------------------------------------------------
// Container lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exit_status_is_read_even_when_the_container_vanishes_at_exit() {
    let runtime = FakeRuntime::new().script("build", Script::exit(3).output("built\n").vanishing());
    let mut output = Vec::new();

    let outcome = run_container(&runtime, &bare_spec("job-1-build"), Duration::from_secs(5), |chunk| {
        output.push(chunk.text)
    })
    .await
    .unwrap();

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(output, vec!["built\n".to_string()]);
    assert_eq!(runtime.removed.lock().unwrap().as_slice(), ["job-1-build"]);
}

#[tokio::test]
async fn timed_out_container_is_stopped_then_removed() {
    let runtime = FakeRuntime::new().script("install", Script::hang());

    let err = run_container(&runtime, &bare_spec("job-2-install"), Duration::from_millis(100), |_| {})
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(_)));
    assert_eq!(runtime.stopped.lock().unwrap().as_slice(), ["job-2-install"]);
    assert_eq!(runtime.removed.lock().unwrap().as_slice(), ["job-2-install"]);
    assert_eq!(runtime.running_count(), 0);
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn successful_build_collects_dist_artifact() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        FakeRuntime::new()
            .script("install", Script::exit(0).output("added 12 packages\n"))
            .script(
                "build",
                Script::exit(0)
                    .output("vite v5.0.0 building for production...\n")
                    .writes("dist/index.html", "<html>built</html>")
                    .writes("dist/assets/app.js", "console.log(1)"),
            ),
    );
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());
    let job_id = JobId::new();
    let job = node_job("chat-1", vite_project(), true);

    let attempt = processor.execute(job_id, &job, 1).await;

    assert!(attempt.error.is_none(), "unexpected error: {:?}", attempt.error);
    let result = attempt.result;
    assert_eq!(result.status, BuildStatus::Success);
    assert_eq!(result.job_id, job_id);
    assert!(result.error.is_none());
    assert_eq!(runtime.phases_run(), vec!["install", "build"]);
    assert_eq!(runtime.images.lock().unwrap().as_slice(), ["node:20-alpine"]);

    assert_eq!(result.artifacts.len(), 1);
    let dist = &result.artifacts[0];
    assert_eq!(dist.name, "dist");
    assert_eq!(dist.kind, ArtifactKind::Directory);
    assert!(dist.size_bytes > 0);
    let copied = tmp
        .path()
        .join("artifacts")
        .join(job_id.to_string())
        .join("dist/assets/app.js");
    assert!(copied.is_file());

    assert!(
        result
            .logs
            .iter()
            .any(|l| l.source == LogSource::Stdout && l.message.contains("vite v5.0.0"))
    );
    assert!(result.metrics.end_time >= result.metrics.start_time);
    assert!(result.test_results.is_none());
    assert_eq!(runtime.running_count(), 0);
    assert_eq!(runtime.removed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn containers_get_workspace_bind_env_and_limits() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());
    let job_id = JobId::new();
    let mut job = node_job("chat-1", vite_project(), false);
    job.metadata.env.insert("API_URL".into(), "https://example.test".into());

    processor.execute(job_id, &job, 2).await;

    let created = runtime.created.lock().unwrap();
    let spec = &created[0];
    assert_eq!(spec.name, format!("buildq-{}-2-install", job_id.short()));
    assert_eq!(spec.workdir, "/workspace");
    assert_eq!(spec.cmd, vec!["/bin/sh", "-c", "npm install"]);
    let workspace = tmp.path().join("builds").join(job_id.to_string());
    assert_eq!(spec.binds, vec![format!("{}:/workspace", workspace.display())]);
    assert!(spec.env.contains(&"NODE_ENV=production".to_string()));
    assert!(spec.env.contains(&"CI=true".to_string()));
    assert!(spec.env.contains(&"API_URL=https://example.test".to_string()));
    assert_eq!(spec.limits, processor.config().limits);

    assert!(workspace.join("package.json").is_file());
    assert!(workspace.join("vite.config.ts").is_file());
}

#[tokio::test]
async fn publishes_phase_progress_to_job_topic() {
    let tmp = tempfile::tempdir().unwrap();
    let hub = Arc::new(ProgressHub::new());
    let processor = processor(Arc::new(FakeRuntime::new()), hub.clone(), tmp.path());
    let job_id = JobId::new();
    let mut rx = hub.subscribe(Topic::Job(job_id));

    processor
        .process(job_id, &node_job("chat-1", vite_project(), true), 1)
        .await;

    let mut percents = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::Progress(update) = event.event {
            assert_eq!(update.status, JobState::Active);
            percents.push(update.progress);
        }
    }
    assert_eq!(percents, vec![10, 30, 60, 90, 100]);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn install_failure_stops_before_build() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        FakeRuntime::new().script("install", Script::exit(1).output("npm ERR! 404 Not Found\n")),
    );
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());

    let attempt = processor
        .execute(JobId::new(), &node_job("chat-1", vite_project(), true), 1)
        .await;

    assert_eq!(attempt.result.status, BuildStatus::Failure);
    let error = attempt.result.error.as_deref().unwrap();
    assert!(error.contains("install failed with exit code 1"), "{error}");
    assert!(attempt.is_retryable());
    assert_eq!(runtime.phases_run(), vec!["install"]);
    assert!(attempt.result.artifacts.is_empty());
    assert!(
        attempt
            .result
            .logs
            .iter()
            .any(|l| l.message.contains("npm ERR! 404"))
    );
}

#[tokio::test]
async fn phase_timeout_stops_the_container() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new().script("install", Script::hang()));
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());
    let mut job = node_job("chat-1", vite_project(), true);
    job.metadata.timeout_ms = Some(200);

    let started = Instant::now();
    let attempt = processor.execute(JobId::new(), &job, 1).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(attempt.error, Some(Error::Timeout(_))));
    assert_eq!(attempt.result.status, BuildStatus::Failure);
    assert_eq!(runtime.running_count(), 0);
    assert_eq!(runtime.stopped.lock().unwrap().len(), 1);
    assert_eq!(runtime.phases_run(), vec!["install"]);
}

#[tokio::test]
async fn unreachable_runtime_fails_without_creating_containers() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::unreachable());
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());

    let attempt = processor
        .execute(JobId::new(), &node_job("chat-1", vite_project(), true), 1)
        .await;

    assert!(matches!(attempt.error, Some(Error::ResourceUnavailable(_))));
    assert!(attempt.is_retryable());
    assert_eq!(attempt.result.status, BuildStatus::Failure);
    assert!(runtime.created.lock().unwrap().is_empty());
}

#[tokio::test]
async fn escaping_path_is_a_permanent_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());
    let files = vec![ProjectFile::new("../escape.sh", "rm -rf /")];

    let attempt = processor
        .execute(JobId::new(), &node_job("chat-1", files, false), 1)
        .await;

    assert!(matches!(attempt.error, Some(Error::Validation(_))));
    assert!(!attempt.is_retryable());
    assert!(runtime.created.lock().unwrap().is_empty());
    assert!(!tmp.path().join("escape.sh").exists());
}

// ---------------------------------------------------------------------------
// Test phase
// ---------------------------------------------------------------------------

fn project_with_tests() -> Vec<ProjectFile> {
    let mut files = vite_project();
    files.push(ProjectFile::new("src/app.test.js", "test('x', () => {})"));
    files
}

#[tokio::test]
async fn failing_tests_fail_the_attempt_with_counts() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new().script(
        "test",
        Script::exit(1).output("Tests:       1 failed, 4 passed, 5 total\n"),
    ));
    let processor = processor(runtime.clone(), Arc::new(ProgressHub::new()), tmp.path());

    let attempt = processor
        .execute(JobId::new(), &node_job("chat-1", project_with_tests(), false), 1)
        .await;

    assert_eq!(attempt.result.status, BuildStatus::Failure);
    assert!(
        attempt
            .result
            .error
            .as_deref()
            .unwrap()
            .contains("tests failed: 1 failing")
    );
    let tests = attempt.result.test_results.unwrap();
    assert!(tests.executed);
    assert!(!tests.passed);
    assert_eq!(tests.passed_count, 4);
    assert_eq!(tests.failed_count, 1);
    assert_eq!(tests.total, 5);
    assert_eq!(runtime.phases_run(), vec!["install", "test"]);
}

#[tokio::test]
async fn passing_tests_are_recorded() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new().script(
        "test",
        Script::exit(0).output(" Test Files  2 passed (2)\n      Tests  6 passed | 1 skipped (7)\n"),
    ));
    let processor = processor(runtime, Arc::new(ProgressHub::new()), tmp.path());

    let result = processor
        .process(JobId::new(), &node_job("chat-1", project_with_tests(), false), 1)
        .await;

    assert_eq!(result.status, BuildStatus::Success);
    let tests = result.test_results.unwrap();
    assert!(tests.passed);
    assert_eq!(tests.passed_count, 6);
    assert_eq!(tests.skipped_count, 1);
    assert_eq!(tests.total, 7);
}

#[tokio::test]
async fn missing_test_script_is_not_a_failure() {
    let tmp = tempfile::tempdir().unwrap();
    let runtime = Arc::new(
        FakeRuntime::new().script("test", Script::exit(1).output("Error: no test specified\n")),
    );
    let processor = processor(runtime, Arc::new(ProgressHub::new()), tmp.path());

    let result = processor
        .process(JobId::new(), &node_job("chat-1", project_with_tests(), false), 1)
        .await;

    assert_eq!(result.status, BuildStatus::Success);
    let tests = result.test_results.unwrap();
    assert!(!tests.executed);
    assert!(tests.passed);
}

// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

#[test]
fn parses_each_runner_summary() {
    let parsers = TestReportParsers::default();
    let cases = [
        (
            "Tests:       1 failed, 2 skipped, 5 passed, 8 total",
            "jest",
            TestCounts { passed: 5, failed: 1, skipped: 2, total: 8 },
        ),
        (
            "      Tests  2 failed | 5 passed | 1 skipped (8)",
            "vitest",
            TestCounts { passed: 5, failed: 2, skipped: 1, total: 8 },
        ),
        (
            "===== 1 failed, 3 passed, 2 skipped, 1 error in 0.12s =====",
            "pytest",
            TestCounts { passed: 3, failed: 2, skipped: 2, total: 7 },
        ),
        (
            " 5 pass\n 1 fail\n 2 skip\nRan 8 tests across 2 files. [40.00ms]",
            "bun",
            TestCounts { passed: 5, failed: 1, skipped: 2, total: 8 },
        ),
        (
            "  5 passing (20ms)\n  1 pending\n  2 failing\n",
            "mocha",
            TestCounts { passed: 5, failed: 2, skipped: 1, total: 8 },
        ),
    ];

    for (output, runner, expected) in cases {
        let (name, counts) = parsers.parse(output).unwrap_or_else(|| panic!("{runner} not parsed"));
        assert_eq!(name, runner);
        assert_eq!(counts, expected, "{runner}");
    }
}

#[test]
fn unrecognized_output_falls_back_to_exit_code() {
    let parsers = TestReportParsers::default();
    assert!(parsers.parse("all good").is_none());

    let failed = parsers.summarize("segfault".into(), 139, 12);
    assert!(failed.executed);
    assert!(!failed.passed);
    assert_eq!(failed.total, 0);

    let passed = parsers.summarize("ok".into(), 0, 12);
    assert!(passed.passed);
    assert_eq!(passed.duration_ms, 12);
}

struct TapParser;

impl TestOutputParser for TapParser {
    fn name(&self) -> &'static str {
        "tap"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let passed = output.lines().filter(|l| l.starts_with("ok ")).count() as u32;
        let failed = output.lines().filter(|l| l.starts_with("not ok ")).count() as u32;
        (passed + failed > 0).then_some(TestCounts {
            passed,
            failed,
            skipped: 0,
            total: passed + failed,
        })
    }
}

#[test]
fn custom_parser_takes_precedence() {
    let parsers = TestReportParsers::default().with_parser(Box::new(TapParser));
    let (name, counts) = parsers.parse("ok 1 - adds\nnot ok 2 - subtracts\n").unwrap();

    assert_eq!(name, "tap");
    assert_eq!(counts.failed, 1);
    assert!(TestReportParsers::empty().parse("ok 1 - adds").is_none());
}

#[test]
fn test_plans_recognize_empty_suites() {
    let python = TestPlan::for_runtime(Runtime::Python);
    assert_eq!(python.command, "python -m pytest -q");
    assert!(python.found_no_tests(5, ""));
    assert!(!python.found_no_tests(1, "1 failed"));

    let node = TestPlan::for_runtime(Runtime::Node);
    assert!(node.found_no_tests(1, "Error: no test specified"));
    assert!(!node.found_no_tests(1, "Tests: 1 failed, 1 total"));
}
