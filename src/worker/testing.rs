//! Best-effort test-runner output parsing.
//!
//! Each runner's summary format is handled by one [`TestOutputParser`].
//! Parsers are tried in order; the first that recognizes the output wins.
//! When none does, counts stay zero and the exit status decides pass/fail.

use crate::model::{Runtime, TestResults};
use regex::Regex;
use std::sync::LazyLock;

/// Counts recognized in a runner's summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u32,
    pub failed: u32,
    pub skipped: u32,
    pub total: u32,
}

pub trait TestOutputParser: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the output is not in this runner's format.
    fn parse(&self, output: &str) -> Option<TestCounts>;
}

fn capture_count(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn finish(passed: Option<u32>, failed: Option<u32>, skipped: Option<u32>, total: Option<u32>) -> Option<TestCounts> {
    if passed.is_none() && failed.is_none() && total.is_none() {
        return None;
    }
    let (passed, failed, skipped) = (passed.unwrap_or(0), failed.unwrap_or(0), skipped.unwrap_or(0));
    Some(TestCounts {
        passed,
        failed,
        skipped,
        total: total.unwrap_or(passed + failed + skipped),
    })
}

// ---------------------------------------------------------------------------
// Jest: "Tests:       1 failed, 2 skipped, 5 passed, 8 total"
// ---------------------------------------------------------------------------

static JEST_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^Tests:\s+(.*)$").expect("constant regex pattern is valid"));
static JEST_PASSED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) passed").expect("constant regex pattern is valid"));
static JEST_FAILED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) failed").expect("constant regex pattern is valid"));
static JEST_SKIPPED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:skipped|todo)").expect("constant regex pattern is valid"));
static JEST_TOTAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) total").expect("constant regex pattern is valid"));

pub struct JestParser;

impl TestOutputParser for JestParser {
    fn name(&self) -> &'static str {
        "jest"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let line = JEST_LINE.captures(output)?.get(1)?.as_str();
        finish(
            capture_count(&JEST_PASSED, line),
            capture_count(&JEST_FAILED, line),
            capture_count(&JEST_SKIPPED, line),
            capture_count(&JEST_TOTAL, line),
        )
    }
}

// ---------------------------------------------------------------------------
// Vitest: "      Tests  2 failed | 5 passed | 1 skipped (8)"
// ---------------------------------------------------------------------------

static VITEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*Tests\s+(.*?)\((\d+)\)\s*$").expect("constant regex pattern is valid")
});

pub struct VitestParser;

impl TestOutputParser for VitestParser {
    fn name(&self) -> &'static str {
        "vitest"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let caps = VITEST_LINE.captures(output)?;
        let line = caps.get(1)?.as_str();
        let total = caps.get(2).and_then(|m| m.as_str().parse().ok());
        finish(
            capture_count(&JEST_PASSED, line),
            capture_count(&JEST_FAILED, line),
            capture_count(&JEST_SKIPPED, line),
            total,
        )
    }
}

// ---------------------------------------------------------------------------
// Mocha: "  5 passing (20ms)" / "  2 failing" / "  1 pending"
// ---------------------------------------------------------------------------

static MOCHA_PASSING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) passing").expect("constant regex pattern is valid"));
static MOCHA_FAILING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) failing").expect("constant regex pattern is valid"));
static MOCHA_PENDING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) pending").expect("constant regex pattern is valid"));

pub struct MochaParser;

impl TestOutputParser for MochaParser {
    fn name(&self) -> &'static str {
        "mocha"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let passed = capture_count(&MOCHA_PASSING, output)?;
        finish(
            Some(passed),
            capture_count(&MOCHA_FAILING, output),
            capture_count(&MOCHA_PENDING, output),
            None,
        )
    }
}

// ---------------------------------------------------------------------------
// Pytest: "===== 1 failed, 3 passed, 2 skipped in 0.12s ====="
// ---------------------------------------------------------------------------

static PYTEST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^=+ (.*\d+ (?:passed|failed|error|errors|skipped).*) in [\d.]+s.*=+\s*$")
        .expect("constant regex pattern is valid")
});
static PYTEST_ERRORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) errors?").expect("constant regex pattern is valid"));

pub struct PytestParser;

impl TestOutputParser for PytestParser {
    fn name(&self) -> &'static str {
        "pytest"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let line = PYTEST_LINE.captures(output)?.get(1)?.as_str();
        let failed = capture_count(&JEST_FAILED, line).unwrap_or(0)
            + capture_count(&PYTEST_ERRORS, line).unwrap_or(0);
        finish(
            capture_count(&JEST_PASSED, line),
            Some(failed),
            capture_count(&JEST_SKIPPED, line),
            None,
        )
    }
}

// ---------------------------------------------------------------------------
// Bun: " 5 pass\n 1 fail\n 2 skip\nRan 8 tests across 2 files."
// ---------------------------------------------------------------------------

static BUN_RAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Ran (\d+) tests? across").expect("constant regex pattern is valid"));
static BUN_PASS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) pass\s*$").expect("constant regex pattern is valid"));
static BUN_FAIL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) fail\s*$").expect("constant regex pattern is valid"));
static BUN_SKIP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(\d+) skip\s*$").expect("constant regex pattern is valid"));

pub struct BunParser;

impl TestOutputParser for BunParser {
    fn name(&self) -> &'static str {
        "bun"
    }

    fn parse(&self, output: &str) -> Option<TestCounts> {
        let total = capture_count(&BUN_RAN, output)?;
        finish(
            capture_count(&BUN_PASS, output),
            capture_count(&BUN_FAIL, output),
            capture_count(&BUN_SKIP, output),
            Some(total),
        )
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Ordered parser chain.
pub struct TestReportParsers {
    parsers: Vec<Box<dyn TestOutputParser>>,
}

impl Default for TestReportParsers {
    fn default() -> Self {
        Self {
            parsers: vec![
                Box::new(JestParser),
                Box::new(VitestParser),
                Box::new(PytestParser),
                Box::new(BunParser),
                Box::new(MochaParser),
            ],
        }
    }
}

impl TestReportParsers {
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Add a parser ahead of the existing chain.
    pub fn with_parser(mut self, parser: Box<dyn TestOutputParser>) -> Self {
        self.parsers.insert(0, parser);
        self
    }

    /// First parser that recognizes `output`, with its counts.
    pub fn parse(&self, output: &str) -> Option<(&'static str, TestCounts)> {
        self.parsers
            .iter()
            .find_map(|p| p.parse(output).map(|counts| (p.name(), counts)))
    }

    /// Build a [`TestResults`] from raw output and exit status.
    pub fn summarize(&self, output: String, exit_code: i64, duration_ms: u64) -> TestResults {
        let counts = self.parse(&output).map(|(_, c)| c).unwrap_or_default();
        TestResults {
            executed: true,
            passed: exit_code == 0 && counts.failed == 0,
            total: counts.total,
            passed_count: counts.passed,
            failed_count: counts.failed,
            skipped_count: counts.skipped,
            duration_ms,
            output,
        }
    }
}

// ---------------------------------------------------------------------------
// Per-runtime test command
// ---------------------------------------------------------------------------

/// How to run tests for a runtime and how to recognize "no tests found".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestPlan {
    pub command: &'static str,
    pub no_tests_exit_codes: &'static [i64],
    pub no_tests_markers: &'static [&'static str],
}

impl TestPlan {
    pub fn for_runtime(runtime: Runtime) -> Self {
        match runtime {
            Runtime::Node => TestPlan {
                command: "npm test --if-present",
                no_tests_exit_codes: &[],
                no_tests_markers: &["No tests found", "Error: no test specified"],
            },
            Runtime::Bun => TestPlan {
                command: "bun test",
                no_tests_exit_codes: &[],
                no_tests_markers: &["No tests found", "0 test files matching"],
            },
            Runtime::Deno => TestPlan {
                command: "deno test --allow-read",
                no_tests_exit_codes: &[],
                no_tests_markers: &["No test modules found"],
            },
            // pytest exits 5 when nothing was collected
            Runtime::Python => TestPlan {
                command: "python -m pytest -q",
                no_tests_exit_codes: &[5],
                no_tests_markers: &["no tests ran", "No module named pytest"],
            },
        }
    }

    pub fn found_no_tests(&self, exit_code: i64, output: &str) -> bool {
        self.no_tests_exit_codes.contains(&exit_code)
            || self.no_tests_markers.iter().any(|m| output.contains(m))
    }
}
