//! Project file normalization and validation.
//!
//! Paths are normalized to forward slashes before any check runs, so a
//! Windows-style `src\main.ts` and `src/main.ts` collide as duplicates.

use crate::error::{Error, FieldError, Result};
use crate::model::{ProjectFile, Runtime};
use std::collections::HashSet;

const MB: u64 = 1024 * 1024;

/// Hard cap on total project size.
pub const MAX_PROJECT_BYTES: u64 = 100 * MB;
/// Project size above which a warning is attached.
pub const WARN_PROJECT_BYTES: u64 = 50 * MB;
/// Single-file size above which a warning is attached.
pub const WARN_FILE_BYTES: u64 = 10 * MB;
pub const MAX_FILES: usize = 1000;
pub const WARN_FILES: usize = 500;

const ENTRY_POINTS: &[&str] = &[
    "index.html",
    "index.js",
    "index.ts",
    "main.py",
    "app.py",
    "main.ts",
    "src/main.js",
    "src/main.ts",
    "src/main.tsx",
    "src/index.js",
    "src/index.ts",
    "src/index.tsx",
];

/// Outcome of validating a file set. Errors block submission; warnings ride along.
#[derive(Debug, Clone, Default)]
pub struct FileReport {
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
}

impl FileReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Convert separators to `/` and collapse `.` and empty segments.
///
/// `..` segments are kept so that validation can reject them.
pub fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let absolute = unified.starts_with('/');
    let segments: Vec<&str> = unified
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    let joined = segments.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

fn is_absolute(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    // Drive-letter paths such as C:/x
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Normalize every path in place.
pub fn normalize_files(files: Vec<ProjectFile>) -> Vec<ProjectFile> {
    files
        .into_iter()
        .map(|mut f| {
            f.path = normalize_path(&f.path);
            f
        })
        .collect()
}

/// Validate an already-normalized file set.
pub fn validate_files(files: &[ProjectFile]) -> FileReport {
    let mut report = FileReport::default();

    if files.is_empty() {
        report.errors.push(FieldError::new(
            "files",
            "project must contain at least one file",
        ));
        return report;
    }

    let mut seen = HashSet::new();
    let mut total: u64 = 0;
    for (i, file) in files.iter().enumerate() {
        let field = format!("files[{i}].path");
        if file.path.is_empty() {
            report
                .errors
                .push(FieldError::new(&field, "path must not be empty"));
            continue;
        }
        if is_absolute(&file.path) {
            report.errors.push(FieldError::new(
                &field,
                format!("absolute path not allowed: {}", file.path),
            ));
        }
        if file.path.split('/').any(|s| s == "..") {
            report.errors.push(FieldError::new(
                &field,
                format!("parent traversal not allowed: {}", file.path),
            ));
        }
        if !seen.insert(file.path.as_str()) {
            report.errors.push(FieldError::new(
                &field,
                format!("duplicate file path: {}", file.path),
            ));
        }

        let size = file.byte_size();
        total += size;
        if file.content.is_empty() {
            report.warnings.push(format!("empty file: {}", file.path));
        }
        if size > WARN_FILE_BYTES {
            report.warnings.push(format!(
                "large file: {} ({:.2}MB)",
                file.path,
                size as f64 / MB as f64
            ));
        }
    }

    let total_mb = total as f64 / MB as f64;
    if total > MAX_PROJECT_BYTES {
        report.errors.push(FieldError::new(
            "files",
            format!("project size too large: {total_mb:.2}MB (max 100MB)"),
        ));
    } else if total > WARN_PROJECT_BYTES {
        report
            .warnings
            .push(format!("large project size: {total_mb:.2}MB"));
    }

    if files.len() > MAX_FILES {
        report.errors.push(FieldError::new(
            "files",
            format!("too many files: {} (max {MAX_FILES})", files.len()),
        ));
    } else if files.len() > WARN_FILES {
        report
            .warnings
            .push(format!("large number of files: {}", files.len()));
    }

    if find_manifest(files).is_none() {
        report
            .warnings
            .push("no manifest found; a minimal one will be synthesized".to_string());
    }
    if !files.iter().any(|f| ENTRY_POINTS.contains(&f.path.as_str())) {
        report
            .warnings
            .push("no standard entry point found (index.html, src/main.ts, ...)".to_string());
    }

    report
}

/// Normalize and validate in one step. Hard errors become [`Error::Validation`].
pub fn prepare_files(files: Vec<ProjectFile>) -> Result<(Vec<ProjectFile>, Vec<String>)> {
    let files = normalize_files(files);
    let report = validate_files(&files);
    if !report.is_valid() {
        return Err(Error::Validation(report.errors));
    }
    Ok((files, report.warnings))
}

/// The project manifest, if any: `package.json`, `requirements.txt` or
/// `pyproject.toml` at the project root.
pub fn find_manifest(files: &[ProjectFile]) -> Option<&ProjectFile> {
    files.iter().find(|f| {
        matches!(
            f.path.as_str(),
            "package.json" | "requirements.txt" | "pyproject.toml"
        )
    })
}

/// Infer a runtime from root-level marker files.
pub fn detect_runtime(files: &[ProjectFile]) -> Runtime {
    let has = |name: &str| files.iter().any(|f| f.path == name);
    if has("requirements.txt") || has("pyproject.toml") {
        Runtime::Python
    } else if has("deno.json") || has("deno.jsonc") {
        Runtime::Deno
    } else if has("bun.lockb") || has("bun.lock") || has("bunfig.toml") {
        Runtime::Bun
    } else {
        Runtime::Node
    }
}

/// Whether a path looks like a test file or lives in a test directory.
pub fn is_test_path(path: &str) -> bool {
    let in_test_dir = path
        .split('/')
        .rev()
        .skip(1)
        .any(|dir| matches!(dir, "__tests__" | "tests" | "test" | "spec"));
    if in_test_dir {
        return true;
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    name.contains(".test.")
        || name.contains(".spec.")
        || (name.starts_with("test_") && name.ends_with(".py"))
        || name.ends_with("_test.py")
}

pub fn has_tests(files: &[ProjectFile]) -> bool {
    files.iter().any(|f| is_test_path(&f.path))
}
