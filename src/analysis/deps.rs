//! Dependency manifest parsing and classification.

use crate::model::{ProjectDependencies, ProjectFile};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Packages that need a native toolchain, a bundler, a headless browser or a
/// heavyweight runtime. Any of these forces container isolation.
pub const HEAVY_DEPENDENCIES: &[&str] = &[
    "webpack",
    "prisma",
    "@prisma/client",
    "next",
    "nuxt",
    "electron",
    "puppeteer",
    "playwright",
    "sharp",
    "node-gyp",
    "bcrypt",
    "sqlite3",
    "pg",
    "mysql",
    "mysql2",
    "mongodb",
    "canvas",
    "@tensorflow/tfjs-node",
];

/// Lowercase substrings that mark a package as shipping native bindings.
pub const NATIVE_INDICATORS: &[&str] = &["node-gyp", "native", "binding", "addon"];

/// Basenames of bundler/compiler configs that imply a build step.
pub const BUILD_CONFIG_FILES: &[&str] = &[
    "vite.config.js",
    "vite.config.ts",
    "webpack.config.js",
    "rollup.config.js",
    "tsconfig.json",
];

/// Classification of a dependency set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyProfile {
    pub count: usize,
    pub is_heavy: bool,
    pub has_native: bool,
    /// 0..=100
    pub score: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PackageJson {
    #[serde(default)]
    dependencies: BTreeMap<String, String>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    peer_dependencies: BTreeMap<String, String>,
    #[serde(default)]
    scripts: BTreeMap<String, serde_json::Value>,
}

/// The parts of `pyproject.toml` that declare dependencies: PEP 621
/// `[project]` tables and Poetry's `[tool.poetry]` tables.
#[derive(Deserialize, Default)]
struct PyProject {
    #[serde(default)]
    project: Option<PyProjectTable>,
    #[serde(default)]
    tool: Option<PyTools>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct PyProjectTable {
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    optional_dependencies: BTreeMap<String, Vec<String>>,
}

#[derive(Deserialize, Default)]
struct PyTools {
    #[serde(default)]
    poetry: Option<PoetryTable>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
struct PoetryTable {
    #[serde(default)]
    dependencies: BTreeMap<String, toml::Value>,
    #[serde(default)]
    dev_dependencies: BTreeMap<String, toml::Value>,
}

/// Stateless resolver: reads manifests, classifies packages, detects build steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    pub fn new() -> Self {
        Self
    }

    /// Parse the project manifest. A missing or malformed manifest yields `None`.
    pub fn resolve(&self, files: &[ProjectFile]) -> Option<ProjectDependencies> {
        if let Some(pkg) = files.iter().find(|f| f.path == "package.json") {
            return match serde_json::from_str::<PackageJson>(&pkg.content) {
                Ok(parsed) => Some(ProjectDependencies {
                    dependencies: parsed.dependencies,
                    dev_dependencies: parsed.dev_dependencies,
                    peer_dependencies: parsed.peer_dependencies,
                }),
                Err(e) => {
                    warn!(error = %e, "malformed package.json, treating as no dependencies");
                    None
                }
            };
        }
        if let Some(req) = files.iter().find(|f| f.path == "requirements.txt") {
            return Some(parse_requirements(&req.content));
        }
        if let Some(py) = files.iter().find(|f| f.path == "pyproject.toml") {
            return match toml::from_str::<PyProject>(&py.content) {
                Ok(parsed) => Some(pyproject_dependencies(parsed)),
                Err(e) => {
                    warn!(error = %e, "malformed pyproject.toml, treating as no dependencies");
                    None
                }
            };
        }
        debug!("no manifest found");
        None
    }

    pub fn classify(&self, deps: &ProjectDependencies) -> DependencyProfile {
        let count = deps.len();
        let is_heavy = deps.names().any(|n| HEAVY_DEPENDENCIES.contains(&n));
        let has_native = deps.names().any(|n| {
            let lower = n.to_lowercase();
            NATIVE_INDICATORS.iter().any(|ind| lower.contains(ind))
        });

        let mut score = count.min(50) as u32;
        if is_heavy {
            score += 30;
        }
        if has_native {
            score += 20;
        }

        let profile = DependencyProfile {
            count,
            is_heavy,
            has_native,
            score: score.min(100),
        };
        debug!(
            count,
            is_heavy,
            has_native,
            score = profile.score,
            "dependency complexity analyzed"
        );
        profile
    }

    /// A known build config is present by basename, or the manifest declares a
    /// non-empty `build` script.
    pub fn has_build_step(&self, files: &[ProjectFile]) -> bool {
        if files
            .iter()
            .any(|f| BUILD_CONFIG_FILES.contains(&f.basename()))
        {
            return true;
        }
        files
            .iter()
            .find(|f| f.path == "package.json")
            .and_then(|pkg| serde_json::from_str::<PackageJson>(&pkg.content).ok())
            .and_then(|parsed| parsed.scripts.get("build").cloned())
            .is_some_and(|script| script.as_str().is_some_and(|s| !s.trim().is_empty()))
    }
}

/// `name==1.2`, `name>=1.0`, bare `name`. Comments and option lines are skipped.
fn parse_requirements(content: &str) -> ProjectDependencies {
    let mut deps = ProjectDependencies::default();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() || line.starts_with('-') {
            continue;
        }
        let (name, version) = split_requirement(line);
        deps.dependencies.insert(name, version);
    }
    deps
}

/// Split a PEP 508 requirement into its name and version specifier (`*`
/// when unpinned).
fn split_requirement(requirement: &str) -> (String, String) {
    let requirement = requirement.trim();
    let split_at = requirement
        .find(|c: char| matches!(c, '=' | '>' | '<' | '~' | '!' | '[' | ';' | ' ' | '('))
        .unwrap_or(requirement.len());
    let (name, rest) = requirement.split_at(split_at);
    let version = rest.trim();
    let version = if version.is_empty() { "*" } else { version };
    (name.to_string(), version.to_string())
}

/// Runtime requirements become dependencies; optional groups and Poetry
/// dev requirements become dev dependencies.
fn pyproject_dependencies(parsed: PyProject) -> ProjectDependencies {
    let mut deps = ProjectDependencies::default();
    if let Some(project) = parsed.project {
        for requirement in &project.dependencies {
            let (name, version) = split_requirement(requirement);
            deps.dependencies.insert(name, version);
        }
        for requirement in project.optional_dependencies.values().flatten() {
            let (name, version) = split_requirement(requirement);
            deps.dev_dependencies.insert(name, version);
        }
    }
    if let Some(poetry) = parsed.tool.and_then(|t| t.poetry) {
        for (name, spec) in poetry.dependencies {
            // Poetry lists the interpreter itself alongside packages.
            if name != "python" {
                deps.dependencies.insert(name, poetry_version(&spec));
            }
        }
        for (name, spec) in poetry.dev_dependencies {
            deps.dev_dependencies.insert(name, poetry_version(&spec));
        }
    }
    deps
}

/// `"^1.2"` or `{ version = "^1.2", extras = [...] }`.
fn poetry_version(spec: &toml::Value) -> String {
    let version = match spec {
        toml::Value::String(v) => Some(v.as_str()),
        toml::Value::Table(t) => t.get("version").and_then(toml::Value::as_str),
        _ => None,
    };
    version
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("*")
        .to_string()
}
