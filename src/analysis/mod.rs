//! Complexity scoring and execution-mode selection.
//!
//! Pure functions over a project snapshot. Nothing here touches the
//! filesystem or the queue.

pub mod deps;
pub mod manifest;

pub use deps::{DependencyProfile, DependencyResolver};

use crate::model::{ExecutionMode, ProjectDependencies, ProjectFile, StrategyChoice};
use serde::{Deserialize, Serialize};
use tracing::info;

const MB: f64 = 1024.0 * 1024.0;

/// Observed project facts that fed the score.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityFactors {
    pub file_count: usize,
    pub total_size_bytes: u64,
    pub dependency_count: usize,
    pub has_heavy_dependencies: bool,
    pub has_native_dependencies: bool,
    pub has_build_step: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityAnalysis {
    /// 0..=100
    pub score: u32,
    pub recommended_strategy: ExecutionMode,
    pub factors: ComplexityFactors,
    pub reasoning: String,
}

/// The analysis plus the mode actually chosen after applying any override.
#[derive(Debug, Clone)]
pub struct StrategyDecision {
    pub mode: ExecutionMode,
    pub analysis: ComplexityAnalysis,
    pub overridden: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComplexityAnalyzer {
    resolver: DependencyResolver,
}

impl ComplexityAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score a project and recommend an execution mode.
    pub fn analyze(
        &self,
        files: &[ProjectFile],
        dependencies: Option<&ProjectDependencies>,
    ) -> ComplexityAnalysis {
        let total_size_bytes: u64 = files.iter().map(ProjectFile::byte_size).sum();
        let mut factors = ComplexityFactors {
            file_count: files.len(),
            total_size_bytes,
            dependency_count: 0,
            has_heavy_dependencies: false,
            has_native_dependencies: false,
            has_build_step: self.resolver.has_build_step(files),
        };

        let mut score = 0.0_f64;

        score += match factors.file_count {
            0..=10 => 5.0,
            11..=50 => 10.0,
            51..=200 => 15.0,
            _ => 20.0,
        };

        let size_mb = total_size_bytes as f64 / MB;
        score += if size_mb <= 1.0 {
            5.0
        } else if size_mb <= 5.0 {
            10.0
        } else if size_mb <= 20.0 {
            15.0
        } else {
            20.0
        };

        if let Some(deps) = dependencies {
            let profile = self.resolver.classify(deps);
            factors.dependency_count = profile.count;
            factors.has_heavy_dependencies = profile.is_heavy;
            factors.has_native_dependencies = profile.has_native;
            score += (f64::from(profile.score) * 0.3).min(30.0);
        }

        if factors.has_build_step {
            score += 15.0;
        }
        if factors.has_heavy_dependencies {
            score += 10.0;
        }
        if factors.has_native_dependencies {
            score += 5.0;
        }

        let score = (score.round() as u32).min(100);
        let recommended_strategy = select_mode(score, &factors);
        let reasoning = reasoning(&factors, recommended_strategy);

        info!(
            score,
            strategy = %recommended_strategy,
            files = factors.file_count,
            dependencies = factors.dependency_count,
            "complexity analysis complete"
        );

        ComplexityAnalysis {
            score,
            recommended_strategy,
            factors,
            reasoning,
        }
    }

    /// Analyze, then let an explicit caller choice win over the recommendation.
    pub fn decide(
        &self,
        files: &[ProjectFile],
        dependencies: Option<&ProjectDependencies>,
        choice: StrategyChoice,
    ) -> StrategyDecision {
        let analysis = self.analyze(files, dependencies);
        let mode = choice.resolve(analysis.recommended_strategy);
        let overridden = choice != StrategyChoice::Auto;
        if overridden {
            info!(
                override_mode = %mode,
                recommended = %analysis.recommended_strategy,
                "using overridden strategy"
            );
        }
        StrategyDecision {
            mode,
            analysis,
            overridden,
        }
    }
}

fn select_mode(score: u32, factors: &ComplexityFactors) -> ExecutionMode {
    if factors.has_heavy_dependencies || factors.has_native_dependencies {
        return ExecutionMode::Docker;
    }
    match score {
        0..=30 => ExecutionMode::Webcontainer,
        31..=70 if factors.has_build_step => ExecutionMode::Docker,
        31..=70 => ExecutionMode::Webcontainer,
        _ => ExecutionMode::Docker,
    }
}

fn reasoning(factors: &ComplexityFactors, mode: ExecutionMode) -> String {
    let mut reasons = Vec::new();

    let n = factors.file_count;
    reasons.push(if n > 200 {
        format!("Large project with {n} files")
    } else if n > 50 {
        format!("Medium-sized project with {n} files")
    } else {
        format!("Small project with {n} files")
    });

    if factors.total_size_bytes as f64 > 20.0 * MB {
        reasons.push(format!(
            "Large codebase ({:.2}MB)",
            factors.total_size_bytes as f64 / MB
        ));
    }
    if factors.has_heavy_dependencies {
        reasons.push("Contains heavy dependencies requiring Docker isolation".to_string());
    }
    if factors.has_native_dependencies {
        reasons.push("Contains native dependencies requiring system binaries".to_string());
    }
    if factors.dependency_count > 50 {
        reasons.push(format!("Many dependencies ({})", factors.dependency_count));
    }
    if factors.has_build_step {
        reasons.push("Requires build step with bundler".to_string());
    }
    reasons.push(match mode {
        ExecutionMode::Webcontainer => {
            "WebContainer suitable for fast, lightweight execution".to_string()
        }
        ExecutionMode::Docker => "Docker recommended for robust, isolated execution".to_string(),
    });

    format!("{}.", reasons.join(". "))
}
