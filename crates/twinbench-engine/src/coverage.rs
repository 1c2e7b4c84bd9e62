//! Entity-scoped line and branch coverage.
//!
//! The interpreter records executed lines and branch arcs for exactly one
//! origin label (the installed target module). A static pass over the parsed
//! module yields the executable lines and possible arcs; slicing both against
//! an entity's line span gives per-entity coverage. Lines marked `# nocov`
//! are excluded from every count.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::ast::{LineSpan, Module, Stmt};
use crate::error::{EngineError, EngineResult};

/// Mutable event sink installed on the interpreter for one evaluation.
#[derive(Debug, Clone)]
pub struct CoverageRecorder {
    pub target_origin: String,
    pub executed_lines: BTreeSet<u32>,
    pub executed_arcs: BTreeSet<(u32, u32)>,
}

impl CoverageRecorder {
    pub fn new(target_origin: impl Into<String>) -> Self {
        Self {
            target_origin: target_origin.into(),
            executed_lines: BTreeSet::new(),
            executed_arcs: BTreeSet::new(),
        }
    }
}

/// Static view of a module: which lines can execute and which arcs exist.
#[derive(Debug, Clone, Default)]
pub struct SourceAnalysis {
    pub executable_lines: BTreeSet<u32>,
    pub possible_arcs: BTreeSet<(u32, u32)>,
    pub excluded_lines: BTreeSet<u32>,
}

pub fn analyze_module(module: &Module) -> SourceAnalysis {
    let mut analysis = SourceAnalysis {
        excluded_lines: module.excluded_lines.clone(),
        ..Default::default()
    };
    collect_stmts(&module.body, &mut analysis);
    analysis
}

fn collect_stmts(stmts: &[Stmt], analysis: &mut SourceAnalysis) {
    for stmt in stmts {
        let line = stmt.span().start_line;
        analysis.executable_lines.insert(line);
        match stmt {
            Stmt::Fn(def) => collect_stmts(&def.body, analysis),
            Stmt::Class(def) => {
                for method in &def.methods {
                    analysis.executable_lines.insert(method.span.start_line);
                    collect_stmts(&method.body, analysis);
                }
            }
            Stmt::If(s) => {
                analysis.possible_arcs.insert((line, first_line(&s.then_body)));
                analysis.possible_arcs.insert((line, first_line(&s.else_body)));
                collect_stmts(&s.then_body, analysis);
                collect_stmts(&s.else_body, analysis);
            }
            Stmt::While(s) => {
                analysis.possible_arcs.insert((line, first_line(&s.body)));
                analysis.possible_arcs.insert((line, 0));
                collect_stmts(&s.body, analysis);
            }
            _ => {}
        }
    }
}

fn first_line(stmts: &[Stmt]) -> u32 {
    stmts.first().map_or(0, |s| s.span().start_line)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoverageMetrics {
    pub line_count: usize,
    pub executed_line_count: usize,
    pub line_percent: f64,
    pub branch_count: usize,
    pub executed_branch_count: usize,
    pub branch_percent: f64,
}

/// Coverage of one entity's line span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityCoverage {
    pub span: LineSpan,
    pub lines_executed: Vec<u32>,
    pub lines_unexecuted: Vec<u32>,
    pub branches_executed: Vec<(u32, u32)>,
    pub branches_unexecuted: Vec<(u32, u32)>,
    pub metrics: CoverageMetrics,
}

/// Slice recorded events against one entity span.
pub fn entity_coverage(
    analysis: &SourceAnalysis,
    recorder: &CoverageRecorder,
    span: LineSpan,
) -> EntityCoverage {
    let countable: BTreeSet<u32> = analysis
        .executable_lines
        .iter()
        .copied()
        .filter(|&line| span.contains(line) && !analysis.excluded_lines.contains(&line))
        .collect();
    let lines_executed: Vec<u32> = countable
        .iter()
        .copied()
        .filter(|line| recorder.executed_lines.contains(line))
        .collect();
    let lines_unexecuted: Vec<u32> = countable
        .iter()
        .copied()
        .filter(|line| !recorder.executed_lines.contains(line))
        .collect();

    let possible: BTreeSet<(u32, u32)> = analysis
        .possible_arcs
        .iter()
        .copied()
        .filter(|(from, _)| span.contains(*from) && !analysis.excluded_lines.contains(from))
        .collect();
    let branches_executed: Vec<(u32, u32)> = possible
        .iter()
        .copied()
        .filter(|arc| recorder.executed_arcs.contains(arc))
        .collect();
    let branches_unexecuted: Vec<(u32, u32)> = possible
        .iter()
        .copied()
        .filter(|arc| !recorder.executed_arcs.contains(arc))
        .collect();

    let metrics = CoverageMetrics {
        line_count: countable.len(),
        executed_line_count: lines_executed.len(),
        line_percent: percent(lines_executed.len(), countable.len()),
        branch_count: possible.len(),
        executed_branch_count: branches_executed.len(),
        branch_percent: percent(branches_executed.len(), possible.len()),
    };
    EntityCoverage {
        span,
        lines_executed,
        lines_unexecuted,
        branches_executed,
        branches_unexecuted,
        metrics,
    }
}

/// Ratio as a percentage; an empty denominator counts as fully covered.
fn percent(executed: usize, total: usize) -> f64 {
    if total == 0 {
        100.0
    } else {
        executed as f64 * 100.0 / total as f64
    }
}

#[derive(Serialize)]
struct CoverageArtifact<'a> {
    version: &'a str,
    test_id: &'a str,
    written_at: String,
    entities: &'a BTreeMap<String, EntityCoverage>,
}

/// Persist per-entity coverage under `<result_dir>/<version>/<test_id>/`.
pub fn write_artifact(
    result_dir: &Path,
    version: &str,
    test_id: &str,
    entities: &BTreeMap<String, EntityCoverage>,
) -> EngineResult<PathBuf> {
    let dir = result_dir.join(version).join(test_id);
    std::fs::create_dir_all(&dir).map_err(|e| EngineError::io(&dir, e))?;
    let path = dir.join("cov_detail.json");
    let artifact = CoverageArtifact {
        version,
        test_id,
        written_at: chrono::Utc::now().to_rfc3339(),
        entities,
    };
    let mut body = serde_json::to_string_pretty(&artifact)
        .map_err(|e| EngineError::Consistency(format!("coverage artifact serialization: {e}")))?;
    body.push('\n');
    std::fs::write(&path, body).map_err(|e| EngineError::io(&path, e))?;
    tracing::debug!(path = %path.display(), "wrote coverage artifact");
    Ok(path)
}
