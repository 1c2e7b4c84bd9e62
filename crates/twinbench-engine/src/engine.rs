//! Evaluation engine facade.
//!
//! Ties registration, patch installation, test normalization, instrumentation,
//! execution, and coverage into single-call evaluations. Failures scoped to
//! one evaluation (malformed patch, unresolvable import, missing entity) are
//! captured into the report envelope; consistency violations abort the call.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use serde::Serialize;

use crate::ast::Stmt;
use crate::coverage::{entity_coverage, write_artifact, CoverageRecorder, EntityCoverage};
use crate::environment::{Environment, TargetSpec, ORIGINAL_VERSION};
use crate::error::{EngineError, EngineResult};
use crate::instrument::{EntityProbe, ModeMask};
use crate::normalize::{normalize_test_source, MODULE_MARKER};
use crate::reference::{base_name, reference_name};
use crate::runner::{run_test_suite, TestStats};
use crate::serialize::SerializerChain;
use crate::value::{ClassValue, Scope, Value};

/// Origin label for executed test sources.
pub const TEST_ORIGIN: &str = "<test>";

/// Origin label for ad-hoc snippets.
pub const SNIPPET_ORIGIN: &str = "<snippet>";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// When set, per-evaluation coverage artifacts are written under it.
    pub result_dir: Option<PathBuf>,
    pub default_mask: ModeMask,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            result_dir: None,
            default_mask: ModeMask::FULL,
        }
    }
}

/// Everything one evaluation produced.
#[derive(Debug, Clone, Serialize)]
pub struct EvalReport {
    pub version: String,
    pub test_id: String,
    /// Absent when the evaluation failed before any test ran.
    pub stats: Option<TestStats>,
    pub stdout: String,
    pub stderr: String,
    /// Per entity; an entity missing from the installed source has no entry.
    pub coverage: BTreeMap<String, EntityCoverage>,
    /// Merged instrumentation logs, keyed by entity name.
    pub call_logs: BTreeMap<String, Vec<serde_json::Value>>,
    /// Failures scoped to this evaluation.
    pub errors: Vec<String>,
}

impl EvalReport {
    fn new(version: &str, test_id: &str) -> Self {
        Self {
            version: version.to_string(),
            test_id: test_id.to_string(),
            stats: None,
            stdout: String::new(),
            stderr: String::new(),
            coverage: BTreeMap::new(),
            call_logs: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// A report is valid when its suite ran and nothing failed or errored.
    pub fn valid(&self) -> bool {
        self.stats.as_ref().is_some_and(|s| s.valid)
    }
}

#[derive(Default)]
pub struct TestEngine {
    config: EngineConfig,
    env: Option<Environment>,
    tests: BTreeMap<String, String>,
}

impl TestEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            env: None,
            tests: BTreeMap::new(),
        }
    }

    fn env(&self) -> EngineResult<&Environment> {
        self.env.as_ref().ok_or(EngineError::NotRegistered)
    }

    fn env_mut(&mut self) -> EngineResult<&mut Environment> {
        self.env.as_mut().ok_or(EngineError::NotRegistered)
    }

    // ---- registration ------------------------------------------------------

    /// Register the target entity set and install the original version, so a
    /// target whose source or import-time dependencies cannot load is
    /// rejected here rather than at the first evaluation. Exactly one
    /// registration per engine.
    pub fn register_target(&mut self, spec: TargetSpec) -> EngineResult<()> {
        if self.env.is_some() {
            return Err(EngineError::AlreadyRegistered);
        }
        let mut env = Environment::new(spec)?;
        env.install(ORIGINAL_VERSION)?;
        self.env = Some(env);
        Ok(())
    }

    /// Register (or replace) a generated test source under an id.
    pub fn register_test(&mut self, test_id: &str, source: String) {
        self.tests.insert(test_id.to_string(), source);
    }

    pub fn test_ids(&self) -> Vec<String> {
        self.tests.keys().cloned().collect()
    }

    pub fn submit_patch(&mut self, version: &str, source: String) -> EngineResult<()> {
        self.env_mut()?.register_patch(version, source)
    }

    pub fn submit_patch_file(&mut self, version: &str, path: &Path) -> EngineResult<()> {
        self.env_mut()?.register_patch_from_path(version, path)
    }

    pub fn versions(&self) -> EngineResult<Vec<String>> {
        Ok(self.env()?.versions())
    }

    /// Top-level function and class names of the original target file.
    pub fn target_members(&self) -> EngineResult<Vec<String>> {
        let env = self.env()?;
        Ok(env
            .snapshot()
            .module
            .body
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Fn(def) => Some(def.name.clone()),
                Stmt::Class(def) => Some(def.name.clone()),
                _ => None,
            })
            .collect())
    }

    // ---- evaluation --------------------------------------------------------

    /// Install a version, run one registered test suite against it, and
    /// report outcomes, coverage, and call logs.
    pub fn evaluate(
        &mut self,
        version: &str,
        test_id: &str,
        mask_override: Option<ModeMask>,
    ) -> EngineResult<EvalReport> {
        let mask = mask_override.unwrap_or(self.config.default_mask);
        let raw = self
            .tests
            .get(test_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownTest(test_id.to_string()))?;
        let result_dir = self.config.result_dir.clone();
        let env = self.env_mut()?;
        let mut report = EvalReport::new(version, test_id);

        let entity_names = env.spec().entity_names.clone();
        let mut normalized = raw;
        for entity in &entity_names {
            match normalize_test_source(&normalized, base_name(entity), &reference_name(entity)) {
                Ok(cleaned) => normalized = cleaned,
                Err(error) => {
                    report.errors.push(format!("test normalization: {error}"));
                    return Ok(report);
                }
            }
        }

        if let Err(error) = env.install(version) {
            if error.is_per_evaluation() {
                tracing::warn!(version, test_id, %error, "install failed");
                report.errors.push(format!("install: {error}"));
                return Ok(report);
            }
            return Err(error);
        }
        let Some(loaded) = env.loaded_mut() else {
            return Err(EngineError::Consistency(
                "install succeeded but no environment is loaded".to_string(),
            ));
        };

        // Import-time output belongs to the load, not the run.
        loaded.interp.take_stdout();
        loaded.interp.take_stderr();

        let nspace = loaded.build_nspace();
        let chain = Rc::new(SerializerChain::default());
        let mut probes: Vec<AttachedProbe> = Vec::new();
        let mut probed: BTreeSet<&str> = BTreeSet::new();
        for entity in &entity_names {
            if !probed.insert(entity) {
                continue;
            }
            match attach_probe(&nspace, &loaded.module_scope, entity, mask, &chain) {
                Ok(attached) => probes.push(attached),
                Err(message) => report.errors.push(message),
            }
        }

        loaded.interp.coverage = Some(CoverageRecorder::new(MODULE_MARKER));
        match run_test_suite(
            &mut loaded.interp,
            &mut loaded.resolver,
            &nspace,
            &normalized,
            TEST_ORIGIN,
        ) {
            Ok(stats) => report.stats = Some(stats),
            Err(failure) => {
                let error = failure.into_engine_error();
                tracing::warn!(version, test_id, %error, "test suite failed to load");
                report.errors.push(format!("test execution: {error}"));
            }
        }
        report.stdout = loaded.interp.take_stdout();
        report.stderr = loaded.interp.take_stderr();

        let recorder = loaded.interp.coverage.take().unwrap_or_else(|| {
            CoverageRecorder::new(MODULE_MARKER)
        });
        for entity in &entity_names {
            match loaded.entity_span(entity) {
                Some(span) => {
                    report.coverage.insert(
                        entity.clone(),
                        entity_coverage(&loaded.analysis, &recorder, span),
                    );
                }
                None => {
                    // Missing entities were already reported during probe
                    // attachment; spans can only be absent for the same reason.
                }
            }
        }

        // Unwind the probes first so a same-version reinstall (a no-op) never
        // sees an already wrapped entity on the next evaluation.
        for attached in &probes {
            attached.detach(&nspace, &loaded.module_scope);
        }
        for attached in &probes {
            report
                .call_logs
                .insert(attached.probe.entity.clone(), attached.probe.merged_logs()?);
        }

        if let Some(result_dir) = &result_dir {
            if !report.coverage.is_empty() {
                write_artifact(result_dir, version, test_id, &report.coverage)?;
            }
        }
        Ok(report)
    }

    /// Evaluate every registered test against one version, in test-id order.
    pub fn evaluate_all(
        &mut self,
        version: &str,
        mask_override: Option<ModeMask>,
    ) -> EngineResult<BTreeMap<String, EvalReport>> {
        let mut reports = BTreeMap::new();
        for test_id in self.test_ids() {
            let report = self.evaluate(version, &test_id, mask_override)?;
            reports.insert(test_id, report);
        }
        Ok(reports)
    }

    /// Execute an ad-hoc snippet against the currently installed environment
    /// and return its captured stdout. Installs the original version first
    /// when nothing is installed yet.
    pub fn eval_snippet(&mut self, source: &str) -> EngineResult<String> {
        let env = self.env_mut()?;
        if env.loaded_version().is_none() {
            env.install(ORIGINAL_VERSION)?;
        }
        let Some(loaded) = env.loaded_mut() else {
            return Err(EngineError::Consistency(
                "install succeeded but no environment is loaded".to_string(),
            ));
        };
        loaded.interp.take_stdout();
        loaded.interp.take_stderr();
        let nspace = loaded.build_nspace();
        loaded
            .interp
            .exec_in(&mut loaded.resolver, source, SNIPPET_ORIGIN, &nspace)
            .map_err(|f| f.into_engine_error())?;
        Ok(loaded.interp.take_stdout())
    }

    // ---- restore -----------------------------------------------------------

    pub fn restore(&mut self) -> EngineResult<()> {
        self.env_mut()?.restore()
    }

    pub fn is_restored(&self) -> EngineResult<bool> {
        Ok(self.env()?.is_restored())
    }
}

/// Where a probe's wrapped callable was installed, with the value it
/// replaced, so the wrap can be undone after the run.
enum ProbeSite {
    Binding {
        name: String,
        inner: Value,
    },
    Method {
        class: Rc<ClassValue>,
        name: String,
        inner: Value,
    },
}

struct AttachedProbe {
    probe: EntityProbe,
    site: ProbeSite,
}

impl AttachedProbe {
    fn detach(&self, nspace: &Scope, module_scope: &Scope) {
        match &self.site {
            ProbeSite::Binding { name, inner } => {
                nspace.define(name.clone(), inner.clone());
                module_scope.define(name.clone(), inner.clone());
            }
            ProbeSite::Method { class, name, inner } => {
                class.methods.borrow_mut().insert(name.clone(), inner.clone());
            }
        }
    }
}

/// Wrap a target entity for instrumentation. A plain entity is rebound in
/// both the flattened and the qualified namespace; a dotted entity wraps the
/// named method inside its class, so constructor calls stay unobserved.
fn attach_probe(
    nspace: &Scope,
    module_scope: &Scope,
    entity: &str,
    mask: ModeMask,
    chain: &Rc<SerializerChain>,
) -> Result<AttachedProbe, String> {
    let missing = || format!("entity `{entity}` not found in installed source");
    match entity.split_once('.') {
        Some((class_name, method_name)) => {
            let Some(Value::Class(class)) = nspace.get_local(class_name) else {
                return Err(missing());
            };
            let inner = class.methods.borrow().get(method_name).cloned();
            let Some(inner) = inner else {
                return Err(missing());
            };
            let probe = EntityProbe::attach(entity, inner.clone(), mask, chain);
            class
                .methods
                .borrow_mut()
                .insert(method_name.to_string(), probe.wrapped.clone());
            Ok(AttachedProbe {
                probe,
                site: ProbeSite::Method {
                    class,
                    name: method_name.to_string(),
                    inner,
                },
            })
        }
        None => {
            let Some(inner) = nspace.get_local(entity) else {
                return Err(missing());
            };
            let probe = EntityProbe::attach(entity, inner.clone(), mask, chain);
            nspace.define(entity.to_string(), probe.wrapped.clone());
            module_scope.define(entity.to_string(), probe.wrapped.clone());
            Ok(AttachedProbe {
                probe,
                site: ProbeSite::Binding {
                    name: entity.to_string(),
                    inner,
                },
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET_SOURCE: &str = "fn add(a, b) {\n    return a + b;\n}\n";

    fn engine_with_target(source: &str, entities: &[&str]) -> (tempfile::TempDir, TestEngine) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("target.sc"), source).expect("write");
        let mut engine = TestEngine::new(EngineConfig::default());
        engine
            .register_target(TargetSpec {
                repo_path: dir.path().to_path_buf(),
                file_rel_path: PathBuf::from("target.sc"),
                entity_names: entities.iter().map(|s| s.to_string()).collect(),
            })
            .expect("register");
        (dir, engine)
    }

    #[test]
    fn double_registration_is_rejected() {
        let (dir, mut engine) = engine_with_target(TARGET_SOURCE, &["add"]);
        let err = engine
            .register_target(TargetSpec {
                repo_path: dir.path().to_path_buf(),
                file_rel_path: PathBuf::from("target.sc"),
                entity_names: vec!["add".to_string()],
            })
            .expect_err("must reject");
        assert!(matches!(err, EngineError::AlreadyRegistered));
    }

    #[test]
    fn unknown_test_id_is_an_error() {
        let (_dir, mut engine) = engine_with_target(TARGET_SOURCE, &["add"]);
        let err = engine
            .evaluate(ORIGINAL_VERSION, "nope", None)
            .expect_err("must fail");
        assert!(matches!(err, EngineError::UnknownTest(_)));
    }

    #[test]
    fn original_version_is_self_equivalent() {
        let (_dir, mut engine) = engine_with_target(TARGET_SOURCE, &["add"]);
        engine.register_test(
            "test_1",
            "fn test_matches_reference() {\n    assert_eq(add(2, 3), reference_add(2, 3));\n}\n"
                .to_string(),
        );
        let report = engine
            .evaluate(ORIGINAL_VERSION, "test_1", None)
            .expect("evaluate");
        assert!(report.valid());
        assert!(report.errors.is_empty());
        let stats = report.stats.expect("stats");
        assert_eq!(stats.passed_count, 1);
    }

    #[test]
    fn registering_a_missing_entity_fails_synthesis() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("target.sc"), TARGET_SOURCE).expect("write");
        let mut engine = TestEngine::default();
        let err = engine
            .register_target(TargetSpec {
                repo_path: dir.path().to_path_buf(),
                file_rel_path: PathBuf::from("target.sc"),
                entity_names: vec!["add".to_string(), "mul".to_string()],
            })
            .expect_err("must fail");
        assert!(matches!(err, EngineError::EntityNotFound(name) if name == "mul"));
    }

    #[test]
    fn register_target_fails_when_imports_cannot_resolve() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("target.sc"),
            "from nowhere import helper;\nfn add(a, b) {\n    return helper(a) + b;\n}\n",
        )
        .expect("write");
        let mut engine = TestEngine::default();
        let err = engine
            .register_target(TargetSpec {
                repo_path: dir.path().to_path_buf(),
                file_rel_path: PathBuf::from("target.sc"),
                entity_names: vec!["add".to_string()],
            })
            .expect_err("must fail");
        assert!(matches!(err, EngineError::Load(_)));
    }

    #[test]
    fn method_probes_log_each_method_call() {
        let source = "class Acc {\n    fn bump(self, n) {\n        return n + 1;\n    }\n}\n";
        let (_dir, mut engine) = engine_with_target(source, &["Acc.bump"]);
        engine.register_test(
            "test_calls",
            "fn test_two_bumps() {\n    let acc = Acc();\n    assert_eq(acc.bump(2), 3);\n    assert_eq(acc.bump(5), 6);\n}\n"
                .to_string(),
        );
        let report = engine
            .evaluate(ORIGINAL_VERSION, "test_calls", None)
            .expect("evaluate");
        assert!(report.valid(), "errors: {:?}", report.errors);
        let logs = report.call_logs.get("Acc.bump").expect("logs");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0]["args"]["inputs"]["n"]["raw"], serde_json::json!(2));
        assert_eq!(logs[1]["args"]["inputs"]["n"]["raw"], serde_json::json!(5));
    }

    #[test]
    fn import_time_output_stays_out_of_the_report() {
        let source = "fn add(a, b) {\n    return a + b;\n}\nprint(\"loading\");\n";
        let (_dir, mut engine) = engine_with_target(source, &["add"]);
        engine.register_test(
            "test_quiet",
            "fn test_prints_once() {\n    print(\"ran\");\n    assert_true(true);\n}\n".to_string(),
        );
        let report = engine
            .evaluate(ORIGINAL_VERSION, "test_quiet", None)
            .expect("evaluate");
        assert_eq!(report.stdout, "ran\n");
    }

    #[test]
    fn target_members_come_from_the_snapshot() {
        let source = "fn add(a, b) {\n    return a + b;\n}\nclass Acc {\n    fn bump(self) {\n        return 1;\n    }\n}\n";
        let (_dir, engine) = engine_with_target(source, &["add"]);
        assert_eq!(engine.target_members().expect("members"), vec!["add", "Acc"]);
    }

    #[test]
    fn eval_snippet_sees_target_and_reference() {
        let (_dir, mut engine) = engine_with_target(TARGET_SOURCE, &["add"]);
        let output = engine
            .eval_snippet("print(add(1, 2), reference_add(3, 4));\n")
            .expect("snippet");
        assert_eq!(output, "3 7\n");
    }

    #[test]
    fn operations_before_registration_fail() {
        let mut engine = TestEngine::default();
        assert!(matches!(
            engine.submit_patch("v1", String::new()),
            Err(EngineError::NotRegistered)
        ));
        assert!(matches!(
            engine.restore(),
            Err(EngineError::NotRegistered)
        ));
    }
}
