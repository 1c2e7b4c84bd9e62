//! Versioned target environments.
//!
//! The environment owns the original snapshot of the target file, the patch
//! store, and the cached reference twins. Installing a version writes the
//! corresponding source over the target file and rebuilds a fresh interpreter
//! state from disk: module namespace, reference definitions, parsed tree, and
//! static coverage analysis. Nothing from a previously installed version
//! survives a rebuild.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::ast::{LineSpan, Module, Stmt};
use crate::coverage::{analyze_module, SourceAnalysis};
use crate::error::{EngineError, EngineResult, SourceError};
use crate::interp::Interp;
use crate::normalize::MODULE_MARKER;
use crate::parser::parse_module;
use crate::reference::{hash_source, ReferenceSet};
use crate::resolver::{extended_roots, ModuleResolver};
use crate::value::{Scope, Value};

/// Version id of the unpatched snapshot. Reserved; patches cannot use it.
pub const ORIGINAL_VERSION: &str = "original";

/// Origin label under which reference twins execute. Distinct from the
/// target's label so twin execution never pollutes target coverage.
pub const REFERENCE_ORIGIN: &str = "<reference>";

/// What to evaluate: a repository, the target file inside it, and the entity
/// names the tests exercise.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub repo_path: PathBuf,
    pub file_rel_path: PathBuf,
    pub entity_names: Vec<String>,
}

/// Frozen copy of the target file taken at registration.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub source: String,
    pub module: Module,
    pub hash: String,
}

#[derive(Debug, Clone)]
pub struct Patch {
    pub source: String,
    pub hash: String,
}

/// Everything rebuilt by an install: interpreter, resolver, the target
/// module's namespace, and the static view used for coverage.
pub struct LoadedEnv {
    pub version: String,
    pub interp: Interp,
    pub resolver: ModuleResolver,
    pub module_scope: Scope,
    pub module_ast: Module,
    pub analysis: SourceAnalysis,
}

impl LoadedEnv {
    /// Evaluation namespace: the module itself under the fixed marker name,
    /// plus every module member flattened to the top level.
    pub fn build_nspace(&self) -> Scope {
        let nspace = self.interp.globals().child();
        nspace.define(MODULE_MARKER, Value::Module(self.module_scope.clone()));
        for name in self.module_scope.local_names() {
            if let Some(value) = self.module_scope.get_local(&name) {
                nspace.define(name, value);
            }
        }
        nspace
    }

    /// Line span of an entity in the installed source. Dotted names resolve
    /// to the method inside its class.
    pub fn entity_span(&self, entity: &str) -> Option<LineSpan> {
        match entity.split_once('.') {
            Some((class_name, method)) => match self.module_ast.find_definition(class_name)? {
                Stmt::Class(def) => def.find_method(method).map(|m| m.span),
                _ => None,
            },
            None => match self.module_ast.find_definition(entity)? {
                Stmt::Fn(def) => Some(def.span),
                Stmt::Class(def) => Some(def.span),
                _ => None,
            },
        }
    }
}

pub struct Environment {
    spec: TargetSpec,
    snapshot: Snapshot,
    references: ReferenceSet,
    patches: BTreeMap<String, Patch>,
    loaded: Option<LoadedEnv>,
    restored: bool,
}

impl Environment {
    /// Snapshot the target file and synthesize the reference twins.
    pub fn new(spec: TargetSpec) -> EngineResult<Self> {
        if !spec.repo_path.is_dir() {
            return Err(EngineError::InvalidRepository(spec.repo_path.clone()));
        }
        let file_path = spec.repo_path.join(&spec.file_rel_path);
        let source = std::fs::read_to_string(&file_path)
            .map_err(|e| EngineError::io(&file_path, e))?;
        let module = parse_module(&source).map_err(|e| EngineError::Source(SourceError(e)))?;
        let references = ReferenceSet::synthesize_all(&module, &spec.entity_names)?;
        let hash = hash_source(&source);
        tracing::info!(
            file = %file_path.display(),
            entities = ?spec.entity_names,
            %hash,
            "registered target"
        );
        Ok(Self {
            spec,
            snapshot: Snapshot {
                source,
                module,
                hash,
            },
            references,
            patches: BTreeMap::new(),
            loaded: None,
            restored: true,
        })
    }

    pub fn spec(&self) -> &TargetSpec {
        &self.spec
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn target_file_path(&self) -> PathBuf {
        self.spec.repo_path.join(&self.spec.file_rel_path)
    }

    /// Whether the file on disk currently holds the original snapshot.
    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn loaded_version(&self) -> Option<&str> {
        self.loaded.as_ref().map(|l| l.version.as_str())
    }

    pub fn loaded(&self) -> Option<&LoadedEnv> {
        self.loaded.as_ref()
    }

    pub fn loaded_mut(&mut self) -> Option<&mut LoadedEnv> {
        self.loaded.as_mut()
    }

    pub fn versions(&self) -> Vec<String> {
        self.patches.keys().cloned().collect()
    }

    pub fn register_patch(&mut self, version: &str, source: String) -> EngineResult<()> {
        if version == ORIGINAL_VERSION {
            return Err(EngineError::ReservedVersion);
        }
        let hash = hash_source(&source);
        tracing::info!(version, %hash, "registered patch");
        self.patches.insert(version.to_string(), Patch { source, hash });
        Ok(())
    }

    pub fn register_patch_from_path(&mut self, version: &str, path: &Path) -> EngineResult<()> {
        let source =
            std::fs::read_to_string(path).map_err(|e| EngineError::io(path, e))?;
        self.register_patch(version, source)
    }

    fn patch_source(&self, version: &str) -> EngineResult<&str> {
        if version == ORIGINAL_VERSION {
            return Ok(&self.snapshot.source);
        }
        self.patches
            .get(version)
            .map(|p| p.source.as_str())
            .ok_or_else(|| EngineError::UnknownVersion(version.to_string()))
    }

    /// Write a version over the target file and rebuild the interpreter state
    /// from it. Installing the version that is already loaded is a no-op, so
    /// module-level state survives repeated runs against one version. The
    /// loaded version only advances when the rebuild succeeds.
    pub fn install(&mut self, version: &str) -> EngineResult<()> {
        if self.loaded.as_ref().is_some_and(|l| l.version == version) {
            tracing::debug!(version, "version already installed");
            return Ok(());
        }
        let source = self.patch_source(version)?.to_string();
        let file_path = self.target_file_path();
        self.loaded = None;
        std::fs::write(&file_path, &source).map_err(|e| EngineError::io(&file_path, e))?;
        self.restored = version == ORIGINAL_VERSION;

        let module_ast =
            parse_module(&source).map_err(|e| EngineError::Source(SourceError(e)))?;
        let (interp, resolver, module_scope) = self.build_module(&source)?;
        self.references
            .verify_against(&self.snapshot.module, &self.spec.entity_names)?;
        let analysis = analyze_module(&module_ast);
        tracing::info!(version, "installed environment");
        self.loaded = Some(LoadedEnv {
            version: version.to_string(),
            interp,
            resolver,
            module_scope,
            module_ast,
            analysis,
        });
        Ok(())
    }

    /// Execute the installed source as the target module and layer the
    /// reference twins into its namespace. A missing imported module gets one
    /// retry with every directory between the target file and the repository
    /// root added as a search root.
    fn build_module(&self, source: &str) -> EngineResult<(Interp, ModuleResolver, Scope)> {
        let base_roots = vec![self.spec.repo_path.clone()];
        match self.try_build(source, base_roots) {
            Ok(built) => Ok(built),
            Err(failure) if failure.is_module_not_found() => {
                tracing::warn!(%failure, "module resolution failed, retrying with extended roots");
                let roots = extended_roots(&self.spec.repo_path, &self.target_file_path());
                self.try_build(source, roots)
                    .map_err(|f| f.into_engine_error())
            }
            Err(failure) => Err(failure.into_engine_error()),
        }
    }

    fn try_build(
        &self,
        source: &str,
        roots: Vec<PathBuf>,
    ) -> Result<(Interp, ModuleResolver, Scope), crate::resolver::LoadFailure> {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(roots);
        let module_scope = interp.load_module(&mut resolver, source, MODULE_MARKER)?;
        for reference in &self.references.sources {
            interp.exec_in(&mut resolver, reference, REFERENCE_ORIGIN, &module_scope)?;
        }
        Ok((interp, resolver, module_scope))
    }

    /// Put the original snapshot back on disk.
    pub fn restore(&mut self) -> EngineResult<()> {
        let file_path = self.target_file_path();
        std::fs::write(&file_path, &self.snapshot.source)
            .map_err(|e| EngineError::io(&file_path, e))?;
        tracing::info!(file = %file_path.display(), "restored target file");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET_SOURCE: &str = "fn add(a, b) {\n    return a + b;\n}\n";

    fn make_repo(source: &str) -> (tempfile::TempDir, TargetSpec) {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("target.sc"), source).expect("write");
        let spec = TargetSpec {
            repo_path: dir.path().to_path_buf(),
            file_rel_path: PathBuf::from("target.sc"),
            entity_names: vec!["add".to_string()],
        };
        (dir, spec)
    }

    fn call_int(env: &mut Environment, name: &str, args: Vec<i64>) -> i64 {
        let loaded = env.loaded_mut().expect("loaded");
        let callee = loaded.module_scope.get_local(name).expect("bound");
        let args = args.into_iter().map(Value::Int).collect();
        match loaded.interp.call_value(&callee, args) {
            Ok(Value::Int(v)) => v,
            other => panic!("expected int, got {other:?}"),
        }
    }

    #[test]
    fn registration_snapshots_and_synthesizes_references() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let env = Environment::new(spec).expect("new");
        assert!(env.is_restored());
        assert_eq!(env.snapshot().source, TARGET_SOURCE);
        assert_eq!(env.references().sources.len(), 1);
        assert!(env.references().sources[0].starts_with("fn reference_add"));
    }

    #[test]
    fn installing_original_binds_target_and_reference() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        assert_eq!(env.loaded_version(), Some(ORIGINAL_VERSION));
        assert!(env.is_restored());
        assert_eq!(call_int(&mut env, "add", vec![2, 3]), 5);
        assert_eq!(call_int(&mut env, "reference_add", vec![2, 3]), 5);
    }

    #[test]
    fn installing_a_patch_swaps_the_target_but_not_the_reference() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.register_patch("candidate_1", "fn add(a, b) {\n    return a - b;\n}\n".to_string())
            .expect("register");
        env.install("candidate_1").expect("install");
        assert!(!env.is_restored());
        assert_eq!(env.loaded_version(), Some("candidate_1"));
        assert_eq!(call_int(&mut env, "add", vec![2, 3]), -1);
        assert_eq!(call_int(&mut env, "reference_add", vec![2, 3]), 5);
        let on_disk = std::fs::read_to_string(env.target_file_path()).expect("read");
        assert!(on_disk.contains("a - b"));
    }

    #[test]
    fn restore_puts_the_snapshot_back_byte_identical() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.register_patch("candidate_1", "fn add(a, b) {\n    return 0;\n}\n".to_string())
            .expect("register");
        env.install("candidate_1").expect("install");
        env.restore().expect("restore");
        let on_disk = std::fs::read_to_string(env.target_file_path()).expect("read");
        assert_eq!(on_disk, TARGET_SOURCE);
    }

    #[test]
    fn original_version_id_is_reserved() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        let err = env
            .register_patch(ORIGINAL_VERSION, String::new())
            .expect_err("must reject");
        assert!(matches!(err, EngineError::ReservedVersion));
    }

    #[test]
    fn installing_the_loaded_version_is_a_noop() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        let first = env.loaded().expect("loaded").module_scope.clone();
        env.install(ORIGINAL_VERSION).expect("again");
        assert!(env.loaded().expect("loaded").module_scope.ptr_eq(&first));
    }

    #[test]
    fn failed_write_leaves_the_restored_flag_unset() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
        std::fs::write(dir.path().join("src/target.sc"), TARGET_SOURCE).expect("write");
        let spec = TargetSpec {
            repo_path: dir.path().to_path_buf(),
            file_rel_path: PathBuf::from("src/target.sc"),
            entity_names: vec!["add".to_string()],
        };
        let mut env = Environment::new(spec).expect("new");
        env.register_patch("v1", "fn add(a, b) {\n    return a;\n}\n".to_string())
            .expect("register");
        env.install("v1").expect("install");
        assert!(!env.is_restored());
        std::fs::remove_dir_all(dir.path().join("src")).expect("remove");
        let err = env.install(ORIGINAL_VERSION).expect_err("write must fail");
        assert!(matches!(err, EngineError::Io { .. }));
        assert!(!env.is_restored());
    }

    #[test]
    fn unknown_version_fails_before_touching_the_file() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        let err = env.install("nope").expect_err("must fail");
        assert!(matches!(err, EngineError::UnknownVersion(_)));
        assert_eq!(env.loaded_version(), Some(ORIGINAL_VERSION));
    }

    #[test]
    fn malformed_patch_fails_scoped_to_the_install() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.register_patch("broken", "fn add(a, b {\n".to_string())
            .expect("register");
        let err = env.install("broken").expect_err("must fail");
        assert!(err.is_per_evaluation());
        assert!(env.loaded_version().is_none());
        env.install(ORIGINAL_VERSION).expect("recovers");
    }

    #[test]
    fn missing_imports_retry_with_roots_between_file_and_repo() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("pkg/inner")).expect("mkdir");
        std::fs::write(
            dir.path().join("pkg/inner/helpers.sc"),
            "fn twice(x) {\n    return x * 2;\n}\n",
        )
        .expect("write");
        std::fs::write(
            dir.path().join("pkg/inner/target.sc"),
            "from helpers import twice;\nfn add(a, b) {\n    return twice(a) + b;\n}\n",
        )
        .expect("write");
        let spec = TargetSpec {
            repo_path: dir.path().to_path_buf(),
            file_rel_path: PathBuf::from("pkg/inner/target.sc"),
            entity_names: vec!["add".to_string()],
        };
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        assert_eq!(call_int(&mut env, "add", vec![2, 3]), 7);
    }

    #[test]
    fn nspace_flattens_module_members_under_the_marker() {
        let (_dir, spec) = make_repo(TARGET_SOURCE);
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        let nspace = env.loaded().expect("loaded").build_nspace();
        assert!(nspace.get_local("add").is_some());
        assert!(nspace.get_local("reference_add").is_some());
        assert!(matches!(
            nspace.get_local(MODULE_MARKER),
            Some(Value::Module(_))
        ));
    }

    #[test]
    fn method_entities_resolve_to_method_spans() {
        let source = "class Acc {\n    fn init(self) {\n        self.total = 0;\n    }\n    fn bump(self, n) {\n        self.total = self.total + n;\n        return self.total;\n    }\n}\n";
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("target.sc"), source).expect("write");
        let spec = TargetSpec {
            repo_path: dir.path().to_path_buf(),
            file_rel_path: PathBuf::from("target.sc"),
            entity_names: vec!["Acc.bump".to_string()],
        };
        let mut env = Environment::new(spec).expect("new");
        env.install(ORIGINAL_VERSION).expect("install");
        let span = env
            .loaded()
            .expect("loaded")
            .entity_span("Acc.bump")
            .expect("span");
        assert_eq!(span.start_line, 5);
    }
}
