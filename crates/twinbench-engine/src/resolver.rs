//! Filesystem module resolution for `import` statements.
//!
//! A resolver owns an ordered list of search roots and a cache of already
//! executed module namespaces. Each environment rebuild starts from a fresh
//! resolver, so stale namespaces never leak across installed versions.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{EngineError, LoadError, SourceError};
use crate::interp::RuntimeError;
use crate::parser::ParseError;
use crate::value::Scope;

/// File extension of script modules.
pub const MODULE_EXTENSION: &str = "sc";

/// Why a module (or a source executed through the loader) failed to load.
#[derive(Debug, thiserror::Error)]
pub enum LoadFailure {
    #[error("module `{module}` not found (searched {searched:?})")]
    NotFound {
        module: String,
        searched: Vec<PathBuf>,
    },
    #[error("could not read {path}: {detail}")]
    Io { path: PathBuf, detail: String },
    #[error("{0}")]
    Parse(ParseError),
    #[error("circular import of module `{0}`")]
    Circular(String),
    #[error("module `{module}` has no member `{name}`")]
    MissingMember { module: String, name: String },
    #[error("error while executing `{label}`: {error}")]
    Runtime { label: String, error: RuntimeError },
}

impl LoadFailure {
    /// Only missing-module failures are retried with extended search roots.
    pub fn is_module_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn into_engine_error(self) -> EngineError {
        match self {
            Self::NotFound { module, searched } => EngineError::Load(LoadError {
                module,
                searched,
                detail: "module file not found".to_string(),
            }),
            Self::Io { path, detail } => EngineError::Load(LoadError {
                module: path.display().to_string(),
                searched: Vec::new(),
                detail,
            }),
            Self::Parse(error) => EngineError::Source(SourceError(error)),
            Self::Circular(module) => EngineError::Load(LoadError {
                module,
                searched: Vec::new(),
                detail: "circular import".to_string(),
            }),
            Self::MissingMember { module, name } => EngineError::Load(LoadError {
                module,
                searched: Vec::new(),
                detail: format!("module has no member `{name}`"),
            }),
            Self::Runtime { label, error } => EngineError::Load(LoadError {
                module: label,
                searched: Vec::new(),
                detail: error.to_string(),
            }),
        }
    }
}

pub struct ModuleResolver {
    search_roots: Vec<PathBuf>,
    loaded: BTreeMap<String, Scope>,
    loading: BTreeSet<String>,
}

impl ModuleResolver {
    pub fn new(search_roots: Vec<PathBuf>) -> Self {
        Self {
            search_roots,
            loaded: BTreeMap::new(),
            loading: BTreeSet::new(),
        }
    }

    pub fn search_roots(&self) -> &[PathBuf] {
        &self.search_roots
    }

    pub fn extend_roots(&mut self, roots: impl IntoIterator<Item = PathBuf>) {
        for root in roots {
            if !self.search_roots.contains(&root) {
                self.search_roots.push(root);
            }
        }
    }

    pub fn cached(&self, module: &str) -> Option<Scope> {
        self.loaded.get(module).cloned()
    }

    pub fn store(&mut self, module: &str, scope: Scope) {
        self.loaded.insert(module.to_string(), scope);
    }

    pub(crate) fn begin(&mut self, module: &str) -> Result<(), LoadFailure> {
        if !self.loading.insert(module.to_string()) {
            return Err(LoadFailure::Circular(module.to_string()));
        }
        Ok(())
    }

    pub(crate) fn finish(&mut self, module: &str) {
        self.loading.remove(module);
    }

    /// Locate and read the source file for a module name.
    pub fn read_source(&self, module: &str) -> Result<(PathBuf, String), LoadFailure> {
        let mut searched = Vec::new();
        for root in &self.search_roots {
            let candidate = root.join(format!("{module}.{MODULE_EXTENSION}"));
            if candidate.is_file() {
                return match std::fs::read_to_string(&candidate) {
                    Ok(source) => Ok((candidate, source)),
                    Err(error) => Err(LoadFailure::Io {
                        path: candidate,
                        detail: error.to_string(),
                    }),
                };
            }
            searched.push(candidate);
        }
        Err(LoadFailure::NotFound {
            module: module.to_string(),
            searched,
        })
    }
}

/// Extended search roots for a target file in a nested directory layout:
/// the repository root plus every directory between the file and that root,
/// innermost first. Used when a first resolution pass cannot locate a
/// dependency that lives next to the target file rather than at the root.
pub fn extended_roots(repo: &Path, file_path: &Path) -> Vec<PathBuf> {
    let mut roots = vec![repo.to_path_buf()];
    let mut current = file_path.parent();
    while let Some(dir) = current {
        if dir == repo || !dir.starts_with(repo) {
            break;
        }
        roots.push(dir.to_path_buf());
        current = dir.parent();
    }
    roots
}

/// Callable members (functions and classes) bound in a module namespace.
pub fn member_names(scope: &Scope) -> Vec<String> {
    scope
        .local_names()
        .into_iter()
        .filter(|name| scope.get_local(name).is_some_and(|v| v.is_callable()))
        .collect()
}
