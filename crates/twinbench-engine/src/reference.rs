//! Reference-twin synthesis.
//!
//! For every target entity the engine keeps a renamed duplicate of its
//! *original* definition (`reference_<name>`) that generated tests use as
//! ground truth. The duplicate is synthesized exactly once per registration
//! from the original snapshot's tree and re-executed into the environment on
//! every rebuild, so it never reflects whichever patch is installed.

use sha2::{Digest, Sha256};

use crate::ast::Module;
use crate::error::EngineError;
use crate::transform::rename_binder;
use crate::unparse::unparse_stmt;

/// Prefix applied to reference-twin names.
pub const REFERENCE_PREFIX: &str = "reference_";

/// The definition an entity name resolves to. A dotted `Class.method` name
/// resolves via its enclosing class.
pub fn base_name(entity_name: &str) -> &str {
    match entity_name.split_once('.') {
        Some((class_name, _)) => class_name,
        None => entity_name,
    }
}

/// Canonical reference name for an entity.
pub fn reference_name(entity_name: &str) -> String {
    format!("{REFERENCE_PREFIX}{}", base_name(entity_name))
}

/// Synthesize the reference-twin source for one entity from the original
/// snapshot's tree.
pub fn synthesize(snapshot: &Module, entity_name: &str) -> Result<String, EngineError> {
    let base = base_name(entity_name);
    let definition = snapshot
        .find_definition(base)
        .ok_or_else(|| EngineError::EntityNotFound(entity_name.to_string()))?;
    let mut twin = definition.clone();
    rename_binder(&mut twin, base, &reference_name(entity_name));
    Ok(unparse_stmt(&twin))
}

/// The cached reference sources for a registration, with a content hash used
/// to detect resynthesis drift.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    pub sources: Vec<String>,
    pub content_hash: String,
}

impl ReferenceSet {
    pub fn synthesize_all(snapshot: &Module, entity_names: &[String]) -> Result<Self, EngineError> {
        let mut sources = Vec::with_capacity(entity_names.len());
        for name in entity_names {
            sources.push(synthesize(snapshot, name)?);
        }
        let content_hash = hash_sources(&sources);
        Ok(Self {
            sources,
            content_hash,
        })
    }

    /// Recompute the twin sources and compare them with the cached set.
    /// A mismatch means the synthesis inputs changed under us, which is an
    /// internal-invariant violation.
    pub fn verify_against(
        &self,
        snapshot: &Module,
        entity_names: &[String],
    ) -> Result<(), EngineError> {
        let fresh = Self::synthesize_all(snapshot, entity_names)?;
        if fresh.content_hash != self.content_hash {
            return Err(EngineError::Consistency(format!(
                "reference resynthesis diverged from cache: {} != {}",
                fresh.content_hash, self.content_hash
            )));
        }
        Ok(())
    }
}

pub fn hash_sources(sources: &[String]) -> String {
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
    }
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Content hash of a single source text, used for snapshot/patch identity.
pub fn hash_source(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;

    #[test]
    fn synthesizes_renamed_function_twin() {
        let snapshot = parse_module(
            "fn add(a, b) {\n    return a + b;\n}\nfn mul(a, b) {\n    return a * b;\n}\n",
        )
        .expect("parse");
        let twin = synthesize(&snapshot, "add").expect("synthesize");
        assert_eq!(twin, "fn reference_add(a, b) {\n    return a + b;\n}\n");
    }

    #[test]
    fn method_targets_duplicate_the_enclosing_class() {
        let snapshot = parse_module(
            "class Counter {\n    fn bump(self) {\n        return 1;\n    }\n}\n",
        )
        .expect("parse");
        let twin = synthesize(&snapshot, "Counter.bump").expect("synthesize");
        assert!(twin.starts_with("class reference_Counter {"));
        assert!(twin.contains("fn bump(self)"));
    }

    #[test]
    fn recursive_twin_calls_itself() {
        let snapshot = parse_module(
            "fn fact(n) {\n    if n <= 1 {\n        return 1;\n    }\n    return n * fact(n - 1);\n}\n",
        )
        .expect("parse");
        let twin = synthesize(&snapshot, "fact").expect("synthesize");
        assert!(twin.contains("return n * reference_fact(n - 1);"));
    }

    #[test]
    fn missing_entity_is_reported() {
        let snapshot = parse_module("fn add(a, b) {\n    return a + b;\n}\n").expect("parse");
        let err = synthesize(&snapshot, "missing").expect_err("must fail");
        assert!(matches!(err, EngineError::EntityNotFound(name) if name == "missing"));
    }

    #[test]
    fn synthesis_is_deterministic() {
        let snapshot = parse_module("fn add(a, b) {\n    return a + b;\n}\n").expect("parse");
        let names = vec!["add".to_string()];
        let first = ReferenceSet::synthesize_all(&snapshot, &names).expect("synthesize");
        let second = ReferenceSet::synthesize_all(&snapshot, &names).expect("synthesize");
        assert_eq!(first.sources, second.sources);
        assert_eq!(first.content_hash, second.content_hash);
        first.verify_against(&snapshot, &names).expect("verify");
    }
}
