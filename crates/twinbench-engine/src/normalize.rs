//! Normalization of raw generated test source.
//!
//! Generated tests routinely import the entity under test under an alias,
//! re-declare it locally, or end with a run-as-script invocation. This pass
//! rewrites them so every reference goes through the canonical names bound
//! in the evaluation namespace, and is idempotent on already-clean source.

use crate::ast::{Module, Stmt};
use crate::parser::{parse_module, ParseError};
use crate::transform::canonicalize_aliases;
use crate::unparse::unparse_module;

/// Fixed name of the synthetic module the target file is loaded as.
pub const MODULE_MARKER: &str = "target_module";

/// Legacy namespace prefixes still emitted by older test generators.
const LEGACY_MODULE_PREFIXES: [&str; 2] = ["your_module.", "original_module."];

/// Run-as-script invocation that becomes a no-op inside the harness.
const RUN_INVOCATION: &str = "run_tests()";

/// Clean one generated test so it can run against `target_name` and
/// `reference_name` as bound in the evaluation namespace.
pub fn normalize_test_source(
    source: &str,
    target_name: &str,
    reference_name: &str,
) -> Result<String, ParseError> {
    let mut module = parse_module(source)?;
    canonicalize_aliases(&mut module, &[target_name, reference_name]);
    drop_conflicting_statements(&mut module, target_name, reference_name);
    let mut text = unparse_module(&module);
    text = text.replace(RUN_INVOCATION, "pass");
    for prefix in LEGACY_MODULE_PREFIXES {
        text = text.replace(prefix, &format!("{MODULE_MARKER}."));
    }
    Ok(text)
}

fn drop_conflicting_statements(module: &mut Module, target_name: &str, reference_name: &str) {
    let protected = [target_name, reference_name];
    module.body.retain(|stmt| match stmt {
        Stmt::Import(s) => {
            let bound = s.alias.as_deref().unwrap_or(&s.module);
            !protected.contains(&s.module.as_str()) && !protected.contains(&bound)
        }
        Stmt::FromImport(s) => {
            if s.module.contains(MODULE_MARKER) || protected.contains(&s.module.as_str()) {
                return false;
            }
            let bound = s.alias.as_deref().unwrap_or(&s.name);
            !protected.contains(&s.name.as_str()) && !protected.contains(&bound)
        }
        Stmt::Fn(def) => !protected.contains(&def.name.as_str()),
        Stmt::Class(def) => !protected.contains(&def.name.as_str()),
        _ => true,
    });
}
