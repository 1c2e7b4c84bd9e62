//! Narrow, composable rewrites over the `.sc` syntax tree.
//!
//! These are the building blocks shared by the reference synthesizer and the
//! test normalizer: binder renaming, import-alias canonicalization, and the
//! structural drop operations used for staged cleanup. Feeding an empty or
//! non-definition tree into them is a programming error and panics.

use std::collections::BTreeMap;

use crate::ast::{AssignTarget, ClassDef, Expr, FnDef, Module, Stmt};

/// Rename a defining name and every same-scope reference to it inside the
/// definition's own body, including recursive self-calls. References bound
/// by a nested scope's own parameters or `let` bindings are left alone.
///
/// `stmt` must be a top-level `fn` or `class` definition.
pub fn rename_binder(stmt: &mut Stmt, old: &str, new: &str) {
    assert!(!old.is_empty() && !new.is_empty(), "empty binder name");
    match stmt {
        Stmt::Fn(def) => {
            if def.name == old {
                def.name = new.to_string();
            }
            rename_in_fn_body(def, old, new);
        }
        Stmt::Class(def) => {
            if def.name == old {
                def.name = new.to_string();
            }
            for method in &mut def.methods {
                rename_in_fn_body(method, old, new);
            }
        }
        other => panic!("rename_binder applied to a non-definition statement: {other:?}"),
    }
}

fn fn_rebinds(def: &FnDef, name: &str) -> bool {
    def.params.iter().any(|p| p.name == name)
        || def.body.iter().any(|s| s.binding_name() == Some(name))
}

fn rename_in_fn_body(def: &mut FnDef, old: &str, new: &str) {
    if fn_rebinds(def, old) {
        return;
    }
    rename_in_stmts(&mut def.body, old, new);
}

fn rename_in_stmts(stmts: &mut [Stmt], old: &str, new: &str) {
    for stmt in stmts {
        match stmt {
            Stmt::Fn(def) => rename_in_fn_body(def, old, new),
            Stmt::Class(def) => {
                for method in &mut def.methods {
                    rename_in_fn_body(method, old, new);
                }
            }
            Stmt::Let { value, .. } => rename_in_expr(value, old, new),
            Stmt::Assign { target, value, .. } => {
                match target {
                    AssignTarget::Name(name) => {
                        if name == old {
                            *name = new.to_string();
                        }
                    }
                    AssignTarget::Attr { object, .. } => rename_in_expr(object, old, new),
                    AssignTarget::Index { object, index } => {
                        rename_in_expr(object, old, new);
                        rename_in_expr(index, old, new);
                    }
                }
                rename_in_expr(value, old, new);
            }
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    rename_in_expr(expr, old, new);
                }
            }
            Stmt::If(s) => {
                rename_in_expr(&mut s.cond, old, new);
                rename_in_stmts(&mut s.then_body, old, new);
                rename_in_stmts(&mut s.else_body, old, new);
            }
            Stmt::While(s) => {
                rename_in_expr(&mut s.cond, old, new);
                rename_in_stmts(&mut s.body, old, new);
            }
            Stmt::Expr { value, .. } => rename_in_expr(value, old, new),
            Stmt::Import(_) | Stmt::FromImport(_) | Stmt::Pass { .. } => {}
        }
    }
}

fn rename_in_expr(expr: &mut Expr, old: &str, new: &str) {
    match expr {
        Expr::Name(name) => {
            if name == old {
                *name = new.to_string();
            }
        }
        Expr::Attr { object, .. } => rename_in_expr(object, old, new),
        Expr::Index { object, index } => {
            rename_in_expr(object, old, new);
            rename_in_expr(index, old, new);
        }
        Expr::Call { callee, args } => {
            rename_in_expr(callee, old, new);
            for arg in args {
                rename_in_expr(arg, old, new);
            }
        }
        Expr::Lambda { params, body } => {
            if params.iter().any(|p| p.name == old) {
                return;
            }
            rename_in_expr(body, old, new);
        }
        Expr::Binary { left, right, .. } => {
            rename_in_expr(left, old, new);
            rename_in_expr(right, old, new);
        }
        Expr::Unary { operand, .. } => rename_in_expr(operand, old, new),
        Expr::List(items) => {
            for item in items {
                rename_in_expr(item, old, new);
            }
        }
        Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
    }
}

/// Detect top-level imports that bind a protected canonical name under an
/// alias, and rewrite every use of the alias back to the canonical name.
/// Returns the alias map that was applied.
pub fn canonicalize_aliases(module: &mut Module, protected: &[&str]) -> BTreeMap<String, String> {
    let mut aliases = BTreeMap::new();
    for stmt in &module.body {
        match stmt {
            Stmt::Import(s) => {
                if let Some(alias) = &s.alias {
                    if protected.contains(&s.module.as_str())
                        && !protected.contains(&alias.as_str())
                    {
                        aliases.insert(alias.clone(), s.module.clone());
                    }
                }
            }
            Stmt::FromImport(s) => {
                if let Some(alias) = &s.alias {
                    if protected.contains(&s.name.as_str()) && !protected.contains(&alias.as_str())
                    {
                        aliases.insert(alias.clone(), s.name.clone());
                    }
                }
            }
            _ => {}
        }
    }
    if !aliases.is_empty() {
        replace_names_in_stmts(&mut module.body, &aliases);
    }
    aliases
}

fn replace_names_in_stmts(stmts: &mut [Stmt], map: &BTreeMap<String, String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Fn(def) => replace_names_in_stmts(&mut def.body, map),
            Stmt::Class(def) => {
                for method in &mut def.methods {
                    replace_names_in_stmts(&mut method.body, map);
                }
            }
            Stmt::Let { value, .. } => replace_names_in_expr(value, map),
            Stmt::Assign { target, value, .. } => {
                match target {
                    AssignTarget::Name(name) => {
                        if let Some(canonical) = map.get(name) {
                            *name = canonical.clone();
                        }
                    }
                    AssignTarget::Attr { object, .. } => replace_names_in_expr(object, map),
                    AssignTarget::Index { object, index } => {
                        replace_names_in_expr(object, map);
                        replace_names_in_expr(index, map);
                    }
                }
                replace_names_in_expr(value, map);
            }
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    replace_names_in_expr(expr, map);
                }
            }
            Stmt::If(s) => {
                replace_names_in_expr(&mut s.cond, map);
                replace_names_in_stmts(&mut s.then_body, map);
                replace_names_in_stmts(&mut s.else_body, map);
            }
            Stmt::While(s) => {
                replace_names_in_expr(&mut s.cond, map);
                replace_names_in_stmts(&mut s.body, map);
            }
            Stmt::Expr { value, .. } => replace_names_in_expr(value, map),
            Stmt::Import(_) | Stmt::FromImport(_) | Stmt::Pass { .. } => {}
        }
    }
}

fn replace_names_in_expr(expr: &mut Expr, map: &BTreeMap<String, String>) {
    match expr {
        Expr::Name(name) => {
            if let Some(canonical) = map.get(name) {
                *name = canonical.clone();
            }
        }
        Expr::Attr { object, .. } => replace_names_in_expr(object, map),
        Expr::Index { object, index } => {
            replace_names_in_expr(object, map);
            replace_names_in_expr(index, map);
        }
        Expr::Call { callee, args } => {
            replace_names_in_expr(callee, map);
            for arg in args {
                replace_names_in_expr(arg, map);
            }
        }
        Expr::Lambda { body, .. } => replace_names_in_expr(body, map),
        Expr::Binary { left, right, .. } => {
            replace_names_in_expr(left, map);
            replace_names_in_expr(right, map);
        }
        Expr::Unary { operand, .. } => replace_names_in_expr(operand, map),
        Expr::List(items) => {
            for item in items {
                replace_names_in_expr(item, map);
            }
        }
        Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Float(_) | Expr::Str(_) => {}
    }
}

/// Drop the last top-level statement. When the last statement is a class,
/// its last member is removed instead of the class itself; a class left
/// without members is removed whole. Panics on an empty module.
pub fn drop_last_top_level(module: &mut Module) {
    let last = module
        .body
        .last_mut()
        .unwrap_or_else(|| panic!("drop_last_top_level on an empty module"));
    if let Stmt::Class(ClassDef { methods, .. }) = last {
        if !methods.is_empty() {
            methods.pop();
            return;
        }
    }
    module.body.pop();
}

/// Remove every top-level function definition with the given name.
pub fn drop_named_fn(module: &mut Module, name: &str) {
    module
        .body
        .retain(|stmt| !matches!(stmt, Stmt::Fn(def) if def.name == name));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_module;
    use crate::unparse::{unparse_module, unparse_stmt};

    fn parse_first(source: &str) -> Stmt {
        parse_module(source).expect("parse").body.remove(0)
    }

    #[test]
    fn renames_declaration_and_recursive_call() {
        let mut stmt = parse_first(
            "fn fact(n) {\n    if n <= 1 {\n        return 1;\n    }\n    return n * fact(n - 1);\n}\n",
        );
        rename_binder(&mut stmt, "fact", "reference_fact");
        let rendered = unparse_stmt(&stmt);
        assert!(rendered.starts_with("fn reference_fact(n)"));
        assert!(rendered.contains("reference_fact(n - 1)"));
        assert!(!rendered.contains(" fact("));
    }

    #[test]
    fn does_not_rename_nested_scope_locals() {
        let mut stmt = parse_first(
            "fn outer() {\n    let g = |outer| outer + 1;\n    return g(outer());\n}\n",
        );
        rename_binder(&mut stmt, "outer", "reference_outer");
        let rendered = unparse_stmt(&stmt);
        // The lambda's own parameter keeps its name; the recursive call is renamed.
        assert!(rendered.contains("|outer| outer + 1"));
        assert!(rendered.contains("g(reference_outer())"));
    }

    #[test]
    fn does_not_rename_lexically_similar_names() {
        let mut stmt = parse_first("fn add(a) {\n    return add_all(a) + adder;\n}\n");
        rename_binder(&mut stmt, "add", "reference_add");
        let rendered = unparse_stmt(&stmt);
        assert!(rendered.contains("add_all(a)"));
        assert!(rendered.contains("adder"));
    }

    #[test]
    fn renames_class_references_in_methods() {
        let mut stmt = parse_first(
            "class Counter {\n    fn clone(self) {\n        return Counter(self.count);\n    }\n}\n",
        );
        rename_binder(&mut stmt, "Counter", "reference_Counter");
        let rendered = unparse_stmt(&stmt);
        assert!(rendered.starts_with("class reference_Counter"));
        assert!(rendered.contains("return reference_Counter(self.count);"));
    }

    #[test]
    fn shadowed_body_is_left_alone() {
        let mut stmt = parse_first("fn f() {\n    let f = 1;\n    return f;\n}\n");
        rename_binder(&mut stmt, "f", "reference_f");
        let rendered = unparse_stmt(&stmt);
        assert!(rendered.starts_with("fn reference_f()"));
        assert!(rendered.contains("let f = 1;"));
        assert!(rendered.contains("return f;"));
    }

    #[test]
    #[should_panic(expected = "non-definition")]
    fn rename_rejects_non_definition() {
        let mut stmt = parse_first("let x = 1;\n");
        rename_binder(&mut stmt, "x", "y");
    }

    #[test]
    fn canonicalizes_import_aliases() {
        let mut module = parse_module(
            "from target_module import add as aliased;\nimport helpers as h;\nlet r = aliased(1, 2);\nlet s = h.twice(2);\n",
        )
        .expect("parse");
        let applied = canonicalize_aliases(&mut module, &["add", "reference_add"]);
        assert_eq!(applied.get("aliased").map(String::as_str), Some("add"));
        let rendered = unparse_module(&module);
        assert!(rendered.contains("let r = add(1, 2);"));
        // Unprotected aliases are untouched.
        assert!(rendered.contains("h.twice(2)"));
    }

    #[test]
    fn drop_last_pops_statement_or_class_member() {
        let mut module =
            parse_module("let a = 1;\nclass C {\n    fn one(self) {\n        return 1;\n    }\n    fn two(self) {\n        return 2;\n    }\n}\n")
                .expect("parse");
        drop_last_top_level(&mut module);
        match &module.body[1] {
            Stmt::Class(def) => assert_eq!(def.methods.len(), 1),
            other => panic!("expected class, got {other:?}"),
        }
        drop_last_top_level(&mut module);
        match &module.body[1] {
            Stmt::Class(def) => assert!(def.methods.is_empty()),
            other => panic!("expected class, got {other:?}"),
        }
        drop_last_top_level(&mut module);
        assert_eq!(module.body.len(), 1);
    }

    #[test]
    #[should_panic(expected = "empty module")]
    fn drop_last_panics_on_empty_module() {
        let mut module = Module::new(Vec::new());
        drop_last_top_level(&mut module);
    }

    #[test]
    fn drop_named_fn_is_top_level_only() {
        let mut module = parse_module(
            "fn gone() {\n    return 1;\n}\nfn keeper() {\n    fn gone() {\n        return 2;\n    }\n    return gone();\n}\n",
        )
        .expect("parse");
        drop_named_fn(&mut module, "gone");
        assert_eq!(module.body.len(), 1);
        let rendered = unparse_module(&module);
        assert!(rendered.contains("fn keeper()"));
        assert!(rendered.contains("    fn gone()"));
    }
}
