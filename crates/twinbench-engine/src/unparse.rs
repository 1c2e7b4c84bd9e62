//! Deterministic source printer for the `.sc` syntax tree.
//!
//! The reference-twin invariant leans on this module: unparsing the same
//! tree twice must yield byte-identical text, so formatting here is fixed
//! (4-space indent, single spaces around binary operators, `;` terminators)
//! and carries no information from the original token layout.

use std::fmt::Write as _;

use crate::ast::{
    AssignTarget, BinaryOp, ClassDef, Expr, FnDef, Module, Param, Stmt, UnaryOp,
};

const INDENT: &str = "    ";

/// Render a full module.
pub fn unparse_module(module: &Module) -> String {
    let mut out = String::new();
    for stmt in &module.body {
        write_stmt(&mut out, stmt, 0);
    }
    out
}

/// Render a single statement at top level (used for reference-twin sources).
pub fn unparse_stmt(stmt: &Stmt) -> String {
    let mut out = String::new();
    write_stmt(&mut out, stmt, 0);
    out
}

/// Render an expression (used by the closure serializer).
pub fn unparse_expr(expr: &Expr) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr, 0);
    out
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str(INDENT);
    }
}

fn write_stmt(out: &mut String, stmt: &Stmt, depth: usize) {
    match stmt {
        Stmt::Import(s) => {
            indent(out, depth);
            match &s.alias {
                Some(alias) => {
                    let _ = writeln!(out, "import {} as {};", s.module, alias);
                }
                None => {
                    let _ = writeln!(out, "import {};", s.module);
                }
            }
        }
        Stmt::FromImport(s) => {
            indent(out, depth);
            match &s.alias {
                Some(alias) => {
                    let _ = writeln!(out, "from {} import {} as {};", s.module, s.name, alias);
                }
                None => {
                    let _ = writeln!(out, "from {} import {};", s.module, s.name);
                }
            }
        }
        Stmt::Fn(def) => write_fn(out, def, depth),
        Stmt::Class(def) => write_class(out, def, depth),
        Stmt::Let { name, value, .. } => {
            indent(out, depth);
            out.push_str("let ");
            out.push_str(name);
            out.push_str(" = ");
            write_expr(out, value, 0);
            out.push_str(";\n");
        }
        Stmt::Assign { target, value, .. } => {
            indent(out, depth);
            match target {
                AssignTarget::Name(name) => out.push_str(name),
                AssignTarget::Attr { object, name } => {
                    write_expr(out, object, PREC_POSTFIX);
                    out.push('.');
                    out.push_str(name);
                }
                AssignTarget::Index { object, index } => {
                    write_expr(out, object, PREC_POSTFIX);
                    out.push('[');
                    write_expr(out, index, 0);
                    out.push(']');
                }
            }
            out.push_str(" = ");
            write_expr(out, value, 0);
            out.push_str(";\n");
        }
        Stmt::Return { value, .. } => {
            indent(out, depth);
            match value {
                Some(expr) => {
                    out.push_str("return ");
                    write_expr(out, expr, 0);
                    out.push_str(";\n");
                }
                None => out.push_str("return;\n"),
            }
        }
        Stmt::If(s) => {
            indent(out, depth);
            out.push_str("if ");
            write_expr(out, &s.cond, 0);
            out.push_str(" {\n");
            for inner in &s.then_body {
                write_stmt(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push('}');
            write_else(out, &s.else_body, depth);
            out.push('\n');
        }
        Stmt::While(s) => {
            indent(out, depth);
            out.push_str("while ");
            write_expr(out, &s.cond, 0);
            out.push_str(" {\n");
            for inner in &s.body {
                write_stmt(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push_str("}\n");
        }
        Stmt::Pass { .. } => {
            indent(out, depth);
            out.push_str("pass;\n");
        }
        Stmt::Expr { value, .. } => {
            indent(out, depth);
            write_expr(out, value, 0);
            out.push_str(";\n");
        }
    }
}

fn write_else(out: &mut String, else_body: &[Stmt], depth: usize) {
    if else_body.is_empty() {
        return;
    }
    // A single nested `if` re-sugars to `else if`.
    if else_body.len() == 1 {
        if let Stmt::If(nested) = &else_body[0] {
            out.push_str(" else if ");
            write_expr(out, &nested.cond, 0);
            out.push_str(" {\n");
            for inner in &nested.then_body {
                write_stmt(out, inner, depth + 1);
            }
            indent(out, depth);
            out.push('}');
            write_else(out, &nested.else_body, depth);
            return;
        }
    }
    out.push_str(" else {\n");
    for inner in else_body {
        write_stmt(out, inner, depth + 1);
    }
    indent(out, depth);
    out.push('}');
}

fn write_fn(out: &mut String, def: &FnDef, depth: usize) {
    indent(out, depth);
    out.push_str("fn ");
    out.push_str(&def.name);
    write_params(out, &def.params);
    out.push_str(" {\n");
    for inner in &def.body {
        write_stmt(out, inner, depth + 1);
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn write_class(out: &mut String, def: &ClassDef, depth: usize) {
    indent(out, depth);
    out.push_str("class ");
    out.push_str(&def.name);
    out.push_str(" {\n");
    for method in &def.methods {
        write_fn(out, method, depth + 1);
    }
    indent(out, depth);
    out.push_str("}\n");
}

fn write_params(out: &mut String, params: &[Param]) {
    out.push('(');
    for (index, param) in params.iter().enumerate() {
        if index > 0 {
            out.push_str(", ");
        }
        out.push_str(&param.name);
        if let Some(default) = &param.default {
            out.push_str(" = ");
            write_expr(out, default, 0);
        }
    }
    out.push(')');
}

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_EQ: u8 = 3;
const PREC_CMP: u8 = 4;
const PREC_ADD: u8 = 5;
const PREC_MUL: u8 = 6;
const PREC_UNARY: u8 = 7;
const PREC_POSTFIX: u8 = 8;
const PREC_PRIMARY: u8 = 9;

fn binary_prec(op: BinaryOp) -> u8 {
    match op {
        BinaryOp::Or => PREC_OR,
        BinaryOp::And => PREC_AND,
        BinaryOp::Eq | BinaryOp::Ne => PREC_EQ,
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => PREC_CMP,
        BinaryOp::Add | BinaryOp::Sub => PREC_ADD,
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => PREC_MUL,
    }
}

fn expr_prec(expr: &Expr) -> u8 {
    match expr {
        Expr::Lambda { .. } => 0,
        Expr::Binary { op, .. } => binary_prec(*op),
        Expr::Unary { .. } => PREC_UNARY,
        Expr::Call { .. } | Expr::Attr { .. } | Expr::Index { .. } => PREC_POSTFIX,
        _ => PREC_PRIMARY,
    }
}

fn write_expr(out: &mut String, expr: &Expr, min_prec: u8) {
    let prec = expr_prec(expr);
    let needs_parens = prec < min_prec;
    if needs_parens {
        out.push('(');
    }
    match expr {
        Expr::Null => out.push_str("null"),
        Expr::Bool(true) => out.push_str("true"),
        Expr::Bool(false) => out.push_str("false"),
        Expr::Int(value) => {
            let _ = write!(out, "{value}");
        }
        Expr::Float(value) => {
            let _ = write!(out, "{value:?}");
        }
        Expr::Str(value) => write_str_literal(out, value),
        Expr::List(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_expr(out, item, 0);
            }
            out.push(']');
        }
        Expr::Name(name) => out.push_str(name),
        Expr::Attr { object, name } => {
            write_expr(out, object, PREC_POSTFIX);
            out.push('.');
            out.push_str(name);
        }
        Expr::Index { object, index } => {
            write_expr(out, object, PREC_POSTFIX);
            out.push('[');
            write_expr(out, index, 0);
            out.push(']');
        }
        Expr::Call { callee, args } => {
            write_expr(out, callee, PREC_POSTFIX);
            out.push('(');
            for (index, arg) in args.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_expr(out, arg, 0);
            }
            out.push(')');
        }
        Expr::Lambda { params, body } => {
            out.push('|');
            for (index, param) in params.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                out.push_str(&param.name);
            }
            out.push_str("| ");
            write_expr(out, body, 0);
        }
        Expr::Binary { op, left, right } => {
            let prec = binary_prec(*op);
            write_expr(out, left, prec);
            out.push(' ');
            out.push_str(op.as_str());
            out.push(' ');
            write_expr(out, right, prec + 1);
        }
        Expr::Unary { op, operand } => {
            out.push_str(op.as_str());
            write_expr(out, operand, PREC_UNARY);
        }
    }
    if needs_parens {
        out.push(')');
    }
}

fn write_str_literal(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out.push('"');
}
