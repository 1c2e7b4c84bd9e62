//! Canonical syntax tree for the `.sc` scripting language.
//!
//! The parser in `parser.rs` emits this representation; the transformer,
//! normalizer, and reference synthesizer rewrite it; `unparse.rs` renders it
//! back to deterministic source text.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One-based line range of a node in its source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSpan {
    pub start_line: u32,
    pub end_line: u32,
}

impl LineSpan {
    pub fn new(start_line: u32, end_line: u32) -> Self {
        Self {
            start_line,
            end_line,
        }
    }

    pub fn contains(&self, line: u32) -> bool {
        self.start_line <= line && line <= self.end_line
    }
}

/// Parsed module: top-level statements plus the lines carrying a `# nocov`
/// marker, which the coverage collector treats as excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub body: Vec<Stmt>,
    pub excluded_lines: BTreeSet<u32>,
}

impl Module {
    pub fn new(body: Vec<Stmt>) -> Self {
        Self {
            body,
            excluded_lines: BTreeSet::new(),
        }
    }

    /// Locate a top-level function or class definition by name.
    pub fn find_definition(&self, name: &str) -> Option<&Stmt> {
        self.body.iter().find(|stmt| match stmt {
            Stmt::Fn(def) => def.name == name,
            Stmt::Class(def) => def.name == name,
            _ => false,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStmt {
    pub module: String,
    pub alias: Option<String>,
    pub span: LineSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FromImportStmt {
    pub module: String,
    pub name: String,
    pub alias: Option<String>,
    pub span: LineSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

impl Param {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FnDef {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub span: LineSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub methods: Vec<FnDef>,
    pub span: LineSpan,
}

impl ClassDef {
    pub fn find_method(&self, name: &str) -> Option<&FnDef> {
        self.methods.iter().find(|m| m.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfStmt {
    pub cond: Expr,
    pub then_body: Vec<Stmt>,
    /// Empty when there is no `else`; a single nested `If` models `else if`.
    pub else_body: Vec<Stmt>,
    pub span: LineSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhileStmt {
    pub cond: Expr,
    pub body: Vec<Stmt>,
    pub span: LineSpan,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AssignTarget {
    Name(String),
    Attr { object: Expr, name: String },
    Index { object: Expr, index: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Import(ImportStmt),
    FromImport(FromImportStmt),
    Fn(FnDef),
    Class(ClassDef),
    Let {
        name: String,
        value: Expr,
        span: LineSpan,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
        span: LineSpan,
    },
    Return {
        value: Option<Expr>,
        span: LineSpan,
    },
    If(IfStmt),
    While(WhileStmt),
    Pass {
        span: LineSpan,
    },
    Expr {
        value: Expr,
        span: LineSpan,
    },
}

impl Stmt {
    pub fn span(&self) -> LineSpan {
        match self {
            Self::Import(s) => s.span,
            Self::FromImport(s) => s.span,
            Self::Fn(s) => s.span,
            Self::Class(s) => s.span,
            Self::Let { span, .. } => *span,
            Self::Assign { span, .. } => *span,
            Self::Return { span, .. } => *span,
            Self::If(s) => s.span,
            Self::While(s) => s.span,
            Self::Pass { span } => *span,
            Self::Expr { span, .. } => *span,
        }
    }

    /// Name introduced by this statement at its own scope level, if any.
    pub fn binding_name(&self) -> Option<&str> {
        match self {
            Self::Import(s) => Some(s.alias.as_deref().unwrap_or(&s.module)),
            Self::FromImport(s) => Some(s.alias.as_deref().unwrap_or(&s.name)),
            Self::Fn(def) => Some(&def.name),
            Self::Class(def) => Some(&def.name),
            Self::Let { name, .. } => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Neg,
    Not,
}

impl UnaryOp {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Neg => "-",
            Self::Not => "!",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Expr>),
    Name(String),
    Attr {
        object: Box<Expr>,
        name: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Lambda {
        params: Vec<Param>,
        body: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
}
