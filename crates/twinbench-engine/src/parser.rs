//! Recursive-descent parser for the `.sc` scripting language.
//!
//! Emits the canonical tree from `crate::ast`. Imports are only legal at
//! module top level, which keeps the normalizer's structural drop rules and
//! the environment's dependency resolution strictly module-scoped.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ast::{
    AssignTarget, BinaryOp, ClassDef, Expr, FnDef, FromImportStmt, IfStmt, ImportStmt, LineSpan,
    Module, Param, Stmt, UnaryOp, WhileStmt,
};
use crate::lexer::{tokenize, Token, TokenKind};

pub type ParseResult<T> = Result<T, ParseError>;

/// Stable parse error codes for deterministic diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseErrorCode {
    UnterminatedString,
    InvalidEscape,
    InvalidNumber,
    UnexpectedCharacter,
    UnexpectedToken,
    ImportNotTopLevel,
    InvalidAssignTarget,
    DuplicateParameter,
}

/// Parse error envelope with one-based source position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseError {
    pub code: ParseErrorCode,
    pub message: String,
    pub source_label: String,
    pub line: u32,
    pub column: u32,
}

impl ParseError {
    pub fn new(
        code: ParseErrorCode,
        message: impl Into<String>,
        source_label: impl Into<String>,
        line: u32,
        column: u32,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source_label: source_label.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {} (source={}, line={}, column={})",
            self.code, self.message, self.source_label, self.line, self.column
        )
    }
}

impl std::error::Error for ParseError {}

/// Parse a full module from source text.
pub fn parse_module(source: &str) -> ParseResult<Module> {
    let stream = tokenize(source)?;
    let mut parser = Parser {
        tokens: stream.tokens,
        pos: 0,
    };
    let mut body = Vec::new();
    while !parser.at(&TokenKind::Eof) {
        body.push(parser.parse_stmt(true)?);
    }
    let mut module = Module::new(body);
    module.excluded_lines = stream.excluded_lines;
    Ok(module)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        // The stream always ends with Eof, so `pos` stays in range.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn at(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn prev_line(&self) -> u32 {
        if self.pos == 0 {
            return 1;
        }
        self.tokens[self.pos - 1].line
    }

    fn error_here(&self, code: ParseErrorCode, message: impl Into<String>) -> ParseError {
        let token = self.peek();
        ParseError::new(code, message, "<inline>", token.line, token.column)
    }

    fn expect(&mut self, kind: TokenKind, context: &str) -> ParseResult<Token> {
        if self.at(&kind) {
            Ok(self.advance())
        } else {
            Err(self.error_here(
                ParseErrorCode::UnexpectedToken,
                format!(
                    "expected {} {context}, found {}",
                    kind.describe(),
                    self.peek().kind.describe()
                ),
            ))
        }
    }

    fn expect_ident(&mut self, context: &str) -> ParseResult<(String, u32)> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok((name, token.line))
            }
            other => Err(self.error_here(
                ParseErrorCode::UnexpectedToken,
                format!("expected identifier {context}, found {}", other.describe()),
            )),
        }
    }

    fn parse_stmt(&mut self, top_level: bool) -> ParseResult<Stmt> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Import | TokenKind::From if !top_level => Err(self.error_here(
                ParseErrorCode::ImportNotTopLevel,
                "import statements are only allowed at module top level",
            )),
            TokenKind::Import => self.parse_import(),
            TokenKind::From => self.parse_from_import(),
            TokenKind::Fn => Ok(Stmt::Fn(self.parse_fn_def()?)),
            TokenKind::Class => self.parse_class(),
            TokenKind::Let => self.parse_let(),
            TokenKind::Return => self.parse_return(),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Pass => {
                let start = self.advance().line;
                self.expect(TokenKind::Semicolon, "after `pass`")?;
                Ok(Stmt::Pass {
                    span: LineSpan::new(start, start),
                })
            }
            _ => self.parse_expr_or_assign(),
        }
    }

    fn parse_import(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line;
        let (module, _) = self.expect_ident("after `import`")?;
        let alias = if self.at(&TokenKind::As) {
            self.advance();
            Some(self.expect_ident("after `as`")?.0)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "after import statement")?;
        Ok(Stmt::Import(ImportStmt {
            module,
            alias,
            span: LineSpan::new(start, self.prev_line()),
        }))
    }

    fn parse_from_import(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line;
        let (module, _) = self.expect_ident("after `from`")?;
        self.expect(TokenKind::Import, "in from-import statement")?;
        let (name, _) = self.expect_ident("after `import`")?;
        let alias = if self.at(&TokenKind::As) {
            self.advance();
            Some(self.expect_ident("after `as`")?.0)
        } else {
            None
        };
        self.expect(TokenKind::Semicolon, "after import statement")?;
        Ok(Stmt::FromImport(FromImportStmt {
            module,
            name,
            alias,
            span: LineSpan::new(start, self.prev_line()),
        }))
    }

    fn parse_fn_def(&mut self) -> ParseResult<FnDef> {
        let start = self.advance().line; // `fn`
        let (name, _) = self.expect_ident("after `fn`")?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(FnDef {
            name,
            params,
            body,
            span: LineSpan::new(start, self.prev_line()),
        })
    }

    fn parse_params(&mut self) -> ParseResult<Vec<Param>> {
        self.expect(TokenKind::LParen, "to open the parameter list")?;
        let mut params: Vec<Param> = Vec::new();
        while !self.at(&TokenKind::RParen) {
            let (name, _) = self.expect_ident("as a parameter name")?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error_here(
                    ParseErrorCode::DuplicateParameter,
                    format!("duplicate parameter `{name}`"),
                ));
            }
            let default = if self.at(&TokenKind::Assign) {
                self.advance();
                Some(self.parse_expr()?)
            } else {
                None
            };
            params.push(Param { name, default });
            if self.at(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::RParen, "to close the parameter list")?;
        Ok(params)
    }

    fn parse_class(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line; // `class`
        let (name, _) = self.expect_ident("after `class`")?;
        self.expect(TokenKind::LBrace, "to open the class body")?;
        let mut methods = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            if !self.at(&TokenKind::Fn) {
                return Err(self.error_here(
                    ParseErrorCode::UnexpectedToken,
                    "class bodies may only contain `fn` definitions",
                ));
            }
            methods.push(self.parse_fn_def()?);
        }
        self.expect(TokenKind::RBrace, "to close the class body")?;
        Ok(Stmt::Class(ClassDef {
            name,
            methods,
            span: LineSpan::new(start, self.prev_line()),
        }))
    }

    fn parse_block(&mut self) -> ParseResult<Vec<Stmt>> {
        self.expect(TokenKind::LBrace, "to open a block")?;
        let mut body = Vec::new();
        while !self.at(&TokenKind::RBrace) {
            body.push(self.parse_stmt(false)?);
        }
        self.expect(TokenKind::RBrace, "to close a block")?;
        Ok(body)
    }

    fn parse_let(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line; // `let`
        let (name, _) = self.expect_ident("after `let`")?;
        self.expect(TokenKind::Assign, "in let statement")?;
        let value = self.parse_expr()?;
        self.expect(TokenKind::Semicolon, "after let statement")?;
        Ok(Stmt::Let {
            name,
            value,
            span: LineSpan::new(start, self.prev_line()),
        })
    }

    fn parse_return(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line; // `return`
        let value = if self.at(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(TokenKind::Semicolon, "after return statement")?;
        Ok(Stmt::Return {
            value,
            span: LineSpan::new(start, self.prev_line()),
        })
    }

    fn parse_if(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line; // `if`
        let cond = self.parse_expr()?;
        let then_body = self.parse_block()?;
        let else_body = if self.at(&TokenKind::Else) {
            self.advance();
            if self.at(&TokenKind::If) {
                vec![self.parse_if()?]
            } else {
                self.parse_block()?
            }
        } else {
            Vec::new()
        };
        Ok(Stmt::If(IfStmt {
            cond,
            then_body,
            else_body,
            span: LineSpan::new(start, self.prev_line()),
        }))
    }

    fn parse_while(&mut self) -> ParseResult<Stmt> {
        let start = self.advance().line; // `while`
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::While(WhileStmt {
            cond,
            body,
            span: LineSpan::new(start, self.prev_line()),
        }))
    }

    fn parse_expr_or_assign(&mut self) -> ParseResult<Stmt> {
        let start = self.peek().line;
        let expr = self.parse_expr()?;
        if self.at(&TokenKind::Assign) {
            self.advance();
            let target = match expr {
                Expr::Name(name) => AssignTarget::Name(name),
                Expr::Attr { object, name } => AssignTarget::Attr {
                    object: *object,
                    name,
                },
                Expr::Index { object, index } => AssignTarget::Index {
                    object: *object,
                    index: *index,
                },
                _ => {
                    return Err(self.error_here(
                        ParseErrorCode::InvalidAssignTarget,
                        "assignment target must be a name, attribute, or index",
                    ));
                }
            };
            let value = self.parse_expr()?;
            self.expect(TokenKind::Semicolon, "after assignment")?;
            return Ok(Stmt::Assign {
                target,
                value,
                span: LineSpan::new(start, self.prev_line()),
            });
        }
        self.expect(TokenKind::Semicolon, "after expression statement")?;
        Ok(Stmt::Expr {
            value: expr,
            span: LineSpan::new(start, self.prev_line()),
        })
    }

    // expressions, lowest precedence first

    fn parse_expr(&mut self) -> ParseResult<Expr> {
        if self.at(&TokenKind::Pipe) {
            return self.parse_lambda();
        }
        // `||` in expression position is an empty parameter list, since the
        // lexer cannot tell it apart from the logical-or operator.
        if self.at(&TokenKind::OrOr) {
            self.advance();
            let body = self.parse_expr()?;
            return Ok(Expr::Lambda {
                params: Vec::new(),
                body: Box::new(body),
            });
        }
        self.parse_or()
    }

    fn parse_lambda(&mut self) -> ParseResult<Expr> {
        self.advance(); // `|`
        let mut params: Vec<Param> = Vec::new();
        while !self.at(&TokenKind::Pipe) {
            let (name, _) = self.expect_ident("as a lambda parameter")?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error_here(
                    ParseErrorCode::DuplicateParameter,
                    format!("duplicate parameter `{name}`"),
                ));
            }
            params.push(Param::required(name));
            if self.at(&TokenKind::Comma) {
                self.advance();
            } else {
                break;
            }
        }
        self.expect(TokenKind::Pipe, "to close the lambda parameter list")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }

    fn parse_or(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_and()?;
        while self.at(&TokenKind::OrOr) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_equality()?;
        while self.at(&TokenKind::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_comparison()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::EqEq => BinaryOp::Eq,
                TokenKind::NotEq => BinaryOp::Ne,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Lt => BinaryOp::Lt,
                TokenKind::Le => BinaryOp::Le,
                TokenKind::Gt => BinaryOp::Gt,
                TokenKind::Ge => BinaryOp::Ge,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> ParseResult<Expr> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek().kind {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                TokenKind::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult<Expr> {
        let op = match self.peek().kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek().kind {
                TokenKind::LParen => {
                    self.advance();
                    let mut args = Vec::new();
                    while !self.at(&TokenKind::RParen) {
                        args.push(self.parse_expr()?);
                        if self.at(&TokenKind::Comma) {
                            self.advance();
                        } else {
                            break;
                        }
                    }
                    self.expect(TokenKind::RParen, "to close the argument list")?;
                    expr = Expr::Call {
                        callee: Box::new(expr),
                        args,
                    };
                }
                TokenKind::Dot => {
                    self.advance();
                    let (name, _) = self.expect_ident("after `.`")?;
                    expr = Expr::Attr {
                        object: Box::new(expr),
                        name,
                    };
                }
                TokenKind::LBracket => {
                    self.advance();
                    let index = self.parse_expr()?;
                    self.expect(TokenKind::RBracket, "to close the index")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> ParseResult<Expr> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Int(value) => {
                self.advance();
                Ok(Expr::Int(value))
            }
            TokenKind::Float(value) => {
                self.advance();
                Ok(Expr::Float(value))
            }
            TokenKind::Str(value) => {
                self.advance();
                Ok(Expr::Str(value))
            }
            TokenKind::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            TokenKind::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Expr::Name(name))
            }
            TokenKind::LBracket => {
                self.advance();
                let mut items = Vec::new();
                while !self.at(&TokenKind::RBracket) {
                    items.push(self.parse_expr()?);
                    if self.at(&TokenKind::Comma) {
                        self.advance();
                    } else {
                        break;
                    }
                }
                self.expect(TokenKind::RBracket, "to close the list literal")?;
                Ok(Expr::List(items))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "to close the parenthesized expression")?;
                Ok(inner)
            }
            other => Err(self.error_here(
                ParseErrorCode::UnexpectedToken,
                format!("expected an expression, found {}", other.describe()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_function_with_default_param() {
        let module = parse_module("fn add(a, b = 2) {\n    return a + b;\n}\n").expect("parse");
        assert_eq!(module.body.len(), 1);
        match &module.body[0] {
            Stmt::Fn(def) => {
                assert_eq!(def.name, "add");
                assert_eq!(def.params.len(), 2);
                assert!(def.params[1].default.is_some());
                assert_eq!(def.span, LineSpan::new(1, 3));
            }
            other => panic!("expected fn, got {other:?}"),
        }
    }

    #[test]
    fn parses_imports_and_aliases() {
        let module =
            parse_module("import mathlib;\nfrom target_module import add as f;\n").expect("parse");
        assert!(matches!(
            &module.body[0],
            Stmt::Import(i) if i.module == "mathlib" && i.alias.is_none()
        ));
        assert!(matches!(
            &module.body[1],
            Stmt::FromImport(i)
                if i.module == "target_module" && i.name == "add" && i.alias.as_deref() == Some("f")
        ));
    }

    #[test]
    fn rejects_import_inside_function() {
        let err = parse_module("fn f() {\n    import mathlib;\n}\n").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::ImportNotTopLevel);
    }

    #[test]
    fn parses_else_if_chain() {
        let source = "fn sign(x) {\n    if x > 0 {\n        return 1;\n    } else if x < 0 {\n        return -1;\n    } else {\n        return 0;\n    }\n}\n";
        let module = parse_module(source).expect("parse");
        let def = match &module.body[0] {
            Stmt::Fn(def) => def,
            other => panic!("expected fn, got {other:?}"),
        };
        let if_stmt = match &def.body[0] {
            Stmt::If(s) => s,
            other => panic!("expected if, got {other:?}"),
        };
        assert_eq!(if_stmt.else_body.len(), 1);
        assert!(matches!(if_stmt.else_body[0], Stmt::If(_)));
    }

    #[test]
    fn parses_class_with_methods() {
        let source = "class Counter {\n    fn init(self, start) {\n        self.count = start;\n    }\n    fn bump(self) {\n        self.count = self.count + 1;\n        return self.count;\n    }\n}\n";
        let module = parse_module(source).expect("parse");
        match &module.body[0] {
            Stmt::Class(def) => {
                assert_eq!(def.name, "Counter");
                assert_eq!(def.methods.len(), 2);
            }
            other => panic!("expected class, got {other:?}"),
        }
    }

    #[test]
    fn parses_lambda_and_calls() {
        let module = parse_module("let twice = |x| x * 2;\ntwice(4);\n").expect("parse");
        assert!(matches!(
            &module.body[0],
            Stmt::Let { value: Expr::Lambda { params, .. }, .. } if params.len() == 1
        ));
        assert!(matches!(
            &module.body[1],
            Stmt::Expr { value: Expr::Call { .. }, .. }
        ));
    }

    #[test]
    fn parses_empty_lambda() {
        let module = parse_module("let thunk = || 42;\n").expect("parse");
        assert!(matches!(
            &module.body[0],
            Stmt::Let { value: Expr::Lambda { params, .. }, .. } if params.is_empty()
        ));
    }

    #[test]
    fn assignment_targets() {
        let module = parse_module("x = 1;\np.field = 2;\nxs[0] = 3;\n").expect("parse");
        assert!(matches!(
            &module.body[0],
            Stmt::Assign { target: AssignTarget::Name(n), .. } if n == "x"
        ));
        assert!(matches!(
            &module.body[1],
            Stmt::Assign { target: AssignTarget::Attr { .. }, .. }
        ));
        assert!(matches!(
            &module.body[2],
            Stmt::Assign { target: AssignTarget::Index { .. }, .. }
        ));
    }

    #[test]
    fn malformed_source_reports_position() {
        let err = parse_module("fn add(a, b) {\n    return a +;\n}\n").expect_err("must fail");
        assert_eq!(err.code, ParseErrorCode::UnexpectedToken);
        assert_eq!(err.line, 2);
    }
}
