//! Tree-walking interpreter for the `.sc` language.
//!
//! The interpreter owns the call stack, captured output streams, per-test
//! assertion state, and an optional coverage recorder. Execution is gated by
//! origin labels: every frame remembers which source it came from, and the
//! coverage recorder only collects events from the one origin it targets.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use crate::ast::{
    AssignTarget, BinaryOp, ClassDef, Expr, FnDef, IfStmt, Param, Stmt, UnaryOp, WhileStmt,
};
use crate::coverage::CoverageRecorder;
use crate::parser::parse_module;
use crate::resolver::{LoadFailure, ModuleResolver};
use crate::value::{
    values_equal, BoundMethod, BuiltinFn, ClassValue, FunctionDecl, FunctionValue, InstanceData,
    Scope, Value,
};

const MAX_CALL_DEPTH: usize = 256;

/// An uncaught evaluation error, with the line the failing statement or
/// expression started on.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Non-local control flow. `Return` never escapes a function call; the other
/// variants propagate to the test executor.
#[derive(Debug, Clone)]
pub enum Signal {
    Return(Value),
    Error(RuntimeError),
    Failure(String),
    Skip(String),
}

impl Signal {
    pub fn error(message: impl Into<String>, line: u32) -> Self {
        Self::Error(RuntimeError {
            message: message.into(),
            line,
        })
    }
}

#[derive(Debug, Clone)]
pub enum SubtestOutcome {
    Failed(String),
    Errored(String),
}

/// One recorded sub-check outcome; the parent test keeps running after it.
#[derive(Debug, Clone)]
pub struct SubtestRecord {
    pub label: String,
    pub outcome: SubtestOutcome,
}

struct Frame {
    name: String,
    origin: Rc<str>,
    line: u32,
}

pub struct Interp {
    pub stdout: String,
    pub stderr: String,
    pub coverage: Option<CoverageRecorder>,
    pub subtests: Vec<SubtestRecord>,
    pub expect_failure: bool,
    /// Monotonic count of executed statements, sampled by the profiler mode.
    pub stmt_count: u64,
    frames: Vec<Frame>,
    globals: Scope,
}

impl Default for Interp {
    fn default() -> Self {
        Self::new()
    }
}

impl Interp {
    pub fn new() -> Self {
        let globals = Scope::root();
        install_builtins(&globals);
        Self {
            stdout: String::new(),
            stderr: String::new(),
            coverage: None,
            subtests: Vec::new(),
            expect_failure: false,
            stmt_count: 0,
            frames: Vec::new(),
            globals,
        }
    }

    /// Root scope holding the builtins. Module namespaces and evaluation
    /// namespaces are children of it.
    pub fn globals(&self) -> &Scope {
        &self.globals
    }

    pub fn take_stdout(&mut self) -> String {
        std::mem::take(&mut self.stdout)
    }

    pub fn take_stderr(&mut self) -> String {
        std::mem::take(&mut self.stderr)
    }

    /// Clear per-test assertion state before executing a test function.
    pub fn begin_test(&mut self) {
        self.subtests.clear();
        self.expect_failure = false;
    }

    pub fn take_subtests(&mut self) -> Vec<SubtestRecord> {
        std::mem::take(&mut self.subtests)
    }

    pub fn current_line(&self) -> u32 {
        self.frames.last().map_or(0, |f| f.line)
    }

    /// Name and current line of the innermost frame, as seen by a callee
    /// about to be entered.
    pub fn caller_frame(&self) -> Option<(String, u32)> {
        self.frames.last().map(|f| (f.name.clone(), f.line))
    }

    fn err(&self, message: impl Into<String>) -> Signal {
        Signal::error(message, self.current_line())
    }

    fn set_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    fn current_origin(&self) -> Rc<str> {
        self.frames
            .last()
            .map_or_else(|| Rc::from("<anon>"), |f| f.origin.clone())
    }

    fn record_line(&mut self, line: u32) {
        let Some(recorder) = self.coverage.as_mut() else {
            return;
        };
        let Some(frame) = self.frames.last() else {
            return;
        };
        if frame.origin.as_ref() == recorder.target_origin.as_str() {
            recorder.executed_lines.insert(line);
        }
    }

    fn record_arc(&mut self, from: u32, to: u32) {
        let Some(recorder) = self.coverage.as_mut() else {
            return;
        };
        let Some(frame) = self.frames.last() else {
            return;
        };
        if frame.origin.as_ref() == recorder.target_origin.as_str() {
            recorder.executed_arcs.insert((from, to));
        }
    }

    // ---- module loading ----------------------------------------------------

    /// Parse and execute a source text into a fresh namespace.
    pub fn load_module(
        &mut self,
        resolver: &mut ModuleResolver,
        source: &str,
        label: &str,
    ) -> Result<Scope, LoadFailure> {
        let scope = self.globals.child();
        self.exec_in(resolver, source, label, &scope)?;
        Ok(scope)
    }

    /// Parse and execute a source text into an existing namespace. Imports
    /// are only legal here, at the top level of a source.
    pub fn exec_in(
        &mut self,
        resolver: &mut ModuleResolver,
        source: &str,
        label: &str,
        scope: &Scope,
    ) -> Result<(), LoadFailure> {
        let module = parse_module(source).map_err(LoadFailure::Parse)?;
        self.frames.push(Frame {
            name: "<module>".to_string(),
            origin: Rc::from(label),
            line: 0,
        });
        let result = self.exec_module_body(resolver, &module.body, label, scope);
        self.frames.pop();
        result
    }

    fn exec_module_body(
        &mut self,
        resolver: &mut ModuleResolver,
        body: &[Stmt],
        label: &str,
        scope: &Scope,
    ) -> Result<(), LoadFailure> {
        for stmt in body {
            match stmt {
                Stmt::Import(s) => {
                    self.set_line(s.span.start_line);
                    let dep = self.resolve(resolver, &s.module)?;
                    let bound = s.alias.clone().unwrap_or_else(|| s.module.clone());
                    scope.define(bound, Value::Module(dep));
                }
                Stmt::FromImport(s) => {
                    self.set_line(s.span.start_line);
                    let dep = self.resolve(resolver, &s.module)?;
                    let member = dep.get_local(&s.name).ok_or_else(|| {
                        LoadFailure::MissingMember {
                            module: s.module.clone(),
                            name: s.name.clone(),
                        }
                    })?;
                    let bound = s.alias.clone().unwrap_or_else(|| s.name.clone());
                    scope.define(bound, member);
                }
                other => {
                    self.exec_stmt(other, scope)
                        .map_err(|signal| LoadFailure::Runtime {
                            label: label.to_string(),
                            error: signal_to_runtime(signal),
                        })?;
                }
            }
        }
        Ok(())
    }

    /// Resolve an imported module, executing its file on first use. Failures
    /// keep their kind so callers can retry missing modules with extended
    /// search roots.
    fn resolve(
        &mut self,
        resolver: &mut ModuleResolver,
        module: &str,
    ) -> Result<Scope, LoadFailure> {
        if let Some(scope) = resolver.cached(module) {
            return Ok(scope);
        }
        let (path, source) = resolver.read_source(module)?;
        tracing::debug!(module, path = %path.display(), "loading module");
        resolver.begin(module)?;
        let loaded = self.load_module(resolver, &source, module);
        resolver.finish(module);
        let scope = loaded?;
        resolver.store(module, scope.clone());
        Ok(scope)
    }

    // ---- statements --------------------------------------------------------

    pub fn exec_block(&mut self, stmts: &[Stmt], scope: &Scope) -> Result<(), Signal> {
        for stmt in stmts {
            self.exec_stmt(stmt, scope)?;
        }
        Ok(())
    }

    fn exec_stmt(&mut self, stmt: &Stmt, scope: &Scope) -> Result<(), Signal> {
        let line = stmt.span().start_line;
        self.stmt_count = self.stmt_count.wrapping_add(1);
        self.set_line(line);
        self.record_line(line);
        match stmt {
            Stmt::Import(_) | Stmt::FromImport(_) => {
                Err(self.err("import is only valid at the top level of a module"))
            }
            Stmt::Fn(def) => {
                let function = self.make_function(def, scope);
                scope.define(def.name.clone(), function);
                Ok(())
            }
            Stmt::Class(def) => {
                let class = self.make_class(def, scope);
                scope.define(def.name.clone(), class);
                Ok(())
            }
            Stmt::Let { name, value, .. } => {
                let value = self.eval_expr(value, scope)?;
                scope.define(name.clone(), value);
                Ok(())
            }
            Stmt::Assign { target, value, .. } => {
                let value = self.eval_expr(value, scope)?;
                self.assign_target(target, value, scope)
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval_expr(expr, scope)?,
                    None => Value::Unit,
                };
                Err(Signal::Return(value))
            }
            Stmt::If(s) => self.exec_if(s, scope),
            Stmt::While(s) => self.exec_while(s, scope),
            Stmt::Pass { .. } => Ok(()),
            Stmt::Expr { value, .. } => {
                self.eval_expr(value, scope)?;
                Ok(())
            }
        }
    }

    fn make_function(&self, def: &FnDef, scope: &Scope) -> Value {
        Value::Function(Rc::new(FunctionValue {
            decl: FunctionDecl::Named(Rc::new(def.clone())),
            env: scope.clone(),
            origin: self.current_origin(),
        }))
    }

    fn make_class(&self, def: &ClassDef, scope: &Scope) -> Value {
        let class = ClassValue {
            name: def.name.clone(),
            span: def.span,
            origin: self.current_origin(),
            methods: Default::default(),
        };
        for method in &def.methods {
            class
                .methods
                .borrow_mut()
                .insert(method.name.clone(), self.make_function(method, scope));
        }
        Value::Class(Rc::new(class))
    }

    fn assign_target(
        &mut self,
        target: &AssignTarget,
        value: Value,
        scope: &Scope,
    ) -> Result<(), Signal> {
        match target {
            AssignTarget::Name(name) => {
                if scope.assign(name, value) {
                    Ok(())
                } else {
                    Err(self.err(format!("assignment to undefined name `{name}`")))
                }
            }
            AssignTarget::Attr { object, name } => {
                let object = self.eval_expr(object, scope)?;
                match &object {
                    Value::Instance(inst) => {
                        inst.borrow_mut().fields.insert(name.clone(), value);
                        Ok(())
                    }
                    Value::Module(module) => {
                        module.define(name.clone(), value);
                        Ok(())
                    }
                    other => Err(self.err(format!(
                        "cannot set attribute on value of type {}",
                        other.type_name()
                    ))),
                }
            }
            AssignTarget::Index { object, index } => {
                let object = self.eval_expr(object, scope)?;
                let index = self.eval_expr(index, scope)?;
                let Value::List(items) = &object else {
                    return Err(self.err(format!(
                        "cannot index-assign into value of type {}",
                        object.type_name()
                    )));
                };
                let slot = self.list_index(&items.borrow(), &index)?;
                items.borrow_mut()[slot] = value;
                Ok(())
            }
        }
    }

    fn exec_if(&mut self, s: &IfStmt, scope: &Scope) -> Result<(), Signal> {
        let line = s.span.start_line;
        let cond = self.eval_expr(&s.cond, scope)?.is_truthy();
        if cond {
            self.record_arc(line, first_line(&s.then_body));
            self.exec_block(&s.then_body, scope)
        } else {
            self.record_arc(line, first_line(&s.else_body));
            self.exec_block(&s.else_body, scope)
        }
    }

    fn exec_while(&mut self, s: &WhileStmt, scope: &Scope) -> Result<(), Signal> {
        let line = s.span.start_line;
        loop {
            self.set_line(line);
            self.record_line(line);
            if !self.eval_expr(&s.cond, scope)?.is_truthy() {
                self.record_arc(line, 0);
                return Ok(());
            }
            self.record_arc(line, first_line(&s.body));
            self.exec_block(&s.body, scope)?;
        }
    }

    // ---- expressions -------------------------------------------------------

    pub fn eval_expr(&mut self, expr: &Expr, scope: &Scope) -> Result<Value, Signal> {
        match expr {
            Expr::Null => Ok(Value::Unit),
            Expr::Bool(value) => Ok(Value::Bool(*value)),
            Expr::Int(value) => Ok(Value::Int(*value)),
            Expr::Float(value) => Ok(Value::Float(*value)),
            Expr::Str(value) => Ok(Value::Str(value.clone())),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval_expr(item, scope)?);
                }
                Ok(Value::list(values))
            }
            Expr::Name(name) => scope
                .get(name)
                .ok_or_else(|| self.err(format!("name `{name}` is not defined"))),
            Expr::Attr { object, name } => {
                let object = self.eval_expr(object, scope)?;
                self.get_attr(&object, name)
            }
            Expr::Index { object, index } => {
                let object = self.eval_expr(object, scope)?;
                let index = self.eval_expr(index, scope)?;
                match &object {
                    Value::List(items) => {
                        let items = items.borrow();
                        let slot = self.list_index(&items, &index)?;
                        Ok(items[slot].clone())
                    }
                    Value::Str(text) => {
                        let Value::Int(i) = index else {
                            return Err(self.err("string index must be an int"));
                        };
                        let ch = usize::try_from(i)
                            .ok()
                            .and_then(|i| text.chars().nth(i))
                            .ok_or_else(|| self.err("string index out of range"))?;
                        Ok(Value::Str(ch.to_string()))
                    }
                    other => Err(self.err(format!(
                        "cannot index value of type {}",
                        other.type_name()
                    ))),
                }
            }
            Expr::Call { callee, args } => {
                let callee = self.eval_expr(callee, scope)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_expr(arg, scope)?);
                }
                self.call_value(&callee, values)
            }
            Expr::Lambda { params, body } => Ok(Value::Function(Rc::new(FunctionValue {
                decl: FunctionDecl::Lambda {
                    params: Rc::new(params.clone()),
                    body: Rc::new((**body).clone()),
                },
                env: scope.clone(),
                origin: self.current_origin(),
            }))),
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let left = self.eval_expr(left, scope)?;
                    if left.is_truthy() {
                        self.eval_expr(right, scope)
                    } else {
                        Ok(left)
                    }
                }
                BinaryOp::Or => {
                    let left = self.eval_expr(left, scope)?;
                    if left.is_truthy() {
                        Ok(left)
                    } else {
                        self.eval_expr(right, scope)
                    }
                }
                _ => {
                    let left = self.eval_expr(left, scope)?;
                    let right = self.eval_expr(right, scope)?;
                    self.binary_op(*op, left, right)
                }
            },
            Expr::Unary { op, operand } => {
                let operand = self.eval_expr(operand, scope)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!operand.is_truthy())),
                    UnaryOp::Neg => match operand {
                        Value::Int(v) => v
                            .checked_neg()
                            .map(Value::Int)
                            .ok_or_else(|| self.err("integer overflow")),
                        Value::Float(v) => Ok(Value::Float(-v)),
                        other => Err(self.err(format!(
                            "cannot negate value of type {}",
                            other.type_name()
                        ))),
                    },
                }
            }
        }
    }

    fn list_index(&self, items: &[Value], index: &Value) -> Result<usize, Signal> {
        let Value::Int(i) = index else {
            return Err(self.err(format!(
                "list index must be an int, got {}",
                index.type_name()
            )));
        };
        usize::try_from(*i)
            .ok()
            .filter(|&i| i < items.len())
            .ok_or_else(|| self.err("list index out of range"))
    }

    pub fn get_attr(&mut self, object: &Value, name: &str) -> Result<Value, Signal> {
        match object {
            Value::Module(scope) => scope
                .get_local(name)
                .ok_or_else(|| self.err(format!("module has no member `{name}`"))),
            Value::Instance(inst) => {
                if let Some(value) = inst.borrow().fields.get(name) {
                    return Ok(value.clone());
                }
                let class = inst.borrow().class.clone();
                let method = class.methods.borrow().get(name).cloned();
                match method {
                    Some(func) => Ok(Value::Bound(Rc::new(BoundMethod {
                        receiver: object.clone(),
                        func,
                    }))),
                    None => Err(self.err(format!(
                        "instance of `{}` has no attribute `{name}`",
                        class.name
                    ))),
                }
            }
            Value::Class(class) => class
                .methods
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| self.err(format!("class `{}` has no method `{name}`", class.name))),
            Value::Instrumented(ic) => {
                let inner = ic.inner.clone();
                self.get_attr(&inner, name)
            }
            other => Err(self.err(format!(
                "value of type {} has no attributes",
                other.type_name()
            ))),
        }
    }

    fn binary_op(&self, op: BinaryOp, left: Value, right: Value) -> Result<Value, Signal> {
        use BinaryOp::*;
        match op {
            Eq => return Ok(Value::Bool(values_equal(&left, &right))),
            Ne => return Ok(Value::Bool(!values_equal(&left, &right))),
            _ => {}
        }
        match (op, &left, &right) {
            (Add, Value::Str(a), Value::Str(b)) => return Ok(Value::Str(format!("{a}{b}"))),
            (Add, Value::List(a), Value::List(b)) => {
                let mut items = a.borrow().clone();
                items.extend(b.borrow().iter().cloned());
                return Ok(Value::list(items));
            }
            (Lt | Le | Gt | Ge, Value::Str(a), Value::Str(b)) => {
                return Ok(Value::Bool(apply_ordering(op, a.cmp(b))));
            }
            _ => {}
        }
        if let (Value::Int(a), Value::Int(b)) = (&left, &right) {
            let (a, b) = (*a, *b);
            let int_result = match op {
                Add => Some(a.checked_add(b)),
                Sub => Some(a.checked_sub(b)),
                Mul => Some(a.checked_mul(b)),
                Mod => {
                    if b == 0 {
                        return Err(self.err("modulo by zero"));
                    }
                    Some(a.checked_rem(b))
                }
                _ => None,
            };
            if let Some(result) = int_result {
                return result
                    .map(Value::Int)
                    .ok_or_else(|| self.err("integer overflow"));
            }
        }
        let pair = match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => Some((*a as f64, *b as f64)),
            (Value::Int(a), Value::Float(b)) => Some((*a as f64, *b)),
            (Value::Float(a), Value::Int(b)) => Some((*a, *b as f64)),
            (Value::Float(a), Value::Float(b)) => Some((*a, *b)),
            _ => None,
        };
        let Some((a, b)) = pair else {
            return Err(self.err(format!(
                "unsupported operand types for `{}`: {} and {}",
                op.as_str(),
                left.type_name(),
                right.type_name()
            )));
        };
        match op {
            Add => Ok(Value::Float(a + b)),
            Sub => Ok(Value::Float(a - b)),
            Mul => Ok(Value::Float(a * b)),
            Div => {
                if b == 0.0 {
                    Err(self.err("division by zero"))
                } else {
                    Ok(Value::Float(a / b))
                }
            }
            Mod => Err(self.err("modulo requires int operands")),
            Lt | Le | Gt | Ge => Ok(Value::Bool(
                a.partial_cmp(&b).is_some_and(|o| apply_ordering(op, o)),
            )),
            Eq | Ne | And | Or => unreachable!("handled above"),
        }
    }

    // ---- calls -------------------------------------------------------------

    pub fn call_value(&mut self, callee: &Value, mut args: Vec<Value>) -> Result<Value, Signal> {
        match callee {
            Value::Function(f) => self.call_function(f, args),
            Value::Builtin(b) => (b.func)(self, args),
            Value::Bound(m) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(m.receiver.clone());
                full.append(&mut args);
                self.call_value(&m.func, full)
            }
            Value::Class(c) => self.instantiate(c, args),
            Value::Instrumented(ic) => crate::instrument::dispatch(self, ic, args),
            other => Err(self.err(format!(
                "value of type {} is not callable",
                other.type_name()
            ))),
        }
    }

    fn call_function(&mut self, f: &Rc<FunctionValue>, args: Vec<Value>) -> Result<Value, Signal> {
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(self.err("call depth limit exceeded"));
        }
        let bindings = self.bind_params(f.decl.params(), &args, &f.env)?;
        let locals = f.env.child();
        for (name, value) in bindings {
            locals.define(name, value);
        }
        let entry_line = f
            .decl
            .span()
            .map_or_else(|| self.current_line(), |s| s.start_line);
        self.frames.push(Frame {
            name: f.decl.name().to_string(),
            origin: f.origin.clone(),
            line: entry_line,
        });
        if let Some(span) = f.decl.span() {
            self.record_line(span.start_line);
        }
        let result = match &f.decl {
            FunctionDecl::Named(def) => match self.exec_block(&def.body, &locals) {
                Ok(()) => Ok(Value::Unit),
                Err(Signal::Return(value)) => Ok(value),
                Err(other) => Err(other),
            },
            FunctionDecl::Lambda { body, .. } => self.eval_expr(body, &locals),
        };
        self.frames.pop();
        result
    }

    fn instantiate(&mut self, class: &Rc<ClassValue>, args: Vec<Value>) -> Result<Value, Signal> {
        let instance = Value::Instance(Rc::new(std::cell::RefCell::new(InstanceData {
            class: class.clone(),
            fields: BTreeMap::new(),
        })));
        let init = class.methods.borrow().get("init").cloned();
        match init {
            Some(init) => {
                let mut full = Vec::with_capacity(args.len() + 1);
                full.push(instance.clone());
                full.extend(args);
                self.call_value(&init, full)?;
            }
            None if !args.is_empty() => {
                return Err(self.err(format!(
                    "class `{}` takes no constructor arguments",
                    class.name
                )));
            }
            None => {}
        }
        Ok(instance)
    }

    /// Bind positional arguments against a parameter list. Defaults are
    /// evaluated in the function's defining scope at call time.
    pub(crate) fn bind_params(
        &mut self,
        params: &[Param],
        args: &[Value],
        default_env: &Scope,
    ) -> Result<Vec<(String, Value)>, Signal> {
        if args.len() > params.len() {
            return Err(self.err(format!(
                "expected at most {} arguments, got {}",
                params.len(),
                args.len()
            )));
        }
        let mut bound = Vec::with_capacity(params.len());
        for (i, param) in params.iter().enumerate() {
            let value = if i < args.len() {
                args[i].clone()
            } else if let Some(default) = &param.default {
                self.eval_expr(default, default_env)?
            } else {
                return Err(self.err(format!("missing argument `{}`", param.name)));
            };
            bound.push((param.name.clone(), value));
        }
        Ok(bound)
    }
}

fn first_line(stmts: &[Stmt]) -> u32 {
    stmts.first().map_or(0, |s| s.span().start_line)
}

fn apply_ordering(op: BinaryOp, ordering: std::cmp::Ordering) -> bool {
    match op {
        BinaryOp::Lt => ordering.is_lt(),
        BinaryOp::Le => ordering.is_le(),
        BinaryOp::Gt => ordering.is_gt(),
        BinaryOp::Ge => ordering.is_ge(),
        _ => false,
    }
}

fn signal_to_runtime(signal: Signal) -> RuntimeError {
    match signal {
        Signal::Error(error) => error,
        Signal::Return(_) => RuntimeError {
            message: "return outside of a function".to_string(),
            line: 0,
        },
        Signal::Failure(message) => RuntimeError {
            message: format!("assertion failed during module execution: {message}"),
            line: 0,
        },
        Signal::Skip(message) => RuntimeError {
            message: format!("skip outside of a test: {message}"),
            line: 0,
        },
    }
}

// ---- builtins --------------------------------------------------------------

type BuiltinImpl = fn(&mut Interp, Vec<Value>) -> Result<Value, Signal>;

const BUILTINS: &[(&str, BuiltinImpl)] = &[
    ("print", builtin_print),
    ("eprint", builtin_eprint),
    ("str", builtin_str),
    ("len", builtin_len),
    ("push", builtin_push),
    ("fail", builtin_fail),
    ("assert_true", builtin_assert_true),
    ("assert_eq", builtin_assert_eq),
    ("assert_ne", builtin_assert_ne),
    ("skip", builtin_skip),
    ("expect_failure", builtin_expect_failure),
    ("subtest", builtin_subtest),
];

fn install_builtins(scope: &Scope) {
    for (name, func) in BUILTINS {
        scope.define(
            *name,
            Value::Builtin(Rc::new(BuiltinFn { name, func: *func })),
        );
    }
}

fn optional_message(args: &[Value], index: usize) -> Option<String> {
    args.get(index).map(Value::display)
}

fn builtin_print(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let rendered: Vec<String> = args.iter().map(Value::display).collect();
    interp.stdout.push_str(&rendered.join(" "));
    interp.stdout.push('\n');
    Ok(Value::Unit)
}

fn builtin_eprint(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let rendered: Vec<String> = args.iter().map(Value::display).collect();
    interp.stderr.push_str(&rendered.join(" "));
    interp.stderr.push('\n');
    Ok(Value::Unit)
}

fn builtin_str(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    match args.as_slice() {
        [value] => Ok(Value::Str(value.display())),
        _ => Err(interp.err("str takes exactly one argument")),
    }
}

fn builtin_len(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    match args.as_slice() {
        [Value::Str(text)] => Ok(Value::Int(text.chars().count() as i64)),
        [Value::List(items)] => Ok(Value::Int(items.borrow().len() as i64)),
        [other] => Err(interp.err(format!(
            "len is not defined for values of type {}",
            other.type_name()
        ))),
        _ => Err(interp.err("len takes exactly one argument")),
    }
}

fn builtin_push(interp: &mut Interp, mut args: Vec<Value>) -> Result<Value, Signal> {
    if args.len() != 2 {
        return Err(interp.err("push takes a list and a value"));
    }
    let value = args.pop().unwrap_or(Value::Unit);
    match &args[0] {
        Value::List(items) => {
            items.borrow_mut().push(value);
            Ok(Value::Unit)
        }
        other => Err(interp.err(format!(
            "push requires a list, got {}",
            other.type_name()
        ))),
    }
}

fn builtin_fail(_interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let message = optional_message(&args, 0).unwrap_or_else(|| "explicit failure".to_string());
    Err(Signal::Failure(message))
}

fn builtin_assert_true(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let Some(condition) = args.first() else {
        return Err(interp.err("assert_true takes a condition"));
    };
    if condition.is_truthy() {
        return Ok(Value::Unit);
    }
    let message = optional_message(&args, 1)
        .unwrap_or_else(|| format!("expected truthy value, got {}", condition.repr()));
    Err(Signal::Failure(message))
}

fn builtin_assert_eq(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let [left, right, rest @ ..] = args.as_slice() else {
        return Err(interp.err("assert_eq takes two values"));
    };
    if values_equal(left, right) {
        return Ok(Value::Unit);
    }
    let message = rest
        .first()
        .map(Value::display)
        .unwrap_or_else(|| format!("{} != {}", left.repr(), right.repr()));
    Err(Signal::Failure(message))
}

fn builtin_assert_ne(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let [left, right, rest @ ..] = args.as_slice() else {
        return Err(interp.err("assert_ne takes two values"));
    };
    if !values_equal(left, right) {
        return Ok(Value::Unit);
    }
    let message = rest
        .first()
        .map(Value::display)
        .unwrap_or_else(|| format!("{} == {}", left.repr(), right.repr()));
    Err(Signal::Failure(message))
}

fn builtin_skip(_interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let reason = optional_message(&args, 0).unwrap_or_else(|| "skipped".to_string());
    Err(Signal::Skip(reason))
}

fn builtin_expect_failure(interp: &mut Interp, _args: Vec<Value>) -> Result<Value, Signal> {
    interp.expect_failure = true;
    Ok(Value::Unit)
}

fn builtin_subtest(interp: &mut Interp, args: Vec<Value>) -> Result<Value, Signal> {
    let [label, callable] = args.as_slice() else {
        return Err(interp.err("subtest takes a label and a callable"));
    };
    let label = label.display();
    match interp.call_value(callable, Vec::new()) {
        Ok(_) | Err(Signal::Return(_)) | Err(Signal::Skip(_)) => {}
        Err(Signal::Failure(message)) => interp.subtests.push(SubtestRecord {
            label,
            outcome: SubtestOutcome::Failed(message),
        }),
        Err(Signal::Error(error)) => interp.subtests.push(SubtestRecord {
            label,
            outcome: SubtestOutcome::Errored(error.to_string()),
        }),
    }
    Ok(Value::Unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> (Interp, Scope) {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let scope = interp
            .load_module(&mut resolver, source, "main")
            .expect("load");
        (interp, scope)
    }

    fn int_of(scope: &Scope, name: &str) -> i64 {
        match scope.get_local(name) {
            Some(Value::Int(v)) => v,
            other => panic!("expected int for `{name}`, got {other:?}"),
        }
    }

    #[test]
    fn evaluates_arithmetic_and_calls() {
        let (_, scope) = run(
            "fn add(a, b) {\n    return a + b;\n}\nlet x = add(2, 3) * 4;\nlet y = 10 % 3;\n",
        );
        assert_eq!(int_of(&scope, "x"), 20);
        assert_eq!(int_of(&scope, "y"), 1);
    }

    #[test]
    fn division_is_true_division() {
        let (_, scope) = run("let q = 7 / 2;\n");
        match scope.get_local("q") {
            Some(Value::Float(v)) => assert_eq!(v, 3.5),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn closures_capture_their_defining_scope() {
        let (_, scope) = run(
            "fn make_adder(n) {\n    return |x| x + n;\n}\nlet add5 = make_adder(5);\nlet r = add5(2);\n",
        );
        assert_eq!(int_of(&scope, "r"), 7);
    }

    #[test]
    fn defaults_evaluate_in_the_defining_scope() {
        let (_, scope) = run(
            "let base = 10;\nfn bump(x, amount = base) {\n    return x + amount;\n}\nlet r = bump(1);\nlet s = bump(1, 2);\n",
        );
        assert_eq!(int_of(&scope, "r"), 11);
        assert_eq!(int_of(&scope, "s"), 3);
    }

    #[test]
    fn while_loops_and_reassignment() {
        let (_, scope) = run(
            "let total = 0;\nlet i = 0;\nwhile i < 5 {\n    total = total + i;\n    i = i + 1;\n}\n",
        );
        assert_eq!(int_of(&scope, "total"), 10);
    }

    #[test]
    fn classes_bind_methods_to_instances() {
        let (_, scope) = run(
            "class Counter {\n    fn init(self, start) {\n        self.count = start;\n    }\n    fn bump(self) {\n        self.count = self.count + 1;\n        return self.count;\n    }\n}\nlet c = Counter(10);\nc.bump();\nlet n = c.bump();\n",
        );
        assert_eq!(int_of(&scope, "n"), 12);
    }

    #[test]
    fn logical_operators_return_operands() {
        let (_, scope) = run("let a = 0 || 3;\nlet b = 2 && 5;\nlet c = 0 && 9;\n");
        assert_eq!(int_of(&scope, "a"), 3);
        assert_eq!(int_of(&scope, "b"), 5);
        assert_eq!(int_of(&scope, "c"), 0);
    }

    #[test]
    fn list_builtins_mutate_in_place() {
        let (_, scope) = run(
            "let xs = [1, 2];\npush(xs, 3);\nlet n = len(xs);\nlet last = xs[2];\nxs[0] = 9;\nlet head = xs[0];\n",
        );
        assert_eq!(int_of(&scope, "n"), 3);
        assert_eq!(int_of(&scope, "last"), 3);
        assert_eq!(int_of(&scope, "head"), 9);
    }

    #[test]
    fn print_is_captured_not_emitted() {
        let (mut interp, _) = run("print(\"hello\", 42);\neprint(\"warn\");\n");
        assert_eq!(interp.take_stdout(), "hello 42\n");
        assert_eq!(interp.take_stderr(), "warn\n");
    }

    #[test]
    fn runtime_errors_carry_the_failing_line() {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let err = interp
            .load_module(&mut resolver, "let a = 1;\nlet b = missing;\n", "main")
            .expect_err("must fail");
        match err {
            LoadFailure::Runtime { error, .. } => {
                assert_eq!(error.line, 2);
                assert!(error.message.contains("missing"));
            }
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn assertion_failure_surfaces_as_a_failure_signal() {
        let (mut interp, scope) = run(
            "fn test_mismatch() {\n    assert_eq(1, 2);\n}\n",
        );
        let test = scope.get_local("test_mismatch").expect("defined");
        match interp.call_value(&test, Vec::new()) {
            Err(Signal::Failure(message)) => assert_eq!(message, "1 != 2"),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn subtest_failures_are_recorded_without_aborting() {
        let (mut interp, scope) = run(
            "fn test_parts() {\n    subtest(\"first\", || assert_eq(1, 1));\n    subtest(\"second\", || assert_eq(1, 2));\n    assert_true(true);\n}\n",
        );
        let test = scope.get_local("test_parts").expect("defined");
        interp.begin_test();
        interp.call_value(&test, Vec::new()).expect("parent passes");
        let subtests = interp.take_subtests();
        assert_eq!(subtests.len(), 1);
        assert_eq!(subtests[0].label, "second");
        assert!(matches!(subtests[0].outcome, SubtestOutcome::Failed(_)));
    }

    #[test]
    fn imports_bind_module_namespaces() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("mathlib.sc"),
            "fn double(x) {\n    return x * 2;\n}\nlet answer = 21;\n",
        )
        .expect("write");
        let mut resolver = ModuleResolver::new(vec![dir.path().to_path_buf()]);
        let mut interp = Interp::new();
        let scope = interp
            .load_module(
                &mut resolver,
                "import mathlib as m;\nfrom mathlib import double;\nlet a = m.double(m.answer);\nlet b = double(5);\n",
                "main",
            )
            .expect("load");
        assert_eq!(int_of(&scope, "a"), 42);
        assert_eq!(int_of(&scope, "b"), 10);
    }

    #[test]
    fn missing_import_is_a_not_found_failure() {
        let mut interp = Interp::new();
        let mut resolver = ModuleResolver::new(Vec::new());
        let err = interp
            .load_module(&mut resolver, "import nowhere;\n", "main")
            .expect_err("must fail");
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn recursion_depth_is_bounded() {
        let (mut interp, scope) = run("fn loop_forever() {\n    return loop_forever();\n}\n");
        let f = scope.get_local("loop_forever").expect("defined");
        match interp.call_value(&f, Vec::new()) {
            Err(Signal::Error(error)) => assert!(error.message.contains("depth")),
            other => panic!("expected depth error, got {other:?}"),
        }
    }
}
