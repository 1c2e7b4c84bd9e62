#![forbid(unsafe_code)]

//! Evaluation harness for candidate reimplementations of a target entity.
//!
//! A target file inside a repository is snapshotted at registration, and a
//! frozen `reference_<name>` twin of each target entity is synthesized from
//! that snapshot. Candidate patches are installed over the target file one at
//! a time; generated test suites then run in a namespace where both the
//! patched entity and its reference twin are bound, with call
//! instrumentation and entity-scoped coverage collected along the way.
//!
//! The target language is `.sc`, a small brace-delimited scripting language
//! with modules, functions, classes, and lambdas, interpreted in-process so
//! evaluations are hermetic and deterministic.

pub mod ast;
pub mod coverage;
pub mod engine;
pub mod environment;
pub mod error;
pub mod instrument;
pub mod interp;
pub mod lexer;
pub mod normalize;
pub mod parser;
pub mod reference;
pub mod resolver;
pub mod runner;
pub mod serialize;
pub mod transform;
pub mod unparse;
pub mod value;

pub use engine::{EngineConfig, EvalReport, TestEngine};
pub use environment::{Environment, TargetSpec, ORIGINAL_VERSION};
pub use error::{EngineError, EngineResult};
pub use instrument::ModeMask;
pub use runner::TestStats;
