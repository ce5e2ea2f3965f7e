//! The description compiler: permissive parser → typed graph → verifier.

pub mod ir;
pub mod lowering;
pub mod parser;
pub mod verifier;

pub use ir::{HistoryKind, InvokeSpec, StateGraph, StateKind, StateNode, Transition, Trigger};
pub use lowering::{build_graph, BuildOptions};
pub use parser::parse_document;
