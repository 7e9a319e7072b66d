//! Workflow graph structure: the petgraph-backed dependency DAG and the
//! validator that gates every graph before scheduling or execution.

pub mod dag;
pub mod validator;

pub use dag::GraphDag;
pub use validator::{validate, ValidatedGraph};
