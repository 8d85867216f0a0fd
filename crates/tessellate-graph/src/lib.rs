//! Finalizer for scatter/gather CWL `$graph` pipeline documents.
//!
//! parse document -> rewrite pipeline node -> append synthesized tasks ->
//! validate. The result is what an external execution engine consumes.

pub mod config;
pub mod diagnostics;
pub mod document;
pub mod engine;
pub mod errors;
pub mod finalize;
pub mod lint;
pub mod parse;
pub mod rewrite;
pub mod schema;
pub mod storage;
pub mod templates;

pub use config::*;
pub use diagnostics::*;
pub use document::*;
pub use engine::*;
pub use errors::*;
pub use finalize::*;
pub use lint::*;
pub use parse::*;
pub use rewrite::*;
pub use schema::*;
pub use storage::*;
pub use templates::*;
