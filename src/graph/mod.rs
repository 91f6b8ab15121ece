//! Task dependency graph: build, validate, and query.
//!
//! The graph is index-addressed (task id to node index, adjacency by id
//! sets) so it can be shared across concurrent readers and rebuilt from a
//! persisted definition during recovery.

mod builder;

pub use builder::{build_graph, TaskGraph};
