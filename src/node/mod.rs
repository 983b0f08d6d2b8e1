//! Registry node layout and job-scoped storage

pub mod path;
pub mod storage;

pub use path::{ItemNode, JobNodePath};
pub use storage::JobNodeStorage;
