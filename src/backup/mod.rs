pub mod batch;
pub mod compression;
pub mod job;

pub use batch::{run_batch, BulkResult};
pub use job::JobRunner;
