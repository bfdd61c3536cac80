//! Task data plumbing.
//!
//! - [`TaskData`]: labelled feature matrix for one task split
//! - [`DataLoader`]: seeded batch index iterator
//! - [`split_into_tasks`]: class-incremental task construction from a flat dataset

pub mod loader;
pub mod split;
pub mod task;

pub use loader::DataLoader;
pub use split::{load_csv, split_into_tasks, synthetic_blobs, BlobConfig};
pub use task::{TaskData, TaskSequence, TaskSplit};
