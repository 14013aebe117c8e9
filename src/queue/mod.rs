pub mod record;
pub mod store;

pub use store::{JobQueue, JobQueueLayout, QueuedJob};
