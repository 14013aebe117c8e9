//! Re-exports the job record type shared between the queue/store and the
//! HTTP layer. Kept as a thin module (rather than folding into `store.rs`)
//! so the record shape and the store's concurrency machinery can evolve
//! independently, mirroring the teacher's handlers/repository split.

pub use crate::sandbox::types::{JobPhase, JobRecord, JobResult, JobStatus};
