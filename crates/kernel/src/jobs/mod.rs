//! Job queue — bounded workers for long-running tasks (image builds,
//! deployments, certificate renewals, search reindex).

mod queue;

pub use queue::{JobContext, JobKind, JobQueue, JobRecord, JobStatus};
