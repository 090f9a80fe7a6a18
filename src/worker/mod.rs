pub mod job;
pub mod supervisor;

pub use job::{parse_mem_limit, Job, JobOpts, JobStatus};
pub use supervisor::JobWorker;
