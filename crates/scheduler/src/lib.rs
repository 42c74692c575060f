pub mod job;
pub mod scheduler;

pub use job::{JobInfo, JobSchedule, JobState, JobStatus, ScheduleKind};
pub use scheduler::{JobFuture, Scheduler};
