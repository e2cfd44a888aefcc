pub mod client;
pub mod group;
pub mod job;
pub mod task;
pub mod workunit;

pub use client::{Client, ClientProfile, ClientStatus};
pub use group::ClientGroup;
pub use job::{Job, JobDocument, JobError, JobInfo, JobState};
pub use task::{IoFile, PartInfo, Task, TaskId, TaskState, UNRESOLVED_NODE};
pub use workunit::{Command, WorkState, Workunit, WorkunitId};
