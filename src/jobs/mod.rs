//! Job lifecycle: admission, supervision, scheduling and recovery.

pub mod admission;
pub mod invocation;
pub mod model;
pub mod recovery;
pub mod registry;
pub mod scheduler;
pub mod supervisor;

pub use admission::{AdmissionPermit, AdmissionRejected, AdmissionSemaphore};
pub use model::{Job, JobId, JobOptions, JobSpec, JobStatus, JobType};
pub use recovery::RecoveryManager;
pub use registry::JobRegistry;
pub use scheduler::JobScheduler;
pub use supervisor::{ExitOutcome, ProcessSupervisor};
