pub mod config_repo;
pub mod job_run_repo;
pub mod record_repo;

pub use config_repo::ConfigRepository;
pub use job_run_repo::{JobRunEntry, JobRunRepository};
pub use record_repo::{RecordRepository, TransitionChanges, UpsertOutcome};
