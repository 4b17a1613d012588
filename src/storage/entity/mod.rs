pub mod engine_config;
pub mod job_run;
pub mod return_record;
