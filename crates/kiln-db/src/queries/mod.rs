//! Query functions, one module per aggregate.
//!
//! Every function takes an executor and returns `anyhow::Result`; status
//! transitions use optimistic `WHERE status = $from` guards and report the
//! affected row count so callers can detect lost races.

pub mod agent_runs;
pub mod artifacts;
pub mod audit;
pub mod dead_letters;
pub mod jobs;
pub mod pipeline_runs;
pub mod pipeline_steps;
pub mod projects;
pub mod retry_jobs;
pub mod tasks;
