//! Exponential-backoff retry scheduling.

use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use kiln_db::models::RetryJob;
use kiln_db::queries::retry_jobs as retry_db;

/// Schedules retry jobs for failed pipeline steps.
pub struct RetryScheduler;

impl RetryScheduler {
    /// Backoff before the next retry of a step, in seconds: `2 ^
    /// retry_count`, so 0 -> 1 s, 1 -> 2 s, 2 -> 4 s, 3 -> 8 s.
    pub fn backoff_seconds(retry_count: i32) -> i64 {
        1_i64 << retry_count.clamp(0, 62)
    }

    /// Persist a retry job for a failed step.
    ///
    /// `retry_count` is the number of retries the step has consumed so
    /// far; the job carries the 1-indexed attempt it represents and a
    /// `scheduled_at` one backoff interval in the future.
    pub async fn schedule_retry(
        pool: &PgPool,
        step_run_id: Uuid,
        retry_count: i32,
    ) -> Result<RetryJob> {
        let delay = Duration::seconds(Self::backoff_seconds(retry_count));
        let scheduled_at = Utc::now() + delay;

        retry_db::insert_retry_job(pool, step_run_id, retry_count + 1, scheduled_at).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        assert_eq!(RetryScheduler::backoff_seconds(0), 1);
        assert_eq!(RetryScheduler::backoff_seconds(1), 2);
        assert_eq!(RetryScheduler::backoff_seconds(2), 4);
        assert_eq!(RetryScheduler::backoff_seconds(3), 8);
    }

    #[test]
    fn backoff_is_clamped_against_overflow() {
        assert_eq!(RetryScheduler::backoff_seconds(100), 1_i64 << 62);
        assert_eq!(RetryScheduler::backoff_seconds(-5), 1);
    }
}
