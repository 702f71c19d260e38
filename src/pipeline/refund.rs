use tracing::{info, warn};

use crate::db::jobs::{JobRecord, JobStore, RefundOutcome};

/// Shared compensation path for the executor's failure branch and the
/// cancellation guard. Returns true when tokens actually moved back.
pub fn refund_after_failure(store: &JobStore, job: &JobRecord) -> bool {
    let refunded = refund(store, job, "failed");
    if !refunded {
        return false;
    }
    match store.mark_refunded_if_failed(job.id.as_str()) {
        Ok(true) => true,
        Ok(false) => {
            // Tokens are back but the job left FAILED in the meantime.
            warn!(job_id = %job.id, "refund landed but job was no longer failed");
            true
        }
        Err(error) => {
            warn!(job_id = %job.id, error = %error, "refund landed but status update failed; manual reconciliation required");
            true
        }
    }
}

/// Cancelled jobs stay CANCELLED; the refund row is the audit record.
pub fn refund_after_cancel(store: &JobStore, job: &JobRecord) -> bool {
    refund(store, job, "cancelled")
}

fn refund(store: &JobStore, job: &JobRecord, reason: &str) -> bool {
    match store.refund_job(job, reason) {
        Ok(RefundOutcome::Refunded { remaining }) => {
            info!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                amount = job.cost,
                remaining,
                reason,
                "job tokens refunded"
            );
            true
        }
        Ok(RefundOutcome::Duplicate) => {
            warn!(job_id = %job.id, reason, "refund skipped: job was already refunded");
            false
        }
        Err(error) => {
            warn!(
                job_id = %job.id,
                owner_id = %job.owner_id,
                amount = job.cost,
                error = %error,
                "refund failed; job left for manual reconciliation"
            );
            false
        }
    }
}
