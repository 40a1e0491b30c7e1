//! Store-backed per-node FIFO view and the cancellation rules.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{GridqError, Result};
use crate::scheduler::job::Job;
use crate::store::{CancelOutcome, Store};

/// Thin authority over the pending view: claiming is delegated to the
/// store's atomic queued->launching transition; this type owns the
/// ownership and state rules around cancellation.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<Store>,
}

impl Scheduler {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Oldest queued job for the node, moved out of the ready view.
    pub fn next_for_node(&self, node: usize) -> Result<Option<Job>> {
        self.store.claim_next_for_node(node)
    }

    /// Cancel a job on behalf of `principal`. Owners and admins only;
    /// valid while the job is queued, launching or running.
    pub fn cancel(&self, job_id: &Uuid, principal: &str, is_admin: bool) -> Result<CancelOutcome> {
        let job = self.store.get_job(job_id)?;
        if !is_admin && job.principal != principal {
            return Err(GridqError::Forbidden(format!(
                "job {job_id} is not owned by {principal}"
            )));
        }
        let outcome = self.store.cancel_job(job_id)?;
        tracing::info!(
            job_id = %job_id,
            principal,
            outcome = ?outcome,
            "cancellation accepted"
        );
        Ok(outcome)
    }

    /// 0-indexed position among queued jobs on the job's node.
    pub fn queue_position(&self, job_id: &Uuid) -> Result<Option<i64>> {
        self.store.queue_position(job_id)
    }
}
