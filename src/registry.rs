//! Correlation registry: FIFO of pending API-reply promises plus a keyed
//! map of pending background-job promises (spec.md §4.D).

use std::collections::{HashMap, VecDeque};

use tokio::sync::{oneshot, Mutex};
use tracing::warn;

use crate::error::{EslError, EslResult};
use crate::event::EslEvent;
use crate::message::EslMessage;

type ApiReply = EslResult<EslMessage>;
type JobReply = EslResult<EslEvent>;

/// Per-connection correlation state. `pendingApi` ordering rationale: ESL
/// guarantees replies are sent in the same order as the commands that
/// produced them on one socket, so head-pop matches head-push under the
/// write mutex the command writer holds while enqueuing.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending_api: Mutex<VecDeque<oneshot::Sender<ApiReply>>>,
    pending_jobs: Mutex<HashMap<String, oneshot::Sender<JobReply>>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a new pending API-reply slot. Must be called inside the same
    /// critical section that writes the command to the socket, so FIFO
    /// order matches wire order.
    pub async fn enqueue_api(&self) -> oneshot::Receiver<ApiReply> {
        let (tx, rx) = oneshot::channel();
        self.pending_api.lock().await.push_back(tx);
        rx
    }

    /// Complete the oldest pending API reply. If none is outstanding, the
    /// frame is logged and dropped — the spec's resolution for a reply
    /// arriving after its call was cancelled or timed out.
    pub async fn complete_next_api(&self, result: ApiReply) {
        let mut pending = self.pending_api.lock().await;
        match pending.pop_front() {
            Some(tx) => {
                // A dropped receiver (the caller gave up) is not an error here.
                let _ = tx.send(result);
            }
            None => {
                warn!("api/command reply arrived with no pending request; dropping");
            }
        }
    }

    /// Register a new pending background job. Returns `DuplicateJobId` if
    /// `job_uuid` is already outstanding; the caller's (new) request is
    /// failed synchronously rather than silently overwriting the live one.
    pub async fn register_job(&self, job_uuid: String) -> EslResult<oneshot::Receiver<JobReply>> {
        let mut jobs = self.pending_jobs.lock().await;
        if jobs.contains_key(&job_uuid) {
            return Err(EslError::DuplicateJobId(job_uuid));
        }
        let (tx, rx) = oneshot::channel();
        jobs.insert(job_uuid, tx);
        Ok(rx)
    }

    /// Complete the job matching `job_uuid`, if any is outstanding. Returns
    /// `true` if a pending job was found and completed — callers use this
    /// to decide whether the event was a bgapi completion (and therefore
    /// must *not* additionally be delivered to the listener) or an ordinary
    /// event.
    pub async fn complete_job(&self, job_uuid: &str, event: EslEvent) -> bool {
        let mut jobs = self.pending_jobs.lock().await;
        match jobs.remove(job_uuid) {
            Some(tx) => {
                let _ = tx.send(Ok(event));
                true
            }
            None => false,
        }
    }

    /// Drop any FIFO entries whose receiver has already gone away (timed out
    /// or cancelled). Called from `ConnectionShared::call` right after a
    /// call's own deadline expires, so the expired entry is reclaimed
    /// immediately instead of sitting in `pendingApi` until a late reply (or
    /// connection teardown) discovers it (spec.md §4.D).
    pub async fn prune_closed_api_slots(&self) {
        let mut pending = self.pending_api.lock().await;
        pending.retain(|tx| !tx.is_closed());
    }

    /// Fail every outstanding API and job promise with a connection-level
    /// cause. `make_err` is invoked once per outstanding entry since
    /// `EslError` does not implement `Clone` (it wraps `std::io::Error`).
    pub async fn fail_all<F: Fn() -> EslError>(&self, make_err: F) {
        let mut pending = self.pending_api.lock().await;
        while let Some(tx) = pending.pop_front() {
            let _ = tx.send(Err(make_err()));
        }
        drop(pending);

        let mut jobs = self.pending_jobs.lock().await;
        for (_, tx) in jobs.drain() {
            let _ = tx.send(Err(make_err()));
        }
    }

    #[cfg(test)]
    pub async fn pending_api_len(&self) -> usize {
        self.pending_api.lock().await.len()
    }

    #[cfg(test)]
    pub async fn pending_jobs_len(&self) -> usize {
        self.pending_jobs.lock().await.len()
    }
}
