//! The delegation channel: the single gate every worker request passes
//! through.
//!
//! Correctness-critical rules live here as code, not as instructions a
//! language model might follow: depth limiting, target lookup, transcript
//! distillation to the target's capabilities, and panic isolation. Workers
//! reach each other through the same gate via the [`Delegator`] impl, so a
//! nested hop gets exactly the treatment a coordinator-issued one gets.

use async_trait::async_trait;
use futures::FutureExt;
use munin_common::{
    AttachmentSet, DelegationRequest, DelegationResponse, Delegator, Worker, WorkerContext,
    WorkerId, distill,
};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, warn};

/// Registry plus routing rules for worker delegation.
pub struct DelegationChannel {
    workers: BTreeMap<WorkerId, Arc<dyn Worker>>,
    max_depth: u32,
}

impl DelegationChannel {
    pub fn new(workers: Vec<Arc<dyn Worker>>) -> Self {
        Self::with_max_depth(workers, 3)
    }

    pub fn with_max_depth(workers: Vec<Arc<dyn Worker>>, max_depth: u32) -> Self {
        let workers = workers.into_iter().map(|w| (w.id(), w)).collect();
        Self { workers, max_depth }
    }

    pub fn register(&mut self, worker: Arc<dyn Worker>) {
        self.workers.insert(worker.id(), worker);
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = WorkerId> + '_ {
        self.workers.keys().copied()
    }

    /// Send a delegation to its target worker.
    ///
    /// Failures come back inside the response; `send` itself never errors
    /// and never panics, whatever the worker does.
    pub async fn send(
        &self,
        mut request: DelegationRequest,
        attachments: &AttachmentSet,
    ) -> DelegationResponse {
        let target = request.target;

        if request.depth >= self.max_depth {
            warn!(%target, depth = request.depth, "Delegation depth limit reached");
            return DelegationResponse::failed(
                target,
                format!("delegation depth limit of {} reached", self.max_depth),
            );
        }

        let Some(worker) = self.workers.get(&target) else {
            return DelegationResponse::failed(
                target,
                format!("no worker registered for {target}"),
            );
        };
        if !worker.is_available() {
            return DelegationResponse::failed(target, format!("worker {target} is unavailable"));
        }

        // The target sees only what its capabilities entitle it to.
        request.transcript = distill(&request.transcript, worker.capabilities());

        debug!(
            origin = %request.origin,
            %target,
            depth = request.depth,
            task_preview = %request.task.chars().take(60).collect::<String>(),
            "Delegating"
        );

        let context = WorkerContext::new(attachments, self, request.depth);
        let outcome = AssertUnwindSafe(worker.handle(&request, &context))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(reply)) => DelegationResponse::ok(target, reply),
            Ok(Err(err)) => {
                warn!(%target, error = %err, "Worker failed");
                DelegationResponse::failed(target, err.to_string())
            }
            Err(_) => {
                warn!(%target, "Worker panicked while handling a delegation");
                DelegationResponse::failed(target, format!("worker {target} panicked"))
            }
        }
    }
}

#[async_trait]
impl Delegator for DelegationChannel {
    /// Worker-to-worker hops carry no raw files. Workers exchange entity
    /// identifiers, never payloads.
    async fn delegate(&self, request: DelegationRequest) -> DelegationResponse {
        self.send(request, &AttachmentSet::new()).await
    }
}
