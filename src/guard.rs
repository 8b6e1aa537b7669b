//! Per-user in-flight limit applied by callers before running the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::llm::{ImageModel, VisionModel};
use crate::pipeline::{GenerationInput, GenerationResult, TryOnPipeline};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardRejection {
    #[error("a try-on is already in progress; retry after {retry_after_secs}s")]
    AlreadyInProgress { retry_after_secs: u64 },
}

#[derive(Debug, Clone)]
pub struct InFlightGuard {
    limit: usize,
    retry_after_secs: u64,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

/// Releases its slot when dropped.
#[derive(Debug)]
pub struct InFlightPermit {
    user_id: String,
    active: Arc<Mutex<HashMap<String, usize>>>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut active = self.active.lock();
        if let Some(count) = active.get_mut(&self.user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                active.remove(&self.user_id);
            }
        }
    }
}

impl InFlightGuard {
    pub fn new(limit: usize, retry_after_secs: u64) -> Self {
        InFlightGuard {
            limit: limit.max(1),
            retry_after_secs,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        InFlightGuard::new(
            config.max_inflight_per_user,
            config.inflight_retry_after_seconds,
        )
    }

    pub fn try_acquire(&self, user_id: &str) -> Result<InFlightPermit, GuardRejection> {
        let mut active = self.active.lock();
        let count = active.entry(user_id.to_string()).or_insert(0);
        if *count >= self.limit {
            debug!(user_id, active = *count, "Rejecting concurrent try-on");
            return Err(GuardRejection::AlreadyInProgress {
                retry_after_secs: self.retry_after_secs,
            });
        }
        *count += 1;
        Ok(InFlightPermit {
            user_id: user_id.to_string(),
            active: Arc::clone(&self.active),
        })
    }

    pub fn active(&self, user_id: &str) -> usize {
        self.active.lock().get(user_id).copied().unwrap_or(0)
    }
}

/// Pipeline plus the per-user guard, as a caller would deploy them.
pub struct TryOnService<V, R> {
    pipeline: TryOnPipeline<V, R>,
    guard: InFlightGuard,
}

impl<V: VisionModel, R: ImageModel> TryOnService<V, R> {
    pub fn new(pipeline: TryOnPipeline<V, R>, guard: InFlightGuard) -> Self {
        TryOnService { pipeline, guard }
    }

    pub fn guard(&self) -> &InFlightGuard {
        &self.guard
    }

    pub async fn generate_for_user(
        &self,
        user_id: &str,
        input: GenerationInput,
    ) -> Result<GenerationResult, GuardRejection> {
        let _permit = self.guard.try_acquire(user_id)?;
        let result = self.pipeline.run(input).await;
        info!(
            user_id,
            success = result.success,
            request_id = %result.debug.request_id,
            "Try-on finished for user"
        );
        Ok(result)
    }
}
