use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::info;

use crate::utils::logging::TIMING_TARGET;

/// Wall-clock bookkeeping for one pipeline run, mirrored into the timing log.
#[derive(Debug)]
pub struct RunTimer {
    request_id: String,
    started_at: DateTime<Utc>,
    started_perf: Instant,
    completed: bool,
}

impl RunTimer {
    pub fn start(request_id: &str, aspect_ratio: &str) -> Self {
        let timer = RunTimer {
            request_id: request_id.to_string(),
            started_at: Utc::now(),
            started_perf: Instant::now(),
            completed: false,
        };
        info!(
            target: TIMING_TARGET,
            "event=run_started request_id={} aspect_ratio={} started_at={}",
            timer.request_id,
            aspect_ratio,
            timer.started_at.to_rfc3339()
        );
        timer
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started_perf.elapsed().as_millis() as u64
    }

    pub fn complete(&mut self, success: bool, render_calls: u32, retried: bool) {
        if self.completed {
            return;
        }
        self.completed = true;
        info!(
            target: TIMING_TARGET,
            "event=run_completed request_id={} started_at={} completed_at={} duration_s={:.3} success={} render_calls={} retried={}",
            self.request_id,
            self.started_at.to_rfc3339(),
            Utc::now().to_rfc3339(),
            self.started_perf.elapsed().as_secs_f64(),
            success,
            render_calls,
            retried
        );
    }
}

/// Measures one pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct StageClock {
    started: Instant,
}

impl StageClock {
    pub fn start() -> Self {
        StageClock {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Awaits `future` and reports how long it took on its own.
pub async fn timed<F: std::future::Future>(future: F) -> (F::Output, u64) {
    let clock = StageClock::start();
    let output = future.await;
    (output, clock.elapsed_ms())
}

pub async fn log_llm_timing<T, F, Fut>(
    provider: &str,
    model: &str,
    operation: &str,
    metadata: Option<JsonValue>,
    call: F,
) -> Result<T, anyhow::Error>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T, anyhow::Error>>,
{
    let started_at = Utc::now();
    let started_perf = Instant::now();
    let metadata_text = metadata
        .as_ref()
        .map(|value| value.to_string())
        .unwrap_or_else(|| "{}".to_string());
    info!(
        target: TIMING_TARGET,
        "event=llm_request provider={} model={} operation={} started_at={} metadata={}",
        provider,
        model,
        operation,
        started_at.to_rfc3339(),
        metadata_text
    );

    let result = call().await;
    let status = if result.is_err() { "error" } else { "success" };

    info!(
        target: TIMING_TARGET,
        "event=llm_response provider={} model={} operation={} completed_at={} duration_s={:.3} status={} metadata={}",
        provider,
        model,
        operation,
        Utc::now().to_rfc3339(),
        started_perf.elapsed().as_secs_f64(),
        status,
        metadata_text
    );

    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;
    use tracing::{Event, Subscriber};
    use tracing_subscriber::layer::{Context, SubscriberExt};
    use tracing_subscriber::Layer;

    use super::*;

    #[derive(Clone, Default)]
    struct TargetRecorder {
        targets: Arc<Mutex<Vec<String>>>,
    }

    impl<S: Subscriber> Layer<S> for TargetRecorder {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            self.targets.lock().push(event.metadata().target().to_string());
        }
    }

    #[tokio::test]
    async fn timing_events_use_the_timing_target() {
        let recorder = TargetRecorder::default();
        let _guard =
            tracing::subscriber::set_default(tracing_subscriber::registry().with(recorder.clone()));

        let mut timer = RunTimer::start("req-1", "4:5");
        let value = log_llm_timing("test", "model", "analyze", None, || async {
            Ok::<_, anyhow::Error>(7)
        })
        .await
        .unwrap();
        timer.complete(true, 1, false);
        timer.complete(true, 1, false);

        assert_eq!(value, 7);
        let targets = recorder.targets.lock().clone();
        assert_eq!(targets.len(), 4);
        assert!(targets.iter().all(|target| target == TIMING_TARGET));
    }

    #[tokio::test]
    async fn timed_reports_its_own_duration() {
        let (value, elapsed) = timed(async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            "done"
        })
        .await;
        assert_eq!(value, "done");
        assert!(elapsed >= 30);
    }
}
