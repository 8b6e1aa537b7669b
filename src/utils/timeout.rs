use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Outcome of racing an operation against a deadline.
#[derive(Debug, Clone, PartialEq)]
pub enum Raced<T> {
    Completed(T),
    TimedOut(T),
    Aborted(T),
}

impl<T> Raced<T> {
    pub fn into_inner(self) -> T {
        match self {
            Raced::Completed(value) | Raced::TimedOut(value) | Raced::Aborted(value) => value,
        }
    }

    pub fn used_fallback(&self) -> bool {
        !matches!(self, Raced::Completed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Raced::Completed(_) => "completed",
            Raced::TimedOut(_) => "timed_out",
            Raced::Aborted(_) => "aborted",
        }
    }
}

/// Runs `operation` on a detached task and waits at most `duration` for it.
///
/// A task that loses the race keeps running until its own I/O finishes; its
/// result is dropped. A task that panics yields the fallback as well.
pub async fn with_timeout<T, F>(label: &str, duration: Duration, fallback: T, operation: F) -> Raced<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(operation);
    match tokio::time::timeout(duration, handle).await {
        Ok(Ok(value)) => Raced::Completed(value),
        Ok(Err(err)) => {
            warn!(operation = label, "Task failed before completing: {}", err);
            Raced::Aborted(fallback)
        }
        Err(_) => {
            warn!(
                operation = label,
                timeout_ms = duration.as_millis() as u64,
                "Operation timed out; using fallback and detaching task"
            );
            Raced::TimedOut(fallback)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_operation_value_when_it_wins() {
        let raced = with_timeout("fast", Duration::from_millis(500), 0u32, async { 7u32 }).await;
        assert_eq!(raced, Raced::Completed(7));
        assert!(!raced.used_fallback());
    }

    #[tokio::test]
    async fn returns_fallback_when_deadline_passes() {
        let raced = with_timeout("slow", Duration::from_millis(20), "fallback", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            "late"
        })
        .await;
        assert_eq!(raced, Raced::TimedOut("fallback"));
        assert_eq!(raced.label(), "timed_out");
    }

    #[tokio::test]
    async fn returns_fallback_when_task_panics() {
        let raced = with_timeout("panics", Duration::from_millis(500), 1u8, async {
            if true {
                panic!("boom");
            }
            2u8
        })
        .await;
        assert_eq!(raced, Raced::Aborted(1));
    }
}
