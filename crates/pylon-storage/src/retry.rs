//! Bounded retry for compare-and-swap conflicts
//!
//! Read-modify-write operations race against concurrent writers. Conflicts
//! are retried a small number of times with exponential backoff and jitter;
//! a conflict that persists past the limit is surfaced to the caller.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::{Result, StorageError};

/// Maximum number of attempts before a conflict is surfaced
pub const MAX_CAS_ATTEMPTS: u32 = 5;

const INITIAL_DELAY: Duration = Duration::from_millis(10);

/// Run `operation`, retrying on [`StorageError::Conflict`] up to
/// [`MAX_CAS_ATTEMPTS`] times
///
/// Any other error, including `NotFound`, is terminal and returned on the
/// first occurrence.
pub async fn retry_on_conflict<T, F, Fut>(operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match operation().await {
            Err(StorageError::Conflict) if attempt < MAX_CAS_ATTEMPTS => {
                // 0.5x to 1.5x jitter on the backoff
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                warn!(
                    operation = %operation_name,
                    attempt,
                    delay_ms = jittered.as_millis() as u64,
                    "compare-and-swap conflict, retrying"
                );
                tokio::time::sleep(jittered).await;
                delay *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn returns_first_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_on_conflict("test", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_conflicts_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = retry_on_conflict("test", move || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StorageError::Conflict)
                } else {
                    Ok("ok")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn persistent_conflict_is_surfaced_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_on_conflict("test", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::Conflict)
            }
        })
        .await;
        assert!(matches!(result, Err(StorageError::Conflict)));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_CAS_ATTEMPTS);
    }

    #[tokio::test]
    async fn not_found_is_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result: Result<()> = retry_on_conflict("test", move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(StorageError::NotFound)
            }
        })
        .await;
        assert!(matches!(result, Err(StorageError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
