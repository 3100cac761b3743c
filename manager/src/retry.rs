//! Bounded retry for exec-based operations
//!
//! Container exec can transiently fail right after a container starts, so
//! operations that shell into an agent retry a fixed number of times with a
//! fixed delay. Success means exit code zero; after the bound, the last
//! captured output is handed back for the caller to interpret.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Error, Result};
use crate::runtime::ExecOutput;

/// Run `op` up to `attempts` times, sleeping `delay` between tries. A
/// non-zero exit retries; a transport error retries; exit code zero returns
/// immediately. When the bound is exhausted the last `ExecOutput` is
/// returned as-is, or `TransientExecFailure` if no attempt got far enough
/// to produce one.
pub async fn run_with_retry<F, Fut>(attempts: u32, delay: Duration, mut op: F) -> Result<ExecOutput>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ExecOutput>>,
{
    let mut last_output: Option<ExecOutput> = None;
    let mut last_error: Option<Error> = None;

    for attempt in 1..=attempts {
        match op().await {
            Ok(output) if output.exit_code == 0 => return Ok(output),
            Ok(output) => {
                warn!(attempt, exit_code = output.exit_code, "exec returned non-zero, retrying");
                last_output = Some(output);
            }
            Err(e) => {
                warn!(attempt, error = %e, "exec failed, retrying");
                last_error = Some(e);
            }
        }
        if attempt < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    match last_output {
        Some(output) => Ok(output),
        None => Err(Error::TransientExecFailure {
            output: last_error.map(|e| e.to_string()).unwrap_or_default(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn returns_on_first_success() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(2, Duration::from_millis(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(ExecOutput { exit_code: 0, output: "ok".into() }) }
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_failure_then_success_succeeds() {
        let calls = AtomicU32::new(0);
        let result = run_with_retry(2, Duration::from_millis(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Ok(ExecOutput { exit_code: 1, output: "boom".into() })
                } else {
                    Ok(ExecOutput { exit_code: 0, output: "ok".into() })
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausting_the_bound_returns_the_last_output() {
        let result = run_with_retry(2, Duration::from_millis(1), || async {
            Ok(ExecOutput { exit_code: 2, output: "still broken".into() })
        })
        .await
        .unwrap();
        assert_eq!(result.exit_code, 2);
        assert_eq!(result.output, "still broken");
    }

    #[tokio::test]
    async fn all_transport_errors_surface_as_transient_failure() {
        let result = run_with_retry(2, Duration::from_millis(1), || async {
            Err(crate::error::Error::Other("socket hiccup".into()))
        })
        .await;
        assert!(matches!(
            result,
            Err(crate::error::Error::TransientExecFailure { .. })
        ));
    }
}
