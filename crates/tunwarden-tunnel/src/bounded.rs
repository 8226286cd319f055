//! Bounded execution of blocking driver and OS calls

use crate::error::{TunnelError, TunnelResult};
use std::time::Duration;

/// Run a blocking call on the blocking pool, giving up after `limit`.
///
/// The call itself cannot be cancelled; on timeout it keeps running in the
/// background and its result is discarded.
pub async fn run_bounded<T, F>(op: &'static str, limit: Duration, f: F) -> TunnelResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> TunnelResult<T> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(TunnelError::Io(std::io::Error::other(format!(
            "{} panicked: {}",
            op, join_err
        )))),
        Err(_) => {
            tracing::error!("{} did not complete within {:?}", op, limit);
            Err(TunnelError::Timeout(op.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_result() {
        let value = run_bounded("add", Duration::from_secs(5), || Ok(2 + 2))
            .await
            .unwrap();
        assert_eq!(value, 4);
    }

    #[tokio::test]
    async fn test_propagates_error() {
        let result: TunnelResult<()> = run_bounded("fail", Duration::from_secs(5), || {
            Err(TunnelError::Route("no such device".into()))
        })
        .await;
        assert!(matches!(result, Err(TunnelError::Route(_))));
    }

    #[tokio::test]
    async fn test_times_out() {
        let result = run_bounded("hang", Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        })
        .await;
        match result {
            Err(TunnelError::Timeout(op)) => assert_eq!(op, "hang"),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
