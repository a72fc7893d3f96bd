use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Deadline and cancellation applied to every store call of one reconciliation
#[derive(Clone, Debug)]
pub struct CallContext {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a store call, aborting it on cancellation or when the deadline passes
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.timeout, call) => match res {
                Ok(res) => res,
                Err(_) => Err(Error::Timeout(self.timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn passes_through_results() {
        let call = CallContext::new(Duration::from_secs(1), CancellationToken::new());
        let value = call.run(async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_call() {
        let token = CancellationToken::new();
        token.cancel();
        let call = CallContext::new(Duration::from_secs(1), token);

        let res: Result<()> = call.run(std::future::pending()).await;
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let call = CallContext::new(Duration::from_millis(10), CancellationToken::new());

        let res: Result<()> = call.run(std::future::pending()).await;
        assert!(matches!(res, Err(Error::Timeout(_))));
    }
}
