//! Request handlers.
//!
//! A [`Handler`] turns one request line into one [`Response`]. The connection
//! loop decides whether the handler runs inline or on its own task; handlers
//! themselves know nothing about shutdown.

use crate::config::TransactionConfig;
use crate::protocol::{Request, Response};
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Resolves a response for a single request line.
///
/// Implementations must be shareable across connection tasks. The returned
/// future may be moved onto a separate task and abandoned there, so it must
/// not rely on being polled to completion.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, request: String) -> impl Future<Output = Response> + Send;
}

/// Simulated payment processor.
///
/// Valid requests with an amount above `delay_threshold` sleep for `amount`
/// milliseconds, capped at `max_delay`, before being accepted.
#[derive(Debug, Clone)]
pub struct TransactionHandler {
    delay_threshold: u64,
    max_delay: Duration,
}

impl TransactionHandler {
    pub fn new(config: &TransactionConfig) -> Self {
        Self {
            delay_threshold: config.delay_threshold,
            max_delay: config.max_delay,
        }
    }

    /// Processing delay for a validated request
    pub fn processing_delay(&self, request: &Request) -> Option<Duration> {
        if request.amount <= self.delay_threshold {
            return None;
        }
        Some(Duration::from_millis(request.amount).min(self.max_delay))
    }
}

impl Default for TransactionHandler {
    fn default() -> Self {
        Self::new(&TransactionConfig::default())
    }
}

impl Handler for TransactionHandler {
    async fn handle(&self, request: String) -> Response {
        let request = match Request::parse(&request) {
            Ok(request) => request,
            Err(e) => {
                trace!(error = %e, "Rejected request");
                return e.into();
            }
        };

        if let Some(delay) = self.processing_delay(&request) {
            trace!(amount = request.amount, delay_ms = delay.as_millis() as u64, "Processing");
            tokio::time::sleep(delay).await;
        }

        Response::Accepted
    }
}
