//! Logging setup and operation timing.

use std::env;
use std::fmt::Display;
use std::io;
use std::time::Instant;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{RunnerError, RunnerResult};

const DEFAULT_FILTER: &str = "shannon_sandbox_runner=info";

/// Install the global tracing subscriber.
///
/// Honors `RUST_LOG` for filtering and `LOG_FORMAT=json` for structured output.
/// Events go to stderr so command output on stdout stays machine-readable.
pub fn init_tracing() -> RunnerResult<()> {
    let subscriber = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| DEFAULT_FILTER.into()),
    );

    let result = if env::var("LOG_FORMAT").unwrap_or_default() == "json" {
        subscriber
            .with(fmt::layer().json().with_writer(io::stderr))
            .try_init()
    } else {
        subscriber.with(fmt::layer().with_writer(io::stderr)).try_init()
    };

    result.map_err(|e| RunnerError::Configuration(format!("failed to install tracing: {e}")))
}

/// Times a long-running step (VM creation, snapshot transfer) and logs its
/// outcome with the duration in milliseconds.
#[derive(Debug)]
pub struct OpTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl OpTimer {
    #[must_use]
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        tracing::debug!(component, operation, "Operation started");
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }

    /// Failures are logged at warn level; the caller decides whether they matter
    pub fn finish_with_result<T, E: Display>(self, result: Result<&T, &E>) {
        let duration_ms = self.start.elapsed().as_millis();
        let (component, operation) = (self.component, self.operation);

        match result {
            Ok(_) => tracing::info!(component, operation, duration_ms, "Operation completed"),
            Err(e) => {
                tracing::warn!(component, operation, duration_ms, error = %e, "Operation failed");
            }
        }
    }
}
