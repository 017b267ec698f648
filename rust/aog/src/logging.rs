//! Logging setup and startup instrumentation.
//!
//! The gateway's bring-up is a fixed sequence of components (store, plugins,
//! engines, scheduler, ...); the helpers here give that sequence a uniform
//! shape in the logs: a banner, one numbered line per step, and per-stage
//! durations from [`OpTimer`].

use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing with an env-filter.
///
/// `RUST_LOG` takes precedence; otherwise `level` is used as the default
/// directive (e.g. `info`, `aog=debug`).
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Duration tracker for one named gateway operation.
///
/// Logs a debug line when the operation begins and an info line with the
/// elapsed milliseconds when [`OpTimer::finish`] consumes it. A timer that
/// is dropped without finishing logs nothing — abandoned stages are already
/// reported by whatever error aborted them.
#[derive(Debug)]
pub struct OpTimer {
    /// Component the operation belongs to (e.g. "scheduler", "plugins").
    component: &'static str,
    /// The operation itself (e.g. "discovery", "build_state").
    operation: String,
    started: Instant,
}

impl OpTimer {
    /// Start timing an operation.
    #[must_use]
    pub fn new(component: &'static str, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        tracing::debug!(component, operation = %operation, "starting");
        Self {
            component,
            operation,
            started: Instant::now(),
        }
    }

    /// Consume the timer and log the elapsed time.
    pub fn finish(self) {
        let elapsed_ms = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        tracing::info!(
            component = self.component,
            operation = %self.operation,
            elapsed_ms,
            "finished"
        );
    }
}

/// Log one numbered startup step.
#[macro_export]
macro_rules! log_init_step {
    ($step:expr, $total:expr, $name:expr, $detail:expr) => {
        tracing::info!(
            step = $step,
            total = $total,
            "startup {}/{}: {} ({})",
            $step,
            $total,
            $name,
            $detail
        );
    };
    ($step:expr, $total:expr, $name:expr) => {
        tracing::info!(step = $step, total = $total, "startup {}/{}: {}", $step, $total, $name);
    };
}

/// Log the completion of a major phase.
#[macro_export]
macro_rules! log_success {
    ($msg:expr) => {
        tracing::info!("✔ {}", $msg);
    };
    ($msg:expr, $($arg:tt)*) => {
        tracing::info!("✔ {}", format!($msg, $($arg)*));
    };
}

/// Log a startup banner.
#[macro_export]
macro_rules! log_banner {
    ($title:expr) => {
        tracing::info!("────────────────────────────────────────");
        tracing::info!("{}", $title);
        tracing::info!("────────────────────────────────────────");
    };
    ($title:expr, $subtitle:expr) => {
        tracing::info!("────────────────────────────────────────");
        tracing::info!("{}", $title);
        tracing::info!("{}", $subtitle);
        tracing::info!("────────────────────────────────────────");
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_op_timer_fields() {
        let timer = OpTimer::new("memory", "register_engine");
        assert_eq!(timer.component, "memory");
        assert_eq!(timer.operation, "register_engine");
        timer.finish();
    }

    #[test]
    fn test_op_timer_drop_without_finish_is_silent() {
        // No panic, no double logging; dropping is a deliberate no-op.
        let _timer = OpTimer::new("plugins", "discovery");
    }
}
