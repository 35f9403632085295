use std::sync::Arc;

/// Collaborator for anomalies that must be recorded but are not fatal.
///
/// Unknown policy actions, signal-buffer overflow and crashed engines end up
/// here instead of being swallowed.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, tag: &str, message: &str);
}

pub type SharedErrorReporter = Arc<dyn ErrorReporter>;

/// Forwards reports to the `tracing` error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogErrorReporter;

impl ErrorReporter for LogErrorReporter {
    fn report(&self, tag: &str, message: &str) {
        tracing::error!(tag, "{message}");
    }
}

impl LogErrorReporter {
    pub fn shared() -> SharedErrorReporter {
        Arc::new(Self)
    }
}

/// Discards every report
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopErrorReporter;

impl ErrorReporter for NoopErrorReporter {
    fn report(&self, _tag: &str, _message: &str) {}
}
