//! Error-reporting hook
//!
//! Runtime faults that never reach a caller (a session that failed to dial,
//! an accept error) are pushed through an [`ErrorReporter`]. Reporting is
//! fire-and-forget: it never blocks and never fails.

use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A reported runtime fault
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Where the fault happened (e.g. "tcp accept")
    pub context: String,
    /// Human readable description
    pub message: String,
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.message)
    }
}

type Sink = Arc<dyn Fn(ErrorReport) + Send + Sync>;

/// Cloneable, non-blocking error hook
#[derive(Clone, Default)]
pub struct ErrorReporter {
    sink: Option<Sink>,
}

impl ErrorReporter {
    /// Reporter that drops every report
    pub fn noop() -> Self {
        ErrorReporter { sink: None }
    }

    /// Reporter that logs every report as an error
    pub fn log() -> Self {
        Self::from_fn(|report| tracing::error!("{}", report))
    }

    /// Reporter backed by a callback
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(ErrorReport) + Send + Sync + 'static,
    {
        ErrorReporter {
            sink: Some(Arc::new(f)),
        }
    }

    /// Reporter backed by an unbounded channel
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ErrorReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reporter = Self::from_fn(move |report| {
            // Receiver gone means nobody is listening any more
            let _ = tx.send(report);
        });
        (reporter, rx)
    }

    /// Report a fault
    pub fn report(&self, context: &str, err: &dyn fmt::Display) {
        if let Some(sink) = &self.sink {
            sink(ErrorReport {
                context: context.to_string(),
                message: err.to_string(),
            });
        }
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("attached", &self.sink.is_some())
            .finish()
    }
}
