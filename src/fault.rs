use std::any::Any;
use std::backtrace::Backtrace;
use std::sync::Arc;

use thiserror::Error;

/// Deduplication faults.
///
/// A fault is decided exactly once per call, by whichever task executes the
/// work, and every waiter for that call observes the same fault.
#[derive(Clone, Debug, Error)]
pub enum CoalesceError<E> {
    /// The work function returned its own error.
    #[error("{0}")]
    Work(E),
    /// The caller's cancellation token fired before the shared work finished.
    #[error("wait abandoned before the shared work completed")]
    Cancelled,
    /// The future executing the work went away without producing an outcome,
    /// usually because the task driving it was aborted or dropped mid-flight.
    #[error("work ended without producing an outcome")]
    Interrupted,
}

/// A panic intercepted inside a deduplicated call, ready to be re-raised.
///
/// Holds the original panic message and a snapshot of the stack captured at
/// the interception point. Calls that end this way re-raise the panic rather
/// than downgrade it to an error value: the first caller unwinds with this
/// payload, and so does every waiter that joined through
/// [`Group::execute`](crate::Group::execute). Catching the unwind and
/// downcasting to `CaughtPanic` recovers the details.
#[derive(Clone, Debug, Error)]
#[error("{message}\n\n{backtrace}")]
pub struct CaughtPanic {
    message: Arc<str>,
    backtrace: Arc<str>,
}

impl CaughtPanic {
    pub(crate) fn intercept(payload: Box<dyn Any + Send>) -> Self {
        let message: Arc<str> = if let Some(text) = payload.downcast_ref::<&'static str>() {
            Arc::from(*text)
        } else if let Some(text) = payload.downcast_ref::<String>() {
            Arc::from(text.as_str())
        } else {
            Arc::from("non-string panic payload")
        };
        Self {
            message,
            backtrace: Arc::from(Backtrace::force_capture().to_string().as_str()),
        }
    }

    /// The panic message, when the payload was a string; a placeholder otherwise.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The stack captured where the panic was intercepted.
    pub fn backtrace(&self) -> &str {
        &self.backtrace
    }
}
