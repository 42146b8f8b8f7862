//! Per-error escalation policy
//!
//! A failed connect is recorded and the batch moves on unless the configured
//! [`ErrorHandler`] says otherwise.

use super::phase::ExecutionMode;
use crate::error::ConnectError;

/// What to do with a failed cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDecision {
    /// Record and keep going
    Continue,
    /// Abort the batch with [`crate::Error::Fatal`]
    Escalate,
}

/// Context handed to the error handler
#[derive(Debug, Clone, Copy)]
pub struct CycleContext<'a> {
    /// Phase label
    pub phase: &'a str,
    /// Scheduling model
    pub mode: ExecutionMode,
    /// 1-based cycle index
    pub cycle: u64,
    /// Failures in the phase so far, this one included
    pub failures: u64,
}

/// Decides, per connect failure, whether the batch continues.
///
/// Called after the failed cycle's handle has been released. A handler that
/// panics is treated as returning [`ErrorDecision::Escalate`].
pub trait ErrorHandler: Send + Sync {
    /// Decide on one failure
    fn on_error(&self, ctx: &CycleContext<'_>, error: &ConnectError) -> ErrorDecision;
}

impl<F> ErrorHandler for F
where
    F: Fn(&CycleContext<'_>, &ConnectError) -> ErrorDecision + Send + Sync,
{
    fn on_error(&self, ctx: &CycleContext<'_>, error: &ConnectError) -> ErrorDecision {
        self(ctx, error)
    }
}

/// Never escalates
#[derive(Debug, Clone, Copy, Default)]
pub struct ContinueOnError;

impl ErrorHandler for ContinueOnError {
    fn on_error(&self, _ctx: &CycleContext<'_>, _error: &ConnectError) -> ErrorDecision {
        ErrorDecision::Continue
    }
}

/// Escalates once a phase has seen `nth` failures
#[derive(Debug, Clone, Copy)]
pub struct EscalateOnFailure {
    nth: u64,
}

impl EscalateOnFailure {
    /// Escalate on the `nth` failure of a phase (minimum 1)
    pub fn new(nth: u64) -> Self {
        Self { nth: nth.max(1) }
    }

    /// Escalate on the first failure
    pub fn first() -> Self {
        Self::new(1)
    }
}

impl ErrorHandler for EscalateOnFailure {
    fn on_error(&self, ctx: &CycleContext<'_>, _error: &ConnectError) -> ErrorDecision {
        if ctx.failures >= self.nth {
            ErrorDecision::Escalate
        } else {
            ErrorDecision::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(failures: u64) -> CycleContext<'static> {
        CycleContext {
            phase: "sync",
            mode: ExecutionMode::Sync,
            cycle: failures,
            failures,
        }
    }

    #[test]
    fn test_continue_on_error() {
        let err = ConnectError::ConnectionClosed;
        assert_eq!(ContinueOnError.on_error(&ctx(50), &err), ErrorDecision::Continue);
    }

    #[test]
    fn test_escalate_on_nth_failure() {
        let handler = EscalateOnFailure::new(2);
        let err = ConnectError::ConnectionClosed;
        assert_eq!(handler.on_error(&ctx(1), &err), ErrorDecision::Continue);
        assert_eq!(handler.on_error(&ctx(2), &err), ErrorDecision::Escalate);
    }

    #[test]
    fn test_escalate_zero_means_first() {
        let handler = EscalateOnFailure::new(0);
        assert_eq!(
            handler.on_error(&ctx(1), &ConnectError::ConnectionClosed),
            ErrorDecision::Escalate
        );
    }

    #[test]
    fn test_closure_handler() {
        let handler = |_: &CycleContext<'_>, e: &ConnectError| {
            if matches!(e, ConnectError::Tls(_)) {
                ErrorDecision::Escalate
            } else {
                ErrorDecision::Continue
            }
        };
        assert_eq!(
            handler.on_error(&ctx(1), &ConnectError::Tls("bad cert".into())),
            ErrorDecision::Escalate
        );
        assert_eq!(
            handler.on_error(&ctx(1), &ConnectError::ConnectionClosed),
            ErrorDecision::Continue
        );
    }
}
