//! Shared error types for the dataflow runtime core.
//!
//! The five kinds below follow the error-handling design directly: lookup
//! misses and transient I/O are meant to be handled (callers get `None`-like
//! values, not a crashed thread); malformed input and policy violations carry
//! enough context to name the offending field; capacity exhaustion is the
//! only kind that is ever fatal to the process.

use std::fmt;

/// A qualified name / option name / field name attached to an error as it
/// propagates up through nested operations. Cheap to clone; usually a small
/// number of segments (element path components).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext(Vec<String>);

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(mut self, segment: impl Into<String>) -> Self {
        self.0.push(segment.into());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return Ok(());
        }
        write!(f, " (in {})", self.0.join(" / "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Handle stamp mismatch, missing type, missing parameter. Non-fatal;
    /// callers treat this as "absent" rather than unwind.
    #[error("lookup miss: {what}{context}")]
    LookupMiss { what: String, context: ErrorContext },

    /// Too many elements, too many ports. Fatal: surfaces at allocation and
    /// the process is expected to abort (see [`abort_on_capacity_exceeded`]).
    #[error("capacity exceeded: {resource} (limit {limit}){context}")]
    CapacityExceeded {
        resource: &'static str,
        limit: u32,
        context: ErrorContext,
    },

    /// Bad XML, unknown type name, unparsable parameter value.
    #[error("malformed input in field `{field}`: {message}{context}")]
    MalformedInput {
        field: String,
        message: String,
        context: ErrorContext,
    },

    /// Connect incompatible types, add child after init. Rejected with a
    /// warning; the request has no effect.
    #[error("policy violation: {message}{context}")]
    PolicyViolation { message: String, context: ErrorContext },

    /// Config file not yet readable, etc. Treated as absent; defaults apply.
    #[error("transient I/O: {message}{context}")]
    TransientIo { message: String, context: ErrorContext },
}

impl CoreError {
    pub fn lookup_miss(what: impl Into<String>) -> Self {
        CoreError::LookupMiss {
            what: what.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn capacity_exceeded(resource: &'static str, limit: u32) -> Self {
        CoreError::CapacityExceeded {
            resource,
            limit,
            context: ErrorContext::new(),
        }
    }

    pub fn malformed_input(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::MalformedInput {
            field: field.into(),
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn policy_violation(message: impl Into<String>) -> Self {
        CoreError::PolicyViolation {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn transient_io(message: impl Into<String>) -> Self {
        CoreError::TransientIo {
            message: message.into(),
            context: ErrorContext::new(),
        }
    }

    /// Attach a context segment (element qualified name, option name, ...).
    /// Deep operations call this as errors propagate up, per the error
    /// propagation rule.
    pub fn with_context(self, segment: impl Into<String>) -> Self {
        match self {
            CoreError::LookupMiss { what, context } => CoreError::LookupMiss {
                what,
                context: context.push(segment),
            },
            CoreError::CapacityExceeded {
                resource,
                limit,
                context,
            } => CoreError::CapacityExceeded {
                resource,
                limit,
                context: context.push(segment),
            },
            CoreError::MalformedInput {
                field,
                message,
                context,
            } => CoreError::MalformedInput {
                field,
                message,
                context: context.push(segment),
            },
            CoreError::PolicyViolation { message, context } => CoreError::PolicyViolation {
                message,
                context: context.push(segment),
            },
            CoreError::TransientIo { message, context } => CoreError::TransientIo {
                message,
                context: context.push(segment),
            },
        }
    }

    /// Only capacity-exceeded aborts the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::CapacityExceeded { .. })
    }
}

/// Extension trait mirroring `anyhow::Context`, but producing a typed
/// [`CoreError`] so library code keeps structured errors while still reading
/// like the teacher's `anyhow` call sites.
pub trait Context<T> {
    fn context(self, segment: impl Into<String>) -> Result<T, CoreError>;
}

impl<T> Context<T> for Result<T, CoreError> {
    fn context(self, segment: impl Into<String>) -> Result<T, CoreError> {
        self.map_err(|e| e.with_context(segment))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Logs the fatal condition, then aborts the process. Centralized so tests
/// can call [`log_capacity_exceeded`] to exercise the logging half without
/// taking the process down.
pub fn abort_on_capacity_exceeded(err: &CoreError) -> ! {
    log_capacity_exceeded(err);
    std::process::abort();
}

pub fn log_capacity_exceeded(err: &CoreError) {
    tracing::error!(target: "df.error", error = %err, "fatal: register capacity exhausted");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_miss_is_not_fatal() {
        let e = CoreError::lookup_miss("handle 42");
        assert!(!e.is_fatal());
    }

    #[test]
    fn capacity_exceeded_is_fatal() {
        let e = CoreError::capacity_exceeded("ports", 65536);
        assert!(e.is_fatal());
    }

    #[test]
    fn context_accumulates_in_order() {
        let e: Result<(), CoreError> = Err(CoreError::malformed_input("type", "unknown type name"));
        let e = e.context("Root.Group").context("speed").unwrap_err();
        let msg = e.to_string();
        assert!(msg.contains("Root.Group"));
        assert!(msg.contains("speed"));
        assert!(msg.find("Root.Group").unwrap() < msg.find("speed").unwrap());
    }
}
