//! Unified error handling for stagehand
//!
//! This module provides a centralized error type system so the deployment,
//! service and component modules do not need to depend on each other for
//! error handling.

use std::fmt;

/// Unified error types for the deployment runtime
#[derive(Debug)]
pub enum DeployError {
    /// A write-once attachment key was set twice
    DuplicateAttachment(String),

    /// A deployment processor failed; aborts the owning unit's pipeline
    Processing {
        processor: String,
        unit: String,
        cause: Box<DeployError>,
    },

    /// A service name was registered twice
    DuplicateService(String),

    /// Service registration would close a dependency cycle
    CycleDetected(Vec<String>),

    /// A service start action failed
    StartFailed {
        service: String,
        cause: Box<DeployError>,
    },

    /// An interceptor binding referenced an unknown handler or method
    InterceptorBinding(String),

    /// A lifecycle binding referenced an unknown method
    LifecycleBinding(String),

    /// A component instance was requested outside the started window
    ComponentNotAvailable(String),

    /// Configuration-related errors
    Configuration(String),

    /// A component method raised an error; passes through chains unmodified
    Invocation(String),

    /// The interceptor chain itself is broken (not the invoked target)
    InterceptorChain(String),

    /// I/O errors
    Io(std::io::Error),

    /// Internal system errors
    Internal(String),
}

impl DeployError {
    /// Format a dependency cycle as `a -> b -> a`.
    fn format_cycle(cycle: &[String]) -> String {
        let mut path = cycle.join(" -> ");
        if let Some(first) = cycle.first() {
            path.push_str(" -> ");
            path.push_str(first);
        }
        path
    }
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployError::DuplicateAttachment(key) => {
                write!(f, "Attachment already present for key: {key}")
            }
            DeployError::Processing {
                processor,
                unit,
                cause,
            } => write!(
                f,
                "Processor {processor} failed for deployment unit {unit}: {cause}"
            ),
            DeployError::DuplicateService(name) => {
                write!(f, "Service is already registered: {name}")
            }
            DeployError::CycleDetected(cycle) => {
                write!(f, "Service dependency cycle: {}", Self::format_cycle(cycle))
            }
            DeployError::StartFailed { service, cause } => {
                write!(f, "Service {service} failed to start: {cause}")
            }
            DeployError::InterceptorBinding(msg) => {
                write!(f, "Interceptor binding failed: {msg}")
            }
            DeployError::LifecycleBinding(msg) => write!(f, "Lifecycle binding failed: {msg}"),
            DeployError::ComponentNotAvailable(name) => {
                write!(f, "Component is not available: {name}")
            }
            DeployError::Configuration(msg) => write!(f, "Configuration error: {msg}"),
            DeployError::Invocation(msg) => write!(f, "Invocation error: {msg}"),
            DeployError::InterceptorChain(msg) => write!(f, "Interceptor chain error: {msg}"),
            DeployError::Io(err) => write!(f, "I/O error: {err}"),
            DeployError::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for DeployError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeployError::Processing { cause, .. } => Some(cause),
            DeployError::StartFailed { cause, .. } => Some(cause),
            DeployError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for DeployError {
    fn from(err: std::io::Error) -> Self {
        DeployError::Io(err)
    }
}

/// Result type alias for deployment operations
pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Helper trait for adding context to errors
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> DeployResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: fmt::Display,
{
    fn with_context(self, context: &str) -> DeployResult<T> {
        self.map_err(|e| DeployError::Internal(format!("{context}: {e}")))
    }
}
