//! Error types for wasm-embed.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for every fallible embedding operation
//! - [`HostFunctionError`]: Errors from host function implementations
//! - [`WasiError`]: WASI-related errors

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// Argument-shape errors ([`RuntimeError::SignatureMismatch`],
/// [`RuntimeError::InvalidArgument`], [`RuntimeError::Range`]) are raised by the
/// embedding layer before anything reaches the engine. Every other variant
/// carries what the engine reported.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A file or path could not be read or written.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The binary is malformed (bad magic, truncated section, bad encoding).
    #[error("Parse failed: {reason}")]
    Parse {
        /// Description of the malformation.
        reason: String,
    },

    /// The module violates WebAssembly's static rules.
    #[error("Validation failed: {reason}")]
    Validation {
        /// Human-readable reason reported by the validator.
        reason: String,
    },

    /// An import could not be resolved or did not match during instantiation.
    #[error("Link failed: {reason}")]
    Link {
        /// Description of the link failure.
        reason: String,
    },

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
        /// Trap code if available (e.g. `unreachable`, `interrupt`, `host`).
        code: Option<String>,
    },

    /// Argument count or kinds did not match the function's signature.
    #[error("Signature mismatch: expected ({expected}), got ({actual})")]
    SignatureMismatch {
        /// Declared parameter kinds.
        expected: String,
        /// Kinds actually supplied.
        actual: String,
    },

    /// A required argument was absent or unusable.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// A module name is already registered in the store.
    #[error("Module name conflict: '{name}' is already registered")]
    DuplicateName {
        /// The conflicting name.
        name: String,
    },

    /// An asynchronous result was requested before the execution finished.
    #[error("Async execution has not finished")]
    NotReady,

    /// An asynchronous result was requested after the execution was cancelled.
    #[error("Async execution was cancelled")]
    Cancelled,

    /// Ahead-of-time compilation failed.
    #[error("Compilation failed: {reason}")]
    Compile {
        /// Description of the compilation failure.
        reason: String,
    },

    /// A literal is outside the range its value kind can hold.
    #[error("Value out of range: {value}")]
    Range {
        /// The rejected literal.
        value: String,
    },

    /// The function handle is stale or the named function does not exist.
    #[error("Function not found: {name}")]
    FunctionNotFound {
        /// Name (or description) of the missing function.
        name: String,
    },

    /// Execution consumed more than the configured cost limit.
    #[error("Cost limit exceeded: {limit}")]
    CostLimitExceeded {
        /// The configured limit.
        limit: u64,
    },

    /// The engine rejected an operation on an instance (e.g. setting a const global).
    #[error("Engine error: {message}")]
    Engine {
        /// Message reported by the engine.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// WASI operation failed.
    #[error("WASI error: {0}")]
    Wasi(#[from] WasiError),
}

/// Errors from host function implementations.
///
/// These errors occur when host functions (provided by the embedder to
/// WebAssembly modules) fail to complete their operations.
#[derive(Error, Debug, Clone)]
pub enum HostFunctionError {
    /// The requested operation was denied by the permission system.
    #[error("Permission denied: {resource}")]
    PermissionDenied {
        /// Description of the resource that access was denied to.
        resource: String,
    },

    /// The guest referenced memory outside its linear memory.
    #[error("Memory access out of bounds: offset {offset}, length {len}")]
    MemoryOutOfBounds {
        /// Start offset of the access.
        offset: u64,
        /// Length of the access.
        len: u64,
    },

    /// The calling module does not export a linear memory.
    #[error("Caller has no exported memory")]
    MissingMemory,

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },
}

/// WASI-related errors.
///
/// These errors occur when WASI (WebAssembly System Interface) operations fail.
#[derive(Error, Debug, Clone)]
pub enum WasiError {
    /// A directory could not be preopened.
    #[error("WASI preopen failed: {path}")]
    PreopenFailed {
        /// The preopen entry that failed.
        path: String,
    },

    /// WASI environment configuration error.
    #[error("WASI environment error: {reason}")]
    EnvironmentError {
        /// Description of the environment error.
        reason: String,
    },
}

// `io::Error` is not `Clone`; the copy keeps its kind and message.
impl Clone for RuntimeError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Parse { reason } => Self::parse(reason.clone()),
            Self::Validation { reason } => Self::validation(reason.clone()),
            Self::Link { reason } => Self::link(reason.clone()),
            Self::Trap { message, code } => Self::trap(message.clone(), code.clone()),
            Self::SignatureMismatch { expected, actual } => Self::SignatureMismatch {
                expected: expected.clone(),
                actual: actual.clone(),
            },
            Self::InvalidArgument { reason } => Self::invalid_argument(reason.clone()),
            Self::DuplicateName { name } => Self::duplicate_name(name.clone()),
            Self::NotReady => Self::NotReady,
            Self::Cancelled => Self::Cancelled,
            Self::Compile { reason } => Self::compile(reason.clone()),
            Self::Range { value } => Self::range(value.clone()),
            Self::FunctionNotFound { name } => Self::function_not_found(name.clone()),
            Self::CostLimitExceeded { limit } => Self::CostLimitExceeded { limit: *limit },
            Self::Engine { message } => Self::engine(message.clone()),
            Self::InvalidConfig { reason } => Self::invalid_config(reason.clone()),
            Self::HostFunction(e) => Self::HostFunction(e.clone()),
            Self::Wasi(e) => Self::Wasi(e.clone()),
        }
    }
}

impl RuntimeError {
    /// Create a new `Parse` error.
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }

    /// Create a new `Validation` error.
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Create a new `Link` error.
    pub fn link(reason: impl Into<String>) -> Self {
        Self::Link {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>, code: Option<String>) -> Self {
        Self::Trap {
            message: message.into(),
            code,
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `DuplicateName` error.
    pub fn duplicate_name(name: impl Into<String>) -> Self {
        Self::DuplicateName { name: name.into() }
    }

    /// Create a new `Compile` error.
    pub fn compile(reason: impl Into<String>) -> Self {
        Self::Compile {
            reason: reason.into(),
        }
    }

    /// Create a new `Range` error.
    pub fn range(value: impl Into<String>) -> Self {
        Self::Range {
            value: value.into(),
        }
    }

    /// Create a new `FunctionNotFound` error.
    pub fn function_not_found(name: impl Into<String>) -> Self {
        Self::FunctionNotFound { name: name.into() }
    }

    /// Create a new `Engine` error.
    pub fn engine(message: impl Into<String>) -> Self {
        Self::Engine {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a runtime trap.
    pub fn is_trap(&self) -> bool {
        matches!(self, Self::Trap { .. })
    }

    /// Returns `true` if the error was raised before entering the engine.
    pub fn is_argument_error(&self) -> bool {
        matches!(
            self,
            Self::SignatureMismatch { .. } | Self::InvalidArgument { .. } | Self::Range { .. }
        )
    }

    /// Returns `true` if this error indicates a missing function.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FunctionNotFound { .. })
    }

    /// Trap code, if this is a trap that carries one.
    pub fn trap_code(&self) -> Option<&str> {
        match self {
            Self::Trap { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::function_not_found("fib");
        assert_eq!(err.to_string(), "Function not found: fib");

        let err = RuntimeError::duplicate_name("extern");
        assert_eq!(
            err.to_string(),
            "Module name conflict: 'extern' is already registered"
        );

        let err = RuntimeError::SignatureMismatch {
            expected: "i32".into(),
            actual: "i32, i32".into(),
        };
        assert_eq!(
            err.to_string(),
            "Signature mismatch: expected (i32), got (i32, i32)"
        );
    }

    #[test]
    fn test_error_from_host_function() {
        let host_err = HostFunctionError::PermissionDenied {
            resource: "command ls".into(),
        };
        let runtime_err: RuntimeError = host_err.into();

        assert!(matches!(runtime_err, RuntimeError::HostFunction(_)));
    }

    #[test]
    fn test_is_argument_error() {
        assert!(RuntimeError::invalid_argument("x").is_argument_error());
        assert!(RuntimeError::range("1").is_argument_error());
        assert!(
            RuntimeError::SignatureMismatch {
                expected: String::new(),
                actual: String::new(),
            }
            .is_argument_error()
        );
        assert!(!RuntimeError::trap("unreachable", None).is_argument_error());
        assert!(!RuntimeError::NotReady.is_argument_error());
    }

    #[test]
    fn test_trap_code() {
        let err = RuntimeError::trap("interrupted", Some("interrupt".into()));
        assert!(err.is_trap());
        assert_eq!(err.trap_code(), Some("interrupt"));
        assert_eq!(RuntimeError::Cancelled.trap_code(), None);
    }

    #[test]
    fn test_clone_keeps_kind_and_message() {
        let err = RuntimeError::Io(io::Error::new(io::ErrorKind::NotFound, "missing.wasm"));
        let copy = err.clone();
        assert!(matches!(&copy, RuntimeError::Io(e) if e.kind() == io::ErrorKind::NotFound));
        assert_eq!(copy.to_string(), err.to_string());

        let err = RuntimeError::trap("unreachable", Some("unreachable".into()));
        assert_eq!(err.clone().trap_code(), Some("unreachable"));
    }

    #[test]
    fn test_is_not_found() {
        assert!(RuntimeError::function_not_found("f").is_not_found());
        assert!(!RuntimeError::Cancelled.is_not_found());
    }
}
