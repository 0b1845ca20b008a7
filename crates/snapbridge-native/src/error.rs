use miette::Diagnostic;
use thiserror::Error;

/// Error type for operations that cross into the native rbd library
#[derive(Error, Debug, Diagnostic)]
pub enum BridgeError {
    /// Caller supplied an unusable argument
    #[error("Invalid argument: {message}")]
    #[diagnostic(
        code(snapbridge::native::invalid_argument),
        help("Check that a callback is set, the image or mount is open, names contain no NUL bytes, and offset + length fits in 64 bits")
    )]
    InvalidArgument {
        #[allow(unused)]
        message: String,
    },

    /// Optional native entry point is missing from the loaded library
    #[error("Not implemented: symbol '{symbol}' is unavailable ({reason})")]
    #[diagnostic(
        code(snapbridge::native::not_implemented),
        help("The loaded librbd or libcephfs build does not export '{symbol}'. Upgrade the native library or use an older API")
    )]
    NotImplemented {
        #[allow(unused)]
        symbol: String,
        #[allow(unused)]
        reason: String,
    },

    /// Native library reported a failure
    #[error("{operation} failed with code {code}: {message}")]
    #[diagnostic(
        code(snapbridge::native::native_error),
        help("The status code is a negated errno value returned by the native library")
    )]
    NativeError {
        #[allow(unused)]
        operation: String,
        #[allow(unused)]
        code: i32,
        #[allow(unused)]
        message: String,
    },

    /// Callback asked the enumeration to stop
    #[error("Iteration aborted by callback with code {code}")]
    #[diagnostic(
        code(snapbridge::native::aborted),
        help("The diff callback returned a nonzero value, which stops extent delivery")
    )]
    Aborted {
        #[allow(unused)]
        code: i32,
    },

    /// Handle lookup failed for a handle that should be live
    #[error("Bridge consistency violation: handle {handle} is not registered")]
    #[diagnostic(
        code(snapbridge::native::bridge_consistency_violation),
        help("This is a bug in snapbridge-native. Please report it with the full error details")
    )]
    BridgeConsistencyViolation {
        #[allow(unused)]
        handle: usize,
    },

    /// Shared library could not be opened
    #[error("Failed to load native library '{path}': {message}")]
    #[diagnostic(
        code(snapbridge::native::library_load),
        help("Verify the library path exists and matches the process architecture. Try: ldconfig -p | grep librbd")
    )]
    LibraryLoad {
        #[allow(unused)]
        path: String,
        #[allow(unused)]
        message: String,
    },
}

/// Result type alias for native bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn not_implemented(symbol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotImplemented {
            symbol: symbol.into(),
            reason: reason.into(),
        }
    }

    /// Build a NativeError from a raw status, deriving the message from errno
    pub fn native_error(operation: impl Into<String>, code: i32) -> Self {
        let message = std::io::Error::from_raw_os_error(code.saturating_abs()).to_string();
        Self::NativeError {
            operation: operation.into(),
            code,
            message,
        }
    }

    pub fn aborted(code: i32) -> Self {
        Self::Aborted { code }
    }

    pub fn bridge_consistency_violation(handle: usize) -> Self {
        Self::BridgeConsistencyViolation { handle }
    }

    pub fn library_load(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LibraryLoad {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True when the error means the native library lacks a feature
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Self::NotImplemented { .. })
    }

    /// Native or callback status code carried by this error, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::NativeError { code, .. } | Self::Aborted { code } => Some(*code),
            _ => None,
        }
    }
}
