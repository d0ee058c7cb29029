use std::fmt;

use ctype::{Abi, LayoutError};
use thiserror::Error;

/// Resources a call can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    StackArena,
    HeapArena,
    Trampolines,
    AsyncCalls,
    /// No event loop to hand callbacks from async calls back to.
    EventLoop,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::StackArena => "stack arena",
            Resource::HeapArena => "heap arena",
            Resource::Trampolines => "trampoline slots",
            Resource::AsyncCalls => "async call slots",
            Resource::EventLoop => "event loop",
        };
        f.write_str(name)
    }
}

/// Where a failed conversion happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgPosition {
    Param(usize),
    Return,
}

impl fmt::Display for ArgPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgPosition::Param(i) => write!(f, "parameter {}", i + 1),
            ArgPosition::Return => f.write_str("return value"),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum AlienError {
    /// The signature cannot be expressed in the target ABI. Cached.
    #[error("cannot classify `{function}` for {abi}: {message}")]
    Classification {
        function: String,
        abi: Abi,
        message: String,
    },

    #[error("{position}: expected {expected}, got {got}")]
    Conversion {
        position: ArgPosition,
        expected: String,
        got: String,
    },

    #[error("{0} exhausted")]
    ResourceExhaustion(Resource),

    #[error("callback slot {index} was invoked after its call ended")]
    StaleCallback { index: usize },

    #[error("frame overflow: {needed} bytes written into a {capacity} byte region")]
    FrameOverflow { needed: usize, capacity: usize },

    #[error("native calls are not supported for {abi} on this host")]
    UnsupportedHost { abi: Abi },

    #[error("callback failed: {message}")]
    Callback { message: String },

    #[error("call session used before prepare")]
    Unprepared,

    #[error("call session already prepared")]
    AlreadyPrepared,

    #[error("no ABI configured and the host ABI is unknown")]
    UnknownHost,

    #[error(transparent)]
    Layout(#[from] LayoutError),
}

pub type AlienResult<T> = Result<T, AlienError>;

impl AlienError {
    pub(crate) fn conversion(
        position: ArgPosition,
        expected: impl Into<String>,
        got: impl Into<String>,
    ) -> AlienError {
        AlienError::Conversion {
            position,
            expected: expected.into(),
            got: got.into(),
        }
    }

    pub(crate) fn classification(
        function: &str,
        abi: Abi,
        message: impl Into<String>,
    ) -> AlienError {
        AlienError::Classification {
            function: function.to_string(),
            abi,
            message: message.into(),
        }
    }

    /// Errors that leave no trace once the call unwinds.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AlienError::Conversion { .. } | AlienError::ResourceExhaustion(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_context() {
        let err = AlienError::conversion(ArgPosition::Param(1), "i8", "number 300");
        assert_eq!(err.to_string(), "parameter 2: expected i8, got number 300");
        assert!(err.is_retryable());

        let err = AlienError::ResourceExhaustion(Resource::Trampolines);
        assert_eq!(err.to_string(), "trampoline slots exhausted");

        let err = AlienError::classification("f", Abi::X86SysV, "bad callback");
        assert!(err.to_string().contains("x86-sysv"));
        assert!(!err.is_retryable());
    }
}
