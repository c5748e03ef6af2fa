//! Error types
//!
//! None of these cross the command boundary: the orchestrator folds them into
//! [`NetworkResultOptions`](crate::NetworkResultOptions) before posting.

use nix::errno::Errno;

/// Failure reported by a privileged controller call
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetdError {
    /// The service ran the call and refused it with an errno
    #[error("service-specific error {code}: {}", describe(.code))]
    ServiceSpecific { code: i32 },

    /// The service could not be reached
    #[error("controller unavailable: {0}")]
    Unavailable(String),
}

impl NetdError {
    pub fn service(errno: Errno) -> Self {
        NetdError::ServiceSpecific { code: errno as i32 }
    }

    /// Service-specific errno, 0 when the call never reached the service
    pub fn service_specific_code(&self) -> i32 {
        match self {
            NetdError::ServiceSpecific { code } => *code,
            NetdError::Unavailable(_) => 0,
        }
    }

    /// Whether the service refused with `errno`
    pub fn is(&self, errno: Errno) -> bool {
        self.service_specific_code() == errno as i32
    }
}

fn describe(code: &i32) -> &'static str {
    errno_description(*code)
}

/// OS description of an error number; the sign is ignored
pub fn errno_description(code: i32) -> &'static str {
    Errno::from_i32(code.saturating_abs()).desc()
}

/// Network id bookkeeping failure, always local
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetIdError {
    #[error("no network id for interface {0}")]
    UnknownInterface(String),

    #[error("no live network with id {0}")]
    UnknownNetId(i32),

    #[error("network type {0} has no consumer bit")]
    InvalidNetworkType(i32),

    #[error("network id space {min}..={max} exhausted")]
    Exhausted { min: i32, max: i32 },
}

/// Failure at the worker boundary, returned synchronously to the poster
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("malformed network command: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("network worker is not running")]
    NotRunning,

    #[error("failed to spawn network worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_description_ignores_sign() {
        assert_eq!(errno_description(-2), errno_description(2));
        assert_eq!(errno_description(2), Errno::ENOENT.desc());
    }

    #[test]
    fn test_service_code() {
        let err = NetdError::service(Errno::EEXIST);
        assert!(err.is(Errno::EEXIST));
        assert_eq!(err.service_specific_code(), 17);
        assert_eq!(NetdError::Unavailable("gone".into()).service_specific_code(), 0);
    }
}
