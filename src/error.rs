use crate::daemon::protocol::{ErrorKind, WireError};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("service '{0}' not found")]
    NotFound(String),

    #[error("service '{name}' is already running with PID {pid}")]
    AlreadyRunning { name: String, pid: i32 },

    #[error("service '{0}' is being reaped, try again")]
    Busy(String),

    #[error("failed starting '{name}': {reason}")]
    Spawn { name: String, reason: String },

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Error reported by the daemon, already rendered.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl LauncherError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wire-level classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyRunning { .. } => ErrorKind::AlreadyRunning,
            Self::Busy(_) => ErrorKind::Busy,
            Self::Spawn { .. } => ErrorKind::Spawn,
            Self::Io { .. } => ErrorKind::Io,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Protocol(_) | Self::Config(_) => ErrorKind::Internal,
            Self::Remote { kind, .. } => *kind,
        }
    }

    /// Wire form of this error.
    pub fn to_wire(&self) -> WireError {
        let (service, pid, message) = match self {
            Self::NotFound(name) | Self::Busy(name) => (name.clone(), 0, self.to_string()),
            Self::AlreadyRunning { name, pid } => (name.clone(), *pid, self.to_string()),
            Self::Spawn { name, reason } => (name.clone(), 0, reason.clone()),
            _ => (String::new(), 0, self.to_string()),
        };
        WireError {
            kind: self.kind(),
            service,
            pid,
            message,
        }
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(error: WireError) -> Self {
        let WireError {
            kind,
            service,
            pid,
            message,
        } = error;
        match kind {
            ErrorKind::NotFound => Self::NotFound(service),
            ErrorKind::AlreadyRunning => Self::AlreadyRunning { name: service, pid },
            ErrorKind::Busy => Self::Busy(service),
            ErrorKind::Spawn => Self::Spawn {
                name: service,
                reason: message,
            },
            ErrorKind::Cancelled => Self::Cancelled,
            ErrorKind::Io | ErrorKind::Internal => Self::Remote { kind, message },
        }
    }
}

pub type Result<T> = std::result::Result<T, LauncherError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_survives_wire_mapping() {
        let errors = [
            LauncherError::NotFound("yes".into()),
            LauncherError::AlreadyRunning {
                name: "yes".into(),
                pid: 42,
            },
            LauncherError::Busy("yes".into()),
            LauncherError::Spawn {
                name: "yes".into(),
                reason: "denied".into(),
            },
            LauncherError::io("/nope", std::io::Error::other("gone")),
            LauncherError::Cancelled,
            LauncherError::Config("no service folders configured".into()),
        ];
        for err in errors {
            let kind = err.kind();
            let message = err.to_string();
            let back = LauncherError::from_wire(err.to_wire());
            assert_eq!(back.kind(), kind);
            assert_eq!(back.to_string(), message);
        }
    }

    #[test]
    fn variants_are_rebuilt_from_the_wire() {
        let back = |err: LauncherError| LauncherError::from_wire(err.to_wire());

        assert!(matches!(
            back(LauncherError::NotFound("yes".into())),
            LauncherError::NotFound(name) if name == "yes"
        ));
        assert!(matches!(
            back(LauncherError::AlreadyRunning { name: "yes".into(), pid: 42 }),
            LauncherError::AlreadyRunning { name, pid: 42 } if name == "yes"
        ));
        assert!(matches!(
            back(LauncherError::Busy("yes".into())),
            LauncherError::Busy(name) if name == "yes"
        ));
        assert!(matches!(
            back(LauncherError::Spawn { name: "yes".into(), reason: "denied".into() }),
            LauncherError::Spawn { name, reason } if name == "yes" && reason == "denied"
        ));
        assert!(matches!(back(LauncherError::Cancelled), LauncherError::Cancelled));
        assert!(matches!(
            back(LauncherError::io("/nope", std::io::Error::other("gone"))),
            LauncherError::Remote { kind: ErrorKind::Io, .. }
        ));
    }

    #[test]
    fn messages_name_the_service() {
        let err = LauncherError::AlreadyRunning {
            name: "yes".into(),
            pid: 7,
        };
        assert_eq!(err.to_string(), "service 'yes' is already running with PID 7");
        assert_eq!(
            LauncherError::NotFound("nope".into()).to_string(),
            "service 'nope' not found"
        );
    }
}
