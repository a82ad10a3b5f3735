use crate::model::NodeId;
use std::fmt;
use thiserror::Error;

/// Why an open/save call did not complete.
///
/// `UserCancelled` is an outcome rather than a failure: collaborators should
/// not raise an alert for it (see [`KeyMinderError::is_user_cancelled`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageFailure {
    WrongPassword,
    Corrupt,
    Io,
    UserCancelled,
}

impl fmt::Display for StorageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            StorageFailure::WrongPassword => "wrong password",
            StorageFailure::Corrupt => "corrupt file",
            StorageFailure::Io => "I/O failure",
            StorageFailure::UserCancelled => "cancelled by user",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum KeyMinderError {
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Storage error ({reason}): {message}")]
    Storage {
        reason: StorageFailure,
        message: String,
    },

    #[error("Events must be dispatched from the user interface thread")]
    WrongThread,

    #[error("Format '{0}' cannot represent the document's encryption settings")]
    IncompatibleFormat(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Unknown cipher: {0}")]
    UnknownCipher(String),

    #[error("Invalid settings key '{0}' (allowed: A-Z a-z 0-9 _ . :)")]
    InvalidKey(String),
}

impl KeyMinderError {
    pub fn storage(reason: StorageFailure, message: impl Into<String>) -> Self {
        KeyMinderError::Storage {
            reason,
            message: message.into(),
        }
    }

    pub fn wrong_password() -> Self {
        Self::storage(StorageFailure::WrongPassword, "the password is not correct")
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::storage(StorageFailure::Corrupt, message)
    }

    pub fn cancelled() -> Self {
        Self::storage(StorageFailure::UserCancelled, "operation cancelled")
    }

    /// The storage reason, if this is a storage error.
    pub fn storage_reason(&self) -> Option<StorageFailure> {
        match self {
            KeyMinderError::Storage { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// True when the user abandoned the operation; such errors must not be
    /// shown as failures.
    pub fn is_user_cancelled(&self) -> bool {
        self.storage_reason() == Some(StorageFailure::UserCancelled)
    }
}

impl From<std::io::Error> for KeyMinderError {
    fn from(err: std::io::Error) -> Self {
        KeyMinderError::storage(StorageFailure::Io, err.to_string())
    }
}

impl From<serde_json::Error> for KeyMinderError {
    fn from(err: serde_json::Error) -> Self {
        KeyMinderError::corrupt(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KeyMinderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_map_to_io_reason() {
        let err: KeyMinderError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Io));
        assert!(!err.is_user_cancelled());
    }

    #[test]
    fn json_errors_map_to_corrupt() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: KeyMinderError = parse.unwrap_err().into();
        assert_eq!(err.storage_reason(), Some(StorageFailure::Corrupt));
    }

    #[test]
    fn cancellation_is_distinguishable() {
        assert!(KeyMinderError::cancelled().is_user_cancelled());
        assert!(!KeyMinderError::wrong_password().is_user_cancelled());
        assert_eq!(KeyMinderError::WrongThread.storage_reason(), None);
    }
}
