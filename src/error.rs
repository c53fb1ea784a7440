use thiserror::Error;

use crate::backend::BackendError;

/// Failures surfaced to the user, one variant per kind of dialog the app shows.
#[derive(Debug, Error)]
pub enum AppError {
    /// Form input rejected before any network call.
    #[error("{0}")]
    Validation(String),

    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("An account with this email already exists")]
    DuplicateAccount,

    #[error("User not authenticated")]
    Unauthenticated,

    /// Auth failure carrying the backend's own message.
    #[error("{0}")]
    Auth(String),

    #[error("Could not connect to backend.")]
    Transport,

    /// Save failures; the message is generic on purpose, details go to the log.
    #[error("{0}")]
    Persistence(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Dialog title for this error.
    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidCredentials
            | Self::DuplicateAccount
            | Self::Unauthenticated
            | Self::Auth(_) => "Authentication Error",
            _ => "Error",
        }
    }
}

impl From<BackendError> for AppError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::InvalidCredentials => Self::InvalidCredentials,
            BackendError::Rejected { message, .. } => Self::Auth(message),
            BackendError::Transport(_) => Self::Transport,
            other => Self::Internal(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_user_facing_kinds() {
        let e: AppError = BackendError::InvalidCredentials.into();
        assert!(matches!(e, AppError::InvalidCredentials));
        assert_eq!(e.title(), "Authentication Error");

        let e: AppError = BackendError::Rejected {
            status: 400,
            message: "Email not confirmed".into(),
        }
        .into();
        assert_eq!(e.to_string(), "Email not confirmed");

        let e: AppError = BackendError::Decode("bad json".into()).into();
        assert!(matches!(e, AppError::Internal(_)));
        assert_eq!(e.title(), "Error");
    }
}
