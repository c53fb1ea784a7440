//! Headless view models for the app's screens.
//!
//! Each screen owns its form/flow state and talks to the shared
//! [`SessionContext`](crate::session::SessionContext); rendering is left to
//! whatever front end drives it.

use crate::error::AppError;

pub mod login;
pub mod onboarding;
pub mod picker;
pub mod profile;
pub mod scan;

pub use login::{AuthMode, LoginScreen};
pub use onboarding::{HeightUnit, OnboardingScreen, WeightUnit};
pub use picker::{FilePicker, PhotoAsset, PhotoPicker};
pub use profile::{ProfileScreen, ProfileView};
pub use scan::{ResultCard, ScanPhase, ScanScreen, ScanView};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
}

/// Transient dialog shown after an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub message: String,
}

impl Notice {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            kind: NoticeKind::Success,
            title: "Success".into(),
            message: message.into(),
        }
    }
}

impl From<&AppError> for Notice {
    fn from(e: &AppError) -> Self {
        Self {
            kind: NoticeKind::Error,
            title: e.title().into(),
            message: e.to_string(),
        }
    }
}
