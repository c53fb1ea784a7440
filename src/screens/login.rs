use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::validate::{is_valid_email, normalize_email};
use crate::error::AppError;
use crate::session::{SessionContext, SignUpStatus};

pub const CHECK_EMAIL_MESSAGE: &str = "Check your email to confirm.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    #[default]
    SignIn,
    SignUp,
}

/// Sign-in / sign-up form.
pub struct LoginScreen {
    session: Arc<SessionContext>,
    pub mode: AuthMode,
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    /// Green banner above the form.
    pub success_message: Option<String>,
    pub submitting: bool,
}

impl LoginScreen {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            mode: AuthMode::SignIn,
            email: String::new(),
            password: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            success_message: None,
            submitting: false,
        }
    }

    fn clear_fields(&mut self) {
        self.email.clear();
        self.password.clear();
        self.first_name.clear();
        self.last_name.clear();
    }

    /// Switches between sign-in and sign-up, starting from a blank form.
    pub fn toggle_mode(&mut self) {
        self.mode = match self.mode {
            AuthMode::SignIn => AuthMode::SignUp,
            AuthMode::SignUp => AuthMode::SignIn,
        };
        self.success_message = None;
        self.clear_fields();
    }

    /// Moves a pending session message (e.g. email confirmed) into the banner.
    pub fn absorb_auth_message(&mut self) -> bool {
        let Some(message) = self.session.snapshot().auth_message else {
            return false;
        };
        self.mode = AuthMode::SignIn;
        self.password.clear();
        self.success_message = Some(message);
        self.session.clear_auth_message();
        true
    }

    /// Checks the form without touching the network; returns the normalized email.
    pub fn validate(&self) -> Result<String, AppError> {
        if self.email.trim().is_empty() || self.password.is_empty() {
            return Err(AppError::validation("Please fill in all fields"));
        }
        if self.mode == AuthMode::SignUp
            && (self.first_name.trim().is_empty() || self.last_name.trim().is_empty())
        {
            return Err(AppError::validation("Please enter your first and last name"));
        }
        let email = normalize_email(&self.email);
        if !is_valid_email(&email) {
            return Err(AppError::validation("Please enter a valid email address"));
        }
        Ok(email)
    }

    pub async fn submit(&mut self) -> Result<(), AppError> {
        if self.submitting {
            debug!("submit ignored while in flight");
            return Ok(());
        }
        let email = self.validate()?;
        self.submitting = true;
        let res = self.submit_valid(&email).await;
        self.submitting = false;
        res
    }

    async fn submit_valid(&mut self, email: &str) -> Result<(), AppError> {
        match self.mode {
            AuthMode::SignIn => self.session.sign_in(email, &self.password).await,
            AuthMode::SignUp => {
                let status = self
                    .session
                    .sign_up(
                        email,
                        &self.password,
                        Some(self.first_name.trim()),
                        Some(self.last_name.trim()),
                    )
                    .await?;
                info!(?status, "account created");
                self.clear_fields();
                self.mode = AuthMode::SignIn;
                if status == SignUpStatus::ConfirmationSent {
                    self.success_message = Some(CHECK_EMAIL_MESSAGE.into());
                }
                Ok(())
            }
        }
    }
}
