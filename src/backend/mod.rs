//! Auth and table access for the hosted backend.
//!
//! [`BackendClient`] is a thin pass-through: session get/subscribe,
//! credentialed sign-in/up/out, and row insert/update/select on the `users`
//! and `food_scans` tables. Writes return the affected rows as persisted.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::classifier::Signal;

pub mod dto;
pub mod events;
pub(crate) mod keeper;
pub mod local;
pub mod supabase;

pub use dto::{
    FoodScan, NewFoodScan, NewProfile, OtpType, Profile, ProfileUpdate, ScanStats, Session,
    SessionUser, SignUpOutcome, SignUpRequest,
};
pub use events::{AuthChange, AuthEvent, SessionSnapshot};
pub use local::LocalBackend;
pub use supabase::SupabaseClient;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Invalid login credentials")]
    InvalidCredentials,

    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: {0}")]
    Decode(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Current session; the first call restores it from storage.
    async fn get_session(&self) -> Result<SessionSnapshot, BackendError>;

    /// Session-change notifications, in `seq` order.
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;

    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError>;

    async fn sign_up(&self, req: SignUpRequest) -> Result<SignUpOutcome, BackendError>;

    /// No-op when already signed out.
    async fn sign_out(&self) -> Result<(), BackendError>;

    /// Completes an emailed one-time-token flow and signs the user in.
    async fn verify_otp(&self, token_hash: &str, kind: OtpType) -> Result<Session, BackendError>;

    async fn insert_profile(&self, profile: &NewProfile) -> Result<Vec<Profile>, BackendError>;

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError>;

    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Vec<Profile>, BackendError>;

    async fn insert_food_scan(&self, scan: &NewFoodScan) -> Result<Vec<FoodScan>, BackendError>;

    /// Most recent first.
    async fn list_food_scans(&self, user_id: Uuid) -> Result<Vec<FoodScan>, BackendError>;

    /// Just the `signal` column of every scan, for client-side stats.
    async fn list_scan_signals(&self, user_id: Uuid) -> Result<Vec<Signal>, BackendError>;
}
