use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::{Nutrition, ScoringMetadata, Signal};

/// Seconds before expiry at which a session is treated as already expired.
const EXPIRY_MARGIN_SECS: i64 = 10;

/// The authenticated user as the session knows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: Uuid,
    #[serde(default)]
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix seconds.
    pub expires_at: i64,
    pub user: SessionUser,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        OffsetDateTime::now_utc().unix_timestamp() >= self.expires_at - EXPIRY_MARGIN_SECS
    }
}

/// User object returned by sign-up, before any session exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUserRecord {
    pub id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    /// `Some([])` is how the hosted service reports an already-registered email.
    #[serde(default)]
    pub identities: Option<Vec<Value>>,
    #[serde(default)]
    pub user_metadata: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    /// Where the confirmation email should send the user.
    pub redirect_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SignUpOutcome {
    pub user: Option<AuthUserRecord>,
    /// Present only when the account needs no email confirmation.
    pub session: Option<Session>,
}

impl SignUpOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.user.as_ref().and_then(|u| u.identities.as_ref()),
            Some(ids) if ids.is_empty()
        )
    }
}

/// Kinds of one-time token an email link can carry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OtpType {
    Signup,
    Invite,
    Magiclink,
    Recovery,
    EmailChange,
    Email,
}

impl OtpType {
    pub fn as_str(self) -> &'static str {
        match self {
            OtpType::Signup => "signup",
            OtpType::Invite => "invite",
            OtpType::Magiclink => "magiclink",
            OtpType::Recovery => "recovery",
            OtpType::EmailChange => "email_change",
            OtpType::Email => "email",
        }
    }
}

impl fmt::Display for OtpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OtpType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "signup" => OtpType::Signup,
            "invite" => OtpType::Invite,
            "magiclink" => OtpType::Magiclink,
            "recovery" => OtpType::Recovery,
            "email_change" => OtpType::EmailChange,
            "email" => OtpType::Email,
            other => anyhow::bail!("unknown otp type {other:?}"),
        })
    }
}

/// Row of the `users` table, minus its id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Profile {
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub height_cm: Option<f64>,
    #[serde(default)]
    pub weight_kg: Option<f64>,
    #[serde(default)]
    pub onboarding_completed: Option<bool>,
}

impl Profile {
    pub fn is_onboarded(&self) -> bool {
        self.onboarding_completed.unwrap_or(false)
    }

    pub fn display_name(&self) -> Option<String> {
        match (self.first_name.as_deref(), self.last_name.as_deref()) {
            (Some(f), Some(l)) => Some(format!("{f} {l}")),
            (Some(n), None) | (None, Some(n)) => Some(n.to_string()),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewProfile {
    pub id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// Partial profile write; `None` fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height_cm: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight_kg: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboarding_completed: Option<bool>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self == &ProfileUpdate::default()
    }
}

/// Persisted row of the `food_scans` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FoodScan {
    pub user_id: Uuid,
    pub food_label: String,
    pub signal: Signal,
    /// Nullable in the table; rows saved by older clients have none.
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub nutrition: Option<Nutrition>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default)]
    pub scoring_metadata: Option<ScoringMetadata>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NewFoodScan {
    pub user_id: Uuid,
    pub food_label: String,
    pub signal: Signal,
    pub score: f64,
    pub nutrition: Nutrition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scoring_metadata: Option<ScoringMetadata>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScanStats {
    pub total: usize,
    pub green: usize,
    pub yellow: usize,
    pub red: usize,
}

impl ScanStats {
    pub fn tally(signals: impl IntoIterator<Item = Signal>) -> Self {
        signals.into_iter().fold(Self::default(), |mut acc, s| {
            acc.total += 1;
            match s {
                Signal::Green => acc.green += 1,
                Signal::Yellow => acc.yellow += 1,
                Signal::Red => acc.red += 1,
            }
            acc
        })
    }
}
