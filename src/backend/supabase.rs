use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::dto::{
    AuthUserRecord, FoodScan, NewFoodScan, NewProfile, OtpType, Profile, ProfileUpdate, Session,
    SessionUser, SignUpOutcome, SignUpRequest,
};
use super::events::{AuthChange, AuthEvent, SessionSnapshot};
use super::keeper::{Refresher, SessionKeeper};
use super::{BackendClient, BackendError};
use crate::classifier::Signal;
use crate::session::storage::SessionStorage;

const PROFILE_COLUMNS: &str =
    "first_name,last_name,email,height_cm,weight_kg,onboarding_completed";

/// Client for a hosted auth (GoTrue) + table (PostgREST) service.
pub struct SupabaseClient {
    http: reqwest::Client,
    base_url: String,
    anon_key: String,
    keeper: SessionKeeper,
}

/// Token grant response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUserRecord,
}

impl TokenResponse {
    fn into_parts(self) -> (Session, AuthUserRecord) {
        let expires_at = self.expires_at.unwrap_or_else(|| {
            OffsetDateTime::now_utc().unix_timestamp() + self.expires_in.unwrap_or(3600)
        });
        let session = Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at,
            user: SessionUser {
                id: self.user.id,
                email: self.user.email.clone().unwrap_or_default(),
            },
        };
        (session, self.user)
    }
}

/// Sign-up answers with a session when confirmation is off, a bare user otherwise.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SignUpBody {
    Session(TokenResponse),
    User(AuthUserRecord),
}

/// Error bodies differ between the auth and table services; take whichever field is set.
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_code: Option<String>,
    error_description: Option<String>,
    msg: Option<String>,
    message: Option<String>,
}

impl ErrorBody {
    fn into_error(self, status: StatusCode) -> BackendError {
        let invalid_credentials = self.error_code.as_deref() == Some("invalid_credentials")
            || (self.error.as_deref() == Some("invalid_grant")
                && self
                    .error_description
                    .as_deref()
                    .is_some_and(|d| d.contains("Invalid login credentials")));
        if invalid_credentials {
            return BackendError::InvalidCredentials;
        }
        let message = self
            .msg
            .or(self.message)
            .or(self.error_description)
            .or(self.error)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        BackendError::Rejected {
            status: status.as_u16(),
            message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SignalRow {
    signal: Signal,
}

impl SupabaseClient {
    pub fn new(
        base_url: impl Into<String>,
        anon_key: impl Into<String>,
        storage: Arc<dyn SessionStorage>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            keeper: SessionKeeper::new(storage),
        }
    }

    fn auth_url(&self, path: &str) -> String {
        format!("{}/auth/v1/{}", self.base_url, path)
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn with_bearer(&self, req: RequestBuilder, bearer: &str) -> RequestBuilder {
        req.header("apikey", &self.anon_key)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
    }

    /// Auth endpoints take the project key alone, so they never wait on the keeper.
    fn anon(&self, req: RequestBuilder) -> RequestBuilder {
        self.with_bearer(req, &self.anon_key)
    }

    /// Table requests carry the user's token, refreshed first if it has
    /// expired, or the anon key when signed out.
    async fn authorized(&self, req: RequestBuilder) -> RequestBuilder {
        match self.keeper.fresh(self).await {
            Some(session) => self.with_bearer(req, &session.access_token),
            None => self.anon(req),
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        let res = check(req.send().await?).await?;
        res.json::<T>()
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))
    }

    async fn send_authorized<T: DeserializeOwned>(
        &self,
        req: RequestBuilder,
    ) -> Result<T, BackendError> {
        let req = self.authorized(req).await;
        self.send(req).await
    }

    async fn token_grant<B: Serialize + ?Sized>(
        &self,
        grant_type: &str,
        body: &B,
    ) -> Result<TokenResponse, BackendError> {
        let req = self
            .http
            .post(self.auth_url("token"))
            .query(&[("grant_type", grant_type)])
            .json(body);
        self.send(self.anon(req)).await
    }
}

async fn check(res: Response) -> Result<Response, BackendError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_default();
    let err = parsed.into_error(status);
    debug!(%status, error = %err, "backend rejected request");
    Err(err)
}

#[async_trait]
impl Refresher for SupabaseClient {
    async fn refresh(&self, session: &Session) -> Result<Session, BackendError> {
        let token = self
            .token_grant(
                "refresh_token",
                &json!({ "refresh_token": session.refresh_token }),
            )
            .await?;
        Ok(token.into_parts().0)
    }
}

#[async_trait]
impl BackendClient for SupabaseClient {
    async fn get_session(&self) -> Result<SessionSnapshot, BackendError> {
        Ok(self.keeper.snapshot(self).await)
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.keeper.subscribe()
    }

    #[instrument(skip(self, password))]
    async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, BackendError> {
        let mut guard = self.keeper.lock().await;
        let token = self
            .token_grant("password", &json!({ "email": email, "password": password }))
            .await?;
        let (session, _) = token.into_parts();
        guard.set(AuthChange::SignedIn, Some(session.clone())).await;
        info!(user_id = %session.user.id, "signed in");
        Ok(session)
    }

    #[instrument(skip(self, req), fields(email = %req.email))]
    async fn sign_up(&self, req: SignUpRequest) -> Result<SignUpOutcome, BackendError> {
        let mut guard = self.keeper.lock().await;
        let mut call = self.http.post(self.auth_url("signup")).json(&json!({
            "email": req.email,
            "password": req.password,
            "data": {
                "first_name": req.first_name,
                "last_name": req.last_name,
            },
        }));
        if let Some(redirect) = &req.redirect_to {
            call = call.query(&[("redirect_to", redirect)]);
        }

        match self.send::<SignUpBody>(self.anon(call)).await? {
            SignUpBody::Session(token) => {
                let (session, user) = token.into_parts();
                guard.set(AuthChange::SignedIn, Some(session.clone())).await;
                info!(user_id = %user.id, "signed up and signed in");
                Ok(SignUpOutcome {
                    user: Some(user),
                    session: Some(session),
                })
            }
            SignUpBody::User(user) => {
                info!(user_id = %user.id, "signed up; confirmation pending");
                Ok(SignUpOutcome {
                    user: Some(user),
                    session: None,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), BackendError> {
        let mut guard = self.keeper.lock().await;
        let Some(session) = self.keeper.current() else {
            debug!("sign out with no session");
            return Ok(());
        };

        // the local session is dropped even if the server call fails
        let res = self
            .with_bearer(self.http.post(self.auth_url("logout")), &session.access_token)
            .send()
            .await;
        match res {
            Ok(r) => {
                if let Err(e) = check(r).await {
                    warn!(error = %e, "server-side sign out failed");
                }
            }
            Err(e) => warn!(error = %e, "server-side sign out failed"),
        }

        guard.set(AuthChange::SignedOut, None).await;
        info!(user_id = %session.user.id, "signed out");
        Ok(())
    }

    #[instrument(skip(self, token_hash))]
    async fn verify_otp(&self, token_hash: &str, kind: OtpType) -> Result<Session, BackendError> {
        let mut guard = self.keeper.lock().await;
        let req = self.http.post(self.auth_url("verify")).json(&json!({
            "type": kind.as_str(),
            "token_hash": token_hash,
        }));
        let token: TokenResponse = self.send(self.anon(req)).await?;
        let (session, _) = token.into_parts();
        guard.set(AuthChange::SignedIn, Some(session.clone())).await;
        info!(user_id = %session.user.id, "email token verified");
        Ok(session)
    }

    #[instrument(skip(self, profile), fields(user_id = %profile.id))]
    async fn insert_profile(&self, profile: &NewProfile) -> Result<Vec<Profile>, BackendError> {
        let req = self
            .http
            .post(self.table_url("users"))
            .header("Prefer", "return=representation")
            .query(&[("select", PROFILE_COLUMNS)])
            .json(&[profile]);
        self.send_authorized(req).await
    }

    #[instrument(skip(self))]
    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError> {
        let req = self.http.get(self.table_url("users")).query(&[
            ("select", PROFILE_COLUMNS.to_string()),
            ("id", format!("eq.{user_id}")),
        ]);
        let mut rows: Vec<Profile> = self.send_authorized(req).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(BackendError::Decode(format!(
                "expected at most one profile row, got {n}"
            ))),
        }
    }

    #[instrument(skip(self, update))]
    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Vec<Profile>, BackendError> {
        let req = self
            .http
            .patch(self.table_url("users"))
            .header("Prefer", "return=representation")
            .query(&[
                ("select", PROFILE_COLUMNS.to_string()),
                ("id", format!("eq.{user_id}")),
            ])
            .json(update);
        self.send_authorized(req).await
    }

    #[instrument(skip(self, scan), fields(user_id = %scan.user_id, label = %scan.food_label))]
    async fn insert_food_scan(&self, scan: &NewFoodScan) -> Result<Vec<FoodScan>, BackendError> {
        let req = self
            .http
            .post(self.table_url("food_scans"))
            .header("Prefer", "return=representation")
            .json(&[scan]);
        self.send_authorized(req).await
    }

    #[instrument(skip(self))]
    async fn list_food_scans(&self, user_id: Uuid) -> Result<Vec<FoodScan>, BackendError> {
        let req = self.http.get(self.table_url("food_scans")).query(&[
            ("select", "*".to_string()),
            ("user_id", format!("eq.{user_id}")),
            ("order", "timestamp.desc".to_string()),
        ]);
        self.send_authorized(req).await
    }

    #[instrument(skip(self))]
    async fn list_scan_signals(&self, user_id: Uuid) -> Result<Vec<Signal>, BackendError> {
        let req = self.http.get(self.table_url("food_scans")).query(&[
            ("select", "signal".to_string()),
            ("user_id", format!("eq.{user_id}")),
        ]);
        let rows: Vec<SignalRow> = self.send_authorized(req).await?;
        Ok(rows.into_iter().map(|r| r.signal).collect())
    }
}
