//! In-process backend for development and tests.
//!
//! Accounts are stored with argon2 password hashes and sessions are HS256 JWT
//! pairs, so the session lifecycle behaves like the hosted service: restore,
//! refresh, optional email confirmation, and row-level access checks on the
//! two tables. State is optionally mirrored to a JSON file.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::dto::{
    AuthUserRecord, FoodScan, NewFoodScan, NewProfile, OtpType, Profile, ProfileUpdate, Session,
    SessionUser, SignUpOutcome, SignUpRequest,
};
use super::events::{AuthChange, AuthEvent, SessionSnapshot};
use super::keeper::{Refresher, SessionKeeper};
use super::{BackendClient, BackendError};
use crate::auth::{JwtKeys, TokenKind};
use crate::classifier::Signal;
use crate::config::JwtConfig;
use crate::session::storage::{MemorySessionStorage, SessionStorage};

const TOKEN_HASH_LEN: usize = 40;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Account {
    id: Uuid,
    email: String,
    password_hash: String,
    confirmed: bool,
}

impl Account {
    /// Only the argon2 PHC string of the password is kept.
    fn new(email: String, password: &str, confirmed: bool) -> anyhow::Result<Self> {
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("hash password: {e}"))?
            .to_string();
        Ok(Self {
            id: Uuid::new_v4(),
            email,
            password_hash,
            confirmed,
        })
    }

    /// A stored hash that does not parse is an error, not a mismatch.
    fn verify(&self, password: &str) -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(&self.password_hash)
            .map_err(|e| anyhow::anyhow!("stored password hash of {}: {e}", self.id))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProfileRow {
    id: Uuid,
    #[serde(flatten)]
    profile: Profile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingToken {
    user_id: Uuid,
    kind: OtpType,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalDb {
    accounts: HashMap<String, Account>,
    profiles: HashMap<Uuid, ProfileRow>,
    scans: Vec<FoodScan>,
    pending: HashMap<String, PendingToken>,
}

impl LocalDb {
    fn account_by_id(&self, id: Uuid) -> Option<&Account> {
        self.accounts.values().find(|a| a.id == id)
    }
}

pub struct LocalBackend {
    keys: JwtKeys,
    require_confirmation: bool,
    db: RwLock<LocalDb>,
    db_file: Option<PathBuf>,
    keeper: SessionKeeper,
}

fn rls_denied(table: &str) -> BackendError {
    BackendError::Rejected {
        status: 403,
        message: format!("new row violates row-level security policy for table \"{table}\""),
    }
}

impl LocalBackend {
    /// Opens the store at `db_file`, creating it on first write.
    pub async fn open(
        db_file: Option<PathBuf>,
        jwt: &JwtConfig,
        require_confirmation: bool,
        storage: Arc<dyn SessionStorage>,
    ) -> anyhow::Result<Self> {
        let db = match &db_file {
            Some(path) => match tokio::fs::read(path).await {
                Ok(raw) => serde_json::from_slice(&raw)
                    .with_context(|| format!("parse local db {}", path.display()))?,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => LocalDb::default(),
                Err(e) => {
                    return Err(e).with_context(|| format!("read local db {}", path.display()))
                }
            },
            None => LocalDb::default(),
        };
        debug!(accounts = db.accounts.len(), scans = db.scans.len(), "local backend opened");

        Ok(Self {
            keys: JwtKeys::from(jwt),
            require_confirmation,
            db: RwLock::new(db),
            db_file,
            keeper: SessionKeeper::new(storage),
        })
    }

    /// Nothing touches disk; used by tests and throwaway runs.
    pub fn in_memory(jwt: &JwtConfig, require_confirmation: bool) -> Self {
        Self {
            keys: JwtKeys::from(jwt),
            require_confirmation,
            db: RwLock::new(LocalDb::default()),
            db_file: None,
            keeper: SessionKeeper::new(Arc::new(MemorySessionStorage::default())),
        }
    }

    /// The confirmation link a real service would have emailed, if one is outstanding.
    pub async fn confirmation_link(&self, email: &str, redirect_to: &str) -> Option<String> {
        let db = self.db.read().await;
        let account = db.accounts.get(&email.trim().to_lowercase())?;
        db.pending
            .iter()
            .find(|(_, p)| p.user_id == account.id)
            .map(|(hash, p)| format!("{redirect_to}?token_hash={hash}&type={}", p.kind))
    }

    async fn persist(&self, db: &LocalDb) -> Result<(), BackendError> {
        let Some(path) = &self.db_file else {
            return Ok(());
        };
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("create {}", dir.display()))?;
        }
        let raw = serde_json::to_vec_pretty(db).context("encode local db")?;
        tokio::fs::write(path, raw)
            .await
            .with_context(|| format!("write local db {}", path.display()))?;
        Ok(())
    }

    fn issue_session(&self, account: &Account) -> Result<Session, BackendError> {
        let pair = self.keys.sign_pair(account.id, &account.email)?;
        Ok(Session {
            access_token: pair.access_token,
            refresh_token: pair.refresh_token,
            expires_at: pair.expires_at,
            user: SessionUser {
                id: account.id,
                email: account.email.clone(),
            },
        })
    }

    /// The row-level rule of both tables: the caller's token must belong to
    /// `user_id`. An expired session is refreshed first.
    async fn is_owner(&self, user_id: Uuid) -> bool {
        let Some(session) = self.keeper.fresh(self).await else {
            return false;
        };
        match self.keys.verify(&session.access_token, TokenKind::Access) {
            Ok(claims) => claims.sub == user_id,
            Err(e) => {
                debug!(error = %e, "access token rejected");
                false
            }
        }
    }
}

#[async_trait]
impl Refresher for LocalBackend {
    async fn refresh(&self, session: &Session) -> Result<Session, BackendError> {
        let claims = self
            .keys
            .verify(&session.refresh_token, TokenKind::Refresh)
            .map_err(|e| BackendError::Rejected {
                status: 401,
                message: e.to_string(),
            })?;
        let db = self.db.read().await;
        let account = db.account_by_id(claims.sub).ok_or(BackendError::Rejected {
            status: 401,
            message: "User not found".into(),
        })?;
        self.issue_session(account)
    }
}

#[async_trait]
impl BackendClient for LocalBackend {
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
        let session = {
            let db = self.db.read().await;
            let Some(account) = db.accounts.get(&email.trim().to_lowercase()) else {
                warn!("login unknown email");
                return Err(BackendError::InvalidCredentials);
            };
            if !account.verify(password)? {
                warn!(user_id = %account.id, "login invalid password");
                return Err(BackendError::InvalidCredentials);
            }
            if !account.confirmed {
                return Err(BackendError::Rejected {
                    status: 400,
                    message: "Email not confirmed".into(),
                });
            }
            self.issue_session(account)?
        };
        guard.set(AuthChange::SignedIn, Some(session.clone())).await;
        info!(user_id = %session.user.id, "signed in");
        Ok(session)
    }

    #[instrument(skip(self, req), fields(email = %req.email))]
    async fn sign_up(&self, req: SignUpRequest) -> Result<SignUpOutcome, BackendError> {
        let email = req.email.trim().to_lowercase();
        let mut metadata = serde_json::Map::new();
        metadata.insert("first_name".into(), json!(req.first_name));
        metadata.insert("last_name".into(), json!(req.last_name));

        let mut guard = self.keeper.lock().await;
        let mut db = self.db.write().await;

        if db.accounts.contains_key(&email) {
            // same answer the hosted service gives: an obfuscated user without identities
            warn!("sign up for registered email");
            return Ok(SignUpOutcome {
                user: Some(AuthUserRecord {
                    id: Uuid::new_v4(),
                    email: Some(email),
                    identities: Some(Vec::new()),
                    user_metadata: metadata,
                }),
                session: None,
            });
        }

        let account = Account::new(email.clone(), &req.password, !self.require_confirmation)?;
        let user = AuthUserRecord {
            id: account.id,
            email: Some(email.clone()),
            identities: Some(vec![json!({ "provider": "email", "identity_id": Uuid::new_v4() })]),
            user_metadata: metadata,
        };

        if self.require_confirmation {
            let token_hash: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(TOKEN_HASH_LEN)
                .map(char::from)
                .collect();
            db.pending.insert(
                token_hash.clone(),
                PendingToken {
                    user_id: account.id,
                    kind: OtpType::Signup,
                },
            );
            if let Some(redirect) = &req.redirect_to {
                info!(
                    user_id = %account.id,
                    link = %format!("{redirect}?token_hash={token_hash}&type=signup"),
                    "confirmation link issued"
                );
            }
            db.accounts.insert(email, account);
            self.persist(&db).await?;
            return Ok(SignUpOutcome {
                user: Some(user),
                session: None,
            });
        }

        let session = self.issue_session(&account)?;
        db.accounts.insert(email, account);
        self.persist(&db).await?;
        drop(db);

        guard.set(AuthChange::SignedIn, Some(session.clone())).await;
        info!(user_id = %user.id, "signed up and signed in");
        Ok(SignUpOutcome {
            user: Some(user),
            session: Some(session),
        })
    }

    #[instrument(skip(self))]
    async fn sign_out(&self) -> Result<(), BackendError> {
        let mut guard = self.keeper.lock().await;
        match self.keeper.current() {
            Some(session) => {
                guard.set(AuthChange::SignedOut, None).await;
                info!(user_id = %session.user.id, "signed out");
            }
            None => debug!("sign out with no session"),
        }
        Ok(())
    }

    #[instrument(skip(self, token_hash))]
    async fn verify_otp(&self, token_hash: &str, kind: OtpType) -> Result<Session, BackendError> {
        let mut guard = self.keeper.lock().await;
        let session = {
            let mut db = self.db.write().await;
            let matches = db.pending.get(token_hash).is_some_and(|p| {
                p.kind == kind || (p.kind == OtpType::Signup && kind == OtpType::Email)
            });
            let pending = match db.pending.remove(token_hash) {
                Some(p) if matches => p,
                _ => {
                    return Err(BackendError::Rejected {
                        status: 403,
                        message: "Email link is invalid or has expired".into(),
                    })
                }
            };
            let account = db
                .accounts
                .values_mut()
                .find(|a| a.id == pending.user_id)
                .ok_or(BackendError::Rejected {
                    status: 404,
                    message: "User not found".into(),
                })?;
            account.confirmed = true;
            let account = account.clone();
            self.persist(&db).await?;
            self.issue_session(&account)?
        };
        guard.set(AuthChange::SignedIn, Some(session.clone())).await;
        info!(user_id = %session.user.id, "email token verified");
        Ok(session)
    }

    #[instrument(skip(self, profile), fields(user_id = %profile.id))]
    async fn insert_profile(&self, profile: &NewProfile) -> Result<Vec<Profile>, BackendError> {
        if !self.is_owner(profile.id).await {
            return Err(rls_denied("users"));
        }
        let mut db = self.db.write().await;
        if db.profiles.contains_key(&profile.id) {
            return Err(BackendError::Rejected {
                status: 409,
                message: "duplicate key value violates unique constraint \"users_pkey\"".into(),
            });
        }
        let row = ProfileRow {
            id: profile.id,
            profile: Profile {
                first_name: profile.first_name.clone(),
                last_name: profile.last_name.clone(),
                email: Some(profile.email.clone()),
                ..Default::default()
            },
        };
        let out = row.profile.clone();
        db.profiles.insert(row.id, row);
        self.persist(&db).await?;
        Ok(vec![out])
    }

    async fn get_profile(&self, user_id: Uuid) -> Result<Option<Profile>, BackendError> {
        // row-level security hides rows instead of failing the read
        if !self.is_owner(user_id).await {
            return Ok(None);
        }
        let db = self.db.read().await;
        Ok(db.profiles.get(&user_id).map(|r| r.profile.clone()))
    }

    #[instrument(skip(self, update))]
    async fn update_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
    ) -> Result<Vec<Profile>, BackendError> {
        if !self.is_owner(user_id).await {
            return Ok(Vec::new());
        }
        let mut db = self.db.write().await;
        let Some(row) = db.profiles.get_mut(&user_id) else {
            return Ok(Vec::new());
        };
        let p = &mut row.profile;
        if let Some(v) = &update.first_name {
            p.first_name = Some(v.clone());
        }
        if let Some(v) = &update.last_name {
            p.last_name = Some(v.clone());
        }
        if let Some(v) = update.height_cm {
            p.height_cm = Some(v);
        }
        if let Some(v) = update.weight_kg {
            p.weight_kg = Some(v);
        }
        if let Some(v) = update.onboarding_completed {
            p.onboarding_completed = Some(v);
        }
        let out = p.clone();
        self.persist(&db).await?;
        Ok(vec![out])
    }

    #[instrument(skip(self, scan), fields(user_id = %scan.user_id, label = %scan.food_label))]
    async fn insert_food_scan(&self, scan: &NewFoodScan) -> Result<Vec<FoodScan>, BackendError> {
        if !self.is_owner(scan.user_id).await {
            return Err(rls_denied("food_scans"));
        }
        let row = FoodScan {
            user_id: scan.user_id,
            food_label: scan.food_label.clone(),
            signal: scan.signal,
            score: Some(scan.score),
            nutrition: Some(scan.nutrition.clone()),
            timestamp: OffsetDateTime::now_utc(),
            scoring_metadata: scan.scoring_metadata.clone(),
        };
        let mut db = self.db.write().await;
        db.scans.push(row.clone());
        self.persist(&db).await?;
        Ok(vec![row])
    }

    async fn list_food_scans(&self, user_id: Uuid) -> Result<Vec<FoodScan>, BackendError> {
        if !self.is_owner(user_id).await {
            return Ok(Vec::new());
        }
        let db = self.db.read().await;
        // newest insert first among equal timestamps
        let mut rows: Vec<FoodScan> = db
            .scans
            .iter()
            .rev()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    async fn list_scan_signals(&self, user_id: Uuid) -> Result<Vec<Signal>, BackendError> {
        if !self.is_owner(user_id).await {
            return Ok(Vec::new());
        }
        let db = self.db.read().await;
        Ok(db
            .scans
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.signal)
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod local_tests {
    use super::*;
    use crate::classifier::Nutrition;

    pub(crate) fn test_jwt() -> JwtConfig {
        JwtConfig {
            secret: "test".into(),
            issuer: "test-issuer".into(),
            audience: "authenticated".into(),
            ttl_minutes: 5,
            refresh_ttl_minutes: 60,
        }
    }

    /// Publishes `session` as the current one, skipping credentials entirely.
    pub(crate) async fn force_session(
        backend: &LocalBackend,
        change: AuthChange,
        session: Option<Session>,
    ) -> u64 {
        backend.keeper.lock().await.set(change, session).await
    }

    fn signup(email: &str) -> SignUpRequest {
        SignUpRequest {
            email: email.into(),
            password: "hunter22".into(),
            first_name: Some("Ada".into()),
            last_name: Some("Lovelace".into()),
            redirect_to: Some("nutrisignal://auth/callback".into()),
        }
    }

    fn scan(user_id: Uuid, label: &str, signal: Signal) -> NewFoodScan {
        NewFoodScan {
            user_id,
            food_label: label.into(),
            signal,
            score: 50.0,
            nutrition: Nutrition::default(),
            scoring_metadata: None,
        }
    }

    #[test]
    fn account_keeps_only_a_verifiable_hash() {
        let account = Account::new("a@b.co".into(), "hunter22", true).unwrap();
        assert!(account.password_hash.starts_with("$argon2"));
        assert!(!account.password_hash.contains("hunter22"));
        assert!(account.verify("hunter22").unwrap());
        assert!(!account.verify("hunter23").unwrap());

        let other = Account::new("a@b.co".into(), "hunter22", true).unwrap();
        assert_ne!(account.password_hash, other.password_hash);

        let corrupt = Account {
            password_hash: "not-a-phc-string".into(),
            ..account
        };
        assert!(corrupt.verify("hunter22").is_err());
    }

    #[tokio::test]
    async fn expired_access_token_is_refreshed_for_row_checks() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        let session = backend.sign_up(signup("a@b.co")).await.unwrap().session.unwrap();
        let me = session.user.id;

        let stale = Session {
            access_token: "expired".into(),
            expires_at: 0,
            ..session.clone()
        };
        force_session(&backend, AuthChange::TokenRefreshed, Some(stale)).await;
        let mut events = backend.subscribe();

        backend.insert_food_scan(&scan(me, "apple", Signal::Green)).await.unwrap();

        let ev = events.recv().await.unwrap();
        assert_eq!(ev.change, AuthChange::TokenRefreshed);
        let current = backend.keeper.current().unwrap();
        assert!(!current.is_expired());
        assert_ne!(current.access_token, "expired");
        assert_eq!(backend.list_food_scans(me).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_signs_out_and_hides_rows() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        let session = backend.sign_up(signup("a@b.co")).await.unwrap().session.unwrap();
        let me = session.user.id;
        let stale = Session {
            refresh_token: "revoked".into(),
            expires_at: 0,
            ..session
        };
        force_session(&backend, AuthChange::TokenRefreshed, Some(stale)).await;
        let mut events = backend.subscribe();

        assert!(backend.list_food_scans(me).await.unwrap().is_empty());
        assert_eq!(events.recv().await.unwrap().change, AuthChange::SignedOut);
        assert!(backend.keeper.current().is_none());
    }

    #[tokio::test]
    async fn sign_up_then_sign_in_with_password() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        let outcome = backend.sign_up(signup("Ada@Example.com")).await.unwrap();
        assert!(!outcome.is_duplicate());
        assert!(outcome.session.is_some());

        backend.sign_out().await.unwrap();
        assert!(backend.get_session().await.unwrap().session.is_none());

        let err = backend
            .sign_in_with_password("ada@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::InvalidCredentials));

        let session = backend
            .sign_in_with_password("ada@example.com", "hunter22")
            .await
            .unwrap();
        assert_eq!(session.user.email, "ada@example.com");
    }

    #[tokio::test]
    async fn second_sign_up_reports_no_identities() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        backend.sign_up(signup("a@b.co")).await.unwrap();
        backend.sign_out().await.unwrap();

        let again = backend.sign_up(signup("a@b.co")).await.unwrap();
        assert!(again.is_duplicate());
        assert!(again.session.is_none());
        assert!(backend.get_session().await.unwrap().session.is_none());
    }

    #[tokio::test]
    async fn confirmation_gate_and_token_verification() {
        let backend = LocalBackend::in_memory(&test_jwt(), true);
        let outcome = backend.sign_up(signup("a@b.co")).await.unwrap();
        assert!(outcome.session.is_none());

        let err = backend
            .sign_in_with_password("a@b.co", "hunter22")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Email not confirmed");

        let link = backend
            .confirmation_link("a@b.co", "nutrisignal://auth/callback")
            .await
            .expect("pending link");
        let hash = link
            .split("token_hash=")
            .nth(1)
            .and_then(|s| s.split('&').next())
            .unwrap()
            .to_string();

        assert!(backend.verify_otp("bogus", OtpType::Signup).await.is_err());
        let session = backend.verify_otp(&hash, OtpType::Signup).await.unwrap();
        assert_eq!(session.user.email, "a@b.co");
        // tokens are single use
        assert!(backend.verify_otp(&hash, OtpType::Signup).await.is_err());
    }

    #[tokio::test]
    async fn rows_are_only_visible_to_their_owner() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        let outcome = backend.sign_up(signup("a@b.co")).await.unwrap();
        let me = outcome.session.unwrap().user.id;
        let stranger = Uuid::new_v4();

        backend.insert_food_scan(&scan(me, "apple", Signal::Green)).await.unwrap();
        assert!(backend
            .insert_food_scan(&scan(stranger, "kale", Signal::Green))
            .await
            .is_err());

        backend.sign_out().await.unwrap();
        assert!(backend.list_food_scans(me).await.unwrap().is_empty());
        assert!(backend
            .insert_food_scan(&scan(me, "pear", Signal::Green))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn scans_list_newest_first() {
        let backend = LocalBackend::in_memory(&test_jwt(), false);
        let me = backend
            .sign_up(signup("a@b.co"))
            .await
            .unwrap()
            .session
            .unwrap()
            .user
            .id;
        for (label, signal) in [("a", Signal::Green), ("b", Signal::Red), ("c", Signal::Yellow)] {
            backend.insert_food_scan(&scan(me, label, signal)).await.unwrap();
        }
        let labels: Vec<String> = backend
            .list_food_scans(me)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.food_label)
            .collect();
        assert_eq!(labels, ["c", "b", "a"]);
        assert_eq!(
            backend.list_scan_signals(me).await.unwrap(),
            vec![Signal::Green, Signal::Red, Signal::Yellow]
        );
    }

    #[tokio::test]
    async fn state_survives_reopen_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let db_file = dir.path().join("db.json");
        let session_file = dir.path().join("session.json");
        let storage = || -> Arc<dyn SessionStorage> {
            Arc::new(crate::session::storage::FileSessionStorage::new(
                session_file.clone(),
            ))
        };

        let first = LocalBackend::open(Some(db_file.clone()), &test_jwt(), false, storage())
            .await
            .unwrap();
        let me = first
            .sign_up(signup("a@b.co"))
            .await
            .unwrap()
            .session
            .unwrap()
            .user
            .id;
        first.insert_food_scan(&scan(me, "apple", Signal::Green)).await.unwrap();
        drop(first);

        let second = LocalBackend::open(Some(db_file), &test_jwt(), false, storage())
            .await
            .unwrap();
        let snap = second.get_session().await.unwrap();
        assert_eq!(snap.session.map(|s| s.user.id), Some(me));
        assert_eq!(second.list_food_scans(me).await.unwrap().len(), 1);
    }
}
