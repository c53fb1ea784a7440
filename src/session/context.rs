use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::deeplink::parse_confirmation;
use crate::backend::{
    AuthEvent, BackendClient, FoodScan, NewFoodScan, NewProfile, Profile, ProfileUpdate,
    ScanStats, SessionUser, SignUpRequest,
};
use crate::classifier::{Nutrition, ScoringMetadata, Signal};
use crate::error::AppError;

pub const EMAIL_CONFIRMED_MESSAGE: &str = "Email confirmed — you’re all set.";

/// Which top-level view the app should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Loading,
    Login,
    Onboarding,
    Main,
}

/// Everything the UI knows about the signed-in user.
///
/// `user` is set as soon as a session is known; `profile` follows
/// asynchronously, so `user.is_some() && profile.is_none()` is a normal
/// transient state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthState {
    pub loading: bool,
    pub user: Option<SessionUser>,
    pub profile: Option<Profile>,
    /// One-shot message for the login screen, e.g. after email confirmation.
    pub auth_message: Option<String>,
    applied_seq: u64,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        !self.loading && self.user.is_some()
    }

    pub fn route(&self) -> Route {
        if self.loading {
            return Route::Loading;
        }
        match (&self.user, &self.profile) {
            (None, _) => Route::Login,
            (Some(_), Some(p)) if !p.is_onboarded() => Route::Onboarding,
            (Some(_), _) => Route::Main,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignUpStatus {
    /// Account is live and signed in.
    SignedIn,
    /// Account exists but must be confirmed from the emailed link.
    ConfirmationSent,
}

#[derive(Debug, Clone, Copy)]
enum Source {
    /// Pushed by the backend; must be newer than what is applied.
    Event,
    /// Read from the backend on demand; may repeat the applied sequence.
    Refresh,
}

struct Inner {
    backend: Arc<dyn BackendClient>,
    redirect_to: String,
    state: watch::Sender<AuthState>,
    /// Bumped whenever the cached profile is superseded; tags in-flight loads.
    profile_gen: AtomicU64,
    closed: AtomicBool,
}

/// Process-wide auth/session state, constructed once at startup and handed to
/// every screen.
///
/// Three sources feed the state: the restore on start, backend session
/// events, and confirmation deep links. All of them go through the same
/// sequence-checked update, so none can overwrite a newer view of the user.
pub struct SessionContext {
    inner: Arc<Inner>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SessionContext {
    /// Subscribes to backend events, then restores the session in the background.
    /// Must be called inside a tokio runtime.
    pub fn start(backend: Arc<dyn BackendClient>, redirect_to: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(AuthState {
            loading: true,
            ..Default::default()
        });
        let inner = Arc::new(Inner {
            backend,
            redirect_to: redirect_to.into(),
            state,
            profile_gen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let events = inner.backend.subscribe();
        let task = tokio::spawn(listen(inner.clone(), events));
        Arc::new(Self {
            inner,
            listener: Mutex::new(Some(task)),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.inner.state.subscribe()
    }

    pub fn snapshot(&self) -> AuthState {
        self.inner.state.borrow().clone()
    }

    pub fn current_user(&self) -> Option<SessionUser> {
        self.inner.state.borrow().user.clone()
    }

    /// Waits for the initial restore to finish.
    pub async fn ready(&self) -> AuthState {
        self.wait_until(|s| !s.loading).await
    }

    pub async fn wait_until(&self, mut pred: impl FnMut(&AuthState) -> bool) -> AuthState {
        let mut rx = self.subscribe();
        let res = rx.wait_for(|s| pred(s)).await.map(|s| (*s).clone());
        // the sender lives as long as `self`, so this only fails after shutdown
        res.unwrap_or_else(|_| self.snapshot())
    }

    /// Stops reacting to backend events; late results are dropped.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.profile_gen.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        debug!("session context shut down");
    }

    /// State changes arrive through the backend's session event, not the return value.
    #[instrument(skip(self, password))]
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), AppError> {
        self.inner
            .backend
            .sign_in_with_password(email, password)
            .await
            .map_err(|e| {
                warn!(error = %e, "sign in failed");
                AppError::from(e)
            })?;
        Ok(())
    }

    #[instrument(skip(self, password))]
    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
    ) -> Result<SignUpStatus, AppError> {
        let backend = &self.inner.backend;
        let outcome = backend
            .sign_up(SignUpRequest {
                email: email.to_string(),
                password: password.to_string(),
                first_name: first_name.map(str::to_string),
                last_name: last_name.map(str::to_string),
                redirect_to: Some(self.inner.redirect_to.clone()),
            })
            .await
            .map_err(|e| {
                warn!(error = %e, "sign up failed");
                AppError::from(e)
            })?;

        if outcome.is_duplicate() {
            if outcome.session.is_some() {
                if let Err(e) = backend.sign_out().await {
                    error!(error = %e, "dropping session of duplicate sign up failed");
                }
            }
            warn!("sign up for an existing account");
            return Err(AppError::DuplicateAccount);
        }

        if let Some(user) = &outcome.user {
            let profile = NewProfile {
                id: user.id,
                email: user.email.clone().unwrap_or_else(|| email.to_string()),
                first_name: first_name.map(str::to_string),
                last_name: last_name.map(str::to_string),
            };
            match backend.insert_profile(&profile).await {
                Ok(rows) => {
                    if let Some(row) = rows.into_iter().next() {
                        let gen = self.inner.next_profile_gen();
                        self.inner.set_profile_if_current(gen, user.id, Some(row));
                    }
                }
                // the account exists either way
                Err(e) => warn!(error = %e, user_id = %user.id, "creating profile row failed"),
            }
        }

        Ok(if outcome.session.is_some() {
            SignUpStatus::SignedIn
        } else {
            SignUpStatus::ConfirmationSent
        })
    }

    /// Safe to call when already signed out.
    #[instrument(skip(self))]
    pub async fn sign_out(&self) -> Result<(), AppError> {
        self.inner.backend.sign_out().await.map_err(|e| {
            warn!(error = %e, "sign out failed");
            AppError::from(e)
        })
    }

    /// Handles an email-confirmation callback. Returns whether a session refresh
    /// was triggered; incomplete links and failed verifications are only logged.
    #[instrument(skip(self, link))]
    pub async fn handle_deep_link(&self, link: &str) -> bool {
        let Some(confirmation) = parse_confirmation(link) else {
            debug!("link is not a confirmation callback");
            return false;
        };
        if let Err(e) = self
            .inner
            .backend
            .verify_otp(&confirmation.token_hash, confirmation.kind)
            .await
        {
            error!(error = %e, kind = %confirmation.kind, "email confirmation failed");
            return false;
        }
        if self.inner.closed.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.state.send_modify(|st| {
            st.auth_message = Some(EMAIL_CONFIRMED_MESSAGE.to_string());
        });
        self.inner.refresh_session_state().await;
        true
    }

    pub fn clear_auth_message(&self) {
        self.inner.state.send_if_modified(|st| st.auth_message.take().is_some());
    }

    /// Persists one classified scan for the current user.
    #[instrument(skip(self, nutrition, metadata))]
    pub async fn record_scan(
        &self,
        label: &str,
        signal: Signal,
        score: f64,
        nutrition: Nutrition,
        metadata: Option<ScoringMetadata>,
    ) -> Result<FoodScan, AppError> {
        let user = self.current_user().ok_or(AppError::Unauthenticated)?;
        let scan = NewFoodScan {
            user_id: user.id,
            food_label: label.to_string(),
            signal,
            score,
            nutrition,
            scoring_metadata: metadata.filter(|m| !m.is_empty()),
        };
        let rows = self
            .inner
            .backend
            .insert_food_scan(&scan)
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "saving food scan failed");
                AppError::Persistence("Failed to save scan".into())
            })?;
        let saved = rows
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Persistence("Failed to save scan".into()))?;
        info!(user_id = %user.id, label, %signal, score, "food scan saved");
        Ok(saved)
    }

    /// Zero counts when signed out.
    pub async fn fetch_scan_stats(&self) -> Result<ScanStats, AppError> {
        let Some(user) = self.current_user() else {
            return Ok(ScanStats::default());
        };
        let signals = self.inner.backend.list_scan_signals(user.id).await?;
        Ok(ScanStats::tally(signals))
    }

    /// Most recent first; empty when signed out.
    pub async fn fetch_food_scans(&self) -> Result<Vec<FoodScan>, AppError> {
        let Some(user) = self.current_user() else {
            return Ok(Vec::new());
        };
        Ok(self.inner.backend.list_food_scans(user.id).await?)
    }

    /// Reads the profile row and caches it.
    pub async fn fetch_user_profile(&self) -> Result<Option<Profile>, AppError> {
        let Some(user) = self.current_user() else {
            return Ok(None);
        };
        let gen = self.inner.next_profile_gen();
        let profile = self.inner.backend.get_profile(user.id).await?;
        self.inner
            .set_profile_if_current(gen, user.id, profile.clone());
        Ok(profile)
    }

    /// Writes `update`, then re-reads the row so the cache holds exactly what
    /// was persisted.
    #[instrument(skip(self, update))]
    pub async fn update_user_profile(
        &self,
        update: ProfileUpdate,
    ) -> Result<Option<Profile>, AppError> {
        let user = self.current_user().ok_or(AppError::Unauthenticated)?;
        let rows = self
            .inner
            .backend
            .update_profile(user.id, &update)
            .await
            .map_err(|e| {
                error!(error = %e, user_id = %user.id, "profile update failed");
                AppError::from(e)
            })?;
        if rows.is_empty() {
            warn!(user_id = %user.id, "profile update matched no row");
        }
        self.fetch_user_profile().await
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        if let Some(task) = self
            .listener
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
    }
}

async fn listen(inner: Arc<Inner>, mut events: broadcast::Receiver<AuthEvent>) {
    inner.refresh_session_state().await;
    loop {
        match events.recv().await {
            Ok(ev) => {
                debug!(seq = ev.seq, change = ?ev.change, "auth event");
                inner.apply_session(ev.seq, ev.session.map(|s| s.user), Source::Event);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "auth events lagged; re-reading session");
                inner.refresh_session_state().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

impl Inner {
    fn next_profile_gen(&self) -> u64 {
        self.profile_gen.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Restore and explicit refreshes both land here.
    async fn refresh_session_state(self: &Arc<Self>) {
        match self.backend.get_session().await {
            Ok(snap) => {
                self.apply_session(snap.seq, snap.session.map(|s| s.user), Source::Refresh)
            }
            Err(e) => {
                error!(error = %e, "restoring session failed");
                if self.closed.load(Ordering::SeqCst) {
                    return;
                }
                self.next_profile_gen();
                self.state.send_modify(|st| {
                    st.loading = false;
                    st.user = None;
                    st.profile = None;
                });
            }
        }
    }

    fn apply_session(self: &Arc<Self>, seq: u64, user: Option<SessionUser>, source: Source) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let applied = self.state.send_if_modified(|st| {
            let fresh = match source {
                Source::Event => seq > st.applied_seq,
                Source::Refresh => seq >= st.applied_seq,
            };
            if !fresh {
                return false;
            }
            if st.user.as_ref().map(|u| u.id) != user.as_ref().map(|u| u.id) {
                st.profile = None;
            }
            st.applied_seq = seq;
            st.loading = false;
            st.user = user.clone();
            true
        });
        if !applied {
            debug!(seq, ?source, "stale session update ignored");
            return;
        }

        let gen = self.next_profile_gen();
        if let Some(user) = user {
            tokio::spawn(load_profile(self.clone(), gen, user.id));
        }
    }

    fn set_profile_if_current(&self, gen: u64, user_id: Uuid, profile: Option<Profile>) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            return false;
        }
        let applied = self.state.send_if_modified(|st| {
            if self.profile_gen.load(Ordering::SeqCst) != gen
                || st.user.as_ref().map(|u| u.id) != Some(user_id)
            {
                return false;
            }
            st.profile = profile;
            true
        });
        if !applied {
            debug!(gen, %user_id, "superseded profile result dropped");
        }
        applied
    }
}

/// Failures degrade to "no profile"; they never block the session.
async fn load_profile(inner: Arc<Inner>, gen: u64, user_id: Uuid) {
    let profile = match inner.backend.get_profile(user_id).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, %user_id, "loading profile failed");
            None
        }
    };
    inner.set_profile_if_current(gen, user_id, profile);
}
