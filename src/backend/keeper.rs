use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::dto::Session;
use super::events::{AuthChange, AuthEvent, SessionCell, SessionSnapshot};
use super::BackendError;
use crate::session::storage::SessionStorage;

/// Exchanges a session's refresh token for a new session.
#[async_trait]
pub(crate) trait Refresher: Send + Sync {
    async fn refresh(&self, session: &Session) -> Result<Session, BackendError>;
}

/// Owns the client-side session of a backend: the in-memory cell, its
/// persisted copy, and the one-time restore from storage.
///
/// Every session mutation goes through [`SessionKeeper::lock`], so a sign-in
/// racing the initial restore cannot be overwritten by the stored session.
pub(crate) struct SessionKeeper {
    cell: SessionCell,
    storage: Arc<dyn SessionStorage>,
    restored: Mutex<bool>,
}

pub(crate) struct KeeperGuard<'a> {
    keeper: &'a SessionKeeper,
    restored: tokio::sync::MutexGuard<'a, bool>,
}

impl SessionKeeper {
    pub fn new(storage: Arc<dyn SessionStorage>) -> Self {
        Self {
            cell: SessionCell::default(),
            storage,
            restored: Mutex::new(false),
        }
    }

    pub fn current(&self) -> Option<Session> {
        self.cell.current()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.cell.subscribe()
    }

    pub async fn lock(&self) -> KeeperGuard<'_> {
        KeeperGuard {
            keeper: self,
            restored: self.restored.lock().await,
        }
    }

    /// Restores once from storage, then refreshes the session if it has expired.
    pub async fn snapshot(&self, refresher: &dyn Refresher) -> SessionSnapshot {
        let mut guard = self.lock().await;

        if !*guard.restored {
            *guard.restored = true;
            let stored = match self.storage.load().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "stored session unreadable; starting signed out");
                    None
                }
            };
            let session = match stored {
                Some(s) if s.is_expired() => refresh_or_drop(refresher, &s).await,
                other => other,
            };
            if let Some(s) = &session {
                info!(user_id = %s.user.id, "session restored");
            }
            guard.set(AuthChange::InitialSession, session).await;
        } else {
            guard.refresh_expired(refresher).await;
        }

        self.cell.snapshot()
    }

    /// Current session, refreshed first if its access token has expired.
    /// A refresh that fails signs the user out.
    pub async fn fresh(&self, refresher: &dyn Refresher) -> Option<Session> {
        match self.cell.current() {
            Some(s) if s.is_expired() => {}
            other => return other,
        }
        let mut guard = self.lock().await;
        guard.refresh_expired(refresher).await;
        self.cell.current()
    }
}

async fn refresh_or_drop(refresher: &dyn Refresher, session: &Session) -> Option<Session> {
    match refresher.refresh(session).await {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, user_id = %session.user.id, "session refresh failed");
            None
        }
    }
}

impl KeeperGuard<'_> {
    /// Publishes the new session and persists it. Storage failures are logged;
    /// the in-memory session stays authoritative.
    pub async fn set(&mut self, change: AuthChange, session: Option<Session>) -> u64 {
        *self.restored = true;
        let persisted = match &session {
            Some(s) => self.keeper.storage.save(s).await,
            None => self.keeper.storage.clear().await,
        };
        if let Err(e) = persisted {
            warn!(error = %e, "persisting session failed");
        }
        self.keeper.cell.replace(change, session)
    }

    /// Concurrent callers queue on the lock; only the first one refreshes.
    async fn refresh_expired(&mut self, refresher: &dyn Refresher) {
        let Some(current) = self.keeper.cell.current().filter(Session::is_expired) else {
            return;
        };
        match refresh_or_drop(refresher, &current).await {
            Some(s) => self.set(AuthChange::TokenRefreshed, Some(s)).await,
            None => self.set(AuthChange::SignedOut, None).await,
        };
    }
}
