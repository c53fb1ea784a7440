use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use super::dto::Session;

/// Subscribers that fall further behind than this see `Lagged`.
pub(crate) const EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthChange {
    InitialSession,
    SignedIn,
    SignedOut,
    TokenRefreshed,
}

/// Pushed to subscribers whenever the backend's session changes.
#[derive(Debug, Clone)]
pub struct AuthEvent {
    /// Strictly increasing per backend; orders events against snapshots.
    pub seq: u64,
    pub change: AuthChange,
    pub session: Option<Session>,
}

/// Session as of sequence number `seq`.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub seq: u64,
    pub session: Option<Session>,
}

/// Current session plus the channel announcing its changes.
///
/// The sequence number is bumped and the event sent under the same lock, so
/// receivers see events in sequence order.
pub struct SessionCell {
    state: Mutex<SessionSnapshot>,
    tx: broadcast::Sender<AuthEvent>,
}

impl Default for SessionCell {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(SessionSnapshot::default()),
            tx,
        }
    }
}

impl SessionCell {
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn current(&self) -> Option<Session> {
        self.snapshot().session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }

    pub fn replace(&self, change: AuthChange, session: Option<Session>) -> u64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.seq += 1;
        state.session = session.clone();
        let seq = state.seq;
        // no receivers is fine
        let _ = self.tx.send(AuthEvent {
            seq,
            change,
            session,
        });
        debug!(seq, ?change, "auth state changed");
        seq
    }
}

#[cfg(test)]
mod events_tests {
    use super::*;
    use crate::backend::dto::SessionUser;
    use uuid::Uuid;

    #[tokio::test]
    async fn replace_bumps_seq_and_notifies() {
        let cell = SessionCell::default();
        let mut rx = cell.subscribe();
        assert_eq!(cell.snapshot().seq, 0);

        let session = Session {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: 0,
            user: SessionUser {
                id: Uuid::new_v4(),
                email: "a@b.co".into(),
            },
        };
        assert_eq!(cell.replace(AuthChange::SignedIn, Some(session.clone())), 1);
        assert_eq!(cell.replace(AuthChange::SignedOut, None), 2);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.seq, first.change), (1, AuthChange::SignedIn));
        assert_eq!(first.session, Some(session));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.seq, second.change), (2, AuthChange::SignedOut));
        assert!(cell.current().is_none());
    }
}
