use std::sync::Arc;

use crate::backend::{FoodScan, ScanStats};
use crate::error::AppError;
use crate::session::SessionContext;

pub const NOT_LOGGED_IN: &str = "Not logged in";

#[derive(Debug, Clone, PartialEq)]
pub struct ProfileView {
    /// The user's email, or [`NOT_LOGGED_IN`].
    pub email: String,
    pub name: Option<String>,
    pub stats: ScanStats,
    /// Most recent first.
    pub history: Vec<FoodScan>,
}

pub struct ProfileScreen {
    session: Arc<SessionContext>,
}

impl ProfileScreen {
    pub fn new(session: Arc<SessionContext>) -> Self {
        Self { session }
    }

    pub async fn load(&self) -> Result<ProfileView, AppError> {
        let state = self.session.snapshot();
        let (stats, history) = tokio::try_join!(
            self.session.fetch_scan_stats(),
            self.session.fetch_food_scans()
        )?;
        Ok(ProfileView {
            email: state
                .user
                .map(|u| u.email)
                .unwrap_or_else(|| NOT_LOGGED_IN.to_string()),
            name: state.profile.as_ref().and_then(|p| p.display_name()),
            stats,
            history,
        })
    }

    pub async fn sign_out(&self) -> Result<(), AppError> {
        self.session.sign_out().await
    }
}

#[cfg(test)]
mod profile_tests {
    use super::*;
    use crate::backend::local::local_tests::test_jwt;
    use crate::backend::LocalBackend;
    use crate::classifier::{Nutrition, Signal};

    #[tokio::test]
    async fn signed_out_view_is_empty() {
        let backend = Arc::new(LocalBackend::in_memory(&test_jwt(), false));
        let ctx = SessionContext::start(backend, "nutrisignal://auth/callback");
        ctx.ready().await;

        let view = ProfileScreen::new(ctx).load().await.unwrap();
        assert_eq!(view.email, NOT_LOGGED_IN);
        assert_eq!(view.stats, ScanStats::default());
        assert!(view.history.is_empty());
    }

    #[tokio::test]
    async fn shows_stats_and_newest_scan_first() {
        let backend = Arc::new(LocalBackend::in_memory(&test_jwt(), false));
        let ctx = SessionContext::start(backend, "nutrisignal://auth/callback");
        ctx.ready().await;
        ctx.sign_up("a@b.co", "hunter22", Some("Ada"), Some("Lovelace"))
            .await
            .unwrap();
        ctx.wait_until(|s| s.profile.is_some()).await;

        ctx.record_scan("apple", Signal::Green, 92.5, Nutrition::default(), None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ctx.record_scan("donut", Signal::Red, 12.0, Nutrition::default(), None)
            .await
            .unwrap();

        let screen = ProfileScreen::new(ctx.clone());
        let view = screen.load().await.unwrap();
        assert_eq!(view.email, "a@b.co");
        assert_eq!(view.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(view.stats.total, 2);
        assert_eq!(view.stats.red, 1);
        assert_eq!(view.history[0].food_label, "donut");

        screen.sign_out().await.unwrap();
        ctx.wait_until(|s| s.user.is_none()).await;
        assert_eq!(screen.load().await.unwrap().email, NOT_LOGGED_IN);
    }
}
