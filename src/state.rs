use std::sync::Arc;

use crate::backend::{BackendClient, LocalBackend, SupabaseClient};
use crate::classifier::{Classifier, HttpClassifier};
use crate::config::{AppConfig, BackendConfig};
use crate::screens::{LoginScreen, OnboardingScreen, PhotoPicker, ProfileScreen, ScanScreen};
use crate::session::{FileSessionStorage, MemorySessionStorage, SessionContext, SessionStorage};

/// Everything built once at startup and shared by the screens.
#[derive(Clone)]
pub struct App {
    pub config: Arc<AppConfig>,
    pub backend: Arc<dyn BackendClient>,
    pub classifier: Arc<dyn Classifier>,
    pub session: Arc<SessionContext>,
}

impl App {
    /// Must be called inside a tokio runtime; starts restoring the session.
    pub async fn init(config: AppConfig) -> anyhow::Result<Self> {
        let config = Arc::new(config);

        let storage: Arc<dyn SessionStorage> = match &config.session_file {
            Some(path) => Arc::new(FileSessionStorage::new(path)),
            None => Arc::new(MemorySessionStorage::default()),
        };

        let backend: Arc<dyn BackendClient> = match &config.backend {
            BackendConfig::Supabase { url, anon_key } => {
                Arc::new(SupabaseClient::new(url, anon_key, storage))
            }
            BackendConfig::Local {
                db_file,
                jwt,
                require_confirmation,
            } => Arc::new(
                LocalBackend::open(db_file.clone(), jwt, *require_confirmation, storage).await?,
            ),
        };

        let classifier = Arc::new(HttpClassifier::new(&config.classifier_url)) as Arc<dyn Classifier>;
        tracing::debug!(classifier = %config.classifier_url, "app initialised");

        Ok(Self::from_parts(config, backend, classifier))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        backend: Arc<dyn BackendClient>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let session = SessionContext::start(backend.clone(), config.email_redirect_url.clone());
        Self {
            config,
            backend,
            classifier,
            session,
        }
    }

    #[cfg(test)]
    pub fn fake(classifier: Arc<dyn Classifier>) -> Self {
        use crate::backend::local::local_tests::test_jwt;
        use crate::config::{DEFAULT_CLASSIFIER_URL, DEFAULT_EMAIL_REDIRECT_URL};

        let jwt = test_jwt();
        let config = Arc::new(AppConfig {
            classifier_url: DEFAULT_CLASSIFIER_URL.into(),
            email_redirect_url: DEFAULT_EMAIL_REDIRECT_URL.into(),
            session_file: None,
            backend: BackendConfig::Local {
                db_file: None,
                jwt: jwt.clone(),
                require_confirmation: false,
            },
        });
        let backend = Arc::new(LocalBackend::in_memory(&jwt, false));
        Self::from_parts(config, backend, classifier)
    }

    pub fn scan_screen(&self, picker: Arc<dyn PhotoPicker>) -> ScanScreen {
        ScanScreen::new(self.session.clone(), self.classifier.clone(), picker)
    }

    pub fn login_screen(&self) -> LoginScreen {
        LoginScreen::new(self.session.clone())
    }

    pub fn onboarding_screen(&self) -> OnboardingScreen {
        OnboardingScreen::new(self.session.clone())
    }

    pub fn profile_screen(&self) -> ProfileScreen {
        ProfileScreen::new(self.session.clone())
    }

    pub fn shutdown(&self) {
        self.session.shutdown();
    }
}

#[cfg(test)]
mod state_tests {
    use super::*;
    use crate::classifier::ScanResult;
    use crate::config::JwtConfig;
    use crate::screens::FilePicker;
    use crate::session::Route;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::io::Write;

    struct Unreachable;

    #[async_trait]
    impl Classifier for Unreachable {
        async fn classify(&self, _image: Bytes) -> ScanResult {
            ScanResult::connect_error()
        }
    }

    #[tokio::test]
    async fn fake_app_starts_signed_out() {
        let app = App::fake(Arc::new(Unreachable));
        let state = app.session.ready().await;
        assert_eq!(state.route(), Route::Login);
        app.shutdown();
    }

    #[tokio::test]
    async fn local_config_persists_session_across_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            classifier_url: "http://127.0.0.1:9/classify".into(),
            email_redirect_url: "nutrisignal://auth/callback".into(),
            session_file: Some(dir.path().join("session.json")),
            backend: BackendConfig::Local {
                db_file: Some(dir.path().join("db.json")),
                jwt: JwtConfig {
                    secret: "s".into(),
                    issuer: "i".into(),
                    audience: "authenticated".into(),
                    ttl_minutes: 60,
                    refresh_ttl_minutes: 120,
                },
                require_confirmation: false,
            },
        };

        let app = App::init(config.clone()).await.unwrap();
        app.session.ready().await;
        app.session
            .sign_up("a@b.co", "hunter22", None, None)
            .await
            .unwrap();
        let user = app.session.wait_until(|s| s.user.is_some()).await.user;
        app.shutdown();
        drop(app);

        let again = App::init(config).await.unwrap();
        let state = again.session.ready().await;
        assert_eq!(state.user, user);

        let mut photo = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
        photo.write_all(b"jpeg").unwrap();
        let scan = again.scan_screen(Arc::new(FilePicker::new(photo.path())));
        assert!(scan.choose().await.unwrap());
        assert!(scan.view().can_classify);
    }
}
