use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

pub const DEFAULT_CLASSIFIER_URL: &str = "http://127.0.0.1:8000/classify";
pub const DEFAULT_EMAIL_REDIRECT_URL: &str = "nutrisignal://auth/callback";

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: String,
    pub audience: String,
    pub ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

/// Which implementation backs auth and the profile/scan tables.
#[derive(Debug, Clone, Deserialize)]
pub enum BackendConfig {
    /// Hosted auth + REST table service.
    Supabase { url: String, anon_key: String },
    /// In-process store persisted to a JSON file, for development without a hosted project.
    Local {
        db_file: Option<PathBuf>,
        jwt: JwtConfig,
        require_confirmation: bool,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub classifier_url: String,
    pub email_redirect_url: String,
    /// `None` keeps the session in memory only.
    pub session_file: Option<PathBuf>,
    pub backend: BackendConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let classifier_url =
            std::env::var("CLASSIFIER_URL").unwrap_or_else(|_| DEFAULT_CLASSIFIER_URL.into());
        let email_redirect_url = std::env::var("EMAIL_REDIRECT_URL")
            .unwrap_or_else(|_| DEFAULT_EMAIL_REDIRECT_URL.into());
        let session_file = std::env::var("SESSION_FILE")
            .ok()
            .map(PathBuf::from)
            .or_else(|| data_file("session.json"));

        let kind = std::env::var("BACKEND").unwrap_or_else(|_| {
            if std::env::var("SUPABASE_URL").is_ok() {
                "supabase".into()
            } else {
                "local".into()
            }
        });

        let backend = match kind.as_str() {
            "supabase" => BackendConfig::Supabase {
                url: std::env::var("SUPABASE_URL").context("SUPABASE_URL is not set")?,
                anon_key: std::env::var("SUPABASE_ANON_KEY")
                    .context("SUPABASE_ANON_KEY is not set")?,
            },
            "local" => BackendConfig::Local {
                db_file: std::env::var("LOCAL_DB_FILE")
                    .ok()
                    .map(PathBuf::from)
                    .or_else(|| data_file("local-db.json")),
                jwt: JwtConfig {
                    secret: std::env::var("JWT_SECRET")
                        .unwrap_or_else(|_| "nutrisignal-local-dev-secret".into()),
                    issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "nutrisignal".into()),
                    audience: std::env::var("JWT_AUDIENCE")
                        .unwrap_or_else(|_| "authenticated".into()),
                    ttl_minutes: std::env::var("JWT_TTL_MINUTES")
                        .ok()
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(60),
                    refresh_ttl_minutes: std::env::var("JWT_REFRESH_TTL_MINUTES")
                        .ok()
                        .and_then(|v| v.parse::<i64>().ok())
                        .unwrap_or(60 * 24 * 14),
                },
                require_confirmation: std::env::var("LOCAL_REQUIRE_CONFIRMATION")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            },
            other => anyhow::bail!("unknown BACKEND {other:?}, expected `supabase` or `local`"),
        };

        Ok(Self {
            classifier_url,
            email_redirect_url,
            session_file,
            backend,
        })
    }
}

fn data_file(name: &str) -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("nutrisignal").join(name))
}
