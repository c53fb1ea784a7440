use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use tracing::{debug, instrument, warn};

use super::dto::{ClassifyBody, ScanResult};

const UPLOAD_FIELD: &str = "file";
const UPLOAD_FILENAME: &str = "photo.jpg";
const UPLOAD_MIME: &str = "image/jpeg";

/// Sends a photo to the classification service.
///
/// Never fails: every transport or shape problem is folded into
/// [`ScanResult::Failed`] so callers render one fallback message.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, image: Bytes) -> ScanResult;
}

#[derive(Clone)]
pub struct HttpClassifier {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    #[instrument(skip(self, image), fields(endpoint = %self.endpoint, bytes = image.len()))]
    async fn classify(&self, image: Bytes) -> ScanResult {
        let part = match Part::bytes(image.to_vec())
            .file_name(UPLOAD_FILENAME)
            .mime_str(UPLOAD_MIME)
        {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "building multipart body failed");
                return ScanResult::connect_error();
            }
        };
        let form = Form::new().part(UPLOAD_FIELD, part);

        let res = match self.http.post(&self.endpoint).multipart(form).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "classify request failed");
                return ScanResult::connect_error();
            }
        };

        let status = res.status();
        if !status.is_success() {
            warn!(%status, "classify returned non-success status");
            return ScanResult::connect_error();
        }

        match res.json::<ClassifyBody>().await {
            Ok(body) => {
                let result = body.into_result();
                match &result {
                    ScanResult::Classified(c) => {
                        debug!(label = %c.label, signal = %c.signal, score = c.score, "classified")
                    }
                    ScanResult::Failed { error } => warn!(%error, "classifier reported failure"),
                }
                result
            }
            Err(e) => {
                warn!(error = %e, "classify response did not decode");
                ScanResult::connect_error()
            }
        }
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;
    use crate::classifier::dto::{Signal, CONNECT_ERROR};
    use axum::{extract::Multipart, http::StatusCode, routing::post, Json, Router};
    use serde_json::json;

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/classify", addr)
    }

    async fn echo_upload(mut mp: Multipart) -> Result<Json<serde_json::Value>, StatusCode> {
        while let Ok(Some(field)) = mp.next_field().await {
            if field.name() == Some("file")
                && field.file_name() == Some("photo.jpg")
                && field.content_type() == Some("image/jpeg")
            {
                let data = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                return Ok(Json(json!({
                    "label": "apple",
                    "signal": "Green",
                    "score": 92.5,
                    "nutrition": { "calories": 52 },
                    "bytes_seen": data.len(),
                })));
            }
        }
        Err(StatusCode::UNPROCESSABLE_ENTITY)
    }

    #[tokio::test]
    async fn uploads_jpeg_part_and_parses_result() {
        let url = spawn(Router::new().route("/classify", post(echo_upload))).await;
        let classifier = HttpClassifier::new(url);

        let res = classifier.classify(Bytes::from_static(b"\xff\xd8jpeg")).await;
        let c = res.classification().expect("classified");
        assert_eq!(c.label, "apple");
        assert_eq!(c.signal, Signal::Green);
        assert_eq!(c.score, 92.5);
        assert_eq!(c.nutrition.calories, Some(52.0));
        assert_eq!(c.scoring.diagnostics.get("bytes_seen"), Some(&json!(6)));
    }

    #[tokio::test]
    async fn server_error_status_becomes_connect_error() {
        let app = Router::new().route(
            "/classify",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let classifier = HttpClassifier::new(spawn(app).await);
        let res = classifier.classify(Bytes::from_static(b"x")).await;
        assert_eq!(res.error(), Some(CONNECT_ERROR));
    }

    #[tokio::test]
    async fn unreachable_endpoint_becomes_connect_error() {
        // bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let classifier = HttpClassifier::new(format!("http://{}/classify", addr));
        let res = classifier.classify(Bytes::from_static(b"x")).await;
        assert_eq!(res, ScanResult::connect_error());
    }
}
