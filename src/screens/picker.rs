use std::path::PathBuf;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

/// A photo handed back by the OS picker.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotoAsset {
    pub uri: String,
    pub data: Bytes,
}

/// Camera / photo-library access. `Ok(None)` means the user cancelled.
#[async_trait]
pub trait PhotoPicker: Send + Sync {
    async fn launch_camera(&self) -> anyhow::Result<Option<PhotoAsset>>;
    async fn launch_library(&self) -> anyhow::Result<Option<PhotoAsset>>;
}

/// Picks a fixed image file; both sources resolve to the same path.
pub struct FilePicker {
    path: PathBuf,
}

impl FilePicker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn pick(&self) -> anyhow::Result<Option<PhotoAsset>> {
        let abs = tokio::fs::canonicalize(&self.path)
            .await
            .with_context(|| format!("resolving {}", self.path.display()))?;
        let data = tokio::fs::read(&abs)
            .await
            .with_context(|| format!("reading {}", abs.display()))?;
        let uri = Url::from_file_path(&abs)
            .map_err(|_| anyhow!("not a file path: {}", abs.display()))?;
        debug!(%uri, bytes = data.len(), "photo picked");
        Ok(Some(PhotoAsset {
            uri: uri.into(),
            data: Bytes::from(data),
        }))
    }
}

#[async_trait]
impl PhotoPicker for FilePicker {
    async fn launch_camera(&self) -> anyhow::Result<Option<PhotoAsset>> {
        self.pick().await
    }

    async fn launch_library(&self) -> anyhow::Result<Option<PhotoAsset>> {
        self.pick().await
    }
}

#[cfg(test)]
mod picker_tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn file_picker_returns_file_uri_and_bytes() {
        let mut file = tempfile::Builder::new().suffix(".jpg").tempfile().unwrap();
        file.write_all(b"\xff\xd8jpeg").unwrap();

        let asset = FilePicker::new(file.path())
            .launch_camera()
            .await
            .unwrap()
            .expect("asset");
        assert!(asset.uri.starts_with("file:///"));
        assert!(asset.uri.ends_with(".jpg"));
        assert_eq!(&asset.data[..], b"\xff\xd8jpeg");
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FilePicker::new(dir.path().join("nope.jpg"))
            .launch_library()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope.jpg"));
    }
}
