//! Uploader abstraction over the remote store, to enable testing
//!
//! `reachable()` must be cheap and free of authentication side effects; the
//! scheduler calls it every cycle, including while disconnected. `put()` is
//! the authenticated call and only runs after a successful probe.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::path::Path;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dropbox content upload endpoint
pub const DROPBOX_UPLOAD_URL: &str = "https://content.dropboxapi.com/2/files/upload";

/// Error bodies that mean the token itself is bad, whatever the status
const AUTH_ERROR_MARKERS: &[&str] = &[
    "invalid_access_token",
    "expired_access_token",
    "access token is malformed",
];

/// Upper bound for one upload request
const UPLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of a single upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The store accepted the file
    Success,
    /// Credentials rejected; retrying is pointless
    AuthError(String),
    /// Anything else; the file stays queued
    Transient(String),
}

/// Remote store seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Uploader: Send + Sync + 'static {
    /// Cheap connectivity check
    async fn reachable(&self) -> bool;

    /// Upload `local_path` as `remote_name`
    async fn put(&self, local_path: &Path, remote_name: &str) -> UploadOutcome;
}

/// TCP connect probe against the store's host
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }

    /// True if a TCP connection opens within the timeout
    pub async fn probe(&self) -> bool {
        match tokio::time::timeout(self.timeout, TcpStream::connect((self.host.as_str(), self.port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe {}:{} failed: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                debug!("Probe {}:{} timed out", self.host, self.port);
                false
            }
        }
    }
}

/// Uploads to Dropbox with a long-lived access token
#[derive(Debug, Clone)]
pub struct DropboxUploader {
    client: reqwest::Client,
    token: String,
    endpoint: String,
    probe: TcpProbe,
}

impl DropboxUploader {
    pub fn new(token: impl Into<String>, probe: TcpProbe) -> Self {
        Self {
            client: reqwest::Client::new(),
            token: token.into(),
            endpoint: DROPBOX_UPLOAD_URL.to_string(),
            probe,
        }
    }

    /// Override the upload endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// Map an HTTP status and error body to an outcome
///
/// Dropbox answers a malformed token with 400, so the body is checked too.
pub fn classify_status(status: StatusCode, body: &str) -> UploadOutcome {
    if status.is_success() {
        UploadOutcome::Success
    } else if status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
        || AUTH_ERROR_MARKERS.iter().any(|marker| body.contains(marker))
    {
        UploadOutcome::AuthError(format!("{}: {}", status, body.trim()))
    } else {
        UploadOutcome::Transient(format!("{}: {}", status, body.trim()))
    }
}

#[async_trait]
impl Uploader for DropboxUploader {
    async fn reachable(&self) -> bool {
        self.probe.probe().await
    }

    async fn put(&self, local_path: &Path, remote_name: &str) -> UploadOutcome {
        let body = match tokio::fs::read(local_path).await {
            Ok(body) => body,
            Err(e) => return UploadOutcome::Transient(format!("cannot read {}: {}", local_path.display(), e)),
        };

        let arg = serde_json::json!({
            "path": remote_name,
            "mode": "overwrite",
            "mute": true,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .timeout(UPLOAD_REQUEST_TIMEOUT)
            .header("Dropbox-API-Arg", arg.to_string())
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                classify_status(status, &text)
            }
            Err(e) => UploadOutcome::Transient(format!("request failed: {}", e)),
        }
    }
}

/// Never reachable; keeps files local when uploading is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineUploader;

#[async_trait]
impl Uploader for OfflineUploader {
    async fn reachable(&self) -> bool {
        false
    }

    async fn put(&self, _local_path: &Path, _remote_name: &str) -> UploadOutcome {
        UploadOutcome::Transient("uploading disabled".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK, ""), UploadOutcome::Success);
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, "{\"error_summary\": \"expired_access_token/\"}"),
            UploadOutcome::AuthError(msg) if msg.contains("expired_access_token")
        ));
        assert!(matches!(classify_status(StatusCode::FORBIDDEN, ""), UploadOutcome::AuthError(_)));
        assert!(matches!(classify_status(StatusCode::TOO_MANY_REQUESTS, ""), UploadOutcome::Transient(_)));
        assert!(matches!(classify_status(StatusCode::SERVICE_UNAVAILABLE, ""), UploadOutcome::Transient(_)));
        assert!(matches!(classify_status(StatusCode::CONFLICT, ""), UploadOutcome::Transient(_)));
    }

    #[test]
    fn test_bad_token_body_is_auth_error_on_any_status() {
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                "Error in call to API function \"files/upload\": The given OAuth 2 access token is malformed."
            ),
            UploadOutcome::AuthError(_)
        ));
        assert!(matches!(
            classify_status(
                StatusCode::BAD_REQUEST,
                "{\"error\": {\".tag\": \"invalid_access_token\"}, \"error_summary\": \"invalid_access_token/\"}"
            ),
            UploadOutcome::AuthError(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "{\"error_summary\": \"expired_access_token/..\"}"),
            UploadOutcome::AuthError(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::CONFLICT, "{\"error_summary\": \"path/insufficient_space/\"}"),
            UploadOutcome::Transient(_)
        ));
    }

    #[tokio::test]
    async fn test_probe_reaches_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.probe().await);
    }

    #[tokio::test]
    async fn test_probe_fails_on_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn test_put_missing_file_is_transient() {
        let uploader = DropboxUploader::new("token", TcpProbe::new("127.0.0.1", 9, Duration::from_millis(10)));
        let outcome = uploader.put(Path::new("/nonexistent/file.csv"), "/file.csv").await;
        assert!(matches!(outcome, UploadOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn test_put_unreachable_endpoint_is_transient() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        std::fs::write(&path, "h\n").unwrap();

        let uploader = DropboxUploader::new("token", TcpProbe::new("127.0.0.1", port, Duration::from_millis(10)))
            .with_endpoint(format!("http://127.0.0.1:{}/2/files/upload", port));
        assert!(matches!(uploader.put(&path, "/a.csv").await, UploadOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn test_offline_uploader() {
        assert!(!OfflineUploader.reachable().await);
        assert!(matches!(
            OfflineUploader.put(Path::new("x"), "/x").await,
            UploadOutcome::Transient(_)
        ));
    }
}
