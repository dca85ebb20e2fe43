//! HTTP client for the force-stop endpoint

use reqwest::{Client, Url};
use serde::Deserialize;
use std::time::Duration;

use super::ControlRequestError;

/// Default timeout for control requests
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Success body of `POST /force-stop/{session_id}`
#[derive(Debug, Deserialize)]
struct StopResponse {
    status: String,
}

/// Error body (`{"detail": "..."}`)
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    detail: String,
}

/// Client for the voice server's control endpoints
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: Client,
    base_url: String,
}

impl ControlClient {
    pub fn new(base_url: &str) -> Result<Self, ControlRequestError> {
        Self::with_timeout(base_url, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self, ControlRequestError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ControlRequestError::Network(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn force_stop_url(&self, session_id: &str) -> Result<Url, ControlRequestError> {
        let mut url = Url::parse(&self.base_url).map_err(|e| {
            ControlRequestError::Network(format!("invalid control URL {}: {}", self.base_url, e))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                ControlRequestError::Network(format!("invalid control URL {}", self.base_url))
            })?
            .pop_if_empty()
            .push("force-stop")
            .push(session_id);
        Ok(url)
    }

    /// Ask the server to terminate `session_id`.
    ///
    /// Returns the server's status message.
    pub async fn force_stop(&self, session_id: &str) -> Result<String, ControlRequestError> {
        let url = self.force_stop_url(session_id)?;
        log::info!("Control: requesting force stop of session {}", session_id);

        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| ControlRequestError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => err.detail,
                Err(_) if body.trim().is_empty() => status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
                Err(_) => body,
            };
            log::warn!("Control: force stop rejected ({}): {}", status, message);
            return Err(ControlRequestError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body: StopResponse = response
            .json()
            .await
            .map_err(|e| ControlRequestError::Parse(e.to_string()))?;

        log::info!("Control: force stop of {} acknowledged: {}", session_id, body.status);
        Ok(body.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response; returns the base URL and the request line
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();

            let text = String::from_utf8_lossy(&request).to_string();
            text.lines().next().unwrap_or_default().to_string()
        });

        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn test_force_stop_success() {
        let (base, server) =
            serve_once("200 OK", r#"{"status":"Session forcefully stopped"}"#).await;
        let client = ControlClient::new(&base).unwrap();

        let status = client.force_stop("abc123").await.unwrap();
        assert_eq!(status, "Session forcefully stopped");
        assert_eq!(server.await.unwrap(), "POST /force-stop/abc123 HTTP/1.1");
    }

    #[tokio::test]
    async fn test_force_stop_unknown_session_surfaces_detail() {
        let (base, _server) =
            serve_once("404 Not Found", r#"{"detail":"Session not found"}"#).await;
        let client = ControlClient::new(&base).unwrap();

        let err = client.force_stop("nope").await.unwrap_err();
        assert_eq!(
            err,
            ControlRequestError::Api {
                status: 404,
                message: "Session not found".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_force_stop_unparsable_success_body() {
        let (base, _server) = serve_once("200 OK", "not json").await;
        let client = ControlClient::new(&base).unwrap();

        let err = client.force_stop("abc123").await.unwrap_err();
        assert!(matches!(err, ControlRequestError::Parse(_)));
    }

    #[tokio::test]
    async fn test_force_stop_connection_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ControlClient::new(&format!("http://{}", addr)).unwrap();
        let err = client.force_stop("abc123").await.unwrap_err();
        assert!(matches!(err, ControlRequestError::Network(_)));
    }

    #[test]
    fn test_force_stop_url_encodes_session_id() {
        let client = ControlClient::new("http://localhost:8000/").unwrap();
        let url = client.force_stop_url("a b/c").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/force-stop/a%20b%2Fc");
    }

    #[test]
    fn test_invalid_base_url() {
        let client = ControlClient::new("not a url").unwrap();
        assert!(matches!(
            client.force_stop_url("abc"),
            Err(ControlRequestError::Network(_))
        ));
    }
}
