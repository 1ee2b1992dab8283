//! Minimal JSON-over-HTTP/1 client for the cluster cache endpoints.
//!
//! Same raw hyper handshake style as the health probe: one TCP
//! connection per call, explicit deadline, connection driven in the
//! background. Cache traffic is low-volume, so no connection pooling.

use std::time::Duration;

use http_body_util::BodyExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Why a cache endpoint call failed.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("endpoint returned status {0}")]
    BadStatus(u16),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("invalid response body: {0}")]
    Decode(String),
}

/// GET `{url}{path}` and decode the JSON response.
pub async fn get_json<T: DeserializeOwned>(
    url: &str,
    path: &str,
    timeout: Duration,
) -> Result<T, FetchError> {
    request_json(url, path, "GET", None, timeout).await
}

/// POST `body` as JSON to `{url}{path}` and decode the JSON response.
pub async fn post_json<B: Serialize, T: DeserializeOwned>(
    url: &str,
    path: &str,
    body: &B,
    timeout: Duration,
) -> Result<T, FetchError> {
    let payload = serde_json::to_vec(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    request_json(url, path, "POST", Some(payload), timeout).await
}

async fn request_json<T: DeserializeOwned>(
    url: &str,
    path: &str,
    method: &str,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> Result<T, FetchError> {
    let address = authority(url);
    let uri = format!("{}{}", url.trim_end_matches('/'), path);

    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", &address)
            .header("accept", "application/json")
            .header("user-agent", "infergrid-cache/0.1");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(http_body_util::Full::new(bytes::Bytes::from(
                body.unwrap_or_default(),
            )))
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(FetchError::BadStatus(resp.status().as_u16()));
        }

        let bytes = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| FetchError::Connect(e.to_string()))?
            .to_bytes();
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    })
    .await;

    match result {
        Ok(inner) => inner,
        Err(_) => {
            debug!(%uri, timeout_ms = timeout.as_millis() as u64, "cache request timed out");
            Err(FetchError::Timeout)
        }
    }
}

/// Strip the scheme from a node URL, leaving `host:port`.
fn authority(url: &str) -> String {
    let stripped = url
        .strip_prefix("http://")
        .or_else(|| url.strip_prefix("https://"))
        .unwrap_or(url);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}
