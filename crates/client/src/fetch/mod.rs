//! HTTP fetch pipeline.
//!
//! - Max redirects: 5
//! - Max body bytes: 10MB (configurable)
//! - Transparent gzip/brotli/deflate decoding
//!
//! Every HTTP status is handed back to the caller; deciding what is worth
//! caching is the strategy executor's job.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url, header};

use gearcache_core::{AppConfig, Error, Payload};

use crate::network::Network;

/// Configuration for the fetch client.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// User agent string (default: "gearcache/0.1")
    pub user_agent: String,

    /// Maximum response body size in bytes (default: 10MB)
    pub max_bytes: usize,

    /// Request timeout (default: 20s)
    pub timeout: Duration,

    /// Maximum number of redirects to follow (default: 5)
    pub max_redirects: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: "gearcache/0.1".to_string(),
            max_bytes: 10 * 1024 * 1024,
            timeout: Duration::from_millis(20000),
            max_redirects: 5,
        }
    }
}

impl From<&AppConfig> for FetchConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            user_agent: config.user_agent.clone(),
            max_bytes: config.max_bytes,
            timeout: config.timeout(),
            ..Default::default()
        }
    }
}

/// Response from a fetch operation.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// HTTP status code
    pub status: StatusCode,
    /// Response body bytes
    pub bytes: Bytes,
    /// Response headers
    pub headers: header::HeaderMap,
}

impl FetchResponse {
    /// Convert into a storable payload.
    ///
    /// Header names are lower-cased; repeated headers are joined with `, `
    /// and values that are not valid UTF-8 are dropped.
    pub fn into_payload(self) -> Payload {
        let mut headers: BTreeMap<String, String> = BTreeMap::new();
        for (name, value) in &self.headers {
            let Ok(value) = value.to_str() else { continue };
            headers
                .entry(name.as_str().to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        Payload { status: self.status.as_u16(), headers, body: self.bytes.to_vec() }
    }
}

/// HTTP fetch client with size and redirect limits.
pub struct FetchClient {
    http: Client,
    config: FetchConfig,
}

impl FetchClient {
    /// Create a new fetch client with the given configuration.
    pub fn new(config: FetchConfig) -> Result<Self, Error> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .use_rustls_tls()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .map_err(|e| Error::InvalidInput(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { http, config })
    }

    /// Fetch a URL, returning raw bytes and metadata.
    ///
    /// Non-2xx statuses are returned, not raised. Transport failures map to
    /// `NetworkUnavailable`; bodies over the byte limit to `FetchTooLarge`.
    pub async fn fetch(&self, url: &Url) -> Result<FetchResponse, Error> {
        let start = Instant::now();

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::NetworkUnavailable(format!("{url}: {e}")))?;

        let status = response.status();

        if let Some(len) = response.content_length()
            && len > self.config.max_bytes as u64
        {
            return Err(Error::FetchTooLarge(format!("{url}: {len} bytes exceeds {}", self.config.max_bytes)));
        }

        let final_url = response.url().clone();
        let headers = response.headers().clone();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::NetworkUnavailable(format!("{url}: failed to read response: {e}")))?;

        if bytes.len() > self.config.max_bytes {
            return Err(Error::FetchTooLarge(format!(
                "{url}: {} bytes exceeds {}",
                bytes.len(),
                self.config.max_bytes
            )));
        }

        let fetch_ms = start.elapsed().as_millis() as u64;

        tracing::debug!(%url, %final_url, status = status.as_u16(), fetch_ms, bytes = bytes.len(), "fetched");

        Ok(FetchResponse { status, bytes, headers })
    }
}

#[async_trait]
impl Network for FetchClient {
    async fn fetch(&self, url: &Url) -> Result<Payload, Error> {
        FetchClient::fetch(self, url).await.map(FetchResponse::into_payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one raw HTTP response on an ephemeral port.
    async fn serve_once(response: String) -> Url {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let mut read = 0;
            loop {
                let n = socket.read(&mut buf[read..]).await.unwrap();
                read += n;
                if n == 0 || buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        Url::parse(&format!("http://{addr}/static/js/main.js")).unwrap()
    }

    fn http_response(status: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    #[test]
    fn test_fetch_config_default() {
        let config = FetchConfig::default();
        assert_eq!(config.user_agent, "gearcache/0.1");
        assert_eq!(config.max_bytes, 10 * 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_millis(20000));
        assert_eq!(config.max_redirects, 5);
    }

    #[test]
    fn test_fetch_config_from_app_config() {
        let app = AppConfig { user_agent: "gear-test".into(), timeout_ms: 1500, max_bytes: 42, ..Default::default() };
        let config = FetchConfig::from(&app);
        assert_eq!(config.user_agent, "gear-test");
        assert_eq!(config.timeout, Duration::from_millis(1500));
        assert_eq!(config.max_bytes, 42);
    }

    #[test]
    fn test_into_payload_lowercases_and_joins_headers() {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "text/css".parse().unwrap());
        headers.append(header::VARY, "Accept".parse().unwrap());
        headers.append(header::VARY, "Accept-Encoding".parse().unwrap());

        let response = FetchResponse { status: StatusCode::OK, bytes: Bytes::from_static(b"body{}"), headers };

        let payload = response.into_payload();
        assert_eq!(payload.status, 200);
        assert_eq!(payload.content_type(), Some("text/css"));
        assert_eq!(payload.header("vary"), Some("Accept, Accept-Encoding"));
        assert_eq!(payload.body, b"body{}");
    }

    #[tokio::test]
    async fn test_fetch_client_new() {
        let config = FetchConfig::default();
        let client = FetchClient::new(config);
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_fetch_success() {
        let url = serve_once(http_response("200 OK", "application/javascript", "console.log(1)")).await;
        let client = FetchClient::new(FetchConfig::default()).unwrap();

        let payload = Network::fetch(&client, &url).await.unwrap();
        assert_eq!(payload.status, 200);
        assert_eq!(payload.content_type(), Some("application/javascript"));
        assert_eq!(payload.body, b"console.log(1)");
    }

    #[tokio::test]
    async fn test_fetch_returns_error_statuses() {
        let url = serve_once(http_response("404 Not Found", "text/plain", "missing")).await;
        let client = FetchClient::new(FetchConfig::default()).unwrap();

        let response = client.fetch(&url).await.unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_fetch_too_large() {
        let url = serve_once(http_response("200 OK", "text/plain", "0123456789")).await;
        let config = FetchConfig { max_bytes: 4, ..Default::default() };
        let client = FetchClient::new(config).unwrap();

        let result = client.fetch(&url).await;
        assert!(matches!(result, Err(Error::FetchTooLarge(_))));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network_unavailable() {
        // Bind then drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let config = FetchConfig { timeout: Duration::from_secs(2), ..Default::default() };
        let client = FetchClient::new(config).unwrap();
        let url = Url::parse(&format!("http://{addr}/logo.png")).unwrap();

        let result = client.fetch(&url).await;
        assert!(matches!(result, Err(Error::NetworkUnavailable(_))));
    }
}
