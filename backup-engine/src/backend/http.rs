//! HTTP object-store backend.
//!
//! Talks to a plain object store over HTTP:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | put       | `PUT {base}/{name}` with the payload as body |
//! | get       | `GET {base}/{name}` |
//! | delete    | `DELETE {base}/{name}` |
//! | list      | `GET {base}/?list`, returning a JSON array of names |
//!
//! A 404 maps to [`EngineError::NotFound`]. Transport errors, 429 and 5xx
//! responses are retried with exponential backoff and jitter; everything
//! else is returned immediately. `reqwest::Client` is internally
//! reference-counted, so one instance is safe for concurrent use.

use super::Backend;
use crate::config::HttpConfig;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

pub struct HttpBackend {
    base: Url,
    client: Client,
    token: Option<String>,
    max_retries: u32,
    retry_delay_ms: u64,
    retry_max_delay_ms: u64,
}

impl HttpBackend {
    pub fn new(base_url: &str, config: &HttpConfig) -> Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| EngineError::Config(format!("invalid backend URL '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(EngineError::Config(format!(
                "backend URL '{base_url}' cannot hold object names"
            )));
        }

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            base,
            client,
            token: config.token.clone(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
            retry_max_delay_ms: config.retry_max_delay_ms,
        })
    }

    /// `{base}/{name}` with the name percent-encoded as one path segment,
    /// so `#`, `?`, `%` and `/` can never change the addressed object.
    fn url(&self, name: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(name);
        }
        url
    }

    fn list_url(&self) -> Url {
        let mut url = self.url("");
        url.set_query(Some("list"));
        url
    }

    fn apply_auth(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    fn is_retryable_status(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    /// Send a request built by `build`, retrying transient failures.
    ///
    /// Non-success responses that are not retryable are returned as-is so the
    /// caller can map them.
    async fn send_with_retry<F>(&self, op: &str, name: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut delay_ms = self.retry_delay_ms;
        let mut attempt = 0;

        loop {
            if attempt > 0 {
                let jitter = rand::random::<u64>() % delay_ms.max(1);
                tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                delay_ms = (delay_ms * 2).min(self.retry_max_delay_ms);
            }

            let outcome = self.apply_auth(build()).send().await;
            let retryable = match &outcome {
                Ok(resp) => Self::is_retryable_status(resp.status()),
                Err(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            };

            if !retryable || attempt >= self.max_retries {
                return match outcome {
                    Ok(resp) => Ok(resp),
                    Err(e) => Err(EngineError::BackendIo(format!("{op} {name}: {e}"))),
                };
            }

            attempt += 1;
            match &outcome {
                Ok(resp) => warn!(
                    "HTTP {} {}: status {} (attempt {}/{}), retrying",
                    op,
                    name,
                    resp.status(),
                    attempt,
                    self.max_retries
                ),
                Err(e) => warn!(
                    "HTTP {} {}: {} (attempt {}/{}), retrying",
                    op, name, e, attempt, self.max_retries
                ),
            }
        }
    }

    fn check_status(op: &str, name: &str, resp: &Response) -> Result<()> {
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            Err(EngineError::NotFound(name.to_string()))
        } else if !status.is_success() {
            Err(EngineError::BackendIo(format!("{op} {name}: HTTP {status}")))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn describe(&self) -> String {
        self.base.as_str().trim_end_matches('/').to_string()
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        debug!("PUT {} ({} bytes)", name, data.len());
        let url = self.url(name);
        let resp = self
            .send_with_retry("PUT", name, || {
                self.client
                    .put(url.clone())
                    .header("content-type", "application/octet-stream")
                    .body(data.clone())
            })
            .await?;
        Self::check_status("PUT", name, &resp)
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        debug!("GET {}", name);
        let url = self.url(name);
        let resp = self
            .send_with_retry("GET", name, || self.client.get(url.clone()))
            .await?;
        Self::check_status("GET", name, &resp)?;
        Ok(resp.bytes().await?)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let base = self.describe();
        debug!("LIST {}", base);
        let url = self.list_url();
        let resp = self
            .send_with_retry("LIST", &base, || self.client.get(url.clone()))
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        Self::check_status("LIST", &base, &resp)?;
        Ok(resp.json::<Vec<String>>().await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        debug!("DELETE {}", name);
        let url = self.url(name);
        let resp = self
            .send_with_retry("DELETE", name, || self.client.delete(url.clone()))
            .await?;
        Self::check_status("DELETE", name, &resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::JoinHandle;

    fn config(max_retries: u32) -> HttpConfig {
        HttpConfig {
            token: None,
            max_retries,
            retry_delay_ms: 1,
            retry_max_delay_ms: 5,
            timeout_secs: 5,
        }
    }

    /// Answer consecutive requests with `responses`, one connection each,
    /// and hand back the request heads that were received.
    fn stub_server(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/bucket", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut heads = Vec::new();
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut head = String::new();
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    if line.trim().is_empty() {
                        break;
                    }
                    let lower = line.to_ascii_lowercase();
                    if let Some(value) = lower.strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap();
                    }
                    head.push_str(&line);
                }
                let mut request_body = vec![0; content_length];
                reader.read_exact(&mut request_body).unwrap();

                write!(
                    stream,
                    "HTTP/1.1 {status} Stub\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                )
                .unwrap();
                stream.flush().unwrap();
                heads.push(head);
            }
            heads
        });
        (url, handle)
    }

    fn request_line(head: &str) -> &str {
        head.lines().next().unwrap_or_default()
    }

    #[test]
    fn test_url_building() {
        let backend = HttpBackend::new("http://localhost:9000/bucket/", &config(0)).unwrap();
        assert_eq!(backend.url("abc").as_str(), "http://localhost:9000/bucket/abc");
        assert_eq!(backend.list_url().as_str(), "http://localhost:9000/bucket/?list");
        assert_eq!(backend.describe(), "http://localhost:9000/bucket");

        let root = HttpBackend::new("http://localhost:9000", &config(0)).unwrap();
        assert_eq!(root.url("abc").as_str(), "http://localhost:9000/abc");
    }

    #[test]
    fn test_reserved_characters_stay_in_the_name() {
        let backend = HttpBackend::new("http://localhost:9000/bucket", &config(0)).unwrap();

        let url = backend.url("nightly#2");
        assert_eq!(url.path(), "/bucket/nightly%232");
        assert_eq!(url.fragment(), None);

        let url = backend.url("a?list");
        assert_eq!(url.path(), "/bucket/a%3Flist");
        assert_eq!(url.query(), None);

        assert_eq!(backend.url("50%").path(), "/bucket/50%25");
        assert_eq!(backend.url("a/b").path(), "/bucket/a%2Fb");
    }

    #[test]
    fn test_rejects_unusable_base_urls() {
        assert!(matches!(
            HttpBackend::new("not a url", &config(0)),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            HttpBackend::new("mailto:someone@example.com", &config(0)),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(HttpBackend::is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(HttpBackend::is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(!HttpBackend::is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!HttpBackend::is_retryable_status(StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_requests_address_the_exact_object() -> Result<()> {
        let (url, server) = stub_server(vec![(200, ""), (200, "x"), (200, "")]);
        let backend = HttpBackend::new(&url, &config(0))?;

        backend.put("nightly#2", Bytes::from_static(b"manifest")).await?;
        assert_eq!(backend.get("a?list").await?, Bytes::from_static(b"x"));
        backend.delete("plain").await?;

        let heads = server.join().unwrap();
        assert_eq!(request_line(&heads[0]), "PUT /bucket/nightly%232 HTTP/1.1");
        assert_eq!(request_line(&heads[1]), "GET /bucket/a%3Flist HTTP/1.1");
        assert_eq!(request_line(&heads[2]), "DELETE /bucket/plain HTTP/1.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_not_found_is_mapped_and_not_retried() -> Result<()> {
        let (url, server) = stub_server(vec![(404, "")]);
        let backend = HttpBackend::new(&url, &config(3))?;

        let err = backend.get("missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(server.join().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_statuses_are_retried() -> Result<()> {
        let (url, server) = stub_server(vec![(503, ""), (429, ""), (200, "payload")]);
        let backend = HttpBackend::new(&url, &config(3))?;

        assert_eq!(backend.get("block").await?, Bytes::from_static(b"payload"));
        assert_eq!(server.join().unwrap().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_retries_are_bounded() -> Result<()> {
        let (url, server) = stub_server(vec![(500, ""), (500, ""), (500, "")]);
        let backend = HttpBackend::new(&url, &config(2))?;

        let err = backend
            .put("block", Bytes::from_static(b"data"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackendIo(_)));
        assert_eq!(server.join().unwrap().len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() -> Result<()> {
        let (url, server) = stub_server(vec![(403, "")]);
        let backend = HttpBackend::new(&url, &config(3))?;

        let err = backend.delete("block").await.unwrap_err();
        assert!(matches!(err, EngineError::BackendIo(_)));
        assert_eq!(server.join().unwrap().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_listing_sends_bearer_token() -> Result<()> {
        let (url, server) = stub_server(vec![(200, r#"["a","b#c"]"#)]);
        let mut config = config(0);
        config.token = Some("secret-token".to_string());
        let backend = HttpBackend::new(&url, &config)?;

        assert_eq!(backend.list().await?, vec!["a".to_string(), "b#c".to_string()]);

        let heads = server.join().unwrap();
        assert_eq!(request_line(&heads[0]), "GET /bucket/?list HTTP/1.1");
        assert!(heads[0]
            .to_ascii_lowercase()
            .contains("authorization: bearer secret-token"));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_listing_is_empty() -> Result<()> {
        let (url, server) = stub_server(vec![(404, "")]);
        let backend = HttpBackend::new(&url, &config(0))?;

        assert!(backend.list().await?.is_empty());
        server.join().unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_server_is_backend_io() {
        // Port 9 (discard) on localhost is almost never listening.
        let backend = HttpBackend::new("http://127.0.0.1:9/store", &config(0)).unwrap();
        let err = backend.get("missing").await.unwrap_err();
        assert!(matches!(err, EngineError::BackendIo(_)));
    }
}
