//! HTTP boundary shared by the content store, manifest resolver and provenance index

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Some release hosts reject default client identifiers, so every request
/// presents itself as a desktop browser.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Minimal GET-only transport.
///
/// Neither method retries: a failed request fails the run and the operator
/// re-invokes it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Stream the body of `url` into `sink`, returning the number of bytes written
    async fn download(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64>;

    /// Fetch a small document fully into memory
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// `reqwest`-backed transport used in production
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self { client })
    }

    async fn send(&self, url: &str) -> Result<reqwest::Response> {
        let response = self.client.get(url).send().await.map_err(|e| Error::Fetch {
            url: url.to_string(),
            reason: format!("request failed: {}", e),
        })?;

        if !response.status().is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!(
                    "HTTP {}: {}",
                    response.status().as_u16(),
                    response.status().canonical_reason().unwrap_or("Unknown error")
                ),
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        let mut response = self.send(url).await?;
        let expected_len = response.content_length();
        let mut written: u64 = 0;

        loop {
            let chunk = response.chunk().await.map_err(|e| Error::Fetch {
                url: url.to_string(),
                reason: format!("transfer interrupted after {} bytes: {}", written, e),
            })?;
            let Some(chunk) = chunk else { break };
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        if let Some(expected) = expected_len {
            if expected != written {
                return Err(Error::Fetch {
                    url: url.to_string(),
                    reason: format!("partial transfer: expected {} bytes, got {}", expected, written),
                });
            }
        }

        Ok(written)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let response = self.send(url).await?;
        let body = response.bytes().await.map_err(|e| Error::Fetch {
            url: url.to_string(),
            reason: format!("failed to read body: {}", e),
        })?;
        Ok(body.to_vec())
    }
}

/// In-memory transport serving canned responses and recording every request
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FixtureTransport {
    responses: std::collections::HashMap<String, (u16, Vec<u8>)>,
    requests: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl FixtureTransport {
    pub(crate) fn with(mut self, url: &str, body: impl Into<Vec<u8>>) -> Self {
        self.responses.insert(url.to_string(), (200, body.into()));
        self
    }

    pub(crate) fn with_status(mut self, url: &str, status: u16) -> Self {
        self.responses.insert(url.to_string(), (status, Vec::new()));
        self
    }

    pub(crate) fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn respond(&self, url: &str) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(url.to_string());
        match self.responses.get(url) {
            Some((200, body)) => Ok(body.clone()),
            Some((status, _)) => Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            }),
            None => Err(Error::Fetch {
                url: url.to_string(),
                reason: "HTTP 404".to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl Transport for FixtureTransport {
    async fn download(&self, url: &str, sink: &mut (dyn AsyncWrite + Unpin + Send)) -> Result<u64> {
        let body = self.respond(url)?;
        sink.write_all(&body).await?;
        sink.flush().await?;
        Ok(body.len() as u64)
    }

    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        self.respond(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one raw HTTP response on a local port.
    ///
    /// The handle resolves to the request head the client sent.
    async fn serve_once(response: &'static [u8]) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/artifact", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response).await.unwrap();
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&head).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_http_transport_builds() {
        assert!(HttpTransport::new().is_ok());
    }

    #[tokio::test]
    async fn test_http_download_streams_body() {
        let (url, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let mut sink = Vec::new();
        let n = HttpTransport::new().unwrap().download(&url, &mut sink).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"hello");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_error_status_is_fetch_error() {
        let (url, server) = serve_once(
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let err = HttpTransport::new().unwrap().get(&url).await.unwrap_err();
        match err {
            Error::Fetch { url: failed, reason } => {
                assert_eq!(failed, url);
                assert_eq!(reason, "HTTP 503: Service Unavailable");
            }
            other => panic!("unexpected error: {other}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_truncated_body_fails_download() {
        let (url, server) = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n0123456789",
        )
        .await;
        let mut sink = Vec::new();
        let err = HttpTransport::new().unwrap().download(&url, &mut sink).await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }), "{err}");
        assert!(sink.len() < 100);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_request_carries_user_agent() {
        let (url, server) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}").await;
        let body = HttpTransport::new().unwrap().get(&url).await.unwrap();
        assert_eq!(body, b"{}");

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /artifact http/1.1\r\n"), "{head}");
        let expected = format!("user-agent: {}\r\n", USER_AGENT.to_ascii_lowercase());
        assert!(head.contains(&expected), "{head}");
    }

    #[test]
    fn test_user_agent_is_browser_like() {
        assert!(USER_AGENT.starts_with("Mozilla/5.0"));
    }

    #[tokio::test]
    async fn test_fixture_transport_records_requests() {
        let transport = FixtureTransport::default()
            .with("https://example.com/a", "hello")
            .with_status("https://example.com/b", 500);

        let mut sink = Vec::new();
        let n = transport.download("https://example.com/a", &mut sink).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(sink, b"hello");
        assert!(transport.get("https://example.com/b").await.is_err());
        assert_eq!(transport.requests(), vec!["https://example.com/a", "https://example.com/b"]);
    }
}
