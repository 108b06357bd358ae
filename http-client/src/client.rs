//! HTTP client built on [`HttpMessage`] and [`PersistentConnection`].

use std::io::Write;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use url::{Position, Url};

use crate::cancel::StopToken;
use crate::connection::{Connection, PersistentConnection};
use crate::error::{HttpError, Result};
use crate::headers::Headers;
use crate::message::{HttpMessage, ReadOptions, DEFAULT_MAX_LENGTH};

/// Default connect and idle read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Redirects and interim responses tolerated in one exchange.
pub const MAX_REDIRECTS: usize = 5;

/// One HTTP exchange, configured builder-style.
///
/// ```no_run
/// use http_client::{HttpRequest, PersistentConnection};
///
/// let mut connection = PersistentConnection::new();
/// let first = HttpRequest::new("http://192.168.1.20:49152/rootDesc.xml")
///     .send_with(&mut connection)?;
/// let second = HttpRequest::new("http://192.168.1.20:49152/AVTransport.xml")
///     .send_with(&mut connection)?;
/// # Ok::<(), http_client::HttpError>(())
/// ```
#[derive(Debug, Clone)]
pub struct HttpRequest {
    url: String,
    method: Option<String>,
    headers: Vec<(String, String)>,
    data: Option<Vec<u8>>,
    timeout: Duration,
    max_length: usize,
    max_time: Option<Duration>,
    stop: Option<StopToken>,
    source_ip: Option<IpAddr>,
}

impl HttpRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: None,
            headers: Vec::new(),
            data: None,
            timeout: DEFAULT_TIMEOUT,
            max_length: DEFAULT_MAX_LENGTH,
            max_time: None,
            stop: None,
            source_ip: None,
        }
    }

    /// Request method; defaults to GET, or POST when a body is set.
    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Budget for the whole exchange, redirects included.
    pub fn max_time(mut self, max_time: Duration) -> Self {
        self.max_time = Some(max_time);
        self
    }

    pub fn stop(mut self, stop: StopToken) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Local address outgoing connections are bound to.
    pub fn source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Perform the exchange on a fresh connection closed afterwards.
    pub fn send(self) -> Result<HttpMessage> {
        let mut connection = PersistentConnection::new();
        self.exchange(&mut connection, true)
    }

    /// Perform the exchange on a caller-owned connection, opening it if needed
    /// and keeping it alive unless the caller or the peer asks for close.
    pub fn send_with(self, connection: &mut PersistentConnection) -> Result<HttpMessage> {
        let close = self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("connection")
                && value.split(',').any(|t| t.trim().eq_ignore_ascii_case("close"))
        });
        self.exchange(connection, close)
    }

    fn exchange(self, connection: &mut PersistentConnection, close: bool) -> Result<HttpMessage> {
        match self.run(connection, close) {
            Ok((response, close)) => {
                if close || response.expect_close() {
                    connection.close();
                }
                Ok(response)
            }
            Err(e) => {
                tracing::debug!(error = %e, "HTTP exchange failed");
                connection.close();
                Err(e)
            }
        }
    }

    /// Returns the final response and whether the connection must be closed.
    fn run(
        self,
        connection: &mut PersistentConnection,
        close: bool,
    ) -> Result<(HttpMessage, bool)> {
        let started = Instant::now();
        let mut url = Url::parse(&self.url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        let mut method = self.method.clone().unwrap_or_else(|| {
            if self.data.is_some() { "POST" } else { "GET" }.to_string()
        });
        let mut data = self.data.clone();
        let mut headers = self.build_headers(close);
        let mut redirects = 0;

        loop {
            self.check_budget(started)?;
            let tls = match url.scheme() {
                "http" => false,
                "https" => true,
                other => return Err(HttpError::UnsupportedScheme(other.to_string())),
            };
            match connection.get_mut() {
                Some(stream) => stream.set_timeout(self.timeout)?,
                None => {
                    let host = url
                        .host_str()
                        .ok_or_else(|| HttpError::InvalidUrl(url.to_string()))?;
                    let port = url
                        .port_or_known_default()
                        .ok_or_else(|| HttpError::InvalidUrl(url.to_string()))?;
                    connection.set(Connection::open(host, port, tls, self.source_ip, self.timeout)?);
                }
            }
            self.check_budget(started)?;
            let stream = connection.get_mut().ok_or(HttpError::ConnectionClosed)?;

            let path = url[Position::BeforePath..Position::AfterQuery].replace(' ', "%20");
            let request = format!(
                "{} {} HTTP/1.1\r\nHost: {}\r\n{}\r\n",
                method,
                if path.is_empty() { "/" } else { path.as_str() },
                &url[Position::BeforeHost..Position::AfterPort],
                headers
            );
            let mut wire: Vec<u8> = request.chars().map(latin1_byte).collect();
            if let Some(data) = &data {
                wire.extend_from_slice(data);
            }
            stream.write_all(&wire)?;
            stream.flush()?;

            let response = loop {
                self.check_budget(started)?;
                let options = ReadOptions {
                    body: !method.eq_ignore_ascii_case("HEAD"),
                    decode: None,
                    timeout: self.timeout,
                    max_length: self.max_length,
                    max_time: self
                        .max_time
                        .map(|max_time| max_time.saturating_sub(started.elapsed())),
                    stop: self.stop.clone(),
                    ..ReadOptions::default()
                };
                let response = HttpMessage::read_from(&mut *stream, &options)?;
                if response.code() != Some(100) {
                    break response;
                }
                redirects += 1;
                if redirects > MAX_REDIRECTS {
                    return Err(HttpError::TooManyRedirects);
                }
            };

            let code = response.code().unwrap_or_default();
            if !(300..400).contains(&code) || code == 304 {
                return Ok((response, headers.has_token("Connection", "close")));
            }

            let location = response.header("Location").ok_or(HttpError::MissingLocation)?;
            let next = url
                .join(location)
                .map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
            tracing::trace!(code, from = %url, to = %next, "following redirect");
            let origin_changed = next.scheme() != url.scheme()
                || next[Position::BeforeHost..Position::AfterPort]
                    != url[Position::BeforeHost..Position::AfterPort];
            if headers.has_token("Connection", "close") || response.expect_close() || origin_changed
            {
                connection.close();
                headers.insert("Connection", "close");
            }
            url = next;

            redirects += 1;
            if redirects > MAX_REDIRECTS {
                return Err(HttpError::TooManyRedirects);
            }
            if code == 303 {
                if !method.eq_ignore_ascii_case("HEAD") {
                    method = "GET".to_string();
                }
                data = None;
                for name in ["Transfer-Encoding", "Content-Length", "Content-Type"] {
                    headers.remove(name);
                }
            }
        }
    }

    fn build_headers(&self, close: bool) -> Headers {
        let mut headers = Headers::new();
        for (name, value) in &self.headers {
            let lower = name.to_ascii_lowercase();
            if !matches!(lower.as_str(), "host" | "content-length" | "connection" | "expect") {
                headers.insert(name, value.clone());
            }
        }
        if !headers.contains("Accept-Encoding") {
            headers.insert("Accept-Encoding", "identity");
        }
        if let Some(data) = &self.data {
            if !headers.has_token("Transfer-Encoding", "chunked") {
                headers.insert("Content-Length", data.len().to_string());
            }
        }
        headers.insert("Connection", if close { "close" } else { "keep-alive" });
        headers
    }

    fn check_budget(&self, started: Instant) -> Result<()> {
        if self.stop.as_ref().is_some_and(StopToken::is_stopped) {
            return Err(HttpError::Cancelled);
        }
        match self.max_time {
            Some(max_time) if started.elapsed() >= max_time => Err(HttpError::Timeout),
            _ => Ok(()),
        }
    }
}

fn latin1_byte(c: char) -> u8 {
    u8::try_from(u32::from(c)).unwrap_or(b'?')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_without_persistent_connection() {
        let request = HttpRequest::new("http://127.0.0.1/")
            .header("HOST", "spoofed")
            .header("Expect", "100-continue")
            .header("Connection", "keep-alive")
            .header("User-Agent", "test");
        let headers = request.build_headers(true);

        assert_eq!(headers.get("Host"), None);
        assert_eq!(headers.get("Expect"), None);
        assert_eq!(headers.get("Connection"), Some("close"));
        assert_eq!(headers.get("Accept-Encoding"), Some("identity"));
        assert_eq!(headers.get("User-Agent"), Some("test"));
        assert_eq!(headers.get("Content-Length"), None);
    }

    #[test]
    fn test_body_headers() {
        let request = HttpRequest::new("http://127.0.0.1/")
            .header("Accept-Encoding", "gzip")
            .header("Content-Length", "999")
            .body("hello");
        let headers = request.build_headers(false);

        assert_eq!(headers.get("Content-Length"), Some("5"));
        assert_eq!(headers.get("Accept-Encoding"), Some("gzip"));
        assert_eq!(headers.get("Connection"), Some("keep-alive"));
    }

    #[test]
    fn test_chunked_body_has_no_length() {
        let request = HttpRequest::new("http://127.0.0.1/")
            .header("Transfer-Encoding", "chunked")
            .body("4\r\ntest\r\n0\r\n\r\n");
        let headers = request.build_headers(true);
        assert_eq!(headers.get("Content-Length"), None);
    }

    #[test]
    fn test_unsupported_scheme() {
        let result = HttpRequest::new("ftp://127.0.0.1/file").send();
        assert!(matches!(result, Err(HttpError::UnsupportedScheme(s)) if s == "ftp"));
    }

    #[test]
    fn test_invalid_url() {
        let result = HttpRequest::new("not a url").send();
        assert!(matches!(result, Err(HttpError::InvalidUrl(_))));
    }

    #[test]
    fn test_stopped_before_connecting() {
        let stop = StopToken::new();
        stop.stop();
        let result = HttpRequest::new("http://127.0.0.1:9/").stop(stop).send();
        assert!(matches!(result, Err(HttpError::Cancelled)));
    }
}
