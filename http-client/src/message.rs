//! HTTP/1.x message model and parser.
//!
//! One parser serves both transports: a UDP datagram holds the whole message,
//! while a stream is read incrementally within a header budget, a total length
//! budget, an idle timeout or total time budget, and an optional stop token.

use std::io::Read;
use std::time::{Duration, Instant};

use crate::cancel::StopToken;
use crate::connection::MessageStream;
use crate::error::{HttpError, Result};
use crate::headers::Headers;

/// Default budget for a whole message and for its header section.
pub const DEFAULT_MAX_LENGTH: usize = 1_048_576;

/// Longest single blocking wait; stop tokens are observed at this granularity.
pub const POLL_SLICE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 1_048_576;

/// First line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request {
        method: String,
        path: String,
        version: String,
    },
    Response {
        version: String,
        code: u16,
        message: String,
    },
}

/// Charset a body can be decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Charset {
    Utf8,
    Latin1,
}

/// Budgets and behaviour for reading one message.
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Parse the body according to its framing; when false the bytes after the
    /// header section are kept as they are.
    pub body: bool,
    /// Decode the body into text; a decoding failure invalidates the message.
    pub decode: Option<Charset>,
    /// Idle timeout of each read when no `max_time` is set.
    pub timeout: Duration,
    /// Budget for the whole message.
    pub max_length: usize,
    /// Budget for the header section (capped by `max_length`).
    pub max_hlength: usize,
    /// Budget for the whole read, replacing the idle timeout.
    pub max_time: Option<Duration>,
    pub stop: Option<StopToken>,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            body: true,
            decode: None,
            timeout: Duration::from_secs(5),
            max_length: DEFAULT_MAX_LENGTH,
            max_hlength: DEFAULT_MAX_LENGTH,
            max_time: None,
            stop: None,
        }
    }
}

/// A parsed HTTP request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpMessage {
    start_line: Option<StartLine>,
    headers: Headers,
    body: Vec<u8>,
    text: Option<String>,
    expect_close: bool,
}

impl HttpMessage {
    /// Parse a message carried whole in a datagram.
    pub fn from_datagram(data: &[u8], options: &ReadOptions) -> Result<Self> {
        Parser::new(None, options).parse(data.to_vec())
    }

    /// Read one message from a stream.
    ///
    /// A request announcing `Expect: 100-continue` is answered on the same
    /// stream with `100 Continue`, or `413` when its body would not fit.
    pub fn read_from(stream: &mut dyn MessageStream, options: &ReadOptions) -> Result<Self> {
        Parser::new(Some(stream), options).parse(Vec::new())
    }

    pub fn start_line(&self) -> Option<&StartLine> {
        self.start_line.as_ref()
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start_line, Some(StartLine::Request { .. }))
    }

    pub fn is_response(&self) -> bool {
        matches!(self.start_line, Some(StartLine::Response { .. }))
    }

    pub fn method(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Request { method, .. }) => Some(method),
            _ => None,
        }
    }

    pub fn path(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Request { path, .. }) => Some(path),
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Request { version, .. }) | Some(StartLine::Response { version, .. }) => {
                Some(version)
            }
            None => None,
        }
    }

    pub fn code(&self) -> Option<u16> {
        match &self.start_line {
            Some(StartLine::Response { code, .. }) => Some(*code),
            _ => None,
        }
    }

    /// Reason phrase of a response.
    pub fn message(&self) -> Option<&str> {
        match &self.start_line {
            Some(StartLine::Response { message, .. }) => Some(message),
            _ => None,
        }
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn has_header_token(&self, name: &str, token: &str) -> bool {
        self.headers.has_token(name, token)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }

    /// The body as text: the decoded form when a charset was requested,
    /// otherwise the body if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        match &self.text {
            Some(text) => Some(text),
            None => std::str::from_utf8(&self.body).ok(),
        }
    }

    /// Whether the peer will close the connection after this message.
    pub fn expect_close(&self) -> bool {
        self.expect_close
    }
}

struct Parser<'s, 'o> {
    stream: Option<&'s mut dyn MessageStream>,
    options: &'o ReadOptions,
    started: Instant,
}

impl<'s, 'o> Parser<'s, 'o> {
    fn new(stream: Option<&'s mut dyn MessageStream>, options: &'o ReadOptions) -> Self {
        Self {
            stream,
            options,
            started: Instant::now(),
        }
    }

    fn is_datagram(&self) -> bool {
        self.stream.is_none()
    }

    /// Read at most `max` bytes; an empty result means the peer closed.
    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        let options = self.options;
        let started = self.started;
        let stream = self
            .stream
            .as_deref_mut()
            .ok_or(HttpError::ConnectionClosed)?;
        let call_start = Instant::now();
        let mut chunk = vec![0u8; max.clamp(1, READ_CHUNK)];
        loop {
            if options.stop.as_ref().is_some_and(StopToken::is_stopped) {
                return Err(HttpError::Cancelled);
            }
            let remaining = match options.max_time {
                Some(max_time) => max_time.checked_sub(started.elapsed()),
                None => options.timeout.checked_sub(call_start.elapsed()),
            };
            let slice = match remaining {
                Some(remaining) if !remaining.is_zero() => remaining.min(POLL_SLICE),
                _ => return Err(HttpError::Timeout),
            };
            stream.set_read_timeout(Some(slice))?;
            match stream.read(&mut chunk) {
                Ok(n) => {
                    chunk.truncate(n);
                    return Ok(chunk);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn reply(&mut self, bytes: &[u8]) -> Result<()> {
        if let Some(stream) = self.stream.as_deref_mut() {
            stream.write_all(bytes)?;
            stream.flush()?;
        }
        Ok(())
    }

    fn parse(mut self, mut buf: Vec<u8>) -> Result<HttpMessage> {
        let max_hlength = self.options.max_hlength.min(self.options.max_length);
        let datagram = self.is_datagram();
        let mut rem_length = max_hlength as isize;

        let body_pos = loop {
            strip_line_breaks(&mut buf);
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if let Some(pos) = find(&buf, b"\n\n") {
                break pos + 2;
            }
            if datagram {
                return Err(HttpError::Malformed("incomplete header section".into()));
            }
            if rem_length <= 0 {
                return Err(HttpError::HeaderTooLarge);
            }
            let chunk = self.read(rem_length as usize)?;
            if chunk.is_empty() {
                return Err(HttpError::ConnectionClosed);
            }
            rem_length -= chunk.len() as isize;
            buf.extend_from_slice(&chunk);
        };

        let (start_line, headers) = parse_head(&buf[..body_pos])?;
        let mut message = HttpMessage {
            expect_close: datagram
                || headers.has_token("Connection", "close")
                || (version_of(&start_line) != "HTTP/1.1"
                    && !headers.has_token("Connection", "keep-alive")),
            start_line: Some(start_line),
            headers,
            ..HttpMessage::default()
        };

        let code = message.code();
        if matches!(code, Some(100 | 101 | 204 | 304)) {
            return Ok(message);
        }
        if !self.options.body {
            message.body = buf.split_off(body_pos);
            return Ok(message);
        }
        rem_length += (self.options.max_length - max_hlength) as isize;

        let body = if message.has_header_token("Transfer-Encoding", "chunked") {
            self.read_chunked(buf.split_off(body_pos), rem_length, max_hlength)?
        } else {
            let body_len = match message.header("Content-Length") {
                Some(value) => Some(value.trim().parse::<usize>().map_err(|_| {
                    HttpError::Malformed(format!("invalid Content-Length: {}", value))
                })?),
                None if datagram
                    || (matches!(code, Some(200 | 206)) && message.expect_close) =>
                {
                    None
                }
                None => Some(0),
            };

            if !datagram
                && message.is_request()
                && message.has_header_token("Expect", "100-continue")
            {
                let missing = body_len
                    .map(|len| (body_pos + len) as isize - buf.len() as isize)
                    .unwrap_or(0);
                if missing <= rem_length {
                    self.reply(b"HTTP/1.1 100 Continue\r\n\r\n")?;
                } else {
                    self.reply(b"HTTP/1.1 413 Payload too large\r\nContent-Length: 0\r\n\r\n")?;
                    return Err(HttpError::BodyTooLarge);
                }
            }

            match body_len {
                None => self.read_to_close(buf.split_off(body_pos), rem_length)?,
                Some(len) => self.read_exact_body(buf, body_pos, len, rem_length)?,
            }
        };

        if let Some(charset) = self.options.decode {
            if !body.is_empty() {
                message.text = Some(decode(&body, charset)?);
            }
        }
        message.body = body;
        Ok(message)
    }

    fn read_to_close(&mut self, mut body: Vec<u8>, mut rem_length: isize) -> Result<Vec<u8>> {
        if self.is_datagram() {
            return Ok(body);
        }
        rem_length -= body.len() as isize;
        loop {
            if rem_length <= 0 {
                return Err(HttpError::BodyTooLarge);
            }
            let chunk = self.read(rem_length as usize)?;
            if chunk.is_empty() {
                return Ok(body);
            }
            rem_length -= chunk.len() as isize;
            body.extend_from_slice(&chunk);
        }
    }

    fn read_exact_body(
        &mut self,
        mut buf: Vec<u8>,
        body_pos: usize,
        len: usize,
        rem_length: isize,
    ) -> Result<Vec<u8>> {
        let available = buf.len() - body_pos;
        if available >= len {
            return Ok(buf[body_pos..body_pos + len].to_vec());
        }
        if self.is_datagram() {
            return Err(HttpError::Malformed("datagram shorter than Content-Length".into()));
        }
        if (len - available) as isize > rem_length {
            return Err(HttpError::BodyTooLarge);
        }
        let mut body = buf.split_off(body_pos);
        while body.len() < len {
            let chunk = self.read(len - body.len())?;
            if chunk.is_empty() {
                return Err(HttpError::ConnectionClosed);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    fn read_chunked(
        &mut self,
        mut pending: Vec<u8>,
        mut rem_length: isize,
        max_hlength: usize,
    ) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let chunk_len = loop {
                strip_line_breaks(&mut pending);
                let line_end = find(&pending, b"\r\n")
                    .map(|pos| (pos, pos + 2))
                    .or_else(|| find(&pending, b"\n").map(|pos| (pos, pos + 1)));
                if let Some((line_len, consumed)) = line_end {
                    let len = parse_chunk_size(&pending[..line_len])?;
                    pending.drain(..consumed);
                    break len;
                }
                let budget = (max_hlength as isize - pending.len() as isize).min(rem_length);
                if self.is_datagram() || budget <= 0 {
                    return Err(HttpError::Malformed("incomplete chunk size line".into()));
                }
                let chunk = self.read(budget as usize)?;
                if chunk.is_empty() {
                    return Err(HttpError::ConnectionClosed);
                }
                rem_length -= chunk.len() as isize;
                pending.extend_from_slice(&chunk);
            };

            if chunk_len == 0 {
                break;
            }
            if chunk_len as isize - pending.len() as isize > rem_length {
                return Err(HttpError::BodyTooLarge);
            }
            if pending.len() >= chunk_len {
                body.extend(pending.drain(..chunk_len));
                continue;
            }
            if self.is_datagram() {
                return Err(HttpError::Malformed("truncated chunk".into()));
            }
            let mut missing = chunk_len - pending.len();
            body.append(&mut pending);
            while missing > 0 {
                let chunk = self.read(missing)?;
                if chunk.is_empty() {
                    return Err(HttpError::ConnectionClosed);
                }
                rem_length -= chunk.len() as isize;
                missing -= chunk.len();
                body.extend_from_slice(&chunk);
            }
        }

        while !trailers_complete(&pending) {
            if self.is_datagram() || rem_length <= 0 {
                return Err(HttpError::Malformed("incomplete chunked trailer".into()));
            }
            let chunk = self.read(rem_length as usize)?;
            if chunk.is_empty() {
                return Err(HttpError::ConnectionClosed);
            }
            rem_length -= chunk.len() as isize;
            pending.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn parse_head(head: &[u8]) -> Result<(StartLine, Headers)> {
    // Header bytes are ISO-8859-1.
    let text: String = head.iter().map(|&b| b as char).collect();
    let text = text.replace("\r\n", "\n");
    let mut lines: Vec<&str> = text.split('\n').collect();
    lines.truncate(lines.len().saturating_sub(2));

    let first = lines
        .first()
        .ok_or_else(|| HttpError::Malformed("missing start line".into()))?;
    let (a, b, c) = split_start_line(first)
        .ok_or_else(|| HttpError::Malformed(format!("invalid start line: {}", first)))?;

    let start_line = if a.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("HTTP")) {
        StartLine::Response {
            version: a.to_uppercase(),
            code: b
                .parse()
                .map_err(|_| HttpError::Malformed(format!("invalid status code: {}", b)))?,
            message: c.to_string(),
        }
    } else {
        StartLine::Request {
            method: a.to_uppercase(),
            path: b.to_string(),
            version: c.to_uppercase(),
        }
    };

    let mut headers = Headers::new();
    for line in &lines[1..] {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::Malformed(format!("invalid header line: {}", line)))?;
        if name.trim().is_empty() {
            return Err(HttpError::Malformed(format!("invalid header line: {}", line)));
        }
        headers.append(name, value.trim());
    }
    Ok((start_line, headers))
}

/// Split a start line into at most three whitespace-separated parts; the third
/// keeps its inner spaces and may be empty.
fn split_start_line(line: &str) -> Option<(&str, &str, &str)> {
    let line = line.trim();
    let (a, rest) = line.split_once(char::is_whitespace)?;
    let rest = rest.trim_start();
    if rest.is_empty() {
        return None;
    }
    match rest.split_once(char::is_whitespace) {
        Some((b, c)) => Some((a, b, c.trim())),
        None => Some((a, rest, "")),
    }
}

fn version_of(start_line: &StartLine) -> &str {
    match start_line {
        StartLine::Request { version, .. } | StartLine::Response { version, .. } => version,
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize> {
    let line = String::from_utf8_lossy(line);
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16)
        .map_err(|_| HttpError::Malformed(format!("invalid chunk size: {}", size)))
}

fn trailers_complete(rest: &[u8]) -> bool {
    rest.starts_with(b"\r\n")
        || rest.starts_with(b"\n")
        || find(rest, b"\r\n\r\n").is_some()
        || find(rest, b"\n\n").is_some()
}

fn decode(body: &[u8], charset: Charset) -> Result<String> {
    match charset {
        Charset::Utf8 => {
            String::from_utf8(body.to_vec()).map_err(|e| HttpError::Decode(e.to_string()))
        }
        Charset::Latin1 => Ok(body.iter().map(|&b| b as char).collect()),
    }
}

fn strip_line_breaks(buf: &mut Vec<u8>) {
    let lead = buf.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    if lead > 0 {
        buf.drain(..lead);
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
