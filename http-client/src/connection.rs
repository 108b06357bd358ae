//! Transport streams and the caller-owned persistent connection handle.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{HttpError, Result};

/// A byte stream an [`HttpMessage`](crate::HttpMessage) can be read from.
///
/// The parser drives reads in bounded slices, so implementors only need to
/// honour a per-read timeout.
pub trait MessageStream: Read + Write {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl MessageStream for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

/// An established plain or TLS connection to an HTTP peer.
pub enum Connection {
    Plain(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<native_tls::TlsStream<TcpStream>>),
}

impl Connection {
    /// Open a connection to `host:port`, optionally bound to a local source
    /// address. `tls` wraps the socket without certificate or host name
    /// verification, as UPnP devices serve self-signed certificates.
    pub fn open(
        host: &str,
        port: u16,
        tls: bool,
        source_ip: Option<IpAddr>,
        timeout: Duration,
    ) -> Result<Self> {
        let tcp = connect_tcp(host, port, source_ip, timeout)?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;
        if tls {
            Self::wrap_tls(host, tcp)
        } else {
            Ok(Connection::Plain(tcp))
        }
    }

    #[cfg(feature = "tls")]
    fn wrap_tls(host: &str, tcp: TcpStream) -> Result<Self> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|e| HttpError::Tls(e.to_string()))?;
        let stream = connector
            .connect(host, tcp)
            .map_err(|e| HttpError::Tls(e.to_string()))?;
        Ok(Connection::Tls(Box::new(stream)))
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_tls(_host: &str, _tcp: TcpStream) -> Result<Self> {
        Err(HttpError::UnsupportedScheme("https".to_string()))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Connection::Plain(stream) => stream,
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.get_ref(),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.tcp().set_read_timeout(Some(timeout))?;
        self.tcp().set_write_timeout(Some(timeout))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp().peer_addr()
    }

    fn shutdown(&mut self) {
        match self {
            Connection::Plain(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => {
                let _ = stream.shutdown();
                let _ = stream.get_ref().shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.read(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Plain(stream) => stream.write(buf),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Plain(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Connection::Tls(stream) => stream.flush(),
        }
    }
}

impl MessageStream for Connection {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.tcp().set_read_timeout(timeout)
    }
}

fn connect_tcp(
    host: &str,
    port: u16,
    source_ip: Option<IpAddr>,
    timeout: Duration,
) -> Result<TcpStream> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| HttpError::Connect(format!("{}:{}: {}", host, port, e)))?;

    let mut last_error = None;
    for addr in addrs {
        if let Some(ip) = source_ip {
            if ip.is_ipv4() != addr.is_ipv4() {
                continue;
            }
        }
        match connect_addr(addr, source_ip, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(HttpError::Connect(match last_error {
        Some(e) => format!("{}:{}: {}", host, port, e),
        None => format!("{}:{}: no usable address", host, port),
    }))
}

fn connect_addr(addr: SocketAddr, source_ip: Option<IpAddr>, timeout: Duration) -> io::Result<TcpStream> {
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    if let Some(ip) = source_ip.filter(|ip| !ip.is_unspecified()) {
        socket.bind(&SockAddr::from(SocketAddr::new(ip, 0)))?;
    }
    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    Ok(socket.into())
}

/// Caller-owned handle to a connection that may be reused across requests.
///
/// The handle starts empty; [`HttpRequest::send_with`](crate::HttpRequest::send_with)
/// connects lazily, keeps the connection open while the peer allows it and
/// empties the handle whenever the connection has to be dropped.
#[derive(Default)]
pub struct PersistentConnection {
    connection: Option<Connection>,
}

impl PersistentConnection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Close the underlying connection, if any.
    pub fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            connection.shutdown();
        }
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut Connection> {
        self.connection.as_mut()
    }

    pub(crate) fn set(&mut self, connection: Connection) {
        self.close();
        self.connection = Some(connection);
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PersistentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentConnection")
            .field("connected", &self.is_connected())
            .finish()
    }
}
