//! HTTP server for receiving UPnP event notifications.

use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use http_client::{HttpMessage, ReadOptions};

use crate::error::{CallbackError, Result};
use crate::propertyset::parse_property_set;
use crate::router::{EventNotification, EventRouter, NotificationSink};

/// Reply to an accepted notification.
pub const OK_RESPONSE: &[u8] = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";

/// Reply to a rejected notification.
pub const BAD_REQUEST_RESPONSE: &[u8] = b"HTTP/1.0 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

/// Connect budget of the wake-up connection that unblocks `accept`.
const WAKE_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause after a failed accept, e.g. when descriptors run out.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Where and how the callback server listens.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address to bind; use the interface devices can reach.
    pub bind_ip: IpAddr,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Idle timeout while reading one notification.
    pub read_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            read_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP callback server for receiving UPnP event notifications.
///
/// The server accepts connections on a background thread and handles each
/// connection on its own thread. It stops when [`shutdown`](Self::shutdown)
/// is called or when it is dropped.
pub struct CallbackServer {
    local_addr: SocketAddr,
    router: Arc<EventRouter>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Bind the listening socket and start accepting notifications.
    ///
    /// Returns once the socket is bound, so a subscription can be sent right
    /// after this call.
    pub fn start(config: ServerConfig, router: Arc<EventRouter>) -> Result<Self> {
        let addr = SocketAddr::new(config.bind_ip, config.port);
        let listener =
            TcpListener::bind(addr).map_err(|source| CallbackError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let shutdown = shutdown.clone();
            let router = router.clone();
            let read_timeout = config.read_timeout;
            thread::Builder::new()
                .name(format!("gena-callback-{}", local_addr.port()))
                .spawn(move || accept_loop(listener, router, shutdown, read_timeout))?
        };
        tracing::info!(%local_addr, "callback server started");

        Ok(Self {
            local_addr,
            router,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.accept_thread.is_some()
    }

    /// Stop accepting connections and wait for the accept thread to exit.
    /// Connections already being handled finish on their own.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let wake = wake_address(self.local_addr);
            if let Err(e) = TcpStream::connect_timeout(&wake, WAKE_TIMEOUT) {
                tracing::warn!(%wake, error = %e, "could not wake the accept thread");
                return;
            }
            let _ = handle.join();
            tracing::info!(local_addr = %self.local_addr, "callback server stopped");
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    listener: TcpListener,
    router: Arc<EventRouter>,
    shutdown: Arc<AtomicBool>,
    read_timeout: Duration,
) {
    loop {
        let accepted = listener.accept();
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match accepted {
            Ok((stream, peer)) => {
                let router = router.clone();
                let spawned = thread::Builder::new()
                    .name("gena-notify".to_string())
                    .spawn(move || handle_connection(stream, peer, &router, read_timeout));
                if let Err(e) = spawned {
                    tracing::warn!(error = %e, "could not spawn notification handler");
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "accept failed");
                thread::sleep(ACCEPT_BACKOFF);
            }
        }
    }
}

/// Address the server can be reached at from this host; a wildcard bind is
/// reached through loopback.
fn wake_address(local_addr: SocketAddr) -> SocketAddr {
    let ip = match local_addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, local_addr.port())
}

fn handle_connection(mut stream: TcpStream, peer: SocketAddr, router: &EventRouter, read_timeout: Duration) {
    let options = ReadOptions {
        timeout: read_timeout,
        ..ReadOptions::default()
    };
    match accept_notification(&mut stream, router, &options) {
        Ok((sink, notification)) => {
            let _ = stream.write_all(OK_RESPONSE);
            let _ = stream.flush();
            tracing::trace!(
                %peer,
                callback_number = notification.callback_number,
                seq = notification.seq,
                properties = notification.properties.len(),
                "notification acknowledged"
            );
            sink.deliver(notification);
        }
        Err(e) => {
            tracing::debug!(%peer, error = %e, "notification rejected");
            let _ = stream.write_all(BAD_REQUEST_RESPONSE);
            let _ = stream.flush();
        }
    }
}

fn accept_notification(
    stream: &mut TcpStream,
    router: &EventRouter,
    options: &ReadOptions,
) -> Result<(Arc<dyn NotificationSink>, EventNotification)> {
    let request = HttpMessage::read_from(stream, options)?;
    if request.method() != Some("NOTIFY") {
        return Err(CallbackError::Rejected(format!(
            "unexpected method {}",
            request.method().unwrap_or_default()
        )));
    }

    let path = request.path().unwrap_or_default();
    let callback_number: u32 = path
        .trim_matches(|c| c == ' ' || c == '/')
        .parse()
        .map_err(|_| CallbackError::Rejected(format!("invalid callback path {}", path)))?;
    let sink = router
        .sink(callback_number)
        .ok_or_else(|| CallbackError::Rejected(format!("unknown callback number {}", callback_number)))?;

    let sid = request.header("SID").unwrap_or_default();
    if sink.sid().as_deref() != Some(sid) {
        return Err(CallbackError::Rejected(format!("unexpected SID {}", sid)));
    }

    let seq = request.header("SEQ").unwrap_or_default();
    tracing::info!(callback_number, sid, seq, "notification received");
    let seq: u32 = seq
        .trim()
        .parse()
        .map_err(|_| CallbackError::Rejected(format!("invalid SEQ {}", seq)))?;
    sink.observe_seq(seq);

    let properties = parse_property_set(request.body())?;
    Ok((
        sink,
        EventNotification {
            callback_number,
            sid: sid.to_string(),
            seq,
            properties,
        },
    ))
}
