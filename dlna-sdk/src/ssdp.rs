//! SSDP messages and multi-interface datagram reception.
//!
//! Discovery and advertisement listening both read several UDP sockets at
//! once, one per local interface. [`DatagramSelector`] gives each socket a
//! reader thread polling in half-second slices and funnels what they receive
//! into one channel, so the caller waits on all interfaces with a single
//! bounded `select`.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use http_client::POLL_SLICE;
use socket2::{Domain, Protocol, Socket, Type};

use crate::device::DeviceKind;

/// SSDP multicast group
pub const MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// SSDP port
pub const SSDP_PORT: u16 = 1900;

/// Largest UDP payload accepted
pub(crate) const MAX_DATAGRAM: usize = 65_507;

/// M-SEARCH for one device (`uuid`) or for every device of `kind`.
pub fn msearch(kind: DeviceKind, uuid: Option<&str>) -> String {
    let target = match uuid {
        Some(uuid) => format!("uuid:{}", uuid),
        None => kind.search_target().to_string(),
    };
    format!(
        "M-SEARCH * HTTP/1.1\r\n\
         HOST: 239.255.255.250:1900\r\n\
         ST: {}\r\n\
         MX: 2\r\n\
         MAN: \"ssdp:discover\"\r\n\
         \r\n",
        target
    )
}

/// Whether the `ST` of a search response answers the search.
pub(crate) fn search_matches(kind: DeviceKind, uuid: Option<&str>, st: &str) -> bool {
    match uuid {
        Some(uuid) => st.to_ascii_lowercase().contains(&uuid.to_ascii_lowercase()),
        None => kind.matches_type(st),
    }
}

/// Device UDN carried by a USN: `uuid:<id>::<type>` gives `uuid:<id>`.
pub fn udn_from_usn(usn: &str) -> String {
    match (usn.get(..6), usn.get(6..)) {
        (Some(prefix), Some(rest)) => {
            let id = rest.split(':').next().unwrap_or_default();
            format!("{}{}", prefix, id)
        }
        _ => usn.to_string(),
    }
}

/// Socket sending M-SEARCH from one interface and receiving the responses.
pub(crate) fn search_socket(ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if let Err(e) = socket.set_multicast_if_v4(&ip) {
        tracing::debug!(%ip, error = %e, "could not select multicast interface");
    }
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(ip, 0)).into())?;
    Ok(socket.into())
}

/// Socket joined to the SSDP group on one interface.
pub(crate) fn advertisement_socket(ip: Ipv4Addr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    if let Err(e) = socket.set_reuse_port(true) {
        tracing::debug!(%ip, error = %e, "could not set SO_REUSEPORT");
    }
    #[cfg(windows)]
    let bind_ip = ip;
    #[cfg(not(windows))]
    let bind_ip = MULTICAST_ADDR;
    socket.bind(&SocketAddr::V4(SocketAddrV4::new(bind_ip, SSDP_PORT)).into())?;
    socket.join_multicast_v4(&MULTICAST_ADDR, &ip)?;
    Ok(socket.into())
}

/// A datagram received on one of the selector's sockets.
#[derive(Debug, Clone)]
pub(crate) struct Datagram {
    /// Position of the receiving socket
    pub interface: usize,
    pub data: Vec<u8>,
    pub from: SocketAddr,
}

/// Waits on several UDP sockets at once.
pub(crate) struct DatagramSelector {
    receiver: Receiver<Datagram>,
    stop: Arc<AtomicBool>,
    readers: Vec<JoinHandle<()>>,
}

impl DatagramSelector {
    /// Start one reader per `(interface, socket)`; the sockets are closed by
    /// [`shutdown`](Self::shutdown).
    pub(crate) fn new(sockets: Vec<(usize, UdpSocket)>, buffer_size: usize) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let mut readers = Vec::with_capacity(sockets.len());
        for (interface, socket) in sockets {
            socket.set_read_timeout(Some(POLL_SLICE))?;
            let sender = sender.clone();
            let stop = stop.clone();
            readers.push(
                thread::Builder::new()
                    .name(format!("ssdp-reader-{}", interface))
                    .spawn(move || read_loop(interface, socket, sender, stop, buffer_size))?,
            );
        }
        Ok(Self {
            receiver,
            stop,
            readers,
        })
    }

    /// Next datagram, or `None` once `timeout` elapsed without one.
    pub(crate) fn select(&self, timeout: Duration) -> Option<Datagram> {
        match self.receiver.recv_timeout(timeout) {
            Ok(datagram) => Some(datagram),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub(crate) fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
    }
}

impl Drop for DatagramSelector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn read_loop(
    interface: usize,
    socket: UdpSocket,
    sender: Sender<Datagram>,
    stop: Arc<AtomicBool>,
    buffer_size: usize,
) {
    let mut buffer = vec![0u8; buffer_size];
    while !stop.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buffer) {
            Ok((size, from)) => {
                let datagram = Datagram {
                    interface,
                    data: buffer[..size].to_vec(),
                    from,
                };
                if sender.send(datagram).is_err() {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                tracing::trace!(interface, error = %e, "datagram receive failed");
                thread::sleep(POLL_SLICE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_msearch_for_renderers() {
        let message = msearch(DeviceKind::Renderer, None);
        assert!(message.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(message.contains("ST: urn:schemas-upnp-org:device:MediaRenderer:1\r\n"));
        assert!(message.contains("MAN: \"ssdp:discover\"\r\n"));
        assert!(message.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_msearch_for_one_device() {
        let message = msearch(DeviceKind::Renderer, Some("1234-abcd"));
        assert!(message.contains("ST: uuid:1234-abcd\r\n"));
        assert!(msearch(DeviceKind::Device, None).contains("ST: upnp:rootdevice\r\n"));
    }

    #[rstest]
    #[case("uuid:1234::urn:schemas-upnp-org:device:MediaRenderer:1", "uuid:1234")]
    #[case("uuid:1234::upnp:rootdevice", "uuid:1234")]
    #[case("uuid:1234", "uuid:1234")]
    #[case("uuid", "uuid")]
    #[case("", "")]
    fn test_udn_from_usn(#[case] usn: &str, #[case] udn: &str) {
        assert_eq!(udn_from_usn(usn), udn);
    }

    #[test]
    fn test_search_matches() {
        let st = "urn:schemas-upnp-org:device:MediaRenderer:1";
        assert!(search_matches(DeviceKind::Renderer, None, st));
        assert!(!search_matches(DeviceKind::Server, None, st));
        assert!(search_matches(DeviceKind::Device, None, "upnp:rootdevice"));
        assert!(search_matches(DeviceKind::Renderer, Some("ABCD"), "uuid:abcd"));
        assert!(!search_matches(DeviceKind::Renderer, Some("abcd"), st));
    }

    #[test]
    fn test_selector_receives_from_every_socket() {
        let first = UdpSocket::bind("127.0.0.1:0").unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").unwrap();
        let first_addr = first.local_addr().unwrap();
        let second_addr = second.local_addr().unwrap();
        let mut selector = DatagramSelector::new(vec![(0, first), (1, second)], 1024).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"one", first_addr).unwrap();
        sender.send_to(b"two", second_addr).unwrap();

        let mut received = Vec::new();
        while let Some(datagram) = selector.select(Duration::from_secs(2)) {
            assert_eq!(datagram.from, sender.local_addr().unwrap());
            received.push((datagram.interface, datagram.data));
            if received.len() == 2 {
                break;
            }
        }
        received.sort();
        assert_eq!(received, vec![(0, b"one".to_vec()), (1, b"two".to_vec())]);

        selector.shutdown();
        assert!(selector.select(Duration::from_millis(10)).is_none());
    }
}
