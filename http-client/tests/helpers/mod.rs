//! Loopback HTTP peer used by the client integration tests.

use std::io::Write;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use http_client::{HttpMessage, ReadOptions};

/// A request as the fake server saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

type Responder = dyn Fn(usize, &RecordedRequest) -> Vec<u8> + Send + Sync;

pub struct FakeServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    connections: Arc<AtomicUsize>,
}

impl FakeServer {
    /// Serve every request with `respond(index, request)`; connections stay
    /// open until the client closes them or sends `Connection: close`.
    pub fn start<F>(respond: F) -> Self
    where
        F: Fn(usize, &RecordedRequest) -> Vec<u8> + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let respond: Arc<Responder> = Arc::new(respond);

        let (requests_ref, connections_ref) = (requests.clone(), connections.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                connections_ref.fetch_add(1, Ordering::SeqCst);
                let requests = requests_ref.clone();
                let respond = respond.clone();
                thread::spawn(move || loop {
                    let options = ReadOptions {
                        timeout: Duration::from_secs(5),
                        ..ReadOptions::default()
                    };
                    let Ok(message) = HttpMessage::read_from(&mut stream, &options) else {
                        break;
                    };
                    let request = RecordedRequest {
                        method: message.method().unwrap_or_default().to_string(),
                        path: message.path().unwrap_or_default().to_string(),
                        headers: message
                            .headers()
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                        body: message.body().to_vec(),
                    };
                    let index = {
                        let mut recorded = requests.lock().unwrap();
                        recorded.push(request.clone());
                        recorded.len() - 1
                    };
                    let response = respond(index, &request);
                    if stream.write_all(&response).is_err() {
                        break;
                    }
                    if message.has_header_token("Connection", "close") {
                        break;
                    }
                });
            }
        });

        Self {
            addr,
            requests,
            connections,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// A complete response with a Content-Length body.
pub fn response(status: &str, headers: &[(&str, &str)], body: &str) -> Vec<u8> {
    let mut raw = format!("HTTP/1.1 {}\r\n", status);
    for (name, value) in headers {
        raw.push_str(&format!("{}: {}\r\n", name, value));
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{}", body.len(), body));
    raw.into_bytes()
}
