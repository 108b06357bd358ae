//! Loopback media renderer used by the integration tests.
//!
//! The fake serves its description, two service descriptions, SOAP control
//! for AVTransport and RenderingControl, and GENA subscriptions. Every
//! request is recorded.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use dlna_sdk::{DeviceKind, Handler, HandlerConfig};
use http_client::{HttpMessage, ReadOptions};

pub const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <specVersion><major>1</major><minor>0</minor></specVersion>
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Fake Renderer</friendlyName>
    <manufacturer>Loopback</manufacturer>
    <modelName>Fake 1</modelName>
    <UDN>uuid:fake-renderer-0001</UDN>
    <iconList>
      <icon><mimetype>image/png</mimetype><url>/icon.png</url></icon>
    </iconList>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:AVTransport</serviceId>
        <SCPDURL>/AVTransport.xml</SCPDURL>
        <controlURL>/AVTransport/control</controlURL>
        <eventSubURL>/AVTransport/event</eventSubURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <serviceId>urn:upnp-org:serviceId:RenderingControl</serviceId>
        <SCPDURL>/RenderingControl.xml</SCPDURL>
        <controlURL>/RenderingControl/control</controlURL>
        <eventSubURL>/RenderingControl/event</eventSubURL>
      </service>
    </serviceList>
  </device>
</root>"#;

fn argument(name: &str, direction: &str, variable: &str) -> String {
    format!(
        "<argument><name>{}</name><direction>{}</direction><relatedStateVariable>{}</relatedStateVariable></argument>",
        name, direction, variable
    )
}

fn action(name: &str, arguments: &[(&str, &str, &str)]) -> String {
    let arguments: String = arguments
        .iter()
        .map(|(name, direction, variable)| argument(name, direction, variable))
        .collect();
    format!("<action><name>{}</name><argumentList>{}</argumentList></action>", name, arguments)
}

fn scpd(actions: &[String], variables: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<scpd xmlns=\"urn:schemas-upnp-org:service-1-0\"><actionList>{}</actionList><serviceStateTable>{}</serviceStateTable></scpd>",
        actions.concat(),
        variables
    )
}

pub fn av_transport_scpd() -> String {
    let instance = ("InstanceID", "in", "A_ARG_TYPE_InstanceID");
    scpd(
        &[
            action(
                "SetAVTransportURI",
                &[
                    instance,
                    ("CurrentURI", "in", "AVTransportURI"),
                    ("CurrentURIMetaData", "in", "AVTransportURIMetaData"),
                ],
            ),
            action(
                "SetNextAVTransportURI",
                &[
                    instance,
                    ("NextURI", "in", "NextAVTransportURI"),
                    ("NextURIMetaData", "in", "NextAVTransportURIMetaData"),
                ],
            ),
            action("Play", &[instance, ("Speed", "in", "TransportPlaySpeed")]),
            action("Stop", &[instance]),
            action("Pause", &[instance]),
            action(
                "Seek",
                &[instance, ("Unit", "in", "A_ARG_TYPE_SeekMode"), ("Target", "in", "A_ARG_TYPE_SeekTarget")],
            ),
            action(
                "GetPositionInfo",
                &[
                    instance,
                    ("TrackDuration", "out", "CurrentTrackDuration"),
                    ("RelTime", "out", "RelativeTimePosition"),
                ],
            ),
            action("GetMediaInfo", &[instance, ("MediaDuration", "out", "CurrentMediaDuration")]),
            action(
                "GetTransportInfo",
                &[
                    instance,
                    ("CurrentTransportState", "out", "TransportState"),
                    ("CurrentTransportStatus", "out", "TransportStatus"),
                    ("CurrentSpeed", "out", "TransportPlaySpeed"),
                ],
            ),
        ],
        r#"<stateVariable sendEvents="no"><name>A_ARG_TYPE_InstanceID</name><dataType>ui4</dataType></stateVariable>
<stateVariable sendEvents="no"><name>AVTransportURI</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>AVTransportURIMetaData</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>NextAVTransportURI</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>NextAVTransportURIMetaData</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>TransportPlaySpeed</name><dataType>string</dataType><allowedValueList><allowedValue>1</allowedValue></allowedValueList></stateVariable>
<stateVariable sendEvents="no"><name>A_ARG_TYPE_SeekMode</name><dataType>string</dataType><allowedValueList><allowedValue>REL_TIME</allowedValue></allowedValueList></stateVariable>
<stateVariable sendEvents="no"><name>A_ARG_TYPE_SeekTarget</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>CurrentTrackDuration</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>RelativeTimePosition</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>CurrentMediaDuration</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>TransportState</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="no"><name>TransportStatus</name><dataType>string</dataType></stateVariable>
<stateVariable sendEvents="yes"><name>LastChange</name><dataType>string</dataType></stateVariable>"#,
    )
}

pub fn rendering_control_scpd() -> String {
    let instance = ("InstanceID", "in", "A_ARG_TYPE_InstanceID");
    let channel = ("Channel", "in", "A_ARG_TYPE_Channel");
    scpd(
        &[
            action("GetVolume", &[instance, channel, ("CurrentVolume", "out", "Volume")]),
            action("SetVolume", &[instance, channel, ("DesiredVolume", "in", "Volume")]),
            action("GetMute", &[instance, channel, ("CurrentMute", "out", "Mute")]),
            action("SetMute", &[instance, channel, ("DesiredMute", "in", "Mute")]),
        ],
        r#"<stateVariable sendEvents="no"><name>A_ARG_TYPE_InstanceID</name><dataType>ui4</dataType></stateVariable>
<stateVariable sendEvents="no"><name>A_ARG_TYPE_Channel</name><dataType>string</dataType><allowedValueList><allowedValue>Master</allowedValue></allowedValueList></stateVariable>
<stateVariable sendEvents="no"><name>Volume</name><dataType>ui2</dataType><allowedValueRange><minimum>0</minimum><maximum>100</maximum></allowedValueRange></stateVariable>
<stateVariable sendEvents="no"><name>Mute</name><dataType>boolean</dataType></stateVariable>
<stateVariable sendEvents="yes"><name>LastChange</name><dataType>string</dataType></stateVariable>"#,
    )
}

/// A request as the fake renderer saw it.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct RendererState {
    volume: String,
    mute: String,
    reject_subscriptions: bool,
}

pub struct FakeRenderer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    state: Arc<Mutex<RendererState>>,
}

impl FakeRenderer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind fake renderer");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = Arc::new(Mutex::new(RendererState {
            volume: "10".to_string(),
            mute: "0".to_string(),
            reject_subscriptions: false,
        }));

        let (requests_ref, state_ref) = (requests.clone(), state.clone());
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let requests = requests_ref.clone();
                let state = state_ref.clone();
                thread::spawn(move || serve(stream, &requests, &state));
            }
        });

        Self { addr, requests, state }
    }

    pub fn desc_url(&self) -> String {
        format!("http://{}/description.xml", self.addr)
    }

    pub fn reject_subscriptions(&self) {
        self.state.lock().unwrap().reject_subscriptions = true;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|request| request.path == path)
            .collect()
    }
}

fn serve(mut stream: TcpStream, requests: &Mutex<Vec<RecordedRequest>>, state: &Mutex<RendererState>) {
    let options = ReadOptions {
        timeout: Duration::from_secs(5),
        ..ReadOptions::default()
    };
    let Ok(message) = HttpMessage::read_from(&mut stream, &options) else {
        return;
    };
    let request = RecordedRequest {
        method: message.method().unwrap_or_default().to_string(),
        path: message.path().unwrap_or_default().to_string(),
        headers: message
            .headers()
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        body: String::from_utf8_lossy(message.body()).into_owned(),
    };
    requests.lock().unwrap().push(request.clone());
    let response = respond(&request, state);
    let _ = stream.write_all(&response);
    let _ = stream.flush();
}

fn http_response(status: &str, extra_headers: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {}\r\n{}Content-Type: text/xml; charset=\"utf-8\"\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        extra_headers,
        body.len(),
        body
    )
    .into_bytes()
}

fn soap_response(service: &str, action: &str, outputs: &[(&str, &str)]) -> Vec<u8> {
    let outputs: String = outputs
        .iter()
        .map(|(name, value)| format!("<{name}>{value}</{name}>", name = name, value = value))
        .collect();
    let body = format!(
        "<?xml version=\"1.0\"?>\n<s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\"><s:Body><u:{action}Response xmlns:u=\"urn:schemas-upnp-org:service:{service}:1\">{outputs}</u:{action}Response></s:Body></s:Envelope>",
        action = action,
        service = service,
        outputs = outputs
    );
    http_response("200 OK", "", &body)
}

/// Value of an input argument in a SOAP request body
fn input<'a>(body: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{}>", name);
    let close = format!("</{}>", name);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(&body[start..end])
}

fn respond(request: &RecordedRequest, state: &Mutex<RendererState>) -> Vec<u8> {
    let soap_action = request.header("SOAPAction").unwrap_or_default();
    let action = soap_action
        .trim_matches('"')
        .rsplit('#')
        .next()
        .unwrap_or_default()
        .to_string();
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/description.xml") => http_response("200 OK", "", DESCRIPTION),
        ("GET", "/AVTransport.xml") => http_response("200 OK", "", &av_transport_scpd()),
        ("GET", "/RenderingControl.xml") => http_response("200 OK", "", &rendering_control_scpd()),
        ("POST", "/AVTransport/control") => match action.as_str() {
            "GetPositionInfo" => soap_response(
                "AVTransport",
                &action,
                &[("TrackDuration", "0:03:00"), ("RelTime", "0:01:00")],
            ),
            "GetMediaInfo" => soap_response("AVTransport", &action, &[("MediaDuration", "0:03:00")]),
            "GetTransportInfo" => soap_response(
                "AVTransport",
                &action,
                &[
                    ("CurrentTransportState", "PLAYING"),
                    ("CurrentTransportStatus", "OK"),
                    ("CurrentSpeed", "1"),
                ],
            ),
            _ => soap_response("AVTransport", &action, &[]),
        },
        ("POST", "/RenderingControl/control") => {
            let mut state = state.lock().unwrap();
            match action.as_str() {
                "GetVolume" => soap_response("RenderingControl", &action, &[("CurrentVolume", state.volume.as_str())]),
                "GetMute" => soap_response("RenderingControl", &action, &[("CurrentMute", state.mute.as_str())]),
                "SetVolume" => {
                    state.volume = input(&request.body, "DesiredVolume").unwrap_or_default().to_string();
                    soap_response("RenderingControl", &action, &[])
                }
                "SetMute" => {
                    state.mute = input(&request.body, "DesiredMute").unwrap_or_default().to_string();
                    soap_response("RenderingControl", &action, &[])
                }
                _ => http_response("500 Internal Server Error", "", ""),
            }
        }
        ("SUBSCRIBE", path) if path.ends_with("/event") => {
            if state.lock().unwrap().reject_subscriptions {
                http_response("412 Precondition Failed", "", "")
            } else if request.header("SID").is_some() {
                http_response("200 OK", "TIMEOUT: Second-600\r\n", "")
            } else {
                let sid = if path.starts_with("/AVTransport") {
                    "uuid:sub-avt"
                } else {
                    "uuid:sub-rc"
                };
                http_response("200 OK", &format!("SID: {}\r\nTIMEOUT: Second-300\r\n", sid), "")
            }
        }
        ("UNSUBSCRIBE", path) if path.ends_with("/event") => http_response("200 OK", "", ""),
        _ => http_response("404 Not Found", "", ""),
    }
}

/// Renderer handler bound to loopback
pub fn loopback_config() -> HandlerConfig {
    HandlerConfig::default().with_ip(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

pub fn loopback_handler(kind: DeviceKind) -> Handler {
    Handler::new(kind, loopback_config()).expect("handler")
}

pub fn loopback() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

/// GENA property set carrying one AVTransport `LastChange`
pub fn last_change_body(transport_state: &str) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n<e:propertyset xmlns:e=\"urn:schemas-upnp-org:event-1-0\"><e:property><LastChange>&lt;Event xmlns=&quot;urn:schemas-upnp-org:metadata-1-0/AVT/&quot;&gt;&lt;InstanceID val=&quot;0&quot;&gt;&lt;TransportState val=&quot;{}&quot;/&gt;&lt;/InstanceID&gt;&lt;/Event&gt;</LastChange></e:property></e:propertyset>",
        transport_state
    )
}

/// Send a NOTIFY to a callback URL the way a device does; returns the status
/// code, `None` when nothing listens.
pub fn notify(callback_url: &str, sid: &str, seq: u32, body: &str) -> Option<u16> {
    let rest = callback_url.strip_prefix("http://")?;
    let (authority, path) = rest.split_once('/')?;
    let mut stream = TcpStream::connect(authority).ok()?;
    stream.set_read_timeout(Some(Duration::from_secs(5))).ok()?;
    let request = format!(
        "NOTIFY /{} HTTP/1.1\r\nHOST: {}\r\nCONTENT-TYPE: text/xml; charset=\"utf-8\"\r\nNT: upnp:event\r\nNTS: upnp:propchange\r\nSID: {}\r\nSEQ: {}\r\nContent-Length: {}\r\n\r\n{}",
        path,
        authority,
        sid,
        seq,
        body.len(),
        body
    );
    stream.write_all(request.as_bytes()).ok()?;
    let mut status_line = String::new();
    BufReader::new(stream).read_line(&mut status_line).ok()?;
    status_line.split_whitespace().nth(1)?.parse().ok()
}
