//! Private SOAP client for UPnP device communication
//!
//! This crate builds SOAP 1.1 envelopes for UPnP actions, posts them to a
//! service control URL and extracts the declared output arguments from the
//! response. It also speaks the GENA side of eventing: SUBSCRIBE, renewal and
//! UNSUBSCRIBE requests toward a service event URL.

mod error;

pub use error::SoapError;

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use http_client::{HttpMessage, HttpRequest, StopToken};
use quick_xml::escape::escape;
use xmltree::{Element, XMLNode};

/// User agent sent with every control request
pub const USER_AGENT: &str = concat!("dlna-sdk/", env!("CARGO_PKG_VERSION"), " UPnP/1.0");

/// Namespace of a standard UPnP service type, e.g. `AVTransport`
pub fn service_urn(service: &str) -> String {
    format!("urn:schemas-upnp-org:service:{}:1", service)
}

/// Value of the `SOAPAction` header, quotes included
pub fn soap_action(service: &str, action: &str) -> String {
    format!("\"{}#{}\"", service_urn(service), action)
}

/// Build the SOAP envelope invoking `action` of `service` with the given
/// arguments, in order. Values are XML-escaped; names are used verbatim.
pub fn build_envelope<N, V>(service: &str, action: &str, arguments: &[(N, V)]) -> String
where
    N: AsRef<str>,
    V: AsRef<str>,
{
    let arguments: String = arguments
        .iter()
        .map(|(name, value)| {
            format!(
                "<{name}>{value}</{name}>",
                name = name.as_ref(),
                value = escape(value.as_ref())
            )
        })
        .collect();
    format!(
        "<?xml version=\"1.0\"?>\n\
         <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\n\
         <s:Body>\n\
         <u:{action} xmlns:u=\"{urn}\">\n\
         {arguments}\
         </u:{action}>\n\
         </s:Body>\n\
         </s:Envelope>",
        action = action,
        urn = service_urn(service),
        arguments = arguments
    )
}

/// Response from a UPnP subscription request
#[derive(Debug, Clone)]
pub struct SubscriptionResponse {
    /// Subscription ID returned by the device
    pub sid: String,
    /// Actual timeout granted by the device (in seconds)
    pub timeout_seconds: u32,
}

/// Per-call transport options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Local address the request leaves from
    pub source_ip: Option<IpAddr>,
    /// Budget for the whole exchange
    pub max_time: Option<Duration>,
    pub stop: Option<StopToken>,
}

/// A minimal SOAP client for UPnP device communication
#[derive(Debug, Clone)]
pub struct SoapClient {
    connect_timeout: Duration,
    max_length: usize,
    gena_timeout: Duration,
}

impl Default for SoapClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SoapClient {
    /// Create a new SOAP client with default configuration
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            max_length: 104_857_600,
            gena_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn with_gena_timeout(mut self, timeout: Duration) -> Self {
        self.gena_timeout = timeout;
        self
    }

    /// Post an envelope to a control URL and collect the named output
    /// arguments from the response.
    pub fn call(
        &self,
        control_url: &str,
        service: &str,
        action: &str,
        envelope: &str,
        out_arguments: &[String],
        options: &CallOptions,
    ) -> Result<HashMap<String, String>, SoapError> {
        let mut request = HttpRequest::new(control_url)
            .method("POST")
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .header("SOAPAction", soap_action(service, action))
            .body(envelope.as_bytes().to_vec())
            .timeout(self.connect_timeout)
            .max_length(self.max_length);
        if let Some(ip) = options.source_ip {
            request = request.source_ip(ip);
        }
        if let Some(max_time) = options.max_time {
            request = request.max_time(max_time);
        }
        if let Some(stop) = &options.stop {
            request = request.stop(stop.clone());
        }

        let response = request.send()?;
        if response.code() != Some(200) {
            return Err(fault_or_status(&response));
        }
        let xml = Element::parse(response.body()).map_err(|e| SoapError::Parse(e.to_string()))?;
        extract_arguments(&xml, out_arguments)
    }

    /// Subscribe to UPnP events for a service event URL
    ///
    /// # Arguments
    /// * `event_url` - Absolute event subscription URL of the service
    /// * `callback_url` - URL where events should be sent
    /// * `timeout_seconds` - Requested subscription timeout in seconds
    /// * `source_ip` - Local address the request leaves from
    ///
    /// # Returns
    /// A `SubscriptionResponse` containing the SID and actual timeout
    pub fn subscribe(
        &self,
        event_url: &str,
        callback_url: &str,
        timeout_seconds: u32,
        source_ip: Option<IpAddr>,
    ) -> Result<SubscriptionResponse, SoapError> {
        let request = HttpRequest::new(event_url)
            .method("SUBSCRIBE")
            .header("Callback", format!("<{}>", callback_url))
            .header("NT", "upnp:event")
            .header("Timeout", format!("Second-{}", timeout_seconds));
        let response = self.send_gena(request, source_ip)?;

        let sid = response
            .header("SID")
            .map(str::trim)
            .filter(|sid| !sid.is_empty())
            .ok_or(SoapError::MissingSid)?
            .to_string();

        Ok(SubscriptionResponse {
            sid,
            timeout_seconds: granted_timeout(&response).unwrap_or(timeout_seconds),
        })
    }

    /// Renew an existing UPnP subscription
    ///
    /// # Returns
    /// The actual timeout granted by the device
    pub fn renew_subscription(
        &self,
        event_url: &str,
        sid: &str,
        timeout_seconds: u32,
        source_ip: Option<IpAddr>,
    ) -> Result<u32, SoapError> {
        let request = HttpRequest::new(event_url)
            .method("SUBSCRIBE")
            .header("SID", sid)
            .header("Timeout", format!("Second-{}", timeout_seconds));
        let response = self.send_gena(request, source_ip)?;
        Ok(granted_timeout(&response).unwrap_or(timeout_seconds))
    }

    /// Cancel a UPnP subscription
    pub fn unsubscribe(
        &self,
        event_url: &str,
        sid: &str,
        source_ip: Option<IpAddr>,
    ) -> Result<(), SoapError> {
        let request = HttpRequest::new(event_url)
            .method("UNSUBSCRIBE")
            .header("SID", sid);
        self.send_gena(request, source_ip)?;
        Ok(())
    }

    fn send_gena(
        &self,
        request: HttpRequest,
        source_ip: Option<IpAddr>,
    ) -> Result<HttpMessage, SoapError> {
        let mut request = request.timeout(self.gena_timeout);
        if let Some(ip) = source_ip {
            request = request.source_ip(ip);
        }
        let response = request.send()?;
        match response.code() {
            Some(200) => Ok(response),
            code => Err(SoapError::Status(code.unwrap_or_default())),
        }
    }
}

/// Parse a `Second-<n>` timeout header; `infinite` and malformed values yield None
fn granted_timeout(response: &HttpMessage) -> Option<u32> {
    let value = response.header("TIMEOUT")?.trim();
    let seconds = value.get(..7).filter(|p| p.eq_ignore_ascii_case("Second-"))?;
    value[seconds.len()..].trim().parse().ok()
}

fn fault_or_status(response: &HttpMessage) -> SoapError {
    let code = response.code().unwrap_or_default();
    Element::parse(response.body())
        .ok()
        .and_then(|xml| find_descendant(&xml, "errorCode").map(element_text))
        .and_then(|text| text.trim().parse().ok())
        .map(SoapError::Fault)
        .unwrap_or(SoapError::Status(code))
}

fn extract_arguments(
    xml: &Element,
    out_arguments: &[String],
) -> Result<HashMap<String, String>, SoapError> {
    out_arguments
        .iter()
        .map(|name| {
            find_descendant(xml, name)
                .map(|element| (name.clone(), element_text(element)))
                .ok_or_else(|| SoapError::MissingArgument(name.clone()))
        })
        .collect()
}

/// First element named `name` in document order, the root included
fn find_descendant<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    if element.name == name {
        return Some(element);
    }
    element.children.iter().find_map(|child| match child {
        XMLNode::Element(child) => find_descendant(child, name),
        _ => None,
    })
}

fn element_text(element: &Element) -> String {
    element
        .children
        .iter()
        .filter_map(|child| match child {
            XMLNode::Text(text) | XMLNode::CData(text) => Some(text.as_str()),
            _ => None,
        })
        .collect()
}
