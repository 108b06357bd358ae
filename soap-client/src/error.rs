//! Error types for the SOAP client

use thiserror::Error;

/// Errors that can occur during SOAP and GENA communication
#[derive(Debug, Error)]
pub enum SoapError {
    /// Network or HTTP communication error
    #[error("Network/HTTP error: {0}")]
    Network(#[from] http_client::HttpError),

    /// The device answered with an unexpected HTTP status
    #[error("unexpected HTTP status {0}")]
    Status(u16),

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    Parse(String),

    /// SOAP fault returned by the device, with its UPnP error code
    #[error("SOAP fault: error code {0}")]
    Fault(u16),

    /// A declared output argument is absent from the response
    #[error("missing output argument {0}")]
    MissingArgument(String),

    /// A subscription response without a subscription id
    #[error("missing SID header in subscription response")]
    MissingSid,
}
