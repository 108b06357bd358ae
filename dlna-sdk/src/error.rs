//! Error types for dlna-sdk

use thiserror::Error;

/// Result type for dlna-sdk operations
pub type Result<T> = std::result::Result<T, DlnaError>;

/// Errors that can occur while discovering, controlling or observing devices
#[derive(Debug, Error)]
pub enum DlnaError {
    /// Invalid handler configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The device is not (or no longer) part of the handler registry
    #[error("Device {0} is not registered")]
    UnknownDevice(String),

    /// The device exposes no service with this id
    #[error("Service {0} not found")]
    UnknownService(String),

    /// The service exposes no action with this name
    #[error("Action {action} not found in service {service}")]
    UnknownAction { service: String, action: String },

    /// The command was not sent because its arguments did not match the action
    #[error("Command {service}/{action} abandoned: {reason}")]
    Abandoned {
        service: String,
        action: String,
        reason: String,
    },

    /// A description document was rejected
    #[error("Invalid description: {0}")]
    Description(String),

    /// The device answered but not with what was expected
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The component is already running
    #[error("{0} already activated")]
    AlreadyActive(String),

    /// A private notification listener serves a single subscription
    #[error("Notification listener does not accept more registrations")]
    ListenerFull,

    /// SOAP or GENA exchange failure
    #[error("SOAP error: {0}")]
    Soap(#[from] soap_client::SoapError),

    /// Transport failure
    #[error("HTTP error: {0}")]
    Http(#[from] http_client::HttpError),

    /// Embedded notification server failure
    #[error("Callback server error: {0}")]
    Callback(#[from] callback_server::CallbackError),

    /// Socket setup failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_abandoned_message() {
        let error = DlnaError::Abandoned {
            service: "AVTransport".to_string(),
            action: "Play".to_string(),
            reason: "missing argument Speed".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Command AVTransport/Play abandoned: missing argument Speed"
        );
    }

    #[test]
    fn test_soap_error_conversion() {
        let error: DlnaError = soap_client::SoapError::Status(500).into();
        assert!(matches!(error, DlnaError::Soap(_)));
    }
}
