//! Error types for the bidder partner.

use thiserror::Error;

/// Result type alias for partner operations.
pub type Result<T> = std::result::Result<T, PartnerError>;

/// Error category, usable as a stable tag by analytics sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    MalformedResponse,
    UnsolicitedRecord,
    TransportTimeout,
    TransportStatus,
    DuplicateRecord,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::UnsolicitedRecord => "unsolicited_record",
            ErrorKind::TransportTimeout => "transport_timeout",
            ErrorKind::TransportStatus => "transport_status",
            ErrorKind::DuplicateRecord => "duplicate_record",
        }
    }
}

/// Partner errors.
///
/// Only the transport variants ever reach a caller; the parsing variants are
/// logged and the offending record is dropped.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PartnerError {
    /// Configuration rejected at construction.
    #[error("invalid configuration: {}", .0.join("; "))]
    Configuration(Vec<String>),

    /// Payload (or a single record of it) could not be decoded.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// Bid for an impression id that was never requested.
    #[error("impid {0} returned was never requested")]
    UnsolicitedRecord(String),

    /// Bid request timed out.
    #[error("API error - timeout occurred")]
    TransportTimeout,

    /// Bid request failed. Status 0 means no response arrived.
    #[error("Request error - Status Code: {status}")]
    TransportStatus { status: u16, detail: String },

    /// Second record for the same slot and dimensions in one response.
    #[error("duplicate demand for {slot_id} at {dimensions}")]
    DuplicateRecord { slot_id: String, dimensions: String },
}

impl PartnerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PartnerError::Configuration(_) => ErrorKind::Configuration,
            PartnerError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            PartnerError::UnsolicitedRecord(_) => ErrorKind::UnsolicitedRecord,
            PartnerError::TransportTimeout => ErrorKind::TransportTimeout,
            PartnerError::TransportStatus { .. } => ErrorKind::TransportStatus,
            PartnerError::DuplicateRecord { .. } => ErrorKind::DuplicateRecord,
        }
    }

    /// Free-form detail carried by the variant.
    pub fn detail(&self) -> String {
        match self {
            PartnerError::Configuration(errs) => errs.join("; "),
            PartnerError::MalformedResponse(d) => d.clone(),
            PartnerError::UnsolicitedRecord(id) => id.clone(),
            PartnerError::TransportTimeout => String::new(),
            PartnerError::TransportStatus { status, detail } => {
                if detail.is_empty() {
                    status.to_string()
                } else {
                    format!("{}: {}", status, detail)
                }
            }
            PartnerError::DuplicateRecord { slot_id, dimensions } => {
                format!("{} {}", slot_id, dimensions)
            }
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, PartnerError::TransportTimeout | PartnerError::TransportStatus { .. })
    }
}
