use thiserror::Error;

use crate::subscription::SubscriptionKind;
use crate::util::http::{ClientError, InvalidUriError, StatusCode};
use crate::util::types::InvalidTokenError;

/// Closed set of outcomes callers branch on.
///
/// The numeric values are part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Success = 0,
    Unauthorized = 1,
    BadRequest = 2,
    UnknownError = 3,
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Code::Success => "success",
            Code::Unauthorized => "unauthorized",
            Code::BadRequest => "bad request",
            Code::UnknownError => "unknown error",
        };
        write!(f, "{name} ({})", *self as i32)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown transport: {0}")]
    UnknownTransport(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid access token: {0}")]
    InvalidToken(#[from] InvalidTokenError),

    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("{0} subscription is already active")]
    AlreadyActive(SubscriptionKind),

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request")]
    BadRequest,

    #[error("no reply received for request {0}")]
    ReplyTimeout(u32),

    #[error("timed out waiting for the broker to accept the connection")]
    ConnectTimeout,

    #[error("invalid endpoint URI: {0}")]
    InvalidUri(#[from] InvalidUriError),

    #[error("HTTP request failed: {0}")]
    Http(ClientError),

    #[error("MQTT request failed: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("MQTT connection failed: {0}")]
    Connection(#[from] rumqttc::ConnectionError),

    #[error("JSON de/serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Response(StatusCode::UNAUTHORIZED) => Error::Unauthorized,
            ClientError::Response(StatusCode::BAD_REQUEST) => Error::BadRequest,
            err => Error::Http(err),
        }
    }
}

impl Error {
    /// Collapse the error into the public result taxonomy
    pub fn code(&self) -> Code {
        match self {
            Error::Unauthorized => Code::Unauthorized,
            Error::BadRequest => Code::BadRequest,
            _ => Code::UnknownError,
        }
    }
}

/// Result code of any session operation
pub fn code_of<T>(result: &Result<T, Error>) -> Code {
    match result {
        Ok(_) => Code::Success,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_maps_http_statuses_onto_the_taxonomy() {
        let err: Error = ClientError::Response(StatusCode::UNAUTHORIZED).into();
        assert_eq!(err.code(), Code::Unauthorized);

        let err: Error = ClientError::Response(StatusCode::BAD_REQUEST).into();
        assert_eq!(err.code(), Code::BadRequest);

        let err: Error = ClientError::Response(StatusCode::INTERNAL_SERVER_ERROR).into();
        assert_eq!(err.code(), Code::UnknownError);
    }

    #[test]
    fn it_reports_success_for_ok_results() {
        let ok: Result<(), Error> = Ok(());
        assert_eq!(code_of(&ok), Code::Success);
        assert_eq!(Code::Success as i32, 0);

        let err: Result<(), Error> = Err(Error::NotConnected);
        assert_eq!(code_of(&err), Code::UnknownError);
        assert_eq!(Code::UnknownError as i32, 3);
    }
}
