// Copyright 2024 Quiver Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use config::utils::json;
use thiserror::Error as ThisError;

pub mod grpc;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("IoError# {0}")]
    IoError(#[from] std::io::Error),
    #[error("SerdeJsonError# {0}")]
    SerdeJsonError(#[from] json::Error),
    #[error("TransportError# {0}")]
    TransportError(#[from] tonic::transport::Error),
    #[error("InvalidArgument# {0}")]
    InvalidArgument(String),
    #[error("NotFound# {0}")]
    NotFound(String),
    #[error("AlreadyExists# {0}")]
    AlreadyExists(String),
    #[error("FailedPrecondition# {0}")]
    FailedPrecondition(String),
    #[error("ResourceExhausted# {0}")]
    ResourceExhausted(String),
    #[error("Unavailable# {0}")]
    Unavailable(String),
    #[error("Internal# {0}")]
    Internal(String),
    #[error("Error# {0}")]
    Message(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    ResourceExhausted,
    Unavailable,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            Error::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Error::Unavailable(_) | Error::TransportError(_) => ErrorKind::Unavailable,
            _ => ErrorKind::Internal,
        }
    }

    /// Infrastructure errors may be retried with backoff; logical errors are
    /// surfaced verbatim and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Unavailable)
    }

    pub fn http_status(&self) -> u16 {
        match self.kind() {
            ErrorKind::InvalidArgument => 400,
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::FailedPrecondition => 412,
            ErrorKind::ResourceExhausted => 429,
            ErrorKind::Unavailable => 503,
            ErrorKind::Internal => 500,
        }
    }

    /// User-visible `{code, message}` tuple.
    pub fn to_json(&self) -> json::Value {
        json::json!({
            "code": self.http_status(),
            "message": self.to_string(),
        })
    }

    /// Wrong-leader errors carry a redirect hint: `leader=<grpc_addr>`.
    pub fn leader_hint(&self) -> Option<String> {
        let Error::FailedPrecondition(msg) = self else {
            return None;
        };
        msg.split_whitespace()
            .find_map(|tok| tok.strip_prefix("leader="))
            .filter(|addr| !addr.is_empty())
            .map(|addr| addr.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Message("Ni! Try again.".to_string());
        assert_eq!("Error# Ni! Try again.", &err.to_string());

        let err = Error::NotFound("index products".to_string());
        assert_eq!("NotFound# index products", &err.to_string());
    }

    #[test]
    fn test_kinds_and_status() {
        assert_eq!(Error::InvalidArgument("x".into()).http_status(), 400);
        assert_eq!(Error::NotFound("x".into()).http_status(), 404);
        assert_eq!(Error::AlreadyExists("x".into()).http_status(), 409);
        assert_eq!(Error::FailedPrecondition("x".into()).http_status(), 412);
        assert_eq!(Error::ResourceExhausted("x".into()).http_status(), 429);
        assert_eq!(Error::Unavailable("x".into()).http_status(), 503);
        assert_eq!(Error::Internal("x".into()).http_status(), 500);
    }

    #[test]
    fn test_retryable() {
        assert!(Error::Unavailable("peer down".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::InvalidArgument("x".into()).is_retryable());
    }

    #[test]
    fn test_leader_hint() {
        let err = Error::FailedPrecondition(
            "not the leader; leader=http://10.0.0.2:5461".to_string(),
        );
        assert_eq!(
            err.leader_hint().as_deref(),
            Some("http://10.0.0.2:5461")
        );
        let err = Error::FailedPrecondition("no leader elected yet".to_string());
        assert_eq!(err.leader_hint(), None);
    }
}
