// Copyright 2021 The matrix-mio developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error conditions.

use std::fmt;

use reqwest::StatusCode;
use ruma::OwnedRoomId;
use serde_json::Error as JsonError;
use thiserror::Error;

use crate::{
    crypto::{CryptoStoreError, MegolmError, OlmError, SignatureError},
    store::StoreError,
};

/// Result of a [`Client`](crate::Client) operation.
pub type Result<T> = std::result::Result<T, Error>;

/// HTTP status codes that are worth an automatic retry.
///
/// The non-standard codes are what Cloudflare and similar proxies return when
/// the origin is unreachable.
pub const RETRIABLE_STATUS: &[u16] = &[
    408, 429, 500, 502, 503, 504, 520, 521, 522, 523, 524, 525, 526, 527, 598,
];

/// An error returned by the homeserver as a Matrix error body.
#[derive(Clone, Debug, Error)]
pub struct MatrixError {
    /// The Matrix error code, e.g. `M_FORBIDDEN`.
    pub errcode: String,
    /// The human readable message the server sent along.
    pub message: String,
    /// The HTTP status code of the response.
    pub http_code: StatusCode,
}

impl fmt::Display for MatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.errcode, self.http_code, self.message)
    }
}

/// Error that can happen while sending a request to the homeserver.
#[derive(Debug, Error)]
pub enum HttpError {
    /// The request couldn't be sent or the response body couldn't be read.
    #[error(transparent)]
    Reqwest(#[from] reqwest::Error),

    /// The server replied with a typed Matrix error.
    #[error("the server returned an error: {0}")]
    Matrix(#[from] MatrixError),

    /// The server replied with a non-success status and no Matrix error body.
    #[error("the server returned the status code {0}")]
    Server(StatusCode),

    /// The homeserver URL couldn't be parsed or extended.
    #[error(transparent)]
    Url(#[from] url::ParseError),

    /// The request needs an access token but the client isn't logged in.
    #[error("the request requires authentication but no access token is set")]
    AuthenticationRequired,
}

impl HttpError {
    /// Can the request that produced this error be retried?
    pub fn can_retry(&self) -> bool {
        let status = match self {
            HttpError::Matrix(e) => Some(e.http_code),
            HttpError::Server(status) => Some(*status),
            HttpError::Reqwest(e) => e.status(),
            _ => None,
        };

        status.is_some_and(|s| RETRIABLE_STATUS.contains(&s.as_u16()))
    }
}

/// The error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An HTTP or Matrix protocol level error.
    #[error(transparent)]
    Http(#[from] HttpError),

    /// An Olm to-device encryption or decryption error.
    #[error(transparent)]
    Olm(#[from] OlmError),

    /// A Megolm room event encryption or decryption error.
    #[error(transparent)]
    Megolm(#[from] MegolmError),

    /// A signature could not be created or checked.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The state store failed to read or write a file.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The crypto store failed to read or write a file.
    #[error(transparent)]
    CryptoStore(#[from] CryptoStoreError),

    /// A JSON body couldn't be serialized or deserialized.
    #[error(transparent)]
    Json(#[from] JsonError),

    /// The operation needs a logged in client.
    #[error("the client isn't logged in")]
    AuthenticationRequired,

    /// The given room isn't known to the client.
    #[error("the room {0} is unknown to this client")]
    UnknownRoom(OwnedRoomId),
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Http(HttpError::Url(e))
    }
}
