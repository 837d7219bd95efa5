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

//! The HTTP layer talking to the homeserver.
//!
//! All requests go through [`HttpClient::send_matrix`], which attaches the
//! access token, retries the retriable status codes with exponential backoff
//! and turns Matrix error bodies into typed [`MatrixError`]s. The typed
//! methods below cover the client-server API surface the rest of the crate
//! consumes.

use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use backoff::ExponentialBackoff;
use reqwest::{Method, StatusCode};
use ruma::RoomId;
use serde_json::Value;
use tracing::{debug, trace};
use url::Url;

use crate::error::{HttpError, MatrixError, RETRIABLE_STATUS};

const API_BASE: &str = "_matrix/client/r0";

/// Server side timeout for device queries and one-time-key claims.
pub(crate) const KEY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client side margin added on top of the server side sync long-poll timeout.
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(15);

/// Default client side timeout for non long-polling requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
    homeserver: Arc<RwLock<Url>>,
    access_token: Arc<RwLock<Option<String>>>,
}

impl HttpClient {
    pub fn new(homeserver: Url) -> Result<Self, HttpError> {
        let inner = reqwest::Client::builder()
            .user_agent(concat!("matrix-mio/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            inner,
            homeserver: Arc::new(RwLock::new(homeserver)),
            access_token: Arc::new(RwLock::new(None)),
        })
    }

    pub fn homeserver(&self) -> Url {
        self.homeserver.read().unwrap().clone()
    }

    /// Replace the homeserver, used when login discovers a `.well-known` URL.
    pub fn set_homeserver(&self, homeserver: Url) {
        *self.homeserver.write().unwrap() = homeserver;
    }

    pub fn set_access_token(&self, token: Option<String>) {
        *self.access_token.write().unwrap() = token;
    }

    fn api_url(&self, segments: &[&str], query: &[(&str, String)]) -> Result<Url, HttpError> {
        let mut url = self.homeserver();

        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| HttpError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?;
            path.pop_if_empty();
            path.extend(API_BASE.split('/'));
            path.extend(segments);
        }

        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        Ok(url)
    }

    /// Send a request to the client-server API and parse the JSON reply.
    ///
    /// Retriable failures are retried with exponential backoff for up to a
    /// minute before the last error is surfaced.
    pub async fn send_matrix(
        &self,
        method: Method,
        segments: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
        timeout: Duration,
    ) -> Result<Value, HttpError> {
        let url = self.api_url(segments, query)?;
        let token = self.access_token.read().unwrap().clone();

        trace!(%method, %url, "Sending a request to the homeserver");

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };

        let response = backoff::future::retry(policy, || async {
            let mut request = self
                .inner
                .request(method.clone(), url.clone())
                .timeout(timeout);

            if let Some(token) = &token {
                request = request.bearer_auth(token);
            }

            if let Some(body) = body {
                request = request.json(body);
            }

            let response = request
                .send()
                .await
                .map_err(|e| backoff::Error::transient(HttpError::Reqwest(e)))?;

            let status = response.status();

            if RETRIABLE_STATUS.contains(&status.as_u16()) {
                debug!(%status, %url, "Retrying a failed request");
                return Err(backoff::Error::transient(HttpError::Server(status)));
            }

            Ok(response)
        })
        .await?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(HttpError::Reqwest)?;

        let json: Value = if bytes.is_empty() {
            Value::Object(Default::default())
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };

        if status.is_success() {
            Ok(json)
        } else {
            Err(error_from_reply(status, &json))
        }
    }

    // Typed endpoint helpers.

    pub async fn login(&self, body: &Value) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["login"], &[], Some(body), REQUEST_TIMEOUT)
            .await
    }

    pub async fn logout(&self) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["logout"], &[], None, REQUEST_TIMEOUT)
            .await
    }

    pub async fn logout_all(&self) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["logout", "all"], &[], None, REQUEST_TIMEOUT)
            .await
    }

    pub async fn sync(&self, query: &[(&str, String)], server_timeout: Duration) -> Result<Value, HttpError> {
        self.send_matrix(
            Method::GET,
            &["sync"],
            query,
            None,
            server_timeout + SYNC_TIMEOUT_MARGIN,
        )
        .await
    }

    pub async fn keys_upload(&self, body: &Value) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["keys", "upload"], &[], Some(body), REQUEST_TIMEOUT)
            .await
    }

    pub async fn keys_query(&self, body: &Value) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["keys", "query"], &[], Some(body), REQUEST_TIMEOUT)
            .await
    }

    pub async fn keys_claim(&self, body: &Value) -> Result<Value, HttpError> {
        self.send_matrix(Method::POST, &["keys", "claim"], &[], Some(body), REQUEST_TIMEOUT)
            .await
    }

    pub async fn send_to_device(
        &self,
        event_type: &str,
        txn_id: &str,
        messages: &Value,
    ) -> Result<Value, HttpError> {
        let body = serde_json::json!({ "messages": messages });

        self.send_matrix(
            Method::PUT,
            &["sendToDevice", event_type, txn_id],
            &[],
            Some(&body),
            REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn send_room_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        txn_id: &str,
        content: &Value,
    ) -> Result<Value, HttpError> {
        self.send_matrix(
            Method::PUT,
            &["rooms", room_id.as_str(), "send", event_type, txn_id],
            &[],
            Some(content),
            REQUEST_TIMEOUT,
        )
        .await
    }

    pub async fn send_state_event(
        &self,
        room_id: &RoomId,
        event_type: &str,
        state_key: Option<&str>,
        content: &Value,
    ) -> Result<Value, HttpError> {
        let mut segments = vec!["rooms", room_id.as_str(), "state", event_type];
        if let Some(state_key) = state_key {
            segments.push(state_key);
        }

        self.send_matrix(Method::PUT, &segments, &[], Some(content), REQUEST_TIMEOUT)
            .await
    }

    /// Fetch older room messages, used to fill a timeline gap.
    pub async fn room_messages(
        &self,
        room_id: &RoomId,
        from: &str,
        limit: u32,
    ) -> Result<Value, HttpError> {
        let query = [
            ("from", from.to_owned()),
            ("dir", "b".to_owned()),
            ("limit", limit.to_string()),
        ];

        self.send_matrix(
            Method::GET,
            &["rooms", room_id.as_str(), "messages"],
            &query,
            None,
            REQUEST_TIMEOUT,
        )
        .await
    }
}

fn error_from_reply(status: StatusCode, json: &Value) -> HttpError {
    match json.get("errcode").and_then(Value::as_str) {
        Some(errcode) => HttpError::Matrix(MatrixError {
            errcode: errcode.to_owned(),
            message: json
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
            http_code: status,
        }),
        None => HttpError::Server(status),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;

    async fn client(server: &MockServer) -> HttpClient {
        HttpClient::new(Url::parse(&server.uri()).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn matrix_errors_are_typed() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/login"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "errcode": "M_FORBIDDEN",
                "error": "Invalid password",
            })))
            .mount(&server)
            .await;

        let client = client(&server).await;
        let error = client.login(&json!({})).await.unwrap_err();

        let matrix = assert_matches!(error, HttpError::Matrix(e) => e);
        assert_eq!(matrix.errcode, "M_FORBIDDEN");
        assert_eq!(matrix.http_code, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn retriable_status_is_retried() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/keys/upload"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/keys/upload"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "one_time_key_counts": {},
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server).await;
        let reply = client.keys_upload(&json!({})).await.unwrap();

        assert!(reply.get("one_time_key_counts").is_some());
    }

    #[tokio::test]
    async fn access_token_is_attached() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/_matrix/client/r0/logout"))
            .and(header("authorization", "Bearer syt_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&server).await;
        client.set_access_token(Some("syt_token".to_owned()));
        client.logout().await.unwrap();
    }
}
