//! Shared helpers for the integration tests: a mocked homeserver login
//! flow and accessors for the requests a client sent.

use serde_json::{json, Map, Value};
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use matrix_mio::Client;

/// Mount the mocks a login needs: `/login` plus the two `/keys/upload`
/// calls (signed device keys, then the initial one-time keys).
pub async fn mock_login(server: &MockServer, user_id: &str, device_id: &str) {
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "user_id": user_id,
            "device_id": device_id,
            "access_token": format!("syt_{device_id}"),
        })))
        .mount(server)
        .await;

    // The device key upload reports an empty one-time key pool so the
    // client tops it up right away.
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_key_counts": { "signed_curve25519": 0 },
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/upload"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_key_counts": { "signed_curve25519": 50 },
        })))
        .mount(server)
        .await;
}

/// A client logged in against the given mock server.
pub async fn logged_in_client(
    server: &MockServer,
    base_dir: &std::path::Path,
    user: &str,
    user_id: &str,
    device_id: &str,
) -> Client {
    mock_login(server, user_id, device_id).await;

    let client = Client::new(Url::parse(&server.uri()).unwrap(), base_dir).unwrap();
    client.login_password(user, "secret").await.unwrap();
    client
}

/// The JSON bodies of every request matching the method and path prefix,
/// in arrival order.
pub async fn bodies_for(server: &MockServer, http_method: &str, path_prefix: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == http_method && r.url.path().starts_with(path_prefix))
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}

/// The signed `device_keys` object the client uploaded at login.
pub async fn uploaded_device_keys(server: &MockServer) -> Value {
    let uploads = bodies_for(server, "POST", "/_matrix/client/r0/keys/upload").await;

    uploads
        .iter()
        .find_map(|body| body.get("device_keys").cloned())
        .expect("the client uploaded its device keys")
}

/// The signed one-time keys the client uploaded at login.
pub async fn uploaded_one_time_keys(server: &MockServer) -> Map<String, Value> {
    let uploads = bodies_for(server, "POST", "/_matrix/client/r0/keys/upload").await;

    uploads
        .iter()
        .find_map(|body| body.get("one_time_keys").and_then(Value::as_object).cloned())
        .expect("the client uploaded one-time keys")
}

/// A joined-room sync response with the given state and timeline events.
pub fn sync_response(
    room_id: &str,
    state_events: Vec<Value>,
    timeline_events: Vec<Value>,
    next_batch: &str,
) -> Value {
    json!({
        "next_batch": next_batch,
        "rooms": {
            "join": {
                room_id: {
                    "state": { "events": state_events },
                    "timeline": { "events": timeline_events, "limited": false },
                },
            },
        },
    })
}

/// An `m.room.member` state event.
pub fn member_event(user_id: &str, membership: &str) -> Value {
    json!({
        "event_id": format!("$member-{}-{membership}:example.org", user_id.trim_start_matches('@').replace(':', "-")),
        "sender": user_id,
        "state_key": user_id,
        "origin_server_ts": 1_650_000_000_000u64,
        "type": "m.room.member",
        "content": { "membership": membership },
    })
}

/// An `m.room.encryption` state event, optionally with a message rotation
/// limit.
pub fn encryption_event(rotation_period_msgs: Option<u64>) -> Value {
    let mut content = json!({ "algorithm": "m.megolm.v1.aes-sha2" });

    if let Some(msgs) = rotation_period_msgs {
        content["rotation_period_msgs"] = msgs.into();
    }

    json!({
        "event_id": "$encryption:example.org",
        "sender": "@alice:example.org",
        "state_key": "",
        "origin_server_ts": 1_650_000_000_000u64,
        "type": "m.room.encryption",
        "content": content,
    })
}
