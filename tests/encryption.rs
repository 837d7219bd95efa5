//! End-to-end encrypted flows between two clients, with mocked
//! homeservers relaying the captured traffic.

mod common;

use matrix_mio::{
    crypto::VerificationError,
    events::{MessageContent, RoomContent},
    Client, SyncSettings,
};
use serde_json::{json, Value};
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

use common::{
    bodies_for, encryption_event, logged_in_client, member_event, sync_response,
    uploaded_device_keys, uploaded_one_time_keys,
};

const ROOM: &str = "!room:example.org";
const ALICE: &str = "@alice:example.org";
const BOB: &str = "@bob:example.org";

/// Mount the mocks the sender side of an encrypted room needs: the other
/// user's device keys, one of their one-time keys, and sinks for to-device
/// and room event sends.
async fn mock_encrypted_sending(
    server: &MockServer,
    peer_user: &str,
    peer_device: &str,
    peer_device_keys: Value,
    peer_one_time_keys: &serde_json::Map<String, Value>,
) {
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_keys": { peer_user: { peer_device: peer_device_keys } },
            "failures": {},
        })))
        .mount(server)
        .await;

    let (otk_id, otk) = peer_one_time_keys
        .iter()
        .next()
        .expect("the peer uploaded one-time keys");

    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "one_time_keys": { peer_user: { peer_device: { otk_id: otk } } },
            "failures": {},
        })))
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/sendToDevice/.*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(server)
        .await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/r0/rooms/.*/send/.*"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "event_id": "$sent:example.org",
        })))
        .mount(server)
        .await;
}

/// The Olm content the sender addressed to the given user, from the
/// captured `/sendToDevice` bodies.
async fn captured_to_device_contents(server: &MockServer, user: &str) -> Vec<Value> {
    bodies_for(server, "PUT", "/_matrix/client/r0/sendToDevice/m.room.encrypted/")
        .await
        .iter()
        .filter_map(|body| body["messages"][user].as_object().cloned())
        .filter_map(|devices| devices.values().next().cloned())
        .collect()
}

/// The encrypted room event contents the sender PUT to `/rooms/*/send`.
async fn captured_room_sends(server: &MockServer) -> Vec<Value> {
    bodies_for(server, "PUT", "/_matrix/client/r0/rooms/").await
}

#[tokio::test]
async fn encrypted_exchange_between_two_clients() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let alice = logged_in_client(&server_a, dir_a.path(), "alice", ALICE, "ALICEDEV").await;
    let bob = logged_in_client(&server_b, dir_b.path(), "bob", BOB, "BOBDEV").await;

    // What the clients published is what the "server" hands around.
    let alice_device_keys = uploaded_device_keys(&server_a).await;
    let bob_device_keys = uploaded_device_keys(&server_b).await;
    let bob_one_time_keys = uploaded_one_time_keys(&server_b).await;

    mock_encrypted_sending(&server_a, BOB, "BOBDEV", bob_device_keys, &bob_one_time_keys).await;

    // Alice learns about the encrypted room.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sync_response(
            ROOM,
            vec![
                member_event(ALICE, "join"),
                member_event(BOB, "join"),
                encryption_event(None),
            ],
            vec![],
            "a1",
        )))
        .mount(&server_a)
        .await;

    alice.sync_once(&SyncSettings::default()).await.unwrap();

    let room = alice.room(matrix_mio::room_id!("!room:example.org")).await.unwrap();
    assert!(room.state.is_encrypted());

    // Sending transparently encrypts and shares the session with Bob.
    let event_id = alice
        .send_message(
            matrix_mio::room_id!("!room:example.org"),
            MessageContent::text("hi bob"),
        )
        .await
        .unwrap();
    assert_eq!(event_id, "$sent:example.org");

    let room_keys = captured_to_device_contents(&server_a, BOB).await;
    assert_eq!(room_keys.len(), 1);

    let room_sends = captured_room_sends(&server_a).await;
    assert_eq!(room_sends.len(), 1);
    let encrypted_content = room_sends[0].clone();
    assert_eq!(encrypted_content["algorithm"], "m.megolm.v1.aes-sha2");
    assert_eq!(encrypted_content["device_id"], "ALICEDEV");

    // Bob's homeserver relays the captured traffic.
    Mock::given(method("POST"))
        .and(path("/_matrix/client/r0/keys/query"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_keys": { ALICE: { "ALICEDEV": alice_device_keys } },
            "failures": {},
        })))
        .mount(&server_b)
        .await;

    let mut bob_sync = sync_response(
        ROOM,
        vec![
            member_event(ALICE, "join"),
            member_event(BOB, "join"),
            encryption_event(None),
        ],
        vec![json!({
            "event_id": "$sent:example.org",
            "sender": ALICE,
            "origin_server_ts": 1_650_000_005_000u64,
            "type": "m.room.encrypted",
            "content": encrypted_content,
        })],
        "b1",
    );
    bob_sync["to_device"] = json!({
        "events": [{
            "sender": ALICE,
            "type": "m.room.encrypted",
            "content": room_keys[0],
        }],
    });

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(bob_sync))
        .mount(&server_b)
        .await;

    bob.sync_once(&SyncSettings::default()).await.unwrap();

    let room = bob.room(matrix_mio::room_id!("!room:example.org")).await.unwrap();
    let event = room
        .timeline
        .get(matrix_mio::event_id!("$sent:example.org"))
        .expect("the encrypted event was registered");

    // Decrypted, and annotated: Bob never made a trust decision about
    // Alice's device.
    match &event.content {
        RoomContent::Message(message) => assert_eq!(message.body, "hi bob"),
        other => panic!("the event should have decrypted, got {other:?}"),
    }

    let decryption = event.decryption.as_ref().expect("decryption info is attached");
    assert!(decryption.forward_chain.is_empty());
    assert_eq!(
        decryption.verification_errors,
        vec![VerificationError::MegolmFromUntrustedDevice {
            user_id: matrix_mio::user_id!("@alice:example.org").to_owned(),
            device_id: matrix_mio::device_id!("ALICEDEV").to_owned(),
        }]
    );

    // The decrypted event survives a restart from the stores.
    drop(bob);
    let restored = Client::restore(dir_b.path()).unwrap().unwrap();
    let room = restored
        .room(matrix_mio::room_id!("!room:example.org"))
        .await
        .unwrap();
    let event = room
        .timeline
        .get(matrix_mio::event_id!("$sent:example.org"))
        .unwrap();
    assert!(matches!(&event.content, RoomContent::Message(m) if m.body == "hi bob"));
}

#[tokio::test]
async fn group_sessions_rotate_by_message_count() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let alice = logged_in_client(&server_a, dir_a.path(), "alice", ALICE, "ALICEDEV").await;
    let _bob = logged_in_client(&server_b, dir_b.path(), "bob", BOB, "BOBDEV").await;

    let bob_device_keys = uploaded_device_keys(&server_b).await;
    let bob_one_time_keys = uploaded_one_time_keys(&server_b).await;
    mock_encrypted_sending(&server_a, BOB, "BOBDEV", bob_device_keys, &bob_one_time_keys).await;

    // The room rotates its session after every message.
    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sync_response(
            ROOM,
            vec![
                member_event(ALICE, "join"),
                member_event(BOB, "join"),
                encryption_event(Some(1)),
            ],
            vec![],
            "a1",
        )))
        .mount(&server_a)
        .await;

    alice.sync_once(&SyncSettings::default()).await.unwrap();

    let room_id = matrix_mio::room_id!("!room:example.org");
    alice.send_message(room_id, MessageContent::text("one")).await.unwrap();
    alice.send_message(room_id, MessageContent::text("two")).await.unwrap();

    let room_sends = captured_room_sends(&server_a).await;
    assert_eq!(room_sends.len(), 2);
    assert_ne!(
        room_sends[0]["session_id"], room_sends[1]["session_id"],
        "the second message must use a rotated session"
    );

    // Each session was shared with Bob's device separately.
    let shared = captured_to_device_contents(&server_a, BOB).await;
    assert_eq!(shared.len(), 2);
}

#[tokio::test]
async fn blocking_a_device_rotates_the_session_away_from_it() {
    let server_a = MockServer::start().await;
    let server_b = MockServer::start().await;
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let alice = logged_in_client(&server_a, dir_a.path(), "alice", ALICE, "ALICEDEV").await;
    let _bob = logged_in_client(&server_b, dir_b.path(), "bob", BOB, "BOBDEV").await;

    let bob_device_keys = uploaded_device_keys(&server_b).await;
    let bob_one_time_keys = uploaded_one_time_keys(&server_b).await;
    mock_encrypted_sending(&server_a, BOB, "BOBDEV", bob_device_keys, &bob_one_time_keys).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/r0/sync"))
        .respond_with(ResponseTemplate::new(200).set_body_json(sync_response(
            ROOM,
            vec![
                member_event(ALICE, "join"),
                member_event(BOB, "join"),
                encryption_event(None),
            ],
            vec![],
            "a1",
        )))
        .mount(&server_a)
        .await;

    alice.sync_once(&SyncSettings::default()).await.unwrap();

    let room_id = matrix_mio::room_id!("!room:example.org");
    alice.send_message(room_id, MessageContent::text("for everyone")).await.unwrap();

    assert_eq!(captured_to_device_contents(&server_a, BOB).await.len(), 1);

    // Blocking Bob's only device drops the session it received.
    alice
        .block_device(matrix_mio::user_id!("@bob:example.org"), matrix_mio::device_id!("BOBDEV"))
        .await
        .unwrap();
    assert_eq!(
        alice
            .device_trust(
                matrix_mio::user_id!("@bob:example.org"),
                matrix_mio::device_id!("BOBDEV"),
            )
            .await,
        Some(matrix_mio::crypto::TrustState::Blocked)
    );

    alice.send_message(room_id, MessageContent::text("not for bob")).await.unwrap();

    let room_sends = captured_room_sends(&server_a).await;
    assert_eq!(room_sends.len(), 2);
    assert_ne!(
        room_sends[0]["session_id"], room_sends[1]["session_id"],
        "blocking must force a session rotation"
    );

    // The rotated session was never offered to the blocked device.
    assert_eq!(captured_to_device_contents(&server_a, BOB).await.len(), 1);
}
