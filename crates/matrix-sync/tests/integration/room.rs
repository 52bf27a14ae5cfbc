use std::{collections::BTreeSet, sync::Arc, time::Duration};

use assert_matches2::assert_matches;
use matrix_sync::{Client, Error, HttpError, config::SyncSettings, crypto::CryptoError};
use matrix_sync_base::test_utils::{EngineCall, FakeCryptoEngine, raw};
use matrix_sync_test::{
    ALICE, BOB, CAROL, EventFactory, JoinedRoomBuilder, SyncResponseBuilder, test_json,
};
use ruma::{OwnedUserId, RoomId, room_id, user_id};
use serde_json::{Value as JsonValue, json};
use tokio::time::sleep;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, path_regex},
};

use crate::{logged_in_client, mock_sync};

fn room() -> &'static RoomId {
    room_id!("!r:x")
}

fn own_user() -> OwnedUserId {
    user_id!("@example:localhost").to_owned()
}

/// The member events of the test room: us and Bob joined, Carol invited.
fn members(f: &EventFactory) -> Vec<JsonValue> {
    vec![f.member(&own_user(), "join"), f.member(&BOB, "join"), f.member(&CAROL, "invite")]
}

/// Sync the test room, encrypted if `encrypted` is set.
async fn sync_room(
    client: &Client,
    server: &MockServer,
    encrypted: bool,
    history_visibility: Option<&str>,
) {
    let f = EventFactory::new();

    let mut room = JoinedRoomBuilder::new(room())
        .add_state_event(f.create(&ALICE, "11"))
        .add_state_bulk(members(&f));
    if encrypted {
        room = room.add_state_event(f.room_encryption());
    }
    if let Some(visibility) = history_visibility {
        room = room.add_state_event(f.history_visibility(visibility));
    }

    let mut builder = SyncResponseBuilder::new();
    builder.set_next_batch("s1").add_joined_room(room);
    mock_sync(server, builder.build_json_sync_response(), None).await;

    client.sync_once(SyncSettings::default()).await.unwrap();
}

/// Mount the endpoints an encrypted send talks to, except the room key
/// share.
async fn mock_encrypted_send(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/rooms/!r:x/members"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "chunk": members(&EventFactory::new()) })),
        )
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/rooms/!r:x/state/m.room.history_visibility/"))
        .respond_with(ResponseTemplate::new(404).set_body_json(&*test_json::NOT_FOUND))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/_matrix/client/v3/keys/claim"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::KEYS_CLAIM))
        .mount(server)
        .await;
}

async fn mock_room_key_share(server: &MockServer, expected: u64) {
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/sendToDevice/m\.room\.encrypted/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EMPTY))
        .expect(expected)
        .mount(server)
        .await;
}

async fn mock_send_encrypted(server: &MockServer, expected: u64) {
    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/!r:x/send/m\.room\.encrypted/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EVENT_ID))
        .expect(expected)
        .mount(server)
        .await;
}

fn share_calls(engine: &FakeCryptoEngine) -> Vec<BTreeSet<OwnedUserId>> {
    engine
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            EngineCall::ShareRoomKey(_, users) => Some(users.into_iter().collect()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_send_to_a_plain_room() {
    let (client, server) = logged_in_client(None).await;
    sync_room(&client, &server, false, None).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/rooms/!r:x/send/m\.room\.message/.+$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&*test_json::EVENT_ID))
        .expect(1)
        .mount(&server)
        .await;

    let event_id = client
        .send_message_event(room(), "m.room.message", json!({ "msgtype": "m.text", "body": "hi" }))
        .await
        .unwrap();

    assert_eq!(event_id.as_str(), "$h29iv0s8:example.com");
}

#[tokio::test]
async fn test_send_to_an_unknown_room() {
    let (client, _server) = logged_in_client(None).await;

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();
    assert_matches!(error, Error::UnknownRoom(room_id));
    assert_eq!(room_id, room());
}

#[tokio::test]
async fn test_encrypted_room_needs_an_engine() {
    let (client, server) = logged_in_client(None).await;
    sync_room(&client, &server, true, None).await;

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();
    assert_matches!(error, Error::NoCryptoEngine);
}

#[tokio::test]
async fn test_encrypted_send() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 1).await;
    mock_send_encrypted(&server, 1).await;

    let content = json!({ "msgtype": "m.text", "body": "It's a secret to everybody" });
    let calls_before = engine.calls().len();

    let event_id =
        client.send_message_event(room(), "m.room.message", content.clone()).await.unwrap();
    assert_eq!(event_id.as_str(), "$h29iv0s8:example.com");

    assert!(client.get_room(room()).unwrap().are_members_synced());

    // Claim the missing sessions, share the room key, then encrypt.
    let calls: Vec<_> = engine.calls().split_off(calls_before);
    let claim = calls
        .iter()
        .position(|c| matches!(c, EngineCall::GetMissingSessions(u) if !u.is_empty()))
        .unwrap();
    let share = calls.iter().position(|c| matches!(c, EngineCall::ShareRoomKey(..))).unwrap();
    let encrypt = calls.iter().position(|c| matches!(c, EngineCall::Encrypt(..))).unwrap();
    assert!(claim < share && share < encrypt);

    // History is shared, so invited members get the key too.
    let expected: BTreeSet<_> = [own_user(), BOB.to_owned(), CAROL.to_owned()].into();
    assert_eq!(share_calls(&engine), vec![expected]);

    let sent = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.url.path().contains("/send/m.room.encrypted/"))
        .unwrap();
    let body: JsonValue = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["algorithm"], "m.megolm.v1.aes-sha2");
    assert_eq!(
        body["ciphertext"],
        FakeCryptoEngine::fake_ciphertext("m.room.message", &content).as_str()
    );
}

#[tokio::test]
async fn test_invited_members_are_skipped_for_joined_history() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;

    sync_room(&client, &server, true, Some("joined")).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 1).await;
    mock_send_encrypted(&server, 1).await;

    client.send_message_event(room(), "m.room.message", json!({ "body": "hi" })).await.unwrap();

    let expected: BTreeSet<_> = [own_user(), BOB.to_owned()].into();
    assert_eq!(share_calls(&engine), vec![expected]);
}

#[tokio::test]
async fn test_leaving_member_gets_no_new_room_key() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 2).await;
    mock_send_encrypted(&server, 2).await;

    client.send_message_event(room(), "m.room.message", json!({ "body": "one" })).await.unwrap();
    assert!(engine.has_group_session(room()));

    // Bob leaves.
    let mut leave = EventFactory::new().sender(&BOB).member(&BOB, "leave");
    leave["event_id"] = json!("$bob_leaves:server.name");

    let mut builder = SyncResponseBuilder::new();
    builder
        .set_next_batch("s2")
        .add_joined_room(JoinedRoomBuilder::new(room()).add_timeline_event(leave));
    mock_sync(&server, builder.build_json_sync_response(), Some("s1")).await;
    client.sync_once(SyncSettings::default()).await.unwrap();

    assert!(engine.calls().contains(&EngineCall::DiscardRoomKey(room().to_owned())));
    assert!(!engine.has_group_session(room()));

    client.send_message_event(room(), "m.room.message", json!({ "body": "two" })).await.unwrap();

    // A fresh room key was shared, without Bob.
    let shares = share_calls(&engine);
    assert_eq!(shares.len(), 2);
    assert!(!shares[1].contains(&BOB.to_owned()));
    assert!(shares[1].contains(&own_user()));
}

#[tokio::test]
async fn test_send_racing_a_leave_waits_for_the_new_member_list() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, Some("shared")).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 2).await;
    mock_send_encrypted(&server, 2).await;

    client.send_message_event(room(), "m.room.message", json!({ "body": "one" })).await.unwrap();

    let mut leave = EventFactory::new().sender(&BOB).member(&BOB, "leave");
    leave["event_id"] = json!("$bob_leaves:server.name");

    let mut builder = SyncResponseBuilder::new();
    builder
        .set_next_batch("s2")
        .add_joined_room(JoinedRoomBuilder::new(room()).add_timeline_event(leave));
    mock_sync(&server, builder.build_json_sync_response(), Some("s1")).await;

    let pause = engine.pause_discards();

    let sync = tokio::spawn({
        let client = client.clone();
        async move { client.sync_once(SyncSettings::default()).await }
    });

    // The sync is discarding the room key, queue a send behind it.
    pause.reached.notified().await;

    let send = tokio::spawn({
        let client = client.clone();
        async move {
            client.send_message_event(room(), "m.room.message", json!({ "body": "two" })).await
        }
    });

    sleep(Duration::from_millis(50)).await;
    pause.release.notify_one();

    sync.await.unwrap().unwrap();
    send.await.unwrap().unwrap();

    let calls = engine.calls();
    let discard = calls.iter().position(|c| matches!(c, EngineCall::DiscardRoomKey(_))).unwrap();
    let last_share = calls.iter().rposition(|c| matches!(c, EngineCall::ShareRoomKey(..))).unwrap();
    assert!(discard < last_share);

    let shares = share_calls(&engine);
    assert_eq!(shares.len(), 2);
    assert!(shares[0].contains(&BOB.to_owned()));
    assert!(!shares[1].contains(&BOB.to_owned()));
    assert!(shares[1].contains(&own_user()));
}

#[tokio::test]
async fn test_failed_room_key_share_discards_the_key() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    mock_encrypted_send(&server).await;
    mock_send_encrypted(&server, 0).await;

    Mock::given(method("PUT"))
        .and(path_regex(r"^/_matrix/client/v3/sendToDevice/m\.room\.encrypted/.+$"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errcode": "M_UNKNOWN",
            "error": "Oops",
        })))
        .mount(&server)
        .await;

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();

    assert_matches!(error, Error::Http(HttpError::Api(_)));
    assert!(engine.calls().contains(&EngineCall::DiscardRoomKey(room().to_owned())));
    assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::Encrypt(..))));
}

#[tokio::test]
async fn test_undetermined_history_visibility_fails_the_send() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/rooms/!r:x/members"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "chunk": [] })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/_matrix/client/v3/rooms/!r:x/state/m.room.history_visibility/"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "errcode": "M_UNKNOWN",
            "error": "Oops",
        })))
        .mount(&server)
        .await;

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();

    assert_matches!(error, Error::UndeterminedHistoryVisibility);
    assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::ShareRoomKey(..))));
}

#[tokio::test]
async fn test_unknown_history_visibility_fails_the_send() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, Some("shared")).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 0).await;
    mock_send_encrypted(&server, 0).await;

    let mut visibility = EventFactory::new().history_visibility("org.example.members_only");
    visibility["event_id"] = json!("$members_only:server.name");
    let mut builder = SyncResponseBuilder::new();
    builder
        .set_next_batch("s2")
        .add_joined_room(JoinedRoomBuilder::new(room()).add_timeline_event(visibility));
    mock_sync(&server, builder.build_json_sync_response(), Some("s1")).await;
    client.sync_once(SyncSettings::default()).await.unwrap();

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();

    assert_matches!(error, Error::UndeterminedHistoryVisibility);
    assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::ShareRoomKey(..))));
}

#[tokio::test]
async fn test_encryption_failure_is_returned() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    mock_encrypted_send(&server).await;
    mock_room_key_share(&server, 1).await;
    mock_send_encrypted(&server, 0).await;

    engine.fail_encryption(true);

    let error = client.send_message_event(room(), "m.room.message", json!({})).await.unwrap_err();
    assert_matches!(error, Error::Crypto(CryptoError::Encryption(_)));
}

fn encrypted_event(content: &JsonValue) -> JsonValue {
    EventFactory::new()
        .sender(&BOB)
        .encrypted(&FakeCryptoEngine::fake_ciphertext("m.room.message", content))
}

#[tokio::test]
async fn test_decrypt_event() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    let content = json!({ "msgtype": "m.text", "body": "It's a secret to everybody" });
    let encrypted = encrypted_event(&content);

    let decrypted = client.decrypt_message_event(room(), &raw(encrypted.clone())).await.unwrap();

    let event: JsonValue = serde_json::from_str(decrypted.event.json().get()).unwrap();
    assert_eq!(event["type"], "m.room.message");
    assert_eq!(event["content"], content);
    assert_eq!(event["event_id"], encrypted["event_id"]);
    assert_eq!(event["sender"], encrypted["sender"]);
    assert_eq!(event["origin_server_ts"], encrypted["origin_server_ts"]);
    assert!(event.get("state_key").is_none());

    let info = decrypted.encryption_info.unwrap();
    assert_eq!(info.sender_curve25519_key, "WVZBVbMuBiCGS6XT6MuASBG4bjqSmp5Lh29Glvlbm3U");
    assert_eq!(info.sender.as_deref(), Some(*BOB));
    assert_eq!(info.sender_device.as_ref().map(|d| d.as_str()), Some("NFPHCMHFBA"));
}

#[tokio::test]
async fn test_decryption_failure_is_visible() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    engine.fail_decryption(true);

    let event = raw(encrypted_event(&json!({ "body": "secret" })));
    let error = client.decrypt_message_event(room(), &event).await.unwrap_err();

    assert_matches!(error, Error::Decryption(CryptoError::Decryption(_)));
}

#[tokio::test]
async fn test_plain_events_are_not_decrypted() {
    let engine = Arc::new(FakeCryptoEngine::new());
    let (client, server) = logged_in_client(Some(engine.clone())).await;
    sync_room(&client, &server, true, None).await;

    let event = EventFactory::new().message_like("m.room.message", json!({ "body": "hi" }));
    let result = client.decrypt_message_event(room(), &raw(event.clone())).await.unwrap();

    assert!(result.encryption_info.is_none());
    assert_eq!(serde_json::from_str::<JsonValue>(result.event.json().get()).unwrap(), event);
    assert!(!engine.calls().iter().any(|c| matches!(c, EngineCall::DecryptRoomEvent(_))));
}
