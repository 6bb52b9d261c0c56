// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::HeaderMap;
use serde_json::json;

use super::{origin_allowed, reject_unauthorized};
use crate::channel::ChannelDescription;
use crate::test_support::{eventually, test_cable, test_connection, TestSocket};

// ── channel registration ──────────────────────────────────────────────────

#[tokio::test]
#[should_panic(expected = "already been registered")]
async fn duplicate_channel_registration_panics() {
    let cable = test_cable().await;
    cable.register_channel(ChannelDescription::new("RoomChannel"));
    cable.register_channel(ChannelDescription::new("RoomChannel"));
}

#[tokio::test]
#[should_panic(expected = "must not be empty")]
async fn empty_channel_name_panics() {
    let cable = test_cable().await;
    cable.register_channel(ChannelDescription::new(""));
}

// ── administrative broadcast ──────────────────────────────────────────────

#[tokio::test]
async fn broadcast_reaches_every_streaming_connection() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(
        ChannelDescription::new("RoomChannel")
            .on_subscribed(|ch| async move { ch.stream_from("room_1").await }),
    );

    let (conn1, socket1) = test_connection(&cable, Some(json!("user1")));
    let (conn2, socket2) = test_connection(&cable, Some(json!("user2")));
    conn1.setup().await;
    conn2.setup().await;

    let subscribe = r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}"}"#;
    socket1.client_send(subscribe).await;
    socket2.client_send(subscribe).await;

    cable.broadcast("RoomChannel", "room_1", &json!({"hello": "actioncable"})).await?;

    for socket in [&socket1, &socket2] {
        let delivered = eventually(|| {
            socket.last_sent().is_some_and(|m| m["message"]["hello"] == "actioncable")
        })
        .await;
        assert!(delivered, "both sockets should receive the administrative broadcast");
    }

    conn1.close("test complete").await;
    conn2.close("test complete").await;
    Ok(())
}

// ── shutdown ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn stop_closes_every_connection() -> anyhow::Result<()> {
    let cable = test_cable().await;
    let (conn1, socket1) = test_connection(&cable, None);
    let (conn2, _socket2) = test_connection(&cable, None);
    conn1.setup().await;
    conn2.setup().await;

    cable.stop().await;

    assert!(conn1.is_closed());
    assert!(conn2.is_closed());
    assert_eq!(cable.connection_count(), 0);
    let farewell = socket1.last_sent().expect("disconnect expected");
    assert_eq!(farewell["reason"], "server is shutdown.");
    Ok(())
}

// ── authentication ────────────────────────────────────────────────────────

#[tokio::test]
async fn unauthorized_sockets_get_disconnect_before_welcome() -> anyhow::Result<()> {
    let socket = TestSocket::new();
    reject_unauthorized(socket.as_ref()).await;

    let sent = socket.sent();
    assert_eq!(sent.len(), 1, "nothing but the disconnect may be sent");
    assert_eq!(
        sent[0],
        json!({"type": "disconnect", "reason": "unauthorized", "reconnect": false})
    );
    assert!(socket.is_closed());
    Ok(())
}

// ── origin allowlist ──────────────────────────────────────────────────────

fn headers_with_origin(origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("origin", origin.parse().expect("valid header"));
    headers
}

#[test]
fn empty_allowlist_permits_every_origin() {
    assert!(origin_allowed(&[], &headers_with_origin("https://evil.example")));
    assert!(origin_allowed(&[], &HeaderMap::new()));
}

#[test]
fn exact_host_must_match() {
    let allowed = vec!["app.example.com".to_owned()];
    assert!(origin_allowed(&allowed, &headers_with_origin("https://app.example.com")));
    assert!(origin_allowed(&allowed, &headers_with_origin("https://APP.EXAMPLE.COM")));
    assert!(!origin_allowed(&allowed, &headers_with_origin("https://other.example.com")));
    assert!(!origin_allowed(&allowed, &headers_with_origin("https://app.example.com.evil")));
}

#[test]
fn host_with_port_is_compared_including_the_port() {
    let allowed = vec!["localhost:3000".to_owned()];
    assert!(origin_allowed(&allowed, &headers_with_origin("http://localhost:3000")));
    assert!(!origin_allowed(&allowed, &headers_with_origin("http://localhost:4000")));
}

#[test]
fn star_entries_match_host_suffixes() {
    let allowed = vec!["*.example.com".to_owned()];
    assert!(origin_allowed(&allowed, &headers_with_origin("https://app.example.com")));
    assert!(origin_allowed(&allowed, &headers_with_origin("https://deep.app.example.com")));
    assert!(!origin_allowed(&allowed, &headers_with_origin("https://example.org")));
}

#[test]
fn missing_or_unparsable_origin_is_refused() {
    let allowed = vec!["app.example.com".to_owned()];
    assert!(!origin_allowed(&allowed, &HeaderMap::new()));
    assert!(!origin_allowed(&allowed, &headers_with_origin("not a url")));
}
