// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use super::ChannelDescription;
use crate::test_support::{eventually, test_cable, test_connection};

fn room_stream(params: &Value) -> String {
    format!("room_{}", params.get("id").and_then(Value::as_u64).unwrap_or(0))
}

fn room_channel() -> ChannelDescription {
    ChannelDescription::new("RoomChannel")
        .on_subscribed(|ch| async move {
            let room = room_stream(ch.params());
            ch.stream_from(&room).await;
        })
        .on_perform_action(|ch, data| async move {
            #[derive(Deserialize)]
            struct Action {
                #[serde(default)]
                action: String,
            }
            let action: Action = serde_json::from_str(&data).unwrap_or(Action { action: String::new() });
            if action.action == "run" {
                ch.stop_all_streams().await;
            }
        })
}

#[tokio::test]
async fn stream_from_and_stop_all_streams() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(room_channel());

    let (conn, socket) = test_connection(&cable, Some(json!("test")));
    conn.setup().await;

    socket
        .client_send(r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}"}"#)
        .await;

    let confirm = socket.last_sent().expect("confirmation expected");
    assert_eq!(confirm["type"], "confirm_subscription");
    assert_eq!(confirm["identifier"], r#"{"channel":"RoomChannel","id":1}"#);

    let channel = conn
        .find_channel("RoomChannel", r#"{"channel":"RoomChannel","id":1}"#)
        .expect("channel should be installed");
    assert_eq!(channel.streams(), vec!["room_1".to_owned()]);

    socket
        .client_send(
            r#"{"command":"message", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}", "data":"{\"action\":\"run\"}"}"#,
        )
        .await;
    assert!(channel.streams().is_empty(), "run action should stop every stream");

    conn.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn rejection_detaches_and_allows_later_subscriptions() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(ChannelDescription::new("RoomChannel").on_subscribed(
        |ch| async move {
            let private = ch.params().get("name").and_then(Value::as_str) == Some("private");
            if private {
                ch.reject();
            }
        },
    ));

    let (conn, socket) = test_connection(&cable, Some(json!("test")));
    conn.setup().await;

    socket
        .client_send(
            r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"name\":\"private\"}"}"#,
        )
        .await;

    let reply = socket.last_sent().expect("rejection expected");
    assert_eq!(reply["type"], "reject_subscription");
    assert_eq!(reply["identifier"], r#"{"channel":"RoomChannel","name":"private"}"#);
    assert_eq!(conn.channel_count(), 0, "rejected channel must not be installed");

    socket
        .client_send(
            r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"name\":\"normal\"}"}"#,
        )
        .await;

    let reply = socket.last_sent().expect("confirmation expected");
    assert_eq!(reply["type"], "confirm_subscription");

    conn.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn rejected_channel_ignores_stream_from() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(ChannelDescription::new("RoomChannel").on_subscribed(
        |ch| async move {
            ch.reject();
            // Raced in after the rejection: must be a no-op.
            ch.stream_from("room_1").await;
        },
    ));

    let (conn, socket) = test_connection(&cable, None);
    conn.setup().await;

    socket
        .client_send(r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\"}"}"#)
        .await;

    let reply = socket.last_sent().expect("rejection expected");
    assert_eq!(reply["type"], "reject_subscription");

    let sent = socket.sent();
    assert!(
        sent.iter().all(|m| m["type"] != "confirm_subscription"),
        "a rejected channel must never confirm"
    );

    conn.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn confirmation_is_emitted_exactly_once() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(ChannelDescription::new("RoomChannel").on_subscribed(
        |ch| async move {
            // Two streams plus the subscribe handler all race to confirm.
            ch.stream_from("room_a").await;
            ch.stream_from("room_b").await;
        },
    ));

    let (conn, socket) = test_connection(&cable, None);
    conn.setup().await;

    socket
        .client_send(r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\"}"}"#)
        .await;

    let confirmations = socket
        .sent()
        .iter()
        .filter(|m| m["type"] == "confirm_subscription")
        .count();
    assert_eq!(confirmations, 1);

    conn.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn broadcast_reaches_every_streaming_connection() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(
        ChannelDescription::new("RoomChannel")
            .on_subscribed(|ch| async move {
                let room = room_stream(ch.params());
                ch.stream_from(&room).await;
            })
            .on_perform_action(|ch, data| async move {
                #[derive(Deserialize)]
                struct Action {
                    #[serde(default)]
                    action: String,
                    #[serde(default)]
                    message: String,
                }
                let Ok(action) = serde_json::from_str::<Action>(&data) else { return };
                if action.action == "send_message" {
                    let sent_by = ch
                        .connection_identity()
                        .cloned()
                        .unwrap_or(Value::String("anonymous".to_owned()));
                    let _ = ch
                        .broadcast(
                            &room_stream(ch.params()),
                            &json!({"sendBy": sent_by, "message": action.message}),
                        )
                        .await;
                }
            }),
    );

    let (conn1, socket1) = test_connection(&cable, Some(json!("user1")));
    let (conn2, socket2) = test_connection(&cable, Some(json!("user2")));
    conn1.setup().await;
    conn2.setup().await;

    let subscribe =
        r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}"}"#;
    socket1.client_send(subscribe).await;
    socket2.client_send(subscribe).await;

    socket1
        .client_send(
            r#"{"command":"message", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}", "data":"{\"action\":\"send_message\", \"message\":\"Hello Actioncable!\"}"}"#,
        )
        .await;

    for socket in [&socket1, &socket2] {
        let delivered = eventually(|| {
            socket
                .last_sent()
                .is_some_and(|m| m["message"]["message"] == "Hello Actioncable!")
        })
        .await;
        assert!(delivered, "both subscribers should receive the broadcast");
        let message = socket.last_sent().expect("message expected");
        assert_eq!(message["identifier"], r#"{"channel":"RoomChannel","id":1}"#);
        assert_eq!(message["message"]["sendBy"], "user1");
    }

    conn1.close("test complete").await;
    conn2.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_clears_connection_map_and_broker() -> anyhow::Result<()> {
    let cable = test_cable().await;
    cable.register_channel(room_channel());

    let (conn, socket) = test_connection(&cable, None);
    conn.setup().await;

    socket
        .client_send(r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}"}"#)
        .await;
    assert_eq!(conn.channel_count(), 1);

    socket
        .client_send(r#"{"command":"unsubscribe", "identifier":"{\"channel\":\"RoomChannel\",\"id\":1}"}"#)
        .await;
    assert_eq!(conn.channel_count(), 0);

    // A broadcast to the abandoned stream reaches nobody.
    cable.broadcast("RoomChannel", "room_1", &json!({"hello": "nobody"})).await?;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(socket.sent().iter().all(|m| m.get("message").is_none()));

    conn.close("test complete").await;
    Ok(())
}

#[tokio::test]
async fn unsubscribed_hook_runs_on_teardown() -> anyhow::Result<()> {
    let unsubscribed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&unsubscribed);

    let cable = test_cable().await;
    cable.register_channel(
        ChannelDescription::new("RoomChannel")
            .on_subscribed(|ch| async move { ch.stream_from("room_1").await })
            .on_unsubscribed(move |ch| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(ch.identifier().to_owned());
                }
            }),
    );

    let (conn, socket) = test_connection(&cable, None);
    conn.setup().await;

    socket
        .client_send(r#"{"command":"subscribe", "identifier":"{\"channel\":\"RoomChannel\"}"}"#)
        .await;
    socket
        .client_send(r#"{"command":"unsubscribe", "identifier":"{\"channel\":\"RoomChannel\"}"}"#)
        .await;

    assert_eq!(
        unsubscribed.lock().unwrap().as_slice(),
        [r#"{"channel":"RoomChannel"}"#.to_owned()].as_slice()
    );

    conn.close("test complete").await;
    Ok(())
}
