//! Websocket client for the realtime change feed.
//!
//! One background task owns the socket. Subscriptions are channels joined on
//! that socket; the task rejoins all of them after a reconnect.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use shared_proto::realtime::{
    ChangeFilter, Frame, JoinConfig, JoinPayload, PostgresChangesPayload, RowChange,
    EVENT_ACCESS_TOKEN, EVENT_CLOSE, EVENT_ERROR, EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE,
    EVENT_POSTGRES_CHANGES, EVENT_REPLY, PHOENIX_TOPIC,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{ChangeFeed, Subscription};
use crate::backoff::{Backoff, BackoffPolicy};
use crate::connectivity::Connectivity;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

enum Command {
    Join {
        topic: String,
        filter: ChangeFilter,
        tx: mpsc::UnboundedSender<RowChange>,
    },
    Leave {
        topic: String,
    },
    AccessToken(Option<String>),
}

struct Channel {
    filter: ChangeFilter,
    tx: mpsc::UnboundedSender<RowChange>,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

pub struct RealtimeClient {
    commands: mpsc::UnboundedSender<Command>,
    next_channel: AtomicU64,
    task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Spawns the connection task and returns immediately. Connection state
    /// is published through `connectivity`.
    pub fn connect(url: Url, access_token: Option<String>, connectivity: Connectivity) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(
            url,
            access_token,
            rx,
            connectivity,
            BackoffPolicy::default(),
        ));
        Self {
            commands,
            next_channel: AtomicU64::new(1),
            task,
        }
    }

    /// Replaces the token used to authorize channel joins.
    pub fn set_access_token(&self, token: Option<String>) {
        let _ = self.commands.send(Command::AccessToken(token));
    }
}

impl ChangeFeed for RealtimeClient {
    fn subscribe(&self, filter: ChangeFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let seq = self.next_channel.fetch_add(1, Ordering::Relaxed);
        let topic = format!("{}:{}", filter.topic(), seq);

        let _ = self.commands.send(Command::Join {
            topic: topic.clone(),
            filter,
            tx,
        });

        let commands = self.commands.clone();
        Subscription::new(
            rx,
            Some(Box::new(move || {
                let _ = commands.send(Command::Leave { topic });
            })),
        )
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    url: Url,
    mut access_token: Option<String>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connectivity: Connectivity,
    policy: BackoffPolicy,
) {
    let mut channels: HashMap<String, Channel> = HashMap::new();
    let refs = AtomicU64::new(1);
    let mut backoff = Backoff::new(policy);

    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                tracing::info!(component = "realtime", host = ?url.host_str(), "realtime connected");
                backoff.reset();
                connectivity.set_online(true);

                let end = drive(
                    ws,
                    &mut channels,
                    &mut commands,
                    &mut access_token,
                    &refs,
                )
                .await;

                connectivity.set_online(false);
                if matches!(end, SessionEnd::Shutdown) {
                    tracing::info!(component = "realtime", "realtime client stopped");
                    return;
                }
                tracing::warn!(component = "realtime", "realtime disconnected");
            }
            Err(err) => {
                connectivity.set_online(false);
                tracing::warn!(
                    component = "realtime",
                    attempts = backoff.failures(),
                    error = %err,
                    "realtime connect failed"
                );
            }
        }

        let delay = backoff.next_delay();
        tracing::debug!(component = "realtime", delay_ms = delay.as_millis() as u64, "reconnecting");

        // Keep the channel table current while offline so the rejoin is exact.
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => break,
                command = commands.recv() => match command {
                    Some(command) => {
                        apply_offline(command, &mut channels, &mut access_token);
                    }
                    None => return,
                },
            }
        }
    }
}

fn apply_offline(
    command: Command,
    channels: &mut HashMap<String, Channel>,
    access_token: &mut Option<String>,
) {
    match command {
        Command::Join { topic, filter, tx } => {
            channels.insert(topic, Channel { filter, tx });
        }
        Command::Leave { topic } => {
            channels.remove(&topic);
        }
        Command::AccessToken(token) => *access_token = token,
    }
}

async fn drive(
    ws: WsStream,
    channels: &mut HashMap<String, Channel>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
    access_token: &mut Option<String>,
    refs: &AtomicU64,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let next_ref = || refs.fetch_add(1, Ordering::Relaxed).to_string();

    for (topic, channel) in channels.iter() {
        let frame = join_frame(topic, &channel.filter, access_token.clone(), next_ref());
        if send_frame(&mut write, &frame).await.is_err() {
            return SessionEnd::Disconnected;
        }
    }

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let frame = Frame {
                    topic: PHOENIX_TOPIC.to_string(),
                    event: EVENT_HEARTBEAT.to_string(),
                    payload: json!({}),
                    reference: Some(next_ref()),
                };
                if send_frame(&mut write, &frame).await.is_err() {
                    return SessionEnd::Disconnected;
                }
            }
            command = commands.recv() => {
                let Some(command) = command else {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let frames = match command {
                    Command::Join { topic, filter, tx } => {
                        let frame = join_frame(&topic, &filter, access_token.clone(), next_ref());
                        channels.insert(topic, Channel { filter, tx });
                        vec![frame]
                    }
                    Command::Leave { topic } => {
                        channels.remove(&topic);
                        vec![leave_frame(&topic, next_ref())]
                    }
                    Command::AccessToken(token) => {
                        *access_token = token.clone();
                        channels
                            .keys()
                            .map(|topic| Frame {
                                topic: topic.clone(),
                                event: EVENT_ACCESS_TOKEN.to_string(),
                                payload: json!({ "access_token": token }),
                                reference: Some(next_ref()),
                            })
                            .collect()
                    }
                };
                for frame in frames {
                    if send_frame(&mut write, &frame).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let stale = dispatch(&text, channels);
                    for topic in stale {
                        channels.remove(&topic);
                        if send_frame(&mut write, &leave_frame(&topic, next_ref())).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                Some(Err(err)) => {
                    tracing::warn!(component = "realtime", error = %err, "websocket error");
                    return SessionEnd::Disconnected;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

/// Routes one inbound frame. Returns topics whose receivers are gone.
fn dispatch(text: &str, channels: &HashMap<String, Channel>) -> Vec<String> {
    let frame = match serde_json::from_str::<Frame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::warn!(component = "realtime", error = %err, "unreadable frame");
            return Vec::new();
        }
    };

    match frame.event.as_str() {
        EVENT_POSTGRES_CHANGES => {
            let Some(channel) = channels.get(&frame.topic) else {
                return Vec::new();
            };
            let change = match serde_json::from_value::<PostgresChangesPayload>(frame.payload) {
                Ok(payload) => payload.data,
                Err(err) => {
                    tracing::warn!(component = "realtime", topic = %frame.topic, error = %err, "unreadable change");
                    return Vec::new();
                }
            };
            if !channel.filter.matches(&change) {
                return Vec::new();
            }
            if channel.tx.send(change).is_err() {
                return vec![frame.topic];
            }
        }
        EVENT_REPLY => {
            let status = frame.payload.get("status").and_then(|s| s.as_str());
            if status == Some("error") {
                tracing::warn!(
                    component = "realtime",
                    topic = %frame.topic,
                    payload = %frame.payload,
                    "channel request rejected"
                );
            }
        }
        EVENT_ERROR | EVENT_CLOSE => {
            tracing::warn!(component = "realtime", topic = %frame.topic, event = %frame.event, "channel closed by server");
        }
        _ => {}
    }
    Vec::new()
}

fn join_frame(topic: &str, filter: &ChangeFilter, access_token: Option<String>, reference: String) -> Frame {
    let payload = JoinPayload {
        config: JoinConfig {
            postgres_changes: vec![filter.to_join_config()],
        },
        access_token,
    };
    Frame {
        topic: topic.to_string(),
        event: EVENT_JOIN.to_string(),
        payload: serde_json::to_value(payload).unwrap_or_default(),
        reference: Some(reference),
    }
}

fn leave_frame(topic: &str, reference: String) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: EVENT_LEAVE.to_string(),
        payload: json!({}),
        reference: Some(reference),
    }
}

async fn send_frame(write: &mut WsSink, frame: &Frame) -> Result<(), ()> {
    let text = serde_json::to_string(frame).map_err(|_| ())?;
    write.send(Message::Text(text)).await.map_err(|err| {
        tracing::warn!(component = "realtime", error = %err, "websocket send failed");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn channel_for(filter: ChangeFilter) -> (Channel, mpsc::UnboundedReceiver<RowChange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Channel { filter, tx }, rx)
    }

    fn changes_frame(topic: &str, record: Value) -> String {
        json!({
            "topic": topic,
            "event": "postgres_changes",
            "payload": { "data": { "type": "INSERT", "table": "comments", "record": record } },
            "ref": null
        })
        .to_string()
    }

    #[test]
    fn dispatch_routes_by_topic_and_filter() {
        let (channel, mut rx) = channel_for(ChangeFilter::table("comments").eq("post_id", "p1"));
        let mut channels = HashMap::new();
        channels.insert("realtime:comments:post_id:p1:1".to_string(), channel);

        let stale = dispatch(
            &changes_frame("realtime:comments:post_id:p1:1", json!({ "id": "c1", "post_id": "p1" })),
            &channels,
        );
        assert!(stale.is_empty());
        assert_eq!(rx.try_recv().expect("routed").record["id"], "c1");

        dispatch(
            &changes_frame("realtime:comments:post_id:p1:1", json!({ "id": "c2", "post_id": "p2" })),
            &channels,
        );
        assert!(rx.try_recv().is_err());

        dispatch(&changes_frame("realtime:other:9", json!({ "id": "c3" })), &channels);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn dispatch_reports_dropped_receivers() {
        let (channel, rx) = channel_for(ChangeFilter::table("comments"));
        drop(rx);
        let mut channels = HashMap::new();
        channels.insert("realtime:comments:4".to_string(), channel);

        let stale = dispatch(&changes_frame("realtime:comments:4", json!({ "id": "c1" })), &channels);
        assert_eq!(stale, vec!["realtime:comments:4".to_string()]);
    }

    #[test]
    fn join_frame_carries_filter_and_token() {
        let filter = ChangeFilter::table("messages").eq("receiver_id", "u1");
        let frame = join_frame("realtime:messages:receiver_id:u1:2", &filter, Some("jwt".into()), "7".into());
        let raw = serde_json::to_value(&frame).expect("serialize");

        assert_eq!(raw["event"], "phx_join");
        assert_eq!(raw["ref"], "7");
        assert_eq!(raw["payload"]["access_token"], "jwt");
        assert_eq!(
            raw["payload"]["config"]["postgres_changes"][0]["filter"],
            "receiver_id=eq.u1"
        );
    }

    #[test]
    fn offline_commands_update_channel_table() {
        let mut channels = HashMap::new();
        let mut token = None;
        let (tx, _rx) = mpsc::unbounded_channel();

        apply_offline(
            Command::Join {
                topic: "realtime:posts:1".into(),
                filter: ChangeFilter::table("posts"),
                tx,
            },
            &mut channels,
            &mut token,
        );
        apply_offline(Command::AccessToken(Some("t2".into())), &mut channels, &mut token);
        assert!(channels.contains_key("realtime:posts:1"));
        assert_eq!(token.as_deref(), Some("t2"));

        apply_offline(Command::Leave { topic: "realtime:posts:1".into() }, &mut channels, &mut token);
        assert!(channels.is_empty());
    }
}
