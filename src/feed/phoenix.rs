use super::models::{ChangeEvent, ChangePayload, ChannelStatus, EventSpec};
use super::transport::{ChangeFeedTransport, PayloadHandler, StatusHandler, TransportHandle};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const PROTOCOL_VERSION: &str = "1.0.0";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

/// `payload.data` of a `postgres_changes` frame.
#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(alias = "eventType")]
    r#type: ChangeEvent,
    schema: String,
    table: String,
    #[serde(default, alias = "new")]
    record: Value,
    #[serde(default, alias = "old")]
    old_record: Value,
    #[serde(default)]
    commit_timestamp: Option<String>,
}

impl From<ChangeData> for ChangePayload {
    fn from(data: ChangeData) -> Self {
        let commit_timestamp = data
            .commit_timestamp
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc));
        ChangePayload {
            event_type: data.r#type,
            schema: data.schema,
            table: data.table,
            new: data.record,
            old: data.old_record,
            commit_timestamp,
        }
    }
}

enum Command {
    Join {
        handle: TransportHandle,
        topic: String,
        spec: EventSpec,
        on_change: PayloadHandler,
        on_status: StatusHandler,
    },
    Leave {
        handle: TransportHandle,
    },
}

struct Joined {
    topic: String,
    join_ref: Option<String>,
    spec: EventSpec,
    on_change: PayloadHandler,
    on_status: StatusHandler,
    acked: bool,
}

/// Change-feed transport over a single Phoenix-channels WebSocket (the
/// protocol spoken by Supabase-style realtime services).
///
/// A background task owns the socket. It connects lazily on the first join,
/// heartbeats while connected, and on any socket failure reports
/// CHANNEL_ERROR to every channel and forgets them; callers resubscribe.
pub struct PhoenixTransport {
    commands: mpsc::UnboundedSender<Command>,
    next_handle: AtomicU64,
}

impl PhoenixTransport {
    /// Spawns the connection task. Must be called within a Tokio runtime.
    pub fn connect(endpoint: &str, api_key: &str) -> Self {
        let url = socket_url(endpoint, api_key);
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(connection_task(rx, url, api_key.to_string()));
        Self {
            commands,
            next_handle: AtomicU64::new(1),
        }
    }
}

pub fn socket_url(endpoint: &str, api_key: &str) -> String {
    format!(
        "{}/websocket?apikey={}&vsn={}",
        endpoint.trim_end_matches('/'),
        api_key,
        PROTOCOL_VERSION
    )
}

pub fn topic_for(channel_name: &str) -> String {
    format!("realtime:{channel_name}")
}

impl ChangeFeedTransport for PhoenixTransport {
    fn subscribe(
        &self,
        channel_name: &str,
        spec: &EventSpec,
        on_change: PayloadHandler,
        on_status: StatusHandler,
    ) -> TransportHandle {
        let handle = TransportHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let command = Command::Join {
            handle,
            topic: topic_for(channel_name),
            spec: spec.clone(),
            on_change,
            on_status,
        };
        if let Err(mpsc::error::SendError(Command::Join { on_status, .. })) =
            self.commands.send(command)
        {
            warn!(channel = %channel_name, "realtime connection task is gone");
            on_status(ChannelStatus::ChannelError);
        }
        handle
    }

    fn remove_channel(&self, handle: TransportHandle) {
        let _ = self.commands.send(Command::Leave { handle });
    }
}

struct Connection {
    api_key: String,
    channels: HashMap<TransportHandle, Joined>,
    next_ref: u64,
}

impl Connection {
    fn new(api_key: String) -> Self {
        Self {
            api_key,
            channels: HashMap::new(),
            next_ref: 0,
        }
    }

    fn make_ref(&mut self) -> String {
        self.next_ref += 1;
        self.next_ref.to_string()
    }

    fn join_frame(&mut self, handle: TransportHandle) -> Option<Frame> {
        let join_ref = self.make_ref();
        let api_key = self.api_key.clone();
        let channel = self.channels.get_mut(&handle)?;
        channel.join_ref = Some(join_ref.clone());
        Some(Frame {
            topic: channel.topic.clone(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "ack": false, "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [channel.spec],
                },
                "access_token": api_key,
            }),
            msg_ref: Some(join_ref.clone()),
            join_ref: Some(join_ref),
        })
    }

    fn heartbeat_frame(&mut self) -> Frame {
        Frame {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(self.make_ref()),
            join_ref: None,
        }
    }

    fn insert(&mut self, command: Command) -> Option<TransportHandle> {
        match command {
            Command::Join {
                handle,
                topic,
                spec,
                on_change,
                on_status,
            } => {
                self.channels.insert(
                    handle,
                    Joined {
                        topic,
                        join_ref: None,
                        spec,
                        on_change,
                        on_status,
                        acked: false,
                    },
                );
                Some(handle)
            }
            Command::Leave { handle } => {
                self.channels.remove(&handle);
                None
            }
        }
    }

    async fn join_all(&mut self, ws: &mut Socket) -> Result<(), tungstenite::Error> {
        let pending: Vec<TransportHandle> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.join_ref.is_none())
            .map(|(handle, _)| *handle)
            .collect();
        for handle in pending {
            if let Some(frame) = self.join_frame(handle) {
                send(ws, &frame).await?;
            }
        }
        Ok(())
    }

    async fn apply(&mut self, command: Command, ws: &mut Socket) -> Result<(), tungstenite::Error> {
        match command {
            Command::Leave { handle } => {
                if let Some(channel) = self.channels.remove(&handle) {
                    let frame = Frame {
                        topic: channel.topic,
                        event: "phx_leave".to_string(),
                        payload: json!({}),
                        msg_ref: Some(self.make_ref()),
                        join_ref: channel.join_ref,
                    };
                    send(ws, &frame).await?;
                }
                Ok(())
            }
            join => {
                if let Some(handle) = self.insert(join) {
                    if let Some(frame) = self.join_frame(handle) {
                        send(ws, &frame).await?;
                    }
                }
                Ok(())
            }
        }
    }

    fn fail_all(&mut self) {
        for (_, channel) in self.channels.drain() {
            (channel.on_status)(ChannelStatus::ChannelError);
        }
    }

    fn remove_topic(&mut self, topic: &str, status: ChannelStatus) {
        let handles: Vec<TransportHandle> = self
            .channels
            .iter()
            .filter(|(_, channel)| channel.topic == topic)
            .map(|(handle, _)| *handle)
            .collect();
        for handle in handles {
            if let Some(channel) = self.channels.remove(&handle) {
                (channel.on_status)(status);
            }
        }
    }

    fn handle_text(&mut self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "undecodable realtime frame");
                return;
            }
        };

        match frame.event.as_str() {
            "phx_reply" => self.handle_reply(&frame),
            "postgres_changes" => self.handle_change(&frame),
            "phx_error" => self.remove_topic(&frame.topic, ChannelStatus::ChannelError),
            "phx_close" => self.remove_topic(&frame.topic, ChannelStatus::Closed),
            "system" => {
                if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                    warn!(topic = %frame.topic, payload = %frame.payload, "realtime system error");
                    self.remove_topic(&frame.topic, ChannelStatus::ChannelError);
                }
            }
            other => debug!(topic = %frame.topic, event = %other, "ignoring realtime frame"),
        }
    }

    fn handle_reply(&mut self, frame: &Frame) {
        let Some(msg_ref) = frame.msg_ref.as_deref() else {
            return;
        };
        let Some((handle, _)) = self
            .channels
            .iter()
            .find(|(_, channel)| !channel.acked && channel.join_ref.as_deref() == Some(msg_ref))
        else {
            return;
        };
        let handle = *handle;

        let ok = frame.payload.get("status").and_then(Value::as_str) == Some("ok");
        if ok {
            if let Some(channel) = self.channels.get_mut(&handle) {
                channel.acked = true;
                (channel.on_status)(ChannelStatus::Subscribed);
            }
        } else if let Some(channel) = self.channels.remove(&handle) {
            warn!(topic = %channel.topic, response = %frame.payload, "join rejected");
            (channel.on_status)(ChannelStatus::ChannelError);
        }
    }

    fn handle_change(&mut self, frame: &Frame) {
        let Some(data) = frame.payload.get("data") else {
            return;
        };
        let payload: ChangePayload = match serde_json::from_value::<ChangeData>(data.clone()) {
            Ok(data) => data.into(),
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "undecodable change payload");
                return;
            }
        };
        let targets: Vec<PayloadHandler> = self
            .channels
            .values()
            .filter(|channel| {
                channel.acked
                    && channel.topic == frame.topic
                    && channel.spec.event.accepts(payload.event_type)
            })
            .map(|channel| channel.on_change.clone())
            .collect();
        for handler in targets {
            handler(payload.clone());
        }
    }
}

async fn send(ws: &mut Socket, frame: &Frame) -> Result<(), tungstenite::Error> {
    let text = serde_json::to_string(frame).map_err(|e| {
        tungstenite::Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;
    ws.send(Message::Text(text)).await
}

enum Wake {
    Command(Option<Command>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    Heartbeat,
}

fn heartbeat_timer() -> Interval {
    let mut timer = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    timer
}

async fn connection_task(mut commands: mpsc::UnboundedReceiver<Command>, url: String, api_key: String) {
    let mut conn = Connection::new(api_key);
    let mut socket: Option<Socket> = None;
    let mut heartbeat = heartbeat_timer();

    loop {
        if socket.is_none() {
            let Some(command) = commands.recv().await else {
                return;
            };
            conn.insert(command);
            if conn.channels.is_empty() {
                continue;
            }
            match connect_async(url.as_str()).await {
                Ok((mut ws, _)) => {
                    info!("realtime socket connected");
                    match conn.join_all(&mut ws).await {
                        Ok(()) => {
                            heartbeat = heartbeat_timer();
                            socket = Some(ws);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to send joins");
                            conn.fail_all();
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "realtime socket connect failed");
                    conn.fail_all();
                }
            }
            continue;
        }
        let Some(ws) = socket.as_mut() else {
            continue;
        };

        let wake = tokio::select! {
            command = commands.recv() => Wake::Command(command),
            frame = ws.next() => Wake::Frame(frame),
            _ = heartbeat.tick() => Wake::Heartbeat,
        };

        let result = match wake {
            Wake::Command(None) => {
                let _ = ws.close(None).await;
                return;
            }
            Wake::Command(Some(command)) => conn.apply(command, ws).await,
            Wake::Frame(Some(Ok(Message::Text(text)))) => {
                conn.handle_text(&text);
                Ok(())
            }
            Wake::Frame(Some(Ok(Message::Close(_)))) | Wake::Frame(None) => {
                Err(tungstenite::Error::ConnectionClosed)
            }
            Wake::Frame(Some(Ok(_))) => Ok(()),
            Wake::Frame(Some(Err(e))) => Err(e),
            Wake::Heartbeat => {
                let frame = conn.heartbeat_frame();
                send(ws, &frame).await
            }
        };

        if let Err(e) = result {
            warn!(error = %e, channels = conn.channels.len(), "realtime socket lost");
            conn.fail_all();
            socket = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex;

    fn recording_connection() -> (Connection, Arc<Mutex<Vec<ChannelStatus>>>, Arc<Mutex<Vec<ChangePayload>>>) {
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let changes = Arc::new(Mutex::new(Vec::new()));
        let mut conn = Connection::new("anon".to_string());
        let status_log = statuses.clone();
        let change_log = changes.clone();
        conn.insert(Command::Join {
            handle: TransportHandle(1),
            topic: topic_for("poll-p1"),
            spec: EventSpec::new("Option")
                .event(ChangeEvent::Update)
                .filter("plicoId=eq.p1"),
            on_change: Arc::new(move |p| change_log.lock().unwrap().push(p)),
            on_status: Arc::new(move |s| status_log.lock().unwrap().push(s)),
        });
        (conn, statuses, changes)
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("wss://x.supabase.co/realtime/v1/", "key"),
            "wss://x.supabase.co/realtime/v1/websocket?apikey=key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_join_frame_carries_spec() {
        let (mut conn, _, _) = recording_connection();
        let frame = conn.join_frame(TransportHandle(1)).unwrap();
        assert_eq!(frame.topic, "realtime:poll-p1");
        assert_eq!(frame.event, "phx_join");
        let changes = &frame.payload["config"]["postgres_changes"][0];
        assert_eq!(changes["event"], "UPDATE");
        assert_eq!(changes["table"], "Option");
        assert_eq!(changes["filter"], "plicoId=eq.p1");
        assert_eq!(frame.payload["access_token"], "anon");
    }

    #[test]
    fn test_reply_then_change_delivers() {
        let (mut conn, statuses, changes) = recording_connection();
        let join = conn.join_frame(TransportHandle(1)).unwrap();
        let join_ref = join.msg_ref.unwrap();

        conn.handle_text(
            &json!({
                "topic": "realtime:poll-p1",
                "event": "phx_reply",
                "payload": {"status": "ok", "response": {}},
                "ref": join_ref,
            })
            .to_string(),
        );
        assert_eq!(*statuses.lock().unwrap(), vec![ChannelStatus::Subscribed]);

        conn.handle_text(
            &json!({
                "topic": "realtime:poll-p1",
                "event": "postgres_changes",
                "payload": {"ids": [1], "data": {
                    "type": "UPDATE",
                    "schema": "public",
                    "table": "Option",
                    "commit_timestamp": "2025-01-01T00:00:00Z",
                    "record": {"id": "opt-1", "voteCount": 4},
                    "old_record": {"id": "opt-1"},
                }},
                "ref": null,
            })
            .to_string(),
        );
        let changes = changes.lock().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].new["voteCount"], 4);
        assert!(changes[0].commit_timestamp.is_some());
    }

    #[test]
    fn test_rejected_join_reports_error() {
        let (mut conn, statuses, _) = recording_connection();
        let join_ref = conn.join_frame(TransportHandle(1)).unwrap().msg_ref.unwrap();
        conn.handle_text(
            &json!({
                "topic": "realtime:poll-p1",
                "event": "phx_reply",
                "payload": {"status": "error", "response": {"reason": "denied"}},
                "ref": join_ref,
            })
            .to_string(),
        );
        assert_eq!(*statuses.lock().unwrap(), vec![ChannelStatus::ChannelError]);
        assert!(conn.channels.is_empty());
    }

    #[test]
    fn test_fail_all_reports_and_forgets() {
        let (mut conn, statuses, _) = recording_connection();
        conn.fail_all();
        assert_eq!(*statuses.lock().unwrap(), vec![ChannelStatus::ChannelError]);
        assert!(conn.channels.is_empty());
    }
}
