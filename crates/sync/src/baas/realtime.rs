//! Realtime websocket client.
//!
//! Speaks the Phoenix channel protocol (`vsn=1.0.0`, JSON frames) used by the
//! hosted realtime service. Each channel gets its own socket and task: the
//! task joins the topic with a `postgres_changes` INSERT filter, keeps the
//! socket alive with heartbeats, forwards status and inserts to the caller,
//! and sends `phx_leave` when the channel is removed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::{BackendError, ChannelEvent, ChannelHandle, ChannelSpec, ChannelStatus, RealtimeApi};
use crate::util::lock;

/// Phoenix protocol version.
const PROTOCOL_VERSION: &str = "1.0.0";

/// The server drops sockets that stay silent for longer than ~30s.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// How long to wait for the join reply before reporting `TimedOut`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `remove_channel` waits for the leave handshake.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ref used for the join message; its reply carries the same ref.
const JOIN_REF: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type SocketSink = SplitSink<Socket, Message>;

/// A Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl PhoenixMessage {
    fn new(topic: impl Into<String>, event: &str, payload: Value, msg_ref: u64) -> Self {
        Self {
            topic: topic.into(),
            event: event.to_owned(),
            payload,
            msg_ref: Some(msg_ref.to_string()),
            join_ref: None,
        }
    }
}

struct RunningChannel {
    cancel: CancellationToken,
    /// Set right after the spawn; the entry exists before the task runs.
    task: Option<JoinHandle<()>>,
}

/// Drops a channel's entry when its task ends, however it ends.
struct Registration {
    client: Weak<RealtimeInner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            lock(&client.channels).remove(&self.id);
        }
    }
}

struct RealtimeInner {
    socket_url: Url,
    anon_key: SecretString,
    access_token: Mutex<Option<SecretString>>,
    channels: Mutex<HashMap<u64, RunningChannel>>,
    next_id: AtomicU64,
}

/// Websocket client for the hosted realtime service.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<RealtimeInner>,
}

impl RealtimeClient {
    /// Create a client for the project at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns `BackendError::Realtime` if no websocket URL can be derived.
    pub fn new(base_url: &Url, anon_key: SecretString) -> Result<Self, BackendError> {
        Ok(Self {
            inner: Arc::new(RealtimeInner {
                socket_url: socket_url(base_url, &anon_key)?,
                anon_key,
                access_token: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Token sent with new joins. Falls back to the anon key when unset.
    pub fn set_access_token(&self, token: Option<SecretString>) {
        *lock(&self.inner.access_token) = token;
    }

    /// Number of channels with a running socket task.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        lock(&self.inner.channels).len()
    }

    fn join_token(&self) -> String {
        lock(&self.inner.access_token)
            .as_ref()
            .unwrap_or(&self.inner.anon_key)
            .expose_secret()
            .to_owned()
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut url = self.inner.socket_url.clone();
        url.set_query(None);
        f.debug_struct("RealtimeClient")
            .field("socket_url", &url.as_str())
            .field("open_channels", &self.open_channels())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RealtimeApi for RealtimeClient {
    #[instrument(skip(self, spec, events), fields(channel = %spec.name))]
    async fn open_channel(
        &self,
        spec: ChannelSpec,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<ChannelHandle, BackendError> {
        let (socket, _) = connect_async(self.inner.socket_url.as_str())
            .await
            .map_err(|e| BackendError::Realtime(e.to_string()))?;
        let (mut sink, stream) = socket.split();

        let topic = format!("realtime:{}", spec.name);
        let mut join = PhoenixMessage::new(
            topic.clone(),
            "phx_join",
            join_payload(&spec, &self.join_token()),
            1,
        );
        join.join_ref = Some(JOIN_REF.to_owned());
        send(&mut sink, &join).await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let registration = Registration {
            client: Arc::downgrade(&self.inner),
            id,
        };
        lock(&self.inner.channels).insert(
            id,
            RunningChannel {
                cancel: cancel.clone(),
                task: None,
            },
        );
        let task = tokio::spawn(run_channel(sink, stream, topic, events, cancel, registration));
        if let Some(running) = lock(&self.inner.channels).get_mut(&id) {
            running.task = Some(task);
        }

        debug!(id, "realtime join sent");
        Ok(ChannelHandle::new(id, spec.name))
    }

    #[instrument(skip(self, handle), fields(channel = %handle.name()))]
    async fn remove_channel(&self, handle: ChannelHandle) -> Result<(), BackendError> {
        let Some(running) = lock(&self.inner.channels).remove(&handle.id()) else {
            debug!("channel already removed");
            return Ok(());
        };

        running.cancel.cancel();
        let Some(mut task) = running.task else {
            return Ok(());
        };
        match tokio::time::timeout(LEAVE_TIMEOUT, &mut task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(BackendError::Realtime(err.to_string())),
            Err(_) => {
                task.abort();
                Err(BackendError::Realtime("timed out leaving channel".into()))
            }
        }
    }
}

/// Own one channel's socket until it is cancelled or closes. The channel is
/// deregistered from the client when this returns.
async fn run_channel(
    mut sink: SocketSink,
    mut stream: futures::stream::SplitStream<Socket>,
    topic: String,
    events: mpsc::UnboundedSender<ChannelEvent>,
    cancel: CancellationToken,
    _registration: Registration,
) {
    let mut next_ref: u64 = 2;
    let mut heartbeat = tokio::time::interval_at(
        tokio::time::Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    let join_deadline = tokio::time::sleep(JOIN_TIMEOUT);
    tokio::pin!(join_deadline);
    let mut join_pending = true;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let leave = PhoenixMessage::new(topic.clone(), "phx_leave", json!({}), next_ref);
                if let Err(err) = send(&mut sink, &leave).await {
                    debug!(error = %err, "failed to send phx_leave");
                }
                if let Err(err) = sink.close().await {
                    debug!(error = %err, "websocket close error");
                }
                break;
            }
            _ = heartbeat.tick() => {
                let beat = PhoenixMessage::new("phoenix", "heartbeat", json!({}), next_ref);
                next_ref += 1;
                if let Err(err) = send(&mut sink, &beat).await {
                    let _ = events.send(ChannelEvent::Status(ChannelStatus::ChannelError(err.to_string())));
                    break;
                }
            }
            () = &mut join_deadline, if join_pending => {
                join_pending = false;
                let _ = events.send(ChannelEvent::Status(ChannelStatus::TimedOut));
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let message = match serde_json::from_str::<PhoenixMessage>(text.as_str()) {
                        Ok(message) => message,
                        Err(err) => {
                            warn!(error = %err, "invalid realtime frame");
                            continue;
                        }
                    };
                    let Some(event) = interpret(&topic, &message) else { continue };
                    if matches!(event, ChannelEvent::Status(_)) {
                        join_pending = false;
                    }
                    if events.send(event).is_err() {
                        debug!("channel receiver dropped");
                        break;
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = sink.send(Message::Pong(payload)).await {
                        debug!(error = %err, "failed to answer ping");
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    let _ = events.send(ChannelEvent::Status(ChannelStatus::Closed));
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "realtime socket failure");
                    let _ = events.send(ChannelEvent::Status(ChannelStatus::ChannelError(err.to_string())));
                    break;
                }
            },
        }
    }
    debug!(%topic, "realtime channel task stopped");
}

async fn send(sink: &mut SocketSink, message: &PhoenixMessage) -> Result<(), BackendError> {
    let text = serde_json::to_string(message).map_err(|e| BackendError::Decode(e.to_string()))?;
    sink.send(Message::text(text))
        .await
        .map_err(|e| BackendError::Realtime(e.to_string()))
}

fn join_payload(spec: &ChannelSpec, access_token: &str) -> Value {
    json!({
        "config": {
            "broadcast": { "ack": false, "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "INSERT",
                "schema": spec.schema,
                "table": spec.table,
                "filter": spec.filter,
            }],
        },
        "access_token": access_token,
    })
}

/// Map a frame on `topic` to a channel event. Frames for other topics
/// (heartbeat replies) and unknown events yield `None`.
fn interpret(topic: &str, message: &PhoenixMessage) -> Option<ChannelEvent> {
    if message.topic != topic {
        return None;
    }
    let payload = &message.payload;
    match message.event.as_str() {
        "phx_reply" if message.msg_ref.as_deref() == Some(JOIN_REF) => {
            if payload.get("status").and_then(Value::as_str) == Some("ok") {
                Some(ChannelEvent::Status(ChannelStatus::Subscribed))
            } else {
                let reason = payload
                    .pointer("/response/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("join rejected");
                Some(ChannelEvent::Status(ChannelStatus::ChannelError(
                    reason.to_owned(),
                )))
            }
        }
        "postgres_changes" => {
            let data = payload.get("data")?;
            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return None;
            }
            data.get("record").cloned().map(ChannelEvent::Insert)
        }
        "system" if payload.get("status").and_then(Value::as_str) == Some("error") => {
            let reason = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("system error");
            Some(ChannelEvent::Status(ChannelStatus::ChannelError(
                reason.to_owned(),
            )))
        }
        "phx_error" => Some(ChannelEvent::Status(ChannelStatus::ChannelError(
            "channel crashed".into(),
        ))),
        "phx_close" => Some(ChannelEvent::Status(ChannelStatus::Closed)),
        _ => None,
    }
}

fn socket_url(base: &Url, anon_key: &SecretString) -> Result<Url, BackendError> {
    let mut url = base
        .join("realtime/v1/websocket")
        .map_err(|e| BackendError::Realtime(e.to_string()))?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(BackendError::Realtime(format!(
                "unsupported URL scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| BackendError::Realtime("cannot derive websocket URL".into()))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key.expose_secret())
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    const TOPIC: &str = "realtime:notifications:abc";

    fn frame(event: &str, payload: Value, msg_ref: Option<&str>) -> PhoenixMessage {
        PhoenixMessage {
            topic: TOPIC.into(),
            event: event.into(),
            payload,
            msg_ref: msg_ref.map(str::to_owned),
            join_ref: None,
        }
    }

    #[test]
    fn test_socket_url_switches_scheme_and_adds_key() {
        let base = Url::parse("https://project.example.co").unwrap();
        let url = socket_url(&base, &SecretString::from("anon-key")).unwrap();
        assert_eq!(
            url.as_str(),
            "wss://project.example.co/realtime/v1/websocket?apikey=anon-key&vsn=1.0.0"
        );
    }

    #[test]
    fn test_socket_url_rejects_unknown_scheme() {
        let base = Url::parse("ftp://project.example.co").unwrap();
        assert!(socket_url(&base, &SecretString::from("k")).is_err());
    }

    #[test]
    fn test_join_reply_ok_is_subscribed() {
        let reply = frame("phx_reply", json!({"status": "ok", "response": {}}), Some("1"));
        assert!(matches!(
            interpret(TOPIC, &reply),
            Some(ChannelEvent::Status(ChannelStatus::Subscribed))
        ));
    }

    #[test]
    fn test_join_reply_error_carries_reason() {
        let reply = frame(
            "phx_reply",
            json!({"status": "error", "response": {"reason": "unauthorized"}}),
            Some("1"),
        );
        match interpret(TOPIC, &reply) {
            Some(ChannelEvent::Status(ChannelStatus::ChannelError(reason))) => {
                assert_eq!(reason, "unauthorized");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_replies_are_ignored() {
        let reply = PhoenixMessage {
            topic: "phoenix".into(),
            ..frame("phx_reply", json!({"status": "ok"}), Some("7"))
        };
        assert!(interpret(TOPIC, &reply).is_none());
    }

    #[test]
    fn test_insert_yields_record() {
        let change = frame(
            "postgres_changes",
            json!({"data": {"type": "INSERT", "record": {"user_id": "u1", "title": "t"}}}),
            None,
        );
        match interpret(TOPIC, &change) {
            Some(ChannelEvent::Insert(record)) => assert_eq!(record["user_id"], "u1"),
            other => panic!("unexpected: {other:?}"),
        }

        let update = frame(
            "postgres_changes",
            json!({"data": {"type": "UPDATE", "record": {}}}),
            None,
        );
        assert!(interpret(TOPIC, &update).is_none());
    }

    #[test]
    fn test_close_and_error_events() {
        assert!(matches!(
            interpret(TOPIC, &frame("phx_close", json!({}), None)),
            Some(ChannelEvent::Status(ChannelStatus::Closed))
        ));
        assert!(matches!(
            interpret(TOPIC, &frame("phx_error", json!({}), None)),
            Some(ChannelEvent::Status(ChannelStatus::ChannelError(_)))
        ));
    }

    #[test]
    fn test_join_payload_filters_inserts() {
        let spec = ChannelSpec {
            name: "notifications:abc".into(),
            schema: "public".into(),
            table: "notifications".into(),
            filter: "user_id=eq.abc".into(),
        };
        let payload = join_payload(&spec, "token");
        assert_eq!(payload["config"]["postgres_changes"][0]["event"], "INSERT");
        assert_eq!(
            payload["config"]["postgres_changes"][0]["filter"],
            "user_id=eq.abc"
        );
        assert_eq!(payload["access_token"], "token");
    }

    #[tokio::test]
    async fn test_remove_unknown_channel_is_noop() {
        let client = RealtimeClient::new(
            &Url::parse("https://project.example.co").unwrap(),
            SecretString::from("anon-key"),
        )
        .unwrap();
        client
            .remove_channel(ChannelHandle::new(42, "notifications:x".into()))
            .await
            .unwrap();
        assert_eq!(client.open_channels(), 0);
    }

    #[tokio::test]
    async fn test_server_close_releases_channel_slot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let _join = socket.next().await;
            socket.close(None).await.unwrap();
        });
        let client = RealtimeClient::new(
            &Url::parse(&format!("http://{addr}")).unwrap(),
            SecretString::from("anon-key"),
        )
        .unwrap();
        let spec = ChannelSpec {
            name: "notifications:abc".into(),
            schema: "public".into(),
            table: "notifications".into(),
            filter: "user_id=eq.abc".into(),
        };
        let (events, mut rx) = mpsc::unbounded_channel();

        let handle = client.open_channel(spec, events).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            event,
            Some(ChannelEvent::Status(ChannelStatus::Closed))
        ));
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.open_channels() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        client.remove_channel(handle).await.unwrap();
        server.await.unwrap();
    }
}
