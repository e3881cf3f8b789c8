//! WebSocket connection adapter
//!
//! Admits a connection during the WebSocket handshake, registers it with
//! the hub and runs two pumps: inbound (socket -> hub) and outbound
//! (queue -> socket). Whichever pump stops first ends the connection,
//! which is then unregistered exactly once.

use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, trace, warn};

use crate::config::AdapterConfig;
use crate::error::{AdmissionError, AppError};
use crate::hub::HubHandle;
use crate::message::{Envelope, InboundFrame};
use crate::types::{ClientId, ClientIdentity, RoomId};

/// Time the outbound pump gets to flush and send a close frame after the
/// peer stopped reading
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why the inbound pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundExit {
    /// Close frame or end of stream
    Closed,
    /// Transport error
    Error,
    /// Nothing received within the idle timeout
    Idle,
    /// Hub no longer accepts commands
    HubClosed,
}

/// Why the outbound pump stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundExit {
    /// The hub dropped the queue (client unregistered)
    QueueClosed,
    /// Write to the socket failed
    WriteError,
}

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, reading the room and identity from
/// the upgrade request, then serves the connection until it closes.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    config: AdapterConfig,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let mut admitted = None;
    let ws_stream =
        tokio_tungstenite::accept_hdr_async(stream, |req: &Request, response: Response| {
            match admit(req.uri()) {
                Ok(identity) => {
                    admitted = Some(identity);
                    Ok(response)
                }
                Err(e) => {
                    warn!("Rejected connection from {}: {}", peer_addr, e);
                    Err(reject(&e))
                }
            }
        })
        .await?;

    let identity = admitted.ok_or(AdmissionError::MissingRoom)?;
    info!(
        "Client {} ({}) connected to room {}",
        identity.connection_id, identity.display_name, identity.room_id
    );

    serve(ws_stream, identity, hub, config).await
}

/// Serve an upgraded connection for an admitted identity
pub async fn serve<S>(
    ws_stream: WebSocketStream<S>,
    identity: ClientIdentity,
    hub: HubHandle,
    config: AdapterConfig,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (ws_sender, ws_receiver) = ws_stream.split();
    let client_id = identity.connection_id.clone();

    // Hub -> adapter queue; the hub holds the only sender
    let (msg_tx, msg_rx) = mpsc::channel::<Envelope>(config.outbound_queue_size);

    let registration = match hub.register(identity.clone(), msg_tx).await {
        Ok(registration) => registration,
        Err(e) => {
            error!("Failed to register client {} - hub closed", client_id);
            return Err(e);
        }
    };

    let mut read_task = tokio::spawn(inbound_pump(
        ws_receiver,
        identity,
        hub.clone(),
        config.idle_timeout,
        config.max_message_len,
    ));
    let mut write_task = tokio::spawn(outbound_pump(ws_sender, msg_rx, config.ping_interval));

    let read_first = tokio::select! {
        exit = &mut read_task => {
            debug!("Read task completed for {}: {:?}", client_id, exit);
            true
        }
        exit = &mut write_task => {
            debug!("Write task completed for {}: {:?}", client_id, exit);
            false
        }
    };

    // Scoped to this registration so a reconnect under the same id survives
    let _ = hub
        .unregister_registration(client_id.clone(), registration)
        .await;

    if read_first {
        // Unregistering closed the queue; let the writer flush and close
        if tokio::time::timeout(CLOSE_GRACE, &mut write_task).await.is_err() {
            write_task.abort();
        }
    } else {
        read_task.abort();
    }

    info!("Client {} disconnected", client_id);

    Ok(())
}

/// Inbound pump: socket frames -> chat envelopes -> hub
///
/// Every frame counts as liveness, pongs included. Undecodable frames are
/// logged and skipped.
pub async fn inbound_pump<S>(
    mut stream: S,
    identity: ClientIdentity,
    hub: HubHandle,
    idle_timeout: Duration,
    max_message_len: usize,
) -> InboundExit
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let client_id = &identity.connection_id;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            warn!("Client {} idle for {:?}, closing", client_id, idle_timeout);
            return InboundExit::Idle;
        };

        match next {
            Some(Ok(Message::Text(text))) => match InboundFrame::decode(&text, max_message_len) {
                Ok(content) => {
                    let envelope = Envelope::chat(&identity, content);
                    if hub.broadcast(envelope).await.is_err() {
                        debug!("Hub closed, ending read task for {}", client_id);
                        return InboundExit::HubClosed;
                    }
                }
                Err(e) => {
                    warn!("Discarding frame from {}: {}", client_id, e);
                }
            },
            Some(Ok(Message::Close(_))) => {
                debug!("Client {} sent close frame", client_id);
                return InboundExit::Closed;
            }
            Some(Ok(Message::Ping(_))) => {
                // Pong is handled automatically by tungstenite
                trace!("Ping from {}", client_id);
            }
            Some(Ok(Message::Pong(_))) => {
                trace!("Pong from {}", client_id);
            }
            Some(Ok(_)) => {
                debug!("Ignoring non-text frame from {}", client_id);
            }
            Some(Err(e)) => {
                error!("WebSocket error for {}: {}", client_id, e);
                return InboundExit::Error;
            }
            None => {
                debug!("Stream ended for {}", client_id);
                return InboundExit::Closed;
            }
        }
    }
}

/// Outbound pump: queue -> JSON text frames -> socket
///
/// Also pings the peer every `ping_interval`. Stops when the hub drops the
/// queue or a write fails.
pub async fn outbound_pump<K>(
    mut sink: K,
    mut queue: mpsc::Receiver<Envelope>,
    ping_interval: Duration,
) -> OutboundExit
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut ping = tokio::time::interval(ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    ping.tick().await;

    loop {
        tokio::select! {
            next = queue.recv() => {
                let Some(envelope) = next else {
                    let _ = sink.close().await;
                    return OutboundExit::QueueClosed;
                };
                let json = match envelope.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        // Continue - don't break on serialization errors
                        error!("Failed to serialize envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    debug!("WebSocket send failed, ending write task: {}", e);
                    return OutboundExit::WriteError;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("WebSocket ping failed, ending write task: {}", e);
                    return OutboundExit::WriteError;
                }
            }
        }
    }
}

/// Resolve the identity for an upgrade request
///
/// The room comes from `/ws/joinRoom/{roomId}`, `/ws/{roomId}` or a
/// `roomId` query parameter; `username` is required and `userId`, when
/// present, becomes the connection id.
pub fn admit(uri: &Uri) -> Result<ClientIdentity, AdmissionError> {
    let mut room = uri
        .path()
        .strip_prefix("/ws/joinRoom/")
        .or_else(|| uri.path().strip_prefix("/ws/"))
        .filter(|segment| !segment.is_empty() && !segment.contains('/'))
        .map(|segment| decode_param("roomId", segment))
        .transpose()?;
    let mut user_id = None;
    let mut username = None;

    for pair in uri.query().unwrap_or("").split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "roomId" if room.is_none() => room = Some(decode_param(key, value)?),
            "userId" => user_id = Some(decode_param(key, value)?),
            "username" => username = Some(decode_param(key, value)?),
            _ => {}
        }
    }

    let room = room
        .filter(|r| !r.trim().is_empty())
        .ok_or(AdmissionError::MissingRoom)?;
    let username = username
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .ok_or(AdmissionError::MissingUsername)?;
    let connection_id = user_id
        .filter(|id| !id.is_empty())
        .map(ClientId::from_string)
        .unwrap_or_default();

    Ok(ClientIdentity::new(
        connection_id,
        username,
        RoomId::from_string(room),
    ))
}

fn decode_param(key: &str, value: &str) -> Result<String, AdmissionError> {
    urlencoding::decode(&value.replace('+', " "))
        .map(|v| v.into_owned())
        .map_err(|_| AdmissionError::InvalidParameter(key.to_string()))
}

/// Build the HTTP 400 response for a rejected upgrade
fn reject(err: &AdmissionError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use futures_util::stream;
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{connect_async, MaybeTlsStream};

    use super::*;
    use crate::hub::HubConfig;
    use crate::message::EnvelopeKind;

    fn spawn_hub() -> HubHandle {
        let (hub, handle) = HubHandle::channel(64, HubConfig::default());
        tokio::spawn(hub.run());
        handle
    }

    fn identity(name: &str) -> ClientIdentity {
        ClientIdentity::new(
            ClientId::from_string(name.to_string()),
            name,
            RoomId::from("movie1"),
        )
    }

    fn text(s: &str) -> Result<Message, WsError> {
        Ok(Message::Text(s.to_string().into()))
    }

    #[test]
    fn test_admit_join_room_path() {
        let uri: Uri = "/ws/joinRoom/movie1?userId=42&username=Ada%20L".parse().unwrap();
        let identity = admit(&uri).unwrap();

        assert_eq!(identity.room_id, RoomId::from("movie1"));
        assert_eq!(identity.connection_id, ClientId::from_string("42".into()));
        assert_eq!(identity.display_name, "Ada L");
    }

    #[test]
    fn test_admit_room_in_query() {
        let uri: Uri = "/ws?roomId=abc-_1&username=bob".parse().unwrap();
        let identity = admit(&uri).unwrap();

        assert_eq!(identity.room_id, RoomId::from("abc-_1"));
        // Without userId a fresh connection id is assigned
        assert!(!identity.connection_id.0.is_empty());
    }

    #[test]
    fn test_admit_rejects_missing_params() {
        let uri: Uri = "/ws/joinRoom/movie1?userId=1".parse().unwrap();
        assert_eq!(admit(&uri), Err(AdmissionError::MissingUsername));

        let uri: Uri = "/ws/joinRoom/movie1?username=%20%20".parse().unwrap();
        assert_eq!(admit(&uri), Err(AdmissionError::MissingUsername));

        let uri: Uri = "/ws?username=bob".parse().unwrap();
        assert_eq!(admit(&uri), Err(AdmissionError::MissingRoom));

        let uri: Uri = "/ws/joinRoom/movie1?username=%FF".parse().unwrap();
        assert_eq!(
            admit(&uri),
            Err(AdmissionError::InvalidParameter("username".into()))
        );
    }

    #[test]
    fn test_reject_is_bad_request() {
        let response = reject(&AdmissionError::MissingRoom);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.body().as_deref(), Some("room id is required"));
    }

    #[tokio::test]
    async fn test_inbound_pump_skips_malformed_frames() {
        let hub = spawn_hub();
        let (b_tx, mut b_rx) = mpsc::channel(16);
        hub.register(identity("b"), b_tx).await.unwrap();

        let frames = stream::iter(vec![
            text(r#"{"content": "first"}"#),
            text("{not json"),
            Ok(Message::Binary(vec![1, 2, 3].into())),
            text(r#"{"content": "second", "username": "mallory", "type": "system"}"#),
        ]);
        let exit = inbound_pump(frames, identity("a"), hub.clone(), Duration::from_secs(5), 4096).await;
        assert_eq!(exit, InboundExit::Closed);

        hub.snapshot(RoomId::from("movie1")).await.unwrap();
        let mut chats = Vec::new();
        while let Ok(env) = b_rx.try_recv() {
            if env.kind() == EnvelopeKind::Chat {
                chats.push(env);
            }
        }
        assert_eq!(chats.len(), 2);
        assert_eq!(chats[0].content(), "first");
        assert_eq!(chats[1].content(), "second");
        assert_eq!(chats[1].sender(), Some(&identity("a")));
    }

    #[tokio::test]
    async fn test_inbound_pump_stops_on_error_and_close() {
        let hub = spawn_hub();

        let frames = stream::iter(vec![Err(WsError::ConnectionClosed), text(r#"{"content": "x"}"#)]);
        let exit = inbound_pump(frames, identity("a"), hub.clone(), Duration::from_secs(5), 4096).await;
        assert_eq!(exit, InboundExit::Error);

        let frames = stream::iter(vec![Ok(Message::Close(None))]);
        let exit = inbound_pump(frames, identity("a"), hub, Duration::from_secs(5), 4096).await;
        assert_eq!(exit, InboundExit::Closed);
    }

    #[tokio::test]
    async fn test_inbound_pump_idle_timeout() {
        let hub = spawn_hub();
        let silent = stream::pending::<Result<Message, WsError>>();
        let exit = inbound_pump(silent, identity("a"), hub, Duration::from_millis(50), 4096).await;
        assert_eq!(exit, InboundExit::Idle);
    }

    #[tokio::test]
    async fn test_outbound_pump_writes_until_queue_closed() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::pin(futures_util::sink::unfold(
            written.clone(),
            |written, msg: Message| async move {
                written.lock().unwrap().push(msg);
                Ok::<_, WsError>(written)
            },
        ));

        let (tx, rx) = mpsc::channel(4);
        tx.send(Envelope::chat(&identity("a"), "one".to_string())).await.unwrap();
        tx.send(Envelope::chat(&identity("a"), "two".to_string())).await.unwrap();
        drop(tx);

        let exit = outbound_pump(sink, rx, Duration::from_secs(60)).await;
        assert_eq!(exit, OutboundExit::QueueClosed);

        let written = written.lock().unwrap();
        let contents: Vec<String> = written
            .iter()
            .map(|msg| {
                let value: Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
                value["content"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(contents, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_outbound_pump_stops_on_write_error() {
        let sink = Box::pin(futures_util::sink::unfold((), |_, _msg: Message| async move {
            Err::<(), _>(WsError::ConnectionClosed)
        }));

        let (tx, rx) = mpsc::channel(4);
        tx.send(Envelope::chat(&identity("a"), "lost".to_string())).await.unwrap();

        let exit = outbound_pump(sink, rx, Duration::from_secs(60)).await;
        assert_eq!(exit, OutboundExit::WriteError);
    }

    #[tokio::test]
    async fn test_outbound_pump_sends_pings() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let sink = Box::pin(futures_util::sink::unfold(
            written.clone(),
            |written, msg: Message| async move {
                written.lock().unwrap().push(msg);
                Ok::<_, WsError>(written)
            },
        ));

        let (tx, rx) = mpsc::channel::<Envelope>(4);
        let pump = tokio::spawn(outbound_pump(sink, rx, Duration::from_millis(20)));

        tokio::time::sleep(Duration::from_millis(120)).await;
        drop(tx);
        assert_eq!(pump.await.unwrap(), OutboundExit::QueueClosed);

        let written = written.lock().unwrap();
        let pings = written.iter().filter(|msg| msg.is_ping()).count();
        assert!(pings >= 2, "expected periodic pings, got {}", pings);
    }

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn start_server(hub: HubHandle) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let hub = hub.clone();
                tokio::spawn(handle_connection(stream, hub, AdapterConfig::default()));
            }
        });
        format!("ws://{}", addr)
    }

    async fn next_envelope(ws: &mut Client) -> Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("stream ended")
                .expect("websocket error");
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_end_to_end_room_chat() {
        let hub = spawn_hub();
        let base = start_server(hub.clone()).await;

        let (mut a, _) = connect_async(format!("{}/ws/joinRoom/movie1?userId=a&username=a", base))
            .await
            .unwrap();
        let join = next_envelope(&mut a).await;
        assert_eq!(join["type"], "join");
        assert_eq!(join["username"], "a");
        assert_eq!(next_envelope(&mut a).await["type"], "system");

        let members = hub.members(RoomId::from("movie1")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "a");

        let (mut b, _) = connect_async(format!("{}/ws/joinRoom/movie1?userId=b&username=b", base))
            .await
            .unwrap();
        assert_eq!(next_envelope(&mut b).await["type"], "join");
        assert_eq!(next_envelope(&mut b).await["type"], "system");
        let b_joined = next_envelope(&mut a).await;
        assert_eq!(b_joined["type"], "join");
        assert_eq!(b_joined["username"], "b");

        a.send(Message::Text(r#"{"content": "hi"}"#.to_string().into()))
            .await
            .unwrap();
        let chat = next_envelope(&mut b).await;
        assert_eq!(chat["type"], "chat");
        assert_eq!(chat["room_id"], "movie1");
        assert_eq!(chat["username"], "a");
        assert_eq!(chat["content"], "hi");

        b.close(None).await.unwrap();
        let left = next_envelope(&mut a).await;
        assert_eq!(left["type"], "leave");
        assert_eq!(left["username"], "b");

        let members = hub.members(RoomId::from("movie1")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "a");
    }

    #[tokio::test]
    async fn test_end_to_end_reconnect_with_same_user_id() {
        let hub = spawn_hub();
        let base = start_server(hub.clone()).await;
        let url = format!("{}/ws/joinRoom/movie1?userId=u1&username=ada", base);

        let (mut first, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_envelope(&mut first).await["type"], "join");
        assert_eq!(next_envelope(&mut first).await["type"], "system");

        let (mut second, _) = connect_async(url.as_str()).await.unwrap();
        assert_eq!(next_envelope(&mut second).await["type"], "join");
        assert_eq!(next_envelope(&mut second).await["type"], "system");

        // Give the replaced connection time to wind down
        tokio::time::sleep(Duration::from_millis(300)).await;

        let members = hub.members(RoomId::from("movie1")).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].username, "ada");

        // The replacement still chats normally
        let (mut other, _) = connect_async(format!("{}/ws/joinRoom/movie1?userId=u2&username=bo", base))
            .await
            .unwrap();
        assert_eq!(next_envelope(&mut other).await["type"], "join");
        assert_eq!(next_envelope(&mut other).await["type"], "system");
        assert_eq!(next_envelope(&mut second).await["username"], "bo");

        second
            .send(Message::Text(r#"{"content": "still here"}"#.to_string().into()))
            .await
            .unwrap();
        assert_eq!(next_envelope(&mut other).await["content"], "still here");
    }

    #[tokio::test]
    async fn test_end_to_end_rejects_without_username() {
        let hub = spawn_hub();
        let base = start_server(hub.clone()).await;

        let result = connect_async(format!("{}/ws/joinRoom/movie1", base)).await;
        match result {
            Err(WsError::Http(response)) => assert_eq!(response.status(), StatusCode::BAD_REQUEST),
            other => panic!("expected HTTP rejection, got {:?}", other.map(|_| ())),
        }
        assert!(hub.rooms().await.unwrap().is_empty());
    }
}
