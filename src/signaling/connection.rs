#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients: owns the connection
// state machine and dispatches control messages to the room registry.

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::{SignalError, SignalResult};
use crate::metrics::ServerMetrics;
use crate::room::participant::UserSession;
use crate::room::RoomRegistry;
use crate::session::ConnectionId;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, error, info, warn};

/// Bounded channel capacity per client. Messages queued beyond this are stale;
/// drop them early rather than buffer without bound.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout. Closes connections that hold a permit without sending
/// anything, including half-open TCP sessions no close frame will ever
/// arrive on.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

const MAX_ROOM_NAME_LEN: usize = 128;
const MAX_PARTICIPANT_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;

/// Where a connection is in its lifecycle. `Left` is terminal: once a
/// participant leaves, the connection cannot join again and must reconnect.
enum ConnState {
    Idle,
    Joined(Arc<UserSession>),
    Left,
}

/// Serialize a ServerMessage and queue it as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection from upgrade to close.
pub async fn handle_connection(
    socket: WebSocket,
    rooms: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let connection = ConnectionId::new();
    info!("New WebSocket connection: {}", connection);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection);
    });

    let mut state = ConnState::Idle;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Invalid message on connection {}: {}", connection, e);
                        metrics.inc_errors();
                        continue;
                    }
                };

                if let Err(e) =
                    dispatch(&client_msg, &mut state, connection, &tx, &rooms, &metrics).await
                {
                    metrics.inc_errors();
                    if e.wants_error_response() {
                        error!("Error on connection {}: {}", connection, e);
                        if tx.is_closed() {
                            break;
                        }
                        let _ = send_json(
                            &tx,
                            &ServerMessage::Error {
                                message: e.to_string(),
                            },
                        );
                    } else {
                        debug!("Dropped message on connection {}: {}", connection, e);
                    }
                }
            }
            Message::Close(_) => {
                info!("Connection {} closed by client", connection);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Handled by the transport
            }
            _ => {
                warn!("Unexpected message type on connection {}", connection);
            }
        }
    }

    // Transport close is equivalent to an explicit leave; the registry's leave
    // path is idempotent, so a prior leaveRoom makes this a no-op.
    if let ConnState::Joined(user) = state {
        rooms.leave(&user).await;
    }

    // _conn_guard dropped here, decrementing connections_active
    // _permit dropped here, releasing a connection slot

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished: {}", connection);
}

/// Routes one control message according to the connection state.
async fn dispatch(
    message: &ClientMessage,
    state: &mut ConnState,
    connection: ConnectionId,
    sender: &mpsc::Sender<Arc<String>>,
    rooms: &Arc<RoomRegistry>,
    metrics: &ServerMetrics,
) -> SignalResult<()> {
    match message {
        ClientMessage::JoinRoom { room, name } => {
            match state {
                ConnState::Idle => {}
                ConnState::Joined(user) => {
                    return Err(SignalError::Protocol(format!(
                        "already joined as {}",
                        user.name()
                    )))
                }
                ConnState::Left => {
                    return Err(SignalError::Protocol(
                        "connection already left its room, reconnect to join again".into(),
                    ))
                }
            }
            if room.is_empty() || room.len() > MAX_ROOM_NAME_LEN {
                return Err(SignalError::Protocol(format!(
                    "room name must be 1-{MAX_ROOM_NAME_LEN} characters"
                )));
            }
            if name.is_empty() || name.len() > MAX_PARTICIPANT_NAME_LEN {
                return Err(SignalError::Protocol(format!(
                    "participant name must be 1-{MAX_PARTICIPANT_NAME_LEN} characters"
                )));
            }

            let (user, existing) = rooms.join(room, name, connection, sender.clone()).await?;
            // State first: if the snapshot cannot be queued the close path
            // still tears the membership down.
            *state = ConnState::Joined(user.clone());
            user.send(&ServerMessage::ExistingParticipants { data: existing })?;
        }

        ClientMessage::ReceiveVideoFrom { sender, sdp_offer } => {
            let user = joined(state)?;
            let publisher = rooms
                .sessions()
                .by_identity(sender)
                .ok_or_else(|| SignalError::UnknownParticipant(sender.clone()))?;
            if publisher.room_name() != user.room_name() {
                return Err(SignalError::UnknownParticipant(sender.clone()));
            }
            user.receive_video_from(&publisher, sdp_offer).await?;
            metrics.inc_negotiations();
        }

        ClientMessage::OnIceCandidate { candidate, name } => {
            let user = joined(state)?;
            user.add_candidate(candidate, name).await;
            metrics.inc_candidates_relayed();
        }

        ClientMessage::LeaveRoom => {
            match std::mem::replace(state, ConnState::Left) {
                ConnState::Joined(user) => rooms.leave(&user).await,
                // A leave without a join is harmless; stay terminal.
                ConnState::Idle | ConnState::Left => {
                    debug!("Redundant leaveRoom on connection {}", connection)
                }
            }
        }

        ClientMessage::StartFilter => {
            let user = joined(state)?;
            rooms.start_filter(&user).await?;
            metrics.inc_filters_started();
        }

        ClientMessage::Chat { sender, content } => {
            let user = joined(state)?;
            if content.is_empty() || content.len() > MAX_CHAT_LEN {
                return Err(SignalError::Protocol(format!(
                    "chat message must be 1-{MAX_CHAT_LEN} characters"
                )));
            }
            rooms.broadcast_chat(&user, sender, content.clone()).await;
            metrics.inc_chat_messages();
        }

        ClientMessage::Unknown => {
            debug!("Unrecognized message id on connection {}, ignoring", connection);
        }
    }

    Ok(())
}

fn joined(state: &ConnState) -> SignalResult<Arc<UserSession>> {
    match state {
        ConnState::Joined(user) => Ok(user.clone()),
        ConnState::Idle => Err(SignalError::Protocol("not in a room".into())),
        ConnState::Left => Err(SignalError::Protocol("connection already left".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{FakeMediaEngine, FilterParams, MediaEngine};
    use crate::session::SessionRegistry;
    use serde_json::Value;

    fn make_rooms() -> Arc<RoomRegistry> {
        let engine: Arc<dyn MediaEngine> = Arc::new(FakeMediaEngine::new());
        Arc::new(RoomRegistry::new(
            engine,
            Arc::new(SessionRegistry::new()),
            FilterParams::default(),
            ServerMetrics::new(),
        ))
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    async fn join_as(
        rooms: &Arc<RoomRegistry>,
        room: &str,
        name: &str,
    ) -> (ConnState, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = ConnState::Idle;
        dispatch(
            &ClientMessage::JoinRoom {
                room: room.into(),
                name: name.into(),
            },
            &mut state,
            ConnectionId::new(),
            &tx,
            rooms,
            &ServerMetrics::new(),
        )
        .await
        .unwrap();
        (state, rx)
    }

    #[tokio::test]
    async fn test_join_replies_with_existing_participants() {
        let rooms = make_rooms();

        let (_alice_state, mut alice_rx) = join_as(&rooms, "r1", "alice").await;
        let alice_msgs = drain(&mut alice_rx);
        assert_eq!(alice_msgs[0]["id"], "existingParticipants");
        assert_eq!(alice_msgs[0]["data"], serde_json::json!([]));

        let (_bob_state, mut bob_rx) = join_as(&rooms, "r1", "bob").await;
        let bob_msgs = drain(&mut bob_rx);
        assert_eq!(bob_msgs[0]["id"], "existingParticipants");
        assert_eq!(bob_msgs[0]["data"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn test_messages_before_join_are_protocol_errors() {
        let rooms = make_rooms();
        let (tx, _rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = ConnState::Idle;

        let result = dispatch(
            &ClientMessage::Chat {
                sender: "ghost".into(),
                content: "hi".into(),
            },
            &mut state,
            ConnectionId::new(),
            &tx,
            &rooms,
            &ServerMetrics::new(),
        )
        .await;
        assert!(matches!(result, Err(SignalError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_left_state_is_terminal() {
        let rooms = make_rooms();
        let (mut state, _rx) = join_as(&rooms, "r1", "alice").await;
        let (tx, _tx_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = ConnectionId::new();
        let metrics = ServerMetrics::new();

        dispatch(
            &ClientMessage::LeaveRoom,
            &mut state,
            connection,
            &tx,
            &rooms,
            &metrics,
        )
        .await
        .unwrap();
        assert_eq!(rooms.participant_count(), 0);

        let result = dispatch(
            &ClientMessage::JoinRoom {
                room: "r1".into(),
                name: "alice".into(),
            },
            &mut state,
            connection,
            &tx,
            &rooms,
            &metrics,
        )
        .await;
        assert!(matches!(result, Err(SignalError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_offer_for_unknown_sender_is_rejected() {
        let rooms = make_rooms();
        let (mut state, _rx) = join_as(&rooms, "r1", "alice").await;
        let (tx, _tx_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let result = dispatch(
            &ClientMessage::ReceiveVideoFrom {
                sender: "nobody".into(),
                sdp_offer: "v=0".into(),
            },
            &mut state,
            ConnectionId::new(),
            &tx,
            &rooms,
            &ServerMetrics::new(),
        )
        .await;
        assert!(matches!(result, Err(SignalError::UnknownParticipant(_))));
    }

    #[tokio::test]
    async fn test_offer_for_sender_in_other_room_is_rejected() {
        let rooms = make_rooms();
        let (mut alice_state, _a_rx) = join_as(&rooms, "r1", "alice").await;
        let (_bob_state, _b_rx) = join_as(&rooms, "r2", "bob").await;
        let (tx, _tx_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let result = dispatch(
            &ClientMessage::ReceiveVideoFrom {
                sender: "bob".into(),
                sdp_offer: "v=0".into(),
            },
            &mut alice_state,
            ConnectionId::new(),
            &tx,
            &rooms,
            &ServerMetrics::new(),
        )
        .await;
        assert!(matches!(result, Err(SignalError::UnknownParticipant(_))));
    }

    #[tokio::test]
    async fn test_duplicate_join_gets_error_response() {
        let rooms = make_rooms();
        let (_state, _rx) = join_as(&rooms, "r1", "alice").await;

        let (tx, _tx_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = ConnState::Idle;
        let result = dispatch(
            &ClientMessage::JoinRoom {
                room: "r1".into(),
                name: "alice".into(),
            },
            &mut state,
            ConnectionId::new(),
            &tx,
            &rooms,
            &ServerMetrics::new(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, SignalError::DuplicateIdentity(_)));
        assert!(err.wants_error_response());
        assert!(matches!(state, ConnState::Idle));
    }

    #[tokio::test]
    async fn test_negotiation_round_trip() {
        let rooms = make_rooms();
        let (_alice_state, _a_rx) = join_as(&rooms, "r1", "alice").await;
        let (mut bob_state, mut bob_rx) = join_as(&rooms, "r1", "bob").await;
        drain(&mut bob_rx);

        dispatch(
            &ClientMessage::ReceiveVideoFrom {
                sender: "alice".into(),
                sdp_offer: "the-offer".into(),
            },
            &mut bob_state,
            ConnectionId::new(),
            &mpsc::channel(CHANNEL_CAPACITY).0,
            &rooms,
            &ServerMetrics::new(),
        )
        .await
        .unwrap();

        let msgs = drain(&mut bob_rx);
        let answer = msgs
            .iter()
            .find(|m| m["id"] == "receiveVideoAnswer")
            .unwrap();
        assert_eq!(answer["name"], "alice");
        assert_eq!(answer["sdpAnswer"], "sdp-answer:the-offer");
    }
}
