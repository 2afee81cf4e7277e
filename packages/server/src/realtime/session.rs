//! One WebSocket session.
//!
//! Splits the socket into a single outbound writer task (per-session FIFO
//! to the client) and an inbound loop that parses envelopes, rate-limits,
//! and forwards commands to room actors.
//!
//! Resume ordering: on subscribe the live subscriber is registered first,
//! then the store is backfilled from the client's `last_seq`, then live
//! delivery starts behind a watermark that drops anything the backfill
//! already sent. The client therefore sees strictly increasing seqs with
//! no interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::common::{CoreError, RoomId, UserId};
use crate::engine::{CommandEnvelope, CommandType};
use crate::projection::{project_event, Viewer};
use crate::room::{RoomHandle, RoomManager};

use super::protocol::{
    ClientMessage, CommandPayload, ServerMessage, SubscribePayload, SubscribedPayload, WireEvent,
};
use super::rate_limit::TokenBucket;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(30);
const BACKFILL_BATCH: i64 = 200;
const OUTBOUND_BUFFER: usize = 256;

enum Outbound {
    Frame(ServerMessage),
    Ping,
}

struct RoomSubscription {
    handle: RoomHandle,
    subscription_id: u64,
    pump: JoinHandle<()>,
}

/// Drive one authenticated connection until it closes.
pub async fn run_session(socket: WebSocket, manager: Arc<RoomManager>, user_id: UserId) {
    info!(user_id = %user_id, "session opened");
    let (ws_tx, mut ws_rx) = socket.split();

    // Single outbound writer gives per-session FIFO delivery.
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let writer = tokio::spawn(write_loop(ws_tx, out_rx));

    let mut session = Session {
        user_id: user_id.clone(),
        manager,
        out_tx,
        bucket: TokenBucket::session_default(),
        subscriptions: HashMap::new(),
    };

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut last_pong = Instant::now();

    loop {
        tokio::select! {
            incoming = ws_rx.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if !session.handle_text(&text).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary/ping frames are ignored
                    Some(Err(e)) => {
                        debug!(user_id = %user_id, error = %e, "socket error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if last_pong.elapsed() > PONG_TIMEOUT {
                    warn!(user_id = %user_id, "heartbeat timed out");
                    break;
                }
                if session.out_tx.send(Outbound::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    session.teardown();
    writer.abort();
    info!(user_id = %user_id, "session closed");
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(outbound) = out_rx.recv().await {
        let frame = match outbound {
            Outbound::Ping => Message::Ping(Vec::new()),
            Outbound::Frame(message) => match serde_json::to_string(&message) {
                Ok(json) => Message::Text(json),
                Err(e) => {
                    warn!(error = %e, "outbound serialization failed");
                    continue;
                }
            },
        };
        if ws_tx.send(frame).await.is_err() {
            return;
        }
    }
}

struct Session {
    user_id: UserId,
    manager: Arc<RoomManager>,
    out_tx: mpsc::Sender<Outbound>,
    bucket: TokenBucket,
    subscriptions: HashMap<RoomId, RoomSubscription>,
}

impl Session {
    /// Returns false when the session should close.
    async fn handle_text(&mut self, text: &str) -> bool {
        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                return self
                    .send(ServerMessage::error(None, "bad_request", e.to_string()))
                    .await;
            }
        };

        match message {
            ClientMessage::Ping { request_id, payload } => {
                self.send(ServerMessage::Pong { request_id, payload }).await
            }
            ClientMessage::Subscribe { request_id, payload } => {
                if !self.bucket.try_acquire() {
                    return self
                        .send(ServerMessage::error(request_id, "rate_limited", "too many requests"))
                        .await;
                }
                match self.subscribe(payload).await {
                    Ok(room_id) => {
                        self.send(ServerMessage::Subscribed {
                            request_id,
                            payload: SubscribedPayload {
                                status: "ok",
                                room_id,
                            },
                        })
                        .await
                    }
                    Err(err) => {
                        self.send(ServerMessage::error(request_id, err.code(), err.to_string()))
                            .await
                    }
                }
            }
            ClientMessage::Command { request_id, payload } => {
                if !self.bucket.try_acquire() {
                    return self
                        .send(ServerMessage::error(request_id, "rate_limited", "too many requests"))
                        .await;
                }
                match self.command(payload).await {
                    Ok(result) => {
                        self.send(ServerMessage::CommandResult {
                            request_id,
                            payload: result,
                        })
                        .await
                    }
                    Err(err) => {
                        self.send(ServerMessage::error(request_id, err.code(), err.to_string()))
                            .await
                    }
                }
            }
        }
    }

    /// Register for live events, backfill missed history, then let live
    /// delivery through behind the backfill watermark.
    async fn subscribe(&mut self, payload: SubscribePayload) -> Result<String, CoreError> {
        let room_id = RoomId::from(payload.room_id.as_str());
        if let Some(previous) = self.subscriptions.remove(&room_id) {
            previous.pump.abort();
            previous.handle.unsubscribe(previous.subscription_id);
        }

        let handle = self.manager.get_or_create(&room_id).await?;
        let state = handle.state().await;
        if !state.is_member(&self.user_id) {
            return Err(CoreError::Forbidden("not a member of this room".to_string()));
        }
        let viewer = Viewer::for_state(&state, self.user_id.clone());

        // Live first, so nothing between backfill and go-live is lost.
        let mut subscription = handle.subscribe(viewer.clone());

        // Backfill from the durable log, projected against current state:
        // late resubscribers see the same filter they would see now.
        let mut cursor = payload.last_seq.max(0);
        loop {
            let events = self
                .manager
                .store()
                .load_events_after(&room_id, cursor, BACKFILL_BATCH)
                .await
                .map_err(|e| CoreError::Transient(anyhow::anyhow!(e)))?;
            let batch_len = events.len() as i64;
            for event in events {
                cursor = cursor.max(event.seq);
                if let Some(visible) = project_event(&event, &state, &viewer) {
                    if !self
                        .send(ServerMessage::Event {
                            payload: WireEvent::from(visible),
                        })
                        .await
                    {
                        handle.unsubscribe(subscription.id);
                        return Err(CoreError::Unavailable("session closing".to_string()));
                    }
                }
            }
            if batch_len < BACKFILL_BATCH {
                break;
            }
        }

        // Pump live events; anything at or below the watermark was already
        // delivered by the backfill.
        let watermark = cursor;
        let out_tx = self.out_tx.clone();
        let subscription_id = subscription.id;
        let pump = tokio::spawn(async move {
            while let Some(event) = subscription.rx.recv().await {
                if event.seq <= watermark {
                    continue;
                }
                let frame = Outbound::Frame(ServerMessage::Event {
                    payload: WireEvent::from(event),
                });
                if out_tx.send(frame).await.is_err() {
                    return;
                }
            }
        });

        self.subscriptions.insert(
            room_id.clone(),
            RoomSubscription {
                handle,
                subscription_id,
                pump,
            },
        );
        Ok(room_id.into_string())
    }

    async fn command(&mut self, payload: CommandPayload) -> Result<crate::engine::CommandResult, CoreError> {
        let command_type: CommandType = payload
            .command_type
            .parse()
            .map_err(|e: anyhow::Error| CoreError::Validation(e.to_string()))?;
        let envelope = CommandEnvelope {
            command_id: payload
                .command_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            idempotency_key: payload
                .idempotency_key
                .filter(|key| !key.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            room_id: RoomId::from(payload.room_id.as_str()),
            command_type,
            actor_user_id: self.user_id.clone(),
            last_seen_seq: payload.last_seen_seq,
            payload: payload.data,
        };

        let handle = self.manager.get_or_create(&envelope.room_id).await?;
        match tokio::time::timeout(DISPATCH_TIMEOUT, handle.dispatch(envelope)).await {
            Ok(result) => result,
            // The command may still apply; a retry with the same key
            // returns the memoised result.
            Err(_) => Err(CoreError::Transient(anyhow::anyhow!("command timed out"))),
        }
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.out_tx.send(Outbound::Frame(message)).await.is_ok()
    }

    fn teardown(&mut self) {
        for (_, subscription) in self.subscriptions.drain() {
            subscription.pump.abort();
            subscription.handle.unsubscribe(subscription.subscription_id);
        }
    }
}
