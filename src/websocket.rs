//! # WebSocket Session Handler
//!
//! Serves `/ws`. Each connection is an actix actor that registers itself with the
//! shared [`ConnectionRegistry`] and keeps its heartbeat clock fresh.
//!
//! ## WebSocket Protocol:
//! 1. **Upgrade**: the server assigns a UUID session id and starts the actor
//! 2. **Admission**: the actor asks the registry to admit it. On success the client
//!    receives `{"type":"connected","session_id":...}`; at capacity it receives a
//!    `rate_limit` error and a close frame with code 1013 (try again later)
//! 3. **Liveness**: the actor pings the client every heartbeat interval. Every inbound
//!    frame (pong, ping, text, binary) counts as proof of life. A client may also send
//!    `{"type":"heartbeat"}` and gets a server heartbeat back
//! 4. **Eviction**: a client silent for longer than the connection timeout is closed
//!    by the heartbeat monitor with a `timeout` error
//!
//! Text and binary frames other than heartbeats belong to the speech and chat
//! pipelines and are not interpreted here.

use crate::connection::{CloseReason, ConnectionRegistry, Transport, TransportError};
use crate::error::AppError;
use crate::protocol::{self, ClientMessage, ErrorCode, Inbound, ServerMessage};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// WebSocket actor for one client connection.
pub struct VoiceWebSocket {
    session_id: String,
    registry: Arc<ConnectionRegistry>,
    ping_interval: Duration,
}

impl VoiceWebSocket {
    pub fn new(session_id: String, registry: Arc<ConnectionRegistry>, ping_interval: Duration) -> Self {
        Self {
            session_id,
            registry,
            ping_interval,
        }
    }

    /// Inbound traffic proves the peer is alive.
    fn record_activity(&self) {
        if let Err(err) = self.registry.touch(&self.session_id) {
            // Frames that arrive before admission completes
            debug!(session_id = %self.session_id, "Activity not recorded: {}", err);
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match message.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(session_id = %self.session_id, "Failed to encode message: {}", err),
        }
    }

    fn answer_heartbeat(&self) {
        let registry = self.registry.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            match registry.send_heartbeat(&session_id).await {
                Ok(true) => debug!(session_id = %session_id, "Heartbeat answered"),
                Ok(false) => warn!(session_id = %session_id, "Heartbeat reply failed, session closed"),
                Err(err) => debug!(session_id = %session_id, "Heartbeat ignored: {}", err),
            }
        });
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        self.record_activity();

        match protocol::classify(text) {
            Inbound::Control(ClientMessage::Heartbeat { .. }) => self.answer_heartbeat(),
            Inbound::Data => {
                debug!(session_id = %self.session_id, bytes = text.len(), "Received data message");
            }
            Inbound::Malformed(err) => {
                warn!(session_id = %self.session_id, "Invalid message: {}", err);
                self.send_message(
                    ctx,
                    &ServerMessage::error_with(ErrorCode::InvalidMessage, "Invalid message format.", json!({ "reason": err })),
                );
            }
        }
    }
}

/// Close code and notice sent to a peer whose connection is being torn down.
fn close_frame(reason: CloseReason) -> ws::CloseReason {
    let code = match reason {
        CloseReason::Normal => ws::CloseCode::Normal,
        CloseReason::Timeout => ws::CloseCode::Policy,
        CloseReason::HeartbeatFailed => ws::CloseCode::Error,
        CloseReason::Shutdown => ws::CloseCode::Away,
    };

    ws::CloseReason {
        code,
        description: Some(reason.as_str().to_string()),
    }
}

/// Outbound JSON text for the client.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(String);

/// Registry-initiated close.
#[derive(Message)]
#[rtype(result = "()")]
struct Terminate(CloseReason);

/// Result of asking the registry to admit this connection.
#[derive(Message)]
#[rtype(result = "()")]
enum Admission {
    Admitted,
    Rejected {
        code: ws::CloseCode,
        notice: ServerMessage,
    },
}

/// [`Transport`] backed by the actor's mailbox.
///
/// The HTTP upgrade has already happened when the actor starts, so `accept`
/// completes the handshake at the protocol level by sending `connected`.
struct ActorTransport {
    session_id: String,
    addr: Addr<VoiceWebSocket>,
}

#[async_trait]
impl Transport for ActorTransport {
    async fn accept(&self) -> Result<(), TransportError> {
        self.send(&ServerMessage::Connected {
            session_id: self.session_id.clone(),
        })
        .await
    }

    async fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let json = message.to_json().map_err(|e| TransportError::Io(e.to_string()))?;
        self.addr
            .send(Outbound(json))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, reason: CloseReason) -> Result<(), TransportError> {
        if !self.addr.connected() {
            return Ok(());
        }
        self.addr
            .send(Terminate(reason))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// Called when the WebSocket connection starts.
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection started");

        let addr = ctx.address();
        let transport = Arc::new(ActorTransport {
            session_id: self.session_id.clone(),
            addr: addr.clone(),
        });
        let registry = self.registry.clone();
        let session_id = self.session_id.clone();

        // Admission awaits the actor's own mailbox, so it cannot run inside the
        // actor's context.
        tokio::spawn(async move {
            let admission = match registry.connect(session_id.clone(), transport).await {
                Ok(true) => Admission::Admitted,
                Ok(false) => Admission::Rejected {
                    code: ws::CloseCode::Again,
                    notice: ServerMessage::error(ErrorCode::RateLimit),
                },
                Err(err) => {
                    error!(session_id = %err.session_id(), "Admission failed: {}", err);
                    Admission::Rejected {
                        code: ws::CloseCode::Error,
                        notice: ServerMessage::error_with(
                            ErrorCode::ServerError,
                            ErrorCode::ServerError.default_message(),
                            json!({ "reason": err.to_string() }),
                        ),
                    }
                }
            };

            let admitted = matches!(admission, Admission::Admitted);
            if addr.send(admission).await.is_err() && admitted {
                // The client left while the handshake was in flight.
                registry.disconnect(&session_id).await;
            }
        });

        ctx.run_interval(self.ping_interval, |_act, ctx| {
            ctx.ping(b"");
        });
    }

    /// Called when the WebSocket connection stops.
    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket connection stopped");

        let registry = self.registry.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            registry.disconnect(&session_id).await;
        });
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                self.record_activity();
                debug!(session_id = %self.session_id, bytes = data.len(), "Received binary frame");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.record_activity();
            }
            Ok(ws::Message::Pong(_)) => {
                self.record_activity();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, "WebSocket closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.record_activity();
                warn!(session_id = %self.session_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, "WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        ctx.text(msg.0);
    }
}

impl Handler<Terminate> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Terminate, ctx: &mut Self::Context) {
        if let Some(notice) = msg.0.notice() {
            self.send_message(ctx, &notice);
        }
        ctx.close(Some(close_frame(msg.0)));
        ctx.stop();
    }
}

impl Handler<Admission> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Admission, ctx: &mut Self::Context) {
        match msg {
            Admission::Admitted => {
                debug!(session_id = %self.session_id, "Session admitted");
            }
            Admission::Rejected { code, notice } => {
                warn!(session_id = %self.session_id, "Connection rejected");
                self.send_message(ctx, &notice);
                ctx.close(Some(ws::CloseReason {
                    code,
                    description: None,
                }));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// Upgrades the HTTP request and hands the connection to a [`VoiceWebSocket`]
/// actor. The session id is generated here; the transport's identity is never used.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!(
        session_id = %session_id,
        peer = ?req.connection_info().peer_addr(),
        "New WebSocket connection request"
    );

    let actor = VoiceWebSocket::new(
        session_id,
        state.registry.clone(),
        state.config.websocket.heartbeat_interval(),
    );

    ws::start(actor, &req, stream).map_err(|e| AppError::BadRequest(format!("WebSocket handshake failed: {}", e)))
}
