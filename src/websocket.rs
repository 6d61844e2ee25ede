//! # WebSocket Voice Conversation Handler
//!
//! Clients connect to `/ws/voice?lesson_id=<id>` (credential in the
//! `Authorization` header or `?token=`) and hold a spoken conversation over a
//! single WebSocket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the upgrade is authenticated and a voice session is
//!    created before the handshake completes; failures are plain HTTP errors
//! 2. **Greeting**: the server sends `session_created { session_id }`
//! 3. **Speaking**: `audio_data` messages (or binary frames), then `audio_end`
//! 4. **Reply**: `transcription`, one `speech_response` per sentence,
//!    `response_complete`
//! 5. **Typing**: `text_message` skips straight to `text_response` units
//!
//! ## Actor Model:
//! Each connection is one `VoiceSocket` actor. Inbound frames are handled in
//! arrival order; a turn runs as a future spawned in the actor's context, so
//! the socket keeps reading while the providers work. Every outbound message
//! goes through the actor's own mailbox, which keeps them in event order.
//! Stopping the actor drops the in-flight turn and evicts the session.

use crate::auth::{authenticate, ConnectParams};
use crate::error::{AppError, AppResult, VoiceError};
use crate::state::AppState;
use crate::voice::{Command, Inbound, Outbound};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// One outbound protocol message on its way to the socket.
#[derive(Message)]
#[rtype(result = "()")]
struct Deliver(Outbound);

pub struct VoiceSocket {
    session_id: String,
    state: web::Data<AppState>,

    /// Last sign of life from the client (any frame)
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
    idle_timeout: Duration,

    /// The finalize-and-respond future currently running, if any
    turn: Option<SpawnHandle>,
}

impl VoiceSocket {
    pub fn new(session_id: String, state: web::Data<AppState>) -> Self {
        let config = state.get_config();
        Self {
            session_id,
            state,
            last_heartbeat: Instant::now(),
            heartbeat_interval: config.voice.heartbeat_interval(),
            idle_timeout: config.voice.idle_timeout(),
            turn: None,
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: Outbound) {
        ctx.address().do_send(Deliver(message));
    }

    /// Report a rejected message. The session itself is unaffected.
    fn reject(&self, ctx: &mut ws::WebsocketContext<Self>, err: VoiceError) {
        if err == VoiceError::Cancelled {
            return;
        }
        warn!(session_id = %self.session_id, code = err.code(), error = %err, "Voice message rejected");
        self.state.record_voice(|v| v.protocol_errors += 1);
        self.send(ctx, Outbound::error(&self.session_id, &err));

        if matches!(err, VoiceError::SessionNotFound(_)) {
            // The session was evicted under us; nothing more can be served.
            ctx.stop();
        }
    }

    fn dispatch(&mut self, result: Result<Command, VoiceError>, ctx: &mut ws::WebsocketContext<Self>) {
        match result {
            Ok(Command::Reply(message)) => self.send(ctx, message),
            Ok(Command::Buffered) => {}
            Ok(command) => self.start_turn(command, ctx),
            Err(err) => self.reject(ctx, err),
        }
    }

    fn start_turn(&mut self, command: Command, ctx: &mut ws::WebsocketContext<Self>) {
        let handle = match self.state.sessions.get(&self.session_id) {
            Ok(handle) => handle,
            Err(err) => return self.reject(ctx, err),
        };

        let dispatcher = self.state.dispatcher.clone();
        let addr = ctx.address();
        let turn = async move {
            dispatcher
                .run_turn(handle, command, move |message| addr.do_send(Deliver(message)))
                .await
        };

        let spawned = ctx.spawn(turn.into_actor(self).map(|result, act, _ctx| {
            act.turn = None;
            act.state.record_voice(|v| match &result {
                Ok(()) => v.turns_completed += 1,
                Err(VoiceError::Cancelled) => v.turns_cancelled += 1,
                Err(_) => v.turns_failed += 1,
            });
        }));
        self.turn = Some(spawned);
    }

    /// Stop if the client went quiet or the session idled out.
    fn check_liveness(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if self.last_heartbeat.elapsed() > self.heartbeat_interval * 2 {
            warn!(session_id = %self.session_id, "WebSocket heartbeat timeout, closing connection");
            ctx.stop();
            return;
        }

        let idle = match self.state.sessions.get(&self.session_id) {
            Ok(handle) => {
                let session = handle.lock();
                if session.state().is_busy() {
                    None
                } else {
                    Utc::now()
                        .signed_duration_since(session.last_activity_at())
                        .to_std()
                        .ok()
                }
            }
            Err(_) => {
                info!(session_id = %self.session_id, "Voice session evicted, closing connection");
                ctx.stop();
                return;
            }
        };

        if idle.is_some_and(|idle| idle > self.idle_timeout) {
            info!(session_id = %self.session_id, "Voice session idle, closing connection");
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Normal,
                description: Some("idle timeout".to_string()),
            }));
            ctx.stop();
        } else {
            ctx.ping(b"");
        }
    }
}

impl Actor for VoiceSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "Voice WebSocket connection started");
        self.send(
            ctx,
            Outbound::SessionCreated {
                session_id: self.session_id.clone(),
            },
        );

        ctx.run_interval(self.heartbeat_interval, |act, ctx| act.check_liveness(ctx));
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        if let Some(turn) = self.turn.take() {
            ctx.cancel_future(turn);
        }
        if self.state.sessions.close(&self.session_id) {
            self.state.record_voice(|v| v.sessions_closed += 1);
        }
        info!(session_id = %self.session_id, "Voice WebSocket connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                let result = Inbound::parse(&text)
                    .and_then(|message| self.state.dispatcher.accept(&self.session_id, message));
                self.dispatch(result, ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(session_id = %self.session_id, bytes = data.len(), "Binary audio frame");
                let result = self.state.dispatcher.accept_binary(&self.session_id, &data);
                self.dispatch(result, ctx);
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, reason = ?reason, "WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                self.reject(
                    ctx,
                    VoiceError::MalformedMessage("fragmented frames are not supported".to_string()),
                );
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Deliver> for VoiceSocket {
    type Result = ();

    fn handle(&mut self, msg: Deliver, ctx: &mut Self::Context) {
        if matches!(
            msg.0,
            Outbound::SpeechResponse { .. } | Outbound::TextResponse { .. }
        ) {
            self.state.record_voice(|v| v.units_delivered += 1);
        }
        ctx.text(msg.0.to_json());
    }
}

/// WebSocket endpoint handler.
///
/// Authentication and the session ceiling are checked before the upgrade, so
/// a rejected client gets an ordinary 401/503 and no session ever exists.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    params: web::Query<ConnectParams>,
    app_state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let connection = authenticate(&req, &params, app_state.identity.as_ref()).map_err(|e| {
        warn!(peer = ?req.connection_info().peer_addr(), "Voice connection without valid credentials");
        AppError::from(e)
    })?;

    let handle = app_state
        .sessions
        .create_handle(&connection.user_id, &connection.lesson_context_id)
        .map_err(|e| {
            app_state.record_voice(|v| v.sessions_rejected += 1);
            AppError::from(e)
        })?;
    let session_id = handle.id().to_string();

    match ws::start(VoiceSocket::new(session_id.clone(), app_state.clone()), &req, stream) {
        Ok(response) => {
            app_state.record_voice(|v| v.sessions_created += 1);
            Ok(response)
        }
        Err(e) => {
            app_state.sessions.close(&session_id);
            Err(AppError::BadRequest(format!("WebSocket handshake failed: {e}")))
        }
    }
}
