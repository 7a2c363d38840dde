use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use tokio::sync::mpsc;

use visit_audio_interface::{AudioChunk, AudioError, CaptureObserver, CaptureSource, PlaybackSink};
use visit_stream_client::{
    ConnectionRegistry, SessionCallbacks, SessionHandle, SessionOptions, SubscribeClientBuilder,
};
use visit_transcript::{KeyedMerge, Turn, TurnReconciler, WholesaleReplace};

use crate::{
    RecorderRuntime, SessionDataEvent, SessionErrorEvent, SessionLifecycleEvent, State,
};

#[derive(Debug, Clone)]
pub struct StartParams {
    pub session_id: String,
    pub company_id: Option<String>,
    pub api_base: String,
    pub api_key: String,
    pub playback_enabled: bool,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
}

/// Point-in-time view of the store, for callers that poll instead of
/// subscribing to runtime events.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub state: State,
    pub session_id: Option<String>,
    pub job_id: Option<String>,
    pub connected: bool,
    pub recording: bool,
    pub last_error: Option<String>,
}

/// Socket-side notifications routed back into the actor so that all store
/// mutation happens on the actor's own mailbox.
pub enum SessionEvent {
    Ready { session_id: String },
    TurnsSnapshot { session_id: String, turns: Vec<Turn> },
    Suggestions { session_id: String, data: serde_json::Value },
    ConnectionChanged { session_id: String, connected: bool },
    Error { session_id: String, error: String },
    Ended { session_id: String },
}

pub enum RootMsg {
    StartTranscription(StartParams, Box<dyn CaptureSource>, RpcReplyPort<bool>),
    StopTranscription(RpcReplyPort<()>),
    SetApiTurns(String, Vec<Turn>, RpcReplyPort<()>),
    GetTurns(String, RpcReplyPort<Vec<Turn>>),
    GetState(RpcReplyPort<StoreSnapshot>),
    SessionEvent(SessionEvent),
}

pub struct RootArgs {
    pub runtime: Arc<dyn RecorderRuntime>,
    pub playback: Option<Arc<dyn PlaybackSink>>,
}

struct ActiveSession {
    session_id: String,
    job_id: String,
    params: StartParams,
    handle: Option<SessionHandle>,
    capture: Box<dyn CaptureSource>,
    capture_started: bool,
    stopping: Arc<AtomicBool>,
}

pub struct RootState {
    runtime: Arc<dyn RecorderRuntime>,
    playback: Option<Arc<dyn PlaybackSink>>,
    registry: ConnectionRegistry,
    turn_lists: HashMap<String, Vec<Turn>>,
    active: Option<ActiveSession>,
    last_session_id: Option<String>,
    last_error: Option<String>,
    connected: bool,
    finalizing: bool,
}

pub struct RootActor;

impl RootActor {
    pub fn name() -> ractor::ActorName {
        "recorder_root_actor".into()
    }
}

#[ractor::async_trait]
impl Actor for RootActor {
    type Msg = RootMsg;
    type State = RootState;
    type Arguments = RootArgs;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(RootState {
            runtime: args.runtime,
            playback: args.playback,
            registry: ConnectionRegistry::new(),
            turn_lists: HashMap::new(),
            active: None,
            last_session_id: None,
            last_error: None,
            connected: false,
            finalizing: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            RootMsg::StartTranscription(params, capture, reply) => {
                let started = start_transcription_impl(&myself, params, capture, state).await;
                let _ = reply.send(started);
            }
            RootMsg::StopTranscription(reply) => {
                stop_transcription_impl(state, None).await;
                let _ = reply.send(());
            }
            RootMsg::SetApiTurns(session_id, turns, reply) => {
                // REST fetch is the freshest known source here, so no merge.
                let existing = state.turn_lists.entry(session_id.clone()).or_default();
                *existing = WholesaleReplace.reconcile(existing, turns);
                emit_turns(state, &session_id);
                let _ = reply.send(());
            }
            RootMsg::GetTurns(session_id, reply) => {
                let turns = state.turn_lists.get(&session_id).cloned().unwrap_or_default();
                let _ = reply.send(turns);
            }
            RootMsg::GetState(reply) => {
                let fsm_state = if state.finalizing {
                    State::Finalizing
                } else if state.active.is_some() {
                    State::Active
                } else {
                    State::Inactive
                };
                let _ = reply.send(StoreSnapshot {
                    state: fsm_state,
                    session_id: state.active.as_ref().map(|a| a.session_id.clone()),
                    job_id: state.active.as_ref().map(|a| a.job_id.clone()),
                    connected: state.connected,
                    recording: state
                        .active
                        .as_ref()
                        .map(|a| a.capture_started)
                        .unwrap_or(false),
                    last_error: state.last_error.clone(),
                });
            }
            RootMsg::SessionEvent(event) => {
                handle_session_event(event, state).await;
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        stop_transcription_impl(state, None).await;
        Ok(())
    }
}

/// Forwards capture chunks into the session's outbound channel. The stopping
/// flag is checked per chunk so a callback already queued when stop begins
/// still produces zero sends.
struct ForwardingObserver {
    session_id: String,
    audio_tx: mpsc::Sender<Bytes>,
    stopping: Arc<AtomicBool>,
    runtime: Arc<dyn RecorderRuntime>,
}

impl CaptureObserver for ForwardingObserver {
    fn on_audio_chunk(&self, chunk: AudioChunk) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.audio_tx.try_send(chunk.buffer) {
            tracing::debug!(%error, "outbound_audio_chunk_dropped");
        }
    }

    fn on_status_change(&self, is_recording: bool) {
        tracing::info!(session_id = %self.session_id, is_recording, "capture_status_changed");
    }

    fn on_error(&self, error: AudioError) {
        self.runtime.emit_error(SessionErrorEvent::AudioError {
            session_id: self.session_id.clone(),
            error: error.to_string(),
        });
    }
}

async fn start_transcription_impl(
    myself: &ActorRef<RootMsg>,
    params: StartParams,
    capture: Box<dyn CaptureSource>,
    state: &mut RootState,
) -> bool {
    if let Some(active) = &state.active {
        if active.session_id == params.session_id && options_equivalent(&active.params, &params) {
            tracing::info!(session_id = %params.session_id, "session_already_active");
            return true;
        }
        // Same id with materially different options is a restart, not a no-op.
        tracing::info!(
            from = %active.session_id,
            to = %params.session_id,
            "replacing_active_session"
        );
        stop_transcription_impl(state, None).await;
    }

    // A reopened view of the same session keeps its history; switching to a
    // different one starts from a clean list.
    if state.last_session_id.as_deref() != Some(params.session_id.as_str()) {
        state.turn_lists.remove(&params.session_id);
    }

    let mut builder = SubscribeClientBuilder::default()
        .api_base(params.api_base.as_str())
        .api_key(params.api_key.as_str())
        .session_id(params.session_id.as_str());
    if let Some(company_id) = &params.company_id {
        builder = builder.company_id(company_id.as_str());
    }

    let client = match builder.build() {
        Ok(client) => client,
        Err(error) => {
            tracing::error!(%error, "subscribe_client_build_failed");
            state.last_error = Some(error.to_string());
            state.runtime.emit_error(SessionErrorEvent::ConnectionError {
                session_id: params.session_id.clone(),
                error: error.to_string(),
            });
            return false;
        }
    };

    let callbacks = session_callbacks(myself.clone(), params.session_id.clone());
    let options = SessionOptions {
        playback_enabled: params.playback_enabled,
        heartbeat_at: params.heartbeat_at,
        max_retries: params.max_retries,
    };

    let Some(handle) =
        visit_stream_client::spawn_session(client, options, callbacks, state.playback.clone(), &state.registry)
    else {
        tracing::warn!(session_id = %params.session_id, "session_already_open_elsewhere");
        return false;
    };

    state.active = Some(ActiveSession {
        session_id: params.session_id.clone(),
        job_id: uuid::Uuid::new_v4().to_string(),
        params: params.clone(),
        handle: Some(handle),
        capture,
        capture_started: false,
        stopping: Arc::new(AtomicBool::new(false)),
    });
    state.last_session_id = Some(params.session_id.clone());
    state.last_error = None;
    state.finalizing = false;

    tracing::info!(session_id = %params.session_id, "transcription_started");
    true
}

async fn stop_transcription_impl(state: &mut RootState, error: Option<String>) {
    let Some(mut active) = state.active.take() else {
        return;
    };

    state.finalizing = true;
    // Ordering matters: block outbound audio before anything else so no
    // chunk races into a socket being torn down.
    active.stopping.store(true, Ordering::SeqCst);

    state.runtime.emit_lifecycle(SessionLifecycleEvent::Finalizing {
        session_id: active.session_id.clone(),
    });
    tracing::info!(session_id = %active.session_id, "transcription_finalizing");

    if active.capture_started
        && let Err(err) = active.capture.stop().await
    {
        tracing::warn!(error = %err, "capture_stop_failed");
    }

    if let Some(handle) = active.handle.take() {
        handle.stop().await;
    }

    state.connected = false;
    state.finalizing = false;
    state.runtime.emit_lifecycle(SessionLifecycleEvent::Inactive {
        session_id: active.session_id.clone(),
        error,
    });
    tracing::info!(session_id = %active.session_id, "transcription_stopped");
}

async fn handle_session_event(event: SessionEvent, state: &mut RootState) {
    match event {
        SessionEvent::Ready { session_id } => {
            let Some(active) = state.active.as_mut() else {
                return;
            };
            if active.session_id != session_id || active.capture_started {
                return;
            }
            let Some(handle) = &active.handle else {
                return;
            };

            let observer = Arc::new(ForwardingObserver {
                session_id: session_id.clone(),
                audio_tx: handle.audio_sender(),
                stopping: active.stopping.clone(),
                runtime: state.runtime.clone(),
            });
            match active.capture.start(observer) {
                Ok(()) => {
                    active.capture_started = true;
                    tracing::info!(%session_id, "capture_started");
                }
                Err(error) => {
                    tracing::error!(%error, "capture_start_failed");
                    let message = error.to_string();
                    state.last_error = Some(message.clone());
                    state.runtime.emit_error(SessionErrorEvent::AudioError {
                        session_id: session_id.clone(),
                        error: message.clone(),
                    });
                    stop_transcription_impl(state, Some(message)).await;
                }
            }
        }
        SessionEvent::TurnsSnapshot { session_id, turns } => {
            // Session-owner path: merge against local history rather than
            // trusting the snapshot to be complete.
            let existing = state.turn_lists.entry(session_id.clone()).or_default();
            *existing = KeyedMerge.reconcile(existing, turns);
            emit_turns(state, &session_id);
        }
        SessionEvent::Suggestions { session_id, data } => {
            state.runtime.emit_data(SessionDataEvent::ProactiveSuggestions {
                session_id,
                data,
            });
        }
        SessionEvent::ConnectionChanged { session_id, connected } => {
            state.connected = connected;
            if connected {
                state
                    .runtime
                    .emit_lifecycle(SessionLifecycleEvent::Active { session_id });
            } else if state.active.is_some() && !state.finalizing {
                state
                    .runtime
                    .emit_lifecycle(SessionLifecycleEvent::Retrying { session_id });
            }
        }
        SessionEvent::Error { session_id, error } => {
            state.last_error = Some(error.clone());
            state
                .runtime
                .emit_error(SessionErrorEvent::ConnectionError { session_id, error });
        }
        SessionEvent::Ended { session_id } => {
            let ours = state
                .active
                .as_ref()
                .is_some_and(|a| a.session_id == session_id);
            if ours {
                tracing::info!(%session_id, "session_ended_upstream");
                stop_transcription_impl(state, None).await;
            }
        }
    }
}

/// `heartbeat_at` is a connect-time hint, not a material option; everything
/// else changing on a same-id start means the running session no longer
/// reflects caller intent.
fn options_equivalent(existing: &StartParams, incoming: &StartParams) -> bool {
    existing.api_base == incoming.api_base
        && existing.api_key == incoming.api_key
        && existing.company_id == incoming.company_id
        && existing.playback_enabled == incoming.playback_enabled
        && existing.max_retries == incoming.max_retries
}

fn emit_turns(state: &RootState, session_id: &str) {
    let turns = state
        .turn_lists
        .get(session_id)
        .cloned()
        .unwrap_or_default();
    state.runtime.emit_data(SessionDataEvent::TurnsUpdated {
        session_id: session_id.to_string(),
        turns,
    });
}

fn session_callbacks(myself: ActorRef<RootMsg>, session_id: String) -> SessionCallbacks {
    let cast = move |event: SessionEvent| {
        let _ = myself.cast(RootMsg::SessionEvent(event));
    };

    SessionCallbacks {
        on_ready: Box::new({
            let cast = cast.clone();
            let session_id = session_id.clone();
            move || cast(SessionEvent::Ready { session_id: session_id.clone() })
        }),
        on_cached_turns_update: Box::new({
            let cast = cast.clone();
            let session_id = session_id.clone();
            move |turns| {
                cast(SessionEvent::TurnsSnapshot {
                    session_id: session_id.clone(),
                    turns,
                })
            }
        }),
        on_proactive_suggestions: Box::new({
            let cast = cast.clone();
            let session_id = session_id.clone();
            move |data| {
                cast(SessionEvent::Suggestions {
                    session_id: session_id.clone(),
                    data,
                })
            }
        }),
        on_connection_state_change: Box::new({
            let cast = cast.clone();
            let session_id = session_id.clone();
            move |connected| {
                cast(SessionEvent::ConnectionChanged {
                    session_id: session_id.clone(),
                    connected,
                })
            }
        }),
        on_error: Box::new({
            let cast = cast.clone();
            let session_id = session_id.clone();
            move |error| {
                cast(SessionEvent::Error {
                    session_id: session_id.clone(),
                    error: error.to_string(),
                })
            }
        }),
        on_session_ended: Box::new({
            let session_id = session_id.clone();
            move || cast(SessionEvent::Ended { session_id: session_id.clone() })
        }),
    }
}
