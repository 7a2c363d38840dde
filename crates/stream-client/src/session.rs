use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;

use visit_audio_interface::PlaybackSink;
use visit_transcript::Turn;
use visit_wire::{ControlMessage, Frame, OutboundControl, RawMessage};

use crate::registry::{ConnectionGuard, ConnectionRegistry};
use crate::{Error, SubscribeClient};

pub const RETRY_DELAY: Duration = Duration::from_secs(5);
pub const AUDIO_ARM_TIMEOUT: Duration = Duration::from_secs(5);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10);
pub const HEARTBEAT_STALE: Duration = Duration::from_secs(10);
pub const END_GRACE: Duration = Duration::from_millis(200);

const OUTBOUND_AUDIO_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Retrying,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Forward inbound audio to the playback sink.
    pub playback_enabled: bool,
    /// Last server-reported liveness timestamp for this session, if known.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Consecutive failed connects tolerated before giving up. `None` keeps
    /// probing for as long as the caller wants the session alive.
    pub max_retries: Option<u32>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            playback_enabled: false,
            heartbeat_at: None,
            max_retries: None,
        }
    }
}

/// Fire-and-forget notifications toward the host. All recoverable errors are
/// absorbed here; nothing propagates as a panic or unhandled error across the
/// socket lifecycle.
pub struct SessionCallbacks {
    pub on_cached_turns_update: Box<dyn Fn(Vec<Turn>) + Send + Sync>,
    pub on_ready: Box<dyn Fn() + Send + Sync>,
    pub on_error: Box<dyn Fn(Error) + Send + Sync>,
    pub on_session_ended: Box<dyn Fn() + Send + Sync>,
    pub on_connection_state_change: Box<dyn Fn(bool) + Send + Sync>,
    pub on_proactive_suggestions: Box<dyn Fn(serde_json::Value) + Send + Sync>,
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self {
            on_cached_turns_update: Box::new(|_| {}),
            on_ready: Box::new(|| {}),
            on_error: Box::new(|_| {}),
            on_session_ended: Box::new(|| {}),
            on_connection_state_change: Box::new(|_| {}),
            on_proactive_suggestions: Box::new(|_| {}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    Connect,
    DeferRetry,
}

/// Subscriber-mode connect precondition. A heartbeat older than
/// [`HEARTBEAT_STALE`] means the upstream producer may have vanished, but a
/// single probe is still worth scheduling; only a first attempt defers.
pub fn connect_precondition(
    heartbeat_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    is_retry_attempt: bool,
) -> ConnectDecision {
    if is_retry_attempt {
        return ConnectDecision::Connect;
    }

    let stale = chrono::Duration::seconds(HEARTBEAT_STALE.as_secs() as i64);
    match heartbeat_at {
        Some(seen_at) if now.signed_duration_since(seen_at) > stale => ConnectDecision::DeferRetry,
        _ => ConnectDecision::Connect,
    }
}

pub struct SessionHandle {
    session_id: String,
    audio_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    state_rx: watch::Receiver<SessionState>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Outbound audio channel. Chunks are forwarded in production order;
    /// once the session is stopping, late sends simply fail and are dropped.
    pub fn audio_sender(&self) -> mpsc::Sender<Bytes> {
        self.audio_tx.clone()
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Begins the stop sequence without waiting for it to finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Caller-initiated stop: end signal, grace wait, close, then join.
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the duplex session for `client`'s session id.
///
/// Returns `None` when a socket is already open for that id; the existing
/// session keeps running untouched.
pub fn spawn_session(
    client: SubscribeClient,
    options: SessionOptions,
    callbacks: SessionCallbacks,
    sink: Option<Arc<dyn PlaybackSink>>,
    registry: &ConnectionRegistry,
) -> Option<SessionHandle> {
    let session_id = client.session_id().to_string();
    let Some(guard) = registry.try_acquire(&session_id) else {
        tracing::warn!(%session_id, "session_already_open");
        return None;
    };

    let (audio_tx, audio_rx) = mpsc::channel(OUTBOUND_AUDIO_BUFFER);
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let cancel = CancellationToken::new();

    let connect = move || {
        let client = client.clone();
        async move { client.connect().await }
    };

    let task = tokio::spawn(run(
        session_id.clone(),
        connect,
        options,
        callbacks,
        sink,
        audio_rx,
        cancel.clone(),
        state_tx,
        guard,
    ));

    Some(SessionHandle {
        session_id,
        audio_tx,
        cancel,
        state_rx,
        task,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    /// Caller-initiated stop completed.
    Stopped,
    /// Server signaled an explicit end of session.
    Ended,
    PeerClosed,
    IdleTimeout,
    NoAudio,
    Transport,
}

enum LoopAction {
    Continue,
    Break(CloseReason),
}

#[allow(clippy::too_many_arguments)]
async fn run<S, C, F>(
    session_id: String,
    connect: C,
    options: SessionOptions,
    callbacks: SessionCallbacks,
    sink: Option<Arc<dyn PlaybackSink>>,
    mut audio_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
    state_tx: watch::Sender<SessionState>,
    _guard: ConnectionGuard,
) where
    C: Fn() -> F + Send,
    F: Future<Output = Result<S, Error>> + Send,
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin + Send,
{
    let mut is_retry = false;
    let mut failed_connects: u32 = 0;

    let reason = loop {
        if cancel.is_cancelled() {
            break CloseReason::Stopped;
        }

        if connect_precondition(options.heartbeat_at, Utc::now(), is_retry)
            == ConnectDecision::DeferRetry
        {
            tracing::info!(%session_id, delay = ?RETRY_DELAY, "heartbeat_stale_defer_connect");
            let _ = state_tx.send(SessionState::Retrying);
            is_retry = true;
            tokio::select! {
                _ = cancel.cancelled() => break CloseReason::Stopped,
                _ = tokio::time::sleep(RETRY_DELAY) => {}
            }
            continue;
        }

        let _ = state_tx.send(SessionState::Connecting);
        let transport = tokio::select! {
            _ = cancel.cancelled() => break CloseReason::Stopped,
            result = connect() => match result {
                Ok(t) => t,
                Err(error) => {
                    tracing::warn!(%session_id, %error, "subscribe_connect_failed");
                    (callbacks.on_error)(error);

                    failed_connects += 1;
                    if let Some(max) = options.max_retries
                        && failed_connects > max
                    {
                        tracing::error!(%session_id, failed_connects, "retries_exhausted");
                        let _ = state_tx.send(SessionState::Failed);
                        (callbacks.on_session_ended)();
                        return;
                    }

                    let _ = state_tx.send(SessionState::Retrying);
                    is_retry = true;
                    tokio::select! {
                        _ = cancel.cancelled() => break CloseReason::Stopped,
                        _ = tokio::time::sleep(RETRY_DELAY) => {}
                    }
                    continue;
                }
            }
        };

        failed_connects = 0;
        let _ = state_tx.send(SessionState::Open);

        let reason = drive(
            transport,
            &options,
            &callbacks,
            sink.as_ref(),
            &mut audio_rx,
            &cancel,
            &state_tx,
        )
        .await;

        match reason {
            CloseReason::Stopped | CloseReason::Ended => break reason,
            other => {
                if cancel.is_cancelled() {
                    break CloseReason::Stopped;
                }
                tracing::info!(%session_id, reason = ?other, delay = ?RETRY_DELAY, "session_closed_scheduling_retry");
                let _ = state_tx.send(SessionState::Retrying);
                is_retry = true;
                tokio::select! {
                    _ = cancel.cancelled() => break CloseReason::Stopped,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    };

    tracing::info!(%session_id, ?reason, "session_finished");
    let _ = state_tx.send(SessionState::Idle);
    (callbacks.on_session_ended)();
}

/// One open socket's event loop. Inbound frames are handled strictly in
/// arrival order; decoding and reconciliation callbacks never yield between
/// frames, so a merge can never interleave with a newly arriving frame.
async fn drive<S>(
    transport: S,
    options: &SessionOptions,
    callbacks: &SessionCallbacks,
    sink: Option<&Arc<dyn PlaybackSink>>,
    audio_rx: &mut mpsc::Receiver<Bytes>,
    cancel: &CancellationToken,
    state_tx: &watch::Sender<SessionState>,
) -> CloseReason
where
    S: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    let (mut ws_tx, mut ws_rx) = transport.split();

    (callbacks.on_connection_state_change)(true);
    (callbacks.on_ready)();

    let mut receiving_audio = false;
    let mut outbound_open = true;

    // Armed at open: if the upstream producer never starts sending audio,
    // force-close rather than sit on a silent socket.
    let audio_arm = tokio::time::sleep(AUDIO_ARM_TIMEOUT);
    tokio::pin!(audio_arm);

    // Reset on every inbound message; detects a silently-vanished peer when
    // no close frame ever arrives.
    let idle = tokio::time::sleep(IDLE_TIMEOUT);
    tokio::pin!(idle);

    let reason = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = state_tx.send(SessionState::Closing);

                // Signal, wait for in-flight delivery, then close. Closing
                // immediately risks the end signal being dropped mid-flight.
                let end = Message::Text(OutboundControl::EndSession.to_json().into());
                if let Err(error) = ws_tx.send(end).await {
                    tracing::debug!(%error, "end_signal_send_failed");
                }
                tokio::time::sleep(END_GRACE).await;
                let _ = ws_tx.close().await;
                break CloseReason::Stopped;
            }
            _ = &mut audio_arm, if !receiving_audio => {
                tracing::warn!("no_audio_within_arm_window");
                let _ = ws_tx.close().await;
                break CloseReason::NoAudio;
            }
            _ = &mut idle => {
                tracing::warn!("inbound_idle_timeout");
                let _ = ws_tx.close().await;
                break CloseReason::IdleTimeout;
            }
            chunk = audio_rx.recv(), if outbound_open => {
                match chunk {
                    Some(pcm) => {
                        let encoded = visit_wire::encode_audio(pcm);
                        if let Err(error) = ws_tx.send(Message::Binary(encoded)).await {
                            tracing::warn!(%error, "outbound_audio_send_failed");
                            break CloseReason::Transport;
                        }
                    }
                    None => outbound_open = false,
                }
            }
            msg = ws_rx.next() => {
                let Some(msg) = msg else {
                    break CloseReason::PeerClosed;
                };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(error) => {
                        tracing::warn!(%error, "websocket_receive_error");
                        (callbacks.on_error)(error.into());
                        break CloseReason::Transport;
                    }
                };

                idle.as_mut().reset(tokio::time::Instant::now() + IDLE_TIMEOUT);

                match handle_message(msg, options, callbacks, sink, &mut receiving_audio).await {
                    LoopAction::Continue => {}
                    LoopAction::Break(reason) => {
                        let _ = ws_tx.close().await;
                        break reason;
                    }
                }
            }
        }
    };

    (callbacks.on_connection_state_change)(false);
    if let Some(sink) = sink {
        if let Err(error) = sink.stop().await {
            tracing::debug!(%error, "playback_sink_stop_failed");
        }
    }

    reason
}

async fn handle_message(
    msg: Message,
    options: &SessionOptions,
    callbacks: &SessionCallbacks,
    sink: Option<&Arc<dyn PlaybackSink>>,
    receiving_audio: &mut bool,
) -> LoopAction {
    let raw = match msg {
        Message::Binary(bytes) => RawMessage::Binary(bytes),
        Message::Text(text) => RawMessage::Text(text.as_str().to_owned()),
        Message::Close(_) => return LoopAction::Break(CloseReason::PeerClosed),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return LoopAction::Continue,
    };

    let frame = match visit_wire::decode(raw) {
        Ok(Some(frame)) => frame,
        Ok(None) => return LoopAction::Continue,
        Err(error) => {
            // One bad frame never tears the session down.
            tracing::warn!(%error, "dropped_malformed_frame");
            return LoopAction::Continue;
        }
    };

    match frame {
        Frame::Audio(pcm) => {
            if !*receiving_audio {
                *receiving_audio = true;
                tracing::debug!("first_audio_frame");
            }
            if options.playback_enabled
                && let Some(sink) = sink
            {
                let encoded = BASE64.encode(&pcm);
                if let Err(error) = sink.stream_chunk(encoded).await {
                    tracing::warn!(%error, "playback_chunk_failed");
                }
            }
            LoopAction::Continue
        }
        Frame::Control(ControlMessage::CachedTurns { turns }) => {
            let converted = visit_transcript::turns_from_snapshot(&turns);
            (callbacks.on_cached_turns_update)(converted);
            LoopAction::Continue
        }
        Frame::Control(ControlMessage::ProactiveSuggestions { data }) => {
            (callbacks.on_proactive_suggestions)(data);
            LoopAction::Continue
        }
        Frame::Control(ControlMessage::SessionEnded) => LoopAction::Break(CloseReason::Ended),
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::task::{Context, Poll};

    use visit_audio_interface::{AudioError, BoxFuture, PlaybackConfig, PlaybackStatus};

    use super::*;

    struct FakeTransport {
        incoming: mpsc::UnboundedReceiver<Result<Message, WsError>>,
        outgoing: mpsc::UnboundedSender<Message>,
    }

    impl Stream for FakeTransport {
        type Item = Result<Message, WsError>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            self.get_mut().incoming.poll_recv(cx)
        }
    }

    impl Sink<Message> for FakeTransport {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            self.get_mut()
                .outgoing
                .send(item)
                .map_err(|_| WsError::ConnectionClosed)
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }
    }

    fn fake_transport() -> (
        mpsc::UnboundedSender<Result<Message, WsError>>,
        mpsc::UnboundedReceiver<Message>,
        FakeTransport,
    ) {
        let (in_tx, incoming) = mpsc::unbounded_channel();
        let (outgoing, out_rx) = mpsc::unbounded_channel();
        (in_tx, out_rx, FakeTransport { incoming, outgoing })
    }

    fn tagged(tag: u8, payload: &[u8]) -> Bytes {
        let mut buf = Vec::with_capacity(payload.len() + 1);
        buf.push(tag);
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    fn audio_frame(pcm: &[u8]) -> Message {
        Message::Binary(tagged(visit_wire::AUDIO_TAG, pcm))
    }

    fn control_frame(json: &serde_json::Value) -> Message {
        let payload = serde_json::to_vec(json).unwrap();
        Message::Binary(tagged(visit_wire::CONTROL_TAG, &payload))
    }

    struct CapturingSink {
        chunks: Mutex<Vec<String>>,
    }

    impl CapturingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                chunks: Mutex::new(Vec::new()),
            })
        }
    }

    impl PlaybackSink for CapturingSink {
        fn initialize(&self, _config: PlaybackConfig) -> BoxFuture<'_, Result<(), AudioError>> {
            Box::pin(async { Ok(()) })
        }

        fn stream_chunk(&self, base64_pcm: String) -> BoxFuture<'_, Result<(), AudioError>> {
            self.chunks.lock().unwrap().push(base64_pcm);
            Box::pin(async { Ok(()) })
        }

        fn start(&self) -> BoxFuture<'_, Result<(), AudioError>> {
            Box::pin(async { Ok(()) })
        }

        fn stop(&self) -> BoxFuture<'_, Result<(), AudioError>> {
            Box::pin(async { Ok(()) })
        }

        fn flush(&self) -> BoxFuture<'_, Result<(), AudioError>> {
            Box::pin(async { Ok(()) })
        }

        fn status(&self) -> PlaybackStatus {
            PlaybackStatus::default()
        }
    }

    fn test_state_tx() -> watch::Sender<SessionState> {
        watch::channel(SessionState::Open).0
    }

    #[test]
    fn heartbeat_stale_defers_first_attempt_only() {
        let now = Utc::now();
        let stale = Some(now - chrono::Duration::seconds(11));
        let fresh = Some(now - chrono::Duration::seconds(3));

        assert_eq!(
            connect_precondition(stale, now, false),
            ConnectDecision::DeferRetry
        );
        assert_eq!(
            connect_precondition(stale, now, true),
            ConnectDecision::Connect
        );
        assert_eq!(
            connect_precondition(fresh, now, false),
            ConnectDecision::Connect
        );
        assert_eq!(connect_precondition(None, now, false), ConnectDecision::Connect);
    }

    #[tokio::test(start_paused = true)]
    async fn force_closes_when_no_audio_arrives() {
        let (_in_tx, _out_rx, transport) = fake_transport();
        let (_audio_tx, mut audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        let started = tokio::time::Instant::now();
        let reason = drive(
            transport,
            &SessionOptions::default(),
            &SessionCallbacks::default(),
            None,
            &mut audio_rx,
            &cancel,
            &state_tx,
        )
        .await;

        assert_eq!(reason, CloseReason::NoAudio);
        assert_eq!(started.elapsed(), AUDIO_ARM_TIMEOUT, "not a moment earlier");
    }

    #[tokio::test(start_paused = true)]
    async fn force_closes_after_inbound_goes_idle() {
        let (in_tx, _out_rx, transport) = fake_transport();
        let (_audio_tx, mut audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        in_tx.send(Ok(audio_frame(&[1, 2, 3, 4]))).unwrap();

        let started = tokio::time::Instant::now();
        let reason = drive(
            transport,
            &SessionOptions::default(),
            &SessionCallbacks::default(),
            None,
            &mut audio_rx,
            &cancel,
            &state_tx,
        )
        .await;

        assert_eq!(reason, CloseReason::IdleTimeout);
        assert_eq!(started.elapsed(), IDLE_TIMEOUT);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_sends_end_signal_then_waits_grace_before_close() {
        let (_in_tx, mut out_rx, transport) = fake_transport();
        let (_audio_tx, audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut audio_rx = audio_rx;
                let started = tokio::time::Instant::now();
                let reason = drive(
                    transport,
                    &SessionOptions::default(),
                    &SessionCallbacks::default(),
                    None,
                    &mut audio_rx,
                    &cancel,
                    &state_tx,
                )
                .await;
                (reason, started.elapsed())
            }
        });

        cancel.cancel();
        let (reason, elapsed) = task.await.unwrap();

        assert_eq!(reason, CloseReason::Stopped);
        assert!(elapsed >= END_GRACE, "close must wait the grace period");

        let sent = out_rx.recv().await.unwrap();
        assert_eq!(
            sent,
            Message::Text(r#"{"type":"end_session"}"#.into()),
            "end signal precedes close"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cached_turns_snapshot_reaches_callback_converted() {
        let (in_tx, _out_rx, transport) = fake_transport();
        let (_audio_tx, mut audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        let received: Arc<Mutex<Vec<Vec<Turn>>>> = Arc::new(Mutex::new(Vec::new()));
        let callbacks = SessionCallbacks {
            on_cached_turns_update: Box::new({
                let received = received.clone();
                move |turns| received.lock().unwrap().push(turns)
            }),
            ..Default::default()
        };

        in_tx
            .send(Ok(control_frame(&serde_json::json!({
                "type": "cached_turns",
                "turns": [
                    {"provider_result_id": "b", "turn_index": 1, "text": "world"},
                    {"provider_result_id": "a", "turn_index": 0, "text": "hello"},
                    {"provider_result_id": "", "turn_index": 2, "text": "invalid"},
                ],
            }))))
            .unwrap();
        drop(in_tx);

        let reason = drive(
            transport,
            &SessionOptions::default(),
            &callbacks,
            None,
            &mut audio_rx,
            &cancel,
            &state_tx,
        )
        .await;

        assert_eq!(reason, CloseReason::PeerClosed);

        let snapshots = received.lock().unwrap();
        assert_eq!(snapshots.len(), 1);
        let texts: Vec<_> = snapshots[0].iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, ["hello", "world"], "validated, sorted, converted");
    }

    #[tokio::test(start_paused = true)]
    async fn audio_forwarded_to_sink_only_when_playback_enabled() {
        for (enabled, expected_chunks) in [(true, 1usize), (false, 0usize)] {
            let (in_tx, _out_rx, transport) = fake_transport();
            let (_audio_tx, mut audio_rx) = mpsc::channel(8);
            let cancel = CancellationToken::new();
            let state_tx = test_state_tx();
            let sink = CapturingSink::new();

            in_tx.send(Ok(audio_frame(&[9, 9, 9, 9]))).unwrap();
            drop(in_tx);

            let options = SessionOptions {
                playback_enabled: enabled,
                ..Default::default()
            };
            let sink_dyn: Arc<dyn PlaybackSink> = sink.clone();
            drive(
                transport,
                &options,
                &SessionCallbacks::default(),
                Some(&sink_dyn),
                &mut audio_rx,
                &cancel,
                &state_tx,
            )
            .await;

            let chunks = sink.chunks.lock().unwrap();
            assert_eq!(chunks.len(), expected_chunks, "playback_enabled={enabled}");
            if enabled {
                assert_eq!(chunks[0], BASE64.encode([9u8, 9, 9, 9]));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_frame_is_dropped_session_continues() {
        let (in_tx, _out_rx, transport) = fake_transport();
        let (_audio_tx, mut audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        in_tx
            .send(Ok(Message::Binary(tagged(
                visit_wire::CONTROL_TAG,
                b"{not json",
            ))))
            .unwrap();
        in_tx.send(Ok(audio_frame(&[1, 2]))).unwrap();
        drop(in_tx);

        let reason = drive(
            transport,
            &SessionOptions::default(),
            &SessionCallbacks::default(),
            None,
            &mut audio_rx,
            &cancel,
            &state_tx,
        )
        .await;

        // Reached PeerClosed, meaning the bad frame did not break the loop.
        assert_eq!(reason, CloseReason::PeerClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn outbound_audio_chunks_sent_in_production_order() {
        let (_in_tx, mut out_rx, transport) = fake_transport();
        let (audio_tx, audio_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let state_tx = test_state_tx();

        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                let mut audio_rx = audio_rx;
                drive(
                    transport,
                    &SessionOptions::default(),
                    &SessionCallbacks::default(),
                    None,
                    &mut audio_rx,
                    &cancel,
                    &state_tx,
                )
                .await
            }
        });

        audio_tx.send(Bytes::from_static(&[1])).await.unwrap();
        audio_tx.send(Bytes::from_static(&[2])).await.unwrap();

        assert_eq!(out_rx.recv().await.unwrap(), Message::Binary(Bytes::from_static(&[1])));
        assert_eq!(out_rx.recv().await.unwrap(), Message::Binary(Bytes::from_static(&[2])));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), CloseReason::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_heartbeat_schedules_single_probe_then_connects() {
        let connect_times: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();

        let registry = ConnectionRegistry::new();
        let guard = registry.try_acquire("s1").unwrap();
        let (_audio_tx, audio_rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();

        let connect = {
            let connect_times = connect_times.clone();
            let cancel = cancel.clone();
            move || {
                connect_times.lock().unwrap().push(started.elapsed());
                // First (and only) connect attempt: stop the session so the
                // run loop terminates.
                cancel.cancel();
                async { Err::<FakeTransport, _>(Error::Ws(WsError::ConnectionClosed)) }
            }
        };

        let options = SessionOptions {
            heartbeat_at: Some(Utc::now() - chrono::Duration::seconds(11)),
            ..Default::default()
        };

        run(
            "s1".to_string(),
            connect,
            options,
            SessionCallbacks::default(),
            None,
            audio_rx,
            cancel.clone(),
            state_tx,
            guard,
        )
        .await;

        let times = connect_times.lock().unwrap();
        assert_eq!(times.len(), 1, "exactly one probe");
        assert_eq!(times[0], RETRY_DELAY, "probe deferred by the retry delay");
    }

    #[tokio::test(start_paused = true)]
    async fn peer_close_while_active_reconnects_after_retry_delay() {
        let connect_times: Arc<Mutex<Vec<Duration>>> = Arc::new(Mutex::new(Vec::new()));
        let started = tokio::time::Instant::now();

        let registry = ConnectionRegistry::new();
        let guard = registry.try_acquire("s1").unwrap();
        let (_audio_tx, audio_rx) = mpsc::channel(8);
        let (state_tx, _state_rx) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();

        // First transport delivers one audio frame, then the peer closes.
        let (in_tx, _out_rx, transport) = fake_transport();
        in_tx.send(Ok(audio_frame(&[1, 2]))).unwrap();
        drop(in_tx);

        let first = Mutex::new(Some(transport));
        let connect = {
            let connect_times = connect_times.clone();
            let cancel = cancel.clone();
            move || {
                connect_times.lock().unwrap().push(started.elapsed());
                let transport = first.lock().unwrap().take();
                if transport.is_none() {
                    // Second attempt: end the session instead of opening.
                    cancel.cancel();
                }
                async move {
                    match transport {
                        Some(t) => Ok(t),
                        None => Err(Error::Ws(WsError::ConnectionClosed)),
                    }
                }
            }
        };

        run(
            "s1".to_string(),
            connect,
            SessionOptions::default(),
            SessionCallbacks::default(),
            None,
            audio_rx,
            cancel,
            state_tx,
            guard,
        )
        .await;

        let times = connect_times.lock().unwrap();
        assert_eq!(times.len(), 2, "peer close schedules a reconnect");
        assert_eq!(times[0], Duration::ZERO);
        assert_eq!(
            times[1] - times[0],
            RETRY_DELAY,
            "reconnect exactly one retry delay after the close"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_exhausted_reaches_failed_state() {
        let registry = ConnectionRegistry::new();
        let guard = registry.try_acquire("s1").unwrap();
        let (_audio_tx, audio_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let cancel = CancellationToken::new();

        let ended = Arc::new(Mutex::new(0usize));
        let callbacks = SessionCallbacks {
            on_session_ended: Box::new({
                let ended = ended.clone();
                move || *ended.lock().unwrap() += 1
            }),
            ..Default::default()
        };

        let connect = || async { Err::<FakeTransport, _>(Error::Ws(WsError::ConnectionClosed)) };

        let options = SessionOptions {
            max_retries: Some(2),
            ..Default::default()
        };

        run(
            "s1".to_string(),
            connect,
            options,
            callbacks,
            None,
            audio_rx,
            cancel,
            state_tx,
            guard,
        )
        .await;

        assert_eq!(*state_rx.borrow(), SessionState::Failed);
        assert_eq!(*ended.lock().unwrap(), 1, "completion fires exactly once");
    }
}
