use std::sync::Arc;

use bytes::Bytes;
use recorder_core::{
    RecorderRuntime, SessionDataEvent, SessionErrorEvent, SessionLifecycleEvent,
    actors::{RootActor, RootArgs, RootMsg, StartParams},
};
use ractor::Actor;
use visit_audio_interface::{
    AudioChunk, AudioError, BoxFuture, CaptureObserver, CaptureSource, SAMPLE_RATE,
};

struct CliRuntime;

impl RecorderRuntime for CliRuntime {
    fn emit_lifecycle(&self, event: SessionLifecycleEvent) {
        match &event {
            SessionLifecycleEvent::Active { session_id } => {
                eprintln!("[lifecycle] active session={session_id}");
            }
            SessionLifecycleEvent::Retrying { session_id } => {
                eprintln!("[lifecycle] retrying session={session_id}");
            }
            SessionLifecycleEvent::Finalizing { session_id } => {
                eprintln!("[lifecycle] finalizing session={session_id}");
            }
            SessionLifecycleEvent::Inactive { session_id, error } => {
                eprintln!("[lifecycle] inactive session={session_id} error={error:?}");
            }
        }
    }

    fn emit_data(&self, event: SessionDataEvent) {
        match &event {
            SessionDataEvent::TurnsUpdated { turns, .. } => {
                for turn in turns {
                    println!("[{}] {}: {}", turn.turn_index, turn.speaker, turn.text);
                }
            }
            SessionDataEvent::ProactiveSuggestions { data, .. } => {
                println!("{}", serde_json::to_string(data).unwrap_or_default());
            }
        }
    }

    fn emit_error(&self, event: SessionErrorEvent) {
        match &event {
            SessionErrorEvent::ConnectionError { error, .. } => {
                eprintln!("[error] connection: {error}");
            }
            SessionErrorEvent::AudioError { error, .. } => {
                eprintln!("[error] audio: {error}");
            }
        }
    }
}

/// Stand-in microphone that emits 100 ms of silence per tick. Useful for
/// exercising the full pipeline against a server without real audio input.
struct SilenceSource {
    task: Option<tokio::task::JoinHandle<()>>,
}

impl CaptureSource for SilenceSource {
    fn start(&mut self, observer: Arc<dyn CaptureObserver>) -> Result<(), AudioError> {
        observer.on_status_change(true);
        let task = tokio::spawn(async move {
            // PCM16 mono: 2 bytes per sample.
            let chunk_len = (SAMPLE_RATE as usize / 10) * 2;
            let silence = Bytes::from(vec![0u8; chunk_len]);
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
            loop {
                ticker.tick().await;
                observer.on_audio_chunk(AudioChunk::new(silence.clone()));
            }
        });
        self.task = Some(task);
        Ok(())
    }

    fn stop(&mut self) -> BoxFuture<'_, Result<(), AudioError>> {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        Box::pin(async { Ok(()) })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .init();

    let api_base = std::env::var("VISIT_API_BASE").unwrap_or_else(|_| {
        eprintln!("Usage: VISIT_API_BASE=... VISIT_API_KEY=... cargo run --example cli");
        eprintln!();
        eprintln!("  VISIT_API_BASE     transcription API base URL (required)");
        eprintln!("  VISIT_API_KEY      API key (default: empty)");
        eprintln!("  VISIT_SESSION_ID   session to open (default: random)");
        eprintln!("  VISIT_COMPANY_ID   company scope (default: none)");
        eprintln!("  VISIT_PLAYBACK     forward inbound audio to sink (default: false)");
        std::process::exit(1);
    });

    let api_key = std::env::var("VISIT_API_KEY").unwrap_or_default();
    let session_id = std::env::var("VISIT_SESSION_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    let company_id = std::env::var("VISIT_COMPANY_ID").ok();
    let playback_enabled = std::env::var("VISIT_PLAYBACK")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let (root_ref, _handle) = Actor::spawn(
        Some(RootActor::name()),
        RootActor,
        RootArgs {
            runtime: Arc::new(CliRuntime),
            playback: None,
        },
    )
    .await
    .expect("failed to spawn root actor");

    eprintln!("Starting transcription for {session_id}...");
    eprintln!("Press Ctrl+C to stop.");
    eprintln!();

    let params = StartParams {
        session_id: session_id.clone(),
        company_id,
        api_base,
        api_key,
        playback_enabled,
        heartbeat_at: None,
        max_retries: Some(5),
    };
    let capture: Box<dyn CaptureSource> = Box::new(SilenceSource { task: None });

    let started = ractor::call!(root_ref, RootMsg::StartTranscription, params, capture)
        .expect("failed to send start message");

    if !started {
        eprintln!("Failed to start transcription");
        std::process::exit(1);
    }

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    eprintln!();
    eprintln!("Stopping...");
    ractor::call!(root_ref, RootMsg::StopTranscription).expect("failed to send stop message");
}
