//! End-to-end runtime tests against scripted capability fakes.
//!
//! Every fake follows the channel-job shape of the real capabilities: the
//! voice probe echoes a score encoded in the first audio sample, the
//! transcriber emits one final transcript when its utterance closes, and
//! the language model can either play a script or be driven chunk by
//! chunk from the test.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wren::capability::{
    AudioChunk, Capabilities, GenerationChunk, GenerationRequest, GenerationStream, LanguageModel,
    ScoredChunk, SpeechSynthesis, SpeechToText, SynthesisJob, TranscribeJob, TranscriptChunk,
    TurnPredictor, VoiceProbe, VoiceProbeJob,
};
use wren::context::Context;
use wren::error::{AgentError, Result};
use wren::event::bus::{EventSelector, WaitTarget};
use wren::event::{Event, EventPayload, EventSource};
use wren::message::{Message, Role};
use wren::provider::{ActionDefinition, ActionOutcome, ActionProvider, ProviderSet};
use wren::transport::{ClientEvent, Transport};
use wren::{AgentConfig, AgentServer};

// ── Capability fakes ──────────────────────────────────────────

/// Classifier that reads the score out of each chunk's first sample.
struct EchoProbe;

#[async_trait]
impl VoiceProbe for EchoProbe {
    async fn detect(&self) -> Result<VoiceProbeJob> {
        let (input, mut in_rx) = mpsc::channel::<AudioChunk>(64);
        let (out_tx, output) = mpsc::channel::<ScoredChunk>(64);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            while let Some(chunk) = in_rx.recv().await {
                if stop.is_cancelled() {
                    break;
                }
                let score = chunk.samples.first().copied().unwrap_or(0.0);
                if out_tx.send(ScoredChunk { score, chunk }).await.is_err() {
                    break;
                }
            }
        });
        Ok(VoiceProbeJob {
            input,
            output,
            cancel,
        })
    }
}

/// Transcriber that emits one final transcript when the utterance closes.
struct OneShotStt;

#[async_trait]
impl SpeechToText for OneShotStt {
    async fn transcribe(&self) -> Result<TranscribeJob> {
        let (input, mut in_rx) = mpsc::channel::<AudioChunk>(64);
        let (out_tx, output) = mpsc::channel::<TranscriptChunk>(8);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            let mut heard = 0_usize;
            while let Some(_chunk) = in_rx.recv().await {
                heard += 1;
            }
            if heard > 0 && !stop.is_cancelled() {
                let _ = out_tx
                    .send(TranscriptChunk {
                        text: "hello there".into(),
                        is_final: true,
                    })
                    .await;
            }
        });
        Ok(TranscribeJob {
            input,
            output,
            cancel,
        })
    }
}

struct FixedPredictor {
    probability: f32,
}

#[async_trait]
impl TurnPredictor for FixedPredictor {
    async fn predict(&self, _messages: &[Message]) -> Result<f32> {
        Ok(self.probability)
    }
}

/// Language model whose stream either plays a fixed script or is driven
/// from the test through `stream_tx`.
#[derive(Default)]
struct ScriptedModel {
    script: Mutex<Option<Vec<GenerationChunk>>>,
    stream_tx: Mutex<Option<mpsc::Sender<GenerationChunk>>>,
    cancels: Mutex<Vec<CancellationToken>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedModel {
    fn with_script(chunks: Vec<GenerationChunk>) -> Self {
        Self {
            script: Mutex::new(Some(chunks)),
            ..Self::default()
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().expect("requests").len()
    }

    fn drive(&self) -> mpsc::Sender<GenerationChunk> {
        self.stream_tx
            .lock()
            .expect("stream")
            .clone()
            .expect("no stream open")
    }

    fn last_cancel(&self) -> CancellationToken {
        self.cancels
            .lock()
            .expect("cancels")
            .last()
            .expect("no generation started")
            .clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn generate_message(&self, request: GenerationRequest) -> Result<GenerationStream> {
        self.requests.lock().expect("requests").push(request);
        let (tx, chunks) = mpsc::channel::<GenerationChunk>(32);
        let cancel = CancellationToken::new();
        self.cancels.lock().expect("cancels").push(cancel.clone());

        if let Some(script) = self.script.lock().expect("script").clone() {
            tokio::spawn(async move {
                for chunk in script {
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(GenerationChunk::End).await;
            });
        } else {
            *self.stream_tx.lock().expect("stream") = Some(tx);
        }
        Ok(GenerationStream { chunks, cancel })
    }

    async fn generate_object(
        &self,
        _messages: &[Message],
        _schema: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        Ok(serde_json::json!({"respond": true}))
    }
}

/// Synthesizer producing one audio chunk per text fragment.
struct EchoTts;

#[async_trait]
impl SpeechSynthesis for EchoTts {
    async fn synthesize(&self) -> Result<SynthesisJob> {
        let (input, mut in_rx) = mpsc::channel::<String>(32);
        let (out_tx, output) = mpsc::channel::<AudioChunk>(32);
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            while let Some(text) = in_rx.recv().await {
                let chunk = AudioChunk {
                    samples: vec![0.25; text.len().max(1)],
                    sample_rate: 24_000,
                };
                if out_tx.send(chunk).await.is_err() {
                    break;
                }
            }
        });
        Ok(SynthesisJob {
            input,
            output,
            cancel,
        })
    }
}

// ── Transport fake ────────────────────────────────────────────

#[derive(Default)]
struct FakeTransport {
    client_tx: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    sent_text: Mutex<Vec<String>>,
    sent_audio: Mutex<Vec<AudioChunk>>,
    joined: Mutex<bool>,
}

impl FakeTransport {
    fn text_out(&self) -> String {
        self.sent_text.lock().expect("text").concat()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn join_room(&self, _name: &str, _token: &str) -> Result<()> {
        *self.joined.lock().expect("joined") = true;
        Ok(())
    }

    async fn leave_room(&self) -> Result<()> {
        *self.joined.lock().expect("joined") = false;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.client_tx.lock().expect("client") = Some(tx);
        rx
    }

    async fn stream_audio_chunk(&self, chunk: AudioChunk) -> Result<()> {
        self.sent_audio.lock().expect("audio").push(chunk);
        Ok(())
    }

    async fn stream_text(&self, _topic: &str, text: &str) -> Result<()> {
        self.sent_text.lock().expect("text").push(text.to_owned());
        Ok(())
    }
}

// ── Harness ───────────────────────────────────────────────────

struct Harness {
    server: AgentServer,
    model: Arc<ScriptedModel>,
    transport: Arc<FakeTransport>,
    seen: Arc<Mutex<Vec<Event>>>,
}

fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.vad.pre_padding_chunks = 2;
    config.vad.post_padding_chunks = 1;
    config.vad.min_interruption_ms = 100;
    config.turn.threshold = 0.7;
    config.turn.min_timeout_ms = 10;
    config.turn.max_timeout_ms = 200;
    config
}

fn build(config: AgentConfig, model: ScriptedModel, probability: f32) -> Harness {
    let model = Arc::new(model);
    let transport = Arc::new(FakeTransport::default());
    let capabilities = Capabilities {
        voice_probe: Arc::new(EchoProbe),
        speech_to_text: Arc::new(OneShotStt),
        turn_predictor: Arc::new(FixedPredictor { probability }),
        language_model: Arc::clone(&model) as Arc<dyn LanguageModel>,
        speech_synthesis: Arc::new(EchoTts),
    };
    let initial_context = Context {
        voice_enabled: true,
        ..Context::default()
    };
    let server = AgentServer::new(
        config,
        initial_context,
        capabilities,
        ProviderSet::default(),
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .expect("construct agent");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = Arc::clone(&seen);
    server.events().on(EventSelector::Any, move |event| {
        seen_clone.lock().expect("seen").push(event.clone());
    });

    Harness {
        server,
        model,
        transport,
        seen,
    }
}

impl Harness {
    fn names(&self) -> Vec<String> {
        self.seen
            .lock()
            .expect("seen")
            .iter()
            .map(|e| e.name().to_owned())
            .collect()
    }

    async fn emit_and_wait(&self, payload: EventPayload) {
        let bus = self.server.events();
        let id = bus
            .emit(payload, false, EventSource::server())
            .expect("emit");
        bus.wait(&id, WaitTarget::All).await.expect("wait");
    }

    /// Feed one 50ms audio frame whose first sample doubles as the VAD
    /// score for the echo probe.
    async fn feed_audio(&self, score: f32) {
        self.emit_and_wait(EventPayload::AudioFrame {
            chunk: AudioChunk {
                samples: vec![score; 800],
                sample_rate: 16_000,
            },
        })
        .await;
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

// ── Tests ─────────────────────────────────────────────────────

#[tokio::test]
async fn incoming_text_chunks_fold_into_one_user_message() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    harness
        .emit_and_wait(EventPayload::Text {
            chunk: "Hi".into(),
            is_final: false,
        })
        .await;
    harness
        .emit_and_wait(EventPayload::Text {
            chunk: " there".into(),
            is_final: false,
        })
        .await;

    let messages = harness.server.context().get().messages;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role(), Role::User);
    assert_eq!(messages[0].body.content(), "Hi there");

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn completed_wait_resolves_again_without_timeout() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    let bus = harness.server.events();
    let id = bus
        .emit(
            EventPayload::Text {
                chunk: "Hi".into(),
                is_final: false,
            },
            false,
            EventSource::server(),
        )
        .expect("emit");
    bus.wait(&id, WaitTarget::All).await.expect("first wait");

    // The history already holds the results; a second wait must not take
    // the timeout path.
    let started = Instant::now();
    let records = bus
        .wait(&id, WaitTarget::Handler("transcript".into()))
        .await
        .expect("second wait");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(records[0].result.is_ok());

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn invalid_config_fails_construction() {
    let mut config = test_config();
    config.vad.score_out_threshold = 0.9; // above the in-threshold

    let transport = Arc::new(FakeTransport::default());
    let capabilities = Capabilities {
        voice_probe: Arc::new(EchoProbe),
        speech_to_text: Arc::new(OneShotStt),
        turn_predictor: Arc::new(FixedPredictor { probability: 0.5 }),
        language_model: Arc::new(ScriptedModel::default()),
        speech_synthesis: Arc::new(EchoTts),
    };
    let result = AgentServer::new(
        config,
        Context::default(),
        capabilities,
        ProviderSet::default(),
        transport,
    );
    assert!(matches!(result, Err(AgentError::Validation(_))));
}

#[tokio::test]
async fn voice_turn_runs_through_generation_to_transport() {
    let model = ScriptedModel::with_script(vec![GenerationChunk::Content {
        text: "Hello!".into(),
    }]);
    let harness = build(test_config(), model, 0.95);
    harness.server.start().await.expect("start");

    // Silence fills the pre-padding ring, then speech opens the segment.
    harness.feed_audio(0.1).await;
    harness.feed_audio(0.1).await;
    harness.feed_audio(0.6).await;

    {
        let harness = &harness;
        eventually("voice-start before first voice chunk", move || {
            let names = harness.names();
            let start = names.iter().position(|n| n == "incoming-voice-start");
            let voice = names.iter().position(|n| n == "incoming-voice");
            matches!((start, voice), (Some(s), Some(v)) if s < v)
        })
        .await;
    }

    // One silent chunk exhausts the post-padding and closes the segment;
    // the transcriber then delivers its final text.
    harness.feed_audio(0.1).await;
    {
        let harness = &harness;
        eventually("transcript reaches the message log", move || {
            harness
                .server
                .context()
                .get()
                .messages
                .iter()
                .any(|m| m.role() == Role::User && m.body.content() == "hello there")
        })
        .await;
    }

    // High end-of-turn confidence answers with an urgent continue, the
    // scripted model streams its reply, and the reply reaches the room.
    {
        let harness = &harness;
        eventually("reply streamed out through the transport", move || {
            harness.transport.text_out().contains("Hello!")
        })
        .await;
        eventually("voice output synthesized", move || {
            !harness.transport.sent_audio.lock().expect("audio").is_empty()
        })
        .await;
    }

    let messages = harness.server.context().get().messages;
    let agent = messages
        .iter()
        .find(|m| m.role() == Role::Agent)
        .expect("agent reply recorded");
    assert_eq!(agent.body.content(), "Hello!");

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn say_requests_during_generation_merge_into_next_job() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    // Start a generation the test controls; it stays open.
    harness.emit_and_wait(EventPayload::Continue).await;
    {
        let harness = &harness;
        eventually("model call opened", move || harness.model.request_count() == 1).await;
    }

    // Two says while the current job runs accumulate in the next slot.
    harness
        .emit_and_wait(EventPayload::Say {
            text: "first".into(),
            prevent_interruption: false,
        })
        .await;
    harness
        .emit_and_wait(EventPayload::Say {
            text: "second".into(),
            prevent_interruption: false,
        })
        .await;
    assert_eq!(harness.model.request_count(), 1);

    // Finish the running job; the queued say text flushes verbatim,
    // joined with the separator.
    harness
        .model
        .drive()
        .send(GenerationChunk::End)
        .await
        .expect("end stream");
    {
        let harness = &harness;
        eventually("queued say text emitted", move || {
            harness.transport.text_out().contains("first.second")
        })
        .await;
    }
    // The say-only job never called the model.
    assert_eq!(harness.model.request_count(), 1);

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn decide_request_consults_model_before_generating() {
    let model = ScriptedModel::with_script(vec![GenerationChunk::Content {
        text: "Happy to help.".into(),
    }]);
    let harness = build(test_config(), model, 0.0);
    harness.server.start().await.expect("start");

    // No explicit continue: the yes/no question gates the generation,
    // and the scripted model answers yes.
    harness
        .emit_and_wait(EventPayload::Decide {
            hint: Some("the user seems to expect a reply".into()),
        })
        .await;

    {
        let harness = &harness;
        eventually("decide led to a streamed reply", move || {
            harness.transport.text_out().contains("Happy to help.")
        })
        .await;
    }

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn sustained_speech_interrupts_running_generation() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    harness.emit_and_wait(EventPayload::Continue).await;
    {
        let harness = &harness;
        eventually("model call opened", move || harness.model.request_count() == 1).await;
        // The continue flipped the agent out of listening.
        eventually("agent thinking", move || {
            harness.server.context().get().status.thinking
        })
        .await;
    }

    // 2 × 50ms of detected speech crosses the 100ms interruption bar.
    harness.feed_audio(0.9).await;
    harness.feed_audio(0.9).await;

    {
        let harness = &harness;
        eventually("interruption emitted", move || {
            harness.names().iter().any(|n| n == "interruption")
        })
        .await;
        eventually("model call cancelled", move || {
            harness.model.last_cancel().is_cancelled()
        })
        .await;
        eventually("agent listening again", move || {
            harness.server.context().get().status.listening
        })
        .await;
    }

    // The buffered barge-in audio was replayed as voice.
    let names = harness.names();
    let interrupt_at = names
        .iter()
        .position(|n| n == "interrupt")
        .expect("interrupt event");
    assert!(
        names[interrupt_at..]
            .iter()
            .any(|n| n == "incoming-voice-start")
    );

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn protected_say_survives_an_interrupt() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    harness.emit_and_wait(EventPayload::Continue).await;
    {
        let harness = &harness;
        eventually("model call opened", move || harness.model.request_count() == 1).await;
    }

    // Queued behind the running job, marked uninterruptible.
    harness
        .emit_and_wait(EventPayload::Say {
            text: "I must finish this thought".into(),
            prevent_interruption: true,
        })
        .await;

    harness
        .server
        .events()
        .emit(
            EventPayload::Interrupt { reason: None },
            true,
            EventSource::server(),
        )
        .expect("emit");

    {
        let harness = &harness;
        // The unprotected running job is cancelled...
        eventually("running job interrupted", move || {
            harness.names().iter().any(|n| n == "interruption")
        })
        .await;
        // ...while the protected say still goes out.
        eventually("protected say emitted", move || {
            harness
                .transport
                .text_out()
                .contains("I must finish this thought")
        })
        .await;
    }

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn client_events_enter_through_the_transport() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");

    let client = harness
        .transport
        .client_tx
        .lock()
        .expect("client")
        .clone()
        .expect("transport subscribed");
    client
        .send(ClientEvent {
            name: "incoming-text".into(),
            data: serde_json::json!({"chunk": "typed from the app"}),
        })
        .expect("send");

    {
        let harness = &harness;
        eventually("typed text reaches the message log", move || {
            harness
                .server
                .context()
                .get()
                .messages
                .iter()
                .any(|m| m.body.content() == "typed from the app")
        })
        .await;
    }

    // A malformed client event is rejected and surfaced as agent.error.
    client
        .send(ClientEvent {
            name: "no-such-event".into(),
            data: serde_json::json!({}),
        })
        .expect("send");
    {
        let harness = &harness;
        eventually("validation failure surfaced", move || {
            harness.names().iter().any(|n| n == "agent.error")
        })
        .await;
    }

    harness.server.stop().await.expect("stop");
}

#[tokio::test]
async fn action_calls_are_awaited_and_recorded() {
    struct Weather;

    #[async_trait]
    impl ActionProvider for Weather {
        fn name(&self) -> &str {
            "weather"
        }

        fn definitions(&self) -> Vec<ActionDefinition> {
            vec![ActionDefinition::new(
                "check-weather",
                "Look up the current weather",
                serde_json::json!({"type": "object"}),
            )]
        }

        async fn invoke(
            &self,
            _action: &str,
            _arguments: serde_json::Value,
        ) -> Result<ActionOutcome> {
            Ok(ActionOutcome::ok(serde_json::json!({"sky": "clear"})))
        }
    }

    let model = ScriptedModel::with_script(vec![
        GenerationChunk::Content {
            text: "Checking. ".into(),
        },
        GenerationChunk::Action {
            request: wren::message::ActionRequest {
                id: "call-1".into(),
                name: "check-weather".into(),
                arguments: serde_json::json!({"city": "Oban"}),
            },
        },
    ]);

    let model = Arc::new(model);
    let transport = Arc::new(FakeTransport::default());
    let capabilities = Capabilities {
        voice_probe: Arc::new(EchoProbe),
        speech_to_text: Arc::new(OneShotStt),
        turn_predictor: Arc::new(FixedPredictor { probability: 0.0 }),
        language_model: Arc::clone(&model) as Arc<dyn LanguageModel>,
        speech_synthesis: Arc::new(EchoTts),
    };
    let server = AgentServer::new(
        test_config(),
        Context::default(),
        capabilities,
        ProviderSet::new(vec![], vec![Arc::new(Weather)]),
        Arc::clone(&transport) as Arc<dyn Transport>,
    )
    .expect("construct agent");
    server.start().await.expect("start");

    let bus = server.events();
    bus.emit(EventPayload::Continue, false, EventSource::server())
        .expect("emit");

    let server_ref = &server;
    eventually("action result recorded as message", move || {
        server_ref
            .context()
            .get()
            .messages
            .iter()
            .any(|m| m.role() == Role::Action)
    })
    .await;

    let messages = server.context().get().messages;
    let action = messages
        .iter()
        .find(|m| m.role() == Role::Action)
        .expect("action message");
    match &action.body {
        wren::message::MessageBody::Action {
            action_name,
            action_success,
            action_output,
            ..
        } => {
            assert_eq!(action_name, "check-weather");
            assert!(action_success);
            assert_eq!(
                action_output.as_ref(),
                Some(&serde_json::json!({"sky": "clear"}))
            );
        }
        other => unreachable!("expected action body, got {other:?}"),
    }

    server.stop().await.expect("stop");
}

#[tokio::test]
async fn stop_clears_handler_state_and_leaves_room() {
    let harness = build(test_config(), ScriptedModel::default(), 0.0);
    harness.server.start().await.expect("start");
    assert!(*harness.transport.joined.lock().expect("joined"));

    harness.server.stop().await.expect("stop");
    assert!(!*harness.transport.joined.lock().expect("joined"));

    // The stop control event ran through every handler before the halt.
    let names = harness.names();
    assert!(names.iter().any(|n| n == "agent.stop"));

    // Stopping again is a no-op.
    harness.server.stop().await.expect("second stop");
}
