//! Generation orchestrator stream handler.
//!
//! Owns two job slots. Requests (`continue`, `say`, `decide`) land in the
//! running job's successor once a job has started, so nothing is lost
//! mid-generation; only the `current` slot ever starts, keeping at most
//! one job in flight. A started job runs on its own task: it may first ask
//! the model whether to respond at all (decide), flushes queued `say` text
//! without a model call, then streams a model response, firing inline
//! actions the first time each distinct pattern appears and awaiting
//! structured action calls. Interrupts cancel whichever slots allow it.

use crate::capability::{
    GenerationChunk, GenerationRequest, LanguageModel, SpeechSynthesis,
};
use crate::config::GenerationConfig;
use crate::context::{Context, ContextView};
use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::message::{Message, MessageBody};
use crate::provider::ProviderSet;
use crate::runtime::{EventSink, StreamHandler};
use async_trait::async_trait;
use regex_lite::Regex;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inline action syntax scanned for in streamed content, e.g.
/// `[[end-call]]` or `[[play-sound:chime]]`.
const INLINE_ACTION_PATTERN: &str = r"\[\[([A-Za-z][\w-]*)(?::([^\]]+))?\]\]";

/// One pending or running generation job.
#[derive(Debug)]
pub struct GenerationJob {
    pub id: String,
    pub started: bool,
    pub continue_requested: bool,
    /// `Some(hint)` once a decide request arrived; the hint itself is
    /// optional.
    pub decide: Option<Option<String>>,
    pub say: String,
    pub prevent_interruption: bool,
    cancel: Option<CancellationToken>,
}

impl GenerationJob {
    fn blank() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            started: false,
            continue_requested: false,
            decide: None,
            say: String::new(),
            prevent_interruption: false,
            cancel: None,
        }
    }

    fn has_request(&self) -> bool {
        self.continue_requested || self.decide.is_some() || !self.say.is_empty()
    }

    fn push_say(&mut self, text: &str) {
        if !self.say.is_empty() {
            self.say.push('.');
        }
        self.say.push_str(text);
    }

    fn reset(&mut self) {
        *self = Self::blank();
    }
}

struct Slots {
    current: GenerationJob,
    next: GenerationJob,
}

pub struct GenerationHandler {
    config: GenerationConfig,
    language_model: Arc<dyn LanguageModel>,
    synthesis: Arc<dyn SpeechSynthesis>,
    providers: ProviderSet,
    slots: Arc<Mutex<Slots>>,
    inline_pattern: Regex,
}

impl GenerationHandler {
    pub fn new(
        config: GenerationConfig,
        language_model: Arc<dyn LanguageModel>,
        synthesis: Arc<dyn SpeechSynthesis>,
        providers: ProviderSet,
    ) -> Self {
        Self {
            config,
            language_model,
            synthesis,
            providers,
            slots: Arc::new(Mutex::new(Slots {
                current: GenerationJob::blank(),
                next: GenerationJob::blank(),
            })),
            inline_pattern: Regex::new(INLINE_ACTION_PATTERN)
                .expect("inline action pattern is valid"),
        }
    }

    /// Apply a request to whichever slot is not yet started and start the
    /// current slot if it became runnable.
    fn route<F>(&self, context: &Context, events: &EventSink, apply: F)
    where
        F: FnOnce(&mut GenerationJob),
    {
        let mut slots = self.slots.lock().expect("slots lock poisoned");
        if slots.current.started {
            apply(&mut slots.next);
        } else {
            apply(&mut slots.current);
        }
        self.maybe_start(&mut slots, context, events);
    }

    fn maybe_start(&self, slots: &mut Slots, context: &Context, events: &EventSink) {
        if slots.current.started || !slots.current.has_request() {
            return;
        }
        let job = &mut slots.current;
        job.started = true;
        let cancel = CancellationToken::new();
        job.cancel = Some(cancel.clone());

        let run = JobRun {
            job_id: job.id.clone(),
            continue_requested: job.continue_requested,
            decide: job.decide.clone(),
            say: job.say.clone(),
            context: context.clone(),
            cancel,
        };
        info!(job = %run.job_id, say = !run.say.is_empty(), decide = run.decide.is_some(),
            generate = run.continue_requested, "starting generation job");

        let config = self.config.clone();
        let language_model = Arc::clone(&self.language_model);
        let synthesis = Arc::clone(&self.synthesis);
        let providers = self.providers.clone();
        let inline_pattern = self.inline_pattern.clone();
        let sink = events.clone();
        tokio::spawn(async move {
            run_job(
                run,
                config,
                language_model,
                synthesis,
                providers,
                inline_pattern,
                sink,
            )
            .await;
        });
    }

    fn cancel_interruptible(&self, context: &Context, events: &EventSink) {
        let mut guard = self.slots.lock().expect("slots lock poisoned");
        let slots = &mut *guard;
        for job in [&mut slots.current, &mut slots.next] {
            if job.prevent_interruption {
                debug!(job = %job.id, "job is interruption-protected, keeping");
                continue;
            }
            let was_started = job.started;
            let job_id = job.id.clone();
            if let Some(cancel) = job.cancel.take() {
                cancel.cancel();
            }
            job.reset();
            if was_started {
                events.emit(EventPayload::Interruption { job_id });
            }
        }
        // A surviving protected job in the next slot would otherwise wait
        // forever behind the now-blank current slot.
        if !slots.current.started && !slots.current.has_request() && slots.next.has_request() {
            std::mem::swap(&mut slots.current, &mut slots.next);
        }
        self.maybe_start(slots, context, events);
    }

    fn finish(&self, job_id: &str, context: &Context, events: &EventSink) {
        let mut guard = self.slots.lock().expect("slots lock poisoned");
        let slots = &mut *guard;
        if slots.current.id != job_id {
            // Already reset by an interrupt; nothing to promote here.
            return;
        }
        if let Some(cancel) = slots.current.cancel.take() {
            // The job's task has already exited; this is belt cleanup.
            cancel.cancel();
        }
        slots.current.reset();
        std::mem::swap(&mut slots.current, &mut slots.next);
        self.maybe_start(slots, context, events);
    }

    fn teardown(&self) {
        let mut slots = self.slots.lock().expect("slots lock poisoned");
        let slots = &mut *slots;
        for job in [&mut slots.current, &mut slots.next] {
            if let Some(cancel) = job.cancel.take() {
                cancel.cancel();
            }
            job.reset();
        }
    }
}

#[async_trait]
impl StreamHandler for GenerationHandler {
    fn name(&self) -> &'static str {
        "generation"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &ContextView,
        events: &EventSink,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::Interrupt { .. } => {
                self.cancel_interruptible(&context.get(), events);
            }
            EventPayload::Continue => {
                self.route(&context.get(), events, |job| {
                    job.continue_requested = true;
                });
            }
            EventPayload::Say {
                text,
                prevent_interruption,
            } => {
                let (text, prevent) = (text.clone(), *prevent_interruption);
                self.route(&context.get(), events, move |job| {
                    job.push_say(&text);
                    job.prevent_interruption |= prevent;
                });
            }
            EventPayload::Decide { hint } => {
                let hint = hint.clone();
                self.route(&context.get(), events, move |job| {
                    job.decide = Some(hint);
                });
            }
            EventPayload::GenerationEnded { job_id } => {
                self.finish(job_id, &context.get(), events);
            }
            EventPayload::Stop => {
                self.teardown();
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&self) {
        self.teardown();
    }
}

/// Everything a spawned job task needs, detached from the handler.
struct JobRun {
    job_id: String,
    continue_requested: bool,
    decide: Option<Option<String>>,
    say: String,
    context: Context,
    cancel: CancellationToken,
}

async fn run_job(
    run: JobRun,
    config: GenerationConfig,
    language_model: Arc<dyn LanguageModel>,
    synthesis: Arc<dyn SpeechSynthesis>,
    providers: ProviderSet,
    inline_pattern: Regex,
    sink: EventSink,
) {
    let mut proceed = run.continue_requested;

    if !proceed
        && let Some(hint) = &run.decide
    {
        match ask_decide(&language_model, &run.context, hint.as_deref(), &config).await {
            Ok(answer) => {
                debug!(job = %run.job_id, answer, "decide resolved");
                proceed = answer;
            }
            Err(e) => {
                warn!(job = %run.job_id, "decide question failed: {e}");
            }
        }
    }

    // Voice output path, opened once for both say text and model content.
    let voice = if run.context.voice_enabled && (!run.say.is_empty() || proceed) {
        open_voice(&synthesis, &sink, &run.cancel).await
    } else {
        None
    };

    if !run.say.is_empty() {
        sink.emit(EventPayload::OutgoingText {
            chunk: run.say.clone(),
        });
        if let Some(voice) = &voice {
            let _ = voice.send(run.say.clone()).await;
        }
    }

    if proceed {
        let request = build_request(&run.context, &providers, &config).await;
        match language_model.generate_message(request).await {
            Ok(stream) => {
                let interrupted = consume_stream(
                    stream,
                    &providers,
                    &inline_pattern,
                    voice.as_ref(),
                    &sink,
                    &run.cancel,
                )
                .await;
                if interrupted {
                    debug!(job = %run.job_id, "generation cancelled mid-stream");
                    return;
                }
            }
            Err(e) => {
                warn!(job = %run.job_id, "model call failed: {e}");
                sink.emit(EventPayload::Error {
                    message: format!("generation failed: {e}"),
                    handler: Some("generation".into()),
                });
            }
        }
    }

    // Dropping the voice sender lets the synthesizer flush its tail.
    drop(voice);

    if run.cancel.is_cancelled() {
        return;
    }
    sink.emit(EventPayload::GenerationEnded { job_id: run.job_id });
}

/// Ask the model a yes/no question over recent history.
async fn ask_decide(
    language_model: &Arc<dyn LanguageModel>,
    context: &Context,
    hint: Option<&str>,
    config: &GenerationConfig,
) -> Result<bool> {
    let mut messages: Vec<Message> = context
        .messages
        .iter()
        .rev()
        .take(config.decide_history_messages)
        .rev()
        .cloned()
        .collect();
    if let Some(hint) = hint {
        messages.push(Message::new(MessageBody::System {
            content: hint.to_owned(),
        }));
    }
    messages.push(Message::new(MessageBody::System {
        content: "Given the conversation so far, should the agent speak next? \
                  Reply with the JSON object {\"respond\": true|false}."
            .to_owned(),
    }));

    let schema = serde_json::json!({
        "type": "object",
        "properties": { "respond": { "type": "boolean" } },
        "required": ["respond"],
    });
    let value = language_model.generate_object(&messages, &schema).await?;
    Ok(value
        .get("respond")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false))
}

/// Assemble the model request: memory-provider context first, then the
/// trimmed conversation, plus every declared action.
async fn build_request(
    context: &Context,
    providers: &ProviderSet,
    config: &GenerationConfig,
) -> GenerationRequest {
    let mut messages = providers.recall_all(context).await;
    let recent = context
        .messages
        .iter()
        .rev()
        .take(config.max_history_messages)
        .rev()
        .cloned();
    messages.extend(recent);
    GenerationRequest {
        messages,
        tools: providers.definitions(),
    }
}

/// Open a synthesis job and forward its audio as outgoing voice events.
/// Returns the text input sender.
async fn open_voice(
    synthesis: &Arc<dyn SpeechSynthesis>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> Option<mpsc::Sender<String>> {
    let job = match synthesis.synthesize().await {
        Ok(job) => job,
        Err(e) => {
            warn!("speech synthesis unavailable: {e}");
            return None;
        }
    };

    let sink = sink.clone();
    let job_cancel = job.cancel.clone();
    let outer_cancel = cancel.clone();
    let mut output = job.output;
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                () = outer_cancel.cancelled() => {
                    job_cancel.cancel();
                    break;
                }
                received = output.recv() => match received {
                    Some(chunk) => chunk,
                    None => break,
                },
            };
            sink.emit(EventPayload::OutgoingVoice { chunk });
        }
    });
    Some(job.input)
}

/// Drain the model stream. Returns `true` if consumption stopped because
/// the job was cancelled.
async fn consume_stream(
    mut stream: crate::capability::GenerationStream,
    providers: &ProviderSet,
    inline_pattern: &Regex,
    voice: Option<&mpsc::Sender<String>>,
    sink: &EventSink,
    cancel: &CancellationToken,
) -> bool {
    let mut content = String::new();
    let mut fired_inline: HashSet<String> = HashSet::new();

    loop {
        let chunk = tokio::select! {
            () = cancel.cancelled() => {
                stream.cancel.cancel();
                return true;
            }
            received = stream.chunks.recv() => match received {
                Some(chunk) => chunk,
                None => break,
            },
        };

        match chunk {
            GenerationChunk::Content { text } => {
                sink.emit(EventPayload::OutgoingText { chunk: text.clone() });
                if let Some(voice) = voice {
                    let _ = voice.send(text.clone()).await;
                }
                content.push_str(&text);
                fire_inline_actions(&content, inline_pattern, &mut fired_inline, providers);
            }
            GenerationChunk::Reasoning { text } => {
                debug!(len = text.len(), "reasoning chunk");
            }
            GenerationChunk::Action { request } => {
                let outcome = providers
                    .invoke(&request.name, request.arguments.clone())
                    .await;
                let payload = match outcome {
                    Ok(outcome) => EventPayload::OutgoingActionResult {
                        action_id: request.id.clone(),
                        action_name: request.name.clone(),
                        arguments: request.arguments.clone(),
                        success: outcome.success,
                        output: outcome.output,
                        error: outcome.error,
                    },
                    Err(e) => EventPayload::OutgoingActionResult {
                        action_id: request.id.clone(),
                        action_name: request.name.clone(),
                        arguments: request.arguments.clone(),
                        success: false,
                        output: None,
                        error: Some(e.to_string()),
                    },
                };
                sink.emit(payload);
            }
            GenerationChunk::End => break,
        }
    }

    // The stream reported its end; cancelling the handle afterwards is
    // harmless and covers providers that keep resources open.
    stream.cancel.cancel();
    false
}

/// Fire each distinct inline match exactly once, without awaiting it.
fn fire_inline_actions(
    content: &str,
    pattern: &Regex,
    fired: &mut HashSet<String>,
    providers: &ProviderSet,
) {
    for capture in pattern.captures_iter(content) {
        let Some(whole) = capture.get(0) else { continue };
        if !fired.insert(whole.as_str().to_owned()) {
            continue;
        }
        let name = capture
            .get(1)
            .map(|m| m.as_str().to_owned())
            .unwrap_or_default();
        let argument = capture.get(2).map(|m| m.as_str().to_owned());
        let arguments = match argument {
            Some(argument) => serde_json::json!({ "argument": argument }),
            None => serde_json::json!({}),
        };
        info!(action = %name, "firing inline action");
        let providers = providers.clone();
        tokio::spawn(async move {
            if let Err(e) = providers.invoke(&name, arguments).await {
                warn!(action = %name, "inline action failed: {e}");
            }
        });
    }
}
