//! The agent composition root.
//!
//! Owns the context store, event bus, handler registry, transport handle,
//! and capability handles. `start()` joins the room, spawns the dispatch
//! loop plus transport bridge tasks, and emits `agent.start`; `stop()`
//! emits `agent.stop`, waits for every handler to finish it, then halts
//! the loop and clears handler private state.

use crate::capability::Capabilities;
use crate::config::AgentConfig;
use crate::context::{Context, ContextStore, ContextView};
use crate::error::{AgentError, Result};
use crate::event::bus::{EventBus, EventSelector, WaitTarget};
use crate::event::{EventPayload, EventSource};
use crate::handlers::{
    AgentOutputHandler, GenerationHandler, StatusHandler, TranscribeHandler, TranscriptHandler,
    TurnHandler, VadHandler,
};
use crate::provider::ProviderSet;
use crate::runtime::dispatch::Dispatcher;
use crate::runtime::HandlerRegistry;
use crate::transport::Transport;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
}

/// Text or audio on its way out through the transport.
enum Outbound {
    Voice(crate::capability::AudioChunk),
    Text(String),
}

pub struct AgentServer {
    config: AgentConfig,
    context: Arc<ContextStore>,
    bus: Arc<EventBus>,
    capabilities: Capabilities,
    providers: ProviderSet,
    transport: Arc<dyn Transport>,
    registry: Mutex<Option<Arc<HandlerRegistry>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    egress_listener: Mutex<Option<u64>>,
    state: Mutex<RunState>,
}

impl AgentServer {
    /// Build an agent. Config and initial context are validated here;
    /// a malformed value fails construction and nothing is spawned.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a bad config or context.
    pub fn new(
        config: AgentConfig,
        initial_context: Context,
        capabilities: Capabilities,
        providers: ProviderSet,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let context = Arc::new(ContextStore::new(initial_context)?);
        let bus = Arc::new(EventBus::new(config.events.history_capacity));
        Ok(Self {
            config,
            context,
            bus,
            capabilities,
            providers,
            transport,
            registry: Mutex::new(None),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            egress_listener: Mutex::new(None),
            state: Mutex::new(RunState::Stopped),
        })
    }

    /// Read-only view of the conversation state.
    pub fn context(&self) -> ContextView {
        ContextView::new(Arc::clone(&self.context))
    }

    /// The agent's event bus, for emitting and waiting on events.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Handlers are built once, on first start, from the config and
    /// capability handles.
    fn registry(&self) -> Result<Arc<HandlerRegistry>> {
        let mut guard = self.registry.lock().expect("registry lock poisoned");
        if let Some(registry) = guard.as_ref() {
            return Ok(Arc::clone(registry));
        }

        let mut registry = HandlerRegistry::new();
        registry.register_block(Arc::new(StatusHandler))?;
        registry.register_block(Arc::new(TranscriptHandler))?;
        registry.register_block(Arc::new(AgentOutputHandler))?;
        registry.register_stream(Arc::new(VadHandler::new(
            self.config.vad.clone(),
            Arc::clone(&self.capabilities.voice_probe),
        )))?;
        registry.register_stream(Arc::new(TranscribeHandler::new(Arc::clone(
            &self.capabilities.speech_to_text,
        ))))?;
        registry.register_stream(Arc::new(TurnHandler::new(
            self.config.turn.clone(),
            Arc::clone(&self.capabilities.turn_predictor),
        )))?;
        registry.register_stream(Arc::new(GenerationHandler::new(
            self.config.generation.clone(),
            Arc::clone(&self.capabilities.language_model),
            Arc::clone(&self.capabilities.speech_synthesis),
            self.providers.clone(),
        )))?;

        let registry = Arc::new(registry);
        *guard = Some(Arc::clone(&registry));
        Ok(registry)
    }

    /// Join the room, spawn the dispatch loop and transport bridges, and
    /// emit `agent.start`.
    ///
    /// # Errors
    ///
    /// `Validation` if already running; `Upstream` if the room join fails.
    pub async fn start(&self) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state == RunState::Running {
                return Err(AgentError::Validation("agent already running".into()));
            }
        }

        self.transport
            .join_room(&self.config.transport.room, &self.config.transport.token)
            .await?;

        let registry = self.registry()?;
        let cancel = CancellationToken::new();

        let mut tasks = Dispatcher {
            bus: Arc::clone(&self.bus),
            context: Arc::clone(&self.context),
            registry,
            cancel: cancel.clone(),
        }
        .spawn();
        tasks.push(self.spawn_ingress(cancel.clone()));
        tasks.push(self.spawn_egress(cancel.clone()));

        *self.cancel.lock().expect("cancel lock poisoned") = Some(cancel);
        *self.tasks.lock().expect("task lock poisoned") = tasks;
        *self.state.lock().expect("state lock poisoned") = RunState::Running;

        self.bus
            .emit(EventPayload::Start, false, EventSource::server())?;
        info!(room = %self.config.transport.room, "agent started");
        Ok(())
    }

    /// Emit the final control event, wait for its completion, then halt
    /// every consumer and clear handler state.
    pub async fn stop(&self) -> Result<()> {
        {
            let state = self.state.lock().expect("state lock poisoned");
            if *state == RunState::Stopped {
                return Ok(());
            }
        }

        let stop_id = self
            .bus
            .emit(EventPayload::Stop, false, EventSource::server())?;
        if let Err(e) = self.bus.wait(&stop_id, WaitTarget::All).await {
            warn!("stop event did not complete cleanly: {e}");
        }

        if let Some(cancel) = self.cancel.lock().expect("cancel lock poisoned").take() {
            cancel.cancel();
        }
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task lock poisoned")
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }

        if let Some(listener) = self
            .egress_listener
            .lock()
            .expect("egress lock poisoned")
            .take()
        {
            self.bus.off(listener);
        }

        if let Some(registry) = self.registry.lock().expect("registry lock poisoned").as_ref() {
            registry.reset_all();
        }

        if let Err(e) = self.transport.leave_room().await {
            warn!("leaving room failed: {e}");
        }

        *self.state.lock().expect("state lock poisoned") = RunState::Stopped;
        info!("agent stopped");
        Ok(())
    }

    /// Forward client events onto the bus, validating each one.
    fn spawn_ingress(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.transport.subscribe();
        let bus = Arc::clone(&self.bus);
        tokio::spawn(async move {
            loop {
                let client_event = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(event) => event,
                        None => break,
                    },
                };
                if let Err(e) =
                    bus.emit_raw(&client_event.name, client_event.data, false, EventSource::Client)
                {
                    warn!(event = %client_event.name, "client event rejected: {e}");
                    let _ = bus.emit(
                        EventPayload::Error {
                            message: e.to_string(),
                            handler: None,
                        },
                        false,
                        EventSource::server(),
                    );
                }
            }
        })
    }

    /// Bridge outgoing text/voice events to the transport. Listener
    /// callbacks are synchronous, so they feed a channel drained by an
    /// async task that performs the actual transport calls.
    fn spawn_egress(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
        let listener = self.bus.on(
            EventSelector::OneOf(vec!["outgoing-voice".into(), "outgoing-text".into()]),
            move |event| {
                let outbound = match &event.payload {
                    EventPayload::OutgoingVoice { chunk } => Outbound::Voice(chunk.clone()),
                    EventPayload::OutgoingText { chunk } => Outbound::Text(chunk.clone()),
                    _ => return,
                };
                let _ = tx.send(outbound);
            },
        );
        *self
            .egress_listener
            .lock()
            .expect("egress lock poisoned") = Some(listener);

        let transport = Arc::clone(&self.transport);
        let topic = self.config.transport.text_topic.clone();
        tokio::spawn(async move {
            loop {
                let outbound = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Some(outbound) => outbound,
                        None => break,
                    },
                };
                let result = match outbound {
                    Outbound::Voice(chunk) => transport.stream_audio_chunk(chunk).await,
                    Outbound::Text(text) => transport.stream_text(&topic, &text).await,
                };
                if let Err(e) = result {
                    warn!("transport egress failed: {e}");
                }
            }
        })
    }
}
