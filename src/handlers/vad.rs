//! Voice-activity stream handler.
//!
//! Feeds transport audio into the classifier capability and turns its
//! scored chunks into voice boundary events. Activity detection uses two
//! thresholds (hysteresis): silence flips to speech at
//! `score_in_threshold`, speech flips back only below the lower
//! `score_out_threshold`, so a score hovering between the two never
//! flickers the state.
//!
//! While the agent is listening, a bounded pre-padding ring preserves the
//! audio just before a detected onset and a post-padding countdown keeps
//! the tail just after the offset. While the agent is not listening, audio
//! accumulates in an interrupt ring and detected speech durations feed a
//! sliding window; only a windowed total above `min_interruption_ms`
//! triggers a barge-in, which rejects isolated classifier spikes.

use crate::capability::{AudioChunk, ScoredChunk, VoiceProbe};
use crate::config::VadConfig;
use crate::context::ContextView;
use crate::error::{AgentError, Result};
use crate::event::{Event, EventPayload};
use crate::runtime::{EventSink, StreamHandler};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One detected-active span inside the interruption window.
#[derive(Debug, Clone, Copy)]
struct VoiceSpan {
    at_ms: u64,
    duration_ms: u64,
}

/// Output of one state-machine step.
#[derive(Debug, Clone, PartialEq)]
pub enum VadOutput {
    VoiceStart,
    Voice { chunk: AudioChunk, padding: bool },
    VoiceEnd,
    Interrupt { replay: Vec<AudioChunk> },
}

/// The voice-activity state machine, separated from the handler so the
/// boundary logic is testable without a running classifier.
pub struct VadMachine {
    config: VadConfig,
    has_activity: bool,
    in_segment: bool,
    pre_padding: VecDeque<AudioChunk>,
    post_padding_remaining: usize,
    interrupt_buffer: VecDeque<AudioChunk>,
    voice_window: Vec<VoiceSpan>,
}

impl VadMachine {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            has_activity: false,
            in_segment: false,
            pre_padding: VecDeque::new(),
            post_padding_remaining: 0,
            interrupt_buffer: VecDeque::new(),
            voice_window: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.has_activity = false;
        self.in_segment = false;
        self.pre_padding.clear();
        self.post_padding_remaining = 0;
        self.interrupt_buffer.clear();
        self.voice_window.clear();
    }

    /// Advance the machine by one classified chunk.
    pub fn update(&mut self, scored: ScoredChunk, listening: bool, now_ms: u64) -> Vec<VadOutput> {
        let threshold = if self.has_activity {
            self.config.score_out_threshold
        } else {
            self.config.score_in_threshold
        };
        let active = scored.score >= threshold;
        self.has_activity = active;

        if listening {
            self.voice_window.clear();
            self.interrupt_buffer.clear();
            self.step_listening(scored.chunk, active)
        } else {
            self.pre_padding.clear();
            self.step_not_listening(scored.chunk, active, now_ms)
        }
    }

    fn step_listening(&mut self, chunk: AudioChunk, active: bool) -> Vec<VadOutput> {
        let mut out = Vec::new();
        if active {
            if !self.in_segment {
                self.in_segment = true;
                out.push(VadOutput::VoiceStart);
                // Oldest first, so replayed audio stays in capture order.
                while let Some(buffered) = self.pre_padding.pop_front() {
                    out.push(VadOutput::Voice {
                        chunk: buffered,
                        padding: true,
                    });
                }
            }
            self.post_padding_remaining = self.config.post_padding_chunks;
            out.push(VadOutput::Voice {
                chunk,
                padding: false,
            });
        } else if self.in_segment {
            if self.post_padding_remaining > 0 {
                self.post_padding_remaining -= 1;
                out.push(VadOutput::Voice {
                    chunk,
                    padding: true,
                });
                if self.post_padding_remaining == 0 {
                    self.in_segment = false;
                    out.push(VadOutput::VoiceEnd);
                }
            } else {
                self.in_segment = false;
                out.push(VadOutput::VoiceEnd);
                self.buffer_pre_padding(chunk);
            }
        } else {
            self.buffer_pre_padding(chunk);
        }
        out
    }

    fn step_not_listening(
        &mut self,
        chunk: AudioChunk,
        active: bool,
        now_ms: u64,
    ) -> Vec<VadOutput> {
        let mut out = Vec::new();
        if self.in_segment {
            // The agent took the turn mid-segment; close the boundary.
            self.in_segment = false;
            self.post_padding_remaining = 0;
            out.push(VadOutput::VoiceEnd);
        }

        let duration_ms = chunk.duration_ms();
        if self.interrupt_buffer.len() == self.config.interrupt_buffer_chunks {
            self.interrupt_buffer.pop_front();
        }
        self.interrupt_buffer.push_back(chunk);

        if active {
            self.voice_window.push(VoiceSpan {
                at_ms: now_ms,
                duration_ms,
            });
        }
        let horizon = now_ms.saturating_sub(2 * self.config.min_interruption_ms);
        self.voice_window.retain(|span| span.at_ms >= horizon);

        let voiced: u64 = self.voice_window.iter().map(|s| s.duration_ms).sum();
        if voiced >= self.config.min_interruption_ms {
            let replay = self.interrupt_buffer.drain(..).collect();
            self.voice_window.clear();
            // The replay opens a live segment.
            self.in_segment = true;
            self.has_activity = true;
            out.push(VadOutput::Interrupt { replay });
        }
        out
    }

    fn buffer_pre_padding(&mut self, chunk: AudioChunk) {
        if self.config.pre_padding_chunks == 0 {
            return;
        }
        if self.pre_padding.len() == self.config.pre_padding_chunks {
            self.pre_padding.pop_front();
        }
        self.pre_padding.push_back(chunk);
    }
}

/// Stream handler driving the classifier capability.
pub struct VadHandler {
    capability: Arc<dyn VoiceProbe>,
    machine: Arc<Mutex<VadMachine>>,
    job_input: Mutex<Option<mpsc::Sender<AudioChunk>>>,
    job_cancel: Mutex<Option<CancellationToken>>,
}

impl VadHandler {
    pub fn new(config: VadConfig, capability: Arc<dyn VoiceProbe>) -> Self {
        Self {
            capability,
            machine: Arc::new(Mutex::new(VadMachine::new(config))),
            job_input: Mutex::new(None),
            job_cancel: Mutex::new(None),
        }
    }

    fn teardown(&self) {
        if let Some(cancel) = self.job_cancel.lock().expect("job lock poisoned").take() {
            cancel.cancel();
        }
        self.job_input.lock().expect("job lock poisoned").take();
        self.machine.lock().expect("machine lock poisoned").reset();
    }
}

#[async_trait]
impl StreamHandler for VadHandler {
    fn name(&self) -> &'static str {
        "vad"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &ContextView,
        events: &EventSink,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::Start => {
                let job = self
                    .capability
                    .detect()
                    .await
                    .map_err(|e| AgentError::Upstream(format!("voice probe: {e}")))?;
                *self.job_input.lock().expect("job lock poisoned") = Some(job.input);
                *self.job_cancel.lock().expect("job lock poisoned") = Some(job.cancel.clone());

                let machine = Arc::clone(&self.machine);
                let view = context.clone();
                let sink = events.clone();
                let cancel = job.cancel;
                let mut output = job.output;
                tokio::spawn(async move {
                    loop {
                        let scored = tokio::select! {
                            () = cancel.cancelled() => break,
                            received = output.recv() => match received {
                                Some(scored) => scored,
                                None => break,
                            },
                        };
                        let listening = view.get().status.listening;
                        let now_ms = Utc::now().timestamp_millis().max(0) as u64;
                        let outputs = machine
                            .lock()
                            .expect("machine lock poisoned")
                            .update(scored, listening, now_ms);
                        publish(&sink, outputs);
                    }
                    debug!("vad consumer halted");
                });
                info!("voice activity detection started");
                Ok(())
            }
            EventPayload::AudioFrame { chunk } => {
                let input = self.job_input.lock().expect("job lock poisoned").clone();
                let Some(input) = input else {
                    // Audio before agent.start; nothing to feed yet.
                    return Ok(());
                };
                input
                    .send(chunk.clone())
                    .await
                    .map_err(|_| AgentError::Upstream("voice probe input closed".into()))
            }
            EventPayload::Stop => {
                self.teardown();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn reset(&self) {
        self.teardown();
    }
}

/// Emit the machine's outputs in order. The interrupt goes out urgent so
/// it preempts anything queued; its replayed audio follows as ordinary
/// voice events.
fn publish(sink: &EventSink, outputs: Vec<VadOutput>) {
    for output in outputs {
        match output {
            VadOutput::VoiceStart => {
                sink.emit(EventPayload::VoiceStart);
            }
            VadOutput::Voice { chunk, padding } => {
                sink.emit(EventPayload::Voice { chunk, padding });
            }
            VadOutput::VoiceEnd => {
                sink.emit(EventPayload::VoiceEnd);
            }
            VadOutput::Interrupt { replay } => {
                warn!(chunks = replay.len(), "user barge-in detected");
                sink.emit_urgent(EventPayload::Interrupt {
                    reason: Some("voice".into()),
                });
                sink.emit(EventPayload::VoiceStart);
                for chunk in replay {
                    sink.emit(EventPayload::Voice {
                        chunk,
                        padding: false,
                    });
                }
            }
        }
    }
}
