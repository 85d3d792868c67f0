//! Stream handler bridging voice segments to the speech-to-text
//! capability.
//!
//! One transcription job per utterance: opened on the voice-start
//! boundary, fed every voice chunk (padding included), closed on
//! voice-end by dropping the input sender so the transcriber can flush
//! its final result.

use crate::capability::{AudioChunk, SpeechToText};
use crate::context::ContextView;
use crate::error::{AgentError, Result};
use crate::event::{Event, EventPayload};
use crate::runtime::{EventSink, StreamHandler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub struct TranscribeHandler {
    capability: Arc<dyn SpeechToText>,
    job_input: Mutex<Option<mpsc::Sender<AudioChunk>>>,
    job_cancel: Mutex<Option<CancellationToken>>,
}

impl TranscribeHandler {
    pub fn new(capability: Arc<dyn SpeechToText>) -> Self {
        Self {
            capability,
            job_input: Mutex::new(None),
            job_cancel: Mutex::new(None),
        }
    }

    fn teardown(&self) {
        if let Some(cancel) = self.job_cancel.lock().expect("job lock poisoned").take() {
            cancel.cancel();
        }
        self.job_input.lock().expect("job lock poisoned").take();
    }
}

#[async_trait]
impl StreamHandler for TranscribeHandler {
    fn name(&self) -> &'static str {
        "transcribe"
    }

    async fn on_event(
        &self,
        event: &Event,
        _context: &ContextView,
        events: &EventSink,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::VoiceStart => {
                if self.job_input.lock().expect("job lock poisoned").is_some() {
                    // Utterance already open (e.g. barge-in replay).
                    return Ok(());
                }
                let job = self
                    .capability
                    .transcribe()
                    .await
                    .map_err(|e| AgentError::Upstream(format!("speech-to-text: {e}")))?;
                *self.job_input.lock().expect("job lock poisoned") = Some(job.input);
                *self.job_cancel.lock().expect("job lock poisoned") = Some(job.cancel.clone());

                let sink = events.clone();
                let cancel = job.cancel;
                let mut output = job.output;
                tokio::spawn(async move {
                    loop {
                        let transcript = tokio::select! {
                            () = cancel.cancelled() => break,
                            received = output.recv() => match received {
                                Some(transcript) => transcript,
                                None => break,
                            },
                        };
                        if !transcript.text.is_empty() {
                            sink.emit(EventPayload::Text {
                                chunk: transcript.text,
                                is_final: transcript.is_final,
                            });
                        }
                    }
                    debug!("transcription consumer halted");
                });
                Ok(())
            }
            EventPayload::Voice { chunk, .. } => {
                let input = self.job_input.lock().expect("job lock poisoned").clone();
                let Some(input) = input else {
                    return Ok(());
                };
                input
                    .send(chunk.clone())
                    .await
                    .map_err(|_| AgentError::Upstream("speech-to-text input closed".into()))
            }
            EventPayload::VoiceEnd => {
                // Dropping the sender ends the utterance; the consumer
                // drains whatever the transcriber still emits.
                self.job_input.lock().expect("job lock poisoned").take();
                self.job_cancel.lock().expect("job lock poisoned").take();
                Ok(())
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
