//! End-of-turn stream handler.
//!
//! Accumulates the live transcript and, once the user falls silent,
//! queries the turn predictor. High confidence answers immediately with an
//! urgent `continue`; lower confidence schedules a delayed answer whose
//! timeout shrinks toward `min_timeout_ms` as confidence rises and grows
//! toward `max_timeout_ms` as it approaches zero.

use crate::capability::TurnPredictor;
use crate::config::TurnConfig;
use crate::context::ContextView;
use crate::error::{AgentError, Result};
use crate::event::{Event, EventPayload};
use crate::runtime::{EventSink, StreamHandler};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Default)]
struct TurnState {
    user_is_speaking: bool,
    transcript: String,
    pending: Option<CancellationToken>,
}

impl TurnState {
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel();
        }
    }
}

pub struct TurnHandler {
    config: TurnConfig,
    predictor: Arc<dyn TurnPredictor>,
    state: Arc<Mutex<TurnState>>,
}

impl TurnHandler {
    pub fn new(config: TurnConfig, predictor: Arc<dyn TurnPredictor>) -> Self {
        Self {
            config,
            predictor,
            state: Arc::new(Mutex::new(TurnState::default())),
        }
    }

    /// Delay before answering for a below-threshold probability.
    pub fn reply_delay(config: &TurnConfig, probability: f32) -> Duration {
        let scaled = config.max_timeout_ms as f64
            * (1.0 - f64::from(probability) / f64::from(config.threshold));
        let clamped = scaled.max(config.min_timeout_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    fn answer(state: &Arc<Mutex<TurnState>>, events: &EventSink) {
        let mut state = state.lock().expect("turn state lock poisoned");
        state.transcript.clear();
        state.cancel_pending();
        drop(state);
        events.emit_urgent(EventPayload::Continue);
    }
}

#[async_trait]
impl StreamHandler for TurnHandler {
    fn name(&self) -> &'static str {
        "end-of-turn"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &ContextView,
        events: &EventSink,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::VoiceStart => {
                let mut state = self.state.lock().expect("turn state lock poisoned");
                state.user_is_speaking = true;
                state.cancel_pending();
            }
            EventPayload::VoiceEnd => {
                self.state
                    .lock()
                    .expect("turn state lock poisoned")
                    .user_is_speaking = false;
            }
            EventPayload::Text { chunk, .. } => {
                self.state
                    .lock()
                    .expect("turn state lock poisoned")
                    .transcript
                    .push_str(chunk);
            }
            EventPayload::Stop => {
                let mut state = self.state.lock().expect("turn state lock poisoned");
                state.cancel_pending();
                state.transcript.clear();
                state.user_is_speaking = false;
                return Ok(());
            }
            _ => return Ok(()),
        }

        let ctx = context.get();
        {
            let state = self.state.lock().expect("turn state lock poisoned");
            if !ctx.status.listening || state.transcript.is_empty() || state.user_is_speaking {
                return Ok(());
            }
        }

        self.state
            .lock()
            .expect("turn state lock poisoned")
            .cancel_pending();

        let probability = self
            .predictor
            .predict(&ctx.messages)
            .await
            .map_err(|e| AgentError::Upstream(format!("turn predictor: {e}")))?;

        if probability >= self.config.threshold {
            debug!(probability, "turn complete, answering now");
            Self::answer(&self.state, events);
            return Ok(());
        }

        let delay = Self::reply_delay(&self.config, probability);
        debug!(probability, delay_ms = delay.as_millis() as u64, "turn uncertain, scheduling answer");

        let pending = CancellationToken::new();
        self.state
            .lock()
            .expect("turn state lock poisoned")
            .pending = Some(pending.clone());

        let state = Arc::clone(&self.state);
        let sink = events.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = pending.cancelled() => {}
                () = tokio::time::sleep(delay) => {
                    Self::answer(&state, &sink);
                }
            }
        });
        Ok(())
    }

    fn reset(&self) {
        let mut state = self.state.lock().expect("turn state lock poisoned");
        state.cancel_pending();
        state.transcript.clear();
        state.user_is_speaking = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TurnConfig {
        TurnConfig {
            threshold: 0.8,
            min_timeout_ms: 200,
            max_timeout_ms: 4000,
        }
    }

    #[test]
    fn delay_scales_inversely_with_confidence() {
        let config = config();
        // p = 0: the full maximum.
        assert_eq!(
            TurnHandler::reply_delay(&config, 0.0),
            Duration::from_millis(4000)
        );
        // p = threshold/2: half the maximum.
        assert_eq!(
            TurnHandler::reply_delay(&config, 0.4),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn delay_is_bounded_below_by_min_timeout() {
        let config = config();
        // Just under the threshold the scaled delay would be ~5ms.
        let delay = TurnHandler::reply_delay(&config, 0.799);
        assert_eq!(delay, Duration::from_millis(200));
    }

    #[test]
    fn delay_formula_matches_specification() {
        let config = config();
        for p in [0.1_f32, 0.3, 0.5, 0.7] {
            let expected = (f64::from(config.max_timeout_ms as u32)
                * (1.0 - f64::from(p) / f64::from(config.threshold)))
            .max(config.min_timeout_ms as f64) as u64;
            assert_eq!(
                TurnHandler::reply_delay(&config, p),
                Duration::from_millis(expected)
            );
        }
    }
}
