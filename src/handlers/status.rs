//! Block handler maintaining the listening/thinking/speaking triple.
//!
//! Transitions are total assignments, so no event can leave two flags
//! claiming the turn at once.

use crate::context::AgentStatus;
use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::runtime::{BlockHandler, EventSink};
use async_trait::async_trait;

pub struct StatusHandler;

const LISTENING: AgentStatus = AgentStatus {
    listening: true,
    thinking: false,
    speaking: false,
};
const THINKING: AgentStatus = AgentStatus {
    listening: false,
    thinking: true,
    speaking: false,
};
const SPEAKING: AgentStatus = AgentStatus {
    listening: false,
    thinking: false,
    speaking: true,
};

#[async_trait]
impl BlockHandler for StatusHandler {
    fn name(&self) -> &'static str {
        "status"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &crate::context::ContextEditor,
        _events: &EventSink,
    ) -> Result<()> {
        let next = match &event.payload {
            EventPayload::Start => Some(LISTENING),
            EventPayload::Continue | EventPayload::Say { .. } | EventPayload::Decide { .. } => {
                Some(THINKING)
            }
            EventPayload::OutgoingVoice { .. } => Some(SPEAKING),
            EventPayload::GenerationEnded { .. } | EventPayload::Interruption { .. } => {
                Some(LISTENING)
            }
            _ => None,
        };

        if let Some(next) = next {
            context.update(|mut ctx| {
                ctx.status = next;
                ctx
            });
        }
        Ok(())
    }
}
