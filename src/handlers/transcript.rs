//! Block handler folding incoming text chunks into user messages.
//!
//! Successive chunks of one utterance extend the same user message; a new
//! message starts only once something else (an agent reply, an action
//! record) has been appended after it.

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::message::{MessageBody, MessageLog, MessagePatch, Role};
use crate::runtime::{BlockHandler, EventSink};
use async_trait::async_trait;

pub struct TranscriptHandler;

#[async_trait]
impl BlockHandler for TranscriptHandler {
    fn name(&self) -> &'static str {
        "transcript"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &crate::context::ContextEditor,
        _events: &EventSink,
    ) -> Result<()> {
        let EventPayload::Text { chunk, .. } = &event.payload else {
            return Ok(());
        };
        if chunk.is_empty() {
            return Ok(());
        }

        let ctx = context.get();
        let mut log = MessageLog::new(ctx.messages);

        let open_user = log
            .last()
            .filter(|m| m.role() == Role::User)
            .map(|m| (m.id.clone(), m.body.content().to_owned()));

        match open_user {
            Some((id, existing)) => {
                log.update(
                    &id,
                    MessagePatch::User {
                        content: Some(format!("{existing}{chunk}")),
                    },
                )?;
            }
            None => {
                log.create(MessageBody::User {
                    content: chunk.clone(),
                })?;
            }
        }

        let mut next = context.get();
        next.messages = log.into_messages();
        context.set(next);
        Ok(())
    }
}
