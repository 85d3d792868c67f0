//! Block handler folding generated output into the message log.
//!
//! Streams of `outgoing-text` chunks accumulate into one agent message;
//! action results append an action message and file the originating
//! request on the agent message that triggered it.

use crate::error::Result;
use crate::event::{Event, EventPayload};
use crate::message::{ActionRequest, MessageBody, MessageLog, MessagePatch, Role};
use crate::runtime::{BlockHandler, EventSink};
use async_trait::async_trait;

pub struct AgentOutputHandler;

#[async_trait]
impl BlockHandler for AgentOutputHandler {
    fn name(&self) -> &'static str {
        "agent-output"
    }

    async fn on_event(
        &self,
        event: &Event,
        context: &crate::context::ContextEditor,
        _events: &EventSink,
    ) -> Result<()> {
        match &event.payload {
            EventPayload::OutgoingText { chunk } if !chunk.is_empty() => {
                self.append_text(context, chunk)
            }
            EventPayload::OutgoingActionResult {
                action_id,
                action_name,
                arguments,
                success,
                output,
                error,
            } => self.append_action(
                context,
                action_id,
                action_name,
                arguments.clone(),
                *success,
                output.clone(),
                error.clone(),
            ),
            _ => Ok(()),
        }
    }
}

impl AgentOutputHandler {
    fn append_text(&self, context: &crate::context::ContextEditor, chunk: &str) -> Result<()> {
        let ctx = context.get();
        let mut log = MessageLog::new(ctx.messages);

        let open_agent = log
            .last()
            .filter(|m| m.role() == Role::Agent)
            .map(|m| (m.id.clone(), m.body.content().to_owned()));

        match open_agent {
            Some((id, existing)) => {
                log.update(
                    &id,
                    MessagePatch::Agent {
                        content: Some(format!("{existing}{chunk}")),
                        actions: None,
                    },
                )?;
            }
            None => {
                log.create(MessageBody::Agent {
                    content: chunk.to_owned(),
                    actions: vec![],
                })?;
            }
        }

        let mut next = context.get();
        next.messages = log.into_messages();
        context.set(next);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn append_action(
        &self,
        context: &crate::context::ContextEditor,
        action_id: &str,
        action_name: &str,
        arguments: serde_json::Value,
        success: bool,
        output: Option<serde_json::Value>,
        error: Option<String>,
    ) -> Result<()> {
        let ctx = context.get();
        let mut log = MessageLog::new(ctx.messages);

        // File the request on the agent message that produced it.
        if let Some(agent) = log.find_last_from_roles(&[Role::Agent]) {
            let id = agent.id.clone();
            let mut actions = match &agent.body {
                MessageBody::Agent { actions, .. } => actions.clone(),
                _ => vec![],
            };
            if !actions.iter().any(|a| a.id == action_id) {
                actions.push(ActionRequest {
                    id: action_id.to_owned(),
                    name: action_name.to_owned(),
                    arguments,
                });
                log.update(
                    &id,
                    MessagePatch::Agent {
                        content: None,
                        actions: Some(actions),
                    },
                )?;
            }
        }

        log.create(MessageBody::Action {
            action_id: action_id.to_owned(),
            action_name: action_name.to_owned(),
            action_success: success,
            action_output: output,
            action_error: error,
        })?;

        let mut next = context.get();
        next.messages = log.into_messages();
        context.set(next);
        Ok(())
    }
}
