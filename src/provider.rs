//! Memory and action providers feeding the generation orchestrator.
//!
//! Memory providers contribute ordered context messages ahead of a model
//! call; action providers declare callable side effects and execute them.

use crate::context::Context;
use crate::error::{AgentError, Result};
use crate::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A callable side effect declared to the language model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionDefinition {
    /// The action name (e.g. `"lookup"`, `"end-call"`).
    pub name: String,
    /// Human-readable description of the action's purpose.
    pub description: String,
    /// JSON Schema describing the action's arguments.
    pub parameters: serde_json::Value,
}

impl ActionDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// Result of one action invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Provider of callable side effects.
#[async_trait]
pub trait ActionProvider: Send + Sync {
    /// Provider name for logs and ledger entries.
    fn name(&self) -> &str;

    /// The actions this provider exposes.
    fn definitions(&self) -> Vec<ActionDefinition>;

    /// Execute one of this provider's actions.
    async fn invoke(&self, action: &str, arguments: serde_json::Value) -> Result<ActionOutcome>;
}

/// Provider of contextual messages prepended to model prompts.
#[async_trait]
pub trait MemoryProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Messages to prepend, in prompt order.
    async fn recall(&self, context: &Context) -> Result<Vec<Message>>;
}

/// Ordered collection of enabled providers for one agent.
#[derive(Clone, Default)]
pub struct ProviderSet {
    memory: Vec<Arc<dyn MemoryProvider>>,
    actions: Vec<Arc<dyn ActionProvider>>,
}

impl ProviderSet {
    pub fn new(
        memory: Vec<Arc<dyn MemoryProvider>>,
        actions: Vec<Arc<dyn ActionProvider>>,
    ) -> Self {
        Self { memory, actions }
    }

    /// Gather context messages from every memory provider, in registration
    /// order. A failing provider is skipped with a warning rather than
    /// aborting the prompt.
    pub async fn recall_all(&self, context: &Context) -> Vec<Message> {
        let mut gathered = Vec::new();
        for provider in &self.memory {
            match provider.recall(context).await {
                Ok(messages) => gathered.extend(messages),
                Err(e) => {
                    tracing::warn!(provider = provider.name(), "memory recall failed: {e}");
                }
            }
        }
        gathered
    }

    /// All action definitions across providers, in registration order.
    pub fn definitions(&self) -> Vec<ActionDefinition> {
        self.actions
            .iter()
            .flat_map(|p| p.definitions())
            .collect()
    }

    /// Invoke the named action on whichever provider declares it.
    ///
    /// # Errors
    ///
    /// `NotFound` if no provider declares `action`; otherwise the
    /// provider's own result.
    pub async fn invoke(
        &self,
        action: &str,
        arguments: serde_json::Value,
    ) -> Result<ActionOutcome> {
        for provider in &self.actions {
            if provider.definitions().iter().any(|d| d.name == action) {
                return provider.invoke(action, arguments).await;
            }
        }
        Err(AgentError::NotFound(format!("action {action}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoActions;

    #[async_trait]
    impl ActionProvider for EchoActions {
        fn name(&self) -> &str {
            "echo"
        }

        fn definitions(&self) -> Vec<ActionDefinition> {
            vec![ActionDefinition::new(
                "echo",
                "Echo the arguments back",
                serde_json::json!({"type": "object"}),
            )]
        }

        async fn invoke(
            &self,
            _action: &str,
            arguments: serde_json::Value,
        ) -> Result<ActionOutcome> {
            Ok(ActionOutcome::ok(arguments))
        }
    }

    #[tokio::test]
    async fn invoke_routes_to_declaring_provider() {
        let set = ProviderSet::new(vec![], vec![Arc::new(EchoActions)]);
        let outcome = set
            .invoke("echo", serde_json::json!({"x": 1}))
            .await
            .expect("invoke");
        assert!(outcome.success);
        assert_eq!(outcome.output, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn unknown_action_is_not_found() {
        let set = ProviderSet::new(vec![], vec![Arc::new(EchoActions)]);
        let err = set.invoke("missing", serde_json::json!({})).await;
        assert!(matches!(err, Err(AgentError::NotFound(_))));
    }
}
