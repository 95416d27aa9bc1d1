//! Scripted [`AgentInvoker`] for tests and the `--substrate mock` CLI flag: no network
//! calls, just a fixed response (or a per-task-id script) replayed as a message stream.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::domain::error::AgentInvokerError;
use crate::domain::models::TokenUsage;
use crate::domain::ports::{AgentInvoker, AgentMessage, InvokeRequest, ResultSubtype};

/// One scripted outcome for a single `invoke` call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Success { text: String, tokens: TokenUsage },
    Failure(AgentInvokerError),
}

impl MockOutcome {
    #[must_use]
    pub fn success(text: impl Into<String>) -> Self {
        Self::Success {
            text: text.into(),
            tokens: TokenUsage { input: 100, output: 200 },
        }
    }
}

/// Replays a queue of [`MockOutcome`]s, one per `invoke` call, falling back to a single
/// default outcome once the queue is drained. Calls are recorded for assertions.
pub struct MockInvoker {
    default: MockOutcome,
    scripts: Mutex<HashMap<String, Vec<MockOutcome>>>,
    calls: Arc<Mutex<Vec<InvokeRequest>>>,
}

impl MockInvoker {
    #[must_use]
    pub fn new(default: MockOutcome) -> Self {
        Self {
            default,
            scripts: Mutex::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue outcomes to be returned in order for a task id, identified by the prompt's
    /// first line (callers are expected to prefix prompts with `task:<id>`).
    pub fn script(&self, task_id: impl Into<String>, outcomes: Vec<MockOutcome>) {
        self.scripts.lock().unwrap().insert(task_id.into(), outcomes);
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn next_outcome(&self, task_id: &str) -> MockOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        if let Some(queue) = scripts.get_mut(task_id) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        self.default.clone()
    }
}

#[async_trait]
impl AgentInvoker for MockInvoker {
    async fn invoke(
        &self,
        request: InvokeRequest,
    ) -> Result<BoxStream<'static, Result<AgentMessage, AgentInvokerError>>, AgentInvokerError> {
        let task_id = request
            .prompt
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("task:"))
            .unwrap_or_default()
            .to_string();
        self.calls.lock().unwrap().push(request);

        let outcome = self.next_outcome(&task_id);
        let messages: Vec<Result<AgentMessage, AgentInvokerError>> = match outcome {
            MockOutcome::Success { text, tokens } => vec![
                Ok(AgentMessage::Progress { detail: "started".into() }),
                Ok(AgentMessage::ContentBlock { text: text.clone() }),
                Ok(AgentMessage::Result {
                    subtype: ResultSubtype::Success,
                    text,
                    tokens,
                }),
            ],
            MockOutcome::Failure(err) => vec![Err(err)],
        };
        Ok(stream::iter(messages).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::path::PathBuf;

    fn request(prompt: &str) -> InvokeRequest {
        InvokeRequest {
            model: crate::domain::models::ModelTier::Sonnet,
            prompt: prompt.to_string(),
            cwd: PathBuf::from("/tmp"),
            max_turns: None,
        }
    }

    #[tokio::test]
    async fn replays_scripted_outcomes_in_order() {
        let invoker = MockInvoker::new(MockOutcome::success("default"));
        invoker.script(
            "t1",
            vec![MockOutcome::success("first"), MockOutcome::success("second")],
        );

        let stream = invoker.invoke(request("task:t1\ndo it")).await.unwrap();
        let messages: Vec<_> = stream.collect().await;
        assert!(matches!(
            messages.last().unwrap(),
            Ok(AgentMessage::Result { text, .. }) if text == "first"
        ));

        let stream = invoker.invoke(request("task:t1\ndo it again")).await.unwrap();
        let messages: Vec<_> = stream.collect().await;
        assert!(matches!(
            messages.last().unwrap(),
            Ok(AgentMessage::Result { text, .. }) if text == "second"
        ));

        assert_eq!(invoker.call_count(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_default_once_drained() {
        let invoker = MockInvoker::new(MockOutcome::success("default"));
        invoker.script("t1", vec![MockOutcome::success("only")]);

        let _ = invoker.invoke(request("task:t1\nfirst")).await.unwrap();
        let stream = invoker.invoke(request("task:t1\nsecond")).await.unwrap();
        let messages: Vec<_> = stream.collect().await;
        assert!(matches!(
            messages.last().unwrap(),
            Ok(AgentMessage::Result { text, .. }) if text == "default"
        ));
    }

    #[tokio::test]
    async fn surfaces_scripted_failures() {
        let invoker = MockInvoker::new(MockOutcome::Failure(AgentInvokerError::InvalidApiKey));
        let stream = invoker.invoke(request("task:any\n")).await.unwrap();
        let messages: Vec<_> = stream.collect().await;
        assert!(messages[0].is_err());
    }
}
