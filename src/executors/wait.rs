//! # Executor `delay`
//!
//! Implementa o step `delay` (§8): dorme pelo número de milissegundos
//! declarado, coagindo valores fora de `[0, 99999]` para 0 com um evento de
//! aviso, espelhando `core/payload/node_executor/delay.py` do motor
//! original.

use tokio::time::{sleep, Duration};

use crate::errors::StructuredError;
use crate::protocol::DelayStep;

use super::{CoreExecReturn, ExecutionContext, NodeExecutor, ProcessEvent};

const MAX_DELAY_MS: i64 = 99_999;

pub struct DelayExecutor {
    step: DelayStep,
}

impl DelayExecutor {
    pub fn new(step: DelayStep) -> Self {
        Self { step }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for DelayExecutor {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let raw = self.step.delay;
        let (delay, warning) = if raw < 0 {
            (0, Some("tempo de delay menor que 0, corrigido para 0 milissegundos"))
        } else if raw > MAX_DELAY_MS {
            (0, Some("tempo de delay maior que 99999, corrigido para 0 milissegundos"))
        } else {
            (raw, None)
        };

        sleep(Duration::from_millis(delay as u64)).await;

        let mut events = Vec::new();
        if let Some(message) = warning {
            events.push(ProcessEvent::warning(message));
        }
        events.push(ProcessEvent::success(format!("dormiu {delay} milissegundos"), serde_json::json!({ "delay_ms": delay })));

        Ok(CoreExecReturn { events })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GlobalCache, StepCommon};
    use crate::template::TemplateEngine;
    use crate::tree::{DynamicNode, StaticPathIndex};
    use crate::variables::{SharedVariableState, VariableHandle};
    use std::sync::Arc;

    fn make_ctx() -> ExecutionContext {
        let root = DynamicNode::new_root(StaticPathIndex::root("t1"), "p".into(), "e".into());
        let state = SharedVariableState::new(GlobalCache::default());
        let handle = VariableHandle::new(root.clone(), state.clone(), true);
        ExecutionContext {
            node: root,
            variables: handle,
            templates: Arc::new(TemplateEngine::new()),
            shared_state: state,
            http_client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn negative_delay_is_coerced_to_zero_with_warning() {
        let ctx = make_ctx();
        let step = DelayStep { common: StepCommon { id: "d1".into(), ..Default::default() }, delay: -10 };
        let result = DelayExecutor::new(step).run(&ctx).await.unwrap();
        assert_eq!(result.events.len(), 2);
        assert!(matches!(result.events[0].kind, super::super::ProcessEventKind::Warning));
    }

    #[tokio::test]
    async fn delay_beyond_max_is_coerced_to_zero() {
        let ctx = make_ctx();
        let step = DelayStep { common: StepCommon { id: "d1".into(), ..Default::default() }, delay: 100_000 };
        let result = DelayExecutor::new(step).run(&ctx).await.unwrap();
        assert_eq!(result.events.len(), 2);
    }

    #[tokio::test]
    async fn in_range_delay_sleeps_and_reports_success_only() {
        let ctx = make_ctx();
        let step = DelayStep { common: StepCommon { id: "d1".into(), ..Default::default() }, delay: 1 };
        let result = DelayExecutor::new(step).run(&ctx).await.unwrap();
        assert_eq!(result.events.len(), 1);
    }
}
