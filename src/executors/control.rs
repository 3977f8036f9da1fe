//! # Executores de Controle de Fluxo
//!
//! `if` (§4.8, "conditional skip"), `error` (raise explícito do usuário),
//! `database`/`script` (stubs de capacidade — execução real está fora de
//! escopo, ver §9) e o executor de container (no-op para `group`/`case`/
//! `multitasker`/`empty`, cuja orquestração de filhos já é inteiramente do
//! `scheduler`/step-executor-core).
//!
//! `if`/`error` em modo `fast` reaproveitam a matriz de operadores de
//! `executors::assertion` (mesma origem no motor original:
//! `core/payload/node_executor/if_exec.py`'s `IfAssertionCore` é a mesma
//! tabela de `AssertionCore`, só sem os modos `exist`/`no_exist`/`inset`/
//! `un_inset` — mantemos a tabela cheia por simplicidade, já que os modos
//! extras nunca são exercitados por `if`/`error` mas não mudam o resultado
//! de nenhum caso coberto pela spec).

use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};
use crate::protocol::{DatabaseStep, ErrorStep, IfStep, ScriptStep};
use crate::tree::NodeStatus;

use super::assertion::evaluate;
use super::{CoreExecReturn, ExecutionContext, NodeExecutor, ProcessEvent};

async fn resolve_fast_comparison(
    ctx: &ExecutionContext,
    spi_key: &str,
    key: &Option<String>,
    value: &Option<Value>,
    pattern: &Option<String>,
) -> bool {
    let key_value = match key {
        Some(k) => Value::String(ctx.templates.resolve(spi_key, k, &ctx.variables).await.0),
        None => Value::Null,
    };
    let expected = match value {
        Some(Value::String(s)) => Value::String(ctx.templates.resolve(spi_key, s, &ctx.variables).await.0),
        Some(other) => other.clone(),
        None => Value::Null,
    };
    evaluate(pattern.as_deref().unwrap_or("eq"), Some(&key_value), &expected)
}

/// Executor `if` (§4.8): em modo `fast` compara `key` contra `value` pelo
/// `pattern`; em modo `script`, sem um sandbox real conectado, assume
/// sucesso (os filhos rodam normalmente). Em falha, marca o próprio nó como
/// `Conditional` — `check_and_change_status` do escalonador então desvia os
/// filhos para `skipped` sem contá-los como erro.
pub struct IfExecutor {
    step: IfStep,
}

impl IfExecutor {
    pub fn new(step: IfStep) -> Self {
        Self { step }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for IfExecutor {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let spi_key = ctx.node.lock().await.spi.key();

        let result = match self.step.if_mode.as_str() {
            "fast" => resolve_fast_comparison(ctx, &spi_key, &self.step.key, &self.step.value, &self.step.pattern).await,
            "script" => true,
            other => {
                return Err(StructuredError::new(ErrorCode::INTERNAL_ERROR, format!("if_mode desconhecido: {other}"))
                    .with_step_id(self.step.common.id.clone()))
            }
        };

        if result {
            Ok(CoreExecReturn::single(ProcessEvent::success(
                "condição satisfeita, filhos serão executados",
                Value::Null,
            )))
        } else {
            ctx.node.lock().await.status = NodeStatus::Conditional;
            Ok(CoreExecReturn::single(ProcessEvent::warning("condição falhou, filhos serão pulados")))
        }
    }
}

/// Executor `error` (raise explícito): em modo `fast`/`script`, uma condição
/// satisfeita interrompe a execução com uma falha clássica (entra na
/// engrenagem de `error_strategy`); caso contrário o step apenas relata que
/// a condição não disparou e a execução segue normalmente.
pub struct ErrorExecutor {
    step: ErrorStep,
}

impl ErrorExecutor {
    pub fn new(step: ErrorStep) -> Self {
        Self { step }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for ErrorExecutor {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let spi_key = ctx.node.lock().await.spi.key();

        let triggered = match self.step.error_mode.as_str() {
            "fast" => resolve_fast_comparison(ctx, &spi_key, &self.step.key, &self.step.value, &self.step.pattern).await,
            "script" => false,
            other => {
                return Err(StructuredError::new(ErrorCode::INTERNAL_ERROR, format!("error_mode desconhecido: {other}"))
                    .with_step_id(self.step.common.id.clone()))
            }
        };

        if triggered {
            Err(StructuredError::new(ErrorCode::INTERNAL_ERROR, format!("erro levantado explicitamente: {}", self.step.common.label))
                .with_step_id(self.step.common.id.clone()))
        } else {
            Ok(CoreExecReturn::single(ProcessEvent::warning("condição de erro não disparou, execução continua")))
        }
    }
}

/// Stub de capacidade para `database` (§9: execução real de banco de dados
/// fora de escopo — apenas a resolução de `database_id`/`params` seria
/// implementada por um executor de verdade).
pub struct DatabaseExecutor {
    step: DatabaseStep,
}

impl DatabaseExecutor {
    pub fn new(step: DatabaseStep) -> Self {
        Self { step }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for DatabaseExecutor {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        Ok(CoreExecReturn::single(ProcessEvent::warning(format!(
            "step 'database' ({}) é um stub: execução real de banco de dados está fora de escopo",
            self.step.database_id
        ))))
    }
}

/// Stub de capacidade para `script` solto (fora de `if`/`error`/`assertion`):
/// sem interpretador conectado, relata sucesso com aviso.
pub struct ScriptExecutor {
    step: ScriptStep,
}

impl ScriptExecutor {
    pub fn new(step: ScriptStep) -> Self {
        Self { step }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for ScriptExecutor {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let _ = &self.step.script;
        Ok(CoreExecReturn::single(ProcessEvent::warning("step 'script' é um stub: nenhum sandbox de verdade está conectado")))
    }
}

/// `group`/`case`/`multitasker`/`empty` não têm comportamento próprio: o
/// `scheduler` já orquestra seus filhos via `run_sequentially`/
/// `run_concurrently`; este executor existe só para preencher `dispatch()`.
pub struct ContainerExecutor;

#[async_trait::async_trait]
impl NodeExecutor for ContainerExecutor {
    async fn run(&self, _ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        Ok(CoreExecReturn::empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ErrorStrategy, GlobalCache, StepCommon};
    use crate::template::TemplateEngine;
    use crate::tree::{DynamicNode, StaticPathIndex};
    use crate::variables::{SharedVariableState, VariableHandle};
    use std::sync::Arc;

    fn make_ctx() -> ExecutionContext {
        let root = DynamicNode::new_root(StaticPathIndex::root("t1"), "p".into(), "e".into());
        let state = SharedVariableState::new(GlobalCache::default());
        let handle = VariableHandle::new(root.clone(), state.clone(), false);
        ExecutionContext {
            node: root,
            variables: handle,
            templates: Arc::new(TemplateEngine::new()),
            shared_state: state,
            http_client: reqwest::Client::new(),
        }
    }

    #[tokio::test]
    async fn if_fast_failure_marks_node_conditional() {
        let ctx = make_ctx();
        let step = IfStep {
            common: StepCommon { id: "if1".into(), ..Default::default() },
            error_strategy: ErrorStrategy::Raise,
            if_mode: "fast".into(),
            key: Some("2".into()),
            value: Some(Value::String("1".into())),
            pattern: Some("eq".into()),
            script: None,
            children: vec![],
        };
        let executor = IfExecutor::new(step);
        executor.run(&ctx).await.unwrap();
        assert_eq!(ctx.node.lock().await.status, NodeStatus::Conditional);
    }

    #[tokio::test]
    async fn if_fast_success_leaves_node_pending() {
        let ctx = make_ctx();
        let step = IfStep {
            common: StepCommon { id: "if1".into(), ..Default::default() },
            error_strategy: ErrorStrategy::Raise,
            if_mode: "fast".into(),
            key: Some("1".into()),
            value: Some(Value::String("1".into())),
            pattern: Some("eq".into()),
            script: None,
            children: vec![],
        };
        let executor = IfExecutor::new(step);
        executor.run(&ctx).await.unwrap();
        assert_eq!(ctx.node.lock().await.status, NodeStatus::Pending);
    }

    #[tokio::test]
    async fn error_fast_triggered_condition_raises() {
        let ctx = make_ctx();
        let step = ErrorStep {
            common: StepCommon { id: "e1".into(), ..Default::default() },
            error_mode: "fast".into(),
            key: Some("1".into()),
            value: Some(Value::String("1".into())),
            pattern: Some("eq".into()),
            script: None,
        };
        let executor = ErrorExecutor::new(step);
        assert!(executor.run(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn database_executor_is_a_non_failing_stub() {
        let ctx = make_ctx();
        let step = DatabaseStep {
            common: StepCommon { id: "db1".into(), ..Default::default() },
            database_id: "main".into(),
            sql: None,
            params_mode: None,
            params: Value::Null,
            script: None,
        };
        let executor = DatabaseExecutor::new(step);
        assert!(executor.run(&ctx).await.is_ok());
    }
}
