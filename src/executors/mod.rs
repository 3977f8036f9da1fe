//! # Módulo de Executores de Nó
//!
//! Implementa §4.8: cada variante de `Step` sabe rodar a si mesma através do
//! contrato uniforme `NodeExecutor::run(ctx) -> CoreExecReturn`. O despacho é
//! um registro fechado por tag de step (`dispatch`), generalizando o
//! type-switch do executor original (ver design note "Dynamic dispatch on
//! step type").
//!
//! Os executores concretos de cada tipo de step são providos nos submódulos:
//! `http` (`interface`), `assertion` (`assertion`), `wait` (`delay`),
//! `control` (`if`/`error`/`empty`/`database`/`script`/containers) e
//! `sandbox` (a superfície de capacidade exposta a scripts, §5.1).

pub mod assertion;
pub mod control;
pub mod http;
pub mod sandbox;
pub mod wait;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::StructuredError;
use crate::protocol::Step;
use crate::template::TemplateEngine;
use crate::tree::NodeRef;
use crate::variables::{SharedVariableState, VariableHandle};

/// Classificação de um evento de processo emitido por um node executor —
/// o suficiente para `telemetry::ProcessObject` decidir em qual stream (pai,
/// child-case, summary) encaminhá-lo, sem que este módulo precise conhecer o
/// schema de telemetria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEventKind {
    Success,
    Error,
    Warning,
}

/// Um evento de processo isolado (§4.8: "pode emitir eventos de processo
/// para os quatro streams de telemetria através de helpers no runner").
#[derive(Debug, Clone)]
pub struct ProcessEvent {
    pub kind: ProcessEventKind,
    pub message: String,
    pub payload: Value,
}

impl ProcessEvent {
    pub fn success(message: impl Into<String>, payload: Value) -> Self {
        Self { kind: ProcessEventKind::Success, message: message.into(), payload }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { kind: ProcessEventKind::Warning, message: message.into(), payload: Value::Null }
    }
}

/// Retorno de um node executor (§4.8): eventos de processo paralelos, a
/// serem fanned-out pelo runner para os streams de pai/child-case/summary.
/// Vazio é um retorno válido — nem todo executor tem algo a reportar.
#[derive(Debug, Clone, Default)]
pub struct CoreExecReturn {
    pub events: Vec<ProcessEvent>,
}

impl CoreExecReturn {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(event: ProcessEvent) -> Self {
        Self { events: vec![event] }
    }
}

/// Tudo que um node executor precisa para rodar: o nó dinâmico associado, um
/// handle de variáveis (já com `can_set` resolvido pelo chamador conforme
/// §4.4 — steps de assertion/if/error recebem um handle somente-leitura), o
/// motor de templates compartilhado e o cache global read-mostly, mais um
/// cliente HTTP compartilhado para o executor `interface`.
pub struct ExecutionContext {
    pub node: NodeRef,
    pub variables: VariableHandle,
    pub templates: Arc<TemplateEngine>,
    pub shared_state: Arc<SharedVariableState>,
    pub http_client: reqwest::Client,
}

/// Contrato uniforme de um node executor (§4.8). `run` nunca propaga erro de
/// infraestrutura diretamente: falhas de negócio (assertion falhou, dataset
/// ausente) viram `Err(StructuredError)`, que o runner do scheduler traduz
/// em `error_strategy::handle_failure`.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError>;
}

/// Resolve o node executor de um step pela sua tag de tipo (§9 "Dynamic
/// dispatch on step type"). `group`/`case`/`multitasker` não têm comportamento
/// próprio além de orquestrar filhos — já coberto pelo `scheduler` — então
/// caem no executor de container, que é um no-op.
pub fn dispatch(step: &Step) -> Box<dyn NodeExecutor> {
    match step {
        Step::Interface(s) => Box::new(http::InterfaceExecutor::new(s.clone())),
        Step::Assertion(s) => Box::new(assertion::AssertionExecutor::new(s.clone())),
        Step::Delay(s) => Box::new(wait::DelayExecutor::new(s.clone())),
        Step::If(s) => Box::new(control::IfExecutor::new(s.clone())),
        Step::Error(s) => Box::new(control::ErrorExecutor::new(s.clone())),
        Step::Database(s) => Box::new(control::DatabaseExecutor::new(s.clone())),
        Step::Script(s) => Box::new(control::ScriptExecutor::new(s.clone())),
        Step::Empty(_) => Box::new(control::ContainerExecutor),
        Step::Group(_) | Step::Case(_) | Step::Multitasker(_) => Box::new(control::ContainerExecutor),
    }
}
