//! # Módulo de Variáveis - Escopos Global / Ambiente / Temporário
//!
//! Implementa a leitura e escrita de variáveis descritas em §4.4, com a
//! ordem de precedência de leitura (mais específico primeiro):
//!
//! 1. `temp_variables`, caminhando do nó atual até a raiz, parando na
//!    fronteira `child_case`/`child_step_case`/`child_multitasker` mais
//!    próxima.
//! 2. Variáveis de ambiente mescladas: o mapa `(project, env)` do próprio nó
//!    sobreposto ao mapa `(project, env)` do caso raiz (o valor do nó local
//!    vence quando os dois existem).
//! 3. Variáveis globais (um único mapa plano).
//!
//! Escritas sempre têm sucesso num handle gravável; um handle somente-leitura
//! (`can_set = false` — scripts de assertion/if/error, ou qualquer nó
//! `can_set=False`) rejeita a escrita e produz um evento de aviso em vez de
//! mutar o estado, espelhando `VariableWarningProcessObject` do motor
//! original.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::{EnvStrategy, GlobalCache, VarMap};
use crate::tree::{find_ancestor, DynamicNode, NodeEntity, NodeRef};

/// Estado mutável compartilhado por todos os runners de uma execução:
/// variáveis globais e variáveis por `(project, env)`. `GlobalCache`
/// carrega o resto (interfaces, datasets, arquivos) como dados imutáveis
/// read-mostly; só os dois mapas de variáveis são escritos em tempo de
/// execução, então só eles entram atrás do `Mutex`.
pub struct SharedVariableState {
    pub global_cache: Mutex<GlobalCache>,
}

impl SharedVariableState {
    pub fn new(global_cache: GlobalCache) -> Arc<Self> {
        Arc::new(Self {
            global_cache: Mutex::new(global_cache),
        })
    }
}

/// Escopo alvo de uma escrita `temp` (§4.4: "scope case" mira o child-case
/// que envolve o nó; "scope env/global" delega às lojas de ambiente/global).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteScope {
    /// Grava no nó-ancestral gravável mais próximo (default).
    Nearest,
    /// Grava explicitamente no `child_case` que envolve o nó.
    Case,
    Env,
    Global,
}

/// Evento produzido por uma leitura/escrita de variável, para que o chamador
/// (o wrapper do step no `scheduler`) o projete nas streams de telemetria
/// corretas sem que este módulo precise conhecer o schema de telemetria.
#[derive(Debug, Clone)]
pub enum VariableEvent {
    Get { scope: &'static str, key: String, value: Option<Value> },
    Set { scope: &'static str, key: String, value: Value },
    Warning { message: String },
}

pub struct VariableHandle {
    node: NodeRef,
    state: Arc<SharedVariableState>,
    can_set: bool,
}

impl VariableHandle {
    pub fn new(node: NodeRef, state: Arc<SharedVariableState>, can_set: bool) -> Self {
        Self { node, state, can_set }
    }

    /// `get("key")`: temp (caminhando os ancestrais) → env mesclado → global.
    pub async fn get(&self, key: &str) -> (Option<Value>, VariableEvent) {
        if let Some(v) = self.walk_temp(key).await {
            return (
                Some(v.clone()),
                VariableEvent::Get { scope: "temp", key: key.to_string(), value: Some(v) },
            );
        }
        let merged = self.merged_env_variables().await;
        if let Some(v) = merged.get(key) {
            return (
                Some(v.clone()),
                VariableEvent::Get { scope: "env", key: key.to_string(), value: Some(v.clone()) },
            );
        }
        let global = self.state.global_cache.lock().await;
        match global.origin_global_variable_mapping.get(key) {
            Some(v) => (
                Some(v.clone()),
                VariableEvent::Get { scope: "global", key: key.to_string(), value: Some(v.clone()) },
            ),
            None => (None, VariableEvent::Warning { message: format!("variável não encontrada: {key}") }),
        }
    }

    pub async fn set(&self, key: &str, value: Value, scope: WriteScope) -> VariableEvent {
        if !self.can_set {
            return VariableEvent::Warning {
                message: "este step não tem permissão para definir variáveis".to_string(),
            };
        }
        match scope {
            WriteScope::Global => {
                let mut global = self.state.global_cache.lock().await;
                global.origin_global_variable_mapping.insert(key.to_string(), value.clone());
                VariableEvent::Set { scope: "global", key: key.to_string(), value }
            }
            WriteScope::Env => self.set_env(key, value).await,
            WriteScope::Case => {
                match find_ancestor(&self.node, |n| n.entity.is_child_case() || n.entity.is_child_step_case()).await {
                    Some(target) => {
                        let mut guard = target.lock().await;
                        guard.temp_variables.get_or_insert_with(HashMap::new).insert(key.to_string(), value.clone());
                        VariableEvent::Set { scope: "temp", key: key.to_string(), value }
                    }
                    None => VariableEvent::Warning { message: "nenhum child-case envolvente encontrado".to_string() },
                }
            }
            WriteScope::Nearest => {
                match find_ancestor(&self.node, |n| n.temp_variables.is_some()).await {
                    Some(target) => {
                        let mut guard = target.lock().await;
                        guard.temp_variables.get_or_insert_with(HashMap::new).insert(key.to_string(), value.clone());
                        VariableEvent::Set { scope: "temp", key: key.to_string(), value }
                    }
                    None => VariableEvent::Warning { message: "nenhum escopo temporário gravável encontrado".to_string() },
                }
            }
        }
    }

    async fn set_env(&self, key: &str, value: Value) -> VariableEvent {
        let (project, env) = match self.project_env().await {
            Some(pe) => pe,
            None => {
                return VariableEvent::Warning {
                    message: "falha ao resolver projeto/ambiente para escrita".to_string(),
                }
            }
        };
        let mut global = self.state.global_cache.lock().await;
        let entry = global
            .origin_project_env_variable_mapping
            .entry(project)
            .or_default()
            .entry(env)
            .or_default();
        entry.insert(key.to_string(), value.clone());
        VariableEvent::Set { scope: "env", key: key.to_string(), value }
    }

    /// Caminha `temp_variables` do nó até a raiz, parando na fronteira
    /// `child_case`/virtual mais próxima (§4.4 ponto 1).
    async fn walk_temp(&self, key: &str) -> Option<Value> {
        let mut current = self.node.clone();
        loop {
            let (is_boundary, found, parent) = {
                let guard = current.lock().await;
                let found = guard.temp_variables.as_ref().and_then(|m| m.get(key).cloned());
                let is_boundary = guard.entity.is_child_case() || guard.entity.is_child_step_case() || guard.entity.is_child_multitasker();
                (is_boundary, found, guard.parent.clone())
            };
            if let Some(v) = found {
                return Some(v);
            }
            if is_boundary {
                return None;
            }
            match parent.and_then(|w| w.upgrade()) {
                Some(p) => current = p,
                None => return None,
            }
        }
    }

    /// Resolve `(project, env)` efetivos do nó seguindo `env_strategy`
    /// (`self_case` usa o próprio env do caso; `current_case` delega ao pai).
    async fn project_env(&self) -> Option<(String, String)> {
        let mut current = self.node.clone();
        loop {
            let (project, env, parent) = {
                let guard = current.lock().await;
                (guard.project.clone(), guard.env.clone(), guard.parent.clone())
            };
            if !project.is_empty() && !env.is_empty() {
                return Some((project, env));
            }
            match parent.and_then(|w| w.upgrade()) {
                Some(p) => current = p,
                None => return None,
            }
        }
    }

    async fn root_case_project_env(&self) -> Option<(String, String)> {
        let root = find_ancestor(&self.node, |n| matches!(n.entity, NodeEntity::MainCase { is_root: true, .. })).await?;
        let guard = root.lock().await;
        Some((guard.project.clone(), guard.env.clone()))
    }

    /// Variáveis de ambiente mescladas (§4.4 ponto 2): o mapa do nó sobrepõe
    /// o mapa do caso raiz quando os dois diferem; quando são o mesmo
    /// `(project, env)`, apenas um lookup é feito.
    async fn merged_env_variables(&self) -> VarMap {
        let Some((project, env)) = self.project_env().await else {
            return HashMap::new();
        };
        let root_pe = self.root_case_project_env().await;
        let global = self.state.global_cache.lock().await;
        let lookup = |p: &str, e: &str| -> VarMap {
            global
                .origin_project_env_variable_mapping
                .get(p)
                .and_then(|envs| envs.get(e))
                .cloned()
                .unwrap_or_default()
        };

        match root_pe {
            Some((rp, re)) if rp == project && re == env => lookup(&project, &env),
            Some((rp, re)) => {
                let mut merged = lookup(&rp, &re);
                merged.extend(lookup(&project, &env));
                merged
            }
            None => lookup(&project, &env),
        }
    }
}

/// Resolve o `(project, env)` que um `Case` aninhado deve usar a partir de
/// `env_strategy`: `self_case` usa o próprio `(project, env)` declarado;
/// `current_case` herda do nó pai (repassado pelo chamador em `loop_expansion`).
pub fn resolve_case_env(strategy: EnvStrategy, own: (&str, &str), parent: (&str, &str)) -> (String, String) {
    match strategy {
        EnvStrategy::SelfCase => (own.0.to_string(), own.1.to_string()),
        EnvStrategy::CurrentCase => (parent.0.to_string(), parent.1.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorStrategy;
    use crate::tree::StaticPathIndex;
    use serde_json::json;

    #[tokio::test]
    async fn temp_write_then_read_same_child_case() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());
        let cc_spi = root_spi.for_main_case("c1").for_child_case("cc1");
        let cc = DynamicNode::new_child(
            &root,
            cc_spi.clone(),
            NodeEntity::ChildCase { child_case_id: "cc1".into(), case_id: "c1".into() },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            Some(HashMap::new()),
            "p".into(),
            "e".into(),
        )
        .await;
        let step = DynamicNode::new_child(
            &cc,
            cc_spi.for_step("s1"),
            NodeEntity::Step { case_id: "c1".into(), step_id: "s1".into(), step_type: "script" },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        let state = SharedVariableState::new(GlobalCache::default());
        let handle = VariableHandle::new(step.clone(), state.clone(), true);
        handle.set("i", json!(1), WriteScope::Nearest).await;

        let (value, _) = handle.get("i").await;
        assert_eq!(value, Some(json!(1)));
    }

    #[tokio::test]
    async fn readonly_handle_rejects_writes() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi, "p".into(), "e".into());
        let state = SharedVariableState::new(GlobalCache::default());
        let handle = VariableHandle::new(root, state, false);
        let event = handle.set("x", json!(1), WriteScope::Global).await;
        assert!(matches!(event, VariableEvent::Warning { .. }));
    }
}
