//! # Módulo de Árvore - Nós Dinâmicos e Índice de Caminho Estático
//!
//! A árvore estática (`TaskInfo` → `Case` → `ChildCase` → `Step`) é imutável
//! durante a execução. A **árvore dinâmica** é construída em cima dela,
//! camada a camada, à medida que o `scheduler` entra em `before()` de cada
//! runner (§4.1); carrega o estado volátil (`status`, `result`,
//! `has_child_error`/`has_child_skipped`, o último resultado de interface
//! visível para assertions) que a especificação estática não tem onde guardar.
//!
//! `StaticPathIndex` (SPI) é a identidade determinística de um nó — usada
//! tanto para registrar o nó em `DynamicMapping` quanto para derivar toda
//! chave de telemetria em `telemetry::keys`.
//!
//! O ponteiro de pai nunca é dono do filho (ver §9 "Cyclic references"): é um
//! `Weak` sobre o mesmo `Arc<Mutex<..>>` que o registro em `DynamicMapping`
//! possui de verdade, então a vida do nó está atada ao registro do `run`, não
//! à árvore de filhos.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::Mutex;

use crate::protocol::{ErrorStrategy, VarMap};

// ============================================================================
// STATUS / RESULTADO
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Running,
    End,
    Error,
    Skipped,
    Conditional,
    ErrorChild,
    SkippedChild,
}

impl NodeStatus {
    /// Invariante 1 de §8: ao fim da task nenhum nó fica `Pending`/`Running`.
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::Pending | NodeStatus::Running)
    }

    /// Estados que fazem `check_and_change_status` desviar descendentes
    /// ainda não iniciados para o caminho `skipped` (§4.1 "Skipped check").
    pub fn blocks_descendants(self) -> bool {
        matches!(self, NodeStatus::Skipped | NodeStatus::Error | NodeStatus::Conditional)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeResult {
    Unknown,
    Success,
    ErrorSelf,
    ErrorChild,
    SkippedSelf,
    SkippedChild,
}

impl NodeResult {
    pub fn is_error(self) -> bool {
        matches!(self, NodeResult::ErrorSelf | NodeResult::ErrorChild)
    }

    pub fn is_skipped(self) -> bool {
        matches!(self, NodeResult::SkippedSelf | NodeResult::SkippedChild)
    }
}

// ============================================================================
// ÍNDICE DE CAMINHO ESTÁTICO (SPI)
// ============================================================================

/// Coordenadas determinísticas de um step: `(task, case, child_case, step,
/// parent_step)` mais o breadcrumb `position_list` construído de cima para
/// baixo. Duas chamadas de `child()` com os mesmos argumentos produzem a
/// mesma chave — é o que permite reconstruir toda chave de telemetria a
/// partir de um SPI (invariante 5 de §8).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StaticPathIndex {
    pub task_id: String,
    pub case_id: String,
    pub child_case_id: String,
    pub step_id: String,
    pub parent_step_id: Option<String>,
    pub position_list: Vec<String>,
}

impl StaticPathIndex {
    pub fn root(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            case_id: String::new(),
            child_case_id: String::new(),
            step_id: "task".to_string(),
            parent_step_id: None,
            position_list: vec!["task".to_string()],
        }
    }

    pub fn for_main_case(&self, case_id: &str) -> Self {
        let mut position_list = self.position_list.clone();
        position_list.push(format!("case:{case_id}"));
        Self {
            task_id: self.task_id.clone(),
            case_id: case_id.to_string(),
            child_case_id: self.child_case_id.clone(),
            step_id: "case".to_string(),
            parent_step_id: None,
            position_list,
        }
    }

    pub fn for_child_case(&self, child_case_id: &str) -> Self {
        let mut position_list = self.position_list.clone();
        position_list.push(format!("child_case:{child_case_id}"));
        Self {
            child_case_id: child_case_id.to_string(),
            position_list,
            ..self.clone()
        }
    }

    /// Deriva o SPI de um step filho dentro do mesmo case/child-case.
    pub fn for_step(&self, step_id: &str) -> Self {
        let mut position_list = self.position_list.clone();
        position_list.push(format!("step:{step_id}"));
        Self {
            step_id: step_id.to_string(),
            parent_step_id: Some(self.step_id.clone()),
            position_list,
            ..self.clone()
        }
    }

    /// Deriva o SPI de um filho virtual de loop (carrega um índice de
    /// iteração no breadcrumb, já que virtuais compartilham `step_id`).
    pub fn for_virtual(&self, parent_step_id: &str, index: usize) -> Self {
        let mut position_list = self.position_list.clone();
        position_list.push(format!("iter:{parent_step_id}:{index}"));
        Self {
            step_id: format!("{parent_step_id}#{index}"),
            parent_step_id: Some(parent_step_id.to_string()),
            position_list,
            ..self.clone()
        }
    }

    /// Chave usada em `DynamicMapping` e como base das chaves de telemetria
    /// (`telemetry::keys` deriva a partir desta mesma string).
    pub fn key(&self) -> String {
        self.position_list.join("/")
    }
}

// ============================================================================
// ENTIDADE DO NÓ
// ============================================================================

/// O que este nó dinâmico representa na árvore estática/virtual. Usado pelo
/// motor de estratégia de erro (§4.5) para subir a árvore procurando a
/// categoria certa de ancestral (`Case`, `ChildCase`, `ChildStepCase`,
/// `ChildMultitasker`, a raiz da task).
#[derive(Debug, Clone)]
pub enum NodeEntity {
    Task,
    /// `is_root = true` only for the task's single root `Case` (the
    /// `main_case` distinguished from nested `case` steps in §4.4's project/
    /// env resolution walk).
    MainCase { case_id: String, is_root: bool },
    ChildCase { child_case_id: String, case_id: String },
    ChildStepCase { case_id: String },
    ChildMultitasker { step_id: String },
    Step { case_id: String, step_id: String, step_type: &'static str },
}

impl NodeEntity {
    pub fn is_case(&self) -> bool {
        matches!(self, NodeEntity::MainCase { .. })
    }

    pub fn is_child_case(&self) -> bool {
        matches!(self, NodeEntity::ChildCase { .. })
    }

    pub fn is_child_step_case(&self) -> bool {
        matches!(self, NodeEntity::ChildStepCase { .. })
    }

    pub fn is_child_multitasker(&self) -> bool {
        matches!(self, NodeEntity::ChildMultitasker { .. })
    }
}

// ============================================================================
// NÓ DINÂMICO
// ============================================================================

pub type NodeRef = Arc<Mutex<DynamicNode>>;
pub type WeakNodeRef = Weak<Mutex<DynamicNode>>;

/// Último resultado de interface publicado por um step `interface`, visível
/// para steps `assertion` descendentes em modo `LAST_INTERFACE` (§4.8).
#[derive(Debug, Clone)]
pub struct InterfaceLastResult {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub duration_ms: u64,
}

pub struct DynamicNode {
    pub spi: StaticPathIndex,
    pub entity: NodeEntity,
    pub parent: Option<WeakNodeRef>,
    pub children: Vec<NodeRef>,
    pub status: NodeStatus,
    pub result: NodeResult,
    pub has_child_error: bool,
    pub has_child_skipped: bool,
    /// `Some` apenas em fronteiras de escopo temporário: `ChildCase`,
    /// `ChildStepCase`, `ChildMultitasker` (§4.4 "temp writes default to the
    /// nearest child-case").
    pub temp_variables: Option<VarMap>,
    pub interface_last_node: Option<InterfaceLastResult>,
    pub error_strategy: ErrorStrategy,
    pub case_error_strategy: ErrorStrategy,
    pub project: String,
    pub env: String,
    pub done_step_count: u64,
}

impl DynamicNode {
    pub fn new_root(spi: StaticPathIndex, project: String, env: String) -> NodeRef {
        Arc::new(Mutex::new(Self {
            spi,
            entity: NodeEntity::Task,
            parent: None,
            children: Vec::new(),
            status: NodeStatus::Pending,
            result: NodeResult::Unknown,
            has_child_error: false,
            has_child_skipped: false,
            temp_variables: None,
            interface_last_node: None,
            error_strategy: ErrorStrategy::Raise,
            case_error_strategy: ErrorStrategy::Raise,
            project,
            env,
            done_step_count: 0,
        }))
    }

    pub async fn new_child(
        parent: &NodeRef,
        spi: StaticPathIndex,
        entity: NodeEntity,
        error_strategy: ErrorStrategy,
        case_error_strategy: ErrorStrategy,
        temp_variables: Option<VarMap>,
        project: String,
        env: String,
    ) -> NodeRef {
        let node = Arc::new(Mutex::new(Self {
            spi,
            entity,
            parent: Some(Arc::downgrade(parent)),
            children: Vec::new(),
            status: NodeStatus::Pending,
            result: NodeResult::Unknown,
            has_child_error: false,
            has_child_skipped: false,
            temp_variables,
            interface_last_node: None,
            error_strategy,
            case_error_strategy,
            project,
            env,
            done_step_count: 0,
        }));
        parent.lock().await.children.push(node.clone());
        node
    }
}

// ============================================================================
// REGISTRO POR EXECUÇÃO
// ============================================================================

/// `dynamic_mapping`: registro de todos os nós dinâmicos de um `run`, indexado
/// pela chave derivada do SPI. A vida dos nós está atada a este registro, não
/// à árvore de filhos (ver módulo doc).
#[derive(Default)]
pub struct DynamicMapping {
    nodes: Mutex<HashMap<String, NodeRef>>,
}

impl DynamicMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, spi: &StaticPathIndex, node: NodeRef) {
        self.nodes.lock().await.insert(spi.key(), node);
    }

    pub async fn get(&self, key: &str) -> Option<NodeRef> {
        self.nodes.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.nodes.lock().await.len()
    }
}

/// Sobe a árvore a partir de `node` (inclusive) até achar o primeiro
/// ancestral para o qual `pred` retorna `true`. Usado pelo motor de
/// estratégia de erro e pela checagem "ancestral terminal" do scheduler.
pub async fn find_ancestor<F>(node: &NodeRef, pred: F) -> Option<NodeRef>
where
    F: Fn(&DynamicNode) -> bool,
{
    let mut current = node.clone();
    loop {
        let matches = {
            let guard = current.lock().await;
            pred(&guard)
        };
        if matches {
            return Some(current);
        }
        let parent = current.lock().await.parent.clone();
        match parent.and_then(|w| w.upgrade()) {
            Some(p) => current = p,
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spi_key_roundtrips_through_breadcrumb() {
        let root = StaticPathIndex::root("task-1");
        let case = root.for_main_case("case-a");
        let child_case = case.for_child_case("cc-1");
        let step = child_case.for_step("s1");
        assert_eq!(step.key(), "task/case:case-a/child_case:cc-1/step:s1");
    }

    #[tokio::test]
    async fn find_ancestor_walks_to_root() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());
        let case_spi = root_spi.for_main_case("c1");
        let case_node = DynamicNode::new_child(
            &root,
            case_spi,
            NodeEntity::MainCase { case_id: "c1".into(), is_root: true },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        let found = find_ancestor(&case_node, |n| matches!(n.entity, NodeEntity::Task))
            .await
            .expect("task ancestor must exist");
        assert!(Arc::ptr_eq(&found, &root));
    }
}
