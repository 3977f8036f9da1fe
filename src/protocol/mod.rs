//! # Módulo de Protocolo - Modelo de Dados da Especificação de Task
//!
//! Define as estruturas estáticas submetidas por um cliente em `POST /execute`:
//! a hierarquia `TaskInfo` → `Case` → `ChildCase` → `Step`, o `StepMapping` que
//! resolve `(case_id, step_id)` para um `Step`, e o `GlobalCache` de dados
//! read-mostly compartilhados por toda a execução (interfaces, datasets,
//! variáveis de ambiente/projeto, conexões de banco).
//!
//! ## Formato de envio
//!
//! Corresponde ao JSON de `{exec, record}`: `exec` contém quatro coleções de
//! topo nível paralelas (`case_list`, `child_case_list`, `step_mapping`,
//! `global_cache`) mais `task_info`, espelhando a forma do payload original
//! (`core/payload/core.py` no histórico do produto) em vez de aninhar steps
//! diretamente sob casos — assim o `StepMapping` continua sendo a única fonte
//! de verdade indexada por `(case_id, step_id)`.
//!
//! Cada variante de `Step` carrega os campos comuns (`id`, `label`, `check`,
//! `is_raise_step`, `error_strategy`) via `#[serde(flatten)]` de `StepCommon`,
//! generalizando o padrão `action`/`params` do executor de steps simples para
//! um conjunto fechado de tipos de step, tal como descrito no design note de
//! "achatar hierarquias de classe profundas em um sum type".

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub type VarMap = HashMap<String, Value>;

// ============================================================================
// ENUMS DE ESTRATÉGIA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStrategy {
    Sequential,
    Concurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvStrategy {
    SelfCase,
    CurrentCase,
}

impl Default for EnvStrategy {
    fn default() -> Self {
        EnvStrategy::SelfCase
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriveStrategy {
    Times,
    Dataset,
    Script,
}

/// As dez estratégias de erro descritas em §4.5, mais `raise` (transparente,
/// delega ao ancestral) e `ref_case_inner` (delega ao `case_error_strategy`
/// do mesmo `Case`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    CurrentStep,
    CurrentCase,
    Case,
    Multitasker,
    CurrentMultitasker,
    RefCase,
    RefChildCase,
    RefCaseInner,
    Task,
    Raise,
}

impl Default for ErrorStrategy {
    fn default() -> Self {
        ErrorStrategy::Raise
    }
}

fn default_loop_strategy() -> LoopStrategy {
    LoopStrategy::Sequential
}

// ============================================================================
// SUBMISSÃO
// ============================================================================

/// Corpo de `POST /execute`: `{exec, record}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Submission {
    pub exec: Exec,
    pub record: RecordMeta,
}

/// As cinco coleções de topo-nível que compõem uma especificação de task.
#[derive(Debug, Clone, Deserialize)]
pub struct Exec {
    pub task_info: TaskInfo,
    pub case_list: Vec<Case>,
    #[serde(default)]
    pub child_case_list: Vec<ChildCase>,
    pub step_mapping: StepMapping,
    #[serde(default)]
    pub global_cache: GlobalCache,
    /// Snapshot opaco usado apenas para replay; não interpretado pelo motor.
    #[serde(default)]
    pub case_steps_snapshot: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordMeta {
    pub record_backup_index: String,
}

// ============================================================================
// TASKINFO
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub project: String,
    pub env: String,
    /// Id do `Case` raiz em `case_list` a partir do qual a árvore é construída.
    pub main_case_id: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "default_loop_strategy")]
    pub loop_strategy: LoopStrategy,
}

// ============================================================================
// CASE / CHILDCASE
// ============================================================================

/// Um caso principal ou aninhado (via step `case`). Quando dirigido por loop,
/// é instanciado em uma ou mais `ChildCase`s (estáticas, para o caso raiz) ou
/// `ChildStepCase`s virtuais (para casos referenciados por um step `case`).
#[derive(Debug, Clone, Deserialize)]
pub struct Case {
    pub id: String,
    pub project: String,
    pub env: String,
    #[serde(default)]
    pub env_strategy: EnvStrategy,
    pub drive_strategy: DriveStrategy,
    #[serde(default)]
    pub times: Option<String>,
    #[serde(default)]
    pub dataset: Option<DatasetRef>,
    #[serde(default)]
    pub load_loop_script: Option<String>,
    #[serde(default = "default_loop_strategy")]
    pub loop_strategy: LoopStrategy,
    /// Estratégia efetiva quando uma falha ocorre dentro deste caso.
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// Quando `error_strategy == ref_case_inner`, a estratégia real é esta.
    #[serde(default)]
    pub case_error_strategy: ErrorStrategy,
    /// Ids, em `StepMapping[case.id]`, dos steps que cada instanciação executa.
    pub children: Vec<String>,
    /// Ids estáticos em `child_case_list`, somente para o caso raiz.
    #[serde(default)]
    pub child_case_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRef {
    pub dataset_id: String,
    pub env: String,
}

/// Uma instanciação concreta, estática, de um caso principal.
#[derive(Debug, Clone, Deserialize)]
pub struct ChildCase {
    pub id: String,
    pub case_id: String,
    #[serde(default)]
    pub temp_variables: VarMap,
}

// ============================================================================
// STEP
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepCommon {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub check: String,
    #[serde(default)]
    pub is_raise_step: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Interface(InterfaceStep),
    Script(ScriptStep),
    Group(GroupStep),
    Database(DatabaseStep),
    Case(CaseStep),
    Multitasker(MultitaskerStep),
    Assertion(AssertionStep),
    Empty(EmptyStep),
    If(IfStep),
    Error(ErrorStep),
    Delay(DelayStep),
}

impl Step {
    pub fn common(&self) -> &StepCommon {
        match self {
            Step::Interface(s) => &s.common,
            Step::Script(s) => &s.common,
            Step::Group(s) => &s.common,
            Step::Database(s) => &s.common,
            Step::Case(s) => &s.common,
            Step::Multitasker(s) => &s.common,
            Step::Assertion(s) => &s.common,
            Step::Empty(s) => &s.common,
            Step::If(s) => &s.common,
            Step::Error(s) => &s.common,
            Step::Delay(s) => &s.common,
        }
    }

    pub fn id(&self) -> &str {
        &self.common().id
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Step::Interface(_) => "interface",
            Step::Script(_) => "script",
            Step::Group(_) => "group",
            Step::Database(_) => "database",
            Step::Case(_) => "case",
            Step::Multitasker(_) => "multitasker",
            Step::Assertion(_) => "assertion",
            Step::Empty(_) => "empty",
            Step::If(_) => "if",
            Step::Error(_) => "error",
            Step::Delay(_) => "delay",
        }
    }

    /// Estratégia de erro declarada no step (apenas `group`/`if`/`case`/
    /// `multitasker` carregam uma; os demais herdam transparentemente via
    /// `raise` quando consultados pelo motor de estratégia de erro).
    pub fn error_strategy(&self) -> ErrorStrategy {
        match self {
            Step::Group(s) => s.error_strategy,
            Step::Case(s) => s.error_strategy,
            Step::Multitasker(s) => s.error_strategy,
            Step::If(s) => s.error_strategy,
            _ => ErrorStrategy::Raise,
        }
    }

    /// Ids de step filhos em declaração estática (não inclui virtuais de loop).
    pub fn static_children(&self) -> &[String] {
        match self {
            Step::Group(s) => &s.children,
            Step::If(s) => &s.children,
            Step::Multitasker(s) => &s.children,
            _ => &[],
        }
    }

    pub fn has_children(&self) -> bool {
        matches!(self, Step::Group(_) | Step::If(_) | Step::Multitasker(_) | Step::Case(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub interface_id: String,
    pub project_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScriptStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub script: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupStep {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub database_id: String,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub params_mode: Option<String>,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub script: Option<String>,
}

/// Step `case`: referencia um `Case` (possivelmente aninhado) em `case_list`.
#[derive(Debug, Clone, Deserialize)]
pub struct CaseStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub case_id: String,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultitaskerStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub drive_strategy: DriveStrategy,
    #[serde(default)]
    pub times: Option<String>,
    #[serde(default)]
    pub dataset: Option<DatasetRef>,
    #[serde(default)]
    pub load_loop_script: Option<String>,
    #[serde(default = "default_loop_strategy")]
    pub loop_strategy: LoopStrategy,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertMode {
    LastInterface,
    Script,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssertionStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub assert_mode: AssertMode,
    #[serde(default)]
    pub script: Option<String>,
    /// "body" | "header" | "status_code"
    #[serde(default)]
    pub interface_range: Option<String>,
    /// "pattern" (jsonpath) | "raw"
    #[serde(default)]
    pub interface_body_range: Option<String>,
    #[serde(default)]
    pub interface_body_jsonpath: Option<String>,
    #[serde(default)]
    pub interface_body_pattern: Option<String>,
    #[serde(default)]
    pub interface_body_value: Option<Value>,
    #[serde(default)]
    pub interface_header_key: Option<String>,
    #[serde(default)]
    pub interface_header_pattern: Option<String>,
    #[serde(default)]
    pub interface_header_value: Option<Value>,
    #[serde(default)]
    pub interface_code_pattern: Option<String>,
    #[serde(default)]
    pub interface_code_value: Option<Value>,
    #[serde(default)]
    pub success_desc: Option<String>,
    #[serde(default)]
    pub failed_desc: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmptyStep {
    #[serde(flatten)]
    pub common: StepCommon,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IfStep {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    /// "fast" (key/value/pattern) | "script"
    pub if_mode: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// "fast" | "script"
    pub error_mode: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelayStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// Milissegundos; coagido para 0 se fora de `[0, 99999]` (ver §8).
    pub delay: i64,
}

// ============================================================================
// STEP MAPPING
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StepMapping(pub HashMap<String, HashMap<String, Step>>);

impl StepMapping {
    pub fn get(&self, case_id: &str, step_id: &str) -> Option<&Step> {
        self.0.get(case_id).and_then(|m| m.get(step_id))
    }
}

// ============================================================================
// GLOBAL CACHE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct InterfaceDef {
    pub id: String,
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileDescriptor {
    pub origin_path: String,
    #[serde(default)]
    pub staged_path: Option<String>,
    #[serde(default)]
    pub remote: bool,
}

/// Uma linha de dados de dataset para um `(dataset_id, env)`, preservando a
/// ordem de declaração — a decisão de desempate de §9 ("quando múltiplas
/// linhas são default, a primeira na ordem de iteração vence") exige isso,
/// então usamos `Vec` em vez de `HashMap` para o mapa interno por ambiente.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetEnvEntry {
    pub env: String,
    #[serde(default)]
    pub depend: bool,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub data: Vec<VarMap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub id: String,
    pub dsn: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GlobalCache {
    #[serde(default)]
    pub interface_mapping: HashMap<String, InterfaceDef>,
    #[serde(default)]
    pub origin_file_mapping: HashMap<String, FileDescriptor>,
    #[serde(default)]
    pub project_env_server_mapping: HashMap<String, HashMap<String, String>>,
    #[serde(default)]
    pub origin_project_env_variable_mapping: HashMap<String, HashMap<String, VarMap>>,
    #[serde(default)]
    pub origin_dataset_mapping: HashMap<String, Vec<DatasetEnvEntry>>,
    #[serde(default)]
    pub origin_global_variable_mapping: VarMap,
    #[serde(default)]
    pub database_configs: HashMap<String, DatabaseConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_group_step_with_children() {
        let json = r#"{
            "type": "group",
            "id": "g1",
            "label": "grupo",
            "children": ["s1", "s2"]
        }"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.id(), "g1");
        assert_eq!(step.static_children(), &["s1".to_string(), "s2".to_string()]);
        assert_eq!(step.type_name(), "group");
    }

    #[test]
    fn parses_delay_step() {
        let json = r#"{"type": "delay", "id": "d1", "delay": 100}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        match step {
            Step::Delay(d) => assert_eq!(d.delay, 100),
            _ => panic!("expected delay step"),
        }
    }

    #[test]
    fn step_mapping_resolves_by_case_and_step_id() {
        let json = r#"{
            "case_a": {
                "s1": {"type": "empty", "id": "s1"}
            }
        }"#;
        let mapping: StepMapping = serde_json::from_str(json).unwrap();
        assert!(mapping.get("case_a", "s1").is_some());
        assert!(mapping.get("case_a", "missing").is_none());
    }
}
