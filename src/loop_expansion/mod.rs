//! # Módulo de Expansão de Loop
//!
//! Converte a especificação de drive de um `Case`/`Multitasker` (§4.3) em uma
//! sequência de linhas `temp_variables`, uma por filho virtual
//! (`ChildStepCase`/`ChildMultitasker`) a ser construído pelo chamador. Este
//! módulo não toca a árvore dinâmica — apenas resolve *quantas* instâncias e
//! com que `temp_variables` cada uma nasce; `scheduler`/tree-building usam o
//! resultado para registrar os nós.

use async_trait::async_trait;

use crate::errors::{ErrorCode, StructuredError};
use crate::protocol::{DatasetRef, DriveStrategy, GlobalCache, VarMap};
use crate::tree::NodeStatus;

/// Resultado normalizado de um `load_loop_script` (§4.3 "script"), já traduzido
/// do valor de retorno do sandbox para os quatro casos que a especificação
/// distingue.
#[derive(Debug, Clone)]
pub enum LoopScriptOutcome {
    /// Um `DataSet`: cada elemento vira uma linha de `temp_variables`.
    Rows(Vec<VarMap>),
    /// Um valor inteiro-like: produz `n` linhas vazias.
    Count(i64),
    /// Qualquer valor com tamanho (string, lista, etc. sem forma de `DataSet`):
    /// produz `len` linhas vazias.
    Sized(usize),
    /// Qualquer outro valor escalar: produz exatamente 1 linha vazia.
    Scalar,
}

/// Ponte para o sandbox de scripts (§5.1, `executors::sandbox`), mantida como
/// trait para que este módulo não dependa da implementação concreta do
/// interpretador de scripts.
#[async_trait]
pub trait LoopScriptDriver: Send + Sync {
    async fn run_loop_script(&self, script: &str) -> Result<LoopScriptOutcome, StructuredError>;
}

/// Parâmetros de drive de um `Case` ou `Multitasker`, coletados antes da
/// chamada a [`expand_virtual_children`].
pub struct DriveSpec<'a> {
    pub drive_strategy: DriveStrategy,
    pub times: Option<&'a str>,
    pub dataset: Option<&'a DatasetRef>,
    pub load_loop_script: Option<&'a str>,
}

/// Uma linha de expansão já pronta para virar um nó virtual: suas
/// `temp_variables` e o status de entrada ditado por `check` (§4.3: "inicia em
/// `skipped` se `check == \"none\"`, senão `pending`").
#[derive(Debug, Clone)]
pub struct VirtualChildSpec {
    pub temp_variables: VarMap,
    pub initial_status: NodeStatus,
}

pub fn initial_status_for(check: &str) -> NodeStatus {
    if check == "none" {
        NodeStatus::Skipped
    } else {
        NodeStatus::Pending
    }
}

/// Expande `spec` em linhas de `temp_variables` e empacota cada uma com seu
/// status de entrada, derivado de `check`.
pub async fn expand_virtual_children(
    spec: DriveSpec<'_>,
    check: &str,
    global_cache: &GlobalCache,
    driver: &dyn LoopScriptDriver,
    max_generate_length: usize,
) -> Result<Vec<VirtualChildSpec>, StructuredError> {
    let rows = expand_rows(spec, global_cache, driver, max_generate_length).await?;
    let status = initial_status_for(check);
    Ok(rows
        .into_iter()
        .map(|temp_variables| VirtualChildSpec { temp_variables, initial_status: status })
        .collect())
}

async fn expand_rows(
    spec: DriveSpec<'_>,
    global_cache: &GlobalCache,
    driver: &dyn LoopScriptDriver,
    max_generate_length: usize,
) -> Result<Vec<VarMap>, StructuredError> {
    match spec.drive_strategy {
        DriveStrategy::Times => Ok(expand_times(spec.times)),
        DriveStrategy::Dataset => {
            let dataset = spec.dataset.ok_or_else(|| {
                StructuredError::new(ErrorCode::LOOP_DATASET_NOT_FOUND, "case/multitasker declara drive_strategy=dataset sem dataset")
            })?;
            let rows = resolve_dataset_rows(global_cache, dataset)?;
            Ok(cap_rows(rows, max_generate_length))
        }
        DriveStrategy::Script => {
            let script = spec.load_loop_script.ok_or_else(|| {
                StructuredError::new(
                    ErrorCode::LOOP_SCRIPT_INVALID_RESULT,
                    "case/multitasker declara drive_strategy=script sem load_loop_script",
                )
            })?;
            let outcome = driver.run_loop_script(script).await?;
            Ok(normalize_script_outcome(outcome, max_generate_length))
        }
    }
}

/// `times` não é limitado por `MAX_GENERATE_LENGTH` — apenas dataset e script
/// o são (§8 "Boundary cases"). Um `times` ausente ou não-numérico produz
/// zero filhos em vez de falhar a task inteira.
fn expand_times(times: Option<&str>) -> Vec<VarMap> {
    let n = times.and_then(|s| s.trim().parse::<i64>().ok()).unwrap_or(0).max(0);
    (0..n).map(|_| VarMap::new()).collect()
}

fn resolve_dataset_rows(global_cache: &GlobalCache, dataset: &DatasetRef) -> Result<Vec<VarMap>, StructuredError> {
    let entries = global_cache.origin_dataset_mapping.get(&dataset.dataset_id).ok_or_else(|| {
        StructuredError::new(
            ErrorCode::LOOP_DATASET_NOT_FOUND,
            format!("dataset '{}' não existe em origin_dataset_mapping", dataset.dataset_id),
        )
    })?;

    let own = entries.iter().find(|e| e.env == dataset.env).ok_or_else(|| {
        StructuredError::new(
            ErrorCode::LOOP_DATASET_NOT_FOUND,
            format!("dataset '{}' não tem linha para env '{}'", dataset.dataset_id, dataset.env),
        )
    })?;

    if own.depend {
        return Ok(own.data.clone());
    }

    // `depend` falso: cai para a primeira linha marcada `is_default` na ordem
    // de declaração (decisão de desempate fixada em DESIGN.md).
    let default = entries.iter().find(|e| e.is_default).ok_or_else(|| {
        StructuredError::new(
            ErrorCode::LOOP_DATASET_NOT_FOUND,
            format!("dataset '{}' não tem env default para fallback de '{}'", dataset.dataset_id, dataset.env),
        )
    })?;
    Ok(default.data.clone())
}

fn normalize_script_outcome(outcome: LoopScriptOutcome, max_generate_length: usize) -> Vec<VarMap> {
    match outcome {
        LoopScriptOutcome::Rows(rows) => cap_rows(rows, max_generate_length),
        LoopScriptOutcome::Count(n) => {
            let capped = (n.unsigned_abs() as usize).min(max_generate_length);
            vec![VarMap::new(); capped]
        }
        LoopScriptOutcome::Sized(len) => vec![VarMap::new(); len.min(max_generate_length)],
        LoopScriptOutcome::Scalar => vec![VarMap::new()],
    }
}

fn cap_rows(mut rows: Vec<VarMap>, max_generate_length: usize) -> Vec<VarMap> {
    if rows.len() > max_generate_length {
        rows.truncate(max_generate_length);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DatasetEnvEntry;
    use serde_json::json;
    use std::collections::HashMap;

    struct NullDriver;

    #[async_trait]
    impl LoopScriptDriver for NullDriver {
        async fn run_loop_script(&self, _script: &str) -> Result<LoopScriptOutcome, StructuredError> {
            Ok(LoopScriptOutcome::Scalar)
        }
    }

    #[tokio::test]
    async fn times_produces_n_empty_rows() {
        let spec = DriveSpec { drive_strategy: DriveStrategy::Times, times: Some("3"), dataset: None, load_loop_script: None };
        let rows = expand_virtual_children(spec, "all", &GlobalCache::default(), &NullDriver, 1000).await.unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| matches!(r.initial_status, NodeStatus::Pending)));
    }

    #[tokio::test]
    async fn check_none_starts_skipped() {
        let spec = DriveSpec { drive_strategy: DriveStrategy::Times, times: Some("1"), dataset: None, load_loop_script: None };
        let rows = expand_virtual_children(spec, "none", &GlobalCache::default(), &NullDriver, 1000).await.unwrap();
        assert!(matches!(rows[0].initial_status, NodeStatus::Skipped));
    }

    #[tokio::test]
    async fn dataset_falls_back_to_default_when_depend_is_false() {
        let mut global_cache = GlobalCache::default();
        global_cache.origin_dataset_mapping.insert(
            "ds1".to_string(),
            vec![
                DatasetEnvEntry { env: "staging".into(), depend: true, is_default: true, data: vec![HashMap::from([("x".to_string(), json!(1))])] },
                DatasetEnvEntry { env: "prod".into(), depend: false, is_default: false, data: vec![HashMap::from([("x".to_string(), json!(99))])] },
            ],
        );
        let dataset = DatasetRef { dataset_id: "ds1".into(), env: "prod".into() };
        let spec = DriveSpec { drive_strategy: DriveStrategy::Dataset, times: None, dataset: Some(&dataset), load_loop_script: None };
        let rows = expand_virtual_children(spec, "all", &global_cache, &NullDriver, 1000).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].temp_variables.get("x"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn unknown_dataset_is_fatal() {
        let dataset = DatasetRef { dataset_id: "missing".into(), env: "prod".into() };
        let spec = DriveSpec { drive_strategy: DriveStrategy::Dataset, times: None, dataset: Some(&dataset), load_loop_script: None };
        let err = expand_virtual_children(spec, "all", &GlobalCache::default(), &NullDriver, 1000).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LOOP_DATASET_NOT_FOUND);
    }

    #[tokio::test]
    async fn script_count_outcome_is_capped() {
        struct CountDriver;
        #[async_trait]
        impl LoopScriptDriver for CountDriver {
            async fn run_loop_script(&self, _script: &str) -> Result<LoopScriptOutcome, StructuredError> {
                Ok(LoopScriptOutcome::Count(50))
            }
        }
        let spec = DriveSpec { drive_strategy: DriveStrategy::Script, times: None, dataset: None, load_loop_script: Some("gen()") };
        let rows = expand_virtual_children(spec, "all", &GlobalCache::default(), &CountDriver, 10).await.unwrap();
        assert_eq!(rows.len(), 10);
    }
}
