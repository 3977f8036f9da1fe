//! # Superfície HTTP Externa
//!
//! Implementa §6 "External interfaces": o router `axum` com as quatro rotas
//! auxiliares (`POST /execute`, `POST /restore_record`, `GET /ping`,
//! `POST /rpc/record`), espelhando `server/app/task/execute.py` do motor
//! original (que montava as mesmas rotas sobre FastAPI). Cada handler é fino
//! — a lógica de negócio mora em `lifecycle`/`telemetry::record`/`validation`;
//! este módulo só faz a tradução HTTP ↔ domínio.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::limits::EngineConfig;
use crate::lifecycle;
use crate::protocol::Submission;
use crate::signals::{self, ResourceWatch};
use crate::step_executor::RunContext;
use crate::telemetry::record::{TelemetryWriter, DEFAULT_BACKUP_DIR};
use crate::tree::DynamicMapping;
use crate::validation;
use crate::variables::SharedVariableState;

/// Estado compartilhado por todos os handlers, construído uma vez no
/// startup e clonado (barato, tudo atrás de `Arc`) a cada requisição via
/// `axum::extract::State`.
#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<EngineConfig>,
    pub http_client: reqwest::Client,
    pub resource_watch: ResourceWatch,
    pub backup_dir: String,
    pub staging_dir: String,
}

impl ApiState {
    pub fn new(config: Arc<EngineConfig>, http_client: reqwest::Client, resource_watch: ResourceWatch) -> Self {
        Self {
            config,
            http_client,
            resource_watch,
            backup_dir: DEFAULT_BACKUP_DIR.to_string(),
            staging_dir: "static/task_staging".to_string(),
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/restore_record", post(restore_record))
        .route("/ping", get(ping))
        .route("/rpc/record", post(rpc_record))
        .with_state(state)
}

// ============================================================================
// POST /execute
// ============================================================================

#[derive(Debug, Serialize)]
struct ExecuteResponse {
    task_id: String,
    message: String,
}

/// Recebe `{exec, record}`, valida estruturalmente, dispara a execução em
/// background (`tokio::spawn`) e responde imediatamente com
/// `{task_id, message}` — a execução em si é assíncrona (§6).
async fn execute(State(state): State<ApiState>, Json(submission): Json<Submission>) -> (StatusCode, Json<ExecuteResponse>) {
    let Submission { exec, record } = submission;
    let task_id = exec.task_info.task_id.clone();

    if let Err(errors) = validation::validate_exec(&exec) {
        let message = errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ");
        return (StatusCode::BAD_REQUEST, Json(ExecuteResponse { task_id, message }));
    }

    let config = state.config.clone();
    let http_client = state.http_client.clone();
    let resource_watch = state.resource_watch.clone();
    let backup_dir = state.backup_dir.clone();
    let staging_dir = state.staging_dir.clone();

    tokio::spawn(async move {
        let crate::protocol::Exec {
            task_info,
            case_list,
            child_case_list,
            step_mapping,
            mut global_cache,
            case_steps_snapshot: _,
        } = exec;

        if let Err(e) = lifecycle::stage_files(&task_info.task_id, &mut global_cache, &staging_dir).await {
            tracing::error!(task_id = %task_info.task_id, error = %e, "falha no staging de arquivos de pre-run");
            return;
        }

        let mut cases: HashMap<String, crate::protocol::Case> = case_list.into_iter().map(|c| (c.id.clone(), c)).collect();
        let main_case = match cases.remove(&task_info.main_case_id) {
            Some(c) => c,
            None => {
                tracing::error!(task_id = %task_info.task_id, "main_case_id não resolve após validação — isto é um bug");
                return;
            }
        };
        let child_cases: Vec<crate::protocol::ChildCase> =
            child_case_list.into_iter().filter(|cc| main_case.child_case_ids.contains(&cc.id)).collect();
        cases.insert(main_case.id.clone(), main_case.clone());

        let telemetry = match TelemetryWriter::connect(&config.local_redis_connection, record.record_backup_index.clone(), config.redis_task_record_timeout).await {
            Ok(writer) => Some(Arc::new(writer)),
            Err(e) => {
                tracing::error!(task_id = %task_info.task_id, error = %e, "falha ao conectar telemetria; prosseguindo sem gravação");
                None
            }
        };

        let shared_state = SharedVariableState::new(global_cache);
        let templates = Arc::new(crate::template::TemplateEngine::new());
        let dynamic_mapping = Arc::new(DynamicMapping::new());
        let ctx = RunContext::new(
            config.clone(),
            shared_state,
            templates,
            http_client.clone(),
            Arc::new(step_mapping),
            Arc::new(cases),
            dynamic_mapping,
            telemetry.clone(),
        );

        let project = task_info.project.clone();
        let env = task_info.env.clone();
        let task_id = task_info.task_id.clone();

        match lifecycle::run_task_with_lifecycle(
            ctx,
            config,
            http_client,
            telemetry,
            resource_watch,
            staging_dir,
            backup_dir,
            task_id.clone(),
            project,
            env,
            main_case,
            child_cases,
            record.record_backup_index,
        )
        .await
        {
            Ok(outcome) => {
                tracing::info!(task_id = %task_id, removed_stale_backups = outcome.removed_stale_backups, "task finalizada");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "task abortada por supervisão de recursos ou falha de RPC");
            }
        }
    });

    (StatusCode::OK, Json(ExecuteResponse { task_id, message: "task submetida".to_string() }))
}

// ============================================================================
// POST /restore_record
// ============================================================================

#[derive(Debug, Deserialize)]
struct RestoreRecordRequest {
    record_backup_index: String,
}

#[derive(Debug, Serialize)]
struct RestoreRecordResponse {
    restored: bool,
    message: String,
}

async fn restore_record(State(state): State<ApiState>, Json(body): Json<RestoreRecordRequest>) -> (StatusCode, Json<RestoreRecordResponse>) {
    let writer = match TelemetryWriter::connect(&state.config.local_redis_connection, body.record_backup_index.clone(), state.config.redis_task_record_timeout).await {
        Ok(w) => w,
        Err(e) => return (StatusCode::BAD_GATEWAY, Json(RestoreRecordResponse { restored: false, message: e.to_string() })),
    };

    match writer.restore_backup(&state.backup_dir).await {
        Ok(()) => (StatusCode::OK, Json(RestoreRecordResponse { restored: true, message: "restaurado".to_string() })),
        Err(e) => (StatusCode::NOT_FOUND, Json(RestoreRecordResponse { restored: false, message: e.to_string() })),
    }
}

// ============================================================================
// GET /ping
// ============================================================================

#[derive(Debug, Serialize)]
struct PingResponse {
    memory_total: f64,
    memory_available: f64,
    memory_used: f64,
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

async fn ping() -> Json<PingResponse> {
    let (total, available) = signals::read_system_memory_mb().unwrap_or((0.0, 0.0));
    Json(PingResponse {
        memory_total: round2(total),
        memory_available: round2(available),
        memory_used: round2((total - available).max(0.0)),
    })
}

// ============================================================================
// POST /rpc/record
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcRecordQuery {
    name: String,
    record_backup_index: String,
    #[serde(default)]
    #[allow(dead_code)]
    executor_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RpcRecordBody {
    #[serde(default)]
    key: Option<String>,
    #[serde(default)]
    start_index: Option<isize>,
    #[serde(default)]
    extra_key: Option<String>,
    #[serde(default)]
    keys: Option<Vec<String>>,
}

/// Dispatcha por `name` sobre as três operações de leitura do §6
/// "`/rpc/record`": `get_json_list_by_chunk`, `get_json_from_redis`,
/// `get_redis_details_batch` — espelhando `RecordController(name).get_data(..)`
/// do motor original.
async fn rpc_record(
    State(state): State<ApiState>,
    Query(query): Query<RpcRecordQuery>,
    body: Option<Json<RpcRecordBody>>,
) -> (StatusCode, Json<Value>) {
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let writer = match TelemetryWriter::connect(&state.config.local_redis_connection, query.record_backup_index.clone(), state.config.redis_task_record_timeout).await {
        Ok(w) => w,
        Err(e) => return (StatusCode::BAD_GATEWAY, Json(serde_json::json!({ "error": e.to_string() }))),
    };

    let result: Result<Value, crate::errors::StructuredError> = match query.name.as_str() {
        "get_json_from_redis" => {
            let key = body.key.unwrap_or_default();
            writer.get_json_from_redis(&key, &state.backup_dir).await
        }
        "get_json_list_by_chunk" => {
            let key = body.key.unwrap_or_default();
            let start_index = body.start_index.unwrap_or(0);
            writer
                .get_json_list_by_chunk(&key, start_index, body.extra_key.as_deref(), &state.backup_dir)
                .await
                .map(|(items, next_index, extra)| serde_json::json!({ "items": items, "next_index": next_index, "extra": extra }))
        }
        "get_redis_details_batch" => {
            let keys = body.keys.unwrap_or_default();
            writer
                .get_redis_details_batch(&keys, &state.backup_dir)
                .await
                .map(|m| serde_json::to_value(m).unwrap_or(Value::Null))
        }
        other => return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": format!("operação rpc desconhecida: {other}") }))),
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(e) => (StatusCode::NOT_FOUND, Json(serde_json::json!({ "error": e.to_string() }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(123.4567), 123.46);
        assert_eq!(round2(0.0), 0.0);
    }

    #[tokio::test]
    async fn ping_returns_non_negative_figures() {
        let Json(response) = ping().await;
        assert!(response.memory_total >= 0.0);
        assert!(response.memory_used >= 0.0);
    }
}
