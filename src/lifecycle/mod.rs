//! # Supervisor de Ciclo de Vida da Task
//!
//! Implementa §4.7: o que cerca a árvore de execução em si (`step_executor`),
//! nas três fases que o motor original distribuía entre `task_process/*.py` e
//! `core/signals/*.py` — aqui reunidas porque, de novo, tudo roda num único
//! processo Tokio em vez de processo-filho + monitor externo:
//!
//! 1. **Pre-run**: materializa `GlobalCache.origin_file_mapping` num
//!    diretório escopado à task ([`stage_files`]) e anuncia o início via RPC
//!    ([`rpc::start_task`]).
//! 2. **Run**: delega a `step_executor::run_task`, sob supervisão de recursos
//!    (`signals::run_with_supervision`).
//! 3. **Post-run**: anuncia o fim via RPC, exporta o backup de telemetria e
//!    remove backups obsoletos ([`gc_stale_backups`]).

pub mod rpc;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ErrorCode, StructuredError};
use crate::limits::EngineConfig;
use crate::protocol::GlobalCache;
use crate::signals::{self, ResourceWatch};
use crate::step_executor::{self, RunContext};
use crate::telemetry::record::TelemetryWriter;
use crate::tree::NodeRef;

/// Monta o cliente HTTP compartilhado de §4.7 "Run": pool por host, keepalive
/// TCP e um teto de conexões simultâneas derivado de `MAX_CONNECTIONS` — o
/// equivalente do `aiohttp.TCPConnector`/`ClientSession` original, na forma
/// idiomática do `reqwest::ClientBuilder`. Construído uma única vez no
/// startup e reutilizado por toda task subsequente.
pub fn build_http_client(config: &EngineConfig) -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(config.max_connections as usize)
        .tcp_keepalive(Duration::from_secs(60))
        .build()
        .expect("cliente HTTP compartilhado deve ser construível com configuração estática")
}

/// Pre-run (§4.7 item 1): copia cada arquivo local declarado em
/// `origin_file_mapping` para `{base_dir}/{task_id}/`, preenchendo
/// `staged_path`. Arquivos remotos (`remote: true`) são um "stream
/// chunk-by-chunk" no motor original; sem um transporte de arquivo remoto
/// grounded nesta submissão, eles são deixados sem `staged_path` (ver
/// DESIGN.md) — nenhum executor atual de fato lê esse campo.
pub async fn stage_files(task_id: &str, global_cache: &mut GlobalCache, base_dir: &str) -> Result<(), StructuredError> {
    if global_cache.origin_file_mapping.is_empty() {
        return Ok(());
    }

    let task_dir = Path::new(base_dir).join(task_id);
    tokio::fs::create_dir_all(&task_dir)
        .await
        .map_err(|e| StructuredError::new(ErrorCode::FILE_PERMISSION_ERROR, format!("criando diretório de staging: {e}")))?;

    for (file_id, descriptor) in global_cache.origin_file_mapping.iter_mut() {
        if descriptor.remote {
            continue;
        }
        let origin = Path::new(&descriptor.origin_path);
        let file_name = origin
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| std::ffi::OsString::from(file_id.as_str()));
        let dest = task_dir.join(&file_name);
        tokio::fs::copy(&origin, &dest)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::FILE_PERMISSION_ERROR, format!("staging de '{}': {e}", descriptor.origin_path)))?;
        descriptor.staged_path = Some(dest.to_string_lossy().into_owned());
    }
    Ok(())
}

/// Post-run (§4.7 item 3): remove do `backup_dir` todo arquivo `*.json` cujo
/// nome (derivado de um `record_backup_index`) não apareça em
/// `live_records` — espelha a comparação contra "the orchestrator-returned
/// list of live records" do texto da especificação.
pub fn gc_stale_backups(backup_dir: &str, live_records: &[String]) -> Result<usize, StructuredError> {
    let live: std::collections::HashSet<String> = live_records.iter().map(|r| format!("{}.json", r.replace(':', "_"))).collect();

    let entries = match std::fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string())),
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !live.contains(&name) {
            if std::fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
    }
    Ok(removed)
}

/// Orquestra as três fases de §4.7 ao redor de uma única execução de task.
/// Chamado pelo handler de `POST /execute` dentro de um `tokio::spawn`
/// independente da requisição HTTP original (execução é assíncrona — a
/// resposta já foi enviada com `{task_id, message}` antes desta função
/// rodar).
pub struct LifecycleOutcome {
    pub root: NodeRef,
    pub backup_path: Option<std::path::PathBuf>,
    pub removed_stale_backups: usize,
}

#[allow(clippy::too_many_arguments)]
pub async fn run_task_with_lifecycle(
    ctx: Arc<RunContext>,
    config: Arc<EngineConfig>,
    http_client: reqwest::Client,
    telemetry: Option<Arc<TelemetryWriter>>,
    resource_watch: ResourceWatch,
    staging_dir: String,
    backup_dir: String,
    task_id: String,
    project: String,
    env: String,
    main_case: crate::protocol::Case,
    child_cases: Vec<crate::protocol::ChildCase>,
    record_backup_index: String,
) -> Result<LifecycleOutcome, StructuredError> {
    let router = config.asynctest_rcp_router.clone();
    rpc::start_task(&http_client, &router, &task_id, &record_backup_index).await?;

    let root = signals::run_with_supervision(
        resource_watch,
        step_executor::run_task(ctx, &task_id, project, env, main_case, child_cases),
    )
    .await?;

    let live_records = rpc::end_task(&http_client, &router, &task_id, &record_backup_index).await?;

    let backup_path = if let Some(writer) = &telemetry {
        Some(writer.export_backup(&backup_dir).await?)
    } else {
        None
    };

    let removed_stale_backups = if live_records.is_empty() { 0 } else { gc_stale_backups(&backup_dir, &live_records)? };

    let _ = staging_dir; // diretório já consumido em stage_files antes desta chamada; mantido no retorno por simetria de assinatura.

    Ok(LifecycleOutcome { root, backup_path, removed_stale_backups })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn gc_stale_backups_keeps_live_records_only() {
        let dir = std::env::temp_dir().join(format!("lifecycle_gc_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("live_task.json"), "{}").unwrap();
        std::fs::write(dir.join("stale_task.json"), "{}").unwrap();

        let removed = gc_stale_backups(dir.to_str().unwrap(), &["live_task".to_string()]).unwrap();

        assert_eq!(removed, 1);
        assert!(dir.join("live_task.json").exists());
        assert!(!dir.join("stale_task.json").exists());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn gc_stale_backups_on_missing_dir_is_noop() {
        let removed = gc_stale_backups("/nonexistent/path/for/lifecycle/test", &[]).unwrap();
        assert_eq!(removed, 0);
    }

    #[tokio::test]
    async fn stage_files_skips_empty_mapping() {
        let mut cache = GlobalCache { origin_file_mapping: HashMap::new(), ..Default::default() };
        let result = stage_files("task-1", &mut cache, "/tmp/nonexistent-base").await;
        assert!(result.is_ok());
    }
}
