//! # Escritor de Telemetria (Redis + Lua)
//!
//! Implementa §4.6: a gravação da execução nas quatro streams de telemetria
//! (`task_info`/`record_info`, `summary_record`, `child_case_record`,
//! `step_record`, `interface_success_detail`/`interface_error_detail`), todas
//! sob o namespace `{record_backup_index}:...`. Operações que precisam ser
//! atômicas sob concorrência (incrementar um contador, casar um item de lista
//! por índice, mesclar campos de um hash) usam scripts Lua via `redis::Script`
//! — o mesmo padrão de `rate_limit::redis::RedisRateLimitBackend` em
//! `monokrome-foiacquire`: nunca bookkeeping manual de SHA1/`SCRIPT LOAD`, o
//! cliente cuida do cache-ou-recarrega internamente a cada `invoke_async`.
//!
//! Ao fim de uma task, [`TelemetryWriter::export_backup`] varre todas as
//! chaves do namespace e grava um snapshot JSON em
//! `static/record_redis_backup/{record_backup_index com ':' -> '_'}.json`,
//! no formato `{chave: {"type", "value", "ttl"}}`; [`restore_record`] faz o
//! caminho inverso, usado pelo endpoint `POST /restore_record` (§7).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};

/// Espelha `RedisProcessTypeEnum` do motor original (`core/enums/executor.py`):
/// a tag fechada de todo `ProcessObject` que pode ser empilhado numa stream de
/// processo. A serialização em `snake_case` casa com o vocabulário de wire
/// original campo a campo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedisProcessType {
    System,
    SystemException,
    AssertionException,
    InterfaceException,
    DatabaseException,
    VariableException,
    VariableWarning,
    ActionScriptPrint,
    ActionScript,
    ActionSleep,
    ActionExtract,
    ActionWarning,
    InterfaceSuccessFinished,
    InterfaceErrorFinished,
    InterfaceWarning,
    /// Reservado no motor original; nunca produzido de fato (§9).
    InterfaceInfo,
    CaseDrive,
    MultitaskerDrive,
    AssertionSuccess,
    AssertionFailed,
    IfSuccess,
    IfFailed,
    ErrorFailed,
    DelayWarning,
    DelaySuccess,
    VariableGet,
    VariableSet,
    StepRunning,
    StepSkipped,
    StepError,
}

/// Um evento empilhável em qualquer stream de processo (§4.6). `desc` é
/// sempre uma string curta legível; `extra` carrega o payload estruturado
/// específico do tipo (p.ex. duração/status de uma interface).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessObject {
    #[serde(rename = "type")]
    pub process_type: RedisProcessType,
    pub desc: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub extra: Value,
    pub timestamp_ms: i64,
}

impl ProcessObject {
    pub fn new(process_type: RedisProcessType, desc: impl Into<String>, timestamp_ms: i64) -> Self {
        Self { process_type, desc: desc.into(), extra: Value::Null, timestamp_ms }
    }

    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Tag de status de um nó, empilhada em `{..}:status` de um child-case ou
/// step (distinto do `ProcessObject`, que é append-only em `:process`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Running,
    End,
    ErrorEnd,
    SkippedEnd,
    ConditionalEnd,
}

/// Diretório padrão de backup (§7 "Persisted state"), usado por `api` e
/// `lifecycle` quando nenhum outro caminho é configurado explicitamente.
pub const DEFAULT_BACKUP_DIR: &str = "static/record_redis_backup";

const INCR_FIELD_LUA: &str = r#"
local key = KEYS[1]
local field = ARGV[1]
local delta = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])
local result = redis.call('HINCRBY', key, field, delta)
if ttl > 0 then
    redis.call('EXPIRE', key, ttl)
end
return result
"#;

const HASH_MERGE_LUA: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
for i = 2, #ARGV, 2 do
    redis.call('HSET', key, ARGV[i], ARGV[i + 1])
end
if ttl > 0 then
    redis.call('EXPIRE', key, ttl)
end
return redis.status_reply('OK')
"#;

/// Atualiza campos de um elemento específico de uma lista JSON (o "item" de
/// `child_case_record:child_case_list`) por índice, sem reler-reescrever a
/// lista inteira do lado do cliente — espelha `list_item_update` do motor
/// original usado por `done_step_count`/`failed_step_count`/`skipped_step_count`.
const LIST_ITEM_UPDATE_LUA: &str = r#"
local key = KEYS[1]
local index = tonumber(ARGV[1])
local field = ARGV[2]
local delta = tonumber(ARGV[3])
local raw = redis.call('LINDEX', key, index)
if not raw then
    return redis.error_reply('index out of range')
end
local item = cjson.decode(raw)
item[field] = (tonumber(item[field]) or 0) + delta
redis.call('LSET', key, index, cjson.encode(item))
return cjson.encode(item)
"#;

const PUSH_WITH_EXPIRE_LUA: &str = r#"
local key = KEYS[1]
local ttl = tonumber(ARGV[1])
redis.call('RPUSH', key, ARGV[2])
if ttl > 0 then
    redis.call('EXPIRE', key, ttl)
end
return redis.status_reply('OK')
"#;

/// Grava os quatro arquivos `.lua` em `lua_scripts_dir` caso ainda não
/// existam — puramente para inspeção/operação manual (`redis-cli --eval`);
/// o motor em si nunca lê esses arquivos de volta, os scripts ficam
/// embutidos via `Script::new` (ver módulo doc).
pub fn ensure_lua_scripts_on_disk(dir: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let scripts: [(&str, &str); 4] = [
        ("incr_field.lua", INCR_FIELD_LUA),
        ("hash_merge.lua", HASH_MERGE_LUA),
        ("list_item_update.lua", LIST_ITEM_UPDATE_LUA),
        ("push_with_expire.lua", PUSH_WITH_EXPIRE_LUA),
    ];
    for (name, body) in scripts {
        let path = Path::new(dir).join(name);
        if !path.exists() {
            std::fs::write(path, body)?;
        }
    }
    Ok(())
}

/// Escritor de telemetria de uma task: todas as chamadas são relativas ao
/// namespace `record_backup_index` (§4.6). Mantém os quatro scripts Lua
/// pré-compilados e uma `ConnectionManager` (reconecta sozinha em falha
/// transitória, dispensando pool manual).
pub struct TelemetryWriter {
    conn: ConnectionManager,
    record_backup_index: String,
    ttl: Duration,
    incr_field: Script,
    hash_merge: Script,
    list_item_update: Script,
    push_with_expire: Script,
}

impl TelemetryWriter {
    pub async fn connect(redis_url: &str, record_backup_index: String, ttl: Duration) -> Result<Self, StructuredError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, format!("redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, format!("redis connection manager: {e}")))?;
        Ok(Self {
            conn,
            record_backup_index,
            ttl,
            incr_field: Script::new(INCR_FIELD_LUA),
            hash_merge: Script::new(HASH_MERGE_LUA),
            list_item_update: Script::new(LIST_ITEM_UPDATE_LUA),
            push_with_expire: Script::new(PUSH_WITH_EXPIRE_LUA),
        })
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.record_backup_index, suffix)
    }

    fn ttl_secs(&self) -> i64 {
        self.ttl.as_secs() as i64
    }

    pub async fn write_task_info(&self, task_info: &Value) -> Result<(), StructuredError> {
        self.set_json("task_info", task_info).await
    }

    pub async fn write_record_info(&self, record_info: &Value) -> Result<(), StructuredError> {
        self.set_json("record_info", record_info).await
    }

    async fn set_json(&self, suffix: &str, value: &Value) -> Result<(), StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key(suffix);
        let payload = serde_json::to_string(value)
            .map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string()))?;
        redis::pipe()
            .set(&key, payload)
            .expire(&key, self.ttl_secs())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok(())
    }

    /// `{key}:summary_record:process` (§4.6): append-only, nível de task.
    pub async fn push_summary(&self, process: &ProcessObject) -> Result<(), StructuredError> {
        self.push_process("summary_record:process", process).await
    }

    async fn push_process(&self, suffix: &str, process: &ProcessObject) -> Result<(), StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key(suffix);
        let payload = serde_json::to_string(process)
            .map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string()))?;
        self.push_with_expire
            .key(&key)
            .arg(self.ttl_secs())
            .arg(payload)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok(())
    }

    /// Registra um novo item em `{key}:child_case_record:child_case_list` e
    /// retorna seu índice — usado pelos contadores
    /// `done_step_count`/`failed_step_count`/`skipped_step_count` via
    /// `update_child_case_counter`.
    pub async fn register_child_case(&self, child_case_id: &str, case_id: &str) -> Result<usize, StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key("child_case_record:child_case_list");
        let item = serde_json::json!({
            "child_case_id": child_case_id,
            "case_id": case_id,
            "done_step_count": 0,
            "failed_step_count": 0,
            "skipped_step_count": 0,
        });
        let payload = serde_json::to_string(&item).map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string()))?;
        self.push_with_expire
            .key(&key)
            .arg(self.ttl_secs())
            .arg(payload)
            .invoke_async::<()>(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        let len: i64 = conn.llen(&key).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok((len - 1).max(0) as usize)
    }

    pub async fn update_child_case_counter(&self, idx: usize, field: &str, delta: i64) -> Result<(), StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key("child_case_record:child_case_list");
        let _: String = self
            .list_item_update
            .key(&key)
            .arg(idx as i64)
            .arg(field)
            .arg(delta)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok(())
    }

    pub async fn push_child_case_process(&self, idx: usize, process: &ProcessObject) -> Result<(), StructuredError> {
        self.push_process(&format!("child_case_record:{idx}:process"), process).await
    }

    pub async fn set_child_case_status(&self, idx: usize, status: RecordStatus) -> Result<(), StructuredError> {
        self.set_status(&format!("child_case_record:{idx}:status"), status).await
    }

    async fn set_status(&self, suffix: &str, status: RecordStatus) -> Result<(), StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key(suffix);
        let payload = serde_json::to_string(&status).map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string()))?;
        redis::pipe()
            .set(&key, payload)
            .expire(&key, self.ttl_secs())
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok(())
    }

    /// `{key}:step_record:case:{cid}:child_case:{ccidx}:step:{sid}:process`.
    pub async fn push_step_process(&self, case_id: &str, child_case_idx: usize, step_id: &str, process: &ProcessObject) -> Result<(), StructuredError> {
        let suffix = format!("step_record:case:{case_id}:child_case:{child_case_idx}:step:{step_id}:process");
        self.push_process(&suffix, process).await
    }

    pub async fn set_step_status(&self, case_id: &str, child_case_idx: usize, step_id: &str, status: RecordStatus) -> Result<(), StructuredError> {
        let suffix = format!("step_record:case:{case_id}:child_case:{child_case_idx}:step:{step_id}:status");
        self.set_status(&suffix, status).await
    }

    /// Incrementa um campo de um hash sob expiração — usado por contadores
    /// avulsos fora de `child_case_list` (p.ex. agregados de task).
    pub async fn incr_field(&self, suffix: &str, field: &str, delta: i64) -> Result<i64, StructuredError> {
        let mut conn = self.conn.clone();
        let key = self.key(suffix);
        self.incr_field
            .key(&key)
            .arg(field)
            .arg(delta)
            .arg(self.ttl_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))
    }

    /// `interface_success_detail`/`interface_error_detail` (§4.6): grava os
    /// cinco campos (`request`/`response`/`timing`/`process`/`result`) como
    /// um hash mesclado atomicamente via `hash_merge`.
    pub async fn write_interface_detail(&self, success: bool, uuid: &str, fields: &[(&str, Value)]) -> Result<(), StructuredError> {
        let prefix = if success { "interface_success_detail" } else { "interface_error_detail" };
        let key = self.key(&format!("{prefix}:{uuid}"));
        let mut conn = self.conn.clone();
        let mut cmd = self.hash_merge.key(&key).arg(self.ttl_secs());
        let mut owned = Vec::with_capacity(fields.len() * 2);
        for (field, value) in fields {
            let payload = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            owned.push(((*field).to_string(), payload));
        }
        for (field, payload) in &owned {
            cmd = cmd.arg(field).arg(payload);
        }
        let _: String = cmd
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok(())
    }

    /// Varre todas as chaves `{record_backup_index}:*` e grava um snapshot
    /// JSON em `static/record_redis_backup/{index com ':' -> '_'}.json`
    /// (§7): `{chave: {"type", "value", "ttl"}}`.
    pub async fn export_backup(&self, backup_dir: &str) -> Result<PathBuf, StructuredError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", self.record_backup_index);
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;

        let mut snapshot: HashMap<String, Value> = HashMap::with_capacity(keys.len());
        for key in keys {
            let key_type: String = redis::cmd("TYPE")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
            let ttl: i64 = conn.ttl(&key).await.unwrap_or(-1);
            let value = match key_type.as_str() {
                "string" => {
                    let v: String = conn.get(&key).await.unwrap_or_default();
                    Value::String(v)
                }
                "list" => {
                    let v: Vec<String> = conn.lrange(&key, 0, -1).await.unwrap_or_default();
                    Value::Array(v.into_iter().map(Value::String).collect())
                }
                "hash" => {
                    let v: HashMap<String, String> = conn.hgetall(&key).await.unwrap_or_default();
                    serde_json::to_value(v).unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            snapshot.insert(
                key,
                serde_json::json!({ "type": key_type, "value": value, "ttl": ttl }),
            );
        }

        std::fs::create_dir_all(backup_dir)
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
        let file_name = self.record_backup_index.replace(':', "_");
        let path = Path::new(backup_dir).join(format!("{file_name}.json"));
        let body = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
        std::fs::write(&path, body).map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
        Ok(path)
    }

    /// Caminho inverso de [`Self::export_backup`]: repopula o Redis a partir
    /// do snapshot JSON, usado por `POST /restore_record` (§7).
    pub async fn restore_backup(&self, backup_dir: &str) -> Result<(), StructuredError> {
        let file_name = self.record_backup_index.replace(':', "_");
        let path = Path::new(backup_dir).join(format!("{file_name}.json"));
        let body = std::fs::read_to_string(&path).map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
        let snapshot: HashMap<String, Value> = serde_json::from_str(&body)
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;

        let mut conn = self.conn.clone();
        for (key, entry) in snapshot {
            let kind = entry.get("type").and_then(Value::as_str).unwrap_or("string").to_string();
            let ttl = entry.get("ttl").and_then(Value::as_i64).unwrap_or(-1);
            let value = entry.get("value").cloned().unwrap_or(Value::Null);
            match kind.as_str() {
                "string" => {
                    let v = value.as_str().unwrap_or_default().to_string();
                    let _: () = conn.set(&key, v).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
                }
                "list" => {
                    if let Some(items) = value.as_array() {
                        let strings: Vec<String> = items.iter().map(|v| v.as_str().unwrap_or_default().to_string()).collect();
                        if !strings.is_empty() {
                            let _: () = conn.rpush(&key, strings).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
                        }
                    }
                }
                "hash" => {
                    if let Some(map) = value.as_object() {
                        let pairs: Vec<(String, String)> = map.iter().map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string())).collect();
                        if !pairs.is_empty() {
                            let _: () = conn.hset_multiple(&key, &pairs).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, e.to_string()))?;
                        }
                    }
                }
                _ => {}
            }
            if ttl > 0 {
                let _: () = conn.expire(&key, ttl).await.unwrap_or(());
            }
        }
        Ok(())
    }

    /// Quantidade de itens retornada por página em [`Self::get_json_list_by_chunk`],
    /// espelhando o `page_size` fixo de `RecordController.get_json_list_by_chunk`.
    const LIST_CHUNK_SIZE: isize = 50;

    /// `GET {key}`, com fallback de restauração: se a chave não existir (dados
    /// expirados do Redis), chama [`Self::restore_backup`] a partir do
    /// snapshot em `backup_dir` e tenta novamente uma única vez — espelha o
    /// padrão "consulta, se ausente restaura do arquivo, se ainda ausente
    /// falha" de `RecordController.get_json_from_redis`.
    pub async fn get_json_from_redis(&self, suffix: &str, backup_dir: &str) -> Result<Value, StructuredError> {
        let key = self.key(suffix);
        if let Some(value) = self.try_get_json(&key).await? {
            return Ok(value);
        }
        self.restore_backup(backup_dir).await?;
        self.try_get_json(&key)
            .await?
            .ok_or_else(|| StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, "dados expirados, não foi possível restaurar"))
    }

    async fn try_get_json(&self, key: &str) -> Result<Option<Value>, StructuredError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        match raw {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| StructuredError::new(ErrorCode::SERIALIZATION_ERROR, e.to_string())),
            None => Ok(None),
        }
    }

    /// Pagina `LRANGE {key} start_index start_index+chunk-1`, decodificando
    /// cada elemento como JSON, e opcionalmente acompanha um `extra_key`
    /// (p.ex. o status do case) lido junto via `GET` — espelha
    /// `RecordController.get_json_list_by_chunk`, incluindo o fallback de
    /// restauração quando a lista não existe e `start_index == 0`.
    ///
    /// Retorna `(itens, próximo_index, extra)`; `próximo_index` é `None`
    /// quando a página retornada já alcançou o fim da lista.
    pub async fn get_json_list_by_chunk(
        &self,
        suffix: &str,
        start_index: isize,
        extra_suffix: Option<&str>,
        backup_dir: &str,
    ) -> Result<(Vec<Value>, Option<isize>, Option<Value>), StructuredError> {
        let key = self.key(suffix);
        let (raw, len) = self.read_list_page(&key, start_index).await?;

        let (raw, len) = if raw.is_empty() && start_index == 0 && len == 0 {
            self.restore_backup(backup_dir).await?;
            self.read_list_page(&key, start_index).await?
        } else {
            (raw, len)
        };

        if raw.is_empty() && start_index == 0 {
            return Err(StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, "dados expirados, não foi possível restaurar"));
        }

        let items: Vec<Value> = raw
            .into_iter()
            .map(|s| serde_json::from_str(&s).unwrap_or(Value::Null))
            .collect();

        let next_index = {
            let end = start_index + items.len() as isize;
            if end < len {
                Some(end)
            } else {
                None
            }
        };

        let extra = match extra_suffix {
            Some(suffix) => self.try_get_json(&self.key(suffix)).await?,
            None => None,
        };

        Ok((items, next_index, extra))
    }

    async fn read_list_page(&self, key: &str, start_index: isize) -> Result<(Vec<String>, isize), StructuredError> {
        let mut conn = self.conn.clone();
        let end = start_index + Self::LIST_CHUNK_SIZE - 1;
        let raw: Vec<String> = conn
            .lrange(key, start_index, end)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        let len: isize = conn
            .llen(key)
            .await
            .map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
        Ok((raw, len))
    }

    /// `MGET` em lote sobre um conjunto de sufixos relativos ao namespace da
    /// task, restaurando do backup (uma vez) se algum dos valores estiver
    /// ausente — espelha `RecordController.get_redis_details_batch`, usado
    /// pelo detalhamento combinado de vários child-cases/steps em uma única
    /// chamada de API em vez de uma requisição por nó.
    pub async fn get_redis_details_batch(
        &self,
        suffixes: &[String],
        backup_dir: &str,
    ) -> Result<HashMap<String, Value>, StructuredError> {
        if suffixes.is_empty() {
            return Ok(HashMap::new());
        }
        let keys: Vec<String> = suffixes.iter().map(|s| self.key(s)).collect();
        let mut raw = self.mget(&keys).await?;

        if raw.iter().any(Option::is_none) {
            self.restore_backup(backup_dir).await?;
            raw = self.mget(&keys).await?;
        }

        let mut out = HashMap::with_capacity(suffixes.len());
        for (suffix, value) in suffixes.iter().zip(raw.into_iter()) {
            let value = value.ok_or_else(|| {
                StructuredError::new(ErrorCode::TELEMETRY_BACKUP_FAILED, "dados expirados, não foi possível restaurar")
            })?;
            let parsed = serde_json::from_str(&value).unwrap_or(Value::Null);
            out.insert(suffix.clone(), parsed);
        }
        Ok(out)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StructuredError> {
        let mut conn = self.conn.clone();
        if keys.len() == 1 {
            let v: Option<String> = conn.get(&keys[0]).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))?;
            return Ok(vec![v]);
        }
        conn.mget(keys).await.map_err(|e| StructuredError::new(ErrorCode::TELEMETRY_WRITE_FAILED, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_object_serializes_type_tag_in_snake_case() {
        let obj = ProcessObject::new(RedisProcessType::InterfaceSuccessFinished, "ok", 0);
        let json = serde_json::to_value(&obj).unwrap();
        assert_eq!(json["type"], "interface_success_finished");
    }

    #[test]
    fn lua_scripts_are_written_once() {
        let dir = std::env::temp_dir().join(format!("lua_scripts_test_{}", std::process::id()));
        let dir_str = dir.to_str().unwrap().to_string();
        ensure_lua_scripts_on_disk(&dir_str).unwrap();
        assert!(dir.join("incr_field.lua").exists());
        assert!(dir.join("list_item_update.lua").exists());
        std::fs::remove_dir_all(&dir).ok();
    }
}
