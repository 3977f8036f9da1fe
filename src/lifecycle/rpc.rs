//! # RPC de Ciclo de Vida (anúncio de task ao orquestrador)
//!
//! Espelha `core/signals/django_sync.py`/`core/signals/rpc_router.py`:
//! duas chamadas de saída, `start_task` e `end_task`, ambas um `POST` para
//! `ASYNCTEST_RCP_ROUTER` com `?rcp_type=start_task|end_task` e corpo
//! `{task_id, record_id}`. O cabeçalho `X-Internal: from_nginx` marca a
//! chamada como tráfego interno para o lado do orquestrador. A resposta de
//! `end_task` carrega, em `data`, a lista de nomes de record ainda vivos —
//! usada por [`super::gc_stale_backups`] para podar backups obsoletos.
//!
//! No motor original essas chamadas só saem quando a task roda em modo
//! remoto (`exec_type == ExecType.REMOTE`); como o protocolo desta submissão
//! não carrega essa distinção, a regra adotada (ver DESIGN.md) é: o anúncio
//! só é enviado quando `ASYNCTEST_RCP_ROUTER` está configurado — uma rota
//! vazia é o equivalente local/sem-orquestrador.

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RcpType {
    StartTask,
    EndTask,
}

impl RcpType {
    fn as_str(self) -> &'static str {
        match self {
            RcpType::StartTask => "start_task",
            RcpType::EndTask => "end_task",
        }
    }
}

#[derive(Serialize)]
struct RcpBody<'a> {
    task_id: &'a str,
    record_id: &'a str,
}

async fn announce(client: &Client, router: &str, kind: RcpType, task_id: &str, record_id: &str) -> Result<Value, StructuredError> {
    if router.is_empty() {
        return Ok(Value::Null);
    }

    let response = client
        .post(router)
        .query(&[("rcp_type", kind.as_str())])
        .header("X-Internal", "from_nginx")
        .json(&RcpBody { task_id, record_id })
        .send()
        .await
        .map_err(|e| StructuredError::new(ErrorCode::HTTP_CONNECTION_ERROR, format!("rpc {}: {e}", kind.as_str())))?;

    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        return Err(StructuredError::new(
            ErrorCode::HTTP_ERROR_STATUS,
            format!("rpc {} retornou status {status}", kind.as_str()),
        ));
    }
    Ok(body.get("data").cloned().unwrap_or(Value::Null))
}

/// Anuncia o início da task ao orquestrador. Sem efeito (retorno `Ok`) se
/// nenhuma rota estiver configurada.
pub async fn start_task(client: &Client, router: &str, task_id: &str, record_id: &str) -> Result<(), StructuredError> {
    announce(client, router, RcpType::StartTask, task_id, record_id).await?;
    Ok(())
}

/// Anuncia o fim da task; retorna a lista de nomes de record ainda vivos
/// reportada pelo orquestrador (vazia se nenhuma rota estiver configurada
/// ou se a resposta não trouxer um array).
pub async fn end_task(client: &Client, router: &str, task_id: &str, record_id: &str) -> Result<Vec<String>, StructuredError> {
    let data = announce(client, router, RcpType::EndTask, task_id, record_id).await?;
    Ok(data
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default())
}
