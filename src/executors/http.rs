//! # Executor `interface`
//!
//! Implementa a chamada HTTP do step `interface` (§4.8): resolve o
//! `InterfaceDef` referenciado em `GlobalCache.interface_mapping`, resolve
//! templates em URL/headers/body via `template::TemplateEngine`, executa com
//! `reqwest`, e publica o resultado como `interface_last_node` no nó pai para
//! que steps `assertion` irmãos possam consumi-lo em modo `LAST_INTERFACE`.
//! A mecânica de requisição reaproveita o padrão do executor HTTP original do
//! motor: um `reqwest::Client` compartilhado e timeout configurável.

use std::future::Future;
use std::pin::Pin;
use std::time::Instant;

use reqwest::Method;
use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};
use crate::protocol::InterfaceStep;
use crate::tree::InterfaceLastResult;

use super::{CoreExecReturn, ExecutionContext, NodeExecutor, ProcessEvent};

const DEFAULT_TIMEOUT_MS: u64 = 30_000;

pub struct InterfaceExecutor {
    step: InterfaceStep,
}

impl InterfaceExecutor {
    pub fn new(step: InterfaceStep) -> Self {
        Self { step }
    }

    async fn resolve_base_url(&self, ctx: &ExecutionContext) -> Option<String> {
        let env = ctx.node.lock().await.env.clone();
        let cache = ctx.shared_state.global_cache.lock().await;
        cache.project_env_server_mapping.get(&self.step.project_id).and_then(|envs| envs.get(&env)).cloned()
    }

    /// Resolve templates recursivamente em um `Value` de body. Recursão
    /// assíncrona exige o future explicitamente boxado (o tipo do state
    /// machine não pode se referenciar a si mesmo).
    fn resolve_body<'a>(&'a self, spi_key: &'a str, value: &'a Value, ctx: &'a ExecutionContext) -> Pin<Box<dyn Future<Output = Value> + Send + 'a>> {
        Box::pin(async move {
            match value {
                Value::String(s) => {
                    let (resolved, _) = ctx.templates.resolve(spi_key, s, &ctx.variables).await;
                    Value::String(resolved)
                }
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_body(spi_key, item, ctx).await);
                    }
                    Value::Array(out)
                }
                Value::Object(map) => {
                    let mut out = serde_json::Map::with_capacity(map.len());
                    for (k, v) in map {
                        out.insert(k.clone(), self.resolve_body(spi_key, v, ctx).await);
                    }
                    Value::Object(out)
                }
                other => other.clone(),
            }
        })
    }

    async fn publish_on_parent(&self, ctx: &ExecutionContext, result: InterfaceLastResult) {
        let parent = ctx.node.lock().await.parent.clone();
        if let Some(parent) = parent.and_then(|w| w.upgrade()) {
            parent.lock().await.interface_last_node = Some(result);
        }
    }
}

#[async_trait::async_trait]
impl NodeExecutor for InterfaceExecutor {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let spi_key = ctx.node.lock().await.spi.key();

        let def = {
            let cache = ctx.shared_state.global_cache.lock().await;
            cache.interface_mapping.get(&self.step.interface_id).cloned().ok_or_else(|| {
                StructuredError::new(
                    ErrorCode::UNKNOWN_ACTION,
                    format!("interface '{}' não existe em interface_mapping", self.step.interface_id),
                )
                .with_step_id(self.step.common.id.clone())
            })?
        };

        let (resolved_url, _) = ctx.templates.resolve(&spi_key, &def.url, &ctx.variables).await;
        let url = if resolved_url.starts_with("http") {
            resolved_url
        } else {
            let base = self.resolve_base_url(ctx).await.unwrap_or_default();
            format!("{}{}", base.trim_end_matches('/'), resolved_url)
        };

        let method = Method::from_bytes(def.method.as_bytes())
            .map_err(|e| StructuredError::new(ErrorCode::INVALID_HTTP_METHOD, e.to_string()).with_step_id(self.step.common.id.clone()))?;

        let mut builder = ctx.http_client.request(method, &url);
        for (key, value) in &def.headers {
            let (resolved, _) = ctx.templates.resolve(&spi_key, value, &ctx.variables).await;
            builder = builder.header(key, resolved);
        }

        if !def.body.is_null() {
            let resolved_body = self.resolve_body(&spi_key, &def.body, ctx).await;
            builder = builder.json(&resolved_body);
        }

        let timeout_ms = def.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);
        builder = builder.timeout(std::time::Duration::from_millis(timeout_ms));

        let start = Instant::now();
        let response = builder.send().await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match response {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                let headers = resp
                    .headers()
                    .iter()
                    .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
                    .collect();
                let raw_body = resp.text().await.unwrap_or_default();
                let body: Value = serde_json::from_str(&raw_body).unwrap_or(Value::String(raw_body));
                InterfaceLastResult { status_code, headers, body, duration_ms }
            }
            Err(err) => {
                let code = if err.is_timeout() { ErrorCode::HTTP_TIMEOUT } else { ErrorCode::HTTP_CONNECTION_ERROR };
                return Err(StructuredError::new(code, err.to_string()).with_step_id(self.step.common.id.clone()));
            }
        };

        tracing::info!(
            interface_id = %self.step.interface_id,
            status = result.status_code,
            duration_ms = result.duration_ms,
            "interface respondeu"
        );

        let event = ProcessEvent::success(
            format!("interface '{}' respondeu {}", self.step.interface_id, result.status_code),
            serde_json::json!({ "status_code": result.status_code, "duration_ms": result.duration_ms }),
        );

        self.publish_on_parent(ctx, result).await;

        Ok(CoreExecReturn::single(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GlobalCache, InterfaceDef, StepCommon};
    use crate::template::TemplateEngine;
    use crate::tree::{DynamicNode, NodeEntity, StaticPathIndex};
    use crate::variables::{SharedVariableState, VariableHandle};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn make_ctx(global_cache: GlobalCache) -> (ExecutionContext, crate::tree::NodeRef) {
        let root = DynamicNode::new_root(StaticPathIndex::root("t1"), "p".into(), "e".into());
        let state = SharedVariableState::new(global_cache);
        let handle = VariableHandle::new(root.clone(), state.clone(), true);
        let ctx = ExecutionContext {
            node: root.clone(),
            variables: handle,
            templates: Arc::new(TemplateEngine::new()),
            shared_state: state,
            http_client: reqwest::Client::new(),
        };
        (ctx, root)
    }

    #[tokio::test]
    async fn unknown_interface_id_is_fatal() {
        let (ctx, _root) = make_ctx(GlobalCache::default());
        let step = InterfaceStep {
            common: StepCommon { id: "s1".into(), ..Default::default() },
            interface_id: "missing".into(),
            project_id: "proj".into(),
        };
        let executor = InterfaceExecutor::new(step);
        let err = executor.run(&ctx).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::UNKNOWN_ACTION);
    }

    #[tokio::test]
    async fn absolute_url_skips_base_url_resolution() {
        let mut global_cache = GlobalCache::default();
        global_cache.interface_mapping.insert(
            "iface1".to_string(),
            InterfaceDef {
                id: "iface1".into(),
                method: "GET".into(),
                url: "http://127.0.0.1:1/unreachable".into(),
                headers: HashMap::new(),
                body: Value::Null,
                timeout_ms: Some(50),
            },
        );
        let (ctx, _root) = make_ctx(global_cache);
        let step = InterfaceStep {
            common: StepCommon { id: "s1".into(), ..Default::default() },
            interface_id: "iface1".into(),
            project_id: "proj".into(),
        };
        let executor = InterfaceExecutor::new(step);
        // O host é propositalmente inalcançável; apenas checa que o erro é
        // classificado como execução HTTP, não um erro de resolução de interface.
        let err = executor.run(&ctx).await.unwrap_err();
        assert_ne!(err.code, ErrorCode::UNKNOWN_ACTION);
        let _ = NodeEntity::Task;
    }
}
