//! # Executor `assertion`
//!
//! Implementa §4.8 modo `LAST_INTERFACE`: consome o `interface_last_node`
//! publicado pelo executor `interface` no nó pai e compara um campo do
//! body/header/status-code contra um valor esperado através de um operador
//! fechado (`eq`/`neq`/`exist`/`no_exist`/`gt`/`gte`/`lt`/`lte`/`contains`/
//! `not_contains`/`regex`/`inset`/`un_inset`), espelhando a matriz de
//! operadores do `AssertionCore` do motor original
//! (`core/payload/node_executor/assertion.py`). O modo `script` é um stub de
//! capacidade: sem um interpretador conectado (§5.1, fora de escopo), apenas
//! emite um aviso e relata sucesso.

use regex::Regex;
use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};
use crate::extractors::navigate_json_multi;
use crate::protocol::{AssertMode, AssertionStep};
use crate::tree::InterfaceLastResult;

use super::{CoreExecReturn, ExecutionContext, NodeExecutor, ProcessEvent};

pub struct AssertionExecutor {
    step: AssertionStep,
}

impl AssertionExecutor {
    pub fn new(step: AssertionStep) -> Self {
        Self { step }
    }

    async fn last_interface(&self, ctx: &ExecutionContext) -> Option<InterfaceLastResult> {
        let parent = ctx.node.lock().await.parent.clone();
        let parent = parent.and_then(|w| w.upgrade())?;
        parent.lock().await.interface_last_node.clone()
    }

    async fn resolve_str(&self, ctx: &ExecutionContext, spi_key: &str, value: &str) -> String {
        ctx.templates.resolve(spi_key, value, &ctx.variables).await.0
    }

    /// Resolve templates em um `Value` esperado quando ele é uma string;
    /// outros tipos passam direto (o motor original só faz substituição em
    /// strings, `self.replace(value)`).
    async fn resolve_value(&self, ctx: &ExecutionContext, spi_key: &str, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.resolve_str(ctx, spi_key, s).await),
            other => other.clone(),
        }
    }

    async fn assert_body(&self, ctx: &ExecutionContext, spi_key: &str, body: &Value) -> Result<(bool, String), StructuredError> {
        let pattern = self.step.interface_body_pattern.as_deref().unwrap_or("eq");
        let expected = match &self.step.interface_body_value {
            Some(v) => self.resolve_value(ctx, spi_key, v).await,
            None => Value::Null,
        };

        if self.step.interface_body_range.as_deref() == Some("pattern") {
            let jsonpath = match &self.step.interface_body_jsonpath {
                Some(p) => self.resolve_str(ctx, spi_key, p).await,
                None => {
                    return Err(StructuredError::new(ErrorCode::ASSERTION_EXCEPTION, "interface_body_jsonpath ausente para interface_body_range=pattern")
                        .with_step_id(self.step.common.id.clone()))
                }
            };
            match navigate_json_multi(body, &jsonpath, false) {
                Ok(found) => {
                    if pattern == "no_exist" {
                        Ok((false, format!("jsonpath '{jsonpath}' encontrou valor, esperava ausência")))
                    } else if pattern == "exist" {
                        Ok((true, format!("jsonpath '{jsonpath}' encontrado")))
                    } else {
                        Ok((evaluate(pattern, Some(&found), &expected), format!("jsonpath '{jsonpath}' = {found}")))
                    }
                }
                Err(_) if pattern == "no_exist" => Ok((true, format!("jsonpath '{jsonpath}' ausente, como esperado"))),
                Err(e) => Err(StructuredError::new(ErrorCode::ASSERTION_PATH_NOT_FOUND, format!("jsonpath '{jsonpath}' não encontrado: {e}"))
                    .with_step_id(self.step.common.id.clone())),
            }
        } else {
            // "raw"/"all": compara o body inteiro (serializado) contra o valor esperado.
            Ok((evaluate(pattern, Some(body), &expected), "comparação de body inteiro".to_string()))
        }
    }

    async fn assert_header(&self, ctx: &ExecutionContext, spi_key: &str, headers: &std::collections::HashMap<String, String>) -> Result<(bool, String), StructuredError> {
        let pattern = self.step.interface_header_pattern.as_deref().unwrap_or("eq");
        let key = match &self.step.interface_header_key {
            Some(k) => self.resolve_str(ctx, spi_key, k).await,
            None => {
                return Err(StructuredError::new(ErrorCode::ASSERTION_EXCEPTION, "interface_header_key ausente")
                    .with_step_id(self.step.common.id.clone()))
            }
        };
        let expected = match &self.step.interface_header_value {
            Some(v) => self.resolve_value(ctx, spi_key, v).await,
            None => Value::Null,
        };
        let found = headers.get(&key).map(|v| Value::String(v.clone()));

        let result = match pattern {
            "exist" => found.is_some(),
            "no_exist" => found.is_none(),
            _ => evaluate(pattern, found.as_ref(), &expected),
        };
        Ok((result, format!("header '{key}' = {:?}", found)))
    }

    async fn assert_status_code(&self, ctx: &ExecutionContext, spi_key: &str, status_code: u16) -> Result<(bool, String), StructuredError> {
        let pattern = self.step.interface_code_pattern.as_deref().unwrap_or("eq");
        let expected = match &self.step.interface_code_value {
            Some(v) => self.resolve_value(ctx, spi_key, v).await,
            None => Value::Null,
        };
        let compare_key = Value::Number(status_code.into());
        Ok((evaluate(pattern, Some(&compare_key), &expected), format!("status_code = {status_code}")))
    }
}

#[async_trait::async_trait]
impl NodeExecutor for AssertionExecutor {
    async fn run(&self, ctx: &ExecutionContext) -> Result<CoreExecReturn, StructuredError> {
        let spi_key = ctx.node.lock().await.spi.key();

        let (passed, desc, failure_code) = match self.step.assert_mode {
            AssertMode::LastInterface => {
                let last = self.last_interface(ctx).await.ok_or_else(|| {
                    StructuredError::new(ErrorCode::ASSERTION_NO_PRIOR_INTERFACE, "nenhuma interface anterior no mesmo grupo")
                        .with_step_id(self.step.common.id.clone())
                })?;

                match self.step.interface_range.as_deref() {
                    Some("body") => {
                        let (passed, desc) = self.assert_body(ctx, &spi_key, &last.body).await?;
                        (passed, desc, ErrorCode::ASSERTION_JSON_BODY)
                    }
                    Some("header") => {
                        let (passed, desc) = self.assert_header(ctx, &spi_key, &last.headers).await?;
                        (passed, desc, ErrorCode::ASSERTION_HEADER)
                    }
                    Some("status_code") => {
                        let (passed, desc) = self.assert_status_code(ctx, &spi_key, last.status_code).await?;
                        (passed, desc, ErrorCode::ASSERTION_STATUS_CODE)
                    }
                    other => {
                        return Err(StructuredError::new(
                            ErrorCode::ASSERTION_EXCEPTION,
                            format!("interface_range desconhecido: {other:?}"),
                        )
                        .with_step_id(self.step.common.id.clone()))
                    }
                }
            }
            AssertMode::Script => {
                // Sem interpretador conectado (§5.1): relata sucesso com aviso.
                (true, "modo script sem sandbox conectado, assumindo sucesso".to_string(), ErrorCode::ASSERTION_EXCEPTION)
            }
        };

        if passed {
            let message = self.step.success_desc.clone().unwrap_or_else(|| format!("assertion passou: {desc}"));
            Ok(CoreExecReturn::single(ProcessEvent::success(message, serde_json::json!({ "desc": desc }))))
        } else {
            let message = self.step.failed_desc.clone().unwrap_or_else(|| format!("assertion falhou: {desc}"));
            Err(StructuredError::new(failure_code, message).with_step_id(self.step.common.id.clone()))
        }
    }
}

/// Representação textual de um `Value` para comparação, espelhando o `str()`
/// do Python: strings passam cruas, os demais tipos usam sua forma JSON.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

/// Matriz de operadores fechada (§4.8), compartilhada por `assertion` e,
/// futuramente, por `if`/`error` via `executors::control`.
pub(crate) fn evaluate(pattern: &str, compare_key: Option<&Value>, compare_value: &Value) -> bool {
    match pattern {
        "exist" => compare_key.is_some(),
        "no_exist" => compare_key.is_none(),
        _ => {
            let Some(key) = compare_key else { return false };
            match pattern {
                "eq" => stringify(key) == stringify(compare_value),
                "neq" => stringify(key) != stringify(compare_value),
                "gt" => matches!((as_f64(key), as_f64(compare_value)), (Some(a), Some(b)) if a > b),
                "gte" => matches!((as_f64(key), as_f64(compare_value)), (Some(a), Some(b)) if a >= b),
                "lt" => matches!((as_f64(key), as_f64(compare_value)), (Some(a), Some(b)) if a < b),
                "lte" => matches!((as_f64(key), as_f64(compare_value)), (Some(a), Some(b)) if a <= b),
                "contains" => stringify(key).contains(&stringify(compare_value)),
                "not_contains" => !stringify(key).contains(&stringify(compare_value)),
                "regex" => Regex::new(&stringify(compare_value)).map(|re| re.is_match(&stringify(key))).unwrap_or(false),
                "inset" => split_collection(compare_value).iter().any(|item| item == &stringify(key)),
                "un_inset" => !split_collection(compare_value).iter().any(|item| item == &stringify(key)),
                _ => false,
            }
        }
    }
}

fn split_collection(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => s.split(',').map(|item| item.trim().to_string()).collect(),
        Value::Array(items) => items.iter().map(stringify).collect(),
        other => vec![stringify(other)],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn eq_compares_stringified_values() {
        assert!(evaluate("eq", Some(&json!(200)), &json!(200)));
        assert!(evaluate("eq", Some(&json!("200")), &json!(200)));
        assert!(!evaluate("eq", Some(&json!(404)), &json!(200)));
    }

    #[test]
    fn gt_requires_numeric_values() {
        assert!(evaluate("gt", Some(&json!(5)), &json!(3)));
        assert!(!evaluate("gt", Some(&json!("abc")), &json!(3)));
    }

    #[test]
    fn contains_checks_substring() {
        assert!(evaluate("contains", Some(&json!("hello world")), &json!("world")));
        assert!(!evaluate("contains", Some(&json!("hello world")), &json!("bye")));
    }

    #[test]
    fn inset_splits_comma_separated_string() {
        assert!(evaluate("inset", Some(&json!("b")), &json!("a, b, c")));
        assert!(!evaluate("un_inset", Some(&json!("b")), &json!("a, b, c")));
    }

    #[test]
    fn exist_and_no_exist_ignore_compare_value() {
        assert!(evaluate("exist", Some(&json!("x")), &Value::Null));
        assert!(!evaluate("exist", None, &Value::Null));
        assert!(evaluate("no_exist", None, &Value::Null));
    }

    #[test]
    fn regex_matches_against_pattern() {
        assert!(evaluate("regex", Some(&json!("abc123")), &json!(r"\d+")));
        assert!(!evaluate("regex", Some(&json!("abc")), &json!(r"\d+")));
    }
}
