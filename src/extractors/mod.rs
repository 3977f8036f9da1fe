//! # Navegação JSON para Asserções e Extrações
//!
//! Resolve um path simplificado estilo JSONPath (`$.data.token`,
//! `$.users[0].id`, `$.items[*]`) contra um `serde_json::Value`. Usado por
//! `executors::assertion` (§4.8 `AssertMode::LastInterface`) para comparar
//! campos do body/headers da última resposta de interface contra um valor
//! esperado, sem depender de uma crate externa de JSONPath.

use anyhow::{anyhow, Result};
use serde_json::Value;

/// Navega em um Value JSON usando um path simplificado.
///
/// Suporta:
/// - `$.field` → Acesso direto a campo
/// - `$.parent.child` → Acesso aninhado
/// - `$.array[0]` → Acesso a índice de array
/// - `$.array[*]` → Todos os elementos (retorna array)
#[allow(dead_code)]
pub(crate) fn navigate_json(value: &Value, path: &str) -> Result<Value> {
    navigate_json_multi(value, path, false)
}

/// Navega em um Value JSON com suporte a múltiplos valores.
///
/// Se `all_values` for true e houver múltiplos resultados (ex: wildcard),
/// retorna todos como array. Caso contrário, retorna o primeiro.
pub(crate) fn navigate_json_multi(value: &Value, path: &str, all_values: bool) -> Result<Value> {
    // Remove o prefixo "$." se presente
    let clean_path = path.strip_prefix("$.").unwrap_or(path);

    if clean_path.is_empty() {
        return Ok(value.clone());
    }

    let mut current = value.clone();

    for segment in split_path(clean_path) {
        current = navigate_segment(&current, &segment, all_values)?;
    }

    Ok(current)
}

/// Divide um path em segmentos, respeitando índices de array.
///
/// Exemplo: "users[0].name" → ["users", "[0]", "name"]
fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();

    let mut chars = path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(current.clone());
                    current.clear();
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(current.clone());
                    current.clear();
                }
                current.push('[');
                // Lê até o ]
                while let Some(&next) = chars.peek() {
                    current.push(chars.next().unwrap());
                    if next == ']' {
                        break;
                    }
                }
                segments.push(current.clone());
                current.clear();
            }
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Navega um único segmento do path.
fn navigate_segment(value: &Value, segment: &str, _all_values: bool) -> Result<Value> {
    // Índice de array: [0], [1], [*]
    if segment.starts_with('[') && segment.ends_with(']') {
        let index_str = &segment[1..segment.len() - 1];

        // Wildcard: retorna todos os elementos
        if index_str == "*" {
            return match value {
                Value::Array(arr) => Ok(Value::Array(arr.clone())),
                _ => Err(anyhow!("Esperado array para [*], encontrado: {}", value)),
            };
        }

        // Índice numérico
        let index: usize = index_str
            .parse()
            .map_err(|_| anyhow!("Índice de array inválido: '{}'", index_str))?;

        return match value {
            Value::Array(arr) => arr.get(index).cloned().ok_or_else(|| {
                anyhow!(
                    "Índice {} fora dos limites (array tem {} elementos)",
                    index,
                    arr.len()
                )
            }),
            _ => Err(anyhow!(
                "Esperado array para [{}], encontrado: {}",
                index,
                value
            )),
        };
    }

    // Campo de objeto
    match value {
        Value::Object(map) => map
            .get(segment)
            .cloned()
            .ok_or_else(|| anyhow!("Campo '{}' não encontrado no objeto", segment)),
        _ => Err(anyhow!(
            "Esperado objeto para acessar '{}', encontrado: {}",
            segment,
            value
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_navigate_simple_field() {
        let json = json!({"name": "João"});
        let result = navigate_json(&json, "$.name").unwrap();
        assert_eq!(result, json!("João"));
    }

    #[test]
    fn test_navigate_nested_field() {
        let json = json!({"data": {"token": "abc123"}});
        let result = navigate_json(&json, "$.data.token").unwrap();
        assert_eq!(result, json!("abc123"));
    }

    #[test]
    fn test_navigate_array_index() {
        let json = json!({"users": [{"id": 1}, {"id": 2}]});
        let result = navigate_json(&json, "$.users[0].id").unwrap();
        assert_eq!(result, json!(1));
    }

    #[test]
    fn test_navigate_array_wildcard() {
        let json = json!({"items": [1, 2, 3]});
        let result = navigate_json(&json, "$.items[*]").unwrap();
        assert_eq!(result, json!([1, 2, 3]));
    }

    #[test]
    fn test_navigate_without_dollar() {
        let json = json!({"data": {"value": 42}});
        let result = navigate_json(&json, "data.value").unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_navigate_missing_field() {
        let json = json!({"name": "test"});
        let result = navigate_json(&json, "$.missing");
        assert!(result.is_err());
    }

    #[test]
    fn test_navigate_multi_without_all_values_returns_first() {
        let json = json!({"items": [1, 2, 3]});
        let result = navigate_json_multi(&json, "$.items[0]", false).unwrap();
        assert_eq!(result, json!(1));
    }
}
