//! # Motor de Templates
//!
//! Resolve `{{var|pipe(arg1,arg2)|pipe2}}`, `{{'literal'|pipe}}` e
//! `{% mock 'func',arg1,arg2 |pipe(..) %}` (§4.4). O modo de resolução é
//! escolhido automaticamente por template: qualquer uso de `mock` liga
//! `CHANGE_EVERY_TIME` (um valor novo a cada acesso); na ausência de mocks o
//! template é `JUST_ONCE` (resolvido uma vez por nó e depois reaproveitado).
//!
//! Pipe e mock são bibliotecas fechadas (ver [`pipes`] e [`mocks`]); um nome
//! desconhecido em qualquer posição resolve para o literal `"null"` em vez de
//! falhar a execução — mantém o comportamento tolerante do motor original.

pub mod mocks;
pub mod pipes;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::variables::{VariableEvent, VariableHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionMode {
    JustOnce,
    ChangeEveryTime,
}

#[derive(Debug, Clone)]
enum PipeArg {
    Literal(String),
    /// Um pipe aninhado resolvido antes de alimentar o pipe externo, p.ex.
    /// `concat({{other}})`.
    Nested(Box<Segment>),
}

#[derive(Debug, Clone)]
struct PipeCall {
    name: String,
    args: Vec<PipeArg>,
}

#[derive(Debug, Clone)]
enum Source {
    Var(String),
    StringLiteral(String),
    Mock { func: String, args: Vec<PipeArg> },
}

#[derive(Debug, Clone)]
struct Segment {
    source: Source,
    pipes: Vec<PipeCall>,
}

#[derive(Debug, Clone)]
enum Token {
    Text(String),
    Expr(Segment),
}

/// Cache de resolução para templates `JUST_ONCE`: chave é
/// `(spi_key, template)`, reaproveitada enquanto o nó dono da execução vive.
#[derive(Default)]
pub struct TemplateEngine {
    cache: Mutex<HashMap<(String, String), String>>,
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve todas as expressões `{{..}}`/`{%..%}` em `template`, mesclando
    /// eventos de variável emitidos pela leitura/escrita subjacente.
    pub async fn resolve(&self, spi_key: &str, template: &str, handle: &VariableHandle) -> (String, Vec<VariableEvent>) {
        let tokens = tokenize(template);
        let mode = resolution_mode(&tokens);

        if mode == ResolutionMode::JustOnce {
            let key = (spi_key.to_string(), template.to_string());
            if let Some(cached) = self.cache.lock().await.get(&key).cloned() {
                return (cached, Vec::new());
            }
        }

        let mut out = String::new();
        let mut events = Vec::new();
        for token in &tokens {
            match token {
                Token::Text(t) => out.push_str(t),
                Token::Expr(seg) => {
                    let (value, mut seg_events) = resolve_segment(seg, handle).await;
                    events.append(&mut seg_events);
                    out.push_str(&value);
                }
            }
        }

        if mode == ResolutionMode::JustOnce {
            let key = (spi_key.to_string(), template.to_string());
            self.cache.lock().await.insert(key, out.clone());
        }
        (out, events)
    }
}

fn resolution_mode(tokens: &[Token]) -> ResolutionMode {
    fn segment_has_mock(seg: &Segment) -> bool {
        matches!(seg.source, Source::Mock { .. })
    }
    let has_mock = tokens.iter().any(|t| matches!(t, Token::Expr(seg) if segment_has_mock(seg)));
    if has_mock {
        ResolutionMode::ChangeEveryTime
    } else {
        ResolutionMode::JustOnce
    }
}

async fn resolve_segment(seg: &Segment, handle: &VariableHandle) -> (String, Vec<VariableEvent>) {
    let mut events = Vec::new();
    let mut value = match &seg.source {
        Source::StringLiteral(lit) => lit.clone(),
        Source::Var(name) => {
            let (v, event) = handle.get(name).await;
            events.push(event);
            v.map(value_to_string).unwrap_or_else(|| "null".to_string())
        }
        Source::Mock { func, args } => {
            let mut resolved_args = Vec::with_capacity(args.len());
            for arg in args {
                let (v, mut arg_events) = resolve_pipe_arg(arg, handle).await;
                events.append(&mut arg_events);
                resolved_args.push(v);
            }
            mocks::generate(func, &resolved_args)
        }
    };
    for pipe in &seg.pipes {
        let mut resolved_args = Vec::with_capacity(pipe.args.len());
        for arg in &pipe.args {
            let (v, mut arg_events) = resolve_pipe_arg(arg, handle).await;
            events.append(&mut arg_events);
            resolved_args.push(v);
        }
        value = pipes::apply(&pipe.name, &value, &resolved_args);
    }
    (value, events)
}

async fn resolve_pipe_arg(arg: &PipeArg, handle: &VariableHandle) -> (String, Vec<VariableEvent>) {
    match arg {
        PipeArg::Literal(s) => (s.clone(), Vec::new()),
        PipeArg::Nested(seg) => Box::pin(resolve_segment(seg, handle)).await,
    }
}

fn value_to_string(v: Value) -> String {
    match v {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

/// Divide o template em texto puro e expressões `{{..}}`/`{%..%}`.
fn tokenize(template: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut rest = template;
    loop {
        let double = rest.find("{{");
        let tag = rest.find("{%");
        let next = match (double, tag) {
            (Some(d), Some(t)) => Some(d.min(t)),
            (Some(d), None) => Some(d),
            (None, Some(t)) => Some(t),
            (None, None) => None,
        };
        match next {
            None => {
                if !rest.is_empty() {
                    tokens.push(Token::Text(rest.to_string()));
                }
                break;
            }
            Some(pos) => {
                if pos > 0 {
                    tokens.push(Token::Text(rest[..pos].to_string()));
                }
                let is_var = rest[pos..].starts_with("{{");
                let close = if is_var { "}}" } else { "%}" };
                let body_start = pos + 2;
                match rest[body_start..].find(close) {
                    Some(rel_end) => {
                        let body = &rest[body_start..body_start + rel_end];
                        if let Some(seg) = parse_segment(body.trim(), is_var) {
                            tokens.push(Token::Expr(seg));
                        }
                        rest = &rest[body_start + rel_end + 2..];
                    }
                    None => {
                        tokens.push(Token::Text(rest[pos..].to_string()));
                        break;
                    }
                }
            }
        }
    }
    tokens
}

/// Analisa o corpo de uma expressão já sem as chaves externas: uma cadeia de
/// segmentos separados por `|`. O primeiro segmento define a fonte (`var`,
/// `'literal'`, ou `mock 'func',a,b`); os seguintes são chamadas de pipe.
fn parse_segment(body: &str, is_var_tag: bool) -> Option<Segment> {
    let parts: Vec<&str> = split_top_level(body, '|');
    let (head, pipe_parts) = parts.split_first()?;
    let head = head.trim();

    let source = if !is_var_tag || head.starts_with("mock") {
        let rest = head.strip_prefix("mock").unwrap_or(head).trim();
        let args = split_top_level(rest, ',');
        let mut iter = args.into_iter();
        let func = iter.next().map(|s| unquote(s.trim())).unwrap_or_default();
        let args = iter.map(|s| PipeArg::Literal(unquote(s.trim()))).collect();
        Source::Mock { func, args }
    } else if head.starts_with('\'') || head.starts_with('"') {
        Source::StringLiteral(unquote(head))
    } else {
        Source::Var(head.to_string())
    };

    let pipes = pipe_parts
        .iter()
        .filter_map(|p| parse_pipe_call(p.trim()))
        .collect();

    Some(Segment { source, pipes })
}

fn parse_pipe_call(text: &str) -> Option<PipeCall> {
    if text.is_empty() {
        return None;
    }
    match text.find('(') {
        Some(open) if text.ends_with(')') => {
            let name = text[..open].trim().to_string();
            let inner = &text[open + 1..text.len() - 1];
            let args = split_top_level(inner, ',')
                .into_iter()
                .filter(|s| !s.trim().is_empty())
                .map(|s| parse_pipe_arg(s.trim()))
                .collect();
            Some(PipeCall { name, args })
        }
        _ => Some(PipeCall { name: text.to_string(), args: Vec::new() }),
    }
}

fn parse_pipe_arg(text: &str) -> PipeArg {
    if text.starts_with("{{") && text.ends_with("}}") {
        if let Some(seg) = parse_segment(text[2..text.len() - 2].trim(), true) {
            return PipeArg::Nested(Box::new(seg));
        }
    }
    PipeArg::Literal(unquote(text))
}

fn unquote(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() >= 2 {
        let bytes = trimmed.as_bytes();
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'\'' || first == b'"') && first == last {
            return trimmed[1..trimmed.len() - 1].to_string();
        }
    }
    trimmed.to_string()
}

/// Divide `text` por `sep`, respeitando aninhamento de `(`/`)` e aspas, para
/// que `concat({{a|upper}}, 'x,y')` não se parta no `,` interno.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0usize;
    let bytes: Vec<(usize, char)> = text.char_indices().collect();
    for &(idx, c) in &bytes {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth -= 1,
                _ if c == sep && depth == 0 => {
                    parts.push(&text[start..idx]);
                    start = idx + c.len_utf8();
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::GlobalCache;
    use crate::tree::{DynamicNode, NodeEntity, StaticPathIndex};
    use crate::variables::SharedVariableState;
    use serde_json::json;

    async fn leaf_handle(can_set: bool) -> (VariableHandle, std::sync::Arc<SharedVariableState>) {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi, "p".into(), "e".into());
        let state = SharedVariableState::new(GlobalCache::default());
        (VariableHandle::new(root, state.clone(), can_set), state)
    }

    #[tokio::test]
    async fn literal_and_pipe_resolve() {
        let (handle, _) = leaf_handle(true).await;
        let engine = TemplateEngine::new();
        let (out, _) = engine.resolve("k1", "{{'abc'|upper}}", &handle).await;
        assert_eq!(out, "ABC");
    }

    #[tokio::test]
    async fn variable_lookup_resolves_through_global() {
        let (handle, state) = leaf_handle(true).await;
        state
            .global_cache
            .lock()
            .await
            .origin_global_variable_mapping
            .insert("name".into(), json!("Ada"));
        let engine = TemplateEngine::new();
        let (out, events) = engine.resolve("k1", "hello {{name}}!", &handle).await;
        assert_eq!(out, "hello Ada!");
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn unknown_variable_is_null_literal() {
        let (handle, _) = leaf_handle(true).await;
        let engine = TemplateEngine::new();
        let (out, _) = engine.resolve("k1", "{{missing}}", &handle).await;
        assert_eq!(out, "null");
    }

    #[tokio::test]
    async fn mock_template_is_change_every_time() {
        let (handle, _) = leaf_handle(true).await;
        let engine = TemplateEngine::new();
        let (first, _) = engine.resolve("k1", "{% mock 'uuid' %}", &handle).await;
        let (second, _) = engine.resolve("k1", "{% mock 'uuid' %}", &handle).await;
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn just_once_template_is_cached() {
        let (handle, state) = leaf_handle(true).await;
        state
            .global_cache
            .lock()
            .await
            .origin_global_variable_mapping
            .insert("x".into(), json!(1));
        let engine = TemplateEngine::new();
        let (first, _) = engine.resolve("k1", "{{x}}", &handle).await;
        state.global_cache.lock().await.origin_global_variable_mapping.insert("x".into(), json!(2));
        let (second, _) = engine.resolve("k1", "{{x}}", &handle).await;
        assert_eq!(first, "1");
        assert_eq!(second, "1");
    }

    #[test]
    fn pipe_chain_parses_multiple_args() {
        let tokens = tokenize("{{v|slice(-3,-1)|upper}}");
        assert_eq!(tokens.len(), 1);
    }
}
