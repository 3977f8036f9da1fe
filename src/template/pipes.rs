//! Biblioteca fechada de pipes (§4.4): hashing, encoding, casing, slicing,
//! padding, concatenação, comprimento. Nome de pipe desconhecido resolve
//! para o literal `"null"` em vez de erro — a especificação trata o
//! conjunto como fechado e tolerante.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

const NULL_LITERAL: &str = "null";

fn hex_digest<D: Digest>(mut hasher: D, input: &str) -> String {
    hasher.update(input.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Aplica um pipe pelo nome a um valor de entrada e seus argumentos
/// (já resolvidos de tokens aninhados pelo parser de template).
pub fn apply(name: &str, input: &str, args: &[String]) -> String {
    match name {
        "md5" => hex_digest(md5::Md5::new(), input),
        "sha1" => hex_digest(Sha1::new(), input),
        "sha224" => hex_digest(Sha224::new(), input),
        "sha256" => hex_digest(Sha256::new(), input),
        "sha384" => hex_digest(Sha384::new(), input),
        "sha512" => hex_digest(Sha512::new(), input),
        "base64" => STANDARD.encode(input.as_bytes()),
        "unbase64" => STANDARD
            .decode(input.as_bytes())
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_else(|| NULL_LITERAL.to_string()),
        "encodeUriComponent" => urlencoding::encode(input).into_owned(),
        "decodeUriComponent" => urlencoding::decode(input)
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| NULL_LITERAL.to_string()),
        "upper" => input.to_uppercase(),
        "lower" => input.to_lowercase(),
        "trim" => input.trim().to_string(),
        "len" => input.chars().count().to_string(),
        "concat" => format!("{input}{}", args.first().cloned().unwrap_or_default()),
        "slice" => slice(input, args),
        "padStart" => pad(input, args, true),
        "padEnd" => pad(input, args, false),
        _ => NULL_LITERAL.to_string(),
    }
}

fn slice(input: &str, args: &[String]) -> String {
    let chars: Vec<char> = input.chars().collect();
    let len = chars.len() as i64;
    let norm = |raw: i64| -> usize {
        let v = if raw < 0 { (len + raw).max(0) } else { raw.min(len) };
        v as usize
    };
    let start = args.first().and_then(|s| s.parse::<i64>().ok()).map(norm).unwrap_or(0);
    let end = args.get(1).and_then(|s| s.parse::<i64>().ok()).map(norm).unwrap_or(chars.len());
    if start >= end {
        return String::new();
    }
    chars[start..end].iter().collect()
}

fn pad(input: &str, args: &[String], at_start: bool) -> String {
    let target_len = args.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(0);
    let fill = args.get(1).cloned().unwrap_or_else(|| " ".to_string());
    let fill = if fill.is_empty() { " ".to_string() } else { fill };
    let mut out = input.to_string();
    let fill_chars: Vec<char> = fill.chars().collect();
    let mut i = 0;
    while out.chars().count() < target_len {
        let c = fill_chars[i % fill_chars.len()];
        if at_start {
            out.insert(0, c);
        } else {
            out.push(c);
        }
        i += 1;
    }
    out
}

/// Tenta inverter um pipe quando a especificação declara um inverso
/// explícito (lei de round-trip em §8): `base64`/`unbase64`,
/// `encodeUriComponent`/`decodeUriComponent`, `upper`/`lower` em ASCII.
#[cfg(test)]
pub fn inverse_name(name: &str) -> Option<&'static str> {
    match name {
        "base64" => Some("unbase64"),
        "unbase64" => Some("base64"),
        "encodeUriComponent" => Some("decodeUriComponent"),
        "decodeUriComponent" => Some("encodeUriComponent"),
        "upper" => Some("lower"),
        "lower" => Some("upper"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_roundtrips() {
        let encoded = apply("base64", "hello world", &[]);
        let decoded = apply(inverse_name("base64").unwrap(), &encoded, &[]);
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn uri_component_roundtrips() {
        let encoded = apply("encodeUriComponent", "a b&c", &[]);
        let decoded = apply(inverse_name("encodeUriComponent").unwrap(), &encoded, &[]);
        assert_eq!(decoded, "a b&c");
    }

    #[test]
    fn casing_roundtrips_ascii() {
        let encoded = apply("upper", "abcXYZ", &[]);
        let decoded = apply("lower", &encoded, &[]);
        assert_eq!(decoded, "abcxyz");
    }

    #[test]
    fn unknown_pipe_is_null_literal() {
        assert_eq!(apply("nope", "x", &[]), "null");
    }

    #[test]
    fn slice_supports_negative_indices() {
        assert_eq!(slice("abcdef", &["-3".to_string(), "-1".to_string()]), "de");
    }
}
