//! Biblioteca fechada de geradores `mock` (§4.4): booleanos, numéricos,
//! strings, datas/horários com offset, campos de identidade, nomes/textos
//! localizados, cores e strings restringidas por regex. Nome de mock
//! desconhecido resolve para o literal `"null"`, igual aos pipes.

use chrono::{Duration, Utc};
use rand::Rng;
use uuid::Uuid;

const NULL_LITERAL: &str = "null";

const FIRST_NAMES: &[&str] = &["Ana", "Bruno", "Carla", "Diego", "Elisa", "Felipe", "Giulia", "Hugo"];
const LAST_NAMES: &[&str] = &["Silva", "Souza", "Costa", "Pereira", "Rodrigues", "Almeida"];
const WORDS: &[&str] = &[
    "lorem", "ipsum", "dolor", "sit", "amet", "consectetur", "adipiscing", "elit", "sed", "do",
];
const COLORS: &[&str] = &["#e63946", "#f1faee", "#a8dadc", "#457b9d", "#1d3557", "#ffb703"];
const TLDS: &[&str] = &["com", "dev", "io", "net"];

/// Invoca um gerador `mock` pelo nome com os argumentos textuais já
/// resolvidos pelo parser de template.
pub fn generate(func: &str, args: &[String]) -> String {
    let mut rng = rand::thread_rng();
    match func {
        "boolean" => rng.gen_bool(0.5).to_string(),
        "integer" => {
            let min = args.first().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
            let max = args.get(1).and_then(|s| s.parse::<i64>().ok()).unwrap_or(100);
            let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
            rng.gen_range(lo..=hi).to_string()
        }
        "decimal" => {
            let min = args.first().and_then(|s| s.parse::<f64>().ok()).unwrap_or(0.0);
            let max = args.get(1).and_then(|s| s.parse::<f64>().ok()).unwrap_or(1.0);
            let precision = args.get(2).and_then(|s| s.parse::<usize>().ok()).unwrap_or(2);
            let value = rng.gen_range(min..=max);
            format!("{value:.precision$}")
        }
        "string" => {
            let len = args.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(8);
            (0..len)
                .map(|_| (b'a' + rng.gen_range(0..26)) as char)
                .collect()
        }
        "uuid" => Uuid::new_v4().to_string(),
        "date" => offset_timestamp(&mut rng, args).format("%Y-%m-%d").to_string(),
        "datetime" => offset_timestamp(&mut rng, args).format("%Y-%m-%dT%H:%M:%S").to_string(),
        "timestamp" => offset_timestamp(&mut rng, args).timestamp().to_string(),
        "id" => rng.gen_range(100_000..1_000_000).to_string(),
        "phone" => format!("+55119{:08}", rng.gen_range(0..100_000_000)),
        "email" => format!(
            "{}.{}{}@example.{}",
            pick(&mut rng, FIRST_NAMES).to_lowercase(),
            pick(&mut rng, LAST_NAMES).to_lowercase(),
            rng.gen_range(0..1000),
            pick(&mut rng, TLDS)
        ),
        "ip" => format!(
            "{}.{}.{}.{}",
            rng.gen_range(1..255),
            rng.gen_range(0..255),
            rng.gen_range(0..255),
            rng.gen_range(1..255)
        ),
        "url" => format!("https://{}.example.{}/{}", pick(&mut rng, WORDS), pick(&mut rng, TLDS), rng.gen_range(0..10_000)),
        "name" => format!("{} {}", pick(&mut rng, FIRST_NAMES), pick(&mut rng, LAST_NAMES)),
        "text" => {
            let count = args.first().and_then(|s| s.parse::<usize>().ok()).unwrap_or(5);
            (0..count).map(|_| pick(&mut rng, WORDS)).collect::<Vec<_>>().join(" ")
        }
        "color" => pick(&mut rng, COLORS).to_string(),
        "regex" => regex_sample(args.first().map(String::as_str).unwrap_or(".*")),
        _ => NULL_LITERAL.to_string(),
    }
}

fn pick<'a, R: Rng>(rng: &mut R, options: &'a [&'a str]) -> &'a str {
    options[rng.gen_range(0..options.len())]
}

/// `date`/`datetime`/`timestamp` aceitam um offset em segundos opcional
/// (primeiro argumento), relativo a "agora".
fn offset_timestamp<R: Rng>(_rng: &mut R, args: &[String]) -> chrono::DateTime<Utc> {
    let offset_secs = args.first().and_then(|s| s.parse::<i64>().ok()).unwrap_or(0);
    Utc::now() + Duration::seconds(offset_secs)
}

/// Gerador muito restrito de strings por regex: cobre apenas classes
/// literais e `\d`/`\w` com quantificador `{n}`, suficiente para os padrões
/// de identidade usados pelo produto (CPF/CEP/etc). Qualquer outro padrão
/// cai de volta para uma string alfanumérica de 8 caracteres.
fn regex_sample(pattern: &str) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::new();
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let (class, consumed) = match chars[i] {
            '\\' if i + 1 < chars.len() => (chars[i + 1], 2),
            c => (c, 1),
        };
        i += consumed;
        let mut repeat = 1usize;
        if i < chars.len() && chars[i] == '{' {
            if let Some(end) = chars[i..].iter().position(|c| *c == '}') {
                let spec: String = chars[i + 1..i + end].iter().collect();
                repeat = spec.parse().unwrap_or(1);
                i += end + 1;
            }
        }
        for _ in 0..repeat {
            out.push(match class {
                'd' => (b'0' + rng.gen_range(0..10)) as char,
                'w' => (b'a' + rng.gen_range(0..26)) as char,
                literal => literal,
            });
        }
    }
    if out.is_empty() {
        (0..8).map(|_| (b'a' + rng.gen_range(0..26)) as char).collect()
    } else {
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_mock_is_null_literal() {
        assert_eq!(generate("nope", &[]), "null");
    }

    #[test]
    fn integer_respects_bounds() {
        for _ in 0..50 {
            let value: i64 = generate("integer", &["1".to_string(), "5".to_string()]).parse().unwrap();
            assert!((1..=5).contains(&value));
        }
    }

    #[test]
    fn regex_digit_quantifier() {
        let sample = regex_sample(r"\d{5}");
        assert_eq!(sample.len(), 5);
        assert!(sample.chars().all(|c| c.is_ascii_digit()));
    }
}
