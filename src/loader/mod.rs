//! # Carregamento de Submissão a partir de Arquivo
//!
//! `POST /execute` recebe a submissão diretamente como corpo JSON da
//! requisição (extraída pelo `axum::Json` em `api`); este módulo cobre o
//! caso de carregá-la a partir de um arquivo em disco — útil para rodar uma
//! submissão gravada localmente sem um cliente HTTP (ferramentas de
//! desenvolvimento, fixtures de teste).

use std::path::Path;

use anyhow::{Context, Result};

use crate::protocol::Submission;

pub fn load_submission_from_file<P: AsRef<Path>>(path: P) -> Result<Submission> {
    let content = std::fs::read_to_string(path).context("falha ao ler arquivo de submissão")?;
    let submission = serde_json::from_str(&content).context("falha ao parsear JSON da submissão")?;
    Ok(submission)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_json() {
        let dir = std::env::temp_dir().join(format!("loader_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_submission_from_file(&path).is_err());
        std::fs::remove_dir_all(&dir).ok();
    }
}
