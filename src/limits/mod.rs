//! # Configuração de Ambiente do Motor
//!
//! Superfície de ambiente do motor de execução (§6), carregada uma vez no
//! startup e compartilhada (imutável) por toda a execução: concorrência,
//! conexão Redis, geração de loop, limites de recurso do processo
//! supervisionado.

use std::time::Duration;

/// Configuração do motor, carregada de variáveis de ambiente no startup.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub local_redis_connection: String,
    pub max_connections: u32,
    pub max_concurrency: usize,
    pub max_generate_length: usize,
    /// MB.
    pub multi_process_memory_limit: u64,
    pub waiting_multi_process_time: Duration,
    pub redis_task_record_timeout: Duration,
    pub lua_scripts_dir: String,
    pub asynctest_rcp_router: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            local_redis_connection: "redis://127.0.0.1:6379".to_string(),
            max_connections: 100,
            max_concurrency: 16,
            max_generate_length: 1000,
            multi_process_memory_limit: 2048,
            waiting_multi_process_time: Duration::from_secs(30),
            redis_task_record_timeout: Duration::from_secs(86400),
            lua_scripts_dir: "static/lua_scripts".to_string(),
            asynctest_rcp_router: String::new(),
        }
    }
}

impl EngineConfig {
    /// Carrega a configuração a partir das variáveis de ambiente de §6;
    /// qualquer variável ausente ou não-parseável mantém o padrão.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("LOCAL_REDIS_CONNECTION") {
            config.local_redis_connection = val;
        }
        if let Some(n) = parse_env("MAX_CONNECTIONS") {
            config.max_connections = n;
        }
        if let Some(n) = parse_env("MAX_CONCURRENCY") {
            config.max_concurrency = n;
        }
        if let Some(n) = parse_env("MAX_GENERATE_LENGTH") {
            config.max_generate_length = n;
        }
        if let Some(n) = parse_env("MULTI_PROCESS_MEMORY_LIMIT") {
            config.multi_process_memory_limit = n;
        }
        if let Some(secs) = parse_env("WAITING_MULTI_PROCESS_TIME") {
            config.waiting_multi_process_time = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env("REDIS_TASK_RECORD_TIMEOUT") {
            config.redis_task_record_timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("LUA_SCRIPTS_DIR") {
            config.lua_scripts_dir = val;
        }
        if let Ok(val) = std::env::var("ASYNCTEST_RCP_ROUTER") {
            config.asynctest_rcp_router = val;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrency, 16);
        assert_eq!(config.max_generate_length, 1000);
    }

    #[test]
    fn test_engine_config_from_env_overrides() {
        std::env::set_var("MAX_CONCURRENCY", "4");
        std::env::set_var("MAX_GENERATE_LENGTH", "25");
        let config = EngineConfig::from_env();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.max_generate_length, 25);
        std::env::remove_var("MAX_CONCURRENCY");
        std::env::remove_var("MAX_GENERATE_LENGTH");
    }
}
