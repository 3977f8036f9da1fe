//! # Superfície de Capacidade do Sandbox de Scripts
//!
//! Implementa §5.1: a interface que um `script`/`load_loop_script`/condição
//! `if` veria caso um interpretador real estivesse conectado. Modela variável
//! handles, um handle de telemetria (`print`/`warning`), acessores de
//! request/response/database e os helpers de mock/pipe, mais um raise-error
//! explícito — sem embutir uma linguagem de scripting de verdade, pois isso
//! está fora de escopo.
//!
//! `NullScriptContext` é a implementação padrão: aplica a denylist declarada
//! em `FORBIDDEN_MODULES` apenas como dado (não há interpretador para de fato
//! impor a restrição), e todo acessor de request/response/database retorna
//! `None` já que não há execução real por trás.

use serde_json::Value;

use crate::errors::{ErrorCode, StructuredError};
use crate::template::{mocks, pipes};
use crate::tree::InterfaceLastResult;

/// Módulos que um script não pode importar, espelhando a denylist do motor
/// original (`core/script/sandbox.py`). Puramente declarativa aqui: nenhum
/// interpretador está conectado para de fato recusar um `import`.
pub const FORBIDDEN_MODULES: &[&str] = &["os", "sys", "subprocess", "socket", "importlib", "ctypes"];

/// Superfície de capacidade exposta a um corpo de script (§5.1, §9).
pub trait ScriptContext: Send + Sync {
    /// Lê uma variável pelo nome (temp → env → global, via `variables::VariableHandle`).
    fn get_var(&self, key: &str) -> Option<Value>;

    /// Escreve uma variável; sem efeito em contextos somente-leitura.
    fn set_var(&self, key: &str, value: Value);

    /// Emite uma mensagem informativa para a telemetria.
    fn print(&self, message: &str);

    /// Emite um aviso para a telemetria (não falha o step).
    fn warning(&self, message: &str);

    /// Último resultado de interface visível ao script, se algum.
    fn response(&self) -> Option<&InterfaceLastResult>;

    /// Acessor de banco de dados; `None` quando nenhuma conexão está disponível
    /// neste escopo (execução de banco de dados real está fora de escopo).
    fn database(&self, _database_id: &str) -> Option<()> {
        None
    }

    /// Aplica um pipe da biblioteca fechada de pipes (§4.4) sem envolver o
    /// motor de templates completo.
    fn pipe(&self, name: &str, input: &str, args: &[String]) -> String {
        pipes::apply(name, input, args)
    }

    /// Gera um valor mock da biblioteca fechada de mocks (§4.4).
    fn mock(&self, func: &str, args: &[String]) -> String {
        mocks::generate(func, args)
    }

    /// Interrompe o step com uma falha explícita, carregando o `ProcessObject`
    /// que o motor de estratégia de erro e a telemetria vão classificar.
    fn raise(&self, message: impl Into<String>) -> StructuredError
    where
        Self: Sized,
    {
        StructuredError::new(ErrorCode::INTERNAL_ERROR, message.into())
    }
}

/// Implementação padrão: nenhum request/response/database real por trás,
/// leituras/escritas de variável são no-ops silenciosos. Usada onde um step
/// `script`/`if`/`error` ainda não tem um `ScriptContext` concreto ligado.
#[derive(Default)]
pub struct NullScriptContext;

impl ScriptContext for NullScriptContext {
    fn get_var(&self, _key: &str) -> Option<Value> {
        None
    }

    fn set_var(&self, _key: &str, _value: Value) {}

    fn print(&self, _message: &str) {}

    fn warning(&self, _message: &str) {}

    fn response(&self) -> Option<&InterfaceLastResult> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_context_pipe_and_mock_use_closed_libraries() {
        let ctx = NullScriptContext;
        assert_eq!(ctx.pipe("upper", "abc", &[]), "ABC");
        assert_eq!(ctx.mock("unknown_func", &[]), "null");
    }

    #[test]
    fn forbidden_modules_denylist_is_declarative() {
        assert!(FORBIDDEN_MODULES.contains(&"os"));
        assert!(FORBIDDEN_MODULES.contains(&"subprocess"));
    }
}
