//! # Supervisão de Recursos do Processo
//!
//! No motor original (`task_process/monitor.py`), cada task roda num processo
//! filho separado; um monitor externo lê `psutil.Process(pid).memory_info().rss`
//! a cada segundo e envia `SIGUSR1` (memória) ou `SIGUSR2` (timeout) ao filho,
//! que instala handlers (`task_process/runner.py`) que levantam
//! `MemoryResourceLimitExceededError`/`TimeResourceLimitExceededError`.
//!
//! Este motor roda todas as tasks num único processo Tokio, então não há um
//! "filho" individual para sinalizar — a adaptação (ver DESIGN.md) é:
//!
//! 1. Ainda instalamos handlers reais de `SIGUSR1`/`SIGUSR2` via
//!    `tokio::signal::unix`, preservando compatibilidade com um supervisor
//!    externo que envie sinais de verdade a este processo.
//! 2. Como não há mais um monitor externo por task, um watchdog interno
//!    (`spawn_memory_watchdog`) lê a própria RSS em `/proc/self/status` e
//!    sinaliza-se (internamente, sem `kill()`) ao cruzar
//!    `MULTI_PROCESS_MEMORY_LIMIT`.
//! 3. Ambas as fontes alimentam o mesmo canal `watch`; qualquer task em
//!    andamento que observe uma mudança aborta com o `StructuredError` de
//!    recurso correspondente. `WAITING_MULTI_PROCESS_TIME` é reaproveitado
//!    como o prazo de graça antes de abortar — o equivalente de
//!    `process.join(timeout=...)` seguido de kill forçado no monitor original.

use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use crate::errors::{ErrorCode, StructuredError};
use crate::limits::EngineConfig;

/// Espelha `ResourceLimitExceededError`/subclasses de `global_object/signal.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSignal {
    Memory,
    Timeout,
}

impl ResourceSignal {
    pub fn into_error(self) -> StructuredError {
        match self {
            ResourceSignal::Memory => StructuredError::new(ErrorCode::RESOURCE_MEMORY_EXCEEDED, "limite de memória do processo excedido"),
            ResourceSignal::Timeout => StructuredError::new(ErrorCode::RESOURCE_TIMEOUT_EXCEEDED, "tempo máximo de execução excedido"),
        }
    }
}

pub type ResourceWatch = watch::Receiver<Option<ResourceSignal>>;

/// Canal de transmissão compartilhado: qualquer fonte (sinal real de SO ou
/// watchdog interno de memória) grava aqui; toda task em andamento observa o
/// mesmo receptor via [`ResourceWatch`].
#[derive(Clone)]
pub struct SignalBroadcaster {
    tx: Arc<watch::Sender<Option<ResourceSignal>>>,
}

impl SignalBroadcaster {
    pub fn new() -> (Self, ResourceWatch) {
        let (tx, rx) = watch::channel(None);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn trigger(&self, signal: ResourceSignal) {
        self.tx.send_replace(Some(signal));
    }

    pub fn clear(&self) {
        self.tx.send_replace(None);
    }
}

/// Instala os handlers de `SIGUSR1`/`SIGUSR2` reais (§6 "Process
/// supervision"): cada um roda como uma task própria que fica em loop
/// recebendo o sinal e publicando no broadcaster. Retorna os `JoinHandle`s
/// para que o chamador possa derrubá-los no shutdown, se desejar — em
/// operação normal eles vivem pelo tempo de vida do processo.
pub fn install_unix_signal_listeners(broadcaster: SignalBroadcaster) -> std::io::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut usr2 = signal(SignalKind::user_defined2())?;

    let b1 = broadcaster.clone();
    tokio::spawn(async move {
        loop {
            if usr1.recv().await.is_none() {
                break;
            }
            tracing::warn!("SIGUSR1 recebido: sinalizando limite de memória excedido");
            b1.trigger(ResourceSignal::Memory);
        }
    });

    let b2 = broadcaster.clone();
    tokio::spawn(async move {
        loop {
            if usr2.recv().await.is_none() {
                break;
            }
            tracing::warn!("SIGUSR2 recebido: sinalizando tempo máximo excedido");
            b2.trigger(ResourceSignal::Timeout);
        }
    });

    Ok(())
}

/// Lê `VmRSS` de `/proc/self/status` em KB, convertendo para MB. `Ok(None)`
/// em plataformas sem `/proc` (fora de Linux) — o chamador trata como "não
/// sabemos, não aborta por memória".
pub fn read_process_rss_mb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb / 1024.0);
        }
    }
    None
}

/// Lê `MemTotal`/`MemAvailable` de `/proc/meminfo` (KB), convertendo para MB.
/// Usado pelo endpoint `GET /ping` (§6) e não tem equivalente no monitor
/// original (que só observava a RSS de um processo específico via
/// `psutil`) — aqui é informação do host inteiro.
pub fn read_system_memory_mb() -> Option<(f64, f64)> {
    let info = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in info.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok().map(|kb| kb / 1024.0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.trim().trim_end_matches(" kB").trim().parse::<f64>().ok().map(|kb| kb / 1024.0);
        }
    }
    Some((total?, available?))
}

/// Watchdog interno de memória (substitui o polling de `psutil` do monitor
/// original, já que não há mais um processo-pai externo por task): a cada
/// segundo compara a RSS própria contra `MULTI_PROCESS_MEMORY_LIMIT` e
/// dispara [`ResourceSignal::Memory`] no broadcaster ao ultrapassar o limite.
pub fn spawn_memory_watchdog(config: Arc<EngineConfig>, broadcaster: SignalBroadcaster) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            if let Some(rss_mb) = read_process_rss_mb() {
                if rss_mb > config.multi_process_memory_limit as f64 {
                    tracing::warn!(rss_mb, limit_mb = config.multi_process_memory_limit, "limite de memória do processo excedido");
                    broadcaster.trigger(ResourceSignal::Memory);
                }
            }
        }
    });
}

/// Roda `fut` sob supervisão: corre até completar normalmente ou até o
/// broadcaster publicar um [`ResourceSignal`], o que vier primeiro. Note que
/// o sinal é observado por *todas* as tasks em andamento simultaneamente —
/// decisão registrada em DESIGN.md: um limite de memória do processo inteiro
/// não pode ser atribuído isoladamente a uma única task quando várias rodam
/// concorrentemente no mesmo processo.
pub async fn run_with_supervision<F, T>(mut watch: ResourceWatch, fut: F) -> Result<T, StructuredError>
where
    F: std::future::Future<Output = T>,
{
    tokio::pin!(fut);
    loop {
        tokio::select! {
            result = &mut fut => return Ok(result),
            changed = watch.changed() => {
                if changed.is_err() {
                    continue;
                }
                if let Some(signal) = *watch.borrow() {
                    return Err(signal.into_error());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_with_supervision_returns_ok_when_future_completes_first() {
        let (broadcaster, watch) = SignalBroadcaster::new();
        let _ = broadcaster;
        let result = run_with_supervision(watch, async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn run_with_supervision_aborts_on_signal() {
        let (broadcaster, watch) = SignalBroadcaster::new();
        broadcaster.trigger(ResourceSignal::Memory);
        let result = run_with_supervision(watch, std::future::pending::<()>()).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code, ErrorCode::RESOURCE_MEMORY_EXCEEDED);
    }

    #[test]
    fn read_process_rss_reports_something_on_linux() {
        assert!(read_process_rss_mb().unwrap_or(1.0) > 0.0);
    }
}
