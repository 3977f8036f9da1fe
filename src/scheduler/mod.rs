//! # Escalonador (Runner)
//!
//! Implementa §4.1: executa uma floresta de runners com paralelismo limitado
//! e um ciclo de vida uniforme (`before`/`run`/`after`/`error`/`skipped`). O
//! contrato é deliberadamente pobre — um runner concreto (um `interface`, um
//! `group`, um `child_step_case`, ...) guarda seu próprio estado interno entre
//! `before` e `run`; o escalonador só precisa do nó dinâmico associado para a
//! checagem de `skipped` e para decidir a ordem de execução dos filhos.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::instrument;

use crate::tree::{find_ancestor, NodeEntity, NodeRef, NodeStatus};

/// O que `before()` decidiu: prosseguir para `run`, ou que o nó já nasceu
/// `skipped` (p.ex. um filho virtual com `check == "none"`, §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeforeOutcome {
    Ready,
    Skip,
}

/// Contrato uniforme de um runner (§4.1). `before`/`run`/`after`/`error` usam
/// `anyhow::Result` porque apenas o escalonador decide o que fazer com uma
/// falha — nunca propaga para o chamador do escalonador; toda sinalização de
/// erro passa pela mutação de status de `error_strategy::handle_failure`.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn before(&self) -> anyhow::Result<BeforeOutcome>;
    async fn run(&self) -> anyhow::Result<()>;
    async fn after(&self);
    async fn error(&self, err: anyhow::Error);
    async fn skipped(&self);
    fn node(&self) -> &NodeRef;
}

/// Executa um runner até o fim de seu ciclo de vida: `before` → checagem de
/// skip → (`run` sob o semáforo) → `after`/`error`, ou `skipped` quando
/// `before` sinaliza skip ou quando algum ancestral já terminou num estado
/// que bloqueia descendentes (§4.1 "Skipped check").
#[instrument(skip(runner, semaphore), fields(spi = %runner.node_key()))]
pub async fn execute(runner: &dyn Runner, semaphore: &Semaphore) {
    let outcome = match runner.before().await {
        Ok(outcome) => outcome,
        Err(err) => {
            runner.error(err).await;
            return;
        }
    };

    let should_skip = match outcome {
        BeforeOutcome::Skip => true,
        BeforeOutcome::Ready => check_and_change_status(runner.node()).await,
    };

    if should_skip {
        runner.skipped().await;
        return;
    }

    let result = {
        let _permit = semaphore.acquire().await.expect("semáforo de concorrência fechado");
        runner.run().await
    };

    match result {
        Ok(()) => runner.after().await,
        Err(err) => runner.error(err).await,
    }
}

/// Extensão de conveniência só para o span de tracing acima poder exibir a
/// chave do SPI sem bloquear (`node()` retorna a referência, o `.key()` em si
/// não pode ser lido de forma síncrona porque o nó vive atrás de um Mutex
/// assíncrono — então usamos o endereço do Arc como identificador estável).
trait NodeKey {
    fn node_key(&self) -> String;
}

impl NodeKey for dyn Runner + '_ {
    fn node_key(&self) -> String {
        format!("{:p}", Arc::as_ptr(self.node()))
    }
}

/// `run_sequentially`: FIFO estrito, cada runner aguardado antes do próximo
/// começar (§4.1, §5 "Sequential groups guarantee happens-before").
pub async fn run_sequentially(queue: Vec<Arc<dyn Runner>>, semaphore: Arc<Semaphore>) {
    for runner in queue {
        execute(runner.as_ref(), &semaphore).await;
    }
}

/// `run_concurrently`: drena a fila lançando todos os runners de uma vez; o
/// semáforo (capacidade `MAX_CONCURRENCY`) só limita o corpo de `run`, então
/// `before` de todos os runners roda mesmo sob saturação.
pub async fn run_concurrently(queue: Vec<Arc<dyn Runner>>, semaphore: Arc<Semaphore>) {
    let mut join_set = JoinSet::new();
    for runner in queue {
        let semaphore = semaphore.clone();
        join_set.spawn(async move {
            execute(runner.as_ref(), &semaphore).await;
        });
    }
    while join_set.join_next().await.is_some() {}
}

/// `check_and_change_status` (§4.1, §8 invariante 3): se o próprio nó já está
/// num estado terminal que bloqueia descendentes, se o pai imediato está
/// (o caso de um `if` que resolveu `Conditional`: seus filhos estáticos são
/// sempre construídos, mas nenhum deles deve rodar), ou se o ancestral
/// `task`, `case` ou `child_case` mais próximo está, muda o status do nó
/// para `Skipped` e sinaliza que o runner deve tomar o caminho `skipped`.
pub async fn check_and_change_status(node: &NodeRef) -> bool {
    let already_blocked = node.lock().await.status.blocks_descendants();
    if already_blocked {
        return true;
    }

    let parent_blocked = match node.lock().await.parent.clone().and_then(|w| w.upgrade()) {
        Some(parent) => parent.lock().await.status.blocks_descendants(),
        None => false,
    };
    let task_blocked = ancestor_blocks(node, |n| matches!(n.entity, NodeEntity::Task)).await;
    let case_blocked = ancestor_blocks(node, |n| n.entity.is_case()).await;
    let child_case_blocked = ancestor_blocks(node, |n| n.entity.is_child_case()).await;

    let blocked = parent_blocked || task_blocked || case_blocked || child_case_blocked;
    if blocked {
        node.lock().await.status = NodeStatus::Skipped;
    }
    blocked
}

async fn ancestor_blocks<F>(node: &NodeRef, pred: F) -> bool
where
    F: Fn(&crate::tree::DynamicNode) -> bool,
{
    match find_ancestor(node, pred).await {
        Some(ancestor) => ancestor.lock().await.status.blocks_descendants(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ErrorStrategy;
    use crate::tree::{DynamicNode, StaticPathIndex};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct RecordingRunner {
        node: NodeRef,
        before_outcome: BeforeOutcome,
        calls: Arc<StdMutex<Vec<&'static str>>>,
        fail_run: bool,
    }

    #[async_trait]
    impl Runner for RecordingRunner {
        async fn before(&self) -> anyhow::Result<BeforeOutcome> {
            self.calls.lock().unwrap().push("before");
            Ok(self.before_outcome)
        }

        async fn run(&self) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("run");
            if self.fail_run {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn after(&self) {
            self.calls.lock().unwrap().push("after");
        }

        async fn error(&self, _err: anyhow::Error) {
            self.calls.lock().unwrap().push("error");
        }

        async fn skipped(&self) {
            self.calls.lock().unwrap().push("skipped");
        }

        fn node(&self) -> &NodeRef {
            &self.node
        }
    }

    fn new_leaf_node() -> NodeRef {
        DynamicNode::new_root(StaticPathIndex::root("t1"), "p".into(), "e".into())
    }

    #[tokio::test]
    async fn successful_run_calls_before_run_after() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            node: new_leaf_node(),
            before_outcome: BeforeOutcome::Ready,
            calls: calls.clone(),
            fail_run: false,
        });
        let semaphore = Arc::new(Semaphore::new(4));
        execute(runner.as_ref(), &semaphore).await;
        assert_eq!(*calls.lock().unwrap(), vec!["before", "run", "after"]);
    }

    #[tokio::test]
    async fn failing_run_calls_error_not_after() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            node: new_leaf_node(),
            before_outcome: BeforeOutcome::Ready,
            calls: calls.clone(),
            fail_run: true,
        });
        let semaphore = Arc::new(Semaphore::new(4));
        execute(runner.as_ref(), &semaphore).await;
        assert_eq!(*calls.lock().unwrap(), vec!["before", "run", "error"]);
    }

    #[tokio::test]
    async fn before_skip_outcome_takes_skipped_path() {
        let calls = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            node: new_leaf_node(),
            before_outcome: BeforeOutcome::Skip,
            calls: calls.clone(),
            fail_run: false,
        });
        let semaphore = Arc::new(Semaphore::new(4));
        execute(runner.as_ref(), &semaphore).await;
        assert_eq!(*calls.lock().unwrap(), vec!["before", "skipped"]);
    }

    #[tokio::test]
    async fn blocked_ancestor_forces_skipped_path() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());
        let case_spi = root_spi.for_main_case("c1");
        let case = DynamicNode::new_child(
            &root,
            case_spi.clone(),
            NodeEntity::MainCase { case_id: "c1".into(), is_root: true },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;
        case.lock().await.status = NodeStatus::Error;

        let step = DynamicNode::new_child(
            &case,
            case_spi.for_step("s1"),
            NodeEntity::Step { case_id: "c1".into(), step_id: "s1".into(), step_type: "script" },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        let calls = Arc::new(StdMutex::new(Vec::new()));
        let runner: Arc<dyn Runner> = Arc::new(RecordingRunner {
            node: step.clone(),
            before_outcome: BeforeOutcome::Ready,
            calls: calls.clone(),
            fail_run: false,
        });
        let semaphore = Arc::new(Semaphore::new(4));
        execute(runner.as_ref(), &semaphore).await;
        assert_eq!(*calls.lock().unwrap(), vec!["before", "skipped"]);
        assert_eq!(step.lock().await.status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn concurrent_queue_never_exceeds_semaphore_capacity() {
        struct GatedRunner {
            node: NodeRef,
            active: Arc<AtomicUsize>,
            peak: Arc<AtomicUsize>,
        }

        #[async_trait]
        impl Runner for GatedRunner {
            async fn before(&self) -> anyhow::Result<BeforeOutcome> {
                Ok(BeforeOutcome::Ready)
            }

            async fn run(&self) -> anyhow::Result<()> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }

            async fn after(&self) {}
            async fn error(&self, _err: anyhow::Error) {}
            async fn skipped(&self) {}
            fn node(&self) -> &NodeRef {
                &self.node
            }
        }

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let queue: Vec<Arc<dyn Runner>> = (0..8)
            .map(|_| Arc::new(GatedRunner { node: new_leaf_node(), active: active.clone(), peak: peak.clone() }) as Arc<dyn Runner>)
            .collect();

        run_concurrently(queue, Arc::new(Semaphore::new(2))).await;
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
