//! # Núcleo do Executor de Steps (Construção e Despacho da Árvore Dinâmica)
//!
//! Implementa §4.2 e a linha "Step executor core" de §2: o ponto em que
//! `tree`, `scheduler`, `error_strategy`, `loop_expansion`, `variables`,
//! `template`, `executors` e `telemetry` deixam de ser módulos isolados e
//! viram uma árvore que de fato roda. Um [`StepRunner`] é o `Runner` concreto
//! que o `scheduler` executa; sua variante de [`RunnerKind`] decide o que
//! `before`/`run`/`after` fazem para cada categoria de nó (`main_case`,
//! instanciação de caso, step, instanciação de multitasker).
//!
//! ## Onde o trabalho acontece
//!
//! Ao contrário de uma leitura literal de §4.2 (construir a fila de filhos em
//! `before`, rodá-la depois do `run` do node executor), este módulo faz as
//! duas coisas dentro de `run()`: primeiro despacha o node executor do
//! próprio step (sempre — mesmo `group`/`case`/`multitasker` têm um
//! `NodeExecutor`, ainda que no-op), depois, só se o resultado permitir
//! (`if` falho nunca constrói filhos), constrói e roda a fila de filhos.
//! Isso elimina qualquer necessidade de guardar estado mutável entre
//! `before` e `run` — um filho virtual que nasce `skipped` (`check ==
//! "none"`) tem seu status física e definitivamente marcado no momento em
//! que o nó é criado, então a checagem de auto-bloqueio do escalonador
//! (`check_and_change_status`) já resolve o desvio sem nenhum mecanismo
//! adicional. Ver DESIGN.md para a decisão registrada.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};

use crate::errors::{ErrorCategory, ErrorCode, StructuredError};
use crate::executors::{self, ProcessEvent, ProcessEventKind};
use crate::limits::EngineConfig;
use crate::loop_expansion::{self, DriveSpec, LoopScriptDriver, LoopScriptOutcome, VirtualChildSpec};
use crate::protocol::{Case, ChildCase, LoopStrategy, Step, StepMapping, VarMap};
use crate::scheduler::{self, BeforeOutcome, Runner};
use crate::telemetry::record::{ProcessObject, RecordStatus, RedisProcessType, TelemetryWriter};
use crate::template::TemplateEngine;
use crate::tree::{find_ancestor, DynamicMapping, DynamicNode, NodeEntity, NodeRef, NodeResult, NodeStatus, StaticPathIndex};
use crate::variables::{resolve_case_env, SharedVariableState, VariableHandle};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Ponte para `load_loop_script` quando nenhum sandbox de verdade está
/// conectado (§9, espelhando o stub de `executors::control::ScriptExecutor`):
/// todo script de drive resolve para uma única linha vazia.
pub struct NullLoopScriptDriver;

#[async_trait]
impl LoopScriptDriver for NullLoopScriptDriver {
    async fn run_loop_script(&self, _script: &str) -> Result<LoopScriptOutcome, StructuredError> {
        Ok(LoopScriptOutcome::Scalar)
    }
}

/// Dependências compartilhadas por toda a árvore de uma execução (§4.2, §4.7
/// "shared HTTP session"). Barato de clonar — tudo atrás de `Arc` — então
/// cada `StepRunner` carrega o seu próprio.
pub struct RunContext {
    pub config: Arc<EngineConfig>,
    pub semaphore: Arc<Semaphore>,
    pub shared_state: Arc<SharedVariableState>,
    pub templates: Arc<TemplateEngine>,
    pub http_client: reqwest::Client,
    pub step_mapping: Arc<StepMapping>,
    pub cases: Arc<HashMap<String, Case>>,
    pub script_driver: Arc<dyn LoopScriptDriver>,
    pub dynamic_mapping: Arc<DynamicMapping>,
    pub telemetry: Option<Arc<TelemetryWriter>>,
    /// `idx` de `register_child_case` por chave de SPI da fronteira
    /// (`ChildCase`/`ChildStepCase`/`ChildMultitasker`) que o registrou —
    /// consultado pelos steps descendentes na hora de emitir telemetria.
    child_case_indices: AsyncMutex<HashMap<String, usize>>,
}

impl RunContext {
    pub fn new(
        config: Arc<EngineConfig>,
        shared_state: Arc<SharedVariableState>,
        templates: Arc<TemplateEngine>,
        http_client: reqwest::Client,
        step_mapping: Arc<StepMapping>,
        cases: Arc<HashMap<String, Case>>,
        dynamic_mapping: Arc<DynamicMapping>,
        telemetry: Option<Arc<TelemetryWriter>>,
    ) -> Arc<Self> {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        Arc::new(Self {
            config,
            semaphore,
            shared_state,
            templates,
            http_client,
            step_mapping,
            cases,
            script_driver: Arc::new(NullLoopScriptDriver),
            dynamic_mapping,
            telemetry,
            child_case_indices: AsyncMutex::new(HashMap::new()),
        })
    }

    async fn remember_boundary_idx(&self, spi_key: String, idx: usize) {
        self.child_case_indices.lock().await.insert(spi_key, idx);
    }

    async fn boundary_idx_of(&self, spi_key: &str) -> Option<usize> {
        self.child_case_indices.lock().await.get(spi_key).copied()
    }
}

/// Registra uma fronteira de escopo temporário (`ChildCase`/`ChildStepCase`/
/// `ChildMultitasker`) na telemetria, se configurada, e lembra seu `idx` para
/// consulta posterior pelos descendentes.
async fn register_boundary(ctx: &RunContext, spi: &StaticPathIndex, owner_id: &str) -> Option<usize> {
    let tw = ctx.telemetry.as_ref()?;
    match tw.register_child_case(&spi.key(), owner_id).await {
        Ok(idx) => {
            ctx.remember_boundary_idx(spi.key(), idx).await;
            Some(idx)
        }
        Err(e) => {
            tracing::warn!(error = %e, "falha ao registrar fronteira de telemetria");
            None
        }
    }
}

/// Sobe de `node` até a fronteira de escopo temporário mais próxima e
/// devolve seu `idx` de telemetria, se alguma existir e estiver registrada.
async fn nearest_boundary_idx(ctx: &RunContext, node: &NodeRef) -> Option<usize> {
    let ancestor = find_ancestor(node, |n| n.entity.is_child_case() || n.entity.is_child_step_case() || n.entity.is_child_multitasker()).await?;
    let key = ancestor.lock().await.spi.key();
    ctx.boundary_idx_of(&key).await
}

async fn scan_children_outcomes(node: &NodeRef) -> (bool, bool) {
    let children = node.lock().await.children.clone();
    let mut has_err = false;
    let mut has_skip = false;
    for child in &children {
        let result = child.lock().await.result;
        if result.is_error() {
            has_err = true;
        }
        if result.is_skipped() {
            has_skip = true;
        }
    }
    (has_err, has_skip)
}

/// O que um [`StepRunner`] concreto representa (§4.2). Cada variante sabe
/// como construir e, quando dirige uma ou mais instanciações, rodar sua
/// própria fila de filhos.
pub enum RunnerKind {
    /// O caso raiz da task — único filho direto de `NodeEntity::Task`.
    /// Orquestra as `ChildCase`s estáticas de `child_case_list`.
    MainCase { case: Case, child_cases: Vec<ChildCase> },
    /// Uma instanciação concreta de um caso (`ChildCase` estática ou
    /// `ChildStepCase` virtual): roda `case.children` sequencialmente.
    CaseInstance { case: Case, idx: Option<usize> },
    /// Um step real de `StepMapping`.
    Step { case_id: String, step: Step, idx: Option<usize> },
    /// Uma instanciação virtual de `multitasker`: roda os `children` do
    /// step que a gerou, sequencialmente.
    MultitaskerInstance { case_id: String, children: Vec<String>, idx: Option<usize> },
}

/// Parâmetros de construção de uma instanciação de caso (`ChildCase` estática
/// ou `ChildStepCase` virtual) — as duas variantes divergem apenas em como o
/// chamador monta este struct.
struct CaseInstanceSpec<'a> {
    parent: &'a NodeRef,
    spi: StaticPathIndex,
    entity: NodeEntity,
    case: Case,
    temp_variables: VarMap,
    project: String,
    env: String,
    initial_status: Option<NodeStatus>,
    child_case_id: String,
}

async fn build_case_instance_runner(ctx: Arc<RunContext>, spec: CaseInstanceSpec<'_>) -> Arc<StepRunner> {
    let node = DynamicNode::new_child(
        spec.parent,
        spec.spi.clone(),
        spec.entity,
        spec.case.error_strategy,
        spec.case.case_error_strategy,
        Some(spec.temp_variables),
        spec.project,
        spec.env,
    )
    .await;
    if let Some(status) = spec.initial_status {
        node.lock().await.status = status;
    }
    ctx.dynamic_mapping.register(&spec.spi, node.clone()).await;
    let idx = register_boundary(&ctx, &spec.spi, &spec.child_case_id).await;
    Arc::new(StepRunner { node, kind: RunnerKind::CaseInstance { case: spec.case, idx }, ctx })
}

/// Resolve `(case_id, step_id)` em `StepMapping`, cria o nó filho e empacota
/// o runner. Falha com `TREE_UNKNOWN_STEP_REFERENCE` quando a referência
/// estática não existe (§7 "malformed tree references").
async fn build_step_runner(ctx: Arc<RunContext>, parent: &NodeRef, case_id: &str, step_id: &str) -> Result<Arc<StepRunner>, StructuredError> {
    let step = ctx.step_mapping.get(case_id, step_id).cloned().ok_or_else(|| {
        StructuredError::new(ErrorCode::TREE_UNKNOWN_STEP_REFERENCE, format!("step '{step_id}' não existe em StepMapping['{case_id}']"))
    })?;

    let (parent_spi, parent_project, parent_env, parent_case_error_strategy) = {
        let guard = parent.lock().await;
        (guard.spi.clone(), guard.project.clone(), guard.env.clone(), guard.case_error_strategy)
    };
    let spi = parent_spi.for_step(step_id);
    let entity = NodeEntity::Step { case_id: case_id.to_string(), step_id: step_id.to_string(), step_type: step.type_name() };
    let node = DynamicNode::new_child(parent, spi.clone(), entity, step.error_strategy(), parent_case_error_strategy, None, parent_project, parent_env).await;
    ctx.dynamic_mapping.register(&spi, node.clone()).await;

    let idx = nearest_boundary_idx(&ctx, &node).await;
    Ok(Arc::new(StepRunner { node, kind: RunnerKind::Step { case_id: case_id.to_string(), step, idx }, ctx }))
}

async fn build_main_case_runner(ctx: Arc<RunContext>, root: &NodeRef, case: Case, child_cases: Vec<ChildCase>) -> Arc<StepRunner> {
    let (root_spi, project, env) = {
        let guard = root.lock().await;
        (guard.spi.clone(), guard.project.clone(), guard.env.clone())
    };
    let spi = root_spi.for_main_case(&case.id);
    let node = DynamicNode::new_child(
        root,
        spi.clone(),
        NodeEntity::MainCase { case_id: case.id.clone(), is_root: true },
        case.error_strategy,
        case.case_error_strategy,
        None,
        project,
        env,
    )
    .await;
    ctx.dynamic_mapping.register(&spi, node.clone()).await;
    Arc::new(StepRunner { node, kind: RunnerKind::MainCase { case, child_cases }, ctx })
}

/// Ponto de entrada do módulo: constrói a raiz da task e seu `main_case` e
/// roda a árvore inteira até o fim. Devolve o nó raiz, já em estado
/// terminal, para quem chamou inspecionar o resultado agregado (§8
/// invariante 1: nenhum nó fica `Pending`/`Running` ao final).
pub async fn run_task(ctx: Arc<RunContext>, task_id: &str, project: String, env: String, main_case: Case, child_cases: Vec<ChildCase>) -> NodeRef {
    let root_spi = StaticPathIndex::root(task_id);
    let root = DynamicNode::new_root(root_spi.clone(), project, env);
    ctx.dynamic_mapping.register(&root_spi, root.clone()).await;

    let runner = build_main_case_runner(ctx.clone(), &root, main_case, child_cases).await;
    scheduler::execute(runner.as_ref(), &ctx.semaphore).await;

    let (has_err, has_skip) = scan_children_outcomes(&root).await;
    let mut guard = root.lock().await;
    guard.has_child_error = has_err;
    guard.has_child_skipped = has_skip;
    guard.status = if has_err {
        NodeStatus::ErrorChild
    } else if has_skip {
        NodeStatus::SkippedChild
    } else {
        NodeStatus::End
    };
    guard.result = if has_err {
        NodeResult::ErrorChild
    } else if has_skip {
        NodeResult::SkippedChild
    } else {
        NodeResult::Success
    };
    drop(guard);
    root
}

/// O runner concreto que o `scheduler` executa para qualquer nó da árvore
/// dinâmica (§4.1, §4.2).
pub struct StepRunner {
    node: NodeRef,
    kind: RunnerKind,
    ctx: Arc<RunContext>,
}

impl StepRunner {
    fn leaf_step(&self) -> Option<&Step> {
        match &self.kind {
            RunnerKind::Step { step, .. } => Some(step),
            _ => None,
        }
    }

    async fn build_exec_context(&self, step: &Step) -> executors::ExecutionContext {
        let can_set = !matches!(step, Step::Assertion(_) | Step::If(_) | Step::Error(_));
        let handle = VariableHandle::new(self.node.clone(), self.ctx.shared_state.clone(), can_set);
        executors::ExecutionContext {
            node: self.node.clone(),
            variables: handle,
            templates: self.ctx.templates.clone(),
            shared_state: self.ctx.shared_state.clone(),
            http_client: self.ctx.http_client.clone(),
        }
    }

    async fn resolve_case_project_env(&self, case: &Case) -> (String, String) {
        let (parent_project, parent_env) = {
            let guard = self.node.lock().await;
            (guard.project.clone(), guard.env.clone())
        };
        resolve_case_env(case.env_strategy, (&case.project, &case.env), (&parent_project, &parent_env))
    }

    async fn dispatch_queue(&self, runners: Vec<Arc<dyn Runner>>, strategy: LoopStrategy) {
        match strategy {
            LoopStrategy::Sequential => scheduler::run_sequentially(runners, self.ctx.semaphore.clone()).await,
            LoopStrategy::Concurrent => scheduler::run_concurrently(runners, self.ctx.semaphore.clone()).await,
        }
    }

    async fn build_static_children_runners(&self, case_id: &str, ids: &[String]) -> Result<Vec<Arc<dyn Runner>>, StructuredError> {
        let mut runners = Vec::with_capacity(ids.len());
        for step_id in ids {
            let runner = build_step_runner(self.ctx.clone(), &self.node, case_id, step_id).await?;
            runners.push(runner as Arc<dyn Runner>);
        }
        Ok(runners)
    }

    /// Constrói (quando aplicável) e roda a fila de filhos deste nó. Erros
    /// estruturais (dataset ausente, referência de step desconhecida) viram
    /// o `Err` do `run()` deste runner, entrando na mesma engrenagem de
    /// `error_strategy` que uma falha de node executor.
    async fn run_children(&self) -> Result<(), StructuredError> {
        match &self.kind {
            RunnerKind::MainCase { case, child_cases } => {
                let mut runners = Vec::with_capacity(child_cases.len());
                let main_spi = self.node.lock().await.spi.clone();
                let (project, env) = self.resolve_case_project_env(case).await;
                for cc in child_cases {
                    let spi = main_spi.for_child_case(&cc.id);
                    let spec = CaseInstanceSpec {
                        parent: &self.node,
                        spi,
                        entity: NodeEntity::ChildCase { child_case_id: cc.id.clone(), case_id: case.id.clone() },
                        case: case.clone(),
                        temp_variables: cc.temp_variables.clone(),
                        project: project.clone(),
                        env: env.clone(),
                        initial_status: None,
                        child_case_id: cc.id.clone(),
                    };
                    runners.push(build_case_instance_runner(self.ctx.clone(), spec).await as Arc<dyn Runner>);
                }
                self.dispatch_queue(runners, case.loop_strategy).await;
                Ok(())
            }
            RunnerKind::CaseInstance { case, .. } => {
                let runners = self.build_static_children_runners(&case.id, &case.children).await?;
                scheduler::run_sequentially(runners, self.ctx.semaphore.clone()).await;
                Ok(())
            }
            RunnerKind::MultitaskerInstance { case_id, children, .. } => {
                let runners = self.build_static_children_runners(case_id, children).await?;
                scheduler::run_sequentially(runners, self.ctx.semaphore.clone()).await;
                Ok(())
            }
            RunnerKind::Step { case_id, step, .. } => self.run_step_children(case_id, step).await,
        }
    }

    async fn run_step_children(&self, case_id: &str, step: &Step) -> Result<(), StructuredError> {
        match step {
            Step::Group(g) => {
                let runners = self.build_static_children_runners(case_id, &g.children).await?;
                scheduler::run_sequentially(runners, self.ctx.semaphore.clone()).await;
                Ok(())
            }
            Step::If(s) => {
                // Os filhos são sempre construídos, mesmo quando a condição
                // falhou e este nó já está `Conditional`: cada runner de
                // filho ainda precisa rodar seu próprio `before`/checagem de
                // skip e emitir o evento `step skipped`, transitivamente
                // para seus próprios descendentes (§8 cenário 6). É
                // `check_and_change_status` — via `ancestor_blocks` sobre o
                // pai imediato — quem desvia cada um para o caminho
                // `skipped` sem rodar seu corpo.
                let runners = self.build_static_children_runners(case_id, &s.children).await?;
                scheduler::run_sequentially(runners, self.ctx.semaphore.clone()).await;
                Ok(())
            }
            Step::Multitasker(m) => {
                let global_cache = self.ctx.shared_state.global_cache.lock().await.clone();
                let spec = DriveSpec {
                    drive_strategy: m.drive_strategy,
                    times: m.times.as_deref(),
                    dataset: m.dataset.as_ref(),
                    load_loop_script: m.load_loop_script.as_deref(),
                };
                let specs = loop_expansion::expand_virtual_children(spec, &step.common().check, &global_cache, self.ctx.script_driver.as_ref(), self.ctx.config.max_generate_length).await?;

                let parent_spi = self.node.lock().await.spi.clone();
                let (project, env) = {
                    let g = self.node.lock().await;
                    (g.project.clone(), g.env.clone())
                };
                let parent_case_error_strategy = self.node.lock().await.case_error_strategy;

                let mut runners = Vec::with_capacity(specs.len());
                for (index, vspec) in specs.into_iter().enumerate() {
                    runners.push(self.build_multitasker_instance(&parent_spi, index, vspec, case_id, m, &project, &env, parent_case_error_strategy).await as Arc<dyn Runner>);
                }
                self.dispatch_queue(runners, m.loop_strategy).await;
                Ok(())
            }
            Step::Case(cs) => {
                let Some(referenced) = self.ctx.cases.get(&cs.case_id).cloned() else {
                    return Err(StructuredError::new(
                        ErrorCode::TREE_UNKNOWN_STEP_REFERENCE,
                        format!("case '{}' referenciado por step '{}' não existe em case_list", cs.case_id, step.id()),
                    ));
                };
                let global_cache = self.ctx.shared_state.global_cache.lock().await.clone();
                let spec = DriveSpec {
                    drive_strategy: referenced.drive_strategy,
                    times: referenced.times.as_deref(),
                    dataset: referenced.dataset.as_ref(),
                    load_loop_script: referenced.load_loop_script.as_deref(),
                };
                let specs = loop_expansion::expand_virtual_children(spec, &step.common().check, &global_cache, self.ctx.script_driver.as_ref(), self.ctx.config.max_generate_length).await?;

                let parent_spi = self.node.lock().await.spi.clone();
                let (parent_project, parent_env) = {
                    let g = self.node.lock().await;
                    (g.project.clone(), g.env.clone())
                };
                let (project, env) = resolve_case_env(referenced.env_strategy, (&referenced.project, &referenced.env), (&parent_project, &parent_env));

                let mut runners = Vec::with_capacity(specs.len());
                for (index, vspec) in specs.into_iter().enumerate() {
                    let spi = parent_spi.for_virtual(step.id(), index);
                    let child_case_id = format!("{}#{index}", step.id());
                    let inner_spec = CaseInstanceSpec {
                        parent: &self.node,
                        spi,
                        entity: NodeEntity::ChildStepCase { case_id: referenced.id.clone() },
                        case: referenced.clone(),
                        temp_variables: vspec.temp_variables,
                        project: project.clone(),
                        env: env.clone(),
                        initial_status: Some(vspec.initial_status),
                        child_case_id,
                    };
                    runners.push(build_case_instance_runner(self.ctx.clone(), inner_spec).await as Arc<dyn Runner>);
                }
                self.dispatch_queue(runners, referenced.loop_strategy).await;
                Ok(())
            }
            // Leaf steps (interface/script/database/assertion/delay/error/empty):
            // nenhuma fila de filhos a construir.
            _ => Ok(()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn build_multitasker_instance(
        &self,
        parent_spi: &StaticPathIndex,
        index: usize,
        vspec: VirtualChildSpec,
        case_id: &str,
        m: &crate::protocol::MultitaskerStep,
        project: &str,
        env: &str,
        case_error_strategy: crate::protocol::ErrorStrategy,
    ) -> Arc<StepRunner> {
        let spi = parent_spi.for_virtual(m.common.id.as_str(), index);
        let node = DynamicNode::new_child(
            &self.node,
            spi.clone(),
            NodeEntity::ChildMultitasker { step_id: m.common.id.clone() },
            crate::protocol::ErrorStrategy::Raise,
            case_error_strategy,
            Some(vspec.temp_variables),
            project.to_string(),
            env.to_string(),
        )
        .await;
        node.lock().await.status = vspec.initial_status;
        self.ctx.dynamic_mapping.register(&spi, node.clone()).await;
        let owner_id = format!("{}#{index}", m.common.id);
        let idx = register_boundary(&self.ctx, &spi, &owner_id).await;
        Arc::new(StepRunner {
            node,
            kind: RunnerKind::MultitaskerInstance { case_id: case_id.to_string(), children: m.children.clone(), idx },
            ctx: self.ctx.clone(),
        })
    }

    async fn emit_process_event(&self, process_type: RedisProcessType, desc: impl Into<String>, extra: Value) {
        let Some(tw) = &self.ctx.telemetry else { return };
        let obj = ProcessObject::new(process_type, desc, now_ms()).with_extra(extra);
        if let Err(e) = tw.push_summary(&obj).await {
            tracing::warn!(error = %e, "falha ao publicar evento de processo no summary");
        }
        match &self.kind {
            RunnerKind::Step { case_id, step, idx: Some(idx) } => {
                if let Err(e) = tw.push_step_process(case_id, *idx, step.id(), &obj).await {
                    tracing::warn!(error = %e, "falha ao publicar evento de processo no step");
                }
            }
            RunnerKind::CaseInstance { idx: Some(idx), .. } | RunnerKind::MultitaskerInstance { idx: Some(idx), .. } => {
                if let Err(e) = tw.push_child_case_process(*idx, &obj).await {
                    tracing::warn!(error = %e, "falha ao publicar evento de processo no child-case");
                }
            }
            _ => {}
        }
    }

    async fn emit_events(&self, step_type: &str, events: &[ProcessEvent]) {
        for event in events {
            self.emit_process_event(classify_event(step_type, event.kind), event.message.clone(), event.payload.clone()).await;
        }
    }

    async fn emit_status(&self, status: RecordStatus) {
        let Some(tw) = &self.ctx.telemetry else { return };
        let result = match &self.kind {
            RunnerKind::Step { case_id, step, idx: Some(idx) } => tw.set_step_status(case_id, *idx, step.id(), status).await,
            RunnerKind::CaseInstance { idx: Some(idx), .. } | RunnerKind::MultitaskerInstance { idx: Some(idx), .. } => tw.set_child_case_status(*idx, status).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "falha ao publicar status de telemetria");
        }
    }

    /// Incrementa `done_step_count`/`failed_step_count`/`skipped_step_count`
    /// da fronteira de escopo temporário mais próxima — só faz sentido para
    /// nós `Step` (um `CaseInstance` não é, em si, um "step").
    async fn bump_boundary_counter(&self, field: &str) {
        if !matches!(self.kind, RunnerKind::Step { .. }) {
            return;
        }
        let Some(tw) = &self.ctx.telemetry else { return };
        if let Some(idx) = nearest_boundary_idx(&self.ctx, &self.node).await {
            if let Err(e) = tw.update_child_case_counter(idx, field, 1).await {
                tracing::warn!(error = %e, "falha ao incrementar contador de child-case");
            }
        }
    }

    async fn finalize_aggregation(&self) {
        let (has_err, has_skip) = scan_children_outcomes(&self.node).await;

        let mut guard = self.node.lock().await;
        guard.has_child_error = has_err;
        guard.has_child_skipped = has_skip;

        if guard.status == NodeStatus::Conditional {
            // `if` falho: os filhos estáticos foram construídos e rodados
            // normalmente, mas todos tomaram o caminho `skipped` (via
            // `check_and_change_status` observando este nó `Conditional`
            // como pai imediato) — então `has_child_skipped` é esperado
            // `true` aqui. O nó do `if` em si permanece `Conditional`, com
            // seu próprio evento de fim (`ConditionalEnd`), distinto do
            // `step skipped` de cada filho.
            if guard.result == NodeResult::Unknown {
                guard.result = NodeResult::Success;
            }
            drop(guard);
            self.emit_status(RecordStatus::ConditionalEnd).await;
            self.bump_boundary_counter("done_step_count").await;
            return;
        }

        let (status, result, record_status, counter_field) = if has_err {
            (NodeStatus::ErrorChild, NodeResult::ErrorChild, RecordStatus::ErrorEnd, "failed_step_count")
        } else if has_skip {
            (NodeStatus::SkippedChild, NodeResult::SkippedChild, RecordStatus::SkippedEnd, "skipped_step_count")
        } else {
            (NodeStatus::End, NodeResult::Success, RecordStatus::End, "done_step_count")
        };
        guard.status = status;
        guard.result = result;
        drop(guard);

        self.emit_status(record_status).await;
        self.bump_boundary_counter(counter_field).await;
    }

    async fn finalize_error(&self, err: anyhow::Error) {
        let structured = match err.downcast::<StructuredError>() {
            Ok(e) => e,
            Err(orig) => StructuredError::new(ErrorCode::INTERNAL_ERROR, orig.to_string()),
        };

        {
            let mut guard = self.node.lock().await;
            guard.status = NodeStatus::Error;
            guard.result = NodeResult::ErrorSelf;
        }

        let step_type = self.leaf_step().map(Step::type_name).unwrap_or("case");
        let extra = serde_json::json!({
            "code": structured.code.formatted(),
            "category": structured.code.category().to_string(),
        });
        self.emit_process_event(classify_error(step_type, &structured), structured.user_message(), extra).await;
        self.emit_status(RecordStatus::ErrorEnd).await;
        self.bump_boundary_counter("failed_step_count").await;

        crate::error_strategy::handle_failure(&self.node).await;
    }
}

fn classify_event(step_type: &str, kind: ProcessEventKind) -> RedisProcessType {
    use ProcessEventKind::*;
    match (step_type, kind) {
        ("interface", Success) => RedisProcessType::InterfaceSuccessFinished,
        ("interface", Warning) => RedisProcessType::InterfaceWarning,
        ("interface", Error) => RedisProcessType::InterfaceException,
        ("assertion", Success) => RedisProcessType::AssertionSuccess,
        ("assertion", Warning) | ("assertion", Error) => RedisProcessType::AssertionFailed,
        ("if", Success) => RedisProcessType::IfSuccess,
        ("if", Warning) => RedisProcessType::IfFailed,
        ("delay", Warning) => RedisProcessType::DelayWarning,
        ("delay", Success) => RedisProcessType::DelaySuccess,
        ("error", _) => RedisProcessType::ErrorFailed,
        ("script", _) => RedisProcessType::ActionScript,
        ("database", Warning) | ("database", Error) => RedisProcessType::DatabaseException,
        (_, Warning) => RedisProcessType::ActionWarning,
        (_, Error) => RedisProcessType::SystemException,
        (_, Success) => RedisProcessType::System,
    }
}

fn classify_error(step_type: &str, err: &StructuredError) -> RedisProcessType {
    match err.code.category() {
        ErrorCategory::Assertion => RedisProcessType::AssertionException,
        ErrorCategory::HttpExecution => RedisProcessType::InterfaceException,
        ErrorCategory::Configuration => RedisProcessType::VariableException,
        _ if step_type == "database" => RedisProcessType::DatabaseException,
        _ => RedisProcessType::SystemException,
    }
}

#[async_trait]
impl Runner for StepRunner {
    async fn before(&self) -> anyhow::Result<BeforeOutcome> {
        Ok(BeforeOutcome::Ready)
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.node.lock().await.status = NodeStatus::Running;
        self.emit_status(RecordStatus::Running).await;

        if let Some(step) = self.leaf_step() {
            let exec_ctx = self.build_exec_context(step).await;
            match executors::dispatch(step).run(&exec_ctx).await {
                Ok(core_ret) => self.emit_events(step.type_name(), &core_ret.events).await,
                Err(structured_err) => return Err(anyhow::Error::new(structured_err)),
            }
        }

        self.run_children().await?;
        Ok(())
    }

    async fn after(&self) {
        self.finalize_aggregation().await;
    }

    async fn error(&self, err: anyhow::Error) {
        self.finalize_error(err).await;
    }

    async fn skipped(&self) {
        {
            let mut guard = self.node.lock().await;
            if guard.result == NodeResult::Unknown {
                guard.result = NodeResult::SkippedSelf;
            }
        }
        self.emit_status(RecordStatus::SkippedEnd).await;
        self.bump_boundary_counter("skipped_step_count").await;
    }

    fn node(&self) -> &NodeRef {
        &self.node
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AssertMode, AssertionStep, DriveStrategy, EmptyStep, ErrorStrategy, GlobalCache, IfStep, RecordMeta, StepCommon, TaskInfo};
    use std::collections::HashMap as Map;

    fn test_config() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::default())
    }

    fn make_ctx(step_mapping: StepMapping, cases: HashMap<String, Case>) -> Arc<RunContext> {
        RunContext::new(
            test_config(),
            SharedVariableState::new(GlobalCache::default()),
            Arc::new(TemplateEngine::new()),
            reqwest::Client::new(),
            Arc::new(step_mapping),
            Arc::new(cases),
            Arc::new(DynamicMapping::new()),
            None,
        )
    }

    fn empty_step(id: &str) -> Step {
        Step::Empty(EmptyStep { common: StepCommon { id: id.into(), ..Default::default() } })
    }

    #[tokio::test]
    async fn single_empty_step_runs_to_end() {
        let mut steps = Map::new();
        steps.insert("s1".to_string(), empty_step("s1"));
        let mut mapping = Map::new();
        mapping.insert("case_a".to_string(), steps);
        let step_mapping = StepMapping(mapping);

        let case = Case {
            id: "case_a".into(),
            project: "p".into(),
            env: "e".into(),
            env_strategy: Default::default(),
            drive_strategy: DriveStrategy::Times,
            times: None,
            dataset: None,
            load_loop_script: None,
            loop_strategy: LoopStrategy::Sequential,
            error_strategy: ErrorStrategy::Raise,
            case_error_strategy: ErrorStrategy::Raise,
            children: vec!["s1".into()],
            child_case_ids: vec![],
        };
        let mut cases = Map::new();
        cases.insert(case.id.clone(), case.clone());

        let ctx = make_ctx(step_mapping, cases);
        let child_cases = vec![ChildCase { id: "cc1".into(), case_id: "case_a".into(), temp_variables: Map::new() }];
        let root = run_task(ctx, "t1", "p".into(), "e".into(), case, child_cases).await;

        let guard = root.lock().await;
        assert_eq!(guard.status, NodeStatus::End);
        assert_eq!(guard.result, NodeResult::Success);
    }

    #[tokio::test]
    async fn failing_assertion_skips_enclosing_child_case_via_current_case_strategy() {
        let assertion = Step::Assertion(AssertionStep {
            common: StepCommon { id: "a1".into(), ..Default::default() },
            assert_mode: AssertMode::Script,
            script: Some("1 == 2".into()),
            interface_range: None,
            interface_body_range: None,
            interface_body_jsonpath: None,
            interface_body_pattern: None,
            interface_body_value: None,
            interface_header_key: None,
            interface_header_pattern: None,
            interface_header_value: None,
            interface_code_pattern: None,
            interface_code_value: None,
            success_desc: None,
            failed_desc: None,
        });
        let mut steps = Map::new();
        steps.insert("a1".to_string(), assertion);
        let mut mapping = Map::new();
        mapping.insert("case_a".to_string(), steps);
        let step_mapping = StepMapping(mapping);

        let case = Case {
            id: "case_a".into(),
            project: "p".into(),
            env: "e".into(),
            env_strategy: Default::default(),
            drive_strategy: DriveStrategy::Times,
            times: None,
            dataset: None,
            load_loop_script: None,
            loop_strategy: LoopStrategy::Sequential,
            error_strategy: ErrorStrategy::CurrentCase,
            case_error_strategy: ErrorStrategy::Raise,
            children: vec!["a1".into()],
            child_case_ids: vec![],
        };
        let mut cases = Map::new();
        cases.insert(case.id.clone(), case.clone());

        let ctx = make_ctx(step_mapping, cases);
        let child_cases = vec![ChildCase { id: "cc1".into(), case_id: "case_a".into(), temp_variables: Map::new() }];
        let root = run_task(ctx, "t1", "p".into(), "e".into(), case, child_cases).await;

        let guard = root.lock().await;
        assert!(guard.has_child_error || guard.has_child_skipped);
    }

    #[tokio::test]
    async fn if_condition_false_skips_children_without_counting_as_error() {
        let if_step = Step::If(IfStep {
            common: StepCommon { id: "if1".into(), ..Default::default() },
            error_strategy: ErrorStrategy::Raise,
            if_mode: "fast".into(),
            key: Some("1".into()),
            value: Some(serde_json::json!("2")),
            pattern: Some("eq".into()),
            script: None,
            children: vec!["s1".into()],
        });
        let mut steps = Map::new();
        steps.insert("if1".to_string(), if_step);
        steps.insert("s1".to_string(), empty_step("s1"));
        let mut mapping = Map::new();
        mapping.insert("case_a".to_string(), steps);
        let step_mapping = StepMapping(mapping);

        let case = Case {
            id: "case_a".into(),
            project: "p".into(),
            env: "e".into(),
            env_strategy: Default::default(),
            drive_strategy: DriveStrategy::Times,
            times: None,
            dataset: None,
            load_loop_script: None,
            loop_strategy: LoopStrategy::Sequential,
            error_strategy: ErrorStrategy::Raise,
            case_error_strategy: ErrorStrategy::Raise,
            children: vec!["if1".into()],
            child_case_ids: vec![],
        };
        let mut cases = Map::new();
        cases.insert(case.id.clone(), case.clone());

        let ctx = make_ctx(step_mapping, cases);
        let child_cases = vec![ChildCase { id: "cc1".into(), case_id: "case_a".into(), temp_variables: Map::new() }];
        let root = run_task(ctx, "t1", "p".into(), "e".into(), case, child_cases).await;

        let guard = root.lock().await;
        assert!(!guard.has_child_error);
        assert_eq!(guard.status, NodeStatus::End);

        let _ = RecordMeta { record_backup_index: "unused".into() };
        let _ = TaskInfo {
            task_id: "t1".into(),
            project: "p".into(),
            env: "e".into(),
            main_case_id: "case_a".into(),
            error_strategy: ErrorStrategy::Raise,
            loop_strategy: LoopStrategy::Sequential,
        };
    }
}
