//! # Motor de Estratégia de Erro
//!
//! Implementa §4.5: a partir de um nó que falhou, sobe pelos ponteiros de pai
//! resolvendo a estratégia *efetiva* (atravessando cadeias transparentes
//! `raise`/`ref_case_inner`), lembra o `ChildMultitasker` mais próximo
//! encontrado no caminho (o "iterador do multitasker"), e por fim muta o
//! status de exatamente um nó-alvo para `Skipped`. A mutação de status é
//! suficiente: `scheduler::check_and_change_status` já desvia todo descendente
//! ainda não iniciado para o caminho `skipped`.

use crate::protocol::ErrorStrategy;
use crate::tree::{find_ancestor, NodeEntity, NodeRef, NodeStatus};

/// Resultado da resolução: o nó cuja status deve ser mudado para `Skipped`,
/// ou nenhum quando a estratégia efetiva é `current_step` (apenas o próprio
/// step falho já está marcado, nada mais muda).
pub struct Resolution {
    pub target: Option<NodeRef>,
}

/// Processa a falha de `failing_node`: resolve a estratégia efetiva subindo a
/// árvore e aplica a mutação de status correspondente.
pub async fn handle_failure(failing_node: &NodeRef) -> Resolution {
    let resolution = resolve(failing_node).await;
    if let Some(target) = &resolution.target {
        let mut guard = target.lock().await;
        guard.status = NodeStatus::Skipped;
    }
    resolution
}

/// Resolve o nó-alvo sem mutar nada — usado por testes e pelo motor de
/// telemetria, que quer saber o alvo antes de decidir o que emitir.
pub async fn resolve(failing_node: &NodeRef) -> Resolution {
    let mut current = failing_node.clone();
    let mut nearest_multitasker_iter: Option<NodeRef> = None;

    loop {
        let (is_multitasker_iter, declared_strategy, case_error_strategy, parent) = {
            let guard = current.lock().await;
            (
                guard.entity.is_child_multitasker(),
                guard.error_strategy,
                guard.case_error_strategy,
                guard.parent.clone(),
            )
        };

        if is_multitasker_iter {
            nearest_multitasker_iter = Some(current.clone());
        }

        let effective = match declared_strategy {
            ErrorStrategy::Raise => None,
            ErrorStrategy::RefCaseInner if case_error_strategy == ErrorStrategy::Raise => None,
            ErrorStrategy::RefCaseInner => Some(case_error_strategy),
            other => Some(other),
        };

        if let Some(strategy) = effective {
            let target = resolve_target(strategy, &current, nearest_multitasker_iter.as_ref()).await;
            return Resolution { target };
        }

        match parent.and_then(|w| w.upgrade()) {
            Some(p) => current = p,
            None => return Resolution { target: None },
        }
    }
}

/// Traduz uma estratégia efetiva (já resolvida, não-`raise`) no nó-alvo da
/// tabela de §4.5. `decision_node` é o ancestral no qual a estratégia foi
/// encontrada (o "decision point"); `multitasker_iter` é o `ChildMultitasker`
/// mais próximo visto durante a subida, se algum.
async fn resolve_target(strategy: ErrorStrategy, decision_node: &NodeRef, multitasker_iter: Option<&NodeRef>) -> Option<NodeRef> {
    match strategy {
        ErrorStrategy::CurrentStep => None,
        ErrorStrategy::Task => find_ancestor(decision_node, |n| matches!(n.entity, NodeEntity::Task)).await,
        ErrorStrategy::Case => match find_ancestor(decision_node, |n| matches!(n.entity, NodeEntity::MainCase { is_root: true, .. })).await {
            Some(root_case) => Some(root_case),
            None => find_ancestor(decision_node, |n| n.entity.is_case()).await,
        },
        ErrorStrategy::CurrentCase => match find_ancestor(decision_node, |n| n.entity.is_child_step_case()).await {
            Some(inner) => Some(inner),
            None => find_ancestor(decision_node, |n| n.entity.is_child_case()).await,
        },
        ErrorStrategy::Multitasker => match multitasker_iter {
            Some(iter) => {
                let parent = iter.lock().await.parent.clone();
                parent.and_then(|w| w.upgrade())
            }
            None => None,
        },
        ErrorStrategy::CurrentMultitasker => multitasker_iter.cloned(),
        ErrorStrategy::RefChildCase => find_ancestor(decision_node, |n| n.entity.is_child_step_case()).await,
        ErrorStrategy::RefCase => find_ancestor(decision_node, |n| n.entity.is_case()).await,
        ErrorStrategy::RefCaseInner | ErrorStrategy::Raise => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DynamicNode, StaticPathIndex};
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn build_chain() -> (NodeRef, NodeRef, NodeRef, NodeRef) {
        // task -> main_case(X, strategy=current_case) -> child_step_case #2 -> step(fails)
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());

        let case_spi = root_spi.for_main_case("case_x");
        let case = DynamicNode::new_child(
            &root,
            case_spi.clone(),
            NodeEntity::MainCase { case_id: "case_x".into(), is_root: true },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        let cc_spi = case_spi.for_child_case("cc2");
        let child_step_case = DynamicNode::new_child(
            &case,
            cc_spi.clone(),
            NodeEntity::ChildStepCase { case_id: "case_x".into() },
            ErrorStrategy::CurrentCase,
            ErrorStrategy::Raise,
            Some(HashMap::new()),
            "p".into(),
            "e".into(),
        )
        .await;

        let step = DynamicNode::new_child(
            &child_step_case,
            cc_spi.for_step("s1"),
            NodeEntity::Step { case_id: "case_x".into(), step_id: "s1".into(), step_type: "script" },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        (root, case, child_step_case, step)
    }

    #[tokio::test]
    async fn current_case_skips_enclosing_child_step_case() {
        let (_root, _case, child_step_case, step) = build_chain().await;
        let resolution = handle_failure(&step).await;
        let target = resolution.target.expect("current_case must resolve to a target");
        assert!(Arc::ptr_eq(&target, &child_step_case));
        assert_eq!(target.lock().await.status, NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn raise_transparent_chain_walks_to_declared_ancestor() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());

        let case_spi = root_spi.for_main_case("case_y");
        let case = DynamicNode::new_child(
            &root,
            case_spi.clone(),
            NodeEntity::MainCase { case_id: "case_y".into(), is_root: true },
            ErrorStrategy::Task,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        let group_spi = case_spi.for_step("g1");
        let group = DynamicNode::new_child(
            &case,
            group_spi.clone(),
            NodeEntity::Step { case_id: "case_y".into(), step_id: "g1".into(), step_type: "group" },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;
        let step = DynamicNode::new_child(
            &group,
            group_spi.for_step("s1"),
            NodeEntity::Step { case_id: "case_y".into(), step_id: "s1".into(), step_type: "script" },
            ErrorStrategy::Raise,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;

        // Both `group` and the intermediate `script` step declare `raise`;
        // the walk must skip them and stop at `case`, whose strategy `task`
        // resolves to the root.
        let resolution = handle_failure(&step).await;
        let target = resolution.target.expect("task strategy must resolve to the root node");
        assert!(Arc::ptr_eq(&target, &root));
    }

    #[tokio::test]
    async fn current_step_strategy_has_no_target() {
        let root_spi = StaticPathIndex::root("t1");
        let root = DynamicNode::new_root(root_spi.clone(), "p".into(), "e".into());
        let step = DynamicNode::new_child(
            &root,
            root_spi.for_step("s1"),
            NodeEntity::Step { case_id: "".into(), step_id: "s1".into(), step_type: "script" },
            ErrorStrategy::CurrentStep,
            ErrorStrategy::Raise,
            None,
            "p".into(),
            "e".into(),
        )
        .await;
        let resolution = handle_failure(&step).await;
        assert!(resolution.target.is_none());
    }
}
