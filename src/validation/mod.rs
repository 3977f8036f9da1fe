//! # Validação Estrutural da Submissão
//!
//! Verifica, antes de montar qualquer `RunContext`, que uma [`Submission`]
//! resolve internamente: toda referência (`main_case_id`, `children` de
//! `case`/`group`/`if`/`multitasker`, `case_id` de um step `case`, dataset de
//! `Case`/`MultitaskerStep`) aponta para algo que de fato existe nas
//! coleções paralelas de `Exec`. O motor em si já tem checagens defensivas
//! equivalentes no próprio caminho de execução
//! (`step_executor::build_step_runner` retorna `TREE_UNKNOWN_STEP_REFERENCE`,
//! `loop_expansion::resolve_dataset_rows` retorna `LOOP_DATASET_NOT_FOUND`) —
//! esta passagem só adianta a mesma checagem para antes do primeiro
//! `before()`, para que uma submissão malformada falhe com uma lista
//! completa de problemas em vez de abortar no primeiro nó que tropeça.

use thiserror::Error;

use crate::protocol::{Exec, Step};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("task_info.main_case_id '{0}' não existe em case_list")]
    UnknownMainCase(String),

    #[error("case '{case_id}' referencia o step '{step_id}' em children, mas ele não existe em step_mapping['{case_id}']")]
    UnknownStepReference { case_id: String, step_id: String },

    #[error("step '{step_id}' (case '{case_id}') referencia case_id '{referenced_case_id}', que não existe em case_list")]
    UnknownCaseReference { case_id: String, step_id: String, referenced_case_id: String },

    #[error("case '{case_id}' declara dataset '{dataset_id}'/'{env}', que não existe em global_cache.origin_dataset_mapping")]
    UnknownDatasetReference { case_id: String, dataset_id: String, env: String },

    #[error("case '{0}' não declara nenhum step em children")]
    EmptyCase(String),

    #[error("case_list está vazia")]
    EmptyCaseList,

    #[error("case '{0}' tem id vazio")]
    EmptyCaseId(String),
}

pub type ValidationResult = Result<(), Vec<ValidationError>>;

/// Valida uma `Exec` completa, acumulando todos os erros encontrados (em vez
/// de parar no primeiro) — cada um nomeia exatamente o nó e a referência
/// quebrada, para que o chamador (`api::execute`) possa devolver a lista
/// inteira na resposta de erro.
pub fn validate_exec(exec: &Exec) -> ValidationResult {
    let mut errors = Vec::new();

    if exec.case_list.is_empty() {
        errors.push(ValidationError::EmptyCaseList);
        return Err(errors);
    }

    let case_ids: std::collections::HashSet<&str> = exec.case_list.iter().map(|c| c.id.as_str()).collect();

    if !case_ids.contains(exec.task_info.main_case_id.as_str()) {
        errors.push(ValidationError::UnknownMainCase(exec.task_info.main_case_id.clone()));
    }

    for case in &exec.case_list {
        if case.id.trim().is_empty() {
            errors.push(ValidationError::EmptyCaseId(case.id.clone()));
        }
        if case.children.is_empty() {
            errors.push(ValidationError::EmptyCase(case.id.clone()));
            continue;
        }

        for step_id in &case.children {
            validate_step_chain(exec, &case.id, step_id, &case_ids, &mut errors);
        }

        if let Some(dataset) = &case.dataset {
            validate_dataset_reference(exec, &case.id, &dataset.dataset_id, &dataset.env, &mut errors);
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Resolve `children[i]` em `step_mapping[case_id]` e, recursivamente, segue
/// os filhos estáticos de `group`/`if`/`multitasker` e o `case_id` de um
/// step `case` — a mesma travessia que `step_executor` faria em tempo de
/// execução, só que sem rodar nada.
fn validate_step_chain(
    exec: &Exec,
    case_id: &str,
    step_id: &str,
    case_ids: &std::collections::HashSet<&str>,
    errors: &mut Vec<ValidationError>,
) {
    let Some(step) = exec.step_mapping.get(case_id, step_id) else {
        errors.push(ValidationError::UnknownStepReference { case_id: case_id.to_string(), step_id: step_id.to_string() });
        return;
    };

    match step {
        Step::Case(case_step) => {
            if !case_ids.contains(case_step.case_id.as_str()) {
                errors.push(ValidationError::UnknownCaseReference {
                    case_id: case_id.to_string(),
                    step_id: step_id.to_string(),
                    referenced_case_id: case_step.case_id.clone(),
                });
            }
        }
        Step::Multitasker(m) => {
            if let Some(dataset) = &m.dataset {
                validate_dataset_reference(exec, case_id, &dataset.dataset_id, &dataset.env, errors);
            }
            for child_id in &m.children {
                validate_step_chain(exec, case_id, child_id, case_ids, errors);
            }
        }
        _ => {
            for child_id in step.static_children() {
                validate_step_chain(exec, case_id, child_id, case_ids, errors);
            }
        }
    }
}

fn validate_dataset_reference(exec: &Exec, case_id: &str, dataset_id: &str, env: &str, errors: &mut Vec<ValidationError>) {
    let resolves = exec
        .global_cache
        .origin_dataset_mapping
        .get(dataset_id)
        .map(|entries| entries.iter().any(|e| e.env == env))
        .unwrap_or(false);
    if !resolves {
        errors.push(ValidationError::UnknownDatasetReference {
            case_id: case_id.to_string(),
            dataset_id: dataset_id.to_string(),
            env: env.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::*;
    use std::collections::HashMap;

    fn base_exec() -> Exec {
        let main_case = Case {
            id: "case_a".to_string(),
            project: "p".to_string(),
            env: "e".to_string(),
            env_strategy: EnvStrategy::SelfCase,
            drive_strategy: DriveStrategy::Times,
            times: Some("1".to_string()),
            dataset: None,
            load_loop_script: None,
            loop_strategy: LoopStrategy::Sequential,
            error_strategy: ErrorStrategy::Raise,
            case_error_strategy: ErrorStrategy::Raise,
            children: vec!["s1".to_string()],
            child_case_ids: vec![],
        };

        let mut case_steps = HashMap::new();
        case_steps.insert(
            "s1".to_string(),
            Step::Empty(EmptyStep { common: StepCommon { id: "s1".to_string(), ..Default::default() } }),
        );
        let mut mapping = HashMap::new();
        mapping.insert("case_a".to_string(), case_steps);

        Exec {
            task_info: TaskInfo {
                task_id: "t1".to_string(),
                project: "p".to_string(),
                env: "e".to_string(),
                main_case_id: "case_a".to_string(),
                error_strategy: ErrorStrategy::Raise,
                loop_strategy: LoopStrategy::Sequential,
            },
            case_list: vec![main_case],
            child_case_list: vec![],
            step_mapping: StepMapping(mapping),
            global_cache: GlobalCache::default(),
            case_steps_snapshot: serde_json::Value::Null,
        }
    }

    #[test]
    fn valid_exec_passes() {
        assert!(validate_exec(&base_exec()).is_ok());
    }

    #[test]
    fn unknown_main_case_is_reported() {
        let mut exec = base_exec();
        exec.task_info.main_case_id = "does_not_exist".to_string();
        let errors = validate_exec(&exec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownMainCase(id) if id == "does_not_exist")));
    }

    #[test]
    fn unknown_step_reference_is_reported() {
        let mut exec = base_exec();
        exec.case_list[0].children.push("ghost".to_string());
        let errors = validate_exec(&exec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownStepReference { step_id, .. } if step_id == "ghost")));
    }

    #[test]
    fn empty_case_list_is_reported() {
        let mut exec = base_exec();
        exec.case_list.clear();
        let errors = validate_exec(&exec).unwrap_err();
        assert_eq!(errors, vec![ValidationError::EmptyCaseList]);
    }

    #[test]
    fn empty_case_children_is_reported() {
        let mut exec = base_exec();
        exec.case_list[0].children.clear();
        let errors = validate_exec(&exec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::EmptyCase(id) if id == "case_a")));
    }

    #[test]
    fn nested_case_step_unknown_reference_is_reported() {
        let mut exec = base_exec();
        exec.case_list[0].children.push("s2".to_string());
        exec.step_mapping.0.get_mut("case_a").unwrap().insert(
            "s2".to_string(),
            Step::Case(CaseStep { common: StepCommon { id: "s2".to_string(), ..Default::default() }, case_id: "ghost_case".to_string(), error_strategy: ErrorStrategy::Raise }),
        );
        let errors = validate_exec(&exec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownCaseReference { referenced_case_id, .. } if referenced_case_id == "ghost_case")));
    }

    #[test]
    fn dataset_reference_must_resolve() {
        let mut exec = base_exec();
        exec.case_list[0].dataset = Some(DatasetRef { dataset_id: "ds1".to_string(), env: "e".to_string() });
        let errors = validate_exec(&exec).unwrap_err();
        assert!(errors.iter().any(|e| matches!(e, ValidationError::UnknownDatasetReference { dataset_id, .. } if dataset_id == "ds1")));

        exec.global_cache.origin_dataset_mapping.insert(
            "ds1".to_string(),
            vec![DatasetEnvEntry { env: "e".to_string(), depend: false, is_default: true, data: vec![] }],
        );
        assert!(validate_exec(&exec).is_ok());
    }
}
