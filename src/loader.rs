//! Agenda/Depend document shapes and their validation into `Graph` inputs
//! (spec §4.7, §6). YAML parsing itself is out of scope — this module only
//! defines the `serde` shapes and the validation/normalization logic.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::LoadError;
use crate::graph::{NormalizedAgenda, NormalizedDepend};
use crate::model::{Procedure, Stage, Task, Word};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgendaDoc {
    #[serde(default)]
    pub procs: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub stages: Vec<Vec<String>>,
    #[serde(default)]
    pub tasks: Vec<TaskDoc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDoc {
    pub desc: String,
    pub proc: String,
    #[serde(default)]
    pub args: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

/// Top-level mapping from file path to the list of files it depends on.
/// Missing entirely is treated as empty (spec §6).
#[derive(Debug, Deserialize, Default)]
pub struct DependDoc(pub HashMap<String, Vec<String>>);

pub struct AgendaLoader;

impl AgendaLoader {
    /// Validate and normalize a parsed agenda document into `Graph`
    /// inputs. All-or-nothing: the first violation aborts loading.
    pub fn normalize(doc: AgendaDoc) -> Result<NormalizedAgenda, LoadError> {
        let procedures = Self::build_procedures(&doc.procs)?;
        let stages = Self::build_stages(&doc.stages, &procedures)?;

        let mut tasks = Vec::with_capacity(doc.tasks.len());
        let mut seen_outputs: HashMap<PathBuf, usize> = HashMap::new();

        for (idx, task_doc) in doc.tasks.into_iter().enumerate() {
            let procedure = procedures.get(&task_doc.proc).ok_or_else(|| {
                LoadError::UnknownProcedure {
                    task_id: task_doc.desc.clone(),
                    proc: task_doc.proc.clone(),
                }
            })?;

            Self::validate_params(&task_doc, procedure)?;

            let stage = stages
                .iter()
                .find(|s| s.procedures.contains(&task_doc.proc))
                .map(|s| s.index)
                .ok_or_else(|| LoadError::UnassignedStage {
                    task_id: task_doc.desc.clone(),
                    proc: task_doc.proc.clone(),
                })?;

            let mut args: Vec<(String, Vec<String>)> = task_doc.args.into_iter().collect();
            args.sort_by(|a, b| a.0.cmp(&b.0));

            let outputs: Vec<PathBuf> = task_doc.outputs.iter().map(PathBuf::from).collect();
            for out in &outputs {
                if let Some(&prev_idx) = seen_outputs.get(out) {
                    return Err(LoadError::DuplicateOutput {
                        path: out.clone(),
                        first_task: format!("task#{prev_idx}"),
                        second_task: format!("task#{idx}"),
                    });
                }
                seen_outputs.insert(out.clone(), idx);
            }

            let mut task = Task {
                task_id: String::new(),
                description: task_doc.desc,
                procedure: task_doc.proc,
                args,
                inputs: task_doc.inputs.iter().map(PathBuf::from).collect(),
                outputs,
                stage,
            };
            task.task_id = task.identity_key();
            tasks.push(task);
        }

        Ok(NormalizedAgenda { tasks })
    }

    fn build_procedures(
        procs: &HashMap<String, Vec<String>>,
    ) -> Result<HashMap<String, Procedure>, LoadError> {
        let mut out = HashMap::with_capacity(procs.len());
        for (name, words) in procs {
            if words.is_empty() {
                return Err(LoadError::EmptyCommand { proc: name.clone() });
            }
            out.insert(
                name.clone(),
                Procedure {
                    name: name.clone(),
                    words: words.iter().map(|w| Word::parse(w)).collect(),
                },
            );
        }
        Ok(out)
    }

    fn build_stages(
        stages: &[Vec<String>],
        procedures: &HashMap<String, Procedure>,
    ) -> Result<Vec<Stage>, LoadError> {
        let mut out = Vec::with_capacity(stages.len());
        for (index, procs) in stages.iter().enumerate() {
            for proc in procs {
                if !procedures.contains_key(proc) {
                    return Err(LoadError::UnknownStageProcedure {
                        stage: index,
                        proc: proc.clone(),
                    });
                }
            }
            out.push(Stage {
                index,
                procedures: procs.clone(),
            });
        }
        Ok(out)
    }

    fn validate_params(task_doc: &TaskDoc, procedure: &Procedure) -> Result<(), LoadError> {
        let referenced = procedure.referenced_params();
        for param in &referenced {
            if !task_doc.args.contains_key(*param) {
                return Err(LoadError::UnboundParameter {
                    task_id: task_doc.desc.clone(),
                    proc: procedure.name.clone(),
                    param: param.to_string(),
                });
            }
        }
        for arg_name in task_doc.args.keys() {
            if !referenced.contains(&arg_name.as_str()) {
                return Err(LoadError::UnusedArg {
                    task_id: task_doc.desc.clone(),
                    proc: procedure.name.clone(),
                    param: arg_name.clone(),
                });
            }
        }
        Ok(())
    }
}

pub struct DependLoader;

impl DependLoader {
    pub fn normalize(doc: Option<DependDoc>) -> Result<NormalizedDepend, LoadError> {
        let mut edges = HashMap::new();
        if let Some(doc) = doc {
            for (from, tos) in doc.0 {
                let from_path = PathBuf::from(&from);
                for to in tos {
                    if to == from {
                        return Err(LoadError::SelfLoop { path: from_path.clone() });
                    }
                }
                edges.insert(from_path, tos.into_iter().map(PathBuf::from).collect());
            }
        }
        Ok(NormalizedDepend { edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> AgendaDoc {
        serde_yaml::from_str(
            r#"
procs:
  cc: ["gcc", "$flags", "-o", "$out", "$srcs"]
stages:
  - [cc]
tasks:
  - desc: "compile a"
    proc: cc
    args:
      flags: ["-O2"]
      out: ["a.o"]
      srcs: ["a.c"]
    inputs: ["a.c"]
    outputs: ["a.o"]
"#,
        )
        .unwrap()
    }

    #[test]
    fn normalizes_a_well_formed_agenda() {
        let normalized = AgendaLoader::normalize(sample_doc()).unwrap();
        assert_eq!(normalized.tasks.len(), 1);
        assert_eq!(normalized.tasks[0].stage, 0);
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let err = serde_yaml::from_str::<AgendaDoc>("bogus: 1\n").unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn unbound_parameter_is_load_error() {
        let mut doc = sample_doc();
        doc.tasks[0].args.remove("flags");
        let err = AgendaLoader::normalize(doc).unwrap_err();
        assert!(matches!(err, LoadError::UnboundParameter { .. }));
    }

    #[test]
    fn unused_arg_is_load_error() {
        let mut doc = sample_doc();
        doc.tasks[0].args.insert("extra".to_string(), vec!["x".to_string()]);
        let err = AgendaLoader::normalize(doc).unwrap_err();
        assert!(matches!(err, LoadError::UnusedArg { .. }));
    }

    #[test]
    fn unknown_procedure_is_load_error() {
        let mut doc = sample_doc();
        doc.tasks[0].proc = "missing".to_string();
        let err = AgendaLoader::normalize(doc).unwrap_err();
        assert!(matches!(err, LoadError::UnknownProcedure { .. }));
    }

    #[test]
    fn unassigned_stage_is_load_error() {
        let mut doc = sample_doc();
        doc.stages.clear();
        let err = AgendaLoader::normalize(doc).unwrap_err();
        assert!(matches!(err, LoadError::UnassignedStage { .. }));
    }

    #[test]
    fn empty_depend_doc_normalizes_to_empty() {
        let normalized = DependLoader::normalize(None).unwrap();
        assert!(normalized.edges.is_empty());
    }

    #[test]
    fn depend_self_loop_is_load_error() {
        let mut map = HashMap::new();
        map.insert("a.c".to_string(), vec!["a.c".to_string()]);
        let err = DependLoader::normalize(Some(DependDoc(map))).unwrap_err();
        assert!(matches!(err, LoadError::SelfLoop { .. }));
    }
}
