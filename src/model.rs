//! Core data model: procedures, tasks, stages, and effective-command
//! substitution (spec §3).

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

/// Arena index of a task within a `Graph`. Resets across rebuilds; use
/// `Task::identity` for continuity checks that must survive a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

/// Arena index of a file node within a `Graph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u32);

/// One word in a procedure's command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Word {
    Literal(String),
    Param(String),
}

/// The marker that distinguishes a parameter reference from a literal word.
pub const PARAM_MARKER: char = '$';

impl Word {
    /// Parse a single command word, recognizing `$name` as a parameter
    /// reference and everything else as a literal.
    pub fn parse(raw: &str) -> Word {
        match raw.strip_prefix(PARAM_MARKER) {
            Some(name) if !name.is_empty() => Word::Param(name.to_string()),
            _ => Word::Literal(raw.to_string()),
        }
    }
}

/// A parameterized command template.
#[derive(Debug, Clone)]
pub struct Procedure {
    pub name: String,
    pub words: Vec<Word>,
}

impl Procedure {
    /// Every parameter name referenced anywhere in the command.
    pub fn referenced_params(&self) -> Vec<&str> {
        self.words
            .iter()
            .filter_map(|w| match w {
                Word::Param(name) => Some(name.as_str()),
                Word::Literal(_) => None,
            })
            .collect()
    }
}

/// An immutable task record (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    pub procedure: String,
    pub args: Vec<(String, Vec<String>)>,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
    pub stage: usize,
}

impl Task {
    fn arg(&self, name: &str) -> Option<&[String]> {
        self.args
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Substitute every parameter reference in `procedure`'s word list with
    /// the argument values bound for that parameter. A multi-valued
    /// parameter expands in place, producing one output word per value.
    ///
    /// Caller (the loader) must have already validated that every
    /// parameter referenced by `procedure` is bound in `self.args` and
    /// vice versa; this is an unconditional expansion, not a validator.
    pub fn effective_command(&self, procedure: &Procedure) -> Vec<String> {
        let mut out = Vec::with_capacity(procedure.words.len());
        for word in &procedure.words {
            match word {
                Word::Literal(s) => out.push(s.clone()),
                Word::Param(name) => {
                    if let Some(values) = self.arg(name) {
                        out.extend(values.iter().cloned());
                    }
                }
            }
        }
        out
    }

    /// Structural identity used by the reactor to decide whether a
    /// `Running` task survives a graph rebuild (spec §4.6): equal
    /// procedure, args, inputs, and outputs.
    pub fn identity_key(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.procedure.hash(&mut hasher);
        for (k, v) in &self.args {
            k.hash(&mut hasher);
            v.hash(&mut hasher);
        }
        for p in &self.inputs {
            p.hash(&mut hasher);
        }
        for p in &self.outputs {
            p.hash(&mut hasher);
        }
        format!("task-{:016x}", hasher.finish())
    }
}

/// A stage: an index plus the set of procedures permitted to run in it.
#[derive(Debug, Clone)]
pub struct Stage {
    pub index: usize,
    pub procedures: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_param_and_literal_words() {
        assert_eq!(Word::parse("$srcs"), Word::Param("srcs".to_string()));
        assert_eq!(Word::parse("-o"), Word::Literal("-o".to_string()));
        // A bare marker with nothing after it is not a valid reference.
        assert_eq!(Word::parse("$"), Word::Literal("$".to_string()));
    }

    fn sample_task() -> (Procedure, Task) {
        let proc = Procedure {
            name: "cc".to_string(),
            words: vec![
                Word::Literal("gcc".to_string()),
                Word::Param("flags".to_string()),
                Word::Literal("-o".to_string()),
                Word::Param("out".to_string()),
                Word::Param("srcs".to_string()),
            ],
        };
        let task = Task {
            task_id: "t1".to_string(),
            description: "compile".to_string(),
            procedure: "cc".to_string(),
            args: vec![
                ("flags".to_string(), vec!["-O2".to_string(), "-Wall".to_string()]),
                ("out".to_string(), vec!["a.o".to_string()]),
                ("srcs".to_string(), vec!["a.c".to_string(), "b.c".to_string()]),
            ],
            inputs: vec![PathBuf::from("a.c"), PathBuf::from("b.c")],
            outputs: vec![PathBuf::from("a.o")],
            stage: 0,
        };
        (proc, task)
    }

    #[test]
    fn multi_valued_params_expand_in_place() {
        let (proc, task) = sample_task();
        let cmd = task.effective_command(&proc);
        assert_eq!(
            cmd,
            vec!["gcc", "-O2", "-Wall", "-o", "a.o", "a.c", "b.c"]
        );
    }

    #[test]
    fn identity_key_is_stable_and_sensitive_to_content() {
        let (_, task) = sample_task();
        let mut other = task.clone();
        assert_eq!(task.identity_key(), other.identity_key());
        other.outputs.push(PathBuf::from("b.o"));
        assert_ne!(task.identity_key(), other.identity_key());
    }
}
