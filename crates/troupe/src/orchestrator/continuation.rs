//! Until-done continuation: completion heuristic and per-session loop state.
//!
//! After a turn completes with until-done mode active, the orchestrator asks
//! a [`CompletionHeuristic`] whether the task looks finished. The heuristic
//! is inherently approximate, so it lives behind a named trait rather than
//! inside the control flow; [`SignalHeuristic`] is the production strategy.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use troupe_protocol::worker::Usage;

/// Fixed prompt used to re-invoke an unfinished session.
pub const CONTINUATION_PROMPT: &str =
    "Continue working on the task until it is fully complete. Pick up where you left off.";

/// One item from the worker's structured todo-list tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub content: String,
    /// "pending", "in_progress", or "completed".
    pub status: String,
}

impl TodoItem {
    pub fn is_completed(&self) -> bool {
        self.status == "completed"
    }
}

/// Everything the heuristic gets to look at for one finished turn.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Final assistant content, flattened to text.
    pub text: String,
    /// The most recent structured todo list observed during the turn.
    pub todos: Option<Vec<TodoItem>>,
}

/// Heuristic verdict over a finished turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Complete { reason: String },
    Incomplete { reason: String },
}

impl Verdict {
    pub fn is_complete(&self) -> bool {
        matches!(self, Verdict::Complete { .. })
    }
}

/// Pluggable completion check.
pub trait CompletionHeuristic: Send + Sync {
    fn evaluate(&self, outcome: &TurnOutcome) -> Verdict;
}

/// Ordered keyword/regex completion heuristic.
///
/// Evaluation order:
/// 1. explicit completion signals: first match short-circuits to complete,
///    even when incompleteness phrases are also present
/// 2. incompleteness signals over the text
/// 3. independently, the most recent todo list: any non-completed item is
///    incomplete, citing the count
/// 4. default: complete. Absence of evidence of incompleteness is treated
///    as completion
pub struct SignalHeuristic {
    completion_signals: Vec<&'static str>,
    incomplete_signals: Vec<&'static str>,
    unchecked_marker: Regex,
}

impl Default for SignalHeuristic {
    fn default() -> Self {
        Self {
            completion_signals: vec![
                "all done",
                "task is complete",
                "task complete",
                "everything is complete",
                "implementation is complete",
                "work is complete",
                "successfully completed",
                "all tests pass",
                "nothing left to do",
            ],
            incomplete_signals: vec![
                "still need to",
                "still needs",
                "in progress",
                "todo:",
                "not yet implemented",
                "remaining work",
                "next steps",
                "next i will",
                "next, i will",
                "unfinished",
                "partially implemented",
            ],
            unchecked_marker: Regex::new(r"(?m)^\s*[-*]\s\[\s\]").expect("static regex"),
        }
    }
}

impl SignalHeuristic {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CompletionHeuristic for SignalHeuristic {
    fn evaluate(&self, outcome: &TurnOutcome) -> Verdict {
        let text = outcome.text.to_lowercase();

        for signal in &self.completion_signals {
            if text.contains(signal) {
                return Verdict::Complete {
                    reason: format!("explicit completion signal: \"{}\"", signal),
                };
            }
        }

        if self.unchecked_marker.is_match(&outcome.text) {
            return Verdict::Incomplete {
                reason: "unchecked checklist items remain".to_string(),
            };
        }
        for signal in &self.incomplete_signals {
            if text.contains(signal) {
                return Verdict::Incomplete {
                    reason: format!("incompleteness signal: \"{}\"", signal),
                };
            }
        }

        if let Some(ref todos) = outcome.todos {
            let open = todos.iter().filter(|t| !t.is_completed()).count();
            if open > 0 {
                return Verdict::Incomplete {
                    reason: format!("{} todo item(s) not completed", open),
                };
            }
        }

        Verdict::Complete {
            reason: "no incompleteness signals".to_string(),
        }
    }
}

// ============================================================================
// Loop state
// ============================================================================

/// Per-session state while until-done mode is active. Created when the mode
/// is turned on; destroyed when the task is judged complete or the iteration
/// cap is reached.
#[derive(Debug, Clone)]
pub struct ContinuationState {
    /// Continuations performed so far.
    pub iteration: u32,
    pub max_iterations: u32,
    /// The prompt that started the loop.
    pub original_prompt: String,
    /// Usage accumulated across all iterations of the loop.
    pub usage: Usage,
    /// Most recent todo list seen in this session's assistant output.
    pub latest_todos: Option<Vec<TodoItem>>,
}

impl ContinuationState {
    pub fn new(original_prompt: String, max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            original_prompt,
            usage: Usage::default(),
            latest_todos: None,
        }
    }

    pub fn at_cap(&self) -> bool {
        self.iteration >= self.max_iterations
    }
}

/// Pull a todo list out of assistant content, if the content contains a
/// todo-list tool call. The last matching call in the block wins.
pub fn extract_todos(content: &Value) -> Option<Vec<TodoItem>> {
    let blocks = content.as_array()?;
    let mut found = None;
    for block in blocks {
        if block.get("type").and_then(Value::as_str) != Some("tool_use") {
            continue;
        }
        let name = block.get("name").and_then(Value::as_str).unwrap_or("");
        if !name.to_lowercase().contains("todo") {
            continue;
        }
        let todos = block
            .get("input")
            .and_then(|input| input.get("todos"))
            .and_then(|todos| serde_json::from_value::<Vec<TodoItem>>(todos.clone()).ok());
        if todos.is_some() {
            found = todos;
        }
    }
    found
}

/// Flatten assistant content (a string, or an array of content blocks) to
/// plain text for the heuristic.
pub fn flatten_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| {
                block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(text: &str, todos: Option<Vec<TodoItem>>) -> Verdict {
        SignalHeuristic::new().evaluate(&TurnOutcome {
            text: text.to_string(),
            todos,
        })
    }

    #[test]
    fn test_explicit_completion_wins_over_incompleteness() {
        // "all done" short-circuits even though "TODO:" is also present.
        let v = verdict("All done! TODO: maybe clean up later.", None);
        assert!(v.is_complete());
    }

    #[test]
    fn test_incompleteness_phrase() {
        let v = verdict("I still need to wire up the error path.", None);
        assert_eq!(
            v,
            Verdict::Incomplete {
                reason: "incompleteness signal: \"still need to\"".to_string()
            }
        );
    }

    #[test]
    fn test_unchecked_checklist_marker() {
        let v = verdict("Progress:\n- [x] parser\n- [ ] codegen\n", None);
        assert!(!v.is_complete());
    }

    #[test]
    fn test_open_todos_cite_count() {
        let todos = vec![
            TodoItem {
                content: "parser".to_string(),
                status: "completed".to_string(),
            },
            TodoItem {
                content: "codegen".to_string(),
                status: "in_progress".to_string(),
            },
            TodoItem {
                content: "tests".to_string(),
                status: "pending".to_string(),
            },
        ];
        match verdict("Making progress.", Some(todos)) {
            Verdict::Incomplete { reason } => assert_eq!(reason, "2 todo item(s) not completed"),
            v => panic!("expected incomplete, got {:?}", v),
        }
    }

    #[test]
    fn test_defaults_to_complete() {
        let v = verdict("Refactored the module as requested.", None);
        assert!(v.is_complete());
    }

    #[test]
    fn test_all_todos_completed_is_complete() {
        let todos = vec![TodoItem {
            content: "parser".to_string(),
            status: "completed".to_string(),
        }];
        assert!(verdict("Wrapped up.", Some(todos)).is_complete());
    }

    #[test]
    fn test_extract_todos_takes_last_tool_call() {
        let content = serde_json::json!([
            {"type": "text", "text": "working"},
            {"type": "tool_use", "name": "todo_write", "input": {"todos": [
                {"content": "a", "status": "pending"}
            ]}},
            {"type": "tool_use", "name": "todo_write", "input": {"todos": [
                {"content": "a", "status": "completed"},
                {"content": "b", "status": "pending"}
            ]}}
        ]);

        let todos = extract_todos(&content).unwrap();
        assert_eq!(todos.len(), 2);
        assert!(todos[0].is_completed());
    }

    #[test]
    fn test_flatten_text_handles_blocks_and_strings() {
        assert_eq!(flatten_text(&serde_json::json!("plain")), "plain");
        let blocks = serde_json::json!([
            {"type": "text", "text": "one"},
            {"type": "tool_use", "name": "bash", "input": {}},
            {"type": "text", "text": "two"}
        ]);
        assert_eq!(flatten_text(&blocks), "one\ntwo");
    }

    #[test]
    fn test_continuation_state_cap() {
        let mut state = ContinuationState::new("do it".to_string(), 2);
        assert!(!state.at_cap());
        state.iteration = 2;
        assert!(state.at_cap());
    }
}
