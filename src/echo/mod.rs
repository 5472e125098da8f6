//! Execution state ("Echo") and the message model.
//!
//! The Echo grows monotonically during one cascade execution. Only the
//! scheduler and the exploration controllers write to it, at merge points;
//! in-flight attempts read an `Arc<Echo>` snapshot and keep their own
//! scratch state until their result is merged.

mod artifacts;

pub use artifacts::{Artifact, ArtifactPayload, ArtifactRef, ArtifactStore, MediaKind};

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::Retention;
use crate::tools::ToolCall;

/// Who a message is from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    ToolResult,
}

/// What a message is, independent of its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Instruction,
    Prompt,
    Assistant,
    ToolResult,
    Image,
    Feedback,
    Diagnostic,
    Summary,
    State,
}

/// One append-only conversation entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ArtifactRef>,
    /// Capability calls requested by an assistant message (native protocol).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Native call id a tool result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Owning phase.
    #[serde(default)]
    pub phase: String,
    /// Attempt label of the owning attempt.
    #[serde(default)]
    pub attempt: String,
    /// Global turn ordinal the message was produced in.
    #[serde(default)]
    pub turn_seq: u64,
    #[serde(default)]
    pub is_error: bool,
}

impl Message {
    fn new(role: Role, kind: MessageKind, text: impl Into<String>) -> Self {
        Self {
            role,
            kind,
            text: text.into(),
            images: Vec::new(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            phase: String::new(),
            attempt: String::new(),
            turn_seq: 0,
            is_error: false,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, MessageKind::Instruction, text)
    }

    pub fn user(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(Role::User, kind, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, MessageKind::Assistant, text)
    }

    pub fn tool_result(text: impl Into<String>, is_error: bool) -> Self {
        let mut msg = Self::new(Role::ToolResult, MessageKind::ToolResult, text);
        msg.is_error = is_error;
        msg
    }

    pub fn image(artifact: ArtifactRef) -> Self {
        let mut msg = Self::new(
            Role::User,
            MessageKind::Image,
            format!("[image: {}]", artifact.location),
        );
        msg.images.push(artifact);
        msg
    }

    /// Stamp provenance.
    pub fn at(mut self, phase: &str, attempt: &str, turn_seq: u64) -> Self {
        self.phase = phase.to_string();
        self.attempt = attempt.to_string();
        self.turn_seq = turn_seq;
        self
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    pub fn with_tool_call_id(mut self, id: Option<String>) -> Self {
        self.tool_call_id = id;
        self
    }

    pub fn flagged_error(mut self) -> Self {
        self.is_error = true;
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Category of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Protocol,
    Validation,
    Resource,
    Tool,
    Evaluation,
    Mutation,
    Cancelled,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Validation => "validation",
            ErrorKind::Resource => "resource",
            ErrorKind::Tool => "tool",
            ErrorKind::Evaluation => "evaluation",
            ErrorKind::Mutation => "mutation",
            ErrorKind::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// A failure recorded during execution, recovered or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub phase: String,
    pub attempt: String,
    pub kind: ErrorKind,
    pub message: String,
    pub recovered: bool,
    pub timestamp: DateTime<Utc>,
}

impl ErrorRecord {
    pub fn new(phase: &str, attempt: &str, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            attempt: attempt.to_string(),
            kind,
            message: message.into(),
            recovered: true,
            timestamp: Utc::now(),
        }
    }

    pub fn unrecovered(mut self) -> Self {
        self.recovered = false;
        self
    }
}

/// What a completed phase left behind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: String,
    /// Label of the attempt whose artifacts were merged.
    pub attempt: String,
    pub output: String,
    /// Non-system messages of the merged attempt.
    pub messages: Vec<Message>,
    pub images: Vec<ArtifactRef>,
    /// State keys this phase wrote.
    pub state_keys: Vec<String>,
    pub retention: Retention,
}

impl PhaseRecord {
    pub fn new(phase: &str, attempt: &str, output: impl Into<String>) -> Self {
        Self {
            phase: phase.to_string(),
            attempt: attempt.to_string(),
            output: output.into(),
            messages: Vec::new(),
            images: Vec::new(),
            state_keys: Vec::new(),
            retention: Retention::Full,
        }
    }

    /// The message carried forward under `output_only` retention.
    pub fn final_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }
}

/// Cascade-scoped execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Echo {
    pub execution_id: String,
    pub input: Value,
    pub state: BTreeMap<String, Value>,
    phases: Vec<PhaseRecord>,
    errors: Vec<ErrorRecord>,
    turn_seq: u64,
}

impl Echo {
    pub fn new(execution_id: &str, input: Value) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            input,
            state: BTreeMap::new(),
            phases: Vec::new(),
            errors: Vec::new(),
            turn_seq: 0,
        }
    }

    /// Completed phases in execution order.
    pub fn phase_records(&self) -> &[PhaseRecord] {
        &self.phases
    }

    /// Latest record of a phase.
    pub fn record(&self, phase: &str) -> Option<&PhaseRecord> {
        self.phases.iter().rev().find(|r| r.phase == phase)
    }

    /// Final output per completed phase.
    pub fn outputs(&self) -> BTreeMap<String, String> {
        self.phases
            .iter()
            .map(|r| (r.phase.clone(), r.output.clone()))
            .collect()
    }

    /// Final output of a completed phase.
    pub fn output(&self, phase: &str) -> Option<&str> {
        self.record(phase).map(|r| r.output.as_str())
    }

    /// Every message of every merged attempt, in order.
    pub fn history(&self) -> impl Iterator<Item = &Message> {
        self.phases.iter().flat_map(|r| r.messages.iter())
    }

    pub fn errors(&self) -> &[ErrorRecord] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Global turn counter; the next turn gets `turn_seq() + 1`.
    pub fn turn_seq(&self) -> u64 {
        self.turn_seq
    }

    pub fn record_error(&mut self, error: ErrorRecord) {
        self.errors.push(error);
    }

    pub fn extend_errors(&mut self, errors: impl IntoIterator<Item = ErrorRecord>) {
        self.errors.extend(errors);
    }

    /// Merge a completed phase.
    ///
    /// `state` holds the keys the merged attempt wrote; `turn_seq` is the
    /// highest turn ordinal it reached.
    pub fn commit_phase(
        &mut self,
        mut record: PhaseRecord,
        state: BTreeMap<String, Value>,
        turn_seq: u64,
    ) {
        record.state_keys = state.keys().cloned().collect();
        self.state.extend(state);
        self.turn_seq = self.turn_seq.max(turn_seq);
        self.phases.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_commit_phase_merges_state_and_turns() {
        let mut echo = Echo::new("exec-1", json!({"q": 1}));
        let mut record = PhaseRecord::new("draft", "r0.s0.c0", "hello");
        record
            .messages
            .push(Message::assistant("hello").at("draft", "r0.s0.c0", 3));

        let mut state = BTreeMap::new();
        state.insert("title".to_string(), json!("Hi"));
        echo.commit_phase(record, state, 3);

        assert_eq!(echo.turn_seq(), 3);
        assert_eq!(echo.state["title"], json!("Hi"));
        assert_eq!(echo.output("draft"), Some("hello"));
        assert_eq!(echo.record("draft").unwrap().state_keys, vec!["title"]);
        assert_eq!(echo.history().count(), 1);
    }

    #[test]
    fn test_turn_seq_never_goes_backwards() {
        let mut echo = Echo::new("exec", json!(null));
        echo.commit_phase(PhaseRecord::new("a", "l", "x"), BTreeMap::new(), 5);
        echo.commit_phase(PhaseRecord::new("b", "l", "y"), BTreeMap::new(), 2);
        assert_eq!(echo.turn_seq(), 5);
    }

    #[test]
    fn test_final_assistant_skips_tool_results() {
        let mut record = PhaseRecord::new("a", "l", "done");
        record.messages.push(Message::user(MessageKind::Prompt, "go"));
        record.messages.push(Message::assistant("calling"));
        record.messages.push(Message::tool_result("42", false));
        record.messages.push(Message::assistant("done"));
        record.messages.push(Message::tool_result("late", false));

        assert_eq!(record.final_assistant().unwrap().text, "done");
    }

    #[test]
    fn test_errors_accumulate() {
        let mut echo = Echo::new("exec", json!(null));
        assert!(!echo.has_errors());
        echo.record_error(ErrorRecord::new("a", "l", ErrorKind::Protocol, "bad json"));
        echo.record_error(ErrorRecord::new("a", "l", ErrorKind::Transport, "503").unrecovered());
        assert_eq!(echo.errors().len(), 2);
        assert!(!echo.errors()[1].recovered);
        assert_eq!(echo.errors()[0].kind.to_string(), "protocol");
    }
}
