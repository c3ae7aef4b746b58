use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

// --- Content blocks ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: Value, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content,
            is_error,
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: Value,
}

// --- Messages ---

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: Role, content: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content,
            metadata: None,
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentBlock::text(text)])
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// A user turn carrying tool results.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self::new(Role::User, results)
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }))
    }

    /// Concatenated text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    fn result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }
}

/// Tool calls with no matching `tool_result` anywhere in the history.
pub fn pending_tool_calls(messages: &[Message]) -> Vec<ToolCall> {
    let answered: HashSet<&str> = messages.iter().flat_map(|m| m.result_ids()).collect();
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_calls())
        .filter(|c| !answered.contains(c.id.as_str()))
        .collect()
}

/// Index of the latest safe fork point: the last user message, or the last
/// assistant message that requested no tools.
pub fn find_last_sfp(messages: &[Message]) -> Option<usize> {
    messages.iter().rposition(|m| match m.role {
        Role::User => true,
        Role::Assistant => !m.has_tool_use(),
        Role::System => false,
    })
}

/// Number of user turns, including tool-result turns.
pub fn count_user_turns(messages: &[Message]) -> u64 {
    messages.iter().filter(|m| m.role == Role::User).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_turn(ids: &[&str]) -> Message {
        Message::assistant(
            ids.iter()
                .map(|id| ContentBlock::tool_use(*id, "bash", json!({"cmd": "ls"})))
                .collect(),
        )
    }

    #[test]
    fn content_block_serde_uses_type_tag() {
        let block = ContentBlock::tool_result("t1", json!({"ok": true}), false);
        let v = serde_json::to_value(&block).unwrap();
        assert_eq!(v["type"], "tool_result");
        assert_eq!(v["tool_use_id"], "t1");

        let parsed: ContentBlock =
            serde_json::from_value(json!({"type": "tool_result", "tool_use_id": "x", "content": "r"}))
                .unwrap();
        assert!(matches!(parsed, ContentBlock::ToolResult { is_error: false, .. }));
    }

    #[test]
    fn metadata_is_omitted_when_absent() {
        let v = serde_json::to_value(Message::user_text("hi")).unwrap();
        assert!(v.get("metadata").is_none());
    }

    #[test]
    fn text_joins_text_blocks() {
        let msg = Message::assistant(vec![
            ContentBlock::text("a"),
            ContentBlock::tool_use("t", "x", json!({})),
            ContentBlock::text("b"),
        ]);
        assert_eq!(msg.text(), "ab");
        assert!(msg.has_tool_use());
        assert_eq!(msg.tool_calls().len(), 1);
    }

    #[test]
    fn pending_tool_calls_skips_answered() {
        let messages = vec![
            Message::user_text("go"),
            tool_turn(&["a", "b"]),
            Message::tool_results(vec![ContentBlock::tool_result("a", json!("done"), false)]),
        ];
        let pending = pending_tool_calls(&messages);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "b");
    }

    #[test]
    fn last_sfp_skips_tool_requesting_assistant_turns() {
        let messages = vec![Message::user_text("go"), tool_turn(&["a"])];
        assert_eq!(find_last_sfp(&messages), Some(0));

        let messages = vec![
            Message::user_text("go"),
            Message::assistant(vec![ContentBlock::text("done")]),
        ];
        assert_eq!(find_last_sfp(&messages), Some(1));
        assert_eq!(find_last_sfp(&[]), None);
    }

    #[test]
    fn count_user_turns_includes_tool_results() {
        let messages = vec![
            Message::user_text("go"),
            tool_turn(&["a"]),
            Message::tool_results(vec![ContentBlock::tool_result("a", json!(1), false)]),
        ];
        assert_eq!(count_user_turns(&messages), 2);
    }
}
