//! Conversation turns sent to the completion provider.

use serde::{Deserialize, Serialize};

/// Who authored a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message in the upstream chat request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Builds the ordered message list for one exchange: the prior assistant
/// turn (if any) first, the new user prompt last.
///
/// ```
/// use promptrelay::llm::{ConversationTurn, conversation};
///
/// let messages = conversation("next", Some("earlier answer"));
/// assert_eq!(
///     messages,
///     vec![
///         ConversationTurn::assistant("earlier answer"),
///         ConversationTurn::user("next"),
///     ]
/// );
/// ```
pub fn conversation(prompt: &str, previous_response: Option<&str>) -> Vec<ConversationTurn> {
    let mut messages = Vec::with_capacity(2);
    if let Some(previous) = previous_response {
        messages.push(ConversationTurn::assistant(previous));
    }
    messages.push(ConversationTurn::user(prompt));
    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_user_turn() {
        assert_eq!(conversation("hello", None), vec![ConversationTurn::user("hello")]);
    }

    #[test]
    fn serializes_openai_shape() {
        let json = serde_json::to_value(conversation("next", Some("earlier answer"))).unwrap();
        assert_eq!(
            json,
            serde_json::json!([
                { "role": "assistant", "content": "earlier answer" },
                { "role": "user", "content": "next" },
            ])
        );
    }
}
