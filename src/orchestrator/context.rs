//! 续写时的上下文重建

use crate::database::models::{ConversationEntry, ResponseStatus};

/// 用某个目标自己成功的历史轮次重建 prompt
///
/// 格式为交替的 `User:` / `Assistant:` 行，最后是新的 `User:` 行；
/// 该目标没有成功的历史时直接返回新消息。
pub fn reconstruct_prompt(entry: &ConversationEntry, target_key: &str, new_message: &str) -> String {
    let turns: Vec<_> = entry
        .responses_for(target_key)
        .into_iter()
        .filter(|r| r.status == ResponseStatus::Success)
        .collect();

    if turns.is_empty() {
        return new_message.to_string();
    }

    let mut lines = Vec::with_capacity(turns.len() * 2 + 1);
    for record in turns {
        lines.push(format!("User: {}", record.prompt));
        lines.push(format!("Assistant: {}", record.response));
    }
    lines.push(format!("User: {}", new_message));
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::ResponseRecord;
    use crate::llm::errors::{ErrorCode, LlmError};
    use crate::llm::model_resolver::Target;

    fn answered(entry: &ConversationEntry, target: &Target, prompt: &str, answer: &str, turn: u32) -> ResponseRecord {
        let mut record = ResponseRecord::pending(&entry.id, target, prompt, turn);
        record.complete(Some(answer.to_string()), None, None);
        record
    }

    #[test]
    fn test_only_own_successful_turns_in_order() {
        let gpt = Target::new("openai", "gpt-4o");
        let claude = Target::new("anthropic", "claude-3-5-sonnet-20241022");
        let mut entry = ConversationEntry::new("Q1", vec![gpt.clone(), claude.clone()]);

        let second = answered(&entry, &gpt, "Q2", "A2", 1);
        let first = answered(&entry, &gpt, "Q1", "A1", 0);
        let other = answered(&entry, &claude, "Q1", "CLAUDE", 0);
        let mut failed = ResponseRecord::pending(&entry.id, &gpt, "Q3", 2);
        failed.fail(&LlmError::new(ErrorCode::NetworkError, "down"));
        entry.responses = vec![second, other, first, failed];

        let prompt = reconstruct_prompt(&entry, &gpt.key(), "Q4");
        assert_eq!(prompt, "User: Q1\nAssistant: A1\nUser: Q2\nAssistant: A2\nUser: Q4");
        assert!(!prompt.contains("CLAUDE"));
    }

    #[test]
    fn test_no_history_returns_message() {
        let gpt = Target::new("openai", "gpt-4o");
        let entry = ConversationEntry::new("Q1", vec![gpt.clone()]);
        assert_eq!(reconstruct_prompt(&entry, &gpt.key(), "hello"), "hello");
    }
}
