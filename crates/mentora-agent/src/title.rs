use anyhow::{anyhow, Result};

use mentora_provider::{ChatMessage, ChatProvider, ChatRequest};

pub const TITLE_MAX_CHARS: usize = 16;

/// Ask the chat model for a short conversation title. Callers swallow
/// failures; the title stays null and can be regenerated on demand.
pub async fn generate_title(
    chat: &dyn ChatProvider,
    model: &str,
    user_query: &str,
    assistant_answer: &str,
) -> Result<String> {
    let prompt = format!(
        "Summarize this exchange as a conversation title of at most {TITLE_MAX_CHARS} characters. \
         Reply with the title only, no quotes.\n\nUser: {user_query}\nAssistant: {assistant_answer}"
    );
    let request = ChatRequest::new(model, vec![ChatMessage::user(prompt)]);
    let response = chat.chat(request).await?;

    let title = clamp_title(&response.content);
    if title.is_empty() {
        return Err(anyhow!("model returned an empty title"));
    }
    Ok(title)
}

/// First line, trimmed of surrounding quotes, clamped to the character
/// budget.
pub fn clamp_title(raw: &str) -> String {
    let line = raw.lines().next().unwrap_or("").trim();
    let line = line.trim_matches(|c| c == '"' || c == '\'' || c == '“' || c == '”').trim();
    line.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mentora_provider::StubChat;

    #[test]
    fn clamp_respects_char_budget() {
        let long = "A very long conversation title that keeps going";
        assert_eq!(clamp_title(long).chars().count(), TITLE_MAX_CHARS);
        assert_eq!(clamp_title("short"), "short");
    }

    #[test]
    fn clamp_strips_quotes_and_extra_lines() {
        assert_eq!(clamp_title("\"Greetings\"\nsecond line"), "Greetings");
        assert_eq!(clamp_title("“你好总结”"), "你好总结");
    }

    #[test]
    fn clamp_counts_chars_not_bytes() {
        let cjk = "知识库问答会话标题生成测试超过限制";
        let clamped = clamp_title(cjk);
        assert_eq!(clamped.chars().count(), TITLE_MAX_CHARS);
    }

    #[tokio::test]
    async fn generates_from_stub() {
        let chat = StubChat::new("Title:");
        let title = generate_title(&chat, "m", "hello", "hi").await.unwrap();
        assert!(!title.is_empty());
        assert!(title.chars().count() <= TITLE_MAX_CHARS);
    }
}
