use crate::inference::ChatMessage;

pub const MEMORY_HEADER: &str = "User memory (high priority, factual preferences only):";

/// Order: system prompt, memory note (non-blank memory only), history oldest
/// first, then the user turn.
pub fn build_messages(
    system_prompt: &str,
    memory: Option<&str>,
    history: &[ChatMessage],
    user_text: &str,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(history.len() + 3);
    if !system_prompt.is_empty() {
        out.push(ChatMessage::new("system", system_prompt));
    }
    if let Some(memory) = memory.map(str::trim).filter(|m| !m.is_empty()) {
        out.push(ChatMessage::new("system", format!("{MEMORY_HEADER}\n{memory}")));
    }
    out.extend(history.iter().cloned());
    out.push(ChatMessage::new("user", user_text));
    out
}
