//! Terminal rendering of transcript messages

use crate::transcript::{truncate, Message, UserContent};

const GREY: &str = "\x1b[90m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

/// Lines to print for `message`; `None` for prompts the user typed
pub fn render(message: &Message) -> Option<String> {
    match message {
        Message::Assistant(assistant) => {
            let mut lines = Vec::new();
            let text = assistant.joined_text();
            if !text.trim().is_empty() {
                if assistant.is_api_error {
                    lines.push(format!("{}{}{}", RED, text, RESET));
                } else {
                    lines.push(text);
                }
            }
            for tool_use in &assistant.tool_uses {
                lines.push(format!(
                    "● {}({})",
                    tool_use.name,
                    truncate(&tool_use.input.to_string(), 80)
                ));
            }
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
        Message::User(user) if user.is_meta => {
            Some(format!("{}  » {}{}", GREY, truncate(&user.text(), 200), RESET))
        }
        Message::User(user) => {
            let lines: Vec<String> = user
                .content
                .iter()
                .filter_map(|c| match c {
                    UserContent::ToolResult(block) => {
                        let first = block.content.lines().next().unwrap_or("");
                        let color = if block.is_error { RED } else { GREY };
                        Some(format!("  ⎿  {}{}{}", color, truncate(first, 120), RESET))
                    }
                    UserContent::Text { .. } => None,
                })
                .collect();
            (!lines.is_empty()).then(|| lines.join("\n"))
        }
        Message::Progress(progress) => {
            Some(format!("{}  … {}{}", GREY, progress.text, RESET))
        }
    }
}

/// Grey system line
pub fn print_system(msg: &str) {
    println!("{}{}{}", GREY, msg, RESET);
}

/// Red error line
pub fn print_error(msg: &str) {
    eprintln!("{}Error: {}{}", RED, msg, RESET);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::{AssistantMessage, StopReason, ToolResultBlock, ToolUse};
    use serde_json::json;

    #[test]
    fn test_prompts_are_not_echoed() {
        assert!(render(&Message::user_text("hi")).is_none());
    }

    #[test]
    fn test_tool_calls_and_results() {
        let tool_use = ToolUse::new("Search", json!({"pattern": "fn main"}));
        let call = Message::Assistant(AssistantMessage::new(
            vec!["Looking.".to_string()],
            vec![tool_use.clone()],
            StopReason::ToolUse,
        ));
        assert_eq!(
            render(&call).unwrap(),
            "Looking.\n● Search({\"pattern\":\"fn main\"})"
        );

        let result = Message::tool_result(ToolResultBlock::error(&tool_use, "bad\nmore"));
        let shown = render(&result).unwrap();
        assert!(shown.contains("⎿"));
        assert!(shown.contains("bad"));
        assert!(!shown.contains("more"));
    }

    #[test]
    fn test_progress_is_shown() {
        let shown = render(&Message::progress(Some("toolu_1"), "retrying")).unwrap();
        assert!(shown.contains("retrying"));
    }
}
