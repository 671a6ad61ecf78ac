//! Shared formatting helpers for terminal output.

use chrono::{DateTime, Utc};
use forkline_core::{ContentPart, IncompleteReason, Message, MessageStatus, Role, ThreadInfo};

/// Fixed-width role label.
pub fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "user     ",
        Role::Assistant => "assistant",
        Role::System => "system   ",
    }
}

/// Short marker for a message's lifecycle status.
pub fn status_marker(status: &MessageStatus) -> String {
    match status {
        MessageStatus::Complete => String::new(),
        MessageStatus::Running => "[running]".to_string(),
        MessageStatus::RequiresAction { reason } => format!("[requires action: {reason}]"),
        MessageStatus::Incomplete { reason } => match reason {
            IncompleteReason::Cancelled => "[cancelled]".to_string(),
            IncompleteReason::Error { message } => format!("[error: {}]", truncate_preview(message, 60)),
        },
    }
}

/// Tool call and result lines shown under a message.
pub fn tool_lines(msg: &Message) -> Vec<String> {
    msg.content
        .iter()
        .filter_map(|part| match part {
            ContentPart::ToolCall(call) => {
                let outcome = match (&call.result, call.is_error) {
                    (Some(result), true) => format!(" -> error: {result}"),
                    (Some(result), false) => format!(" -> {result}"),
                    (None, _) => " (pending)".to_string(),
                };
                Some(format!("tool {}({}){}", call.tool_name, call.arguments, outcome))
            }
            ContentPart::ToolResult {
                tool_call_id,
                result,
                is_error,
            } => Some(format!(
                "result for {}{}: {}",
                tool_call_id,
                if *is_error { " (error)" } else { "" },
                result
            )),
            ContentPart::Attachment { name, mime_type, .. } => Some(format!(
                "attachment {} ({})",
                name,
                mime_type.as_deref().unwrap_or("unknown type")
            )),
            ContentPart::Text { .. } => None,
        })
        .collect()
}

/// Single-line preview of a message's text.
pub fn preview(msg: &Message, max_chars: usize) -> String {
    let text = msg.text().replace('\n', " ");
    let clipped = truncate_preview(&text, max_chars);
    if clipped.len() < text.len() {
        format!("{clipped}...")
    } else {
        clipped.to_string()
    }
}

pub fn thread_title(info: &ThreadInfo) -> &str {
    info.title.as_deref().unwrap_or(forkline_core::DEFAULT_THREAD_TITLE)
}

/// Relative time since `ts` (e.g., "2m ago", "1h ago").
pub fn relative_time(ts: DateTime<Utc>) -> String {
    let duration = Utc::now().signed_duration_since(ts);

    if duration.num_seconds() < 0 {
        "just now".to_string()
    } else if duration.num_seconds() < 60 {
        format!("{}s ago", duration.num_seconds())
    } else if duration.num_minutes() < 60 {
        format!("{}m ago", duration.num_minutes())
    } else if duration.num_hours() < 24 {
        format!("{}h ago", duration.num_hours())
    } else if duration.num_days() < 7 {
        format!("{}d ago", duration.num_days())
    } else {
        ts.format("%b %d").to_string()
    }
}

fn truncate_preview(input: &str, max_chars: usize) -> &str {
    if input.chars().count() <= max_chars {
        return input;
    }
    input
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| &input[..idx])
        .unwrap_or(input)
}
