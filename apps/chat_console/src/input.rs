use chrono::Local;
use shared::{
    domain::{MessageKind, UserId},
    protocol::ChatMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Text(String),
    Read,
    Diag,
    Health,
    Quit,
    Unknown(String),
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Text(line.to_string());
        };
        match command.split_whitespace().next().unwrap_or_default() {
            "read" => Self::Read,
            "diag" => Self::Diag,
            "health" => Self::Health,
            "quit" | "exit" => Self::Quit,
            other => Self::Unknown(other.to_string()),
        }
    }
}

pub fn format_message(message: &ChatMessage, me: &UserId) -> String {
    let who = if &message.sender_id == me {
        "you".to_string()
    } else {
        message
            .sender_name
            .clone()
            .unwrap_or_else(|| message.sender_id.to_string())
    };
    let body = match message.kind {
        MessageKind::Text => message.content.clone(),
        MessageKind::Image => format!(
            "[image] {}",
            message.attachment_url.as_deref().unwrap_or("(missing)")
        ),
        MessageKind::BudgetProposal => match &message.budget {
            Some(budget) => format!(
                "[budget] {:.2}-{:.2} {}",
                budget.amount_min, budget.amount_max, budget.currency
            ),
            None => "[budget]".to_string(),
        },
    };
    let context = message
        .job_context
        .as_deref()
        .filter(|context| !context.is_empty())
        .map(|context| format!(" ({context})"))
        .unwrap_or_default();
    format!(
        "[{}] {who}{context}: {body}",
        message.created_at.with_timezone(&Local).format("%H:%M")
    )
}

#[cfg(test)]
#[path = "tests/input_tests.rs"]
mod tests;
