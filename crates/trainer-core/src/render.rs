//! Payload rendering for reminder and report messages.
//!
//! Report content is owned by the reporting layer; [`DefaultRenderer`] only
//! provides the plain texts the bot ships with.

use crate::types::{TimeOfDay, WeeklyConfigEntry};

pub const DEFAULT_SESSION_TYPE: &str = "Training";
pub const DEFAULT_LOCATION: &str = "Training area";

/// Everything a renderer needs to produce one reminder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderContext<'a> {
    pub session_type: &'a str,
    pub location: &'a str,
    pub session_time: TimeOfDay,
}

impl<'a> ReminderContext<'a> {
    pub fn from_entry(entry: &'a WeeklyConfigEntry) -> Self {
        Self {
            session_type: entry.session_type.as_deref().unwrap_or(DEFAULT_SESSION_TYPE),
            location: entry.location.as_deref().unwrap_or(DEFAULT_LOCATION),
            session_time: entry.time_of_day,
        }
    }
}

pub trait PayloadRenderer: Send + Sync {
    /// HTML body of a session reminder.
    fn reminder(&self, ctx: &ReminderContext<'_>) -> String;

    /// Body of the trainer's weekly broadcast.
    fn weekly_report(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRenderer;

impl PayloadRenderer for DefaultRenderer {
    fn reminder(&self, ctx: &ReminderContext<'_>) -> String {
        let emoji = session_emoji(ctx.session_type);
        let lines = [
            format!("{emoji} <b>Time to train!</b>"),
            String::new(),
            format!(
                "📅 <b>{}</b> • 📍 <b>{}</b>",
                ctx.session_time,
                escape_html(ctx.location)
            ),
            format!("💪 <b>Session:</b> {}", escape_html(ctx.session_type)),
            String::new(),
            "🔥 <b>Before you start:</b>".to_string(),
            "   • Arrive 5 min early".to_string(),
            "   • Warm up: 5 min on the treadmill".to_string(),
            "   • See you at the usual spot".to_string(),
        ];
        lines.join("\n")
    }

    fn weekly_report(&self) -> String {
        "📅 New week ahead! Tell me which days and times you want to train \
         so I can set up your reminders."
            .to_string()
    }
}

fn session_emoji(session_type: &str) -> &'static str {
    match session_type {
        "Pierna" | "Legs" => "🦵",
        "Funcional" | "Functional" | "Brazo" | "Arms" | "Pecho" | "Chest" => "💪",
        "Espalda" | "Back" => "🔙",
        "Hombros" | "Shoulders" => "🔺",
        "Técnica" | "Technique" => "⚙️",
        "Pesas" | "Weights" => "🏋️",
        "Cardio" => "🏃",
        "Flexibilidad" | "Flexibility" => "🧘",
        _ => "✨",
    }
}

/// Escape the three characters Telegram's HTML parse mode treats specially.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            _ => out.push(ch),
        }
    }
    out
}
