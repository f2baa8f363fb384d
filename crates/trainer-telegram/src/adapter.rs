//! Trainer-facing bot: long-polling dispatcher with a handful of commands.
//!
//! - `/jobs` lists scheduled jobs with their next fire time.
//! - `/status` summarises the scheduler.
//! - `/configure <student id> [chat id]` starts the session configuration
//!   conversation; saving writes the weekly store and reschedules.
//! - `/remove <student id> <day>` deletes a reminder entry and its job.
//! - `/cancel` abandons an open conversation.
//!
//! Everything is deny-by-default through [`Allowlist`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use teloxide::prelude::*;
use tracing::{error, info, warn};

use trainer_core::flow::{FlowEffect, FlowInput, FlowState, FlowStudent};
use trainer_core::types::{PayloadKind, SubjectId, WeeklyConfigEntry};
use trainer_scheduler::{Reconfigurator, ScheduledJob, SqliteWeeklyStore};

use crate::allow::Allowlist;
use crate::conversation::{parse_day, prompt, Conversations};
use crate::error::Result;
use crate::send::{split_chunks, CHUNK_MAX};

const HELP: &str = "Commands:\n\
/jobs - scheduled jobs\n\
/status - scheduler status\n\
/configure <student id> [chat id] - set up a weekly session\n\
/remove <student id> <day> - delete a weekly session\n\
/cancel - abandon the current setup";

/// State shared by every update handler.
pub struct BotState {
    allow: Allowlist,
    reconfig: Arc<Reconfigurator>,
    weekly: Arc<SqliteWeeklyStore>,
    tz: Tz,
    conversations: Conversations,
}

impl BotState {
    pub fn new(
        allow: Allowlist,
        reconfig: Arc<Reconfigurator>,
        weekly: Arc<SqliteWeeklyStore>,
        tz: Tz,
    ) -> Self {
        Self {
            allow,
            reconfig,
            weekly,
            tz,
            conversations: Conversations::new(),
        }
    }
}

pub struct TelegramAdapter {
    bot: Bot,
    state: Arc<BotState>,
}

impl TelegramAdapter {
    pub fn new(bot: Bot, state: BotState) -> Self {
        Self {
            bot,
            state: Arc::new(state),
        }
    }

    /// Drive the long-polling loop until the dispatcher is shut down.
    pub async fn run(self) {
        info!("telegram: starting long-polling dispatcher");
        let handler = Update::filter_message().endpoint(handle_message);
        Dispatcher::builder(self.bot, handler)
            .dependencies(dptree::deps![self.state])
            .default_handler(|_upd| async {})
            .build()
            .dispatch()
            .await;
        info!("telegram: dispatcher stopped");
    }
}

async fn handle_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    if from.is_bot {
        return Ok(());
    }
    let user_id = i64::try_from(from.id.0).unwrap_or(i64::MAX);
    if !state.allow.permits(from.username.as_deref(), user_id) {
        return Ok(());
    }
    let Some(text) = msg.text() else {
        return Ok(());
    };

    let chat = msg.chat.id;
    let reply = match respond(&state, chat.0, text).await {
        Ok(Some(reply)) => reply,
        Ok(None) => return Ok(()),
        Err(e) => {
            error!(chat_id = chat.0, error = %e, "telegram: command failed");
            format!("Something went wrong: {e}")
        }
    };
    for chunk in split_chunks(&reply, CHUNK_MAX) {
        if let Err(e) = bot.send_message(chat, chunk).await {
            warn!(chat_id = chat.0, error = %e, "telegram: failed to send reply");
            break;
        }
    }
    Ok(())
}

/// Produce the reply to one message, or `None` to stay silent.
async fn respond(state: &Arc<BotState>, chat: i64, text: &str) -> Result<Option<String>> {
    let text = text.trim();
    let (command, rest) = split_command(text);

    match command {
        Some("start" | "help") => Ok(Some(HELP.to_string())),
        Some("jobs") => {
            let reconfig = Arc::clone(&state.reconfig);
            let jobs = tokio::task::spawn_blocking(move || reconfig.engine().list_jobs()).await??;
            Ok(Some(format_jobs(&jobs, state.tz)))
        }
        Some("status") => {
            let reconfig = Arc::clone(&state.reconfig);
            let (running, jobs) = tokio::task::spawn_blocking(move || {
                let engine = reconfig.engine();
                engine.list_jobs().map(|jobs| (engine.is_running(), jobs))
            })
            .await??;
            Ok(Some(format_status(running, &jobs, state.tz)))
        }
        Some("configure") => Ok(Some(start_configure(state, chat, rest))),
        Some("remove") => remove_entry(state, rest).await.map(Some),
        Some("cancel") => {
            let closed = state.conversations.cancel(chat);
            Ok(Some(if closed { "Setup cancelled." } else { "Nothing to cancel." }.to_string()))
        }
        Some(_) => Ok(Some(HELP.to_string())),
        None => match state.conversations.reply(chat, text) {
            Some((next, effect)) => apply_effect(state, chat, next, effect).await.map(Some),
            None => Ok(None),
        },
    }
}

fn start_configure(state: &BotState, chat: i64, args: &str) -> String {
    let mut parts = args.split_whitespace();
    let subject = parts.next().and_then(|s| s.parse::<i64>().ok());
    let Some(subject) = subject else {
        return "Usage: /configure <student id> [chat id]".to_string();
    };
    let chat_id = parts
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(subject);
    let student = FlowStudent {
        subject_id: SubjectId(subject),
        chat_id,
    };
    let (next, _) = state.conversations.start(chat, FlowInput::Student(student));
    prompt(&next)
}

async fn apply_effect(
    state: &Arc<BotState>,
    chat: i64,
    next: FlowState,
    effect: FlowEffect,
) -> Result<String> {
    match effect {
        FlowEffect::Save(entry) => {
            let job = match save_entry(state, entry).await {
                Ok(job) => job,
                Err(e) => {
                    error!(chat_id = chat, error = %e, "telegram: could not save session");
                    return Ok(format!(
                        "Could not save that session: {e}\nReply yes to try again or no to change it."
                    ));
                }
            };
            state.conversations.commit(chat, next.clone());
            let when = job
                .and_then(|j| j.next_fire_at)
                .map(|at| format!("\nNext reminder: {}", local(at, state.tz)))
                .unwrap_or_default();
            Ok(format!("{}{when}", prompt(&next)))
        }
        FlowEffect::Reprompt(hint) => Ok(format!("Sorry, {hint}.\n{}", prompt(&next))),
        FlowEffect::None | FlowEffect::Closed => Ok(prompt(&next)),
    }
}

/// Persist the entry first, then reschedule from it.
async fn save_entry(state: &Arc<BotState>, entry: WeeklyConfigEntry) -> Result<Option<ScheduledJob>> {
    let weekly = Arc::clone(&state.weekly);
    let reconfig = Arc::clone(&state.reconfig);
    let job = tokio::task::spawn_blocking(move || {
        weekly.save(&entry)?;
        reconfig.on_weekly_entry_changed(&entry)
    })
    .await??;
    Ok(job)
}

async fn remove_entry(state: &Arc<BotState>, args: &str) -> Result<String> {
    let mut parts = args.split_whitespace();
    let subject = parts.next().and_then(|s| s.parse::<i64>().ok());
    let day = parts.next().and_then(parse_day);
    let (Some(subject), Some(day)) = (subject, day) else {
        return Ok("Usage: /remove <student id> <day>".to_string());
    };

    let weekly = Arc::clone(&state.weekly);
    let reconfig = Arc::clone(&state.reconfig);
    let subject = SubjectId(subject);
    let removed = tokio::task::spawn_blocking(move || {
        let removed = weekly.remove(subject, day, PayloadKind::Reminder)?;
        reconfig.on_weekly_entry_deleted(subject, day, PayloadKind::Reminder)?;
        Ok::<_, trainer_scheduler::SchedulerError>(removed)
    })
    .await??;

    Ok(if removed {
        format!("Removed the session of student {subject}.")
    } else {
        format!("Student {subject} has no session that day.")
    })
}

/// Split `/name@bot args` into `(Some("name"), "args")`; plain text gives `(None, text)`.
fn split_command(text: &str) -> (Option<&str>, &str) {
    let Some(body) = text.strip_prefix('/') else {
        return (None, text);
    };
    let (head, rest) = body.split_once(char::is_whitespace).unwrap_or((body, ""));
    let name = head.split('@').next().unwrap_or(head);
    (Some(name), rest.trim())
}

fn local(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format("%a %Y-%m-%d %H:%M").to_string()
}

pub fn format_jobs(jobs: &[ScheduledJob], tz: Tz) -> String {
    if jobs.is_empty() {
        return "No scheduled jobs.".to_string();
    }
    let mut out = format!("{} scheduled job(s):", jobs.len());
    for job in jobs {
        let next = job
            .next_fire_at
            .map(|at| local(at, tz))
            .unwrap_or_else(|| "never".to_string());
        out.push_str(&format!("\n{}: {} (fired {}x)", job.id, next, job.fire_count));
    }
    out
}

pub fn format_status(running: bool, jobs: &[ScheduledJob], tz: Tz) -> String {
    let next = jobs
        .iter()
        .filter_map(|j| j.next_fire_at.map(|at| (at, j.id.as_str())))
        .min();
    let mut out = format!(
        "Scheduler: {}\nJobs: {}",
        if running { "running" } else { "stopped" },
        jobs.len()
    );
    if let Some((at, id)) = next {
        out.push_str(&format!("\nNext: {id} at {}", local(at, tz)));
    }
    out
}
