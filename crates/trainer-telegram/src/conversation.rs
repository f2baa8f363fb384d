//! Text front end for the session configuration flow.
//!
//! Maps what the trainer types onto [`FlowInput`]s for the current state and
//! produces the prompt for the next one. The flow itself lives in
//! `trainer_core::flow`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use trainer_core::flow::{transition, FlowEffect, FlowInput, FlowState};
use trainer_core::types::WEEKDAY_NAMES;

/// Parse a weekday typed as a name prefix (`mon`, `Monday`) or 1..=7.
pub fn parse_day(text: &str) -> Option<u8> {
    let text = text.trim().to_ascii_lowercase();
    if let Ok(n) = text.parse::<u8>() {
        return (1..=7).contains(&n).then(|| n - 1);
    }
    if text.len() < 3 {
        return None;
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| text.starts_with(name))
        .and_then(|i| u8::try_from(i).ok())
}

/// Interpret a free-text reply in the context of `state`.
///
/// Returns `None` for text that means nothing in this state; the flow then
/// reprompts.
pub fn parse_input(state: &FlowState, text: &str) -> Option<FlowInput> {
    let text = text.trim();
    let lower = text.to_ascii_lowercase();
    if lower == "cancel" || lower == "/cancel" {
        return Some(FlowInput::Cancel);
    }
    match state {
        FlowState::SelectDay { .. } => parse_day(text).map(FlowInput::Day),
        FlowState::SelectSessionType { .. } => Some(FlowInput::SessionType(text.to_string())),
        FlowState::EnterTime { .. } => Some(FlowInput::Time(text.to_string())),
        FlowState::Confirm { .. } => match lower.as_str() {
            "yes" | "y" | "si" | "sí" => Some(FlowInput::Yes),
            "no" | "n" => Some(FlowInput::No),
            _ => None,
        },
        FlowState::Saved { .. } => match lower.as_str() {
            "more" | "continue" | "another" => Some(FlowInput::Continue),
            "done" | "finish" => Some(FlowInput::Finish),
            _ => None,
        },
        FlowState::SelectStudent | FlowState::Done => None,
    }
}

/// What to ask next once the flow is in `state`.
pub fn prompt(state: &FlowState) -> String {
    match state {
        FlowState::SelectStudent => "Start with /configure <student id> [chat id].".to_string(),
        FlowState::SelectDay { student } => format!(
            "Student {}: which day? (mon..sun or 1..7)",
            student.subject_id
        ),
        FlowState::SelectSessionType { .. } => "Session type? (e.g. Cardio, Strength)".to_string(),
        FlowState::EnterTime { .. } => "Session time? (HH:MM, 24h)".to_string(),
        FlowState::Confirm { draft } => format!(
            "Save {} session on {} at {}? (yes/no)",
            draft.session_type.as_deref().unwrap_or("training"),
            draft.weekday_name(),
            draft.time_of_day
        ),
        FlowState::Saved { last } => format!(
            "Saved {} at {}. Configure another day? (more/done)",
            last.weekday_name(),
            last.time_of_day
        ),
        FlowState::Done => "Configuration closed.".to_string(),
    }
}

/// In-progress configuration conversations, one per chat.
#[derive(Default)]
pub struct Conversations {
    states: Mutex<HashMap<i64, FlowState>>,
}

impl Conversations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, chat: i64) -> bool {
        self.lock().contains_key(&chat)
    }

    /// Begin (or restart) a conversation with a first input.
    pub fn start(&self, chat: i64, first: FlowInput) -> (FlowState, FlowEffect) {
        step(&mut self.lock(), chat, FlowState::SelectStudent, first)
    }

    /// Feed a text reply into the chat's conversation.
    ///
    /// Returns `None` when the chat has no conversation open. A
    /// [`FlowEffect::Save`] leaves the chat at `Confirm` until
    /// [`Conversations::commit`] records the write.
    pub fn reply(&self, chat: i64, text: &str) -> Option<(FlowState, FlowEffect)> {
        let mut states = self.lock();
        let current = states.get(&chat)?.clone();
        match parse_input(&current, text) {
            Some(input) => Some(step(&mut states, chat, current, input)),
            None => Some((current, FlowEffect::Reprompt("please answer the question above"))),
        }
    }

    /// Move the chat on to `saved` once its draft is durable.
    ///
    /// Ignored unless the chat is still confirming that same draft.
    pub fn commit(&self, chat: i64, saved: FlowState) -> bool {
        let mut states = self.lock();
        let confirming = match (states.get(&chat), &saved) {
            (Some(FlowState::Confirm { draft }), FlowState::Saved { last }) => draft == last,
            _ => false,
        };
        if confirming {
            states.insert(chat, saved);
        }
        confirming
    }

    pub fn cancel(&self, chat: i64) -> bool {
        self.lock().remove(&chat).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, FlowState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn step(
    states: &mut HashMap<i64, FlowState>,
    chat: i64,
    state: FlowState,
    input: FlowInput,
) -> (FlowState, FlowEffect) {
    let (next, effect) = transition(state, input);
    if matches!(effect, FlowEffect::Save(_)) {
        return (next, effect);
    }
    if next.is_terminal() {
        states.remove(&chat);
    } else {
        states.insert(chat, next.clone());
    }
    (next, effect)
}

#[cfg(test)]
mod tests {
    use trainer_core::flow::FlowStudent;
    use trainer_core::types::SubjectId;

    use super::*;

    fn student() -> FlowStudent {
        FlowStudent {
            subject_id: SubjectId(9),
            chat_id: 9009,
        }
    }

    #[test]
    fn days_parse_from_names_and_numbers() {
        assert_eq!(parse_day("mon"), Some(0));
        assert_eq!(parse_day("Wednesday"), Some(2));
        assert_eq!(parse_day("7"), Some(6));
        assert_eq!(parse_day("0"), None);
        assert_eq!(parse_day("8"), None);
        assert_eq!(parse_day("mo"), None);
        assert_eq!(parse_day("xyz"), None);
    }

    #[test]
    fn confirm_only_accepts_yes_or_no() {
        let state = FlowState::SelectDay { student: student() };
        assert_eq!(parse_input(&state, "fri"), Some(FlowInput::Day(4)));

        let confirm = FlowState::Confirm {
            draft: trainer_core::types::WeeklyConfigEntry {
                subject_id: SubjectId(9),
                weekday: 4,
                time_of_day: "06:00".parse().unwrap(),
                payload_kind: trainer_core::types::PayloadKind::Reminder,
                recurrence_enabled: true,
                chat_id: 9009,
                session_type: Some("Cardio".into()),
                location: None,
            },
        };
        assert_eq!(parse_input(&confirm, "YES"), Some(FlowInput::Yes));
        assert_eq!(parse_input(&confirm, "no"), Some(FlowInput::No));
        assert_eq!(parse_input(&confirm, "more"), None);
        assert!(prompt(&confirm).contains("fri"));
    }

    #[test]
    fn full_conversation_emits_one_save_and_closes() {
        let chats = Conversations::new();
        let (state, _) = chats.start(1, FlowInput::Student(student()));
        assert!(matches!(state, FlowState::SelectDay { .. }));
        assert!(chats.is_active(1));

        let mut saves = Vec::new();
        for text in ["tue", "Strength", "18:30", "yes", "done"] {
            let (next, effect) = chats.reply(1, text).unwrap();
            if let FlowEffect::Save(entry) = effect {
                saves.push(entry);
                assert!(chats.commit(1, next));
            }
        }
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].weekday, 1);
        assert_eq!(saves[0].chat_id, 9009);
        assert_eq!(saves[0].time_of_day.to_string(), "18:30");
        assert!(!chats.is_active(1));
        assert!(chats.reply(1, "tue").is_none());
    }

    #[test]
    fn gibberish_reprompts_without_moving() {
        let chats = Conversations::new();
        chats.start(2, FlowInput::Student(student()));
        let (state, effect) = chats.reply(2, "someday").unwrap();
        assert!(matches!(state, FlowState::SelectDay { .. }));
        assert!(matches!(effect, FlowEffect::Reprompt(_)));
    }

    #[test]
    fn cancel_closes_the_conversation() {
        let chats = Conversations::new();
        chats.start(3, FlowInput::Student(student()));
        let (state, effect) = chats.reply(3, "cancel").unwrap();
        assert!(state.is_terminal());
        assert_eq!(effect, FlowEffect::Closed);
        assert!(!chats.is_active(3));
    }

    #[test]
    fn failed_save_keeps_the_draft_for_a_retry() {
        let chats = Conversations::new();
        chats.start(4, FlowInput::Student(student()));
        for text in ["thu", "Cardio", "07:15"] {
            chats.reply(4, text).unwrap();
        }

        let (_, first) = chats.reply(4, "yes").unwrap();
        assert!(matches!(first, FlowEffect::Save(_)));
        // No commit: the write failed. The trainer is still confirming.
        let (_, retry) = chats.reply(4, "yes").unwrap();
        let FlowEffect::Save(entry) = retry else {
            panic!("expected a second save, got {retry:?}");
        };
        assert_eq!(entry.weekday, 3);
        assert_eq!(entry.time_of_day.to_string(), "07:15");
    }

    #[test]
    fn commit_is_ignored_once_the_conversation_moved_on() {
        let chats = Conversations::new();
        chats.start(5, FlowInput::Student(student()));
        for text in ["sat", "Yoga", "09:00"] {
            chats.reply(5, text).unwrap();
        }
        let (saved, _) = chats.reply(5, "yes").unwrap();
        assert!(chats.cancel(5));
        assert!(!chats.commit(5, saved));
        assert!(!chats.is_active(5));
    }

    #[test]
    fn concurrent_replies_each_see_the_previous_one() {
        use std::sync::Arc;

        let chats = Arc::new(Conversations::new());
        chats.start(6, FlowInput::Student(student()));
        chats.reply(6, "mon").unwrap();

        // Two answers race. Only one of them can be read as the session type;
        // the other is applied to the state the first one left behind.
        let handles: Vec<_> = ["Cardio", "06:45"]
            .into_iter()
            .map(|text| {
                let chats = Arc::clone(&chats);
                std::thread::spawn(move || chats.reply(6, text).unwrap())
            })
            .collect();
        let outcomes: Vec<(FlowState, FlowEffect)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        let took_session_type = outcomes
            .iter()
            .filter(|(s, e)| matches!(s, FlowState::EnterTime { .. }) && *e == FlowEffect::None)
            .count();
        assert_eq!(took_session_type, 1);
    }
}
