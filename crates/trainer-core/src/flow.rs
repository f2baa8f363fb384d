//! Trainer "configure a session" conversation as an explicit state machine.
//!
//! Every `(state, input)` pair has a defined outcome, and the only path that
//! produces [`FlowEffect::Save`] is `Confirm` + `Yes`. The caller turns a
//! `Save` into a write to the weekly store followed by
//! `on_weekly_entry_changed`.

use crate::types::{weekday_from_index, PayloadKind, SubjectId, TimeOfDay, WeeklyConfigEntry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowStudent {
    pub subject_id: SubjectId,
    pub chat_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowState {
    SelectStudent,
    SelectDay {
        student: FlowStudent,
    },
    SelectSessionType {
        student: FlowStudent,
        weekday: u8,
    },
    EnterTime {
        student: FlowStudent,
        weekday: u8,
        session_type: String,
    },
    /// Data collected, waiting for the trainer to confirm the save.
    Confirm {
        draft: WeeklyConfigEntry,
    },
    /// Save emitted; asking whether to configure another day.
    Saved {
        last: WeeklyConfigEntry,
    },
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowInput {
    Student(FlowStudent),
    Day(u8),
    SessionType(String),
    Time(String),
    Yes,
    No,
    Continue,
    Finish,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEffect {
    None,
    /// Persist this entry and notify the scheduler.
    Save(WeeklyConfigEntry),
    /// Input did not fit the current state; ask again.
    Reprompt(&'static str),
    Closed,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Done)
    }
}

/// Advance the conversation by one input.
pub fn transition(state: FlowState, input: FlowInput) -> (FlowState, FlowEffect) {
    use FlowInput as I;
    use FlowState as S;

    match (state, input) {
        (S::Done, _) => (S::Done, FlowEffect::Closed),
        (_, I::Cancel) => (S::Done, FlowEffect::Closed),

        (S::SelectStudent, I::Student(student)) => (S::SelectDay { student }, FlowEffect::None),
        (S::SelectStudent, _) => (S::SelectStudent, FlowEffect::Reprompt("pick a student")),

        (S::SelectDay { student }, I::Day(day)) if weekday_from_index(day).is_ok() => (
            S::SelectSessionType {
                student,
                weekday: day,
            },
            FlowEffect::None,
        ),
        (S::SelectDay { student }, _) => (
            S::SelectDay { student },
            FlowEffect::Reprompt("pick a day between Monday and Sunday"),
        ),

        (S::SelectSessionType { student, weekday }, I::SessionType(kind))
            if !kind.trim().is_empty() =>
        {
            (
                S::EnterTime {
                    student,
                    weekday,
                    session_type: kind.trim().to_string(),
                },
                FlowEffect::None,
            )
        }
        (state @ S::SelectSessionType { .. }, _) => {
            (state, FlowEffect::Reprompt("pick a session type"))
        }

        (
            S::EnterTime {
                student,
                weekday,
                session_type,
            },
            I::Time(raw),
        ) => match raw.parse::<TimeOfDay>() {
            Ok(time_of_day) => (
                S::Confirm {
                    draft: WeeklyConfigEntry {
                        subject_id: student.subject_id,
                        weekday,
                        time_of_day,
                        payload_kind: PayloadKind::Reminder,
                        recurrence_enabled: true,
                        chat_id: student.chat_id,
                        session_type: Some(session_type),
                        location: None,
                    },
                },
                FlowEffect::None,
            ),
            Err(_) => (
                S::EnterTime {
                    student,
                    weekday,
                    session_type,
                },
                FlowEffect::Reprompt("time must be HH:MM, 24h"),
            ),
        },
        (state @ S::EnterTime { .. }, _) => (state, FlowEffect::Reprompt("type a time as HH:MM")),

        (S::Confirm { draft }, I::Yes) => (
            S::Saved {
                last: draft.clone(),
            },
            FlowEffect::Save(draft),
        ),
        (S::Confirm { draft }, I::No) => (
            S::SelectDay {
                student: FlowStudent {
                    subject_id: draft.subject_id,
                    chat_id: draft.chat_id,
                },
            },
            FlowEffect::None,
        ),
        (state @ S::Confirm { .. }, _) => (state, FlowEffect::Reprompt("confirm with yes or no")),

        (S::Saved { last }, I::Continue) => (
            S::SelectDay {
                student: FlowStudent {
                    subject_id: last.subject_id,
                    chat_id: last.chat_id,
                },
            },
            FlowEffect::None,
        ),
        (S::Saved { .. }, I::Finish) => (S::Done, FlowEffect::Closed),
        (state @ S::Saved { .. }, _) => {
            (state, FlowEffect::Reprompt("continue with another day or finish"))
        }
    }
}
