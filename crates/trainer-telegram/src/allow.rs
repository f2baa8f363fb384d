//! Who may talk to the bot.
//!
//! Deny-by-default: with no trainer id and an empty `allow_users` list nobody
//! gets an answer. The trainer is always allowed. `"*"` opens the bot to
//! everyone; list entries may carry a leading `@`.

use trainer_core::config::TelegramConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allowlist {
    trainer_id: Option<i64>,
    users: Vec<String>,
}

impl Allowlist {
    pub fn new(trainer_id: Option<i64>, users: Vec<String>) -> Self {
        let users = users
            .into_iter()
            .map(|u| u.trim().trim_start_matches('@').to_string())
            .filter(|u| !u.is_empty())
            .collect();
        Self { trainer_id, users }
    }

    pub fn from_config(config: &TelegramConfig) -> Self {
        Self::new(config.trainer_id, config.allow_users.clone())
    }

    pub fn is_trainer(&self, user_id: i64) -> bool {
        self.trainer_id == Some(user_id)
    }

    /// Usernames compare case-sensitively, as Telegram reports them.
    pub fn permits(&self, username: Option<&str>, user_id: i64) -> bool {
        if self.is_trainer(user_id) {
            return true;
        }
        let id = user_id.to_string();
        self.users.iter().any(|entry| {
            entry == "*" || entry == &id || username.is_some_and(|name| !name.is_empty() && entry == name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_configured_denies_everyone() {
        let allow = Allowlist::default();
        assert!(!allow.permits(Some("alice"), 111));
        assert!(!allow.permits(None, 0));
    }

    #[test]
    fn trainer_is_always_allowed() {
        let allow = Allowlist::new(Some(42), vec![]);
        assert!(allow.permits(None, 42));
        assert!(allow.is_trainer(42));
        assert!(!allow.permits(Some("alice"), 111));
    }

    #[test]
    fn wildcard_opens_the_bot() {
        let allow = Allowlist::new(None, vec!["*".into()]);
        assert!(allow.permits(Some("alice"), 111));
        assert!(allow.permits(None, 999));
    }

    #[test]
    fn usernames_match_with_or_without_at() {
        let allow = Allowlist::new(None, vec!["@alice".into(), "bob".into()]);
        assert!(allow.permits(Some("alice"), 1));
        assert!(allow.permits(Some("bob"), 2));
        assert!(!allow.permits(Some("Alice"), 3));
        assert!(!allow.permits(None, 4));
    }

    #[test]
    fn numeric_ids_match() {
        let allow = Allowlist::new(None, vec!["123456789".into()]);
        assert!(allow.permits(None, 123456789));
        assert!(!allow.permits(Some("123456789x"), 1));
    }

    #[test]
    fn blank_entries_do_not_match_missing_usernames() {
        let allow = Allowlist::new(None, vec!["".into(), "@".into()]);
        assert!(!allow.permits(Some(""), 1));
        assert!(!allow.permits(None, 1));
    }
}
