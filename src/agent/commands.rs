//! Slash command handling, ahead of the LLM.
//!
//! Messages whose first token is `/<cmd>` (optionally with an `@bot`
//! suffix and trailing arguments) are normalized to the bare command.
//! `/new` clears the session's messages (metadata survives), `/help`
//! returns a static text. Unknown commands fall through to the model.

use crate::session::Session;

const HELP_TEXT: &str = "Commands:\n\
    /new  - start a fresh conversation (clears history)\n\
    /help - show this help\n\
    Anything else goes to the assistant.";

/// Normalize the first token: `/new@my_bot args` becomes `/new`. Input
/// that is not a slash command is returned unchanged.
pub fn normalize_slash_command(input: &str) -> String {
    let trimmed = input.trim();
    let Some(first) = trimmed.split_whitespace().next() else {
        return String::new();
    };
    if !first.starts_with('/') {
        return trimmed.to_string();
    }
    let cmd = first.split('@').next().unwrap_or(first);
    cmd.to_lowercase()
}

/// Handle a built-in slash command. Returns the reply when handled.
pub fn handle_slash_command(session: &Session, input: &str) -> Option<String> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    match normalize_slash_command(trimmed).as_str() {
        "/new" => {
            session.clear_messages();
            Some("Started a fresh conversation.".to_string())
        }
        "/help" => Some(HELP_TEXT.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Role;

    #[test]
    fn normalization() {
        assert_eq!(normalize_slash_command(""), "");
        assert_eq!(normalize_slash_command("/help"), "/help");
        assert_eq!(normalize_slash_command("/help please"), "/help");
        assert_eq!(normalize_slash_command("/new@my_bot"), "/new");
        assert_eq!(normalize_slash_command("/NEW"), "/new");
        assert_eq!(normalize_slash_command("hello"), "hello");
    }

    #[test]
    fn new_clears_history_but_not_metadata() {
        let session = Session::new("telegram:1");
        session.add(Role::User, "hello");
        session.add(Role::Assistant, "world");
        session.set_metadata("lang", serde_json::json!("en"));

        let reply = handle_slash_command(&session, "/new").unwrap();
        assert!(!reply.is_empty());
        assert_eq!(session.message_count(), 0);
        assert_eq!(
            session.metadata().get("lang"),
            Some(&serde_json::json!("en"))
        );
    }

    #[test]
    fn help_is_handled() {
        let session = Session::new("telegram:1");
        let reply = handle_slash_command(&session, "/help").unwrap();
        assert!(reply.contains("/new"));
    }

    #[test]
    fn unknown_commands_fall_through() {
        let session = Session::new("telegram:1");
        assert!(handle_slash_command(&session, "/unknown").is_none());
        assert!(handle_slash_command(&session, "plain text").is_none());
    }
}
