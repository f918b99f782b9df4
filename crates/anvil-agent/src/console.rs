use crate::config::ConsoleDialect;

/// What an output line means for the lifecycle and the player roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleSignal {
    Ready,
    PlayerJoined(String),
    PlayerLeft(String),
    SaveConfirmed,
}

/// Message part of a console line, without the usual `[time] [thread/LEVEL]:` prefix.
fn message_part(line: &str) -> &str {
    match line.rfind("]: ") {
        Some(i) => &line[i + 3..],
        None => line,
    }
    .trim()
}

fn player_with_suffix(msg: &str, suffix: Option<&str>) -> Option<String> {
    let suffix = suffix.filter(|s| !s.is_empty())?;
    let name = msg.strip_suffix(suffix)?.trim();
    // Player names are a single token; anything else is chat or a plugin message.
    if name.is_empty() || name.contains(char::is_whitespace) || name.starts_with('<') {
        return None;
    }
    Some(name.to_string())
}

impl ConsoleDialect {
    pub fn classify(&self, line: &str) -> Option<ConsoleSignal> {
        let msg = message_part(line);

        if let Some(name) = player_with_suffix(msg, self.join_suffix.as_deref()) {
            return Some(ConsoleSignal::PlayerJoined(name));
        }
        if let Some(name) = player_with_suffix(msg, self.leave_suffix.as_deref()) {
            return Some(ConsoleSignal::PlayerLeft(name));
        }
        if let Some(marker) = self.ready_marker.as_deref().filter(|m| !m.is_empty())
            && line.contains(marker)
        {
            return Some(ConsoleSignal::Ready);
        }
        let lower = msg.to_ascii_lowercase();
        if self
            .save_keywords
            .iter()
            .any(|k| !k.is_empty() && lower.contains(k.as_str()))
        {
            return Some(ConsoleSignal::SaveConfirmed);
        }
        None
    }

    pub fn supports_save_suspend(&self) -> bool {
        self.save_off_command.is_some() && self.save_on_command.is_some()
    }

    pub fn is_stop_command(&self, command: &str) -> bool {
        self.stop_command
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(command.trim()))
    }
}

/// Fill `{player}` into a command template.
pub fn player_command(template: Option<&str>, player: &str) -> Option<String> {
    template.map(|t| t.replace("{player}", player))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_vanilla_lines() {
        let d = ConsoleDialect::default();
        assert_eq!(
            d.classify("[12:00:01] [Server thread/INFO]: Done (3.2s)! For help, type \"help\""),
            Some(ConsoleSignal::Ready)
        );
        assert_eq!(
            d.classify("[12:00:02] [Server thread/INFO]: Steve joined the game"),
            Some(ConsoleSignal::PlayerJoined("Steve".to_string()))
        );
        assert_eq!(
            d.classify("[12:00:03] [Server thread/INFO]: Steve left the game"),
            Some(ConsoleSignal::PlayerLeft("Steve".to_string()))
        );
        assert_eq!(
            d.classify("[12:00:04] [Server thread/INFO]: Saved the game"),
            Some(ConsoleSignal::SaveConfirmed)
        );
    }

    #[test]
    fn chat_does_not_spoof_joins() {
        let d = ConsoleDialect::default();
        assert_eq!(
            d.classify("[12:00:02] [Server thread/INFO]: <Alex> Bob joined the game"),
            None
        );
        assert_eq!(d.classify("two words joined the game"), None);
    }

    #[test]
    fn empty_dialect_classifies_nothing() {
        let d = ConsoleDialect {
            ready_marker: None,
            join_suffix: None,
            leave_suffix: None,
            stop_command: None,
            save_off_command: None,
            save_all_command: None,
            save_on_command: None,
            save_keywords: Vec::new(),
            op_command: None,
            deop_command: None,
            ban_command: None,
            pardon_command: None,
            world_marker: None,
        };
        assert_eq!(d.classify("Done (1s)! Steve joined the game"), None);
        assert!(!d.supports_save_suspend());
        assert!(!d.is_stop_command("stop"));
    }

    #[test]
    fn stop_command_match_is_case_insensitive() {
        let d = ConsoleDialect::default();
        assert!(d.is_stop_command(" STOP "));
        assert!(!d.is_stop_command("stop now"));
    }

    #[test]
    fn fills_player_templates() {
        assert_eq!(
            player_command(Some("ban {player}"), "Steve").as_deref(),
            Some("ban Steve")
        );
        assert_eq!(player_command(None, "Steve"), None);
    }
}
