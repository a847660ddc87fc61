//! Command classification for channel text. Pure: no state, no I/O.
//! Triggers are tried in a fixed order (help, end session, persona) and the first match wins;
//! anything else is plain chat and is forwarded unmodified.

use std::sync::LazyLock;

use regex::Regex;

/// What a message asks the bot to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    EndSession,
    /// Persona body after the trigger, trimmed. May be empty.
    SetPersona(String),
    PlainChat(String),
}

#[derive(Debug, Clone, Copy)]
enum TriggerKind {
    Help,
    EndSession,
    SetPersona,
}

struct Trigger {
    kind: TriggerKind,
    pattern: Regex,
}

/// Evaluation order is the precedence order.
static TRIGGERS: LazyLock<Vec<Trigger>> = LazyLock::new(|| {
    let table: [(TriggerKind, &str); 3] = [
        // prefix only, so "can you help me" stays chat
        (TriggerKind::Help, r"(?i)^(?:/?help|帮助)"),
        (TriggerKind::EndSession, r"重置对话|结束对话"),
        (TriggerKind::SetPersona, r"(?s)调教\s*(.*)$"),
    ];
    table
        .into_iter()
        .map(|(kind, pattern)| Trigger {
            kind,
            pattern: Regex::new(pattern).expect("static trigger pattern"),
        })
        .collect()
});

/// Classify message text. Surrounding whitespace is ignored.
pub fn classify(text: &str) -> Command {
    let text = text.trim();
    for trigger in TRIGGERS.iter() {
        let Some(caps) = trigger.pattern.captures(text) else {
            continue;
        };
        return match trigger.kind {
            TriggerKind::Help => Command::Help,
            TriggerKind::EndSession => Command::EndSession,
            TriggerKind::SetPersona => {
                let body = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
                Command::SetPersona(body.to_string())
            }
        };
    }
    Command::PlainChat(text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn help_triggers_match_as_prefix() {
        assert_eq!(classify("帮助"), Command::Help);
        assert_eq!(classify("  help me please"), Command::Help);
        assert_eq!(classify("/HELP"), Command::Help);
        assert_eq!(
            classify("can you help me"),
            Command::PlainChat("can you help me".into())
        );
    }

    #[test]
    fn end_session_matches_anywhere_in_text() {
        assert_eq!(classify("重置对话"), Command::EndSession);
        assert_eq!(classify("麻烦重置对话吧"), Command::EndSession);
        assert_eq!(classify("结束对话 谢谢"), Command::EndSession);
    }

    #[test]
    fn persona_body_is_the_trimmed_remainder() {
        assert_eq!(
            classify("调教  你是一只猫娘 "),
            Command::SetPersona("你是一只猫娘".into())
        );
        assert_eq!(
            classify("调教你是\n多行的人设"),
            Command::SetPersona("你是\n多行的人设".into())
        );
    }

    #[test]
    fn persona_with_empty_body_is_still_a_persona_command() {
        assert_eq!(classify("调教"), Command::SetPersona(String::new()));
        assert_eq!(classify("调教   "), Command::SetPersona(String::new()));
    }

    #[test]
    fn precedence_is_help_then_end_then_persona() {
        assert_eq!(classify("帮助 重置对话 调教 x"), Command::Help);
        assert_eq!(classify("调教 重置对话"), Command::EndSession);
        assert_eq!(classify("重置对话 调教 猫娘"), Command::EndSession);
    }

    #[test]
    fn plain_chat_is_forwarded_trimmed_but_otherwise_unmodified() {
        assert_eq!(
            classify("  今天天气怎么样？ "),
            Command::PlainChat("今天天气怎么样？".into())
        );
    }
}
