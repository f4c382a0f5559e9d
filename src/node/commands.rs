//! Partyline dot-commands understood by the link core.

use super::router::ShareScope;
use crate::frame::Target;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("Usage: {0}")]
    Usage(&'static str),
}

/// A parsed partyline command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DotCommand {
    /// `.relay <target> <cmd> [args]`
    Relay {
        target: Target,
        cmd: String,
        args: String,
    },
    /// `.link <handle>`
    Link(String),
    /// `.unlink <handle>`
    Unlink(String),
    /// `.share <handle> [users|channels|all]`
    Share { handle: String, scope: ShareScope },
    /// `.bots`
    Bots,
    /// `.subnet`
    Subnet,
    /// `.botinfo [handle]`
    BotInfo(Option<String>),
    /// Anything else, run by the local executor.
    Local { cmd: String, args: String },
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim_start()),
        None => (s, ""),
    }
}

fn one_handle(rest: &str, usage: &'static str) -> Result<String, CommandError> {
    let (handle, extra) = split_word(rest);
    if handle.is_empty() || !extra.is_empty() {
        return Err(CommandError::Usage(usage));
    }
    Ok(handle.to_string())
}

/// Parse a partyline line. The leading `.` is optional.
pub fn parse(line: &str) -> Result<DotCommand, CommandError> {
    let line = line.trim();
    let line = line.strip_prefix('.').unwrap_or(line);
    let (word, rest) = split_word(line);
    if word.is_empty() {
        return Err(CommandError::Empty);
    }

    match word.to_ascii_lowercase().as_str() {
        "relay" => {
            let (target, rest) = split_word(rest);
            let (cmd, args) = split_word(rest);
            if target.is_empty() || cmd.is_empty() {
                return Err(CommandError::Usage(".relay <bot|subnet|botnet> <command> [args]"));
            }
            Ok(DotCommand::Relay {
                target: Target::from(target),
                cmd: cmd.to_string(),
                args: args.trim_end().to_string(),
            })
        }
        "link" => one_handle(rest, ".link <bot>").map(DotCommand::Link),
        "unlink" => one_handle(rest, ".unlink <bot>").map(DotCommand::Unlink),
        "share" => {
            const USAGE: &str = ".share <bot> [users|channels|all]";
            let (handle, rest) = split_word(rest);
            let scope = match rest.trim() {
                "" | "all" => ShareScope::All,
                "users" => ShareScope::Users,
                "channels" | "chans" => ShareScope::Channels,
                _ => return Err(CommandError::Usage(USAGE)),
            };
            if handle.is_empty() {
                return Err(CommandError::Usage(USAGE));
            }
            Ok(DotCommand::Share {
                handle: handle.to_string(),
                scope,
            })
        }
        "bots" => Ok(DotCommand::Bots),
        "subnet" => Ok(DotCommand::Subnet),
        "botinfo" => {
            let (handle, _) = split_word(rest);
            Ok(DotCommand::BotInfo(
                (!handle.is_empty()).then(|| handle.to_string()),
            ))
        }
        _ => Ok(DotCommand::Local {
            cmd: word.to_string(),
            args: rest.trim_end().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay() {
        assert_eq!(
            parse(".relay botnet say hi there"),
            Ok(DotCommand::Relay {
                target: Target::Botnet,
                cmd: "say".into(),
                args: "hi there".into(),
            })
        );
        assert_eq!(
            parse(".relay leaf1 rehash"),
            Ok(DotCommand::Relay {
                target: Target::Bot("leaf1".into()),
                cmd: "rehash".into(),
                args: String::new(),
            })
        );
        assert!(matches!(parse(".relay botnet"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_link_commands() {
        assert_eq!(parse(".link leaf1"), Ok(DotCommand::Link("leaf1".into())));
        assert_eq!(parse("  .UNLINK leaf1  "), Ok(DotCommand::Unlink("leaf1".into())));
        assert!(matches!(parse(".link"), Err(CommandError::Usage(_))));
        assert!(matches!(parse(".link a b"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_share_scopes() {
        assert_eq!(
            parse(".share leaf1"),
            Ok(DotCommand::Share {
                handle: "leaf1".into(),
                scope: ShareScope::All
            })
        );
        assert_eq!(
            parse(".share leaf1 users"),
            Ok(DotCommand::Share {
                handle: "leaf1".into(),
                scope: ShareScope::Users
            })
        );
        assert!(matches!(parse(".share leaf1 bans"), Err(CommandError::Usage(_))));
    }

    #[test]
    fn test_queries_and_fallthrough() {
        assert_eq!(parse(".bots"), Ok(DotCommand::Bots));
        assert_eq!(parse("subnet"), Ok(DotCommand::Subnet));
        assert_eq!(parse(".botinfo"), Ok(DotCommand::BotInfo(None)));
        assert_eq!(parse(".botinfo hub1"), Ok(DotCommand::BotInfo(Some("hub1".into()))));
        assert_eq!(
            parse(".say #chan hello"),
            Ok(DotCommand::Local {
                cmd: "say".into(),
                args: "#chan hello".into(),
            })
        );
        assert_eq!(parse("."), Err(CommandError::Empty));
        assert_eq!(parse("   "), Err(CommandError::Empty));
    }
}
