pub mod poll;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMMAND_RE: Regex =
        Regex::new(r"^\s*(list|show|vote|watch|unwatch|delete|quit|help)(?:\s+(\S+))?(?:\s+(\S+))?\s*$")
            .expect("command pattern is valid");
}

/// One console line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Show { poll_id: String },
    Vote { poll_id: String, option_id: String },
    Watch { poll_id: String },
    Unwatch { poll_id: String },
    Delete { poll_id: String },
    Help,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let caps = COMMAND_RE
            .captures(line)
            .ok_or_else(|| format!("Unrecognised command: {}", line.trim()))?;
        let verb = &caps[1];
        let first = caps.get(2).map(|m| m.as_str().to_string());
        let second = caps.get(3).map(|m| m.as_str().to_string());

        let need = |arg: Option<String>, what: &str| {
            arg.ok_or_else(|| format!("Usage: {} needs a {}", verb, what))
        };

        match verb {
            "list" => Ok(Command::List),
            "help" => Ok(Command::Help),
            "quit" => Ok(Command::Quit),
            "show" => Ok(Command::Show { poll_id: need(first, "poll id")? }),
            "watch" => Ok(Command::Watch { poll_id: need(first, "poll id")? }),
            "unwatch" => Ok(Command::Unwatch { poll_id: need(first, "poll id")? }),
            "delete" => Ok(Command::Delete { poll_id: need(first, "poll id")? }),
            "vote" => Ok(Command::Vote {
                poll_id: need(first, "poll id")?,
                option_id: need(second, "option id")?,
            }),
            _ => Err(format!("Unrecognised command: {}", verb)),
        }
    }
}

pub const HELP: &str = "\
Commands:
  list                    list polls
  show <poll>             show current counts
  vote <poll> <option>    vote, or change your vote while the window is open
  watch <poll>            follow live counts and the revote countdown
  unwatch <poll>          stop following a poll
  delete <poll>           delete a poll (admins only)
  quit";
