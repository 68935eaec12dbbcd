//! Parsing of the interactive stdin commands.

use satlink_net::{Command, CommandTag, Request};
use serde_json::Value;

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Send a command to the receiver.
    Send(Command),
    /// Print the connection state.
    State,
    /// Stop and start the session (resets the reconnection counter).
    Restart,
    /// Print the command summary.
    Help,
    /// Exit.
    Quit,
    /// Blank line.
    Empty,
}

/// Reasons a line could not be turned into an [`Input`].
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    /// The first word is not a known command.
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    /// Arguments are missing or malformed.
    #[error("usage: {0}")]
    Usage(&'static str),
    /// `raw` was given text that is not JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
}

/// Summary printed for `help`.
pub const HELP: &str = "\
list <from> <to>       fetch channel table entries
key <code>             press a remote-control key
zap <program-id>       switch channel
lock <id> <0|1>        lock or unlock a channel
rename <id> <name>     rename a channel
delete <id>            delete a channel
move <id> <position>   move a channel
req <code>             send a bare request code
raw <json>             send a JSON body as-is
state                  show connection state
restart                reconnect from scratch
quit                   exit";

/// Parse one line of user input.
pub fn parse_line(line: &str) -> Result<Input, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };
    let args: Vec<&str> = rest.split_whitespace().collect();

    let request = match word {
        "" => return Ok(Input::Empty),
        "help" => return Ok(Input::Help),
        "state" => return Ok(Input::State),
        "restart" => return Ok(Input::Restart),
        "quit" | "exit" => return Ok(Input::Quit),
        "raw" => return raw_command(rest).map(Input::Send),
        "list" => match args.as_slice() {
            [from, to] => Request::FetchChannels {
                from: number(from, "list <from> <to>")?,
                to: number(to, "list <from> <to>")?,
            },
            _ => return Err(ParseError::Usage("list <from> <to>")),
        },
        "key" => match args.as_slice() {
            [key] => Request::SendKey {
                key: number(key, "key <code>")?,
            },
            _ => return Err(ParseError::Usage("key <code>")),
        },
        "zap" => match args.as_slice() {
            [id] => Request::ChangeChannel {
                program_id: id.to_string(),
            },
            _ => return Err(ParseError::Usage("zap <program-id>")),
        },
        "lock" => match args.as_slice() {
            [id, "0"] | [id, "1"] => Request::SetLock {
                program_id: id.to_string(),
                locked: args[1] == "1",
            },
            _ => return Err(ParseError::Usage("lock <id> <0|1>")),
        },
        "rename" => match rest.split_once(char::is_whitespace) {
            Some((id, name)) if !name.trim().is_empty() => Request::Rename {
                program_id: id.to_string(),
                name: name.trim().to_string(),
            },
            _ => return Err(ParseError::Usage("rename <id> <name>")),
        },
        "delete" => match args.as_slice() {
            [id] => Request::Delete {
                program_id: id.to_string(),
            },
            _ => return Err(ParseError::Usage("delete <id>")),
        },
        "move" => match args.as_slice() {
            [id, position] => Request::Move {
                program_id: id.to_string(),
                position: number(position, "move <id> <position>")?,
            },
            _ => return Err(ParseError::Usage("move <id> <position>")),
        },
        "req" => match args.as_slice() {
            [code] => Request::Raw(code.to_string()),
            _ => return Err(ParseError::Usage("req <code>")),
        },
        other => return Err(ParseError::Unknown(other.to_string())),
    };

    Ok(Input::Send(request.into()))
}

fn number(text: &str, usage: &'static str) -> Result<u32, ParseError> {
    text.parse().map_err(|_| ParseError::Usage(usage))
}

/// Validate a raw JSON body; a channel-table request keeps its tag.
fn raw_command(text: &str) -> Result<Command, ParseError> {
    if text.is_empty() {
        return Err(ParseError::Usage("raw <json>"));
    }
    let value: Value =
        serde_json::from_str(text).map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    let cmd = Command::new(text);
    if value.get("request").and_then(Value::as_str) == Some("0") {
        return Ok(cmd.with_tag(CommandTag::ChannelListRequest));
    }
    Ok(cmd)
}
