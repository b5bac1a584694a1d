//! Parsing of prompt lines into [`Command`]s.
//!
//! ```text
//! /nick <name ...>  change nickname (every remaining word)
//! /join <channel>   join a channel
//! /leave <channel>  leave a channel
//! /show             show buffered messages
//! /exit             close everything and quit
//! @<channel> text   send to one joined channel
//! text              send to every joined channel
//! ```
//!
//! Whitespace is collapsed; there is no quoting. A command given more words
//! than it takes is rejected rather than truncated.

/// Prefix selecting a slash command.
pub const COMMAND_PREFIX: char = '/';

/// Prefix selecting a single-channel send.
pub const TARGET_PREFIX: char = '@';

/// One parsed line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Change nickname (and client id).
    Nick(String),
    /// Join a channel.
    Join(String),
    /// Leave a channel.
    Leave(String),
    /// Display buffered messages.
    Show,
    /// Close the session.
    Exit,
    /// Send to one channel.
    SendTo {
        /// Target channel.
        channel: String,
        /// Message text, tokens joined by single spaces.
        text: String,
    },
    /// Send to every joined channel.
    Broadcast(String),
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The line held only whitespace.
    #[error("empty input")]
    EmptyInput,

    /// A slash command that does not exist.
    #[error("unknown command {0}")]
    UnknownCommand(String),

    /// A command that needs an argument got none.
    #[error("{0} needs an argument")]
    MissingArgument(String),

    /// A command got words it does not take.
    #[error("{command} does not take {extra:?}")]
    ExtraArguments {
        /// The command token, prefix included.
        command: String,
        /// The surplus words, joined by single spaces.
        extra: String,
    },
}

/// Parses one line of input.
///
/// # Errors
///
/// See [`ParseError`].
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let mut tokens = line.split_whitespace();
    let Some(first) = tokens.next() else {
        return Err(ParseError::EmptyInput);
    };

    if let Some(name) = first.strip_prefix(COMMAND_PREFIX) {
        let rest: Vec<&str> = tokens.collect();
        return match name {
            "nick" if rest.is_empty() => Err(ParseError::MissingArgument(first.to_string())),
            "nick" => Ok(Command::Nick(rest.join(" "))),
            "join" => single_argument(first, &rest).map(Command::Join),
            "leave" => single_argument(first, &rest).map(Command::Leave),
            "show" => no_argument(first, &rest, Command::Show),
            "exit" => no_argument(first, &rest, Command::Exit),
            _ => Err(ParseError::UnknownCommand(first.to_string())),
        };
    }

    if let Some(channel) = first.strip_prefix(TARGET_PREFIX) {
        if channel.is_empty() {
            return Err(ParseError::MissingArgument(first.to_string()));
        }
        return Ok(Command::SendTo {
            channel: channel.to_string(),
            text: join_tokens(tokens),
        });
    }

    Ok(Command::Broadcast(join_tokens(
        std::iter::once(first).chain(tokens),
    )))
}

fn single_argument(command: &str, rest: &[&str]) -> Result<String, ParseError> {
    match rest {
        [] => Err(ParseError::MissingArgument(command.to_string())),
        [argument] => Ok((*argument).to_string()),
        [_, extra @ ..] => Err(extra_arguments(command, extra)),
    }
}

fn no_argument(command: &str, rest: &[&str], parsed: Command) -> Result<Command, ParseError> {
    if rest.is_empty() {
        Ok(parsed)
    } else {
        Err(extra_arguments(command, rest))
    }
}

fn extra_arguments(command: &str, extra: &[&str]) -> ParseError {
    ParseError::ExtraArguments {
        command: command.to_string(),
        extra: extra.join(" "),
    }
}

fn join_tokens<'a>(tokens: impl Iterator<Item = &'a str>) -> String {
    tokens.collect::<Vec<_>>().join(" ")
}
