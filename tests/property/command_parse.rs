//! Property-based tests for the prompt command parser.
//!
//! Verification command: `cargo test --test command_parse`

use proptest::prelude::*;

use polychat::command::{Command, ParseError, parse};

/// A whitespace run of random length and mix.
fn arb_space() -> impl Strategy<Value = String> {
    "[ \t]{1,4}"
}

/// A token that carries no command or target prefix.
fn arb_word() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9.,!?'-][a-zA-Z0-9.,!?'@/-]{0,11}"
}

proptest! {
    #[test]
    fn parser_never_panics(line in ".{0,200}") {
        let _ = parse(&line);
    }

    #[test]
    fn whitespace_only_is_empty_input(line in "[ \t]{0,20}") {
        prop_assert_eq!(parse(&line), Err(ParseError::EmptyInput));
    }

    #[test]
    fn plain_words_broadcast_with_single_spaces(
        words in prop::collection::vec(arb_word(), 1..8),
        gaps in prop::collection::vec(arb_space(), 9),
    ) {
        let mut line = gaps[0].clone();
        for (word, gap) in words.iter().zip(&gaps[1..]) {
            line.push_str(word);
            line.push_str(gap);
        }
        prop_assert_eq!(parse(&line), Ok(Command::Broadcast(words.join(" "))));
    }

    #[test]
    fn targeted_send_keeps_channel_and_collapses_text(
        channel in "[a-z0-9_-]{1,16}",
        words in prop::collection::vec(arb_word(), 0..6),
    ) {
        let line = format!("@{channel}  {}", words.join("   "));
        prop_assert_eq!(
            parse(&line),
            Ok(Command::SendTo { channel, text: words.join(" ") })
        );
    }

    #[test]
    fn join_takes_exactly_one_argument(name in "[a-z0-9_-]{1,16}", rest in "( [a-z]{1,5}){0,3}") {
        let line = format!("/join {name}{rest}");
        let extra = rest.trim_start().to_string();
        if extra.is_empty() {
            prop_assert_eq!(parse(&line), Ok(Command::Join(name)));
        } else {
            let command = "/join".to_string();
            prop_assert_eq!(parse(&line), Err(ParseError::ExtraArguments { command, extra }));
        }
    }

    #[test]
    fn nickname_keeps_every_word(words in prop::collection::vec(arb_word(), 1..5)) {
        let line = format!("/nick   {}", words.join("  "));
        prop_assert_eq!(parse(&line), Ok(Command::Nick(words.join(" "))));
    }

    #[test]
    fn unknown_commands_are_reported_verbatim(name in "[a-zA-Z]{1,10}") {
        prop_assume!(!["nick", "join", "leave", "show", "exit"].contains(&name.as_str()));
        let token = format!("/{name}");
        prop_assert_eq!(parse(&token), Err(ParseError::UnknownCommand(token.clone())));
    }
}
