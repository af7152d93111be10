//! CLI utilities for talking to a manager interactively.
//!
//! A call is written as `server | setting | argument`, for example
//! `Lakeshore 218 | temperatures` or `10 | 5 | 1.5`. Numeric servers and
//! settings are taken as ids, anything else as a name to be looked up.
use std::io::{BufRead, Write};

use crate::{
    data::Data,
    protocol::{Setting, Target},
};

/// Possible commands from a user.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Exit command `.exit`, also produced at end of input.
    Exit,
    /// A request to one setting of a server.
    Call {
        server: Target,
        setting: Setting,
        argument: Data,
    },
}

impl TryFrom<&str> for Command {
    type Error = String;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let line = line.trim();
        match line {
            ".exit" => return Ok(Command::Exit),
            s if s.starts_with('.') => return Err(format!("unrecognized command '{s}'")),
            _ => {}
        }

        let mut parts = line.splitn(3, '|').map(str::trim);
        let (Some(server), Some(setting)) = (parts.next(), parts.next()) else {
            return Err(format!("expected 'server | setting [| argument]', got '{line}'"));
        };
        if server.is_empty() || setting.is_empty() {
            return Err("server and setting must not be empty".to_string());
        }

        let server = match server.parse::<u32>() {
            Ok(id) => Target::Id(id),
            Err(_) => Target::from(server),
        };
        let setting = match setting.parse::<u32>() {
            Ok(id) => Setting::Id(id),
            Err(_) => Setting::from(setting),
        };
        Ok(Command::Call {
            server,
            setting,
            argument: parts.next().map(parse_argument).unwrap_or_default(),
        })
    }
}

/// Reads a literal: booleans, words, integers, values, or a string.
pub fn parse_argument(text: &str) -> Data {
    let text = text.trim();
    if text.is_empty() {
        return Data::None;
    }
    if let Some(quoted) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        return Data::from(quoted);
    }
    match text {
        "true" => return Data::Bool(true),
        "false" => return Data::Bool(false),
        _ => {}
    }
    if let Ok(word) = text.parse::<u32>() {
        Data::Word(word)
    } else if let Ok(int) = text.parse::<i32>() {
        Data::Int(int)
    } else if let Ok(value) = text.parse::<f64>() {
        Data::Value(value)
    } else {
        Data::from(text)
    }
}

/// Prompt user for a valid command.
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, String>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ").map_err(|e| format!("failed to write prompt: {e}"))?;
    writer
        .flush()
        .map_err(|e| format!("failed to write prompt: {e}"))?;

    let read = reader
        .read_line(&mut s)
        .map_err(|e| format!("failed to read input: {e}"))?;
    if read == 0 {
        return Ok(Command::Exit);
    }
    Command::try_from(s.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_prints_correctly() {
        let input = b".exit\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();

        let output = String::from_utf8(output).expect("not valid UTF-8");
        assert_eq!("> ", output);
    }

    #[test]
    fn prompt_parses_named_call() {
        let input = b"Lakeshore 218 | temperatures\n";
        let mut output = Vec::new();

        let res = prompt(&input[..], &mut output).unwrap();
        assert_eq!(
            res,
            Command::Call {
                server: Target::from("Lakeshore 218"),
                setting: Setting::from("temperatures"),
                argument: Data::None,
            }
        );
    }

    #[test]
    fn numeric_parts_are_ids() {
        let cmd = Command::try_from("10 | 5 | 2").unwrap();
        assert_eq!(
            cmd,
            Command::Call {
                server: Target::Id(10),
                setting: Setting::Id(5),
                argument: Data::Word(2),
            }
        );
    }

    #[test]
    fn end_of_input_exits() {
        let mut output = Vec::new();
        assert_eq!(prompt(&b""[..], &mut output), Ok(Command::Exit));
    }

    #[test]
    fn arguments_pick_the_narrowest_type() {
        assert_eq!(parse_argument("true"), Data::Bool(true));
        assert_eq!(parse_argument("-3"), Data::Int(-3));
        assert_eq!(parse_argument("4.2"), Data::Value(4.2));
        assert_eq!(parse_argument("\"12\""), Data::from("12"));
        assert_eq!(parse_argument("K"), Data::from("K"));
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert!(Command::try_from("Lakeshore 218").is_err());
        assert!(Command::try_from(" | temperatures").is_err());
    }

    #[test]
    #[should_panic(expected = "unrecognized command '.something_wrong'")]
    fn prompt_unrecognized_command() {
        let input = b".something_wrong\n";
        let mut output = Vec::new();

        prompt(&input[..], &mut output).unwrap();
    }
}
