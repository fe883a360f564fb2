//! Statement and meta-command parsing.
//!
//! The grammar is deliberately tiny: three whitespace-separated statement
//! forms plus dot-prefixed meta commands. Parse failures carry the exact
//! message shown to the user; the loop reports them and continues.

use crate::storage::row::{Row, EMAIL_SIZE, USERNAME_SIZE};
use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub enum MetaCommand {
    Exit,
    Btree,
    Constants,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Statement {
    Insert(Row),
    Select,
    Delete(u32),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    UnrecognizedKeyword(String),
    UnrecognizedCommand(String),
    SyntaxError,
    NegativeId,
    StringTooLong,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnrecognizedKeyword(input) => {
                write!(f, "Unrecognized keyword at start of '{}'.", input)
            }
            ParseError::UnrecognizedCommand(input) => {
                write!(f, "Unrecognized command: '{}'", input)
            }
            ParseError::SyntaxError => write!(f, "Syntax error. Could not parse statement."),
            ParseError::NegativeId => write!(f, "ID must be positive."),
            ParseError::StringTooLong => write!(f, "String is too long."),
        }
    }
}

pub fn parse_meta(input: &str) -> Result<MetaCommand, ParseError> {
    match input {
        ".exit" => Ok(MetaCommand::Exit),
        ".btree" => Ok(MetaCommand::Btree),
        ".constants" => Ok(MetaCommand::Constants),
        _ => Err(ParseError::UnrecognizedCommand(input.to_owned())),
    }
}

pub fn parse(input: &str) -> Result<Statement, ParseError> {
    let mut tokens = input.split_whitespace();
    let keyword = tokens.next().ok_or(ParseError::SyntaxError)?;
    match keyword {
        "insert" => {
            let id = tokens.next().ok_or(ParseError::SyntaxError)?;
            let username = tokens.next().ok_or(ParseError::SyntaxError)?;
            let email = tokens.next().ok_or(ParseError::SyntaxError)?;
            let id = parse_id(id)?;
            if username.len() > USERNAME_SIZE || email.len() > EMAIL_SIZE {
                return Err(ParseError::StringTooLong);
            }
            Ok(Statement::Insert(Row::new(id, username, email)))
        }
        "select" => Ok(Statement::Select),
        "delete" => {
            let id = tokens.next().ok_or(ParseError::SyntaxError)?;
            Ok(Statement::Delete(parse_id(id)?))
        }
        _ => Err(ParseError::UnrecognizedKeyword(input.to_owned())),
    }
}

fn parse_id(token: &str) -> Result<u32, ParseError> {
    let id: i64 = token.parse().map_err(|_| ParseError::SyntaxError)?;
    if id < 0 {
        return Err(ParseError::NegativeId);
    }
    u32::try_from(id).map_err(|_| ParseError::SyntaxError)
}
