//! Control-protocol types exchanged on the control channel.
//!
//! The protocol is plain text over TCP, one command per connection: the
//! client sends a single line, the valve replies with a single status line,
//! and the connection closes. Command keywords are case-sensitive.

use std::fmt;
use std::str::FromStr;

use crate::error::ValveError;

/// A command received on a control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Close the gate: controlled listeners stop admitting new connections.
    Pause,
    /// Open the gate: controlled listeners resume admitting.
    Resume,
    /// Query the current gate state without changing it.
    Status,
}

impl FromStr for ControlCommand {
    type Err = ValveError;

    /// Parses a command line. A trailing CR/LF is tolerated; anything else,
    /// including lower-case keywords, is rejected.
    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim_end_matches(['\r', '\n']) {
            "PAUSE" => Ok(ControlCommand::Pause),
            "RESUME" => Ok(ControlCommand::Resume),
            "STATUS" => Ok(ControlCommand::Status),
            other => Err(ValveError::InvalidCommand(other.to_owned())),
        }
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = match self {
            ControlCommand::Pause => "PAUSE",
            ControlCommand::Resume => "RESUME",
            ControlCommand::Status => "STATUS",
        };
        f.write_str(keyword)
    }
}

/// The single status line sent back before the control connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    /// A PAUSE or RESUME transition was applied (or was already in effect).
    Ok,
    /// STATUS reply: the gate is closed.
    Paused,
    /// STATUS reply: the gate is open.
    Resumed,
}

impl ControlReply {
    /// The reply keyword as sent on the wire (without the line terminator).
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlReply::Ok => "OK",
            ControlReply::Paused => "PAUSED",
            ControlReply::Resumed => "RESUMED",
        }
    }
}

impl fmt::Display for ControlReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ControlReply {
    type Err = ValveError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        match line.trim_end_matches(['\r', '\n']) {
            "OK" => Ok(ControlReply::Ok),
            "PAUSED" => Ok(ControlReply::Paused),
            "RESUMED" => Ok(ControlReply::Resumed),
            other => Err(ValveError::InvalidCommand(other.to_owned())),
        }
    }
}
