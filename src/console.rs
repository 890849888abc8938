// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Operator console: line assembly and command dispatch for the bootstrap server.
// Author: Lukas Bower

//! Operator console fed from raw stdin reads.

use std::io::Write;

use log::{debug, warn};
use thiserror::Error;

/// Maximum length accepted for a single console line.
pub const MAX_LINE_LEN: usize = 256;

/// Console verbs with their help text, in display order.
pub const COMMANDS: &[(&str, &str)] = &[
    ("help", "List console commands."),
    ("q", "Quit the bootstrap server."),
];

/// Parsed console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Print the command table.
    Help,
    /// Stop the event loop.
    Quit,
}

/// Console parse failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsoleError {
    /// The line exceeded [`MAX_LINE_LEN`] bytes.
    #[error("console line exceeded {MAX_LINE_LEN} bytes")]
    LineTooLong,
    /// Nothing but whitespace.
    #[error("empty command")]
    EmptyLine,
    /// Unknown verb.
    #[error("unknown command '{0}', type 'help' for a list")]
    InvalidVerb(String),
}

impl ConsoleCommand {
    /// Parse one console line.
    pub fn parse(line: &str) -> Result<Self, ConsoleError> {
        let mut words = line.split_whitespace();
        let verb = words.next().ok_or(ConsoleError::EmptyLine)?;
        match verb {
            "help" | "?" => Ok(Self::Help),
            "q" => Ok(Self::Quit),
            other => Err(ConsoleError::InvalidVerb(other.to_owned())),
        }
    }
}

/// What the event loop should do after console input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleOutcome {
    /// Keep serving.
    Continue,
    /// Leave the loop at the top of the next iteration.
    Quit,
}

#[derive(Debug, Default)]
struct LineAssembler {
    buf: Vec<u8>,
    overflow: bool,
}

impl LineAssembler {
    fn push(&mut self, bytes: &[u8]) -> Vec<Result<String, ConsoleError>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                lines.push(self.take());
            } else if self.buf.len() >= MAX_LINE_LEN {
                self.overflow = true;
            } else {
                self.buf.push(byte);
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<Result<String, ConsoleError>> {
        (!self.buf.is_empty() || self.overflow).then(|| self.take())
    }

    fn take(&mut self) -> Result<String, ConsoleError> {
        let overflow = std::mem::take(&mut self.overflow);
        let bytes = std::mem::take(&mut self.buf);
        if overflow {
            return Err(ConsoleError::LineTooLong);
        }
        Ok(String::from_utf8_lossy(&bytes).trim_end_matches('\r').to_owned())
    }
}

/// Console state across partial reads.
#[derive(Debug, Default)]
pub struct Console {
    lines: LineAssembler,
}

impl Console {
    /// Empty console.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes read from the console; complete lines are executed in order.
    pub fn feed<W: Write>(&mut self, bytes: &[u8], out: &mut W) -> ConsoleOutcome {
        let mut outcome = ConsoleOutcome::Continue;
        for line in self.lines.push(bytes) {
            if self.run_line(line, out) == ConsoleOutcome::Quit {
                outcome = ConsoleOutcome::Quit;
            }
        }
        outcome
    }

    /// Execute any unterminated line left when the console reached end of input.
    pub fn finish<W: Write>(&mut self, out: &mut W) -> ConsoleOutcome {
        match self.lines.flush() {
            Some(line) => self.run_line(line, out),
            None => ConsoleOutcome::Continue,
        }
    }

    fn run_line<W: Write>(
        &self,
        line: Result<String, ConsoleError>,
        out: &mut W,
    ) -> ConsoleOutcome {
        let command = line.and_then(|line| ConsoleCommand::parse(&line));
        let (outcome, written) = match command {
            Ok(ConsoleCommand::Quit) => {
                debug!("console requested quit");
                (ConsoleOutcome::Quit, Ok(()))
            }
            Ok(ConsoleCommand::Help) => (ConsoleOutcome::Continue, write_help(out)),
            Err(ConsoleError::EmptyLine) => (ConsoleOutcome::Continue, Ok(())),
            Err(err) => (ConsoleOutcome::Continue, writeln!(out, "{err}")),
        };
        if let Err(err) = written.and_then(|()| out.flush()) {
            warn!("console write failed: {err}");
        }
        outcome
    }
}

fn write_help<W: Write>(out: &mut W) -> std::io::Result<()> {
    for (verb, summary) in COMMANDS {
        writeln!(out, "{verb:>6}\t{summary}")?;
    }
    Ok(())
}
