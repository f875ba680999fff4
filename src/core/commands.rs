use std::time::Instant;

use anyhow::{bail, Context as AnyhowContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::card::Card;
use crate::core::types::Attrib;
use crate::core::utils::{format_hex_spaced, parse_hex, parse_u32};

/// Result of any command execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub timestamp: DateTime<Utc>,
    pub command_type: CommandType,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Types of commands supported
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    Transmit,
    Control { code: u32 },
    GetAttrib { id: u32 },
    SetAttrib { id: u32 },
}

/// Result specifically for transmit commands
#[derive(Debug, Clone)]
pub struct TransmitResult {
    pub apdu: Vec<u8>,
    pub response: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
    pub duration_ms: u64,
}

/// Result specifically for control commands
#[derive(Debug, Clone)]
pub struct ControlResult {
    pub code: u32,
    pub input: Vec<u8>,
    pub output: Vec<u8>,
    pub duration_ms: u64,
}

/// One line of a command script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptCommand {
    Transmit(String),
    Control { code: u32, data: String },
    GetAttrib(Attrib),
    SetAttrib { id: Attrib, data: String },
}

impl ScriptCommand {
    /// Parse `transmit <apdu>`, `control <code> [data]`, `getattr <id>` or
    /// `setattr <id> <data>`. Blank lines and `#` / `//` comments yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            return Ok(None);
        }

        let parts: Vec<&str> = line.split_whitespace().collect();
        let command = match parts[0].to_lowercase().as_str() {
            "transmit" | "t" => {
                if parts.len() < 2 {
                    bail!("Missing APDU for transmit command");
                }
                Self::Transmit(parts[1..].join(""))
            }
            "control" | "c" => {
                let Some(code) = parts.get(1) else {
                    bail!("Missing control code");
                };
                Self::Control {
                    code: parse_u32(code)?,
                    data: parts[2..].join(""),
                }
            }
            "getattr" => {
                let Some(id) = parts.get(1) else {
                    bail!("Missing attribute id");
                };
                Self::GetAttrib(Attrib(parse_u32(id)?))
            }
            "setattr" => {
                let (Some(id), Some(_)) = (parts.get(1), parts.get(2)) else {
                    bail!("setattr needs an attribute id and a value");
                };
                Self::SetAttrib {
                    id: Attrib(parse_u32(id)?),
                    data: parts[2..].join(""),
                }
            }
            other => bail!("Unknown command: {other}"),
        };
        Ok(Some(command))
    }
}

/// Command executor over a connected card, keeping a history of every
/// command it ran.
pub struct CommandExecutor {
    history: Vec<CommandResult>,
}

impl CommandExecutor {
    /// Create a new command executor
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
        }
    }

    fn record(
        &mut self,
        command_type: CommandType,
        input: &[u8],
        timestamp: DateTime<Utc>,
        start: Instant,
        outcome: crate::core::error::Result<Vec<u8>>,
    ) -> Result<(Vec<u8>, u64)> {
        let duration_ms = start.elapsed().as_millis() as u64;
        let (output, error) = match &outcome {
            Ok(output) => (output.clone(), None),
            Err(e) => (Vec::new(), Some(e.to_string())),
        };
        self.history.push(CommandResult {
            timestamp,
            command_type,
            input: input.to_vec(),
            output,
            success: error.is_none(),
            error,
            duration_ms,
        });

        match outcome {
            Ok(output) => Ok((output, duration_ms)),
            Err(e) => {
                log::error!("Command failed: {e}");
                Err(e.into())
            }
        }
    }

    /// Execute a transmit command (APDU)
    pub fn transmit(&mut self, card: &Card<'_>, apdu_hex: &str) -> Result<TransmitResult> {
        let apdu = parse_hex(apdu_hex).context("Failed to parse APDU hex string")?;
        if apdu.is_empty() {
            bail!("APDU cannot be empty");
        }

        log::info!("Transmitting APDU: {}", format_hex_spaced(&apdu));
        let timestamp = Utc::now();
        let start = Instant::now();
        let outcome = card.transmit(&apdu);
        let (response, duration_ms) = self
            .record(CommandType::Transmit, &apdu, timestamp, start, outcome)
            .context("Transmit failed")?;
        log::info!("Received response: {}", format_hex_spaced(&response));

        let (sw1, sw2) = match response.as_slice() {
            [.., sw1, sw2] => (*sw1, *sw2),
            _ => (0, 0),
        };
        Ok(TransmitResult {
            apdu,
            response,
            sw1,
            sw2,
            duration_ms,
        })
    }

    /// Execute a control command
    pub fn control(
        &mut self,
        card: &Card<'_>,
        code: u32,
        data_hex: &str,
    ) -> Result<ControlResult> {
        let data = parse_hex(data_hex).context("Failed to parse control data hex string")?;

        log::info!(
            "Sending control command: code={code:#X}, data={}",
            format_hex_spaced(&data)
        );
        let timestamp = Utc::now();
        let start = Instant::now();
        let outcome = card.control(code, &data);
        let (output, duration_ms) = self
            .record(CommandType::Control { code }, &data, timestamp, start, outcome)
            .context("Control command failed")?;

        Ok(ControlResult {
            code,
            input: data,
            output,
            duration_ms,
        })
    }

    /// Read an attribute
    pub fn get_attrib(&mut self, card: &Card<'_>, id: Attrib) -> Result<Vec<u8>> {
        let timestamp = Utc::now();
        let start = Instant::now();
        let outcome = card.get_attrib(id);
        let (value, _) = self
            .record(CommandType::GetAttrib { id: id.0 }, &[], timestamp, start, outcome)
            .with_context(|| format!("Failed to read attribute {id}"))?;
        Ok(value)
    }

    /// Write an attribute
    pub fn set_attrib(&mut self, card: &Card<'_>, id: Attrib, data_hex: &str) -> Result<()> {
        let data = parse_hex(data_hex).context("Failed to parse attribute value")?;
        let timestamp = Utc::now();
        let start = Instant::now();
        let outcome = card.set_attrib(id, &data).map(|()| Vec::new());
        self.record(CommandType::SetAttrib { id: id.0 }, &data, timestamp, start, outcome)
            .with_context(|| format!("Failed to write attribute {id}"))?;
        Ok(())
    }

    /// Run one parsed script command; returns the response bytes and duration.
    pub fn execute(
        &mut self,
        card: &Card<'_>,
        command: &ScriptCommand,
    ) -> Result<(Vec<u8>, u64)> {
        match command {
            ScriptCommand::Transmit(apdu) => self
                .transmit(card, apdu)
                .map(|r| (r.response, r.duration_ms)),
            ScriptCommand::Control { code, data } => self
                .control(card, *code, data)
                .map(|r| (r.output, r.duration_ms)),
            ScriptCommand::GetAttrib(id) => {
                let value = self.get_attrib(card, *id)?;
                Ok((value, self.last_duration()))
            }
            ScriptCommand::SetAttrib { id, data } => {
                self.set_attrib(card, *id, data)?;
                Ok((Vec::new(), self.last_duration()))
            }
        }
    }

    fn last_duration(&self) -> u64 {
        self.history.last().map_or(0, |cmd| cmd.duration_ms)
    }

    /// Get command history
    pub fn history(&self) -> &[CommandResult] {
        &self.history
    }

    /// Export history to JSON
    pub fn export_history(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.history).context("Failed to serialize command history")
    }

    /// Import history from JSON
    pub fn import_history(&mut self, json: &str) -> Result<()> {
        let imported: Vec<CommandResult> =
            serde_json::from_str(json).context("Failed to deserialize command history")?;

        self.history.extend(imported);
        Ok(())
    }

    /// Get statistics about command history
    pub fn get_statistics(&self) -> CommandStatistics {
        let total_commands = self.history.len();
        let successful_commands = self.history.iter().filter(|cmd| cmd.success).count();
        let failed_commands = total_commands - successful_commands;

        let average_duration_ms = if self.history.is_empty() {
            0
        } else {
            self.history.iter().map(|cmd| cmd.duration_ms).sum::<u64>() / total_commands as u64
        };

        CommandStatistics {
            total_commands,
            successful_commands,
            failed_commands,
            average_duration_ms,
        }
    }
}

/// Statistics about executed commands
#[derive(Debug, Clone)]
pub struct CommandStatistics {
    pub total_commands: usize,
    pub successful_commands: usize,
    pub failed_commands: usize,
    pub average_duration_ms: u64,
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}
