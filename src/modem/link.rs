//! Command/response exchange over an [`AtTransport`].

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, trace};

use super::codec::{AtFrame, AtOut};
use super::parse::{final_result, is_unsolicited, FinalResult};
use super::transport::AtTransport;
use super::ModemError;

/// One modem connection speaking AT commands.
///
/// Unsolicited lines that arrive while a command is running are queued and
/// handed out later through [`AtLink::next_unsolicited`].
pub struct AtLink {
    transport: Box<dyn AtTransport>,
    unsolicited: VecDeque<String>,
}

impl AtLink {
    pub fn new(transport: Box<dyn AtTransport>) -> Self {
        Self {
            transport,
            unsolicited: VecDeque::new(),
        }
    }

    /// Run `command` and return its intermediate response lines.
    pub async fn command(&mut self, command: &str, limit: Duration) -> Result<Vec<String>, ModemError> {
        debug!(command, "AT >");
        match timeout(limit, self.exchange(command)).await {
            Ok(result) => result,
            Err(_) => Err(ModemError::Timeout(command_name(command))),
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<Vec<String>, ModemError> {
        self.transport.send(AtOut::Command(command.to_string())).await?;
        self.collect(command).await
    }

    /// Read lines until a final result code.
    async fn collect(&mut self, command: &str) -> Result<Vec<String>, ModemError> {
        let mut lines = Vec::new();
        loop {
            let line = match self.transport.next_frame().await? {
                AtFrame::Line(line) => line,
                AtFrame::Prompt => continue,
            };
            trace!(line = %line, "AT <");

            if line.is_empty() || line == command {
                continue;
            }
            match final_result(&line) {
                Some(FinalResult::Ok) => return Ok(lines),
                Some(FinalResult::Error(error)) => return Err(ModemError::Rejected(error)),
                None if is_unsolicited(&line) => self.unsolicited.push_back(line),
                None => lines.push(line),
            }
        }
    }

    /// Send an SMS header command, wait for the prompt, then send `text`.
    pub async fn submit_text(
        &mut self,
        command: &str,
        text: &str,
        limit: Duration,
    ) -> Result<Vec<String>, ModemError> {
        debug!(command, text, "AT > (text)");
        let exchange = async {
            self.transport.send(AtOut::Command(command.to_string())).await?;
            loop {
                match self.transport.next_frame().await? {
                    AtFrame::Prompt => break,
                    AtFrame::Line(line) => match final_result(&line) {
                        Some(FinalResult::Error(error)) => return Err(ModemError::Rejected(error)),
                        _ if is_unsolicited(&line) => self.unsolicited.push_back(line),
                        _ => trace!(line = %line, "ignoring line before prompt"),
                    },
                }
            }
            self.transport.send(AtOut::Text(text.to_string())).await?;
            self.collect(command).await
        };

        match timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ModemError::Timeout(command_name(command))),
        }
    }

    /// Wait for an unsolicited line starting with `prefix`.
    ///
    /// Other unsolicited lines seen meanwhile stay queued.
    pub async fn wait_for(&mut self, prefix: &str, limit: Duration) -> Result<String, ModemError> {
        if let Some(pos) = self.unsolicited.iter().position(|l| l.starts_with(prefix)) {
            if let Some(line) = self.unsolicited.remove(pos) {
                return Ok(line);
            }
        }

        let wait = async {
            loop {
                let AtFrame::Line(line) = self.transport.next_frame().await? else {
                    continue;
                };
                trace!(line = %line, "AT <");
                if line.starts_with(prefix) {
                    return Ok(line);
                }
                if is_unsolicited(&line) {
                    self.unsolicited.push_back(line);
                }
            }
        };

        match timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => Err(ModemError::Timeout(prefix.trim_end_matches(':').to_string())),
        }
    }

    /// Next unsolicited line, queued ones first.
    ///
    /// Cancel safe as long as the transport's `next_frame` is.
    pub async fn next_unsolicited(&mut self) -> Result<String, ModemError> {
        if let Some(line) = self.unsolicited.pop_front() {
            return Ok(line);
        }
        loop {
            if let AtFrame::Line(line) = self.transport.next_frame().await? {
                if line.is_empty() {
                    continue;
                }
                trace!(line = %line, "AT < (unsolicited)");
                return Ok(line);
            }
        }
    }
}

/// Command without arguments, safe to log at any level (no PINs)
fn command_name(command: &str) -> String {
    command
        .split(['=', '?'])
        .next()
        .unwrap_or(command)
        .to_string()
}
