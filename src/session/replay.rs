use super::*;

/// One scripted request/reply exchange.
///
/// `request` is the command text (for command exchanges) or the RPC body
/// (for raw exchanges). When `error` is set the transport fails the
/// exchange instead of producing a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScriptEntry {
    pub request: String,
    #[serde(default)]
    pub reply: String,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScriptEntry {
    /// A successful exchange.
    pub fn ok(request: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            reply: reply.into(),
            error: None,
        }
    }

    /// A transport-level failure for this exchange.
    pub fn failing(request: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            request: request.into(),
            reply: String::new(),
            error: Some(error.into()),
        }
    }
}

/// Offline transport replaying a scripted exchange sequence.
///
/// Matching is strict and in-order: the next exchange must carry exactly
/// the expected request, and any divergence is a [`ConfigError::ScriptMismatch`].
/// This makes scripts double as assertions about which commands an
/// operation issues and in what order.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    entries: Vec<ScriptEntry>,
    cursor: usize,
}

impl ScriptedTransport {
    pub fn new(entries: Vec<ScriptEntry>) -> Self {
        Self { entries, cursor: 0 }
    }

    /// Loads a script from JSONL, one entry per line.
    pub fn from_jsonl(jsonl: &str) -> Result<Self, ConfigError> {
        let mut entries = Vec::new();
        for line in jsonl.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(line)?);
        }
        Ok(Self::new(entries))
    }

    /// Exports the script as JSONL.
    pub fn to_jsonl(&self) -> Result<String, ConfigError> {
        let mut lines = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            lines.push(serde_json::to_string(entry)?);
        }
        Ok(lines.join("\n"))
    }

    /// Number of exchanges consumed so far.
    pub fn exchanges_used(&self) -> usize {
        self.cursor
    }

    /// True when every scripted exchange has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.entries.len()
    }

    /// Requests issued so far, in order.
    pub fn requests_seen(&self) -> Vec<&str> {
        self.entries[..self.cursor]
            .iter()
            .map(|e| e.request.as_str())
            .collect()
    }

    fn next_for(&mut self, request: &str) -> Result<ScriptEntry, ConfigError> {
        let Some(entry) = self.entries.get(self.cursor) else {
            return Err(ConfigError::ScriptMismatch(format!(
                "script exhausted; unexpected request '{request}'"
            )));
        };
        if entry.request != request {
            return Err(ConfigError::ScriptMismatch(format!(
                "expected request '{}', got '{request}'",
                entry.request
            )));
        }
        self.cursor += 1;
        Ok(entry.clone())
    }
}

impl Transport for ScriptedTransport {
    async fn run_command(&mut self, command: &str) -> Result<String, ConfigError> {
        let entry = self.next_for(command)?;
        if let Some(error) = entry.error {
            return Err(ConfigError::Command {
                command: command.to_string(),
                reason: error,
            });
        }
        interpret_command_reply(command, &entry.reply)
    }

    async fn run_structured_command(&mut self, command: &str) -> Result<String, ConfigError> {
        let entry = self.next_for(command)?;
        if let Some(error) = entry.error {
            return Err(ConfigError::Command {
                command: command.to_string(),
                reason: error,
            });
        }
        if let Some(issue) = rpc_issues(&entry.reply)
            .into_iter()
            .find(|issue| issue.severity == IssueSeverity::Error)
        {
            return Err(ConfigError::Command {
                command: command.to_string(),
                reason: issue.message,
            });
        }
        Ok(entry.reply)
    }

    async fn run_rpc(&mut self, body: &str) -> Result<String, ConfigError> {
        let entry = self.next_for(body)?;
        if let Some(error) = entry.error {
            return Err(ConfigError::Command {
                command: body.to_string(),
                reason: error,
            });
        }
        Ok(entry.reply)
    }
}
