//! Broker command builder.
//!
//! Commands are kept as a name plus raw binary arguments so they can be sent
//! over a Redis-protocol connection or inspected by an in-process broker.

use std::fmt;

use redis::ToRedisArgs;

/// Longest argument rendered verbatim by `Display`.
const DISPLAY_ARG_LIMIT: usize = 48;

/// A single broker command (e.g. `ADDJOB queue payload 200`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Vec<u8>>,
}

impl Command {
    /// Starts a command with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// Appends an argument. Anything Redis can encode is accepted; slices of
    /// strings expand into several arguments.
    pub fn arg<T: ToRedisArgs>(mut self, arg: T) -> Self {
        self.args.extend(arg.to_redis_args());
        self
    }

    /// Appends an argument in place.
    pub fn push_arg<T: ToRedisArgs>(&mut self, arg: T) {
        self.args.extend(arg.to_redis_args());
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    /// Returns argument `index` as UTF-8, if present and valid.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .and_then(|a| std::str::from_utf8(a).ok())
    }

    /// Converts to a `redis::Cmd` ready to be sent on a connection.
    pub fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(&self.name);
        for arg in &self.args {
            cmd.arg(arg.as_slice());
        }
        cmd
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        for arg in &self.args {
            let text = String::from_utf8_lossy(arg);
            if text.len() > DISPLAY_ARG_LIMIT {
                let cut = text
                    .char_indices()
                    .map(|(i, _)| i)
                    .take_while(|i| *i <= DISPLAY_ARG_LIMIT)
                    .last()
                    .unwrap_or(0);
                write!(f, " {}...", &text[..cut])?;
            } else {
                write!(f, " {}", text)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_args() {
        let cmd = Command::new("ADDJOB")
            .arg("add")
            .arg(b"payload".to_vec())
            .arg(200u64);

        assert_eq!(cmd.name(), "ADDJOB");
        assert_eq!(cmd.args().len(), 3);
        assert_eq!(cmd.arg_str(0), Some("add"));
        assert_eq!(cmd.args()[1], b"payload".to_vec());
        assert_eq!(cmd.arg_str(2), Some("200"));
        assert_eq!(cmd.arg_str(3), None);
    }

    #[test]
    fn test_slice_expands_into_arguments() {
        let ids = vec!["D-1".to_string(), "D-2".to_string()];
        let cmd = Command::new("ACKJOB").arg(&ids[..]);

        assert_eq!(cmd.args().len(), 2);
        assert_eq!(cmd.to_string(), "ACKJOB D-1 D-2");
    }

    #[test]
    fn test_display_truncates_long_payloads() {
        let cmd = Command::new("ADDJOB").arg("q").arg("x".repeat(500));
        let rendered = cmd.to_string();

        assert!(rendered.starts_with("ADDJOB q xxx"));
        assert!(rendered.ends_with("..."));
        assert!(rendered.len() < 100);
    }
}
