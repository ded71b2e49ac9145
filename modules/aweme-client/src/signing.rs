use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FetchError, Result};

/// Query parameter carrying the anti-bot token.
pub const SIGNATURE_PARAM: &str = "X-Bogus";

const SIGNER_TIMEOUT: Duration = Duration::from_secs(30);

/// Computes the anti-bot token for an encoded query string.
#[async_trait]
pub trait SigningPort: Send + Sync {
    /// Implementations must call `ensure_unsigned` first; signing a query
    /// that already carries a token produces one the server rejects.
    async fn sign(&self, query: &str) -> Result<String>;
}

pub fn ensure_unsigned(query: &str) -> Result<()> {
    if url::form_urlencoded::parse(query.as_bytes()).any(|(k, _)| k == SIGNATURE_PARAM) {
        return Err(FetchError::Signing(format!(
            "{SIGNATURE_PARAM} already present in query"
        )));
    }
    Ok(())
}

/// Runs an external helper as `<program> [args..] <query> <user-agent>` and
/// reads the token from its stdout.
pub struct CommandSigner {
    program: String,
    args: Vec<String>,
    user_agent: String,
}

impl CommandSigner {
    /// `command` is split on whitespace, e.g. `node sign.js`.
    pub fn new(command: &str, user_agent: impl Into<String>) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| FetchError::Config("empty signer command".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            user_agent: user_agent.into(),
        })
    }
}

#[async_trait]
impl SigningPort for CommandSigner {
    async fn sign(&self, query: &str) -> Result<String> {
        ensure_unsigned(query)?;

        let output = tokio::time::timeout(
            SIGNER_TIMEOUT,
            tokio::process::Command::new(&self.program)
                .args(&self.args)
                .arg(query)
                .arg(&self.user_agent)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| FetchError::Signing(format!("{} timed out", self.program)))?
        .map_err(|e| FetchError::Signing(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FetchError::Signing(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if token.is_empty() {
            return Err(FetchError::Signing(format!(
                "{} printed no token",
                self.program
            )));
        }
        debug!(len = token.len(), "signer: token computed");
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_existing_token() {
        assert!(ensure_unsigned("aid=6383&count=18").is_ok());
        assert!(ensure_unsigned("aid=6383&X-Bogus=abc").is_err());
        assert!(ensure_unsigned("X-Bogus=").is_err());
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(CommandSigner::new("   ", "ua").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signer_reads_stdout() {
        let signer = CommandSigner::new("echo token", "ua").unwrap();
        // echo prints "token <query> <ua>"
        let token = signer.sign("a=1").await.unwrap();
        assert_eq!(token, "token a=1 ua");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_signer_refuses_signed_query() {
        let signer = CommandSigner::new("echo", "ua").unwrap();
        let err = signer.sign("a=1&X-Bogus=old").await.unwrap_err();
        assert!(matches!(err, FetchError::Signing(_)));
    }
}
