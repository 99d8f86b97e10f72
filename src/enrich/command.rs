//! Subprocess-backed enricher
//!
//! One process per article: the request goes to stdin as JSON, the payload
//! comes back on stdout. Exit code 2 is reserved for fatal errors (bad
//! credentials, unknown model) and aborts the dispatch batch; exit code 75
//! (`EX_TEMPFAIL`) signals rate limiting.

use super::{EnrichmentError, EnrichmentPayload, EnrichmentRequest, Enricher};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

const EXIT_FATAL: i32 = 2;
const EXIT_RATE_LIMITED: i32 = 75;

/// Enricher that shells out to a configured command
#[derive(Debug, Clone)]
pub struct CommandEnricher {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandEnricher {
    /// `command[0]` is the program, the rest are arguments.
    pub fn new(command: Vec<String>) -> Result<Self, EnrichmentError> {
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| EnrichmentError::Unavailable("empty enrichment command".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            timeout: Duration::from_secs(60),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn stderr_tail(stderr: &[u8]) -> String {
        let text = String::from_utf8_lossy(stderr);
        let text = text.trim();
        let start = text
            .char_indices()
            .rev()
            .nth(499)
            .map(|(i, _)| i)
            .unwrap_or(0);
        text[start..].to_string()
    }
}

#[async_trait]
impl Enricher for CommandEnricher {
    fn id(&self) -> &str {
        &self.program
    }

    async fn enrich(&self, request: &EnrichmentRequest) -> Result<EnrichmentPayload, EnrichmentError> {
        let input = serde_json::to_vec(request).map_err(|e| EnrichmentError::Failed(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EnrichmentError::Unavailable(format!("failed to start {}: {}", self.program, e))
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EnrichmentError::Unavailable("no stdin available".to_string()))?;

        let run = async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await?;
            drop(stdin);
            child.wait_with_output().await
        };

        let output = match timeout(self.timeout, run).await {
            Err(_) => return Err(EnrichmentError::Timeout(self.timeout.as_secs())),
            Ok(Err(e)) => return Err(EnrichmentError::Failed(format!("io error: {}", e))),
            Ok(Ok(output)) => output,
        };

        if !output.status.success() {
            let detail = Self::stderr_tail(&output.stderr);
            return Err(match output.status.code() {
                Some(EXIT_FATAL) => EnrichmentError::Fatal(detail),
                Some(EXIT_RATE_LIMITED) => EnrichmentError::RateLimited(detail),
                _ => EnrichmentError::Failed(format!(
                    "{} exited with {}: {}",
                    self.program, output.status, detail
                )),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        EnrichmentPayload::from_json(&stdout)
    }
}
