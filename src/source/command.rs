//! Subprocess-backed source connector
//!
//! Runs `<program> <args...> <YYYY-MM-DD>` and reads one JSON candidate per
//! stdout line. The child is killed if the stream is dropped early or the
//! deadline passes.

use super::{CandidateStream, SourceConnector, SourceError};
use crate::article::CandidateArticle;
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::Instant;

/// Configuration-driven connector for an external scraper
#[derive(Debug, Clone)]
pub struct CommandSource {
    id: String,
    name: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandSource {
    /// `command[0]` is the program, the rest are leading arguments.
    pub fn new(id: impl Into<String>, command: Vec<String>) -> Result<Self, SourceError> {
        let id = id.into();
        let mut parts = command.into_iter();
        let program = parts
            .next()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| SourceError::Unavailable(format!("source {} has an empty command", id)))?;
        Ok(Self {
            name: id.clone(),
            id,
            program,
            args: parts.collect(),
            timeout: Duration::from_secs(120),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct ReadState {
    lines: Lines<BufReader<ChildStdout>>,
    child: Child,
    deadline: Instant,
    timeout_secs: u64,
    program: String,
    source_name: String,
    line_no: usize,
    done: bool,
}

impl ReadState {
    fn finish(&mut self, err: SourceError) -> Result<CandidateArticle, SourceError> {
        self.done = true;
        let _ = self.child.start_kill();
        Err(err)
    }

    async fn next_item(&mut self) -> Option<Result<CandidateArticle, SourceError>> {
        if self.done {
            return None;
        }
        loop {
            let line = match tokio::time::timeout_at(self.deadline, self.lines.next_line()).await {
                Err(_) => return Some(self.finish(SourceError::Timeout(self.timeout_secs))),
                Ok(Err(e)) => return Some(self.finish(e.into())),
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    self.done = true;
                    return match self.child.wait().await {
                        Ok(status) if status.success() => None,
                        Ok(status) => Some(Err(SourceError::Failed(format!(
                            "{} exited with {}",
                            self.program, status
                        )))),
                        Err(e) => Some(Err(e.into())),
                    };
                }
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Some(match serde_json::from_str::<CandidateArticle>(trimmed) {
                Ok(mut candidate) => {
                    if candidate.source_name.is_empty() {
                        candidate.source_name = self.source_name.clone();
                    }
                    Ok(candidate)
                }
                Err(e) => {
                    let msg = format!("line {}: {}", self.line_no, e);
                    self.finish(SourceError::Malformed(msg))
                }
            });
        }
    }
}

#[async_trait]
impl SourceConnector for CommandSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, date: NaiveDate) -> Result<CandidateStream, SourceError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(date.format("%Y-%m-%d").to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SourceError::Unavailable(format!("failed to start {}: {}", self.program, e))
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unavailable("no stdout available".to_string()))?;

        tracing::debug!(source = %self.id, %date, program = %self.program, "spawned source command");

        let state = ReadState {
            lines: BufReader::new(stdout).lines(),
            child,
            deadline: Instant::now() + self.timeout,
            timeout_secs: self.timeout.as_secs(),
            program: self.program.clone(),
            source_name: self.name.clone(),
            line_no: 0,
            done: false,
        };

        Ok(stream::unfold(state, |mut state| async move {
            state.next_item().await.map(|item| (item, state))
        })
        .boxed())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 20).unwrap()
    }

    fn sh(script: &str) -> CommandSource {
        CommandSource::new(
            "script",
            vec!["sh".into(), "-c".into(), script.into(), "sh".into()],
        )
        .unwrap()
        .with_name("Script Source")
    }

    #[tokio::test]
    async fn test_reads_json_lines_with_date_argument() {
        let source = sh(r#"echo "{\"title\":\"on $1\",\"url\":\"https://s.example/1\"}"; echo; echo '{"title":"b","url":"https://s.example/2","source_name":"Other"}'"#);
        let items: Vec<CandidateArticle> = source.fetch(day()).await.unwrap().try_collect().await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "on 2026-02-20");
        assert_eq!(items[0].source_name, "Script Source");
        assert_eq!(items[1].source_name, "Other");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_an_error_after_items() {
        let source = sh(r#"echo '{"title":"a","url":"https://s.example/1"}'; exit 3"#);
        let items: Vec<_> = source.fetch(day()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(SourceError::Failed(_))));
    }

    #[tokio::test]
    async fn test_malformed_line_ends_the_stream() {
        let source = sh("echo 'not json'; echo '{\"title\":\"a\",\"url\":\"u\"}'");
        let items: Vec<_> = source.fetch(day()).await.unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(SourceError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_deadline_surfaces_as_timeout() {
        let source = sh("sleep 5").with_timeout(Duration::from_millis(100));
        let items: Vec<_> = source.fetch(day()).await.unwrap().collect().await;
        assert_eq!(items, vec![Err(SourceError::Timeout(0))]);
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let source = CommandSource::new("x", vec!["/nonexistent/scraper".into()]).unwrap();
        assert!(matches!(source.fetch(day()).await, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(CommandSource::new("x", vec![]).is_err());
    }
}
