//! MCP server for newsroom — exposes run control and enrichment sweeps via
//! the Model Context Protocol.
//!
//! Tools: 7 run + 2 enrichment = 9 total.

pub mod params;

use crate::config::Config;
use crate::pipeline::{Orchestrator, PipelineError};
use crate::run::{FeedSelection, RunId, SourceSelection};
use crate::storage::{DateRange, OpenStore, SqliteStore};
use chrono::NaiveDate;
use params::*;
use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

const DEFAULT_LIST_LIMIT: usize = 20;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn ok_text(text: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::success(vec![Content::text(text)]))
}

fn err_text(msg: String) -> Result<CallToolResult, McpError> {
    Ok(CallToolResult::error(vec![Content::text(msg)]))
}

fn ok_json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
    match serde_json::to_string_pretty(value) {
        Ok(text) => ok_text(text),
        Err(e) => err_text(format!("failed to serialize result: {}", e)),
    }
}

fn parse_date(s: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").map_err(|e| format!("invalid date '{}': {}", s, e))
}

fn parse_run_id(s: &str) -> Result<RunId, String> {
    s.parse().map_err(|e| format!("invalid run id '{}': {}", s, e))
}

/// `None` when neither bound is given.
fn parse_range(from: Option<&str>, to: Option<&str>) -> Result<Option<DateRange>, String> {
    match (from, to) {
        (None, None) => Ok(None),
        (Some(from), to) => {
            let from = parse_date(from)?;
            let to = to.map(parse_date).transpose()?.unwrap_or(from);
            Ok(Some(DateRange::new(from, to)))
        }
        (None, Some(_)) => Err("date_to given without date_from".into()),
    }
}

fn selection_from(p: &TriggerRunParams) -> SourceSelection {
    let feeds = if p.all_feeds {
        FeedSelection::All
    } else {
        match &p.feeds {
            Some(ids) => FeedSelection::Only(ids.clone()),
            None => FeedSelection::None,
        }
    };
    SourceSelection::new(p.sources.iter().cloned()).with_feeds(feeds)
}

// ---------------------------------------------------------------------------
// NewsroomMcpServer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct NewsroomMcpServer {
    orchestrator: Orchestrator,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl NewsroomMcpServer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    // ── Run tools ───────────────────────────────────────────────────────

    #[tool(description = "Start an ingestion run over a date range and source selection. Returns the run id immediately; poll get_run for progress.")]
    async fn trigger_run(
        &self,
        Parameters(p): Parameters<TriggerRunParams>,
    ) -> Result<CallToolResult, McpError> {
        let from = match parse_date(&p.date_from) {
            Ok(d) => d,
            Err(e) => return err_text(e),
        };
        let to = match p.date_to.as_deref().map(parse_date).transpose() {
            Ok(d) => d.unwrap_or(from),
            Err(e) => return err_text(e),
        };

        match self.orchestrator.start_run(from, to, selection_from(&p)) {
            Ok(run_id) => ok_json(&serde_json::json!({ "run_id": run_id, "status": "queued" })),
            Err(e @ PipelineError::Expansion { .. }) => ok_json(&serde_json::json!({
                "run_id": e.run_id(),
                "status": "failed",
                "error": e.to_string(),
            })),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Get a run's status, live progress counters and final result")]
    fn get_run(&self, Parameters(p): Parameters<RunIdParams>) -> Result<CallToolResult, McpError> {
        let run_id = match parse_run_id(&p.run_id) {
            Ok(id) => id,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.get_run(&run_id) {
            Ok(run) => ok_json(&run),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "List recent runs, newest first")]
    fn list_runs(&self, Parameters(p): Parameters<ListRunsParams>) -> Result<CallToolResult, McpError> {
        match self.orchestrator.list_runs(p.limit.unwrap_or(DEFAULT_LIST_LIMIT)) {
            Ok(runs) => ok_json(&runs),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "List a run's task units (one per source and date) with status and error")]
    fn list_tasks(&self, Parameters(p): Parameters<RunIdParams>) -> Result<CallToolResult, McpError> {
        let run_id = match parse_run_id(&p.run_id) {
            Ok(id) => id,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.list_tasks(&run_id) {
            Ok(tasks) => ok_json(&tasks),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Request cooperative cancellation of a run. Units already started finish; the rest stay pending.")]
    fn cancel_run(&self, Parameters(p): Parameters<RunIdParams>) -> Result<CallToolResult, McpError> {
        let run_id = match parse_run_id(&p.run_id) {
            Ok(id) => id,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.cancel_run(&run_id) {
            Ok(accepted) => ok_json(&serde_json::json!({ "run_id": run_id, "cancel_requested": accepted })),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Reset one failed task unit to pending and re-run it")]
    async fn retry_task(
        &self,
        Parameters(p): Parameters<RetryTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        let (run_id, date) = match (parse_run_id(&p.run_id), parse_date(&p.date)) {
            (Ok(id), Ok(date)) => (id, date),
            (Err(e), _) | (_, Err(e)) => return err_text(e),
        };
        match self.orchestrator.retry_task(&run_id, &p.source, date) {
            Ok(task) => ok_json(&task),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Reset every failed task unit of a run to pending and re-run them")]
    async fn retry_failed_tasks(
        &self,
        Parameters(p): Parameters<RunIdParams>,
    ) -> Result<CallToolResult, McpError> {
        let run_id = match parse_run_id(&p.run_id) {
            Ok(id) => id,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.retry_failed_tasks(&run_id) {
            Ok(reset) => ok_json(&serde_json::json!({ "run_id": run_id, "units_reset": reset })),
            Err(e) => err_text(e.to_string()),
        }
    }

    // ── Enrichment tools ────────────────────────────────────────────────

    #[tool(description = "Enrich every article still pending, optionally within a digest-date range")]
    async fn enrich_pending(
        &self,
        Parameters(p): Parameters<DateRangeParams>,
    ) -> Result<CallToolResult, McpError> {
        let range = match parse_range(p.date_from.as_deref(), p.date_to.as_deref()) {
            Ok(r) => r,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.enrich_pending(range).await {
            Ok(summary) => ok_json(&summary),
            Err(e) => err_text(e.to_string()),
        }
    }

    #[tool(description = "Retry articles whose enrichment failed, up to the configured retry cap")]
    async fn retry_failed_enrichment(
        &self,
        Parameters(p): Parameters<DateRangeParams>,
    ) -> Result<CallToolResult, McpError> {
        let range = match parse_range(p.date_from.as_deref(), p.date_to.as_deref()) {
            Ok(r) => r,
            Err(e) => return err_text(e),
        };
        match self.orchestrator.retry_failed_enrichment(range).await {
            Ok(summary) => ok_json(&summary),
            Err(e) => err_text(e.to_string()),
        }
    }
}

#[tool_handler]
impl ServerHandler for NewsroomMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "newsroom MCP server: trigger and monitor article ingestion runs, retry failed units, run enrichment sweeps"
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run_mcp_server(config: &Config, db_path: &Path) -> i32 {
    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to create tokio runtime: {}", e);
            return 1;
        }
    };

    rt.block_on(async {
        let store = match SqliteStore::open(db_path) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                eprintln!("failed to open database at {}: {}", db_path.display(), e);
                return 1;
            }
        };
        let orchestrator = match Orchestrator::from_config(config, store) {
            Ok(builder) => builder.build(),
            Err(e) => {
                eprintln!("invalid configuration: {}", e);
                return 1;
            }
        };
        if let Err(e) = orchestrator.recover_interrupted() {
            tracing::warn!(error = %e, "could not reconcile interrupted runs");
        }

        let server = NewsroomMcpServer::new(orchestrator);

        tracing::info!(db = %db_path.display(), "newsroom mcp server starting on stdio");

        let service = match server.serve(rmcp::transport::stdio()).await {
            Ok(s) => s,
            Err(e) => {
                eprintln!("failed to start MCP server: {}", e);
                return 1;
            }
        };

        if let Err(e) = service.waiting().await {
            eprintln!("MCP server error: {}", e);
            return 1;
        }

        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_defaults_end_to_start() {
        let range = parse_range(Some("2026-02-20"), None).unwrap().unwrap();
        assert_eq!(range.from, range.to);
        assert!(parse_range(None, None).unwrap().is_none());
        assert!(parse_range(None, Some("2026-02-20")).is_err());
        assert!(parse_range(Some("20/02/2026"), None).is_err());
    }

    #[test]
    fn test_selection_prefers_all_feeds() {
        let p = TriggerRunParams {
            date_from: "2026-02-20".into(),
            date_to: None,
            sources: vec!["hackernews".into()],
            all_feeds: true,
            feeds: Some(vec!["openai".into()]),
        };
        let selection = selection_from(&p);
        assert_eq!(selection.sources, vec!["hackernews".to_string()]);
        assert_eq!(selection.feeds, FeedSelection::All);
    }

    #[test]
    fn test_run_id_parse_errors_are_reported() {
        assert!(parse_run_id("not-a-uuid").unwrap_err().contains("not-a-uuid"));
        let id = RunId::new();
        assert_eq!(parse_run_id(&id.to_string()).unwrap(), id);
    }
}
