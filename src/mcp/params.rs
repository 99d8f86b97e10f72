//! MCP tool parameter structs with schemars-derived JSON schemas.

use schemars::JsonSchema;
use serde::Deserialize;

// ── Run params ──────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct TriggerRunParams {
    #[schemars(description = "First digest date, YYYY-MM-DD")]
    pub date_from: String,
    #[schemars(description = "Last digest date, YYYY-MM-DD (defaults to date_from)")]
    pub date_to: Option<String>,
    #[schemars(description = "Source ids to ingest from")]
    #[serde(default)]
    pub sources: Vec<String>,
    #[schemars(description = "Include every configured feed")]
    #[serde(default)]
    pub all_feeds: bool,
    #[schemars(description = "Include only these feed ids (ignored when all_feeds is set)")]
    pub feeds: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunIdParams {
    #[schemars(description = "The run ID")]
    pub run_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListRunsParams {
    #[schemars(description = "Maximum runs to return, newest first (default 20)")]
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RetryTaskParams {
    #[schemars(description = "The run ID")]
    pub run_id: String,
    #[schemars(description = "Source id of the failed unit")]
    pub source: String,
    #[schemars(description = "Date of the failed unit, YYYY-MM-DD")]
    pub date: String,
}

// ── Enrichment params ───────────────────────────────────────────────────

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DateRangeParams {
    #[schemars(description = "First digest date, YYYY-MM-DD (optional)")]
    pub date_from: Option<String>,
    #[schemars(description = "Last digest date, YYYY-MM-DD (defaults to date_from)")]
    pub date_to: Option<String>,
}
