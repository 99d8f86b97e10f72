//! SQLite storage backend for newsroom

use super::traits::{ArticleStore, DateRange, OpenStore, RunStore, StorageError, StorageResult};
use crate::article::{ArticleId, EnrichmentStatus, NewArticle, StoredArticle};
use crate::enrich::EnrichmentPayload;
use crate::run::{Run, RunId, RunProgress, RunStatus, TaskId, TaskStatus, TaskUnit};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Max bound parameters per `IN (...)` query.
const IN_CHUNK: usize = 500;

const RUN_COLUMNS: &str = "id, status, date_from, date_to, selection_json, created_at, started_at, \
     completed_at, progress_json, result_json, error_message, cancel_requested";

const TASK_COLUMNS: &str =
    "id, run_id, source, date, status, articles_saved, error_message, attempts, updated_at";

const ARTICLE_COLUMNS: &str = "id, fingerprint, title, url, source_id, source_name, author, \
     published_at, digest_date, summary, engagement, run_id, ingested_at, embedding_json, \
     also_reported_by_json, enrichment_status, enrichment_json, enrichment_error, enrich_retries, \
     related_ids_json";

/// SQLite-backed run registry and article store
///
/// Uses a single SQLite database file with tables for runs, task units and
/// articles. Thread-safe via internal mutex on the connection; other
/// processes observe the same file through WAL.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn day_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

fn parse_day(s: &str) -> StorageResult<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|e| StorageError::DateParse(format!("{}: {}", s, e)))
}

fn parse_ts(s: &str) -> StorageResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::DateParse(format!("{}: {}", s, e)))
}

fn parse_opt_ts(s: Option<String>) -> StorageResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_run_id(s: &str) -> StorageResult<RunId> {
    s.parse()
        .map_err(|e| StorageError::Corrupt(format!("run id {}: {}", s, e)))
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

impl SqliteStore {
    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            -- Runs: one row per pipeline invocation
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                date_from TEXT NOT NULL,
                date_to TEXT NOT NULL,
                selection_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                progress_json TEXT NOT NULL,
                progress_seq INTEGER NOT NULL DEFAULT 0,
                result_json TEXT,
                error_message TEXT,
                cancel_requested INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);

            -- Task units: one row per (run, source, date)
            CREATE TABLE IF NOT EXISTS task_units (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL,
                source TEXT NOT NULL,
                date TEXT NOT NULL,
                status TEXT NOT NULL,
                articles_saved INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                UNIQUE (run_id, source, date),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            );

            -- Articles: unique by URL fingerprint
            CREATE TABLE IF NOT EXISTS articles (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                fingerprint TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_name TEXT NOT NULL,
                author TEXT,
                published_at TEXT,
                digest_date TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                engagement INTEGER NOT NULL DEFAULT 0,
                run_id TEXT,
                ingested_at TEXT NOT NULL,
                embedding_json TEXT,
                also_reported_by_json TEXT NOT NULL DEFAULT '[]',
                enrichment_status TEXT NOT NULL DEFAULT 'pending',
                enrichment_json TEXT,
                enrichment_error TEXT,
                enrich_retries INTEGER NOT NULL DEFAULT 0,
                related_ids_json TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX IF NOT EXISTS idx_articles_digest_date ON articles(digest_date);
            CREATE INDEX IF NOT EXISTS idx_articles_enrichment ON articles(enrichment_status, digest_date);
            CREATE INDEX IF NOT EXISTS idx_articles_run ON articles(run_id);

            PRAGMA foreign_keys = ON;

            -- WAL so pollers in other processes can read while a run writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn from_connection(conn: Connection) -> StorageResult<Self> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_run(row: &Row<'_>) -> StorageResult<Run> {
        let id: String = row.get(0)?;
        let status: String = row.get(1)?;
        let date_from: String = row.get(2)?;
        let date_to: String = row.get(3)?;
        let selection_json: String = row.get(4)?;
        let created_at: String = row.get(5)?;
        let progress_json: String = row.get(8)?;
        let result_json: Option<String> = row.get(9)?;
        let cancel_requested: i64 = row.get(11)?;

        Ok(Run {
            id: parse_run_id(&id)?,
            status: status
                .parse::<RunStatus>()
                .map_err(|e| StorageError::Corrupt(e.to_string()))?,
            date_from: parse_day(&date_from)?,
            date_to: parse_day(&date_to)?,
            selection: serde_json::from_str(&selection_json)?,
            created_at: parse_ts(&created_at)?,
            started_at: parse_opt_ts(row.get(6)?)?,
            completed_at: parse_opt_ts(row.get(7)?)?,
            progress: serde_json::from_str::<RunProgress>(&progress_json)?,
            result: result_json.as_deref().map(serde_json::from_str).transpose()?,
            error_message: row.get(10)?,
            cancel_requested: cancel_requested != 0,
        })
    }

    fn read_task(row: &Row<'_>) -> StorageResult<TaskUnit> {
        let id: String = row.get(0)?;
        let run_id: String = row.get(1)?;
        let date: String = row.get(3)?;
        let status: String = row.get(4)?;
        let articles_saved: i64 = row.get(5)?;
        let attempts: i64 = row.get(7)?;
        let updated_at: String = row.get(8)?;

        Ok(TaskUnit {
            id: id
                .parse::<TaskId>()
                .map_err(|e| StorageError::Corrupt(format!("task id {}: {}", id, e)))?,
            run_id: parse_run_id(&run_id)?,
            source: row.get(2)?,
            date: parse_day(&date)?,
            status: status
                .parse::<TaskStatus>()
                .map_err(|e| StorageError::Corrupt(e.to_string()))?,
            articles_saved: articles_saved.max(0) as u64,
            error_message: row.get(6)?,
            attempts: attempts.max(0) as u32,
            updated_at: parse_ts(&updated_at)?,
        })
    }

    fn read_article(row: &Row<'_>) -> StorageResult<StoredArticle> {
        let published_at: Option<String> = row.get(7)?;
        let digest_date: String = row.get(8)?;
        let run_id: Option<String> = row.get(11)?;
        let ingested_at: String = row.get(12)?;
        let embedding_json: Option<String> = row.get(13)?;
        let also_reported_by_json: String = row.get(14)?;
        let enrichment_status: String = row.get(15)?;
        let enrichment_json: Option<String> = row.get(16)?;
        let enrich_retries: i64 = row.get(18)?;
        let related_ids_json: String = row.get(19)?;

        Ok(StoredArticle {
            id: ArticleId(row.get(0)?),
            fingerprint: row.get(1)?,
            title: row.get(2)?,
            url: row.get(3)?,
            source_id: row.get(4)?,
            source_name: row.get(5)?,
            author: row.get(6)?,
            published_at: parse_opt_ts(published_at)?,
            digest_date: parse_day(&digest_date)?,
            summary: row.get(9)?,
            engagement: row.get(10)?,
            run_id: run_id.as_deref().map(parse_run_id).transpose()?,
            ingested_at: parse_ts(&ingested_at)?,
            embedding: embedding_json.as_deref().map(serde_json::from_str).transpose()?,
            also_reported_by: serde_json::from_str(&also_reported_by_json)?,
            enrichment_status: enrichment_status
                .parse::<EnrichmentStatus>()
                .map_err(StorageError::Corrupt)?,
            enrichment: enrichment_json
                .as_deref()
                .map(serde_json::from_str::<EnrichmentPayload>)
                .transpose()?,
            enrichment_error: row.get(17)?,
            enrich_retries: enrich_retries.max(0) as u32,
            related_ids: serde_json::from_str(&related_ids_json)?,
        })
    }

    fn query_articles(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> StorageResult<Vec<StoredArticle>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut articles = Vec::new();
        while let Some(row) = rows.next()? {
            articles.push(Self::read_article(row)?);
        }
        Ok(articles)
    }

    fn query_runs(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> StorageResult<Vec<Run>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params)?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next()? {
            runs.push(Self::read_run(row)?);
        }
        Ok(runs)
    }

    fn range_params(range: Option<DateRange>) -> (Option<String>, Option<String>) {
        match range {
            Some(r) => (Some(day_str(r.from)), Some(day_str(r.to))),
            None => (None, None),
        }
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?)
    }

    fn open_in_memory() -> StorageResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }
}

impl RunStore for SqliteStore {
    fn create_run(&self, run: &Run, tasks: &[TaskUnit]) -> StorageResult<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO runs (id, status, date_from, date_to, selection_json, created_at, started_at,
                              completed_at, progress_json, progress_seq, result_json, error_message,
                              cancel_requested)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12)
            "#,
            params![
                run.id.to_string(),
                run.status.as_str(),
                day_str(run.date_from),
                day_str(run.date_to),
                serde_json::to_string(&run.selection)?,
                run.created_at.to_rfc3339(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&run.progress)?,
                run.result.as_ref().map(serde_json::to_string).transpose()?,
                run.error_message,
                run.cancel_requested as i64,
            ],
        )?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO task_units (id, run_id, source, date, status, articles_saved,
                                        error_message, attempts, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
            )?;
            for task in tasks {
                stmt.execute(params![
                    task.id.to_string(),
                    task.run_id.to_string(),
                    task.source,
                    day_str(task.date),
                    task.status.as_str(),
                    task.articles_saved as i64,
                    task.error_message,
                    task.attempts as i64,
                    task.updated_at.to_rfc3339(),
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_run(&self, id: &RunId) -> StorageResult<Option<Run>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
        Ok(Self::query_runs(&conn, &sql, params![id.to_string()])?.pop())
    }

    fn list_runs(&self, limit: usize) -> StorageResult<Vec<Run>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM runs ORDER BY created_at DESC, rowid DESC LIMIT ?1",
            RUN_COLUMNS
        );
        Self::query_runs(&conn, &sql, params![limit as i64])
    }

    fn runs_with_status(&self, statuses: &[RunStatus]) -> StorageResult<Vec<Run>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM runs WHERE status IN ({}) ORDER BY created_at, rowid",
            RUN_COLUMNS,
            placeholders(statuses.len())
        );
        Self::query_runs(&conn, &sql, params_from_iter(statuses.iter().map(|s| s.as_str())))
    }

    fn transition_run(&self, run: &Run, expected: RunStatus) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"
            UPDATE runs SET status = ?1, started_at = ?2, completed_at = ?3, result_json = ?4,
                            error_message = ?5
            WHERE id = ?6 AND status = ?7
            "#,
            params![
                run.status.as_str(),
                run.started_at.map(|t| t.to_rfc3339()),
                run.completed_at.map(|t| t.to_rfc3339()),
                run.result.as_ref().map(serde_json::to_string).transpose()?,
                run.error_message,
                run.id.to_string(),
                expected.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }

    fn save_progress(&self, id: &RunId, progress: &RunProgress, seq: u64) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE runs SET progress_json = ?1, progress_seq = ?2 WHERE id = ?3 AND progress_seq < ?2",
            params![serde_json::to_string(progress)?, seq as i64, id.to_string()],
        )?;
        Ok(rows > 0)
    }

    fn progress_seq(&self, id: &RunId) -> StorageResult<u64> {
        let conn = self.conn.lock().unwrap();
        let seq: Option<i64> = conn
            .query_row(
                "SELECT progress_seq FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(seq.unwrap_or(0).max(0) as u64)
    }

    fn request_cancel(&self, id: &RunId) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE runs SET cancel_requested = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(rows > 0)
    }

    fn is_cancel_requested(&self, id: &RunId) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM runs WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(flag.unwrap_or(0) != 0)
    }

    fn list_tasks(&self, run_id: &RunId) -> StorageResult<Vec<TaskUnit>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM task_units WHERE run_id = ?1 ORDER BY date, rowid",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![run_id.to_string()])?;
        let mut tasks = Vec::new();
        while let Some(row) = rows.next()? {
            tasks.push(Self::read_task(row)?);
        }
        Ok(tasks)
    }

    fn get_task(&self, run_id: &RunId, source: &str, date: NaiveDate) -> StorageResult<Option<TaskUnit>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM task_units WHERE run_id = ?1 AND source = ?2 AND date = ?3",
            TASK_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![run_id.to_string(), source, day_str(date)])?;
        match rows.next()? {
            Some(row) => Ok(Some(Self::read_task(row)?)),
            None => Ok(None),
        }
    }

    fn transition_task(&self, task: &TaskUnit, expected: TaskStatus) -> StorageResult<bool> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"
            UPDATE task_units SET status = ?1, articles_saved = ?2, error_message = ?3,
                                  attempts = ?4, updated_at = ?5
            WHERE id = ?6 AND status = ?7
            "#,
            params![
                task.status.as_str(),
                task.articles_saved as i64,
                task.error_message,
                task.attempts as i64,
                task.updated_at.to_rfc3339(),
                task.id.to_string(),
                expected.as_str(),
            ],
        )?;
        Ok(rows > 0)
    }
}

impl ArticleStore for SqliteStore {
    fn insert_article(&self, article: &NewArticle) -> StorageResult<Option<ArticleId>> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"
            INSERT INTO articles (fingerprint, title, url, source_id, source_name, author,
                                  published_at, digest_date, summary, engagement, run_id,
                                  ingested_at, embedding_json)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(fingerprint) DO NOTHING
            "#,
            params![
                article.fingerprint,
                article.title,
                article.url,
                article.source_id,
                article.source_name,
                article.author,
                article.published_at.map(|t| t.to_rfc3339()),
                day_str(article.digest_date),
                article.summary,
                article.engagement,
                article.run_id.map(|id| id.to_string()),
                Utc::now().to_rfc3339(),
                article.embedding.as_ref().map(serde_json::to_string).transpose()?,
            ],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(ArticleId(conn.last_insert_rowid())))
    }

    fn existing_fingerprints(&self, fingerprints: &[String]) -> StorageResult<HashSet<String>> {
        let conn = self.conn.lock().unwrap();
        let mut found = HashSet::new();
        for chunk in fingerprints.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT fingerprint FROM articles WHERE fingerprint IN ({})",
                placeholders(chunk.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| row.get::<_, String>(0))?;
            for fp in rows {
                found.insert(fp?);
            }
        }
        Ok(found)
    }

    fn get_article(&self, id: ArticleId) -> StorageResult<Option<StoredArticle>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM articles WHERE id = ?1", ARTICLE_COLUMNS);
        Ok(Self::query_articles(&conn, &sql, params![id.0])?.pop())
    }

    fn get_articles(&self, ids: &[ArticleId]) -> StorageResult<Vec<StoredArticle>> {
        let conn = self.conn.lock().unwrap();
        let mut articles = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(IN_CHUNK) {
            let sql = format!(
                "SELECT {} FROM articles WHERE id IN ({})",
                ARTICLE_COLUMNS,
                placeholders(chunk.len())
            );
            articles.extend(Self::query_articles(&conn, &sql, params_from_iter(chunk.iter().map(|id| id.0)))?);
        }
        articles.sort_by_key(|a| a.id);
        articles.dedup_by_key(|a| a.id);
        Ok(articles)
    }

    fn find_by_fingerprint(&self, fingerprint: &str) -> StorageResult<Option<StoredArticle>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM articles WHERE fingerprint = ?1", ARTICLE_COLUMNS);
        Ok(Self::query_articles(&conn, &sql, params![fingerprint])?.pop())
    }

    fn embeddings_for_corpus(
        &self,
        range: DateRange,
        run_id: Option<&RunId>,
    ) -> StorageResult<Vec<(ArticleId, Vec<f32>)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, embedding_json FROM articles
            WHERE embedding_json IS NOT NULL
              AND ((digest_date BETWEEN ?1 AND ?2) OR run_id = ?3)
            ORDER BY id
            "#,
        )?;
        let rows = stmt.query_map(
            params![day_str(range.from), day_str(range.to), run_id.map(|id| id.to_string())],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )?;
        let mut out = Vec::new();
        for row in rows {
            let (id, json) = row?;
            out.push((ArticleId(id), serde_json::from_str(&json)?));
        }
        Ok(out)
    }

    fn add_reported_by(&self, id: ArticleId, source_name: &str) -> StorageResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(String, String)> = tx
            .query_row(
                "SELECT source_name, also_reported_by_json FROM articles WHERE id = ?1",
                params![id.0],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (canonical, json) = row.ok_or(StorageError::ArticleNotFound(id.0))?;

        let mut reporters: Vec<String> = serde_json::from_str(&json)?;
        if canonical == source_name || reporters.iter().any(|r| r == source_name) {
            return Ok(false);
        }
        reporters.push(source_name.to_string());
        tx.execute(
            "UPDATE articles SET also_reported_by_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(&reporters)?, id.0],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn count_articles(&self) -> StorageResult<usize> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM articles", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn list_articles_for_run(&self, run_id: &RunId) -> StorageResult<Vec<StoredArticle>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!("SELECT {} FROM articles WHERE run_id = ?1 ORDER BY id", ARTICLE_COLUMNS);
        Self::query_articles(&conn, &sql, params![run_id.to_string()])
    }

    fn articles_with_enrichment_status(
        &self,
        status: EnrichmentStatus,
        range: Option<DateRange>,
    ) -> StorageResult<Vec<ArticleId>> {
        let conn = self.conn.lock().unwrap();
        let (from, to) = Self::range_params(range);
        let mut stmt = conn.prepare(
            r#"
            SELECT id FROM articles
            WHERE enrichment_status = ?1
              AND (?2 IS NULL OR digest_date BETWEEN ?2 AND ?3)
            ORDER BY id
            "#,
        )?;
        let ids = stmt
            .query_map(params![status.as_str(), from, to], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(ArticleId))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    fn save_enrichment(&self, id: ArticleId, payload: &EnrichmentPayload) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            r#"
            UPDATE articles SET enrichment_status = 'done', enrichment_json = ?1,
                                enrichment_error = NULL
            WHERE id = ?2
            "#,
            params![serde_json::to_string(payload)?, id.0],
        )?;
        if rows == 0 {
            return Err(StorageError::ArticleNotFound(id.0));
        }
        Ok(())
    }

    fn mark_enrichment_failed(&self, id: ArticleId, error: &str) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        let rows = conn.execute(
            "UPDATE articles SET enrichment_status = 'failed', enrichment_error = ?1 WHERE id = ?2",
            params![error, id.0],
        )?;
        if rows == 0 {
            return Err(StorageError::ArticleNotFound(id.0));
        }
        Ok(())
    }

    fn reset_failed_enrichment(&self, range: Option<DateRange>, retry_cap: u32) -> StorageResult<Vec<ArticleId>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let (from, to) = Self::range_params(range);

        let ids = {
            let mut stmt = tx.prepare(
                r#"
                SELECT id FROM articles
                WHERE enrichment_status = 'failed'
                  AND enrich_retries < ?1
                  AND (?2 IS NULL OR digest_date BETWEEN ?2 AND ?3)
                ORDER BY id
                "#,
            )?;
            let ids = stmt
                .query_map(params![retry_cap as i64, from, to], |row| row.get::<_, i64>(0))?
                .map(|r| r.map(ArticleId))
                .collect::<Result<Vec<_>, _>>()?;
            ids
        };

        for id in &ids {
            tx.execute(
                r#"
                UPDATE articles SET enrichment_status = 'pending', enrich_retries = enrich_retries + 1
                WHERE id = ?1
                "#,
                params![id.0],
            )?;
        }
        tx.commit()?;
        Ok(ids)
    }

    fn enriched_articles(&self, range: DateRange) -> StorageResult<Vec<StoredArticle>> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM articles WHERE enrichment_status = 'done' AND digest_date BETWEEN ?1 AND ?2 ORDER BY id",
            ARTICLE_COLUMNS
        );
        Self::query_articles(&conn, &sql, params![day_str(range.from), day_str(range.to)])
    }

    fn set_related(&self, id: ArticleId, related: &[ArticleId]) -> StorageResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE articles SET related_ids_json = ?1 WHERE id = ?2",
            params![serde_json::to_string(related)?, id.0],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::CandidateArticle;
    use crate::enrich::MockEnricher;
    use crate::run::SourceSelection;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, d).unwrap()
    }

    fn create_test_run(store: &SqliteStore) -> (Run, Vec<TaskUnit>) {
        let run = Run::new(day(20), day(21), SourceSelection::new(["A", "B"]));
        let tasks = vec![
            TaskUnit::new(run.id, "A", day(20)),
            TaskUnit::new(run.id, "B", day(20)),
        ];
        store.create_run(&run, &tasks).unwrap();
        (run, tasks)
    }

    fn create_test_article(url: &str, date: NaiveDate) -> NewArticle {
        let candidate = CandidateArticle::new(format!("Title for {}", url), url).with_source_name("Source A");
        NewArticle::from_candidate(&candidate, "A", date, None, Some(vec![1.0, 0.0]))
    }

    // ========================================================================
    // Run registry
    // ========================================================================

    #[test]
    fn test_create_and_load_run_with_tasks() {
        let store = create_test_store();
        let (run, tasks) = create_test_run(&store);

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.selection, run.selection);
        assert_eq!(loaded.date_to, day(21));

        let loaded_tasks = store.list_tasks(&run.id).unwrap();
        assert_eq!(loaded_tasks.len(), 2);
        assert_eq!(loaded_tasks[0].id, tasks[0].id);
        assert_eq!(loaded_tasks[1].source, "B");
    }

    #[test]
    fn test_duplicate_task_triple_is_rejected() {
        let store = create_test_store();
        let run = Run::new(day(20), day(20), SourceSelection::new(["A"]));
        let tasks = vec![TaskUnit::new(run.id, "A", day(20)), TaskUnit::new(run.id, "A", day(20))];
        assert!(store.create_run(&run, &tasks).is_err());
        assert!(store.get_run(&run.id).unwrap().is_none(), "failed create must roll back");
    }

    #[test]
    fn test_transition_run_is_compare_and_set() {
        let store = create_test_store();
        let (mut run, _) = create_test_run(&store);

        run.transition(RunStatus::Running).unwrap();
        assert!(store.transition_run(&run, RunStatus::Queued).unwrap());
        // Stale expectation loses
        assert!(!store.transition_run(&run, RunStatus::Queued).unwrap());

        let loaded = store.get_run(&run.id).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[test]
    fn test_progress_sequence_guard_rejects_stale_writes() {
        let store = create_test_store();
        let (run, _) = create_test_run(&store);

        let mut newer = RunProgress::new(2, 2);
        newer.saved = 5;
        let mut older = RunProgress::new(2, 2);
        older.saved = 3;

        assert!(store.save_progress(&run.id, &newer, 2).unwrap());
        assert!(!store.save_progress(&run.id, &older, 1).unwrap());
        assert!(!store.save_progress(&run.id, &older, 2).unwrap());

        assert_eq!(store.get_run(&run.id).unwrap().unwrap().progress.saved, 5);
        assert_eq!(store.progress_seq(&run.id).unwrap(), 2);
        assert_eq!(store.progress_seq(&RunId::new()).unwrap(), 0);
    }

    #[test]
    fn test_cancel_flag_persists() {
        let store = create_test_store();
        let (run, _) = create_test_run(&store);
        assert!(!store.is_cancel_requested(&run.id).unwrap());
        assert!(store.request_cancel(&run.id).unwrap());
        assert!(store.is_cancel_requested(&run.id).unwrap());
        assert!(!store.request_cancel(&RunId::new()).unwrap());
    }

    #[test]
    fn test_task_transition_and_lookup() {
        let store = create_test_store();
        let (run, mut tasks) = create_test_run(&store);

        let task = &mut tasks[0];
        task.start().unwrap();
        assert!(store.transition_task(task, TaskStatus::Pending).unwrap());
        task.fail("boom", 2).unwrap();
        assert!(store.transition_task(task, TaskStatus::Running).unwrap());

        let loaded = store.get_task(&run.id, "A", day(20)).unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Failed);
        assert_eq!(loaded.error_message.as_deref(), Some("boom"));
        assert_eq!(loaded.attempts, 1);
        assert_eq!(loaded.articles_saved, 2);
        assert!(store.get_task(&run.id, "A", day(21)).unwrap().is_none());
    }

    #[test]
    fn test_list_runs_newest_first_and_by_status() {
        let store = create_test_store();
        let (first, _) = create_test_run(&store);
        let (second, _) = create_test_run(&store);

        let runs = store.list_runs(10).unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(store.list_runs(1).unwrap().len(), 1);

        let queued = store.runs_with_status(&[RunStatus::Queued, RunStatus::Running]).unwrap();
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].id, first.id);
        assert!(store.runs_with_status(&[RunStatus::Success]).unwrap().is_empty());
    }

    // ========================================================================
    // Articles
    // ========================================================================

    #[test]
    fn test_insert_is_idempotent_on_fingerprint() {
        let store = create_test_store();
        let article = create_test_article("https://a.example/1", day(20));

        let first = store.insert_article(&article).unwrap();
        assert!(first.is_some());
        let again = store.insert_article(&article).unwrap();
        assert!(again.is_none());
        assert_eq!(store.count_articles().unwrap(), 1);
    }

    #[test]
    fn test_existing_fingerprints() {
        let store = create_test_store();
        let a = create_test_article("https://a.example/1", day(20));
        store.insert_article(&a).unwrap();

        let found = store
            .existing_fingerprints(&[a.fingerprint.clone(), "missing".to_string()])
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(found.contains(&a.fingerprint));
    }

    #[test]
    fn test_article_round_trips_through_row() {
        let store = create_test_store();
        let run_id = RunId::new();
        let mut a = create_test_article("https://a.example/1", day(20));
        a.run_id = Some(run_id);
        let id = store.insert_article(&a).unwrap().unwrap();

        let loaded = store.get_article(id).unwrap().unwrap();
        assert_eq!(loaded.fingerprint, a.fingerprint);
        assert_eq!(loaded.run_id, Some(run_id));
        assert_eq!(loaded.embedding, Some(vec![1.0, 0.0]));
        assert_eq!(loaded.enrichment_status, EnrichmentStatus::Pending);
        assert!(loaded.also_reported_by.is_empty());
        assert_eq!(store.find_by_fingerprint(&a.fingerprint).unwrap().unwrap().id, id);
    }

    #[test]
    fn test_corpus_window_includes_same_run() {
        let store = create_test_store();
        let run_id = RunId::new();
        let old = create_test_article("https://a.example/old", day(1));
        let mut same_run = create_test_article("https://a.example/run", day(2));
        same_run.run_id = Some(run_id);
        let recent = create_test_article("https://a.example/recent", day(19));
        let mut no_embedding = create_test_article("https://a.example/none", day(20));
        no_embedding.embedding = None;
        for a in [&old, &same_run, &recent, &no_embedding] {
            store.insert_article(a).unwrap();
        }

        let window = DateRange::new(day(13), day(20));
        assert_eq!(store.embeddings_for_corpus(window, None).unwrap().len(), 1);
        let with_run = store.embeddings_for_corpus(window, Some(&run_id)).unwrap();
        assert_eq!(with_run.len(), 2);
        assert!(with_run[0].0 < with_run[1].0);
    }

    #[test]
    fn test_add_reported_by_keeps_canonical_source() {
        let store = create_test_store();
        let id = store
            .insert_article(&create_test_article("https://a.example/1", day(20)))
            .unwrap()
            .unwrap();

        assert!(!store.add_reported_by(id, "Source A").unwrap());
        assert!(store.add_reported_by(id, "Source B").unwrap());
        assert!(!store.add_reported_by(id, "Source B").unwrap());

        let loaded = store.get_article(id).unwrap().unwrap();
        assert_eq!(loaded.source_name, "Source A");
        assert_eq!(loaded.also_reported_by, vec!["Source B".to_string()]);
        assert!(matches!(
            store.add_reported_by(ArticleId(999), "X"),
            Err(StorageError::ArticleNotFound(999))
        ));
    }

    #[test]
    fn test_enrichment_status_lifecycle_and_retry_cap() {
        let store = create_test_store();
        let id = store
            .insert_article(&create_test_article("https://a.example/1", day(20)))
            .unwrap()
            .unwrap();

        for attempt in 1..=3 {
            store.mark_enrichment_failed(id, "timeout").unwrap();
            let reset = store.reset_failed_enrichment(None, 3).unwrap();
            assert_eq!(reset, vec![id], "attempt {}", attempt);
        }
        store.mark_enrichment_failed(id, "timeout").unwrap();
        assert!(store.reset_failed_enrichment(None, 3).unwrap().is_empty());

        let loaded = store.get_article(id).unwrap().unwrap();
        assert_eq!(loaded.enrich_retries, 3);
        assert_eq!(loaded.enrichment_status, EnrichmentStatus::Failed);

        let payload = MockEnricher::new().default_payload("Title");
        store.save_enrichment(id, &payload).unwrap();
        let loaded = store.get_article(id).unwrap().unwrap();
        assert_eq!(loaded.enrichment_status, EnrichmentStatus::Done);
        assert_eq!(loaded.enrichment, Some(payload));
        assert!(loaded.enrichment_error.is_none());
    }

    #[test]
    fn test_enrichment_status_query_respects_range() {
        let store = create_test_store();
        store.insert_article(&create_test_article("https://a.example/1", day(10))).unwrap();
        store.insert_article(&create_test_article("https://a.example/2", day(20))).unwrap();

        let all = store.articles_with_enrichment_status(EnrichmentStatus::Pending, None).unwrap();
        assert_eq!(all.len(), 2);
        let ranged = store
            .articles_with_enrichment_status(EnrichmentStatus::Pending, Some(DateRange::day(day(20))))
            .unwrap();
        assert_eq!(ranged.len(), 1);
    }

    // ========================================================================
    // On-disk behaviour
    // ========================================================================

    #[test]
    fn test_wal_mode_enabled_at_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test-wal.db");
        let store = SqliteStore::open(&db_path).unwrap();

        let journal_mode: String = store
            .conn
            .lock()
            .unwrap()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();

        assert_eq!(journal_mode, "wal");
    }

    #[test]
    fn test_second_connection_sees_run_state() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("runs.db");

        let writer = SqliteStore::open(&db_path).unwrap();
        let (mut run, _) = create_test_run(&writer);
        let reader = SqliteStore::open(&db_path).unwrap();

        run.transition(RunStatus::Running).unwrap();
        writer.transition_run(&run, RunStatus::Queued).unwrap();

        let seen = reader.get_run(&run.id).unwrap().unwrap();
        assert_eq!(seen.status, RunStatus::Running);
        assert_eq!(reader.list_tasks(&run.id).unwrap().len(), 2);
    }
}
