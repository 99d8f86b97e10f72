//! Command-backed sources and enricher, wired from YAML configuration
//!
//! Scrapers and the enricher are `sh -c` scripts, so these only run on unix.
//!
//! Run with: `cargo test --test command_collaborators`

#![cfg(unix)]

mod common;

use common::{create_test_store, day};
use newsroom::article::EnrichmentStatus;
use newsroom::config::Config;
use newsroom::enrich::Category;
use newsroom::pipeline::Orchestrator;
use newsroom::run::{FeedSelection, RunStatus, SourceSelection, TaskStatus};
use newsroom::source::FEED_SET_SOURCE;
use newsroom::storage::ArticleStore;
use std::path::Path;

const CONFIG: &str = r#"
pipeline:
  concurrency: 2
  batch_size: 1
enrichment:
  concurrency: 2
  command:
    - sh
    - -c
    - |
      cat > /dev/null
      echo '{"category":"Research","tags":["Science"],"summary":"checked"}'
sources:
  - id: alpha
    name: Alpha Wire
    command:
      - sh
      - -c
      - |
        echo "{\"title\":\"quantum chip breakthrough announced\",\"url\":\"https://alpha.example/$1/chip\"}"
        echo "{\"title\":\"harbor cranes strike continues\",\"url\":\"https://alpha.example/$1/cranes\"}"
      - sh
  - id: broken
    command:
      - sh
      - -c
      - |
        echo '{"title":"volcano ash grounds flights","url":"https://broken.example/ash"}'
        exit 3
      - sh
feeds:
  - id: orchard
    name: Orchard Notes
    command:
      - sh
      - -c
      - |
        echo '{"title":"late frost damages apple blossoms","url":"https://orchard.example/frost"}'
      - sh
"#;

fn orchestrator() -> (Orchestrator, std::sync::Arc<newsroom::SqliteStore>) {
    let config = Config::from_yaml(CONFIG, Path::new("collaborators.yaml")).unwrap();
    let store = create_test_store();
    let orch = Orchestrator::from_config(&config, store.clone()).unwrap().build();
    (orch, store)
}

#[tokio::test]
async fn configured_commands_drive_a_full_run() {
    let (orch, store) = orchestrator();
    let selection = SourceSelection::new(["alpha"]).with_feeds(FeedSelection::All);

    let run_id = orch.start_run(day(20), day(20), selection).unwrap();
    let run = orch.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.progress.tasks_total, 2);
    assert_eq!(run.progress.saved, 3);
    assert_eq!(run.progress.enriched, 3);

    let tasks = orch.list_tasks(&run_id).unwrap();
    assert!(tasks.iter().any(|t| t.source == FEED_SET_SOURCE));

    let saved = store.list_articles_for_run(&run_id).unwrap();
    let chip = saved.iter().find(|a| a.title.contains("quantum")).unwrap();
    // The date argument reaches the scraper
    assert_eq!(chip.url, "https://alpha.example/2026-02-20/chip");
    assert_eq!(chip.source_name, "Alpha Wire");
    let frost = saved.iter().find(|a| a.title.contains("frost")).unwrap();
    assert_eq!(frost.source_name, "Orchard Notes");

    assert!(saved.iter().all(|a| a.enrichment_status == EnrichmentStatus::Done));
    let payload = chip.enrichment.as_ref().unwrap();
    assert_eq!(payload.category, Category::Research);
    assert_eq!(payload.tags, vec!["science".to_string()]);
}

#[tokio::test]
async fn failing_scraper_fails_only_its_unit() {
    let (orch, store) = orchestrator();

    let run_id = orch
        .start_run(day(20), day(20), SourceSelection::new(["alpha", "broken"]))
        .unwrap();
    let run = orch.wait(&run_id).await.unwrap();

    assert_eq!(run.status, RunStatus::Partial);
    let tasks = orch.list_tasks(&run_id).unwrap();
    let broken = tasks.iter().find(|t| t.source == "broken").unwrap();
    assert_eq!(broken.status, TaskStatus::Failed);
    assert!(broken.error_message.as_deref().unwrap().contains("exited with"));
    // Items read before the exit are kept
    assert_eq!(broken.articles_saved, 1);
    let alpha = tasks.iter().find(|t| t.source == "alpha").unwrap();
    assert_eq!(alpha.status, TaskStatus::Success);

    assert_eq!(store.count_articles().unwrap(), 3);
}
