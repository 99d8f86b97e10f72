//! Related-article ranking by tag and category overlap

use crate::article::{ArticleId, StoredArticle};
use std::collections::HashSet;

/// How many related ids are kept per article.
pub const RELATED_LIMIT: usize = 3;

/// Trailing window, in days before the article's digest date.
pub const RELATED_WINDOW_DAYS: i64 = 30;

const CATEGORY_BONUS: f64 = 0.3;

/// Top related articles for `target` among `pool`.
///
/// Score is the Jaccard index of the tag sets plus a bonus for a shared
/// category. Unenriched articles and the target itself are skipped; only
/// positive scores count. Ties go to the lower id.
pub fn rank_related(target: &StoredArticle, pool: &[StoredArticle]) -> Vec<ArticleId> {
    let Some(payload) = &target.enrichment else {
        return Vec::new();
    };
    if payload.tags.is_empty() {
        return Vec::new();
    }
    let tags: HashSet<&str> = payload.tags.iter().map(String::as_str).collect();

    let mut scored: Vec<(ArticleId, f64)> = pool
        .iter()
        .filter(|other| other.id != target.id)
        .filter_map(|other| {
            let other_payload = other.enrichment.as_ref()?;
            let other_tags: HashSet<&str> = other_payload.tags.iter().map(String::as_str).collect();
            let union = tags.union(&other_tags).count().max(1);
            let jaccard = tags.intersection(&other_tags).count() as f64 / union as f64;
            let bonus = if other_payload.category == payload.category {
                CATEGORY_BONUS
            } else {
                0.0
            };
            let score = jaccard + bonus;
            (score > 0.0).then_some((other.id, score))
        })
        .collect();

    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.into_iter().take(RELATED_LIMIT).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::article::EnrichmentStatus;
    use crate::enrich::{Category, MockEnricher};
    use chrono::{NaiveDate, Utc};

    fn article(id: i64, tags: &[&str], category: Category) -> StoredArticle {
        let mut payload = MockEnricher::new().default_payload("x");
        payload.tags = tags.iter().map(|t| t.to_string()).collect();
        payload.category = category;
        StoredArticle {
            id: ArticleId(id),
            fingerprint: format!("fp{}", id),
            title: format!("t{}", id),
            url: format!("https://a.example/{}", id),
            source_id: "A".into(),
            source_name: "A".into(),
            author: None,
            published_at: None,
            digest_date: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
            summary: String::new(),
            engagement: 0,
            run_id: None,
            ingested_at: Utc::now(),
            embedding: None,
            also_reported_by: Vec::new(),
            enrichment_status: EnrichmentStatus::Done,
            enrichment: Some(payload),
            enrichment_error: None,
            enrich_retries: 0,
            related_ids: Vec::new(),
        }
    }

    #[test]
    fn test_ranks_by_overlap_plus_category_bonus() {
        let target = article(1, &["llms", "rag"], Category::Research);
        let pool = vec![
            target.clone(),
            article(2, &["llms", "rag"], Category::ToolsAndLibraries),
            article(3, &["llms"], Category::Research),
            article(4, &["robotics"], Category::Research),
            article(5, &["robotics"], Category::Tutorials),
            article(6, &["llms", "rag"], Category::Research),
        ];
        // 6: 1.0 + 0.3, 2: 1.0, 3: 0.5 + 0.3, 4: 0.3, 5: 0
        assert_eq!(rank_related(&target, &pool), vec![ArticleId(6), ArticleId(2), ArticleId(3)]);
    }

    #[test]
    fn test_untagged_target_has_no_related() {
        let target = article(1, &[], Category::Research);
        let pool = vec![article(2, &["llms"], Category::Research)];
        assert!(rank_related(&target, &pool).is_empty());
    }

    #[test]
    fn test_unenriched_articles_are_skipped() {
        let target = article(1, &["llms"], Category::Research);
        let mut other = article(2, &["llms"], Category::Research);
        other.enrichment = None;
        assert!(rank_related(&target, &[other]).is_empty());
    }
}
