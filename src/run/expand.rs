//! Expansion of a date range × source selection into task units

use super::{FeedSelection, SourceSelection};
use crate::source::{SourceRegistry, FEED_SET_SOURCE};
use chrono::NaiveDate;
use thiserror::Error;

/// Reasons a run cannot be expanded into task units
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExpansionError {
    #[error("invalid date range: {from} is after {to}")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },

    #[error("date range spans {days} days, limit is {max}")]
    RangeTooLarge { days: u64, max: u64 },

    #[error("no sources selected")]
    EmptySelection,

    #[error("unknown source: {0}")]
    UnknownSource(String),

    #[error("unknown feed: {0}")]
    UnknownFeed(String),

    #[error("feed set selected but no feeds are configured")]
    NoFeedsConfigured,
}

/// Every calendar day in `[from, to]`, ascending. Empty if `from > to`.
pub fn expand_dates(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days().take_while(|d| *d <= to).collect()
}

/// Validate a selection and expand it into `(source, date)` pairs.
///
/// Units are ordered by date, then by the order sources were selected, with
/// the synthetic feed-set unit last for each day. Repeated source ids are
/// collapsed.
pub fn expand(
    from: NaiveDate,
    to: NaiveDate,
    selection: &SourceSelection,
    max_range_days: u64,
    registry: &SourceRegistry,
) -> Result<Vec<(String, NaiveDate)>, ExpansionError> {
    if from > to {
        return Err(ExpansionError::InvalidDateRange { from, to });
    }
    let days = (to - from).num_days() as u64 + 1;
    if max_range_days > 0 && days > max_range_days {
        return Err(ExpansionError::RangeTooLarge {
            days,
            max: max_range_days,
        });
    }
    if selection.is_empty() {
        return Err(ExpansionError::EmptySelection);
    }

    let mut sources: Vec<&str> = Vec::with_capacity(selection.sources.len() + 1);
    for source in &selection.sources {
        if source == FEED_SET_SOURCE || !registry.has_source(source) {
            return Err(ExpansionError::UnknownSource(source.clone()));
        }
        if !sources.contains(&source.as_str()) {
            sources.push(source);
        }
    }

    match &selection.feeds {
        FeedSelection::None => {}
        FeedSelection::All => {
            if registry.feed_ids().is_empty() {
                return Err(ExpansionError::NoFeedsConfigured);
            }
            sources.push(FEED_SET_SOURCE);
        }
        FeedSelection::Only(ids) => {
            if ids.is_empty() {
                return Err(ExpansionError::NoFeedsConfigured);
            }
            if let Some(unknown) = ids.iter().find(|id| !registry.has_feed(id)) {
                return Err(ExpansionError::UnknownFeed(unknown.clone()));
            }
            sources.push(FEED_SET_SOURCE);
        }
    }

    let units = expand_dates(from, to)
        .into_iter()
        .flat_map(|date| sources.iter().map(move |s| (s.to_string(), date)))
        .collect();
    Ok(units)
}
