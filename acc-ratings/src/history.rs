//! Comparison of bucketed ratings at two instants.
//!
//! Each side of a [`Comparison`] only reflects ratings timestamped at or
//! before its instant. The two sides need not cover the same assessments;
//! anything without ratings at an instant is reported as "No Rating".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::aggregation::{AggregatedRating, Bucket, Distribution};
use crate::store::{HistoricalEntry, RatingStore};
use crate::types::AssessmentId;
use crate::{Error, Result};

/// Which end of the window a snapshot belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Boundary {
    Start,
    End,
}

impl fmt::Display for Boundary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Boundary::Start => write!(f, "start"),
            Boundary::End => write!(f, "end"),
        }
    }
}

/// Aggregates as of one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub boundary: Boundary,
    pub at: DateTime<Utc>,
    pub ratings: BTreeMap<AssessmentId, AggregatedRating>,
}

impl Snapshot {
    fn build(
        boundary: Boundary,
        at: DateTime<Utc>,
        ids: &[AssessmentId],
        entries: Vec<HistoricalEntry>,
    ) -> Self {
        let mut ratings: BTreeMap<AssessmentId, AggregatedRating> = ids
            .iter()
            .map(|id| (*id, AggregatedRating::unrated(*id)))
            .collect();
        for entry in entries {
            if let Some(slot) = ratings.get_mut(&entry.capability_assessment_id) {
                *slot = AggregatedRating::from_remote(
                    entry.capability_assessment_id,
                    entry.average_rating,
                    entry.rating_count,
                );
            }
        }
        Self {
            boundary,
            at,
            ratings,
        }
    }

    pub fn get(&self, id: AssessmentId) -> Option<&AggregatedRating> {
        self.ratings.get(&id)
    }

    /// Bucket of `id`; "No Rating" for ids outside this snapshot.
    pub fn bucket(&self, id: AssessmentId) -> Bucket {
        self.get(id).map_or(Bucket::NoRating, |r| r.bucket)
    }

    pub fn distribution(&self) -> Distribution {
        Distribution::from_aggregates(self.ratings.values())
    }
}

/// An assessment whose bucket differs between the two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketShift {
    pub assessment_id: AssessmentId,
    pub from: Bucket,
    pub to: Bucket,
}

/// Aggregates at the start and end of a window, side by side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub start: Snapshot,
    pub end: Snapshot,
}

impl Comparison {
    /// Assessments that moved to a different bucket, in id order.
    pub fn shifts(&self) -> Vec<BucketShift> {
        self.start
            .ratings
            .keys()
            .chain(self.end.ratings.keys())
            .copied()
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .filter_map(|id| {
                let from = self.start.bucket(id);
                let to = self.end.bucket(id);
                (from != to).then_some(BucketShift {
                    assessment_id: id,
                    from,
                    to,
                })
            })
            .collect()
    }

    /// Start and end distributions, for a two-column legend.
    pub fn distributions(&self) -> (Distribution, Distribution) {
        (self.start.distribution(), self.end.distribution())
    }
}

/// Builds [`Comparison`]s from the store's as-of averages.
pub struct HistoricalComparator {
    store: Arc<dyn RatingStore>,
}

impl HistoricalComparator {
    pub fn new(store: Arc<dyn RatingStore>) -> Self {
        Self { store }
    }

    /// Compare `ids` as of `start` and as of `end`.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidRange`] if `start` is after `end`; nothing is fetched
    /// in that case.
    pub async fn compare(
        &self,
        ids: &[AssessmentId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Comparison> {
        if start > end {
            return Err(Error::InvalidRange {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }

        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            return Ok(Comparison {
                start: Snapshot::build(Boundary::Start, start, &ids, Vec::new()),
                end: Snapshot::build(Boundary::End, end, &ids, Vec::new()),
            });
        }

        let data = self.store.historical(&ids, start, end).await?;
        debug!(
            assessments = ids.len(),
            rated_at_start = data.start_date.len(),
            rated_at_end = data.end_date.len(),
            "fetched historical averages"
        );
        Ok(Comparison {
            start: Snapshot::build(Boundary::Start, start, &ids, data.start_date),
            end: Snapshot::build(Boundary::End, end, &ids, data.end_date),
        })
    }
}
