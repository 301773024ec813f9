//! Aggregation of ratings into qualitative buckets.
//!
//! Every view that shows a summarized rating (heatmap, tree table, distribution
//! chart, trend comparison) goes through [`Bucket::from_average`], so the
//! threshold table below is the only place the cut-offs live.
//!
//! | Average       | Bucket           |
//! |---------------|------------------|
//! | `[3.5, 4.0]`  | Stable           |
//! | `[2.5, 3.5)`  | Acceptable       |
//! | `[1.5, 2.5)`  | Low impact       |
//! | `[0.0, 1.5)`  | Critical Concern |
//! | anything else | N/A              |
//!
//! Absence of data is never a score: an assessment nobody rated is
//! [`Bucket::NoRating`], and one rated only "Not Applicable" is
//! [`Bucket::NotApplicable`].

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{AssessmentId, RatingValue};

/// Upper bound of the rating scale.
pub const MAX_AVERAGE: f64 = 4.0;

/// Lower bound of each scored bucket, highest quality first.
const THRESHOLDS: [(Bucket, f64); 4] = [
    (Bucket::Stable, 3.5),
    (Bucket::Acceptable, 2.5),
    (Bucket::LowImpact, 1.5),
    (Bucket::CriticalConcern, 0.0),
];

/// Qualitative label for an assessment's ratings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Bucket {
    #[serde(rename = "Stable")]
    Stable,
    #[serde(rename = "Acceptable")]
    Acceptable,
    #[serde(rename = "Low impact")]
    LowImpact,
    #[serde(rename = "Critical Concern")]
    CriticalConcern,
    /// Every rating recorded for the cell was an explicit "Not Applicable".
    #[serde(rename = "Not Applicable")]
    NotApplicable,
    /// Nobody has rated the cell.
    #[serde(rename = "No Rating")]
    NoRating,
    /// The average fell outside the scale.
    #[serde(rename = "N/A")]
    Unclassified,
}

impl Bucket {
    /// Every bucket, in legend order.
    pub const ALL: [Bucket; 7] = [
        Bucket::Stable,
        Bucket::Acceptable,
        Bucket::LowImpact,
        Bucket::CriticalConcern,
        Bucket::NotApplicable,
        Bucket::NoRating,
        Bucket::Unclassified,
    ];

    /// Map an average score to its bucket.
    ///
    /// Total over `f64`: values outside `[0, 4]` (and NaN) map to
    /// [`Bucket::Unclassified`].
    ///
    /// ```
    /// use acc_ratings::aggregation::Bucket;
    ///
    /// assert_eq!(Bucket::from_average(3.5), Bucket::Stable);
    /// assert_eq!(Bucket::from_average(3.49), Bucket::Acceptable);
    /// assert_eq!(Bucket::from_average(0.5), Bucket::CriticalConcern);
    /// assert_eq!(Bucket::from_average(4.2), Bucket::Unclassified);
    /// ```
    pub fn from_average(average: f64) -> Bucket {
        if !(0.0..=MAX_AVERAGE).contains(&average) {
            return Bucket::Unclassified;
        }
        THRESHOLDS
            .iter()
            .find(|(_, min)| average >= *min)
            .map(|(bucket, _)| *bucket)
            .unwrap_or(Bucket::Unclassified)
    }

    /// Map an optional server-side average; `None` means no ratings.
    pub fn from_optional_average(average: Option<f64>) -> Bucket {
        average.map_or(Bucket::NoRating, Bucket::from_average)
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        match self {
            Bucket::Stable => "Stable",
            Bucket::Acceptable => "Acceptable",
            Bucket::LowImpact => "Low impact",
            Bucket::CriticalConcern => "Critical Concern",
            Bucket::NotApplicable => "Not Applicable",
            Bucket::NoRating => "No Rating",
            Bucket::Unclassified => "N/A",
        }
    }

    /// Legend color used by every chart.
    pub fn color(self) -> &'static str {
        match self {
            Bucket::Stable => "#8BC34A",
            Bucket::Acceptable => "#A3C1DA",
            Bucket::LowImpact => "#f5b877",
            Bucket::CriticalConcern => "#e57373",
            Bucket::NotApplicable => "#b0b0b0",
            Bucket::NoRating => "#FAEBD7",
            Bucket::Unclassified => "#ffffff",
        }
    }

    /// Whether the bucket reflects a numeric score.
    pub fn is_scored(self) -> bool {
        matches!(
            self,
            Bucket::Stable | Bucket::Acceptable | Bucket::LowImpact | Bucket::CriticalConcern
        )
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Derived summary of one assessment's ratings.
///
/// Has no identity of its own and is recomputed on every read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRating {
    pub assessment_id: AssessmentId,
    pub bucket: Bucket,
    /// Mean of the numeric ratings, if any.
    pub average: Option<f64>,
    /// Number of ratings considered, when known.
    pub sample_count: Option<u32>,
}

impl AggregatedRating {
    /// Aggregate raw rating values.
    ///
    /// "Not Applicable" ratings are excluded from the average but still
    /// counted as samples.
    pub fn from_values(assessment_id: AssessmentId, values: &[RatingValue]) -> Self {
        let scores: Vec<f64> = values
            .iter()
            .filter_map(|v| v.score())
            .map(f64::from)
            .collect();

        let (bucket, average) = if values.is_empty() {
            (Bucket::NoRating, None)
        } else if scores.is_empty() {
            (Bucket::NotApplicable, None)
        } else {
            let average = scores.iter().sum::<f64>() / scores.len() as f64;
            (Bucket::from_average(average), Some(average))
        };

        Self {
            assessment_id,
            bucket,
            average,
            sample_count: Some(values.len() as u32),
        }
    }

    /// Wrap an average computed by the server.
    ///
    /// A missing average backed by a non-zero sample count means every
    /// rating was "Not Applicable".
    pub fn from_remote(
        assessment_id: AssessmentId,
        average: Option<f64>,
        sample_count: Option<u32>,
    ) -> Self {
        let bucket = match (average, sample_count) {
            (None, Some(n)) if n > 0 => Bucket::NotApplicable,
            _ => Bucket::from_optional_average(average),
        };
        Self {
            assessment_id,
            bucket,
            average,
            sample_count,
        }
    }

    /// Placeholder for an assessment with nothing recorded.
    pub fn unrated(assessment_id: AssessmentId) -> Self {
        Self {
            assessment_id,
            bucket: Bucket::NoRating,
            average: None,
            sample_count: Some(0),
        }
    }
}

/// Number of assessments per bucket.
///
/// Always holds every bucket, so a legend can be rendered from it directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    counts: BTreeMap<Bucket, usize>,
}

impl Distribution {
    /// Empty distribution with every bucket at zero.
    pub fn new() -> Self {
        Self {
            counts: Bucket::ALL.iter().map(|b| (*b, 0)).collect(),
        }
    }

    /// Count the given buckets, one per assessment.
    pub fn from_buckets(buckets: impl IntoIterator<Item = Bucket>) -> Self {
        let mut distribution = Self::new();
        for bucket in buckets {
            distribution.record(bucket);
        }
        distribution
    }

    /// Count the buckets of a set of aggregates.
    pub fn from_aggregates<'a>(aggregates: impl IntoIterator<Item = &'a AggregatedRating>) -> Self {
        Self::from_buckets(aggregates.into_iter().map(|a| a.bucket))
    }

    pub fn record(&mut self, bucket: Bucket) {
        *self.counts.entry(bucket).or_insert(0) += 1;
    }

    pub fn count(&self, bucket: Bucket) -> usize {
        self.counts.get(&bucket).copied().unwrap_or(0)
    }

    /// Number of assessments counted.
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// `(bucket, count)` pairs in legend order, zero counts included.
    pub fn iter(&self) -> impl Iterator<Item = (Bucket, usize)> + '_ {
        self.counts.iter().map(|(b, c)| (*b, *c))
    }
}

impl Default for Distribution {
    fn default() -> Self {
        Self::new()
    }
}
