//! Remote persistence of assessments and ratings.
//!
//! The [`RatingStore`] trait is the engine's only view of the server; the
//! [`AuthApi`] trait covers token issuance. [`HttpRatingStore`] implements both
//! against the JSON/HTTP API, [`MemoryRatingStore`] implements both in memory
//! with the same server-side semantics (fetch-or-create cells, one current
//! rating per user and assessment, as-of history).
//!
//! # Example
//!
//! ```ignore
//! use acc_ratings::store::{HttpRatingStore, RatingStore};
//!
//! let store = HttpRatingStore::new(&config.api)?;
//! let refs = store
//!     .resolve_assessments(&[CapabilityId(1)], &[AttributeId(2)])
//!     .await?;
//! ```

mod http;
mod memory;
mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use http::HttpRatingStore;
pub use memory::MemoryRatingStore;
pub use types::*;

use crate::Result;
use crate::session::{AccessToken, RefreshToken, TokenGrant};
use crate::types::{AssessmentId, AttributeId, CapabilityId, RatingId, RatingRecord, RatingValue, UserId};

/// Token issuance endpoints.
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// Exchange username and password for a token grant.
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant>;

    /// Exchange a refresh token for a new access token.
    ///
    /// A revoked or expired refresh token yields [`Error::Unauthorized`](crate::Error::Unauthorized).
    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenGrant>;
}

/// Remote store of assessments and ratings.
#[async_trait]
pub trait RatingStore: Send + Sync {
    /// Fetch-or-create the assessment of every (capability, attribute) pair
    /// in the cross product of the inputs.
    async fn resolve_assessments(
        &self,
        capability_ids: &[CapabilityId],
        attribute_ids: &[AttributeId],
    ) -> Result<Vec<AssessmentRef>>;

    /// Create or update the caller's rating of an assessment.
    async fn submit_rating(
        &self,
        token: &AccessToken,
        submission: &RatingSubmission,
    ) -> Result<RatingRecord>;

    /// Replace the comment of an existing rating.
    async fn update_comment(
        &self,
        token: &AccessToken,
        rating_id: RatingId,
        update: &CommentUpdate,
    ) -> Result<RatingRecord>;

    /// The user's current ratings for the given assessments; assessments the
    /// user never rated are absent.
    async fn user_ratings(
        &self,
        user_id: UserId,
        assessment_ids: &[AssessmentId],
    ) -> Result<Vec<RatingRecord>>;

    /// Current average for one assessment.
    async fn aggregate(&self, assessment_id: AssessmentId) -> Result<AverageRecord>;

    /// Current averages for many assessments.
    async fn aggregates(&self, assessment_ids: &[AssessmentId]) -> Result<Vec<AverageRecord>>;

    /// As-of averages at `start` and at `end`.
    async fn historical(
        &self,
        assessment_ids: &[AssessmentId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoricalAverages>;

    /// Values a user may pick for a cell.
    ///
    /// # Default Implementation
    ///
    /// Returns [`RatingValue::ALL`].
    async fn rating_options(&self) -> Result<Vec<RatingValue>> {
        Ok(RatingValue::ALL.to_vec())
    }
}
