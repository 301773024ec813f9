//! Rating resolution, batch submission and aggregation for ACC models.
//!
//! Users rate the capabilities of an ACC model against a fixed set of
//! attributes. This crate provides:
//! - Bulk resolution of (capability, attribute) cells to assessment ids, cached
//!   per model selection
//! - Batch submission of edited ratings and comments with per-cell results
//! - Bucketing of averages into qualitative labels, and bucket distributions
//! - Comparison of bucketed ratings at two points in time
//! - Access-token lifecycle with a single shared refresh
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      RatingsEngine                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────┐  │
//! │  │   Batch      │  │  Historical  │  │  Aggregation  │  │
//! │  │ Coordinator  │  │  Comparator  │  │  (buckets)    │  │
//! │  └──────┬───────┘  └──────┬───────┘  └───────────────┘  │
//! │         │                 │                              │
//! │  ┌──────▼───────┐  ┌──────▼───────┐  ┌───────────────┐  │
//! │  │  Assessment  │  │  RatingStore │◀─│    Session    │  │
//! │  │   Resolver   │─▶│  (HTTP/mem)  │  │    Manager    │  │
//! │  └──────────────┘  └──────────────┘  └───────────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use acc_ratings::{ConfigLoader, EditSet, RatingsEngine, RatingValue};
//!
//! let engine = RatingsEngine::builder().config(ConfigLoader::load()?).build()?;
//! engine.login("ana", "secret").await?;
//!
//! let matrix = engine.resolve(&capabilities, &attributes).await?;
//! let submitted = engine.load_submitted(user_id, &matrix).await?;
//!
//! let mut edits = EditSet::new();
//! edits.set_rating(cell, RatingValue::Acceptable);
//! let outcome = engine.submit(&edits, &submitted).await;
//! println!("{}", outcome.summary());
//! ```

mod error;
mod types;

pub mod aggregation;
pub mod batch;
pub mod config;
pub mod engine;
pub mod history;
pub mod resolver;
pub mod session;
pub mod store;
pub mod telemetry;

pub use aggregation::{AggregatedRating, Bucket, Distribution};
pub use batch::{BatchCoordinator, BatchOutcome, EditSet, SubmittedRating, SubmittedRatings};
pub use config::{ConfigLoader, EngineConfig};
pub use engine::{EngineBuilder, RatingsEngine};
pub use error::{Error, Result};
pub use history::{Boundary, BucketShift, Comparison, HistoricalComparator, Snapshot};
pub use resolver::{AssessmentCache, AssessmentMatrix, AssessmentResolver, ModelSelection};
pub use session::{AccessToken, RefreshToken, SessionManager};
pub use store::{AuthApi, HttpRatingStore, MemoryRatingStore, RatingStore};
pub use types::{
    AccModel, AccModelId, AssessmentId, Attribute, AttributeId, Capability, CapabilityId,
    CellKey, Component, ComponentId, RatingId, RatingRecord, RatingValue, UserId,
};
