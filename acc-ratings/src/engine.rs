//! Facade wiring the engine's components together for presentation code.
//!
//! # Example
//!
//! ```ignore
//! use acc_ratings::{ConfigLoader, RatingsEngine};
//!
//! let engine = RatingsEngine::builder()
//!     .config(ConfigLoader::load()?)
//!     .build()?;
//! engine.login("ana", "secret").await?;
//!
//! engine.select_model(selection);
//! let matrix = engine.resolve(&capability_ids, &attribute_ids).await?;
//! let buckets = engine.cell_buckets(&matrix).await?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::aggregation::{AggregatedRating, Bucket, Distribution};
use crate::batch::{BatchCoordinator, BatchOutcome, EditSet, SubmittedRatings};
use crate::config::EngineConfig;
use crate::history::{Comparison, HistoricalComparator};
use crate::resolver::{AssessmentMatrix, AssessmentResolver, ModelSelection};
use crate::session::{Clock, KeyringTokenStore, SessionManager, SystemClock, TokenStore};
use crate::store::{AuthApi, HttpRatingStore, RatingStore};
use crate::types::{AssessmentId, AttributeId, CapabilityId, CellKey, RatingValue, UserId};
use crate::Result;

/// Builder for [`RatingsEngine`].
#[derive(Default)]
pub struct EngineBuilder {
    config: EngineConfig,
    clock: Option<Arc<dyn Clock>>,
    token_store: Option<Arc<dyn TokenStore>>,
}

impl EngineBuilder {
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Persist refresh tokens in `store`, overriding `session.persist_refresh_token`.
    #[must_use]
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    /// Build against the HTTP API named in the configuration.
    pub fn build(self) -> Result<RatingsEngine> {
        self.config.validate()?;
        let store = Arc::new(HttpRatingStore::new(&self.config.api)?);
        Ok(self.build_with(store))
    }

    /// Build against any backend implementing both store traits.
    pub fn build_with<S>(self, store: Arc<S>) -> RatingsEngine
    where
        S: RatingStore + AuthApi + 'static,
    {
        let auth: Arc<dyn AuthApi> = store.clone();
        let store: Arc<dyn RatingStore> = store;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let token_store = self.token_store.or_else(|| {
            self.config.session.persist_refresh_token.then(|| {
                Arc::new(
                    KeyringTokenStore::new(self.config.session.service_name.clone())
                        .with_env_fallback(),
                ) as Arc<dyn TokenStore>
            })
        });

        let mut session = SessionManager::new(auth)
            .with_clock(Arc::clone(&clock))
            .with_auth_timeout(self.config.session.auth_timeout);
        if let Some(token_store) = token_store {
            session = session.with_token_store(token_store);
        }
        let session = Arc::new(session);

        let resolver = Arc::new(AssessmentResolver::new(
            Arc::clone(&store),
            self.config.resolver.max_cells_per_call,
        ));
        let batch = BatchCoordinator::with_clock(
            Arc::clone(&store),
            Arc::clone(&resolver),
            Arc::clone(&session),
            &self.config.batch,
            clock,
        );
        let history = HistoricalComparator::new(Arc::clone(&store));

        RatingsEngine {
            config: self.config,
            store,
            session,
            resolver,
            batch,
            history,
        }
    }
}

/// Entry point for presentation code.
pub struct RatingsEngine {
    config: EngineConfig,
    store: Arc<dyn RatingStore>,
    session: Arc<SessionManager>,
    resolver: Arc<AssessmentResolver>,
    batch: BatchCoordinator,
    history: HistoricalComparator,
}

impl RatingsEngine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn resolver(&self) -> &Arc<AssessmentResolver> {
        &self.resolver
    }

    // ── Session ────────────────────────────────────────────────────────────

    pub async fn login(&self, username: &str, password: &str) -> Result<()> {
        self.session.login(username, password).await
    }

    pub fn logout(&self) -> Result<()> {
        self.session.logout()
    }

    /// Resume from a persisted refresh token, if any.
    pub fn restore_session(&self) -> Result<bool> {
        self.session.restore()
    }

    // ── Assessments ────────────────────────────────────────────────────────

    /// Switch the on-screen selection; returns `true` if the cache was reset.
    pub fn select_model(&self, selection: ModelSelection) -> bool {
        self.resolver.select(selection)
    }

    pub async fn resolve(
        &self,
        capability_ids: &[CapabilityId],
        attribute_ids: &[AttributeId],
    ) -> Result<AssessmentMatrix> {
        self.resolver.resolve(capability_ids, attribute_ids).await
    }

    /// Values offered in the rating picker.
    pub async fn rating_options(&self) -> Result<Vec<RatingValue>> {
        self.store.rating_options().await
    }

    // ── Submission ─────────────────────────────────────────────────────────

    /// The user's existing ratings for the cells of `matrix`.
    pub async fn load_submitted(
        &self,
        user_id: UserId,
        matrix: &AssessmentMatrix,
    ) -> Result<SubmittedRatings> {
        SubmittedRatings::load(self.store.as_ref(), user_id, matrix).await
    }

    pub async fn submit(&self, edits: &EditSet, submitted: &SubmittedRatings) -> BatchOutcome {
        self.batch.submit(edits, submitted).await
    }

    // ── Aggregates ─────────────────────────────────────────────────────────

    pub async fn aggregate(&self, assessment_id: AssessmentId) -> Result<AggregatedRating> {
        let record = self.store.aggregate(assessment_id).await?;
        Ok(AggregatedRating::from_remote(
            assessment_id,
            record.average_rating,
            record.rating_count,
        ))
    }

    /// Current aggregate of every id; ids the server leaves out are unrated.
    pub async fn aggregates(
        &self,
        ids: &[AssessmentId],
    ) -> Result<BTreeMap<AssessmentId, AggregatedRating>> {
        let mut aggregates: BTreeMap<AssessmentId, AggregatedRating> = ids
            .iter()
            .map(|id| (*id, AggregatedRating::unrated(*id)))
            .collect();
        if aggregates.is_empty() {
            return Ok(aggregates);
        }

        let requested: Vec<AssessmentId> = aggregates.keys().copied().collect();
        let records = self.store.aggregates(&requested).await?;
        debug!(requested = requested.len(), returned = records.len(), "fetched aggregates");
        for record in records {
            if let Some(slot) = aggregates.get_mut(&record.capability_assessment_id) {
                *slot = AggregatedRating::from_remote(
                    record.capability_assessment_id,
                    record.average_rating,
                    record.rating_count,
                );
            }
        }
        Ok(aggregates)
    }

    /// Bucket per cell, for heatmap and tree views.
    pub async fn cell_buckets(&self, matrix: &AssessmentMatrix) -> Result<BTreeMap<CellKey, Bucket>> {
        let aggregates = self.aggregates(&matrix.assessment_ids()).await?;
        Ok(matrix
            .iter()
            .map(|(cell, id)| {
                let bucket = aggregates.get(&id).map_or(Bucket::NoRating, |a| a.bucket);
                (cell, bucket)
            })
            .collect())
    }

    /// Bucket counts over the distinct assessments of `matrix`.
    pub async fn distribution(&self, matrix: &AssessmentMatrix) -> Result<Distribution> {
        let aggregates = self.aggregates(&matrix.assessment_ids()).await?;
        Ok(Distribution::from_aggregates(aggregates.values()))
    }

    // ── History ────────────────────────────────────────────────────────────

    pub async fn compare(
        &self,
        ids: &[AssessmentId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Comparison> {
        self.history.compare(ids, start, end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRatingStore;
    use crate::types::{AccModelId, ComponentId};

    fn engine() -> (Arc<MemoryRatingStore>, RatingsEngine) {
        let store = Arc::new(MemoryRatingStore::new());
        let engine = RatingsEngine::builder().build_with(store.clone());
        (store, engine)
    }

    #[tokio::test]
    async fn rating_options_default_to_every_value() {
        let (_, engine) = engine();
        let options = engine.rating_options().await.unwrap();
        assert_eq!(options, RatingValue::ALL.to_vec());
    }

    #[tokio::test]
    async fn aggregates_fill_in_unrated_ids() {
        let (store, engine) = engine();
        let rated = CellKey::new(CapabilityId(1), AttributeId(1));
        store.seed_rating(UserId(1), rated, RatingValue::Stable, Utc::now());
        store.seed_rating(UserId(2), rated, RatingValue::Acceptable, Utc::now());
        let rated_id = store.assessment_for(rated);
        let unrated_id = store.assessment_for(CellKey::new(CapabilityId(2), AttributeId(1)));

        let aggregates = engine.aggregates(&[rated_id, unrated_id]).await.unwrap();
        assert_eq!(aggregates[&rated_id].bucket, Bucket::Stable);
        assert_eq!(aggregates[&rated_id].average, Some(3.5));
        assert_eq!(aggregates[&unrated_id].bucket, Bucket::NoRating);
    }

    #[tokio::test]
    async fn single_aggregate_of_not_applicable_only() {
        let (store, engine) = engine();
        let cell = CellKey::new(CapabilityId(5), AttributeId(5));
        store.seed_rating(UserId(1), cell, RatingValue::NotApplicable, Utc::now());

        let aggregate = engine.aggregate(store.assessment_for(cell)).await.unwrap();
        assert_eq!(aggregate.bucket, Bucket::NotApplicable);
    }

    #[tokio::test]
    async fn cell_buckets_cover_the_matrix() {
        let (store, engine) = engine();
        engine.select_model(ModelSelection::new(
            AccModelId(1),
            Vec::<ComponentId>::new(),
            [CapabilityId(1), CapabilityId(2)],
        ));
        store.seed_rating(
            UserId(1),
            CellKey::new(CapabilityId(1), AttributeId(1)),
            RatingValue::CriticalConcern,
            Utc::now(),
        );

        let matrix = engine
            .resolve(&[CapabilityId(1), CapabilityId(2)], &[AttributeId(1)])
            .await
            .unwrap();
        let buckets = engine.cell_buckets(&matrix).await.unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(
            buckets[&CellKey::new(CapabilityId(1), AttributeId(1))],
            Bucket::CriticalConcern
        );
        assert_eq!(
            buckets[&CellKey::new(CapabilityId(2), AttributeId(1))],
            Bucket::NoRating
        );
        let distribution = engine.distribution(&matrix).await.unwrap();
        assert_eq!(distribution.total(), 2);
    }

    #[tokio::test]
    async fn empty_aggregate_request_makes_no_calls() {
        let (store, engine) = engine();
        assert!(engine.aggregates(&[]).await.unwrap().is_empty());
        assert_eq!(store.aggregate_calls(), 0);
    }
}
