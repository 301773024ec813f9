//! In-memory ratings backend.
//!
//! Behaves like the HTTP API (fetch-or-create cells, per-user upsert, as-of
//! history, bearer-token checks) and records how often each endpoint was hit,
//! so callers can assert on network activity. Failures can be injected per
//! assessment, per capability or for the whole resolve endpoint.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{
    AssessmentRef, AuthApi, AverageRecord, CommentUpdate, HistoricalAverages, HistoricalEntry,
    RatingStore, RatingSubmission,
};
use crate::session::{AccessToken, Clock, RefreshToken, SystemClock, TokenGrant};
use crate::types::{
    AssessmentId, AttributeId, CapabilityId, CellKey, RatingId, RatingRecord, RatingValue, UserId,
};
use crate::{Error, Result};

/// Default lifetime of issued access tokens.
const DEFAULT_TOKEN_TTL_SECS: i64 = 15 * 60;

#[derive(Debug, Clone)]
struct HistoryRow {
    assessment_id: AssessmentId,
    user_id: UserId,
    rating: RatingValue,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    user_id: UserId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    assessments: HashMap<CellKey, AssessmentId>,
    cells: HashMap<AssessmentId, CellKey>,
    ratings: HashMap<RatingId, RatingRecord>,
    current: HashMap<(AssessmentId, UserId), RatingId>,
    history: Vec<HistoryRow>,
    users: HashMap<String, (UserId, String)>,
    access_tokens: HashMap<String, IssuedToken>,
    refresh_tokens: HashMap<String, UserId>,
    capability_names: HashMap<CapabilityId, String>,
    attribute_names: HashMap<AttributeId, String>,
    rejected: HashMap<AssessmentId, String>,
    failing_capabilities: HashSet<CapabilityId>,
    resolve_outage: Option<String>,
}

impl Inner {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn fetch_or_create(&mut self, cell: CellKey) -> AssessmentId {
        if let Some(id) = self.assessments.get(&cell) {
            return *id;
        }
        let id = AssessmentId(self.next_id());
        self.assessments.insert(cell, id);
        self.cells.insert(id, cell);
        id
    }

    fn issue(&mut self, user_id: UserId, now: DateTime<Utc>, ttl: chrono::Duration) -> TokenGrant {
        let n = self.next_id();
        let access = format!("access-{n}");
        self.access_tokens.insert(
            access.clone(),
            IssuedToken {
                user_id,
                expires_at: now + ttl,
            },
        );
        TokenGrant {
            access_token: AccessToken::new(access),
            refresh_token: None,
            expires_at: now + ttl,
        }
    }

    fn authorize(&self, token: &AccessToken, now: DateTime<Utc>) -> Result<UserId> {
        match self.access_tokens.get(token.expose_secret()) {
            Some(issued) if now < issued.expires_at => Ok(issued.user_id),
            Some(_) => Err(Error::Unauthorized("access token expired".to_string())),
            None => Err(Error::Unauthorized("unknown access token".to_string())),
        }
    }

    fn upsert(
        &mut self,
        user_id: UserId,
        assessment_id: AssessmentId,
        rating: RatingValue,
        at: DateTime<Utc>,
    ) -> RatingRecord {
        let record = match self.current.get(&(assessment_id, user_id)).copied() {
            Some(rating_id) => {
                let record = self
                    .ratings
                    .get_mut(&rating_id)
                    .map(|r| {
                        r.rating = rating;
                        r.timestamp = Some(at);
                        r.clone()
                    });
                match record {
                    Some(record) => record,
                    None => self.insert_rating(user_id, assessment_id, rating, at),
                }
            }
            None => self.insert_rating(user_id, assessment_id, rating, at),
        };
        self.history.push(HistoryRow {
            assessment_id,
            user_id,
            rating,
            at,
        });
        record
    }

    fn insert_rating(
        &mut self,
        user_id: UserId,
        assessment_id: AssessmentId,
        rating: RatingValue,
        at: DateTime<Utc>,
    ) -> RatingRecord {
        let record = RatingRecord {
            id: RatingId(self.next_id()),
            user_id,
            capability_assessment_id: assessment_id,
            rating,
            comments: None,
            timestamp: Some(at),
        };
        self.current.insert((assessment_id, user_id), record.id);
        self.ratings.insert(record.id, record.clone());
        record
    }

    fn average_of(values: impl Iterator<Item = RatingValue>) -> (Option<f64>, u32) {
        let mut count = 0u32;
        let mut sum = 0.0;
        let mut scored = 0u32;
        for value in values {
            count += 1;
            if let Some(score) = value.score() {
                sum += f64::from(score);
                scored += 1;
            }
        }
        let average = (scored > 0).then(|| sum / f64::from(scored));
        (average, count)
    }

    fn current_average(&self, assessment_id: AssessmentId) -> AverageRecord {
        let values = self
            .ratings
            .values()
            .filter(|r| r.capability_assessment_id == assessment_id)
            .map(|r| r.rating);
        let (average_rating, count) = Self::average_of(values);
        AverageRecord {
            capability_assessment_id: assessment_id,
            average_rating,
            rating_count: Some(count),
        }
    }

    /// Average of each user's latest rating at or before `as_of`.
    fn as_of(&self, assessment_id: AssessmentId, as_of: DateTime<Utc>) -> Option<HistoricalEntry> {
        let mut latest: HashMap<UserId, &HistoryRow> = HashMap::new();
        for row in self
            .history
            .iter()
            .filter(|r| r.assessment_id == assessment_id && r.at <= as_of)
        {
            if latest.get(&row.user_id).is_none_or(|seen| seen.at <= row.at) {
                latest.insert(row.user_id, row);
            }
        }
        if latest.is_empty() {
            return None;
        }
        let (average_rating, count) = Self::average_of(latest.values().map(|r| r.rating));
        let cell = self.cells.get(&assessment_id);
        Some(HistoricalEntry {
            capability_assessment_id: assessment_id,
            capability_id: cell.map(|c| c.capability_id),
            attribute_id: cell.map(|c| c.attribute_id),
            capability_name: cell.and_then(|c| self.capability_names.get(&c.capability_id).cloned()),
            attribute_name: cell.and_then(|c| self.attribute_names.get(&c.attribute_id).cloned()),
            average_rating,
            rating_count: Some(count),
        })
    }
}

/// Counts of endpoint hits.
#[derive(Debug, Default)]
struct CallCounters {
    resolve: AtomicUsize,
    submit: AtomicUsize,
    comment: AtomicUsize,
    user_ratings: AtomicUsize,
    aggregate: AtomicUsize,
    historical: AtomicUsize,
    login: AtomicUsize,
    refresh: AtomicUsize,
}

/// In-memory implementation of [`RatingStore`] and [`AuthApi`].
pub struct MemoryRatingStore {
    inner: Mutex<Inner>,
    calls: CallCounters,
    clock: Arc<dyn Clock>,
    token_ttl: chrono::Duration,
    latency: Option<Duration>,
}

impl MemoryRatingStore {
    /// Create an empty store on wall-clock time.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store that reads time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            calls: CallCounters::default(),
            clock,
            token_ttl: chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS),
            latency: None,
        }
    }

    /// Lifetime of access tokens issued from now on.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Delay every network-facing call by `latency`.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Register a user that can log in.
    pub fn add_user(&self, username: &str, password: &str) -> UserId {
        let mut inner = self.lock();
        let id = UserId(inner.next_id());
        inner
            .users
            .insert(username.to_string(), (id, password.to_string()));
        id
    }

    /// Name a capability for historical graph data.
    pub fn name_capability(&self, id: CapabilityId, name: &str) {
        self.lock().capability_names.insert(id, name.to_string());
    }

    /// Name an attribute for historical graph data.
    pub fn name_attribute(&self, id: AttributeId, name: &str) {
        self.lock().attribute_names.insert(id, name.to_string());
    }

    /// Assessment id of a cell, creating it if needed.
    pub fn assessment_for(&self, cell: CellKey) -> AssessmentId {
        self.lock().fetch_or_create(cell)
    }

    /// Record a rating directly, bypassing authentication.
    pub fn seed_rating(
        &self,
        user_id: UserId,
        cell: CellKey,
        rating: RatingValue,
        at: DateTime<Utc>,
    ) -> RatingRecord {
        let mut inner = self.lock();
        let assessment_id = inner.fetch_or_create(cell);
        inner.upsert(user_id, assessment_id, rating, at)
    }

    /// Reject every submission to `assessment_id` with `reason`.
    pub fn reject_submissions(&self, assessment_id: AssessmentId, reason: &str) {
        self.lock().rejected.insert(assessment_id, reason.to_string());
    }

    /// Fail any resolve call that includes `capability_id`.
    pub fn fail_resolution_for(&self, capability_id: CapabilityId) {
        self.lock().failing_capabilities.insert(capability_id);
    }

    /// Fail every resolve call, or restore it with `None`.
    pub fn set_resolve_outage(&self, reason: Option<&str>) {
        self.lock().resolve_outage = reason.map(str::to_string);
    }

    /// Invalidate every refresh token issued so far.
    pub fn revoke_refresh_tokens(&self) {
        self.lock().refresh_tokens.clear();
    }

    /// Current rating of an assessment by a user.
    pub fn current_rating(&self, assessment_id: AssessmentId, user_id: UserId) -> Option<RatingRecord> {
        let inner = self.lock();
        inner
            .current
            .get(&(assessment_id, user_id))
            .and_then(|id| inner.ratings.get(id))
            .cloned()
    }

    /// Number of current ratings across all users and assessments.
    pub fn rating_count(&self) -> usize {
        self.lock().ratings.len()
    }

    /// Number of assessments created so far.
    pub fn assessment_count(&self) -> usize {
        self.lock().assessments.len()
    }

    pub fn resolve_calls(&self) -> usize {
        self.calls.resolve.load(Ordering::SeqCst)
    }

    pub fn submit_calls(&self) -> usize {
        self.calls.submit.load(Ordering::SeqCst)
    }

    pub fn comment_calls(&self) -> usize {
        self.calls.comment.load(Ordering::SeqCst)
    }

    pub fn user_rating_calls(&self) -> usize {
        self.calls.user_ratings.load(Ordering::SeqCst)
    }

    pub fn aggregate_calls(&self) -> usize {
        self.calls.aggregate.load(Ordering::SeqCst)
    }

    pub fn historical_calls(&self) -> usize {
        self.calls.historical.load(Ordering::SeqCst)
    }

    pub fn login_calls(&self) -> usize {
        self.calls.login.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls.refresh.load(Ordering::SeqCst)
    }

    /// Total calls to any endpoint.
    pub fn total_calls(&self) -> usize {
        self.resolve_calls()
            + self.submit_calls()
            + self.comment_calls()
            + self.user_rating_calls()
            + self.aggregate_calls()
            + self.historical_calls()
            + self.login_calls()
            + self.refresh_calls()
    }
}

impl Default for MemoryRatingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthApi for MemoryRatingStore {
    async fn login(&self, username: &str, password: &str) -> Result<TokenGrant> {
        self.calls.login.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let now = self.clock.now();
        let mut inner = self.lock();
        let user_id = match inner.users.get(username) {
            Some((id, expected)) if expected == password => *id,
            _ => return Err(Error::Unauthorized("incorrect username or password".to_string())),
        };
        let mut grant = inner.issue(user_id, now, self.token_ttl);
        let refresh = format!("refresh-{}", inner.next_id());
        inner.refresh_tokens.insert(refresh.clone(), user_id);
        grant.refresh_token = Some(RefreshToken::new(refresh));
        debug!(username, user_id = %user_id, "issued session");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &RefreshToken) -> Result<TokenGrant> {
        self.calls.refresh.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let now = self.clock.now();
        let mut inner = self.lock();
        let user_id = inner
            .refresh_tokens
            .get(refresh_token.expose_secret())
            .copied()
            .ok_or_else(|| Error::Unauthorized("refresh token revoked".to_string()))?;
        Ok(inner.issue(user_id, now, self.token_ttl))
    }
}

#[async_trait]
impl RatingStore for MemoryRatingStore {
    async fn resolve_assessments(
        &self,
        capability_ids: &[CapabilityId],
        attribute_ids: &[AttributeId],
    ) -> Result<Vec<AssessmentRef>> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let mut inner = self.lock();
        if let Some(reason) = &inner.resolve_outage {
            return Err(Error::Request(reason.clone()));
        }
        if let Some(failing) = capability_ids
            .iter()
            .find(|c| inner.failing_capabilities.contains(*c))
        {
            return Err(Error::Api {
                status: 500,
                message: format!("failed to resolve capability {failing}"),
            });
        }

        let mut refs = Vec::with_capacity(capability_ids.len() * attribute_ids.len());
        for capability_id in capability_ids {
            for attribute_id in attribute_ids {
                let cell = CellKey::new(*capability_id, *attribute_id);
                refs.push(AssessmentRef {
                    capability_id: *capability_id,
                    attribute_id: *attribute_id,
                    capability_assessment_id: inner.fetch_or_create(cell),
                });
            }
        }
        Ok(refs)
    }

    async fn submit_rating(
        &self,
        token: &AccessToken,
        submission: &RatingSubmission,
    ) -> Result<RatingRecord> {
        self.calls.submit.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let now = self.clock.now();
        let mut inner = self.lock();
        let user_id = inner.authorize(token, now)?;
        let assessment_id = submission.capability_assessment_id;
        if !inner.cells.contains_key(&assessment_id) {
            return Err(Error::Api {
                status: 404,
                message: "Capability Assessment not found".to_string(),
            });
        }
        if let Some(reason) = inner.rejected.get(&assessment_id) {
            return Err(Error::Api {
                status: 422,
                message: reason.clone(),
            });
        }
        Ok(inner.upsert(user_id, assessment_id, submission.rating, submission.timestamp))
    }

    async fn update_comment(
        &self,
        token: &AccessToken,
        rating_id: RatingId,
        update: &CommentUpdate,
    ) -> Result<RatingRecord> {
        self.calls.comment.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let now = self.clock.now();
        let mut inner = self.lock();
        inner.authorize(token, now)?;
        let record = inner.ratings.get_mut(&rating_id).ok_or_else(|| Error::Api {
            status: 404,
            message: "Rating not found".to_string(),
        })?;
        record.comments = Some(update.comments.clone());
        record.timestamp = Some(update.timestamp);
        Ok(record.clone())
    }

    async fn user_ratings(
        &self,
        user_id: UserId,
        assessment_ids: &[AssessmentId],
    ) -> Result<Vec<RatingRecord>> {
        self.calls.user_ratings.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let inner = self.lock();
        Ok(assessment_ids
            .iter()
            .filter_map(|id| inner.current.get(&(*id, user_id)))
            .filter_map(|rating_id| inner.ratings.get(rating_id))
            .cloned()
            .collect())
    }

    async fn aggregate(&self, assessment_id: AssessmentId) -> Result<AverageRecord> {
        self.calls.aggregate.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        Ok(self.lock().current_average(assessment_id))
    }

    async fn aggregates(&self, assessment_ids: &[AssessmentId]) -> Result<Vec<AverageRecord>> {
        self.calls.aggregate.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let inner = self.lock();
        Ok(assessment_ids
            .iter()
            .map(|id| inner.current_average(*id))
            .collect())
    }

    async fn historical(
        &self,
        assessment_ids: &[AssessmentId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<HistoricalAverages> {
        self.calls.historical.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let inner = self.lock();
        Ok(HistoricalAverages {
            start_date: assessment_ids
                .iter()
                .filter_map(|id| inner.as_of(*id, start))
                .collect(),
            end_date: assessment_ids
                .iter()
                .filter_map(|id| inner.as_of(*id, end))
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn cell(c: u64, a: u64) -> CellKey {
        CellKey::new(CapabilityId(c), AttributeId(a))
    }

    #[tokio::test]
    async fn resolve_is_fetch_or_create() {
        let store = MemoryRatingStore::new();
        let first = store
            .resolve_assessments(&[CapabilityId(1), CapabilityId(2)], &[AttributeId(9)])
            .await
            .unwrap();
        let second = store
            .resolve_assessments(&[CapabilityId(2), CapabilityId(1)], &[AttributeId(9)])
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        let find = |refs: &[AssessmentRef], c: u64| {
            refs.iter()
                .find(|r| r.capability_id == CapabilityId(c))
                .map(|r| r.capability_assessment_id)
        };
        assert_eq!(find(&first, 1), find(&second, 1));
        assert_eq!(find(&first, 2), find(&second, 2));
        assert_eq!(store.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn resubmission_updates_current_rating() {
        let store = MemoryRatingStore::new();
        let user = store.add_user("ana", "pw");
        let grant = store.login("ana", "pw").await.unwrap();
        let assessment_id = store.assessment_for(cell(1, 1));

        let submission = |rating| RatingSubmission {
            capability_assessment_id: assessment_id,
            rating,
            timestamp: Utc::now(),
        };
        let first = store
            .submit_rating(&grant.access_token, &submission(RatingValue::Stable))
            .await
            .unwrap();
        let second = store
            .submit_rating(&grant.access_token, &submission(RatingValue::LowImpact))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.rating_count(), 1);
        assert_eq!(
            store.current_rating(assessment_id, user).unwrap().rating,
            RatingValue::LowImpact
        );
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(crate::session::ManualClock::new(start));
        let store = MemoryRatingStore::with_clock(clock.clone())
            .with_token_ttl(chrono::Duration::seconds(10));
        store.add_user("ana", "pw");
        let grant = store.login("ana", "pw").await.unwrap();
        let assessment_id = store.assessment_for(cell(1, 1));

        clock.advance(chrono::Duration::seconds(11));
        let err = store
            .submit_rating(
                &grant.access_token,
                &RatingSubmission {
                    capability_assessment_id: assessment_id,
                    rating: RatingValue::Stable,
                    timestamp: start,
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn as_of_uses_latest_rating_per_user() {
        let store = MemoryRatingStore::new();
        let t = |day| Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap();
        let (u1, u2) = (UserId(100), UserId(200));
        let id = store.assessment_for(cell(1, 1));
        store.seed_rating(u1, cell(1, 1), RatingValue::CriticalConcern, t(1));
        store.seed_rating(u1, cell(1, 1), RatingValue::Stable, t(5));
        store.seed_rating(u2, cell(1, 1), RatingValue::Acceptable, t(3));

        let data = store.historical(&[id], t(2), t(6)).await.unwrap();
        assert_eq!(data.start_date[0].average_rating, Some(1.0));
        assert_eq!(data.end_date[0].average_rating, Some(3.5));
        assert_eq!(data.end_date[0].rating_count, Some(2));
    }

    #[test]
    fn aggregates_exclude_not_applicable() {
        let store = MemoryRatingStore::new();
        let c = cell(2, 2);
        let id = store.assessment_for(c);
        store.seed_rating(UserId(1), c, RatingValue::Acceptable, Utc::now());
        store.seed_rating(UserId(2), c, RatingValue::NotApplicable, Utc::now());

        let record = tokio_test::block_on(store.aggregate(id)).unwrap();
        assert_eq!(record.average_rating, Some(3.0));
        assert_eq!(record.rating_count, Some(2));
    }

    #[tokio::test]
    async fn unknown_user_cannot_login() {
        let store = MemoryRatingStore::new();
        store.add_user("ana", "pw");
        assert!(store.login("ana", "wrong").await.unwrap_err().is_auth());
        assert!(store.login("bob", "pw").await.unwrap_err().is_auth());
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_unauthorized() {
        let store = MemoryRatingStore::new();
        store.add_user("ana", "pw");
        let grant = store.login("ana", "pw").await.unwrap();
        let refresh = grant.refresh_token.unwrap();
        assert!(store.refresh(&refresh).await.is_ok());

        store.revoke_refresh_tokens();
        assert!(store.refresh(&refresh).await.unwrap_err().is_auth());
        assert_eq!(store.refresh_calls(), 2);
    }
}
