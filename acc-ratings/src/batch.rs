//! Batch submission of edited ratings and comments.
//!
//! A batch is "all attempted, partial success": every changed cell is
//! submitted on its own task, and the outcome lists each cell as either
//! succeeded or failed. One cell failing never stops or hides another.
//!
//! # Example
//!
//! ```ignore
//! let mut edits = EditSet::new();
//! edits.set_rating(cell, RatingValue::Acceptable);
//! edits.set_comment(cell, "flaky under load");
//!
//! let outcome = coordinator.submit(&edits, &submitted).await;
//! submitted.apply(&outcome);
//! println!("{}", outcome.summary());
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BatchConfig;
use crate::resolver::{AssessmentMatrix, AssessmentResolver};
use crate::session::{Clock, SessionManager, SystemClock};
use crate::store::{CommentUpdate, RatingStore, RatingSubmission};
use crate::types::{AssessmentId, CellKey, RatingId, RatingValue, UserId};
use crate::Result;

/// Reason reported for a comment on a cell the user never rated.
pub const NO_RATING_FOR_COMMENT: &str = "no rating to attach comment to";

// ────────────────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────────────────

/// Pending edits, keyed by cell.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditSet {
    #[serde(default)]
    pub ratings: BTreeMap<CellKey, RatingValue>,
    #[serde(default)]
    pub comments: BTreeMap<CellKey, String>,
}

impl EditSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_rating(&mut self, cell: CellKey, rating: RatingValue) {
        self.ratings.insert(cell, rating);
    }

    pub fn set_comment(&mut self, cell: CellKey, comments: impl Into<String>) {
        self.comments.insert(cell, comments.into());
    }

    pub fn is_empty(&self) -> bool {
        self.ratings.is_empty() && self.comments.is_empty()
    }

    /// Every cell touched by a rating or comment edit.
    pub fn cells(&self) -> BTreeSet<CellKey> {
        self.ratings
            .keys()
            .chain(self.comments.keys())
            .copied()
            .collect()
    }
}

/// Last value the server accepted for a cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedRating {
    pub rating_id: RatingId,
    pub assessment_id: AssessmentId,
    pub rating: RatingValue,
    pub comments: Option<String>,
}

/// The user's submitted view: one entry per cell the server holds a rating
/// for. Edits are compared against it to skip no-ops.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmittedRatings {
    cells: HashMap<CellKey, SubmittedRating>,
}

impl SubmittedRatings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from the user's existing ratings for the cells of `matrix`.
    pub async fn load(
        store: &dyn RatingStore,
        user_id: UserId,
        matrix: &AssessmentMatrix,
    ) -> Result<Self> {
        let mut submitted = Self::new();
        if matrix.is_empty() {
            return Ok(submitted);
        }

        let cells_by_assessment: HashMap<AssessmentId, CellKey> =
            matrix.iter().map(|(cell, id)| (id, cell)).collect();
        let records = store
            .user_ratings(user_id, &matrix.assessment_ids())
            .await?;
        for record in records {
            if let Some(cell) = cells_by_assessment.get(&record.capability_assessment_id) {
                submitted.insert(
                    *cell,
                    SubmittedRating {
                        rating_id: record.id,
                        assessment_id: record.capability_assessment_id,
                        rating: record.rating,
                        comments: record.comments,
                    },
                );
            }
        }
        debug!(user_id = %user_id, cells = submitted.len(), "loaded submitted ratings");
        Ok(submitted)
    }

    pub fn get(&self, cell: &CellKey) -> Option<&SubmittedRating> {
        self.cells.get(cell)
    }

    pub fn insert(&mut self, cell: CellKey, rating: SubmittedRating) {
        self.cells.insert(cell, rating);
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&CellKey, &SubmittedRating)> {
        self.cells.iter()
    }

    /// Fold a batch outcome in. Only succeeded entries are read.
    pub fn apply(&mut self, outcome: &BatchOutcome) {
        for (cell, rating) in &outcome.succeeded {
            self.cells.insert(*cell, rating.clone());
        }
        for (cell, comments) in &outcome.comments_applied {
            if let Some(entry) = self.cells.get_mut(cell) {
                entry.comments = Some(comments.clone());
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outcome
// ────────────────────────────────────────────────────────────────────────────

/// Per-cell results of a batch.
///
/// `succeeded` and `failed` are disjoint. Comment results are reported
/// separately since a comment can fail after its rating went through.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome {
    pub succeeded: BTreeMap<CellKey, SubmittedRating>,
    pub failed: BTreeMap<CellKey, String>,
    pub comments_applied: BTreeMap<CellKey, String>,
    pub comment_failures: BTreeMap<CellKey, String>,
}

impl BatchOutcome {
    /// Nothing was attempted.
    pub fn is_empty(&self) -> bool {
        self.succeeded.is_empty()
            && self.failed.is_empty()
            && self.comments_applied.is_empty()
            && self.comment_failures.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty() || !self.comment_failures.is_empty()
    }

    /// User-facing report: a success notice plus every failure, one per line.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.is_empty() {
            out.push_str("No changes to submit.");
            return out;
        }
        if !self.succeeded.is_empty() {
            let _ = writeln!(out, "Submitted {} rating(s).", self.succeeded.len());
        }
        if !self.comments_applied.is_empty() {
            let _ = writeln!(out, "Saved {} comment(s).", self.comments_applied.len());
        }
        if !self.failed.is_empty() {
            let _ = writeln!(out, "Failed to submit {} rating(s):", self.failed.len());
            for (cell, reason) in &self.failed {
                let _ = writeln!(out, "  {cell}: {reason}");
            }
        }
        if !self.comment_failures.is_empty() {
            let _ = writeln!(
                out,
                "Failed to save {} comment(s):",
                self.comment_failures.len()
            );
            for (cell, reason) in &self.comment_failures {
                let _ = writeln!(out, "  {cell}: {reason}");
            }
        }
        out.trim_end().to_string()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Coordinator
// ────────────────────────────────────────────────────────────────────────────

/// Work for one cell.
enum CellJob {
    Rate {
        assessment_id: AssessmentId,
        rating: RatingValue,
        comments: Option<String>,
    },
    Comment {
        submitted: SubmittedRating,
        comments: String,
    },
}

/// What happened to one cell.
struct CellReport {
    cell: CellKey,
    rating: Option<std::result::Result<SubmittedRating, String>>,
    comment: Option<std::result::Result<String, String>>,
}

impl CellReport {
    fn rating_failed(cell: CellKey, reason: String, had_comment: bool) -> Self {
        Self {
            cell,
            rating: Some(Err(reason)),
            comment: had_comment.then(|| Err("not attempted: rating submission failed".to_string())),
        }
    }
}

/// Shared by every task of a batch.
struct TaskContext {
    store: Arc<dyn RatingStore>,
    session: Arc<SessionManager>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl TaskContext {
    async fn run(&self, cell: CellKey, job: CellJob) -> CellReport {
        let deadline = Instant::now() + self.timeout;
        match job {
            CellJob::Rate {
                assessment_id,
                rating,
                comments,
            } => {
                let had_comment = comments.is_some();
                let submitted = match tokio::time::timeout_at(
                    deadline,
                    self.submit_rating(assessment_id, rating),
                )
                .await
                {
                    Ok(Ok(submitted)) => submitted,
                    Ok(Err(reason)) => return CellReport::rating_failed(cell, reason, had_comment),
                    Err(_) => {
                        let reason = format!("timed out after {:?}", self.timeout);
                        return CellReport::rating_failed(cell, reason, had_comment);
                    }
                };

                let comment = match comments {
                    Some(comments) => Some(
                        self.update_comment(deadline, submitted.rating_id, comments)
                            .await,
                    ),
                    None => None,
                };
                CellReport {
                    cell,
                    rating: Some(Ok(submitted)),
                    comment,
                }
            }
            CellJob::Comment {
                submitted,
                comments,
            } => CellReport {
                cell,
                rating: None,
                comment: Some(
                    self.update_comment(deadline, submitted.rating_id, comments)
                        .await,
                ),
            },
        }
    }

    async fn submit_rating(
        &self,
        assessment_id: AssessmentId,
        rating: RatingValue,
    ) -> std::result::Result<SubmittedRating, String> {
        let token = self.session.access_token().await.map_err(|e| e.to_string())?;
        let submission = RatingSubmission {
            capability_assessment_id: assessment_id,
            rating,
            timestamp: self.clock.now(),
        };
        let record = self
            .store
            .submit_rating(&token, &submission)
            .await
            .map_err(|e| e.to_string())?;
        Ok(SubmittedRating {
            rating_id: record.id,
            assessment_id,
            rating: record.rating,
            comments: record.comments,
        })
    }

    async fn update_comment(
        &self,
        deadline: Instant,
        rating_id: RatingId,
        comments: String,
    ) -> std::result::Result<String, String> {
        let work = async {
            let token = self.session.access_token().await.map_err(|e| e.to_string())?;
            let update = CommentUpdate {
                comments,
                timestamp: self.clock.now(),
            };
            self.store
                .update_comment(&token, rating_id, &update)
                .await
                .map(|record| record.comments.unwrap_or(update.comments))
                .map_err(|e| e.to_string())
        };
        match tokio::time::timeout_at(deadline, work).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {:?}", self.timeout)),
        }
    }
}

/// Fans a batch of edits out into independent submissions.
pub struct BatchCoordinator {
    context: Arc<TaskContext>,
    resolver: Arc<AssessmentResolver>,
    permits: Arc<Semaphore>,
}

impl BatchCoordinator {
    pub fn new(
        store: Arc<dyn RatingStore>,
        resolver: Arc<AssessmentResolver>,
        session: Arc<SessionManager>,
        config: &BatchConfig,
    ) -> Self {
        Self::with_clock(store, resolver, session, config, Arc::new(SystemClock))
    }

    /// Like [`new`](Self::new), stamping submissions with `clock`.
    pub fn with_clock(
        store: Arc<dyn RatingStore>,
        resolver: Arc<AssessmentResolver>,
        session: Arc<SessionManager>,
        config: &BatchConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            context: Arc::new(TaskContext {
                store,
                session,
                clock,
                timeout: config.submission_timeout,
            }),
            resolver,
            permits: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
        }
    }

    /// Submit every changed cell of `edits` and report each cell's result.
    ///
    /// Never fails as a whole: resolution, credential and server errors all
    /// end up as per-cell reasons. Submissions run on spawned tasks, so they
    /// finish even if the returned future is dropped.
    pub async fn submit(&self, edits: &EditSet, submitted: &SubmittedRatings) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if edits.is_empty() {
            return outcome;
        }

        // No-op suppression.
        let ratings: BTreeMap<CellKey, RatingValue> = edits
            .ratings
            .iter()
            .filter(|(cell, rating)| submitted.get(cell).map(|s| s.rating) != Some(**rating))
            .map(|(cell, rating)| (*cell, *rating))
            .collect();
        let comments: BTreeMap<CellKey, String> = edits
            .comments
            .iter()
            .filter(|(cell, comments)| {
                submitted.get(cell).and_then(|s| s.comments.as_deref()) != Some(comments.as_str())
            })
            .map(|(cell, comments)| (*cell, comments.clone()))
            .collect();

        if ratings.is_empty() && comments.is_empty() {
            debug!("all edits match submitted values, nothing to send");
            return outcome;
        }

        let assessment_ids = self.assessment_ids(&ratings, submitted, &mut outcome).await;

        let mut jobs: Vec<(CellKey, CellJob)> = Vec::new();
        for (cell, rating) in &ratings {
            let Some(assessment_id) = assessment_ids.get(cell).copied() else {
                if comments.contains_key(cell) {
                    outcome.comment_failures.insert(
                        *cell,
                        "not attempted: rating submission failed".to_string(),
                    );
                }
                continue;
            };
            jobs.push((
                *cell,
                CellJob::Rate {
                    assessment_id,
                    rating: *rating,
                    comments: comments.get(cell).cloned(),
                },
            ));
        }
        for (cell, text) in &comments {
            if ratings.contains_key(cell) {
                continue;
            }
            match submitted.get(cell) {
                Some(existing) => jobs.push((
                    *cell,
                    CellJob::Comment {
                        submitted: existing.clone(),
                        comments: text.clone(),
                    },
                )),
                None => {
                    outcome
                        .comment_failures
                        .insert(*cell, NO_RATING_FOR_COMMENT.to_string());
                }
            }
        }

        info!(
            cells = jobs.len(),
            ratings = ratings.len(),
            comments = comments.len(),
            "submitting batch"
        );

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(cell, job)| {
                let context = Arc::clone(&self.context);
                let permits = Arc::clone(&self.permits);
                let handle = tokio::spawn(async move {
                    let _permit = match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(e) => {
                            return CellReport::rating_failed(cell, e.to_string(), false);
                        }
                    };
                    context.run(cell, job).await
                });
                (cell, handle)
            })
            .collect();

        let (cells, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        for (cell, joined) in cells.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok(report) => Self::record(&mut outcome, report),
                Err(e) => {
                    outcome
                        .failed
                        .insert(cell, format!("submission task failed: {e}"));
                }
            }
        }

        if outcome.has_failures() {
            warn!(
                succeeded = outcome.succeeded.len(),
                failed = outcome.failed.len(),
                comment_failures = outcome.comment_failures.len(),
                "batch finished with failures"
            );
        } else {
            info!(succeeded = outcome.succeeded.len(), "batch submitted");
        }
        outcome
    }

    /// Assessment ids for the cells to rate: known ones from the submitted
    /// view, the rest through the resolver. Unresolvable cells are recorded
    /// as failed.
    async fn assessment_ids(
        &self,
        ratings: &BTreeMap<CellKey, RatingValue>,
        submitted: &SubmittedRatings,
        outcome: &mut BatchOutcome,
    ) -> HashMap<CellKey, AssessmentId> {
        let snapshot = self.resolver.snapshot();
        let mut ids = HashMap::new();
        let mut unresolved = Vec::new();
        for cell in ratings.keys() {
            match submitted
                .get(cell)
                .map(|s| s.assessment_id)
                .or_else(|| snapshot.get(cell))
            {
                Some(id) => {
                    ids.insert(*cell, id);
                }
                None => unresolved.push(*cell),
            }
        }
        if unresolved.is_empty() {
            return ids;
        }

        match self.resolver.resolve_cells(&unresolved).await {
            Ok(matrix) => {
                for cell in unresolved {
                    match matrix.get(&cell) {
                        Some(id) => {
                            ids.insert(cell, id);
                        }
                        None => {
                            outcome
                                .failed
                                .insert(cell, "assessment could not be resolved".to_string());
                        }
                    }
                }
            }
            Err(e) => {
                // Chunks that did resolve are in the cache; submit those.
                let snapshot = self.resolver.snapshot();
                for cell in unresolved {
                    match snapshot.get(&cell) {
                        Some(id) => {
                            ids.insert(cell, id);
                        }
                        None => {
                            outcome.failed.insert(cell, e.to_string());
                        }
                    }
                }
            }
        }
        ids
    }

    fn record(outcome: &mut BatchOutcome, report: CellReport) {
        let cell = report.cell;
        match report.rating {
            Some(Ok(rating)) => {
                outcome.succeeded.insert(cell, rating);
            }
            Some(Err(reason)) => {
                outcome.failed.insert(cell, reason);
            }
            None => {}
        }
        match report.comment {
            Some(Ok(comments)) => {
                if let Some(rating) = outcome.succeeded.get_mut(&cell) {
                    rating.comments = Some(comments.clone());
                }
                outcome.comments_applied.insert(cell, comments);
            }
            Some(Err(reason)) => {
                outcome.comment_failures.insert(cell, reason);
            }
            None => {}
        }
    }
}
