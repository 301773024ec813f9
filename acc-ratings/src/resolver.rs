//! Bulk resolution of (capability, attribute) cells to assessment ids.
//!
//! The resolver keeps one [`AssessmentCache`] per model selection. Readers get
//! an `Arc` snapshot that never changes under them; the resolver publishes a
//! new snapshot whenever it learns new ids, and swaps in an empty one when the
//! selection changes.
//!
//! ```text
//!   resolve(caps, attrs)
//!        │
//!        ▼
//!   dedupe ──▶ cache hits ─────────────────────────────┐
//!        │                                             │
//!        ▼ misses                                      ▼
//!   chunk (≤ max_cells_per_call) ──▶ bulk calls ──▶ commit ──▶ AssessmentMatrix
//!                                    (concurrent)   (if same generation)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::store::{AssessmentRef, RatingStore};
use crate::types::{AccModelId, AssessmentId, AttributeId, CapabilityId, CellKey, ComponentId};
use crate::{Error, Result};

/// The model, components and capabilities currently on screen.
///
/// Component and capability ids are kept sorted and deduplicated, so two
/// selections of the same things compare equal regardless of order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelSelection {
    pub model_id: AccModelId,
    pub component_ids: Vec<ComponentId>,
    pub capability_ids: Vec<CapabilityId>,
}

impl ModelSelection {
    pub fn new(
        model_id: AccModelId,
        component_ids: impl IntoIterator<Item = ComponentId>,
        capability_ids: impl IntoIterator<Item = CapabilityId>,
    ) -> Self {
        let component_ids: BTreeSet<_> = component_ids.into_iter().collect();
        let capability_ids: BTreeSet<_> = capability_ids.into_iter().collect();
        Self {
            model_id,
            component_ids: component_ids.into_iter().collect(),
            capability_ids: capability_ids.into_iter().collect(),
        }
    }
}

/// Known assessment ids for one selection.
///
/// Entries live in an arena; the index maps each cell to its slot.
#[derive(Debug, Clone, Default)]
pub struct AssessmentCache {
    entries: Vec<AssessmentRef>,
    index: HashMap<CellKey, usize>,
}

impl AssessmentCache {
    pub fn get(&self, cell: &CellKey) -> Option<AssessmentId> {
        self.index
            .get(cell)
            .map(|&slot| self.entries[slot].capability_assessment_id)
    }

    pub fn contains(&self, cell: &CellKey) -> bool {
        self.index.contains_key(cell)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AssessmentRef> {
        self.entries.iter()
    }

    fn insert(&mut self, entry: AssessmentRef) {
        let cell = entry.cell();
        match self.index.get(&cell) {
            Some(&slot) => self.entries[slot] = entry,
            None => {
                self.index.insert(cell, self.entries.len());
                self.entries.push(entry);
            }
        }
    }
}

/// Assessment ids for every cell of a resolved cross product.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssessmentMatrix {
    cells: BTreeMap<CellKey, AssessmentId>,
}

impl AssessmentMatrix {
    pub fn get(&self, cell: &CellKey) -> Option<AssessmentId> {
        self.cells.get(cell).copied()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CellKey, AssessmentId)> + '_ {
        self.cells.iter().map(|(cell, id)| (*cell, *id))
    }

    /// Distinct assessment ids, in id order.
    pub fn assessment_ids(&self) -> Vec<AssessmentId> {
        self.cells
            .values()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

struct ResolverState {
    selection: Option<ModelSelection>,
    cache: Arc<AssessmentCache>,
    /// Bumped every time the cache is replaced wholesale.
    generation: u64,
}

/// One bulk call's share of the misses.
struct Chunk {
    capability_ids: Vec<CapabilityId>,
    attribute_ids: Vec<AttributeId>,
}

impl Chunk {
    fn cells(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.capability_ids.iter().flat_map(move |c| {
            self.attribute_ids
                .iter()
                .map(move |a| CellKey::new(*c, *a))
        })
    }
}

/// Split the cross product of `capability_ids` × `attribute_ids` into
/// sub-products of at most `max_cells` cells each.
fn plan_chunks(
    capability_ids: &[CapabilityId],
    attribute_ids: &[AttributeId],
    max_cells: usize,
) -> Vec<Chunk> {
    let max_cells = max_cells.max(1);
    let attrs_per_chunk = attribute_ids.len().clamp(1, max_cells);
    let caps_per_chunk = (max_cells / attrs_per_chunk).max(1);

    let mut chunks = Vec::new();
    for caps in capability_ids.chunks(caps_per_chunk) {
        for attrs in attribute_ids.chunks(attrs_per_chunk) {
            chunks.push(Chunk {
                capability_ids: caps.to_vec(),
                attribute_ids: attrs.to_vec(),
            });
        }
    }
    chunks
}

/// Maps cells to assessment ids with as few remote calls as possible.
pub struct AssessmentResolver {
    store: Arc<dyn RatingStore>,
    max_cells_per_call: usize,
    state: RwLock<ResolverState>,
}

impl AssessmentResolver {
    pub fn new(store: Arc<dyn RatingStore>, max_cells_per_call: usize) -> Self {
        Self {
            store,
            max_cells_per_call: max_cells_per_call.max(1),
            state: RwLock::new(ResolverState {
                selection: None,
                cache: Arc::new(AssessmentCache::default()),
                generation: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ResolverState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ResolverState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Switch to `selection`, discarding the cache if it changed.
    ///
    /// Returns `true` when the cache was replaced.
    pub fn select(&self, selection: ModelSelection) -> bool {
        let mut state = self.write();
        if state.selection.as_ref() == Some(&selection) {
            return false;
        }
        debug!(model_id = %selection.model_id, "selection changed, clearing assessment cache");
        state.selection = Some(selection);
        state.cache = Arc::new(AssessmentCache::default());
        state.generation += 1;
        true
    }

    /// The current selection, if any.
    pub fn selection(&self) -> Option<ModelSelection> {
        self.read().selection.clone()
    }

    /// Drop every cached id for the current selection.
    pub fn invalidate(&self) {
        let mut state = self.write();
        state.cache = Arc::new(AssessmentCache::default());
        state.generation += 1;
    }

    /// Read-only view of the cache as it is now.
    pub fn snapshot(&self) -> Arc<AssessmentCache> {
        Arc::clone(&self.read().cache)
    }

    /// Resolve every cell of `capability_ids` × `attribute_ids`.
    ///
    /// Inputs are deduplicated and cached cells are not requested again.
    ///
    /// # Errors
    ///
    /// [`Error::Resolution`] if any bulk call fails or leaves cells out.
    /// Chunks that did succeed are still cached, so a retry only repeats
    /// the failed part.
    pub async fn resolve(
        &self,
        capability_ids: &[CapabilityId],
        attribute_ids: &[AttributeId],
    ) -> Result<AssessmentMatrix> {
        let attribute_ids: BTreeSet<AttributeId> = attribute_ids.iter().copied().collect();
        let cells: BTreeSet<CellKey> = capability_ids
            .iter()
            .flat_map(|c| attribute_ids.iter().map(move |a| CellKey::new(*c, *a)))
            .collect();
        self.lookup(cells).await
    }

    /// Resolve exactly `cells`, never their wider cross product.
    ///
    /// # Errors
    ///
    /// Same as [`AssessmentResolver::resolve`].
    pub async fn resolve_cells(&self, cells: &[CellKey]) -> Result<AssessmentMatrix> {
        self.lookup(cells.iter().copied().collect()).await
    }

    async fn lookup(&self, cells: BTreeSet<CellKey>) -> Result<AssessmentMatrix> {
        let (snapshot, generation) = {
            let state = self.read();
            (Arc::clone(&state.cache), state.generation)
        };

        let mut matrix = AssessmentMatrix::default();
        let mut missing: BTreeMap<CapabilityId, Vec<AttributeId>> = BTreeMap::new();
        for cell in &cells {
            match snapshot.get(cell) {
                Some(id) => {
                    matrix.cells.insert(*cell, id);
                }
                None => missing
                    .entry(cell.capability_id)
                    .or_default()
                    .push(cell.attribute_id),
            }
        }

        if missing.is_empty() {
            return Ok(matrix);
        }

        // Capabilities missing the same attributes share bulk calls, so each
        // call covers only cells that were asked for.
        let mut groups: BTreeMap<Vec<AttributeId>, Vec<CapabilityId>> = BTreeMap::new();
        for (capability_id, attribute_ids) in missing {
            groups.entry(attribute_ids).or_default().push(capability_id);
        }
        let chunks: Vec<Chunk> = groups
            .iter()
            .flat_map(|(attribute_ids, capability_ids)| {
                plan_chunks(capability_ids, attribute_ids, self.max_cells_per_call)
            })
            .collect();
        debug!(
            cached = matrix.len(),
            missing = cells.len() - matrix.len(),
            groups = groups.len(),
            calls = chunks.len(),
            "resolving assessments"
        );

        let results = join_all(chunks.iter().map(|chunk| {
            self.store
                .resolve_assessments(&chunk.capability_ids, &chunk.attribute_ids)
        }))
        .await;

        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for (chunk, result) in chunks.iter().zip(results) {
            match result {
                Ok(refs) => {
                    let returned: HashMap<CellKey, AssessmentRef> =
                        refs.into_iter().map(|r| (r.cell(), r)).collect();
                    let missing = chunk.cells().filter(|c| !returned.contains_key(c)).count();
                    if missing > 0 {
                        failures.push(format!("response omitted {missing} requested cells"));
                        continue;
                    }
                    fetched.extend(chunk.cells().filter_map(|c| returned.get(&c).copied()));
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        self.commit(generation, &fetched);

        if !failures.is_empty() {
            warn!(
                failed = failures.len(),
                calls = chunks.len(),
                "assessment resolution failed"
            );
            return Err(Error::Resolution(failures.join("; ")));
        }

        for entry in fetched {
            matrix.cells.insert(entry.cell(), entry.capability_assessment_id);
        }
        Ok(matrix)
    }

    /// Publish `fetched` unless the cache was replaced meanwhile.
    fn commit(&self, generation: u64, fetched: &[AssessmentRef]) {
        if fetched.is_empty() {
            return;
        }
        let mut state = self.write();
        if state.generation != generation {
            debug!("selection changed during resolve, not caching results");
            return;
        }
        let cache = Arc::make_mut(&mut state.cache);
        for entry in fetched {
            cache.insert(*entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRatingStore;
    use std::time::Duration;

    fn caps(ids: &[u64]) -> Vec<CapabilityId> {
        ids.iter().copied().map(CapabilityId).collect()
    }

    fn attrs(ids: &[u64]) -> Vec<AttributeId> {
        ids.iter().copied().map(AttributeId).collect()
    }

    #[test]
    fn selection_is_order_insensitive() {
        let a = ModelSelection::new(AccModelId(1), [ComponentId(2), ComponentId(1)], caps(&[5, 3, 5]));
        let b = ModelSelection::new(AccModelId(1), [ComponentId(1), ComponentId(2)], caps(&[3, 5]));
        assert_eq!(a, b);
        assert_eq!(a.capability_ids, caps(&[3, 5]));
    }

    #[test]
    fn chunks_respect_cell_limit() {
        let chunks = plan_chunks(&caps(&[1, 2, 3, 4, 5]), &attrs(&[1, 2]), 4);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.cells().count() <= 4));
        let total: usize = chunks.iter().map(|c| c.cells().count()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn chunks_split_wide_attribute_lists() {
        let chunks = plan_chunks(&caps(&[1, 2]), &attrs(&[1, 2, 3, 4, 5]), 2);
        assert!(chunks.iter().all(|c| c.cells().count() <= 2));
        let total: usize = chunks.iter().map(|c| c.cells().count()).sum();
        assert_eq!(total, 10);
    }

    #[tokio::test]
    async fn cached_cells_are_not_requested_again() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);

        let first = resolver.resolve(&caps(&[1, 2]), &attrs(&[7])).await.unwrap();
        let second = resolver.resolve(&caps(&[2, 1, 1]), &attrs(&[7, 7])).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(store.resolve_calls(), 1);
        assert_eq!(resolver.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn only_missing_cells_are_fetched() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        resolver.resolve(&caps(&[1]), &attrs(&[1])).await.unwrap();

        let matrix = resolver.resolve(&caps(&[1, 2]), &attrs(&[1])).await.unwrap();
        assert_eq!(matrix.len(), 2);
        assert_eq!(store.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn empty_inputs_make_no_calls() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        assert!(resolver.resolve(&[], &attrs(&[1])).await.unwrap().is_empty());
        assert!(resolver.resolve(&caps(&[1]), &[]).await.unwrap().is_empty());
        assert_eq!(store.resolve_calls(), 0);
    }

    #[tokio::test]
    async fn selection_change_swaps_cache() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        assert!(resolver.select(ModelSelection::new(AccModelId(1), Vec::<ComponentId>::new(), caps(&[1]))));
        resolver.resolve(&caps(&[1]), &attrs(&[1])).await.unwrap();
        let old = resolver.snapshot();

        assert!(!resolver.select(ModelSelection::new(AccModelId(1), Vec::<ComponentId>::new(), caps(&[1]))));
        assert_eq!(resolver.snapshot().len(), 1);

        assert!(resolver.select(ModelSelection::new(AccModelId(2), Vec::<ComponentId>::new(), caps(&[1]))));
        assert!(resolver.snapshot().is_empty());
        assert_eq!(old.len(), 1);
    }

    #[tokio::test]
    async fn component_or_capability_change_swaps_cache() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        resolver.select(ModelSelection::new(AccModelId(1), [ComponentId(1)], caps(&[1])));
        resolver.resolve(&caps(&[1]), &attrs(&[1])).await.unwrap();

        assert!(resolver.select(ModelSelection::new(
            AccModelId(1),
            [ComponentId(1), ComponentId(2)],
            caps(&[1]),
        )));
        assert!(resolver.snapshot().is_empty());

        resolver.resolve(&caps(&[1]), &attrs(&[1])).await.unwrap();
        assert!(resolver.select(ModelSelection::new(
            AccModelId(1),
            [ComponentId(1), ComponentId(2)],
            caps(&[1, 2]),
        )));
        assert!(resolver.snapshot().is_empty());
        assert_eq!(store.resolve_calls(), 2);
    }

    #[tokio::test]
    async fn exact_cells_do_not_widen_to_cross_product() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        let diagonal = [
            CellKey::new(CapabilityId(1), AttributeId(1)),
            CellKey::new(CapabilityId(2), AttributeId(2)),
        ];

        let matrix = resolver.resolve_cells(&diagonal).await.unwrap();

        assert_eq!(matrix.len(), 2);
        assert_eq!(store.assessment_count(), 2);
        assert_eq!(resolver.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn scattered_misses_only_fetch_missing_cells() {
        let store = Arc::new(MemoryRatingStore::new());
        let resolver = AssessmentResolver::new(store.clone(), 100);
        resolver
            .resolve_cells(&[
                CellKey::new(CapabilityId(1), AttributeId(2)),
                CellKey::new(CapabilityId(2), AttributeId(1)),
            ])
            .await
            .unwrap();

        let matrix = resolver.resolve(&caps(&[1, 2]), &attrs(&[1, 2])).await.unwrap();

        assert_eq!(matrix.len(), 4);
        assert_eq!(store.assessment_count(), 4);
        assert_eq!(resolver.snapshot().len(), 4);
    }

    #[test]
    fn matrix_ids_are_distinct() {
        let mut matrix = AssessmentMatrix::default();
        matrix.cells.insert(CellKey::new(CapabilityId(1), AttributeId(1)), AssessmentId(9));
        matrix.cells.insert(CellKey::new(CapabilityId(2), AttributeId(1)), AssessmentId(3));
        matrix.cells.insert(CellKey::new(CapabilityId(3), AttributeId(1)), AssessmentId(9));
        assert_eq!(matrix.assessment_ids(), vec![AssessmentId(3), AssessmentId(9)]);
    }

    #[tokio::test]
    async fn failed_chunk_fails_resolve_but_keeps_successful_chunks() {
        let store = Arc::new(MemoryRatingStore::new());
        store.fail_resolution_for(CapabilityId(3));
        let resolver = AssessmentResolver::new(store.clone(), 1);

        let err = resolver
            .resolve(&caps(&[1, 2, 3]), &attrs(&[1]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
        assert_eq!(store.resolve_calls(), 3);

        let snapshot = resolver.snapshot();
        assert!(snapshot.contains(&CellKey::new(CapabilityId(1), AttributeId(1))));
        assert!(snapshot.contains(&CellKey::new(CapabilityId(2), AttributeId(1))));
        assert!(!snapshot.contains(&CellKey::new(CapabilityId(3), AttributeId(1))));
    }

    #[tokio::test]
    async fn results_from_a_replaced_selection_are_not_cached() {
        let store = Arc::new(MemoryRatingStore::new().with_latency(Duration::from_millis(50)));
        let resolver = Arc::new(AssessmentResolver::new(store.clone(), 100));
        resolver.select(ModelSelection::new(AccModelId(1), Vec::<ComponentId>::new(), caps(&[1])));

        let task = {
            let resolver = Arc::clone(&resolver);
            tokio::spawn(async move { resolver.resolve(&caps(&[1]), &attrs(&[1])).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        resolver.select(ModelSelection::new(AccModelId(2), Vec::<ComponentId>::new(), caps(&[1])));

        let matrix = task.await.unwrap().unwrap();
        assert_eq!(matrix.len(), 1);
        assert!(resolver.snapshot().is_empty());
    }
}
