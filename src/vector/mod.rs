// Vector indexes.
//
// All variants implement the same `VectorIndex` capability; the index
// manager and the engine never see a concrete type. Distance metrics are
// looked up by name at construction time.

pub mod distance;
pub mod flat;
pub mod hnsw;

pub use distance::{distance_fn, register_distance, DistanceFn};
pub use flat::FlatIndex;
pub use hnsw::HnswIndex;

use crate::common::RowId;
use crate::error::DbError;
use crate::index::IndexKind;
use crate::Result;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Shared configuration for every vector index variant.
#[derive(Debug, Clone)]
pub struct VectorIndexConfig {
    pub name: String,
    pub table: String,
    pub column: String,
    pub kind: IndexKind,
    /// Metric name resolved against the distance registry.
    pub metric: String,
    /// All inserts and queries must match this dimension.
    pub dimension: usize,
    /// Variant-specific parameter bag (e.g. "m", "ef_construction").
    pub params: HashMap<String, f64>,
}

impl VectorIndexConfig {
    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.params.get(name).copied().unwrap_or(default)
    }
}

/// Ranked search output; `ids` and `distances` are parallel, closest first.
#[derive(Debug, Clone, Default)]
pub struct VectorSearchResult {
    pub ids: Vec<RowId>,
    pub distances: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct VectorIndexStats {
    pub vector_count: usize,
    pub dimension: usize,
    pub metric: String,
    /// Highest graph layer; zero for flat variants.
    pub max_level: usize,
}

/// Pull-based loader used by `build`: returns `None` when exhausted.
pub type DataLoader<'a> = dyn FnMut() -> Result<Option<(RowId, Vec<f32>)>> + 'a;

pub trait VectorIndex: Send + Sync {
    /// Bulk-populate from a loader. The default drains the loader through
    /// `insert`.
    fn build(&self, loader: &mut DataLoader<'_>) -> Result<()> {
        while let Some((id, vector)) = loader()? {
            self.insert(id, &vector)?;
        }
        Ok(())
    }

    fn insert(&self, id: RowId, vector: &[f32]) -> Result<()>;

    fn delete(&self, id: RowId) -> Result<()>;

    /// K-nearest search. When `filter` is present only ids in the set may
    /// appear in the result.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<RowId>>,
    ) -> Result<VectorSearchResult>;

    fn config(&self) -> &VectorIndexConfig;

    fn stats(&self) -> VectorIndexStats;

    /// Clear all vectors, keeping the configuration.
    fn reset(&self) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Construct a vector index for the configured kind.
pub fn create_vector_index(config: VectorIndexConfig) -> Result<Arc<dyn VectorIndex>> {
    match config.kind {
        IndexKind::VectorFlat => Ok(Arc::new(FlatIndex::new(config)?)),
        IndexKind::VectorHnsw => Ok(Arc::new(HnswIndex::new(config)?)),
        other => Err(DbError::UnsupportedIndexKind(format!("{:?}", other))),
    }
}

pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> Result<()> {
    if vector.len() != expected {
        return Err(DbError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}
