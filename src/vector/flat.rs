// Exhaustive (brute-force) vector index. Ground truth for recall testing
// and the right choice for small collections.

use crate::common::RowId;
use crate::vector::{
    check_dimension, distance_fn, DistanceFn, VectorIndex, VectorIndexConfig, VectorIndexStats,
    VectorSearchResult,
};
use crate::Result;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

pub struct FlatIndex {
    config: VectorIndexConfig,
    dist: DistanceFn,
    vectors: RwLock<HashMap<RowId, Vec<f32>>>,
}

impl FlatIndex {
    pub fn new(config: VectorIndexConfig) -> Result<Self> {
        let dist = distance_fn(&config.metric)?;
        Ok(Self {
            config,
            dist,
            vectors: RwLock::new(HashMap::new()),
        })
    }
}

impl VectorIndex for FlatIndex {
    fn insert(&self, id: RowId, vector: &[f32]) -> Result<()> {
        check_dimension(self.config.dimension, vector)?;
        self.vectors.write().insert(id, vector.to_vec());
        Ok(())
    }

    fn delete(&self, id: RowId) -> Result<()> {
        self.vectors.write().remove(&id);
        Ok(())
    }

    fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&HashSet<RowId>>,
    ) -> Result<VectorSearchResult> {
        check_dimension(self.config.dimension, query)?;
        let vectors = self.vectors.read();

        let mut scored: Vec<(f32, RowId)> = vectors
            .iter()
            .filter(|(id, _)| filter.map(|f| f.contains(id)).unwrap_or(true))
            .map(|(id, v)| ((self.dist)(query, v), *id))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        scored.truncate(k);

        Ok(VectorSearchResult {
            ids: scored.iter().map(|(_, id)| *id).collect(),
            distances: scored.iter().map(|(d, _)| *d).collect(),
        })
    }

    fn config(&self) -> &VectorIndexConfig {
        &self.config
    }

    fn stats(&self) -> VectorIndexStats {
        VectorIndexStats {
            vector_count: self.vectors.read().len(),
            dimension: self.config.dimension,
            metric: self.config.metric.clone(),
            max_level: 0,
        }
    }

    fn reset(&self) -> Result<()> {
        self.vectors.write().clear();
        Ok(())
    }
}
