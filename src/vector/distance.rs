// Distance metrics, registered process-wide by name.
//
// The registry is written during startup (built-ins at first touch,
// extensions via `register_distance`) and read-only afterwards.

use crate::error::DbError;
use crate::Result;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Smaller result = closer vectors.
pub type DistanceFn = Arc<dyn Fn(&[f32], &[f32]) -> f32 + Send + Sync>;

pub const METRIC_COSINE: &str = "cosine";
pub const METRIC_L2: &str = "l2";
pub const METRIC_INNER_PRODUCT: &str = "inner_product";

static REGISTRY: Lazy<RwLock<HashMap<String, DistanceFn>>> = Lazy::new(|| {
    let mut metrics: HashMap<String, DistanceFn> = HashMap::new();
    metrics.insert(METRIC_COSINE.to_string(), Arc::new(cosine_distance));
    metrics.insert(METRIC_L2.to_string(), Arc::new(l2_distance));
    metrics.insert(
        METRIC_INNER_PRODUCT.to_string(),
        Arc::new(inner_product_distance),
    );
    RwLock::new(metrics)
});

/// Register a metric under a name, replacing any previous registration.
pub fn register_distance(name: &str, f: DistanceFn) {
    REGISTRY.write().insert(name.to_string(), f);
}

/// Look up a metric by name.
pub fn distance_fn(name: &str) -> Result<DistanceFn> {
    REGISTRY
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| DbError::UnknownMetric(name.to_string()))
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// 1 - cosine similarity. Zero-norm vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let norm_a = dot(a, a).sqrt();
    let norm_b = dot(b, b).sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot(a, b) / (norm_a * norm_b)
}

/// Euclidean distance.
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Negated dot product, so larger inner products rank closer.
pub fn inner_product_distance(a: &[f32], b: &[f32]) -> f32 {
    -dot(a, b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_metrics() {
        let a = [1.0f32, 0.0];
        let b = [0.0f32, 1.0];
        let cos = distance_fn(METRIC_COSINE).unwrap();
        assert!((cos(&a, &a)).abs() < 1e-6);
        assert!((cos(&a, &b) - 1.0).abs() < 1e-6);

        let l2 = distance_fn(METRIC_L2).unwrap();
        assert!((l2(&a, &b) - 2.0f32.sqrt()).abs() < 1e-6);

        let ip = distance_fn(METRIC_INNER_PRODUCT).unwrap();
        assert_eq!(ip(&a, &a), -1.0);
    }

    #[test]
    fn test_unknown_metric() {
        assert!(matches!(
            distance_fn("hamming"),
            Err(DbError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_register_custom() {
        register_distance("always_zero", Arc::new(|_, _| 0.0));
        let f = distance_fn("always_zero").unwrap();
        assert_eq!(f(&[1.0], &[2.0]), 0.0);
    }

    #[test]
    fn test_cosine_zero_norm() {
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 1.0]), 1.0);
    }
}
