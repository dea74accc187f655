//! HNSW vector index manager with soft delete
//!
//! Removal only flags an id; the graph is untouched and search filters the
//! flagged ids out, so `remove` and `unmark_deleted` are O(1) per id. The raw
//! vectors are kept alongside the graph, which is rebuilt from them on import.

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, info};

const MAGIC: &[u8; 4] = b"BDXV";
const SNAPSHOT_VERSION: u32 = 1;
const MAX_LAYERS: usize = 16;
const MIN_CAPACITY: usize = 10_000;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("Invalid dimension: expected {expected}, got {actual}")]
    InvalidDimension { expected: usize, actual: usize },

    #[error("Unknown vector id: {0}")]
    UnknownId(usize),

    #[error("Unknown distance space: {0}")]
    UnknownSpace(String),

    #[error("Invalid index parameter: {0}")]
    InvalidParameter(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Geometry used both to build the graph and to rank results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorSpace {
    /// Squared L2 distance
    Euclidean,
    /// `1 - <a, b>`, negative when the vectors are not normalised
    InnerProduct,
    /// `1 - cos(a, b)`
    Cosine,
}

impl VectorSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            VectorSpace::Euclidean => "euclidean",
            VectorSpace::InnerProduct => "innerproduct",
            VectorSpace::Cosine => "cosine",
        }
    }

    /// Distance between two vectors of equal length; smaller is closer in every space
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VectorSpace::Euclidean => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum(),
            VectorSpace::InnerProduct => 1.0 - dot(a, b),
            VectorSpace::Cosine => {
                let norm = dot(a, a).sqrt() * dot(b, b).sqrt();
                if norm == 0.0 {
                    return 1.0;
                }
                (1.0 - dot(a, b) / norm).max(0.0)
            }
        }
    }

    /// Distance the HNSW graph is built on
    ///
    /// hnsw_rs requires non-negative distances. For inner product this is
    /// softplus(-<a, b>), which orders pairs exactly like `1 - <a, b>`.
    pub fn graph_distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            VectorSpace::InnerProduct => softplus(-f64::from(dot(a, b))) as f32,
            VectorSpace::Euclidean | VectorSpace::Cosine => self.distance(a, b),
        }
    }

    /// Map a distance onto a relevance score where higher is better
    pub fn similarity(&self, distance: f32) -> f32 {
        match self {
            VectorSpace::Euclidean => -distance,
            VectorSpace::InnerProduct | VectorSpace::Cosine => 1.0 - distance,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `ln(1 + e^x)` without overflow
fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

impl fmt::Display for VectorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VectorSpace {
    type Err = VectorIndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(VectorSpace::Euclidean),
            "innerproduct" | "inner_product" | "ip" => Ok(VectorSpace::InnerProduct),
            "cosine" => Ok(VectorSpace::Cosine),
            other => Err(VectorIndexError::UnknownSpace(other.to_string())),
        }
    }
}

/// hnsw_rs distance adapter for a [`VectorSpace`]
#[derive(Debug, Clone, Copy)]
pub struct SpaceDistance(pub VectorSpace);

impl Distance<f32> for SpaceDistance {
    fn eval(&self, va: &[f32], vb: &[f32]) -> f32 {
        self.0.graph_distance(va, vb)
    }
}

/// HNSW graph parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    /// Maximum connections per node
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

/// Counts reported by [`VectorIndexManager::stats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VectorStats {
    pub num_vectors: usize,
    pub active_vectors: usize,
    pub num_dimensions: usize,
    pub space: VectorSpace,
}

#[derive(Serialize, Deserialize)]
struct SnapshotHeader {
    version: u32,
    ndims: usize,
    space: VectorSpace,
    params: HnswParams,
    count: usize,
    deleted: BTreeSet<usize>,
}

/// Approximate nearest-neighbour index keyed by insertion order
pub struct VectorIndexManager {
    ndims: usize,
    space: VectorSpace,
    params: HnswParams,
    hnsw: Hnsw<'static, f32, SpaceDistance>,
    vectors: Vec<Vec<f32>>,
    deleted: BTreeSet<usize>,
}

impl VectorIndexManager {
    pub fn new(ndims: usize, space: VectorSpace) -> Result<Self, VectorIndexError> {
        Self::with_params(ndims, space, HnswParams::default())
    }

    pub fn with_params(
        ndims: usize,
        space: VectorSpace,
        params: HnswParams,
    ) -> Result<Self, VectorIndexError> {
        if ndims == 0 {
            return Err(VectorIndexError::InvalidParameter(
                "ndims must be greater than 0".to_string(),
            ));
        }
        if params.m == 0 || params.ef_construction == 0 || params.ef_search == 0 {
            return Err(VectorIndexError::InvalidParameter(format!(
                "HNSW parameters must be positive: {:?}",
                params
            )));
        }
        Ok(Self {
            ndims,
            space,
            params,
            hnsw: Self::new_graph(space, params, MIN_CAPACITY),
            vectors: Vec::new(),
            deleted: BTreeSet::new(),
        })
    }

    fn new_graph(
        space: VectorSpace,
        params: HnswParams,
        capacity: usize,
    ) -> Hnsw<'static, f32, SpaceDistance> {
        Hnsw::<f32, SpaceDistance>::new(
            params.m,
            capacity.max(MIN_CAPACITY),
            MAX_LAYERS,
            params.ef_construction,
            SpaceDistance(space),
        )
    }

    pub fn ndims(&self) -> usize {
        self.ndims
    }

    pub fn space(&self) -> VectorSpace {
        self.space
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn is_deleted(&self, id: usize) -> bool {
        self.deleted.contains(&id)
    }

    pub fn vector(&self, id: usize) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), VectorIndexError> {
        if vector.len() != self.ndims {
            return Err(VectorIndexError::InvalidDimension {
                expected: self.ndims,
                actual: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            return Err(VectorIndexError::InvalidParameter(
                "vector components must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn check_id(&self, id: usize) -> Result<(), VectorIndexError> {
        if id >= self.vectors.len() {
            return Err(VectorIndexError::UnknownId(id));
        }
        Ok(())
    }

    /// Insert vectors and return the ids assigned to them
    ///
    /// Every vector is checked before any is inserted.
    pub fn add<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> Result<Vec<usize>, VectorIndexError> {
        for vector in vectors {
            self.check_dimension(vector.as_ref())?;
        }

        let mut ids = Vec::with_capacity(vectors.len());
        for vector in vectors {
            let id = self.vectors.len();
            let data = vector.as_ref().to_vec();
            self.hnsw.insert((&data[..], id));
            self.vectors.push(data);
            ids.push(id);
        }

        info!("Added {} vectors to the index", ids.len());
        Ok(ids)
    }

    /// Soft-delete ids; unknown ids fail before anything is flagged
    pub fn remove(&mut self, ids: &[usize]) -> Result<(), VectorIndexError> {
        for &id in ids {
            self.check_id(id)?;
        }
        self.deleted.extend(ids.iter().copied());
        info!("Removed {} vectors from the index", ids.len());
        Ok(())
    }

    /// Make soft-deleted ids searchable again
    pub fn unmark_deleted(&mut self, ids: &[usize]) -> Result<(), VectorIndexError> {
        for &id in ids {
            self.check_id(id)?;
        }
        for id in ids {
            self.deleted.remove(id);
        }
        info!("Unmarked {} vectors as deleted", ids.len());
        Ok(())
    }

    /// Nearest `k` live vectors as (ids, distances), closest first
    ///
    /// Distances are recomputed in the index space from the stored vectors,
    /// so inner-product results carry `1 - <a, b>` rather than the graph value.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
    ) -> Result<(Vec<usize>, Vec<f32>), VectorIndexError> {
        self.check_dimension(query)?;
        let active = self.vectors.len() - self.deleted.len();
        if active == 0 || k == 0 {
            debug!("Vector index has no live vectors, no search results");
            return Ok((Vec::new(), Vec::new()));
        }

        // over-fetch so filtering tombstones still leaves k candidates
        let fetch = (k + self.deleted.len()).min(self.vectors.len());
        let ef = self.params.ef_search.max(fetch);
        let mut neighbours: Vec<(usize, f32)> = self
            .hnsw
            .search(query, fetch, ef)
            .into_iter()
            .filter(|n| !self.deleted.contains(&n.d_id))
            .filter_map(|n| {
                let stored = self.vectors.get(n.d_id)?;
                Some((n.d_id, self.space.distance(query, stored)))
            })
            .collect();
        neighbours.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        neighbours.truncate(k);

        Ok(neighbours.into_iter().unzip())
    }

    pub fn stats(&self) -> VectorStats {
        VectorStats {
            num_vectors: self.vectors.len(),
            active_vectors: self.vectors.len() - self.deleted.len(),
            num_dimensions: self.ndims,
            space: self.space,
        }
    }

    /// Serialize as `BDXV | u32 header len | JSON header | f32 LE vectors`
    pub fn export(&self) -> Result<Vec<u8>, VectorIndexError> {
        let header = SnapshotHeader {
            version: SNAPSHOT_VERSION,
            ndims: self.ndims,
            space: self.space,
            params: self.params,
            count: self.vectors.len(),
            deleted: self.deleted.clone(),
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| VectorIndexError::SerializationError("header too large".to_string()))?;

        let mut out =
            Vec::with_capacity(8 + header.len() + self.vectors.len() * self.ndims * 4);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        for vector in &self.vectors {
            for value in vector {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(out)
    }

    /// Restore a manager from [`export`](Self::export) output, rebuilding the graph
    pub fn import(bytes: &[u8]) -> Result<Self, VectorIndexError> {
        let corrupt = |msg: &str| VectorIndexError::SerializationError(msg.to_string());

        if bytes.len() < 8 || &bytes[..4] != MAGIC {
            return Err(corrupt("not a vector index snapshot"));
        }
        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&bytes[4..8]);
        let header_len = u32::from_le_bytes(len_buf) as usize;
        let body_start = 8 + header_len;
        if bytes.len() < body_start {
            return Err(corrupt("truncated header"));
        }

        let header: SnapshotHeader = serde_json::from_slice(&bytes[8..body_start])
            .map_err(|e| VectorIndexError::SerializationError(e.to_string()))?;
        if header.version != SNAPSHOT_VERSION {
            return Err(VectorIndexError::SerializationError(format!(
                "unsupported snapshot version {}",
                header.version
            )));
        }

        let body = &bytes[body_start..];
        if body.len() != header.count * header.ndims * 4 {
            return Err(corrupt("vector payload does not match header"));
        }
        if let Some(&bad) = header.deleted.iter().find(|&&id| id >= header.count) {
            return Err(VectorIndexError::UnknownId(bad));
        }
        if cfg!(target_endian = "big") {
            return Err(corrupt("big-endian hosts are not supported"));
        }
        // the body is not guaranteed to be 4-byte aligned
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(body);

        let mut manager = Self::with_params(header.ndims, header.space, header.params)?;
        manager.hnsw = Self::new_graph(header.space, header.params, header.count);
        manager.vectors = values
            .chunks_exact(header.ndims)
            .map(<[f32]>::to_vec)
            .collect();
        for (id, vector) in manager.vectors.iter().enumerate() {
            manager.hnsw.insert((&vector[..], id));
        }
        manager.deleted = header.deleted;

        debug!(
            "Imported vector index with {} vectors ({} deleted)",
            manager.vectors.len(),
            manager.deleted.len()
        );
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(i: usize, ndims: usize) -> Vec<f32> {
        let mut v = vec![0.0; ndims];
        v[i] = 1.0;
        v
    }

    #[test]
    fn test_cosine_self_match() {
        let mut index = VectorIndexManager::new(3, VectorSpace::Cosine).unwrap();
        let ids = index.add(&[vec![1.0f32, 0.0, 0.0]]).unwrap();
        assert_eq!(ids, vec![0]);

        let (ids, distances) = index.search(&[1.0, 0.0, 0.0], 1).unwrap();
        assert_eq!(ids, vec![0]);
        assert!(distances[0].abs() < 1e-6);
    }

    #[test]
    fn test_dimension_validation() {
        let mut index = VectorIndexManager::new(3, VectorSpace::Cosine).unwrap();
        assert!(matches!(
            index.add(&[vec![1.0f32, 0.0]]),
            Err(VectorIndexError::InvalidDimension {
                expected: 3,
                actual: 2
            })
        ));
        assert!(index.is_empty());
        assert!(index.search(&[1.0], 1).is_err());
    }

    #[test]
    fn test_soft_delete_and_restore() {
        let mut index = VectorIndexManager::new(4, VectorSpace::Euclidean).unwrap();
        let ids = index
            .add(&[unit(0, 4), unit(1, 4), unit(2, 4), unit(3, 4)])
            .unwrap();
        assert_eq!(ids, vec![0, 1, 2, 3]);

        index.remove(&[0]).unwrap();
        let (ids, _) = index.search(&unit(0, 4), 4).unwrap();
        assert_eq!(ids.len(), 3);
        assert!(!ids.contains(&0));

        index.unmark_deleted(&[0]).unwrap();
        let (ids, distances) = index.search(&unit(0, 4), 1).unwrap();
        assert_eq!(ids, vec![0]);
        assert_eq!(distances, vec![0.0]);
    }

    #[test]
    fn test_unknown_ids() {
        let mut index = VectorIndexManager::new(2, VectorSpace::Cosine).unwrap();
        index.add(&[vec![1.0f32, 0.0]]).unwrap();
        assert!(matches!(
            index.remove(&[0, 5]),
            Err(VectorIndexError::UnknownId(5))
        ));
        // nothing was flagged by the failed call
        assert!(!index.is_deleted(0));
        assert!(index.unmark_deleted(&[9]).is_err());
    }

    #[test]
    fn test_empty_and_all_deleted_search() {
        let mut index = VectorIndexManager::new(2, VectorSpace::InnerProduct).unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 3).unwrap(), (vec![], vec![]));

        index.add(&[vec![1.0f32, 0.0]]).unwrap();
        index.remove(&[0]).unwrap();
        assert_eq!(index.search(&[1.0, 0.0], 3).unwrap(), (vec![], vec![]));
    }

    #[test]
    fn test_inner_product_ranking() {
        let mut index = VectorIndexManager::new(2, VectorSpace::InnerProduct).unwrap();
        index
            .add(&[vec![0.2f32, 0.0], vec![0.9, 0.0], vec![0.0, 1.0]])
            .unwrap();
        let (ids, distances) = index.search(&[1.0, 0.0], 2).unwrap();
        assert_eq!(ids, vec![1, 0]);
        assert!(distances[0] < distances[1]);
        assert!((VectorSpace::InnerProduct.similarity(distances[0]) - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_export_import_roundtrip() {
        let mut index = VectorIndexManager::new(8, VectorSpace::Cosine).unwrap();
        let vectors: Vec<Vec<f32>> = (0..20)
            .map(|i| (0..8).map(|j| ((i + 1) as f32 * (j + 1) as f32).sin()).collect())
            .collect();
        index.add(&vectors).unwrap();
        index.remove(&[3, 7]).unwrap();

        let restored = VectorIndexManager::import(&index.export().unwrap()).unwrap();
        assert_eq!(restored.stats(), index.stats());
        assert!(restored.is_deleted(3));
        assert_eq!(restored.vector(5), index.vector(5));

        for query in [&vectors[0], &vectors[3], &vectors[12]] {
            let (ids_a, dist_a) = index.search(query, 5).unwrap();
            let (ids_b, dist_b) = restored.search(query, 5).unwrap();
            assert_eq!(ids_a, ids_b);
            for (a, b) in dist_a.iter().zip(&dist_b) {
                assert!((a - b).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_import_rejects_garbage() {
        assert!(VectorIndexManager::import(b"").is_err());
        assert!(VectorIndexManager::import(b"nope nope nope").is_err());
    }

    #[test]
    fn test_space_parsing() {
        assert_eq!("cosine".parse::<VectorSpace>().unwrap(), VectorSpace::Cosine);
        assert_eq!("InnerProduct".parse::<VectorSpace>().unwrap(), VectorSpace::InnerProduct);
        assert_eq!("l2".parse::<VectorSpace>().unwrap(), VectorSpace::Euclidean);
        assert!("manhattan".parse::<VectorSpace>().is_err());
    }

    #[test]
    fn test_zero_vector_cosine() {
        assert_eq!(VectorSpace::Cosine.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_inner_product_unnormalized_vectors() {
        let mut index = VectorIndexManager::new(2, VectorSpace::InnerProduct).unwrap();
        let vectors: Vec<Vec<f32>> = (0..50)
            .map(|i| vec![i as f32, (50 - i) as f32 * 0.1])
            .collect();
        index.add(&vectors).unwrap();

        let (ids, distances) = index.search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(ids, vec![49, 48, 47]);
        assert_eq!(distances, vec![-48.0, -47.0, -46.0]);
        assert_eq!(VectorSpace::InnerProduct.similarity(distances[0]), 49.0);

        let restored = VectorIndexManager::import(&index.export().unwrap()).unwrap();
        assert_eq!(restored.search(&[1.0, 0.0], 3).unwrap().0, vec![49, 48, 47]);
    }

    #[test]
    fn test_graph_distance_is_never_negative() {
        let space = VectorSpace::InnerProduct;
        let pairs: [(&[f32], &[f32]); 4] = [
            (&[100.0, 0.0], &[100.0, 0.0]),
            (&[3.0, 4.0], &[3.0, 4.0]),
            (&[1.0, 0.0], &[-50.0, 0.0]),
            (&[0.0, 0.0], &[1.0, 1.0]),
        ];
        for (a, b) in pairs {
            assert!(space.graph_distance(a, b) >= 0.0, "{:?} {:?}", a, b);
        }
        // larger inner product, smaller graph distance
        assert!(
            space.graph_distance(&[2.0, 0.0], &[1.0, 0.0])
                < space.graph_distance(&[1.0, 0.0], &[1.0, 0.0])
        );
    }

    #[test]
    fn test_non_finite_vectors_rejected() {
        let mut index = VectorIndexManager::new(2, VectorSpace::Euclidean).unwrap();
        assert!(matches!(
            index.add(&[vec![f32::NAN, 0.0]]),
            Err(VectorIndexError::InvalidParameter(_))
        ));
        assert!(index.is_empty());
        assert!(index.search(&[f32::INFINITY, 0.0], 1).is_err());
    }
}
