//! Vector index service contract and the exact (flat) implementation.
//!
//! Callers L2-normalize vectors before [`VectorIndex::add`] and before
//! [`VectorIndex::search`], so ascending squared-L2 distance orders results
//! the same way as descending cosine similarity.

use crate::embedding::{blob_to_vec, l2_normalize, vec_to_blob};
use crate::error::{Error, Result};

/// Opaque nearest-neighbour index.
///
/// `search` returns vector positions (insertion order) and distances, both
/// sorted by ascending distance and at most `k` long.
pub trait VectorIndex: Send + Sync {
    fn dims(&self) -> usize;

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()>;

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<usize>, Vec<f32>)>;

    fn size(&self) -> usize;

    /// Serialize for persistence.
    fn to_bytes(&self) -> Vec<u8>;
}

/// Creates and restores [`VectorIndex`] instances.
pub trait VectorIndexFactory: Send + Sync {
    fn create(&self, dims: usize) -> Box<dyn VectorIndex>;

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn VectorIndex>>;
}

/// Brute-force index over normalized vectors. Exact, and fast enough for the
/// corpus sizes a single-process deployment handles.
#[derive(Debug, Clone)]
pub struct FlatIndex {
    dims: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            vectors: Vec::new(),
        }
    }

    /// Restore from [`VectorIndex::to_bytes`] output: a little-endian `u32`
    /// dimensionality header followed by packed `f32` rows.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::persistence("Vector index blob is truncated"));
        }
        let dims = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        let body = &bytes[4..];
        if dims == 0 || body.len() % (dims * 4) != 0 {
            return Err(Error::persistence(format!(
                "Vector index blob of {} bytes does not hold {dims}-dim rows",
                body.len()
            )));
        }
        let flat = blob_to_vec(body);
        let vectors = flat.chunks_exact(dims).map(|row| row.to_vec()).collect();
        Ok(Self { dims, vectors })
    }

    fn check_dims(&self, len: usize) -> Result<()> {
        if len != self.dims {
            return Err(Error::validation(format!(
                "Dimension mismatch: index has {} dims, got {len}",
                self.dims
            )));
        }
        Ok(())
    }
}

impl VectorIndex for FlatIndex {
    fn dims(&self) -> usize {
        self.dims
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        for vec in vectors {
            self.check_dims(vec.len())?;
        }
        for vec in vectors {
            let mut row = vec.clone();
            l2_normalize(&mut row);
            self.vectors.push(row);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<(Vec<usize>, Vec<f32>)> {
        self.check_dims(query.len())?;
        let mut q = query.to_vec();
        l2_normalize(&mut q);

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(pos, row)| {
                let dist: f32 = row.iter().zip(&q).map(|(a, b)| (a - b) * (a - b)).sum();
                (pos, dist)
            })
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1));
        scored.truncate(k);

        Ok(scored.into_iter().unzip())
    }

    fn size(&self) -> usize {
        self.vectors.len()
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.vectors.len() * self.dims * 4);
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        for row in &self.vectors {
            bytes.extend_from_slice(&vec_to_blob(row));
        }
        bytes
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlatIndexFactory;

impl VectorIndexFactory for FlatIndexFactory {
    fn create(&self, dims: usize) -> Box<dyn VectorIndex> {
        Box::new(FlatIndex::new(dims))
    }

    fn load(&self, bytes: &[u8]) -> Result<Box<dyn VectorIndex>> {
        Ok(Box::new(FlatIndex::from_bytes(bytes)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_search_orders_by_distance() {
        let mut index = FlatIndex::new(2);
        index
            .add(&[vec![0.0, 1.0], vec![1.0, 0.0], vec![1.0, 1.0]])
            .unwrap();

        let (ids, distances) = index.search(&[2.0, 0.1], 2).unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert!(distances[0] <= distances[1]);
        assert_eq!(index.size(), 3);
    }

    #[test]
    fn test_dimension_mismatch_is_validation_error() {
        let mut index = FlatIndex::new(3);
        assert!(matches!(
            index.add(&[vec![1.0, 2.0]]),
            Err(Error::Validation { .. })
        ));
        assert!(matches!(
            index.search(&[1.0], 1),
            Err(Error::Validation { .. })
        ));
        assert_eq!(index.size(), 0);
    }

    #[test]
    fn test_bytes_restore_same_results() {
        let mut index = FlatIndex::new(3);
        index
            .add(&[vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 2.0]])
            .unwrap();
        let restored = FlatIndexFactory.load(&index.to_bytes()).unwrap();
        assert_eq!(restored.dims(), 3);
        assert_eq!(
            restored.search(&[0.0, 0.0, 1.0], 1).unwrap().0,
            index.search(&[0.0, 0.0, 1.0], 1).unwrap().0
        );
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        assert!(FlatIndex::from_bytes(&[1, 0]).is_err());
        let mut bytes = 2u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(FlatIndex::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_search_empty_index() {
        let index = FlatIndex::new(2);
        let (ids, distances) = index.search(&[1.0, 0.0], 5).unwrap();
        assert!(ids.is_empty() && distances.is_empty());
    }
}
