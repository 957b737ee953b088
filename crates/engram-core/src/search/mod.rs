//! Stage 3: Vector Preselection
//!
//! An in-process unit-vector index used to preselect retrieval candidates
//! before the learned ranker runs. The default backend is a brute-force
//! cosine scan over a lazily rebuilt matrix cache; the `ann` feature swaps
//! in a USearch HNSW index behind the same API.

mod vector;

pub use vector::{VectorHit, VectorStore};
