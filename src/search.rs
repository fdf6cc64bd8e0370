use crate::embeddings::Embedding;
use anyhow::Result;
use async_trait::async_trait;

pub const DEFAULT_DISTANCE_THRESHOLD: f32 = 0.2;
pub const DEFAULT_LIMIT: usize = 3;

/// Order in which qualifying chunks are returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ResultOrder {
    /// Descending distance: the least similar qualifying chunk comes first
    #[default]
    FarthestFirst,
    /// Ascending distance
    NearestFirst,
}

/// Parameters of a similarity query
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    /// Chunks qualify only when their L2 distance is strictly below this
    pub distance_threshold: f32,
    /// Maximum number of chunks returned
    pub limit: usize,
    pub order: ResultOrder,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            limit: DEFAULT_LIMIT,
            order: ResultOrder::default(),
        }
    }
}

/// A stored chunk text together with its distance to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub text: String,
    pub distance: f32,
}

/// Read-only access to stored chunks and their embeddings
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Return the chunks selected by `params` for the query vector
    async fn search(&self, query: &Embedding, params: &SearchParams) -> Result<Vec<ScoredChunk>>;
}

/// Apply threshold, ordering and limit to a set of scored candidates
pub fn select_chunks<I>(candidates: I, params: &SearchParams) -> Vec<ScoredChunk>
where
    I: IntoIterator<Item = ScoredChunk>,
{
    let mut selected: Vec<ScoredChunk> = candidates
        .into_iter()
        .filter(|chunk| chunk.distance < params.distance_threshold)
        .collect();

    selected.sort_by(|a, b| match params.order {
        ResultOrder::FarthestFirst => b.distance.total_cmp(&a.distance),
        ResultOrder::NearestFirst => a.distance.total_cmp(&b.distance),
    });
    selected.truncate(params.limit);

    selected
}

/// A chunk held by [`MemoryChunkStore`]
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub text: String,
    pub embedding: Embedding,
}

/// Chunk store kept entirely in memory, scanned linearly on every query
#[derive(Debug, Default, Clone)]
pub struct MemoryChunkStore {
    chunks: Vec<StoredChunk>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, text: impl Into<String>, embedding: Embedding) {
        self.chunks.push(StoredChunk {
            text: text.into(),
            embedding,
        });
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    async fn search(&self, query: &Embedding, params: &SearchParams) -> Result<Vec<ScoredChunk>> {
        let candidates = self.chunks.iter().map(|chunk| ScoredChunk {
            text: chunk.text.clone(),
            distance: chunk.embedding.l2_distance(query),
        });

        Ok(select_chunks(candidates, params))
    }
}
