#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use rag_chat::embeddings::{Embedder, Embedding, EMBEDDING_DIMENSIONS};
use rag_chat::search::{ChunkStore, MemoryChunkStore, ScoredChunk, SearchParams};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Deterministic embedder: hashes whitespace tokens into buckets
#[derive(Default)]
pub struct HashEmbedder {
    calls: AtomicUsize,
}

impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(text: &str) -> Embedding {
        let mut values = vec![0f32; EMBEDDING_DIMENSIONS];
        for token in text.split_whitespace() {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let bucket = (hasher.finish() as usize) % EMBEDDING_DIMENSIONS;
            values[bucket] += 1.0;
        }
        Embedding::normalized(values)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// Embedder that always fails
pub struct BrokenEmbedder;

#[async_trait]
impl Embedder for BrokenEmbedder {
    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Embedding>> {
        anyhow::bail!("model not loaded")
    }
}

/// In-memory store that counts searches
#[derive(Default)]
pub struct CountingStore {
    pub inner: MemoryChunkStore,
    searches: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: MemoryChunkStore) -> Self {
        CountingStore {
            inner,
            searches: AtomicUsize::new(0),
        }
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkStore for CountingStore {
    async fn search(&self, query: &Embedding, params: &SearchParams) -> Result<Vec<ScoredChunk>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.search(query, params).await
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
