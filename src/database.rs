use crate::embeddings::Embedding;
use crate::search::{select_chunks, ChunkStore, ResultOrder, ScoredChunk, SearchParams};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use qdrant_client::qdrant::{with_payload_selector, SearchPoints, WithPayloadSelector};
use qdrant_client::Qdrant;
use std::env;

const DEFAULT_QDRANT_URL: &str = "http://localhost:6334";
const DEFAULT_COLLECTION: &str = "embedded_chunks";
/// Payload field holding the chunk text
pub const CHUNK_TEXT_FIELD: &str = "chunk_text";
/// Points fetched per Qdrant request when every qualifying point must be seen
const CANDIDATE_WINDOW: u64 = 64;

/// Configuration for Qdrant
#[derive(Debug, Clone)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub collection: String,
}

impl QdrantConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Self {
        let url = env::var("QDRANT_URL").unwrap_or_else(|_| DEFAULT_QDRANT_URL.to_string());
        let api_key = env::var("QDRANT_API_KEY").ok();
        let collection =
            env::var("QDRANT_COLLECTION").unwrap_or_else(|_| DEFAULT_COLLECTION.to_string());

        QdrantConfig {
            url,
            api_key,
            collection,
        }
    }
}

/// Client for the chunk collection in Qdrant.
///
/// The collection is expected to use Euclidean distance, so point scores are
/// L2 distances (lower is closer).
pub struct QdrantClient {
    client: Qdrant,
    collection: String,
}

impl QdrantClient {
    /// Create a new Qdrant client
    pub fn new(config: QdrantConfig) -> Result<Self> {
        let config_builder = Qdrant::from_url(&config.url);
        let config_builder = if let Some(api_key) = config.api_key {
            config_builder.api_key(api_key)
        } else {
            config_builder
        };

        let client = config_builder
            .build()
            .with_context(|| format!("Failed to build Qdrant client for {}", config.url))?;

        Ok(QdrantClient {
            client,
            collection: config.collection,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Check if the chunk collection exists
    pub async fn collection_exists(&self) -> Result<bool> {
        match self.client.collection_info(&self.collection).await {
            Ok(_) => Ok(true),
            Err(qdrant_client::QdrantError::ResponseError { status })
                if status.code() == tonic::Code::NotFound =>
            {
                Ok(false)
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to check collection existence: {}",
                e
            )),
        }
    }
}

/// One page of the nearest-first listing of points under the threshold
struct Page {
    /// Points returned, counting those skipped for a missing payload
    points: u64,
    chunks: Vec<ScoredChunk>,
}

#[async_trait]
trait PageSource: Send + Sync {
    async fn fetch_page(
        &self,
        query: &Embedding,
        params: &SearchParams,
        offset: u64,
        window: u64,
    ) -> Result<Page>;
}

/// Number of points requested per page
fn page_window(params: &SearchParams) -> u64 {
    let limit = params.limit as u64;
    match params.order {
        ResultOrder::NearestFirst => limit,
        ResultOrder::FarthestFirst => limit.max(CANDIDATE_WINDOW),
    }
}

/// Walk the listing page by page, keeping at most `params.limit` chunks in between.
///
/// The first page settles a nearest-first selection. Farthest-first needs
/// every qualifying point, so paging stops only on a short page.
async fn collect_pages<S>(
    source: &S,
    query: &Embedding,
    params: &SearchParams,
) -> Result<Vec<ScoredChunk>>
where
    S: PageSource + ?Sized,
{
    if params.limit == 0 {
        return Ok(Vec::new());
    }

    let window = page_window(params);
    let mut offset = 0;
    let mut pages = 0;
    let mut kept: Vec<ScoredChunk> = Vec::new();
    loop {
        let page = source.fetch_page(query, params, offset, window).await?;
        pages += 1;
        kept = select_chunks(kept.into_iter().chain(page.chunks), params);

        if page.points < window || params.order == ResultOrder::NearestFirst {
            break;
        }
        offset += window;
    }
    debug!("Read {} pages of up to {} points, kept {}", pages, window, kept.len());

    Ok(kept)
}

#[async_trait]
impl PageSource for QdrantClient {
    async fn fetch_page(
        &self,
        query: &Embedding,
        params: &SearchParams,
        offset: u64,
        window: u64,
    ) -> Result<Page> {
        let search_request = SearchPoints {
            collection_name: self.collection.clone(),
            vector: query.values.clone(),
            limit: window,
            offset: Some(offset),
            score_threshold: Some(params.distance_threshold),
            with_payload: Some(WithPayloadSelector {
                selector_options: Some(with_payload_selector::SelectorOptions::Enable(true)),
            }),
            ..Default::default()
        };

        let search_response = self
            .client
            .search_points(search_request)
            .await
            .with_context(|| format!("Failed to search collection {}", self.collection))?;

        let points = search_response.result.len() as u64;
        let chunks = search_response
            .result
            .into_iter()
            .filter_map(|scored_point| {
                let text = match scored_point.payload.get(CHUNK_TEXT_FIELD).and_then(|v| v.as_str()) {
                    Some(text) => text.to_string(),
                    None => {
                        warn!("Point without {} payload in {}", CHUNK_TEXT_FIELD, self.collection);
                        return None;
                    }
                };
                Some(ScoredChunk {
                    text,
                    distance: scored_point.score,
                })
            })
            .collect();

        Ok(Page { points, chunks })
    }
}

#[async_trait]
impl ChunkStore for QdrantClient {
    async fn search(&self, query: &Embedding, params: &SearchParams) -> Result<Vec<ScoredChunk>> {
        collect_pages(self, query, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serves fixed distances nearest-first, as Qdrant lists them
    struct SortedPoints {
        distances: Vec<f32>,
        requests: Mutex<Vec<(u64, u64)>>,
    }

    impl SortedPoints {
        fn new(mut distances: Vec<f32>) -> Self {
            distances.sort_by(f32::total_cmp);
            SortedPoints {
                distances,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn requests(&self) -> Vec<(u64, u64)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PageSource for SortedPoints {
        async fn fetch_page(
            &self,
            _query: &Embedding,
            params: &SearchParams,
            offset: u64,
            window: u64,
        ) -> Result<Page> {
            self.requests.lock().unwrap().push((offset, window));
            let chunks: Vec<ScoredChunk> = self
                .distances
                .iter()
                .filter(|d| **d <= params.distance_threshold)
                .skip(offset as usize)
                .take(window as usize)
                .map(|d| ScoredChunk {
                    text: format!("chunk {:.3}", d),
                    distance: *d,
                })
                .collect();
            Ok(Page {
                points: chunks.len() as u64,
                chunks,
            })
        }
    }

    fn hundred_close_points() -> SortedPoints {
        SortedPoints::new((1..=100).map(|i| i as f32 / 1000.0).collect())
    }

    fn distances(chunks: &[ScoredChunk]) -> Vec<f32> {
        chunks.iter().map(|chunk| chunk.distance).collect()
    }

    #[tokio::test]
    async fn test_farthest_first_scans_past_the_first_window() {
        let source = hundred_close_points();
        let query = Embedding::new(vec![0.0]);

        let chunks = collect_pages(&source, &query, &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(distances(&chunks), vec![0.100, 0.099, 0.098]);
        assert_eq!(source.requests(), vec![(0, 64), (64, 64)]);
    }

    #[tokio::test]
    async fn test_full_last_page_is_followed_by_an_empty_one() {
        let source = SortedPoints::new((1..=128).map(|i| i as f32 / 1000.0).collect());
        let query = Embedding::new(vec![0.0]);

        let chunks = collect_pages(&source, &query, &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(distances(&chunks), vec![0.128, 0.127, 0.126]);
        assert_eq!(source.requests(), vec![(0, 64), (64, 64), (128, 64)]);
    }

    #[tokio::test]
    async fn test_nearest_first_reads_one_page() {
        let source = hundred_close_points();
        let query = Embedding::new(vec![0.0]);
        let params = SearchParams {
            order: ResultOrder::NearestFirst,
            ..Default::default()
        };

        let chunks = collect_pages(&source, &query, &params).await.unwrap();

        assert_eq!(distances(&chunks), vec![0.001, 0.002, 0.003]);
        assert_eq!(source.requests(), vec![(0, 3)]);
    }

    #[tokio::test]
    async fn test_points_at_threshold_are_dropped_across_pages() {
        let mut values: Vec<f32> = (1..=70).map(|i| i as f32 / 1000.0).collect();
        values.extend([0.2, 0.2, 0.3]);
        let source = SortedPoints::new(values);
        let query = Embedding::new(vec![0.0]);

        let chunks = collect_pages(&source, &query, &SearchParams::default())
            .await
            .unwrap();

        assert_eq!(distances(&chunks), vec![0.070, 0.069, 0.068]);
    }

    #[tokio::test]
    async fn test_zero_limit_fetches_nothing() {
        let source = hundred_close_points();
        let query = Embedding::new(vec![0.0]);
        let params = SearchParams {
            limit: 0,
            ..Default::default()
        };

        let chunks = collect_pages(&source, &query, &params).await.unwrap();

        assert!(chunks.is_empty());
        assert!(source.requests().is_empty());
    }

    #[test]
    fn test_page_window() {
        assert_eq!(page_window(&SearchParams::default()), CANDIDATE_WINDOW);

        let params = SearchParams {
            limit: 100,
            ..Default::default()
        };
        assert_eq!(page_window(&params), 100);

        let params = SearchParams {
            order: ResultOrder::NearestFirst,
            ..Default::default()
        };
        assert_eq!(page_window(&params), 3);
    }
}
