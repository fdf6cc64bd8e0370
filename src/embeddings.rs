use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

// https://huggingface.co/thenlper/gte-large
pub const EMBEDDING_MODEL: &str = "thenlper--gte-large";
pub const EMBEDDING_DIMENSIONS: usize = 1024;

const MAX_SEQUENCE_LENGTH: usize = 512;
const NORM_EPSILON: f32 = 1e-12;

/// Representation of a vector embedding
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    /// Wrap raw values without touching them
    pub fn new(values: Vec<f32>) -> Self {
        Embedding { values }
    }

    /// Scale the values to unit length; a zero vector is left as is
    pub fn normalized(mut values: Vec<f32>) -> Self {
        let norm = values.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > NORM_EPSILON {
            for v in values.iter_mut() {
                *v /= norm;
            }
        }
        Embedding { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance to another embedding of the same length
    pub fn l2_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f32>()
            .sqrt()
    }
}

/// Turns text into normalized embeddings
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed several strings, one embedding per input in the same order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single string
    async fn embed(&self, text: &str) -> Result<Embedding> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow!("Embedder returned no embedding"))
    }
}

/// Configuration for the local embedding model
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub model_dir: PathBuf,
}

impl EmbeddingConfig {
    /// Create a new configuration from environment variables
    pub fn from_env() -> Self {
        let model_dir = env::var("APP_EMBEDDING_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Path::new("models").join(EMBEDDING_MODEL));

        EmbeddingConfig { model_dir }
    }
}

/// gte-large sentence encoder: BERT with mean pooling
struct GteModel {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
}

impl GteModel {
    fn load(dir: &Path) -> Result<Self> {
        info!("Loading embedding model from {}", dir.display());

        let config_path = dir.join("config.json");
        let tokenizer_path = dir.join("tokenizer.json");
        let weights_path = dir.join("model.safetensors");

        let config: BertConfig = serde_json::from_reader(BufReader::new(
            File::open(&config_path)
                .with_context(|| format!("Failed to open {}", config_path.display()))?,
        ))
        .with_context(|| format!("Invalid model config {}", config_path.display()))?;

        let device = Device::Cpu;
        // SAFETY: the weights file is opened read-only and not modified while mapped
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&weights_path], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)
            .with_context(|| format!("Failed to load weights {}", weights_path.display()))?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            anyhow!(
                "Failed to load tokenizer from {}: {}",
                tokenizer_path.display(),
                e
            )
        })?;
        tokenizer
            .with_padding(Some(PaddingParams::default()))
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| anyhow!("Failed to configure tokenizer: {}", e))?;

        info!("Embedding model {} loaded", EMBEDDING_MODEL);

        Ok(GteModel {
            model,
            tokenizer,
            device,
        })
    }

    fn encode(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow!("Tokenization failed: {}", e))?;

        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let mut ids = Vec::with_capacity(batch * seq_len);
        let mut mask = Vec::with_capacity(batch * seq_len);
        for encoding in &encodings {
            ids.extend_from_slice(encoding.get_ids());
            mask.extend_from_slice(encoding.get_attention_mask());
        }

        let input_ids = Tensor::from_vec(ids, (batch, seq_len), &self.device)?;
        let attention_mask = Tensor::from_vec(mask, (batch, seq_len), &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;

        // Mean pooling over non-padding tokens, then L2 normalization
        let mask = attention_mask.to_dtype(hidden.dtype())?.unsqueeze(2)?;
        let summed = hidden.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;
        let norms = pooled.sqr()?.sum_keepdim(1)?.sqrt()?;
        let pooled = pooled.broadcast_div(&norms)?;

        let rows = pooled.to_vec2::<f32>()?;
        debug!("Encoded {} texts into {}x{} embeddings", batch, rows.len(), EMBEDDING_DIMENSIONS);

        rows.into_iter()
            .map(|values| {
                if values.len() != EMBEDDING_DIMENSIONS {
                    return Err(anyhow!(
                        "Expected {} dimensions, model produced {}",
                        EMBEDDING_DIMENSIONS,
                        values.len()
                    ));
                }
                Ok(Embedding::new(values))
            })
            .collect()
    }
}

/// Embedder backed by the local gte-large model.
///
/// The model is loaded on first use and shared by every clone afterwards;
/// inference runs on the blocking thread pool.
#[derive(Clone)]
pub struct LocalEmbedder {
    config: EmbeddingConfig,
    model: Arc<OnceCell<GteModel>>,
}

impl LocalEmbedder {
    /// Create an embedder; nothing is loaded until the first call
    pub fn new(config: EmbeddingConfig) -> Self {
        LocalEmbedder {
            config,
            model: Arc::new(OnceCell::new()),
        }
    }

    /// Whether the model has been loaded yet
    pub fn is_loaded(&self) -> bool {
        self.model.get().is_some()
    }

    /// Load the model now instead of on the first request
    pub async fn preload(&self) -> Result<()> {
        let cell = Arc::clone(&self.model);
        let dir = self.config.model_dir.clone();

        tokio::task::spawn_blocking(move || cell.get_or_try_init(|| GteModel::load(&dir)).map(|_| ()))
            .await
            .context("Embedding model loader panicked")?
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let cell = Arc::clone(&self.model);
        let dir = self.config.model_dir.clone();
        let texts = texts.to_vec();

        tokio::task::spawn_blocking(move || {
            let model = cell.get_or_try_init(|| GteModel::load(&dir))?;
            model.encode(&texts)
        })
        .await
        .context("Embedding task panicked")?
    }
}
