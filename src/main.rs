use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use dotenv::dotenv;
use log::{info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use rag_chat::database::{QdrantClient, QdrantConfig};
use rag_chat::embeddings::{EmbeddingConfig, LocalEmbedder};
use rag_chat::ollama::{OllamaClient, OllamaConfig};
use rag_chat::rag::RagEngine;
use rag_chat::search::{ResultOrder, SearchParams, DEFAULT_DISTANCE_THRESHOLD, DEFAULT_LIMIT};
use rag_chat::server::{self, ServerConfig, DEFAULT_BIND, DEFAULT_CORS_ORIGIN, DEFAULT_STATIC_DIR};

/// Retrieval-augmented chat backend using a local gte-large embedder, Qdrant and Ollama
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Only chunks closer than this L2 distance are used as context
    #[arg(long, global = true, default_value_t = DEFAULT_DISTANCE_THRESHOLD)]
    distance_threshold: f32,

    /// Maximum number of context chunks
    #[arg(long, global = true, default_value_t = DEFAULT_LIMIT)]
    limit: usize,

    /// Order of the context chunks in the prompt
    #[arg(long, global = true, value_enum, default_value_t = ResultOrder::FarthestFirst)]
    order: ResultOrder,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat API and the web client (default)
    Serve(ServeArgs),
    /// Chat from the terminal
    Ask {
        /// Message to answer; starts an interactive loop when omitted
        message: Option<String>,
    },
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_BIND)]
    bind: SocketAddr,

    /// Directory of the prebuilt web client
    #[arg(long, default_value = DEFAULT_STATIC_DIR)]
    static_dir: PathBuf,

    /// Do not serve the web client
    #[arg(long)]
    no_static: bool,

    /// Allowed CORS origin (repeatable)
    #[arg(long = "cors-origin", default_values_t = [DEFAULT_CORS_ORIGIN.to_string()])]
    cors_origins: Vec<String>,

    /// Load the embedding model at startup instead of on the first request
    #[arg(long)]
    preload_embeddings: bool,
}

/// `serve` flags on their own, used when no subcommand is given
#[derive(Parser, Debug)]
struct ServeDefaults {
    #[command(flatten)]
    args: ServeArgs,
}

impl Default for ServeArgs {
    fn default() -> Self {
        ServeDefaults::parse_from(["rag-chat"]).args
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();
    let search_params = SearchParams {
        distance_threshold: args.distance_threshold,
        limit: args.limit,
        order: args.order,
    };

    // Load configuration from environment
    let ollama_config = OllamaConfig::from_env().context("Missing APP_OLLAMA_HOST")?;
    let qdrant_config = QdrantConfig::from_env();
    let embedding_config = EmbeddingConfig::from_env();
    info!(
        "Generation service {} (model {}), Qdrant {} collection {}, embeddings from {}",
        ollama_config.host,
        ollama_config.model,
        qdrant_config.url,
        qdrant_config.collection,
        embedding_config.model_dir.display()
    );

    let qdrant = QdrantClient::new(qdrant_config).context("Failed to initialize Qdrant client")?;
    match qdrant.collection_exists().await {
        Ok(true) => info!("Using collection: {}", qdrant.collection()),
        Ok(false) => warn!("Collection {} does not exist yet", qdrant.collection()),
        Err(e) => warn!("Could not reach Qdrant: {:#}", e),
    }

    let embedder = LocalEmbedder::new(embedding_config);
    let ollama = OllamaClient::new(ollama_config);

    let command = args.command.unwrap_or(Command::Serve(ServeArgs::default()));

    if let Command::Serve(ServeArgs {
        preload_embeddings: true,
        ..
    }) = &command
    {
        embedder
            .preload()
            .await
            .context("Failed to load embedding model")?;
    }

    // Initialize RAG engine
    let rag_engine = Arc::new(RagEngine::new(
        Arc::new(embedder),
        Arc::new(qdrant),
        ollama,
        search_params,
    ));

    match command {
        Command::Serve(serve_args) => {
            let config = ServerConfig {
                bind: serve_args.bind,
                static_dir: (!serve_args.no_static).then_some(serve_args.static_dir),
                cors_origins: serve_args.cors_origins,
            };
            server::serve(rag_engine, config).await
        }
        Command::Ask {
            message: Some(message),
        } => {
            let mut stdout = tokio::io::stdout();
            rag_engine
                .answer(&message, &mut stdout)
                .await
                .context("Chat failed")
        }
        Command::Ask { message: None } => rag_engine
            .run_query_loop()
            .await
            .context("Error in query loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults_match_flag_defaults() {
        let defaults = ServeArgs::default();
        assert_eq!(defaults.bind, DEFAULT_BIND.parse::<SocketAddr>().unwrap());
        assert_eq!(defaults.static_dir, PathBuf::from(DEFAULT_STATIC_DIR));
        assert_eq!(defaults.cors_origins, vec![DEFAULT_CORS_ORIGIN.to_string()]);
        assert!(!defaults.no_static);
        assert!(!defaults.preload_embeddings);
    }

    #[test]
    fn test_no_subcommand_parses() {
        let args = Args::parse_from(["rag-chat", "--limit", "5"]);
        assert!(args.command.is_none());
        assert_eq!(args.limit, 5);
        assert_eq!(args.order, ResultOrder::FarthestFirst);
    }

    #[test]
    fn test_serve_flags() {
        let args = Args::parse_from(["rag-chat", "serve", "--bind", "127.0.0.1:9090", "--no-static"]);
        match args.command {
            Some(Command::Serve(serve)) => {
                assert_eq!(serve.bind, "127.0.0.1:9090".parse::<SocketAddr>().unwrap());
                assert!(serve.no_static);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
