use crate::embeddings::Embedder;
use crate::error::ChatError;
use crate::ollama::{FragmentStream, GenerateError, OllamaClient};
use crate::prompt::assemble_prompt;
use crate::search::{ChunkStore, ScoredChunk, SearchParams};
use anyhow::Result;
use futures::{Stream, StreamExt};
use log::{error, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// RAG (Retrieval-Augmented Generation) engine
pub struct RagEngine {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn ChunkStore>,
    ollama: OllamaClient,
    search_params: SearchParams,
}

impl RagEngine {
    /// Create a new RAG engine
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn ChunkStore>,
        ollama: OllamaClient,
        search_params: SearchParams,
    ) -> Self {
        RagEngine {
            embedder,
            store,
            ollama,
            search_params,
        }
    }

    /// Embed the message and fetch the chunks close to it
    pub async fn retrieve(&self, message: &str) -> Result<Vec<ScoredChunk>, ChatError> {
        let embedding = self
            .embedder
            .embed(message)
            .await
            .map_err(ChatError::Embedding)?;
        info!("msg={:?} embedding has {} dimensions", message, embedding.len());

        let chunks = self
            .store
            .search(&embedding, &self.search_params)
            .await
            .map_err(ChatError::Retrieval)?;
        info!(
            "close chunks: {:?}",
            chunks.iter().map(|c| c.distance).collect::<Vec<f32>>()
        );

        Ok(chunks)
    }

    /// Build the generation prompt for a message, adding context when any chunk qualifies
    pub async fn build_prompt(&self, message: &str) -> Result<String, ChatError> {
        let chunks = self.retrieve(message).await?;
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        Ok(assemble_prompt(message, &texts))
    }

    /// Run the pipeline for one chat message.
    ///
    /// Every failure up to the generation service accepting the request is
    /// returned here; later failures surface as an error item in the stream.
    pub async fn chat(&self, message: &str) -> Result<ChatStream, ChatError> {
        if message.is_empty() {
            error!("msg not provided");
            return Err(ChatError::MissingMessage);
        }

        let prompt = self.build_prompt(message).await?;
        info!("handling generate request model={}", self.ollama.config().model);

        let generation = self.ollama.generate(&prompt, true).await?;
        Ok(ChatStream::new(prompt, generation.into_fragments()))
    }

    /// Answer one message, writing fragments to `out` as they arrive
    pub async fn answer<W>(&self, message: &str, out: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut stream = self.chat(message).await?;
        while let Some(fragment) = stream.next().await {
            out.write_all(fragment?.as_bytes()).await?;
            out.flush().await?;
        }
        out.write_all(b"\n").await?;
        out.flush().await?;
        Ok(())
    }

    /// Run an interactive chat loop on the terminal
    pub async fn run_query_loop(&self) -> Result<()> {
        info!("Ready to chat. Type 'exit' to quit.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        loop {
            stdout.write_all(b"\nYour message: ").await?;
            stdout.flush().await?;

            let Some(line) = lines.next_line().await? else {
                break;
            };
            let message = line.trim();

            if message.to_lowercase() == "exit" {
                info!("Goodbye!");
                break;
            }
            if message.is_empty() {
                continue;
            }

            if let Err(e) = self.answer(message, &mut stdout).await {
                error!("chat failed: {:#}", e);
            }
        }

        Ok(())
    }
}

/// Generated fragments relayed to the caller.
///
/// Forwards each fragment as soon as it arrives and keeps a copy of the full
/// text, which is logged once the generation service closes the body.
pub struct ChatStream {
    prompt: String,
    fragments: FragmentStream,
    complete_text: String,
    finished: bool,
}

impl ChatStream {
    pub fn new(prompt: String, fragments: FragmentStream) -> Self {
        ChatStream {
            prompt,
            fragments,
            complete_text: String::new(),
            finished: false,
        }
    }

    /// Text relayed so far
    pub fn complete_text(&self) -> &str {
        &self.complete_text
    }
}

impl Stream for ChatStream {
    type Item = Result<String, GenerateError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }

        match this.fragments.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(fragment))) => {
                this.complete_text.push_str(&fragment);
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(e))) => {
                error!(
                    "generation failed after {} bytes: {}",
                    this.complete_text.len(),
                    e
                );
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                info!(
                    "handled prompt={:?} with complete_text={:?}",
                    this.prompt, this.complete_text
                );
                this.finished = true;
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                "chat stream dropped before completion after {} bytes",
                self.complete_text.len()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn fragments(items: Vec<Result<String, GenerateError>>) -> FragmentStream {
        stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn test_chat_stream_accumulates_in_order() {
        let mut chat = ChatStream::new(
            "hello".to_string(),
            fragments(vec![Ok("Hi".to_string()), Ok(" there".to_string())]),
        );

        assert_eq!(chat.next().await.unwrap().unwrap(), "Hi");
        assert_eq!(chat.complete_text(), "Hi");
        assert_eq!(chat.next().await.unwrap().unwrap(), " there");
        assert!(chat.next().await.is_none());
        assert_eq!(chat.complete_text(), "Hi there");
    }

    #[tokio::test]
    async fn test_chat_stream_ends_after_error() {
        let mut chat = ChatStream::new(
            "hello".to_string(),
            fragments(vec![
                Ok("Hi".to_string()),
                Err(GenerateError::MissingResponse),
                Ok("never".to_string()),
            ]),
        );

        assert!(chat.next().await.unwrap().is_ok());
        assert!(chat.next().await.unwrap().is_err());
        assert!(chat.next().await.is_none());
        assert_eq!(chat.complete_text(), "Hi");
    }
}
