//! MCP server initialization for the stdio transport.
//!
//! Wires the record store, hybrid ranker (vector client, session tracker,
//! optional cross-encoder), and the tool handler into a running server.
//! Logs go to stderr so stdout stays clean for MCP JSON-RPC.

use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

use crate::config::GroveConfig;
use crate::rank::{Ranker, SessionTracker};
use crate::store::RecordStore;
use crate::tools::GroveTools;
use crate::vector::VectorClient;

/// Build the ranker from config: vector channel and reranker degrade to
/// disabled when their providers cannot initialize.
pub fn build_ranker(config: &GroveConfig) -> Ranker {
    let vector = if config.search.vector_weight > 0.0 {
        match crate::embedding::create_provider(
            &config.embeddings.model,
            &config.embedding_cache_dir(),
        ) {
            Ok(provider) => Some(Arc::new(VectorClient::new(
                config.server.vector_port,
                config.db_path(),
                Arc::from(provider),
            ))),
            Err(err) => {
                tracing::warn!(%err, "embedding provider unavailable — vector channel disabled");
                None
            }
        }
    } else {
        None
    };

    let reranker = if config.search.use_reranker {
        match crate::rank::rerank::Reranker::new(&config.search.reranker_model) {
            Ok(reranker) => Some(Arc::new(reranker)),
            Err(err) => {
                tracing::warn!(%err, "cross-encoder unavailable — rerank stage disabled");
                None
            }
        }
    } else {
        None
    };

    Ranker::new(
        config.db_path(),
        config.search.clone(),
        vector,
        Arc::new(SessionTracker::default()),
        reranker,
    )
}

/// Start the MCP server over stdio.
pub async fn serve_stdio(config: GroveConfig) -> Result<()> {
    config.ensure_dirs()?;
    tracing::info!(root = %config.root.display(), "starting grove MCP server on stdio");

    let store = Arc::new(RecordStore::new(config.nodes_dir()));
    // Model loading blocks (first run downloads), keep it off async threads.
    let config = Arc::new(config);
    let ranker = {
        let config = config.clone();
        Arc::new(tokio::task::spawn_blocking(move || build_ranker(&config)).await?)
    };
    let tools = GroveTools::new(config, store, ranker);

    let server = tools.serve(rmcp::transport::stdio()).await?;
    tracing::info!("MCP server running — waiting for client");
    server.waiting().await?;
    tracing::info!("MCP server shut down");
    Ok(())
}
