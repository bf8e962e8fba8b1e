use std::env;
use std::sync::Arc;

use gentab_core::config::Config;
use gentab_index::IndexManager;
use gentab_providers::http::{default_embedder, HttpReranker, OpenAiCompatClient, ProviderSettings};
use gentab_providers::RerankProvider;
use gentab_retrieval::{HybridSearchEngine, SearchParams};
use gentab_store::TableStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let config = Config::load()?;
    let tuning = config.engine();
    let args: Vec<String> = env::args().skip(1).collect();
    let (table_id, query, top_k) = match args.as_slice() {
        [table, query] => (table.clone(), query.clone(), 5usize),
        [table, query, k] => (table.clone(), query.clone(), k.parse()?),
        _ => {
            eprintln!("Usage: gentab-search <knowledge-table-id> <query> [top_k]");
            std::process::exit(1);
        }
    };

    let settings: ProviderSettings = config.get("providers").unwrap_or_default();
    let embedder = default_embedder(&settings);
    let reranker: Option<Arc<dyn RerankProvider>> = settings.rerank_model.as_ref().map(|model| {
        Arc::new(HttpReranker::new(OpenAiCompatClient::from_settings(&settings), model.clone()))
            as Arc<dyn RerankProvider>
    });

    let store = Arc::new(TableStore::connect(&tuning.db_uri).await?);
    let index = Arc::new(IndexManager::new(store.clone(), &tuning));
    let engine = HybridSearchEngine::new(store, index, embedder, reranker, &tuning);

    let mut params = SearchParams::new(query, vec![table_id], top_k);
    params.rerank_model = settings.rerank_model.clone();
    let refs = engine.search(&params).await?;
    println!("Query: {}", refs.search_query);
    for (i, chunk) in refs.chunks.iter().enumerate() {
        println!(
            "{}. [{}] fused={:.4} fts={:?} vec={:?} rerank={:?}",
            i + 1,
            chunk.chunk.chunk_id,
            chunk.metadata.fused_score,
            chunk.metadata.fts_score,
            chunk.metadata.vec_score,
            chunk.metadata.rerank_score,
        );
        println!("   {} (page {:?})", chunk.chunk.title, chunk.chunk.page);
        let preview: String = chunk.chunk.text.chars().take(160).collect();
        println!("   {}", preview);
    }
    Ok(())
}
