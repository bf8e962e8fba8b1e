use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;

use tokio_stream::StreamExt;

use gentab_core::config::Config;
use gentab_core::types::{CellValue, ColumnId};
use gentab_exec::events::DONE_SENTINEL;
use gentab_exec::{Executor, GenResponse, Providers};
use gentab_index::IndexManager;
use gentab_providers::http::{default_embedder, OpenAiCompatClient, ProviderSettings};
use gentab_providers::mock::EchoChat;
use gentab_providers::ChatProvider;
use gentab_retrieval::HybridSearchEngine;
use gentab_store::TableStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let config = Config::load()?;
    let tuning = config.engine();
    let args: Vec<String> = env::args().skip(1).collect();
    let mut stream = true;
    let mut positional = Vec::new();
    for arg in args {
        match arg.as_str() {
            "--no-stream" => stream = false,
            _ => positional.push(arg),
        }
    }
    let (table_id, row_json) = match positional.as_slice() {
        [table, row] => (table.clone(), row.clone()),
        _ => {
            eprintln!("Usage: gentab-generate <table-id> '<row-json>' [--no-stream]");
            eprintln!("  e.g. gentab-generate qa '{{\"question\": \"why is compost warm?\"}}'");
            std::process::exit(1);
        }
    };
    let input: BTreeMap<ColumnId, CellValue> = serde_json::from_str(&row_json)?;

    let settings: ProviderSettings = config.get("providers").unwrap_or_default();
    let offline = env::var("GENTAB_OFFLINE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let chat: Arc<dyn ChatProvider> = if offline {
        println!("(offline mode: echoing prompts back)");
        Arc::new(EchoChat)
    } else {
        Arc::new(OpenAiCompatClient::from_settings(&settings))
    };
    let embedder = default_embedder(&settings);

    let store = Arc::new(TableStore::connect(&tuning.db_uri).await?);
    let index = Arc::new(IndexManager::new(store.clone(), &tuning));
    let retrieval = Arc::new(HybridSearchEngine::new(
        store.clone(),
        index,
        embedder.clone(),
        None,
        &tuning,
    ));
    let providers = Providers { chat, embedder, interpreter: None, image: None };
    let executor = Executor::new(store, retrieval, providers, tuning);

    match executor.add_rows(&table_id, vec![input], stream).await? {
        GenResponse::Stream(mut chunks) => {
            while let Some(chunk) = chunks.next().await {
                println!("{}", serde_json::to_string(&chunk)?);
            }
            println!("{}", DONE_SENTINEL);
        }
        GenResponse::Rows(rows) => {
            for row in rows {
                println!("row {}:", row.id);
                for (col, cell) in &row.cells {
                    println!("  {col}: {:?} ({:?})", cell.value, cell.state);
                }
            }
        }
    }
    Ok(())
}
