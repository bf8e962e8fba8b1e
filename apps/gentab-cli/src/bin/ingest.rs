use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};

use gentab_core::chunker::Chunker;
use gentab_core::config::Config;
use gentab_core::types::{Cell, CellValue, IndexKind};
use gentab_exec::TableAdmin;
use gentab_index::IndexManager;
use gentab_providers::http::{default_embedder, ProviderSettings};
use gentab_store::cache::{self, CacheEntry};
use gentab_store::TableStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();
    let config = Config::load().map_err(|e| { eprintln!("Error loading config: {}", e); e })?;
    let tuning = config.engine();
    let args: Vec<String> = env::args().skip(1).collect();
    let (table_id, data_dir) = match args.as_slice() {
        [table, dir] => (table.clone(), PathBuf::from(dir)),
        _ => {
            eprintln!("Usage: gentab-ingest <knowledge-table-id> <data-dir>");
            std::process::exit(1);
        }
    };

    let settings: ProviderSettings = config.get("providers").unwrap_or_default();
    let embedder = default_embedder(&settings);
    let store = Arc::new(TableStore::connect(&tuning.db_uri).await?);
    let admin = TableAdmin::new(store.clone(), tuning.lock_window_ms);

    if store.try_get_table(&table_id).await?.is_none() {
        admin.create_knowledge_table(&table_id, embedder.dim() as i32, vec![]).await?;
        println!("Created knowledge table '{}'", table_id);
    }

    // Chunk every .txt file under the data dir.
    let chunker = Chunker::new();
    let mut chunks = Vec::new();
    for entry in walkdir::WalkDir::new(&data_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if entry.path().extension().and_then(|s| s.to_str()) != Some("txt") {
            continue;
        }
        let title = entry.path().file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();
        let content = std::fs::read_to_string(entry.path())?;
        chunks.extend(chunker.split(&title, &content));
    }
    if chunks.is_empty() {
        println!("No .txt files found under {}.", data_dir.display());
        return Ok(());
    }
    println!("Ingesting {} chunks into '{}'", chunks.len(), table_id);

    let pb = ProgressBar::new(chunks.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );

    let conn = store.connection();
    for batch in chunks.chunks(64) {
        // Cache lookup first, embed only the misses, write the cache
        // through.
        let hashes: Vec<String> = batch.iter().map(|c| cache::hash_content(&c.text)).collect();
        let cached = cache::get_many(conn, embedder.embedder_id(), embedder.dim(), &hashes).await?;
        let miss_texts: Vec<String> = batch
            .iter()
            .zip(&hashes)
            .filter(|(_, h)| !cached.contains_key(*h))
            .map(|(c, _)| c.text.clone())
            .collect();
        let fresh = if miss_texts.is_empty() {
            Vec::new()
        } else {
            embedder.embed_batch(&miss_texts).await?
        };
        let mut fresh_iter = fresh.into_iter();
        let mut new_entries = Vec::new();
        let mut cell_maps = Vec::new();
        for (chunk, hash) in batch.iter().zip(&hashes) {
            let vector = match cached.get(hash) {
                Some(v) => v.clone(),
                None => {
                    let v = fresh_iter
                        .next()
                        .ok_or_else(|| anyhow::anyhow!("embedder returned wrong count"))?;
                    new_entries.push(CacheEntry {
                        content_hash: hash.clone(),
                        embedder_id: embedder.embedder_id().to_string(),
                        vector: v.clone(),
                    });
                    v
                }
            };
            let mut cells: BTreeMap<String, Cell> = BTreeMap::new();
            cells.insert("text".into(), Cell::done(CellValue::Str(chunk.text.clone())));
            cells.insert("title".into(), Cell::done(CellValue::Str(chunk.title.clone())));
            cells.insert("page".into(), Cell::done(CellValue::Int(chunk.page)));
            cells.insert("vector".into(), Cell::done(CellValue::Vector(vector)));
            cell_maps.push(cells);
        }
        cache::put_many(conn, embedder.dim() as i32, &new_entries).await?;
        store.add_rows(&table_id, cell_maps).await?;
        pb.inc(batch.len() as u64);
    }
    pb.finish_with_message("stored");

    let index = IndexManager::new(store.clone(), &tuning);
    for kind in [IndexKind::Fts, IndexKind::Vector, IndexKind::Scalar] {
        index.build_index(&table_id, kind).await?;
    }
    println!("Indexed '{}' (fts + vector + scalar)", table_id);
    println!("Try: cargo run --bin gentab-search '{}' '<query>'", table_id);
    Ok(())
}
