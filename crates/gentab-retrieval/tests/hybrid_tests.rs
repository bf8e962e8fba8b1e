use std::collections::BTreeMap;
use std::sync::Arc;

use gentab_core::config::EngineTuning;
use gentab_core::types::{Cell, CellValue, Column, ColumnId, DType, Table};
use gentab_index::IndexManager;
use gentab_providers::mock::{HashEmbedder, OverlapReranker};
use gentab_providers::EmbeddingProvider;
use gentab_retrieval::{HybridSearchEngine, SearchParams};
use gentab_store::TableStore;

fn knowledge_table(id: &str, dim: i32) -> Table {
    Table::new(
        id,
        vec![
            Column::input("text", DType::Str),
            Column::input("title", DType::Str),
            Column::input("page", DType::Int),
            Column::input("source", DType::Str),
            Column::vector("vector", dim),
        ],
    )
}

struct Fixture {
    store: Arc<TableStore>,
    engine: HybridSearchEngine,
    embedder: Arc<HashEmbedder>,
}

async fn setup(tmp: &tempfile::TempDir) -> Fixture {
    let store = Arc::new(
        TableStore::connect(&tmp.path().join("db").to_string_lossy())
            .await
            .expect("connect"),
    );
    let tuning = EngineTuning {
        index_dir: tmp.path().join("indexes").to_string_lossy().to_string(),
        retry_base_ms: 1,
        ..EngineTuning::default()
    };
    let index = Arc::new(IndexManager::new(store.clone(), &tuning));
    let embedder = Arc::new(HashEmbedder::new(32));
    let engine = HybridSearchEngine::new(
        store.clone(),
        index,
        embedder.clone(),
        Some(Arc::new(OverlapReranker)),
        &tuning,
    );
    Fixture { store, engine, embedder }
}

async fn seed_chunk(f: &Fixture, table: &str, text: &str, title: &str, source: &str) {
    let vector = f
        .embedder
        .embed_batch(&[text.to_string()])
        .await
        .expect("embed")
        .remove(0);
    let cells: BTreeMap<ColumnId, Cell> = [
        ("text".to_string(), Cell::done(CellValue::Str(text.to_string()))),
        ("title".to_string(), Cell::done(CellValue::Str(title.to_string()))),
        ("page".to_string(), Cell::done(CellValue::Int(1))),
        ("source".to_string(), Cell::done(CellValue::Str(source.to_string()))),
        ("vector".to_string(), Cell::done(CellValue::Vector(vector))),
    ]
    .into_iter()
    .collect();
    f.store.add_rows(table, vec![cells]).await.expect("add chunk");
}

#[tokio::test]
async fn hybrid_search_fuses_and_carries_provenance() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let f = setup(&tmp).await;
    f.store.create_table(knowledge_table("kt", 32)).await?;
    seed_chunk(&f, "kt", "solar panels convert sunlight into power", "energy", "manual.pdf").await;
    seed_chunk(&f, "kt", "rainwater tanks store roof runoff", "water", "manual.pdf").await;
    seed_chunk(&f, "kt", "compost heats as microbes digest scraps", "soil", "notes.txt").await;

    let refs = f
        .engine
        .search(&SearchParams::new(
            "solar panels convert sunlight",
            vec!["kt".to_string()],
            2,
        ))
        .await?;
    assert_eq!(refs.search_query, "solar panels convert sunlight");
    assert!(!refs.chunks.is_empty());
    let top = &refs.chunks[0];
    assert!(top.chunk.text.contains("solar"));
    assert_eq!(top.metadata.table_id, "kt");
    assert!(top.metadata.fused_score > 0.0);
    // The exact-match chunk was found by both sources: both raw scores
    // present.
    assert!(top.metadata.fts_score.is_some());
    assert!(top.metadata.vec_score.is_some());
    // Structured context rides along.
    assert_eq!(
        top.chunk.context.get("source").and_then(|v| v.as_str()),
        Some("manual.pdf")
    );
    // Dedup: a chunk in both lists appears once.
    let ids: Vec<&str> = refs.chunks.iter().map(|c| c.chunk.chunk_id.as_str()).collect();
    let mut unique = ids.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(ids.len(), unique.len());
    Ok(())
}

#[tokio::test]
async fn multi_table_results_merge_on_the_fused_scale() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let f = setup(&tmp).await;
    f.store.create_table(knowledge_table("kta", 32)).await?;
    f.store.create_table(knowledge_table("ktb", 32)).await?;
    seed_chunk(&f, "kta", "beekeeping basics for spring hives", "bees", "a").await;
    seed_chunk(&f, "ktb", "queen bees and hive splitting", "bees", "b").await;

    let refs = f
        .engine
        .search(&SearchParams::new(
            "hive bees",
            vec!["kta".to_string(), "ktb".to_string()],
            5,
        ))
        .await?;
    let tables: Vec<&str> = refs.chunks.iter().map(|c| c.metadata.table_id.as_str()).collect();
    assert!(tables.contains(&"kta"));
    assert!(tables.contains(&"ktb"));
    Ok(())
}

#[tokio::test]
async fn rerank_order_wins_over_fusion() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let f = setup(&tmp).await;
    f.store.create_table(knowledge_table("kt", 32)).await?;
    seed_chunk(&f, "kt", "goats need sturdy fencing", "goats", "a").await;
    seed_chunk(&f, "kt", "fencing posts and wire spacing for goats and sheep", "fences", "b").await;

    let mut params = SearchParams::new("goats fencing wire spacing", vec!["kt".to_string()], 2);
    params.rerank_model = Some("overlap".to_string());
    let refs = f.engine.search(&params).await?;
    // The overlap reranker prefers the chunk containing more query words,
    // and its scores are attached.
    assert!(refs.chunks[0].chunk.text.contains("wire spacing"));
    assert!(refs.chunks[0].metadata.rerank_score.is_some());
    Ok(())
}

#[tokio::test]
async fn column_filter_trims_context_downstream() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let f = setup(&tmp).await;
    f.store.create_table(knowledge_table("kt", 32)).await?;
    seed_chunk(&f, "kt", "pressure canning low acid foods", "canning", "kitchen.md").await;

    let mut params = SearchParams::new("pressure canning", vec!["kt".to_string()], 3);
    params.column_filter = Some(vec![]);
    let refs = f.engine.search(&params).await?;
    assert!(!refs.chunks.is_empty());
    assert!(refs.chunks[0].chunk.context.is_empty());
    Ok(())
}

#[tokio::test]
async fn unknown_or_plain_tables_are_validation_errors() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let f = setup(&tmp).await;
    let err = f
        .engine
        .search(&SearchParams::new("x", vec!["nope".to_string()], 3))
        .await
        .expect_err("unknown table");
    assert_eq!(err.kind(), "validation");

    f.store
        .create_table(Table::new("plain", vec![Column::input("a", DType::Str)]))
        .await?;
    let err = f
        .engine
        .search(&SearchParams::new("x", vec!["plain".to_string()], 3))
        .await
        .expect_err("not a knowledge table");
    assert_eq!(err.kind(), "validation");
    Ok(())
}
