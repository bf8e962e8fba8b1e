use std::collections::BTreeMap;

use gentab_core::types::{
    Cell, CellState, CellValue, Column, ColumnId, DType, GenConfig, LlmGenConfig, Table,
};
use gentab_store::TableStore;

fn llm_cfg() -> GenConfig {
    GenConfig::Llm(LlmGenConfig {
        model: "test-model".into(),
        system_prompt: String::new(),
        prompt: "${question}".into(),
        temperature: None,
        top_p: None,
        max_tokens: None,
        rag_params: None,
        multi_turn: false,
    })
}

fn text(s: &str) -> Cell {
    Cell::done(CellValue::Str(s.to_string()))
}

fn cells(pairs: &[(&str, Cell)]) -> BTreeMap<ColumnId, Cell> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

#[tokio::test]
async fn create_add_and_read_rows() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = TableStore::connect(&tmp.path().to_string_lossy()).await?;
    let table = store
        .create_table(Table::new(
            "qa",
            vec![
                Column::input("question", DType::Str),
                Column::output("answer", DType::Str, llm_cfg()),
            ],
        ))
        .await?;

    let added = store
        .add_rows(
            "qa",
            vec![
                cells(&[("question", text("first?"))]),
                cells(&[("question", text("second?"))]),
            ],
        )
        .await?;
    assert_eq!(added.len(), 2);
    assert_eq!(added[0].seq, 0);
    assert_eq!(added[1].seq, 1);

    let rows = store.get_rows(&table, None).await?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].text("question").as_deref(), Some("first?"));
    assert_eq!(rows[1].text("question").as_deref(), Some("second?"));

    // Finish one generation, fail the other.
    store
        .update_cells(&table, &rows[0].id, &cells(&[("answer", text("42"))]))
        .await?;
    store
        .update_cells(&table, &rows[1].id, &cells(&[("answer", Cell::error())]))
        .await?;
    let rows = store.get_rows(&table, None).await?;
    let done = rows[0].cell("answer").expect("cell");
    assert_eq!(done.state, CellState::Done);
    assert_eq!(done.value.as_str(), Some("42"));
    let failed = rows[1].cell("answer").expect("cell");
    assert_eq!(failed.state, CellState::Error);
    assert!(failed.value.is_null());

    // updated_at moved forward, so any previously built index is stale.
    let t = store.get_table("qa").await?;
    assert!(t.updated_at > 0);
    Ok(())
}

#[tokio::test]
async fn unknown_columns_are_rejected() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = TableStore::connect(&tmp.path().to_string_lossy()).await?;
    store
        .create_table(Table::new("t", vec![Column::input("a", DType::Str)]))
        .await?;
    let err = store
        .add_rows("t", vec![cells(&[("nope", text("x"))])])
        .await
        .expect_err("unknown column");
    assert_eq!(err.kind(), "validation");
    Ok(())
}

#[tokio::test]
async fn lock_window_is_exclusive_and_persisted() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let uri = tmp.path().to_string_lossy().to_string();
    let store = TableStore::connect(&uri).await?;
    store
        .create_table(Table::new("t", vec![Column::input("a", DType::Str)]))
        .await?;

    let till = store.acquire_lock("t", 60_000).await?;
    assert!(till > 0);
    let err = store.acquire_lock("t", 60_000).await.expect_err("window open");
    assert_eq!(err.kind(), "concurrency");

    // The window is a persisted value, not an in-memory mutex: a fresh
    // connection still observes it.
    let store2 = TableStore::connect(&uri).await?;
    let err = store2.acquire_lock("t", 60_000).await.expect_err("window open");
    assert_eq!(err.kind(), "concurrency");

    store.release_lock("t").await?;
    store2.acquire_lock("t", 60_000).await?;
    Ok(())
}

#[tokio::test]
async fn vector_cells_round_trip() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = TableStore::connect(&tmp.path().to_string_lossy()).await?;
    let table = store
        .create_table(Table::new(
            "kt",
            vec![Column::input("text", DType::Str), Column::vector("vector", 4)],
        ))
        .await?;

    let v = CellValue::Vector(vec![0.1, 0.2, 0.3, 0.4]);
    store
        .add_rows("kt", vec![cells(&[("text", text("hello")), ("vector", Cell::done(v.clone()))])])
        .await?;
    let rows = store.get_rows(&table, None).await?;
    assert_eq!(rows[0].cell("vector").map(|c| c.value.clone()), Some(v));

    let err = store
        .add_rows(
            "kt",
            vec![cells(&[("vector", Cell::done(CellValue::Vector(vec![1.0])))])],
        )
        .await
        .expect_err("dim mismatch");
    assert_eq!(err.kind(), "validation");
    Ok(())
}

#[tokio::test]
async fn delete_rows_and_filtered_reads() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = TableStore::connect(&tmp.path().to_string_lossy()).await?;
    let table = store
        .create_table(Table::new("t", vec![Column::input("a", DType::Str)]))
        .await?;
    let added = store
        .add_rows(
            "t",
            (0..4).map(|i| cells(&[("a", text(&format!("v{i}")))])).collect(),
        )
        .await?;
    let picked = store
        .get_rows(&table, Some(&[added[2].id.clone(), added[0].id.clone()]))
        .await?;
    assert_eq!(picked.len(), 2);
    assert_eq!(picked[0].seq, 0);
    assert_eq!(picked[1].seq, 2);

    store.delete_rows(&table, &[added[1].id.clone()]).await?;
    assert_eq!(store.count_rows(&table).await?, 3);
    Ok(())
}
