use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_stream::StreamExt;

use gentab_core::config::EngineTuning;
use gentab_core::template::absent_marker;
use gentab_core::types::{
    CellState, CellValue, CodeGenConfig, Column, ColumnId, DType, GenConfig, LlmGenConfig,
    RagParams, Table,
};
use gentab_exec::{Executor, Providers, TableAdmin, MAX_ROWS_PER_REQUEST};
use gentab_index::IndexManager;
use gentab_providers::mock::{EchoInterpreter, HashEmbedder, OverlapReranker, ScriptedChat, StaticImage};
use gentab_providers::types::Role;
use gentab_providers::ChatProvider;
use gentab_retrieval::HybridSearchEngine;
use gentab_store::TableStore;

const DIM: usize = 16;

fn llm_col(id: &str, prompt: &str) -> Column {
    Column::output(
        id,
        DType::Str,
        GenConfig::Llm(LlmGenConfig {
            model: "test-model".into(),
            system_prompt: String::new(),
            prompt: prompt.into(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            rag_params: None,
            multi_turn: false,
        }),
    )
}

fn chat_col(id: &str, prompt: &str) -> Column {
    let mut col = llm_col(id, prompt);
    if let Some(GenConfig::Llm(cfg)) = &mut col.gen_config {
        cfg.multi_turn = true;
    }
    col
}

fn rag_col(id: &str, prompt: &str, tables: Vec<String>) -> Column {
    let mut col = llm_col(id, prompt);
    if let Some(GenConfig::Llm(cfg)) = &mut col.gen_config {
        cfg.rag_params = Some(RagParams {
            table_ids: tables,
            k: 2,
            reranking_model: None,
            search_query: None,
            rewrite_model: None,
        });
    }
    col
}

fn text_cells(pairs: &[(&str, &str)]) -> BTreeMap<ColumnId, CellValue> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), CellValue::Str(v.to_string())))
        .collect()
}

struct Fx {
    store: Arc<TableStore>,
    admin: TableAdmin,
    exec: Executor,
}

async fn fixture(tmp: &tempfile::TempDir, chat: Arc<dyn ChatProvider>) -> Fx {
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
    let embedder = Arc::new(HashEmbedder::new(DIM));
    let retrieval = Arc::new(HybridSearchEngine::new(
        store.clone(),
        index,
        embedder.clone(),
        Some(Arc::new(OverlapReranker)),
        &tuning,
    ));
    let providers = Providers {
        chat,
        embedder,
        interpreter: Some(Arc::new(EchoInterpreter)),
        image: Some(Arc::new(StaticImage)),
    };
    let admin = TableAdmin::new(store.clone(), tuning.lock_window_ms);
    let exec = Executor::new(store.clone(), retrieval, providers, tuning);
    Fx { store, admin, exec }
}

fn qa_table() -> Table {
    Table::new(
        "qa",
        vec![Column::input("question", DType::Str), llm_col("answer", "${question}")],
    )
}

#[tokio::test]
async fn batch_guard_rejects_oversized_requests_wholesale() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fx = fixture(&tmp, Arc::new(ScriptedChat::new(vec!["ok"]))).await;
    fx.admin.create_table(qa_table()).await?;

    let oversized: Vec<_> = (0..=MAX_ROWS_PER_REQUEST)
        .map(|i| text_cells(&[("question", &format!("q{i}"))]))
        .collect();
    assert_eq!(oversized.len(), 101);
    let err = fx.exec.add_rows("qa", oversized, false).await.expect_err("over cap");
    assert_eq!(err.kind(), "validation");
    // Atomic reject: zero rows created.
    let table = fx.store.get_table("qa").await?;
    assert_eq!(fx.store.count_rows(&table).await?, 0);

    // Exactly at the cap proceeds.
    let at_cap: Vec<_> = (0..MAX_ROWS_PER_REQUEST)
        .map(|i| text_cells(&[("question", &format!("q{i}"))]))
        .collect();
    let rows = fx
        .exec
        .add_rows("qa", at_cap, false)
        .await?
        .into_rows()
        .expect("non-stream");
    assert_eq!(rows.len(), 100);
    assert!(rows
        .iter()
        .all(|r| r.cell("answer").is_some_and(|c| c.state == CellState::Done)));
    Ok(())
}

#[tokio::test]
async fn regen_naming_missing_output_column_fails_fast() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["ok"]));
    let fx = fixture(&tmp, chat.clone()).await;
    fx.admin.create_table(qa_table()).await?;
    let rows = fx
        .exec
        .add_rows("qa", vec![text_cells(&[("question", "q")])], false)
        .await?
        .into_rows()
        .expect("rows");
    let calls_before = chat.requests().len();

    let err = fx
        .exec
        .regen_rows("qa", vec![rows[0].id.clone()], Some(vec!["nonexistent".to_string()]), false)
        .await
        .expect_err("missing output column");
    assert_eq!(err.kind(), "validation");
    // Synchronous rejection: no generation work was dispatched.
    assert_eq!(chat.requests().len(), calls_before);

    // Naming a plain input column is rejected the same way.
    let err = fx
        .exec
        .regen_rows("qa", vec![rows[0].id.clone()], Some(vec!["question".to_string()]), false)
        .await
        .expect_err("input column is not generative");
    assert_eq!(err.kind(), "validation");
    Ok(())
}

#[tokio::test]
async fn midstream_failure_clears_cell_and_ends_stream_with_error_chunk() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["one ", "two ", "three ", "four ", "five"]).failing_after(2));
    let fx = fixture(&tmp, chat).await;
    fx.admin.create_table(qa_table()).await?;

    let mut stream = fx
        .exec
        .add_rows("qa", vec![text_cells(&[("question", "q")])], true)
        .await?
        .into_stream()
        .expect("stream");
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }

    let deltas: Vec<&str> = chunks
        .iter()
        .filter(|c| c.finish_reason().is_none())
        .map(|c| c.content())
        .collect();
    assert_eq!(deltas, vec!["one ", "two "]);
    let last = chunks.last().expect("terminal chunk");
    assert_eq!(last.finish_reason(), Some("error"));
    assert!(last.content().contains("mid-stream"));

    // The cell never holds the two-chunk partial.
    let table = fx.store.get_table("qa").await?;
    let rows = fx.store.get_rows(&table, None).await?;
    let cell = rows[0].cell("answer").expect("cell");
    assert_eq!(cell.state, CellState::Error);
    assert!(cell.value.is_null());
    Ok(())
}

#[tokio::test]
async fn regenerating_a_middle_row_never_sees_future_turns() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["regenerated"]));
    let fx = fixture(&tmp, chat.clone()).await;
    fx.admin
        .create_table(Table::new(
            "conv",
            vec![Column::input("user", DType::Str), chat_col("assistant", "${user}")],
        ))
        .await?;

    // Five turns already materialized, answers included, so seeding makes
    // no provider calls.
    let inputs: Vec<_> = (1..=5)
        .map(|i| text_cells(&[("user", &format!("q{i}")), ("assistant", &format!("a{i}"))]))
        .collect();
    fx.exec.add_rows("conv", inputs, false).await?;
    assert!(chat.requests().is_empty());

    // Regenerate row 3 while rows 4-5 still exist in storage.
    let rows = fx
        .exec
        .regen_rows("conv", vec!["conv:2".to_string()], None, false)
        .await?
        .into_rows()
        .expect("rows");
    assert_eq!(rows[0].text("assistant").as_deref(), Some("regenerated"));

    let requests = chat.requests();
    assert_eq!(requests.len(), 1);
    let contents: Vec<(Role, String)> = gentab_providers::mock::transcript(&requests[0]);
    let texts: Vec<&str> = contents.iter().map(|(_, c)| c.as_str()).collect();
    assert_eq!(texts, vec!["q1", "a1", "q2", "a2", "q3"]);
    for (_, content) in &contents {
        assert!(!content.contains("q4") && !content.contains("a4"));
        assert!(!content.contains("q5") && !content.contains("a5"));
    }
    Ok(())
}

#[tokio::test]
async fn missing_referenced_column_degrades_to_absent_marker() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["fine"]));
    let fx = fixture(&tmp, chat.clone()).await;
    fx.admin
        .create_table(Table::new(
            "t",
            vec![
                Column::input("topic", DType::Str),
                llm_col("summary", "Topic: ${topic}. Notes: ${notes}"),
            ],
        ))
        .await?;

    let rows = fx
        .exec
        .add_rows("t", vec![text_cells(&[("topic", "bees")])], false)
        .await?
        .into_rows()
        .expect("rows");
    // The row did not abort; the prompt carried an explicit absent marker.
    assert_eq!(rows[0].cell("summary").map(|c| c.state), Some(CellState::Done));
    let req = chat.requests().pop().expect("one request");
    let user = req.messages.last().expect("user message");
    assert!(user.content.contains("Topic: bees"));
    assert!(user.content.contains(&absent_marker("notes")));
    Ok(())
}

#[tokio::test]
async fn code_columns_fail_closed_on_missing_source_column() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fx = fixture(&tmp, Arc::new(ScriptedChat::new(vec!["ok"]))).await;
    fx.admin
        .create_table(Table::new(
            "code",
            vec![
                Column::input("snippet", DType::Str),
                Column::output(
                    "out",
                    DType::Str,
                    GenConfig::Python(CodeGenConfig { source_column: "snippet".into() }),
                ),
                Column::output(
                    "broken",
                    DType::Str,
                    GenConfig::Code(CodeGenConfig { source_column: "ghost".into() }),
                ),
            ],
        ))
        .await?;

    let rows = fx
        .exec
        .add_rows("code", vec![text_cells(&[("snippet", "print(1)")])], false)
        .await?
        .into_rows()
        .expect("rows");
    let row = &rows[0];
    // Valid source column executes (echo interpreter).
    assert_eq!(row.text("out").as_deref(), Some("print(1)"));
    // Missing source column: per-row error, no hang, siblings unaffected.
    let broken = row.cell("broken").expect("cell");
    assert_eq!(broken.state, CellState::Error);
    assert!(broken.value.is_null());
    Ok(())
}

#[tokio::test]
async fn open_mutation_window_blocks_generation() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fx = fixture(&tmp, Arc::new(ScriptedChat::new(vec!["ok"]))).await;
    fx.admin.create_table(qa_table()).await?;

    fx.store.acquire_lock("qa", 60_000).await?;
    let err = fx
        .exec
        .add_rows("qa", vec![text_cells(&[("question", "q")])], false)
        .await
        .expect_err("window open");
    assert_eq!(err.kind(), "concurrency");

    fx.store.release_lock("qa").await?;
    fx.exec
        .add_rows("qa", vec![text_cells(&[("question", "q")])], false)
        .await?;
    Ok(())
}

#[tokio::test]
async fn provided_output_values_skip_generation() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["generated"]));
    let fx = fixture(&tmp, chat.clone()).await;
    fx.admin.create_table(qa_table()).await?;

    let rows = fx
        .exec
        .add_rows(
            "qa",
            vec![text_cells(&[("question", "q"), ("answer", "prefilled")])],
            false,
        )
        .await?
        .into_rows()
        .expect("rows");
    assert_eq!(rows[0].text("answer").as_deref(), Some("prefilled"));
    assert!(chat.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn dependent_columns_see_upstream_generated_values() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["draft-text"]));
    let fx = fixture(&tmp, chat.clone()).await;
    fx.admin
        .create_table(Table::new(
            "t",
            vec![
                Column::input("q", DType::Str),
                // Declared out of dependency order on purpose.
                llm_col("summary", "Summarize: ${draft}"),
                llm_col("draft", "Answer: ${q}"),
            ],
        ))
        .await?;

    fx.exec.add_rows("t", vec![text_cells(&[("q", "why")])], false).await?;
    let requests = chat.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].messages.last().expect("msg").content.contains("Answer: why"));
    assert!(requests[1]
        .messages
        .last()
        .expect("msg")
        .content
        .contains("Summarize: draft-text"));
    Ok(())
}

#[tokio::test]
async fn rag_columns_emit_references_then_answer() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let chat = Arc::new(ScriptedChat::new(vec!["grounded answer"]));
    let fx = fixture(&tmp, chat.clone()).await;

    fx.admin.create_knowledge_table("kb", DIM as i32, vec![]).await?;
    let embedder = HashEmbedder::new(DIM);
    use gentab_providers::EmbeddingProvider as _;
    for text in ["chickens need fourteen hours of light to lay", "tomatoes crave full sun"] {
        let vector = embedder.embed_batch(&[text.to_string()]).await?.remove(0);
        let mut cells = BTreeMap::new();
        cells.insert("text".to_string(), gentab_core::types::Cell::done(CellValue::Str(text.into())));
        cells.insert("title".to_string(), gentab_core::types::Cell::done(CellValue::Str("notes".into())));
        cells.insert("page".to_string(), gentab_core::types::Cell::done(CellValue::Int(1)));
        cells.insert("vector".to_string(), gentab_core::types::Cell::done(CellValue::Vector(vector)));
        fx.store.add_rows("kb", vec![cells]).await?;
    }

    fx.admin
        .create_table(Table::new(
            "t",
            vec![
                Column::input("question", DType::Str),
                rag_col("answer", "${question}", vec!["kb".to_string()]),
            ],
        ))
        .await?;

    let mut stream = fx
        .exec
        .add_rows(
            "t",
            vec![text_cells(&[("question", "how much light do chickens need")])],
            true,
        )
        .await?
        .into_stream()
        .expect("stream");
    let mut chunks = Vec::new();
    while let Some(chunk) = stream.next().await {
        chunks.push(chunk);
    }
    assert_eq!(chunks[0].object, gentab_exec::events::REFERENCES_OBJECT);
    assert!(chunks[0].content().contains("search_query"));
    assert!(chunks.iter().any(|c| c.finish_reason() == Some("stop")));

    // Retrieved chunk text made it into the provider prompt.
    let req = chat.requests().pop().expect("request");
    let user = req.messages.last().expect("user");
    assert!(user.content.contains("chickens need fourteen hours"));
    assert!(user.content.contains("how much light do chickens need"));
    Ok(())
}

#[tokio::test]
async fn gen_config_validation_requires_existing_knowledge_tables() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fx = fixture(&tmp, Arc::new(ScriptedChat::new(vec!["ok"]))).await;

    // Saving a config that references a missing knowledge table fails.
    let err = fx
        .admin
        .create_table(Table::new(
            "t",
            vec![
                Column::input("q", DType::Str),
                rag_col("answer", "${q}", vec!["nope".to_string()]),
            ],
        ))
        .await
        .expect_err("unknown knowledge table");
    assert_eq!(err.kind(), "validation");

    // With the knowledge table in place the same config saves, and
    // validation re-runs on update.
    fx.admin.create_knowledge_table("kb", DIM as i32, vec![]).await?;
    fx.admin
        .create_table(Table::new(
            "t",
            vec![
                Column::input("q", DType::Str),
                rag_col("answer", "${q}", vec!["kb".to_string()]),
            ],
        ))
        .await?;
    let err = fx
        .admin
        .update_gen_config(
            "t",
            &"answer".to_string(),
            rag_col("answer", "${q}", vec!["gone".to_string()]).gen_config,
        )
        .await
        .expect_err("re-validated on update");
    assert_eq!(err.kind(), "validation");
    Ok(())
}

#[tokio::test]
async fn schema_mutations_serialize_behind_the_lock_window() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let fx = fixture(&tmp, Arc::new(ScriptedChat::new(vec!["ok"]))).await;
    fx.admin.create_table(qa_table()).await?;
    fx.exec
        .add_rows("qa", vec![text_cells(&[("question", "kept?")])], false)
        .await?;

    // While a window is open, another mutation is rejected and retryable.
    fx.store.acquire_lock("qa", 60_000).await?;
    let err = fx
        .admin
        .add_column("qa", Column::input("notes", DType::Str))
        .await
        .expect_err("window held elsewhere");
    assert_eq!(err.kind(), "concurrency");
    fx.store.release_lock("qa").await?;

    // Mutation rewrites the schema and keeps rows; the window closes after.
    let table = fx.admin.add_column("qa", Column::input("notes", DType::Str)).await?;
    assert!(table.column("notes").is_some());
    assert_eq!(table.lock_till, 0);
    let rows = fx.store.get_rows(&table, None).await?;
    assert_eq!(rows[0].text("question").as_deref(), Some("kept?"));

    let table = fx.admin.drop_column("qa", &"notes".to_string()).await?;
    assert!(table.column("notes").is_none());

    // Spawning a conversation from a template copies the schema and
    // records lineage.
    let copy = fx.admin.duplicate_table("qa", "qa-session").await?;
    assert_eq!(copy.parent_id.as_deref(), Some("qa"));
    assert!(copy.column("answer").is_some());
    assert_eq!(fx.store.count_rows(&copy).await?, 0);
    Ok(())
}
