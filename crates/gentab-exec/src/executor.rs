//! The generative column executor: per-row, per-column generation with
//! streaming delivery, RAG context building and mid-stream error recovery.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use gentab_core::config::EngineTuning;
use gentab_core::template;
use gentab_core::types::{
    Cell, CellState, CellValue, CodeGenConfig, Column, ColumnId, EmbedGenConfig, GenConfig,
    ImageGenConfig, LlmGenConfig, References, Row, RowId, Table,
};
use gentab_core::{Error, Result};
use gentab_providers::types::{ChatMessage, ChatRequest, FinishReason, Usage};
use gentab_providers::{
    ChatProvider, CodeLanguage, EmbeddingProvider, ImageProvider, Interpreter,
};
use gentab_retrieval::{HybridSearchEngine, SearchParams};
use gentab_store::TableStore;

use crate::chat;
use crate::events::CompletionChunk;
use crate::locks::{RowLockGuard, RowLocks};

/// Hard cap on rows per add/regen request; larger requests are rejected
/// wholesale before any generation begins.
pub const MAX_ROWS_PER_REQUEST: usize = 100;

const ROW_CONCURRENCY: usize = 8;

#[derive(Clone)]
pub struct Providers {
    pub chat: Arc<dyn ChatProvider>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub interpreter: Option<Arc<dyn Interpreter>>,
    pub image: Option<Arc<dyn ImageProvider>>,
}

#[derive(Clone)]
pub struct Executor {
    store: Arc<TableStore>,
    retrieval: Arc<HybridSearchEngine>,
    providers: Providers,
    locks: Arc<RowLocks>,
    tuning: EngineTuning,
}

/// Result of an add/regen entry point: chunk events when streaming, the
/// completed rows otherwise.
#[derive(Debug)]
pub enum GenResponse {
    Stream(ReceiverStream<CompletionChunk>),
    Rows(Vec<Row>),
}

impl GenResponse {
    pub fn into_stream(self) -> Option<ReceiverStream<CompletionChunk>> {
        match self {
            Self::Stream(s) => Some(s),
            Self::Rows(_) => None,
        }
    }

    pub fn into_rows(self) -> Option<Vec<Row>> {
        match self {
            Self::Rows(r) => Some(r),
            Self::Stream(_) => None,
        }
    }
}

enum Outcome {
    Done(CellValue, Option<Usage>),
    /// Terminal for this cell; the error chunk has already been emitted.
    Failed,
    /// The consumer went away; stop the row and leave the cell pending.
    Cancelled,
}

impl Executor {
    pub fn new(
        store: Arc<TableStore>,
        retrieval: Arc<HybridSearchEngine>,
        providers: Providers,
        tuning: EngineTuning,
    ) -> Self {
        Self { store, retrieval, providers, locks: RowLocks::new(), tuning }
    }

    /// Add rows and generate their output columns. Capped at
    /// [`MAX_ROWS_PER_REQUEST`]; an oversized batch creates zero rows.
    pub async fn add_rows(
        &self,
        table_id: &str,
        inputs: Vec<BTreeMap<ColumnId, CellValue>>,
        stream: bool,
    ) -> Result<GenResponse> {
        if inputs.len() > MAX_ROWS_PER_REQUEST {
            return Err(Error::validation(format!(
                "request adds {} rows, the limit is {MAX_ROWS_PER_REQUEST}",
                inputs.len()
            )));
        }
        let table = self.store.get_table(table_id).await?;
        reject_if_locked(&table)?;
        for cells in &inputs {
            for col_id in cells.keys() {
                if table.column(col_id).is_none() {
                    return Err(Error::validation(format!(
                        "table '{table_id}' has no column '{col_id}'"
                    )));
                }
            }
        }

        // Pre-supplied output values are kept verbatim and skipped during
        // generation; everything else starts pending.
        let mut provided: Vec<HashSet<ColumnId>> = Vec::with_capacity(inputs.len());
        let mut cell_maps = Vec::with_capacity(inputs.len());
        for input in inputs {
            let mut cells: BTreeMap<ColumnId, Cell> =
                input.into_iter().map(|(k, v)| (k, Cell::done(v))).collect();
            let mut skip = HashSet::new();
            for col in table.output_columns() {
                if cells.contains_key(&col.id) {
                    skip.insert(col.id.clone());
                } else {
                    cells.insert(
                        col.id.clone(),
                        Cell { value: CellValue::Null, state: CellState::Pending },
                    );
                }
            }
            provided.push(skip);
            cell_maps.push(cells);
        }

        let rows = self.store.add_rows(table_id, cell_maps).await?;
        let row_ids: Vec<RowId> = rows.iter().map(|r| r.id.clone()).collect();
        let guard = self.locks.try_acquire(&table.id, &row_ids)?;
        let targets = ordered_output_columns(&table, None)?;
        self.dispatch(table, rows, targets, provided, stream, guard).await
    }

    /// Regenerate output columns of existing rows. A request naming output
    /// columns absent from the table is rejected synchronously: no
    /// generation work is dispatched that could never complete.
    pub async fn regen_rows(
        &self,
        table_id: &str,
        row_ids: Vec<RowId>,
        output_columns: Option<Vec<ColumnId>>,
        stream: bool,
    ) -> Result<GenResponse> {
        if row_ids.len() > MAX_ROWS_PER_REQUEST {
            return Err(Error::validation(format!(
                "request regenerates {} rows, the limit is {MAX_ROWS_PER_REQUEST}",
                row_ids.len()
            )));
        }
        let table = self.store.get_table(table_id).await?;
        reject_if_locked(&table)?;
        if let Some(cols) = &output_columns {
            for col_id in cols {
                match table.column(col_id) {
                    None => {
                        return Err(Error::validation(format!(
                            "output column '{col_id}' does not exist in table '{table_id}'"
                        )))
                    }
                    Some(col) if !col.is_output() => {
                        return Err(Error::validation(format!(
                            "column '{col_id}' has no gen_config"
                        )))
                    }
                    Some(_) => {}
                }
            }
        }
        let rows = self.store.get_rows(&table, Some(&row_ids)).await?;
        if rows.len() != row_ids.len() {
            let found: HashSet<&str> = rows.iter().map(|r| r.id.as_str()).collect();
            let missing: Vec<&str> = row_ids
                .iter()
                .map(String::as_str)
                .filter(|id| !found.contains(id))
                .collect();
            return Err(Error::validation(format!("unknown rows: {}", missing.join(", "))));
        }
        let targets = ordered_output_columns(&table, output_columns.as_deref())?;
        let guard = self.locks.try_acquire(&table.id, &row_ids)?;
        let provided = vec![HashSet::new(); rows.len()];
        self.dispatch(table, rows, targets, provided, stream, guard).await
    }

    async fn dispatch(
        &self,
        table: Table,
        rows: Vec<Row>,
        targets: Vec<Column>,
        provided: Vec<HashSet<ColumnId>>,
        stream: bool,
        guard: RowLockGuard,
    ) -> Result<GenResponse> {
        if stream {
            let (tx, rx) = mpsc::channel::<CompletionChunk>(256);
            let exec = self.clone();
            tokio::spawn(async move {
                exec.run(&table, rows, &targets, provided, Some(tx)).await;
                drop(guard);
            });
            Ok(GenResponse::Stream(ReceiverStream::new(rx)))
        } else {
            let row_ids: Vec<RowId> = rows.iter().map(|r| r.id.clone()).collect();
            self.run(&table, rows, &targets, provided, None).await;
            drop(guard);
            let final_rows = self.store.get_rows(&table, Some(&row_ids)).await?;
            Ok(GenResponse::Rows(final_rows))
        }
    }

    /// Rows generate concurrently; within a row, output columns run in
    /// dependency order.
    async fn run(
        &self,
        table: &Table,
        rows: Vec<Row>,
        targets: &[Column],
        provided: Vec<HashSet<ColumnId>>,
        tx: Option<mpsc::Sender<CompletionChunk>>,
    ) {
        futures::stream::iter(rows.into_iter().zip(provided))
            .for_each_concurrent(ROW_CONCURRENCY, |(row, skip)| {
                let tx = tx.clone();
                async move {
                    self.gen_row(table, row, targets, &skip, &tx).await;
                }
            })
            .await;
    }

    async fn gen_row(
        &self,
        table: &Table,
        row: Row,
        targets: &[Column],
        skip: &HashSet<ColumnId>,
        tx: &Option<mpsc::Sender<CompletionChunk>>,
    ) {
        let mut values = chat::row_values(table, &row);
        for col in targets {
            if skip.contains(&col.id) {
                continue;
            }
            let outcome = self.gen_cell(table, &row, col, &values, tx).await;
            match outcome {
                Outcome::Done(value, usage) => {
                    debug!(row = %row.id, column = %col.id, ?usage, "cell generated");
                    values.insert(col.id.clone(), value.render());
                    let cell = Cell::done(value);
                    if let Err(e) =
                        self.store.update_cells(table, &row.id, &one_cell(&col.id, cell)).await
                    {
                        warn!(row = %row.id, column = %col.id, error = %e, "failed to persist cell");
                    }
                }
                Outcome::Failed => {
                    // Errors stay local to this (row, column); downstream
                    // columns see the absent marker instead of a partial
                    // value.
                    values.insert(col.id.clone(), None);
                    if let Err(e) = self
                        .store
                        .update_cells(table, &row.id, &one_cell(&col.id, Cell::error()))
                        .await
                    {
                        warn!(row = %row.id, column = %col.id, error = %e, "failed to persist error cell");
                    }
                }
                Outcome::Cancelled => {
                    let pending = Cell { value: CellValue::Null, state: CellState::Pending };
                    let _ = self
                        .store
                        .update_cells(table, &row.id, &one_cell(&col.id, pending))
                        .await;
                    debug!(row = %row.id, column = %col.id, "consumer cancelled, stopping row");
                    return;
                }
            }
        }
    }

    async fn gen_cell(
        &self,
        table: &Table,
        row: &Row,
        col: &Column,
        values: &BTreeMap<ColumnId, Option<String>>,
        tx: &Option<mpsc::Sender<CompletionChunk>>,
    ) -> Outcome {
        let result = match &col.gen_config {
            Some(GenConfig::Llm(cfg)) => {
                return self.gen_llm(table, row, col, cfg, values, tx).await
            }
            Some(GenConfig::Code(cfg)) => {
                self.run_interpreter(CodeLanguage::Generic, cfg, table, values).await
            }
            Some(GenConfig::Python(cfg)) => {
                self.run_interpreter(CodeLanguage::Python, cfg, table, values).await
            }
            Some(GenConfig::Embed(cfg)) => self.run_embed(cfg, table, values).await,
            Some(GenConfig::Image(cfg)) => self.run_image(cfg, values).await,
            None => Err(Error::generation(format!("column '{}' has no gen_config", col.id))),
        };
        match result {
            Ok(value) => {
                let text = value.render().unwrap_or_default();
                if !text.is_empty()
                    && !self.emit(tx, CompletionChunk::delta(&row.id, &col.id, text)).await
                {
                    return Outcome::Cancelled;
                }
                if !self
                    .emit(tx, CompletionChunk::finished(&row.id, &col.id, FinishReason::Stop))
                    .await
                {
                    return Outcome::Cancelled;
                }
                Outcome::Done(value, None)
            }
            Err(e) => {
                warn!(row = %row.id, column = %col.id, error = %e, "cell generation failed");
                let _ = self.emit(tx, CompletionChunk::error(&row.id, &col.id, e.to_string())).await;
                Outcome::Failed
            }
        }
    }

    /// LLM column: queued → built_context (if RAG) → invoking → streaming →
    /// done, or error as the terminal state.
    async fn gen_llm(
        &self,
        table: &Table,
        row: &Row,
        col: &Column,
        cfg: &LlmGenConfig,
        values: &BTreeMap<ColumnId, Option<String>>,
        tx: &Option<mpsc::Sender<CompletionChunk>>,
    ) -> Outcome {
        let rendered = template::render(&cfg.prompt, values);
        if !rendered.missing.is_empty() {
            debug!(row = %row.id, column = %col.id, missing = ?rendered.missing, "absent inputs substituted");
        }
        let mut user_text = rendered.text;

        if let Some(rag) = &cfg.rag_params {
            let query = match &rag.search_query {
                Some(t) => template::render(t, values).text,
                None => user_text.clone(),
            };
            let query = match &rag.rewrite_model {
                Some(model) => match self.rewrite_query(model, &query).await {
                    Ok(q) => q,
                    Err(e) => {
                        warn!(error = %e, "query rewrite failed, using raw query");
                        query
                    }
                },
                None => query,
            };
            let mut params = SearchParams::new(query, rag.table_ids.clone(), rag.k);
            params.rerank_model = rag.reranking_model.clone();
            let refs = match self.retrieval.search(&params).await {
                Ok(refs) => refs,
                Err(e) => {
                    let _ = self
                        .emit(tx, CompletionChunk::error(&row.id, &col.id, e.to_string()))
                        .await;
                    return Outcome::Failed;
                }
            };
            if !self.emit(tx, CompletionChunk::references(&row.id, &col.id, &refs)).await {
                return Outcome::Cancelled;
            }
            self.persist_references(table, row, &refs).await;
            user_text = render_rag_prompt(&refs, &user_text);
        }

        let mut messages = Vec::new();
        if !cfg.system_prompt.is_empty() {
            messages.push(ChatMessage::system(cfg.system_prompt.clone()));
        }
        if cfg.multi_turn {
            let history_rows = match self.store.get_rows(table, None).await {
                Ok(rows) => rows,
                Err(e) => {
                    let _ = self
                        .emit(tx, CompletionChunk::error(&row.id, &col.id, e.to_string()))
                        .await;
                    return Outcome::Failed;
                }
            };
            messages.extend(chat::build_history(
                table,
                &history_rows,
                row.seq,
                &cfg.prompt,
                &col.id,
                self.tuning.chat_window,
            ));
        }
        messages.push(ChatMessage::user(user_text));

        let mut req = ChatRequest::new(cfg.model.clone(), messages);
        req.temperature = cfg.temperature;
        req.top_p = cfg.top_p;
        req.max_tokens = cfg.max_tokens;
        req.stream = true;

        let streaming = Cell { value: CellValue::Null, state: CellState::Streaming };
        let _ = self.store.update_cells(table, &row.id, &one_cell(&col.id, streaming)).await;

        let mut deltas = match self.providers.chat.stream(req).await {
            Ok(s) => s,
            Err(e) => {
                // Pre-stream provider failure: row-level error, siblings
                // unaffected.
                let _ = self.emit(tx, CompletionChunk::error(&row.id, &col.id, e.to_string())).await;
                return Outcome::Failed;
            }
        };

        let mut staged = String::new();
        let mut usage: Option<Usage> = None;
        loop {
            match deltas.next().await {
                Some(Ok(delta)) => {
                    if delta.finish_reason == Some(FinishReason::Error) {
                        let msg = if delta.content.is_empty() {
                            "provider reported an error mid-stream".to_string()
                        } else {
                            delta.content
                        };
                        let _ = self.emit(tx, CompletionChunk::error(&row.id, &col.id, msg)).await;
                        return Outcome::Failed;
                    }
                    if !delta.content.is_empty() {
                        staged.push_str(&delta.content);
                        if !self
                            .emit(tx, CompletionChunk::delta(&row.id, &col.id, delta.content))
                            .await
                        {
                            return Outcome::Cancelled;
                        }
                    }
                    if delta.usage.is_some() {
                        usage = delta.usage;
                    }
                    if let Some(reason) = delta.finish_reason {
                        if !self
                            .emit(tx, CompletionChunk::finished(&row.id, &col.id, reason))
                            .await
                        {
                            return Outcome::Cancelled;
                        }
                        return Outcome::Done(CellValue::Str(staged), usage);
                    }
                }
                Some(Err(e)) => {
                    // Mid-stream failure: one terminal error chunk, the
                    // staged partial text is discarded and usage becomes
                    // unavailable.
                    let _ = self
                        .emit(
                            tx,
                            CompletionChunk::error(
                                &row.id,
                                &col.id,
                                format!("generation failed mid-stream: {e}"),
                            ),
                        )
                        .await;
                    return Outcome::Failed;
                }
                None => {
                    if !self
                        .emit(
                            tx,
                            CompletionChunk::finished(&row.id, &col.id, FinishReason::Stop),
                        )
                        .await
                    {
                        return Outcome::Cancelled;
                    }
                    return Outcome::Done(CellValue::Str(staged), usage);
                }
            }
        }
    }

    /// Search-query rewrite under its own token budget, separate from the
    /// main completion budget.
    async fn rewrite_query(&self, model: &str, query: &str) -> Result<String> {
        let mut req = ChatRequest::new(
            model,
            vec![
                ChatMessage::system(
                    "Rewrite the user text into a concise search query. Reply with the query only.",
                ),
                ChatMessage::user(query),
            ],
        );
        req.max_tokens = Some(self.tuning.query_rewrite_max_tokens);
        let resp = self.providers.chat.complete(req).await?;
        let rewritten = resp.content.trim().to_string();
        Ok(if rewritten.is_empty() { query.to_string() } else { rewritten })
    }

    /// Attach provenance to the row when the table declares a `references`
    /// column for it (the chat-table convention). Best-effort.
    async fn persist_references(&self, table: &Table, row: &Row, refs: &References) {
        let Some(col) = table.column("references") else {
            return;
        };
        if col.is_output() || col.dtype != gentab_core::types::DType::Json {
            return;
        }
        match serde_json::to_value(refs) {
            Ok(json) => {
                let cell = Cell::done(CellValue::Json(json));
                if let Err(e) =
                    self.store.update_cells(table, &row.id, &one_cell(&col.id, cell)).await
                {
                    warn!(row = %row.id, error = %e, "failed to persist references");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize references"),
        }
    }

    /// Code and python columns execute a single designated source column's
    /// value. A source column missing from the table fails closed with a
    /// per-row error instead of hanging.
    async fn run_interpreter(
        &self,
        language: CodeLanguage,
        cfg: &CodeGenConfig,
        table: &Table,
        values: &BTreeMap<ColumnId, Option<String>>,
    ) -> Result<CellValue> {
        if table.column(&cfg.source_column).is_none() {
            return Err(Error::generation(format!(
                "source column '{}' does not exist in table '{}'",
                cfg.source_column, table.id
            )));
        }
        let source = values
            .get(&cfg.source_column)
            .and_then(Clone::clone)
            .ok_or_else(|| {
                Error::generation(format!("source column '{}' has no value", cfg.source_column))
            })?;
        let interpreter = self
            .providers
            .interpreter
            .as_ref()
            .ok_or_else(|| Error::generation("no code interpreter configured"))?;
        interpreter.run(language, &source).await.map(CellValue::Str)
    }

    async fn run_embed(
        &self,
        cfg: &EmbedGenConfig,
        table: &Table,
        values: &BTreeMap<ColumnId, Option<String>>,
    ) -> Result<CellValue> {
        if table.column(&cfg.source_column).is_none() {
            return Err(Error::generation(format!(
                "source column '{}' does not exist in table '{}'",
                cfg.source_column, table.id
            )));
        }
        let text = values
            .get(&cfg.source_column)
            .and_then(Clone::clone)
            .unwrap_or_default();
        let vector = self
            .providers
            .embedder
            .embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::provider("embedder returned no vector"))?;
        Ok(CellValue::Vector(vector))
    }

    async fn run_image(
        &self,
        cfg: &ImageGenConfig,
        values: &BTreeMap<ColumnId, Option<String>>,
    ) -> Result<CellValue> {
        let prompt = template::render(&cfg.prompt, values).text;
        let provider = self
            .providers
            .image
            .as_ref()
            .ok_or_else(|| Error::generation("no image provider configured"))?;
        provider.generate(&cfg.model, &prompt).await.map(CellValue::Str)
    }

    /// Forward a chunk event. `false` means the consumer dropped the
    /// stream and generation should cancel.
    async fn emit(
        &self,
        tx: &Option<mpsc::Sender<CompletionChunk>>,
        chunk: CompletionChunk,
    ) -> bool {
        match tx {
            Some(tx) => tx.send(chunk).await.is_ok(),
            None => true,
        }
    }
}

/// Retrieved chunks rendered into the prompt alongside their structured
/// per-chunk fields.
fn render_rag_prompt(refs: &References, question: &str) -> String {
    let mut out = String::from("Use the following context to answer.\n\n");
    for (i, c) in refs.chunks.iter().enumerate() {
        out.push_str(&format!("# Document {}\n", i + 1));
        if !c.chunk.title.is_empty() {
            out.push_str(&format!("Title: {}\n", c.chunk.title));
        }
        if let Some(page) = c.chunk.page {
            out.push_str(&format!("Page: {page}\n"));
        }
        for (key, value) in &c.chunk.context {
            out.push_str(&format!("{key}: {value}\n"));
        }
        out.push_str(&c.chunk.text);
        out.push_str("\n\n");
    }
    out.push_str("Question:\n");
    out.push_str(question);
    out
}

fn reject_if_locked(table: &Table) -> Result<()> {
    let now = Utc::now().timestamp_millis();
    if table.lock_till > now {
        return Err(Error::concurrency(format!(
            "table '{}' has a schema mutation window open until {}; retry later",
            table.id, table.lock_till
        )));
    }
    Ok(())
}

fn one_cell(col_id: &ColumnId, cell: Cell) -> BTreeMap<ColumnId, Cell> {
    let mut map = BTreeMap::new();
    map.insert(col_id.clone(), cell);
    map
}

fn column_deps(col: &Column) -> Vec<ColumnId> {
    match &col.gen_config {
        Some(GenConfig::Llm(cfg)) => {
            let mut deps = template::referenced_columns(&cfg.prompt);
            if let Some(rag) = &cfg.rag_params {
                if let Some(q) = &rag.search_query {
                    for dep in template::referenced_columns(q) {
                        if !deps.contains(&dep) {
                            deps.push(dep);
                        }
                    }
                }
            }
            deps
        }
        Some(GenConfig::Code(cfg) | GenConfig::Python(cfg)) => vec![cfg.source_column.clone()],
        Some(GenConfig::Embed(cfg)) => vec![cfg.source_column.clone()],
        Some(GenConfig::Image(cfg)) => template::referenced_columns(&cfg.prompt),
        None => Vec::new(),
    }
}

/// Output columns in dependency order: a column referencing another output
/// column generates after it. Declaration order is the stable fallback,
/// including for reference cycles.
fn ordered_output_columns(
    table: &Table,
    requested: Option<&[ColumnId]>,
) -> Result<Vec<Column>> {
    let selected: Vec<&Column> = table
        .output_columns()
        .filter(|c| requested.is_none_or(|req| req.iter().any(|r| r == &c.id)))
        .collect();
    let ids: HashSet<&str> = selected.iter().map(|c| c.id.as_str()).collect();
    let mut remaining: Vec<&Column> = selected.clone();
    let mut done: HashSet<String> = HashSet::new();
    let mut ordered: Vec<Column> = Vec::with_capacity(selected.len());
    while !remaining.is_empty() {
        let mut progressed = false;
        let mut next_remaining = Vec::new();
        for col in remaining {
            let blocked = column_deps(col)
                .iter()
                .any(|d| ids.contains(d.as_str()) && !done.contains(d) && d != &col.id);
            if blocked {
                next_remaining.push(col);
            } else {
                done.insert(col.id.clone());
                ordered.push(col.clone());
                progressed = true;
            }
        }
        if !progressed {
            // Reference cycle: fall back to declaration order for the rest.
            for col in next_remaining {
                ordered.push(col.clone());
            }
            break;
        }
        remaining = next_remaining;
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gentab_core::types::DType;

    fn llm(id: &str, prompt: &str) -> Column {
        Column::output(
            id,
            DType::Str,
            GenConfig::Llm(LlmGenConfig {
                model: "m".into(),
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

    #[test]
    fn outputs_order_by_template_dependencies() {
        let table = Table::new(
            "t",
            vec![
                Column::input("q", DType::Str),
                llm("summary", "Summarize: ${draft}"),
                llm("draft", "Answer: ${q}"),
            ],
        );
        let ordered = ordered_output_columns(&table, None).unwrap();
        let ids: Vec<&str> = ordered.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["draft", "summary"]);
    }

    #[test]
    fn cycles_fall_back_to_declaration_order() {
        let table = Table::new(
            "t",
            vec![llm("a", "${b}"), llm("b", "${a}")],
        );
        let ordered = ordered_output_columns(&table, None).unwrap();
        let ids: Vec<&str> = ordered.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
