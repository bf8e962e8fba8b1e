//! Tantivy full-text index over a Knowledge Table's text columns.
//!
//! One index directory per table. The lexical engine cannot restrict a
//! query to specific columns, so all text-bearing columns are indexed into
//! one searchable surface and queried once; per-column concerns are handled
//! downstream by the caller.

use std::path::{Path, PathBuf};

use tantivy::collector::TopDocs;
use tantivy::query::QueryParser;
use tantivy::schema::{
    IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, SimpleTokenizer, StopWordFilter, TextAnalyzer};
use tantivy::{doc, Index, TantivyDocument};

use gentab_core::types::{DType, Row, Table, COL_PAGE, COL_TEXT, COL_TITLE, COL_VECTOR};
use gentab_core::{Error, Result};

use crate::Hit;

pub fn build_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    let _id_field = schema_builder.add_text_field("id", STRING | STORED);
    let text_field_indexing = TextFieldIndexing::default()
        .set_tokenizer("text_with_stopwords")
        .set_index_option(IndexRecordOption::WithFreqsAndPositions);
    let text_options = TextOptions::default()
        .set_indexing_options(text_field_indexing.clone())
        .set_stored();
    let _text_field = schema_builder.add_text_field("text", text_options.clone());
    let _title_field = schema_builder.add_text_field("title", text_options.clone());
    // Catch-all for additional structured text columns.
    let _extras_field = schema_builder.add_text_field("extras", text_options);
    let _page_field = schema_builder.add_i64_field("page", STORED);
    schema_builder.build()
}

pub fn register_tokenizer(index: &Index) {
    let stop_words = vec![
        "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "has", "he", "in", "is",
        "it", "its", "of", "on", "that", "the", "to", "was", "will", "with", "or", "but", "not",
        "this", "these", "they", "them", "their", "there", "then", "than", "so", "if", "when",
        "where", "why", "how", "what", "which", "who", "whom", "whose", "can", "could", "should",
        "would", "may", "might", "must", "shall", "do", "does", "did", "have", "had", "having",
    ];
    let tokenizer = TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(stop_words.into_iter().map(|s| s.to_string())))
        .build();
    index.tokenizers().register("text_with_stopwords", tokenizer);
}

/// Characters the lexical query syntax assigns meaning to.
fn is_reserved_char(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~' | '*'
            | '?' | ':' | '\\' | '/'
    )
}

/// Escape a raw query so reserved syntax is matched as literal text.
///
/// Every whitespace-delimited token is stripped of syntax characters and
/// quoted, which also stops uppercase keywords (`AND`, `OR`, `NOT`, `IN`,
/// `TO`) from being parsed as directives.
pub fn escape_query(raw: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    for token in raw.split_whitespace() {
        let cleaned: String = token
            .chars()
            .map(|c| if is_reserved_char(c) { ' ' } else { c })
            .collect();
        let cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
        if !cleaned.is_empty() {
            parts.push(format!("\"{cleaned}\""));
        }
    }
    parts.join(" ")
}

pub fn index_dir(index_root: &Path, table_id: &str) -> PathBuf {
    index_root.join(table_id).join("fts")
}

pub fn exists(index_root: &Path, table_id: &str) -> bool {
    index_dir(index_root, table_id).join("meta.json").exists()
}

struct Fields {
    id: tantivy::schema::Field,
    text: tantivy::schema::Field,
    title: tantivy::schema::Field,
    extras: tantivy::schema::Field,
    page: tantivy::schema::Field,
}

fn fields(schema: &Schema) -> Result<Fields> {
    Ok(Fields {
        id: schema.get_field("id").map_err(Error::retrieval)?,
        text: schema.get_field("text").map_err(Error::retrieval)?,
        title: schema.get_field("title").map_err(Error::retrieval)?,
        extras: schema.get_field("extras").map_err(Error::retrieval)?,
        page: schema.get_field("page").map_err(Error::retrieval)?,
    })
}

/// Text from structured columns other than the standard chunk fields,
/// folded into the catch-all surface.
fn extras_text(table: &Table, row: &Row) -> String {
    let mut out = String::new();
    for col in &table.columns {
        if col.id == COL_TEXT || col.id == COL_TITLE || col.id == COL_PAGE || col.id == COL_VECTOR {
            continue;
        }
        if !matches!(col.dtype, DType::Str | DType::Json) {
            continue;
        }
        if let Some(v) = row.text(&col.id) {
            if !v.is_empty() {
                out.push_str(&v);
                out.push('\n');
            }
        }
    }
    out
}

/// Build the index from scratch for the given rows.
pub fn build(index_root: &Path, table: &Table, rows: &[Row]) -> Result<usize> {
    let dir = index_dir(index_root, &table.id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir).map_err(Error::retrieval)?;
    }
    std::fs::create_dir_all(&dir).map_err(Error::retrieval)?;
    let schema = build_schema();
    let index = Index::create_in_dir(&dir, schema.clone()).map_err(Error::retrieval)?;
    register_tokenizer(&index);
    let f = fields(&schema)?;
    let mut writer = index.writer(50_000_000).map_err(Error::retrieval)?;
    let mut count = 0usize;
    for row in rows {
        let text = row.text(COL_TEXT).unwrap_or_default();
        let title = row.text(COL_TITLE).unwrap_or_default();
        let page = row
            .cell(COL_PAGE)
            .and_then(|c| match c.value {
                gentab_core::types::CellValue::Int(p) => Some(p),
                _ => None,
            })
            .unwrap_or(0);
        let d = doc!(
            f.id => row.id.clone(),
            f.text => text,
            f.title => title,
            f.extras => extras_text(table, row),
            f.page => page,
        );
        writer.add_document(d).map_err(Error::retrieval)?;
        count += 1;
    }
    writer.commit().map_err(Error::retrieval)?;
    Ok(count)
}

/// Incrementally remove rows from an existing index. Cheaper than the
/// full rebuild the staleness path would otherwise force.
pub fn remove(index_root: &Path, table_id: &str, row_ids: &[String]) -> Result<()> {
    let dir = index_dir(index_root, table_id);
    let index = Index::open_in_dir(&dir).map_err(Error::retrieval)?;
    register_tokenizer(&index);
    let id_field = index.schema().get_field("id").map_err(Error::retrieval)?;
    let mut writer: tantivy::IndexWriter = index.writer(15_000_000).map_err(Error::retrieval)?;
    for row_id in row_ids {
        writer.delete_term(tantivy::Term::from_field_text(id_field, row_id));
    }
    writer.commit().map_err(Error::retrieval)?;
    Ok(())
}

/// Query the index for up to `k` hits. The raw query is escaped so any
/// reserved syntax matches literally.
pub fn search(index_root: &Path, table_id: &str, query: &str, k: usize) -> Result<Vec<Hit>> {
    let dir = index_dir(index_root, table_id);
    let index = Index::open_in_dir(&dir).map_err(Error::retrieval)?;
    register_tokenizer(&index);
    let schema = index.schema();
    let f = fields(&schema)?;
    let reader = index.reader().map_err(Error::retrieval)?;
    let searcher = reader.searcher();
    let escaped = escape_query(query);
    if escaped.is_empty() {
        return Ok(Vec::new());
    }
    let qp = QueryParser::for_index(&index, vec![f.text, f.title, f.extras]);
    let q = qp.parse_query(&escaped).map_err(Error::retrieval)?;
    let top_docs = searcher.search(&q, &TopDocs::with_limit(k)).map_err(Error::retrieval)?;
    let mut hits = Vec::new();
    for (score, addr) in top_docs {
        let d: TantivyDocument = searcher.doc(addr).map_err(Error::retrieval)?;
        let id = d.get_first(f.id).and_then(|v| v.as_str()).unwrap_or("").to_string();
        hits.push(Hit { row_id: id, score });
    }
    Ok(hits)
}
