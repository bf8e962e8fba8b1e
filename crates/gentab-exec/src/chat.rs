//! Multi-turn history reconstruction for conversation-style tables.

use std::collections::BTreeMap;

use gentab_core::template;
use gentab_core::types::{ColumnId, Row, Table};
use gentab_providers::types::ChatMessage;

/// Template-visible values of a row: every column rendered to text, with
/// `None` for cells that hold nothing.
pub fn row_values(table: &Table, row: &Row) -> BTreeMap<ColumnId, Option<String>> {
    table
        .columns
        .iter()
        .map(|col| (col.id.clone(), row.text(&col.id)))
        .collect()
}

/// Reconstruct the message history for (re)generating the row at
/// `target_seq` of a multi-turn column.
///
/// Only rows strictly before the target in table order participate. Rows
/// that come after it are excluded even though they physically exist in
/// storage; a regenerated "past" turn must never see "future" turns. The
/// most recent `window` turns are kept.
pub fn build_history(
    table: &Table,
    rows: &[Row],
    target_seq: i64,
    user_template: &str,
    assistant_column: &ColumnId,
    window: usize,
) -> Vec<ChatMessage> {
    let mut turns: Vec<(String, Option<String>)> = Vec::new();
    for row in rows {
        if row.seq >= target_seq {
            continue;
        }
        let values = row_values(table, row);
        let user = template::render(user_template, &values).text;
        let assistant = row.text(assistant_column);
        turns.push((user, assistant));
    }
    if turns.len() > window {
        turns.drain(..turns.len() - window);
    }
    let mut messages = Vec::with_capacity(turns.len() * 2);
    for (user, assistant) in turns {
        messages.push(ChatMessage::user(user));
        if let Some(assistant) = assistant {
            messages.push(ChatMessage::assistant(assistant));
        }
    }
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use gentab_core::types::{Cell, CellValue, Column, DType, GenConfig, LlmGenConfig};

    fn chat_table() -> Table {
        Table::new(
            "chat",
            vec![
                Column::input("user", DType::Str),
                Column::output(
                    "assistant",
                    DType::Str,
                    GenConfig::Llm(LlmGenConfig {
                        model: "m".into(),
                        system_prompt: String::new(),
                        prompt: "${user}".into(),
                        temperature: None,
                        top_p: None,
                        max_tokens: None,
                        rag_params: None,
                        multi_turn: true,
                    }),
                ),
            ],
        )
    }

    fn row(seq: i64, user: &str, assistant: Option<&str>) -> Row {
        let mut cells = BTreeMap::new();
        cells.insert("user".to_string(), Cell::done(CellValue::Str(user.to_string())));
        if let Some(a) = assistant {
            cells.insert("assistant".to_string(), Cell::done(CellValue::Str(a.to_string())));
        }
        Row { id: format!("chat:{seq}"), seq, cells }
    }

    #[test]
    fn future_rows_are_excluded_from_history() {
        let table = chat_table();
        let rows: Vec<Row> = vec![
            row(0, "q1", Some("a1")),
            row(1, "q2", Some("a2")),
            row(2, "q3", Some("stale")),
            row(3, "q4", Some("a4")),
            row(4, "q5", Some("a5")),
        ];
        // Regenerating row 3 (seq 2): only rows 1-2 participate, rows 4-5
        // never leak in.
        let history = build_history(&table, &rows, 2, "${user}", &"assistant".to_string(), 16);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2", "a2"]);
    }

    #[test]
    fn window_keeps_only_recent_turns() {
        let table = chat_table();
        let rows: Vec<Row> = (0..10).map(|i| row(i, &format!("q{i}"), Some("a"))).collect();
        let history = build_history(&table, &rows, 9, "${user}", &"assistant".to_string(), 2);
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].content, "q7");
        assert_eq!(history[2].content, "q8");
    }

    #[test]
    fn rows_without_an_answer_contribute_only_the_user_turn() {
        let table = chat_table();
        let rows = vec![row(0, "q1", None), row(1, "q2", Some("a2"))];
        let history = build_history(&table, &rows, 2, "${user}", &"assistant".to_string(), 16);
        let contents: Vec<&str> = history.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "q2", "a2"]);
    }
}
