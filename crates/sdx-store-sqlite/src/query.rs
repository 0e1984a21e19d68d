use rusqlite::types::Value as SqlValue;
use sdx_store_core::{SearchFilter, StoreError};

const SELECT_RESPONSES: &str = "SELECT tx_id, ts, valid, data FROM responses";
const COUNT_RESPONSES: &str = "SELECT COUNT(*) FROM responses";

/// A rendered predicate: the page query, the mirrored count query, and the
/// bound parameters shared by both.
pub(crate) struct TranslatedQuery {
    pub(crate) select_sql: String,
    pub(crate) count_sql: String,
    pub(crate) params: Vec<SqlValue>,
}

/// Render a [`SearchFilter`] into SQLite SQL. One rendering function per
/// variant shape, selected by the tag.
///
/// Path segments were charset-checked when the criteria were built, so the
/// spliced `$.a.b` literal cannot escape the JSON path argument. Values are
/// always bound, never spliced. JSON lookups are compared as text so that
/// `"survey_id": "144"` and a numeric `144` both match the query string,
/// mirroring the text-returning path operator of the original backend.
pub(crate) fn translate(filter: &SearchFilter) -> Result<TranslatedQuery, StoreError> {
    let (predicate, params) = match filter {
        SearchFilter::All => (String::new(), Vec::new()),
        SearchFilter::JsonPath { segments, value } => {
            let path = format!("$.{}", segments.join("."));
            (
                " WHERE CAST(json_extract(data, ?) AS TEXT) = ?".to_owned(),
                vec![SqlValue::Text(path), SqlValue::Text(value.clone())],
            )
        }
        SearchFilter::AddedSince { since } => {
            let cutoff = crate::format_ts(crate::truncate_to_second(*since))?;
            (" WHERE ts >= ?".to_owned(), vec![SqlValue::Text(cutoff)])
        }
    };
    Ok(TranslatedQuery {
        select_sql: format!("{SELECT_RESPONSES}{predicate}"),
        count_sql: format!("{COUNT_RESPONSES}{predicate}"),
        params,
    })
}
