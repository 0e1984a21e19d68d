use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use sdx_store_core::{
    FeedbackResponse, SearchCriteria, StoreError, SurveyResponse, TxId,
};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, Time, UtcOffset};

pub mod pool;
mod query;

pub use pool::ProcessSafePool;

const CREATE_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS responses (
  tx_id TEXT PRIMARY KEY CHECK (length(tx_id) = 36),
  ts TEXT NOT NULL,
  valid INTEGER,
  data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_responses_valid ON responses(valid);

CREATE TABLE IF NOT EXISTS feedback_responses (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  ts TEXT NOT NULL,
  valid INTEGER,
  data TEXT NOT NULL,
  survey TEXT CHECK (length(survey) <= 25),
  period TEXT CHECK (length(period) <= 25)
);

CREATE INDEX IF NOT EXISTS idx_feedback_survey_period
  ON feedback_responses(survey, period);
";

// ts is only written on the initial insert: re-inserting the same tx_id
// replaces data and valid but keeps the first-write timestamp.
const UPSERT_RESPONSE_SQL: &str = "
INSERT INTO responses (tx_id, ts, valid, data) VALUES (?, ?, ?, ?)
ON CONFLICT(tx_id) DO UPDATE SET valid = excluded.valid, data = excluded.data";

const SELECT_BY_ID_SQL: &str = "SELECT tx_id, ts, valid, data FROM responses WHERE tx_id = ?";

const FILTER_BY_VALIDITY_SQL: &str =
    "SELECT tx_id, ts, valid, data FROM responses WHERE valid = ?";

const FILTER_ALL_SQL: &str = "SELECT tx_id, ts, valid, data FROM responses";

const DELETE_OLDER_SQL: &str = "DELETE FROM responses WHERE ts < ?";

const INSERT_FEEDBACK_SQL: &str = "
INSERT INTO feedback_responses (ts, valid, data, survey, period)
  VALUES (?, ?, ?, ?, ?)";

const SELECT_FEEDBACK_SQL: &str =
    "SELECT id, ts, valid, data, survey, period FROM feedback_responses";

/// Survey-response operations over a caller-supplied connection, usually one
/// drawn from a [`ProcessSafePool`]. Every operation is a single autocommit
/// statement; no multi-statement transaction spans the caller.
pub struct ResponseStore<'c> {
    conn: &'c Connection,
}

impl<'c> ResponseStore<'c> {
    #[must_use]
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Ensure both storage tables exist. Safe to call on every startup.
    ///
    /// # Errors
    /// Returns an error when the schema statements cannot be applied.
    pub fn create_schema(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_SQL).map_err(map_sqlite_error)
    }

    /// Insert-or-replace keyed by `tx_id`. A repeat insert with the same id
    /// replaces `valid` and `data` and never produces a second row; the
    /// timestamp keeps its first-write value.
    ///
    /// # Errors
    /// [`StoreError::Constraint`] when the backend rejects the row,
    /// [`StoreError::Connectivity`] for other backend failures.
    pub fn upsert_response(
        &self,
        tx_id: &TxId,
        valid: Option<bool>,
        data: &Value,
    ) -> Result<TxId, StoreError> {
        let ts = format_ts(truncate_to_second(OffsetDateTime::now_utc()))?;
        let body = serde_json::to_string(data)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.conn
            .execute(UPSERT_RESPONSE_SQL, params![tx_id.as_str(), ts, valid, body])
            .map_err(map_sqlite_error)?;
        tracing::debug!(tx_id = %tx_id, valid, "response stored");
        Ok(tx_id.clone())
    }

    /// Point lookup. Absence is `Ok(None)`, not an error.
    ///
    /// # Errors
    /// Returns an error on backend failure or a corrupt row.
    pub fn select_by_id(&self, tx_id: &TxId) -> Result<Option<SurveyResponse>, StoreError> {
        let row = self
            .conn
            .query_row(SELECT_BY_ID_SQL, params![tx_id.as_str()], raw_response_row)
            .optional()
            .map_err(map_sqlite_error)?;
        row.map(decode_response).transpose()
    }

    /// Rows matching the validity flag; `None` means no validity filter at
    /// all (valid, invalid and undetermined rows alike). No ordering is
    /// guaranteed.
    ///
    /// # Errors
    /// Returns an error on backend failure or a corrupt row.
    pub fn filter_by_validity(
        &self,
        valid: Option<bool>,
    ) -> Result<Vec<SurveyResponse>, StoreError> {
        let mut stmt = match valid {
            Some(_) => self.conn.prepare(FILTER_BY_VALIDITY_SQL),
            None => self.conn.prepare(FILTER_ALL_SQL),
        }
        .map_err(map_sqlite_error)?;

        let rows = match valid {
            Some(flag) => stmt.query_map(params![flag], raw_response_row),
            None => stmt.query_map([], raw_response_row),
        }
        .map_err(map_sqlite_error)?;

        let mut responses = Vec::new();
        for row in rows {
            responses.push(decode_response(row.map_err(map_sqlite_error)?)?);
        }
        Ok(responses)
    }

    /// Bulk-delete rows older than the cutoff, whose time-of-day is first
    /// normalized to 00:00:00 UTC. One statement, so a crash cannot remove
    /// half of a logical day. Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error on backend failure.
    pub fn delete_older_than(&self, cutoff: OffsetDateTime) -> Result<usize, StoreError> {
        let midnight = cutoff.to_offset(UtcOffset::UTC).replace_time(Time::MIDNIGHT);
        let deleted = self
            .conn
            .execute(DELETE_OLDER_SQL, params![format_ts(midnight)?])
            .map_err(map_sqlite_error)?;
        tracing::debug!(deleted, cutoff = %midnight, "retention delete");
        Ok(deleted)
    }

    /// Run the translated page and count queries for the criteria, returning
    /// `(total_hits, page)`. The count mirrors the predicate and is
    /// independent of the page slice.
    ///
    /// # Errors
    /// Returns an error when the predicate cannot be rendered or a query
    /// fails.
    pub fn search(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<(u64, Vec<SurveyResponse>), StoreError> {
        let translated = query::translate(criteria.filter())?;

        let total: i64 = self
            .conn
            .query_row(&translated.count_sql, params_from_iter(translated.params.iter()), |row| {
                row.get(0)
            })
            .map_err(map_sqlite_error)?;

        let page_sql = format!("{} LIMIT ? OFFSET ?", translated.select_sql);
        let mut page_params = translated.params;
        page_params.push(SqlValue::Integer(i64::from(criteria.per_page())));
        page_params.push(SqlValue::Integer(
            i64::try_from(criteria.offset())
                .map_err(|_| StoreError::Validation("page offset out of range".to_owned()))?,
        ));

        let mut stmt = self.conn.prepare(&page_sql).map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params_from_iter(page_params.iter()), raw_response_row)
            .map_err(map_sqlite_error)?;

        let mut responses = Vec::new();
        for row in rows {
            responses.push(decode_response(row.map_err(map_sqlite_error)?)?);
        }
        Ok((u64::try_from(total).unwrap_or(0), responses))
    }

    /// Insert one feedback document and return its store-generated id. The
    /// denormalized labels are expected pre-clipped to the column width.
    ///
    /// # Errors
    /// [`StoreError::Constraint`] when the backend rejects the row,
    /// [`StoreError::Connectivity`] for other backend failures.
    pub fn insert_feedback(
        &self,
        valid: Option<bool>,
        data: &Value,
        survey: &str,
        period: &str,
    ) -> Result<i64, StoreError> {
        let ts = format_ts(truncate_to_second(OffsetDateTime::now_utc()))?;
        let body = serde_json::to_string(data)
            .map_err(|err| StoreError::Serialization(err.to_string()))?;
        self.conn
            .execute(INSERT_FEEDBACK_SQL, params![ts, valid, body, survey, period])
            .map_err(map_sqlite_error)?;
        let id = self.conn.last_insert_rowid();
        tracing::debug!(id, survey, period, "feedback stored");
        Ok(id)
    }

    /// Feedback rows, optionally narrowed by the denormalized `survey` and
    /// `period` columns.
    ///
    /// # Errors
    /// Returns an error on backend failure or a corrupt row.
    pub fn filter_feedback(
        &self,
        survey: Option<&str>,
        period: Option<&str>,
    ) -> Result<Vec<FeedbackResponse>, StoreError> {
        let mut sql = SELECT_FEEDBACK_SQL.to_owned();
        let mut bound: Vec<SqlValue> = Vec::new();
        for (column, value) in [("survey", survey), ("period", period)] {
            if let Some(value) = value {
                sql.push_str(if bound.is_empty() { " WHERE " } else { " AND " });
                sql.push_str(column);
                sql.push_str(" = ?");
                bound.push(SqlValue::Text(value.to_owned()));
            }
        }

        let mut stmt = self.conn.prepare(&sql).map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params_from_iter(bound.iter()), |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<bool>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(map_sqlite_error)?;

        let mut responses = Vec::new();
        for row in rows {
            let (id, ts, valid, body, survey, period) = row.map_err(map_sqlite_error)?;
            responses.push(FeedbackResponse {
                id,
                ts: parse_ts(&ts)?,
                valid,
                data: parse_json(&body)?,
                survey: survey.unwrap_or_default(),
                period: period.unwrap_or_default(),
            });
        }
        Ok(responses)
    }
}

type RawResponseRow = (String, String, Option<bool>, String);

fn raw_response_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawResponseRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn decode_response(raw: RawResponseRow) -> Result<SurveyResponse, StoreError> {
    let (tx_id, ts, valid, body) = raw;
    let tx_id = TxId::parse(&tx_id)
        .map_err(|_| StoreError::Serialization(format!("corrupt tx_id in row: {tx_id}")))?;
    Ok(SurveyResponse { tx_id, ts: parse_ts(&ts)?, valid, data: parse_json(&body)? })
}

fn parse_json(body: &str) -> Result<Value, StoreError> {
    serde_json::from_str(body)
        .map_err(|err| StoreError::Serialization(format!("corrupt document in row: {err}")))
}

fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, message) => match failure.code {
            ErrorCode::ConstraintViolation => {
                StoreError::Constraint(message.clone().unwrap_or_else(|| failure.to_string()))
            }
            _ => StoreError::Connectivity(err.to_string()),
        },
        _ => StoreError::Connectivity(err.to_string()),
    }
}

// Timestamps are stored as RFC 3339 UTC at whole-second precision so that
// lexicographic comparison in SQL matches chronological order.
pub(crate) fn truncate_to_second(ts: OffsetDateTime) -> OffsetDateTime {
    ts.replace_nanosecond(0).unwrap_or(ts)
}

pub(crate) fn format_ts(ts: OffsetDateTime) -> Result<String, StoreError> {
    ts.to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| StoreError::Serialization(format!("unformattable timestamp: {err}")))
}

fn parse_ts(raw: &str) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|err| StoreError::Serialization(format!("corrupt timestamp in row: {raw}: {err}")))
}
