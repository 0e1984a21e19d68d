use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Largest page size a caller may request.
pub const MAX_PER_PAGE: u32 = 100;

/// Deepest JSON path a search predicate may address.
pub const MAX_PATH_DEPTH: usize = 2;

/// Width of the denormalized `survey`/`period` feedback columns.
pub const FEEDBACK_LABEL_LEN: usize = 25;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("missing transaction id")]
    MissingId,
    #[error("malformed transaction id: {0}")]
    InvalidIdFormat(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("query path depth not supported: {0}")]
    UnsupportedPath(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
    #[error("backend unavailable: {0}")]
    Connectivity(String),
    #[error("retention window is not configured")]
    RetentionNotConfigured,
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether the error is the caller's fault rather than a failure of the
    /// store itself. The HTTP boundary maps this to 400 vs 500.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::MissingId
                | Self::InvalidIdFormat(_)
                | Self::Validation(_)
                | Self::UnsupportedPath(_)
        )
    }
}

/// Caller-supplied transaction id: the primary key for persistence and the
/// idempotency token for inserts. Strict lowercase-hex 8-4-4-4-12 form.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "String", into = "String")]
pub struct TxId(String);

impl TxId {
    /// Validate a candidate id before it reaches any backend.
    ///
    /// # Errors
    /// Returns [`StoreError::InvalidIdFormat`] unless the value matches the
    /// canonical UUID pattern exactly.
    pub fn parse(value: &str) -> Result<Self, StoreError> {
        if is_canonical_uuid(value) {
            Ok(Self(value.to_owned()))
        } else {
            Err(StoreError::InvalidIdFormat(value.to_owned()))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for TxId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TxId> for String {
    fn from(value: TxId) -> Self {
        value.0
    }
}

fn is_canonical_uuid(value: &str) -> bool {
    const DASHES: [usize; 4] = [8, 13, 18, 23];
    if value.len() != 36 {
        return false;
    }
    value.bytes().enumerate().all(|(i, b)| {
        if DASHES.contains(&i) {
            b == b'-'
        } else {
            b.is_ascii_digit() || (b'a'..=b'f').contains(&b)
        }
    })
}

/// One persisted survey submission.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SurveyResponse {
    pub tx_id: TxId,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub valid: Option<bool>,
    pub data: Value,
}

/// One persisted feedback submission. Keyed by a store-generated id;
/// `survey` and `period` are denormalized copies used only for filtering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackResponse {
    pub id: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub valid: Option<bool>,
    pub data: Value,
    pub survey: String,
    pub period: String,
}

/// Pull the validity marker out of a submission payload.
///
/// The wire marker is `"invalid": true|false`; the stored flag is its
/// complement (`invalid: true` means the row is confirmed bad). The key is
/// removed from the payload so the marker is not duplicated in `data`.
/// Returns `None` when the payload carries no boolean marker.
pub fn take_validity_marker(payload: &mut Value) -> Option<bool> {
    let map = payload.as_object_mut()?;
    match map.get("invalid") {
        Some(Value::Bool(flag)) => {
            let flag = *flag;
            map.remove("invalid");
            Some(!flag)
        }
        _ => None,
    }
}

/// Extract and validate the transaction id of a submission payload.
///
/// # Errors
/// [`StoreError::MissingId`] when the payload has no string `tx_id`;
/// [`StoreError::InvalidIdFormat`] when the id does not match the UUID
/// pattern.
pub fn tx_id_of(payload: &Value) -> Result<TxId, StoreError> {
    match payload.get("tx_id").and_then(Value::as_str) {
        Some(raw) => TxId::parse(raw),
        None => Err(StoreError::MissingId),
    }
}

/// Whether a submission is a feedback document (`type` ends in `:feedback`).
#[must_use]
pub fn is_feedback(payload: &Value) -> bool {
    payload
        .get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| t.ends_with(":feedback"))
}

#[must_use]
pub fn survey_id_of(payload: &Value) -> Option<&str> {
    payload.get("survey_id").and_then(Value::as_str)
}

#[must_use]
pub fn period_of(payload: &Value) -> Option<&str> {
    payload.get("collection").and_then(|c| c.get("period")).and_then(Value::as_str)
}

/// Clip a feedback label to the denormalized column width.
#[must_use]
pub fn feedback_label(value: Option<&str>) -> String {
    value.unwrap_or_default().chars().take(FEEDBACK_LABEL_LEN).collect()
}

/// Search predicate, one per request. A tagged enum rather than a statement
/// class per query shape; the SQLite crate renders each variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchFilter {
    /// No filter supplied: matches every row.
    All,
    /// Equality on a JSON path one or two segments deep.
    JsonPath { segments: Vec<String>, value: String },
    /// Rows inserted at or after the given instant.
    AddedSince { since: OffsetDateTime },
}

/// Validated filter plus pagination window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    page: u32,
    per_page: u32,
    filter: SearchFilter,
}

impl SearchCriteria {
    /// Build criteria, enforcing the pagination ranges and the path-depth
    /// restriction.
    ///
    /// # Errors
    /// [`StoreError::Validation`] for out-of-range pagination or a malformed
    /// path; [`StoreError::UnsupportedPath`] for paths deeper than
    /// [`MAX_PATH_DEPTH`], a deliberate and permanent restriction.
    pub fn new(page: u32, per_page: u32, filter: SearchFilter) -> Result<Self, StoreError> {
        if page == 0 {
            return Err(StoreError::Validation("page must be >= 1".to_owned()));
        }
        if !(1..=MAX_PER_PAGE).contains(&per_page) {
            return Err(StoreError::Validation(format!(
                "per_page must be between 1 and {MAX_PER_PAGE}"
            )));
        }
        if let SearchFilter::JsonPath { segments, .. } = &filter {
            if segments.is_empty() {
                return Err(StoreError::Validation("empty query path".to_owned()));
            }
            if segments.len() > MAX_PATH_DEPTH {
                return Err(StoreError::UnsupportedPath(segments.join(".")));
            }
            for segment in segments {
                if segment.is_empty()
                    || !segment.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
                {
                    return Err(StoreError::Validation(format!(
                        "invalid query path segment: {segment}"
                    )));
                }
            }
        }
        Ok(Self { page, per_page, filter })
    }

    #[must_use]
    pub fn page(&self) -> u32 {
        self.page
    }

    #[must_use]
    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    #[must_use]
    pub fn filter(&self) -> &SearchFilter {
        &self.filter
    }

    /// Row offset of the requested page slice.
    #[must_use]
    pub fn offset(&self) -> u64 {
        u64::from(self.per_page) * u64::from(self.page - 1)
    }
}

/// Raw search parameters as they arrive at the boundary. Unknown fields are
/// rejected there, matching the original request schema.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SearchParams {
    pub survey_id: Option<String>,
    pub form: Option<String>,
    pub ru_ref: Option<String>,
    pub period: Option<String>,
    pub added_ms: Option<i64>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

impl SearchParams {
    /// Translate request parameters into validated criteria. `survey_id` and
    /// `form` address top-level fields; `ru_ref` and `period` address their
    /// nested locations in the submission document.
    ///
    /// # Errors
    /// [`StoreError::Validation`] when more than one filter is supplied or a
    /// value is out of range.
    pub fn into_criteria(self) -> Result<SearchCriteria, StoreError> {
        let page = self.page.unwrap_or(1);
        let per_page = self.per_page.unwrap_or(MAX_PER_PAGE);

        let mut filters: Vec<SearchFilter> = Vec::new();
        if let Some(value) = self.survey_id {
            filters.push(SearchFilter::JsonPath { segments: vec!["survey_id".to_owned()], value });
        }
        if let Some(value) = self.form {
            filters.push(SearchFilter::JsonPath { segments: vec!["form".to_owned()], value });
        }
        if let Some(value) = self.ru_ref {
            filters.push(SearchFilter::JsonPath {
                segments: vec!["metadata".to_owned(), "ru_ref".to_owned()],
                value,
            });
        }
        if let Some(value) = self.period {
            filters.push(SearchFilter::JsonPath {
                segments: vec!["collection".to_owned(), "period".to_owned()],
                value,
            });
        }
        if let Some(ms) = self.added_ms {
            let since = OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
                .map_err(|_| StoreError::Validation(format!("added_ms out of range: {ms}")))?;
            filters.push(SearchFilter::AddedSince { since });
        }

        if filters.len() > 1 {
            return Err(StoreError::Validation(
                "at most one search filter may be supplied".to_owned(),
            ));
        }
        let filter = filters.pop().unwrap_or(SearchFilter::All);
        SearchCriteria::new(page, per_page, filter)
    }
}

/// Static survey-id to queue-name routing table. Rules are data, not code,
/// so deployments can extend them through configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouting {
    rules: Vec<(String, String)>,
    default_queue: String,
}

impl QueueRouting {
    #[must_use]
    pub fn new(default_queue: impl Into<String>) -> Self {
        Self { rules: Vec::new(), default_queue: default_queue.into() }
    }

    #[must_use]
    pub fn with_rule(mut self, survey_id: impl Into<String>, queue: impl Into<String>) -> Self {
        self.rules.push((survey_id.into(), queue.into()));
        self
    }

    /// Queue name for a survey id; the first matching rule wins, the default
    /// queue otherwise.
    #[must_use]
    pub fn route(&self, survey_id: &str) -> &str {
        self.rules
            .iter()
            .find(|(survey, _)| survey == survey_id)
            .map_or(self.default_queue.as_str(), |(_, queue)| queue.as_str())
    }
}
