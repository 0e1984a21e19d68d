use std::path::PathBuf;

use rusqlite::Connection;
use sdx_store_core::{
    feedback_label, is_feedback, period_of, survey_id_of, take_validity_marker, tx_id_of,
    QueueRouting, SearchParams, StoreError, SurveyResponse, TxId,
};
use sdx_store_notify::{HttpQueuePublisher, Publisher};
use sdx_store_sqlite::{ProcessSafePool, ResponseStore};
use serde::Serialize;
use serde_json::Value;
use time::{Duration, OffsetDateTime};

const DEFAULT_DB_PATH: &str = "./sdx_store.sqlite3";
const DEFAULT_QUEUE_URL: &str = "http://127.0.0.1:5672";
const DEFAULT_CORA_QUEUE: &str = "sdx-cora-survey-notifications";
const DEFAULT_CTP_QUEUE: &str = "sdx-ctp-survey-notifications";
const DEFAULT_CS_QUEUE: &str = "sdx-cs-survey-notifications";

/// Environment-style settings for the store, the queue endpoints, and the
/// retention window. Every knob has an `SDX_STORE_*` variable.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub queue_urls: Vec<String>,
    pub cora_queue: String,
    pub ctp_queue: String,
    pub cs_queue: String,
    /// Additional survey-id to queue-name rules appended after the built-in
    /// census/CORA rules.
    pub extra_routes: Vec<(String, String)>,
    /// `None` disables retention deletion entirely rather than silently
    /// keeping data forever under a default.
    pub retention_days: Option<u32>,
}

impl StoreConfig {
    #[must_use]
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            queue_urls: vec![DEFAULT_QUEUE_URL.to_owned()],
            cora_queue: DEFAULT_CORA_QUEUE.to_owned(),
            ctp_queue: DEFAULT_CTP_QUEUE.to_owned(),
            cs_queue: DEFAULT_CS_QUEUE.to_owned(),
            extra_routes: Vec::new(),
            retention_days: None,
        }
    }

    /// Read the configuration surface from the environment.
    ///
    /// # Errors
    /// [`StoreError::Validation`] for an unparseable retention window or
    /// routing rule.
    pub fn from_env() -> Result<Self, StoreError> {
        let mut config = Self::new(env_or("SDX_STORE_DB", DEFAULT_DB_PATH));

        if let Ok(raw) = std::env::var("SDX_STORE_QUEUE_URLS") {
            config.queue_urls = split_csv(&raw);
        }
        config.cora_queue = env_or("SDX_STORE_CORA_QUEUE", DEFAULT_CORA_QUEUE);
        config.ctp_queue = env_or("SDX_STORE_CTP_QUEUE", DEFAULT_CTP_QUEUE);
        config.cs_queue = env_or("SDX_STORE_CS_QUEUE", DEFAULT_CS_QUEUE);

        if let Ok(raw) = std::env::var("SDX_STORE_RETENTION_DAYS") {
            let days = raw.parse::<u32>().map_err(|_| {
                StoreError::Validation(format!("unparseable retention window: {raw}"))
            })?;
            config.retention_days = Some(days);
        }

        if let Ok(raw) = std::env::var("SDX_STORE_ROUTES") {
            for entry in split_csv(&raw) {
                match entry.split_once('=') {
                    Some((survey, queue)) if !survey.is_empty() && !queue.is_empty() => {
                        config.extra_routes.push((survey.to_owned(), queue.to_owned()));
                    }
                    _ => {
                        return Err(StoreError::Validation(format!(
                            "unparseable routing rule: {entry}"
                        )));
                    }
                }
            }
        }

        Ok(config)
    }

    /// The routing table: census submissions go to CTP, survey 144 to CORA,
    /// configured extras next, everything else to CS.
    #[must_use]
    pub fn routing(&self) -> QueueRouting {
        let mut routing = QueueRouting::new(self.cs_queue.clone())
            .with_rule("census", self.ctp_queue.clone())
            .with_rule("144", self.cora_queue.clone());
        for (survey, queue) in &self.extra_routes {
            routing = routing.with_rule(survey.clone(), queue.clone());
        }
        routing
    }
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_owned())
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_owned).collect()
}

/// What became of one submission.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SaveOutcome {
    /// `None` for feedback documents, which are keyed by a store-generated
    /// id instead.
    pub tx_id: Option<TxId>,
    pub valid: Option<bool>,
    pub feedback: bool,
    /// `Some(false)` means the insert committed but the notification was
    /// lost; the caller must fail the request. `None` when no notification
    /// was due (feedback, or a submission flagged invalid).
    pub notified: Option<bool>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SearchResultPage {
    pub total_hits: u64,
    pub results: Vec<SurveyResponse>,
}

/// Service root: owns the pool, the publisher, the routing table, and the
/// retention setting, and exposes the store operations the boundary calls.
pub struct StoreApi {
    pool: ProcessSafePool,
    publisher: Box<dyn Publisher + Send + Sync>,
    routing: QueueRouting,
    retention_days: Option<u32>,
}

impl StoreApi {
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        let publisher = HttpQueuePublisher::new(config.queue_urls.clone());
        Self::with_publisher(config, Box::new(publisher))
    }

    /// Construct with an explicit publisher; the seam used by tests.
    #[must_use]
    pub fn with_publisher(
        config: &StoreConfig,
        publisher: Box<dyn Publisher + Send + Sync>,
    ) -> Self {
        Self {
            pool: ProcessSafePool::new(config.db_path.clone()),
            publisher,
            routing: config.routing(),
            retention_days: config.retention_days,
        }
    }

    /// Ensure the storage tables exist; called on every startup.
    ///
    /// # Errors
    /// Returns an error when the schema cannot be applied.
    pub fn ensure_schema(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| ResponseStore::new(conn).create_schema())
    }

    /// Verify a connection can be drawn and answers a trivial query.
    ///
    /// # Errors
    /// [`StoreError::Connectivity`] when the backend is unreachable.
    pub fn health_check(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|err| StoreError::Connectivity(err.to_string()))?;
            Ok(())
        })
    }

    /// Persist one submission and, for survey responses not flagged invalid,
    /// announce its transaction id on the routed queue. The validity marker
    /// is extracted from the payload before storage; feedback documents are
    /// stored in their own table and never notified.
    ///
    /// # Errors
    /// [`StoreError::MissingId`] / [`StoreError::InvalidIdFormat`] for a
    /// survey response without a usable transaction id;
    /// [`StoreError::Validation`] for a non-object payload; storage errors
    /// pass through. A lost notification is not an error here, because the
    /// insert has already committed; see [`SaveOutcome::notified`].
    pub fn save_response(&self, mut payload: Value) -> Result<SaveOutcome, StoreError> {
        if !payload.is_object() {
            return Err(StoreError::Validation("submission must be a JSON object".to_owned()));
        }
        let valid = take_validity_marker(&mut payload);

        if is_feedback(&payload) {
            let survey = feedback_label(survey_id_of(&payload));
            let period = feedback_label(period_of(&payload));
            let id = self.with_conn(|conn| {
                ResponseStore::new(conn).insert_feedback(valid, &payload, &survey, &period)
            })?;
            tracing::info!(id, survey = %survey, "feedback saved");
            return Ok(SaveOutcome { tx_id: None, valid, feedback: true, notified: None });
        }

        let tx_id = tx_id_of(&payload)?;
        self.with_conn(|conn| ResponseStore::new(conn).upsert_response(&tx_id, valid, &payload))?;
        tracing::info!(tx_id = %tx_id, valid, "response saved");

        if valid == Some(false) {
            return Ok(SaveOutcome { tx_id: Some(tx_id), valid, feedback: false, notified: None });
        }

        let queue = self.routing.route(survey_id_of(&payload).unwrap_or_default()).to_owned();
        let notified = self.publisher.publish(&queue, tx_id.as_str(), &tx_id);
        Ok(SaveOutcome { tx_id: Some(tx_id), valid, feedback: false, notified: Some(notified) })
    }

    /// Point lookup by transaction id. The id format is checked before any
    /// backend round trip; absence is `Ok(None)`.
    ///
    /// # Errors
    /// [`StoreError::InvalidIdFormat`] for a malformed id; storage errors
    /// pass through.
    pub fn get_response(&self, raw_id: &str) -> Result<Option<SurveyResponse>, StoreError> {
        let tx_id = TxId::parse(raw_id)?;
        self.with_conn(|conn| ResponseStore::new(conn).select_by_id(&tx_id))
    }

    /// Filtered, paginated listing.
    ///
    /// # Errors
    /// Validation errors for bad parameters; storage errors pass through.
    pub fn search(&self, params: SearchParams) -> Result<SearchResultPage, StoreError> {
        let criteria = params.into_criteria()?;
        let (total_hits, results) =
            self.with_conn(|conn| ResponseStore::new(conn).search(&criteria))?;
        Ok(SearchResultPage { total_hits, results })
    }

    /// Rows matching the validity flag; `None` returns the whole table.
    ///
    /// # Errors
    /// Storage errors pass through.
    pub fn filter_by_validity(
        &self,
        valid: Option<bool>,
    ) -> Result<Vec<SurveyResponse>, StoreError> {
        self.with_conn(|conn| ResponseStore::new(conn).filter_by_validity(valid))
    }

    /// Delete responses older than the configured retention window.
    ///
    /// # Errors
    /// [`StoreError::RetentionNotConfigured`] when no window is set; storage
    /// errors pass through.
    pub fn delete_old_responses(&self) -> Result<usize, StoreError> {
        let days = self.retention_days.ok_or(StoreError::RetentionNotConfigured)?;
        let cutoff = OffsetDateTime::now_utc() - Duration::days(i64::from(days));
        self.with_conn(|conn| ResponseStore::new(conn).delete_older_than(cutoff))
    }

    /// Re-announce an already stored document on its routed queue.
    /// `Ok(None)` when no document carries the id; `Ok(Some(false))` when
    /// every queue endpoint refused the message.
    ///
    /// # Errors
    /// [`StoreError::InvalidIdFormat`] for a malformed id; storage errors
    /// pass through.
    pub fn requeue(&self, raw_id: &str) -> Result<Option<bool>, StoreError> {
        let tx_id = TxId::parse(raw_id)?;
        let row = self.with_conn(|conn| ResponseStore::new(conn).select_by_id(&tx_id))?;
        match row {
            Some(row) => {
                let queue = self.routing.route(survey_id_of(&row.data).unwrap_or_default());
                Ok(Some(self.publisher.publish(queue, tx_id.as_str(), &tx_id)))
            }
            None => Ok(None),
        }
    }

    /// Close every pooled connection; shutdown and test teardown.
    pub fn close(&self) {
        self.pool.close_all();
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.pool.acquire()?;
        let result = op(&conn);
        self.pool.release(conn);
        result
    }
}
