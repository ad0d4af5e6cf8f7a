//! SQLite-backed notification store.

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ErrorCode, FlexGateError, FlexGateResult};
use crate::store::NotificationStore;
use crate::webhooks::{Delivery, DeliveryStats, DeliveryStatus, DeliveryUpdate, WebhookConfig};

const DELIVERY_COLUMNS: &str = "id, webhook_id, event_type, event_id, payload, status, attempts, \
     response_code, response_body, error, delivered_at, event_timestamp, created_at";

const WEBHOOK_COLUMNS: &str =
    "id, url, events, enabled, secret, retry_policy, headers, timeout_ms, created_at, updated_at";

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub fn new(path: impl AsRef<Path>) -> FlexGateResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path.as_ref()).map_err(|e| FlexGateError::Persistence {
            message: format!("Failed to open database: {}", e),
            code: ErrorCode::DbConnectionFailed,
            source: Some(Box::new(e)),
        })?;
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> FlexGateResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> FlexGateResult<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> FlexGateResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| FlexGateError::persistence(format!("Failed to acquire lock: {}", e)))
    }

    fn init_schema(&self) -> FlexGateResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS webhooks (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                events TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                secret TEXT NOT NULL,
                retry_policy TEXT NOT NULL,
                headers TEXT NOT NULL,
                timeout_ms INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id TEXT PRIMARY KEY,
                webhook_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                event_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                response_code INTEGER,
                response_body TEXT,
                error TEXT,
                delivered_at TEXT,
                event_timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deliveries_webhook_created
                ON webhook_deliveries(webhook_id, created_at DESC);

            CREATE INDEX IF NOT EXISTS idx_deliveries_created
                ON webhook_deliveries(created_at);
        "#,
        )?;
        Ok(())
    }
}

/// Fixed-width timestamps so lexical order matches time order.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> FlexGateResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FlexGateError::persistence(format!("Invalid timestamp '{}': {}", raw, e)))
}

/// Delivery columns as stored, before decoding.
struct DeliveryRow {
    id: String,
    webhook_id: String,
    event_type: String,
    event_id: String,
    payload: String,
    status: String,
    attempts: u32,
    response_code: Option<u16>,
    response_body: Option<String>,
    error: Option<String>,
    delivered_at: Option<String>,
    event_timestamp: String,
    created_at: String,
}

impl DeliveryRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            webhook_id: row.get(1)?,
            event_type: row.get(2)?,
            event_id: row.get(3)?,
            payload: row.get(4)?,
            status: row.get(5)?,
            attempts: row.get(6)?,
            response_code: row.get(7)?,
            response_body: row.get(8)?,
            error: row.get(9)?,
            delivered_at: row.get(10)?,
            event_timestamp: row.get(11)?,
            created_at: row.get(12)?,
        })
    }

    fn decode(self) -> FlexGateResult<Delivery> {
        Ok(Delivery {
            status: self.status.parse::<DeliveryStatus>().map_err(|_| {
                FlexGateError::persistence(format!("Unknown delivery status '{}'", self.status))
            })?,
            payload: serde_json::from_str(&self.payload)?,
            delivered_at: self.delivered_at.as_deref().map(parse_ts).transpose()?,
            event_timestamp: parse_ts(&self.event_timestamp)?,
            created_at: parse_ts(&self.created_at)?,
            id: self.id,
            webhook_id: self.webhook_id,
            event_type: self.event_type,
            event_id: self.event_id,
            attempts: self.attempts,
            response_code: self.response_code,
            response_body: self.response_body,
            error: self.error,
        })
    }
}

/// Webhook columns as stored, before decoding.
struct WebhookRow {
    id: String,
    url: String,
    events: String,
    enabled: bool,
    secret: String,
    retry_policy: String,
    headers: String,
    timeout_ms: u64,
    created_at: String,
    updated_at: String,
}

impl WebhookRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            url: row.get(1)?,
            events: row.get(2)?,
            enabled: row.get::<_, i64>(3)? != 0,
            secret: row.get(4)?,
            retry_policy: row.get(5)?,
            headers: row.get(6)?,
            timeout_ms: row.get::<_, i64>(7)?.max(0) as u64,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn decode(self) -> FlexGateResult<WebhookConfig> {
        Ok(WebhookConfig {
            events: serde_json::from_str(&self.events)?,
            retry_policy: serde_json::from_str(&self.retry_policy)?,
            headers: serde_json::from_str(&self.headers)?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            url: self.url,
            enabled: self.enabled,
            secret: self.secret,
            timeout_ms: self.timeout_ms,
        })
    }
}

#[async_trait]
impl NotificationStore for SqliteStore {
    async fn create_delivery(&self, delivery: &Delivery) -> FlexGateResult<()> {
        let payload = serde_json::to_string(&delivery.payload)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO webhook_deliveries ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                DELIVERY_COLUMNS
            ),
            params![
                delivery.id,
                delivery.webhook_id,
                delivery.event_type,
                delivery.event_id,
                payload,
                delivery.status.as_str(),
                delivery.attempts,
                delivery.response_code,
                delivery.response_body,
                delivery.error,
                delivery.delivered_at.map(format_ts),
                format_ts(delivery.event_timestamp),
                format_ts(delivery.created_at),
            ],
        )?;
        Ok(())
    }

    async fn update_delivery(&self, id: &str, update: &DeliveryUpdate) -> FlexGateResult<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"UPDATE webhook_deliveries SET
                   status = COALESCE(?1, status),
                   attempts = COALESCE(?2, attempts),
                   response_code = COALESCE(?3, response_code),
                   response_body = COALESCE(?4, response_body),
                   error = COALESCE(?5, error),
                   delivered_at = COALESCE(?6, delivered_at)
               WHERE id = ?7"#,
            params![
                update.status.map(|s| s.as_str()),
                update.attempts,
                update.response_code,
                update.response_body,
                update.error,
                update.delivered_at.map(format_ts),
                id,
            ],
        )?;
        if changed == 0 {
            return Err(FlexGateError::persistence(format!("Delivery '{}' not found", id)));
        }
        Ok(())
    }

    async fn find_by_webhook(
        &self,
        webhook_id: &str,
        limit: usize,
        offset: usize,
    ) -> FlexGateResult<Vec<Delivery>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM webhook_deliveries WHERE webhook_id = ?1 \
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2 OFFSET ?3",
                DELIVERY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![webhook_id, limit as i64, offset as i64],
                    DeliveryRow::read,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        rows.into_iter().map(DeliveryRow::decode).collect()
    }

    async fn get_stats(&self, webhook_id: &str) -> FlexGateResult<DeliveryStats> {
        let conn = self.conn()?;
        let (total, successful, failed, pending, average_attempts, last): (
            i64,
            i64,
            i64,
            i64,
            Option<f64>,
            Option<String>,
        ) = conn.query_row(
            r#"SELECT COUNT(*),
                      COALESCE(SUM(status = 'success'), 0),
                      COALESCE(SUM(status = 'failed'), 0),
                      COALESCE(SUM(status = 'pending'), 0),
                      AVG(attempts),
                      MAX(COALESCE(delivered_at, created_at))
               FROM webhook_deliveries WHERE webhook_id = ?1"#,
            params![webhook_id],
            |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            },
        )?;

        let mut stmt = conn.prepare(
            "SELECT event_type, COUNT(*) FROM webhook_deliveries \
             WHERE webhook_id = ?1 GROUP BY event_type",
        )?;
        let by_event_type: HashMap<String, u64> = stmt
            .query_map(params![webhook_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<Result<_, _>>()?;

        Ok(DeliveryStats {
            total_deliveries: total as u64,
            successful_deliveries: successful as u64,
            failed_deliveries: failed as u64,
            pending_deliveries: pending as u64,
            average_attempts: average_attempts.unwrap_or(0.0),
            last_delivery_at: last.as_deref().map(parse_ts).transpose()?,
            by_event_type,
        })
    }

    async fn delete_older_than(&self, days: u32) -> FlexGateResult<usize> {
        let cutoff = format_ts(Utc::now() - Duration::days(i64::from(days)));
        let conn = self.conn()?;
        let deleted = conn.execute(
            "DELETE FROM webhook_deliveries WHERE created_at < ?1",
            params![cutoff],
        )?;
        tracing::debug!(deleted, days, "Purged old webhook deliveries");
        Ok(deleted)
    }

    async fn save_webhook(&self, webhook: &WebhookConfig) -> FlexGateResult<()> {
        let events = serde_json::to_string(&webhook.events)?;
        let retry_policy = serde_json::to_string(&webhook.retry_policy)?;
        let headers = serde_json::to_string(&webhook.headers)?;
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO webhooks ({}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                WEBHOOK_COLUMNS
            ),
            params![
                webhook.id,
                webhook.url,
                events,
                webhook.enabled as i64,
                webhook.secret,
                retry_policy,
                headers,
                webhook.timeout_ms as i64,
                format_ts(webhook.created_at),
                format_ts(webhook.updated_at),
            ],
        )?;
        Ok(())
    }

    async fn delete_webhook(&self, id: &str) -> FlexGateResult<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM webhooks WHERE id = ?1", params![id])?;
        Ok(())
    }

    async fn load_webhooks(&self) -> FlexGateResult<Vec<WebhookConfig>> {
        let rows = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM webhooks ORDER BY created_at ASC",
                WEBHOOK_COLUMNS
            ))?;
            let rows = stmt.query_map([], WebhookRow::read)?.collect::<Vec<_>>();
            rows
        };

        // One bad row must not hide the rest
        let mut webhooks = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded = row.map_err(FlexGateError::from).and_then(WebhookRow::decode);
            match decoded {
                Ok(webhook) => webhooks.push(webhook),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable persisted webhook"),
            }
        }
        Ok(webhooks)
    }
}

impl SqliteStore {
    /// Look up a single delivery by id
    pub fn get_delivery(&self, id: &str) -> FlexGateResult<Option<Delivery>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM webhook_deliveries WHERE id = ?1", DELIVERY_COLUMNS),
                params![id],
                DeliveryRow::read,
            )
            .optional()?;
        row.map(DeliveryRow::decode).transpose()
    }
}
