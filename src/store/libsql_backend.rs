//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inbox::model::{
    ClassificationResult, InboxItem, InboxStatus, RoutedEntity, RoutedKind,
};
use crate::records::{Artisan, Client, Expense, ExpenseInvoice, Job, JobStatus};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: Option<String>) -> Option<Uuid> {
    s.and_then(|s| Uuid::parse_str(&s).ok())
}

fn parse_optional_date(s: Option<String>) -> Option<NaiveDate> {
    s.and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok())
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn extracted_to_json(map: &serde_json::Map<String, serde_json::Value>) -> String {
    serde_json::Value::Object(map.clone()).to_string()
}

const INBOX_COLUMNS: &str = "id, artisan_id, source, source_sender, file_url, file_type, file_name, raw_text, classification, ai_summary, ai_extracted_data, confidence, status, error_message, routed_entity_kind, routed_entity_id, created_at, updated_at";

const CLIENT_COLUMNS: &str =
    "id, artisan_id, name, phone, email, address, notes, created_at, updated_at";

const JOB_COLUMNS: &str = "id, artisan_id, client_id, title, description, work_type, materials, urgency, notes, status, source_inbox_item_id, created_at";

const EXPENSE_INVOICE_COLUMNS: &str = "id, artisan_id, supplier_name, invoice_number, amount, issue_date, status, file_url, source_inbox_item_id, created_at";

const EXPENSE_COLUMNS: &str = "id, artisan_id, description, vendor, amount, expense_date, category, file_url, source_inbox_item_id, created_at";

/// Map a libsql Row to an InboxItem. Column order matches INBOX_COLUMNS.
fn row_to_inbox_item(row: &libsql::Row) -> Result<InboxItem, libsql::Error> {
    let id_str: String = row.get(0)?;
    let artisan_str: String = row.get(1)?;
    let source_str: String = row.get(2)?;
    let file_type_str: String = row.get(5)?;
    let classification_str: Option<String> = row.get::<String>(8).ok();
    let extracted_str: String = row.get::<String>(10).unwrap_or_else(|_| "{}".into());
    let confidence: Option<f64> = row.get::<f64>(11).ok();
    let status_str: String = row.get(12)?;
    let routed_kind: Option<String> = row.get::<String>(14).ok();
    let routed_id: Option<String> = row.get::<String>(15).ok();
    let created_str: String = row.get(16)?;
    let updated_str: String = row.get(17)?;

    let classification = classification_str.and_then(|s| s.parse().ok());
    let ai_extracted_data = match serde_json::from_str::<serde_json::Value>(&extracted_str) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    let routed_entity = match (routed_kind, parse_optional_uuid(routed_id)) {
        (Some(kind), Some(id)) => RoutedKind::from_str(&kind)
            .ok()
            .map(|kind| RoutedEntity { kind, id }),
        _ => None,
    };

    Ok(InboxItem {
        id: parse_uuid(&id_str),
        artisan_id: parse_uuid(&artisan_str),
        source: source_str
            .parse()
            .unwrap_or(crate::inbox::model::InboxSource::Manual),
        source_sender: row.get::<String>(3).ok(),
        file_url: row.get::<String>(4).ok(),
        file_type: file_type_str
            .parse()
            .unwrap_or(crate::inbox::model::FileType::Document),
        file_name: row.get::<String>(6).ok(),
        raw_text: row.get::<String>(7).ok(),
        confidence: classification.and(confidence.map(|c| c as f32)),
        classification,
        ai_summary: row.get::<String>(9).ok(),
        ai_extracted_data,
        status: status_str.parse().unwrap_or(InboxStatus::Error),
        error_message: row.get::<String>(13).ok(),
        routed_entity,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_client(row: &libsql::Row) -> Result<Client, libsql::Error> {
    let id_str: String = row.get(0)?;
    let artisan_str: String = row.get(1)?;
    let created_str: String = row.get(7)?;
    let updated_str: String = row.get(8)?;
    Ok(Client {
        id: parse_uuid(&id_str),
        artisan_id: parse_uuid(&artisan_str),
        name: row.get::<String>(2).ok(),
        phone: row.get::<String>(3).ok(),
        email: row.get::<String>(4).ok(),
        address: row.get::<String>(5).ok(),
        notes: row.get::<String>(6).ok(),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_job(row: &libsql::Row) -> Result<Job, libsql::Error> {
    let id_str: String = row.get(0)?;
    let artisan_str: String = row.get(1)?;
    let source_str: String = row.get(10)?;
    let created_str: String = row.get(11)?;
    Ok(Job {
        id: parse_uuid(&id_str),
        artisan_id: parse_uuid(&artisan_str),
        client_id: parse_optional_uuid(row.get::<String>(2).ok()),
        title: row.get(3)?,
        description: row.get::<String>(4).ok(),
        work_type: row.get::<String>(5).ok(),
        materials: row.get::<String>(6).ok(),
        urgency: row.get::<String>(7).ok(),
        notes: row.get::<String>(8).ok(),
        status: JobStatus::Draft,
        source_inbox_item_id: parse_uuid(&source_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_expense_invoice(row: &libsql::Row) -> Result<ExpenseInvoice, libsql::Error> {
    let id_str: String = row.get(0)?;
    let artisan_str: String = row.get(1)?;
    let source_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    Ok(ExpenseInvoice {
        id: parse_uuid(&id_str),
        artisan_id: parse_uuid(&artisan_str),
        supplier_name: row.get::<String>(2).ok(),
        invoice_number: row.get::<String>(3).ok(),
        amount: row
            .get::<String>(4)
            .ok()
            .and_then(|s| Decimal::from_str(&s).ok()),
        issue_date: parse_optional_date(row.get::<String>(5).ok()),
        status: row.get(6)?,
        file_url: row.get::<String>(7).ok(),
        source_inbox_item_id: parse_uuid(&source_str),
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_expense(row: &libsql::Row) -> Result<Expense, libsql::Error> {
    let id_str: String = row.get(0)?;
    let artisan_str: String = row.get(1)?;
    let amount_str: String = row.get(4)?;
    let source_str: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    Ok(Expense {
        id: parse_uuid(&id_str),
        artisan_id: parse_uuid(&artisan_str),
        description: row.get(2)?,
        vendor: row.get::<String>(3).ok(),
        amount: Decimal::from_str(&amount_str).unwrap_or(Decimal::ZERO),
        expense_date: parse_optional_date(row.get::<String>(5).ok()),
        category: row.get::<String>(6).ok(),
        file_url: row.get::<String>(7).ok(),
        source_inbox_item_id: parse_uuid(&source_str),
        created_at: parse_datetime(&created_str),
    })
}

/// Collect all rows of a query through a row mapper, skipping unparsable rows.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
    what: &str,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(value) => out.push(value),
            Err(e) => warn!("Skipping {what} row: {e}"),
        }
    }
    out
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Artisans ────────────────────────────────────────────────────

    async fn upsert_artisan(&self, artisan: &Artisan) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO artisans (id, name, trade, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name, trade = excluded.trade",
                params![
                    artisan.id.to_string(),
                    artisan.name.clone(),
                    artisan.trade.clone(),
                    artisan.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_artisan: {e}")))?;
        debug!(artisan_id = %artisan.id, "Artisan upserted");
        Ok(())
    }

    async fn get_artisan(&self, id: Uuid) -> Result<Option<Artisan>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, trade, created_at FROM artisans WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_artisan: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let parse = |row: &libsql::Row| -> Result<Artisan, libsql::Error> {
                    let id_str: String = row.get(0)?;
                    let created_str: String = row.get(3)?;
                    Ok(Artisan {
                        id: parse_uuid(&id_str),
                        name: row.get(1)?,
                        trade: row.get(2)?,
                        created_at: parse_datetime(&created_str),
                    })
                };
                parse(&row)
                    .map(Some)
                    .map_err(|e| DatabaseError::Query(format!("get_artisan row parse: {e}")))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_artisan: {e}"))),
        }
    }

    // ── Inbox items ─────────────────────────────────────────────────

    async fn insert_inbox_item(&self, item: &InboxItem) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO inbox_items ({INBOX_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
                ),
                params![
                    item.id.to_string(),
                    item.artisan_id.to_string(),
                    item.source.as_str(),
                    opt_text(item.source_sender.as_deref()),
                    opt_text(item.file_url.as_deref()),
                    item.file_type.as_str(),
                    opt_text(item.file_name.as_deref()),
                    opt_text(item.raw_text.as_deref()),
                    opt_text(item.classification.map(|c| c.as_str())),
                    opt_text(item.ai_summary.as_deref()),
                    extracted_to_json(&item.ai_extracted_data),
                    match item.confidence {
                        Some(c) => libsql::Value::Real(c as f64),
                        None => libsql::Value::Null,
                    },
                    item.status.as_str(),
                    opt_text(item.error_message.as_deref()),
                    opt_text(item.routed_entity.map(|e| e.kind.as_str())),
                    opt_text_owned(item.routed_entity.map(|e| e.id.to_string())),
                    item.created_at.to_rfc3339(),
                    item.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_inbox_item: {e}")))?;

        debug!(item_id = %item.id, artisan_id = %item.artisan_id, "Inbox item inserted");
        Ok(())
    }

    async fn get_inbox_item(&self, id: Uuid) -> Result<Option<InboxItem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {INBOX_COLUMNS} FROM inbox_items WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_inbox_item: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let item = row_to_inbox_item(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_inbox_item row parse: {e}")))?;
                Ok(Some(item))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_inbox_item: {e}"))),
        }
    }

    async fn list_inbox_items(
        &self,
        artisan_id: Uuid,
        limit: usize,
    ) -> Result<Vec<InboxItem>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {INBOX_COLUMNS} FROM inbox_items WHERE artisan_id = ?1
                     ORDER BY created_at DESC LIMIT ?2"
                ),
                params![artisan_id.to_string(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_inbox_items: {e}")))?;
        Ok(collect_rows(rows, row_to_inbox_item, "inbox item").await)
    }

    async fn transition_inbox_status(
        &self,
        id: Uuid,
        from: InboxStatus,
        to: InboxStatus,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(to) {
            warn!(item_id = %id, from = %from, to = %to, "Rejected invalid status transition");
            return Ok(false);
        }

        let clears_error = matches!(to, InboxStatus::New | InboxStatus::Classifying);
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE inbox_items
                 SET status = ?1,
                     error_message = CASE WHEN ?2 THEN NULL ELSE error_message END,
                     updated_at = ?3
                 WHERE id = ?4 AND status = ?5",
                params![
                    to.as_str(),
                    clears_error as i64,
                    now,
                    id.to_string(),
                    from.as_str()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("transition_inbox_status: {e}")))?;

        debug!(item_id = %id, from = %from, to = %to, moved = count > 0, "Status transition");
        Ok(count > 0)
    }

    async fn set_inbox_raw_text(&self, id: Uuid, raw_text: &str) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE inbox_items SET raw_text = ?1, updated_at = ?2 WHERE id = ?3",
                params![raw_text, now, id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_inbox_raw_text: {e}")))?;
        Ok(())
    }

    async fn save_classification(
        &self,
        id: Uuid,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE inbox_items
                 SET classification = ?1, ai_summary = ?2, ai_extracted_data = ?3,
                     confidence = ?4, status = 'classified', error_message = NULL,
                     updated_at = ?5
                 WHERE id = ?6 AND status = 'classifying'",
                params![
                    result.classification.as_str(),
                    result.summary.clone(),
                    extracted_to_json(&result.extracted_data),
                    result.confidence.clamp(0.0, 1.0) as f64,
                    now,
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_classification: {e}")))?;
        Ok(count > 0)
    }

    async fn mark_inbox_error(
        &self,
        id: Uuid,
        from: InboxStatus,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        if !from.can_transition_to(InboxStatus::Error) {
            warn!(item_id = %id, from = %from, "Rejected transition to error");
            return Ok(false);
        }
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE inbox_items SET status = 'error', error_message = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = ?4",
                params![message, now, id.to_string(), from.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_inbox_error: {e}")))?;
        Ok(count > 0)
    }

    async fn claim_for_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        force: bool,
    ) -> Result<bool, DatabaseError> {
        let sql = if force {
            "UPDATE inbox_items SET routing_claim = ?1
             WHERE id = ?2 AND routing_claim IS NULL AND status IN ('classified', 'routed')"
        } else {
            "UPDATE inbox_items SET routing_claim = ?1
             WHERE id = ?2 AND routing_claim IS NULL AND status = 'classified'"
        };
        let count = self
            .conn()
            .execute(sql, params![claim.to_string(), id.to_string()])
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_for_routing: {e}")))?;
        Ok(count > 0)
    }

    async fn complete_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        effective: Option<&ClassificationResult>,
        entity: Option<RoutedEntity>,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let kind = opt_text(entity.map(|e| e.kind.as_str()));
        let entity_id = opt_text_owned(entity.map(|e| e.id.to_string()));

        let count = match effective {
            Some(result) => self
                .conn()
                .execute(
                    "UPDATE inbox_items
                     SET status = 'routed', routed_entity_kind = ?1, routed_entity_id = ?2,
                         classification = ?3, ai_extracted_data = ?4,
                         error_message = NULL, routing_claim = NULL, updated_at = ?5
                     WHERE id = ?6 AND routing_claim = ?7",
                    params![
                        kind,
                        entity_id,
                        result.classification.as_str(),
                        extracted_to_json(&result.extracted_data),
                        now,
                        id.to_string(),
                        claim.to_string(),
                    ],
                )
                .await,
            None => self
                .conn()
                .execute(
                    "UPDATE inbox_items
                     SET status = 'routed', routed_entity_kind = ?1, routed_entity_id = ?2,
                         error_message = NULL, routing_claim = NULL, updated_at = ?3
                     WHERE id = ?4 AND routing_claim = ?5",
                    params![kind, entity_id, now, id.to_string(), claim.to_string()],
                )
                .await,
        }
        .map_err(|e| DatabaseError::Query(format!("complete_routing: {e}")))?;

        Ok(count > 0)
    }

    async fn fail_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE inbox_items
                 SET error_message = CASE WHEN status = 'classified' THEN ?1 ELSE error_message END,
                     status = CASE WHEN status = 'classified' THEN 'error' ELSE status END,
                     routing_claim = NULL, updated_at = ?2
                 WHERE id = ?3 AND routing_claim = ?4",
                params![message, now, id.to_string(), claim.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_routing: {e}")))?;
        Ok(count > 0)
    }

    async fn release_routing_claim(&self, id: Uuid, claim: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "UPDATE inbox_items SET routing_claim = NULL
                 WHERE id = ?1 AND routing_claim = ?2",
                params![id.to_string(), claim.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_routing_claim: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_inbox_item(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute(
                "DELETE FROM inbox_items WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_inbox_item: {e}")))?;
        Ok(count > 0)
    }

    // ── Clients ─────────────────────────────────────────────────────

    async fn find_client_by_contact(
        &self,
        artisan_id: Uuid,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<Client>, DatabaseError> {
        let phone = phone.map(str::trim).filter(|p| !p.is_empty());
        let email = email.map(str::trim).filter(|e| !e.is_empty());
        if phone.is_none() && email.is_none() {
            return Ok(None);
        }

        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients
                     WHERE artisan_id = ?1
                       AND ((?2 IS NOT NULL AND phone = ?2)
                         OR (?3 IS NOT NULL AND LOWER(email) = LOWER(?3)))
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![artisan_id.to_string(), opt_text(phone), opt_text(email)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_client_by_contact: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_client(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_client_by_contact row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("find_client_by_contact: {e}"))),
        }
    }

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_client: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_client(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_client row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_client: {e}"))),
        }
    }

    async fn insert_client(&self, client: &Client) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO clients ({CLIENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                params![
                    client.id.to_string(),
                    client.artisan_id.to_string(),
                    opt_text(client.name.as_deref()),
                    opt_text(client.phone.as_deref()),
                    opt_text(client.email.as_deref()),
                    opt_text(client.address.as_deref()),
                    opt_text(client.notes.as_deref()),
                    client.created_at.to_rfc3339(),
                    client.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_client: {e}")))?;
        debug!(client_id = %client.id, "Client inserted");
        Ok(())
    }

    async fn update_client(&self, client: &Client) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE clients SET name = ?1, phone = ?2, email = ?3, address = ?4, notes = ?5,
                     updated_at = ?6
                 WHERE id = ?7",
                params![
                    opt_text(client.name.as_deref()),
                    opt_text(client.phone.as_deref()),
                    opt_text(client.email.as_deref()),
                    opt_text(client.address.as_deref()),
                    opt_text(client.notes.as_deref()),
                    client.updated_at.to_rfc3339(),
                    client.id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_client: {e}")))?;
        debug!(client_id = %client.id, "Client updated");
        Ok(())
    }

    async fn list_clients(&self, artisan_id: Uuid) -> Result<Vec<Client>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {CLIENT_COLUMNS} FROM clients WHERE artisan_id = ?1 ORDER BY created_at ASC"
                ),
                params![artisan_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_clients: {e}")))?;
        Ok(collect_rows(rows, row_to_client, "client").await)
    }

    // ── Jobs, expense invoices, expenses ────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'draft', ?10, ?11)"
                ),
                params![
                    job.id.to_string(),
                    job.artisan_id.to_string(),
                    opt_text_owned(job.client_id.map(|id| id.to_string())),
                    job.title.clone(),
                    opt_text(job.description.as_deref()),
                    opt_text(job.work_type.as_deref()),
                    opt_text(job.materials.as_deref()),
                    opt_text(job.urgency.as_deref()),
                    opt_text(job.notes.as_deref()),
                    job.source_inbox_item_id.to_string(),
                    job.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_job: {e}")))?;
        debug!(job_id = %job.id, "Job inserted");
        Ok(())
    }

    async fn list_jobs(&self, artisan_id: Uuid) -> Result<Vec<Job>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE artisan_id = ?1 ORDER BY created_at ASC"
                ),
                params![artisan_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_jobs: {e}")))?;
        Ok(collect_rows(rows, row_to_job, "job").await)
    }

    async fn insert_expense_invoice(&self, invoice: &ExpenseInvoice) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO expense_invoices ({EXPENSE_INVOICE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    invoice.id.to_string(),
                    invoice.artisan_id.to_string(),
                    opt_text(invoice.supplier_name.as_deref()),
                    opt_text(invoice.invoice_number.as_deref()),
                    opt_text_owned(invoice.amount.map(|a| a.to_string())),
                    opt_text_owned(invoice.issue_date.map(|d| d.format("%Y-%m-%d").to_string())),
                    invoice.status.clone(),
                    opt_text(invoice.file_url.as_deref()),
                    invoice.source_inbox_item_id.to_string(),
                    invoice.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_expense_invoice: {e}")))?;
        debug!(invoice_id = %invoice.id, "Expense invoice inserted");
        Ok(())
    }

    async fn list_expense_invoices(
        &self,
        artisan_id: Uuid,
    ) -> Result<Vec<ExpenseInvoice>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXPENSE_INVOICE_COLUMNS} FROM expense_invoices
                     WHERE artisan_id = ?1 ORDER BY created_at ASC"
                ),
                params![artisan_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expense_invoices: {e}")))?;
        Ok(collect_rows(rows, row_to_expense_invoice, "expense invoice").await)
    }

    async fn insert_expense(&self, expense: &Expense) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO expenses ({EXPENSE_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    expense.id.to_string(),
                    expense.artisan_id.to_string(),
                    expense.description.clone(),
                    opt_text(expense.vendor.as_deref()),
                    expense.amount.to_string(),
                    opt_text_owned(expense.expense_date.map(|d| d.format("%Y-%m-%d").to_string())),
                    opt_text(expense.category.as_deref()),
                    opt_text(expense.file_url.as_deref()),
                    expense.source_inbox_item_id.to_string(),
                    expense.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_expense: {e}")))?;
        debug!(expense_id = %expense.id, "Expense inserted");
        Ok(())
    }

    async fn list_expenses(&self, artisan_id: Uuid) -> Result<Vec<Expense>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {EXPENSE_COLUMNS} FROM expenses WHERE artisan_id = ?1 ORDER BY created_at ASC"
                ),
                params![artisan_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_expenses: {e}")))?;
        Ok(collect_rows(rows, row_to_expense, "expense").await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::model::{Classification, FileType, InboxSource};
    use serde_json::json;

    async fn test_db() -> (LibSqlBackend, Uuid) {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let artisan = Artisan::new(Uuid::new_v4(), "Luca Bianchi", "piastrellista");
        db.upsert_artisan(&artisan).await.unwrap();
        (db, artisan.id)
    }

    fn make_item(artisan_id: Uuid) -> InboxItem {
        InboxItem::new(
            artisan_id,
            InboxSource::Whatsapp,
            FileType::Image,
            Some("http://localhost/files/a/1_0.jpg".into()),
        )
        .unwrap()
        .with_sender("+393331112222")
        .with_raw_text("foto del bagno")
    }

    fn make_result(summary: &str) -> ClassificationResult {
        let mut data = serde_json::Map::new();
        data.insert("work_type".into(), json!("piastrelle"));
        ClassificationResult {
            classification: Classification::Job,
            summary: summary.into(),
            confidence: 0.8,
            extracted_data: data,
        }
    }

    #[tokio::test]
    async fn artisan_roundtrip_and_upsert() {
        let (db, artisan_id) = test_db().await;
        let fetched = db.get_artisan(artisan_id).await.unwrap().unwrap();
        assert_eq!(fetched.trade, "piastrellista");

        let updated = Artisan::new(artisan_id, "Luca Bianchi", "idraulico");
        db.upsert_artisan(&updated).await.unwrap();
        assert_eq!(db.get_artisan(artisan_id).await.unwrap().unwrap().trade, "idraulico");

        assert!(db.get_artisan(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_and_get_item() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();

        let fetched = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, item.id);
        assert_eq!(fetched.status, InboxStatus::New);
        assert_eq!(fetched.source, InboxSource::Whatsapp);
        assert_eq!(fetched.file_type, FileType::Image);
        assert_eq!(fetched.source_sender.as_deref(), Some("+393331112222"));
        assert_eq!(fetched.raw_text.as_deref(), Some("foto del bagno"));
        assert!(fetched.classification.is_none());
        assert!(fetched.confidence.is_none());
        assert!(fetched.routed_entity.is_none());
    }

    #[tokio::test]
    async fn list_is_newest_first() {
        let (db, artisan_id) = test_db().await;
        let mut first = make_item(artisan_id);
        first.created_at = Utc::now() - chrono::Duration::minutes(5);
        let second = make_item(artisan_id);
        db.insert_inbox_item(&first).await.unwrap();
        db.insert_inbox_item(&second).await.unwrap();

        let items = db.list_inbox_items(artisan_id, 50).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, second.id);
        assert_eq!(items[1].id, first.id);
    }

    #[tokio::test]
    async fn claim_is_conditional() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();

        assert!(db
            .transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Classifying)
            .await
            .unwrap());
        // Second claim loses
        assert!(!db
            .transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Classifying)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn invalid_edges_are_rejected() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();

        assert!(!db
            .transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Routed)
            .await
            .unwrap());
        assert!(!db
            .mark_inbox_error(item.id, InboxStatus::New, "boom")
            .await
            .unwrap());
        let fetched = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InboxStatus::New);
    }

    #[tokio::test]
    async fn save_classification_requires_classifying() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();

        assert!(!db.save_classification(item.id, &make_result("x")).await.unwrap());

        db.transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Classifying)
            .await
            .unwrap();
        assert!(db.save_classification(item.id, &make_result("Rifacimento bagno")).await.unwrap());

        let fetched = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, InboxStatus::Classified);
        assert_eq!(fetched.classification, Some(Classification::Job));
        assert_eq!(fetched.ai_summary.as_deref(), Some("Rifacimento bagno"));
        assert!((fetched.confidence.unwrap() - 0.8).abs() < 0.001);
        assert_eq!(fetched.ai_extracted_data["work_type"], "piastrelle");
    }

    #[tokio::test]
    async fn retry_edge_clears_error_message() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();
        db.transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Classifying)
            .await
            .unwrap();
        assert!(db
            .mark_inbox_error(item.id, InboxStatus::Classifying, "invalid AI response")
            .await
            .unwrap());

        let errored = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(errored.status, InboxStatus::Error);
        assert_eq!(errored.error_message.as_deref(), Some("invalid AI response"));

        assert!(db
            .transition_inbox_status(item.id, InboxStatus::Error, InboxStatus::New)
            .await
            .unwrap());
        let reset = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(reset.status, InboxStatus::New);
        assert!(reset.error_message.is_none());
    }

    async fn classified_item(db: &LibSqlBackend, artisan_id: Uuid) -> InboxItem {
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();
        db.transition_inbox_status(item.id, InboxStatus::New, InboxStatus::Classifying)
            .await
            .unwrap();
        db.save_classification(item.id, &make_result("x")).await.unwrap();
        item
    }

    #[tokio::test]
    async fn routing_claim_is_exclusive() {
        let (db, artisan_id) = test_db().await;
        let item = classified_item(&db, artisan_id).await;

        let claim = Uuid::new_v4();
        assert!(db.claim_for_routing(item.id, claim, false).await.unwrap());
        assert!(!db.claim_for_routing(item.id, Uuid::new_v4(), false).await.unwrap());
        assert!(!db.claim_for_routing(item.id, Uuid::new_v4(), true).await.unwrap());

        let entity = RoutedEntity {
            kind: RoutedKind::Job,
            id: Uuid::new_v4(),
        };
        // Wrong claim token cannot complete
        assert!(!db.complete_routing(item.id, Uuid::new_v4(), None, Some(entity)).await.unwrap());
        assert!(db.complete_routing(item.id, claim, None, Some(entity)).await.unwrap());

        let routed = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(routed.status, InboxStatus::Routed);
        assert_eq!(routed.routed_entity, Some(entity));

        // Routed items need force
        assert!(!db.claim_for_routing(item.id, Uuid::new_v4(), false).await.unwrap());
        assert!(db.claim_for_routing(item.id, Uuid::new_v4(), true).await.unwrap());
    }

    #[tokio::test]
    async fn released_claim_allows_a_new_claim() {
        let (db, artisan_id) = test_db().await;
        let item = classified_item(&db, artisan_id).await;

        let claim = Uuid::new_v4();
        assert!(db.claim_for_routing(item.id, claim, false).await.unwrap());
        assert!(!db.release_routing_claim(item.id, Uuid::new_v4()).await.unwrap());
        assert!(db.release_routing_claim(item.id, claim).await.unwrap());

        let released = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(released.status, InboxStatus::Classified);
        assert!(db.claim_for_routing(item.id, Uuid::new_v4(), false).await.unwrap());
    }

    #[tokio::test]
    async fn failed_routing_keeps_classification() {
        let (db, artisan_id) = test_db().await;
        let item = classified_item(&db, artisan_id).await;

        let claim = Uuid::new_v4();
        db.claim_for_routing(item.id, claim, false).await.unwrap();
        assert!(db.fail_routing(item.id, claim, "insert failed").await.unwrap());

        let failed = db.get_inbox_item(item.id).await.unwrap().unwrap();
        assert_eq!(failed.status, InboxStatus::Error);
        assert_eq!(failed.error_message.as_deref(), Some("insert failed"));
        assert_eq!(failed.classification, Some(Classification::Job));
        assert!(failed.routed_entity.is_none());
    }

    #[tokio::test]
    async fn delete_item() {
        let (db, artisan_id) = test_db().await;
        let item = make_item(artisan_id);
        db.insert_inbox_item(&item).await.unwrap();
        assert!(db.delete_inbox_item(item.id).await.unwrap());
        assert!(!db.delete_inbox_item(item.id).await.unwrap());
        assert!(db.get_inbox_item(item.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn client_lookup_by_phone_or_email() {
        let (db, artisan_id) = test_db().await;
        let mut client = Client::new(artisan_id);
        client.phone = Some("+393331112222".into());
        client.email = Some("Mario@Rossi.it".into());
        db.insert_client(&client).await.unwrap();

        let by_phone = db
            .find_client_by_contact(artisan_id, Some("+393331112222"), None)
            .await
            .unwrap();
        assert_eq!(by_phone.map(|c| c.id), Some(client.id));

        let by_email = db
            .find_client_by_contact(artisan_id, None, Some("mario@rossi.it"))
            .await
            .unwrap();
        assert_eq!(by_email.map(|c| c.id), Some(client.id));

        let blank = db
            .find_client_by_contact(artisan_id, Some(""), Some("  "))
            .await
            .unwrap();
        assert!(blank.is_none());

        let other_artisan = db
            .find_client_by_contact(Uuid::new_v4(), Some("+393331112222"), None)
            .await
            .unwrap();
        assert!(other_artisan.is_none());
    }

    #[tokio::test]
    async fn downstream_records_roundtrip() {
        let (db, artisan_id) = test_db().await;
        let source = Uuid::new_v4();

        let job = Job {
            id: Uuid::new_v4(),
            artisan_id,
            client_id: None,
            title: "Rifacimento bagno".into(),
            description: None,
            work_type: Some("piastrelle".into()),
            materials: None,
            urgency: Some("alta".into()),
            notes: None,
            status: JobStatus::Draft,
            source_inbox_item_id: source,
            created_at: Utc::now(),
        };
        db.insert_job(&job).await.unwrap();
        assert_eq!(db.list_jobs(artisan_id).await.unwrap(), vec![job]);

        let expense = Expense {
            id: Uuid::new_v4(),
            artisan_id,
            description: "Colla per piastrelle".into(),
            vendor: Some("Brico".into()),
            amount: Decimal::new(2350, 2),
            expense_date: NaiveDate::from_ymd_opt(2026, 3, 14),
            category: None,
            file_url: None,
            source_inbox_item_id: source,
            created_at: Utc::now(),
        };
        db.insert_expense(&expense).await.unwrap();
        let expenses = db.list_expenses(artisan_id).await.unwrap();
        assert_eq!(expenses.len(), 1);
        assert_eq!(expenses[0].amount, Decimal::new(2350, 2));
        assert_eq!(expenses[0].expense_date, expense.expense_date);

        let invoice = ExpenseInvoice {
            id: Uuid::new_v4(),
            artisan_id,
            supplier_name: None,
            invoice_number: Some("FT-12".into()),
            amount: None,
            issue_date: None,
            status: "needs_review".into(),
            file_url: Some("http://localhost/files/x.pdf".into()),
            source_inbox_item_id: source,
            created_at: Utc::now(),
        };
        db.insert_expense_invoice(&invoice).await.unwrap();
        let invoices = db.list_expense_invoices(artisan_id).await.unwrap();
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].invoice_number.as_deref(), Some("FT-12"));
        assert!(invoices[0].amount.is_none());
    }
}
