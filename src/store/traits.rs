//! Unified `Database` trait — single async interface for all persistence.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::inbox::model::{ClassificationResult, InboxItem, InboxStatus, RoutedEntity};
use crate::records::{Artisan, Client, Expense, ExpenseInvoice, Job};

/// Backend-agnostic database trait covering inbox items and downstream records.
///
/// Every inbox status change is a conditional update on the expected current
/// status; the `bool` results report whether the row actually moved.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Artisans ────────────────────────────────────────────────────

    /// Insert or update an artisan.
    async fn upsert_artisan(&self, artisan: &Artisan) -> Result<(), DatabaseError>;

    async fn get_artisan(&self, id: Uuid) -> Result<Option<Artisan>, DatabaseError>;

    // ── Inbox items ─────────────────────────────────────────────────

    async fn insert_inbox_item(&self, item: &InboxItem) -> Result<(), DatabaseError>;

    async fn get_inbox_item(&self, id: Uuid) -> Result<Option<InboxItem>, DatabaseError>;

    /// Items of one artisan, newest first, up to `limit`.
    async fn list_inbox_items(
        &self,
        artisan_id: Uuid,
        limit: usize,
    ) -> Result<Vec<InboxItem>, DatabaseError>;

    /// Move an item `from → to` iff it is currently `from`.
    ///
    /// Rejects edges outside the lifecycle. Entering `new` or `classifying`
    /// clears the error message.
    async fn transition_inbox_status(
        &self,
        id: Uuid,
        from: InboxStatus,
        to: InboxStatus,
    ) -> Result<bool, DatabaseError>;

    /// Replace the item's raw text (used for audio transcripts).
    async fn set_inbox_raw_text(&self, id: Uuid, raw_text: &str) -> Result<(), DatabaseError>;

    /// Overwrite all classification fields and move `classifying → classified`.
    async fn save_classification(
        &self,
        id: Uuid,
        result: &ClassificationResult,
    ) -> Result<bool, DatabaseError>;

    /// Move the item from `from` to `error` with a message.
    async fn mark_inbox_error(
        &self,
        id: Uuid,
        from: InboxStatus,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Claim an item for one routing pass.
    ///
    /// Succeeds only for an unclaimed `classified` item, or an unclaimed
    /// `routed` item when `force` is set.
    async fn claim_for_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        force: bool,
    ) -> Result<bool, DatabaseError>;

    /// Finish a claimed routing pass: status `routed`, entity reference set,
    /// claim released. `effective` (when given) replaces the stored
    /// classification fields.
    async fn complete_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        effective: Option<&ClassificationResult>,
        entity: Option<RoutedEntity>,
    ) -> Result<bool, DatabaseError>;

    /// Abort a claimed routing pass. A `classified` item moves to `error`
    /// (classification kept); a force-rerouted `routed` item stays routed.
    async fn fail_routing(
        &self,
        id: Uuid,
        claim: Uuid,
        message: &str,
    ) -> Result<bool, DatabaseError>;

    /// Drop a routing claim without touching status or routing fields.
    async fn release_routing_claim(&self, id: Uuid, claim: Uuid) -> Result<bool, DatabaseError>;

    async fn delete_inbox_item(&self, id: Uuid) -> Result<bool, DatabaseError>;

    // ── Clients ─────────────────────────────────────────────────────

    /// Find a client of `artisan_id` whose phone or email exactly matches.
    /// Emails compare case-insensitively; blank inputs never match.
    async fn find_client_by_contact(
        &self,
        artisan_id: Uuid,
        phone: Option<&str>,
        email: Option<&str>,
    ) -> Result<Option<Client>, DatabaseError>;

    async fn get_client(&self, id: Uuid) -> Result<Option<Client>, DatabaseError>;

    async fn insert_client(&self, client: &Client) -> Result<(), DatabaseError>;

    async fn update_client(&self, client: &Client) -> Result<(), DatabaseError>;

    async fn list_clients(&self, artisan_id: Uuid) -> Result<Vec<Client>, DatabaseError>;

    // ── Jobs, expense invoices, expenses ────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    async fn list_jobs(&self, artisan_id: Uuid) -> Result<Vec<Job>, DatabaseError>;

    async fn insert_expense_invoice(&self, invoice: &ExpenseInvoice) -> Result<(), DatabaseError>;

    async fn list_expense_invoices(
        &self,
        artisan_id: Uuid,
    ) -> Result<Vec<ExpenseInvoice>, DatabaseError>;

    async fn insert_expense(&self, expense: &Expense) -> Result<(), DatabaseError>;

    async fn list_expenses(&self, artisan_id: Uuid) -> Result<Vec<Expense>, DatabaseError>;
}
