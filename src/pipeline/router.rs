//! Routing engine — turns a classified inbox item into a downstream record.
//!
//! | classification    | record                                   |
//! |-------------------|------------------------------------------|
//! | `job`             | draft `Job`, linked to a matching client |
//! | `invoice_passive` | `ExpenseInvoice` (`needs_review`)        |
//! | `client_info`     | new `Client` or blank-fill of a match    |
//! | `receipt`         | `Expense`                                |
//! | `other`           | nothing; item is acknowledged            |

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::RoutingError;
use crate::inbox::feed::InboxFeed;
use crate::inbox::model::{
    Classification, ClassificationResult, InboxItem, InboxSource, InboxStatus, RoutedEntity,
    RoutedKind,
};
use crate::records::{
    Client, ClientFields, Expense, ExpenseInvoice, Job, JobStatus, parse_amount, parse_date,
};
use crate::store::Database;

/// Longest job title derived from a summary.
const MAX_TITLE_CHARS: usize = 120;

/// Body of `POST /api/inbox/{id}/route`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RouteRequest {
    /// Overrides the stored classification.
    #[serde(default)]
    pub classification: Option<Classification>,
    /// Overrides the stored extracted data.
    #[serde(default)]
    pub extracted_data: Option<Map<String, Value>>,
    /// Re-route an already routed item.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingResult {
    pub item_id: Uuid,
    pub classification: Classification,
    /// `None` for `other`.
    pub routed_entity: Option<RoutedEntity>,
}

pub struct InboxRouter {
    db: Arc<dyn Database>,
    feed: Arc<InboxFeed>,
}

impl InboxRouter {
    pub fn new(db: Arc<dyn Database>, feed: Arc<InboxFeed>) -> Self {
        Self { db, feed }
    }

    /// Route one item. At most one pass per item runs at a time; the claim
    /// is released on success and on failure.
    pub async fn route(&self, id: Uuid, request: RouteRequest) -> Result<RoutingResult, RoutingError> {
        let item = self
            .db
            .get_inbox_item(id)
            .await?
            .ok_or(RoutingError::NotFound(id))?;

        match item.status {
            InboxStatus::Classified => {}
            InboxStatus::Routed if request.force => {}
            InboxStatus::Routed => return Err(RoutingError::AlreadyRouted(id)),
            status => return Err(RoutingError::InvalidState { id, status }),
        }

        let claim = Uuid::new_v4();
        if !self.db.claim_for_routing(id, claim, request.force).await? {
            return Err(self.claim_conflict(id, request.force).await?);
        }

        let outcome = self.route_claimed(&item, claim, request).await;
        if outcome.is_err() {
            // Completion and `fail_routing` drop the claim themselves; this
            // covers the paths where they errored or never ran.
            if let Err(e) = self.db.release_routing_claim(id, claim).await {
                warn!(item_id = %id, error = %e, "Failed to release routing claim");
            }
        }
        outcome
    }

    async fn route_claimed(
        &self,
        item: &InboxItem,
        claim: Uuid,
        request: RouteRequest,
    ) -> Result<RoutingResult, RoutingError> {
        let id = item.id;
        let overridden = request.classification.is_some() || request.extracted_data.is_some();
        let Some(effective) = effective_classification(item, request) else {
            self.abort(id, claim, "item has no classification").await;
            return Err(RoutingError::Unclassified(id));
        };

        match self.materialize(item, &effective).await {
            Ok(entity) => {
                let stored_override = overridden.then_some(&effective);
                if !self
                    .db
                    .complete_routing(id, claim, stored_override, entity)
                    .await?
                {
                    return Err(RoutingError::AlreadyRouting(id));
                }
                self.publish_current(id).await;
                info!(
                    item_id = %id,
                    classification = %effective.classification,
                    entity = ?entity,
                    "Inbox item routed"
                );
                Ok(RoutingResult {
                    item_id: id,
                    classification: effective.classification,
                    routed_entity: entity,
                })
            }
            Err(e) => {
                let message = e.to_string();
                error!(item_id = %id, error = %message, "Routing failed");
                self.abort(id, claim, &message).await;
                Err(e)
            }
        }
    }

    /// Record a failed pass on the item. Best effort: the original routing
    /// error is what the caller sees.
    async fn abort(&self, id: Uuid, claim: Uuid, message: &str) {
        if let Err(e) = self.db.fail_routing(id, claim, message).await {
            warn!(item_id = %id, error = %e, "Failed to record routing failure");
        }
        self.publish_current(id).await;
    }

    /// Explain why a claim was refused.
    async fn claim_conflict(&self, id: Uuid, force: bool) -> Result<RoutingError, RoutingError> {
        let current = self.db.get_inbox_item(id).await?;
        Ok(match current {
            None => RoutingError::NotFound(id),
            Some(item) if item.status == InboxStatus::Routed && !force => {
                RoutingError::AlreadyRouted(id)
            }
            Some(item) if matches!(item.status, InboxStatus::Classified | InboxStatus::Routed) => {
                RoutingError::AlreadyRouting(id)
            }
            Some(item) => RoutingError::InvalidState {
                id,
                status: item.status,
            },
        })
    }

    async fn materialize(
        &self,
        item: &InboxItem,
        effective: &ClassificationResult,
    ) -> Result<Option<RoutedEntity>, RoutingError> {
        let data = &effective.extracted_data;
        let entity = match effective.classification {
            Classification::Job => Some(self.create_job(item, effective).await?),
            Classification::InvoicePassive => Some(self.create_expense_invoice(item, data).await?),
            Classification::ClientInfo => Some(self.upsert_client(item, data).await?),
            Classification::Receipt => Some(self.create_expense(item, effective).await?),
            Classification::Other => None,
        };
        Ok(entity)
    }

    async fn create_job(
        &self,
        item: &InboxItem,
        effective: &ClassificationResult,
    ) -> Result<RoutedEntity, RoutingError> {
        let data = &effective.extracted_data;
        let (sender_phone, sender_email) = sender_contact(item);
        let phone = text_field(data, &["client_phone", "phone"]).or(sender_phone);
        let email = text_field(data, &["client_email", "email"]).or(sender_email);

        let client = self
            .db
            .find_client_by_contact(item.artisan_id, phone.as_deref(), email.as_deref())
            .await
            .map_err(downstream)?;

        let summary = non_blank(&effective.summary);
        let title = text_field(data, &["title", "work_type"])
            .or_else(|| summary.map(|s| s.chars().take(MAX_TITLE_CHARS).collect()))
            .unwrap_or_else(|| "Nuova richiesta di lavoro".to_string());

        let job = Job {
            id: Uuid::new_v4(),
            artisan_id: item.artisan_id,
            client_id: client.map(|c| c.id),
            title,
            description: text_field(data, &["description"])
                .or_else(|| summary.map(str::to_string))
                .or_else(|| item.raw_text.clone()),
            work_type: text_field(data, &["work_type"]),
            materials: text_field(data, &["materials"]),
            urgency: text_field(data, &["urgency"]),
            notes: text_field(data, &["notes"]),
            status: JobStatus::Draft,
            source_inbox_item_id: item.id,
            created_at: Utc::now(),
        };
        self.db.insert_job(&job).await.map_err(downstream)?;
        Ok(RoutedEntity {
            kind: RoutedKind::Job,
            id: job.id,
        })
    }

    async fn create_expense_invoice(
        &self,
        item: &InboxItem,
        data: &Map<String, Value>,
    ) -> Result<RoutedEntity, RoutingError> {
        let invoice = ExpenseInvoice {
            id: Uuid::new_v4(),
            artisan_id: item.artisan_id,
            supplier_name: text_field(data, &["supplier_name", "supplier", "vendor"]),
            invoice_number: text_field(data, &["invoice_number", "number"]),
            amount: amount_field(data, &["amount", "total"]),
            issue_date: date_field(data, &["issue_date", "date"]),
            status: "needs_review".to_string(),
            file_url: item.file_url.clone(),
            source_inbox_item_id: item.id,
            created_at: Utc::now(),
        };
        self.db
            .insert_expense_invoice(&invoice)
            .await
            .map_err(downstream)?;
        Ok(RoutedEntity {
            kind: RoutedKind::ExpenseInvoice,
            id: invoice.id,
        })
    }

    /// Match by exact phone/email; fill blanks of a match, otherwise insert.
    async fn upsert_client(
        &self,
        item: &InboxItem,
        data: &Map<String, Value>,
    ) -> Result<RoutedEntity, RoutingError> {
        let fields = ClientFields {
            name: text_field(data, &["name", "client_name"]),
            phone: text_field(data, &["phone", "client_phone"]),
            email: text_field(data, &["email", "client_email"]),
            address: text_field(data, &["address"]),
            notes: text_field(data, &["notes"]),
        };

        if fields.has_contact()
            && let Some(mut existing) = self
                .db
                .find_client_by_contact(
                    item.artisan_id,
                    fields.phone.as_deref(),
                    fields.email.as_deref(),
                )
                .await
                .map_err(downstream)?
        {
            if existing.fill_blanks(&fields) {
                self.db.update_client(&existing).await.map_err(downstream)?;
            }
            return Ok(RoutedEntity {
                kind: RoutedKind::Client,
                id: existing.id,
            });
        }

        let mut client = Client::new(item.artisan_id);
        if !client.fill_blanks(&fields) {
            return Err(RoutingError::Downstream(
                "no client details were extracted".to_string(),
            ));
        }
        self.db.insert_client(&client).await.map_err(downstream)?;
        Ok(RoutedEntity {
            kind: RoutedKind::Client,
            id: client.id,
        })
    }

    async fn create_expense(
        &self,
        item: &InboxItem,
        effective: &ClassificationResult,
    ) -> Result<RoutedEntity, RoutingError> {
        let data = &effective.extracted_data;
        let expense = Expense {
            id: Uuid::new_v4(),
            artisan_id: item.artisan_id,
            description: text_field(data, &["description"])
                .or_else(|| non_blank(&effective.summary).map(str::to_string))
                .unwrap_or_else(|| "Spesa".to_string()),
            vendor: text_field(data, &["vendor", "supplier_name", "merchant"]),
            amount: amount_field(data, &["amount", "total"]).unwrap_or(Decimal::ZERO),
            expense_date: date_field(data, &["date", "expense_date"]),
            category: text_field(data, &["category"]),
            file_url: item.file_url.clone(),
            source_inbox_item_id: item.id,
            created_at: Utc::now(),
        };
        self.db.insert_expense(&expense).await.map_err(downstream)?;
        Ok(RoutedEntity {
            kind: RoutedKind::Expense,
            id: expense.id,
        })
    }

    async fn publish_current(&self, id: Uuid) {
        match self.db.get_inbox_item(id).await {
            Ok(Some(item)) => self.feed.publish_update(&item),
            Ok(None) => {}
            Err(e) => warn!(item_id = %id, error = %e, "Failed to reload item for feed"),
        }
    }
}

/// Stored classification with the request's overrides applied.
///
/// An overriding classification brings its own data: extracted fields are
/// taken from the request (empty when absent), never from the AI output.
fn effective_classification(
    item: &InboxItem,
    request: RouteRequest,
) -> Option<ClassificationResult> {
    let (classification, extracted_data) = match request.classification {
        Some(classification) => (classification, request.extracted_data.unwrap_or_default()),
        None => (
            item.classification?,
            request
                .extracted_data
                .unwrap_or_else(|| item.ai_extracted_data.clone()),
        ),
    };
    Some(ClassificationResult {
        classification,
        summary: item.ai_summary.clone().unwrap_or_default(),
        confidence: item.confidence.unwrap_or(0.0),
        extracted_data,
    })
}

fn downstream(e: crate::error::DatabaseError) -> RoutingError {
    RoutingError::Downstream(e.to_string())
}

fn non_blank(s: &str) -> Option<&str> {
    let s = s.trim();
    (!s.is_empty()).then_some(s)
}

/// The item's sender as a phone (WhatsApp) or email (email) candidate.
fn sender_contact(item: &InboxItem) -> (Option<String>, Option<String>) {
    let sender = item.source_sender.clone();
    match item.source {
        InboxSource::Whatsapp => (sender, None),
        InboxSource::Email => (None, sender),
        InboxSource::Manual => (None, None),
    }
}

/// First non-blank value among `keys`. Numbers and string arrays are
/// rendered as text.
fn text_field(data: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        let text = match data.get(*key)? {
            Value::String(s) => s.trim().to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(values) => values
                .iter()
                .filter_map(|v| v.as_str().map(str::trim))
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(", "),
            _ => return None,
        };
        (!text.is_empty()).then_some(text)
    })
}

fn amount_field(data: &Map<String, Value>, keys: &[&str]) -> Option<Decimal> {
    keys.iter().find_map(|key| data.get(*key).and_then(parse_amount))
}

fn date_field(data: &Map<String, Value>, keys: &[&str]) -> Option<chrono::NaiveDate> {
    keys.iter().find_map(|key| data.get(*key).and_then(parse_date))
}
