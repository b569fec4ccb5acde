//! Downstream domain records produced by routing — artisans, clients, jobs,
//! expense invoices, and expenses.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The account owning inbox items and every downstream record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artisan {
    pub id: Uuid,
    pub name: String,
    /// Trade description fed to the classifier ("idraulico", "elettricista", ...).
    pub trade: String,
    pub created_at: DateTime<Utc>,
}

impl Artisan {
    pub fn new(id: Uuid, name: impl Into<String>, trade: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            trade: trade.into(),
            created_at: Utc::now(),
        }
    }
}

/// A client profile. Empty strings are never stored; blank fields are `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: Uuid,
    pub artisan_id: Uuid,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Client {
    pub fn new(artisan_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            artisan_id,
            name: None,
            phone: None,
            email: None,
            address: None,
            notes: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fill every blank field from `other`, never touching a populated field
    /// and never writing a blank value. Returns whether anything changed.
    pub fn fill_blanks(&mut self, other: &ClientFields) -> bool {
        let mut changed = false;
        for (slot, value) in [
            (&mut self.name, &other.name),
            (&mut self.phone, &other.phone),
            (&mut self.email, &other.email),
            (&mut self.address, &other.address),
            (&mut self.notes, &other.notes),
        ] {
            let slot_blank = slot.as_deref().is_none_or(|s| s.trim().is_empty());
            if let Some(v) = value.as_deref().map(str::trim).filter(|v| !v.is_empty())
                && slot_blank
            {
                *slot = Some(v.to_string());
                changed = true;
            }
        }
        if changed {
            self.updated_at = Utc::now();
        }
        changed
    }
}

/// Client contact fields extracted from an inbox item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClientFields {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub notes: Option<String>,
}

impl ClientFields {
    /// Whether the fields carry a phone or email usable for matching.
    pub fn has_contact(&self) -> bool {
        self.phone.as_deref().is_some_and(|p| !p.trim().is_empty())
            || self.email.as_deref().is_some_and(|e| !e.trim().is_empty())
    }
}

/// Status of a job created from the inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Draft,
}

/// A draft job awaiting the artisan's review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub artisan_id: Uuid,
    pub client_id: Option<Uuid>,
    pub title: String,
    pub description: Option<String>,
    pub work_type: Option<String>,
    pub materials: Option<String>,
    pub urgency: Option<String>,
    pub notes: Option<String>,
    pub status: JobStatus,
    pub source_inbox_item_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Placeholder for a supplier invoice; the artisan completes it manually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpenseInvoice {
    pub id: Uuid,
    pub artisan_id: Uuid,
    pub supplier_name: Option<String>,
    pub invoice_number: Option<String>,
    pub amount: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    /// Always `needs_review` when created from the inbox.
    pub status: String,
    pub file_url: Option<String>,
    pub source_inbox_item_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A recorded expense (from a receipt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: Uuid,
    pub artisan_id: Uuid,
    pub description: String,
    pub vendor: Option<String>,
    pub amount: Decimal,
    pub expense_date: Option<NaiveDate>,
    pub category: Option<String>,
    pub file_url: Option<String>,
    pub source_inbox_item_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Parse a monetary amount from loosely formatted classifier output.
///
/// Accepts JSON numbers and strings like `"12,50"`, `"€ 1.234,50"` or
/// `"1,234.50 EUR"`. The last `.` or `,` is the decimal separator when it is
/// followed by one or two digits.
pub fn parse_amount(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        serde_json::Value::String(s) => parse_amount_str(s),
        _ => None,
    }
}

fn parse_amount_str(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let decimal_sep = cleaned.rfind(['.', ',']).filter(|&pos| {
        let tail = cleaned.len() - pos - 1;
        tail == 1 || tail == 2
    });

    let normalized: String = match decimal_sep {
        Some(pos) => cleaned
            .char_indices()
            .filter_map(|(i, c)| match c {
                '.' | ',' if i == pos => Some('.'),
                '.' | ',' => None,
                other => Some(other),
            })
            .collect(),
        None => cleaned.chars().filter(|c| *c != '.' && *c != ',').collect(),
    };

    Decimal::from_str(&normalized).ok()
}

/// Parse a date from classifier output (`YYYY-MM-DD` or `DD/MM/YYYY`).
pub fn parse_date(value: &serde_json::Value) -> Option<NaiveDate> {
    let s = value.as_str()?.trim();
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(s, "%d/%m/%Y"))
        .or_else(|_| NaiveDate::parse_from_str(s, "%d-%m-%Y"))
        .ok()
}
