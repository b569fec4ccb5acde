//! Email webhook payloads: structured JSON or a raw RFC 822 message.

use std::sync::LazyLock;

use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use serde::Deserialize;
use uuid::Uuid;

use super::AttachmentSource;

/// Body of `POST /webhooks/email`.
///
/// Either the structured fields are set, or `raw` carries the full message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EmailWebhook {
    #[serde(default, alias = "artisanId")]
    pub artisan_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default, deserialize_with = "one_or_many")]
    pub to: Vec<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<EmailAttachment>,
    #[serde(default)]
    pub raw: Option<String>,
}

/// An attachment the mail provider already hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailAttachment {
    pub url: String,
    #[serde(default, alias = "contentType")]
    pub content_type: Option<String>,
    #[serde(default, alias = "filename")]
    pub file_name: Option<String>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(s)) => s.split(',').map(|s| s.trim().to_string()).collect(),
        Some(OneOrMany::Many(v)) => v,
        None => Vec::new(),
    })
}

/// An email reduced to what intake needs.
#[derive(Debug, Clone, Default)]
pub struct ParsedEmail {
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    /// Subject plus the body with quoted replies removed.
    pub body_text: Option<String>,
    pub attachments: Vec<AttachmentSource>,
}

impl EmailWebhook {
    /// Normalize either payload shape. `None` when `raw` cannot be parsed.
    pub fn parse(&self) -> Option<ParsedEmail> {
        if let Some(raw) = self.raw.as_deref().filter(|r| !r.trim().is_empty()) {
            return parse_raw_email(raw);
        }

        let body = self
            .text
            .clone()
            .or_else(|| self.html.as_deref().map(strip_html))
            .unwrap_or_default();

        Some(ParsedEmail {
            sender: self.from.as_deref().map(bare_address),
            recipients: self.to.iter().map(|r| bare_address(r)).collect(),
            body_text: compose_body(self.subject.as_deref(), &body),
            attachments: self
                .attachments
                .iter()
                .map(|a| AttachmentSource::Remote {
                    url: a.url.clone(),
                    content_type: a.content_type.clone(),
                    file_name: a.file_name.clone(),
                })
                .collect(),
        })
    }
}

/// Parse a raw RFC 822 message, keeping attachments inline.
pub fn parse_raw_email(raw: &str) -> Option<ParsedEmail> {
    let parsed = MessageParser::default().parse(raw.as_bytes())?;

    let sender = parsed
        .from()
        .and_then(|addr| addr.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string());

    let body = if let Some(text) = parsed.body_text(0) {
        text.to_string()
    } else if let Some(html) = parsed.body_html(0) {
        strip_html(html.as_ref())
    } else {
        String::new()
    };

    let attachments = parsed
        .attachments()
        .map(|part| {
            let content_type = MimeHeaders::content_type(part).map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            });
            AttachmentSource::Inline {
                bytes: part.contents().to_vec(),
                content_type,
                file_name: MimeHeaders::attachment_name(part).map(str::to_string),
            }
        })
        .collect();

    Some(ParsedEmail {
        sender,
        recipients: extract_addresses(parsed.to()),
        body_text: compose_body(parsed.subject(), &body),
        attachments,
    })
}

fn compose_body(subject: Option<&str>, body: &str) -> Option<String> {
    let body = strip_quoted_text(body);
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    let text = match subject {
        Some(subject) if body.trim().is_empty() => subject.to_string(),
        Some(subject) => format!("{subject}\n\n{body}"),
        None => body,
    };
    (!text.trim().is_empty()).then_some(text)
}

/// `"Mario Rossi <mario@rossi.it>"` → `"mario@rossi.it"`.
fn bare_address(addr: &str) -> String {
    let addr = addr.trim();
    match (addr.rfind('<'), addr.rfind('>')) {
        (Some(start), Some(end)) if end > start => addr[start + 1..end].trim().to_string(),
        _ => addr.to_string(),
    }
}

/// `local+<tag>@domain`.
static PLUS_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@+\s]+\+([^@\s]+)@").expect("plus-tag pattern is valid"));

/// Reply attributions in English and Italian clients.
static ATTRIBUTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(on\s.+\swrote:|il\s.+\sha scritto:)$").expect("attribution pattern is valid")
});

/// Find an artisan id carried as a plus-address tag (`inbox+<uuid>@domain`).
pub fn plus_address_artisan(recipients: &[String]) -> Option<String> {
    recipients.iter().find_map(|r| {
        let tag = PLUS_TAG.captures(r.trim())?.get(1)?.as_str();
        Uuid::parse_str(tag).ok().map(|_| tag.to_string())
    })
}

/// Strip quoted text from an email body.
///
/// Removes `>` quoted lines and everything after an
/// "On ... wrote:" / "Il ... ha scritto:" attribution or an
/// "Original Message" separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut result = Vec::new();

    for line in body.lines() {
        let trimmed = line.trim();

        if trimmed.starts_with('>') {
            continue;
        }

        let attribution = ATTRIBUTION.is_match(trimmed);
        let separator = trimmed.starts_with("---")
            && (trimmed.contains("Original Message") || trimmed.contains("Messaggio originale"));
        if attribution || separator {
            break;
        }

        result.push(line);
    }

    while result.last().is_some_and(|l| l.trim().is_empty()) {
        result.pop();
    }

    result.join("\n")
}

/// Strip HTML tags and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                result.push(' ');
            }
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn extract_addresses(addr: Option<&mail_parser::Address>) -> Vec<String> {
    let Some(addr) = addr else {
        return Vec::new();
    };
    match addr {
        mail_parser::Address::List(addrs) => addrs
            .iter()
            .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            .collect(),
        mail_parser::Address::Group(groups) => groups
            .iter()
            .flat_map(|g| {
                g.addresses
                    .iter()
                    .filter_map(|a| a.address.as_ref().map(|s| s.to_string()))
            })
            .collect(),
    }
}
