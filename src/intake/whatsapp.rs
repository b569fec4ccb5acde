//! WhatsApp (Twilio) webhook fields.

use std::collections::HashMap;

use super::AttachmentSource;

/// A WhatsApp message reduced to what intake needs.
#[derive(Debug, Clone, Default)]
pub struct WhatsAppMessage {
    pub sender: Option<String>,
    pub body: Option<String>,
    /// Artisan id carried in the payload itself.
    pub artisan_hint: Option<String>,
    /// One entry per declared media index, in order.
    pub media: Vec<AttachmentSource>,
}

/// Flatten a JSON webhook body into the same string map a form body yields.
pub fn fields_from_json(value: &serde_json::Value) -> HashMap<String, String> {
    let Some(obj) = value.as_object() else {
        return HashMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| {
            let s = match v {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((k.clone(), s))
        })
        .collect()
}

/// Parse Twilio's `From` / `Body` / `NumMedia` / `MediaUrl{i}` fields.
///
/// `NumMedia` decides how many media entries exist; an index without a
/// `MediaUrl{i}` yields an entry with an empty URL, which fails at fetch time.
pub fn parse_fields(fields: &HashMap<String, String>) -> WhatsAppMessage {
    let get = |key: &str| {
        fields
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let count: usize = get("NumMedia").and_then(|n| n.parse().ok()).unwrap_or(0);
    let media = (0..count)
        .map(|i| AttachmentSource::Remote {
            url: get(&format!("MediaUrl{i}")).unwrap_or_default(),
            content_type: get(&format!("MediaContentType{i}")),
            file_name: None,
        })
        .collect();

    WhatsAppMessage {
        sender: get("From").map(|s| normalize_sender(&s)),
        body: fields
            .get("Body")
            .filter(|b| !b.trim().is_empty())
            .cloned(),
        artisan_hint: get("ArtisanId").or_else(|| get("artisan_id")),
        media,
    }
}

/// `"whatsapp:+39333..."` → `"+39333..."`.
fn normalize_sender(from: &str) -> String {
    from.strip_prefix("whatsapp:").unwrap_or(from).trim().to_string()
}
