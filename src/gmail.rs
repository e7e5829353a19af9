use crate::models;
use anyhow::{Context, Result};
use async_trait::async_trait;
use google_gmail1::Gmail;
use google_gmail1::api::{Label, LabelColor, ModifyMessageRequest};
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Per-call deadline; the hub exposes no request timeout of its own.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Chars kept from a message body when building a listing snapshot.
const BODY_EXCERPT_LEN: usize = 500;

/// The slice of the mail provider the labeling workflow consumes. Narrow on
/// purpose so tests can substitute a scripted gateway.
#[async_trait]
pub trait MailGateway: Send + Sync {
    async fn list_labels(&self) -> Result<Vec<models::Label>>;
    /// Create a user label with the given display name.
    async fn create_label(&self, name: &str) -> Result<models::Label>;
    /// Label ids currently on a message (minimal projection).
    async fn message_label_ids(&self, message_id: &str) -> Result<Vec<String>>;
    /// Add-only modify; never removes labels.
    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct GmailClient {
    hub: Gmail<HttpsConnector<HttpConnector>>,
}

impl GmailClient {
    pub fn new(hub: Gmail<HttpsConnector<HttpConnector>>) -> Self {
        Self { hub }
    }

    /// List recent messages matching `query` as display snapshots. Messages
    /// that fail to fetch are logged and skipped; the listing continues.
    pub async fn list_recent(
        &self,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<models::EmailSummary>> {
        let (_, list) = timeout(
            REQUEST_TIMEOUT,
            self.hub
                .users()
                .messages_list("me")
                .q(query)
                .max_results(max_results)
                .doit(),
        )
        .await
        .context("Timed out listing messages")?
        .context("Failed to list messages")?;

        let ids: Vec<String> = list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();
        debug!(count = ids.len(), query, "message listing fetched");

        let mut emails = Vec::with_capacity(ids.len());
        for id in ids {
            match self.fetch_summary(&id).await {
                Ok(summary) => emails.push(summary),
                Err(err) => warn!(%err, id, "skipping message that failed to fetch"),
            }
        }

        Ok(emails)
    }

    async fn fetch_summary(&self, id: &str) -> Result<models::EmailSummary> {
        let (_, msg) = timeout(
            REQUEST_TIMEOUT,
            self.hub
                .users()
                .messages_get("me", id)
                .format("full")
                .doit(),
        )
        .await
        .context("Timed out fetching message")?
        .with_context(|| format!("Failed to get message {id}"))?;

        let mut subject = None;
        let mut sender = None;
        if let Some(payload) = &msg.payload {
            if let Some(headers) = &payload.headers {
                for header in headers {
                    match header.name.as_deref() {
                        Some("Subject") => subject = header.value.clone(),
                        Some("From") => sender = header.value.clone(),
                        _ => {}
                    }
                }
            }
        }

        let body = msg
            .payload
            .as_ref()
            .and_then(|p| {
                extract_text_body(p, "text/plain")
                    .or_else(|| extract_text_body(p, "text/html").map(|h| strip_tags(&h)))
            })
            .unwrap_or_default();

        Ok(models::EmailSummary {
            id: msg.id.unwrap_or_else(|| id.to_owned()),
            subject: subject.unwrap_or_else(|| "(no subject)".to_owned()),
            sender: clean_sender(&sender.unwrap_or_else(|| "(unknown sender)".to_owned())),
            body: body.chars().take(BODY_EXCERPT_LEN).collect(),
            timestamp: msg.internal_date.unwrap_or(0),
        })
    }

    /// Total messages in the account, from the profile.
    pub async fn message_count(&self) -> Result<u64> {
        let (_, profile) = timeout(REQUEST_TIMEOUT, self.hub.users().get_profile("me").doit())
            .await
            .context("Timed out fetching profile")?
            .context("Failed to get profile")?;

        Ok(profile.messages_total.unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl MailGateway for GmailClient {
    async fn list_labels(&self) -> Result<Vec<models::Label>> {
        let (_, label_list) = timeout(REQUEST_TIMEOUT, self.hub.users().labels_list("me").doit())
            .await
            .context("Timed out listing labels")?
            .context("Failed to list labels")?;

        let labels = label_list
            .labels
            .unwrap_or_default()
            .into_iter()
            .filter(|l| l.id.is_some() && l.name.is_some())
            .map(|l| models::Label {
                id: l.id.unwrap_or_default(),
                name: l.name.unwrap_or_default(),
                label_type: l.type_.unwrap_or_default(),
            })
            .collect();

        Ok(labels)
    }

    async fn create_label(&self, name: &str) -> Result<models::Label> {
        let req = Label {
            name: Some(name.to_owned()),
            type_: Some("user".to_owned()),
            message_list_visibility: Some("show".to_owned()),
            label_list_visibility: Some("labelShow".to_owned()),
            color: Some(LabelColor {
                text_color: Some("#000000".to_owned()),
                background_color: Some("#ffad46".to_owned()),
            }),
            ..Default::default()
        };

        let (_, created) = timeout(REQUEST_TIMEOUT, self.hub.users().labels_create(req, "me").doit())
            .await
            .context("Timed out creating label")?
            .with_context(|| format!("Failed to create label {name}"))?;

        let id = created
            .id
            .with_context(|| format!("Created label {name} came back without an id"))?;

        Ok(models::Label {
            id,
            name: created.name.unwrap_or_else(|| name.to_owned()),
            label_type: created.type_.unwrap_or_else(|| "user".to_owned()),
        })
    }

    async fn message_label_ids(&self, message_id: &str) -> Result<Vec<String>> {
        let (_, msg) = timeout(
            REQUEST_TIMEOUT,
            self.hub
                .users()
                .messages_get("me", message_id)
                .format("minimal")
                .doit(),
        )
        .await
        .context("Timed out fetching message labels")?
        .with_context(|| format!("Failed to get message {message_id}"))?;

        Ok(msg.label_ids.unwrap_or_default())
    }

    async fn add_label(&self, message_id: &str, label_id: &str) -> Result<()> {
        let req = ModifyMessageRequest {
            add_label_ids: Some(vec![label_id.to_owned()]),
            remove_label_ids: Some(Vec::new()),
        };

        timeout(
            REQUEST_TIMEOUT,
            self.hub.users().messages_modify(req, "me", message_id).doit(),
        )
        .await
        .context("Timed out modifying message")?
        .with_context(|| format!("Failed to add label {label_id} to message {message_id}"))?;

        Ok(())
    }
}

/// Pull the first body of the given MIME type out of a message part tree.
/// Gmail serves bodies base64url-encoded; some proxies hand them back raw,
/// so decoding falls through to the bytes as-is.
fn extract_text_body(part: &google_gmail1::api::MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) {
        if let Some(data) = part.body.as_ref().and_then(|b| b.data.as_ref()) {
            use base64::{Engine as _, engine::general_purpose};
            let text = String::from_utf8_lossy(data);
            let decoded = general_purpose::URL_SAFE_NO_PAD
                .decode(text.trim())
                .or_else(|_| general_purpose::STANDARD.decode(text.trim()));
            return match decoded {
                Ok(bytes) => String::from_utf8(bytes).ok(),
                Err(_) => String::from_utf8(data.clone()).ok(),
            };
        }
    }

    for child in part.parts.as_deref().unwrap_or_default() {
        if let Some(body) = extract_text_body(child, mime_type) {
            if !body.is_empty() {
                return Some(body);
            }
        }
    }

    None
}

/// Drop HTML tags and collapse the remaining whitespace.
fn strip_tags(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(c),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reduce an RFC 5322 `Display Name <addr>` From header to the display name.
fn clean_sender(sender: &str) -> String {
    let trimmed = sender.trim();
    if let Some(open) = trimmed.find('<') {
        if trimmed.ends_with('>') {
            let name = trimmed[..open].trim().trim_matches('"').trim();
            if !name.is_empty() {
                return name.to_owned();
            }
        }
    }
    trimmed.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_sender_extracts_display_name() {
        assert_eq!(clean_sender("Jane Doe <jane@example.com>"), "Jane Doe");
        assert_eq!(clean_sender("\"Doe, Jane\" <jane@example.com>"), "Doe, Jane");
    }

    #[test]
    fn test_clean_sender_keeps_bare_addresses() {
        assert_eq!(clean_sender("jane@example.com"), "jane@example.com");
        assert_eq!(clean_sender("  <jane@example.com>"), "<jane@example.com>");
    }

    #[test]
    fn test_strip_tags_flattens_markup() {
        let input = "<div><p>Hello&nbsp;</p>\n<p>world</p></div>";
        assert_eq!(strip_tags(input), "Hello&nbsp; world");
    }

    #[test]
    fn test_strip_tags_plain_text_untouched() {
        assert_eq!(strip_tags("just text"), "just text");
    }
}
