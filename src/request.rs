use crate::queue::QueueMessage;
use base64ct::{Base64, Encoding};
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::str::FromStr;
use thiserror::Error;

/// Body fields with a reserved meaning; everything else in the payload is
/// carried through as metadata.
const RESERVED_FIELDS: [&str; 7] = [
    "to",
    "subject",
    "content",
    "html",
    "text",
    "body",
    "contentType",
];

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("message body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("message body must be a JSON object")]
    NotAnObject,
    #[error("message has no recipient")]
    MissingRecipient,
    #[error("message has no content")]
    MissingContent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Html,
    Text,
}

impl ContentKind {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "html" | "text/html" => Some(Self::Html),
            "text" | "plain" | "text/plain" => Some(Self::Text),
            _ => None,
        }
    }
}

/// One email-send request, decoded from a queue message.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub recipient: String,
    pub subject: String,
    pub body: String,
    pub content_kind: ContentKind,
    pub metadata: Map<String, Value>,
    pub queue_message_id: String,
    pub receipt_token: String,
    pub fingerprint: String,
}

impl SendRequest {
    /// Decode a queue message. Attributes `to` and `subject` override body
    /// fields; content is taken from the first of `content`, `html`, `text`,
    /// `body` that is present.
    pub fn parse(message: &QueueMessage) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(&message.body)?;
        let Value::Object(body) = value else {
            return Err(ParseError::NotAnObject);
        };

        let field = |name: &str| body.get(name).and_then(Value::as_str);

        let recipient = message
            .attributes
            .get("to")
            .map(String::as_str)
            .or_else(|| field("to"))
            .ok_or(ParseError::MissingRecipient)?
            .to_owned();

        let subject = message
            .attributes
            .get("subject")
            .map(String::as_str)
            .or_else(|| field("subject"))
            .unwrap_or_default()
            .to_owned();

        let content = field("content")
            .or_else(|| field("html"))
            .or_else(|| field("text"))
            .or_else(|| field("body"))
            .ok_or(ParseError::MissingContent)?
            .to_owned();

        let content_kind = field("contentType")
            .and_then(ContentKind::parse)
            .unwrap_or(if body.contains_key("html") {
                ContentKind::Html
            } else {
                ContentKind::Text
            });

        let metadata: Map<String, Value> = body
            .into_iter()
            .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
            .collect();

        let fingerprint = fingerprint(&recipient, &subject, &content);

        Ok(Self {
            recipient,
            subject,
            body: content,
            content_kind,
            metadata,
            queue_message_id: message.message_id.clone(),
            receipt_token: message.receipt.clone(),
            fingerprint,
        })
    }

    /// Canonical queue body for this request, the inverse of [`Self::parse`].
    pub fn encode_body(&self) -> String {
        let mut body = Map::new();
        body.insert("to".to_owned(), Value::String(self.recipient.clone()));
        body.insert("subject".to_owned(), Value::String(self.subject.clone()));
        body.insert("content".to_owned(), Value::String(self.body.clone()));
        body.insert(
            "contentType".to_owned(),
            serde_json::to_value(self.content_kind).unwrap_or(Value::Null),
        );
        for (key, value) in &self.metadata {
            body.insert(key.clone(), value.clone());
        }

        Value::Object(body).to_string()
    }

    pub fn domain(&self) -> String {
        recipient_domain(&self.recipient)
    }
}

/// Lowercased host part of a recipient address. Malformed addresses map to
/// `"unknown"` so they still pass through the default rate limit.
pub fn recipient_domain(address: &str) -> String {
    EmailAddress::from_str(address)
        .map(|parsed| parsed.domain().to_lowercase())
        .unwrap_or_else(|_| "unknown".to_owned())
}

/// SHA-256 over `recipient ":" subject ":" first-100-chars(body)`, used for
/// idempotency keying only.
pub fn fingerprint(recipient: &str, subject: &str, body: &str) -> String {
    let head: String = body.chars().take(100).collect();

    let mut hasher = Sha256::new();
    hasher.update(recipient.as_bytes());
    hasher.update(b":");
    hasher.update(subject.as_bytes());
    hasher.update(b":");
    hasher.update(head.as_bytes());

    Base64::encode_string(&hasher.finalize())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn queue_message(body: &str, attributes: &[(&str, &str)]) -> QueueMessage {
        QueueMessage {
            message_id: "m-1".to_owned(),
            receipt: "r-1".to_owned(),
            body: body.to_owned(),
            attributes: attributes
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[test]
    fn parses_body_fields() {
        let message = queue_message(
            r#"{"to":"a@x.com","subject":"hi","content":"<p>hello</p>","contentType":"html"}"#,
            &[],
        );

        let request = SendRequest::parse(&message).unwrap();
        assert_eq!(request.recipient, "a@x.com");
        assert_eq!(request.subject, "hi");
        assert_eq!(request.body, "<p>hello</p>");
        assert_eq!(request.content_kind, ContentKind::Html);
        assert_eq!(request.queue_message_id, "m-1");
        assert_eq!(request.receipt_token, "r-1");
    }

    #[test]
    fn attributes_override_body_fields() {
        let message = queue_message(
            r#"{"to":"ignored@x.com","subject":"ignored","text":"hello"}"#,
            &[("to", "real@y.com"), ("subject", "real subject")],
        );

        let request = SendRequest::parse(&message).unwrap();
        assert_eq!(request.recipient, "real@y.com");
        assert_eq!(request.subject, "real subject");
        assert_eq!(request.content_kind, ContentKind::Text);
    }

    #[test]
    fn content_precedence_and_kind_inference() {
        let message = queue_message(
            r#"{"to":"a@x.com","html":"<b>h</b>","text":"t","body":"b"}"#,
            &[],
        );
        let request = SendRequest::parse(&message).unwrap();
        assert_eq!(request.body, "<b>h</b>");
        assert_eq!(request.content_kind, ContentKind::Html);

        let message = queue_message(r#"{"to":"a@x.com","body":"plain stuff"}"#, &[]);
        let request = SendRequest::parse(&message).unwrap();
        assert_eq!(request.body, "plain stuff");
        assert_eq!(request.content_kind, ContentKind::Text);
    }

    #[test]
    fn unknown_fields_land_in_metadata() {
        let message = queue_message(
            r#"{"to":"a@x.com","text":"hi","campaign":"spring","tags":[1,2]}"#,
            &[],
        );

        let request = SendRequest::parse(&message).unwrap();
        assert_eq!(request.metadata.len(), 2);
        assert_eq!(request.metadata["campaign"], "spring");
        assert_eq!(request.metadata["tags"], serde_json::json!([1, 2]));
    }

    #[test]
    fn malformed_payloads_fail() {
        assert!(matches!(
            SendRequest::parse(&queue_message("not json", &[])),
            Err(ParseError::InvalidJson(_))
        ));
        assert!(matches!(
            SendRequest::parse(&queue_message(r#""just a string""#, &[])),
            Err(ParseError::NotAnObject)
        ));
        assert!(matches!(
            SendRequest::parse(&queue_message(r#"{"subject":"x","text":"y"}"#, &[])),
            Err(ParseError::MissingRecipient)
        ));
        assert!(matches!(
            SendRequest::parse(&queue_message(r#"{"to":"a@x.com"}"#, &[])),
            Err(ParseError::MissingContent)
        ));
    }

    #[test]
    fn round_trip_preserves_fields() {
        let message = queue_message(
            r#"{"to":"a@x.com","subject":"hi","content":"hello","contentType":"text","campaign":"q3"}"#,
            &[],
        );
        let request = SendRequest::parse(&message).unwrap();

        let reparsed =
            SendRequest::parse(&queue_message(&request.encode_body(), &[])).unwrap();
        assert_eq!(reparsed.recipient, request.recipient);
        assert_eq!(reparsed.subject, request.subject);
        assert_eq!(reparsed.body, request.body);
        assert_eq!(reparsed.content_kind, request.content_kind);
        assert_eq!(reparsed.metadata, request.metadata);
        assert_eq!(reparsed.fingerprint, request.fingerprint);
    }

    #[test]
    fn domain_extraction() {
        assert_eq!(recipient_domain("User@GMAIL.com"), "gmail.com");
        assert_eq!(recipient_domain("no-at-sign"), "unknown");
        assert_eq!(recipient_domain(""), "unknown");
    }

    #[test]
    fn fingerprint_only_covers_first_100_chars() {
        let long_a = format!("{}{}", "a".repeat(100), "tail one");
        let long_b = format!("{}{}", "a".repeat(100), "different tail");

        assert_eq!(
            fingerprint("a@x.com", "s", &long_a),
            fingerprint("a@x.com", "s", &long_b)
        );
        assert_ne!(
            fingerprint("a@x.com", "s", "body"),
            fingerprint("b@x.com", "s", "body")
        );
    }
}
