//! Outbound message envelope, job envelope and header helpers.
//!
//! A [`Message`] is reduced to bytes right before transmission:
//!
//! | body          | bytes on the wire | default content type       |
//! |---------------|-------------------|----------------------------|
//! | `Body::Bytes` | unchanged         | `application/octet-stream` |
//! | `Body::Text`  | UTF-8             | `text/plain`               |
//! | `Body::Json`  | JSON              | `application/json`         |
//!
//! Headers use the AMQP field table of `amqprs` directly.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub use amqprs::{FieldName, FieldTable, FieldValue, LongStr};

use crate::error::Error;
use crate::Result;

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

pub const DELIVERY_MODE_TRANSIENT: u8 = 1;
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Header carrying the number of times a message has been retried.
pub const HEADER_RETRY_COUNT: &str = "x-retry-count";
/// Header carrying the routing key a retried message was first published with.
pub const HEADER_ORIGINAL_ROUTING_KEY: &str = "x-original-routing-key";
/// Header read by the delayed-message exchange plugin, in milliseconds.
pub const HEADER_DELAY: &str = "x-delay";
pub const HEADER_CORRELATION_ID: &str = "correlation-id";

/////////////////////////////////////////////////////////////////////////////
/// Payload of a [`Message`] before it is reduced to bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
}

impl Body {
    /// Serialize any value as a JSON body.
    pub fn json<T>(value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self::Json(serde_json::to_value(value)?))
    }

    pub fn default_content_type(&self) -> &'static str {
        match self {
            Body::Bytes(_) => CONTENT_TYPE_BINARY,
            Body::Text(_) => CONTENT_TYPE_TEXT,
            Body::Json(_) => CONTENT_TYPE_JSON,
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            Body::Bytes(bytes) => Ok(bytes.to_vec()),
            Body::Text(text) => Ok(text.into_bytes()),
            Body::Json(value) => Ok(serde_json::to_vec(&value)?),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(Bytes::from(v))
    }
}
impl From<Bytes> for Body {
    fn from(v: Bytes) -> Self {
        Body::Bytes(v)
    }
}
impl From<&[u8]> for Body {
    fn from(v: &[u8]) -> Self {
        Body::Bytes(Bytes::copy_from_slice(v))
    }
}
impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::Text(v)
    }
}
impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::Text(v.to_owned())
    }
}
impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        Body::Json(v)
    }
}

/////////////////////////////////////////////////////////////////////////////
/// Message properties as carried on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Properties {
    pub content_type: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
}

impl Properties {
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }
}

/////////////////////////////////////////////////////////////////////////////
/// A message to be published.
///
/// # Example
/// ```rust
/// use amqp_runtime::message::Message;
///
/// let message = Message::new("orders.created", "order #42")
///     .with_persistence(true)
///     .with_message_id("order-42")
///     .finish();
/// assert_eq!("orders.created", message.routing_key);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Body,
    pub routing_key: String,
    pub content_type: Option<String>,
    pub headers: Option<FieldTable>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    /// Seconds since the Unix epoch, stamped at publish time when absent.
    pub timestamp: Option<u64>,
    pub message_type: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
}

impl Message {
    pub fn new(routing_key: &str, body: impl Into<Body>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.to_owned(),
            content_type: None,
            headers: None,
            priority: None,
            expiration: None,
            message_id: None,
            timestamp: None,
            message_type: None,
            user_id: None,
            app_id: None,
            correlation_id: None,
            persistent: false,
        }
    }

    /// Persistent JSON message.
    pub fn json<T>(routing_key: &str, value: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self::new(routing_key, Body::json(value)?)
            .with_content_type(CONTENT_TYPE_JSON)
            .with_persistence(true)
            .finish())
    }

    pub fn with_content_type(&mut self, content_type: &str) -> &mut Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn with_headers(&mut self, headers: FieldTable) -> &mut Self {
        self.headers = Some(headers);
        self
    }

    /// Set one header, creating the table when needed.
    pub fn with_header(&mut self, key: &str, value: FieldValue) -> Result<&mut Self> {
        set_header(self.headers.get_or_insert_with(FieldTable::new), key, value)?;
        Ok(self)
    }

    pub fn with_priority(&mut self, priority: u8) -> &mut Self {
        self.priority = Some(priority);
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn with_expiration(&mut self, millis: u64) -> &mut Self {
        self.expiration = Some(millis.to_string());
        self
    }

    pub fn with_message_id(&mut self, id: &str) -> &mut Self {
        self.message_id = Some(id.to_owned());
        self
    }

    pub fn with_timestamp(&mut self, seconds: u64) -> &mut Self {
        self.timestamp = Some(seconds);
        self
    }

    pub fn with_message_type(&mut self, message_type: &str) -> &mut Self {
        self.message_type = Some(message_type.to_owned());
        self
    }

    pub fn with_user_id(&mut self, user_id: &str) -> &mut Self {
        self.user_id = Some(user_id.to_owned());
        self
    }

    pub fn with_app_id(&mut self, app_id: &str) -> &mut Self {
        self.app_id = Some(app_id.to_owned());
        self
    }

    pub fn with_correlation_id(&mut self, correlation_id: &str) -> &mut Self {
        self.correlation_id = Some(correlation_id.to_owned());
        self
    }

    pub fn with_persistence(&mut self, persistent: bool) -> &mut Self {
        self.persistent = persistent;
        self
    }

    pub fn finish(&mut self) -> Self {
        self.clone()
    }

    /// Reduce the message to wire bytes and properties.
    pub(crate) fn encode(self) -> Result<(Vec<u8>, Properties)> {
        let content_type = self
            .content_type
            .unwrap_or_else(|| self.body.default_content_type().to_owned());
        let timestamp = self.timestamp.unwrap_or_else(unix_timestamp);
        let delivery_mode = if self.persistent {
            DELIVERY_MODE_PERSISTENT
        } else {
            DELIVERY_MODE_TRANSIENT
        };
        let properties = Properties {
            content_type: Some(content_type),
            headers: self.headers,
            delivery_mode: Some(delivery_mode),
            priority: self.priority,
            correlation_id: self.correlation_id,
            expiration: self.expiration,
            message_id: self.message_id,
            timestamp: Some(timestamp),
            message_type: self.message_type,
            user_id: self.user_id,
            app_id: self.app_id,
        };
        Ok((self.body.into_bytes()?, properties))
    }
}

pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/////////////////////////////////////////////////////////////////////////////
/// Type-tagged envelope used to route work within one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Job {
    pub fn new<T>(kind: &str, payload: &T) -> Result<Self>
    where
        T: Serialize + ?Sized,
    {
        Ok(Self {
            kind: kind.to_owned(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/////////////////////////////////////////////////////////////////////////////
// header helpers

pub fn field_name(key: &str) -> Result<FieldName> {
    FieldName::try_from(key)
        .map_err(|_| Error::InvalidMessage(format!("header name too long: {}", key)))
}

/// String header value.
pub fn string_value(value: &str) -> Result<FieldValue> {
    LongStr::try_from(value)
        .map(FieldValue::S)
        .map_err(|_| Error::InvalidMessage("header value too long".to_string()))
}

pub fn set_header(headers: &mut FieldTable, key: &str, value: FieldValue) -> Result<()> {
    headers.insert(field_name(key)?, value);
    Ok(())
}

pub fn header<'a>(headers: Option<&'a FieldTable>, key: &str) -> Option<&'a FieldValue> {
    let name = field_name(key).ok()?;
    headers?.get(&name)
}

pub fn header_str<'a>(headers: Option<&'a FieldTable>, key: &str) -> Option<&'a str> {
    match header(headers, key)? {
        FieldValue::S(value) => {
            let value: &String = value.as_ref();
            Some(value.as_str())
        }
        _ => None,
    }
}

/// Integer header value, whatever integer width the publisher used.
pub fn header_int(headers: Option<&FieldTable>, key: &str) -> Option<i64> {
    match header(headers, key)? {
        FieldValue::b(v) => Some(*v as i64),
        FieldValue::B(v) => Some(*v as i64),
        FieldValue::s(v) => Some(*v as i64),
        FieldValue::u(v) => Some(*v as i64),
        FieldValue::I(v) => Some(*v as i64),
        FieldValue::i(v) => Some(*v as i64),
        FieldValue::l(v) => Some(*v),
        FieldValue::S(v) => AsRef::<String>::as_ref(v).parse().ok(),
        _ => None,
    }
}

/////////////////////////////////////////////////////////////////////////////
#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::{
        header_int, header_str, set_header, string_value, Body, FieldTable, FieldValue, Job,
        Message, CONTENT_TYPE_BINARY, CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT,
        DELIVERY_MODE_PERSISTENT, DELIVERY_MODE_TRANSIENT,
    };

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Email {
        to: String,
        subject: String,
    }

    #[test]
    fn test_body_reduction() {
        let (bytes, props) = Message::new("k", vec![0u8, 159, 146, 150]).encode().unwrap();
        assert_eq!(vec![0u8, 159, 146, 150], bytes);
        assert_eq!(Some(CONTENT_TYPE_BINARY), props.content_type.as_deref());

        let (bytes, props) = Message::new("k", "héllo").encode().unwrap();
        assert_eq!("héllo".as_bytes(), &bytes[..]);
        assert_eq!(Some(CONTENT_TYPE_TEXT), props.content_type.as_deref());
        assert_eq!(Some(DELIVERY_MODE_TRANSIENT), props.delivery_mode);

        let email = Email {
            to: "a@b.c".to_string(),
            subject: "hi".to_string(),
        };
        let (bytes, props) = Message::json("k", &email).unwrap().encode().unwrap();
        assert_eq!(Some(CONTENT_TYPE_JSON), props.content_type.as_deref());
        assert_eq!(Some(DELIVERY_MODE_PERSISTENT), props.delivery_mode);
        assert_eq!(email, serde_json::from_slice::<Email>(&bytes).unwrap());
    }

    #[test]
    fn test_explicit_content_type_and_timestamp_win() {
        let (_, props) = Message::new("k", Body::Text("<a/>".into()))
            .with_content_type("application/xml")
            .with_timestamp(1_700_000_000)
            .finish()
            .encode()
            .unwrap();
        assert_eq!(Some("application/xml"), props.content_type.as_deref());
        assert_eq!(Some(1_700_000_000), props.timestamp);

        let (_, props) = Message::new("k", "x").encode().unwrap();
        assert!(props.timestamp.unwrap() > 1_600_000_000);
    }

    #[test]
    fn test_job_envelope_format() {
        let job = Job::new("send_email", &serde_json::json!({"to": "x@y.z"})).unwrap();
        let text = serde_json::to_string(&job).unwrap();
        assert_eq!(r#"{"type":"send_email","payload":{"to":"x@y.z"}}"#, text);

        let back: Job = serde_json::from_str(r#"{"type":"noop"}"#).unwrap();
        assert_eq!("noop", back.kind);
        assert!(back.payload.is_null());
    }

    #[test]
    fn test_job_payload_decoding() {
        let email = Email {
            to: "a@b.c".to_string(),
            subject: "welcome".to_string(),
        };
        let job = Job::new("send_email", &email).unwrap();
        assert_eq!(email, job.payload_as::<Email>().unwrap());
        assert!(job.payload_as::<Vec<u8>>().is_err());
    }

    #[test]
    fn test_headers() {
        let mut headers = FieldTable::new();
        set_header(&mut headers, "x-retry-count", FieldValue::l(2)).unwrap();
        set_header(&mut headers, "x-small", FieldValue::I(7)).unwrap();
        set_header(&mut headers, "correlation-id", string_value("abc").unwrap()).unwrap();

        assert_eq!(Some(2), header_int(Some(&headers), "x-retry-count"));
        assert_eq!(Some(7), header_int(Some(&headers), "x-small"));
        assert_eq!(Some("abc"), header_str(Some(&headers), "correlation-id"));
        assert_eq!(None, header_str(Some(&headers), "x-retry-count"));
        assert_eq!(None, header_int(None, "x-retry-count"));

        let too_long = "k".repeat(300);
        assert!(set_header(&mut headers, &too_long, FieldValue::t(true)).is_err());
    }
}
