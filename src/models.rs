//! Core data models used throughout the product search pipelines.
//!
//! These types represent the products, embeddings, queries and queue
//! messages that flow between ingestion, embedding and retrieval. They are
//! plain records: adapters persist them, pipelines pass them by value.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Timestamp format used in API responses and OpenSearch documents.
pub const DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Timestamp format used in queue message bodies (microsecond precision).
pub const QUEUE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// A product as ingested from the catalogue, before embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawProductDetails {
    pub product_id: String,
    pub name: String,
    pub main_category: String,
    pub sub_category: String,
    pub image_url: String,
    pub ratings: f64,
    pub discount_price: f64,
    pub actual_price: f64,
    #[serde(with = "date_format")]
    pub modified_date: NaiveDateTime,
    #[serde(with = "date_format")]
    pub created_date: NaiveDateTime,
}

/// The vector form of a product, keyed by the same `product_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedProductDetails {
    pub product_id: String,
    pub embedding: Vec<f32>,
    pub modified_date: NaiveDateTime,
    pub created_date: NaiveDateTime,
}

/// A free-text search query.
#[derive(Debug, Clone, PartialEq)]
pub struct RawQueryDetails {
    pub query: String,
    pub created_date: NaiveDateTime,
}

/// The vector form of a search query.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedQueryDetails {
    pub embedding: Vec<f32>,
    pub created_date: NaiveDateTime,
}

/// A nearest-neighbour hit: product id and cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarProduct {
    pub product_id: String,
    pub score: f64,
}

/// Queue message body announcing that a raw product changed.
///
/// Serialized as `{"product_id": "..", "modified_date": "YYYY-mm-dd HH:MM:SS.ffffff"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMessage {
    pub product_id: String,
    #[serde(with = "queue_date_format")]
    pub modified_date: NaiveDateTime,
}

impl From<&RawProductDetails> for ProductMessage {
    fn from(raw: &RawProductDetails) -> Self {
        Self {
            product_id: raw.product_id.clone(),
            modified_date: raw.modified_date,
        }
    }
}

/// Parse a timestamp in either queue (fractional) or plain format.
pub fn parse_date(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, QUEUE_DATE_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, DATE_FORMAT))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

/// Serde adapter for [`DATE_FORMAT`]. Deserialization also accepts the
/// fractional queue format.
pub mod date_format {
    use super::{parse_date, DATE_FORMAT};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(d)?;
        parse_date(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid date: {}", s)))
    }
}

/// Serde adapter for [`QUEUE_DATE_FORMAT`].
pub mod queue_date_format {
    use super::{parse_date, QUEUE_DATE_FORMAT};
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.format(QUEUE_DATE_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(d)?;
        parse_date(&s).ok_or_else(|| serde::de::Error::custom(format!("invalid date: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Timelike};

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_micro_opt(14, 5, 7, 120034)
            .unwrap()
    }

    #[test]
    fn test_product_message_body() {
        let msg = ProductMessage {
            product_id: "0000000042".to_string(),
            modified_date: ts(),
        };
        let body = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            body,
            r#"{"product_id":"0000000042","modified_date":"2024-03-09 14:05:07.120034"}"#
        );
    }

    #[test]
    fn test_product_message_accepts_plain_date() {
        let msg: ProductMessage =
            serde_json::from_str(r#"{"product_id":"1","modified_date":"2024-03-09 14:05:07"}"#)
                .unwrap();
        assert_eq!(msg.modified_date, ts().with_nanosecond(0).unwrap());
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("yesterday").is_none());
        assert!(parse_date("2024-03-09").is_none());
    }
}
