//! # Query Shapes
//!
//! Describes *what* a consumer asks for, independent of which source answers.
//!
//! ## Two Views of One Request
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       TradeFilter { Open, 50 }                          │
//! │                                │                                        │
//! │          ┌─────────────────────┼──────────────────────┐                 │
//! │          ▼                     ▼                      ▼                  │
//! │   cache_key()            params()               shape()                 │
//! │   "trades?limit=50       [("limit","50"),       collection: trades      │
//! │    &status=open"          ("status","open")]    is_open == true         │
//! │                          → primary GET          order timestamp desc    │
//! │                                                 limit 50                │
//! │                                                 → secondary read/listen │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Cache keys and shape keys are canonical: the same request always yields
//! the same key regardless of the order filters were added in.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::normalize::parse_timestamp;
use crate::types::{EntityKind, TradeStatus};

// =============================================================================
// Query Shape
// =============================================================================

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

/// Ordering clause.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality constraint on a document field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    pub field: String,
    pub value: Value,
}

/// A query against a live-store collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryShape {
    pub collection: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FieldFilter>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<OrderBy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryShape {
    /// Starts a query over a collection.
    pub fn collection(name: impl Into<String>) -> Self {
        QueryShape {
            collection: name.into(),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    /// Adds an equality filter.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(FieldFilter {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn order_by_desc(self, field: impl Into<String>) -> Self {
        self.order_by(field, Direction::Desc)
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Rejects shapes no store can answer.
    pub fn validate(&self) -> CoreResult<()> {
        if self.collection.trim().is_empty() {
            return Err(CoreError::InvalidQuery {
                reason: "collection is required".to_string(),
            });
        }
        if self.limit == Some(0) {
            return Err(CoreError::InvalidQuery {
                reason: "limit must be greater than 0".to_string(),
            });
        }
        if let Some(f) = self.filters.iter().find(|f| f.field.trim().is_empty()) {
            return Err(CoreError::InvalidQuery {
                reason: format!("filter on empty field (value {})", f.value),
            });
        }
        Ok(())
    }

    /// Canonical identity of the shape, used to deduplicate subscriptions.
    ///
    /// Filters are sorted, so `a==1,b==2` and `b==2,a==1` share a key.
    pub fn key(&self) -> String {
        let mut filters: Vec<String> = self
            .filters
            .iter()
            .map(|f| format!("{}=={}", f.field, f.value))
            .collect();
        filters.sort();

        let order = match &self.order_by {
            Some(o) => format!(
                "{}:{}",
                o.field,
                match o.direction {
                    Direction::Asc => "asc",
                    Direction::Desc => "desc",
                }
            ),
            None => "-".to_string(),
        };
        let limit = self
            .limit
            .map(|l| l.to_string())
            .unwrap_or_else(|| "-".to_string());

        format!("{}|{}|{}|{}", self.collection, filters.join(","), order, limit)
    }

    /// Returns true if a document satisfies every filter.
    pub fn matches(&self, doc: &Document) -> bool {
        self.filters
            .iter()
            .all(|f| doc.field(&f.field).is_some_and(|v| *v == f.value))
    }

    /// Evaluates the shape over an in-memory document set.
    pub fn apply<'a>(&self, docs: impl IntoIterator<Item = &'a Document>) -> Vec<Document> {
        let mut matched: Vec<Document> = docs
            .into_iter()
            .filter(|d| self.matches(d))
            .cloned()
            .collect();

        if let Some(order) = &self.order_by {
            matched.sort_by(|a, b| {
                let ord = compare_values(a.field(&order.field), b.field(&order.field));
                match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            matched.truncate(limit);
        }
        matched
    }
}

/// Orders two optional field values. Missing values sort first; timestamps
/// compare chronologically whatever their encoding.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => tx.cmp(&ty),
            _ => x.to_string().cmp(&y.to_string()),
        },
    }
}

// =============================================================================
// Document
// =============================================================================

/// A document returned by the live-query store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Document {
            id: id.into(),
            data,
        }
    }

    /// Reads a top-level field of the document body.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.data.as_object()?.get(name)
    }

    /// Flattens the document into a plain record; the document id fills in
    /// `id` when the body has none.
    pub fn into_record(self) -> Value {
        match self.data {
            Value::Object(mut obj) => {
                obj.entry("id").or_insert(Value::String(self.id));
                Value::Object(obj)
            }
            other => other,
        }
    }
}

/// Flattens a document set into a record array ready for normalization.
pub fn documents_to_records(docs: Vec<Document>) -> Value {
    Value::Array(docs.into_iter().map(Document::into_record).collect())
}

// =============================================================================
// Entity Queries
// =============================================================================

/// A typed request for one entity kind.
pub trait EntityQuery {
    /// Entity this query reads.
    const KIND: EntityKind;

    /// Query parameters for the request/response endpoint.
    fn params(&self) -> Vec<(&'static str, String)>;

    /// Equivalent live-store query.
    fn shape(&self) -> QueryShape;

    /// Canonical cache key: entity name plus sorted parameters.
    fn cache_key(&self) -> String {
        let mut params = self.params();
        if params.is_empty() {
            return Self::KIND.name().to_string();
        }
        params.sort();
        let joined: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{}?{}", Self::KIND.name(), joined.join("&"))
    }
}

/// Default page size for list queries.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Default lookback for performance history, in days.
pub const DEFAULT_LOOKBACK_DAYS: u32 = 30;

/// Latest account summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct AccountQuery;

impl EntityQuery for AccountQuery {
    const KIND: EntityKind = EntityKind::Account;

    fn params(&self) -> Vec<(&'static str, String)> {
        Vec::new()
    }

    fn shape(&self) -> QueryShape {
        QueryShape::collection(Self::KIND.collection())
            .order_by_desc("timestamp")
            .limit(1)
    }
}

/// Trades, optionally filtered by status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TradeFilter {
    pub status: Option<TradeStatus>,
    pub limit: usize,
}

impl Default for TradeFilter {
    fn default() -> Self {
        TradeFilter {
            status: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl TradeFilter {
    /// Open positions only.
    pub fn open() -> Self {
        TradeFilter {
            status: Some(TradeStatus::Open),
            ..Default::default()
        }
    }
}

impl EntityQuery for TradeFilter {
    const KIND: EntityKind = EntityKind::Trades;

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(status) = self.status {
            params.push(("status", status.as_str().to_string()));
        }
        params
    }

    fn shape(&self) -> QueryShape {
        let mut shape = QueryShape::collection(Self::KIND.collection());
        match self.status {
            Some(TradeStatus::Open) => shape = shape.where_eq("is_open", true),
            Some(TradeStatus::Closed) => shape = shape.where_eq("is_open", false),
            Some(TradeStatus::Unknown) | None => {}
        }
        shape.order_by_desc("timestamp").limit(self.limit)
    }
}

/// Correlation pairs, optionally only the actively traded ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CorrelationFilter {
    pub active_only: bool,
}

impl EntityQuery for CorrelationFilter {
    const KIND: EntityKind = EntityKind::CorrelationPairs;

    fn params(&self) -> Vec<(&'static str, String)> {
        if self.active_only {
            vec![("active", "true".to_string())]
        } else {
            Vec::new()
        }
    }

    fn shape(&self) -> QueryShape {
        let shape = QueryShape::collection(Self::KIND.collection());
        if self.active_only {
            shape.where_eq("is_active", true)
        } else {
            shape
        }
    }
}

/// Most recent bot events, optionally of one type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventFilter {
    pub event_type: Option<String>,
    pub limit: usize,
}

impl Default for EventFilter {
    fn default() -> Self {
        EventFilter {
            event_type: None,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl EventFilter {
    pub fn of_type(event_type: impl Into<String>, limit: usize) -> Self {
        EventFilter {
            event_type: Some(event_type.into()),
            limit,
        }
    }
}

impl EntityQuery for EventFilter {
    const KIND: EntityKind = EntityKind::Events;

    fn params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("limit", self.limit.to_string())];
        if let Some(ref t) = self.event_type {
            params.push(("type", t.clone()));
        }
        params
    }

    fn shape(&self) -> QueryShape {
        let mut shape = QueryShape::collection(Self::KIND.collection());
        if let Some(ref t) = self.event_type {
            shape = shape.where_eq("event_type", t.clone());
        }
        shape.order_by_desc("timestamp").limit(self.limit)
    }
}

/// Equity curve over a lookback window. The store keeps one sample per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PerformanceFilter {
    pub lookback_days: u32,
}

impl Default for PerformanceFilter {
    fn default() -> Self {
        PerformanceFilter {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
        }
    }
}

impl EntityQuery for PerformanceFilter {
    const KIND: EntityKind = EntityKind::Performance;

    fn params(&self) -> Vec<(&'static str, String)> {
        vec![("days", self.lookback_days.to_string())]
    }

    fn shape(&self) -> QueryShape {
        QueryShape::collection(Self::KIND.collection())
            .order_by_desc("timestamp")
            .limit(self.lookback_days.max(1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn docs() -> Vec<Document> {
        vec![
            Document::new("a", json!({ "is_open": true, "timestamp": 300 })),
            Document::new("b", json!({ "is_open": false, "timestamp": 200 })),
            Document::new("c", json!({ "is_open": true, "timestamp": "1970-01-01T00:01:40Z" })),
            Document::new("d", json!({ "is_open": true })),
        ]
    }

    #[test]
    fn test_shape_key_is_order_independent() {
        let a = QueryShape::collection("trades").where_eq("x", 1).where_eq("y", "z");
        let b = QueryShape::collection("trades").where_eq("y", "z").where_eq("x", 1);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), a.clone().limit(5).key());
    }

    #[test]
    fn test_apply_filters_orders_and_limits() {
        let shape = QueryShape::collection("trades")
            .where_eq("is_open", true)
            .order_by_desc("timestamp")
            .limit(2);
        let all = docs();
        let out = shape.apply(&all);
        let ids: Vec<_> = out.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn test_apply_missing_sort_field_sorts_first_ascending() {
        let shape = QueryShape::collection("trades").order_by("timestamp", Direction::Asc);
        let all = docs();
        let out = shape.apply(&all);
        assert_eq!(out[0].id, "d");
        assert_eq!(out[1].id, "c");
    }

    #[test]
    fn test_validate() {
        assert!(QueryShape::collection("trades").validate().is_ok());
        assert!(QueryShape::collection(" ").validate().is_err());
        assert!(QueryShape::collection("t").limit(0).validate().is_err());
    }

    #[test]
    fn test_document_into_record_keeps_body_id() {
        let rec = Document::new("doc-1", json!({ "symbol": "ETH" })).into_record();
        assert_eq!(rec["id"], "doc-1");

        let rec = Document::new("doc-1", json!({ "id": "t-9" })).into_record();
        assert_eq!(rec["id"], "t-9");
    }

    #[test]
    fn test_cache_keys_are_canonical() {
        assert_eq!(AccountQuery.cache_key(), "account");
        assert_eq!(TradeFilter::open().cache_key(), "trades?limit=100&status=open");
        assert_eq!(
            EventFilter::of_type("POSITION_SYNC", 5).cache_key(),
            "events?limit=5&type=POSITION_SYNC"
        );
        assert_ne!(
            CorrelationFilter { active_only: true }.cache_key(),
            CorrelationFilter::default().cache_key()
        );
    }

    #[test]
    fn test_trade_filter_shape_uses_boolean_flag() {
        let shape = TradeFilter::open().shape();
        assert_eq!(shape.collection, "trades");
        assert_eq!(shape.filters[0].field, "is_open");
        assert_eq!(shape.filters[0].value, json!(true));
        assert_eq!(shape.limit, Some(DEFAULT_PAGE_SIZE));
    }
}
