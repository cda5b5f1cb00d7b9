//! # Normalization Module
//!
//! Maps heterogeneous source records into the canonical entity shapes.
//!
//! ## Resolution Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Field Resolution                                   │
//! │                                                                         │
//! │  REST aggregation endpoint         Live document store (legacy docs)   │
//! │  { "entry_price": "101.5" }        { "entryPrice": 101.5 }              │
//! │  { "price": "99" }                 { "avg_entry_price": "100" }         │
//! │           │                                  │                          │
//! │           └───────────────┬──────────────────┘                          │
//! │                           ▼                                             │
//! │          aliases, most specific first:                                 │
//! │          entry_price → entryPrice → avg_entry_price → price            │
//! │                           │                                             │
//! │                           ▼                                             │
//! │          first present, non-null, non-empty value wins                 │
//! │          nothing found → sentinel ("0", "unknown", epoch)              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Normalization is total: it never returns an error and never panics on
//! missing or mistyped optional data. Records that are not JSON objects are
//! skipped.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::types::{
    AccountSummary, BotEvent, CorrelationPair, EventLevel, PerformancePoint, Trade, TradeSide,
    TradeStatus, UNKNOWN, ZERO_AMOUNT,
};

/// Envelope keys a list response may wrap its rows in.
const ENVELOPE_KEYS: [&str; 4] = ["data", "items", "results", "rows"];

/// Epoch values above this are milliseconds, below are seconds.
const MILLIS_THRESHOLD: u64 = 100_000_000_000;

// =============================================================================
// Field Aliases
// =============================================================================

const ID: &[&str] = &["id", "_id", "doc_id"];
const TIMESTAMP: &[&str] = &[
    "timestamp",
    "updated_at",
    "updatedAt",
    "created_at",
    "createdAt",
    "time",
];

mod trade {
    pub const ID: &[&str] = &["id", "trade_id", "tradeId", "order_id", "orderId"];
    pub const SYMBOL: &[&str] = &["symbol", "ticker", "asset", "instrument"];
    pub const SIDE: &[&str] = &["side", "direction", "position_side", "positionSide"];
    pub const STATUS: &[&str] = &["status", "state"];
    pub const IS_OPEN: &[&str] = &["is_open", "isOpen", "open"];
    pub const ENTRY_PRICE: &[&str] = &["entry_price", "entryPrice", "avg_entry_price", "price"];
    pub const EXIT_PRICE: &[&str] = &["exit_price", "exitPrice", "close_price", "closePrice"];
    pub const QUANTITY: &[&str] = &["quantity", "qty", "size", "amount"];
    pub const PNL: &[&str] = &[
        "pnl",
        "realized_pnl",
        "realizedPnl",
        "unrealized_pnl",
        "unrealizedPnl",
        "profit",
    ];
    pub const PAIR_ID: &[&str] = &["pair_id", "pairId", "correlation_pair_id"];
    pub const OPENED_AT: &[&str] = &["opened_at", "openedAt", "entry_time", "open_time"];
    pub const CLOSED_AT: &[&str] = &["closed_at", "closedAt", "exit_time", "close_time"];
}

mod account {
    pub const ID: &[&str] = &["id", "account_id", "accountId"];
    pub const BALANCE: &[&str] = &[
        "balance",
        "wallet_balance",
        "walletBalance",
        "total_balance",
        "totalBalance",
    ];
    pub const EQUITY: &[&str] = &["equity", "total_equity", "totalEquity", "net_liquidation"];
    pub const AVAILABLE: &[&str] = &[
        "available_balance",
        "availableBalance",
        "free_balance",
        "available",
    ];
    pub const UNREALIZED: &[&str] = &[
        "unrealized_pnl",
        "unrealizedPnl",
        "unrealised_pnl",
        "upnl",
    ];
    pub const REALIZED: &[&str] = &["realized_pnl", "realizedPnl", "pnl"];
    pub const MARGIN: &[&str] = &["margin_used", "marginUsed", "used_margin", "margin"];
    pub const OPEN_POSITIONS: &[&str] = &[
        "open_positions",
        "openPositions",
        "position_count",
        "positions",
    ];
}

mod pair {
    pub const ID: &[&str] = &["id", "pair_id", "pairId"];
    pub const SYMBOL_A: &[&str] = &["symbol_a", "symbolA", "asset_a", "symbol1", "base"];
    pub const SYMBOL_B: &[&str] = &["symbol_b", "symbolB", "asset_b", "symbol2", "quote"];
    pub const CORRELATION: &[&str] = &["correlation", "correlation_coefficient", "corr"];
    pub const Z_SCORE: &[&str] = &["z_score", "zScore", "zscore"];
    pub const SPREAD: &[&str] = &["spread", "current_spread", "currentSpread"];
    pub const IS_ACTIVE: &[&str] = &["is_active", "isActive", "active", "enabled"];
}

mod event {
    pub const ID: &[&str] = &["id", "event_id", "eventId"];
    pub const TYPE: &[&str] = &["event_type", "eventType", "type"];
    pub const LEVEL: &[&str] = &["level", "severity"];
    pub const MESSAGE: &[&str] = &["message", "msg", "description"];
    pub const PAYLOAD: &[&str] = &["payload", "data", "details", "metadata"];
}

mod performance {
    pub const EQUITY: &[&str] = &["equity", "total_equity", "balance"];
    pub const PNL: &[&str] = &["pnl", "daily_pnl", "dailyPnl", "cumulative_pnl"];
    pub const DRAWDOWN: &[&str] = &["drawdown", "max_drawdown", "dd"];
}

// =============================================================================
// Record Extraction
// =============================================================================

/// Returns the object rows of a list response.
///
/// Accepts a bare array, an envelope (`{"data": [...]}` and friends) or a
/// single object. Anything else yields no rows.
pub fn records(value: &Value) -> Vec<&Map<String, Value>> {
    match value {
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        Value::Object(obj) => {
            for key in ENVELOPE_KEYS {
                if let Some(inner) = obj.get(key) {
                    if inner.is_array() || inner.is_object() {
                        return records(inner);
                    }
                }
            }
            vec![obj]
        }
        _ => Vec::new(),
    }
}

/// Returns the first object row of a response, if any.
pub fn first_record(value: &Value) -> Option<&Map<String, Value>> {
    records(value).into_iter().next()
}

// =============================================================================
// Field Readers
// =============================================================================

/// Looks up a possibly dotted path (`metrics.balance`).
fn lookup<'a>(obj: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = obj.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Returns the first alias whose value is present, non-null and non-empty.
pub fn field<'a>(obj: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    aliases.iter().find_map(|alias| match lookup(obj, alias)? {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        other => Some(other),
    })
}

/// Reads a decimal amount as a string, or `None` if no alias matched.
pub fn decimal_opt(obj: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    aliases.iter().find_map(|alias| match lookup(obj, alias)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Reads a decimal amount as a string, defaulting to `"0"`.
pub fn decimal(obj: &Map<String, Value>, aliases: &[&str]) -> String {
    decimal_opt(obj, aliases).unwrap_or_else(|| ZERO_AMOUNT.to_string())
}

/// Reads a string field, defaulting to `default`.
pub fn text(obj: &Map<String, Value>, aliases: &[&str], default: &str) -> String {
    aliases
        .iter()
        .find_map(|alias| match lookup(obj, alias)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_else(|| default.to_string())
}

/// Reads a floating point metric, defaulting to `0.0`.
pub fn float(obj: &Map<String, Value>, aliases: &[&str]) -> f64 {
    aliases
        .iter()
        .find_map(|alias| match lookup(obj, alias)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        })
        .filter(|v| v.is_finite())
        .unwrap_or(0.0)
}

/// Reads a boolean flag; accepts `true`, `"true"`, `1`, `"yes"`.
pub fn flag(obj: &Map<String, Value>, aliases: &[&str]) -> Option<bool> {
    aliases.iter().find_map(|alias| match lookup(obj, alias)? {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|v| v != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    })
}

/// Reads a timestamp from any of the encodings the backends use.
///
/// ## Accepted Encodings
/// - RFC 3339 string (`2024-05-01T12:00:00Z`)
/// - naive `YYYY-MM-DD HH:MM:SS[.f]` string, taken as UTC
/// - epoch number, seconds or milliseconds
/// - store timestamp object `{ "seconds": .., "nanos": .. }` (also
///   `_seconds` / `_nanoseconds`)
pub fn timestamp_opt(obj: &Map<String, Value>, aliases: &[&str]) -> Option<DateTime<Utc>> {
    aliases
        .iter()
        .find_map(|alias| lookup(obj, alias).and_then(parse_timestamp))
}

/// Reads a timestamp, defaulting to the Unix epoch.
pub fn timestamp(obj: &Map<String, Value>, aliases: &[&str]) -> DateTime<Utc> {
    timestamp_opt(obj, aliases).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Parses a single timestamp value.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(from_epoch)
        }
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_epoch),
        Value::Object(obj) => {
            let seconds = field(obj, &["seconds", "_seconds"])?.as_i64()?;
            let nanos = field(obj, &["nanos", "nanoseconds", "_nanoseconds"])
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Utc.timestamp_opt(seconds, u32::try_from(nanos).ok()?).single()
        }
        _ => None,
    }
}

fn from_epoch(raw: i64) -> Option<DateTime<Utc>> {
    if raw.unsigned_abs() >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(raw).single()
    } else {
        Utc.timestamp_opt(raw, 0).single()
    }
}

// =============================================================================
// Entity Normalizers
// =============================================================================

/// Normalizes one trade record.
///
/// ## Defaults
/// - `entry_price`: `entry_price` → `entryPrice` → `avg_entry_price` →
///   `price` → `"0"`
/// - `status`: explicit status, else the `is_open` flag, else `Unknown`
/// - `timestamp`: update/creation time, else `opened_at`, else epoch
pub fn normalize_trade(obj: &Map<String, Value>) -> Trade {
    let opened_at = timestamp_opt(obj, trade::OPENED_AT);

    let status = match field(obj, trade::STATUS).and_then(Value::as_str) {
        Some(raw) => TradeStatus::parse(raw),
        None => match flag(obj, trade::IS_OPEN) {
            Some(true) => TradeStatus::Open,
            Some(false) => TradeStatus::Closed,
            None => TradeStatus::Unknown,
        },
    };

    let side = field(obj, trade::SIDE)
        .and_then(Value::as_str)
        .map(TradeSide::parse)
        .unwrap_or_default();

    Trade {
        id: text(obj, trade::ID, UNKNOWN),
        symbol: text(obj, trade::SYMBOL, UNKNOWN),
        side,
        status,
        entry_price: decimal(obj, trade::ENTRY_PRICE),
        exit_price: decimal_opt(obj, trade::EXIT_PRICE),
        quantity: decimal(obj, trade::QUANTITY),
        pnl: decimal(obj, trade::PNL),
        pair_id: decimal_opt(obj, trade::PAIR_ID),
        opened_at,
        closed_at: timestamp_opt(obj, trade::CLOSED_AT),
        timestamp: timestamp_opt(obj, TIMESTAMP)
            .or(opened_at)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
    }
}

/// Normalizes an account summary.
///
/// `open_positions` accepts either a count or the list of positions.
pub fn normalize_account(obj: &Map<String, Value>) -> AccountSummary {
    let open_positions = match field(obj, account::OPEN_POSITIONS) {
        Some(Value::Array(items)) => items.len() as u32,
        Some(Value::Number(n)) => n.as_u64().map(|v| v.min(u32::MAX as u64) as u32).unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    };

    AccountSummary {
        id: text(obj, account::ID, UNKNOWN),
        balance: decimal(obj, account::BALANCE),
        equity: decimal(obj, account::EQUITY),
        available_balance: decimal(obj, account::AVAILABLE),
        unrealized_pnl: decimal(obj, account::UNREALIZED),
        realized_pnl: decimal(obj, account::REALIZED),
        margin_used: decimal(obj, account::MARGIN),
        open_positions,
        timestamp: timestamp(obj, TIMESTAMP),
    }
}

/// Normalizes a correlation pair.
///
/// A record without an id gets `"{symbol_a}/{symbol_b}"`.
pub fn normalize_correlation_pair(obj: &Map<String, Value>) -> CorrelationPair {
    let symbol_a = text(obj, pair::SYMBOL_A, UNKNOWN);
    let symbol_b = text(obj, pair::SYMBOL_B, UNKNOWN);
    let id = match field(obj, pair::ID) {
        Some(_) => text(obj, pair::ID, UNKNOWN),
        None => format!("{}/{}", symbol_a, symbol_b),
    };

    CorrelationPair {
        id,
        symbol_a,
        symbol_b,
        correlation: float(obj, pair::CORRELATION),
        z_score: float(obj, pair::Z_SCORE),
        spread: float(obj, pair::SPREAD),
        is_active: flag(obj, pair::IS_ACTIVE).unwrap_or(false),
        timestamp: timestamp(obj, TIMESTAMP),
    }
}

/// Normalizes a bot event.
pub fn normalize_event(obj: &Map<String, Value>) -> BotEvent {
    BotEvent {
        id: text(obj, event::ID, UNKNOWN),
        event_type: text(obj, event::TYPE, UNKNOWN),
        level: field(obj, event::LEVEL)
            .and_then(Value::as_str)
            .map(EventLevel::parse)
            .unwrap_or_default(),
        message: text(obj, event::MESSAGE, ""),
        payload: field(obj, event::PAYLOAD).cloned().unwrap_or(Value::Null),
        timestamp: timestamp(obj, TIMESTAMP),
    }
}

/// Normalizes one equity-curve sample. Without an id, the RFC 3339
/// timestamp identifies the sample.
pub fn normalize_performance_point(obj: &Map<String, Value>) -> PerformancePoint {
    let timestamp = timestamp(obj, TIMESTAMP);
    let id = match field(obj, ID) {
        Some(_) => text(obj, ID, UNKNOWN),
        None => timestamp.to_rfc3339(),
    };

    PerformancePoint {
        id,
        equity: decimal(obj, performance::EQUITY),
        pnl: decimal(obj, performance::PNL),
        drawdown: float(obj, performance::DRAWDOWN),
        timestamp,
    }
}

// =============================================================================
// Response Normalizers
// =============================================================================

/// Normalizes a trade list response.
pub fn trades(value: &Value) -> Vec<Trade> {
    records(value).into_iter().map(normalize_trade).collect()
}

/// Normalizes an account response. An empty response yields a summary made
/// entirely of sentinels.
pub fn account(value: &Value) -> AccountSummary {
    match first_record(value) {
        Some(obj) => normalize_account(obj),
        None => normalize_account(&Map::new()),
    }
}

/// Normalizes a correlation pair list response.
pub fn correlation_pairs(value: &Value) -> Vec<CorrelationPair> {
    records(value)
        .into_iter()
        .map(normalize_correlation_pair)
        .collect()
}

/// Normalizes an event list response.
pub fn events(value: &Value) -> Vec<BotEvent> {
    records(value).into_iter().map(normalize_event).collect()
}

/// Normalizes a performance history response, oldest sample first.
pub fn performance(value: &Value) -> Vec<PerformancePoint> {
    let mut points: Vec<_> = records(value)
        .into_iter()
        .map(normalize_performance_point)
        .collect();
    points.sort_by_key(|p| p.timestamp);
    points
}
