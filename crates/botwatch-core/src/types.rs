//! # Domain Types
//!
//! Canonical entity shapes shared by every data source.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ AccountSummary  │   │      Trade      │   │ CorrelationPair │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  balance        │   │  symbol, side   │   │  symbol_a/b     │       │
//! │  │  equity         │   │  entry_price    │   │  correlation    │       │
//! │  │  unrealized_pnl │   │  status         │   │  z_score        │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │    BotEvent     │   │PerformancePoint │   │   EntityKind    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  event_type     │   │  equity         │   │  cache prefix   │       │
//! │  │  level, message │   │  pnl, drawdown  │   │  collection     │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Decimal Amounts
//! Prices, balances and PnL are carried as decimal strings exactly as the
//! backend reported them. The dashboard formats them; this layer never does
//! float arithmetic on money. A missing amount is the sentinel `"0"`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

/// Sentinel for a missing decimal amount.
pub const ZERO_AMOUNT: &str = "0";

/// Sentinel for a missing identifier or label.
pub const UNKNOWN: &str = "unknown";

// =============================================================================
// Entity Trait
// =============================================================================

/// Behaviour shared by every canonical record.
pub trait Entity {
    /// Stable identifier of the record.
    fn id(&self) -> &str;

    /// Timestamp the record describes.
    fn timestamp(&self) -> DateTime<Utc>;
}

// =============================================================================
// Entity Kind
// =============================================================================

/// The entity kinds served by the data layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Account,
    Trades,
    CorrelationPairs,
    Events,
    Performance,
}

impl EntityKind {
    /// All kinds, in display order.
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Account,
        EntityKind::Trades,
        EntityKind::CorrelationPairs,
        EntityKind::Events,
        EntityKind::Performance,
    ];

    /// Name used as the cache key prefix.
    pub fn name(&self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Trades => "trades",
            EntityKind::CorrelationPairs => "correlation_pairs",
            EntityKind::Events => "events",
            EntityKind::Performance => "performance",
        }
    }

    /// Collection name in the live-query store.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Account => "account_snapshots",
            EntityKind::Trades => "trades",
            EntityKind::CorrelationPairs => "correlation_pairs",
            EntityKind::Events => "bot_events",
            EntityKind::Performance => "performance_history",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Account Summary
// =============================================================================

/// Aggregated account metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct AccountSummary {
    pub id: String,

    /// Wallet balance.
    pub balance: String,

    /// Balance plus unrealized PnL.
    pub equity: String,

    /// Balance not locked as margin.
    pub available_balance: String,

    pub unrealized_pnl: String,

    pub realized_pnl: String,

    pub margin_used: String,

    /// Number of positions the bot reports as open.
    pub open_positions: u32,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl Entity for AccountSummary {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// =============================================================================
// Trade
// =============================================================================

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Long,
    Short,
    #[default]
    Unknown,
}

impl TradeSide {
    /// Parses the side spellings used by the backends.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "long" | "buy" => TradeSide::Long,
            "short" | "sell" => TradeSide::Short,
            _ => TradeSide::Unknown,
        }
    }
}

/// Lifecycle status of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
    #[default]
    Unknown,
}

impl TradeStatus {
    /// Parses the status spellings used by the backends.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "open" | "active" | "opened" => TradeStatus::Open,
            "closed" | "exited" | "settled" => TradeStatus::Closed,
            _ => TradeStatus::Unknown,
        }
    }

    /// Wire spelling, used in query strings and store filters.
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeStatus::Open => "open",
            TradeStatus::Closed => "closed",
            TradeStatus::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A position opened by the bot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub status: TradeStatus,
    pub entry_price: String,
    pub exit_price: Option<String>,
    pub quantity: String,
    pub pnl: String,

    /// Correlation pair this leg belongs to, if any.
    pub pair_id: Option<String>,

    #[ts(as = "Option<String>")]
    pub opened_at: Option<DateTime<Utc>>,

    #[ts(as = "Option<String>")]
    pub closed_at: Option<DateTime<Utc>>,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl Trade {
    /// Returns true if the position is still open.
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }
}

impl Entity for Trade {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// =============================================================================
// Correlation Pair
// =============================================================================

/// Two symbols the bot trades as a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CorrelationPair {
    pub id: String,
    pub symbol_a: String,
    pub symbol_b: String,

    /// Pearson correlation of the two legs.
    pub correlation: f64,

    pub z_score: f64,

    pub spread: f64,

    /// Whether the bot is currently trading this pair.
    pub is_active: bool,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl Entity for CorrelationPair {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// =============================================================================
// Bot Event
// =============================================================================

/// Severity of a bot event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl EventLevel {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "debug" | "trace" => EventLevel::Debug,
            "warn" | "warning" => EventLevel::Warning,
            "error" | "critical" | "fatal" => EventLevel::Error,
            _ => EventLevel::Info,
        }
    }
}

/// One entry of the bot's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct BotEvent {
    pub id: String,

    /// Machine-readable type, e.g. `POSITION_SYNC`, `ORDER_FILLED`.
    pub event_type: String,

    pub level: EventLevel,

    pub message: String,

    /// Event-specific details, passed through untouched.
    #[ts(type = "unknown")]
    pub payload: serde_json::Value,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl Entity for BotEvent {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// =============================================================================
// Performance Point
// =============================================================================

/// One sample of the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PerformancePoint {
    pub id: String,
    pub equity: String,
    pub pnl: String,

    /// Drawdown from the running peak, as a fraction.
    pub drawdown: f64,

    #[ts(as = "String")]
    pub timestamp: DateTime<Utc>,
}

impl Entity for PerformancePoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
