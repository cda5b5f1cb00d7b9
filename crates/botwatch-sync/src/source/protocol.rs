//! # Live Store Protocol Messages
//!
//! Message types exchanged with the live-query store.
//!
//! ## Protocol Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Live Store Protocol                                │
//! │                                                                         │
//! │  HANDSHAKE                                                             │
//! │  ─────────                                                             │
//! │  client ───► Auth { api_key }                 (only if a key is set)   │
//! │                                                                         │
//! │  ONE-TIME READ                                                         │
//! │  ─────────────                                                         │
//! │  client ───► Query { id, query }                                       │
//! │  store  ◄─── Snapshot { id, documents }       (exactly one)            │
//! │                                                                         │
//! │  LIVE QUERY                                                            │
//! │  ──────────                                                            │
//! │  client ───► Listen { id, query }                                      │
//! │  store  ◄─── Snapshot { id, documents }       (initial, then on change)│
//! │  client ───► Unlisten { id }                                           │
//! │                                                                         │
//! │  KEEPALIVE                                                             │
//! │  ─────────                                                             │
//! │  store  ───► Ping { timestamp }                                        │
//! │  client ───► Pong { ping_timestamp, pong_timestamp }                   │
//! │                                                                         │
//! │  ERROR                                                                 │
//! │  ─────                                                                 │
//! │  store  ◄─── Error { id?, code, message }     (id ends that request)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wire Format
//! Adjacently tagged JSON:
//! ```json
//! { "type": "Listen", "payload": { "id": "...", "query": { "collection": "trades" } } }
//! ```

use serde::{Deserialize, Serialize};

use botwatch_core::{Document, QueryShape};

use crate::error::{SyncError, SyncResult};

/// All live store protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum StoreMessage {
    // =========================================================================
    // Client → Store
    // =========================================================================
    /// Credential for the connection.
    Auth { api_key: String },

    /// One-time read.
    Query { id: String, query: QueryShape },

    /// Start a live query.
    Listen { id: String, query: QueryShape },

    /// Stop a live query.
    Unlisten { id: String },

    // =========================================================================
    // Store → Client
    // =========================================================================
    /// Full result set for a read or live query.
    Snapshot { id: String, documents: Vec<Document> },

    /// Request failure. Without an id it concerns the whole connection.
    Error {
        #[serde(default)]
        id: Option<String>,
        code: String,
        message: String,
    },

    // =========================================================================
    // Keepalive
    // =========================================================================
    Ping { timestamp: String },

    Pong {
        ping_timestamp: String,
        pong_timestamp: String,
    },
}

impl StoreMessage {
    /// Returns the message type name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            StoreMessage::Auth { .. } => "Auth",
            StoreMessage::Query { .. } => "Query",
            StoreMessage::Listen { .. } => "Listen",
            StoreMessage::Unlisten { .. } => "Unlisten",
            StoreMessage::Snapshot { .. } => "Snapshot",
            StoreMessage::Error { .. } => "Error",
            StoreMessage::Ping { .. } => "Ping",
            StoreMessage::Pong { .. } => "Pong",
        }
    }

    pub fn pong(ping_timestamp: &str) -> Self {
        StoreMessage::Pong {
            ping_timestamp: ping_timestamp.to_string(),
            pong_timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn to_json(&self) -> SyncResult<String> {
        serde_json::to_string(self).map_err(|e| SyncError::SerializationFailed(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
