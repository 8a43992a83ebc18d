//! The central `Request` entity and its lifecycle invariants.
//!
//! A `Request` is a client-originated intent (order, transfer, approve, or
//! wrap/unwrap) tracked from ingress through a terminal status. See
//! `SPEC_FULL.md` §3 for the full data model this mirrors.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Monotonic milliseconds since the Unix epoch, as observed by this process.
pub type TimestampMs = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Order,
    Transfer,
    Approve,
    WrapUnwrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    CancelRequested,
    Succeeded,
    Failed,
    Canceled,
}

impl RequestStatus {
    /// `is_finalised(r) ⇔ r.request_status ∈ {SUCCEEDED, FAILED, CANCELED}` (spec.md §3).
    pub fn is_finalised(self) -> bool {
        matches!(
            self,
            RequestStatus::Succeeded | RequestStatus::Failed | RequestStatus::Canceled
        )
    }

    /// Whether `next` is a legal successor of `self` along the partial order
    /// `PENDING → {CANCEL_REQUESTED} → {SUCCEEDED, FAILED, CANCELED}`.
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, CancelRequested | Succeeded | Failed | Canceled) => true,
            (CancelRequested, Succeeded | Failed | Canceled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionTag {
    Order,
    Transfer,
    Approve,
    WrapUnwrap,
    Cancel,
}

impl From<RequestType> for ActionTag {
    fn from(value: RequestType) -> Self {
        match value {
            RequestType::Order => ActionTag::Order,
            RequestType::Transfer => ActionTag::Transfer,
            RequestType::Approve => ActionTag::Approve,
            RequestType::WrapUnwrap => ActionTag::WrapUnwrap,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHashEntry {
    pub hash: String,
    pub action_tag: ActionTag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WrapOperation {
    Wrap,
    Unwrap,
}

/// Venue-specific context carried alongside a `Request`.
///
/// Modeled as a tagged union (spec.md §9 design note), not a free-form map,
/// with an `extra` escape hatch preserved for forward compatibility across
/// venues this process doesn't yet know about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DexSpecific {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub targeted_block_num: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_chain_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subaccount_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Type-specific fields, one variant per `RequestType`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "request_type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestDetails {
    Order {
        symbol: String,
        side: String,
        quantity: String,
        price: String,
        order_type: String,
    },
    Transfer {
        symbol: String,
        amount: String,
        address_to: String,
        request_path: String,
    },
    Approve {
        symbol: String,
        amount: String,
    },
    WrapUnwrap {
        symbol: String,
        amount: String,
        operation: WrapOperation,
    },
}

impl RequestDetails {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestDetails::Order { .. } => RequestType::Order,
            RequestDetails::Transfer { .. } => RequestType::Transfer,
            RequestDetails::Approve { .. } => RequestType::Approve,
            RequestDetails::WrapUnwrap { .. } => RequestType::WrapUnwrap,
        }
    }
}

/// The central entity tracked by the Request Cache through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub client_request_id: String,
    #[serde(flatten)]
    pub details: RequestDetails,
    pub request_status: RequestStatus,
    pub received_at_ms: TimestampMs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalised_at_ms: Option<TimestampMs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub tx_hashes: Vec<TxHashEntry>,
    #[serde(default)]
    pub used_gas_prices_wei: Vec<Option<u128>>,
    #[serde(default)]
    pub dex_specific: DexSpecific,
}

impl Request {
    pub fn new(client_request_id: impl Into<String>, details: RequestDetails, now_ms: TimestampMs) -> Self {
        Request {
            client_request_id: client_request_id.into(),
            details,
            request_status: RequestStatus::Pending,
            received_at_ms: now_ms,
            finalised_at_ms: None,
            nonce: None,
            tx_hashes: Vec::new(),
            used_gas_prices_wei: Vec::new(),
            dex_specific: DexSpecific::default(),
        }
    }

    pub fn request_type(&self) -> RequestType {
        self.details.request_type()
    }

    pub fn is_finalised(&self) -> bool {
        self.request_status.is_finalised()
    }

    /// Appends a `(tx_hash, action_tag)` attempt, keeping `used_gas_prices_wei` parallel to it.
    pub fn push_attempt(&mut self, hash: impl Into<String>, action_tag: ActionTag, gas_price_wei: Option<u128>) {
        self.tx_hashes.push(TxHashEntry {
            hash: hash.into(),
            action_tag,
        });
        self.used_gas_prices_wei.push(gas_price_wei);
    }

    /// Last gas price transmitted for this request, if any attempt carried one.
    pub fn last_used_gas_price(&self) -> Option<u128> {
        self.used_gas_prices_wei.iter().rev().flatten().next().copied()
    }

    /// Attempts to transition `request_status`, rejecting illegal moves per the
    /// partial order in spec.md §3. Sets `finalised_at_ms` on terminal entry.
    pub fn transition(&mut self, next: RequestStatus, now_ms: TimestampMs) -> Result<(), TransitionError> {
        if !self.request_status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.request_status,
                to: next,
            });
        }
        self.request_status = next;
        if next.is_finalised() {
            self.finalised_at_ms.get_or_insert(now_ms);
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal status transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: RequestStatus,
    pub to: RequestStatus,
}

/// Free-form response shape for `get-all-open-requests` / `get-request-status`.
pub fn to_dict(request: &Request) -> HashMap<String, serde_json::Value> {
    match serde_json::to_value(request) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Request {
        Request::new(
            "r1",
            RequestDetails::Order {
                symbol: "BTC-USD".into(),
                side: "BUY".into(),
                quantity: "0.1".into(),
                price: "50000".into(),
                order_type: "LIMIT".into(),
            },
            1_000,
        )
    }

    #[test]
    fn new_request_is_pending_and_not_finalised() {
        let r = sample();
        assert_eq!(r.request_status, RequestStatus::Pending);
        assert!(!r.is_finalised());
        assert!(r.nonce.is_none());
    }

    #[test]
    fn status_transitions_follow_partial_order() {
        let mut r = sample();
        r.transition(RequestStatus::CancelRequested, 2_000).unwrap();
        assert!(r.transition(RequestStatus::Pending, 3_000).is_err());
        r.transition(RequestStatus::Canceled, 4_000).unwrap();
        assert!(r.is_finalised());
        assert_eq!(r.finalised_at_ms, Some(4_000));
        // No backward transitions once finalised.
        assert!(r.transition(RequestStatus::Succeeded, 5_000).is_err());
    }

    #[test]
    fn push_attempt_keeps_parallel_lists() {
        let mut r = sample();
        r.push_attempt("0xAAA", ActionTag::Order, Some(1_000_000_000));
        r.push_attempt("0xBBB", ActionTag::Cancel, Some(1_100_000_000));
        assert_eq!(r.tx_hashes.len(), r.used_gas_prices_wei.len());
        assert_eq!(r.last_used_gas_price(), Some(1_100_000_000));
    }
}
