//! Piece tickets
//!
//! A ticket authorizes one operation on one piece at one node. The tracker
//! mints it with the node's key; the node recomputes and compares it before
//! touching any bytes. The MAC covers the operation, the content key, the
//! declared size, the timestamp and the tracker-issued ticket id, so changing
//! any one of them invalidates the token.

use crate::crypto::ContentHash;
use crate::error::{NebulaError, Result};
use ring::hmac;
use serde::{Deserialize, Serialize};
use std::fmt;

const DOMAIN_TAG: &[u8] = b"nebula-ticket-v1";

/// Operation a ticket grants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Store,
    Retrieve,
    /// Existence check without transferring bytes
    Inspect,
}

impl Operation {
    fn tag(self) -> u8 {
        match self {
            Operation::Store => 1,
            Operation::Retrieve => 2,
            Operation::Inspect => 3,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Store => "store",
            Operation::Retrieve => "retrieve",
            Operation::Inspect => "inspect",
        };
        f.write_str(name)
    }
}

/// Everything a ticket is bound to, apart from the ticket id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketScope {
    pub operation: Operation,
    pub content_key: ContentHash,
    pub size: u64,
    /// Seconds since the Unix epoch at issue time
    pub timestamp: u64,
}

impl TicketScope {
    pub fn new(operation: Operation, content_key: ContentHash, size: u64, timestamp: u64) -> Self {
        Self {
            operation,
            content_key,
            size,
            timestamp,
        }
    }

    fn message(&self, ticket_id: &str) -> Vec<u8> {
        let key = self.content_key.as_bytes();
        let mut buf =
            Vec::with_capacity(DOMAIN_TAG.len() + 1 + 4 + key.len() + 16 + 4 + ticket_id.len());
        buf.extend_from_slice(DOMAIN_TAG);
        buf.push(self.operation.tag());
        buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(&self.size.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(&(ticket_id.len() as u32).to_be_bytes());
        buf.extend_from_slice(ticket_id.as_bytes());
        buf
    }
}

/// Secret key material a node shares with the tracker
#[derive(Clone, PartialEq, Eq)]
pub struct NodeKey(Vec<u8>);

impl NodeKey {
    pub fn new(material: impl Into<Vec<u8>>) -> Self {
        Self(material.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKey(<{} bytes>)", self.0.len())
    }
}

/// MAC produced by [`TicketCodec::issue`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthToken(pub Vec<u8>);

impl AuthToken {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

/// Issues and checks ticket MACs (HMAC-SHA256)
pub struct TicketCodec;

impl TicketCodec {
    pub fn issue(scope: &TicketScope, ticket_id: &str, key: &NodeKey) -> AuthToken {
        let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
        let tag = hmac::sign(&key, &scope.message(ticket_id));
        AuthToken(tag.as_ref().to_vec())
    }

    /// Constant-time check of `token` against the scope
    pub fn validate(
        scope: &TicketScope,
        ticket_id: &str,
        token: &AuthToken,
        key: &NodeKey,
    ) -> Result<()> {
        let key = hmac::Key::new(hmac::HMAC_SHA256, key.as_bytes());
        hmac::verify(&key, &scope.message(ticket_id), token.as_bytes()).map_err(|_| {
            NebulaError::Unauthorized(format!(
                "{} ticket does not match scope",
                scope.operation
            ))
        })
    }

    /// `validate`, plus reject timestamps more than `window` seconds from `now`
    pub fn validate_at(
        scope: &TicketScope,
        ticket_id: &str,
        token: &AuthToken,
        key: &NodeKey,
        now: u64,
        window: u64,
    ) -> Result<()> {
        Self::validate(scope, ticket_id, token, key)?;
        if now.abs_diff(scope.timestamp) > window {
            return Err(NebulaError::TicketExpired {
                issued_at: scope.timestamp,
                now,
                window,
            });
        }
        Ok(())
    }
}

/// Current time as Unix seconds
pub fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_TICKET_WINDOW_SECS;

    fn fixture() -> (TicketScope, NodeKey) {
        let scope = TicketScope::new(
            Operation::Store,
            ContentHash::compute(b"test-hash-key"),
            191_849,
            1_700_000_000,
        );
        (scope, NodeKey::new(b"node-secret".to_vec()))
    }

    #[test]
    fn test_issue_then_validate() {
        let (scope, key) = fixture();
        let token = TicketCodec::issue(&scope, "ticket-1", &key);
        assert_eq!(token.as_bytes().len(), 32);
        TicketCodec::validate(&scope, "ticket-1", &token, &key).unwrap();
    }

    #[test]
    fn test_every_field_is_bound() {
        let (scope, key) = fixture();
        let token = TicketCodec::issue(&scope, "ticket-1", &key);

        let variants = [
            TicketScope { operation: Operation::Retrieve, ..scope },
            TicketScope { operation: Operation::Inspect, ..scope },
            TicketScope { content_key: ContentHash::compute(b"other"), ..scope },
            TicketScope { size: scope.size + 1, ..scope },
            TicketScope { timestamp: scope.timestamp + 1, ..scope },
        ];
        for changed in variants {
            assert!(matches!(
                TicketCodec::validate(&changed, "ticket-1", &token, &key),
                Err(NebulaError::Unauthorized(_))
            ));
        }

        assert!(TicketCodec::validate(&scope, "ticket-2", &token, &key).is_err());
        let other = NodeKey::new(b"other".to_vec());
        assert!(TicketCodec::validate(&scope, "ticket-1", &token, &other).is_err());

        let mut flipped = token.clone();
        flipped.0[0] ^= 1;
        assert!(TicketCodec::validate(&scope, "ticket-1", &flipped, &key).is_err());
    }

    #[test]
    fn test_empty_ticket_id_for_inspect() {
        let (scope, key) = fixture();
        let scope = TicketScope { operation: Operation::Inspect, ..scope };
        let token = TicketCodec::issue(&scope, "", &key);
        TicketCodec::validate(&scope, "", &token, &key).unwrap();
    }

    #[test]
    fn test_skew_window() {
        let (scope, key) = fixture();
        let token = TicketCodec::issue(&scope, "t", &key);
        let window = DEFAULT_TICKET_WINDOW_SECS;

        let at = |now: u64| TicketCodec::validate_at(&scope, "t", &token, &key, now, window);
        at(scope.timestamp + window).unwrap();
        at(scope.timestamp - window).unwrap();
        assert!(matches!(
            at(scope.timestamp + window + 1),
            Err(NebulaError::TicketExpired { .. })
        ));
    }

    #[test]
    fn test_node_key_debug_hides_material() {
        let key = NodeKey::new(b"super-secret".to_vec());
        assert!(!format!("{:?}", key).contains("super"));
    }
}
