//! Outstanding admin requests keyed by packet id.
//!
//! An entry is created when an admin packet is written and removed when a routing
//! ACK/NAK or admin reply whose `request_id` matches arrives, or when it outlives the
//! configured TTL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAdminRequest {
    pub id: u32,
    pub description: String,
    pub from_node: u32,
    pub to_node: u32,
    pub created_at: DateTime<Utc>,
}

/// How a pending request left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Acked,
    /// Routing error reported for the request (numeric `routing::Error`).
    Failed(i32),
    Replied,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: HashMap<u32, (PendingAdminRequest, Instant)>,
}

impl PendingRequests {
    pub fn insert(&mut self, request: PendingAdminRequest, sent_at: Instant) {
        self.entries.insert(request.id, (request, sent_at));
    }

    pub fn resolve(&mut self, id: u32) -> Option<PendingAdminRequest> {
        self.entries.remove(&id).map(|(req, _)| req)
    }

    pub fn get(&self, id: u32) -> Option<&PendingAdminRequest> {
        self.entries.get(&id).map(|(req, _)| req)
    }

    /// Remove and return requests older than `ttl`, oldest first.
    pub fn sweep_expired(&mut self, now: Instant, ttl: Duration) -> Vec<PendingAdminRequest> {
        let mut expired: Vec<(PendingAdminRequest, Instant)> = Vec::new();
        self.entries.retain(|_, (req, sent_at)| {
            if now.saturating_duration_since(*sent_at) > ttl {
                expired.push((req.clone(), *sent_at));
                false
            } else {
                true
            }
        });
        expired.sort_by_key(|(_, sent_at)| *sent_at);
        expired.into_iter().map(|(req, _)| req).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req(id: u32) -> PendingAdminRequest {
        PendingAdminRequest {
            id,
            description: format!("req {}", id),
            from_node: 1,
            to_node: 2,
            created_at: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn resolve_removes_entry() {
        let mut p = PendingRequests::default();
        p.insert(req(500), Instant::now());
        assert_eq!(p.get(500).map(|r| r.to_node), Some(2));
        assert_eq!(p.resolve(500).map(|r| r.id), Some(500));
        assert!(p.resolve(500).is_none());
        assert!(p.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_only_old_entries() {
        let mut p = PendingRequests::default();
        let t0 = Instant::now();
        p.insert(req(1), t0);
        p.insert(req(2), t0 + Duration::from_secs(10));
        p.insert(req(3), t0 + Duration::from_secs(200));

        let expired = p.sweep_expired(t0 + Duration::from_secs(301), Duration::from_secs(300));
        assert_eq!(expired.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1]);
        let expired = p.sweep_expired(t0 + Duration::from_secs(400), Duration::from_secs(300));
        assert_eq!(expired.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2]);
        assert_eq!(p.len(), 1);
    }

    #[test]
    fn pending_request_serializes() {
        let json = serde_json::to_string(&req(9)).unwrap();
        assert!(json.contains("\"id\":9"));
        let back: PendingAdminRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.description, "req 9");
    }
}
