//! Per-user bind registry and connection-status bookkeeping.
//!
//! Every mutation for a user runs under that user's map entry lock, which is
//! what makes the quota check atomic with the insert and keeps the counters
//! consistent with the registered session population. Entries survive their
//! last session: the monotone counters outlive the bindings they count.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::smpp::session::{BindType, SessionRequest};

/// Per-user SMPPS connection counters.
#[derive(Debug, Clone, Default)]
pub struct SmppsCnxStatus {
    pub bind_count: u64,
    pub unbind_count: u64,
    pub submit_sm_request_count: u64,
    pub bound_connections: BoundConnectionsCount,
    /// `None` until the user's first activity.
    pub last_activity_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundConnectionsCount {
    pub bind_transmitter: u32,
    pub bind_receiver: u32,
    pub bind_transceiver: u32,
}

impl BoundConnectionsCount {
    pub fn total(&self) -> u32 {
        self.bind_transmitter + self.bind_receiver + self.bind_transceiver
    }

    fn slot_mut(&mut self, bind_type: BindType) -> &mut u32 {
        match bind_type {
            BindType::Transmitter => &mut self.bind_transmitter,
            BindType::Receiver => &mut self.bind_receiver,
            BindType::Transceiver => &mut self.bind_transceiver,
        }
    }
}

/// Routing handle for one bound session.
#[derive(Debug, Clone)]
pub struct BoundSession {
    pub session_id: String,
    pub bind_type: BindType,
    pub sender: mpsc::Sender<SessionRequest>,
}

#[derive(Debug, Default)]
struct UserEntry {
    sessions: Vec<BoundSession>,
    rr_cursor: usize,
    status: SmppsCnxStatus,
}

/// The user is already at its `max_bindings` quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaExceeded;

#[derive(Debug, Default)]
pub struct BindRegistry {
    // Map uid -> UserEntry
    users: DashMap<String, UserEntry>,
}

impl BindRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    /// Register a freshly bound session. The quota comparison and the insert
    /// happen under the same entry lock.
    pub fn try_bind(
        &self,
        uid: &str,
        session: BoundSession,
        max_bindings: Option<u32>,
    ) -> Result<(), QuotaExceeded> {
        let mut entry = self.users.entry(uid.to_string()).or_default();
        if let Some(max) = max_bindings {
            if entry.sessions.len() as u32 >= max {
                return Err(QuotaExceeded);
            }
        }
        let bind_type = session.bind_type;
        entry.sessions.push(session);
        entry.status.bind_count += 1;
        *entry.status.bound_connections.slot_mut(bind_type) += 1;
        entry.status.last_activity_at = Some(Utc::now());
        Ok(())
    }

    /// Deregister a session and perform the unbind bookkeeping. Idempotent:
    /// the graceful-unbind path and the disconnect epilogue may both call
    /// this, and only the call that actually removes the session counts.
    pub fn unbind(&self, uid: &str, session_id: &str) {
        let Some(mut entry) = self.users.get_mut(uid) else {
            return;
        };
        let Some(pos) = entry
            .sessions
            .iter()
            .position(|s| s.session_id == session_id)
        else {
            return;
        };
        let removed = entry.sessions.remove(pos);
        entry.status.unbind_count += 1;
        let slot = entry.status.bound_connections.slot_mut(removed.bind_type);
        *slot = slot.saturating_sub(1);
        entry.status.last_activity_at = Some(Utc::now());
    }

    /// Refresh the user's last-activity timestamp.
    pub fn touch(&self, uid: &str) {
        if let Some(mut entry) = self.users.get_mut(uid) {
            entry.status.last_activity_at = Some(Utc::now());
        }
    }

    /// Count one submit_sm request, accepted or rejected.
    pub fn record_submit(&self, uid: &str) {
        if let Some(mut entry) = self.users.get_mut(uid) {
            entry.status.submit_sm_request_count += 1;
        }
    }

    /// Pick the next delivery target among the user's RX/TRX sessions,
    /// round-robin. Transmitter-only sessions are never eligible.
    pub fn select_receiver(&self, uid: &str) -> Option<BoundSession> {
        let mut entry = self.users.get_mut(uid)?;
        let eligible: Vec<usize> = entry
            .sessions
            .iter()
            .enumerate()
            .filter(|(_, s)| s.bind_type.can_receive())
            .map(|(i, _)| i)
            .collect();
        if eligible.is_empty() {
            return None;
        }
        let chosen = eligible[entry.rr_cursor % eligible.len()];
        entry.rr_cursor = entry.rr_cursor.wrapping_add(1);
        Some(entry.sessions[chosen].clone())
    }

    /// Counter snapshot for one user. Users that never bound report zeros.
    pub fn cnx_status(&self, uid: &str) -> SmppsCnxStatus {
        self.users
            .get(uid)
            .map(|e| e.status.clone())
            .unwrap_or_default()
    }

    /// Currently bound sessions for one user.
    pub fn bound_sessions(&self, uid: &str) -> Vec<BoundSession> {
        self.users
            .get(uid)
            .map(|e| e.sessions.clone())
            .unwrap_or_default()
    }

    /// All bound sessions across users, for shutdown draining.
    pub fn all_sessions(&self) -> Vec<BoundSession> {
        self.users
            .iter()
            .flat_map(|e| e.sessions.clone())
            .collect()
    }

    /// Total bound-session population across users.
    pub fn population(&self) -> usize {
        self.users.iter().map(|e| e.sessions.len()).sum()
    }
}
