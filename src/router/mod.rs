//! The user store and downstream routing seam.
//!
//! The server only ever sees users through the [`Router`] trait: credentials
//! are resolved to a user id at bind time, a policy snapshot is read per
//! inbound submit_sm, and accepted messages are handed off for a message id.
//! [`InMemoryRouter`] is the provisioned implementation used by the binary
//! and the tests.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use regex::Regex;
use rusmpp::pdus::SubmitSm;
use subtle::ConstantTimeEq;

/// Authorizations and quota governing the server-facing side of a user.
#[derive(Debug, Clone)]
pub struct SmppsCredential {
    pub allow_bind: bool,
    /// Maximum simultaneous bound sessions. `None` means unlimited.
    pub max_bindings: Option<u32>,
}

impl Default for SmppsCredential {
    fn default() -> Self {
        Self {
            allow_bind: true,
            max_bindings: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MtAuthorizations {
    pub smpps_send: bool,
    pub set_dlr_level: bool,
    pub set_source_address: bool,
    pub set_priority: bool,
}

impl Default for MtAuthorizations {
    fn default() -> Self {
        Self {
            smpps_send: true,
            set_dlr_level: true,
            set_source_address: true,
            set_priority: true,
        }
    }
}

/// Regex screens applied to submitted messages. An absent filter accepts
/// everything; patterns are used exactly as provided, with no implicit
/// anchoring.
#[derive(Debug, Clone, Default)]
pub struct MtValueFilters {
    pub source_address: Option<Regex>,
    pub destination_address: Option<Regex>,
    pub priority: Option<Regex>,
    pub content: Option<Regex>,
}

#[derive(Debug, Clone, Default)]
pub struct MtCredential {
    pub authorizations: MtAuthorizations,
    pub filters: MtValueFilters,
    /// Source address implied when the client submits without one. A PDU
    /// carrying anything else counts as setting its own source address.
    pub default_source_addr: Option<String>,
}

/// Policy snapshot for one user. Cheap to clone; the server reads one
/// snapshot per inbound PDU so edits never produce a partial view.
#[derive(Debug, Clone)]
pub struct User {
    pub uid: String,
    pub username: String,
    password: String,
    pub smpps_credential: SmppsCredential,
    pub mt_credential: MtCredential,
}

impl User {
    pub fn new(
        uid: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            password: password.into(),
            smpps_credential: SmppsCredential::default(),
            mt_credential: MtCredential::default(),
        }
    }

    /// Constant-time password comparison.
    pub fn password_matches(&self, candidate: &str) -> bool {
        self.password.as_bytes().ct_eq(candidate.as_bytes()).into()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    UnknownUser,
    BadPassword,
}

impl fmt::Display for AuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownUser => f.write_str("unknown system_id"),
            Self::BadPassword => f.write_str("invalid password"),
        }
    }
}

impl std::error::Error for AuthError {}

/// The external user/routing component, as seen from the SMPP server.
pub trait Router: Send + Sync {
    /// Resolve credentials to a user id.
    fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError>;

    /// Read-copy snapshot of the user's current policy.
    fn user(&self, uid: &str) -> Option<User>;

    /// Hand an accepted submit_sm downstream. Always yields a message id;
    /// the actual delivery outcome travels back on a delivery receipt.
    fn submit_from_smpps(&self, uid: &str, pdu: &SubmitSm) -> String;
}

/// Router backed by a provisioned user table.
pub struct InMemoryRouter {
    // Map uid -> User
    users: DashMap<String, User>,
    // Map username -> uid
    usernames: DashMap<String, String>,
    message_id_counter: AtomicU32,
}

impl InMemoryRouter {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
            usernames: DashMap::new(),
            message_id_counter: AtomicU32::new(1),
        }
    }

    pub fn add_user(&self, user: User) {
        self.usernames
            .insert(user.username.clone(), user.uid.clone());
        self.users.insert(user.uid.clone(), user);
    }

    /// Edit a user's policy in place. The edit runs under the table's entry
    /// lock, so concurrent snapshots see either the old or the new policy,
    /// never a mix.
    pub fn update_user(&self, uid: &str, edit: impl FnOnce(&mut User)) {
        if let Some(mut user) = self.users.get_mut(uid) {
            edit(&mut user);
        }
    }
}

impl Router for InMemoryRouter {
    fn authenticate(&self, username: &str, password: &str) -> Result<String, AuthError> {
        let uid = self
            .usernames
            .get(username)
            .map(|r| r.value().clone())
            .ok_or(AuthError::UnknownUser)?;
        let user = self.users.get(&uid).ok_or(AuthError::UnknownUser)?;
        if user.password_matches(password) {
            Ok(uid)
        } else {
            Err(AuthError::BadPassword)
        }
    }

    fn user(&self, uid: &str) -> Option<User> {
        self.users.get(uid).map(|u| u.clone())
    }

    fn submit_from_smpps(&self, uid: &str, pdu: &SubmitSm) -> String {
        let message_id = format!(
            "{:08X}",
            self.message_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        tracing::debug!(
            "Routing submit_sm from {}: message_id={}, dest={}",
            uid,
            message_id,
            pdu.destination_addr.to_string()
        );
        message_id
    }
}
