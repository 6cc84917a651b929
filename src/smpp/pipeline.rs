//! Per-PDU policy screening for inbound submit_sm.
//!
//! Stage order is part of the contract: authorization gates run before value
//! filters, and the first violation wins. The session has already verified
//! the bind state before calling in here.

use std::fmt;

use regex::Regex;
use rusmpp::CommandStatus;
use rusmpp::pdus::SubmitSm;
use rusmpp::values::RegisteredDelivery;

use crate::router::{MtCredential, User};

/// Why a submit_sm was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitViolation {
    NotAuthorized { privilege: &'static str },
    SourceAddrFiltered,
    DestAddrFiltered,
    PriorityFiltered,
    ContentFiltered,
}

impl SubmitViolation {
    /// SMPP status carried back on the submit_sm_resp.
    pub fn command_status(&self) -> CommandStatus {
        match self {
            Self::NotAuthorized { .. } => CommandStatus::EsmeRinvsysid,
            Self::SourceAddrFiltered => CommandStatus::EsmeRinvsrcadr,
            Self::DestAddrFiltered => CommandStatus::EsmeRinvdstadr,
            Self::PriorityFiltered => CommandStatus::EsmeRinvprtflg,
            // Content rejection maps to a generic system error, not a
            // parameter error.
            Self::ContentFiltered => CommandStatus::EsmeRsyserr,
        }
    }
}

impl fmt::Display for SubmitViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAuthorized { privilege } => {
                write!(f, "user lacks the {} authorization", privilege)
            }
            Self::SourceAddrFiltered => f.write_str("source address rejected by filter"),
            Self::DestAddrFiltered => f.write_str("destination address rejected by filter"),
            Self::PriorityFiltered => f.write_str("priority rejected by filter"),
            Self::ContentFiltered => f.write_str("content rejected by filter"),
        }
    }
}

/// Run the user's policy against one submit_sm.
pub fn screen_submit(user: &User, submit: &SubmitSm) -> Result<(), SubmitViolation> {
    let mt = &user.mt_credential;

    if !mt.authorizations.smpps_send {
        return Err(SubmitViolation::NotAuthorized {
            privilege: "smpps_send",
        });
    }

    if submit.registered_delivery != RegisteredDelivery::default()
        && !mt.authorizations.set_dlr_level
    {
        return Err(SubmitViolation::NotAuthorized {
            privilege: "set_dlr_level",
        });
    }

    let source = submit.source_addr.to_string();
    if is_non_default_source(&source, mt) && !mt.authorizations.set_source_address {
        return Err(SubmitViolation::NotAuthorized {
            privilege: "set_source_address",
        });
    }

    let priority = u8::from(submit.priority_flag);
    if priority != 0 && !mt.authorizations.set_priority {
        return Err(SubmitViolation::NotAuthorized {
            privilege: "set_priority",
        });
    }

    if rejected(&mt.filters.source_address, &source) {
        return Err(SubmitViolation::SourceAddrFiltered);
    }

    let destination = submit.destination_addr.to_string();
    if rejected(&mt.filters.destination_address, &destination) {
        return Err(SubmitViolation::DestAddrFiltered);
    }

    // The priority filter matches against the decimal form of the level.
    if rejected(&mt.filters.priority, &priority.to_string()) {
        return Err(SubmitViolation::PriorityFiltered);
    }

    let content = String::from_utf8_lossy(submit.short_message().as_ref());
    if rejected(&mt.filters.content, &content) {
        return Err(SubmitViolation::ContentFiltered);
    }

    Ok(())
}

fn rejected(filter: &Option<Regex>, value: &str) -> bool {
    filter.as_ref().is_some_and(|re| !re.is_match(value))
}

fn is_non_default_source(source: &str, mt: &MtCredential) -> bool {
    match &mt.default_source_addr {
        Some(default) => source != default,
        // Without a configured default, any explicit source counts as
        // setting one.
        None => !source.is_empty(),
    }
}
