//! Unit tests for the bind registry and connection-status bookkeeping.

use crate::smpp::registry::{BindRegistry, BoundSession, QuotaExceeded};
use crate::smpp::session::BindType;
use tokio::sync::mpsc;

fn bound(id: &str, bind_type: BindType) -> BoundSession {
    let (sender, _) = mpsc::channel(1);
    BoundSession {
        session_id: id.to_string(),
        bind_type,
        sender,
    }
}

#[test]
fn fresh_user_reports_zeros() {
    let registry = BindRegistry::new();

    let status = registry.cnx_status("u1");
    assert_eq!(status.bind_count, 0);
    assert_eq!(status.unbind_count, 0);
    assert_eq!(status.submit_sm_request_count, 0);
    assert_eq!(status.bound_connections.total(), 0);
    assert!(status.last_activity_at.is_none());
}

#[test]
fn bind_updates_counters_per_bind_type() {
    let registry = BindRegistry::new();

    registry
        .try_bind("u1", bound("s1", BindType::Transceiver), None)
        .unwrap();

    let status = registry.cnx_status("u1");
    assert_eq!(status.bind_count, 1);
    assert_eq!(status.bound_connections.bind_transceiver, 1);
    assert_eq!(status.bound_connections.bind_transmitter, 0);
    assert_eq!(status.bound_connections.bind_receiver, 0);
    assert!(status.last_activity_at.is_some());
}

#[test]
fn quota_is_enforced_atomically_with_the_insert() {
    let registry = BindRegistry::new();

    registry
        .try_bind("u1", bound("s1", BindType::Transmitter), Some(1))
        .unwrap();
    let refused = registry.try_bind("u1", bound("s2", BindType::Transmitter), Some(1));
    assert_eq!(refused, Err(QuotaExceeded));

    // The refused bind must leave no trace
    let status = registry.cnx_status("u1");
    assert_eq!(status.bind_count, 1);
    assert_eq!(status.bound_connections.total(), 1);

    // Unbinding frees the slot again
    registry.unbind("u1", "s1");
    registry
        .try_bind("u1", bound("s3", BindType::Transmitter), Some(1))
        .unwrap();
}

#[test]
fn zero_quota_refuses_the_first_bind() {
    let registry = BindRegistry::new();
    let refused = registry.try_bind("u1", bound("s1", BindType::Transceiver), Some(0));
    assert_eq!(refused, Err(QuotaExceeded));
    assert_eq!(registry.cnx_status("u1").bind_count, 0);
}

#[test]
fn no_quota_means_unlimited() {
    let registry = BindRegistry::new();
    for i in 0..10 {
        registry
            .try_bind("u1", bound(&format!("s{}", i), BindType::Receiver), None)
            .unwrap();
    }
    assert_eq!(registry.cnx_status("u1").bound_connections.bind_receiver, 10);
}

#[test]
fn unbind_is_idempotent() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("s1", BindType::Receiver), None)
        .unwrap();

    registry.unbind("u1", "s1");
    registry.unbind("u1", "s1");
    registry.unbind("u1", "never-bound");
    registry.unbind("ghost", "s1");

    let status = registry.cnx_status("u1");
    assert_eq!(status.unbind_count, 1);
    assert_eq!(status.bound_connections.total(), 0);
}

#[test]
fn bound_connections_match_the_registered_population() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("s1", BindType::Transmitter), None)
        .unwrap();
    registry
        .try_bind("u1", bound("s2", BindType::Receiver), None)
        .unwrap();
    registry
        .try_bind("u1", bound("s3", BindType::Transceiver), None)
        .unwrap();

    let status = registry.cnx_status("u1");
    assert_eq!(
        status.bound_connections.total() as usize,
        registry.bound_sessions("u1").len()
    );

    registry.unbind("u1", "s2");
    let status = registry.cnx_status("u1");
    assert_eq!(status.bound_connections.bind_receiver, 0);
    assert_eq!(
        status.bound_connections.total() as usize,
        registry.bound_sessions("u1").len()
    );
}

#[test]
fn select_receiver_never_picks_a_transmitter() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("tx", BindType::Transmitter), None)
        .unwrap();

    assert!(registry.select_receiver("u1").is_none());

    registry
        .try_bind("u1", bound("rx", BindType::Receiver), None)
        .unwrap();
    for _ in 0..5 {
        let picked = registry.select_receiver("u1").unwrap();
        assert_eq!(picked.session_id, "rx");
    }
}

#[test]
fn select_receiver_round_robins_across_eligible_sessions() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("rx1", BindType::Receiver), None)
        .unwrap();
    registry
        .try_bind("u1", bound("trx", BindType::Transceiver), None)
        .unwrap();

    let first = registry.select_receiver("u1").unwrap();
    let second = registry.select_receiver("u1").unwrap();
    let third = registry.select_receiver("u1").unwrap();

    assert_eq!(first.session_id, "rx1");
    assert_eq!(second.session_id, "trx");
    assert_eq!(third.session_id, "rx1");
}

#[test]
fn select_receiver_for_unknown_user_is_none() {
    let registry = BindRegistry::new();
    assert!(registry.select_receiver("nobody").is_none());
}

#[test]
fn record_submit_counts_every_request() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("s1", BindType::Transceiver), None)
        .unwrap();

    registry.record_submit("u1");
    registry.record_submit("u1");
    assert_eq!(registry.cnx_status("u1").submit_sm_request_count, 2);
}

#[test]
fn population_spans_users() {
    let registry = BindRegistry::new();
    registry
        .try_bind("u1", bound("s1", BindType::Receiver), None)
        .unwrap();
    registry
        .try_bind("u2", bound("s2", BindType::Transmitter), None)
        .unwrap();

    assert_eq!(registry.population(), 2);
    assert_eq!(registry.all_sessions().len(), 2);

    registry.unbind("u1", "s1");
    assert_eq!(registry.population(), 1);
}
