//! End-to-end messaging scenarios: submit legality per bind type, routing
//! of server-originated deliveries, and the policy matrix over the wire.

use std::time::Duration;

use regex::Regex;
use rusmpp::{CommandStatus, Pdu};
use tokio::time::sleep;


use test_utils::{TEST_MESSAGE, TestClient, TestServer, deliver_sm, submit_sm_full};

#[tokio::test]
async fn accepted_submit_returns_a_message_id() {
    let ts = TestServer::start().await;
    let mut client = TestClient::connect(&ts).await;
    client.bind_ok("transceiver").await;

    let resp = client.submit("1234", "4567", TEST_MESSAGE).await;
    assert_eq!(resp.status(), CommandStatus::EsmeRok);
    let Some(Pdu::SubmitSmResp(body)) = resp.pdu() else {
        panic!("expected submit_sm_resp, got {:?}", resp.pdu());
    };
    assert!(!body.message_id().to_string().is_empty());

    assert_eq!(ts.server.cnx_status("u1").submit_sm_request_count, 1);
}

#[tokio::test]
async fn receiver_submitting_is_torn_down() {
    let ts = TestServer::start().await;
    let mut client = TestClient::connect(&ts).await;
    client.bind_ok("receiver").await;

    let resp = client.submit("1234", "4567", TEST_MESSAGE).await;
    assert_eq!(resp.status(), CommandStatus::EsmeRinvbndsts);
    assert!(matches!(resp.pdu(), Some(Pdu::GenericNack)));

    client.expect_closed().await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(ts.server.bound_count("u1"), 0);
}

#[tokio::test]
async fn deliver_sm_reaches_the_receiver_and_never_the_transmitter() {
    let ts = TestServer::start().await;

    let mut tx_client = TestClient::connect(&ts).await;
    tx_client.bind_ok("transmitter").await;
    let mut rx_client = TestClient::connect(&ts).await;
    rx_client.bind_ok("receiver").await;

    let server = ts.server.clone();
    let push = tokio::spawn(async move {
        server
            .send_to_user("u1", Pdu::DeliverSm(deliver_sm("4567", "1234", TEST_MESSAGE)))
            .await
    });

    // The receiver sees the deliver_sm, with every field intact
    let delivered = rx_client.recv().await;
    let seq = delivered.sequence_number();
    let Some(Pdu::DeliverSm(body)) = delivered.pdu() else {
        panic!("expected deliver_sm, got {:?}", delivered.pdu());
    };
    assert_eq!(body.source_addr.to_string(), "4567");
    assert_eq!(body.destination_addr.to_string(), "1234");
    assert_eq!(body.short_message().as_ref(), TEST_MESSAGE.as_bytes());
    rx_client.ack_deliver(seq).await;

    let delivery = push.await.unwrap().expect("delivery should succeed");
    assert_eq!(delivery.response.status(), CommandStatus::EsmeRok);

    // The transmitter must see nothing
    assert!(
        tx_client
            .recv_within(Duration::from_secs(1))
            .await
            .is_none()
    );

    assert_eq!(tx_client.unbind().await.status(), CommandStatus::EsmeRok);
    assert_eq!(rx_client.unbind().await.status(), CommandStatus::EsmeRok);
}

#[tokio::test]
async fn delivery_without_a_receiver_session_fails() {
    let ts = TestServer::start().await;
    let mut client = TestClient::connect(&ts).await;
    client.bind_ok("transmitter").await;

    let err = ts
        .server
        .send_to_user("u1", Pdu::DeliverSm(deliver_sm("4567", "1234", TEST_MESSAGE)))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        smpp_gate::smpp::session::DeliveryError::NoBoundReceiver
    );
}

#[tokio::test]
async fn delivery_times_out_when_the_peer_stays_silent() {
    let ts = TestServer::start_with(|c| c.response_timer_secs = 1).await;
    let mut rx_client = TestClient::connect(&ts).await;
    rx_client.bind_ok("receiver").await;

    let err = ts
        .server
        .send_to_user("u1", Pdu::DeliverSm(deliver_sm("4567", "1234", TEST_MESSAGE)))
        .await
        .unwrap_err();
    assert_eq!(err, smpp_gate::smpp::session::DeliveryError::RequestTimeout);
}

#[tokio::test]
async fn deliveries_round_robin_across_receivers() {
    let ts = TestServer::start().await;

    let mut rx1 = TestClient::connect(&ts).await;
    rx1.bind_ok("receiver").await;
    let mut rx2 = TestClient::connect(&ts).await;
    rx2.bind_ok("receiver").await;

    for expected in [&mut rx1, &mut rx2] {
        let server = ts.server.clone();
        let push = tokio::spawn(async move {
            server
                .send_to_user("u1", Pdu::DeliverSm(deliver_sm("4567", "1234", TEST_MESSAGE)))
                .await
        });
        let delivered = expected.recv().await;
        assert!(matches!(delivered.pdu(), Some(Pdu::DeliverSm(_))));
        expected.ack_deliver(delivered.sequence_number()).await;
        push.await.unwrap().expect("delivery should succeed");
    }
}

async fn submit_expecting(
    ts: &TestServer,
    pdu: rusmpp::pdus::SubmitSm,
    expected: CommandStatus,
) {
    let mut client = TestClient::connect(ts).await;
    client.bind_ok("transceiver").await;

    let resp = client.submit_pdu(pdu).await;
    assert_eq!(resp.status(), expected);

    // Policy rejections leave the session bound
    let resp = client.unbind().await;
    assert_eq!(resp.status(), CommandStatus::EsmeRok);
}

#[tokio::test]
async fn unauthorized_smpps_send_is_rejected() {
    let ts = TestServer::start().await;
    ts.router
        .update_user("u1", |u| u.mt_credential.authorizations.smpps_send = false);
    submit_expecting(
        &ts,
        submit_sm_full("1234", "4567", 0, 0, TEST_MESSAGE),
        CommandStatus::EsmeRinvsysid,
    )
    .await;
}

#[tokio::test]
async fn dlr_request_needs_the_dlr_authorization() {
    let ts = TestServer::start().await;
    ts.router.update_user("u1", |u| {
        u.mt_credential.authorizations.set_dlr_level = false
    });
    submit_expecting(
        &ts,
        submit_sm_full("1234", "4567", 0, 1, TEST_MESSAGE),
        CommandStatus::EsmeRinvsysid,
    )
    .await;

    // The same PDU passes once the authorization is granted
    ts.router.update_user("u1", |u| {
        u.mt_credential.authorizations.set_dlr_level = true
    });
    submit_expecting(
        &ts,
        submit_sm_full("1234", "4567", 0, 1, TEST_MESSAGE),
        CommandStatus::EsmeRok,
    )
    .await;
}

#[tokio::test]
async fn explicit_source_needs_the_source_authorization() {
    let ts = TestServer::start().await;
    ts.router.update_user("u1", |u| {
        u.mt_credential.authorizations.set_source_address = false
    });
    submit_expecting(
        &ts,
        submit_sm_full("DEFINED", "4567", 0, 0, TEST_MESSAGE),
        CommandStatus::EsmeRinvsysid,
    )
    .await;
}

#[tokio::test]
async fn elevated_priority_needs_the_priority_authorization() {
    let ts = TestServer::start().await;
    ts.router.update_user("u1", |u| {
        u.mt_credential.authorizations.set_priority = false
    });
    submit_expecting(
        &ts,
        submit_sm_full("1234", "4567", 3, 0, TEST_MESSAGE),
        CommandStatus::EsmeRinvsysid,
    )
    .await;
}

#[tokio::test]
async fn value_filters_reject_with_their_own_statuses() {
    let cases: [(&str, CommandStatus); 4] = [
        ("source_address", CommandStatus::EsmeRinvsrcadr),
        ("destination_address", CommandStatus::EsmeRinvdstadr),
        ("priority", CommandStatus::EsmeRinvprtflg),
        ("content", CommandStatus::EsmeRsyserr),
    ];

    for (field, expected) in cases {
        let ts = TestServer::start().await;
        ts.router.update_user("u1", |u| {
            let re = Some(Regex::new("^A.*").unwrap());
            match field {
                "source_address" => u.mt_credential.filters.source_address = re,
                "destination_address" => u.mt_credential.filters.destination_address = re,
                "priority" => u.mt_credential.filters.priority = re,
                _ => u.mt_credential.filters.content = re,
            }
        });
        submit_expecting(
            &ts,
            submit_sm_full("1234", "4567", 0, 0, TEST_MESSAGE),
            expected,
        )
        .await;
    }
}

#[tokio::test]
async fn rejected_submits_still_count() {
    let ts = TestServer::start().await;
    ts.router.update_user("u1", |u| {
        u.mt_credential.filters.content = Some(Regex::new("^A.*").unwrap())
    });

    let mut client = TestClient::connect(&ts).await;
    client.bind_ok("transceiver").await;

    let resp = client.submit("1234", "4567", TEST_MESSAGE).await;
    assert_eq!(resp.status(), CommandStatus::EsmeRsyserr);
    assert_eq!(ts.server.cnx_status("u1").submit_sm_request_count, 1);
}
