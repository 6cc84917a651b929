//! SMPP server factory: accepts connections, owns the bind registry, and
//! routes server-originated traffic to the right bound client.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use rusmpp::{Command, Pdu};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::router::Router;
use crate::smpp::registry::{BindRegistry, SmppsCnxStatus};
use crate::smpp::session::{self, DeliveryError, SessionRequest};

/// Outcome of a successful server→client push.
#[derive(Debug)]
pub struct Delivery {
    /// Session that carried the PDU.
    pub session_id: String,
    /// The peer's response (deliver_sm_resp/data_sm_resp).
    pub response: Command,
}

pub struct SmppServer {
    config: Arc<AppConfig>,
    registry: Arc<BindRegistry>,
    router: Arc<dyn Router>,
    cancel: CancellationToken,
}

impl SmppServer {
    pub fn new(config: Arc<AppConfig>, router: Arc<dyn Router>) -> Self {
        Self {
            config,
            registry: Arc::new(BindRegistry::new()),
            router,
            cancel: CancellationToken::new(),
        }
    }

    /// Accept loop. Runs until [`SmppServer::shutdown`] is called.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let addr = format!("{}:{}", self.config.smpps.host, self.config.smpps.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!(
            "SMPP server '{}' listening on {}",
            self.config.smpps.id,
            addr
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (socket, peer_addr) = accepted?;
                    let config = self.config.clone();
                    let registry = self.registry.clone();
                    let router = self.router.clone();
                    tokio::spawn(async move {
                        session::run_session(socket, peer_addr, config, registry, router).await;
                    });
                }
                _ = self.cancel.cancelled() => {
                    tracing::info!(
                        "SMPP server '{}' stopped accepting connections",
                        self.config.smpps.id
                    );
                    return Ok(());
                }
            }
        }
    }

    /// Route a deliver_sm/data_sm to one of the user's RX/TRX sessions and
    /// wait for the peer's response under the response timer.
    pub async fn send_to_user(&self, uid: &str, pdu: Pdu) -> Result<Delivery, DeliveryError> {
        if !matches!(pdu, Pdu::DeliverSm(_) | Pdu::DataSm(_)) {
            return Err(DeliveryError::NotDeliverable);
        }
        let target = self
            .registry
            .select_receiver(uid)
            .ok_or(DeliveryError::NoBoundReceiver)?;
        tracing::debug!("Routing PDU for user {} to session {}", uid, target.session_id);

        let (done_tx, done_rx) = oneshot::channel();
        target
            .sender
            .send(SessionRequest::Deliver { pdu, done: done_tx })
            .await
            .map_err(|_| DeliveryError::SessionClosed)?;

        let completed = match self.config.smpps.response_timeout() {
            Some(limit) => match timeout(limit, done_rx).await {
                Ok(inner) => inner,
                Err(_) => return Err(DeliveryError::RequestTimeout),
            },
            None => done_rx.await,
        };
        let response = completed.map_err(|_| DeliveryError::SessionClosed)??;
        Ok(Delivery {
            session_id: target.session_id,
            response,
        })
    }

    /// Counter snapshot for a user (all zeros if the user never bound).
    pub fn cnx_status(&self, uid: &str) -> SmppsCnxStatus {
        self.registry.cnx_status(uid)
    }

    /// Current bound-session population for a user.
    pub fn bound_count(&self, uid: &str) -> usize {
        self.registry.bound_sessions(uid).len()
    }

    /// Stop accepting, ask every bound session to unbind, and wait up to
    /// `grace` for the registry to drain. Sessions that outlive the grace
    /// abort themselves once their own unbind grace runs out.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        for session in self.registry.all_sessions() {
            let _ = session.sender.send(SessionRequest::Unbind).await;
        }
        let drained = timeout(grace, async {
            while self.registry.population() > 0 {
                sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                "Shutdown grace expired with {} session(s) still bound",
                self.registry.population()
            );
        }
    }
}
