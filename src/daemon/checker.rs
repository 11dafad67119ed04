//! The reconciliation checker.
//!
//! For every subject the scheduler hands it, the checker resolves the
//! subject name and compares the serial each resolved address serves over
//! TLS with the serial on record. The observations go back to the store
//! as a status update. A subject that stays unresolvable past the
//! configured threshold is revoked and forgotten; a name nobody can
//! resolve no longer needs a certificate.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use log::{debug, info, warn};

use crate::api::events::{
    CheckCertEvent, CommandTag, DeleteSubjectEvent, RevokeEvent,
};
use crate::api::subject::Timestamp;
use crate::commons::bus::{Delivery, Disposition, Message, MessageBus};
use crate::commons::{Error, WardResult};
use crate::constants::{CHECK_QUEUE, EVENT_EXCHANGE, REVOKE_QUEUE, STORE_QUEUE};
use crate::daemon::crypto;

//------------ NetProber -----------------------------------------------------

/// The checker's view of the network.
#[async_trait]
pub trait NetProber: Send + Sync {
    /// Resolves a name to its addresses.
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>>;

    /// The decimal serial of the certificate served at `addr`, with
    /// `sni` as the server name.
    async fn peer_serial(
        &self,
        addr: SocketAddr,
        sni: &str,
    ) -> WardResult<String>;
}

/// The [`NetProber`] backed by the system resolver and real TLS
/// handshakes.
#[derive(Default)]
pub struct SystemProber;

#[async_trait]
impl NetProber for SystemProber {
    async fn resolve(&self, name: &str) -> io::Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((name, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }

    async fn peer_serial(
        &self,
        addr: SocketAddr,
        sni: &str,
    ) -> WardResult<String> {
        let sni = sni.to_string();
        // The OpenSSL handshake is blocking.
        tokio::task::spawn_blocking(move || crypto::live_serial(addr, &sni))
            .await
            .map_err(|e| Error::custom(format!("probe task failed: {e}")))?
    }
}

//------------ CertChecker ---------------------------------------------------

pub struct CertChecker {
    bus: Arc<MessageBus>,
    prober: Arc<dyn NetProber>,
    revoke_unresolvable_after: ChronoDuration,
}

impl CertChecker {
    /// Registers the checker as the consumer of the check queue.
    pub fn spawn(
        bus: Arc<MessageBus>,
        prober: Arc<dyn NetProber>,
        revoke_unresolvable_hours: i64,
    ) -> WardResult<()> {
        let checker = Arc::new(CertChecker {
            bus: bus.clone(),
            prober,
            revoke_unresolvable_after: ChronoDuration::hours(
                revoke_unresolvable_hours,
            ),
        });
        bus.consume(CHECK_QUEUE, move |delivery: Delivery| {
            let checker = checker.clone();
            async move { checker.check(delivery).await }
        })?;
        Ok(())
    }

    async fn check(&self, delivery: Delivery) -> Disposition {
        let mut event: CheckCertEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => {
                warn!("check: dropping malformed message: {e}");
                return Disposition::Drop;
            }
        };

        let addrs = match self.prober.resolve(&event.name).await {
            Ok(addrs) if !addrs.is_empty() => addrs,
            _ => return self.unresolvable(event),
        };
        event.unresolvable_since = None;

        let mut targets = Vec::new();
        let mut outdated = Vec::new();
        for addr in addrs {
            let addr = SocketAddr::new(addr, event.port);
            match self.prober.peer_serial(addr, &event.name).await {
                Ok(serial) if serial == event.serial => {
                    targets.push(addr.ip().to_string())
                }
                Ok(serial) => {
                    debug!(
                        "'{}': {} serves serial {} instead of {}",
                        event.name,
                        addr,
                        serial,
                        event.serial
                    );
                    outdated.push(addr.ip().to_string())
                }
                // A failed handshake is neither a match nor a mismatch.
                Err(e) => debug!("'{}': probe of {addr} failed: {e}", event.name),
            }
        }

        event.matched = outdated.is_empty() && !targets.is_empty();
        event.targets = targets;
        event.outdated = outdated;
        self.publish_status(event)
    }

    fn unresolvable(&self, mut event: CheckCertEvent) -> Disposition {
        let since = *event.unresolvable_since.get_or_insert(Timestamp::now());

        if Timestamp::now() - since > self.revoke_unresolvable_after {
            info!(
                "'{}' unresolvable since {}, revoking cert {}",
                event.name, since, event.cert_id
            );
            return self.revoke_and_forget(&event);
        }

        warn!("'{}' does not resolve", event.name);
        event.targets.clear();
        event.outdated.clear();
        event.matched = false;
        self.publish_status(event)
    }

    fn revoke_and_forget(&self, event: &CheckCertEvent) -> Disposition {
        let result = Message::json(&RevokeEvent {
            cert_id: event.cert_id,
            name: event.name.clone(),
        })
        .and_then(|message| {
            self.bus.publish(EVENT_EXCHANGE, REVOKE_QUEUE, message)
        })
        .and_then(|()| {
            let message = Message::json(&DeleteSubjectEvent {
                cert_id: event.cert_id,
                id: Some(event.id),
            })?
            .with_kind(CommandTag::DeleteSubject);
            self.bus.publish("", STORE_QUEUE, message)
        });

        match result {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!("'{}': could not revoke, will retry: {e}", event.name);
                Disposition::Requeue
            }
        }
    }

    fn publish_status(&self, event: CheckCertEvent) -> Disposition {
        let result = Message::json(&event).and_then(|message| {
            self.bus.publish(
                "",
                STORE_QUEUE,
                message.with_kind(CommandTag::UpdateStatus),
            )
        });
        match result {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                warn!(
                    "'{}': could not publish status, will retry: {e}",
                    event.name
                );
                Disposition::Requeue
            }
        }
    }
}

//============ Tests =========================================================
