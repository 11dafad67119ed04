//! The lifecycle workers: enroll, collect, renew and revoke.
//!
//! Each worker consumes one queue and performs one transition. A
//! malformed message is rejected without requeue; a transient CA failure
//! is requeued so the transition is retried. Every CA call is preceded by
//! a pacing sleep, since the CA rate-limits and a backlog must be drained
//! slowly.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};

use crate::api::events::{
    CollectEvent, CommandTag, CompleteEnrollEvent, DeleteSubjectEvent,
    EnrollEvent, NewSubjectEvent, RenewEvent, RevokeEvent,
};
use crate::commons::WardResult;
use crate::commons::bus::{Delivery, Disposition, Message, MessageBus};
use crate::constants::{
    COLLECT_QUEUE, ENROLL_QUEUE, EVENT_EXCHANGE, RENEW_QUEUE, REVOKE_QUEUE,
    STORE_QUEUE,
};
use crate::daemon::ca::{CaClient, CaError, EnrollRequest};
use crate::daemon::config::CertParams;
use crate::daemon::crypto;

//------------ LifecycleContext ----------------------------------------------

/// What every lifecycle worker needs.
pub struct LifecycleContext {
    pub bus: Arc<MessageBus>,
    pub ca: Arc<dyn CaClient>,
    pub cert_params: CertParams,
    pub ca_pacing: Duration,
}

impl LifecycleContext {
    async fn pace(&self) {
        if !self.ca_pacing.is_zero() {
            tokio::time::sleep(self.ca_pacing).await;
        }
    }

    fn publish_event(&self, queue: &str, message: Message) -> WardResult<()> {
        self.bus.publish(EVENT_EXCHANGE, queue, message)
    }

    fn publish_command(
        &self,
        tag: CommandTag,
        message: Message,
    ) -> WardResult<()> {
        self.bus
            .publish(EVENT_EXCHANGE, STORE_QUEUE, message.with_kind(tag))
    }
}

/// Registers all four workers on their queues.
pub fn spawn_workers(context: Arc<LifecycleContext>) -> WardResult<()> {
    for (queue, handler) in [
        (ENROLL_QUEUE, handle_enroll as Handler),
        (COLLECT_QUEUE, handle_collect as Handler),
        (RENEW_QUEUE, handle_renew as Handler),
        (REVOKE_QUEUE, handle_revoke as Handler),
    ] {
        let context = context.clone();
        context.bus.clone().consume(queue, move |delivery: Delivery| {
            let context = context.clone();
            async move { handler(context, delivery).await }
        })?;
    }
    Ok(())
}

type Handler = fn(
    Arc<LifecycleContext>,
    Delivery,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Disposition> + Send>,
>;

//------------ Enroll --------------------------------------------------------

fn handle_enroll(
    context: Arc<LifecycleContext>,
    delivery: Delivery,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Disposition> + Send>>
{
    Box::pin(async move { enroll(&context, delivery).await })
}

async fn enroll(
    context: &LifecycleContext,
    delivery: Delivery,
) -> Disposition {
    let event: EnrollEvent = match delivery.message.parse() {
        Ok(event) => event,
        Err(e) => {
            warn!("enroll: dropping malformed message: {e}");
            return Disposition::Drop;
        }
    };

    info!("enrolling '{}'", event.name);

    let material = match crypto::new_key_and_csr(
        &event.name,
        &event.alt_names,
        &context.cert_params,
    ) {
        Ok(material) => material,
        Err(e) => {
            error!("enroll '{}': could not build a CSR: {e}", event.name);
            return Disposition::Drop;
        }
    };

    context.pace().await;

    let response = match context
        .ca
        .enroll(&EnrollRequest {
            name: event.name.clone(),
            csr: material.csr.clone(),
            alt_names: event.alt_names.clone(),
        })
        .await
    {
        Ok(response) => response,
        Err(e) if e.is_transient() => {
            warn!("enroll '{}' failed, will retry: {e}", event.name);
            return Disposition::Requeue;
        }
        Err(e) => {
            error!("enroll '{}' rejected by the CA: {e}", event.name);
            return Disposition::Drop;
        }
    };

    info!(
        "enrolled '{}' as cert {} (order {})",
        event.name, response.cert_id, response.order_id
    );

    // Record first, then trigger pickup.
    let result = store_new_subject(context, &event, &material, &response)
        .and_then(|()| {
            context.publish_event(
                COLLECT_QUEUE,
                Message::json(&CollectEvent {
                    cert_id: response.cert_id,
                })?,
            )
        });
    if let Err(e) = result {
        // Only happens while shutting down; the certificate is ordered
        // but untracked, which the operator must resolve at the CA.
        error!("enroll '{}': could not publish follow-up: {e}", event.name);
        return Disposition::Drop;
    }

    Disposition::Ack
}

fn store_new_subject(
    context: &LifecycleContext,
    event: &EnrollEvent,
    material: &crypto::KeyMaterial,
    response: &crate::daemon::ca::EnrollResponse,
) -> WardResult<()> {
    context.publish_command(
        CommandTag::AddSubject,
        Message::json(&NewSubjectEvent {
            name: event.name.clone(),
            port: event.port,
            csr: material.csr.clone(),
            private_key: material.private_key.clone(),
            cert_id: response.cert_id,
            order_id: response.order_id.clone(),
            alt_names: event.alt_names.clone(),
            targets: event.targets.clone(),
        })?,
    )
}

//------------ Collect -------------------------------------------------------

fn handle_collect(
    context: Arc<LifecycleContext>,
    delivery: Delivery,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Disposition> + Send>>
{
    Box::pin(async move { collect(&context, delivery).await })
}

async fn collect(
    context: &LifecycleContext,
    delivery: Delivery,
) -> Disposition {
    let event: CollectEvent = match delivery.message.parse() {
        Ok(event) => event,
        Err(e) => {
            warn!("collect: dropping malformed message: {e}");
            return Disposition::Drop;
        }
    };

    context.pace().await;

    let pem = match context.ca.collect(event.cert_id).await {
        Ok(pem) => pem,
        Err(e) => {
            // Issuance regularly takes a while; keep retrying.
            warn!("collect {} not done yet: {e}", event.cert_id);
            return Disposition::Requeue;
        }
    };

    // A CA that answers 200 before issuance finished sends a body that
    // is not a certificate.
    let parsed = match crypto::parse_certificate(&pem) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "collect {}: response is not a certificate, will retry: {e}",
                event.cert_id
            );
            return Disposition::Requeue;
        }
    };

    info!(
        "collected cert {} (serial {}, expires {})",
        event.cert_id, parsed.serial, parsed.not_after
    );

    let result = context.publish_command(
        CommandTag::UpdateSubject,
        match Message::json(&CompleteEnrollEvent {
            cert_id: event.cert_id,
            certificate: pem,
            serial: parsed.serial,
            not_after: parsed.not_after,
        }) {
            Ok(message) => message,
            Err(e) => {
                error!("collect {}: {e}", event.cert_id);
                return Disposition::Drop;
            }
        },
    );
    match result {
        Ok(()) => Disposition::Ack,
        Err(e) => {
            warn!("collect {}: could not store, will retry: {e}", event.cert_id);
            Disposition::Requeue
        }
    }
}

//------------ Renew ---------------------------------------------------------

fn handle_renew(
    context: Arc<LifecycleContext>,
    delivery: Delivery,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Disposition> + Send>>
{
    Box::pin(async move { renew(&context, delivery).await })
}

/// Renewal is revoke-then-re-enroll: revoke the old certificate, forget
/// the old record, enroll afresh. The order matters; the new enrollment
/// must not find the old record still present.
async fn renew(
    context: &LifecycleContext,
    delivery: Delivery,
) -> Disposition {
    let event: RenewEvent = match delivery.message.parse() {
        Ok(event) => event,
        Err(e) => {
            warn!("renew: dropping malformed message: {e}");
            return Disposition::Drop;
        }
    };

    info!("renewing '{}' (cert {})", event.name, event.cert_id);

    let result = context
        .publish_event(
            REVOKE_QUEUE,
            match revoke_message(&event) {
                Ok(message) => message,
                Err(e) => {
                    error!("renew '{}': {e}", event.name);
                    return Disposition::Drop;
                }
            },
        )
        .and_then(|()| {
            context.publish_command(
                CommandTag::DeleteSubject,
                Message::json(&DeleteSubjectEvent {
                    cert_id: event.cert_id,
                    id: Some(event.id),
                })?,
            )
        })
        .and_then(|()| {
            context.publish_event(
                ENROLL_QUEUE,
                Message::json(&EnrollEvent {
                    name: event.name.clone(),
                    port: event.port,
                    alt_names: event.alt_names.clone(),
                    targets: event.targets.clone(),
                })?,
            )
        });

    if let Err(e) = result {
        // The next renewal scan finds this subject again.
        error!("renew '{}' could not be published: {e}", event.name);
        return Disposition::Drop;
    }
    Disposition::Ack
}

fn revoke_message(event: &RenewEvent) -> WardResult<Message> {
    Message::json(&RevokeEvent {
        cert_id: event.cert_id,
        name: event.name.clone(),
    })
}

//------------ Revoke --------------------------------------------------------

fn handle_revoke(
    context: Arc<LifecycleContext>,
    delivery: Delivery,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Disposition> + Send>>
{
    Box::pin(async move { revoke(&context, delivery).await })
}

async fn revoke(
    context: &LifecycleContext,
    delivery: Delivery,
) -> Disposition {
    let event: RevokeEvent = match delivery.message.parse() {
        Ok(event) => event,
        Err(e) => {
            warn!("revoke: dropping malformed message: {e}");
            return Disposition::Drop;
        }
    };

    context.pace().await;

    match context.ca.revoke(event.cert_id).await {
        Ok(()) => {
            info!("revoked cert {} ('{}')", event.cert_id, event.name);
            Disposition::Ack
        }
        Err(CaError::NotFound) => {
            warn!("cert {} was already gone at the CA", event.cert_id);
            Disposition::Ack
        }
        Err(e) if e.is_transient() => {
            warn!("revoke {} failed, will retry: {e}", event.cert_id);
            Disposition::Requeue
        }
        Err(e) => {
            error!("revoke {} rejected by the CA: {e}", event.cert_id);
            Disposition::Drop
        }
    }
}

//============ Tests =========================================================
