//! The store command processor.
//!
//! The single consumer of the store command queue, and with that the
//! single writer to the subject store. Mutations are applied in arrival
//! order; queries are answered on the caller's reply queue as a stream of
//! subjects closed by a [`CommandTag::CloseStream`] sentinel. A
//! single-result query gets exactly one message: the sentinel itself,
//! carrying the found subject or the empty subject as the defined
//! not-found reply.

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use log::{debug, error, info, warn};

use crate::api::events::{
    CheckCertEvent, CommandTag, CompleteEnrollEvent, DeleteSubjectEvent,
    GetExpiringSubjectsEvent, GetSubjectEvent, GetSubjectsByTargetEvent,
    NewSubjectEvent, RemoveSubjectEvent, RenewEvent, RenewSubjectEvent,
    RevokeEvent,
};
use crate::api::subject::{LifecycleState, Subject, Timestamp};
use crate::commons::WardResult;
use crate::commons::bus::{Delivery, Disposition, Message, MessageBus};
use crate::constants::{
    EVENT_EXCHANGE, RENEW_QUEUE, REPLY_EXCHANGE, REVOKE_QUEUE, STORE_QUEUE,
};
use crate::daemon::store::SubjectStore;

//------------ StoreProcessor ------------------------------------------------

pub struct StoreProcessor {
    bus: Arc<MessageBus>,
    store: Arc<dyn SubjectStore>,
    /// How long a record may sit in [`LifecycleState::Renewing`] before a
    /// renew command is taken as lost and published again. Matches the
    /// TTL on the renew queue.
    renew_retry_after: ChronoDuration,
}

impl StoreProcessor {
    /// Registers the processor as the consumer of the store command
    /// queue.
    pub fn spawn(
        bus: Arc<MessageBus>,
        store: Arc<dyn SubjectStore>,
        renew_retry_secs: i64,
    ) -> WardResult<()> {
        let processor = Arc::new(StoreProcessor {
            bus: bus.clone(),
            store,
            renew_retry_after: ChronoDuration::seconds(renew_retry_secs),
        });
        bus.consume(STORE_QUEUE, move |delivery: Delivery| {
            let processor = processor.clone();
            async move { processor.process(delivery) }
        })?;
        Ok(())
    }

    fn process(&self, delivery: Delivery) -> Disposition {
        let Some(tag) = delivery.message.kind else {
            warn!("store command without a tag dropped");
            return Disposition::Drop;
        };

        match tag {
            CommandTag::AddSubject => self.add_subject(&delivery),
            CommandTag::UpdateSubject => self.update_subject(&delivery),
            CommandTag::DeleteSubject => self.delete_subject(&delivery),
            CommandTag::RenewSubject => self.renew_subject(&delivery),
            CommandTag::RemoveSubject => self.remove_subject(&delivery),
            CommandTag::UpdateStatus => self.update_status(&delivery),
            CommandTag::GetSubject => self.get_subject(&delivery),
            CommandTag::GetSubjectsByTarget => {
                self.get_subjects_by_target(&delivery)
            }
            CommandTag::GetExpiringSubjects => {
                self.get_expiring_subjects(&delivery)
            }
            CommandTag::GetAllSubjects => self.get_all_subjects(&delivery),
            CommandTag::CloseStream => {
                warn!("close sentinel on the command queue dropped");
                Disposition::Drop
            }
        }
    }

    //--- Mutations

    fn add_subject(&self, delivery: &Delivery) -> Disposition {
        let event: NewSubjectEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("add_subject", e),
        };

        let subject = Subject {
            name: event.name,
            port: event.port,
            csr: event.csr,
            private_key: event.private_key,
            cert_id: event.cert_id,
            order_id: event.order_id,
            alt_names: event.alt_names,
            targets: event.targets,
            ..Default::default()
        };

        match self.store.add(subject) {
            Ok(subject) => {
                debug!("stored subject {subject}");
                Disposition::Ack
            }
            Err(e) => {
                error!("could not store subject: {e}");
                Disposition::Drop
            }
        }
    }

    fn update_subject(&self, delivery: &Delivery) -> Disposition {
        let event: CompleteEnrollEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("update_subject", e),
        };

        match self.store.complete_enrollment(
            event.cert_id,
            &event.certificate,
            &event.serial,
            event.not_after,
        ) {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                error!("could not store certificate: {e}");
                Disposition::Drop
            }
        }
    }

    fn delete_subject(&self, delivery: &Delivery) -> Disposition {
        let event: DeleteSubjectEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("delete_subject", e),
        };

        match self.store.delete(event.cert_id, event.id) {
            Ok(true) => debug!("deleted subject for cert {}", event.cert_id),
            Ok(false) => {
                debug!("subject for cert {} was already gone", event.cert_id)
            }
            Err(e) => error!("could not delete subject: {e}"),
        }
        Disposition::Ack
    }

    /// Starts revoke-then-re-enroll for the record currently holding
    /// this name.
    ///
    /// Resolving the name here, on the serialized command queue, means
    /// the emitted [`RenewEvent`] always carries the live record; a
    /// snapshot taken by the caller could have been replaced by a
    /// renewal queued ahead of this command.
    fn renew_subject(&self, delivery: &Delivery) -> Disposition {
        let event: RenewSubjectEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("renew_subject", e),
        };

        let subject = match self.store.find_by_name(&event.name) {
            Ok(Some(subject)) => subject,
            Ok(None) => {
                debug!("renew '{}': subject is gone", event.name);
                return Disposition::Ack;
            }
            Err(e) => {
                error!("renew lookup failed: {e}");
                return Disposition::Drop;
            }
        };

        match subject.state {
            LifecycleState::Active => {}
            LifecycleState::Renewing
                if Timestamp::now() - subject.updated
                    > self.renew_retry_after =>
            {
                // The earlier renew event was lost or expired on the
                // queue; publish a fresh one.
            }
            state => {
                debug!("renew '{}': skipped in state {state}", subject.name);
                return Disposition::Ack;
            }
        }

        if let Err(e) =
            self.store.update_state(subject.id, LifecycleState::Renewing)
        {
            error!("could not mark '{}' as renewing: {e}", subject.name);
            return Disposition::Drop;
        }

        let result = Message::json(&RenewEvent {
            id: subject.id,
            name: subject.name.clone(),
            port: subject.port,
            cert_id: subject.cert_id,
            alt_names: subject.alt_names.clone(),
            targets: subject.targets.clone(),
        })
        .and_then(|message| {
            self.bus.publish(EVENT_EXCHANGE, RENEW_QUEUE, message)
        });
        match result {
            Ok(()) => {
                info!("renewing '{}' (cert {})", subject.name, subject.cert_id);
                Disposition::Ack
            }
            Err(e) => {
                warn!("renewal of '{}' not queued, retrying: {e}", subject.name);
                if let Err(e) = self
                    .store
                    .update_state(subject.id, LifecycleState::Active)
                {
                    error!("could not reset state: {e}");
                }
                Disposition::Requeue
            }
        }
    }

    /// Revokes the certificate the record holds right now and removes
    /// the record.
    ///
    /// The record moves to [`LifecycleState::Revoking`] before anything
    /// else so a removal left on the queue by a failed revoke publish
    /// cannot race a renew scan into resurrecting the subject.
    fn remove_subject(&self, delivery: &Delivery) -> Disposition {
        let event: RemoveSubjectEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("remove_subject", e),
        };

        let subject = match self.store.find_by_name(&event.name) {
            Ok(Some(subject)) => subject,
            Ok(None) => {
                debug!("remove '{}': subject is already gone", event.name);
                return Disposition::Ack;
            }
            Err(e) => {
                error!("remove lookup failed: {e}");
                return Disposition::Drop;
            }
        };

        if let Err(e) =
            self.store.update_state(subject.id, LifecycleState::Revoking)
        {
            error!("could not mark '{}' as revoking: {e}", subject.name);
            return Disposition::Drop;
        }

        let result = Message::json(&RevokeEvent {
            cert_id: subject.cert_id,
            name: subject.name.clone(),
        })
        .and_then(|message| {
            self.bus.publish(EVENT_EXCHANGE, REVOKE_QUEUE, message)
        });
        if let Err(e) = result {
            warn!("removal of '{}' not queued, retrying: {e}", subject.name);
            return Disposition::Requeue;
        }

        match self.store.delete(subject.cert_id, Some(subject.id)) {
            Ok(_) => {
                info!("removed '{}' (cert {})", subject.name, subject.cert_id);
                Disposition::Ack
            }
            Err(e) => {
                error!("could not remove '{}': {e}", subject.name);
                Disposition::Drop
            }
        }
    }

    fn update_status(&self, delivery: &Delivery) -> Disposition {
        let event: CheckCertEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("update_status", e),
        };

        match self.store.update_reachability(
            event.id,
            event.targets,
            event.outdated,
            event.matched,
            event.unresolvable_since,
        ) {
            Ok(()) => Disposition::Ack,
            Err(e) => {
                // The subject may have been deleted between the scan and
                // this update.
                debug!("dropping status update: {e}");
                Disposition::Drop
            }
        }
    }

    //--- Queries

    fn get_subject(&self, delivery: &Delivery) -> Disposition {
        let event: GetSubjectEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("get_subject", e),
        };

        let subject = match self.store.find_by_name(&event.name) {
            Ok(subject) => subject.unwrap_or_default(),
            Err(e) => {
                error!("subject lookup failed: {e}");
                Subject::default()
            }
        };
        self.reply(delivery, Vec::new(), subject)
    }

    fn get_subjects_by_target(&self, delivery: &Delivery) -> Disposition {
        let event: GetSubjectsByTargetEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("get_subjects_by_target", e),
        };
        self.reply_with(delivery, self.store.find_by_target(&event.target))
    }

    fn get_expiring_subjects(&self, delivery: &Delivery) -> Disposition {
        let event: GetExpiringSubjectsEvent = match delivery.message.parse() {
            Ok(event) => event,
            Err(e) => return malformed("get_expiring_subjects", e),
        };
        // The window arrives from the API unvalidated; saturate instead
        // of overflowing.
        self.reply_with(
            delivery,
            self.store
                .find_expiring_within_hours(event.days.saturating_mul(24)),
        )
    }

    fn get_all_subjects(&self, delivery: &Delivery) -> Disposition {
        self.reply_with(delivery, self.store.find_all())
    }

    fn reply_with(
        &self,
        delivery: &Delivery,
        subjects: WardResult<Vec<Subject>>,
    ) -> Disposition {
        let subjects = match subjects {
            Ok(subjects) => subjects,
            Err(e) => {
                // Close the stream anyway so the caller does not sit on
                // its deadline.
                error!("subject query failed: {e}");
                Vec::new()
            }
        };
        self.reply(delivery, subjects, Subject::default())
    }

    /// Sends the reply stream: every subject in order, then `last` with
    /// the close sentinel.
    fn reply(
        &self,
        delivery: &Delivery,
        subjects: Vec<Subject>,
        last: Subject,
    ) -> Disposition {
        let Some(reply_to) = delivery.message.reply_to.as_deref() else {
            warn!("query without a reply queue dropped");
            return Disposition::Drop;
        };

        for subject in &subjects {
            if self.publish_reply(delivery, reply_to, subject, None).is_err() {
                // The caller gave up and tore its queue down.
                return Disposition::Drop;
            }
        }
        match self.publish_reply(
            delivery,
            reply_to,
            &last,
            Some(CommandTag::CloseStream),
        ) {
            Ok(()) => Disposition::Ack,
            Err(_) => Disposition::Drop,
        }
    }

    fn publish_reply(
        &self,
        delivery: &Delivery,
        reply_to: &str,
        subject: &Subject,
        kind: Option<CommandTag>,
    ) -> WardResult<()> {
        let mut message = Message::json(subject)?;
        message.kind = kind;
        if let Some(id) = &delivery.message.correlation_id {
            message = message.with_correlation_id(id.clone());
        }
        self.bus.publish(REPLY_EXCHANGE, reply_to, message)
    }
}

fn malformed(command: &str, e: crate::commons::Error) -> Disposition {
    warn!("dropping malformed '{command}' command: {e}");
    Disposition::Drop
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::api::events::EnrollEvent;
    use crate::commons::bus::{ExchangeKind, QueueOptions};
    use crate::commons::rpc::RpcClient;
    use crate::daemon::store::MemoryStore;

    fn fixture() -> (Arc<MessageBus>, Arc<MemoryStore>, RpcClient) {
        let bus = MessageBus::new();
        bus.declare_exchange(REPLY_EXCHANGE, ExchangeKind::Direct).unwrap();
        bus.declare_exchange(EVENT_EXCHANGE, ExchangeKind::Direct).unwrap();
        for queue in [STORE_QUEUE, RENEW_QUEUE, REVOKE_QUEUE] {
            bus.declare_queue(queue, QueueOptions::default()).unwrap();
            bus.bind_queue(queue, EVENT_EXCHANGE, queue).unwrap();
        }

        let store = Arc::new(MemoryStore::default());
        StoreProcessor::spawn(bus.clone(), store.clone(), 3600).unwrap();

        let rpc = RpcClient::new(bus.clone(), Duration::from_secs(2));
        (bus, store, rpc)
    }

    /// Collects the events a lifecycle queue received, in arrival order.
    fn drain<T>(
        bus: &Arc<MessageBus>,
        queue: &str,
    ) -> tokio::sync::mpsc::UnboundedReceiver<T>
    where
        T: serde::de::DeserializeOwned + Send + 'static,
    {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        bus.consume(queue, move |delivery: Delivery| {
            let tx = tx.clone();
            async move {
                if let Ok(event) = delivery.message.parse::<T>() {
                    let _ = tx.send(event);
                }
                Disposition::Ack
            }
        })
        .unwrap();
        rx
    }

    fn add_command(name: &str, cert_id: u64) -> Message {
        Message::json(&NewSubjectEvent {
            name: name.to_string(),
            port: 443,
            csr: "--csr--".to_string(),
            private_key: "--key--".to_string(),
            cert_id,
            order_id: "order-1".to_string(),
            alt_names: vec![],
            targets: vec!["10.0.0.1".to_string()],
        })
        .unwrap()
        .with_kind(CommandTag::AddSubject)
    }

    #[tokio::test]
    async fn add_then_get_round_trips_through_the_queue() {
        let (bus, _store, rpc) = fixture();

        bus.publish("", STORE_QUEUE, add_command("a.example.com", 42))
            .unwrap();

        let subject = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-1",
            )
            .await
            .unwrap()
            .expect("subject should exist");

        assert_eq!(subject.cert_id, 42);
        assert_eq!(subject.id, 1);
    }

    #[tokio::test]
    async fn missing_subject_closes_with_the_empty_sentinel() {
        let (_bus, _store, rpc) = fixture();

        let result = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "nobody.example.com".to_string(),
                },
                "test-caller-2",
            )
            .await
            .unwrap();

        assert!(result.is_none());
    }

    #[tokio::test]
    async fn target_query_streams_all_matches() {
        let (bus, _store, rpc) = fixture();

        bus.publish("", STORE_QUEUE, add_command("a.example.com", 1))
            .unwrap();
        bus.publish("", STORE_QUEUE, add_command("b.example.com", 2))
            .unwrap();

        let stream = rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetSubjectsByTarget,
                &GetSubjectsByTargetEvent {
                    target: "10.0.0.1".to_string(),
                },
                "test-caller-3",
            )
            .await
            .unwrap();

        let subjects = stream.collect().await.unwrap();
        assert_eq!(subjects.len(), 2);
        assert_eq!(subjects[0].name, "a.example.com");
        assert_eq!(subjects[1].name, "b.example.com");
    }

    #[tokio::test]
    async fn untagged_and_malformed_commands_do_not_kill_the_processor() {
        let (bus, _store, rpc) = fixture();

        // No tag at all.
        bus.publish("", STORE_QUEUE, Message::json(&()).unwrap()).unwrap();
        // Wrong body for the tag.
        bus.publish(
            "",
            STORE_QUEUE,
            Message::json(&EnrollEvent {
                name: "x".to_string(),
                port: 443,
                alt_names: vec![],
                targets: vec![],
            })
            .unwrap()
            .with_kind(CommandTag::DeleteSubject),
        )
        .unwrap();

        bus.publish("", STORE_QUEUE, add_command("a.example.com", 1))
            .unwrap();

        let subject = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-4",
            )
            .await
            .unwrap();

        assert!(subject.is_some());
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let (bus, store, rpc) = fixture();

        bus.publish("", STORE_QUEUE, add_command("a.example.com", 42))
            .unwrap();
        for _ in 0..2 {
            bus.publish(
                "",
                STORE_QUEUE,
                Message::json(&DeleteSubjectEvent {
                    cert_id: 42,
                    id: None,
                })
                .unwrap()
                .with_kind(CommandTag::DeleteSubject),
            )
            .unwrap();
        }

        // Queries are processed in order after the deletes.
        let result = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-5",
            )
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(store.find_all().unwrap().is_empty());
    }

    fn stored_subject(name: &str, cert_id: u64) -> Subject {
        Subject {
            name: name.to_string(),
            port: 443,
            cert_id,
            targets: vec!["10.0.0.1".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn removal_targets_the_record_present_at_processing_time() {
        let (bus, store, rpc) = fixture();
        let mut revokes = drain::<RevokeEvent>(&bus, REVOKE_QUEUE);

        // A renewal replaced the record after the operator looked it up:
        // the original cert 42 is gone, cert 43 holds the name now.
        let original = store.add(stored_subject("a.example.com", 42)).unwrap();
        store.delete(42, Some(original.id)).unwrap();
        store.add(stored_subject("a.example.com", 43)).unwrap();

        bus.publish(
            "",
            STORE_QUEUE,
            Message::json(&RemoveSubjectEvent {
                name: "a.example.com".to_string(),
            })
            .unwrap()
            .with_kind(CommandTag::RemoveSubject),
        )
        .unwrap();

        let revoke = tokio::time::timeout(Duration::from_secs(1), revokes.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(revoke.cert_id, 43);

        let result = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-6",
            )
            .await
            .unwrap();
        assert!(result.is_none());

        // Removing an already removed subject is fine and revokes
        // nothing.
        bus.publish(
            "",
            STORE_QUEUE,
            Message::json(&RemoveSubjectEvent {
                name: "a.example.com".to_string(),
            })
            .unwrap()
            .with_kind(CommandTag::RemoveSubject),
        )
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(revokes.try_recv().is_err());
    }

    #[tokio::test]
    async fn renew_commands_emit_the_live_record_once() {
        let (bus, store, rpc) = fixture();
        let mut renewals = drain::<RenewEvent>(&bus, RENEW_QUEUE);

        let stored = store.add(stored_subject("a.example.com", 42)).unwrap();
        store
            .complete_enrollment(
                42,
                "--pem--",
                "7",
                Timestamp::now_plus_hours(100),
            )
            .unwrap();

        let renew_command = || {
            Message::json(&RenewSubjectEvent {
                name: "a.example.com".to_string(),
            })
            .unwrap()
            .with_kind(CommandTag::RenewSubject)
        };
        bus.publish("", STORE_QUEUE, renew_command()).unwrap();

        let renewal = tokio::time::timeout(Duration::from_secs(1), renewals.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(renewal.id, stored.id);
        assert_eq!(renewal.cert_id, 42);
        assert_eq!(renewal.targets, vec!["10.0.0.1".to_string()]);

        let subject = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-7",
            )
            .await
            .unwrap()
            .expect("subject should still exist");
        assert_eq!(subject.state, LifecycleState::Renewing);

        // A second command while the renew event is in flight is a
        // duplicate and emits nothing.
        bus.publish("", STORE_QUEUE, renew_command()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(renewals.try_recv().is_err());
    }

    #[tokio::test]
    async fn oversized_expiry_windows_are_still_answered() {
        let (_bus, store, rpc) = fixture();

        store.add(stored_subject("a.example.com", 42)).unwrap();
        store
            .complete_enrollment(
                42,
                "--pem--",
                "7",
                Timestamp::now_plus_hours(100),
            )
            .unwrap();

        let stream = rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetExpiringSubjects,
                &GetExpiringSubjectsEvent { days: i64::MAX },
                "test-caller-8",
            )
            .await
            .unwrap();
        assert_eq!(stream.collect().await.unwrap().len(), 1);

        // The processor is still alive for the next query.
        let subject = rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: "a.example.com".to_string(),
                },
                "test-caller-9",
            )
            .await
            .unwrap();
        assert!(subject.is_some());
    }
}
