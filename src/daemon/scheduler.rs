//! Periodic scans driving checks and renewals.
//!
//! The scheduler is the only component that initiates work by itself.
//! On every tick it asks the store for subjects over RPC and fans the
//! results out as events; a failed scan is logged and retried on the
//! next tick, never in between.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::api::events::{
    CheckCertEvent, CommandTag, EmptyEvent, GetExpiringSubjectsEvent,
    RenewSubjectEvent,
};
use crate::commons::WardResult;
use crate::commons::bus::{Message, MessageBus};
use crate::commons::rpc::RpcClient;
use crate::constants::{
    CHECK_QUEUE, EVENT_EXCHANGE, SCHEDULER_IDENTITY, STORE_QUEUE,
};

//------------ Scheduler -----------------------------------------------------

pub struct Scheduler {
    bus: Arc<MessageBus>,
    rpc: RpcClient,
    check_interval: Duration,
    renew_interval: Duration,
    renew_before_days: i64,
}

impl Scheduler {
    pub fn new(
        bus: Arc<MessageBus>,
        rpc: RpcClient,
        check_interval: Duration,
        renew_interval: Duration,
        renew_before_days: i64,
    ) -> Self {
        Scheduler {
            bus,
            rpc,
            check_interval,
            renew_interval,
            renew_before_days,
        }
    }

    /// Starts the two scan loops. Within each loop scans run strictly
    /// one after the other, so the scheduler's reply queues never see
    /// concurrent use.
    pub fn spawn(self: Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let checks = {
            let scheduler = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(scheduler.check_interval);
                loop {
                    interval.tick().await;
                    if let Err(e) = scheduler.check_scan().await {
                        error!("check scan failed: {e}");
                    }
                }
            })
        };

        let renewals = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.renew_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.renew_scan().await {
                    error!("renewal scan failed: {e}");
                }
            }
        });

        (checks, renewals)
    }

    /// Fetches all subjects and queues a reconciliation check for each.
    pub async fn check_scan(&self) -> WardResult<()> {
        let stream = self
            .rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetAllSubjects,
                &EmptyEvent {},
                &format!("{SCHEDULER_IDENTITY}-check"),
            )
            .await?;
        let subjects = stream.collect().await?;

        debug!("queueing checks for {} subjects", subjects.len());
        for subject in &subjects {
            self.bus.publish(
                EVENT_EXCHANGE,
                CHECK_QUEUE,
                Message::json(&CheckCertEvent::for_subject(subject))?,
            )?;
        }
        Ok(())
    }

    /// Fetches subjects expiring within the renewal window and hands
    /// each one to the store command processor as a renew command. The
    /// processor resolves the live record, skips subjects with a renew
    /// event already in flight, and emits the actual renew event onto
    /// the TTL-guarded renew queue.
    pub async fn renew_scan(&self) -> WardResult<()> {
        let stream = self
            .rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetExpiringSubjects,
                &GetExpiringSubjectsEvent {
                    days: self.renew_before_days,
                },
                &format!("{SCHEDULER_IDENTITY}-renew"),
            )
            .await?;
        let subjects = stream.collect().await?;

        if !subjects.is_empty() {
            info!("queueing renewal of {} subjects", subjects.len());
        }
        for subject in &subjects {
            self.bus.publish(
                EVENT_EXCHANGE,
                STORE_QUEUE,
                Message::json(&RenewSubjectEvent {
                    name: subject.name.clone(),
                })?
                .with_kind(CommandTag::RenewSubject),
            )?;
        }
        Ok(())
    }
}

//============ Tests =========================================================
