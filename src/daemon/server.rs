//! The certward server: topology, wiring and API entry points.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use uuid::Uuid;

use crate::api::events::{
    CommandTag, EnrollEvent, GetSubjectEvent, GetSubjectsByTargetEvent,
    GetExpiringSubjectsEvent, RemoveSubjectEvent, RenewSubjectEvent,
};
use crate::api::subject::Subject;
use crate::commons::bus::{ExchangeKind, Message, MessageBus, QueueOptions};
use crate::commons::rpc::RpcClient;
use crate::commons::{Error, WardResult};
use crate::constants::{
    ADMIN_IDENTITY, CHECK_QUEUE, COLLECT_QUEUE, ENROLL_QUEUE, EVENT_EXCHANGE,
    RENEW_QUEUE, REPLY_EXCHANGE, REVOKE_QUEUE, STORE_QUEUE,
};
use crate::daemon::auth::{Identity, Token, TokenService};
use crate::daemon::ca::CaClient;
use crate::daemon::checker::{CertChecker, NetProber};
use crate::daemon::config::Config;
use crate::daemon::lifecycle::{self, LifecycleContext};
use crate::daemon::processor::StoreProcessor;
use crate::daemon::scheduler::Scheduler;
use crate::daemon::store::SubjectStore;

//------------ CertwardServer ------------------------------------------------

pub struct CertwardServer {
    bus: Arc<MessageBus>,
    rpc: RpcClient,
    tokens: TokenService,
    admin_token: Option<String>,
    config: Arc<Config>,
}

impl CertwardServer {
    /// Declares the bus topology and starts every background component.
    ///
    /// A topology failure here is fatal: a daemon whose workers cannot
    /// reach each other must not come up.
    pub fn build(
        config: Arc<Config>,
        ca: Arc<dyn CaClient>,
        store: Arc<dyn SubjectStore>,
        prober: Arc<dyn NetProber>,
    ) -> WardResult<Self> {
        let bus = MessageBus::new();
        Self::declare_topology(&bus, &config)?;

        StoreProcessor::spawn(bus.clone(), store, config.renew_ttl_secs)?;

        lifecycle::spawn_workers(Arc::new(LifecycleContext {
            bus: bus.clone(),
            ca,
            cert_params: config.cert_params.clone(),
            ca_pacing: Duration::from_secs(config.ca_pacing_secs),
        }))?;

        CertChecker::spawn(
            bus.clone(),
            prober,
            config.revoke_unresolvable_hours,
        )?;

        let rpc = RpcClient::new(
            bus.clone(),
            Duration::from_secs(config.rpc_timeout_secs),
        );

        Arc::new(Scheduler::new(
            bus.clone(),
            rpc.clone(),
            Duration::from_secs(config.check_interval_secs),
            Duration::from_secs(config.renew_interval_secs),
            config.renew_before_days,
        ))
        .spawn();

        let tokens = TokenService::new(
            config.token_secret.as_bytes(),
            config.token_validity_hours * 3600,
        )?;

        info!("all workers started");

        Ok(CertwardServer {
            bus,
            rpc,
            tokens,
            admin_token: config.admin_token.clone(),
            config,
        })
    }

    fn declare_topology(
        bus: &Arc<MessageBus>,
        config: &Config,
    ) -> WardResult<()> {
        bus.declare_exchange(EVENT_EXCHANGE, ExchangeKind::Direct)?;
        bus.declare_exchange(REPLY_EXCHANGE, ExchangeKind::Direct)?;

        for queue in [
            ENROLL_QUEUE,
            COLLECT_QUEUE,
            REVOKE_QUEUE,
            CHECK_QUEUE,
            STORE_QUEUE,
        ] {
            bus.declare_queue(queue, QueueOptions::default())?;
            bus.bind_queue(queue, EVENT_EXCHANGE, queue)?;
        }

        // Stale renewal requests expire instead of piling up behind a
        // slow CA.
        bus.declare_queue(
            RENEW_QUEUE,
            QueueOptions::with_ttl_secs(config.renew_ttl_secs),
        )?;
        bus.bind_queue(RENEW_QUEUE, EVENT_EXCHANGE, RENEW_QUEUE)?;

        Ok(())
    }

    pub fn renew_before_days(&self) -> i64 {
        self.config.renew_before_days
    }

    //--- Authentication

    /// Resolves a bearer token to an identity. The configured admin
    /// token short-circuits; everything else must be an issued token.
    pub fn authenticate(&self, bearer: &str) -> WardResult<Identity> {
        if let Some(admin_token) = &self.admin_token {
            if bearer == admin_token {
                return Ok(Identity::admin());
            }
        }
        self.tokens.verify(bearer)
    }

    /// Issues a token for a caller name. Admin only.
    pub fn issue_token(
        &self,
        identity: &Identity,
        name: &str,
    ) -> WardResult<Token> {
        self.require_admin(identity)?;
        if name.is_empty() {
            return Err(Error::ApiInvalid("token name is empty".to_string()));
        }
        self.tokens.issue(name, name == ADMIN_IDENTITY)
    }

    fn require_admin(&self, identity: &Identity) -> WardResult<()> {
        if identity.is_admin() {
            Ok(())
        } else {
            Err(Error::Forbidden(identity.name().to_string()))
        }
    }

    /// A fresh reply-queue identity for one front door request. The
    /// random suffix keeps concurrent requests from the same caller
    /// apart.
    fn reply_identity(&self, identity: &Identity) -> String {
        format!("{}-{}", identity.name(), Uuid::new_v4().simple())
    }

    //--- Subject operations

    /// Registers a subject and starts its enrollment.
    pub async fn add_subject(
        &self,
        identity: &Identity,
        request: EnrollEvent,
    ) -> WardResult<()> {
        self.require_admin(identity)?;
        if request.name.is_empty() {
            return Err(Error::ApiInvalid(
                "subject name is empty".to_string(),
            ));
        }

        if self.find_subject(identity, &request.name).await?.is_some() {
            return Err(Error::SubjectExists(request.name));
        }

        info!("'{}' requested enrollment of '{}'", identity.name(), request.name);
        self.bus.publish(
            EVENT_EXCHANGE,
            ENROLL_QUEUE,
            Message::json(&request)?,
        )
    }

    /// A single subject by name, for callers allowed to see it.
    pub async fn subject(
        &self,
        identity: &Identity,
        name: &str,
    ) -> WardResult<Subject> {
        let subject = self
            .find_subject(identity, name)
            .await?
            .ok_or_else(|| Error::SubjectUnknown(name.to_string()))?;

        if !identity.may_access(&subject) {
            return Err(Error::Forbidden(identity.name().to_string()));
        }
        Ok(subject)
    }

    /// All subjects deployed to a target. Non-admin callers may only
    /// ask for themselves.
    pub async fn subjects_by_target(
        &self,
        identity: &Identity,
        target: &str,
    ) -> WardResult<Vec<Subject>> {
        if !identity.is_admin() && identity.name() != target {
            return Err(Error::Forbidden(identity.name().to_string()));
        }

        let stream = self
            .rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetSubjectsByTarget,
                &GetSubjectsByTargetEvent {
                    target: target.to_string(),
                },
                &self.reply_identity(identity),
            )
            .await?;
        stream.collect().await
    }

    /// All subjects. Admin only.
    pub async fn all_subjects(
        &self,
        identity: &Identity,
    ) -> WardResult<Vec<Subject>> {
        self.require_admin(identity)?;
        let stream = self
            .rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetAllSubjects,
                &crate::api::events::EmptyEvent {},
                &self.reply_identity(identity),
            )
            .await?;
        stream.collect().await
    }

    /// Subjects expiring within `days`. Admin only.
    pub async fn expiring_subjects(
        &self,
        identity: &Identity,
        days: i64,
    ) -> WardResult<Vec<Subject>> {
        self.require_admin(identity)?;
        if days < 0 {
            return Err(Error::ApiInvalid(
                "'days' must not be negative".to_string(),
            ));
        }
        let stream = self
            .rpc
            .request_stream(
                STORE_QUEUE,
                CommandTag::GetExpiringSubjects,
                &GetExpiringSubjectsEvent { days },
                &self.reply_identity(identity),
            )
            .await?;
        stream.collect().await
    }

    /// Queues an immediate renewal of a subject, for callers allowed to
    /// mutate it.
    ///
    /// Only the subject name goes on the queue; the store command
    /// processor resolves the live record when the command is processed,
    /// so a renewal racing another renewal cannot act on a stale
    /// snapshot.
    pub async fn renew_subject(
        &self,
        identity: &Identity,
        name: &str,
    ) -> WardResult<()> {
        let subject = self
            .find_subject(identity, name)
            .await?
            .ok_or_else(|| Error::SubjectUnknown(name.to_string()))?;
        if !identity.may_access(&subject) {
            return Err(Error::Forbidden(identity.name().to_string()));
        }

        info!("'{}' requested renewal of '{}'", identity.name(), name);
        self.bus.publish(
            EVENT_EXCHANGE,
            STORE_QUEUE,
            Message::json(&RenewSubjectEvent {
                name: subject.name,
            })?
            .with_kind(CommandTag::RenewSubject),
        )
    }

    /// Revokes a subject's certificate and removes the record, for
    /// callers allowed to mutate it.
    ///
    /// Removal is resolved by name in the store command processor for
    /// the same reason renewal is: the record the caller looked at may
    /// already have been replaced by the time the command is processed.
    pub async fn remove_subject(
        &self,
        identity: &Identity,
        name: &str,
    ) -> WardResult<()> {
        let subject = self
            .find_subject(identity, name)
            .await?
            .ok_or_else(|| Error::SubjectUnknown(name.to_string()))?;
        if !identity.may_access(&subject) {
            return Err(Error::Forbidden(identity.name().to_string()));
        }

        info!("'{}' requested removal of '{}'", identity.name(), name);
        self.bus.publish(
            EVENT_EXCHANGE,
            STORE_QUEUE,
            Message::json(&RemoveSubjectEvent {
                name: subject.name,
            })?
            .with_kind(CommandTag::RemoveSubject),
        )
    }

    async fn find_subject(
        &self,
        identity: &Identity,
        name: &str,
    ) -> WardResult<Option<Subject>> {
        self.rpc
            .request_one(
                STORE_QUEUE,
                CommandTag::GetSubject,
                &GetSubjectEvent {
                    name: name.to_string(),
                },
                &self.reply_identity(identity),
            )
            .await
    }
}

//============ Tests =========================================================
