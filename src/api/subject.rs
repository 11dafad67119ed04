//! The central entity: one [`Subject`] per managed certificate identity.

use std::fmt;
use std::ops::{Add, Sub};

use chrono::{Duration, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};

//------------ Timestamp -----------------------------------------------------

/// A Unix timestamp with second granularity.
///
/// Arithmetic saturates at the i64 bounds; window parameters arrive from
/// API callers unvalidated and only ever feed ordering comparisons.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Ord, PartialEq, PartialOrd,
    Serialize,
)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(secs: i64) -> Self {
        Timestamp(secs)
    }

    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp())
    }

    pub fn now_plus_hours(hours: i64) -> Self {
        Timestamp(
            Utc::now()
                .timestamp()
                .saturating_add(hours.saturating_mul(3600)),
        )
    }

    pub fn now_minus_hours(hours: i64) -> Self {
        Timestamp(
            Utc::now()
                .timestamp()
                .saturating_sub(hours.saturating_mul(3600)),
        )
    }

    pub fn now_plus_seconds(secs: i64) -> Self {
        Timestamp(Utc::now().timestamp().saturating_add(secs))
    }

    pub fn timestamp(self) -> i64 {
        self.0
    }

    pub fn into_rfc3339(self) -> String {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .unwrap_or_default()
            .to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Self;

    fn add(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_add(duration.num_seconds()))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Self;

    fn sub(self, duration: Duration) -> Self {
        Timestamp(self.0.saturating_sub(duration.num_seconds()))
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = Duration;

    fn sub(self, other: Timestamp) -> Duration {
        Duration::seconds(self.0 - other.0)
    }
}

impl From<Timestamp> for i64 {
    fn from(t: Timestamp) -> i64 {
        t.0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.into_rfc3339().fmt(f)
    }
}

//------------ LifecycleState ------------------------------------------------

/// The lifecycle state persisted on every subject record.
///
/// The state machine is distributed over the lifecycle workers: each worker
/// performs exactly one transition. Persisting the state explicitly lets
/// operators and tests see where a subject is, instead of inferring it from
/// which queue last touched the record.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No record exists yet; the zero value on the wire. Enrollment only
    /// creates a record once the CA has accepted the order, so this is
    /// the state a subject carries between the front door and the store.
    #[default]
    Requested,

    /// Enrollment succeeded; the collect worker is waiting for issuance.
    Collecting,

    /// The certificate is collected and considered deployed.
    Active,

    /// A renew event is in flight for this record.
    Renewing,

    /// The record is being revoked and removed.
    Revoking,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LifecycleState::Requested => write!(f, "requested"),
            LifecycleState::Collecting => write!(f, "collecting"),
            LifecycleState::Active => write!(f, "active"),
            LifecycleState::Renewing => write!(f, "renewing"),
            LifecycleState::Revoking => write!(f, "revoking"),
        }
    }
}

//------------ Subject -------------------------------------------------------

/// A managed certificate identity and its current deployment state.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Subject {
    /// Store-assigned record id. Authoritative when disambiguating
    /// deletes under concurrent renewal.
    #[serde(default)]
    pub id: u64,

    /// The hostname (CN) the certificate is issued for.
    #[serde(default)]
    pub name: String,

    /// The port the certificate is served on.
    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub alt_names: Vec<String>,

    /// Addresses the certificate is deployed to, as last verified.
    #[serde(default)]
    pub targets: Vec<String>,

    /// Targets whose live serial did not match the stored serial.
    #[serde(default)]
    pub outdated: Vec<String>,

    /// PEM encoded certificate signing request.
    #[serde(default)]
    pub csr: String,

    /// PEM encoded private key. Sensitive.
    #[serde(default)]
    pub private_key: String,

    /// PEM encoded certificate. Empty until collected.
    #[serde(default)]
    pub certificate: String,

    /// CA-assigned certificate id.
    #[serde(default)]
    pub cert_id: u64,

    /// CA-assigned order id.
    #[serde(default)]
    pub order_id: String,

    /// Decimal serial number of the issued certificate.
    #[serde(default)]
    pub serial: String,

    #[serde(default)]
    pub not_after: Timestamp,

    #[serde(default)]
    pub created: Timestamp,

    #[serde(default)]
    pub updated: Timestamp,

    /// When the subject first failed DNS resolution. `None` exactly when
    /// the subject resolved at the last check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolvable_since: Option<Timestamp>,

    /// True iff `outdated` is empty and at least one target matched at
    /// the last check.
    #[serde(default)]
    pub matched: bool,

    #[serde(default)]
    pub state: LifecycleState,
}

impl Subject {
    /// Whether this is the zero value used as the not-found sentinel on
    /// single-result replies.
    pub fn is_empty(&self) -> bool {
        self.name.is_empty()
    }

    /// Whether the certificate expires within the given number of hours.
    pub fn expires_within_hours(&self, hours: i64) -> bool {
        self.not_after <= Timestamp::now_plus_hours(hours)
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (cert id {}, {})", self.name, self.cert_id, self.state)
    }
}

//============ Tests =========================================================
