//! Event and command payloads carried on the bus.
//!
//! Every bus message body is the JSON serialization of one of these types.
//! Multi-purpose consumers (the store command processor and reply-queue
//! consumers) dispatch on the envelope's [`CommandTag`] instead of sniffing
//! the body.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::api::subject::{Subject, Timestamp};

//------------ CommandTag ----------------------------------------------------

/// The closed set of command tags carried on envelopes.
///
/// Modeling the tag as an enum gives the store command processor an
/// exhaustive dispatch; an envelope whose tag fails to parse is rejected
/// without requeue, since redelivering it can never succeed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandTag {
    AddSubject,
    UpdateSubject,
    DeleteSubject,
    RenewSubject,
    RemoveSubject,
    UpdateStatus,
    GetSubject,
    GetSubjectsByTarget,
    GetExpiringSubjects,
    GetAllSubjects,

    /// The stream-termination sentinel: no further replies will follow
    /// on this reply queue.
    CloseStream,
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandTag::AddSubject => write!(f, "add_subject"),
            CommandTag::UpdateSubject => write!(f, "update_subject"),
            CommandTag::DeleteSubject => write!(f, "delete_subject"),
            CommandTag::RenewSubject => write!(f, "renew_subject"),
            CommandTag::RemoveSubject => write!(f, "remove_subject"),
            CommandTag::UpdateStatus => write!(f, "update_status"),
            CommandTag::GetSubject => write!(f, "get_subject"),
            CommandTag::GetSubjectsByTarget => {
                write!(f, "get_subjects_by_target")
            }
            CommandTag::GetExpiringSubjects => {
                write!(f, "get_expiring_subjects")
            }
            CommandTag::GetAllSubjects => write!(f, "get_all_subjects"),
            CommandTag::CloseStream => write!(f, "close_stream"),
        }
    }
}

//------------ Lifecycle events ----------------------------------------------

fn default_port() -> u16 {
    443
}

/// Request enrollment of a new certificate for a subject name.
///
/// Also the request body accepted by the front door when registering a
/// subject.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct EnrollEvent {
    pub name: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Trigger certificate pickup for a CA certificate id.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct CollectEvent {
    pub cert_id: u64,
}

/// Request revoke-then-re-enroll of a subject.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RenewEvent {
    pub id: u64,
    pub name: String,
    pub port: u16,
    pub cert_id: u64,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Request revocation of a CA certificate id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RevokeEvent {
    pub cert_id: u64,
    #[serde(default)]
    pub name: String,
}

//------------ Store commands ------------------------------------------------

/// Create a subject record after a successful enrollment.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct NewSubjectEvent {
    pub name: String,
    pub port: u16,
    pub csr: String,
    pub private_key: String,
    pub cert_id: u64,
    pub order_id: String,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub targets: Vec<String>,
}

/// Store the collected certificate on the subject record.
///
/// The collect worker extracts serial and not-after from the PEM so the
/// store command processor does not parse certificates.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CompleteEnrollEvent {
    pub cert_id: u64,
    pub certificate: String,
    pub serial: String,
    pub not_after: Timestamp,
}

/// Delete a subject record.
///
/// `id` is the store record id and, when present, the authoritative
/// selector; `cert_id` alone is the fallback. This disambiguates deletes
/// racing a concurrent renewal of the same certificate id.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct DeleteSubjectEvent {
    pub cert_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
}

/// Start revoke-then-re-enroll for a subject, resolved by name when the
/// command is processed.
///
/// Renewals go through the store command processor so the emitted
/// [`RenewEvent`] always carries the live record, never a snapshot that
/// a concurrent renewal has already replaced.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RenewSubjectEvent {
    pub name: String,
}

/// Revoke a subject's current certificate and remove its record,
/// resolved by name when the command is processed.
///
/// A removal racing a renewal revokes whichever certificate the record
/// holds once the command reaches the head of the queue.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct RemoveSubjectEvent {
    pub name: String,
}

//------------ Queries -------------------------------------------------------

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GetSubjectEvent {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct GetSubjectsByTargetEvent {
    pub target: String,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct GetExpiringSubjectsEvent {
    pub days: i64,
}

/// Trigger-only payload for commands that need no arguments.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct EmptyEvent {}

//------------ CheckCertEvent ------------------------------------------------

/// The reconciliation checker's unit of work and its status report.
///
/// The scheduler publishes one of these per subject; the checker fills in
/// `targets`, `outdated`, `matched` and `unresolvable_since` from live DNS
/// and TLS observations and sends the result back as an update command.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct CheckCertEvent {
    pub id: u64,
    pub name: String,
    pub port: u16,
    pub cert_id: u64,
    pub serial: String,
    #[serde(default)]
    pub targets: Vec<String>,
    #[serde(default)]
    pub outdated: Vec<String>,
    #[serde(default)]
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolvable_since: Option<Timestamp>,
}

impl CheckCertEvent {
    pub fn for_subject(subject: &Subject) -> Self {
        CheckCertEvent {
            id: subject.id,
            name: subject.name.clone(),
            port: subject.port,
            cert_id: subject.cert_id,
            serial: subject.serial.clone(),
            targets: subject.targets.clone(),
            outdated: subject.outdated.clone(),
            matched: subject.matched,
            unresolvable_since: subject.unresolvable_since,
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T>(value: &T)
    where
        T: Serialize + serde::de::DeserializeOwned + PartialEq + fmt::Debug,
    {
        let json = serde_json::to_string(value).unwrap();
        let back: T = serde_json::from_str(&json).unwrap();
        assert_eq!(&back, value);
        assert_eq!(serde_json::to_string(&back).unwrap(), json);
    }

    #[test]
    fn event_payloads_round_trip() {
        round_trip(&EnrollEvent {
            name: "a.example.com".to_string(),
            port: 443,
            alt_names: vec!["b.example.com".to_string()],
            targets: vec!["1.2.3.4".to_string()],
        });
        round_trip(&CollectEvent { cert_id: 42 });
        round_trip(&RenewEvent {
            id: 7,
            name: "a.example.com".to_string(),
            port: 443,
            cert_id: 42,
            alt_names: vec![],
            targets: vec!["1.2.3.4".to_string()],
        });
        round_trip(&RevokeEvent {
            cert_id: 42,
            name: "a.example.com".to_string(),
        });
        round_trip(&NewSubjectEvent {
            name: "a.example.com".to_string(),
            port: 443,
            csr: "--csr--".to_string(),
            private_key: "--key--".to_string(),
            cert_id: 42,
            order_id: "order-1".to_string(),
            alt_names: vec![],
            targets: vec![],
        });
        round_trip(&CompleteEnrollEvent {
            cert_id: 42,
            certificate: "--pem--".to_string(),
            serial: "99".to_string(),
            not_after: Timestamp::new(1_800_000_000),
        });
        round_trip(&DeleteSubjectEvent {
            cert_id: 42,
            id: Some(7),
        });
        round_trip(&RenewSubjectEvent {
            name: "a.example.com".to_string(),
        });
        round_trip(&RemoveSubjectEvent {
            name: "a.example.com".to_string(),
        });
        round_trip(&GetSubjectEvent {
            name: "a.example.com".to_string(),
        });
        round_trip(&GetSubjectsByTargetEvent {
            target: "1.2.3.4".to_string(),
        });
        round_trip(&GetExpiringSubjectsEvent { days: 30 });
        round_trip(&EmptyEvent {});
        round_trip(&CheckCertEvent {
            id: 7,
            name: "a.example.com".to_string(),
            port: 443,
            cert_id: 42,
            serial: "12345".to_string(),
            targets: vec!["1.2.3.4".to_string()],
            outdated: vec![],
            matched: true,
            unresolvable_since: Some(Timestamp::new(1_700_000_000)),
        });
    }

    #[test]
    fn command_tags_round_trip() {
        for tag in [
            CommandTag::AddSubject,
            CommandTag::UpdateSubject,
            CommandTag::DeleteSubject,
            CommandTag::RenewSubject,
            CommandTag::RemoveSubject,
            CommandTag::UpdateStatus,
            CommandTag::GetSubject,
            CommandTag::GetSubjectsByTarget,
            CommandTag::GetExpiringSubjects,
            CommandTag::GetAllSubjects,
            CommandTag::CloseStream,
        ] {
            let json = serde_json::to_string(&tag).unwrap();
            let back: CommandTag = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tag);
        }
    }
}
