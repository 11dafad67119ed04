//! Subject persistence.
//!
//! All access goes through the [`SubjectStore`] trait so the store command
//! processor and the tests can share implementations. The store itself is
//! passive: all sequencing of writes happens in the command processor,
//! which is the single consumer of the store command queue.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::api::subject::{LifecycleState, Subject, Timestamp};
use crate::commons::{Error, WardResult};

//------------ SubjectStore --------------------------------------------------

pub trait SubjectStore: Send + Sync {
    /// Inserts a new record, assigning its id and timestamps. Fails when
    /// a subject with the same name already exists.
    fn add(&self, subject: Subject) -> WardResult<Subject>;

    fn find_all(&self) -> WardResult<Vec<Subject>>;

    fn find_by_name(&self, name: &str) -> WardResult<Option<Subject>>;

    fn find_by_target(&self, target: &str) -> WardResult<Vec<Subject>>;

    /// Returns the records whose certificate expires within the window.
    /// Covers [`LifecycleState::Active`] and [`LifecycleState::Renewing`]
    /// records; a renewal lost in transit keeps showing up here until a
    /// later scan retries it.
    fn find_expiring_within_hours(
        &self,
        hours: i64,
    ) -> WardResult<Vec<Subject>>;

    /// Stores the collected certificate on the record with this CA
    /// certificate id and moves it to [`LifecycleState::Active`].
    fn complete_enrollment(
        &self,
        cert_id: u64,
        certificate: &str,
        serial: &str,
        not_after: Timestamp,
    ) -> WardResult<()>;

    /// Moves a record to a new lifecycle state.
    fn update_state(&self, id: u64, state: LifecycleState) -> WardResult<()>;

    /// Replaces the reachability observations on a record.
    fn update_reachability(
        &self,
        id: u64,
        targets: Vec<String>,
        outdated: Vec<String>,
        matched: bool,
        unresolvable_since: Option<Timestamp>,
    ) -> WardResult<()>;

    /// Deletes a record. The record id, when given, is authoritative;
    /// the CA certificate id is the fallback selector. Returns whether a
    /// record was removed; deleting an absent record is not an error.
    fn delete(&self, cert_id: u64, id: Option<u64>) -> WardResult<bool>;
}

//------------ MemoryStore ---------------------------------------------------

/// The in-memory [`SubjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    last_id: AtomicU64,
    subjects: RwLock<HashMap<u64, Subject>>,
}

impl MemoryStore {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<u64, Subject>> {
        self.subjects.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<u64, Subject>> {
        self.subjects.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl SubjectStore for MemoryStore {
    fn add(&self, mut subject: Subject) -> WardResult<Subject> {
        let mut subjects = self.write();
        if subjects.values().any(|s| s.name == subject.name) {
            return Err(Error::SubjectExists(subject.name));
        }

        subject.id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        subject.created = Timestamp::now();
        subject.updated = subject.created;
        subject.state = LifecycleState::Collecting;

        subjects.insert(subject.id, subject.clone());
        Ok(subject)
    }

    fn find_all(&self) -> WardResult<Vec<Subject>> {
        let mut subjects: Vec<_> = self.read().values().cloned().collect();
        subjects.sort_by_key(|s| s.id);
        Ok(subjects)
    }

    fn find_by_name(&self, name: &str) -> WardResult<Option<Subject>> {
        Ok(self.read().values().find(|s| s.name == name).cloned())
    }

    fn find_by_target(&self, target: &str) -> WardResult<Vec<Subject>> {
        let mut subjects: Vec<_> = self
            .read()
            .values()
            .filter(|s| s.targets.iter().any(|t| t == target))
            .cloned()
            .collect();
        subjects.sort_by_key(|s| s.id);
        Ok(subjects)
    }

    fn find_expiring_within_hours(
        &self,
        hours: i64,
    ) -> WardResult<Vec<Subject>> {
        let mut subjects: Vec<_> = self
            .read()
            .values()
            .filter(|s| {
                matches!(
                    s.state,
                    LifecycleState::Active | LifecycleState::Renewing
                ) && s.expires_within_hours(hours)
            })
            .cloned()
            .collect();
        subjects.sort_by_key(|s| s.id);
        Ok(subjects)
    }

    fn complete_enrollment(
        &self,
        cert_id: u64,
        certificate: &str,
        serial: &str,
        not_after: Timestamp,
    ) -> WardResult<()> {
        let mut subjects = self.write();
        let subject = subjects
            .values_mut()
            .find(|s| s.cert_id == cert_id)
            .ok_or_else(|| {
                Error::store(format!("no subject with cert id {cert_id}"))
            })?;

        subject.certificate = certificate.to_string();
        subject.serial = serial.to_string();
        subject.not_after = not_after;
        subject.state = LifecycleState::Active;
        subject.updated = Timestamp::now();
        Ok(())
    }

    fn update_state(&self, id: u64, state: LifecycleState) -> WardResult<()> {
        let mut subjects = self.write();
        let subject = subjects
            .get_mut(&id)
            .ok_or_else(|| Error::store(format!("no subject with id {id}")))?;

        subject.state = state;
        subject.updated = Timestamp::now();
        Ok(())
    }

    fn update_reachability(
        &self,
        id: u64,
        targets: Vec<String>,
        outdated: Vec<String>,
        matched: bool,
        unresolvable_since: Option<Timestamp>,
    ) -> WardResult<()> {
        let mut subjects = self.write();
        let subject = subjects
            .get_mut(&id)
            .ok_or_else(|| Error::store(format!("no subject with id {id}")))?;

        subject.targets = targets;
        subject.outdated = outdated;
        subject.matched = matched;
        subject.unresolvable_since = unresolvable_since;
        subject.updated = Timestamp::now();
        Ok(())
    }

    fn delete(&self, cert_id: u64, id: Option<u64>) -> WardResult<bool> {
        let mut subjects = self.write();
        match id {
            Some(id) => Ok(subjects.remove(&id).is_some()),
            None => {
                let found = subjects
                    .values()
                    .find(|s| s.cert_id == cert_id)
                    .map(|s| s.id);
                match found {
                    Some(id) => Ok(subjects.remove(&id).is_some()),
                    None => Ok(false),
                }
            }
        }
    }
}

//============ Tests =========================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn subject(name: &str, cert_id: u64) -> Subject {
        Subject {
            name: name.to_string(),
            port: 443,
            cert_id,
            targets: vec!["10.0.0.1".to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn add_assigns_id_and_state() {
        let store = MemoryStore::default();

        let stored = store.add(subject("a.example.com", 1)).unwrap();
        assert_eq!(stored.id, 1);
        assert_eq!(stored.state, LifecycleState::Collecting);

        let stored = store.add(subject("b.example.com", 2)).unwrap();
        assert_eq!(stored.id, 2);
    }

    #[test]
    fn duplicate_names_are_refused() {
        let store = MemoryStore::default();
        store.add(subject("a.example.com", 1)).unwrap();

        assert!(matches!(
            store.add(subject("a.example.com", 2)),
            Err(Error::SubjectExists(_))
        ));
    }

    #[test]
    fn find_by_name_and_target() {
        let store = MemoryStore::default();
        store.add(subject("a.example.com", 1)).unwrap();
        store.add(subject("b.example.com", 2)).unwrap();

        assert!(store.find_by_name("a.example.com").unwrap().is_some());
        assert!(store.find_by_name("c.example.com").unwrap().is_none());

        assert_eq!(store.find_by_target("10.0.0.1").unwrap().len(), 2);
        assert!(store.find_by_target("10.0.0.9").unwrap().is_empty());
    }

    #[test]
    fn completing_enrollment_activates_the_subject() {
        let store = MemoryStore::default();
        store.add(subject("a.example.com", 1)).unwrap();

        store
            .complete_enrollment(
                1,
                "--pem--",
                "99",
                Timestamp::now_plus_hours(100),
            )
            .unwrap();

        let stored = store.find_by_name("a.example.com").unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Active);
        assert_eq!(stored.serial, "99");
        assert_eq!(stored.certificate, "--pem--");
    }

    #[test]
    fn only_active_subjects_can_expire() {
        let store = MemoryStore::default();
        store.add(subject("soon.example.com", 1)).unwrap();
        store.add(subject("later.example.com", 2)).unwrap();
        store.add(subject("pending.example.com", 3)).unwrap();

        store
            .complete_enrollment(
                1,
                "--pem--",
                "1",
                Timestamp::now_plus_hours(100),
            )
            .unwrap();
        store
            .complete_enrollment(
                2,
                "--pem--",
                "2",
                Timestamp::now_plus_hours(10_000),
            )
            .unwrap();

        let expiring = store.find_expiring_within_hours(720).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].name, "soon.example.com");

        // A record stuck in renewal keeps expiring; one queued for
        // revocation does not.
        store.update_state(1, LifecycleState::Renewing).unwrap();
        assert_eq!(store.find_expiring_within_hours(720).unwrap().len(), 1);
        store.update_state(1, LifecycleState::Revoking).unwrap();
        assert!(store.find_expiring_within_hours(720).unwrap().is_empty());
    }

    #[test]
    fn state_updates_move_the_record() {
        let store = MemoryStore::default();
        let stored = store.add(subject("a.example.com", 1)).unwrap();

        store
            .update_state(stored.id, LifecycleState::Renewing)
            .unwrap();
        let stored = store.find_by_name("a.example.com").unwrap().unwrap();
        assert_eq!(stored.state, LifecycleState::Renewing);

        assert!(store.update_state(99, LifecycleState::Active).is_err());
    }

    #[test]
    fn record_id_is_authoritative_for_deletes() {
        let store = MemoryStore::default();
        let first = store.add(subject("a.example.com", 1)).unwrap();

        // A delete addressed to a stale record id must not remove the
        // replacement record, even with a matching cert id.
        store.delete(1, Some(first.id)).unwrap();
        let replacement = store.add(subject("a.example.com", 1)).unwrap();
        assert!(!store.delete(1, Some(first.id)).unwrap());
        assert!(store.find_by_name("a.example.com").unwrap().is_some());

        // Without a record id the cert id selects.
        assert!(store.delete(1, None).unwrap());
        assert!(store.find_by_name("a.example.com").unwrap().is_none());

        assert_eq!(replacement.id, 2);
    }

    #[test]
    fn reachability_update() {
        let store = MemoryStore::default();
        let stored = store.add(subject("a.example.com", 1)).unwrap();

        store
            .update_reachability(
                stored.id,
                vec!["10.0.0.1".to_string()],
                vec!["10.0.0.2".to_string()],
                false,
                None,
            )
            .unwrap();

        let stored = store.find_by_name("a.example.com").unwrap().unwrap();
        assert_eq!(stored.outdated, vec!["10.0.0.2".to_string()]);
        assert!(!stored.matched);
    }
}
