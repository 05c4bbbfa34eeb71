//! Contracts the transaction layer needs from the object store and the
//! deletion-lock manager, plus in-memory implementations of both.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use orrery_common::error::TxnError;
use orrery_common::types::{FieldImage, Invid, SessionId, TxnId};
use serde::{Deserialize, Serialize};

/// What a transaction is doing with an object it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectStatus {
    /// Existing object, being modified.
    Editing,
    /// New object, not yet committed.
    Creating,
    /// Existing object, to be removed on commit.
    Deleting,
    /// Object created and then deleted within the same transaction.
    Dropping,
}

/// The committed object store, as seen by a transaction.
///
/// Objects are checked out exclusively to one transaction while edited.
pub trait ObjectStore: Send + Sync {
    /// Committed image of `invid`.
    fn get(&self, invid: Invid) -> Option<FieldImage>;

    /// Reserve a fresh identity of `type_id`, checked out to `txn`.
    fn allocate(&self, type_id: u16, txn: TxnId) -> Invid;

    /// Take the edit lock on an existing object.
    fn check_out(&self, invid: Invid, txn: TxnId) -> Result<(), TxnError>;

    /// Give the edit lock back without committing. A reserved identity that
    /// was never committed is discarded.
    fn release(&self, invid: Invid, txn: TxnId);

    /// Transaction currently holding the edit lock.
    fn holder(&self, invid: Invid) -> Option<TxnId>;

    /// Commit a new image (`None` removes the object) and drop the lock.
    fn install(&self, invid: Invid, image: Option<FieldImage>);

    /// Every committed object, ordered by identity.
    fn snapshot(&self) -> Vec<(Invid, FieldImage)>;
}

/// Deletion locks keep an object from being deleted while a session
/// links to it. Tokens are the locked objects' identities.
pub trait DeleteLockManager: Send + Sync {
    fn session_locks(&self, session: SessionId) -> BTreeSet<Invid>;

    /// Make the session hold exactly `locks`: release anything acquired
    /// since, re-acquire anything released since.
    fn revert_session(&self, session: SessionId, locks: &BTreeSet<Invid>);
}

#[derive(Debug, Clone)]
struct StoredObject {
    committed: Option<FieldImage>,
    holder: Option<TxnId>,
}

#[derive(Debug)]
pub struct MemoryObjectStore {
    objects: DashMap<Invid, StoredObject>,
    next_num: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_num: AtomicU32::new(1),
        }
    }

    /// Load a committed object directly, bypassing any transaction.
    pub fn insert(&self, invid: Invid, image: FieldImage) {
        self.next_num.fetch_max(invid.num.saturating_add(1), Ordering::SeqCst);
        self.objects.insert(
            invid,
            StoredObject {
                committed: Some(image),
                holder: None,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.objects
            .iter()
            .filter(|e| e.value().committed.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get(&self, invid: Invid) -> Option<FieldImage> {
        self.objects.get(&invid).and_then(|o| o.committed.clone())
    }

    fn allocate(&self, type_id: u16, txn: TxnId) -> Invid {
        let invid = Invid::new(type_id, self.next_num.fetch_add(1, Ordering::SeqCst));
        self.objects.insert(
            invid,
            StoredObject {
                committed: None,
                holder: Some(txn),
            },
        );
        invid
    }

    fn check_out(&self, invid: Invid, txn: TxnId) -> Result<(), TxnError> {
        let mut entry = self
            .objects
            .get_mut(&invid)
            .ok_or(TxnError::ObjectNotFound(invid))?;
        if let Some(holder) = entry.holder {
            if holder != txn {
                return Err(TxnError::ObjectBusy { invid, holder });
            }
        }
        if entry.committed.is_none() {
            return Err(TxnError::ObjectNotFound(invid));
        }
        entry.holder = Some(txn);
        Ok(())
    }

    fn release(&self, invid: Invid, txn: TxnId) {
        self.objects.remove_if(&invid, |_, o| {
            o.holder == Some(txn) && o.committed.is_none()
        });
        if let Some(mut entry) = self.objects.get_mut(&invid) {
            if entry.holder == Some(txn) {
                entry.holder = None;
            }
        }
    }

    fn holder(&self, invid: Invid) -> Option<TxnId> {
        self.objects.get(&invid).and_then(|o| o.holder)
    }

    fn install(&self, invid: Invid, image: Option<FieldImage>) {
        match image {
            Some(image) => {
                self.objects.insert(
                    invid,
                    StoredObject {
                        committed: Some(image),
                        holder: None,
                    },
                );
            }
            None => {
                self.objects.remove(&invid);
            }
        }
    }

    fn snapshot(&self) -> Vec<(Invid, FieldImage)> {
        let mut objects: Vec<(Invid, FieldImage)> = self
            .objects
            .iter()
            .filter_map(|e| e.value().committed.clone().map(|img| (*e.key(), img)))
            .collect();
        objects.sort_by_key(|(invid, _)| *invid);
        objects
    }
}

/// In-memory deletion-lock table, keyed by session.
#[derive(Debug, Default)]
pub struct SessionDeleteLocks {
    sessions: DashMap<SessionId, BTreeSet<Invid>>,
}

impl SessionDeleteLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, session: SessionId, invid: Invid) {
        self.sessions.entry(session).or_default().insert(invid);
    }

    pub fn release(&self, session: SessionId, invid: Invid) {
        if let Some(mut locks) = self.sessions.get_mut(&session) {
            locks.remove(&invid);
        }
    }

    /// True if any session holds a deletion lock on `invid`.
    pub fn is_locked(&self, invid: Invid) -> bool {
        self.sessions.iter().any(|e| e.value().contains(&invid))
    }
}

impl DeleteLockManager for SessionDeleteLocks {
    fn session_locks(&self, session: SessionId) -> BTreeSet<Invid> {
        self.sessions
            .get(&session)
            .map(|locks| locks.clone())
            .unwrap_or_default()
    }

    fn revert_session(&self, session: SessionId, locks: &BTreeSet<Invid>) {
        let current = self.session_locks(session);
        let released: Vec<&Invid> = current.difference(locks).collect();
        let reacquired: Vec<&Invid> = locks.difference(&current).collect();
        if !released.is_empty() || !reacquired.is_empty() {
            tracing::debug!(
                "{}: reverting deletion locks ({} released, {} re-acquired)",
                session,
                released.len(),
                reacquired.len()
            );
        }
        self.sessions.insert(session, locks.clone());
    }
}
