//! A `yrs`-backed [`DocumentStore`].
//!
//! Local mutations go through [`YrsStore::update_local`], which commits a
//! transaction, diffs the document against its pre-transaction state
//! vector, and hands the resulting delta to the local change handler.
//! Remote updates merge under the store's internal lock, so a concurrent
//! remote apply can never leak into a local delta and echo back out.

use crate::doc::{DocumentStore, LocalChangeHandler, UpdateOrigin};
use crate::error::DocError;
use parking_lot::{Mutex, RwLock};
use tracing::trace;
use yrs::updates::decoder::Decode;
use yrs::{Doc, ReadTxn, StateVector, Transact, TransactionMut, Update};

/// A [`DocumentStore`] over a [`yrs::Doc`].
pub struct YrsStore {
    doc: Doc,
    /// Serializes local and remote mutations so local deltas are exact.
    mutate: Mutex<()>,
    handler: RwLock<Option<LocalChangeHandler>>,
}

impl Default for YrsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl YrsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            doc: Doc::new(),
            mutate: Mutex::new(()),
            handler: RwLock::new(None),
        }
    }

    /// The underlying document, for reads and for obtaining shared types.
    ///
    /// Mutate through [`Self::update_local`] so the change propagates.
    #[must_use]
    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    /// Run a local mutation and fire the local change handler with the
    /// resulting delta.
    pub fn update_local<R>(&self, f: impl FnOnce(&mut TransactionMut) -> R) -> R {
        let delta;
        let result;
        {
            let _guard = self.mutate.lock();
            let before = self.doc.transact().state_vector();
            result = {
                let mut txn = self.doc.transact_mut();
                f(&mut txn)
            };
            let txn = self.doc.transact();
            if txn.state_vector() == before {
                // No-op transaction; nothing to propagate.
                return result;
            }
            delta = txn.encode_diff_v1(&before);
        }
        if let Some(handler) = self.handler.read().as_ref() {
            handler(delta);
        }
        result
    }
}

impl DocumentStore for YrsStore {
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), DocError> {
        let parsed =
            Update::decode_v1(update).map_err(|e| DocError::MalformedUpdate(e.to_string()))?;
        let _guard = self.mutate.lock();
        let mut txn = self.doc.transact_mut();
        txn.apply_update(parsed)
            .map_err(|e| DocError::Rejected(e.to_string()))?;
        trace!(%origin, bytes = update.len(), "Merged document update");
        Ok(())
    }

    fn encode_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn encode_snapshot(&self) -> Vec<u8> {
        // A snapshot is the full history as one update; the distinction is
        // in how it is used (once, at join, out of band of the stream).
        self.encode_update()
    }

    fn set_local_change_handler(&self, handler: LocalChangeHandler) {
        *self.handler.write() = Some(handler);
    }
}
