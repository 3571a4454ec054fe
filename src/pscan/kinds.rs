//! History kinds opted in for passive scanning beyond the default set
//!
//! Add-ons that introduce their own kinds register them while loaded and
//! remove them on unload. Registrations are counted, so two add-ons
//! sharing a kind do not undo each other.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

use crate::models::HistoryKind;

#[derive(Debug, Default)]
pub struct ApplicableKinds {
    counts: RwLock<HashMap<HistoryKind, usize>>,
}

impl ApplicableKinds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: HistoryKind) {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        *counts.entry(kind).or_insert(0) += 1;
        debug!("History kind {} opted in for passive scanning", kind);
    }

    /// Undoes one `add`. Returns false if the kind was not registered.
    pub fn remove(&self, kind: HistoryKind) -> bool {
        let mut counts = self.counts.write().unwrap_or_else(|e| e.into_inner());
        match counts.get_mut(&kind) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                counts.remove(&kind);
                debug!("History kind {} no longer opted in", kind);
                true
            }
            None => {
                warn!("Removing history kind {} that was never added", kind);
                false
            }
        }
    }

    pub fn contains(&self, kind: HistoryKind) -> bool {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&kind)
    }

    /// Registered kinds, in no particular order
    pub fn kinds(&self) -> Vec<HistoryKind> {
        self.counts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Adds `kind` and removes it again when the guard is dropped
    pub fn register(self: &Arc<Self>, kind: HistoryKind) -> KindRegistration {
        self.add(kind);
        KindRegistration {
            kinds: Arc::clone(self),
            kind,
        }
    }
}

/// Keeps a kind opted in for as long as it lives
#[must_use = "the kind is removed as soon as the registration is dropped"]
pub struct KindRegistration {
    kinds: Arc<ApplicableKinds>,
    kind: HistoryKind,
}

impl Drop for KindRegistration {
    fn drop(&mut self) {
        self.kinds.remove(self.kind);
    }
}
