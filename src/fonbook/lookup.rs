//! Phonebooks backed by a reverse lookup service.

use super::{FonbookEntry, FonbookStore, Fonbook, ResolveResult, read_store, write_store};
use crate::session::Session;
use crate::tools::normalize_number;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// A reverse lookup service, e.g. an online directory.
#[async_trait]
pub trait ReverseLookup: Send + Sync {
    fn title(&self) -> &str;

    fn tech_id(&self) -> &str;

    /// Resolve `number`. Unsuccessful results carry the number as name.
    async fn lookup(&self, number: &str, country_code: &str, region_code: &str) -> ResolveResult;
}

/// Caches the answers of a [`ReverseLookup`].
///
/// Found names are kept as entries, numbers the service did not know are
/// remembered so they are not asked for again. The entries are not listed.
pub struct LookupFonbook<L> {
    lookup: L,
    session: Arc<Session>,
    store: RwLock<FonbookStore>,
    misses: RwLock<HashSet<String>>,
}

impl<L: ReverseLookup> LookupFonbook<L> {
    pub fn new(lookup: L, session: Arc<Session>) -> Self {
        let store = FonbookStore::new(lookup.title(), lookup.tech_id());
        Self {
            lookup,
            session,
            store: RwLock::new(store),
            misses: RwLock::new(HashSet::new()),
        }
    }

    fn is_known_miss(&self, normalized: &str) -> bool {
        self.misses
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(normalized)
    }

    fn remember_miss(&self, normalized: String) {
        self.misses
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(normalized);
    }
}

#[async_trait]
impl<L: ReverseLookup> Fonbook for LookupFonbook<L> {
    fn store(&self) -> &RwLock<FonbookStore> {
        &self.store
    }

    fn session(&self) -> &Session {
        &self.session
    }

    async fn initialize(&self) -> crate::error::Result<()> {
        write_store(&self.store).set_initialized(true);
        Ok(())
    }

    async fn resolve_to_name(&self, number: &str) -> ResolveResult {
        let (country, region) = self.session.location();
        let cached = read_store(&self.store).resolve(number, &country, &region);
        if cached.successful || number.is_empty() {
            return cached;
        }
        let normalized = normalize_number(number, &country, &region);
        if self.is_known_miss(&normalized) {
            return cached;
        }

        debug!("Looking up {} at {}", self.session.hidden(number), self.lookup.tech_id());
        let result = self.lookup.lookup(number, &country, &region).await;
        if result.successful {
            let mut entry = FonbookEntry::new(result.name.clone(), false);
            entry.add_number(0, number, result.kind, "", "", 0);
            let mut store = write_store(&self.store);
            store.add_entry(entry, None);
            store.mark_saved();
        } else {
            self.remember_miss(normalized);
        }
        result
    }

    fn entry(&self, _id: usize) -> Option<FonbookEntry> {
        None
    }

    fn entries(&self) -> Vec<FonbookEntry> {
        Vec::new()
    }

    fn size(&self) -> usize {
        0
    }
}
