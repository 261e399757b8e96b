//! Phonebooks: entries, the shared store and the `Fonbook` trait.

pub mod fritz;
pub mod local;
pub mod lookup;
pub mod manager;
pub mod xml;

pub use fritz::FritzFonbook;
pub use local::LocalFonbook;
pub use lookup::{LookupFonbook, ReverseLookup};
pub use manager::FonbookManager;

use crate::error::Result;
use crate::session::Session;
use crate::tools::compare_normalized;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{info, warn};

/// Kind of a phone number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberType {
    #[default]
    None,
    Home,
    Mobile,
    Work,
}

impl NumberType {
    /// Parse the `type` attribute of the XML export.
    pub fn from_name(name: &str) -> Self {
        match name {
            "home" => Self::Home,
            "mobile" => Self::Mobile,
            "work" => Self::Work,
            _ => Self::None,
        }
    }

    /// Numeric code used in CSV phonebooks.
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Home,
            2 => Self::Mobile,
            3 => Self::Work,
            _ => Self::None,
        }
    }

    /// Name written to XML. Untyped numbers are stored as `home`.
    pub fn xml_name(self) -> &'static str {
        match self {
            Self::None | Self::Home => "home",
            Self::Mobile => "mobile",
            Self::Work => "work",
        }
    }
}

/// One number of a contact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PhoneNumber {
    pub number: String,
    pub kind: NumberType,
    pub quickdial: String,
    pub vanity: String,
    /// `1` marks the default number of the contact.
    pub priority: u32,
}

/// A contact.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct FonbookEntry {
    pub name: String,
    pub important: bool,
    pub numbers: Vec<PhoneNumber>,
}

impl FonbookEntry {
    /// Numbers a CSV line may add to one contact.
    pub const MAX_NUMBERS: usize = 3;

    pub fn new(name: impl Into<String>, important: bool) -> Self {
        Self {
            name: name.into(),
            important,
            numbers: Vec::new(),
        }
    }

    /// Set the number at `pos`, padding with empty numbers if needed.
    pub fn add_number(
        &mut self,
        pos: usize,
        number: impl Into<String>,
        kind: NumberType,
        quickdial: impl Into<String>,
        vanity: impl Into<String>,
        priority: u32,
    ) {
        if self.numbers.len() <= pos {
            self.numbers.resize_with(pos + 1, PhoneNumber::default);
        }
        self.numbers[pos] = PhoneNumber {
            number: number.into(),
            kind,
            quickdial: quickdial.into(),
            vanity: vanity.into(),
            priority,
        };
    }

    /// Append a plain number. Returns `false` if the contact is full.
    pub fn push_number(&mut self, number: impl Into<String>, kind: NumberType) -> bool {
        let pos = self.numbers.len();
        if pos >= Self::MAX_NUMBERS {
            return false;
        }
        self.add_number(pos, number, kind, "", "", 0);
        true
    }

    pub fn number(&self, pos: usize) -> Option<&PhoneNumber> {
        self.numbers.get(pos)
    }

    /// Position of the default number: the first with priority 1, else 0.
    pub fn default_pos(&self) -> usize {
        self.numbers
            .iter()
            .position(|n| n.priority == 1)
            .unwrap_or(0)
    }

    /// Make `pos` the default number. Quickdial and vanity codes move along.
    ///
    /// Returns `false` if the entry has no number at `pos`.
    pub fn set_default(&mut self, pos: usize) -> bool {
        if pos >= self.numbers.len() {
            warn!("{} has no number at position {pos}", self.name);
            return false;
        }
        let old = self.default_pos();
        if pos == old {
            return true;
        }
        let (quickdial, vanity) = match self.numbers.get_mut(old) {
            Some(previous) => {
                previous.priority = 0;
                (
                    std::mem::take(&mut previous.quickdial),
                    std::mem::take(&mut previous.vanity),
                )
            }
            None => Default::default(),
        };
        let new = &mut self.numbers[pos];
        new.priority = 1;
        new.quickdial = quickdial;
        new.vanity = vanity;
        true
    }

    pub fn quickdial(&self, pos: usize) -> &str {
        self.number(pos).map_or("", |n| n.quickdial.as_str())
    }

    pub fn vanity(&self, pos: usize) -> &str {
        self.number(pos).map_or("", |n| n.vanity.as_str())
    }

    /// Dial string for the quickdial code, e.g. `**701` or `**712`.
    pub fn quickdial_formatted(&self, pos: usize) -> String {
        let quickdial = self.quickdial(pos);
        match quickdial.len() {
            1 => format!("**70{quickdial}"),
            2 => format!("**7{quickdial}"),
            _ => String::new(),
        }
    }

    /// Dial string for the vanity code, e.g. `**8123`.
    pub fn vanity_formatted(&self, pos: usize) -> String {
        let vanity = self.vanity(pos);
        if vanity.is_empty() {
            String::new()
        } else {
            format!("**8{vanity}")
        }
    }

    /// Number of non-empty numbers.
    pub fn size(&self) -> usize {
        self.numbers.iter().filter(|n| !n.number.is_empty()).count()
    }
}

/// Outcome of a reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveResult {
    /// Contact name, or the queried number if unresolved.
    pub name: String,
    pub kind: NumberType,
    pub successful: bool,
}

impl ResolveResult {
    pub fn unresolved(number: &str) -> Self {
        Self {
            name: number.to_string(),
            kind: NumberType::None,
            successful: false,
        }
    }

    pub fn resolved(name: impl Into<String>, kind: NumberType) -> Self {
        Self {
            name: name.into(),
            kind,
            successful: true,
        }
    }
}

/// Field to sort phonebook entries by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FonbookElement {
    Name,
    Important,
    Quickdial,
    Vanity,
}

/// Leading integer of a code, `0` if there is none.
fn numeric(code: &str) -> i64 {
    let digits: String = code.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

fn compare_entries(a: &FonbookEntry, b: &FonbookEntry, element: FonbookElement) -> Ordering {
    match element {
        FonbookElement::Name => a.name.cmp(&b.name),
        FonbookElement::Important => a.important.cmp(&b.important),
        FonbookElement::Quickdial => {
            numeric(a.quickdial(a.default_pos())).cmp(&numeric(b.quickdial(b.default_pos())))
        }
        FonbookElement::Vanity => {
            numeric(a.vanity(a.default_pos())).cmp(&numeric(b.vanity(b.default_pos())))
        }
    }
}

/// Entries and flags of one phonebook.
#[derive(Debug, Clone)]
pub struct FonbookStore {
    entries: Vec<FonbookEntry>,
    pub title: String,
    pub tech_id: String,
    pub displayable: bool,
    pub writeable: bool,
    initialized: bool,
    dirty: bool,
}

impl FonbookStore {
    pub fn new(title: impl Into<String>, tech_id: impl Into<String>) -> Self {
        Self {
            entries: Vec::new(),
            title: title.into(),
            tech_id: tech_id.into(),
            displayable: false,
            writeable: false,
            initialized: false,
            dirty: false,
        }
    }

    pub fn displayable(mut self, displayable: bool) -> Self {
        self.displayable = displayable;
        self
    }

    pub fn writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }

    /// Changes only count once the initial load is done.
    fn set_dirty(&mut self) {
        if self.initialized {
            self.dirty = true;
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn is_modified(&self) -> bool {
        self.dirty
    }

    pub fn set_initialized(&mut self, initialized: bool) {
        self.initialized = initialized;
        if self.displayable && initialized {
            info!("{} initialized ({} entries)", self.title, self.size());
        }
    }

    pub fn mark_saved(&mut self) {
        self.dirty = false;
    }

    /// Replace all entries without marking the store modified.
    pub fn load(&mut self, entries: Vec<FonbookEntry>) {
        self.entries = entries;
    }

    /// Number of entries, `0` until initialized.
    pub fn size(&self) -> usize {
        if self.initialized { self.entries.len() } else { 0 }
    }

    pub fn entries(&self) -> &[FonbookEntry] {
        &self.entries
    }

    pub fn entry(&self, id: usize) -> Option<&FonbookEntry> {
        if id >= self.size() {
            return None;
        }
        self.entries.get(id)
    }

    pub fn change_entry(&mut self, id: usize, entry: FonbookEntry) -> bool {
        if id >= self.size() {
            return false;
        }
        self.entries[id] = entry;
        self.set_dirty();
        true
    }

    pub fn set_default(&mut self, id: usize, pos: usize) -> bool {
        if id >= self.size() {
            return false;
        }
        if !self.entries[id].set_default(pos) {
            return false;
        }
        self.set_dirty();
        true
    }

    /// Insert at `pos`, or append if `pos` is `None` or past the end.
    pub fn add_entry(&mut self, entry: FonbookEntry, pos: Option<usize>) {
        match pos {
            Some(pos) if pos <= self.entries.len() => self.entries.insert(pos, entry),
            _ => self.entries.push(entry),
        }
        self.set_dirty();
    }

    pub fn delete_entry(&mut self, id: usize) -> bool {
        if id >= self.size() {
            return false;
        }
        self.entries.remove(id);
        self.set_dirty();
        true
    }

    pub fn clear(&mut self) {
        self.set_dirty();
        self.entries.clear();
    }

    pub fn sort(&mut self, element: FonbookElement, ascending: bool) {
        self.entries.sort_by(|a, b| {
            let order = compare_entries(a, b, element);
            if ascending { order } else { order.reverse() }
        });
    }

    /// Find the contact owning `number`.
    pub fn resolve(&self, number: &str, country_code: &str, region_code: &str) -> ResolveResult {
        if number.is_empty() {
            return ResolveResult::unresolved(number);
        }
        self.entries
            .iter()
            .find_map(|entry| {
                entry
                    .numbers
                    .iter()
                    .find(|n| {
                        !n.number.is_empty()
                            && compare_normalized(number, &n.number, country_code, region_code)
                                == Ordering::Equal
                    })
                    .map(|n| ResolveResult::resolved(entry.name.clone(), n.kind))
            })
            .unwrap_or_else(|| ResolveResult::unresolved(number))
    }
}

pub(crate) fn read_store(store: &RwLock<FonbookStore>) -> RwLockReadGuard<'_, FonbookStore> {
    store.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) fn write_store(store: &RwLock<FonbookStore>) -> RwLockWriteGuard<'_, FonbookStore> {
    store.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A source of contacts.
///
/// Implementors provide the store and their loading and persisting logic;
/// everything else has default bodies working on the store.
#[async_trait]
pub trait Fonbook: Send + Sync {
    fn store(&self) -> &RwLock<FonbookStore>;

    fn session(&self) -> &Session;

    /// Fill the phonebook. May be called more than once.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    /// Wait until a background load has finished.
    async fn wait_ready(&self) {}

    /// Write the entries to the backing storage.
    async fn persist(&self, _entries: Vec<FonbookEntry>) -> Result<()> {
        Ok(())
    }

    async fn resolve_to_name(&self, number: &str) -> ResolveResult {
        let (country, region) = self.session().location();
        read_store(self.store()).resolve(number, &country, &region)
    }

    /// Persist pending changes if the phonebook is writeable.
    async fn save(&self) -> Result<()> {
        let pending = {
            let store = read_store(self.store());
            (store.is_modified() && store.writeable).then(|| store.entries().to_vec())
        };
        if let Some(entries) = pending {
            self.persist(entries).await?;
            write_store(self.store()).mark_saved();
        }
        Ok(())
    }

    fn entry(&self, id: usize) -> Option<FonbookEntry> {
        read_store(self.store()).entry(id).cloned()
    }

    fn entries(&self) -> Vec<FonbookEntry> {
        let store = read_store(self.store());
        store.entries()[..store.size()].to_vec()
    }

    fn change_entry(&self, id: usize, entry: FonbookEntry) -> bool {
        write_store(self.store()).change_entry(id, entry)
    }

    fn set_default(&self, id: usize, pos: usize) -> bool {
        write_store(self.store()).set_default(id, pos)
    }

    fn add_entry(&self, entry: FonbookEntry, pos: Option<usize>) {
        write_store(self.store()).add_entry(entry, pos);
    }

    fn delete_entry(&self, id: usize) -> bool {
        write_store(self.store()).delete_entry(id)
    }

    fn clear(&self) {
        write_store(self.store()).clear();
    }

    fn sort(&self, element: FonbookElement, ascending: bool) {
        write_store(self.store()).sort(element, ascending);
    }

    fn size(&self) -> usize {
        read_store(self.store()).size()
    }

    fn title(&self) -> String {
        read_store(self.store()).title.clone()
    }

    fn tech_id(&self) -> String {
        read_store(self.store()).tech_id.clone()
    }

    fn is_displayable(&self) -> bool {
        read_store(self.store()).displayable
    }

    fn is_writeable(&self) -> bool {
        read_store(self.store()).writeable
    }

    fn is_initialized(&self) -> bool {
        read_store(self.store()).is_initialized()
    }

    fn is_modified(&self) -> bool {
        read_store(self.store()).is_modified()
    }
}
