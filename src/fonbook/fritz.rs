//! The phonebook stored on the device.

use super::{FonbookElement, FonbookEntry, FonbookStore, NumberType, Fonbook, write_store, xml};
use crate::client::SharedApi;
use crate::error::Result;
use crate::session::Session;
use crate::tools::decode_entities;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const TECH_ID: &str = "FRITZ";

const OLD_ENTRY_TAG: &str = "(TrFon(";
const NAME_TAG: &str = "TrFonName(";
const NUMBER_TAG: &str = "TrFonNr(";

/// Up to `count` double-quoted arguments of a JavaScript call.
fn quoted_args(text: &str, count: usize) -> Vec<&str> {
    let mut args = Vec::with_capacity(count);
    let mut rest = text;
    while args.len() < count {
        let Some(open) = rest.find('"') else { break };
        let after = &rest[open + 1..];
        let Some(close) = after.find('"') else { break };
        args.push(&after[..close]);
        rest = &after[close + 1..];
    }
    args
}

/// Parse the phonebook page of firmware without XML export.
///
/// Old firmware lists `TrFon("id", "Name", "Number")` calls, one number per
/// contact; a leading `!` on the name marks it important. Newer pages use a
/// `TrFonName` call followed by one `TrFonNr("type", "number")` per number.
pub fn parse_html(html: &str) -> Vec<FonbookEntry> {
    debug!("Parsing phonebook using html parser");
    let mut entries = Vec::new();

    for (pos, _) in html.match_indices(OLD_ENTRY_TAG) {
        let args = quoted_args(&html[pos + OLD_ENTRY_TAG.len()..], 3);
        let [_, name, number] = args[..] else {
            continue;
        };
        let (name, important) = match name.strip_prefix('!') {
            Some(name) => (name, true),
            None => (name, false),
        };
        let name = decode_entities(name);
        if name.is_empty() || number.is_empty() {
            continue;
        }
        let mut entry = FonbookEntry::new(name, important);
        entry.add_number(0, number, NumberType::None, "", "", 0);
        entries.push(entry);
    }

    for segment in html.split(NAME_TAG).skip(1) {
        let name = quoted_args(segment, 2)
            .get(1)
            .map(|name| decode_entities(name))
            .unwrap_or_default();
        let mut entry = FonbookEntry::new(name, false);
        for number_call in segment.split(NUMBER_TAG).skip(1) {
            let args = quoted_args(number_call, 2);
            let [kind, number] = args[..] else {
                continue;
            };
            if !entry.name.is_empty() && !number.is_empty() {
                let pos = entry.numbers.len();
                entry.add_number(pos, number, NumberType::from_name(kind), "", "", 0);
            }
        }
        entries.push(entry);
    }

    entries
}

struct Inner {
    api: SharedApi,
    session: Arc<Session>,
    store: RwLock<FonbookStore>,
}

impl Inner {
    async fn fetch(&self) {
        debug!("Phonebook fetch started");
        {
            let mut store = write_store(&self.store);
            store.set_initialized(false);
            store.clear();
            store.mark_saved();
        }

        let page = match self.api.request_fonbook().await {
            Ok(page) => page,
            Err(e) => {
                error!("Could not fetch phonebook: {e}");
                String::new()
            }
        };

        let (entries, writeable) = if page.contains("<?xml") {
            match xml::parse(&page) {
                Ok(entries) => (entries, true),
                Err(e) => {
                    error!("Could not parse phonebook: {e}");
                    (Vec::new(), false)
                }
            }
        } else {
            (parse_html(&page), false)
        };

        let mut store = write_store(&self.store);
        store.load(entries);
        if writeable {
            store.writeable = true;
        }
        store.sort(FonbookElement::Name, true);
        store.set_initialized(true);
        debug!("Phonebook fetch ended");
    }
}

/// Phonebook of the device, fetched in the background.
///
/// It becomes writeable once the device delivered its XML export.
pub struct FritzFonbook {
    inner: Arc<Inner>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FritzFonbook {
    pub fn new(api: SharedApi, session: Arc<Session>) -> Self {
        let store = FonbookStore::new("Fritz!Box phone book", TECH_ID).displayable(true);
        Self {
            inner: Arc::new(Inner {
                api,
                session,
                store: RwLock::new(store),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Fonbook for FritzFonbook {
    fn store(&self) -> &RwLock<FonbookStore> {
        &self.inner.store
    }

    fn session(&self) -> &Session {
        &self.inner.session
    }

    async fn initialize(&self) -> Result<()> {
        self.reload().await
    }

    async fn reload(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            if let Err(e) = previous.await {
                warn!("Previous phonebook fetch ended abnormally: {e}");
            }
        }
        let inner = Arc::clone(&self.inner);
        *task = Some(tokio::spawn(async move { inner.fetch().await }));
        Ok(())
    }

    async fn wait_ready(&self) {
        let running = self.task.lock().await.take();
        if let Some(handle) = running {
            if let Err(e) = handle.await {
                warn!("Phonebook fetch ended abnormally: {e}");
            }
        }
    }

    async fn persist(&self, entries: Vec<FonbookEntry>) -> Result<()> {
        info!("Uploading phonebook to Fritz!Box");
        let document = xml::serialize(&entries)?;
        self.inner.api.write_fonbook(&document).await
    }
}
