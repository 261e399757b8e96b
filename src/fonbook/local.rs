//! A phonebook kept in the configuration directory.

use super::{FonbookElement, FonbookEntry, FonbookStore, NumberType, Fonbook, write_store, xml};
use crate::error::Result;
use crate::session::Session;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

pub const TECH_ID: &str = "LOCL";

const XML_FILE: &str = "localphonebook.xml";
/// CSV files tried in order when there is no XML file; all but the first are deprecated.
const CSV_FILES: [&str; 3] = ["localphonebook.csv", "localfonbook.csv", "localfonbuch.csv"];

/// Parse `name,type,number` lines. Numbers of the same name are merged.
///
/// `;` works as separator too. Lines starting with `#` are comments.
pub fn parse_csv(csv: &str) -> Vec<FonbookEntry> {
    let mut entries: Vec<FonbookEntry> = Vec::new();
    for line in csv.lines() {
        let line = line.trim_end_matches('\r');
        if line.starts_with('#') || line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split([',', ';']).filter(|f| !f.is_empty()).collect();
        let [name, kind, number, ..] = fields[..] else {
            error!("Parse error in local phonebook at line '{line}'");
            continue;
        };
        let kind = NumberType::from_code(kind.trim().parse().unwrap_or(0));

        match entries.iter_mut().find(|entry| entry.name == name) {
            Some(entry) => {
                if !entry.push_number(number, kind) {
                    warn!("Too many numbers for {name} in local phonebook, skipped {number}");
                }
            }
            None => {
                let mut entry = FonbookEntry::new(name, false);
                entry.push_number(number, kind);
                entries.push(entry);
            }
        }
    }
    entries
}

/// Phonebook stored as `localphonebook.xml`.
///
/// Older CSV phonebooks are read as well and converted to XML on the next save.
pub struct LocalFonbook {
    session: Arc<Session>,
    store: RwLock<FonbookStore>,
    config_dir: PathBuf,
}

impl LocalFonbook {
    pub fn new(session: Arc<Session>, config_dir: impl Into<PathBuf>) -> Self {
        let store = FonbookStore::new("Local phone book", TECH_ID)
            .displayable(true)
            .writeable(true);
        Self {
            session,
            store: RwLock::new(store),
            config_dir: config_dir.into(),
        }
    }

    /// File written by [`Fonbook::save`].
    pub fn file_path(&self) -> PathBuf {
        self.config_dir.join(XML_FILE)
    }

    async fn read_entries(&self) -> Result<Option<Vec<FonbookEntry>>> {
        let xml_path = self.file_path();
        if xml_path.exists() {
            info!("Loading {}", xml_path.display());
            let document = tokio::fs::read_to_string(&xml_path).await?;
            return xml::parse(&document).map(Some);
        }
        debug!("XML phonebook not found, trying CSV phonebooks");

        let Some((index, csv_path)) = self.find_csv() else {
            return Ok(None);
        };
        if index > 0 {
            warn!(
                "Using deprecated file {}, please rename to {}",
                csv_path.display(),
                CSV_FILES[0]
            );
        }
        info!("Loading {}", csv_path.display());
        let bytes = tokio::fs::read(&csv_path).await?;
        Ok(Some(parse_csv(&String::from_utf8_lossy(&bytes))))
    }

    fn find_csv(&self) -> Option<(usize, PathBuf)> {
        CSV_FILES
            .iter()
            .map(|name| self.config_dir.join(name))
            .enumerate()
            .find(|(_, path)| path.exists())
    }
}

async fn write_document(path: &Path, document: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, document).await?;
    Ok(())
}

#[async_trait]
impl Fonbook for LocalFonbook {
    fn store(&self) -> &RwLock<FonbookStore> {
        &self.store
    }

    fn session(&self) -> &Session {
        &self.session
    }

    async fn initialize(&self) -> Result<()> {
        {
            let mut store = write_store(&self.store);
            store.set_initialized(false);
            store.clear();
            store.mark_saved();
        }

        let loaded = self.read_entries().await;
        let mut store = write_store(&self.store);
        let result = match loaded {
            Ok(Some(entries)) => {
                store.load(entries);
                store.sort(FonbookElement::Name, true);
                Ok(())
            }
            Ok(None) => {
                error!(
                    "File {} not found",
                    self.config_dir.join(CSV_FILES[0]).display()
                );
                Ok(())
            }
            Err(e) => {
                error!("Could not load local phonebook: {e}");
                Err(e)
            }
        };
        // an empty phonebook is still usable and saved as XML later
        store.set_initialized(true);
        result
    }

    async fn reload(&self) -> Result<()> {
        self.initialize().await
    }

    async fn persist(&self, entries: Vec<FonbookEntry>) -> Result<()> {
        let path = self.file_path();
        debug!("Saving to {}", path.display());
        write_document(&path, &xml::serialize(&entries)?).await?;
        debug!("Saving successful");
        Ok(())
    }
}
