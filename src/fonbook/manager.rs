//! Registry of the phonebooks and the one currently shown.

use super::{FonbookElement, FonbookEntry, Fonbook, ResolveResult};
use super::{FritzFonbook, LocalFonbook};
use crate::client::SharedApi;
use crate::config::FonbookConfig;
use crate::session::Session;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, warn};

/// Enabled phonebooks in lookup order, and which of them is active.
///
/// Operations on entries go to the active phonebook. Without one they do
/// nothing and report empty values.
pub struct FonbookManager {
    session: Arc<Session>,
    fonbooks: Vec<Arc<dyn Fonbook>>,
    enabled: Vec<Arc<dyn Fonbook>>,
    active: RwLock<Option<usize>>,
    save_on_shutdown: bool,
}

impl FonbookManager {
    /// The phonebooks always available: the device's and the local one.
    pub fn builtin(api: SharedApi, session: &Arc<Session>, config: &FonbookConfig) -> Vec<Arc<dyn Fonbook>> {
        let fritz: Arc<dyn Fonbook> = Arc::new(FritzFonbook::new(api, Arc::clone(session)));
        let local: Arc<dyn Fonbook> = Arc::new(LocalFonbook::new(Arc::clone(session), &config.config_dir));
        vec![fritz, local]
    }

    /// Set up the phonebooks enabled in `config` out of `registry`.
    ///
    /// Unknown tech ids are dropped. Every enabled phonebook is initialized.
    pub async fn create(
        session: Arc<Session>,
        config: &FonbookConfig,
        registry: Vec<Arc<dyn Fonbook>>,
    ) -> Self {
        let mut enabled = Vec::new();
        for id in &config.enabled {
            match registry.iter().find(|fonbook| fonbook.tech_id() == *id) {
                Some(fonbook) if enabled.iter().all(|e: &Arc<dyn Fonbook>| e.tech_id() != *id) => {
                    enabled.push(Arc::clone(fonbook))
                }
                Some(_) => warn!("Phonebook {id} enabled twice"),
                None => warn!("Unknown phonebook {id} ignored"),
            }
        }

        for fonbook in &enabled {
            if let Err(e) = fonbook.initialize().await {
                error!("Could not initialize phonebook {}: {e}", fonbook.tech_id());
            }
        }

        let wanted = config.active.as_str();
        let active = if wanted.is_empty() {
            None
        } else {
            let pos = enabled.iter().position(|fonbook| fonbook.tech_id() == wanted);
            if pos.is_none() {
                error!("Active phonebook '{wanted}' is not enabled or unknown");
            }
            pos.filter(|&pos| enabled[pos].is_displayable())
        };

        let manager = Self {
            session,
            fonbooks: registry,
            enabled,
            active: RwLock::new(active),
            save_on_shutdown: config.save_on_shutdown,
        };
        match active {
            Some(pos) => manager.record_active(pos),
            None => manager.next_fonbook(),
        }
        manager
    }

    /// Every known phonebook, enabled or not.
    pub fn fonbooks(&self) -> &[Arc<dyn Fonbook>] {
        &self.fonbooks
    }

    pub fn fonbook(&self, tech_id: &str) -> Option<Arc<dyn Fonbook>> {
        self.fonbooks
            .iter()
            .find(|fonbook| fonbook.tech_id() == tech_id)
            .cloned()
    }

    /// Tech ids of the enabled phonebooks in lookup order.
    pub fn enabled_ids(&self) -> Vec<String> {
        self.enabled.iter().map(|fonbook| fonbook.tech_id()).collect()
    }

    fn active_pos(&self) -> Option<usize> {
        *self.active.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_active(&self, pos: usize) {
        if let Some(fonbook) = self.enabled.get(pos) {
            self.session.phone_mut().active_fonbook = fonbook.tech_id();
        }
    }

    pub fn active_fonbook(&self) -> Option<Arc<dyn Fonbook>> {
        self.active_pos().and_then(|pos| self.enabled.get(pos)).cloned()
    }

    /// Switch to the next displayable phonebook, wrapping around.
    pub fn next_fonbook(&self) {
        if self.enabled.is_empty() {
            return;
        }
        let start = self.active_pos().map_or(0, |pos| pos + 1);
        let displayable = |pos: &usize| self.enabled[*pos].is_displayable();
        let next = (start..self.enabled.len())
            .find(displayable)
            .or_else(|| (0..self.enabled.len()).find(displayable));

        *self.active.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        match next {
            Some(pos) => self.record_active(pos),
            None => debug!("No displayable phonebook enabled"),
        }
    }

    /// Ask the enabled phonebooks in order until one knows `number`.
    pub async fn resolve_to_name(&self, number: &str) -> ResolveResult {
        let mut result = ResolveResult::unresolved(number);
        for fonbook in &self.enabled {
            result = fonbook.resolve_to_name(number).await;
            debug!(
                "Resolve {} via {}: {}",
                self.session.hidden(number),
                fonbook.tech_id(),
                self.session.hidden(&result.name)
            );
            if result.successful {
                return result;
            }
        }
        result
    }

    pub fn entry(&self, id: usize) -> Option<FonbookEntry> {
        self.active_fonbook()?.entry(id)
    }

    pub fn entries(&self) -> Vec<FonbookEntry> {
        self.active_fonbook().map(|f| f.entries()).unwrap_or_default()
    }

    pub fn change_entry(&self, id: usize, entry: FonbookEntry) -> bool {
        self.active_fonbook().is_some_and(|f| f.change_entry(id, entry))
    }

    pub fn set_default(&self, id: usize, pos: usize) -> bool {
        self.active_fonbook().is_some_and(|f| f.set_default(id, pos))
    }

    pub fn add_entry(&self, entry: FonbookEntry, pos: Option<usize>) {
        if let Some(fonbook) = self.active_fonbook() {
            fonbook.add_entry(entry, pos);
        }
    }

    pub fn delete_entry(&self, id: usize) -> bool {
        self.active_fonbook().is_some_and(|f| f.delete_entry(id))
    }

    pub fn clear(&self) {
        if let Some(fonbook) = self.active_fonbook() {
            fonbook.clear();
        }
    }

    /// Save the active phonebook.
    pub async fn save(&self) -> crate::error::Result<()> {
        match self.active_fonbook() {
            Some(fonbook) => fonbook.save().await,
            None => Ok(()),
        }
    }

    pub fn sort(&self, element: FonbookElement, ascending: bool) {
        if let Some(fonbook) = self.active_fonbook() {
            fonbook.sort(element, ascending);
        }
    }

    pub fn size(&self) -> usize {
        self.active_fonbook().map_or(0, |f| f.size())
    }

    pub fn title(&self) -> String {
        self.active_fonbook().map(|f| f.title()).unwrap_or_default()
    }

    pub fn tech_id(&self) -> String {
        self.active_fonbook().map(|f| f.tech_id()).unwrap_or_default()
    }

    pub fn is_displayable(&self) -> bool {
        self.active_fonbook().is_some_and(|f| f.is_displayable())
    }

    pub fn is_writeable(&self) -> bool {
        self.active_fonbook().is_some_and(|f| f.is_writeable())
    }

    pub fn is_initialized(&self) -> bool {
        self.active_fonbook().is_some_and(|f| f.is_initialized())
    }

    pub fn is_modified(&self) -> bool {
        self.active_fonbook().is_some_and(|f| f.is_modified())
    }

    /// Reload every enabled phonebook.
    pub async fn reload(&self) {
        for fonbook in &self.enabled {
            if let Err(e) = fonbook.reload().await {
                error!("Could not reload phonebook {}: {e}", fonbook.tech_id());
            }
        }
    }

    /// Wait for background loads of the enabled phonebooks.
    pub async fn wait_ready(&self) {
        for fonbook in &self.enabled {
            fonbook.wait_ready().await;
        }
    }

    /// Save pending changes of all phonebooks if configured to.
    pub async fn shutdown(&self) {
        if !self.save_on_shutdown {
            return;
        }
        for fonbook in &self.fonbooks {
            debug!("Saving phonebook {}", fonbook.tech_id());
            if let Err(e) = fonbook.save().await {
                error!("Could not save phonebook {}: {e}", fonbook.tech_id());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::fonbook::{LookupFonbook, NumberType, fritz};
    use crate::testing::{FakeApi, FakeDirectory};
    use tempfile::TempDir;

    const EXPORT: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<phonebooks><phonebook>
<contact><category>0</category><person><realName>Anna</realName></person>
<telephony><number type="home" prio="1">072514711</number></telephony></contact>
</phonebook></phonebooks>"#;

    struct Fixture {
        api: Arc<FakeApi>,
        session: Arc<Session>,
        config: FonbookConfig,
        _dir: TempDir,
    }

    fn fixture(enabled: &[&str], active: &str) -> Fixture {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("localphonebook.csv"), "Bert,2,0171555\n").unwrap();
        let mut config = AppConfig::default();
        config.location.country_code = "49".to_string();
        config.location.region_code = "7251".to_string();
        config.fonbook.enabled = enabled.iter().map(|s| s.to_string()).collect();
        config.fonbook.active = active.to_string();
        config.fonbook.config_dir = dir.path().to_path_buf();
        Fixture {
            api: Arc::new(FakeApi::default().with_fonbook(EXPORT)),
            session: Arc::new(Session::new(&config)),
            config: config.fonbook,
            _dir: dir,
        }
    }

    async fn manager(fixture: &Fixture) -> FonbookManager {
        let mut registry = FonbookManager::builtin(fixture.api.clone(), &fixture.session, &fixture.config);
        let directory = FakeDirectory::new("0800111", "Hotline");
        registry.push(Arc::new(LookupFonbook::new(directory, Arc::clone(&fixture.session))));
        let manager = FonbookManager::create(Arc::clone(&fixture.session), &fixture.config, registry).await;
        manager.wait_ready().await;
        manager
    }

    #[tokio::test]
    async fn test_unknown_ids_are_dropped() {
        let fixture = fixture(&["FRITZ", "BOGUS", "TEST", "LOCL"], "");
        let manager = manager(&fixture).await;
        assert_eq!(manager.enabled_ids(), vec!["FRITZ", "TEST", "LOCL"]);
        assert_eq!(manager.fonbooks().len(), 3);
        assert!(manager.fonbook("LOCL").unwrap().is_initialized());
    }

    #[tokio::test]
    async fn test_configured_active_fonbook() {
        let fixture = fixture(&["FRITZ", "LOCL"], "LOCL");
        let manager = manager(&fixture).await;
        assert_eq!(manager.tech_id(), "LOCL");
        assert_eq!(manager.title(), "Local phone book");
        assert_eq!(manager.entry(0).unwrap().name, "Bert");
        assert_eq!(fixture.session.phone().active_fonbook, "LOCL");
    }

    #[tokio::test]
    async fn test_invalid_active_falls_back_to_first_displayable() {
        let fixture = fixture(&["TEST", "FRITZ", "LOCL"], "TEST");
        let manager = manager(&fixture).await;
        assert_eq!(manager.tech_id(), "FRITZ");
        assert_eq!(fixture.session.phone().active_fonbook, "FRITZ");
        assert_eq!(manager.size(), 1);
        assert!(manager.is_writeable());
    }

    #[tokio::test]
    async fn test_next_fonbook_wraps_and_skips_lookups() {
        let fixture = fixture(&["FRITZ", "TEST", "LOCL"], "FRITZ");
        let manager = manager(&fixture).await;
        manager.next_fonbook();
        assert_eq!(manager.tech_id(), "LOCL");
        manager.next_fonbook();
        assert_eq!(manager.tech_id(), "FRITZ");
        assert_eq!(fixture.session.phone().active_fonbook, "FRITZ");
    }

    #[tokio::test]
    async fn test_no_displayable_fonbook() {
        let fixture = fixture(&["TEST"], "");
        let manager = manager(&fixture).await;
        assert!(manager.active_fonbook().is_none());
        assert_eq!(manager.size(), 0);
        assert_eq!(manager.title(), "");
        assert!(manager.entry(0).is_none());
        assert!(!manager.delete_entry(0));
        assert!(!manager.is_initialized());
        manager.save().await.unwrap();
    }

    #[tokio::test]
    async fn test_resolve_in_order() {
        let fixture = fixture(&["FRITZ", "LOCL", "TEST"], "");
        let manager = manager(&fixture).await;

        let result = manager.resolve_to_name("4711").await;
        assert_eq!(result.name, "Anna");
        assert_eq!(result.kind, NumberType::Home);

        let result = manager.resolve_to_name("+49171555").await;
        assert_eq!(result.name, "Bert");

        let result = manager.resolve_to_name("0800111").await;
        assert!(result.successful);
        assert_eq!(result.name, "Hotline");

        let result = manager.resolve_to_name("0999").await;
        assert!(!result.successful);
        assert_eq!(result.name, "0999");
    }

    #[tokio::test]
    async fn test_shutdown_saves_modified_fonbooks() {
        let fixture = fixture(&["LOCL"], "LOCL");
        let manager = manager(&fixture).await;
        let mut entry = FonbookEntry::new("Carl", false);
        entry.push_number("0721", NumberType::Home);
        manager.add_entry(entry, None);
        assert!(manager.is_modified());

        manager.shutdown().await;
        let saved = std::fs::read_to_string(fixture.config.config_dir.join("localphonebook.xml")).unwrap();
        assert!(saved.contains("<realName>Carl</realName>"));
        assert!(!manager.is_modified());
    }

    #[tokio::test]
    async fn test_reload_fetches_device_fonbook_again() {
        let fixture = fixture(&["FRITZ"], "FRITZ");
        let manager = manager(&fixture).await;
        manager.clear();
        assert_eq!(manager.size(), 0);
        manager.reload().await;
        manager.wait_ready().await;
        assert_eq!(manager.size(), 1);
        assert_eq!(manager.tech_id(), fritz::TECH_ID);
    }
}
