//! Lifecycle of the library objects sharing one device session.

use crate::call_list::CallList;
use crate::client::{FritzClient, SharedApi};
use crate::config::AppConfig;
use crate::error::{FritzError, Result};
use crate::fonbook::{Fonbook, FonbookManager, LookupFonbook, ReverseLookup};
use crate::listener::{EventHandler, Listener};
use crate::session::Session;
use crate::tools::{parse_location_settings, parse_sip_settings};
use crate::transport::HttpTransport;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Outcome of [`FritzService::init`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitReport {
    pub valid_password: bool,
    /// Whether the device reported country and area code.
    pub location_detected: bool,
    pub country_code: String,
    pub region_code: String,
}

/// Owns the session, the device client and the optional call list,
/// phonebooks and call monitor.
///
/// Creating one of those again replaces the previous instance.
pub struct FritzService {
    config: AppConfig,
    session: Arc<Session>,
    api: SharedApi,
    lookups: Vec<Arc<dyn Fonbook>>,
    call_list: Option<Arc<CallList>>,
    fonbooks: Option<Arc<FonbookManager>>,
    listener: Option<Listener>,
}

impl FritzService {
    /// Validate `config` and prepare the HTTP clients. Nothing is sent yet.
    pub fn setup(config: AppConfig) -> Result<Self> {
        config.validate().map_err(|e| FritzError::config(e.to_string()))?;
        let session = Arc::new(Session::new(&config));
        let device = session.device();
        let ui = HttpTransport::new(&device.host, device.ui_port, device.timeout())?;
        let upnp = HttpTransport::new(&device.host, device.upnp_port, device.timeout())?;
        let api: SharedApi = Arc::new(FritzClient::new(Arc::clone(&session), ui, upnp));
        info!("Set up connection to {}", device.host);
        Ok(Self::with_api(config, session, api))
    }

    /// Build a service around an existing device API.
    pub fn with_api(config: AppConfig, session: Arc<Session>, api: SharedApi) -> Self {
        Self {
            config,
            session,
            api,
            lookups: Vec::new(),
            call_list: None,
            fonbooks: None,
            listener: None,
        }
    }

    /// Read location and SIP settings from the device.
    ///
    /// Country and area code fall back to the configured values if the
    /// device does not report them.
    pub async fn init(&self) -> InitReport {
        let location = match self.api.request_location_settings().await {
            Ok(page) => parse_location_settings(&page),
            Err(e) => {
                error!("Could not fetch location settings: {e}");
                None
            }
        };
        let detected = location.filter(|(country, region)| !country.is_empty() && !region.is_empty());
        let location_detected = detected.is_some();
        let (country_code, region_code) = match detected {
            Some((country, region)) => {
                debug!(
                    "Found LKZ {} and OKZ {}",
                    self.session.hidden(&country),
                    self.session.hidden(&region)
                );
                (country, region)
            }
            None => {
                error!("LKZ/OKZ not detected, resolving phone numbers may not always work");
                (
                    self.config.location.country_code.clone(),
                    self.config.location.region_code.clone(),
                )
            }
        };
        {
            let mut phone = self.session.phone_mut();
            phone.country_code = country_code.clone();
            phone.region_code = region_code.clone();
        }

        self.load_sip_settings().await;

        InitReport {
            valid_password: self.api.has_valid_password(),
            location_detected,
            country_code,
            region_code,
        }
    }

    async fn load_sip_settings(&self) {
        if !self.session.phone().sip_names.is_empty() {
            return;
        }
        let page = match self.api.request_sip_settings().await {
            Ok(page) => page,
            Err(e) => {
                error!("Could not fetch SIP settings: {e}");
                return;
            }
        };
        match parse_sip_settings(&page) {
            Some((names, msns)) => {
                debug!("Found {} SIP providers", names.iter().filter(|n| !n.is_empty()).count());
                let mut phone = self.session.phone_mut();
                phone.sip_names = names;
                phone.sip_msns = msns;
            }
            None => error!("SIP provider names not set, call monitor shows plain media"),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn api(&self) -> &SharedApi {
        &self.api
    }

    pub fn call_list(&self) -> Option<&Arc<CallList>> {
        self.call_list.as_ref()
    }

    pub fn fonbooks(&self) -> Option<&Arc<FonbookManager>> {
        self.fonbooks.as_ref()
    }

    pub fn listener_mut(&mut self) -> Option<&mut Listener> {
        self.listener.as_mut()
    }

    /// Make a reverse lookup available to the next phonebook manager.
    pub fn register_lookup<L: ReverseLookup + 'static>(&mut self, lookup: L) {
        let fonbook = LookupFonbook::new(lookup, Arc::clone(&self.session));
        self.lookups.push(Arc::new(fonbook));
    }

    /// Create the call list and start fetching it.
    pub async fn create_call_list(&mut self) -> Arc<CallList> {
        if self.call_list.take().is_some() {
            debug!("Replacing call list");
        }
        let call_list = CallList::create(Arc::clone(&self.api), Arc::clone(&self.session)).await;
        self.call_list = Some(Arc::clone(&call_list));
        call_list
    }

    /// Create the phonebooks enabled in the configuration.
    ///
    /// A previous manager is shut down first, saving its changes if configured.
    pub async fn create_fonbook_manager(&mut self) -> Arc<FonbookManager> {
        if let Some(previous) = self.fonbooks.take() {
            debug!("Replacing phonebook manager");
            previous.shutdown().await;
        }
        let mut registry =
            FonbookManager::builtin(Arc::clone(&self.api), &self.session, &self.config.fonbook);
        registry.extend(self.lookups.iter().cloned());
        let manager = Arc::new(
            FonbookManager::create(Arc::clone(&self.session), &self.config.fonbook, registry).await,
        );
        self.fonbooks = Some(Arc::clone(&manager));
        manager
    }

    /// Start the call monitor with the current phonebooks and call list.
    ///
    /// Without `handler` the handler of the running monitor is reused.
    pub fn create_listener(&mut self, handler: Option<Arc<dyn EventHandler>>) -> Result<()> {
        let previous = self.listener.take();
        let handler = match (handler, &previous) {
            (Some(handler), _) => handler,
            (None, Some(listener)) => listener.handler(),
            (None, None) => {
                return Err(FritzError::config(
                    "the first call monitor needs an event handler",
                ));
            }
        };
        drop(previous);
        self.listener = Some(Listener::start(
            Arc::clone(&self.session),
            handler,
            self.fonbooks.clone(),
            self.call_list.clone(),
        ));
        Ok(())
    }

    /// Stop the call monitor and release phonebooks and call list.
    pub async fn shutdown(&mut self) {
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }
        if let Some(fonbooks) = self.fonbooks.take() {
            fonbooks.shutdown().await;
        }
        if let Some(call_list) = self.call_list.take() {
            call_list.wait_ready().await;
        }
        info!("Shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_list::CallType;
    use crate::listener::CallInfo;
    use crate::testing::{FakeApi, FakeDirectory};
    use async_trait::async_trait;
    use tempfile::TempDir;

    const LOCATION: &str = r#"["telcfg:settings/Location/LKZ"] = "49",
        ["telcfg:settings/Location/OKZ"] = "7251","#;

    const SIP: &str = r#"<!-- pagename:/fon_num/fon_num_list.lua-->
        ["telcfg:settings/SIP0/MSN"] = "4711",
        ["telcfg:settings/SIP0/Name"] = "sipgate","#;

    struct Quiet;

    #[async_trait]
    impl EventHandler for Quiet {
        async fn handle_call(&self, _call: CallInfo) {}

        async fn handle_connect(&self, _conn_id: u32) {}

        async fn handle_disconnect(&self, _conn_id: u32, _duration: &str) {}
    }

    fn service(api: FakeApi, dir: &TempDir) -> (Arc<FakeApi>, FritzService) {
        let mut config = AppConfig::default();
        config.device.host = "127.0.0.1".to_string();
        config.location.country_code = "41".to_string();
        config.location.region_code = "44".to_string();
        config.fonbook.enabled = vec!["LOCL".to_string(), "TEST".to_string()];
        config.fonbook.active = "LOCL".to_string();
        config.fonbook.config_dir = dir.path().to_path_buf();
        let session = Arc::new(Session::new(&config));
        let api = Arc::new(api);
        let service = FritzService::with_api(config, session, api.clone());
        (api, service)
    }

    #[test]
    fn test_setup_rejects_invalid_config() {
        let mut config = AppConfig::default();
        config.device.host = "http://fritz.box".to_string();
        assert!(matches!(FritzService::setup(config), Err(FritzError::Config(_))));
    }

    #[tokio::test]
    async fn test_init_detects_location_and_sip() {
        let dir = TempDir::new().unwrap();
        let api = FakeApi::default()
            .with_location(LOCATION)
            .with_sip(SIP)
            .with_valid_password();
        let (_, service) = service(api, &dir);

        let report = service.init().await;
        assert_eq!(
            report,
            InitReport {
                valid_password: true,
                location_detected: true,
                country_code: "49".to_string(),
                region_code: "7251".to_string(),
            }
        );
        assert_eq!(service.session().location(), ("49".to_string(), "7251".to_string()));
        let phone = service.session().phone();
        assert_eq!(phone.sip_names[0], "sipgate");
        assert_eq!(phone.sip_msns[0], "4711");
    }

    #[tokio::test]
    async fn test_init_falls_back_to_configured_location() {
        let dir = TempDir::new().unwrap();
        let (_, service) = service(FakeApi::default(), &dir);

        let report = service.init().await;
        assert!(!report.valid_password);
        assert!(!report.location_detected);
        assert_eq!(report.country_code, "41");
        assert_eq!(report.region_code, "44");
        assert!(service.session().phone().sip_names.is_empty());
    }

    #[tokio::test]
    async fn test_create_objects_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let api = FakeApi::default().with_call_list("2;15.03.10 18:35;;0721;Telefon;4711;0:00\n");
        let (api, mut service) = service(api, &dir);
        service.register_lookup(FakeDirectory::new("0800111", "Hotline"));

        assert!(service.create_listener(None).is_err());

        let call_list = service.create_call_list().await;
        call_list.wait_ready().await;
        assert_eq!(call_list.size(CallType::Missed), 1);
        assert_eq!(api.call_list_requests(), 1);

        let fonbooks = service.create_fonbook_manager().await;
        assert_eq!(fonbooks.enabled_ids(), vec!["LOCL", "TEST"]);
        assert!(fonbooks.resolve_to_name("0800111").await.successful);

        service.create_listener(Some(Arc::new(Quiet))).unwrap();
        service.create_listener(None).unwrap();
        assert!(service.listener_mut().is_some());

        let mut entry = crate::fonbook::FonbookEntry::new("Anna", false);
        entry.push_number("0721", crate::fonbook::NumberType::Home);
        fonbooks.add_entry(entry, None);
        service.shutdown().await;

        assert!(service.call_list().is_none());
        assert!(service.fonbooks().is_none());
        assert!(service.listener_mut().is_none());
        assert!(dir.path().join("localphonebook.xml").exists());
    }

    #[tokio::test]
    async fn test_device_operations_go_through_api() {
        let dir = TempDir::new().unwrap();
        let (api, service) = service(FakeApi::default().with_ip("192.0.2.1"), &dir);
        assert!(service.api().init_call("0721123").await);
        assert!(!service.api().init_call("").await);
        assert_eq!(api.dialed(), vec!["0721123"]);
        assert!(service.api().reconnect_isp().await);
        assert_eq!(service.api().current_ip().await.as_deref(), Some("192.0.2.1"));
    }
}
