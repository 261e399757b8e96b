//! Fritz!Box web interface client.

use crate::backoff::Backoff;
use crate::error::{FritzError, Result};
use crate::session::{EMPTY_SID, LoginState, LoginType, Session};
use crate::tools::url_encode_latin1;
use crate::transport::{FormPart, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};

const WEBCM: &str = "/cgi-bin/webcm";
const FIRMWARECFG: &str = "/cgi-bin/firmwarecfg";
const WANIPCONN_PATH: &str = "/upnp/control/WANIPConn1";
const WANIPCONN_SERVICE: &str = "urn:schemas-upnp-org:service:WANIPConnection:1";
const INTERFACE_LANGUAGES: [&str; 3] = ["en", "de", "fr"];
const FALLBACK_LANGUAGE: &str = "de";
const FONBOOK_IMPORT_NAME: &str = "FRITZ.Box_Telefonbuch_01.01.10_0000.xml";

/// Operations the rest of the crate needs from the device.
///
/// Implemented by [`FritzClient`]; tests substitute canned pages.
#[async_trait]
pub trait FritzApi: Send + Sync {
    /// Page containing the LKZ/OKZ location settings.
    async fn request_location_settings(&self) -> Result<String>;

    /// Page listing the SIP accounts.
    async fn request_sip_settings(&self) -> Result<String>;

    /// Call list as CSV.
    async fn request_call_list(&self) -> Result<String>;

    /// Phonebook as XML export, or the HTML page on old firmware.
    async fn request_fonbook(&self) -> Result<String>;

    /// Upload a phonebook XML document.
    async fn write_fonbook(&self, xml: &str) -> Result<()>;

    /// Let the device dial `number` on the configured port.
    async fn init_call(&self, number: &str) -> bool;

    /// Force a new WAN connection.
    async fn reconnect_isp(&self) -> bool;

    /// Current external IP address.
    async fn current_ip(&self) -> Option<String>;

    /// Whether the last login attempt succeeded.
    fn has_valid_password(&self) -> bool;
}

/// Shared handle to a device API.
pub type SharedApi = Arc<dyn FritzApi>;

#[derive(Debug, Clone, Copy)]
enum Page<'a> {
    Location,
    Sip,
    CallList,
    Fonbook,
    WriteFonbook(&'a str),
}

impl Page<'_> {
    fn describe(&self) -> &'static str {
        match self {
            Self::Location => "location settings",
            Self::Sip => "SIP settings",
            Self::CallList => "call list",
            Self::Fonbook => "phonebook",
            Self::WriteFonbook(_) => "phonebook upload",
        }
    }
}

/// Client for the web interface and the UPnP control port.
pub struct FritzClient<T: Transport> {
    session: Arc<Session>,
    ui: T,
    upnp: T,
    valid_password: AtomicBool,
}

impl<T: Transport> FritzClient<T> {
    /// Create a client using `ui` for web pages and `upnp` for SOAP calls.
    pub fn new(session: Arc<Session>, ui: T, upnp: T) -> Self {
        Self {
            session,
            ui,
            upnp,
            valid_password: AtomicBool::new(false),
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Log in if needed. Returns `false` if the device rejected the credentials.
    pub async fn login(&self) -> Result<bool> {
        let mut state = self.session.login().await;
        self.ensure_login(&mut state).await
    }

    async fn ensure_login(&self, state: &mut LoginState) -> Result<bool> {
        let valid = self.do_login(state).await?;
        self.valid_password.store(valid, Ordering::Relaxed);
        Ok(valid)
    }

    async fn do_login(&self, state: &mut LoginState) -> Result<bool> {
        if state.sid_is_fresh(std::time::Instant::now()) {
            return Ok(true);
        }

        let mut sid_page = String::new();
        if matches!(
            state.login_type,
            LoginType::Unknown | LoginType::Sid | LoginType::Lua
        ) {
            debug!("Requesting login_sid.lua");
            // Old firmware answers 404 here
            sid_page = self
                .ui
                .get(&format!("/login_sid.lua?sid={}", state.sid))
                .await
                .unwrap_or_default();
            if sid_page.contains("<Rights") {
                state.login_type = LoginType::Lua;
            } else {
                debug!("Requesting login_sid.xml");
                sid_page = self
                    .ui
                    .get(&format!("{WEBCM}?getpage=../html/login_sid.xml"))
                    .await?;
                state.login_type = if sid_page.contains("<iswriteaccess>") {
                    LoginType::Sid
                } else {
                    LoginType::Password
                };
            }
            debug!("Login type is {:?}", state.login_type);
        }

        match state.login_type {
            LoginType::Sid | LoginType::Lua => self.login_with_sid(state, &sid_page).await,
            LoginType::Password => self.login_with_password().await,
            LoginType::Unknown => Ok(false),
        }
    }

    async fn login_with_sid(&self, state: &mut LoginState, sid_page: &str) -> Result<bool> {
        let Some(sid) = extract_between(sid_page, "<SID>", "</SID>") else {
            error!("Expected <SID> not found in login page");
            return Ok(false);
        };
        if sid != EMPTY_SID {
            debug!("SID is still valid");
            state.sid = sid.to_string();
            state.touch();
            return Ok(true);
        }

        let Some(challenge) = extract_between(sid_page, "<Challenge>", "<") else {
            error!("Expected <Challenge> not found in login page");
            return Ok(false);
        };
        let device = self.session.device();
        let response = calculate_login_response(challenge, &device.password);

        debug!("Sending login request");
        let sid = if state.login_type == LoginType::Lua {
            let body = format!(
                "username={}&response={response}",
                url_encode_latin1(&device.username)
            );
            let reply = self.ui.post_form("/login_sid.lua", &body).await?;
            extract_between(&reply, "<SID>", "</SID>").map(str::to_string)
        } else {
            let body =
                format!("login:command/response={response}&getpage=../html/de/menus/menu2.html");
            let reply = self.ui.post_form(WEBCM, &body).await?;
            reply
                .find("name=\"sid\"")
                .and_then(|pos| extract_between(&reply[pos..], "value=\"", "\""))
                .map(str::to_string)
        };

        let Some(sid) = sid else {
            error!("Expected sid field not found in login reply");
            return Ok(false);
        };
        state.sid = sid;
        if state.sid == EMPTY_SID {
            error!("Login failed, check your password settings");
            return Ok(false);
        }
        info!("Logged in to {}", self.session.device().host);
        debug!("Session id {}", self.session.hidden(&state.sid));
        state.touch();
        Ok(true)
    }

    async fn login_with_password(&self) -> Result<bool> {
        let password = &self.session.device().password;
        if password.is_empty() {
            return Ok(true);
        }
        debug!("Logging in without SIDs");
        let body = format!("login:command/password={}", url_encode_latin1(password));
        let reply = self.ui.post_form(WEBCM, &body).await?;
        if reply.contains("class=\"errorMessage\"") {
            error!("Login failed, check your password settings");
            return Ok(false);
        }
        Ok(true)
    }

    /// Web interface language of legacy firmware, detected once per session.
    async fn lang(&self, state: &mut LoginState) -> String {
        if !state.lang.is_empty() {
            return state.lang.clone();
        }
        for lang in INTERFACE_LANGUAGES {
            let path = format!(
                "{WEBCM}?getpage=../html/{lang}/menus/menu2.html{}",
                state.sid_param()
            );
            if let Ok(body) = self.ui.get(&path).await {
                if body.contains("<html>") {
                    debug!("Interface language is {lang}");
                    state.lang = lang.to_string();
                    return state.lang.clone();
                }
            }
        }
        debug!("Could not detect interface language, assuming '{FALLBACK_LANGUAGE}'");
        state.lang = FALLBACK_LANGUAGE.to_string();
        state.lang.clone()
    }

    /// Legacy `menu2.html` page URL for `pagename`.
    async fn webcm_page(&self, state: &mut LoginState, pagename: &str, escaped: bool) -> String {
        let lang = self.lang(state).await;
        let colon = if escaped { "%3A" } else { ":" };
        format!(
            "{WEBCM}?getpage=../html/{lang}/menus/menu2.html&var{colon}lang={lang}&var{colon}pagename={pagename}&var{colon}menu=fon{}",
            state.sid_param()
        )
    }

    /// Try the lua page first, fall back to the legacy page.
    async fn lua_or_webcm(
        &self,
        state: &mut LoginState,
        lua_path: &str,
        pagename: &str,
    ) -> Result<String> {
        if !state.sid.is_empty() {
            let path = format!("{lua_path}?sid={}", state.sid);
            if let Ok(body) = self.ui.get(&path).await {
                if body.contains(&format!("<!-- pagename:{lua_path}-->")) {
                    return Ok(body);
                }
            }
            debug!("{lua_path} not available, using webcm");
        }
        let path = self.webcm_page(state, pagename, true).await;
        self.ui.get(&path).await
    }

    async fn fetch_call_list(&self, state: &mut LoginState) -> Result<String> {
        // Opening the call page makes the device refresh its CSV export
        let page_path = self.webcm_page(state, "foncalls", false).await;
        let page = self.ui.get(&page_path).await;

        debug!("Requesting call list (lua)");
        let lua_path = format!("/fon_num/foncalls_list.lua?csv=&sid={}", state.sid);
        if let Ok(csv) = self.ui.get(&lua_path).await {
            if csv.contains("Typ;Datum;Name;") {
                return Ok(csv);
            }
        }

        debug!("Requesting call list (webcm)");
        let page = page?;
        let csv_url = csv_link(&page)
            .ok_or_else(|| FritzError::parse("No CSV export link on the call list page"))?;
        self.ui
            .get(&format!("{WEBCM}?getpage={csv_url}{}", state.sid_param()))
            .await
    }

    async fn fetch_fonbook(&self, state: &mut LoginState) -> Result<String> {
        if !state.sid.is_empty() {
            debug!("Requesting phonebook export");
            let parts = vec![
                FormPart::text("sid", state.sid.clone()),
                FormPart::text("PhonebookId", "0"),
                FormPart::text("PhonebookExportName", "Telefonbuch"),
                FormPart::text("PhonebookExport", ""),
            ];
            if let Ok(xml) = self.ui.post_multipart(FIRMWARECFG, parts).await {
                if xml.contains("<phonebooks>") {
                    return Ok(xml);
                }
            }
        }
        debug!("Requesting phonebook page");
        let path = self.webcm_page(state, "fonbuch", false).await;
        self.ui.get(&path).await
    }

    async fn upload_fonbook(&self, state: &LoginState, xml: &str) -> Result<String> {
        debug!("Uploading phonebook");
        let parts = vec![
            FormPart::text("sid", state.sid.clone()),
            FormPart::text("PhonebookId", "0"),
            FormPart::file("PhonebookImportFile", FONBOOK_IMPORT_NAME, "text/xml", xml),
        ];
        self.ui.post_multipart(FIRMWARECFG, parts).await
    }

    async fn fetch(&self, state: &mut LoginState, page: Page<'_>) -> Result<String> {
        let logged_in = self.ensure_login(state).await?;
        if !logged_in && matches!(page, Page::WriteFonbook(_)) {
            return Err(FritzError::LoginFailed(format!(
                "cannot upload phonebook to {}",
                self.session.device().host
            )));
        }
        let body = match page {
            Page::Location => {
                self.lua_or_webcm(state, "/fon_num/sip_option.lua", "sipoptionen")
                    .await?
            }
            Page::Sip => {
                self.lua_or_webcm(state, "/fon_num/fon_num_list.lua", "siplist")
                    .await?
            }
            Page::CallList => self.fetch_call_list(state).await?,
            Page::Fonbook => self.fetch_fonbook(state).await?,
            Page::WriteFonbook(xml) => self.upload_fonbook(state, xml).await?,
        };
        if state.login_type.uses_sid() {
            state.touch();
        }
        Ok(body)
    }

    /// Fetch `page`, retrying transient failures with backoff.
    ///
    /// The login lock is released while waiting.
    async fn fetch_with_retry(&self, page: Page<'_>) -> Result<String> {
        let mut backoff = Backoff::new(self.session.retry());
        loop {
            let result = {
                let mut state = self.session.login().await;
                self.fetch(&mut state, page).await
            };
            match result {
                Ok(body) => return Ok(body),
                Err(e) if e.is_transient() => {
                    error!(
                        "Requesting {} from {} failed: {e}",
                        page.describe(),
                        self.session.device().host
                    );
                    let Some(delay) = backoff.next_delay() else {
                        error!("Giving up after {} attempts", backoff.attempts());
                        return Err(e);
                    };
                    warn!("Waiting {} seconds before retrying", delay.as_secs());
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn soap_call(&self, action: &str) -> Result<String> {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <s:Envelope s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\" \
             xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\">\
             <s:Body><u:{action} xmlns:u=\"{WANIPCONN_SERVICE}\" /></s:Body></s:Envelope>"
        );
        let soap_action = format!("{WANIPCONN_SERVICE}#{action}");
        self.upnp
            .soap(WANIPCONN_PATH, &soap_action, &envelope)
            .await
    }
}

#[async_trait]
impl<T: Transport> FritzApi for FritzClient<T> {
    async fn request_location_settings(&self) -> Result<String> {
        self.fetch_with_retry(Page::Location).await
    }

    async fn request_sip_settings(&self) -> Result<String> {
        self.fetch_with_retry(Page::Sip).await
    }

    async fn request_call_list(&self) -> Result<String> {
        self.fetch_with_retry(Page::CallList).await
    }

    async fn request_fonbook(&self) -> Result<String> {
        self.fetch_with_retry(Page::Fonbook).await
    }

    async fn write_fonbook(&self, xml: &str) -> Result<()> {
        self.fetch_with_retry(Page::WriteFonbook(xml)).await?;
        Ok(())
    }

    async fn init_call(&self, number: &str) -> bool {
        if number.is_empty() {
            return false;
        }
        let mut state = self.session.login().await;
        match self.ensure_login(&mut state).await {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                error!("Login before dialing failed: {e}");
                return false;
            }
        }

        info!("Sending call init request {}", self.session.hidden(number));
        let lang = self.lang(&mut state).await;
        let body = format!(
            "getpage=../html/{lang}/menus/menu2.html&var%3Apagename=fonbuch&var%3Amenu=home&telcfg%3Acommand/Dial={number}{}",
            state.sid_param()
        );
        match self.ui.post_form(WEBCM, &body).await {
            Ok(_) => {
                info!("Call initiated");
                true
            }
            Err(e) => {
                error!("Call init request failed: {e}");
                false
            }
        }
    }

    async fn reconnect_isp(&self) -> bool {
        debug!("Sending reconnect request");
        match self.soap_call("ForceTermination").await {
            Ok(reply) => reply.contains("ForceTerminationResponse"),
            Err(e) => {
                error!("Reconnect request to {} failed: {e}", self.session.device().host);
                false
            }
        }
    }

    async fn current_ip(&self) -> Option<String> {
        debug!("Requesting external IP address");
        let reply = match self.soap_call("GetExternalIPAddress").await {
            Ok(reply) => reply,
            Err(e) => {
                error!("IP request to {} failed: {e}", self.session.device().host);
                return None;
            }
        };
        match extract_between(&reply, "<NewExternalIPAddress>", "</NewExternalIPAddress>") {
            Some(ip) => {
                debug!("Current IP is {ip}");
                Some(ip.to_string())
            }
            None => {
                error!("Could not parse external IP address reply");
                None
            }
        }
    }

    fn has_valid_password(&self) -> bool {
        self.valid_password.load(Ordering::Relaxed)
    }
}

/// Response to a login challenge.
///
/// The device expects `challenge-md5(challenge-password)` where the hash input
/// is UTF-16LE and every code unit above 0xFF is replaced by `.`.
pub fn calculate_login_response(challenge: &str, password: &str) -> String {
    let input = format!("{challenge}-{password}");
    let bytes: Vec<u8> = input
        .encode_utf16()
        .flat_map(|unit| match u8::try_from(unit) {
            Ok(byte) => [byte, 0x00],
            Err(_) => [0x2e, 0x00],
        })
        .collect();
    format!("{challenge}-{:x}", md5::compute(bytes))
}

/// Text between the first `start` marker and the following `end` marker.
fn extract_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(&haystack[from..from + len])
}

/// The quoted `.csv` link on the legacy call list page.
fn csv_link(page: &str) -> Option<&str> {
    let pos = page.find(".csv")?;
    let start = page[..pos].rfind('"')? + 1;
    let stop = pos + page[pos..].find('"')?;
    Some(&page[start..stop])
}
