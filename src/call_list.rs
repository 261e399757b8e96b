//! Call list retrieval and parsing.

use crate::client::SharedApi;
use crate::session::Session;
use crate::tools::{matches_msn_filter, normalize_number};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock, RwLockReadGuard};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Kind of call as reported in the CSV export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    All,
    Incoming,
    Missed,
    Outgoing,
    /// Codes this library does not know, e.g. rejected calls.
    Other(u32),
}

impl CallType {
    /// Map the CSV type column. Newer firmware reports outgoing calls as `4`.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => Self::All,
            1 => Self::Incoming,
            2 => Self::Missed,
            3 | 4 => Self::Outgoing,
            other => Self::Other(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::All => 0,
            Self::Incoming => 1,
            Self::Missed => 2,
            Self::Outgoing => 3,
            Self::Other(code) => code,
        }
    }
}

/// Column to sort the call list by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallElement {
    Type,
    Date,
    RemoteName,
    RemoteNumber,
    LocalName,
    LocalNumber,
    Duration,
}

/// One row of the call list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallEntry {
    pub call_type: CallType,
    pub date: String,
    pub time: String,
    pub remote_name: String,
    pub remote_number: String,
    pub local_name: String,
    pub local_number: String,
    pub duration: String,
    pub timestamp: Option<DateTime<Local>>,
}

impl CallEntry {
    /// Whether the call belongs to one of the filtered MSNs.
    ///
    /// Analog lines report a name like "Festnetz" instead of a number; those
    /// always pass.
    pub fn matches_filter(&self, msn_filter: &[String]) -> bool {
        matches_msn_filter(&self.local_number, msn_filter)
            || !self.local_number.chars().any(|c| c.is_ascii_digit())
    }

    /// Whether `number` is the remote party of this call.
    pub fn matches_remote_number(&self, number: &str, country_code: &str, region_code: &str) -> bool {
        normalize_number(number, country_code, region_code)
            == normalize_number(&self.remote_number, country_code, region_code)
    }
}

/// Parse the CSV export of the call list.
///
/// Header and comment lines are skipped, as are lines with too few columns.
pub fn parse_call_list(csv: &str) -> Vec<CallEntry> {
    let mut entries = Vec::new();
    for line in csv.lines() {
        if !line.starts_with(|c: char| c.is_ascii_digit()) {
            debug!("Skipped call list line");
            continue;
        }
        let fields: Vec<&str> = line.splitn(7, ';').collect();
        let [kind, date_time, name, number, local_name, local_number, duration] = fields[..]
        else {
            debug!("Skipped incomplete call list line");
            continue;
        };

        let code: String = kind.chars().take_while(char::is_ascii_digit).collect();
        let call_type = CallType::from_code(code.parse().unwrap_or(0));
        let (date, time) = date_time.split_once(' ').unwrap_or((date_time, ""));

        // AVM test entry
        if number == "1234567" && (date == "12.03.2005" || date == "12.03.05") {
            continue;
        }

        let remote_name = if name.is_empty() { number } else { name };
        entries.push(CallEntry {
            call_type,
            date: date.to_string(),
            time: time.to_string(),
            remote_name: remote_name.to_string(),
            remote_number: number.to_string(),
            local_name: local_name.to_string(),
            local_number: local_number.to_string(),
            duration: duration.trim_end_matches('\r').to_string(),
            timestamp: parse_timestamp(date, time),
        });
    }
    entries
}

/// Local time of a `dd.mm.yy` / `hh:mm` pair.
fn parse_timestamp(date: &str, time: &str) -> Option<DateTime<Local>> {
    let text = format!("{date} {time}");
    let naive = NaiveDateTime::parse_from_str(&text, "%d.%m.%y %H:%M")
        .or_else(|_| NaiveDateTime::parse_from_str(&text, "%d.%m.%Y %H:%M"))
        .ok()?;
    Local.from_local_datetime(&naive).earliest()
}

fn compare_entries(a: &CallEntry, b: &CallEntry, element: CallElement) -> Ordering {
    const UNKNOWN: &str = "unknown";
    match element {
        CallElement::Type => a.call_type.code().cmp(&b.call_type.code()),
        CallElement::Date => a.timestamp.cmp(&b.timestamp),
        CallElement::RemoteName => match (a.remote_name == UNKNOWN, b.remote_name == UNKNOWN) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => a.remote_name.cmp(&b.remote_name),
        },
        CallElement::RemoteNumber => a.remote_number.cmp(&b.remote_number),
        CallElement::LocalName => a.local_name.cmp(&b.local_name),
        CallElement::LocalNumber => a.local_number.cmp(&b.local_number),
        CallElement::Duration => a
            .duration
            .len()
            .cmp(&b.duration.len())
            .then_with(|| a.duration.cmp(&b.duration)),
    }
}

#[derive(Debug, Default)]
struct Buckets {
    all: Vec<CallEntry>,
    incoming: Vec<CallEntry>,
    outgoing: Vec<CallEntry>,
    missed: Vec<CallEntry>,
    last_call: Option<DateTime<Local>>,
    last_missed_call: Option<DateTime<Local>>,
}

impl Buckets {
    fn new(all: Vec<CallEntry>) -> Self {
        let mut buckets = Self::default();
        for entry in &all {
            buckets.last_call = buckets.last_call.max(entry.timestamp);
            match entry.call_type {
                CallType::Incoming => buckets.incoming.push(entry.clone()),
                CallType::Outgoing => buckets.outgoing.push(entry.clone()),
                CallType::Missed => {
                    buckets.last_missed_call = buckets.last_missed_call.max(entry.timestamp);
                    buckets.missed.push(entry.clone());
                }
                _ => debug!("Call of unknown type {} only listed in all calls", entry.call_type.code()),
            }
        }
        buckets.all = all;
        buckets
    }

    fn get(&self, call_type: CallType) -> Option<&Vec<CallEntry>> {
        match call_type {
            CallType::All => Some(&self.all),
            CallType::Incoming => Some(&self.incoming),
            CallType::Outgoing => Some(&self.outgoing),
            CallType::Missed => Some(&self.missed),
            CallType::Other(_) => None,
        }
    }
}

/// Call list of the device, refreshed in the background.
pub struct CallList {
    api: SharedApi,
    session: Arc<Session>,
    buckets: RwLock<Buckets>,
    valid: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CallList {
    /// Create an empty call list. Call [`CallList::reload`] to fetch entries.
    pub fn new(api: SharedApi, session: Arc<Session>) -> Arc<Self> {
        Arc::new(Self {
            api,
            session,
            buckets: RwLock::new(Buckets::default()),
            valid: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Create a call list and start fetching it.
    pub async fn create(api: SharedApi, session: Arc<Session>) -> Arc<Self> {
        let list = Self::new(api, session);
        list.reload().await;
        list
    }

    /// Start a background fetch. A fetch still running is awaited first.
    pub async fn reload(self: &Arc<Self>) {
        let mut task = self.task.lock().await;
        if let Some(previous) = task.take() {
            if let Err(e) = previous.await {
                warn!("Previous call list fetch ended abnormally: {e}");
            }
        }
        let list = Arc::clone(self);
        *task = Some(tokio::spawn(async move { list.fetch().await }));
    }

    /// Start a background fetch unless one is still running.
    ///
    /// Returns whether a fetch was started.
    pub async fn reload_if_idle(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|running| !running.is_finished()) {
            debug!("Call list fetch still running, reload skipped");
            return false;
        }
        if let Some(previous) = task.take() {
            if let Err(e) = previous.await {
                warn!("Previous call list fetch ended abnormally: {e}");
            }
        }
        let list = Arc::clone(self);
        *task = Some(tokio::spawn(async move { list.fetch().await }));
        true
    }

    /// Wait until the running fetch, if any, has finished.
    pub async fn wait_ready(&self) {
        let running = self.task.lock().await.take();
        if let Some(handle) = running {
            if let Err(e) = handle.await {
                warn!("Call list fetch ended abnormally: {e}");
            }
        }
    }

    async fn fetch(&self) {
        debug!("Call list fetch started");
        let csv = match self.api.request_call_list().await {
            Ok(csv) => csv,
            Err(e) => {
                error!("Could not fetch call list: {e}");
                return;
            }
        };
        let entries = parse_call_list(&csv);
        info!("Call list: read {} entries", entries.len());

        self.valid.store(false, AtomicOrdering::Release);
        *self.write_buckets() = Buckets::new(entries);
        self.valid.store(true, AtomicOrdering::Release);
    }

    fn read_buckets(&self) -> RwLockReadGuard<'_, Buckets> {
        self.buckets.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_buckets(&self) -> std::sync::RwLockWriteGuard<'_, Buckets> {
        self.buckets.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether a fetch has completed.
    pub fn is_valid(&self) -> bool {
        self.valid.load(AtomicOrdering::Acquire)
    }

    pub fn retrieve_entry(&self, call_type: CallType, id: usize) -> Option<CallEntry> {
        self.read_buckets().get(call_type)?.get(id).cloned()
    }

    /// All entries of one kind.
    pub fn entries(&self, call_type: CallType) -> Vec<CallEntry> {
        self.read_buckets()
            .get(call_type)
            .cloned()
            .unwrap_or_default()
    }

    pub fn size(&self, call_type: CallType) -> usize {
        self.read_buckets().get(call_type).map_or(0, Vec::len)
    }

    /// Number of missed calls on filtered MSNs newer than `since`.
    pub fn missed_calls(&self, since: DateTime<Local>) -> usize {
        let msn_filter = self.session.phone().msn_filter.clone();
        self.read_buckets()
            .missed
            .iter()
            .take_while(|entry| entry.timestamp.is_some_and(|ts| ts > since))
            .filter(|entry| entry.matches_filter(&msn_filter))
            .count()
    }

    pub fn last_call(&self) -> Option<DateTime<Local>> {
        self.read_buckets().last_call
    }

    pub fn last_missed_call(&self) -> Option<DateTime<Local>> {
        self.read_buckets().last_missed_call
    }

    /// Sort the list of all calls.
    pub fn sort(&self, element: CallElement, ascending: bool) {
        self.write_buckets().all.sort_by(|a, b| {
            let order = compare_entries(a, b, element);
            if ascending { order } else { order.reverse() }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::testing::FakeApi;
    use tokio::sync::Semaphore;

    const CSV: &str = "sep=;\r\n\
        Typ;Datum;Name;Rufnummer;Nebenstelle;Eigene Rufnummer;Dauer\r\n\
        1;15.03.10 18:35;Max Mustermann;0721123456;Telefon;4711;0:05\r\n\
        2;15.03.10 17:00;;0721999;Telefon;4712;0:00\r\n\
        4;14.03.10 09:12;Oma;+4989123;Telefon;SIP: 4711;0:12\r\n\
        2;13.03.10 09:12;unknown;0800123;Telefon;Festnetz;0:00\r\n\
        1;12.03.2005 10:00;;1234567;;;0:00\r\n\
        6;11.03.10 08:00;;0721555;Telefon;4711;10:00\r\n";

    fn at(date: &str) -> DateTime<Local> {
        parse_timestamp(date, "00:00").unwrap()
    }

    async fn loaded_list(msn_filter: &[&str]) -> Arc<CallList> {
        let mut config = AppConfig::default();
        config.monitor.msn_filter = msn_filter.iter().map(|s| s.to_string()).collect();
        let session = Arc::new(Session::new(&config));
        let api = Arc::new(FakeApi::default().with_call_list(CSV));
        let list = CallList::create(api, session).await;
        list.wait_ready().await;
        list
    }

    #[test]
    fn test_parse_call_list() {
        let entries = parse_call_list(CSV);
        assert_eq!(entries.len(), 5);

        let first = &entries[0];
        assert_eq!(first.call_type, CallType::Incoming);
        assert_eq!(first.date, "15.03.10");
        assert_eq!(first.time, "18:35");
        assert_eq!(first.remote_name, "Max Mustermann");
        assert_eq!(first.remote_number, "0721123456");
        assert_eq!(first.local_name, "Telefon");
        assert_eq!(first.local_number, "4711");
        assert_eq!(first.duration, "0:05");
        assert!(first.timestamp.is_some());
    }

    #[test]
    fn test_empty_name_uses_number() {
        let entries = parse_call_list(CSV);
        assert_eq!(entries[1].remote_name, "0721999");
    }

    #[test]
    fn test_type_four_is_outgoing() {
        let entries = parse_call_list(CSV);
        assert_eq!(entries[2].call_type, CallType::Outgoing);
    }

    #[test]
    fn test_debug_entry_is_skipped() {
        let entries = parse_call_list(CSV);
        assert!(entries.iter().all(|e| e.remote_number != "1234567"));
    }

    #[test]
    fn test_incomplete_lines_are_skipped() {
        assert!(parse_call_list("1;15.03.10 18:35;Max\n").is_empty());
    }

    #[test]
    fn test_matches_filter() {
        let entry = &parse_call_list(CSV)[0];
        assert!(entry.matches_filter(&[]));
        assert!(entry.matches_filter(&["4711".to_string()]));
        assert!(!entry.matches_filter(&["4712".to_string()]));

        let pots = &parse_call_list(CSV)[3];
        assert!(pots.matches_filter(&["4712".to_string()]));
    }

    #[test]
    fn test_matches_remote_number() {
        let entry = &parse_call_list(CSV)[0];
        assert!(entry.matches_remote_number("+49721123456", "49", "721"));
        assert!(entry.matches_remote_number("123456", "49", "721"));
        assert!(!entry.matches_remote_number("123457", "49", "721"));
    }

    #[tokio::test]
    async fn test_buckets() {
        let list = loaded_list(&[]).await;
        assert!(list.is_valid());
        assert_eq!(list.size(CallType::All), 5);
        assert_eq!(list.size(CallType::Incoming), 1);
        assert_eq!(list.size(CallType::Outgoing), 1);
        assert_eq!(list.size(CallType::Missed), 2);
        assert_eq!(list.size(CallType::Other(6)), 0);

        assert_eq!(
            list.retrieve_entry(CallType::Missed, 0).unwrap().remote_number,
            "0721999"
        );
        assert!(list.retrieve_entry(CallType::Missed, 5).is_none());
        assert_eq!(list.last_call(), parse_timestamp("15.03.10", "18:35"));
        assert_eq!(list.last_missed_call(), parse_timestamp("15.03.10", "17:00"));
    }

    #[tokio::test]
    async fn test_missed_calls() {
        let list = loaded_list(&[]).await;
        assert_eq!(list.missed_calls(at("01.01.10")), 2);
        assert_eq!(list.missed_calls(at("14.03.10")), 1);
        assert_eq!(list.missed_calls(at("16.03.10")), 0);
    }

    #[tokio::test]
    async fn test_missed_calls_respects_filter() {
        let list = loaded_list(&["4711"]).await;
        // 4712 is filtered, the analog line always passes
        assert_eq!(list.missed_calls(at("01.01.10")), 1);
    }

    #[tokio::test]
    async fn test_sort_by_date() {
        let list = loaded_list(&[]).await;
        list.sort(CallElement::Date, true);
        assert_eq!(list.retrieve_entry(CallType::All, 0).unwrap().remote_number, "0721555");
        list.sort(CallElement::Date, false);
        assert_eq!(list.retrieve_entry(CallType::All, 0).unwrap().remote_number, "0721123456");
        // other buckets keep device order
        assert_eq!(list.retrieve_entry(CallType::Missed, 0).unwrap().remote_number, "0721999");
    }

    #[tokio::test]
    async fn test_sort_by_duration() {
        let list = loaded_list(&[]).await;
        list.sort(CallElement::Duration, false);
        assert_eq!(list.retrieve_entry(CallType::All, 0).unwrap().duration, "10:00");
        list.sort(CallElement::Duration, true);
        assert_eq!(list.retrieve_entry(CallType::All, 0).unwrap().duration, "0:00");
    }

    #[tokio::test]
    async fn test_sort_unknown_name_first() {
        let list = loaded_list(&[]).await;
        list.sort(CallElement::RemoteName, true);
        assert_eq!(list.retrieve_entry(CallType::All, 0).unwrap().remote_name, "unknown");
        list.sort(CallElement::RemoteName, false);
        assert_eq!(list.retrieve_entry(CallType::All, 4).unwrap().remote_name, "unknown");
    }

    #[tokio::test]
    async fn test_reload_fetches_again() {
        let session = Arc::new(Session::new(&AppConfig::default()));
        let api = Arc::new(FakeApi::default().with_call_list(CSV));
        let list = CallList::create(api.clone(), session).await;
        list.reload().await;
        list.wait_ready().await;
        assert_eq!(api.call_list_requests(), 2);
        assert_eq!(list.size(CallType::All), 5);
    }

    #[tokio::test]
    async fn test_reload_if_idle_skips_running_fetch() {
        let gate = Arc::new(Semaphore::new(0));
        let api = Arc::new(FakeApi::default().with_call_list(CSV).with_call_list_gate(Arc::clone(&gate)));
        let session = Arc::new(Session::new(&AppConfig::default()));
        let list = CallList::create(api.clone(), session).await;

        assert!(!list.reload_if_idle().await);

        gate.add_permits(1);
        list.wait_ready().await;
        assert!(list.is_valid());
        assert_eq!(api.call_list_requests(), 1);

        gate.add_permits(1);
        assert!(list.reload_if_idle().await);
        list.wait_ready().await;
        assert_eq!(api.call_list_requests(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_list_invalid() {
        let session = Arc::new(Session::new(&AppConfig::default()));
        let api = Arc::new(FakeApi::default());
        let list = CallList::create(api, session).await;
        list.wait_ready().await;
        assert!(!list.is_valid());
        assert_eq!(list.size(CallType::All), 0);
    }
}
