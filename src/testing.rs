//! Test doubles shared by the unit tests.

use crate::client::FritzApi;
use crate::error::{FritzError, Result};
use crate::fonbook::{NumberType, ResolveResult, ReverseLookup};
use crate::tools::normalize_number;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// `FritzApi` returning canned pages.
#[derive(Default)]
pub(crate) struct FakeApi {
    location: Option<String>,
    sip: Option<String>,
    call_list: Mutex<Option<String>>,
    /// Each call list request waits for a permit when set.
    call_list_gate: Option<Arc<Semaphore>>,
    fonbook: Option<String>,
    current_ip: Option<String>,
    valid_password: bool,
    call_list_requests: AtomicUsize,
    written: Mutex<Vec<String>>,
    dialed: Mutex<Vec<String>>,
}

impl FakeApi {
    pub fn with_location(mut self, page: &str) -> Self {
        self.location = Some(page.to_string());
        self
    }

    pub fn with_sip(mut self, page: &str) -> Self {
        self.sip = Some(page.to_string());
        self
    }

    pub fn with_call_list(self, csv: &str) -> Self {
        self.set_call_list(csv);
        self
    }

    pub fn with_call_list_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.call_list_gate = Some(gate);
        self
    }

    pub fn with_fonbook(mut self, page: &str) -> Self {
        self.fonbook = Some(page.to_string());
        self
    }

    pub fn with_ip(mut self, ip: &str) -> Self {
        self.current_ip = Some(ip.to_string());
        self
    }

    pub fn with_valid_password(mut self) -> Self {
        self.valid_password = true;
        self
    }

    pub fn set_call_list(&self, csv: &str) {
        *self.call_list.lock().unwrap() = Some(csv.to_string());
    }

    pub fn call_list_requests(&self) -> usize {
        self.call_list_requests.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<String> {
        self.written.lock().unwrap().clone()
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }
}

fn canned(page: &Option<String>, what: &str) -> Result<String> {
    page.clone().ok_or_else(|| FritzError::not_found(what))
}

#[async_trait]
impl FritzApi for FakeApi {
    async fn request_location_settings(&self) -> Result<String> {
        canned(&self.location, "location settings")
    }

    async fn request_sip_settings(&self) -> Result<String> {
        canned(&self.sip, "SIP settings")
    }

    async fn request_call_list(&self) -> Result<String> {
        self.call_list_requests.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.call_list_gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        let csv = self.call_list.lock().unwrap().clone();
        canned(&csv, "call list")
    }

    async fn request_fonbook(&self) -> Result<String> {
        canned(&self.fonbook, "phonebook")
    }

    async fn write_fonbook(&self, xml: &str) -> Result<()> {
        self.written.lock().unwrap().push(xml.to_string());
        Ok(())
    }

    async fn init_call(&self, number: &str) -> bool {
        if number.is_empty() {
            return false;
        }
        self.dialed.lock().unwrap().push(number.to_string());
        true
    }

    async fn reconnect_isp(&self) -> bool {
        self.current_ip.is_some()
    }

    async fn current_ip(&self) -> Option<String> {
        self.current_ip.clone()
    }

    fn has_valid_password(&self) -> bool {
        self.valid_password
    }
}

/// `ReverseLookup` that knows a single number.
pub(crate) struct FakeDirectory {
    number: String,
    name: String,
    calls: AtomicUsize,
}

impl FakeDirectory {
    pub fn new(number: &str, name: &str) -> Self {
        Self {
            number: number.to_string(),
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReverseLookup for FakeDirectory {
    fn title(&self) -> &str {
        "Test directory"
    }

    fn tech_id(&self) -> &str {
        "TEST"
    }

    async fn lookup(&self, number: &str, country_code: &str, region_code: &str) -> ResolveResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if normalize_number(number, country_code, region_code)
            == normalize_number(&self.number, country_code, region_code)
        {
            ResolveResult::resolved(self.name.clone(), NumberType::Work)
        } else {
            ResolveResult::unresolved(number)
        }
    }
}
