//! Client for the call monitor on TCP port 1012.
//!
//! The device reports calls as `;`-separated lines. The monitor has to be
//! enabled once by dialing `#96*5*`.

mod event;


pub use event::{CallInfo, EventHandler, MonitorEvent, parse_line};

use crate::backoff::Backoff;
use crate::call_list::CallList;
use crate::error::{FritzError, Result};
use crate::fonbook::{FonbookManager, ResolveResult};
use crate::session::Session;
use crate::tools::{matches_msn_filter, sip_medium_name};
use futures::StreamExt;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, error, info, warn};

/// Longest line accepted from the call monitor.
const MAX_LINE_LENGTH: usize = 1024;

fn line_error(e: LinesCodecError) -> FritzError {
    match e {
        LinesCodecError::Io(e) => FritzError::Io(e),
        LinesCodecError::MaxLineLengthExceeded => {
            FritzError::protocol(format!("call monitor line longer than {MAX_LINE_LENGTH} bytes"))
        }
    }
}

fn is_refused(e: &FritzError) -> bool {
    matches!(e, FritzError::Io(io) if io.kind() == ErrorKind::ConnectionRefused)
}

/// State of one running monitor task.
struct Monitor {
    session: Arc<Session>,
    handler: Arc<dyn EventHandler>,
    fonbooks: Option<Arc<FonbookManager>>,
    call_list: Option<Arc<CallList>>,
    active: Vec<u32>,
}

impl Monitor {
    async fn run(mut self) {
        let mut backoff = Backoff::new(self.session.retry());
        loop {
            if let Err(e) = self.listen(&mut backoff).await {
                error!("Call monitor: {e}");
                if is_refused(&e) {
                    error!("Make sure to enable the Fritz!Box call monitor by dialing #96*5* once");
                }
            }
            let Some(delay) = backoff.next_delay() else {
                error!("Call monitor gave up after {} attempts", backoff.attempts());
                return;
            };
            warn!("Waiting {} seconds before reconnecting to the call monitor", delay.as_secs());
            sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let device = self.session.device();
        let address = format!("{}:{}", device.host, device.listener_port);
        let stream = timeout(device.timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| FritzError::Timeout(format!("connecting to {address}")))??;
        info!("Connected to call monitor at {address}");
        Ok(stream)
    }

    /// Handle lines until the connection fails or delivers garbage.
    async fn listen(&mut self, backoff: &mut Backoff) -> Result<()> {
        let stream = self.connect().await?;
        let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        while let Some(line) = lines.next().await {
            let line = line.map_err(line_error)?;
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            debug!("Got message {}", self.session.hidden(line));
            let event = parse_line(line)?;
            self.dispatch(event).await;
            backoff.reset();
        }
        Err(FritzError::Connection("call monitor closed the connection".to_string()))
    }

    async fn dispatch(&mut self, event: MonitorEvent) {
        match event {
            MonitorEvent::Call { conn_id, port, local, remote, medium } => {
                debug!(
                    "CALL {port}, {}, {}, {medium}",
                    self.session.hidden(&local),
                    self.session.hidden(&remote)
                );
                self.notify_call(true, conn_id, remote, local, medium).await;
            }
            MonitorEvent::Ring { conn_id, remote, local, medium } => {
                debug!(
                    "RING {}, {}, {medium}",
                    self.session.hidden(&remote),
                    self.session.hidden(&local)
                );
                self.notify_call(false, conn_id, remote, local, medium).await;
            }
            MonitorEvent::Connect { conn_id, port, party } => {
                debug!("CONNECT {port}, {}", self.session.hidden(&party));
                if self.active.contains(&conn_id) {
                    self.handler.handle_connect(conn_id).await;
                }
            }
            MonitorEvent::Disconnect { conn_id, duration } => {
                debug!("DISCONNECT {duration}");
                let Some(pos) = self.active.iter().position(|id| *id == conn_id) else {
                    return;
                };
                self.active.remove(pos);
                self.handler.handle_disconnect(conn_id, &duration).await;
                if let Some(call_list) = &self.call_list {
                    call_list.reload_if_idle().await;
                }
            }
        }
    }

    async fn notify_call(
        &mut self,
        outgoing: bool,
        conn_id: u32,
        remote: String,
        local: String,
        medium: String,
    ) {
        let msn_filter = self.session.phone().msn_filter.clone();
        if !matches_msn_filter(&local, &msn_filter) {
            debug!("Call on {} ignored by MSN filter", self.session.hidden(&local));
            return;
        }

        let resolved = match &self.fonbooks {
            Some(fonbooks) => fonbooks.resolve_to_name(&remote).await,
            None => ResolveResult::unresolved(&remote),
        };
        let medium_name = sip_medium_name(&medium, &self.session.phone().sip_names);

        let call = CallInfo {
            outgoing,
            conn_id,
            remote_number: remote,
            remote_name: resolved.name,
            remote_type: resolved.kind,
            local_number: local,
            medium,
            medium_name,
        };
        self.handler.handle_call(call).await;
        self.active.push(conn_id);
    }
}

/// Background connection to the call monitor.
///
/// The task reconnects with a doubling delay until stopped. Dropping the
/// listener stops it.
pub struct Listener {
    session: Arc<Session>,
    handler: Arc<dyn EventHandler>,
    fonbooks: Option<Arc<FonbookManager>>,
    call_list: Option<Arc<CallList>>,
    task: Option<JoinHandle<()>>,
}

impl Listener {
    /// Start listening. Must be called within a tokio runtime.
    ///
    /// Callers are resolved through `fonbooks`; `call_list` is reloaded after
    /// every finished call unless a fetch is still running.
    pub fn start(
        session: Arc<Session>,
        handler: Arc<dyn EventHandler>,
        fonbooks: Option<Arc<FonbookManager>>,
        call_list: Option<Arc<CallList>>,
    ) -> Self {
        let mut listener = Self {
            session,
            handler,
            fonbooks,
            call_list,
            task: None,
        };
        listener.spawn();
        listener
    }

    fn spawn(&mut self) {
        let monitor = Monitor {
            session: Arc::clone(&self.session),
            handler: Arc::clone(&self.handler),
            fonbooks: self.fonbooks.clone(),
            call_list: self.call_list.clone(),
            active: Vec::new(),
        };
        self.task = Some(tokio::spawn(monitor.run()));
    }

    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::clone(&self.handler)
    }

    /// Cancel the task.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Stopping call monitor");
            task.abort();
        }
    }

    /// Start over, optionally with a new handler.
    pub fn restart_with(&mut self, handler: Option<Arc<dyn EventHandler>>) {
        self.stop();
        if let Some(handler) = handler {
            self.handler = handler;
        }
        self.spawn();
    }

    /// Whether the task is still running. It ends when stopped or when the
    /// reconnect attempts are used up.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait for the task to end by itself.
    pub async fn join(&mut self, limit: Duration) -> bool {
        let Some(task) = self.task.as_mut() else {
            return true;
        };
        if timeout(limit, task).await.is_ok() {
            self.task = None;
            true
        } else {
            false
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}
