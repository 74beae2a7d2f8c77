//! Service re-registration watcher.
//!
//! Network topology changes (Wi-Fi roaming, DHCP renewals, interface
//! flaps) invalidate discovery advertisements. The watcher listens for
//! [`NetworkEvent`]s and, while the gateway is active, re-advertises the
//! service once the network settles:
//!
//! `Idle → Scheduled → Retrying(k) → Idle`
//!
//! Each event cancels the pending job and schedules a fresh one after the
//! debounce delay. A job makes a bounded number of attempts; the first
//! successful registration ends it.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// OS network callbacks, forwarded onto the watcher channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    Available,
    Lost,
    CapabilitiesChanged,
    LinkPropertiesChanged,
}

/// What gets advertised for discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisedService {
    pub name: String,
    pub hostname: String,
    pub http_port: Option<u16>,
    pub https_port: u16,
}

impl AdvertisedService {
    /// Worth an attempt: a hostname and at least one usable port.
    pub fn is_registrable(&self) -> bool {
        let http_ok = self.http_port.is_some_and(|p| p != 0);
        !self.hostname.trim().is_empty() && (http_ok || self.https_port != 0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistrarError {
    #[error("Discovery registration failed: {0}")]
    Failed(String),
}

/// Platform discovery API (mDNS/DNS-SD or equivalent).
pub trait ServiceRegistrar: Send + Sync {
    fn register(&self, service: &AdvertisedService) -> Result<(), RegistrarError>;
    fn unregister(&self, service: &AdvertisedService) -> Result<(), RegistrarError>;
}

/// Registrar that only records what it would advertise.
#[derive(Debug, Default)]
pub struct LoggingRegistrar;

impl ServiceRegistrar for LoggingRegistrar {
    fn register(&self, service: &AdvertisedService) -> Result<(), RegistrarError> {
        tracing::info!(
            name = %service.name,
            hostname = %service.hostname,
            http_port = ?service.http_port,
            https_port = service.https_port,
            "Service advertised"
        );
        Ok(())
    }

    fn unregister(&self, service: &AdvertisedService) -> Result<(), RegistrarError> {
        tracing::info!(name = %service.name, "Service advertisement withdrawn");
        Ok(())
    }
}

/// Last advertisement the registrar accepted, shared with the owner.
pub type RegisteredService = Arc<Mutex<Option<AdvertisedService>>>;

/// Produces the current advertisement (hostname and ports can change
/// between attempts).
pub type ServiceInfoSource = Arc<dyn Fn() -> AdvertisedService + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Idle,
    Scheduled,
    /// Attempt number, starting at 1.
    Retrying(u32),
}

#[derive(Debug, Clone, Copy)]
pub struct WatcherTiming {
    pub debounce: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    /// Gap between unregister and register within one attempt.
    pub unregister_pause: Duration,
}

impl Default for WatcherTiming {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1200),
            max_attempts: 5,
            retry_delay: Duration::from_millis(1500),
            unregister_pause: Duration::from_millis(200),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Watcher task
// ═══════════════════════════════════════════════════════════

/// Handle to a running watcher. Dropping it also ends the task, but
/// only `stop()` waits for it.
pub struct WatcherHandle {
    events: mpsc::UnboundedSender<NetworkEvent>,
    active: Arc<AtomicBool>,
    state: watch::Receiver<WatcherState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    registered: RegisteredService,
}

impl WatcherHandle {
    /// Feed one network event to the watcher.
    pub fn notify(&self, event: NetworkEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(?event, "Watcher stopped, network event dropped");
        }
    }

    /// Sender for OS callback glue.
    pub fn sender(&self) -> mpsc::UnboundedSender<NetworkEvent> {
        self.events.clone()
    }

    /// Events are ignored while the gateway is inactive.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    pub fn state(&self) -> WatcherState {
        *self.state.borrow()
    }

    /// The advertisement currently live with the registrar, if any.
    pub fn registered(&self) -> Option<AdvertisedService> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cancel any pending job and end the task.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Watcher task ended abnormally");
            }
        }
    }
}

/// Start the watcher. It begins active.
///
/// `registered` is the advertisement already live with the registrar,
/// `None` when nothing has been registered yet.
pub fn spawn(
    registrar: Arc<dyn ServiceRegistrar>,
    source: ServiceInfoSource,
    timing: WatcherTiming,
    registered: Option<AdvertisedService>,
) -> WatcherHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let (state_tx, state_rx) = watch::channel(WatcherState::Idle);
    let active = Arc::new(AtomicBool::new(true));
    let registered: RegisteredService = Arc::new(Mutex::new(registered));

    let job = Job {
        registrar,
        source,
        timing,
        state: Arc::new(state_tx),
        registered: registered.clone(),
    };
    let task = tokio::spawn(run(events_rx, shutdown_rx, active.clone(), job));

    WatcherHandle {
        events: events_tx,
        active,
        state: state_rx,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
        registered,
    }
}

#[derive(Clone)]
struct Job {
    registrar: Arc<dyn ServiceRegistrar>,
    source: ServiceInfoSource,
    timing: WatcherTiming,
    state: Arc<watch::Sender<WatcherState>>,
    registered: RegisteredService,
}

async fn run(
    mut events: mpsc::UnboundedReceiver<NetworkEvent>,
    mut shutdown_rx: oneshot::Receiver<()>,
    active: Arc<AtomicBool>,
    job: Job,
) {
    let mut pending: Option<JoinHandle<()>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                if !active.load(Ordering::SeqCst) {
                    tracing::debug!(?event, "Network event ignored while inactive");
                    continue;
                }
                if let Some(previous) = pending.take() {
                    previous.abort();
                }
                tracing::debug!(?event, "Network changed, re-registration scheduled");
                job.state.send_replace(WatcherState::Scheduled);
                pending = Some(tokio::spawn(job.clone().reregister()));
            }
        }
    }

    if let Some(task) = pending.take() {
        task.abort();
    }
    job.state.send_replace(WatcherState::Idle);
    tracing::debug!("Watcher stopped");
}

impl Job {
    fn current_registration(&self) -> Option<AdvertisedService> {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_registration(&self, service: Option<AdvertisedService>) {
        *self.registered.lock().unwrap_or_else(PoisonError::into_inner) = service;
    }

    async fn reregister(self) {
        tokio::time::sleep(self.timing.debounce).await;

        for attempt in 1..=self.timing.max_attempts {
            self.state.send_replace(WatcherState::Retrying(attempt));
            let service = (self.source)();

            if !service.is_registrable() {
                tracing::debug!(attempt, "Service info incomplete, attempt skipped");
            } else {
                // Withdraw what is live, which may carry an old hostname.
                let previous = self.current_registration().unwrap_or_else(|| service.clone());
                match self.registrar.unregister(&previous) {
                    Ok(()) => self.set_registration(None),
                    Err(e) => tracing::debug!(attempt, error = %e, "Unregister failed"),
                }
                tokio::time::sleep(self.timing.unregister_pause).await;
                match self.registrar.register(&service) {
                    Ok(()) => {
                        tracing::info!(attempt, hostname = %service.hostname, "Service re-registered");
                        self.set_registration(Some(service));
                        self.state.send_replace(WatcherState::Idle);
                        return;
                    }
                    Err(e) => tracing::warn!(attempt, error = %e, "Re-registration attempt failed"),
                }
            }

            if attempt < self.timing.max_attempts {
                tokio::time::sleep(self.timing.retry_delay).await;
            }
        }

        tracing::warn!(
            attempts = self.timing.max_attempts,
            "Re-registration gave up until the next network change"
        );
        self.state.send_replace(WatcherState::Idle);
    }
}

// ═══════════════════════════════════════════════════════════
// Address monitor
// ═══════════════════════════════════════════════════════════

/// Poll the local address and translate changes into network events,
/// for platforms without connectivity callbacks.
///
/// `probe` returns the current LAN address, `None` when offline.
pub fn spawn_address_monitor<P>(
    events: mpsc::UnboundedSender<NetworkEvent>,
    interval: Duration,
    probe: P,
) -> JoinHandle<()>
where
    P: Fn() -> Option<IpAddr> + Send + 'static,
{
    tokio::spawn(async move {
        let mut last = probe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let current = probe();
            let event = match (last, current) {
                (None, Some(_)) => NetworkEvent::Available,
                (Some(_), None) => NetworkEvent::Lost,
                (Some(a), Some(b)) if a != b => NetworkEvent::LinkPropertiesChanged,
                _ => continue,
            };
            tracing::debug!(?event, ?current, "Local address changed");
            last = current;
            if events.send(event).is_err() {
                break;
            }
        }
    })
}

/// Current LAN address via `local_ip_address`.
pub fn local_ip_probe() -> Option<IpAddr> {
    local_ip_address::local_ip().ok()
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeRegistrar {
        calls: Mutex<Vec<&'static str>>,
        withdrawn: Mutex<Vec<String>>,
        failures_left: AtomicU32,
    }

    impl FakeRegistrar {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
                ..Self::default()
            }
        }

        fn registers(&self) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == "register").count()
        }

        fn unregisters(&self) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| **c == "unregister").count()
        }
    }

    impl ServiceRegistrar for FakeRegistrar {
        fn register(&self, _service: &AdvertisedService) -> Result<(), RegistrarError> {
            self.calls.lock().unwrap().push("register");
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(RegistrarError::Failed("busy".into()));
            }
            Ok(())
        }

        fn unregister(&self, service: &AdvertisedService) -> Result<(), RegistrarError> {
            self.calls.lock().unwrap().push("unregister");
            self.withdrawn.lock().unwrap().push(service.hostname.clone());
            Ok(())
        }
    }

    fn service(hostname: &str) -> ServiceInfoSource {
        let hostname = hostname.to_string();
        Arc::new(move || AdvertisedService {
            name: "lanbridge".into(),
            hostname: hostname.clone(),
            http_port: Some(8080),
            https_port: 8443,
        })
    }

    fn start(registrar: &Arc<FakeRegistrar>, hostname: &str) -> WatcherHandle {
        let registrar: Arc<dyn ServiceRegistrar> = registrar.clone();
        spawn(registrar, service(hostname), WatcherTiming::default(), None)
    }

    async fn sleep_ms(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[test]
    fn registrable_requires_hostname_and_a_port() {
        let mut s = AdvertisedService {
            name: "x".into(),
            hostname: "host.local".into(),
            http_port: None,
            https_port: 8443,
        };
        assert!(s.is_registrable());
        s.https_port = 0;
        assert!(!s.is_registrable());
        s.http_port = Some(8080);
        assert!(s.is_registrable());
        s.hostname = "  ".into();
        assert!(!s.is_registrable());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_events_collapse_into_one_attempt() {
        let registrar = Arc::new(FakeRegistrar::default());
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::Lost);
        sleep_ms(100).await;
        watcher.notify(NetworkEvent::Available);
        sleep_ms(100).await;
        watcher.notify(NetworkEvent::LinkPropertiesChanged);
        sleep_ms(100).await;
        assert_eq!(watcher.state(), WatcherState::Scheduled);
        assert_eq!(registrar.registers(), 0);

        sleep_ms(5_000).await;
        assert_eq!(registrar.registers(), 1);
        assert_eq!(registrar.unregisters(), 1);
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn reregistration_replaces_the_live_record() {
        let registrar = Arc::new(FakeRegistrar::default());
        let live = AdvertisedService {
            name: "lanbridge".into(),
            hostname: "old.local".into(),
            http_port: Some(8080),
            https_port: 8443,
        };
        let dyn_registrar: Arc<dyn ServiceRegistrar> = registrar.clone();
        let mut watcher = spawn(
            dyn_registrar,
            service("new.local"),
            WatcherTiming::default(),
            Some(live.clone()),
        );
        assert_eq!(watcher.registered(), Some(live));

        watcher.notify(NetworkEvent::LinkPropertiesChanged);
        sleep_ms(5_000).await;

        assert_eq!(*registrar.withdrawn.lock().unwrap(), vec!["old.local".to_string()]);
        assert_eq!(watcher.registered().unwrap().hostname, "new.local");
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_registration_leaves_nothing_live() {
        let registrar = Arc::new(FakeRegistrar::failing(100));
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::Available);
        sleep_ms(30_000).await;

        assert!(watcher.registered().is_none());
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_happens_before_debounce() {
        let registrar = Arc::new(FakeRegistrar::default());
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::CapabilitiesChanged);
        sleep_ms(1_000).await;
        assert_eq!(registrar.registers(), 0);

        sleep_ms(500).await;
        assert_eq!(registrar.registers(), 1);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_registration_succeeds() {
        let registrar = Arc::new(FakeRegistrar::failing(2));
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::Available);
        sleep_ms(10_000).await;

        assert_eq!(registrar.registers(), 3);
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let registrar = Arc::new(FakeRegistrar::failing(100));
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::Available);
        sleep_ms(30_000).await;

        assert_eq!(registrar.registers(), 5);
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn empty_hostname_skips_every_attempt() {
        let registrar = Arc::new(FakeRegistrar::default());
        let mut watcher = start(&registrar, "");

        watcher.notify(NetworkEvent::Available);
        sleep_ms(30_000).await;

        assert!(registrar.calls.lock().unwrap().is_empty());
        assert_eq!(watcher.state(), WatcherState::Idle);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_watcher_ignores_events() {
        let registrar = Arc::new(FakeRegistrar::default());
        let mut watcher = start(&registrar, "phone.local");
        watcher.set_active(false);

        watcher.notify(NetworkEvent::Available);
        sleep_ms(10_000).await;
        assert_eq!(registrar.registers(), 0);

        watcher.set_active(true);
        watcher.notify(NetworkEvent::Available);
        sleep_ms(10_000).await;
        assert_eq!(registrar.registers(), 1);
        watcher.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_job() {
        let registrar = Arc::new(FakeRegistrar::default());
        let mut watcher = start(&registrar, "phone.local");

        watcher.notify(NetworkEvent::Available);
        sleep_ms(100).await;
        watcher.stop().await;
        sleep_ms(10_000).await;

        assert_eq!(registrar.registers(), 0);
        assert_eq!(watcher.state(), WatcherState::Idle);
        // Safe to call twice; events after stop are dropped.
        watcher.stop().await;
        watcher.notify(NetworkEvent::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn address_monitor_reports_changes() {
        let script = Arc::new(Mutex::new(vec![
            Some(IpAddr::from([192, 168, 1, 2])),
            Some(IpAddr::from([192, 168, 1, 2])),
            None,
            Some(IpAddr::from([10, 0, 0, 7])),
            Some(IpAddr::from([10, 0, 0, 8])),
        ]));
        let probe_script = script.clone();
        let probe = move || {
            let mut script = probe_script.lock().unwrap();
            if script.len() > 1 {
                script.remove(0)
            } else {
                script[0]
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = spawn_address_monitor(tx, Duration::from_secs(1), probe);

        assert_eq!(rx.recv().await, Some(NetworkEvent::Lost));
        assert_eq!(rx.recv().await, Some(NetworkEvent::Available));
        assert_eq!(rx.recv().await, Some(NetworkEvent::LinkPropertiesChanged));
        monitor.abort();
    }
}
