// src/feed.rs
//! Background feed session: gpsd connection, liveness probe and fix relay

use crate::{
    config::{ConnectionConfig, PROBE_INTERVAL, PROBE_TIMEOUT, STOP_GRACE_PERIOD},
    error::{GpsError, Result},
    gps::{client::GpsdClient, data::LocationPoint, gpsd::FeedEvent},
    lock,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc, Condvar, Mutex, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};
use tokio::{
    net::TcpStream,
    sync::oneshot,
    time::{interval, timeout, MissedTickBehavior},
};
use tracing::{debug, info, warn};

#[derive(Default)]
struct GateState {
    closed: bool,
    in_flight: bool,
}

/// Open while a session may hand fixes to its callback.
///
/// A closed gate starts no new delivery; `close` also waits (bounded) for
/// the one in flight, if any.
#[derive(Clone)]
struct DeliveryGate(Arc<(Mutex<GateState>, Condvar)>);

impl DeliveryGate {
    fn open() -> Self {
        Self(Arc::new((Mutex::new(GateState::default()), Condvar::new())))
    }

    fn deliver(&self, f: impl FnOnce()) -> bool {
        let (state, idle) = &*self.0;
        {
            let mut state = lock(state);
            if state.closed {
                return false;
            }
            state.in_flight = true;
        }
        f();
        lock(state).in_flight = false;
        idle.notify_all();
        true
    }

    /// Close without waiting. The only safe way to close from inside `deliver`.
    fn mark_closed(&self) {
        let (state, _) = &*self.0;
        lock(state).closed = true;
    }

    /// Close, then wait up to `limit` for a delivery in flight to return.
    /// False if it is still running.
    fn close(&self, limit: Duration) -> bool {
        let (state, idle) = &*self.0;
        let mut state = lock(state);
        state.closed = true;
        let (state, _) = idle
            .wait_timeout_while(state, limit, |state| state.in_flight)
            .unwrap_or_else(PoisonError::into_inner);
        !state.in_flight
    }
}

struct Session {
    config: ConnectionConfig,
    gate: DeliveryGate,
    shutdown: Option<oneshot::Sender<()>>,
    done: mpsc::Receiver<()>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Owns at most one feed session and the thread it runs on
pub struct FeedWorker {
    session: Option<Session>,
    grace_period: Duration,
}

impl FeedWorker {
    pub fn new() -> Self {
        Self {
            session: None,
            grace_period: STOP_GRACE_PERIOD,
        }
    }

    /// Upper bound on how long `stop_session` waits for an in-flight fix and the thread
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Connect to gpsd on a dedicated thread and relay every usable fix to `on_fix`.
    ///
    /// Returns once the connection is established; a refused or unreachable
    /// host is reported here and no session is kept. Does nothing if a
    /// session is already running.
    pub fn start_session<F>(&mut self, config: ConnectionConfig, on_fix: F) -> Result<()>
    where
        F: Fn(LocationPoint) + Send + Sync + 'static,
    {
        if self.is_running() {
            debug!("Feed session to {} already running", self.session_address().unwrap_or_default());
            return Ok(());
        }
        // A session whose thread died on its own is cleaned up before replacing it
        self.stop_session();

        let gate = DeliveryGate::open();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let session_config = config.clone();
        let session_gate = gate.clone();
        let thread = thread::Builder::new()
            .name("location-feed".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = ready_tx.send(Err(GpsError::Io(e)));
                        return;
                    }
                };
                runtime.block_on(run_session(
                    session_config,
                    on_fix,
                    session_gate,
                    ready_tx,
                    shutdown_rx,
                ));
                drop(runtime);
                let _ = done_tx.send(());
            })?;

        let started = ready_rx.recv().unwrap_or_else(|_| {
            Err(GpsError::Connection(
                "Feed thread exited during startup".to_string(),
            ))
        });
        if let Err(e) = started {
            if thread.join().is_err() {
                warn!("Feed thread panicked during startup");
            }
            return Err(e);
        }

        info!("Feed session to {} started", config);
        self.session = Some(Session {
            config,
            gate,
            shutdown: Some(shutdown_tx),
            done: done_rx,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Stop the probe and the gpsd client, then wait (bounded) for the thread.
    ///
    /// Once this returns, no new `on_fix` call starts for the stopped session.
    /// A call already running is waited for within the grace period. Idempotent.
    pub fn stop_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let on_feed_thread = session
            .thread
            .as_ref()
            .map_or(false, |t| t.thread().id() == thread::current().id());

        if let Some(shutdown) = session.shutdown.take() {
            let _ = shutdown.send(());
        }

        if on_feed_thread {
            // Called from inside a delivery, which cannot be waited on and the
            // thread cannot join itself. Fixes still buffered are dropped at the gate.
            session.gate.mark_closed();
            debug!("Feed session to {} stopping from its own thread", session.config);
            return;
        }

        let deadline = Instant::now() + self.grace_period;
        if !session.gate.close(self.grace_period) {
            warn!(
                "Fix delivery for {} still running after {:?}",
                session.config, self.grace_period
            );
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match session.done.recv_timeout(remaining) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = session.thread.take() {
                    if handle.join().is_err() {
                        warn!("Feed thread for {} panicked", session.config);
                    }
                }
                info!("Feed session to {} stopped", session.config);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Feed thread for {} did not exit within {:?}; detaching it",
                    session.config, self.grace_period
                );
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.session
            .as_ref()
            .and_then(|session| session.thread.as_ref())
            .map_or(false, |handle| !handle.is_finished())
    }

    /// Address of the current session, if any
    pub fn session_address(&self) -> Option<String> {
        self.session.as_ref().map(|session| session.config.to_string())
    }
}

impl Default for FeedWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FeedWorker {
    fn drop(&mut self) {
        self.stop_session();
    }
}

async fn run_session<F>(
    config: ConnectionConfig,
    on_fix: F,
    gate: DeliveryGate,
    ready: mpsc::Sender<Result<()>>,
    shutdown: oneshot::Receiver<()>,
) where
    F: Fn(LocationPoint) + Send + Sync + 'static,
{
    info!("Connecting to gpsd at {}...", config);
    let client = match GpsdClient::connect(&config.host, config.port).await {
        Ok(client) => client,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    info!("Connected successfully!");

    let fix_seen = Arc::new(AtomicBool::new(false));
    let listener_seen = Arc::clone(&fix_seen);
    client.set_listener(move |event| handle_event(event, &gate, &listener_seen, &on_fix));

    if let Err(e) = client.start() {
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));

    let probe = tokio::spawn(probe_loop(config.clone(), fix_seen));

    let session = async {
        handshake(&client).await;
        std::future::pending::<()>().await
    };

    // A dropped sender counts as a shutdown request too
    tokio::select! {
        _ = session => {}
        _ = shutdown => {}
    }

    probe.abort();
    client.stop().await;
    debug!("Feed session to {} wound down", config);
}

/// Version, watch and poll, as gpsd clients conventionally open a session.
/// Failures are logged; the session keeps streaming regardless.
async fn handshake(client: &GpsdClient) {
    match client.issue_version().await {
        Ok(version) => info!(
            "Version: {} (protocol {}.{})",
            version.release, version.proto_major, version.proto_minor
        ),
        Err(e) => warn!("VERSION failed: {}", e),
    }

    match client.issue_watch(true, true).await {
        Ok(watch) => info!("Watch: {:?}", watch),
        Err(e) => warn!("WATCH failed: {}", e),
    }

    match client.issue_poll().await {
        Ok(poll) => info!(
            "Poll: {} active device(s), {} TPV, {} SKY",
            poll.active,
            poll.tpv.len(),
            poll.sky.len()
        ),
        Err(e) => warn!("POLL failed: {}", e),
    }
}

fn handle_event<F>(event: FeedEvent, gate: &DeliveryGate, fix_seen: &AtomicBool, on_fix: &F)
where
    F: Fn(LocationPoint),
{
    match event {
        FeedEvent::PositionFix(tpv) => {
            fix_seen.store(true, Ordering::Relaxed);
            info!(
                "TPV: {} lat={:?} lon={:?}",
                tpv.mode.description(),
                tpv.lat,
                tpv.lon
            );

            let Some(point) = tpv.to_location_point() else {
                debug!("Ignoring TPV without a usable fix ({})", tpv.mode.description());
                return;
            };
            if !point.is_in_range() {
                warn!("Fix {} is outside WGS84 ranges; passing it through", point);
            }
            if !gate.deliver(|| on_fix(point)) {
                debug!("Feed session closing, dropped fix {}", point);
            }
        }
        FeedEvent::SkyView(sky) => info!(
            "SKY: {} satellites, {} used, hdop={:?}",
            sky.satellites.len(),
            sky.satellites_used(),
            sky.hdop
        ),
        FeedEvent::Device(device) => info!("Device: {:?} ({:?})", device.path, device.driver),
        FeedEvent::DeviceList(list) => {
            info!("gpsd managing {} device(s)", list.devices.len());
            for device in list.devices {
                info!("  Device: {:?} ({:?})", device.path, device.driver);
            }
        }
        FeedEvent::Subframe(raw) => info!("SUBFRAME: {}", raw),
        FeedEvent::Attitude(raw) => info!("ATT: {}", raw),
    }
}

/// Once per interval, check that the gpsd host still answers.
/// Ticks that follow a received TPV are skipped.
async fn probe_loop(config: ConnectionConfig, fix_seen: Arc<AtomicBool>) {
    let mut ticker = interval(PROBE_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if fix_seen.swap(false, Ordering::Relaxed) {
            continue;
        }

        match probe_host(&config, PROBE_TIMEOUT).await {
            Ok(()) => debug!("isReachable: true ({})", config),
            Err(e) => warn!("isReachable: false ({})", e),
        }
    }
}

/// Bounded reachability check: a TCP connect to the gpsd port
pub async fn probe_host(config: &ConnectionConfig, limit: Duration) -> Result<()> {
    let address = config.socket_address();
    match timeout(limit, TcpStream::connect(&address)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(GpsError::Connection(format!("{} unreachable: {}", address, e))),
        Err(_) => Err(GpsError::Connection(format!(
            "{} did not answer within {:?}",
            address, limit
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gps::client::mocks::*;
    use crate::gps::gpsd::{FixMode, TpvReport};
    use std::sync::atomic::AtomicUsize;

    fn collecting() -> (Arc<Mutex<Vec<LocationPoint>>>, impl Fn(LocationPoint) + Send + Sync + 'static) {
        let fixes = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fixes);
        (fixes, move |point: LocationPoint| sink.lock().unwrap().push(point))
    }

    #[test]
    fn test_gate_blocks_after_close() {
        let gate = DeliveryGate::open();
        let mut calls = 0;
        assert!(gate.deliver(|| calls += 1));
        assert!(gate.close(Duration::from_millis(10)));
        assert!(!gate.deliver(|| calls += 1));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_gate_closed_from_inside_delivery() {
        let gate = DeliveryGate::open();
        let inner = gate.clone();
        assert!(gate.deliver(|| inner.mark_closed()));
        assert!(!gate.deliver(|| panic!("delivered after close")));
    }

    #[test]
    fn test_handle_event_filters_fix_modes() {
        let gate = DeliveryGate::open();
        let seen = AtomicBool::new(false);
        let (fixes, on_fix) = collecting();

        let no_fix = TpvReport {
            mode: FixMode::NoFix,
            lat: Some(37.0),
            lon: Some(-122.0),
            ..TpvReport::default()
        };
        handle_event(FeedEvent::PositionFix(no_fix), &gate, &seen, &on_fix);
        assert!(seen.load(Ordering::Relaxed));
        assert!(fixes.lock().unwrap().is_empty());

        let fix = TpvReport {
            mode: FixMode::ThreeD,
            lat: Some(37.0),
            lon: Some(-122.0),
            ..TpvReport::default()
        };
        handle_event(FeedEvent::PositionFix(fix.clone()), &gate, &seen, &on_fix);
        assert_eq!(fixes.lock().unwrap().len(), 1);

        gate.close(Duration::from_millis(10));
        handle_event(FeedEvent::PositionFix(fix), &gate, &seen, &on_fix);
        assert_eq!(fixes.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_start_session_refused() {
        let mut worker = FeedWorker::new();
        let (fixes, on_fix) = collecting();

        let result = worker.start_session(ConnectionConfig::new("127.0.0.1", closed_port()), on_fix);

        assert!(matches!(result, Err(GpsError::Connection(_))));
        assert!(!worker.is_running());
        assert!(fixes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_session_relays_fixes_in_order() {
        let server = FakeGpsd::standard(vec![
            VERSION_REPLY.to_string(),
            tpv_line(3, 37.0, -122.0),
            tpv_line(1, 10.0, 10.0),
            tpv_line(0, 11.0, 11.0),
            tpv_line(2, 37.5, -122.5),
        ]);
        let mut worker = FeedWorker::new();
        let (fixes, on_fix) = collecting();

        worker
            .start_session(ConnectionConfig::new("127.0.0.1", server.port), on_fix)
            .unwrap();
        assert!(worker.is_running());
        assert_eq!(worker.session_address(), Some(server.address()));

        assert!(wait_until(Duration::from_secs(5), || fixes.lock().unwrap().len() >= 2));
        worker.stop_session();
        assert!(!worker.is_running());

        let fixes = fixes.lock().unwrap().clone();
        assert_eq!(fixes.len(), 2);
        assert_eq!((fixes[0].latitude, fixes[0].longitude), (37.0, -122.0));
        assert_eq!((fixes[1].latitude, fixes[1].longitude), (37.5, -122.5));
        assert_eq!(fixes[0].accuracy_meters, Some(4.0));
        assert_eq!(fixes[0].altitude, Some(12.5));
    }

    #[test]
    fn test_session_runs_handshake() {
        let server = FakeGpsd::standard(vec![]);
        let mut worker = FeedWorker::new();
        let (_fixes, on_fix) = collecting();

        worker
            .start_session(ConnectionConfig::new("127.0.0.1", server.port), on_fix)
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || server.commands.lock().unwrap().len() >= 3));
        worker.stop_session();

        let commands = server.commands.lock().unwrap().clone();
        assert!(commands[0].starts_with("?VERSION"));
        assert!(commands[1].starts_with("?WATCH"));
        assert!(commands[2].starts_with("?POLL"));
    }

    #[test]
    fn test_start_twice_keeps_first_session() {
        let server = FakeGpsd::standard(vec![]);
        let mut worker = FeedWorker::new();
        let (_fixes, on_fix) = collecting();
        let (_other, other_fix) = collecting();

        worker
            .start_session(ConnectionConfig::new("127.0.0.1", server.port), on_fix)
            .unwrap();
        // Would fail to connect if a second session were attempted
        worker
            .start_session(ConnectionConfig::new("127.0.0.1", closed_port()), other_fix)
            .unwrap();
        assert_eq!(worker.session_address(), Some(server.address()));

        worker.stop_session();
    }

    #[test]
    fn test_stop_session_is_idempotent() {
        let mut worker = FeedWorker::new();
        worker.stop_session();
        worker.stop_session();

        let server = FakeGpsd::standard(vec![]);
        let (_fixes, on_fix) = collecting();
        worker
            .start_session(ConnectionConfig::new("127.0.0.1", server.port), on_fix)
            .unwrap();
        worker.stop_session();
        worker.stop_session();
        assert!(!worker.is_running());
    }

    #[test]
    fn test_stop_session_bounded_by_grace_period() {
        let lines = (0..20).map(|i| tpv_line(3, 10.0 + i as f64, 0.0)).collect();
        let server = FakeGpsd::standard(lines);
        let mut worker = FeedWorker::new().with_grace_period(Duration::from_millis(100));

        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        worker
            .start_session(ConnectionConfig::new("127.0.0.1", server.port), move |_point: LocationPoint| {
                if counted.fetch_add(1, Ordering::SeqCst) == 0 {
                    thread::sleep(Duration::from_secs(1));
                }
            })
            .unwrap();
        assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 1));

        let stopping = Instant::now();
        worker.stop_session();
        assert!(stopping.elapsed() < Duration::from_millis(600));
        assert!(!worker.is_running());

        // The stuck fix returns; the rest are dropped at the gate
        thread::sleep(Duration::from_millis(1500));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_host() {
        let server = FakeGpsd::standard(vec![]);
        let reachable = ConnectionConfig::new("127.0.0.1", server.port);
        assert!(probe_host(&reachable, PROBE_TIMEOUT).await.is_ok());

        let unreachable = ConnectionConfig::new("127.0.0.1", closed_port());
        assert!(matches!(
            probe_host(&unreachable, PROBE_TIMEOUT).await,
            Err(GpsError::Connection(_))
        ));
    }
}
