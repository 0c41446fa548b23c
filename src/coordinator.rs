// src/coordinator.rs
//! Authoritative current location and feed lifecycle

use crate::{
    config::{ConnectionConfig, DEFAULT_MOVE_STEP},
    error::{GpsError, Result},
    feed::FeedWorker,
    gps::data::LocationPoint,
    lock,
    sink::{LocationSink, ServiceNotifier},
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};
use tracing::{debug, warn};

/// A smoothed move from `start` to `target` spread over `total_steps` reads
#[derive(Debug, Clone, PartialEq)]
pub struct FlyPlan {
    pub start: LocationPoint,
    pub target: LocationPoint,
    pub total_steps: u32,
    pub current_step: u32,
}

impl FlyPlan {
    /// A zero step count is treated as one: the first read lands on the target
    pub fn new(start: LocationPoint, target: LocationPoint, total_steps: u32) -> Self {
        Self {
            start,
            target,
            total_steps: total_steps.max(1),
            current_step: 0,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_step >= self.total_steps
    }

    /// Advance one step and return the coordinate for it
    fn advance(&mut self) -> (f64, f64) {
        self.current_step += 1;
        if self.current_step >= self.total_steps {
            return (self.target.latitude, self.target.longitude);
        }
        let t = f64::from(self.current_step) / f64::from(self.total_steps);
        self.start.interpolate(&self.target, t)
    }
}

#[derive(Debug)]
struct LocationState {
    current: Option<LocationPoint>,
    fly_plan: Option<FlyPlan>,
    move_step: f64,
}

/// Holds the location the host reports and owns the gpsd feed.
///
/// Construct one per process at the composition root and share it behind an
/// `Arc`. All location mutations go through a single lock, so the UI thread and
/// the feed thread may both call in.
pub struct LocationCoordinator {
    state: Mutex<LocationState>,
    worker: Mutex<Option<FeedWorker>>,
    started: AtomicBool,
    sink: Arc<dyn LocationSink>,
    notifier: Arc<dyn ServiceNotifier>,
    clock_origin: Instant,
}

impl LocationCoordinator {
    pub fn new(sink: Arc<dyn LocationSink>, notifier: Arc<dyn ServiceNotifier>) -> Self {
        Self {
            state: Mutex::new(LocationState {
                current: None,
                fly_plan: None,
                move_step: DEFAULT_MOVE_STEP,
            }),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
            sink,
            notifier,
            clock_origin: Instant::now(),
        }
    }

    /// Start relaying fixes from the gpsd daemon at `address` (`host:port`).
    ///
    /// A malformed address or a failed connection is returned and leaves the
    /// coordinator stopped. If a feed is already running it is kept.
    pub fn start(self: &Arc<Self>, address: &str) -> Result<()> {
        let config: ConnectionConfig = address.parse()?;

        {
            let mut worker = lock(&self.worker);
            let alive = worker.as_ref().map_or(false, FeedWorker::is_running);
            if !alive {
                if let Some(mut stale) = worker.take() {
                    stale.stop_session();
                }

                let mut feed = FeedWorker::new();
                let coordinator = Arc::downgrade(self);
                feed.start_session(config, move |point| {
                    if let Some(coordinator) = coordinator.upgrade() {
                        coordinator.on_fix_received(point);
                    }
                })?;
                *worker = Some(feed);
            }
            // Under the worker lock, so a stop from the first fix cannot be overtaken
            self.started.store(true, Ordering::SeqCst);
        }

        self.notifier.service_started();
        Ok(())
    }

    /// Stop the feed, waiting until it can no longer deliver fixes.
    /// Does nothing when not started.
    pub fn stop(&self) {
        let worker = lock(&self.worker).take();
        if let Some(mut worker) = worker {
            worker.stop_session();
        }

        if self.started.swap(false, Ordering::SeqCst) {
            self.notifier.service_stopped();
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Move straight to `point`, abandoning any fly plan
    pub fn jump_to_location(&self, point: LocationPoint) {
        let mut state = lock(&self.state);
        state.fly_plan = None;
        state.current = Some(point);
        debug!("Jumped to {}", point);
    }

    /// Plan a smoothed move from the current location to `point`.
    /// The current location changes only as [`get_interpolated_point`](Self::get_interpolated_point) is read.
    pub fn fly_to_location(&self, point: LocationPoint, total_steps: u32) -> Result<()> {
        let mut state = lock(&self.state);
        let start = state.current.ok_or(GpsError::NoActiveLocation)?;
        state.fly_plan = Some(FlyPlan::new(start, point, total_steps));
        debug!("Flying from {} to {} over {} steps", start, point, total_steps);
        Ok(())
    }

    /// The location to report right now.
    ///
    /// While a fly plan is active every call advances it by one step and
    /// stores the result as the current location; the call after the last
    /// step clears the plan.
    pub fn get_interpolated_point(&self) -> Result<LocationPoint> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let current = state.current.as_mut().ok_or(GpsError::NoActiveLocation)?;

        let finished = match state.fly_plan.as_mut() {
            Some(plan) if !plan.is_exhausted() => {
                let (lat, lon) = plan.advance();
                current.latitude = lat;
                current.longitude = lon;
                false
            }
            Some(_) => true,
            None => false,
        };
        let point = *current;

        if finished {
            debug!("Fly plan finished at {}", point);
            state.fly_plan = None;
        }
        Ok(point)
    }

    /// Advance the fly animation one step and hand the result to the sink
    pub fn publish_interpolated(&self) -> Result<LocationPoint> {
        let point = self.get_interpolated_point()?;
        self.sink
            .report_location(&point, self.clock_origin.elapsed())?;
        Ok(point)
    }

    /// Feed path: overwrite the current location and publish it.
    ///
    /// An active fly plan is left in place.
    pub fn on_fix_received(&self, point: LocationPoint) {
        lock(&self.state).current = Some(point);

        if let Err(e) = self.sink.report_location(&point, self.clock_origin.elapsed()) {
            warn!("Location sink rejected fix {}: {}", point, e);
        }
        self.notifier
            .fix_received(&point.accuracy_label(), &point.coordinate_label());
    }

    pub fn current_location(&self) -> Result<LocationPoint> {
        lock(&self.state).current.ok_or(GpsError::NoActiveLocation)
    }

    /// Current location as `"lat, lon"`, for copying
    pub fn location_text(&self) -> Result<String> {
        self.current_location().map(|point| point.to_string())
    }

    pub fn is_fly_mode(&self) -> bool {
        lock(&self.state).fly_plan.is_some()
    }

    pub fn fly_plan(&self) -> Option<FlyPlan> {
        lock(&self.state).fly_plan.clone()
    }

    pub fn stop_fly_mode(&self) {
        lock(&self.state).fly_plan = None;
    }

    pub fn set_move_step(&self, step: f64) {
        lock(&self.state).move_step = step;
    }

    pub fn move_step(&self) -> f64 {
        lock(&self.state).move_step
    }

    pub fn move_up(&self) -> Result<LocationPoint> {
        self.nudge(1.0, 0.0)
    }

    pub fn move_down(&self) -> Result<LocationPoint> {
        self.nudge(-1.0, 0.0)
    }

    pub fn move_left(&self) -> Result<LocationPoint> {
        self.nudge(0.0, -1.0)
    }

    pub fn move_right(&self) -> Result<LocationPoint> {
        self.nudge(0.0, 1.0)
    }

    fn nudge(&self, lat_sign: f64, lon_sign: f64) -> Result<LocationPoint> {
        let mut state = lock(&self.state);
        let step = state.move_step;
        let current = state.current.as_mut().ok_or(GpsError::NoActiveLocation)?;
        current.latitude += lat_sign * step;
        current.longitude += lon_sign * step;
        Ok(*current)
    }
}

impl Drop for LocationCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}
