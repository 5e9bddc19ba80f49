//! Bring-up state machine and the steady-state poll loop.
//!
//! The engine owns every client it talks to. One thread drives it: first
//! through `AwaitingForecast` and `AwaitingSensors`, retrying each at a fixed
//! interval, then forever through `Running`, where a single loop drains
//! sensor deltas on every iteration and runs two independently timed ticks
//! (sensor broadcast and feed push).

use crate::bus::links::{OpenLink, broadcast, drain_all};
use crate::bus::packet::UpdatePacket;
use crate::engine::clock::Clock;
use crate::error::AppError;
use crate::feed::FeedSink;
use crate::forecast::feedback::classify;
use crate::forecast::{ForecastSource, ForecastTable};
use crate::occupancy::{Capacity, OccupancyCounter};
use crate::sensor::{DEFAULT_PORT_PATTERN, SensorDiscovery, SensorLink};
use crate::state::{AppState, BridgePhase, OccupancySnapshot};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use time::PrimitiveDateTime;
use tracing::{debug, info, warn};

pub mod clock;

pub const DEFAULT_HORIZON_DAYS: u32 = 7;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SENSOR_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_FEED_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

const WAIT_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSettings {
    pub feed_key: String,
    pub port_pattern: String,
    pub horizon_days: u32,
    pub forecast_retry: Duration,
    pub discovery_retry: Duration,
    pub sensor_interval: Duration,
    pub feed_interval: Duration,
    /// Pause between loop iterations; zero busy-polls.
    pub poll_interval: Duration,
}

impl BridgeSettings {
    pub fn new(feed_key: impl Into<String>) -> Self {
        Self {
            feed_key: feed_key.into(),
            port_pattern: DEFAULT_PORT_PATTERN.to_string(),
            horizon_days: DEFAULT_HORIZON_DAYS,
            forecast_retry: DEFAULT_RETRY_INTERVAL,
            discovery_retry: DEFAULT_RETRY_INTERVAL,
            sensor_interval: DEFAULT_SENSOR_INTERVAL,
            feed_interval: DEFAULT_FEED_INTERVAL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

pub struct BridgeEngine<D: SensorDiscovery> {
    settings: BridgeSettings,
    capacity: Capacity,
    counter: OccupancyCounter,
    phase: BridgePhase,
    forecast_source: Box<dyn ForecastSource>,
    forecast: Option<ForecastTable>,
    discovery: D,
    links: Vec<OpenLink<D::Link>>,
    opened: HashSet<String>,
    feed: Box<dyn FeedSink>,
    clock: Arc<dyn Clock>,
    state: Option<Arc<RwLock<AppState>>>,
    last_sensor_tick: PrimitiveDateTime,
    last_feed_tick: PrimitiveDateTime,
}

impl<D: SensorDiscovery> BridgeEngine<D> {
    /// Build an engine. Capacity is validated here, before anything touches
    /// the network or a device.
    pub fn new(
        settings: BridgeSettings,
        capacity: i64,
        forecast_source: Box<dyn ForecastSource>,
        discovery: D,
        feed: Box<dyn FeedSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AppError> {
        let capacity = Capacity::new(capacity)?;
        let now = clock.now();
        Ok(Self {
            settings,
            capacity,
            counter: OccupancyCounter::new(),
            phase: BridgePhase::AwaitingForecast,
            forecast_source,
            forecast: None,
            discovery,
            links: Vec::new(),
            opened: HashSet::new(),
            feed,
            clock,
            state: None,
            last_sensor_tick: now,
            last_feed_tick: now,
        })
    }

    /// Publish progress into `state` for the status API.
    pub fn with_state(mut self, state: Arc<RwLock<AppState>>) -> Self {
        self.state = Some(state);
        let phase = self.phase;
        self.update_state(|state| state.set_phase(phase));
        self
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    pub fn occupancy(&self) -> u16 {
        self.counter.value()
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn forecast(&self) -> Option<&ForecastTable> {
        self.forecast.as_ref()
    }

    pub fn link_labels(&self) -> Vec<String> {
        self.links.iter().map(|open| open.label().to_string()).collect()
    }

    /// Drive bring-up until `Running`. Returns false if `stop` was raised first.
    pub fn bring_up(&mut self, stop: &AtomicBool) -> bool {
        loop {
            if stop.load(Ordering::Relaxed) {
                return false;
            }
            match self.phase {
                BridgePhase::AwaitingForecast => {
                    if !self.try_fetch_forecast() {
                        self.wait(self.settings.forecast_retry, stop);
                    }
                }
                BridgePhase::AwaitingSensors => {
                    if !self.try_discover() {
                        self.wait(self.settings.discovery_retry, stop);
                    }
                }
                BridgePhase::Running => return true,
            }
        }
    }

    /// One forecast request for the horizon starting today. On success moves
    /// to `AwaitingSensors`.
    pub fn try_fetch_forecast(&mut self) -> bool {
        let today = self.clock.now().date();
        match self
            .forecast_source
            .fetch(today, self.settings.horizon_days)
        {
            Ok(table) => {
                match table.horizon() {
                    Some((first, last)) => info!(
                        points = table.len(),
                        first = %first,
                        last = %last,
                        "Forecast loaded"
                    ),
                    None => info!("Forecast loaded with no data, feedback unavailable"),
                }
                let points = table.len();
                self.forecast = Some(table);
                self.update_state(|state| state.set_forecast_points(points));
                self.set_phase(BridgePhase::AwaitingSensors);
                true
            }
            Err(err) => {
                warn!(
                    error = %err,
                    retry_secs = self.settings.forecast_retry.as_secs(),
                    "Forecast unavailable, retrying"
                );
                false
            }
        }
    }

    /// One discovery scan. Newly found links are added; labels already open
    /// are never reopened. Moves to `Running` once any link is open.
    pub fn try_discover(&mut self) -> bool {
        match self
            .discovery
            .discover(&self.settings.port_pattern, &self.opened)
        {
            Ok(found) => {
                for link in found {
                    if !self.opened.insert(link.label().to_string()) {
                        continue;
                    }
                    info!(port = %link.label(), "Sensor connected");
                    self.links.push(OpenLink::new(link));
                }
            }
            Err(err) => warn!(error = %err, "Sensor discovery failed"),
        }

        if self.links.is_empty() {
            warn!(
                pattern = %self.settings.port_pattern,
                retry_secs = self.settings.discovery_retry.as_secs(),
                "No sensors found, retrying"
            );
            return false;
        }
        self.publish_sensors();
        if self.phase != BridgePhase::Running {
            self.enter_running();
        }
        true
    }

    fn enter_running(&mut self) {
        let now = self.clock.now();
        self.last_sensor_tick = now;
        self.last_feed_tick = now;
        self.set_phase(BridgePhase::Running);
        info!(
            links = self.links.len(),
            capacity = self.capacity.get(),
            "Bridge running"
        );
    }

    /// One iteration of the steady-state loop.
    pub fn poll_once(&mut self) {
        let delta = drain_all(&mut self.links);
        if delta != 0 {
            let occupancy = self.counter.apply(delta);
            debug!(delta, occupancy, "Applied sensor events");
        }

        let now = self.clock.now();
        if is_due(&mut self.last_sensor_tick, now, self.settings.sensor_interval) {
            self.sensor_tick(now);
            self.last_sensor_tick = now;
        }
        if is_due(&mut self.last_feed_tick, now, self.settings.feed_interval) {
            self.feed_tick();
            self.last_feed_tick = now;
        }
    }

    /// Bring up, then poll until `stop` is raised.
    pub fn run(&mut self, stop: &AtomicBool) {
        if !self.bring_up(stop) {
            info!("Stopped during bring-up");
            return;
        }
        while !stop.load(Ordering::Relaxed) {
            self.poll_once();
            if !self.settings.poll_interval.is_zero() {
                self.clock.sleep(self.settings.poll_interval);
            }
        }
        info!(occupancy = self.counter.value(), "Bridge stopped");
    }

    fn sensor_tick(&mut self, now: PrimitiveDateTime) {
        let occupancy = self.counter.value();
        let range = self.forecast.as_ref().and_then(|table| table.lookup(now));
        let feedback = classify(occupancy, range);
        let packet = match UpdatePacket::new(occupancy, self.capacity, feedback) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "Skipping sensor update");
                return;
            }
        };
        debug!(
            occupancy,
            capacity = self.capacity.get(),
            feedback = ?feedback,
            lower = range.map(|range| range.lower),
            upper = range.map(|range| range.upper),
            "Sensor tick"
        );

        broadcast(&mut self.links, &packet.encode());

        let snapshot = OccupancySnapshot {
            occupancy,
            capacity: self.capacity.get(),
            feedback,
            forecast: range,
            timestamp: SystemTime::now(),
        };
        self.update_state(|state| state.set_snapshot(snapshot));
        self.publish_sensors();
    }

    fn feed_tick(&mut self) {
        let occupancy = self.counter.value();
        info!(occupancy, "Current occupancy");
        self.feed.publish(&self.settings.feed_key, occupancy);
    }

    fn wait(&self, duration: Duration, stop: &AtomicBool) {
        let mut slept = Duration::ZERO;
        while slept < duration {
            if stop.load(Ordering::Relaxed) {
                break;
            }
            let step = WAIT_STEP.min(duration - slept);
            self.clock.sleep(step);
            slept += step;
        }
    }

    fn set_phase(&mut self, phase: BridgePhase) {
        self.phase = phase;
        self.update_state(|state| state.set_phase(phase));
    }

    fn publish_sensors(&self) {
        if self.state.is_none() {
            return;
        }
        let sensors = self.links.iter().map(OpenLink::info).collect();
        self.update_state(|state| state.set_sensors(sensors));
    }

    fn update_state(&self, apply: impl FnOnce(&mut AppState)) {
        let Some(state) = self.state.as_ref() else {
            return;
        };
        match state.write() {
            Ok(mut guard) => apply(&mut guard),
            Err(_) => warn!("State lock poisoned, skipping status update"),
        }
    }
}

/// True once `interval` has passed since `last`. A clock that stepped
/// backwards restarts the interval from `now`.
fn is_due(last: &mut PrimitiveDateTime, now: PrimitiveDateTime, interval: Duration) -> bool {
    if now < *last {
        *last = now;
        return false;
    }
    *last + interval <= now
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::clock::ManualClock;
    use crate::feed::RecordingFeed;
    use crate::forecast::mock::ScriptedForecastSource;
    use crate::forecast::{ForecastError, ForecastPoint};
    use crate::sensor::mock::MockDiscovery;
    use time::macros::{date, datetime};

    const START: PrimitiveDateTime = datetime!(2024-05-01 08:00);

    fn table() -> ForecastTable {
        ForecastTable::new(vec![
            ForecastPoint {
                timestamp: datetime!(2024-05-01 08:00),
                prediction: 2.0,
                lower: 1.0,
                upper: 3.0,
            },
            ForecastPoint {
                timestamp: datetime!(2024-05-01 08:01),
                prediction: 2.0,
                lower: 1.0,
                upper: 3.0,
            },
        ])
    }

    fn engine(
        capacity: i64,
        source: ScriptedForecastSource,
        discovery: MockDiscovery,
        feed: RecordingFeed,
        clock: Arc<ManualClock>,
    ) -> Result<BridgeEngine<MockDiscovery>, AppError> {
        BridgeEngine::new(
            BridgeSettings::new("lobby"),
            capacity,
            Box::new(source),
            discovery,
            Box::new(feed),
            clock,
        )
    }

    #[test]
    fn invalid_capacity_fails_before_any_io() {
        for capacity in [0, 65535, -4] {
            let clock = Arc::new(ManualClock::new(START));
            let source = ScriptedForecastSource::new(Vec::new());
            let attempts = source.attempts();
            let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1"]]);
            let registry = discovery.registry();

            let result = engine(capacity, source, discovery, RecordingFeed::new(), clock);

            assert!(matches!(result, Err(AppError::CapacityOutOfRange(value)) if value == capacity));
            assert!(attempts.lock().map(|log| log.is_empty()).unwrap_or(false));
            assert_eq!(registry.scans(), 0);
        }
    }

    #[test]
    fn largest_capacity_is_accepted() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let engine = engine(
            65534,
            ScriptedForecastSource::new(Vec::new()),
            MockDiscovery::new(Vec::new()),
            RecordingFeed::new(),
            clock,
        )?;

        assert_eq!(engine.capacity().get(), 65534);
        assert_eq!(engine.phase(), BridgePhase::AwaitingForecast);
        Ok(())
    }

    #[test]
    fn forecast_retries_until_available() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::failing_then(2, table()).with_clock(clock.clone());
        let attempts = source.attempts();
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1"]]);
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock.clone())?;

        let stop = AtomicBool::new(false);
        assert!(engine.bring_up(&stop));

        let attempts = attempts.lock().map(|log| log.clone()).unwrap_or_default();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|attempt| attempt.horizon_days == 7));
        assert!(attempts.iter().all(|attempt| attempt.from_date == date!(2024-05-01)));
        for pair in attempts.windows(2) {
            let (Some(earlier), Some(later)) = (pair[0].at, pair[1].at) else {
                panic!("attempt without timestamp");
            };
            assert!(later - earlier >= time::Duration::seconds(30));
        }
        assert_eq!(engine.phase(), BridgePhase::Running);
        assert_eq!(engine.forecast().map(ForecastTable::len), Some(2));
        Ok(())
    }

    #[test]
    fn empty_forecast_still_brings_up() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(ForecastTable::empty())]);
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1"]]);
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock)?;

        assert!(engine.bring_up(&AtomicBool::new(false)));
        assert!(engine.forecast().is_some_and(ForecastTable::is_empty));
        Ok(())
    }

    #[test]
    fn discovery_rescans_and_never_reopens() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(table())]);
        let discovery = MockDiscovery::new(vec![
            vec![],
            vec!["usb-FTDI-9"],
            vec!["usb-Arduino-1"],
            vec!["usb-Arduino-1", "usb-Arduino-2"],
        ]);
        let registry = discovery.registry();
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock.clone())?;

        assert!(engine.bring_up(&AtomicBool::new(false)));

        assert_eq!(registry.scans(), 3);
        assert!(clock.slept() >= Duration::from_secs(60));
        assert_eq!(engine.link_labels(), vec!["usb-Arduino-1".to_string()]);

        assert!(engine.try_discover());
        assert_eq!(
            registry.opened(),
            vec!["usb-Arduino-1".to_string(), "usb-Arduino-2".to_string()]
        );
        assert_eq!(engine.link_labels().len(), 2);
        Ok(())
    }

    #[test]
    fn stop_interrupts_bring_up() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Err(ForecastError::Http(500))]);
        let mut engine = engine(
            40,
            source,
            MockDiscovery::new(Vec::new()),
            RecordingFeed::new(),
            clock,
        )?;
        let stop = AtomicBool::new(true);

        assert!(!engine.bring_up(&stop));
        assert_eq!(engine.phase(), BridgePhase::AwaitingForecast);
        Ok(())
    }

    #[test]
    fn sensor_and_feed_ticks_follow_their_cadence() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(table())]);
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1"]]);
        let handle = discovery.registry().link("usb-Arduino-1");
        let feed = RecordingFeed::new();
        let mut engine = engine(40, source, discovery, feed.clone(), clock.clone())?;
        assert!(engine.bring_up(&AtomicBool::new(false)));

        handle.push_events(&[1, 1]);
        engine.poll_once();
        assert_eq!(engine.occupancy(), 2);
        assert!(handle.sent().is_empty());

        clock.advance(Duration::from_millis(999));
        engine.poll_once();
        assert!(handle.sent().is_empty());

        clock.advance(Duration::from_millis(1));
        engine.poll_once();
        assert_eq!(handle.sent(), vec![[0xff, 0xff, 0x00, 0x02, 0x00, 0x28, 0x02]]);

        handle.push_events(&[5]);
        for _ in 0..29 {
            clock.advance(Duration::from_secs(1));
            engine.poll_once();
        }
        assert_eq!(handle.sent().len(), 30);
        assert_eq!(feed.published(), vec![("lobby".to_string(), 7)]);
        assert_eq!(
            handle.sent().last(),
            Some(&[0xff, 0xff, 0x00, 0x07, 0x00, 0x28, 0x03])
        );
        Ok(())
    }

    #[test]
    fn counter_clamps_through_the_loop() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(ForecastTable::empty())]);
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1", "usb-Arduino-2"]]);
        let registry = discovery.registry();
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock.clone())?;
        assert!(engine.bring_up(&AtomicBool::new(false)));

        registry.link("usb-Arduino-1").push_events(&[1, 1, 1]);
        registry.link("usb-Arduino-2").push_events(&[-128, -128, -128, -116]);
        engine.poll_once();

        assert_eq!(engine.occupancy(), 0);
        clock.advance(Duration::from_secs(1));
        engine.poll_once();
        assert_eq!(
            registry.link("usb-Arduino-2").sent(),
            vec![[0xff, 0xff, 0x00, 0x00, 0x00, 0x28, 0x04]]
        );
        Ok(())
    }

    #[test]
    fn write_failure_on_one_link_does_not_stop_others() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(table())]);
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1", "usb-Arduino-2"]]);
        let registry = discovery.registry();
        registry.link("usb-Arduino-1").set_fail_writes(true);
        let state = Arc::new(RwLock::new(AppState::new()));
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock.clone())?
            .with_state(Arc::clone(&state));
        assert!(engine.bring_up(&AtomicBool::new(false)));

        for _ in 0..3 {
            clock.advance(Duration::from_secs(1));
            engine.poll_once();
        }

        assert!(registry.link("usb-Arduino-1").sent().is_empty());
        assert_eq!(registry.link("usb-Arduino-2").sent().len(), 3);

        let Ok(guard) = state.read() else {
            panic!("state lock poisoned");
        };
        assert_eq!(guard.phase(), BridgePhase::Running);
        assert_eq!(guard.sensors().len(), 2);
        assert_eq!(guard.sensors()[0].write_failures, 3);
        assert!(guard.sensors()[1].last_write_ok);
        assert_eq!(guard.snapshot().map(|snapshot| snapshot.occupancy), Some(0));
        Ok(())
    }

    #[test]
    fn poisoned_status_lock_does_not_stop_the_loop() -> Result<(), AppError> {
        let clock = Arc::new(ManualClock::new(START));
        let source = ScriptedForecastSource::new(vec![Ok(table())]);
        let discovery = MockDiscovery::new(vec![vec!["usb-Arduino-1"]]);
        let handle = discovery.registry().link("usb-Arduino-1");
        let state = Arc::new(RwLock::new(AppState::new()));
        let state_for_thread = Arc::clone(&state);
        let _ = std::thread::spawn(move || {
            let _guard = state_for_thread.write().expect("lock for poison");
            panic!("poison lock");
        })
        .join();
        let mut engine = engine(40, source, discovery, RecordingFeed::new(), clock.clone())?
            .with_state(state);

        assert!(engine.bring_up(&AtomicBool::new(false)));
        handle.push_events(&[1]);
        clock.advance(Duration::from_secs(1));
        engine.poll_once();

        assert_eq!(engine.occupancy(), 1);
        assert_eq!(handle.sent().len(), 1);
        Ok(())
    }

    #[test]
    fn clock_stepping_back_restarts_interval() {
        let mut last = datetime!(2024-05-01 08:00:10);

        assert!(!is_due(&mut last, datetime!(2024-05-01 08:00:05), Duration::from_secs(1)));
        assert_eq!(last, datetime!(2024-05-01 08:00:05));
        assert!(is_due(&mut last, datetime!(2024-05-01 08:00:06), Duration::from_secs(1)));
    }
}
