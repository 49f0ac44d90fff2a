//! Background synchronization: the fast vehicle poll loop, the slow route
//! atlas refresh loop, and the broadcast plane feeding WebSocket subscribers.
//!
//! Ownership follows a single-writer discipline. The fast loop is the only
//! writer of the state table; the slow loop is the only writer of the atlas
//! handle, and it installs whole generations by swapping an `Arc`. Readers
//! clone the inner `Arc` and keep a consistent view for as long as they
//! hold it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::models::{StopRef, VehicleFrame, VehicleState};
use crate::providers::ettu::{EttuClient, EttuError, RawVehicle};
use crate::providers::osrm::{OsrmClient, OsrmError};
use crate::services::atlas::{self, AtlasError, RouteAtlas};
use crate::services::{eta, matcher, stops};

/// Shared handle to the current atlas generation
pub type AtlasHandle = Arc<RwLock<Arc<RouteAtlas>>>;

/// Shared handle to the vehicle state table
pub type StateStore = Arc<RwLock<StateTable>>;

/// Shared handle to the latest tick statistics
pub type TickStatsStore = Arc<RwLock<TickStats>>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source client: {0}")]
    Source(#[from] EttuError),
    #[error("router client: {0}")]
    Router(#[from] OsrmError),
}

/// The current-state table, written only by the fast loop
#[derive(Debug, Default)]
pub struct StateTable {
    pub vehicles: HashMap<String, VehicleState>,
    /// Last tick each vehicle appeared in the source response
    last_seen: HashMap<String, DateTime<Utc>>,
}

/// Counters from the most recent tick
#[derive(Debug, Default, Clone)]
pub struct TickStats {
    pub vehicles_total: usize,
    pub vehicles_matched: usize,
    pub vehicles_unmatched: usize,
    pub vehicles_by_route: BTreeMap<String, usize>,
    pub last_tick_at: Option<DateTime<Utc>>,
}

struct CachedSnapshot {
    vehicles: Vec<VehicleState>,
    published_at: Instant,
}

/// Fans out tick frames to WebSocket subscribers.
///
/// Each subscriber reads from a broadcast ring of bounded capacity: a
/// publish never blocks, and a subscriber that falls behind loses its
/// oldest frames (surfaced as a `Lagged` receive, at which point the
/// connection is counted as lossy and continues with the newest frames).
pub struct Broadcaster {
    frames_tx: broadcast::Sender<Arc<VehicleFrame>>,
    latest: RwLock<Option<CachedSnapshot>>,
    snapshot_max_age: Duration,
    subscribers: AtomicUsize,
    lossy_subscribers: AtomicUsize,
}

/// One subscriber's view: an optional fresh snapshot plus the frame stream
pub struct Subscription {
    pub id: Uuid,
    pub snapshot: Option<VehicleFrame>,
    pub frames: broadcast::Receiver<Arc<VehicleFrame>>,
}

impl Broadcaster {
    pub fn new(max_buffered_frames: usize, snapshot_max_age: Duration) -> Self {
        let (frames_tx, _) = broadcast::channel(max_buffered_frames.max(1));
        Self {
            frames_tx,
            latest: RwLock::new(None),
            snapshot_max_age,
            subscribers: AtomicUsize::new(0),
            lossy_subscribers: AtomicUsize::new(0),
        }
    }

    /// Publish one tick: the update frame goes to subscribers and the full
    /// table is cached for future snapshots.
    pub async fn publish(&self, update: Vec<VehicleState>, full_state: Vec<VehicleState>) {
        *self.latest.write().await = Some(CachedSnapshot {
            vehicles: full_state,
            published_at: Instant::now(),
        });
        // A send error only means nobody is subscribed right now
        let _ = self
            .frames_tx
            .send(Arc::new(VehicleFrame::Update { vehicles: update }));
    }

    /// Register a subscriber. The returned snapshot is None when no tick has
    /// been published yet or the cached one is older than the staleness
    /// bound; such clients simply wait for the next update.
    pub async fn subscribe(&self) -> Subscription {
        let frames = self.frames_tx.subscribe();
        let snapshot = {
            let latest = self.latest.read().await;
            latest.as_ref().and_then(|cached| {
                (cached.published_at.elapsed() <= self.snapshot_max_age).then(|| {
                    VehicleFrame::Snapshot {
                        vehicles: cached.vehicles.clone(),
                    }
                })
            })
        };
        self.subscribers.fetch_add(1, Ordering::Relaxed);
        Subscription {
            id: Uuid::new_v4(),
            snapshot,
            frames,
        }
    }

    pub fn unsubscribe(&self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Called once per subscriber on its first lagged receive
    pub fn mark_lossy(&self) {
        self.lossy_subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::Relaxed)
    }

    pub fn lossy_count(&self) -> usize {
        self.lossy_subscribers.load(Ordering::Relaxed)
    }
}

/// Orchestrates the per-tick pipeline and owns the shared stores
pub struct Tracker {
    ettu: EttuClient,
    osrm: OsrmClient,
    config: Config,
    atlas: AtlasHandle,
    states: StateStore,
    stats: TickStatsStore,
    broadcaster: Arc<Broadcaster>,
}

impl Tracker {
    pub fn new(config: Config) -> Result<Self, SyncError> {
        let ettu = EttuClient::new(&config)?;
        let osrm = OsrmClient::new(&config)?;
        let broadcaster = Arc::new(Broadcaster::new(
            config.max_buffered_frames,
            Duration::from_millis(config.snapshot_max_age_ms),
        ));

        Ok(Self {
            ettu,
            osrm,
            config,
            atlas: Arc::new(RwLock::new(Arc::new(RouteAtlas::empty()))),
            states: Arc::new(RwLock::new(StateTable::default())),
            stats: Arc::new(RwLock::new(TickStats::default())),
            broadcaster,
        })
    }

    pub fn atlas_handle(&self) -> AtlasHandle {
        self.atlas.clone()
    }

    pub fn state_store(&self) -> StateStore {
        self.states.clone()
    }

    pub fn stats_store(&self) -> TickStatsStore {
        self.stats.clone()
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Build and atomically install a new atlas generation. On failure the
    /// previous generation stays in place.
    pub async fn refresh_atlas(&self) -> Result<(), AtlasError> {
        let generation = self.atlas.read().await.generation + 1;
        let built = atlas::build(&self.ettu, &self.osrm, generation).await?;
        info!(
            generation,
            routes = built.routes.len(),
            stops = built.stops.len(),
            "installing new route atlas generation"
        );
        *self.atlas.write().await = Arc::new(built);
        Ok(())
    }

    /// One fast-loop tick: fetch, enrich, publish. A failed fetch skips the
    /// tick and leaves all state untouched.
    pub async fn poll_once(&self) {
        let raw = match self.ettu.fetch_vehicles().await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "vehicle poll failed; keeping previous state");
                return;
            }
        };
        let atlas = self.atlas.read().await.clone();
        self.process_tick(&atlas, raw, Utc::now()).await;
    }

    /// Enrich this tick's vehicles, reconcile the state table, and publish.
    pub(crate) async fn process_tick(
        &self,
        atlas: &RouteAtlas,
        raw: Vec<RawVehicle>,
        now: DateTime<Utc>,
    ) {
        let mut stats = TickStats {
            vehicles_total: raw.len(),
            last_tick_at: Some(now),
            ..TickStats::default()
        };

        let mut update = Vec::with_capacity(raw.len());
        for rv in &raw {
            let state = process_vehicle(atlas, &self.config, rv, now);
            if state.route_id.is_some() {
                stats.vehicles_matched += 1;
            } else {
                stats.vehicles_unmatched += 1;
            }
            *stats.vehicles_by_route.entry(state.route.clone()).or_default() += 1;
            update.push(state);
        }

        let full_state = {
            let mut guard = self.states.write().await;
            let table = &mut *guard;

            for state in &update {
                table.last_seen.insert(state.id.clone(), now);
                table.vehicles.insert(state.id.clone(), state.clone());
            }

            // Vehicles missing from this tick linger as ghosts until the
            // TTL runs out, then disappear entirely
            let ttl = chrono::Duration::seconds(self.config.vehicle_ttl_seconds);
            let observed: HashSet<&str> = update.iter().map(|s| s.id.as_str()).collect();
            let mut expired = Vec::new();
            for (id, seen) in &table.last_seen {
                if observed.contains(id.as_str()) {
                    continue;
                }
                if now - *seen > ttl {
                    expired.push(id.clone());
                } else if let Some(ghost) = table.vehicles.get_mut(id) {
                    ghost.signal_lost = true;
                    ghost.speed = 0.0;
                }
            }
            for id in &expired {
                table.vehicles.remove(id);
                table.last_seen.remove(id);
            }
            if !expired.is_empty() {
                debug!(count = expired.len(), "evicted vehicles past TTL");
            }

            table.vehicles.values().cloned().collect::<Vec<_>>()
        };

        debug!(
            total = stats.vehicles_total,
            matched = stats.vehicles_matched,
            unmatched = stats.vehicles_unmatched,
            "tick processed"
        );
        *self.stats.write().await = stats;

        self.broadcaster.publish(update, full_state).await;
    }

    /// Run both periodic loops forever. The fast loop polls vehicles every
    /// `poll_interval_seconds`; the slow loop rebuilds the atlas every
    /// `route_refresh_hours`. They overlap safely because atlas installs
    /// are atomic swaps.
    pub async fn start(self: Arc<Self>) {
        info!("starting background sync");

        // Initial atlas build; on failure the server still comes up and the
        // slow loop retries at the next boundary
        if let Err(e) = self.refresh_atlas().await {
            error!(error = %e, "initial route atlas build failed; vehicles will pass through unmatched");
        }

        let slow_self = self.clone();
        let slow_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                slow_self.config.route_refresh_hours * 3600,
            ));
            // Skip the immediate first tick; the initial build ran above
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = slow_self.refresh_atlas().await {
                    error!(error = %e, "route atlas refresh failed; keeping previous generation");
                }
            }
        });

        let fast_self = self.clone();
        let fast_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                fast_self.config.poll_interval_seconds,
            ));
            loop {
                interval.tick().await;
                fast_self.poll_once().await;
            }
        });

        let _ = tokio::join!(slow_handle, fast_handle);
    }
}

/// Run one raw vehicle through match → stop detection → ETA.
fn process_vehicle(
    atlas: &RouteAtlas,
    config: &Config,
    rv: &RawVehicle,
    now: DateTime<Utc>,
) -> VehicleState {
    let signal_lost = rv
        .timestamp
        .map(|ts| (now - ts).num_seconds() > config.signal_lost_seconds)
        .unwrap_or(false);

    let mut state = VehicleState {
        id: rv.dev_id.clone(),
        board_num: rv.board_num.clone(),
        route: rv.route_num.clone(),
        route_id: None,
        lat: rv.lat,
        lon: rv.lon,
        speed: rv.speed_kmh,
        course: rv.course_deg,
        prev_stop: None,
        next_stops: Vec::new(),
        progress: None,
        timestamp: rv.timestamp,
        signal_lost,
        direction: None,
        distance_along_m: None,
        raw_lat: rv.lat,
        raw_lon: rv.lon,
    };

    let Some(matched) = matcher::match_vehicle(
        atlas,
        &rv.route_num,
        rv.lat,
        rv.lon,
        rv.course_deg,
        config.max_snap_distance_m,
    ) else {
        // Unknown route or off-route fix: emitted as-is with null route fields
        return state;
    };

    state.route_id = Some(matched.route_id);
    state.direction = Some(matched.direction);
    state.progress = Some(matched.progress);
    state.distance_along_m = Some(matched.distance_along_m);
    state.lat = matched.snapped[0];
    state.lon = matched.snapped[1];

    if let Some(route) = atlas.routes.get(&matched.route_id) {
        let path = &route.directions[matched.direction];
        let detection = stops::detect(&path.stops, matched.distance_along_m, stops::MAX_NEXT_STOPS);
        state.prev_stop = detection.prev_stop.map(|s| StopRef {
            id: s.id,
            name: s.name.clone(),
        });
        state.next_stops =
            eta::upcoming_stops(matched.distance_along_m, rv.speed_kmh, &detection.next_stops);
    }

    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stop;
    use crate::providers::ettu::RawRoute;

    fn test_config() -> Config {
        Config::from_lookup(|_| None).unwrap()
    }

    fn test_tracker() -> Tracker {
        Tracker::new(test_config()).unwrap()
    }

    /// North-south route, ~10 km: stop 1 south terminus, stop 2 north terminus
    fn test_atlas() -> RouteAtlas {
        let stops = vec![
            Stop {
                id: 1,
                name: "South".to_string(),
                lat: 56.800,
                lon: 60.600,
                direction: String::new(),
                active: true,
            },
            Stop {
                id: 2,
                name: "North".to_string(),
                lat: 56.890,
                lon: 60.600,
                direction: String::new(),
                active: true,
            },
        ];
        let route = RawRoute {
            id: 7,
            number: "1".to_string(),
            name: String::new(),
            directions: [vec![1, 2], vec![2, 1]],
            geometry_directions: [vec![1, 2], vec![2, 1]],
        };
        atlas::assemble(vec![route], stops, HashMap::new(), 1, Utc::now()).unwrap()
    }

    fn raw(dev_id: &str, route: &str, lat: f64, lon: f64, speed: f64, course: f64) -> RawVehicle {
        RawVehicle {
            dev_id: dev_id.to_string(),
            board_num: format!("b-{dev_id}"),
            route_num: route.to_string(),
            lat,
            lon,
            speed_kmh: speed,
            course_deg: course,
            timestamp: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn tick_enriches_matches_and_publishes() {
        let tracker = test_tracker();
        let atlas = test_atlas();
        let mut sub = tracker.broadcaster().subscribe().await;
        assert!(sub.snapshot.is_none(), "nothing published yet");

        // Midpoint of the route, heading north at 36 km/h
        let vehicle = raw("dev-1", "1", 56.845, 60.600, 36.0, 0.0);
        tracker.process_tick(&atlas, vec![vehicle], Utc::now()).await;

        let store = tracker.state_store();
        let table = store.read().await;
        let state = &table.vehicles["dev-1"];
        assert_eq!(state.route_id, Some(7));
        assert_eq!(state.direction, Some(0));
        assert_eq!(state.prev_stop.as_ref().unwrap().id, 1);
        assert_eq!(state.next_stops.len(), 1);
        assert_eq!(state.next_stops[0].id, 2);
        // ~5 km remaining at 10 m/s
        let eta = state.next_stops[0].eta_seconds.unwrap();
        assert!((480..=520).contains(&eta), "eta = {eta}");
        assert!(!state.signal_lost);
        drop(table);

        let frame = sub.frames.recv().await.unwrap();
        match frame.as_ref() {
            VehicleFrame::Update { vehicles } => {
                assert_eq!(vehicles.len(), 1);
                assert_eq!(vehicles[0].id, "dev-1");
            }
            other => panic!("expected update frame, got {other:?}"),
        }

        let stats = tracker.stats_store();
        let stats = stats.read().await;
        assert_eq!(stats.vehicles_matched, 1);
        assert_eq!(stats.vehicles_unmatched, 0);
        assert_eq!(stats.vehicles_by_route.get("1"), Some(&1));
    }

    #[tokio::test]
    async fn reversed_course_walks_the_stop_sequence_backward() {
        let tracker = test_tracker();
        let atlas = test_atlas();

        // Same midpoint, course rotated 180°: direction 1, so the north
        // terminus is behind and the south terminus is ahead
        let vehicle = raw("dev-1", "1", 56.845, 60.600, 36.0, 180.0);
        tracker.process_tick(&atlas, vec![vehicle], Utc::now()).await;

        let store = tracker.state_store();
        let table = store.read().await;
        let state = &table.vehicles["dev-1"];
        assert_eq!(state.direction, Some(1));
        assert_eq!(state.prev_stop.as_ref().unwrap().id, 2);
        assert_eq!(state.next_stops.len(), 1);
        assert_eq!(state.next_stops[0].id, 1);
    }

    #[tokio::test]
    async fn unknown_route_passes_through_unmatched() {
        let tracker = test_tracker();
        let atlas = test_atlas();

        let vehicle = raw("dev-9", "99", 56.845, 60.600, 20.0, 0.0);
        tracker.process_tick(&atlas, vec![vehicle], Utc::now()).await;

        let store = tracker.state_store();
        let table = store.read().await;
        let state = &table.vehicles["dev-9"];
        assert_eq!(state.route_id, None);
        assert_eq!(state.progress, None);
        assert!(state.prev_stop.is_none());
        assert!(state.next_stops.is_empty());
        // Raw coordinates pass through untouched
        assert_eq!(state.lat, 56.845);
        assert_eq!(state.lon, 60.600);

        let stats = tracker.stats_store();
        assert_eq!(stats.read().await.vehicles_unmatched, 1);
    }

    #[tokio::test]
    async fn stale_timestamp_flags_signal_lost() {
        let tracker = test_tracker();
        let atlas = test_atlas();
        let now = Utc::now();

        let mut vehicle = raw("dev-1", "1", 56.845, 60.600, 36.0, 0.0);
        vehicle.timestamp = Some(now - chrono::Duration::seconds(90));
        tracker.process_tick(&atlas, vec![vehicle], now).await;

        let store = tracker.state_store();
        assert!(store.read().await.vehicles["dev-1"].signal_lost);
    }

    #[tokio::test]
    async fn missing_vehicle_ghosts_then_expires() {
        let tracker = test_tracker();
        let atlas = test_atlas();
        let t0 = Utc::now();

        tracker
            .process_tick(&atlas, vec![raw("dev-1", "1", 56.845, 60.600, 36.0, 0.0)], t0)
            .await;

        // Absent one minute later: still present, flagged, speed zeroed
        let t1 = t0 + chrono::Duration::seconds(60);
        tracker.process_tick(&atlas, Vec::new(), t1).await;
        {
            let store = tracker.state_store();
            let table = store.read().await;
            let ghost = &table.vehicles["dev-1"];
            assert!(ghost.signal_lost);
            assert_eq!(ghost.speed, 0.0);
        }

        // Past the TTL: gone from the table and from snapshots
        let t2 = t0 + chrono::Duration::seconds(121);
        tracker.process_tick(&atlas, Vec::new(), t2).await;
        {
            let store = tracker.state_store();
            let table = store.read().await;
            assert!(table.vehicles.is_empty());
        }
        let sub = tracker.broadcaster().subscribe().await;
        match sub.snapshot {
            Some(VehicleFrame::Snapshot { vehicles }) => assert!(vehicles.is_empty()),
            other => panic!("expected empty snapshot, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_frames_carry_only_observed_vehicles() {
        let tracker = test_tracker();
        let atlas = test_atlas();
        let t0 = Utc::now();

        tracker
            .process_tick(&atlas, vec![raw("dev-1", "1", 56.845, 60.600, 36.0, 0.0)], t0)
            .await;

        let mut sub = tracker.broadcaster().subscribe().await;
        // Snapshot has the ghost-to-be; the next update does not
        match &sub.snapshot {
            Some(VehicleFrame::Snapshot { vehicles }) => assert_eq!(vehicles.len(), 1),
            other => panic!("expected snapshot, got {other:?}"),
        }

        let t1 = t0 + chrono::Duration::seconds(30);
        tracker
            .process_tick(&atlas, vec![raw("dev-2", "1", 56.820, 60.600, 36.0, 0.0)], t1)
            .await;

        let frame = sub.frames.recv().await.unwrap();
        match frame.as_ref() {
            VehicleFrame::Update { vehicles } => {
                assert_eq!(vehicles.len(), 1);
                assert_eq!(vehicles[0].id, "dev-2");
            }
            other => panic!("expected update frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_but_gets_latest() {
        let broadcaster = Broadcaster::new(2, Duration::from_secs(20));
        let mut sub = broadcaster.subscribe().await;

        for i in 0..5 {
            let vehicles = vec![];
            let update = vec![VehicleState {
                id: format!("tick-{i}"),
                board_num: String::new(),
                route: "1".to_string(),
                route_id: None,
                lat: 0.0,
                lon: 0.0,
                speed: 0.0,
                course: 0.0,
                prev_stop: None,
                next_stops: vec![],
                progress: None,
                timestamp: None,
                signal_lost: false,
                direction: None,
                distance_along_m: None,
                raw_lat: 0.0,
                raw_lon: 0.0,
            }];
            broadcaster.publish(update, vehicles).await;
        }

        // The stalled subscriber lost the oldest three frames
        match sub.frames.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => {
                assert_eq!(n, 3);
                broadcaster.mark_lossy();
            }
            other => panic!("expected lagged error, got {other:?}"),
        }
        assert_eq!(broadcaster.lossy_count(), 1);

        // The two newest frames are still there, in order
        let mut seen = Vec::new();
        while let Ok(frame) = sub.frames.try_recv() {
            if let VehicleFrame::Update { vehicles } = frame.as_ref() {
                seen.push(vehicles[0].id.clone());
            }
        }
        assert_eq!(seen, vec!["tick-3".to_string(), "tick-4".to_string()]);

        // A fresh subscriber is unaffected by the laggard
        let mut fresh = broadcaster.subscribe().await;
        broadcaster.publish(Vec::new(), Vec::new()).await;
        assert!(matches!(
            fresh.frames.recv().await.unwrap().as_ref(),
            VehicleFrame::Update { .. }
        ));
    }

    #[tokio::test]
    async fn stale_snapshot_is_withheld() {
        let broadcaster = Broadcaster::new(8, Duration::ZERO);
        broadcaster.publish(Vec::new(), Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let sub = broadcaster.subscribe().await;
        assert!(sub.snapshot.is_none());

        let fresh_broadcaster = Broadcaster::new(8, Duration::from_secs(20));
        fresh_broadcaster.publish(Vec::new(), Vec::new()).await;
        let sub = fresh_broadcaster.subscribe().await;
        assert!(sub.snapshot.is_some());
    }

    #[tokio::test]
    async fn subscriber_counters_track_connections() {
        let broadcaster = Broadcaster::new(8, Duration::from_secs(20));
        assert_eq!(broadcaster.subscriber_count(), 0);
        let _a = broadcaster.subscribe().await;
        let _b = broadcaster.subscribe().await;
        assert_eq!(broadcaster.subscriber_count(), 2);
        broadcaster.unsubscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
