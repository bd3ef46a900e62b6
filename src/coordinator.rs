//! Coordinator: the daemon's single dispatch point.
//!
//! Owns the registry of `ObservationSystem`s, the environment table, the
//! astronomical clock and the plan store, and drains one event loop that
//! every session and every periodic sweep feeds into. Routing and
//! coupling decisions happen here because only the Coordinator holds the
//! full `(gid, uid) -> ObservationSystem` map; `net::Registry` only knows
//! about raw, not-yet-addressed sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use log::{info, warn};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::sleep;

use crate::clock::{AstronomicalClock, ClockEvent, SkyRegime};
use crate::environment::EnvironmentTable;
use crate::ids::SystemId;
use crate::net::{Endpoint, Registry, Session, SessionEvent, SessionId};
use crate::notify::database::DbReporter;
use crate::observation_system::{ObservationSystem, ACQUISITION_INTERVAL, DEFAULT_GRACE};
use crate::plan::{PlanState, PlanStore};
use crate::protocol::annex;
use crate::protocol::record::{DeviceRole, ProtocolRecord, SlitCommand, SlitState};

/// How often the liveness sweep reclaims idle systems.
const PRUNE_INTERVAL: StdDuration = StdDuration::from_secs(60);
/// Per-group mount/camera status report cadence.
const STATUS_REPORT_INTERVAL: StdDuration = StdDuration::from_secs(5);

pub struct Coordinator {
    registry: Registry,
    systems: Arc<Mutex<HashMap<SystemId, Arc<Mutex<ObservationSystem>>>>>,
    environment: EnvironmentTable,
    clock: Arc<Mutex<AstronomicalClock>>,
    plans: Arc<PlanStore>,
    annex_sessions: Arc<Mutex<HashMap<String, Session>>>,
    db: Arc<dyn DbReporter>,
    default_elevation_limit: f64,
    grace: StdDuration,
    /// Explicit wake for the acquisition loop.
    acquire_wake: Arc<Notify>,
}

impl Coordinator {
    pub fn new(
        registry: Registry,
        clock: Arc<Mutex<AstronomicalClock>>,
        plans: Arc<PlanStore>,
        db: Arc<dyn DbReporter>,
        default_elevation_limit: f64,
    ) -> Self {
        Coordinator {
            registry,
            systems: Arc::new(Mutex::new(HashMap::new())),
            environment: EnvironmentTable::new(),
            clock,
            plans,
            annex_sessions: Arc::new(Mutex::new(HashMap::new())),
            db,
            default_elevation_limit,
            grace: DEFAULT_GRACE,
            acquire_wake: Arc::new(Notify::new()),
        }
    }

    /// Wakes the acquisition loop immediately instead of waiting for its
    /// next 30 s tick. Cheap to call speculatively — a stray wake just costs one
    /// extra scan over the systems table.
    fn wake_acquisition(&self) {
        self.acquire_wake.notify_one();
    }

    /// Registers a system up front (configuration lists the known
    /// `(gid, uid)` pairs at startup; sessions couple to these as they
    /// connect, they don't create them).
    pub async fn register_system(&self, id: SystemId, elevation_limit: Option<f64>) {
        let limit = elevation_limit.unwrap_or(self.default_elevation_limit);
        let plans = self.plans.clone();
        let db = self.db.clone();
        let clock = self.clock.clone();
        self.systems
            .lock()
            .await
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ObservationSystem::new(id, limit, plans, db, clock))));
    }

    pub async fn known_systems(&self) -> Vec<SystemId> {
        self.systems.lock().await.keys().cloned().collect()
    }

    /// Runs forever, draining session events and clock edges. Spawns the
    /// periodic prune and acquisition tasks alongside itself.
    pub async fn run(
        self: Arc<Self>,
        mut session_events: mpsc::UnboundedReceiver<SessionEvent>,
        mut clock_events: mpsc::UnboundedReceiver<ClockEvent>,
    ) {
        self.clone().spawn_prune_loop();
        self.clone().spawn_acquisition_loop();
        self.clone().spawn_status_report_loop();

        loop {
            tokio::select! {
                event = session_events.recv() => {
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => {
                            warn!("session event channel closed, coordinator shutting down");
                            return;
                        }
                    }
                }
                event = clock_events.recv() => {
                    match event {
                        Some(event) => self.handle_clock_event(event).await,
                        None => {
                            warn!("clock event channel closed, coordinator shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Reclaims `ObservationSystem`s idle past their grace window
    ///. A system is only ever created by `register_system` at
    /// startup from configuration, so "reclaim" here means dropping its
    /// in-memory state; a subsequent `register` from a device with the
    /// same `(gid, uid)` creates a fresh one next sweep via the usual
    /// coupling path — configuration, not this map, is the source of
    /// truth for which systems exist.
    fn spawn_prune_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                sleep(PRUNE_INTERVAL).await;
                let mut systems = self.systems.lock().await;
                let mut dead = Vec::new();
                for (id, system) in systems.iter() {
                    if !system.lock().await.is_alive(self.grace) {
                        dead.push(id.clone());
                    }
                }
                for id in dead {
                    systems.remove(&id);
                    info!("{} idle past grace window, reclaimed", id);
                }
            }
        });
    }

    fn spawn_status_report_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                sleep(STATUS_REPORT_INTERVAL).await;
                let systems: Vec<Arc<Mutex<ObservationSystem>>> =
                    self.systems.lock().await.values().cloned().collect();
                for system in systems {
                    system.lock().await.report_status().await;
                }
            }
        });
    }

    /// Runs the acquisition scan either on the 30 s cadence or as soon as
    /// `wake_acquisition` fires, whichever comes first.
    fn spawn_acquisition_loop(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(ACQUISITION_INTERVAL) => {}
                    _ = self.acquire_wake.notified() => {}
                }
                let ids: Vec<SystemId> = self.systems.lock().await.keys().cloned().collect();
                for id in ids {
                    self.try_acquire(&id).await;
                }
            }
        });
    }

    async fn try_acquire(&self, id: &SystemId) {
        let system = match self.systems.lock().await.get(id).cloned() {
            Some(system) => system,
            None => return,
        };
        let mut guard = system.lock().await;
        if guard.current_plan.is_some() || !guard.automode {
            return;
        }
        drop(guard);

        let now = Utc::now();
        let regime = self.clock.lock().await.regime_for(&id.gid, now);
        let slit = self
            .environment
            .snapshot(&id.gid)
            .await
            .and_then(|e| e.slit);

        if let Some(plan) = self.plans.acquire(id, regime, slit, now).await {
            let plan_sn = plan.plan_sn.clone();
            let mut guard = system.lock().await;
            guard.run_plan(plan).await;
            drop(guard);
            self.plans.mark_run(&plan_sn).await;
            self.db.report_plan_state(&plan_sn, PlanState::Run).await;
        }
    }

    // ---- session events --------------------------------------------

    async fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Record(session_id, endpoint, record) => {
                self.handle_record(session_id, endpoint, record).await;
            }
            SessionEvent::Closed(session_id) => {
                self.handle_closed(session_id).await;
            }
        }
    }

    async fn handle_record(&self, session_id: SessionId, endpoint: Endpoint, record: ProtocolRecord) {
        if endpoint == Endpoint::Annex {
            if let Some(gid) = annex_gid(&record) {
                self.note_annex_session(session_id, &gid).await;
            }
        }

        match record {
            ProtocolRecord::Register { addr, cid, role } => {
                self.handle_register(session_id, addr.gid, addr.uid, cid, role).await;
            }
            ProtocolRecord::MountStatus { addr, state, errcode, ra, dec, azi, alt, .. } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.handle_mount_status(state, errcode, ra, dec, azi, alt).await;
                }
                self.wake_acquisition();
            }
            ProtocolRecord::CameraStatus { addr, cid, utc, state, errcode, cool_temp, filter, seq, filename } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system
                        .lock()
                        .await
                        .handle_camera_status(&cid, utc.clone(), state, errcode, cool_temp, filter.clone(), seq, filename.clone())
                        .await;
                }
                self.wake_acquisition();
            }
            ProtocolRecord::TakeImage { addr, image_type, coorsys, coor1, coor2, exp_dur, frame_count } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_accept_manual_take_image() {
                        guard.manual_take_image(image_type, coorsys, coor1, coor2, exp_dur, frame_count).await;
                    } else {
                        warn!("rejecting manual take-image for {}: plan already running", addr.gid);
                    }
                }
            }
            ProtocolRecord::StartAuto { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.enable_automode().await;
                }
                self.wake_acquisition();
            }
            ProtocolRecord::StopAuto { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.disable_automode().await;
                }
            }
            ProtocolRecord::AbortPlan { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.interrupt_plan(PlanState::Interrupted).await;
                }
                self.wake_acquisition();
            }
            ProtocolRecord::LoadPlan { .. } => {
                let today = Utc::now().date_naive();
                let registered = self.known_systems().await;
                if let Err(err) = self.plans.load_day(today, &registered).await {
                    warn!("failed to reload plan day {}: {}", today, err);
                }
            }
            ProtocolRecord::Rain { value } => {
                self.handle_rain(value).await;
            }
            ProtocolRecord::Slit { gid, command, state } => {
                if let Some(state) = state {
                    self.environment.update_slit(&gid, state).await;
                    self.db.report_slit(&gid, state).await;
                }
                if let Some(command) = command {
                    self.handle_client_slit_command(&gid, command).await;
                }
            }
            ProtocolRecord::Fwhm { gid, uid, cid, value } => {
                for system in self.matching_systems(&gid, &uid).await {
                    system.lock().await.record_fwhm(&cid, value).await;
                }
            }
            ProtocolRecord::FocusStatus { .. } => {}
            ProtocolRecord::SlewTo { addr, coorsys, coor1, coor2 } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_accept_manual_slew() {
                        guard.manual_slew(coorsys, coor1, coor2).await;
                    } else {
                        warn!("rejecting manual slew for {}: plan already running", addr.gid);
                    }
                }
            }
            ProtocolRecord::Track { addr, objname, line1, line2 } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_accept_manual_slew() {
                        guard.manual_track(&objname, &line1, &line2).await;
                    } else {
                        warn!("rejecting manual track for {}: plan already running", addr.gid);
                    }
                }
            }
            ProtocolRecord::HomeSync { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_home_sync() {
                        guard.home_sync().await;
                    } else {
                        warn!("rejecting home-sync for {}: mount not idle", addr.gid);
                    }
                }
            }
            ProtocolRecord::Park { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.manual_park().await;
                }
            }
            ProtocolRecord::AbortSlew { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_abort_slew() {
                        guard.abort_slew().await;
                    } else {
                        warn!("rejecting abort-slew for {}: not slewing", addr.gid);
                    }
                }
            }
            ProtocolRecord::AbortImage { addr } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    let mut guard = system.lock().await;
                    if guard.can_abort_image() {
                        guard.abort_image().await;
                    } else {
                        warn!("rejecting abort-image for {}: not exposing", addr.gid);
                    }
                }
            }
            ProtocolRecord::Enable { addr, cid } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.enable(cid.as_deref()).await;
                }
            }
            ProtocolRecord::Disable { addr, cid } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.disable(cid.as_deref()).await;
                }
            }
            ProtocolRecord::Guide { addr, delta1, delta2 } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.guide(delta1, delta2).await;
                }
            }
            ProtocolRecord::MirrorCover { addr, open } => {
                for system in self.matching_systems(&addr.gid, &addr.uid).await {
                    system.lock().await.mirror_cover(open).await;
                }
            }
        }
    }

    /// Collects the `ObservationSystem` handles whose identity matches
    /// `(gid, uid)`, including wildcard addresses. Cloning the `Arc` handles up front lets callers
    /// await each system's own lock without holding the systems-table
    /// lock across the await.
    async fn matching_systems(&self, gid: &str, uid: &str) -> Vec<Arc<Mutex<ObservationSystem>>> {
        self.systems
            .lock()
            .await
            .iter()
            .filter(|(id, _)| id.matches(gid, uid).matches())
            .map(|(_, system)| system.clone())
            .collect()
    }

    /// First time an annex-endpoint session reports a message naming a
    /// group, claims it from the pending pool and records it as that
    /// group's outbound dome-slit session. A no-op
    /// once the session has already been claimed.
    async fn note_annex_session(&self, session_id: SessionId, gid: &str) {
        let mut annex_sessions = self.annex_sessions.lock().await;
        if annex_sessions.contains_key(gid) {
            return;
        }
        if let Some(session) = self.registry.take_pending(session_id).await {
            annex_sessions.insert(gid.to_string(), session);
        }
    }

    async fn handle_register(&self, session_id: SessionId, gid: String, uid: String, cid: Option<String>, role: DeviceRole) {
        let id = SystemId::new(gid.clone(), uid.clone());
        let system = match self.systems.lock().await.get(&id).cloned() {
            Some(system) => system,
            None => {
                warn!("register for unknown system {}, discarding session {}", id, session_id);
                self.registry.discard_pending(session_id).await;
                return;
            }
        };
        let Some(session) = self.registry.take_pending(session_id).await else {
            warn!("register for session {} with no pending entry", session_id);
            return;
        };

        let coupled = {
            let mut guard = system.lock().await;
            match role {
                DeviceRole::Mount => guard.couple_mount(session),
                DeviceRole::Camera => {
                    let cid = cid.unwrap_or_default();
                    guard.couple_camera(&cid, session)
                }
                DeviceRole::Focus => guard.couple_focus(session),
            }
        };
        if coupled {
            info!("session {} coupled to {} as {:?}", session_id, id, role);
            self.db.report_link_state(&id, role_name(role), true).await;
        }
    }

    async fn handle_closed(&self, session_id: SessionId) {
        self.registry.discard_pending(session_id).await;
        let systems = self.systems.lock().await;
        for (id, system) in systems.iter() {
            let mut guard = system.lock().await;
            // Best-effort: each coupling method is idempotent, and the
            // system has no way to know which role this closed session
            // held without tracking it, so every decouple path is tried.
            // `ObservationSystem` only clears a slot if its own session id
            // matches, so this is safe to call speculatively.
            if let Some(role) = guard.decouple_if(session_id).await {
                drop(guard);
                self.db.report_link_state(id, role_name(role), false).await;
                self.wake_acquisition();
                break;
            }
        }
    }

    /// Updates rain readings and, on a clear transition during Flat/Night
    /// with a plan pending, opens the slit. There is deliberately no
    /// rain-triggered close path here: the source has this wired in some
    /// call sites and commented out in others, and the tested behaviour
    /// this daemon preserves never auto-closes on rain.
    async fn handle_rain(&self, value: i32) {
        let known = self.known_systems().await;
        let mut gids: Vec<String> = known.into_iter().map(|id| id.gid).collect();
        gids.sort();
        gids.dedup();
        for gid in gids {
            let (_previous, cleared) = self.environment.update_rain(&gid, value).await;
            self.db.report_rain(&gid, value).await;
            if cleared {
                info!("rain cleared for {}, re-evaluating slit", gid);
                self.maybe_command_slit(&gid).await;
            }
        }
    }

    async fn maybe_command_slit(&self, gid: &str) {
        let regime = self.clock.lock().await.regime_for(gid, Utc::now());
        if matches!(regime, Some(SkyRegime::Flat) | Some(SkyRegime::Night)) && self.plans.has_pending(gid).await {
            self.command_slit(gid, SlitCommand::Open).await;
        }
    }

    /// Forwards a client-issued slit command, dropping it
    /// if the slit is already in (or moving to) the requested state so a
    /// repeated client command doesn't burn a retry for nothing.
    async fn handle_client_slit_command(&self, gid: &str, command: SlitCommand) {
        let current = self.environment.snapshot(gid).await.and_then(|e| e.slit);
        let redundant = matches!(
            (command, current),
            (SlitCommand::Open, Some(SlitState::Open) | Some(SlitState::Opening))
                | (SlitCommand::Close, Some(SlitState::Closed) | Some(SlitState::Closing))
        );
        if redundant {
            return;
        }
        self.command_slit(gid, command).await;
    }

    async fn command_slit(&self, gid: &str, command: SlitCommand) {
        if !self.environment.record_retry(gid).await {
            warn!("slit command retries exhausted for {}, suppressing", gid);
            return;
        }
        let wire = annex::encode_slit_command(gid, command);
        if let Some(session) = self.annex_sessions.lock().await.get(gid) {
            if let Err(err) = session.send_line(&wire).await {
                warn!("failed to send slit command to {}: {}", gid, err);
            }
        }
    }

    // ---- clock events -------------------------------------------------

    async fn handle_clock_event(&self, event: ClockEvent) {
        match event {
            ClockEvent::RegimeEdge { gid, regime } => {
                let previous = self.environment.update_regime(&gid, regime).await;
                info!("{} regime {:?} -> {:?}", gid, previous, regime);
                match regime {
                    SkyRegime::Day => self.command_slit(&gid, SlitCommand::Close).await,
                    SkyRegime::Flat | SkyRegime::Night => {
                        let clear = self.environment.snapshot(&gid).await.map(|e| e.is_clear()).unwrap_or(false);
                        if clear && self.plans.has_pending(&gid).await {
                            self.command_slit(&gid, SlitCommand::Open).await;
                        }
                    }
                }
            }
            ClockEvent::DayAdvance => {
                let today = Utc::now().date_naive();
                let registered = self.known_systems().await;
                match self.plans.load_day(today, &registered).await {
                    Ok(count) => info!("advanced to {}, loaded {} plans", today, count),
                    Err(err) => warn!("failed to load plans for {}: {}", today, err),
                }
            }
        }
    }
}

fn role_name(role: DeviceRole) -> &'static str {
    match role {
        DeviceRole::Mount => "mount",
        DeviceRole::Camera => "camera",
        DeviceRole::Focus => "focus",
    }
}

/// Extracts the group a freshly-decoded annex record names, if any, so
/// the Coordinator can claim that session from the pending pool under
/// the group's identity the first time it hears from it.
fn annex_gid(record: &ProtocolRecord) -> Option<String> {
    match record {
        ProtocolRecord::Slit { gid, .. } => Some(gid.clone()),
        ProtocolRecord::FocusStatus { addr, .. } => Some(addr.gid.clone()),
        ProtocolRecord::Fwhm { gid, .. } => Some(gid.clone()),
        _ => None,
    }
}
