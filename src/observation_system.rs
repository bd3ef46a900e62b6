//! ObservationSystem: the per-group:unit state machine.
//!
//! Couples one mount, its cameras and an optional focuser behind a
//! single `Arc<Mutex<state>>` so concurrent callers share one system's
//! state safely. Every inbound event the Coordinator routes here is
//! handled under the system's own lock, which is what gives per-system
//! events their total order without a dedicated actor task per instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};
use rand::Rng;

use crate::clock::AstronomicalClock;
use crate::device::{CameraInfo, MountInfo};
use crate::error::DeviceError;
use crate::ids::SystemId;
use crate::net::{Session, SessionId};
use crate::notify::database::DbReporter;
use crate::plan::{ObservationPlan, PlanState, PlanStore};
use crate::protocol::ascii;
use crate::protocol::record::{CameraState, CoorSys, DeviceRole, ImageType, MountState};

/// Default grace period before an idle (all-devices-disconnected)
/// system is reclaimed by the Coordinator's prune sweep.
pub const DEFAULT_GRACE: StdDuration = StdDuration::from_secs(60);
/// Acquisition loop wake cadence.
pub const ACQUISITION_INTERVAL: StdDuration = StdDuration::from_secs(30);
/// Re-issue a park command only on every Nth sub-limit report
///.
const PARK_DEBOUNCE: u32 = 10;
/// Minimum time between flat-field reslews before reusing the last
/// orientation.
const FLAT_RESLEW_COOLDOWN: Duration = Duration::seconds(240);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObssState {
    Error,
    Manual,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Slewing,
    Exposing,
}

/// Mirrors `OBSSInfo`'s `exposing`/`waitflat`/`waitsync` counters and
/// their `enter_*`/`leave_*` transition predicates exactly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Counters {
    pub exposing: u32,
    pub wait_flat: u32,
    pub wait_sync: u32,
}

impl Counters {
    fn enter_exposing(&mut self) {
        self.exposing += 1;
    }

    /// Returns `true` once every exposing camera has left exposure.
    fn leave_exposing(&mut self) -> bool {
        if self.exposing > 0 {
            self.exposing -= 1;
        }
        self.exposing == 0
    }

    /// Returns `true` once every exposing camera has entered WaitFlat.
    fn enter_waitflat(&mut self) -> bool {
        self.wait_flat += 1;
        self.wait_flat == self.exposing
    }

    fn leave_waitflat(&mut self) -> bool {
        if self.wait_flat > 0 {
            self.wait_flat -= 1;
        }
        self.wait_flat == 0
    }

    /// Returns `true` once every exposing camera is in WaitFlat or
    /// WaitSync combined.
    fn enter_waitsync(&mut self) -> bool {
        self.wait_sync += 1;
        self.wait_sync + self.wait_flat == self.exposing
    }

    fn leave_waitsync(&mut self) -> bool {
        if self.wait_sync > 0 {
            self.wait_sync -= 1;
        }
        self.wait_flat == 0 && self.wait_sync == 0
    }
}

struct CameraSlot {
    info: CameraInfo,
    session: Option<Session>,
}

pub struct ObservationSystem {
    pub id: SystemId,
    pub automode: bool,
    pub state: ObssState,
    pub phase: Phase,
    counters: Counters,
    mount: MountInfo,
    mount_session: Option<Session>,
    cameras: HashMap<String, CameraSlot>,
    focus_session: Option<Session>,
    pub elevation_limit: f64,
    sublimit_hits: u32,
    pub current_plan: Option<ObservationPlan>,
    last_fwhm: HashMap<String, f64>,
    last_flat_slew: Option<DateTime<Utc>>,
    idle_since: Option<Instant>,
    plans: Arc<PlanStore>,
    db: Arc<dyn DbReporter>,
    clock: Arc<tokio::sync::Mutex<AstronomicalClock>>,
}

impl ObservationSystem {
    pub fn new(
        id: SystemId,
        elevation_limit: f64,
        plans: Arc<PlanStore>,
        db: Arc<dyn DbReporter>,
        clock: Arc<tokio::sync::Mutex<AstronomicalClock>>,
    ) -> Self {
        ObservationSystem {
            id,
            automode: true,
            state: ObssState::Error,
            phase: Phase::Idle,
            counters: Counters::default(),
            mount: MountInfo::new(),
            mount_session: None,
            cameras: HashMap::new(),
            focus_session: None,
            elevation_limit,
            sublimit_hits: 0,
            current_plan: None,
            last_fwhm: HashMap::new(),
            last_flat_slew: None,
            idle_since: None,
            plans,
            db,
            clock,
        }
    }

    fn has_mount(&self) -> bool {
        self.mount_session.is_some()
    }

    fn has_camera(&self) -> bool {
        self.cameras.values().any(|c| c.session.is_some())
    }

    fn any_device_coupled(&self) -> bool {
        self.has_mount() || self.has_camera() || self.focus_session.is_some()
    }

    fn recompute_state(&mut self) {
        self.state = if !self.any_device_coupled() {
            ObssState::Error
        } else if self.automode && self.has_mount() && self.has_camera() {
            ObssState::Auto
        } else if !self.automode && (self.has_mount() || self.has_camera()) {
            ObssState::Manual
        } else {
            ObssState::Error
        };

        if self.any_device_coupled() {
            self.idle_since = None;
        } else if self.idle_since.is_none() {
            self.idle_since = Some(Instant::now());
        }
    }

    /// Whether the Coordinator's 1-minute prune sweep should reclaim
    /// this system.
    pub fn is_alive(&self, grace: StdDuration) -> bool {
        match self.idle_since {
            None => true,
            Some(since) => since.elapsed() < grace,
        }
    }

    // ---- coupling -------------------------------------------------

    pub fn couple_mount(&mut self, session: Session) -> bool {
        if let Some(existing) = &self.mount_session {
            if existing.id == session.id {
                return true; // idempotent recoupling of the same session
            }
            warn!("{} already has a coupled mount session, rejecting new one", self.id);
            return false;
        }
        self.mount_session = Some(session);
        self.recompute_state();
        true
    }

    pub fn couple_camera(&mut self, cid: &str, session: Session) -> bool {
        if let Some(slot) = self.cameras.get(cid) {
            if let Some(existing) = &slot.session {
                if existing.id == session.id {
                    return true;
                }
                warn!("{} camera {} already coupled, rejecting new session", self.id, cid);
                return false;
            }
        }
        self.cameras
            .entry(cid.to_string())
            .or_insert_with(|| CameraSlot { info: CameraInfo::new(), session: None })
            .session = Some(session);
        self.recompute_state();
        true
    }

    pub fn couple_focus(&mut self, session: Session) -> bool {
        if let Some(existing) = &self.focus_session {
            if existing.id == session.id {
                return true;
            }
            warn!("{} already has a coupled focus session, rejecting new one", self.id);
            return false;
        }
        self.focus_session = Some(session);
        self.recompute_state();
        true
    }

    pub fn decouple_mount(&mut self) {
        self.mount_session = None;
        self.recompute_state();
    }

    pub fn decouple_camera(&mut self, cid: &str) {
        if let Some(slot) = self.cameras.get_mut(cid) {
            slot.session = None;
        }
        self.recompute_state();
    }

    pub fn decouple_focus(&mut self) {
        self.focus_session = None;
        self.recompute_state();
    }

    /// Clears whichever coupled slot (mount, any camera, focus) holds
    /// `session_id`, if any. Called speculatively for every system when
    /// a session closes, since the Coordinator doesn't track which
    /// system owns a given session id.
    ///
    /// Losing the mount or a camera mid-plan interrupts the plan with
    /// cause `Interrupted`; the system
    /// itself stays alive for the grace interval so a reconnect can
    /// still couple to it.
    pub async fn decouple_if(&mut self, session_id: SessionId) -> Option<DeviceRole> {
        if self.mount_session.as_ref().map(|s| s.id) == Some(session_id) {
            self.mount_session = None;
            self.recompute_state();
            self.interrupt_plan(PlanState::Interrupted).await;
            return Some(DeviceRole::Mount);
        }
        if self.focus_session.as_ref().map(|s| s.id) == Some(session_id) {
            self.focus_session = None;
            self.recompute_state();
            return Some(DeviceRole::Focus);
        }
        let cid = self
            .cameras
            .iter()
            .find(|(_, slot)| slot.session.as_ref().map(|s| s.id) == Some(session_id))
            .map(|(cid, _)| cid.clone());
        if let Some(cid) = cid {
            if let Some(slot) = self.cameras.get_mut(&cid) {
                slot.session = None;
            }
            self.recompute_state();
            self.interrupt_plan(PlanState::Interrupted).await;
            return Some(DeviceRole::Camera);
        }
        None
    }

    // ---- status intake ---------------------------------------------

    /// Applies a mount status report and returns the park command to
    /// issue, if the safety debounce says to issue one this time.
    pub async fn handle_mount_status(
        &mut self,
        state: MountState,
        errcode: i32,
        ra: f64,
        dec: f64,
        azi: f64,
        alt: f64,
    ) {
        let was_slewing = self.mount.slewing;
        let left_slewing = self.mount.state == MountState::Slewing
            && matches!(state, MountState::Tracking | MountState::Freeze);

        self.mount.state = state;
        self.mount.errcode = errcode;
        self.mount.ra = ra;
        self.mount.dec = dec;
        self.mount.azi = azi;
        self.mount.alt = alt;

        if was_slewing && left_slewing {
            self.mount.slewing = false;
            if self.mount.has_arrived() {
                self.on_arrival().await;
            } else {
                warn!("{} arrived off-target, interrupting plan", self.id);
                self.interrupt_plan(PlanState::Interrupted).await;
            }
        }

        if alt <= self.elevation_limit && state != MountState::Parking {
            self.sublimit_hits += 1;
            if self.sublimit_hits % PARK_DEBOUNCE == 1 {
                warn!(
                    "{} altitude {:.2} below limit {:.2}, issuing park",
                    self.id, alt, self.elevation_limit
                );
                self.send_mount("park").await;
            }
        } else {
            self.sublimit_hits = 0;
        }
    }

    async fn on_arrival(&mut self) {
        if self.phase == Phase::Slewing {
            self.phase = Phase::Exposing;
            self.begin_exposure().await;
        }
    }

    async fn begin_exposure(&mut self) {
        let Some(plan) = self.current_plan.clone() else { return };
        let cids: Vec<String> = self.cameras.keys().cloned().collect();
        for cid in cids {
            self.send_camera(
                &cid,
                &format!(
                    "take-image gid={},uid={},imgtype={},expdur={},framecnt={}",
                    self.id.gid,
                    self.id.uid,
                    image_type_name(plan.image_type),
                    plan.exp_dur,
                    plan.frame_count
                ),
            )
            .await;
        }
    }

    pub async fn handle_camera_status(&mut self, cid: &str, utc: String, state: CameraState, errcode: i32, cool_temp: f64, filter: String, seq: u32, filename: String) {
        let previous = self.cameras.get(cid).and_then(|c| c.info.state);

        let slot = self
            .cameras
            .entry(cid.to_string())
            .or_insert_with(|| CameraSlot { info: CameraInfo::new(), session: None });
        slot.info.utc = utc;
        slot.info.errcode = errcode;
        slot.info.cool_temp = cool_temp;
        slot.info.filter = filter;
        slot.info.seq = seq;
        slot.info.filename = filename;
        slot.info.state = Some(state);

        let prev_active = previous.map(is_active_camera_state).unwrap_or(false);
        let now_active = is_active_camera_state(state);

        if now_active && !prev_active {
            // Entering the active set from idle: always the start of a
            // fresh exposure, regardless of which active substate it lands in.
            self.counters.enter_exposing();
        } else if prev_active && !now_active {
            // Leaving the active set back to idle entirely.
            if self.counters.leave_exposing() && self.phase == Phase::Exposing {
                self.complete_exposure().await;
            }
        } else if previous != Some(state) {
            // Moving between active substates (Exposing/WaitSync/WaitFlat)
            // without crossing the idle boundary.
            if state == CameraState::WaitSync && self.counters.enter_waitsync() {
                self.run_flat_subroutine().await;
            } else if state == CameraState::WaitFlat && self.counters.enter_waitflat() {
                self.run_flat_subroutine().await;
            } else if previous == Some(CameraState::WaitSync) {
                self.counters.leave_waitsync();
            } else if previous == Some(CameraState::WaitFlat) {
                self.counters.leave_waitflat();
            }
        }
    }

    /// Records an annex `fwhm` report for one camera, keyed to whichever
    /// plan is currently running, and forwards it to the database
    ///. No astrometric use is
    /// made of the value here.
    pub async fn record_fwhm(&mut self, cid: &str, value: f64) {
        self.last_fwhm.insert(cid.to_string(), value);
        let plan_sn = self.current_plan.as_ref().map(|p| p.plan_sn.as_str());
        self.db.report_fwhm(&self.id, cid, plan_sn, value).await;
    }

    async fn complete_exposure(&mut self) {
        self.phase = Phase::Idle;
        if let Some(plan) = self.current_plan.take() {
            info!("{} completed plan {}", self.id, plan.plan_sn);
            self.plans.mark_terminal(&plan.plan_sn, PlanState::Over).await;
            self.db.report_plan_state(&plan.plan_sn, PlanState::Over).await;
        }
    }

    // ---- flat field subroutine -------------------------------------

    /// Reuses the last orientation inside the cooldown window when every
    /// exposing camera is already synced; otherwise picks a fresh random
    /// zenith position.
    async fn run_flat_subroutine(&mut self) {
        let now = Utc::now();
        let reuse = self
            .last_flat_slew
            .map(|last| now - last < FLAT_RESLEW_COOLDOWN)
            .unwrap_or(false)
            && self.counters.wait_sync == self.counters.exposing;

        if reuse {
            self.send_mount("expose-resume").await;
            return;
        }

        let before_noon = self.clock.lock().await.before_local_noon(&self.id.gid, now).unwrap_or(true);
        let mut rng = rand::rng();
        let azimuth = if before_noon {
            rng.random_range(180.0..270.0)
        } else {
            rng.random_range(0.0..90.0)
        };
        let altitude = rng.random_range(80.0..=85.0);

        self.mount.set_target(CoorSys::Horizontal, azimuth, altitude);
        self.phase = Phase::Slewing;
        self.last_flat_slew = Some(now);
        self.send_mount(&format!(
            "slew-to gid={},uid={},coorsys=horizontal,coor1={},coor2={}",
            self.id.gid, self.id.uid, azimuth, altitude
        ))
        .await;
        let cids: Vec<String> = self.cameras.keys().cloned().collect();
        for cid in cids {
            self.send_camera(
                &cid,
                &format!(
                    "slew-to gid={},uid={},coorsys=horizontal,coor1={},coor2={}",
                    self.id.gid, self.id.uid, azimuth, altitude
                ),
            )
            .await;
        }
    }

    // ---- plan lifecycle ----------------------------------------------

    /// Issues a slew to the mount's own current orientation before a
    /// real target slew, to work stiction loose after a long idle dwell
    ///. A no-op unless the
    /// mount is actually idle.
    async fn preslew_if_idle(&mut self) {
        if self.phase != Phase::Idle || !self.has_mount() {
            return;
        }
        let (coorsys, coor1, coor2) = match self.mount.state {
            MountState::Tracking | MountState::Freeze => (CoorSys::Equatorial, self.mount.ra, self.mount.dec),
            _ => (CoorSys::Horizontal, self.mount.azi, self.mount.alt),
        };
        self.send_mount(&format!(
            "slew-to gid={},uid={},coorsys={},coor1={},coor2={}",
            self.id.gid, self.id.uid, coorsys_name(coorsys), coor1, coor2
        ))
        .await;
    }

    /// Dispatches a newly-selected plan: pre-slews to cancel stiction,
    /// records the plan, slews the mount to target, and raises
    /// `slewing`.
    pub async fn run_plan(&mut self, plan: ObservationPlan) {
        self.preslew_if_idle().await;
        self.mount
            .set_target(plan.coorsys, plan.coor1, plan.coor2);
        self.phase = Phase::Slewing;
        self.current_plan = Some(plan.clone());
        let wire = ascii::encode(&crate::protocol::record::ProtocolRecord::SlewTo {
            addr: crate::protocol::record::Addr::new(&self.id.gid, &self.id.uid),
            coorsys: plan.coorsys,
            coor1: plan.coor1,
            coor2: plan.coor2,
        });
        self.send_mount(&wire).await;
    }

    /// `take-image` while a plan is running is rejected.
    pub fn can_accept_manual_take_image(&self) -> bool {
        self.current_plan.is_none()
    }

    pub async fn manual_take_image(&mut self, image_type: ImageType, coorsys: CoorSys, coor1: f64, coor2: f64, exp_dur: f64, frame_count: u32) {
        let now = Utc::now();
        let plan = ObservationPlan {
            gid: self.id.gid.clone(),
            uid: self.id.uid.clone(),
            plan_sn: "manual".to_string(),
            plan_type: crate::plan::PlanType::Manual,
            object_name: String::new(),
            btime: now,
            etime: now + Duration::hours(1),
            image_type,
            coorsys,
            coor1,
            coor2,
            line1: None,
            line2: None,
            exp_dur,
            frame_count,
            state: PlanState::Run,
        };
        self.current_plan = Some(plan);
        if image_type == ImageType::Flat {
            self.run_flat_subroutine().await;
        } else {
            self.mount.set_target(coorsys, coor1, coor2);
            self.phase = Phase::Slewing;
            self.send_mount(&format!(
                "slew-to gid={},uid={},coorsys={},coor1={},coor2={}",
                self.id.gid, self.id.uid, coorsys_name(coorsys), coor1, coor2
            ))
            .await;
        }
    }

    /// Forces the current plan to a terminal state, stops every camera,
    /// and clears the selection so the acquisition loop can pick a new
    /// plan on its next tick.
    pub async fn interrupt_plan(&mut self, terminal: PlanState) {
        if let Some(plan) = self.current_plan.take() {
            self.phase = Phase::Idle;
            let cids: Vec<String> = self.cameras.keys().cloned().collect();
            for cid in cids {
                self.send_camera(&cid, "expose-stop").await;
            }
            self.plans.mark_terminal(&plan.plan_sn, terminal).await;
            self.db.report_plan_state(&plan.plan_sn, terminal).await;
        }
    }

    // ---- manual commands ----

    /// `slew` is rejected while `automode` is active and a plan is
    /// running.
    pub fn can_accept_manual_slew(&self) -> bool {
        !(self.automode && self.current_plan.is_some())
    }

    pub async fn manual_slew(&mut self, coorsys: CoorSys, coor1: f64, coor2: f64) {
        self.mount.set_target(coorsys, coor1, coor2);
        self.phase = Phase::Slewing;
        self.send_mount(&format!(
            "slew-to gid={},uid={},coorsys={},coor1={},coor2={}",
            self.id.gid, self.id.uid, coorsys_name(coorsys), coor1, coor2
        ))
        .await;
    }

    pub async fn manual_track(&mut self, objname: &str, line1: &str, line2: &str) {
        self.mount.set_target(CoorSys::GuideTle, 0.0, 0.0);
        self.phase = Phase::Slewing;
        self.send_mount(&format!(
            "track gid={},uid={},objname={},line1={},line2={}",
            self.id.gid, self.id.uid, objname, line1, line2
        ))
        .await;
    }

    /// `home-sync` re-zeroes the mount's target to its current actual
    /// position and is rejected unless the mount is tracking
    ///.
    pub fn can_home_sync(&self) -> bool {
        self.mount.state == MountState::Tracking
    }

    pub async fn home_sync(&mut self) {
        if !self.can_home_sync() {
            warn!("{} {}", self.id, DeviceError::InvalidCommand("home-sync while mount not tracking".to_string()));
            return;
        }
        self.mount.actual_to_object();
        self.send_mount(&format!("home-sync gid={},uid={}", self.id.gid, self.id.uid)).await;
    }

    pub async fn manual_park(&mut self) {
        self.send_mount(&format!("park gid={},uid={}", self.id.gid, self.id.uid)).await;
    }

    pub fn can_abort_slew(&self) -> bool {
        self.phase == Phase::Slewing
    }

    pub async fn abort_slew(&mut self) {
        if !self.can_abort_slew() {
            warn!("{} {}", self.id, DeviceError::InvalidCommand("abort-slew while not slewing".to_string()));
            return;
        }
        self.mount.slewing = false;
        self.phase = Phase::Idle;
        self.send_mount(&format!("abort-slew gid={},uid={}", self.id.gid, self.id.uid)).await;
    }

    pub fn can_abort_image(&self) -> bool {
        self.counters.exposing > 0
    }

    pub async fn abort_image(&mut self) {
        if !self.can_abort_image() {
            warn!("{} {}", self.id, DeviceError::InvalidCommand("abort-image while no camera exposing".to_string()));
            return;
        }
        let cids: Vec<String> = self.cameras.keys().cloned().collect();
        for cid in cids {
            self.send_camera(&cid, "expose-stop").await;
        }
    }

    pub async fn enable(&mut self, cid: Option<&str>) {
        match cid {
            Some(cid) => self.send_camera(cid, &format!("enable gid={},uid={}", self.id.gid, self.id.uid)).await,
            None => {
                let cids: Vec<String> = self.cameras.keys().cloned().collect();
                for cid in cids {
                    self.send_camera(&cid, &format!("enable gid={},uid={}", self.id.gid, self.id.uid)).await;
                }
            }
        }
    }

    pub async fn disable(&mut self, cid: Option<&str>) {
        match cid {
            Some(cid) => self.send_camera(cid, &format!("disable gid={},uid={}", self.id.gid, self.id.uid)).await,
            None => {
                let cids: Vec<String> = self.cameras.keys().cloned().collect();
                for cid in cids {
                    self.send_camera(&cid, &format!("disable gid={},uid={}", self.id.gid, self.id.uid)).await;
                }
            }
        }
    }

    /// `guide`'s exact semantics are ambiguous in the source (delta
    /// correction vs. absolute home-sync); this is a pass-through the
    /// mount driver interprets.
    pub async fn guide(&mut self, delta1: f64, delta2: f64) {
        self.send_mount(&format!(
            "guide gid={},uid={},delta1={},delta2={}",
            self.id.gid, self.id.uid, delta1, delta2
        ))
        .await;
    }

    pub async fn mirror_cover(&mut self, open: bool) {
        self.send_mount(&format!(
            "mirror-cover gid={},uid={},open={}",
            self.id.gid,
            self.id.uid,
            if open { 1 } else { 0 }
        ))
        .await;
    }

    /// Posts a mount/camera state snapshot to the database reporter, on
    /// the Coordinator's 5 s per-group cadence.
    pub async fn report_status(&self) {
        self.db.report_mount_status(&self.id, &self.mount).await;
        for (cid, slot) in &self.cameras {
            self.db.report_camera_status(&self.id, cid, &slot.info).await;
        }
    }

    // ---- outbound -----------------------------------------------------

    async fn send_mount(&self, line: &str) {
        let Some(session) = &self.mount_session else {
            warn!("{} {}", self.id, DeviceError::NotCoupled);
            return;
        };
        if let Err(err) = session.send_line(line).await {
            warn!("{} {}", self.id, DeviceError::SessionClosed(err.to_string()));
        }
    }

    async fn send_camera(&self, cid: &str, line: &str) {
        let Some(session) = self.cameras.get(cid).and_then(|slot| slot.session.as_ref()) else {
            warn!("{} camera {} {}", self.id, cid, DeviceError::NotCoupled);
            return;
        };
        if let Err(err) = session.send_line(line).await {
            warn!("{} camera {} {}", self.id, cid, DeviceError::SessionClosed(err.to_string()));
        }
    }

    pub async fn enable_automode(&mut self) {
        self.automode = true;
        self.recompute_state();
    }

    pub async fn disable_automode(&mut self) {
        self.automode = false;
        self.recompute_state();
    }

    pub fn mount_state(&self) -> MountState {
        self.mount.state
    }
}

/// The camera states counted in `exposing`/`waitflat`/`waitsync`: a
/// camera actively running an exposure, as opposed to Idle/Paused/Other.
/// Mirrors the original's `CAMCTL_IDLE` threshold, above which a state
/// counts as part of the active exposure flow.
fn is_active_camera_state(state: CameraState) -> bool {
    matches!(state, CameraState::Exposing | CameraState::WaitSync | CameraState::WaitFlat)
}

fn image_type_name(t: ImageType) -> &'static str {
    match t {
        ImageType::Bias => "bias",
        ImageType::Dark => "dark",
        ImageType::Flat => "flat",
        ImageType::Object => "object",
        ImageType::Focus => "focus",
    }
}

fn coorsys_name(c: CoorSys) -> &'static str {
    match c {
        CoorSys::Equatorial => "equatorial",
        CoorSys::Horizontal => "horizontal",
        CoorSys::GuideTle => "guidetle",
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn system() -> ObservationSystem {
        let plans = Arc::new(PlanStore::new(std::path::PathBuf::from("/nonexistent")));
        let db: Arc<dyn DbReporter> = Arc::new(crate::notify::database::NullDbReporter);
        let clock = Arc::new(tokio::sync::Mutex::new(AstronomicalClock::new(HashMap::new())));
        ObservationSystem::new(SystemId::new("G1", "U1"), 20.0, plans, db, clock)
    }

    #[test]
    fn state_is_error_with_no_devices() {
        let sys = system();
        assert_eq!(sys.state, ObssState::Error);
    }

    #[test]
    fn counters_track_exposing_completion() {
        let mut c = Counters::default();
        c.enter_exposing();
        c.enter_exposing();
        assert!(!c.leave_exposing());
        assert!(c.leave_exposing());
    }

    #[test]
    fn counters_waitflat_all_cameras() {
        let mut c = Counters::default();
        c.enter_exposing();
        c.enter_exposing();
        assert!(!c.enter_waitflat());
        assert!(c.enter_waitflat());
    }

    #[test]
    fn counters_waitsync_accounts_for_waitflat() {
        let mut c = Counters::default();
        c.exposing = 2;
        c.wait_flat = 1;
        assert!(c.enter_waitsync());
    }

    #[test]
    fn manual_take_image_rejected_while_plan_running() {
        let mut sys = system();
        assert!(sys.can_accept_manual_take_image());
        sys.current_plan = Some(ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN".into(),
            plan_type: crate::plan::PlanType::Point,
            object_name: String::new(),
            btime: Utc::now(),
            etime: Utc::now() + Duration::hours(1),
            image_type: ImageType::Object,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 1,
            state: PlanState::Run,
        });
        assert!(!sys.can_accept_manual_take_image());
    }

    fn flat_plan() -> ObservationPlan {
        ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN-FLAT".into(),
            plan_type: crate::plan::PlanType::Point,
            object_name: String::new(),
            btime: Utc::now(),
            etime: Utc::now() + Duration::hours(1),
            image_type: ImageType::Flat,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 20,
            state: PlanState::Run,
        }
    }

    /// Regression for the bug where `Exposing -> WaitFlat` zeroed
    /// `exposing` and completed the plan instead of running the
    /// flat-field subroutine.
    #[tokio::test]
    async fn entering_waitflat_does_not_complete_the_plan() {
        let mut sys = system();
        sys.phase = Phase::Exposing;
        sys.current_plan = Some(flat_plan());

        sys.handle_camera_status("C1".into(), "t".into(), CameraState::Exposing, 0, -20.0, "V".into(), 1, String::new()).await;
        assert_eq!(sys.counters.exposing, 1);

        sys.handle_camera_status("C1".into(), "t".into(), CameraState::WaitFlat, 0, -20.0, "V".into(), 1, String::new()).await;

        assert_eq!(sys.counters.exposing, 1, "exposing must not be zeroed by a WaitFlat transition");
        assert!(sys.current_plan.is_some(), "plan must not complete when a camera enters WaitFlat");
        assert_eq!(sys.phase, Phase::Slewing, "the flat subroutine should have issued a reslew");
    }

    /// A camera leaving the active set back to Idle still completes the
    /// plan once every exposing camera has done so.
    #[tokio::test]
    async fn leaving_active_set_to_idle_completes_the_plan() {
        let mut sys = system();
        sys.phase = Phase::Exposing;
        sys.current_plan = Some({
            let mut p = flat_plan();
            p.image_type = ImageType::Object;
            p
        });

        sys.handle_camera_status("C1".into(), "t".into(), CameraState::Exposing, 0, -20.0, "V".into(), 1, String::new()).await;
        assert_eq!(sys.counters.exposing, 1);

        sys.handle_camera_status("C1".into(), "t".into(), CameraState::Idle, 0, -20.0, "V".into(), 2, String::new()).await;

        assert_eq!(sys.counters.exposing, 0);
        assert!(sys.current_plan.is_none(), "plan should complete once the last camera returns to idle");
    }
}
