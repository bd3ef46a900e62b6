//! ObservationPlan and PlanStore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration as TokioDuration};

use crate::clock::SkyRegime;
use crate::ids::SystemId;
use crate::protocol::record::{CoorSys, ImageType, SlitState};

/// Plan sweep cadence.
pub const SWEEP_INTERVAL: TokioDuration = TokioDuration::from_secs(10 * 60);
/// Grace window past `etime` before a still-`Cataloged` plan is abandoned.
const ABANDON_GRACE: Duration = Duration::seconds(20);
/// A plan's execution window opens this long before `btime`.
const ACQUIRE_LOOKAHEAD: Duration = Duration::seconds(60);
/// A plan must still have at least this much time left before `etime`.
const ACQUIRE_MIN_REMAINING: Duration = Duration::seconds(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanType {
    Track,
    Point,
    Manual,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanState {
    Cataloged,
    Wait,
    Run,
    Over,
    Interrupted,
    Delete,
    Abandon,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPlan {
    pub gid: String,
    pub uid: String,
    pub plan_sn: String,
    pub plan_type: PlanType,
    pub object_name: String,
    pub btime: DateTime<Utc>,
    pub etime: DateTime<Utc>,
    pub image_type: ImageType,
    pub coorsys: CoorSys,
    pub coor1: f64,
    pub coor2: f64,
    pub line1: Option<String>,
    pub line2: Option<String>,
    pub exp_dur: f64,
    pub frame_count: u32,
    pub state: PlanState,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlanParseError {
    #[error("line has too few fields")]
    Truncated,
    #[error("unrecognised mode '{0}'")]
    UnknownMode(String),
    #[error("invalid timestamp: {0}")]
    BadTimestamp(String),
    #[error("invalid numeric field '{field}': '{value}'")]
    BadNumber { field: &'static str, value: String },
    #[error("MODE1 track plan is missing its TLE line markers")]
    MissingTleMarkers,
}

fn parse_ymdhms(ymd: &str, hms: &str) -> Result<DateTime<Utc>, PlanParseError> {
    let stamp = format!("{}{}", ymd, hms);
    let naive = NaiveDateTime::parse_from_str(&stamp, "%Y%m%d%H%M%S")
        .map_err(|_| PlanParseError::BadTimestamp(stamp))?;
    Ok(DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn parse_f64(field: &'static str, value: &str) -> Result<f64, PlanParseError> {
    value
        .parse()
        .map_err(|_| PlanParseError::BadNumber { field, value: value.to_string() })
}

fn parse_u32(field: &'static str, value: &str) -> Result<u32, PlanParseError> {
    value
        .parse()
        .map_err(|_| PlanParseError::BadNumber { field, value: value.to_string() })
}

fn parse_coorsys(value: &str) -> Result<CoorSys, PlanParseError> {
    Ok(match value.to_ascii_lowercase().as_str() {
        "equatorial" => CoorSys::Equatorial,
        "horizontal" => CoorSys::Horizontal,
        "guidetle" => CoorSys::GuideTle,
        other => {
            return Err(PlanParseError::BadNumber {
                field: "coorsys",
                value: other.to_string(),
            });
        }
    })
}

/// Parses one plan-file line. File-loaded plans carry no
/// explicit imageType token in the grammar, so they are always treated
/// as science pointings (`ImageType::Object`); calibration frames come
/// only from `PlanStore`'s auto-generated Flat plans and from manual
/// take-image requests — see DESIGN.md.
pub fn parse_plan_line(line: &str) -> Result<ObservationPlan, PlanParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 8 {
        return Err(PlanParseError::Truncated);
    }
    let gid = tokens[0].to_string();
    let uid = tokens[1].to_string();
    let plan_sn = tokens[2].to_string();
    let mode = tokens[3];
    let btime = parse_ymdhms(tokens[4], tokens[5])?;
    let etime = parse_ymdhms(tokens[6], tokens[7])?;
    let rest = &tokens[8..];

    match mode {
        "MODE1" => {
            if rest.len() < 4 {
                return Err(PlanParseError::Truncated);
            }
            let object_name = rest[0].to_string();
            let exp_dur = parse_f64("expDur", rest[1])?;
            let marker1 = rest.iter().position(|t| *t == "1").ok_or(PlanParseError::MissingTleMarkers)?;
            let marker2 = rest[marker1 + 1..]
                .iter()
                .position(|t| *t == "2")
                .map(|p| p + marker1 + 1)
                .ok_or(PlanParseError::MissingTleMarkers)?;
            let line1 = rest[marker1..marker2].join(" ");
            let line2 = rest[marker2..].join(" ");
            Ok(ObservationPlan {
                gid,
                uid,
                plan_sn,
                plan_type: PlanType::Track,
                object_name,
                btime,
                etime,
                image_type: ImageType::Object,
                coorsys: CoorSys::GuideTle,
                coor1: 0.0,
                coor2: 0.0,
                line1: Some(line1),
                line2: Some(line2),
                exp_dur,
                frame_count: 1,
                state: PlanState::Cataloged,
            })
        }
        "MODE2" | "MODE3" => {
            if rest.len() < 4 {
                return Err(PlanParseError::Truncated);
            }
            let coorsys = parse_coorsys(rest[0])?;
            let coor1 = parse_f64("coor1", rest[1])?;
            let coor2 = parse_f64("coor2", rest[2])?;
            let exp_dur = parse_f64("expDur", rest[3])?;
            let frame_count = if mode == "MODE3" {
                if rest.len() < 8 {
                    return Err(PlanParseError::Truncated);
                }
                // Two (frameCount, expDur) validation pairs follow; only
                // the first frameCount is kept, the rest is parsed purely
                // to catch malformed files.
                let frame_count = parse_u32("frameCount", rest[4])?;
                let _ = parse_f64("expDur2", rest[5])?;
                let _ = parse_u32("frameCount2", rest[6])?;
                let _ = parse_f64("expDur3", rest[7])?;
                frame_count
            } else {
                1
            };
            Ok(ObservationPlan {
                gid,
                uid,
                plan_sn,
                plan_type: PlanType::Point,
                object_name: String::new(),
                btime,
                etime,
                image_type: ImageType::Object,
                coorsys,
                coor1,
                coor2,
                line1: None,
                line2: None,
                exp_dur,
                frame_count,
                state: PlanState::Cataloged,
            })
        }
        other => Err(PlanParseError::UnknownMode(other.to_string())),
    }
}

fn image_type_allowed(regime: SkyRegime, image_type: ImageType) -> bool {
    match regime {
        SkyRegime::Day => image_type != ImageType::Flat && image_type != ImageType::Object,
        SkyRegime::Flat => image_type == ImageType::Flat,
        SkyRegime::Night => image_type >= ImageType::Object,
    }
}

fn slit_regime_compatible(regime: SkyRegime, slit: SlitState) -> bool {
    match regime {
        SkyRegime::Day => slit == SlitState::Closed,
        SkyRegime::Flat | SkyRegime::Night => true,
    }
}

/// Holds every plan for the current UTC day and implements selection
///. The plan vector is guarded by a single lock; the
/// scan in `acquire` holds it for its whole, `O(|plans|)` duration.
pub struct PlanStore {
    plan_root: PathBuf,
    plans: Mutex<Vec<ObservationPlan>>,
}

impl PlanStore {
    pub fn new(plan_root: PathBuf) -> Self {
        PlanStore {
            plan_root,
            plans: Mutex::new(Vec::new()),
        }
    }

    /// Scans `<planRoot>/<YYYYMMDD>/`, parses every file, appends one
    /// synthetic Flat calibration plan per currently-registered system,
    /// and sorts the result by `btime`.
    pub async fn load_day(&self, date: NaiveDate, registered: &[SystemId]) -> std::io::Result<usize> {
        let dir = self.plan_root.join(date.format("%Y%m%d").to_string());
        let mut loaded = Vec::new();

        if dir.is_dir() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !path.is_file() {
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(contents) => loaded.extend(parse_plan_file(&path, &contents)),
                    Err(err) => warn!("failed to read plan file {}: {}", path.display(), err),
                }
            }
        } else {
            warn!("plan directory {} does not exist, no plans loaded", dir.display());
        }

        let now = Utc::now();
        for system in registered {
            loaded.push(ObservationPlan {
                gid: system.gid.clone(),
                uid: system.uid.clone(),
                plan_sn: format!("cal-flat-{}-{}", system, now.format("%Y%m%dT%H%M%S")),
                plan_type: PlanType::Manual,
                object_name: "flat".to_string(),
                btime: now,
                etime: now + Duration::hours(20),
                image_type: ImageType::Flat,
                coorsys: CoorSys::Horizontal,
                coor1: 0.0,
                coor2: 0.0,
                line1: None,
                line2: None,
                exp_dur: 5.0,
                frame_count: 20,
                state: PlanState::Cataloged,
            });
        }

        loaded.sort_by_key(|p| p.btime);
        let count = loaded.len();
        *self.plans.lock().await = loaded;
        info!("loaded {} plans for {}", count, date);
        Ok(count)
    }

    /// `AcquireNewPlan(gid, uid)`: the Coordinator invokes this from an
    /// `ObservationSystem`'s acquisition loop. Returns a snapshot of the
    /// selected plan, already transitioned `Cataloged → Wait`.
    pub async fn acquire(
        &self,
        system: &SystemId,
        regime: Option<SkyRegime>,
        slit: Option<SlitState>,
        now: DateTime<Utc>,
    ) -> Option<ObservationPlan> {
        let (regime, slit) = match (regime, slit) {
            (Some(r), Some(s)) => (r, s),
            _ => return None,
        };
        if !slit_regime_compatible(regime, slit) {
            return None;
        }

        let mut plans = self.plans.lock().await;
        let selected = plans.iter_mut().find(|p| {
            p.state == PlanState::Cataloged
                && system.matches(&p.gid, &p.uid).matches()
                && image_type_allowed(regime, p.image_type)
                && (p.image_type <= ImageType::Dark
                    || (p.btime - now <= ACQUIRE_LOOKAHEAD && p.etime - now >= ACQUIRE_MIN_REMAINING))
        })?;
        selected.state = PlanState::Wait;
        Some(selected.clone())
    }

    pub async fn mark_run(&self, plan_sn: &str) {
        self.set_state(plan_sn, PlanState::Run).await;
    }

    pub async fn mark_terminal(&self, plan_sn: &str, state: PlanState) {
        self.set_state(plan_sn, state).await;
    }

    async fn set_state(&self, plan_sn: &str, state: PlanState) {
        let mut plans = self.plans.lock().await;
        if let Some(plan) = plans.iter_mut().find(|p| p.plan_sn == plan_sn) {
            plan.state = state;
        }
    }

    /// Removes terminal plans and abandons `Cataloged` plans whose
    /// window has all but closed. Returns the plan_sns
    /// abandoned this sweep, for the database reporter to notify.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut plans = self.plans.lock().await;
        let mut abandoned = Vec::new();

        for plan in plans.iter_mut() {
            if plan.state == PlanState::Cataloged && plan.etime - now < ABANDON_GRACE {
                plan.state = PlanState::Abandon;
                abandoned.push(plan.plan_sn.clone());
                warn!("plan {} abandoned: window closed before selection", plan.plan_sn);
            }
        }

        plans.retain(|p| {
            !matches!(
                p.state,
                PlanState::Over | PlanState::Interrupted | PlanState::Delete | PlanState::Abandon
            )
        });

        abandoned
    }

    pub async fn snapshot(&self) -> Vec<ObservationPlan> {
        self.plans.lock().await.clone()
    }

    /// Whether any `Cataloged` plan for `gid` is still awaiting selection.
    /// Used by the Coordinator to gate an open-slit command on there
    /// being something to observe.
    pub async fn has_pending(&self, gid: &str) -> bool {
        self.plans
            .lock()
            .await
            .iter()
            .any(|p| p.state == PlanState::Cataloged && (p.gid == gid || p.gid.is_empty()))
    }
}

fn parse_plan_file(path: &Path, contents: &str) -> Vec<ObservationPlan> {
    let mut plans = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_plan_line(line) {
            Ok(plan) => plans.push(plan),
            Err(err) => warn!(
                "skipping malformed plan line {}:{}: {}",
                path.display(),
                lineno + 1,
                err
            ),
        }
    }
    plans
}

/// Spawns the 10-minute plan sweep task.
pub fn spawn_sweep(store: Arc<PlanStore>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            sleep(SWEEP_INTERVAL).await;
            let abandoned = store.sweep(Utc::now()).await;
            for plan_sn in abandoned {
                info!("swept abandoned plan {}", plan_sn);
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_mode2_point_plan() {
        let line = "G1 U1 SN001 MODE2 20260727 100000 20260727 120000 equatorial 120.0 30.0 5.0";
        let plan = parse_plan_line(line).unwrap();
        assert_eq!(plan.plan_type, PlanType::Point);
        assert_eq!(plan.coor1, 120.0);
        assert_eq!(plan.frame_count, 1);
    }

    #[test]
    fn parses_mode1_track_plan_with_tle_markers() {
        let line = "G1 U1 SN002 MODE1 20260727 100000 20260727 120000 SAT1 3.0 1 25544U 98067A 2 25544 51.6 247.4";
        let plan = parse_plan_line(line).unwrap();
        assert_eq!(plan.plan_type, PlanType::Track);
        assert!(plan.line1.as_deref().unwrap().starts_with('1'));
        assert!(plan.line2.as_deref().unwrap().starts_with('2'));
    }

    #[test]
    fn parses_mode3_with_validation_pairs() {
        let line = "G1 U1 SN003 MODE3 20260727 100000 20260727 120000 horizontal 10.0 80.0 5.0 20 5.0 20 5.0";
        let plan = parse_plan_line(line).unwrap();
        assert_eq!(plan.frame_count, 20);
    }

    #[test]
    fn truncated_line_is_rejected() {
        assert_eq!(parse_plan_line("G1 U1 SN004 MODE2"), Err(PlanParseError::Truncated));
    }

    #[test]
    fn unknown_mode_is_rejected() {
        let line = "G1 U1 SN005 MODE9 20260727 100000 20260727 120000";
        assert!(matches!(parse_plan_line(line), Err(PlanParseError::UnknownMode(_))));
    }

    #[tokio::test]
    async fn acquire_rejects_when_slit_regime_incompatible() {
        let store = PlanStore::new(PathBuf::from("/nonexistent"));
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 10, 0, 0).unwrap();
        *store.plans.lock().await = vec![ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN1".into(),
            plan_type: PlanType::Point,
            object_name: String::new(),
            btime: now,
            etime: now + Duration::hours(1),
            image_type: ImageType::Object,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 1,
            state: PlanState::Cataloged,
        }];
        let system = SystemId::new("G1", "U1");
        // Day regime with slit open is incompatible.
        let result = store
            .acquire(&system, Some(SkyRegime::Day), Some(SlitState::Open), now)
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn acquire_selects_eligible_plan_and_transitions_to_wait() {
        let store = PlanStore::new(PathBuf::from("/nonexistent"));
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 22, 0, 0).unwrap();
        *store.plans.lock().await = vec![ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN2".into(),
            plan_type: PlanType::Point,
            object_name: String::new(),
            btime: now,
            etime: now + Duration::hours(1),
            image_type: ImageType::Object,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 1,
            state: PlanState::Cataloged,
        }];
        let system = SystemId::new("G1", "U1");
        let result = store
            .acquire(&system, Some(SkyRegime::Night), Some(SlitState::Open), now)
            .await;
        assert!(result.is_some());
        assert_eq!(store.plans.lock().await[0].state, PlanState::Wait);
    }

    #[tokio::test]
    async fn has_pending_true_only_for_cataloged_plans_in_group() {
        let store = PlanStore::new(PathBuf::from("/nonexistent"));
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 22, 0, 0).unwrap();
        *store.plans.lock().await = vec![ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN3".into(),
            plan_type: PlanType::Point,
            object_name: String::new(),
            btime: now,
            etime: now + Duration::hours(1),
            image_type: ImageType::Object,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 1,
            state: PlanState::Cataloged,
        }];
        assert!(store.has_pending("G1").await);
        assert!(!store.has_pending("G2").await);
        store.plans.lock().await[0].state = PlanState::Over;
        assert!(!store.has_pending("G1").await);
    }

    #[tokio::test]
    async fn sweep_abandons_plans_past_deadline() {
        let store = PlanStore::new(PathBuf::from("/nonexistent"));
        let now = Utc.with_ymd_and_hms(2026, 7, 27, 22, 0, 0).unwrap();
        *store.plans.lock().await = vec![ObservationPlan {
            gid: "G1".into(),
            uid: "U1".into(),
            plan_sn: "SN3".into(),
            plan_type: PlanType::Point,
            object_name: String::new(),
            btime: now - Duration::hours(2),
            etime: now - Duration::seconds(1),
            image_type: ImageType::Object,
            coorsys: CoorSys::Horizontal,
            coor1: 0.0,
            coor2: 0.0,
            line1: None,
            line2: None,
            exp_dur: 5.0,
            frame_count: 1,
            state: PlanState::Cataloged,
        }];
        let abandoned = store.sweep(now).await;
        assert_eq!(abandoned, vec!["SN3".to_string()]);
        assert!(store.plans.lock().await.is_empty());
    }
}
