//! Fire-and-forget reporting of plan-state transitions to an external
//! database service: a small `async_trait` trait with a concrete HTTP
//! implementation and a no-op stand-in for configurations (and tests)
//! that don't have a database to talk to.

use async_trait::async_trait;
use log::warn;
use serde::Serialize;

use crate::device::{CameraInfo, MountInfo};
use crate::ids::SystemId;
use crate::plan::PlanState;
use crate::protocol::record::SlitState;

#[async_trait]
pub trait DbReporter: Send + Sync {
    async fn report_plan_state(&self, plan_sn: &str, state: PlanState);

    /// Mount/camera link-state change on coupling or disconnect
    ///.
    async fn report_link_state(&self, id: &SystemId, role: &str, connected: bool);

    /// Current mount state snapshot, posted on the Coordinator's 5 s
    /// per-group cadence.
    async fn report_mount_status(&self, id: &SystemId, mount: &MountInfo);

    /// Current camera state snapshot, same cadence as the mount report.
    async fn report_camera_status(&self, id: &SystemId, cid: &str, camera: &CameraInfo);

    async fn report_rain(&self, gid: &str, value: i32);

    async fn report_slit(&self, gid: &str, state: SlitState);

    /// FWHM (pixels, not hundredths) for a camera, keyed to the plan it
    /// was measured against. No
    /// astrometric use is made of the value here, it is purely relayed.
    async fn report_fwhm(&self, id: &SystemId, cid: &str, plan_sn: Option<&str>, value: f64);
}

#[derive(Serialize)]
struct PlanStateReport<'a> {
    plan_sn: &'a str,
    state: &'static str,
}

#[derive(Serialize)]
struct LinkStateReport<'a> {
    gid: &'a str,
    uid: &'a str,
    role: &'a str,
    connected: bool,
}

#[derive(Serialize)]
struct MountStatusReport<'a> {
    gid: &'a str,
    uid: &'a str,
    state: &'static str,
    errcode: i32,
    ra: f64,
    dec: f64,
    azi: f64,
    alt: f64,
}

#[derive(Serialize)]
struct CameraStatusReport<'a> {
    gid: &'a str,
    uid: &'a str,
    cid: &'a str,
    state: &'static str,
    errcode: i32,
    cool_temp: f64,
    filter: &'a str,
    seq: u32,
    filename: &'a str,
}

#[derive(Serialize)]
struct RainReport<'a> {
    gid: &'a str,
    value: i32,
}

#[derive(Serialize)]
struct SlitReport<'a> {
    gid: &'a str,
    state: &'static str,
}

#[derive(Serialize)]
struct FwhmReport<'a> {
    gid: &'a str,
    uid: &'a str,
    cid: &'a str,
    plan_sn: Option<&'a str>,
    value: f64,
}

fn state_name(state: PlanState) -> &'static str {
    match state {
        PlanState::Cataloged => "cataloged",
        PlanState::Wait => "wait",
        PlanState::Run => "run",
        PlanState::Over => "over",
        PlanState::Interrupted => "interrupted",
        PlanState::Delete => "delete",
        PlanState::Abandon => "abandon",
    }
}

fn mount_state_name(state: crate::protocol::record::MountState) -> &'static str {
    use crate::protocol::record::MountState::*;
    match state {
        Error => "error",
        Freeze => "freeze",
        Parking => "parking",
        Parked => "parked",
        Slewing => "slewing",
        Tracking => "tracking",
    }
}

fn camera_state_name(state: Option<crate::protocol::record::CameraState>) -> &'static str {
    use crate::protocol::record::CameraState::*;
    match state {
        None => "unknown",
        Some(Idle) => "idle",
        Some(Exposing) => "exposing",
        Some(WaitSync) => "waitsync",
        Some(WaitFlat) => "waitflat",
        Some(Paused) => "paused",
        Some(Other) => "other",
    }
}

fn slit_state_name(state: SlitState) -> &'static str {
    match state {
        SlitState::Unknown => "unknown",
        SlitState::Error => "error",
        SlitState::Opening => "opening",
        SlitState::Open => "open",
        SlitState::Closing => "closing",
        SlitState::Closed => "closed",
        SlitState::Freeze => "freeze",
    }
}

/// Posts each transition to `<base_url>/plans/<plan_sn>/state` as JSON.
/// Failures are logged and otherwise swallowed — a database outage must
/// never stall plan execution.
pub struct HttpDbReporter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDbReporter {
    pub fn new(base_url: impl Into<String>) -> Self {
        HttpDbReporter {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl HttpDbReporter {
    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T, what: &str) {
        let url = format!("{}{}", self.base_url, path);
        if let Err(err) = self.client.post(&url).json(body).send().await {
            warn!("database report for {} failed: {}", what, err);
        }
    }
}

#[async_trait]
impl DbReporter for HttpDbReporter {
    async fn report_plan_state(&self, plan_sn: &str, state: PlanState) {
        let body = PlanStateReport { plan_sn, state: state_name(state) };
        self.post(&format!("/plans/{}/state", plan_sn), &body, plan_sn).await;
    }

    async fn report_link_state(&self, id: &SystemId, role: &str, connected: bool) {
        let body = LinkStateReport { gid: &id.gid, uid: &id.uid, role, connected };
        self.post(&format!("/systems/{}/link", id), &body, &id.to_string()).await;
    }

    async fn report_mount_status(&self, id: &SystemId, mount: &MountInfo) {
        let body = MountStatusReport {
            gid: &id.gid,
            uid: &id.uid,
            state: mount_state_name(mount.state),
            errcode: mount.errcode,
            ra: mount.ra,
            dec: mount.dec,
            azi: mount.azi,
            alt: mount.alt,
        };
        self.post(&format!("/systems/{}/mount", id), &body, &id.to_string()).await;
    }

    async fn report_camera_status(&self, id: &SystemId, cid: &str, camera: &CameraInfo) {
        let body = CameraStatusReport {
            gid: &id.gid,
            uid: &id.uid,
            cid,
            state: camera_state_name(camera.state),
            errcode: camera.errcode,
            cool_temp: camera.cool_temp,
            filter: &camera.filter,
            seq: camera.seq,
            filename: &camera.filename,
        };
        self.post(&format!("/systems/{}/cameras/{}", id, cid), &body, &id.to_string()).await;
    }

    async fn report_rain(&self, gid: &str, value: i32) {
        let body = RainReport { gid, value };
        self.post(&format!("/groups/{}/rain", gid), &body, gid).await;
    }

    async fn report_slit(&self, gid: &str, state: SlitState) {
        let body = SlitReport { gid, state: slit_state_name(state) };
        self.post(&format!("/groups/{}/slit", gid), &body, gid).await;
    }

    async fn report_fwhm(&self, id: &SystemId, cid: &str, plan_sn: Option<&str>, value: f64) {
        let body = FwhmReport { gid: &id.gid, uid: &id.uid, cid, plan_sn, value };
        self.post(&format!("/systems/{}/cameras/{}/fwhm", id, cid), &body, &id.to_string()).await;
    }
}

/// Used when no database URL is configured.
pub struct NullDbReporter;

#[async_trait]
impl DbReporter for NullDbReporter {
    async fn report_plan_state(&self, _plan_sn: &str, _state: PlanState) {}
    async fn report_link_state(&self, _id: &SystemId, _role: &str, _connected: bool) {}
    async fn report_mount_status(&self, _id: &SystemId, _mount: &MountInfo) {}
    async fn report_camera_status(&self, _id: &SystemId, _cid: &str, _camera: &CameraInfo) {}
    async fn report_rain(&self, _gid: &str, _value: i32) {}
    async fn report_slit(&self, _gid: &str, _state: SlitState) {}
    async fn report_fwhm(&self, _id: &SystemId, _cid: &str, _plan_sn: Option<&str>, _value: f64) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn state_names_are_lowercase() {
        assert_eq!(state_name(PlanState::Run), "run");
        assert_eq!(state_name(PlanState::Abandon), "abandon");
    }

    #[tokio::test]
    async fn null_reporter_never_panics() {
        let reporter = NullDbReporter;
        reporter.report_plan_state("SN1", PlanState::Run).await;
    }
}
