//! Per-device status and the arrival predicate.
//!
//! Grounded on `examples/original_source/gtoaes_hr/src/ObservationSystem.h`'s
//! `MountInfo`/`CameraInfo` structs — `HasArrived` and `IsStable` are
//! carried over field-for-field, translated from the C++ coordinate-pair
//! comparison into the equivalent match on `CoorSys`.

use crate::protocol::record::{CameraState, CoorSys, MountState};

/// Degrees within which a non-guide target counts as arrived.
const ARRIVE_TOLERANCE_DEG: f64 = 1.0;
/// Degrees within which guide tracking counts as still co-located with
/// its start (and therefore *not yet* arrived — see `HasArrived`).
const GUIDE_TOLERANCE_DEG: f64 = 0.1;

#[derive(Debug, Clone, Copy)]
pub struct MountInfo {
    pub state: MountState,
    pub errcode: i32,
    pub ra: f64,
    pub dec: f64,
    pub azi: f64,
    pub alt: f64,
    pub target_coorsys: CoorSys,
    pub target_coor1: f64,
    pub target_coor2: f64,
    pub slewing: bool,
}

impl MountInfo {
    pub fn new() -> Self {
        MountInfo {
            state: MountState::Error,
            errcode: 0,
            ra: 0.0,
            dec: 0.0,
            azi: 0.0,
            alt: 0.0,
            target_coorsys: CoorSys::Horizontal,
            target_coor1: 0.0,
            target_coor2: 0.0,
            slewing: false,
        }
    }

    /// Records a new slew/track target and raises the `slewing` flag.
    pub fn set_target(&mut self, coorsys: CoorSys, coor1: f64, coor2: f64) {
        self.slewing = true;
        self.target_coorsys = coorsys;
        self.target_coor1 = coor1;
        self.target_coor2 = coor2;
    }

    /// Sets the target to the mount's current position — used by the
    /// home-sync command, which re-anchors tracking without a slew.
    pub fn actual_to_object(&mut self) {
        match self.target_coorsys {
            CoorSys::Horizontal => {
                self.target_coor1 = self.azi;
                self.target_coor2 = self.alt;
            }
            CoorSys::Equatorial | CoorSys::GuideTle => {
                self.target_coor1 = self.ra;
                self.target_coor2 = self.dec;
            }
        }
    }

    /// Whether the mount has reached its commanded target.
    ///
    /// For `Horizontal` targets the comparison is on (azi, alt); for
    /// `Equatorial`/`GuideTle` it's on (ra, dec). `coor1`'s delta wraps
    /// at 360°. `GuideTle` targets invert the sense of the check: guide
    /// tracking only counts as "arrived" once the mount has moved more
    /// than the guide tolerance away from its starting position.
    pub fn has_arrived(&self) -> bool {
        let (err1, err2) = match self.target_coorsys {
            CoorSys::Horizontal => (
                (self.azi - self.target_coor1).abs(),
                (self.alt - self.target_coor2).abs(),
            ),
            CoorSys::Equatorial | CoorSys::GuideTle => (
                (self.ra - self.target_coor1).abs(),
                (self.dec - self.target_coor2).abs(),
            ),
        };
        let err1 = if err1 > 180.0 { 360.0 - err1 } else { err1 };

        if self.target_coorsys == CoorSys::GuideTle {
            !(err1 < GUIDE_TOLERANCE_DEG && err2 < GUIDE_TOLERANCE_DEG)
        } else {
            err1 < ARRIVE_TOLERANCE_DEG && err2 < ARRIVE_TOLERANCE_DEG
        }
    }

    pub fn is_stable(&self) -> bool {
        matches!(self.state, MountState::Freeze | MountState::Parked | MountState::Tracking)
    }
}

impl Default for MountInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CameraInfo {
    pub utc: String,
    pub state: Option<CameraState>,
    pub errcode: i32,
    pub cool_temp: f64,
    pub filter: String,
    pub seq: u32,
    pub filename: String,
}

impl CameraInfo {
    pub fn new() -> Self {
        CameraInfo::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn horizontal_arrival_within_one_degree() {
        let mut m = MountInfo::new();
        m.set_target(CoorSys::Horizontal, 90.0, 45.0);
        m.azi = 90.5;
        m.alt = 44.6;
        assert!(m.has_arrived());
    }

    #[test]
    fn horizontal_not_arrived_outside_tolerance() {
        let mut m = MountInfo::new();
        m.set_target(CoorSys::Horizontal, 90.0, 45.0);
        m.azi = 92.0;
        m.alt = 45.0;
        assert!(!m.has_arrived());
    }

    #[test]
    fn azimuth_wraps_at_360() {
        let mut m = MountInfo::new();
        m.set_target(CoorSys::Horizontal, 359.5, 45.0);
        m.azi = 0.2;
        m.alt = 45.0;
        assert!(m.has_arrived());
    }

    #[test]
    fn guide_tle_counts_arrival_only_once_diverged() {
        let mut m = MountInfo::new();
        m.set_target(CoorSys::GuideTle, 10.0, 20.0);
        m.ra = 10.01;
        m.dec = 20.01;
        assert!(!m.has_arrived());
        m.ra = 10.5;
        assert!(m.has_arrived());
    }

    #[test]
    fn stable_states() {
        let mut m = MountInfo::new();
        m.state = MountState::Slewing;
        assert!(!m.is_stable());
        m.state = MountState::Tracking;
        assert!(m.is_stable());
    }
}
