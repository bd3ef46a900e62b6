//! Tagged protocol record produced by the shared decoder.

use serde::{Deserialize, Serialize};

/// The `(gid, uid)` addressing pair carried by most records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub gid: String,
    pub uid: String,
}

impl Addr {
    pub fn new(gid: impl Into<String>, uid: impl Into<String>) -> Self {
        Addr {
            gid: gid.into(),
            uid: uid.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Error,
    Freeze,
    Parking,
    Parked,
    Slewing,
    Tracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Idle,
    Exposing,
    WaitSync,
    WaitFlat,
    Paused,
    Other,
}

/// Coordinate system of a mount's current target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoorSys {
    Equatorial,
    Horizontal,
    GuideTle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlitState {
    Unknown,
    Error,
    Opening,
    Open,
    Closing,
    Closed,
    Freeze,
}

/// Image type a plan or manual exposure requests. Declaration order is
/// significant: the eligibility rules in `plan::PlanStore` compare image
/// types with `<=`/`>=` against this ordering (Bias/Dark are calibration
/// frames exempt from the time-window check; Object/Focus are the only
/// types permitted during the Night regime).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageType {
    Bias,
    Dark,
    Flat,
    Object,
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Mount,
    Camera,
    Focus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlitCommand {
    Close,
    Open,
    Stop,
}

/// A fully decoded, tagged protocol message. Produced by both the ASCII
/// key/value resolver and the annex compact resolver.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolRecord {
    Register {
        addr: Addr,
        cid: Option<String>,
        role: DeviceRole,
    },
    MountStatus {
        addr: Addr,
        utc: String,
        state: MountState,
        errcode: i32,
        ra: f64,
        dec: f64,
        azi: f64,
        alt: f64,
    },
    CameraStatus {
        addr: Addr,
        cid: String,
        utc: String,
        state: CameraState,
        errcode: i32,
        cool_temp: f64,
        filter: String,
        seq: u32,
        filename: String,
    },
    FocusStatus {
        addr: Addr,
        cid: String,
        position: i32,
    },
    Rain {
        value: i32,
    },
    Slit {
        gid: String,
        command: Option<SlitCommand>,
        state: Option<SlitState>,
    },
    SlewTo {
        addr: Addr,
        coorsys: CoorSys,
        coor1: f64,
        coor2: f64,
    },
    Track {
        addr: Addr,
        objname: String,
        line1: String,
        line2: String,
    },
    HomeSync {
        addr: Addr,
    },
    Park {
        addr: Addr,
    },
    AbortSlew {
        addr: Addr,
    },
    AbortImage {
        addr: Addr,
    },
    AbortPlan {
        addr: Addr,
    },
    TakeImage {
        addr: Addr,
        image_type: ImageType,
        coorsys: CoorSys,
        coor1: f64,
        coor2: f64,
        exp_dur: f64,
        frame_count: u32,
    },
    StartAuto {
        addr: Addr,
    },
    StopAuto {
        addr: Addr,
    },
    LoadPlan {
        addr: Addr,
    },
    Fwhm {
        gid: String,
        uid: String,
        cid: String,
        value: f64,
    },
    Enable {
        addr: Addr,
        cid: Option<String>,
    },
    Disable {
        addr: Addr,
        cid: Option<String>,
    },
    Guide {
        addr: Addr,
        delta1: f64,
        delta2: f64,
    },
    MirrorCover {
        addr: Addr,
        open: bool,
    },
}

impl ProtocolRecord {
    /// The `(gid, uid)` this record is addressed to, if any. Annex
    /// `Rain`/`Fwhm` records carry their own addressing shape and are
    /// handled separately by the coordinator.
    pub fn addr(&self) -> Option<&Addr> {
        use ProtocolRecord::*;
        match self {
            Register { addr, .. }
            | MountStatus { addr, .. }
            | CameraStatus { addr, .. }
            | FocusStatus { addr, .. }
            | SlewTo { addr, .. }
            | Track { addr, .. }
            | HomeSync { addr }
            | Park { addr }
            | AbortSlew { addr }
            | AbortImage { addr }
            | AbortPlan { addr }
            | TakeImage { addr, .. }
            | StartAuto { addr }
            | StopAuto { addr }
            | LoadPlan { addr }
            | Enable { addr, .. }
            | Disable { addr, .. }
            | Guide { addr, .. }
            | MirrorCover { addr, .. } => Some(addr),
            Rain { .. } | Slit { .. } | Fwhm { .. } => None,
        }
    }
}
