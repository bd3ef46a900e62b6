//! ASCII key/value protocol resolver.
//!
//! Wire shape: `type key1=value1,key2=value2,...\n`. Type names are
//! case-insensitive; keys are looked up case-sensitively — the daemon
//! is the only writer of well-formed traffic, so decoding trusts its
//! own encoder and is defensive only about what arrives from the
//! network.

use std::collections::HashMap;
use std::fmt::Write as _;
use thiserror::Error;

use super::record::{
    Addr, CameraState, CoorSys, DeviceRole, ImageType, MountState, ProtocolRecord, SlitCommand,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AsciiError {
    #[error("empty message")]
    Empty,
    #[error("unknown protocol type '{0}'")]
    UnknownType(String),
    #[error("missing required key '{0}'")]
    MissingKey(String),
    #[error("invalid value for key '{key}': '{value}'")]
    InvalidValue { key: String, value: String },
}

struct Fields<'a> {
    map: HashMap<&'a str, &'a str>,
}

impl<'a> Fields<'a> {
    fn parse(rest: &'a str) -> Self {
        let mut map = HashMap::new();
        for pair in rest.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            if let Some((k, v)) = pair.split_once('=') {
                map.insert(k.trim(), v.trim());
            }
        }
        Fields { map }
    }

    fn get(&self, key: &str) -> Result<&'a str, AsciiError> {
        self.map
            .get(key)
            .copied()
            .ok_or_else(|| AsciiError::MissingKey(key.to_string()))
    }

    fn get_opt(&self, key: &str) -> Option<&'a str> {
        self.map.get(key).copied()
    }

    fn get_f64(&self, key: &str) -> Result<f64, AsciiError> {
        let v = self.get(key)?;
        v.parse().map_err(|_| AsciiError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
        })
    }

    fn get_i32(&self, key: &str) -> Result<i32, AsciiError> {
        let v = self.get(key)?;
        v.parse().map_err(|_| AsciiError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
        })
    }

    fn get_u32(&self, key: &str) -> Result<u32, AsciiError> {
        let v = self.get(key)?;
        v.parse().map_err(|_| AsciiError::InvalidValue {
            key: key.to_string(),
            value: v.to_string(),
        })
    }

    fn addr(&self) -> Result<Addr, AsciiError> {
        Ok(Addr::new(self.get("gid")?, self.get("uid")?))
    }
}

fn parse_mount_state(s: &str) -> Result<MountState, AsciiError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "error" => MountState::Error,
        "freeze" => MountState::Freeze,
        "parking" => MountState::Parking,
        "parked" => MountState::Parked,
        "slewing" => MountState::Slewing,
        "tracking" => MountState::Tracking,
        _ => {
            return Err(AsciiError::InvalidValue {
                key: "state".to_string(),
                value: s.to_string(),
            });
        }
    })
}

fn parse_camera_state(s: &str) -> Result<CameraState, AsciiError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "idle" => CameraState::Idle,
        "exposing" => CameraState::Exposing,
        "waitsync" => CameraState::WaitSync,
        "waitflat" => CameraState::WaitFlat,
        "paused" => CameraState::Paused,
        _ => CameraState::Other,
    })
}

fn parse_coorsys(s: &str) -> Result<CoorSys, AsciiError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "equatorial" => CoorSys::Equatorial,
        "horizontal" => CoorSys::Horizontal,
        "guidetle" | "guide" => CoorSys::GuideTle,
        _ => {
            return Err(AsciiError::InvalidValue {
                key: "coorsys".to_string(),
                value: s.to_string(),
            });
        }
    })
}

fn parse_slit_command(s: &str) -> Result<SlitCommand, AsciiError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "open" => SlitCommand::Open,
        "close" => SlitCommand::Close,
        "stop" => SlitCommand::Stop,
        _ => {
            return Err(AsciiError::InvalidValue {
                key: "command".to_string(),
                value: s.to_string(),
            });
        }
    })
}

fn parse_image_type(s: &str) -> Result<ImageType, AsciiError> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "bias" => ImageType::Bias,
        "dark" => ImageType::Dark,
        "flat" => ImageType::Flat,
        "object" => ImageType::Object,
        "focus" => ImageType::Focus,
        _ => {
            return Err(AsciiError::InvalidValue {
                key: "imgtype".to_string(),
                value: s.to_string(),
            });
        }
    })
}

/// Decodes one ASCII key/value line into a tagged [`ProtocolRecord`].
pub fn decode(line: &str) -> Result<ProtocolRecord, AsciiError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(AsciiError::Empty);
    }
    let (kind, rest) = line.split_once(' ').unwrap_or((line, ""));
    let kind = kind.to_ascii_lowercase();
    let f = Fields::parse(rest);

    Ok(match kind.as_str() {
        "register" => ProtocolRecord::Register {
            addr: f.addr()?,
            cid: f.get_opt("cid").map(str::to_string),
            role: match f.get("role")?.to_ascii_lowercase().as_str() {
                "mount" => DeviceRole::Mount,
                "camera" => DeviceRole::Camera,
                "focus" => DeviceRole::Focus,
                other => {
                    return Err(AsciiError::InvalidValue {
                        key: "role".to_string(),
                        value: other.to_string(),
                    });
                }
            },
        },
        "mount-status" => ProtocolRecord::MountStatus {
            addr: f.addr()?,
            utc: f.get("utc")?.to_string(),
            state: parse_mount_state(f.get("state")?)?,
            errcode: f.get_i32("errcode")?,
            ra: f.get_f64("ra")?,
            dec: f.get_f64("dec")?,
            azi: f.get_f64("azi")?,
            alt: f.get_f64("alt")?,
        },
        "camera-status" => ProtocolRecord::CameraStatus {
            addr: f.addr()?,
            cid: f.get("cid")?.to_string(),
            utc: f.get("utc")?.to_string(),
            state: parse_camera_state(f.get("state")?)?,
            errcode: f.get_i32("errcode")?,
            cool_temp: f.get_f64("cooltemp")?,
            filter: f.get_opt("filter").unwrap_or("").to_string(),
            seq: f.get_opt("seq").map(|s| s.parse().unwrap_or(0)).unwrap_or(0),
            filename: f.get_opt("filename").unwrap_or("").to_string(),
        },
        "slew-to" => ProtocolRecord::SlewTo {
            addr: f.addr()?,
            coorsys: parse_coorsys(f.get("coorsys")?)?,
            coor1: f.get_f64("coor1")?,
            coor2: f.get_f64("coor2")?,
        },
        "track" => ProtocolRecord::Track {
            addr: f.addr()?,
            objname: f.get_opt("objname").unwrap_or("").to_string(),
            line1: f.get("line1")?.to_string(),
            line2: f.get("line2")?.to_string(),
        },
        "home-sync" => ProtocolRecord::HomeSync { addr: f.addr()? },
        "park" => ProtocolRecord::Park { addr: f.addr()? },
        "abort-slew" => ProtocolRecord::AbortSlew { addr: f.addr()? },
        "abort-image" => ProtocolRecord::AbortImage { addr: f.addr()? },
        "abort-plan" => ProtocolRecord::AbortPlan { addr: f.addr()? },
        "take-image" => ProtocolRecord::TakeImage {
            addr: f.addr()?,
            image_type: parse_image_type(f.get("imgtype")?)?,
            coorsys: parse_coorsys(f.get_opt("coorsys").unwrap_or("horizontal"))?,
            coor1: f.get_opt("coor1").map(|v| v.parse().unwrap_or(0.0)).unwrap_or(0.0),
            coor2: f.get_opt("coor2").map(|v| v.parse().unwrap_or(0.0)).unwrap_or(0.0),
            exp_dur: f.get_f64("expdur")?,
            frame_count: f.get_u32("framecnt")?,
        },
        "start-auto" => ProtocolRecord::StartAuto { addr: f.addr()? },
        "stop-auto" => ProtocolRecord::StopAuto { addr: f.addr()? },
        "load-plan" => ProtocolRecord::LoadPlan { addr: f.addr()? },
        "enable" => ProtocolRecord::Enable {
            addr: f.addr()?,
            cid: f.get_opt("cid").map(str::to_string),
        },
        "disable" => ProtocolRecord::Disable {
            addr: f.addr()?,
            cid: f.get_opt("cid").map(str::to_string),
        },
        "guide" => ProtocolRecord::Guide {
            addr: f.addr()?,
            delta1: f.get_f64("delta1")?,
            delta2: f.get_f64("delta2")?,
        },
        "mirror-cover" => ProtocolRecord::MirrorCover {
            addr: f.addr()?,
            open: f.get_opt("open").unwrap_or("0") == "1",
        },
        // Client-issued slit command; the annex side of
        // this same variant carries `state`, which only ever arrives
        // over the annex protocol and is decoded in `annex.rs`.
        "slit" => ProtocolRecord::Slit {
            gid: f.get("gid")?.to_string(),
            command: Some(parse_slit_command(f.get("command")?)?),
            state: None,
        },
        other => return Err(AsciiError::UnknownType(other.to_string())),
    })
}

/// Encodes a tagged [`ProtocolRecord`] back to its ASCII key/value wire
/// form, without the trailing `\n` (framing adds that). Numeric fields
/// round-trip through `{}` formatting of `f64`/integers, which is exact
/// for every value `decode` can produce since both sides go through the
/// same Rust float formatter.
pub fn encode(record: &ProtocolRecord) -> String {
    let mut out = String::new();
    match record {
        ProtocolRecord::Register { addr, cid, role } => {
            let role = match role {
                DeviceRole::Mount => "mount",
                DeviceRole::Camera => "camera",
                DeviceRole::Focus => "focus",
            };
            let _ = write!(out, "register gid={},uid={},role={}", addr.gid, addr.uid, role);
            if let Some(cid) = cid {
                let _ = write!(out, ",cid={}", cid);
            }
        }
        ProtocolRecord::MountStatus {
            addr,
            utc,
            state,
            errcode,
            ra,
            dec,
            azi,
            alt,
        } => {
            let state = match state {
                MountState::Error => "error",
                MountState::Freeze => "freeze",
                MountState::Parking => "parking",
                MountState::Parked => "parked",
                MountState::Slewing => "slewing",
                MountState::Tracking => "tracking",
            };
            let _ = write!(
                out,
                "mount-status gid={},uid={},utc={},state={},errcode={},ra={},dec={},azi={},alt={}",
                addr.gid, addr.uid, utc, state, errcode, ra, dec, azi, alt
            );
        }
        ProtocolRecord::CameraStatus {
            addr,
            cid,
            utc,
            state,
            errcode,
            cool_temp,
            filter,
            seq,
            filename,
        } => {
            let state = match state {
                CameraState::Idle => "idle",
                CameraState::Exposing => "exposing",
                CameraState::WaitSync => "waitsync",
                CameraState::WaitFlat => "waitflat",
                CameraState::Paused => "paused",
                CameraState::Other => "other",
            };
            let _ = write!(
                out,
                "camera-status gid={},uid={},cid={},utc={},state={},errcode={},cooltemp={},filter={},seq={},filename={}",
                addr.gid, addr.uid, cid, utc, state, errcode, cool_temp, filter, seq, filename
            );
        }
        ProtocolRecord::SlewTo {
            addr,
            coorsys,
            coor1,
            coor2,
        } => {
            let coorsys = match coorsys {
                CoorSys::Equatorial => "equatorial",
                CoorSys::Horizontal => "horizontal",
                CoorSys::GuideTle => "guidetle",
            };
            let _ = write!(
                out,
                "slew-to gid={},uid={},coorsys={},coor1={},coor2={}",
                addr.gid, addr.uid, coorsys, coor1, coor2
            );
        }
        ProtocolRecord::Track {
            addr,
            objname,
            line1,
            line2,
        } => {
            let _ = write!(
                out,
                "track gid={},uid={},objname={},line1={},line2={}",
                addr.gid, addr.uid, objname, line1, line2
            );
        }
        ProtocolRecord::HomeSync { addr } => {
            let _ = write!(out, "home-sync gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::Park { addr } => {
            let _ = write!(out, "park gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::AbortSlew { addr } => {
            let _ = write!(out, "abort-slew gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::AbortImage { addr } => {
            let _ = write!(out, "abort-image gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::AbortPlan { addr } => {
            let _ = write!(out, "abort-plan gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::TakeImage {
            addr,
            image_type,
            coorsys,
            coor1,
            coor2,
            exp_dur,
            frame_count,
        } => {
            let image_type = match image_type {
                ImageType::Bias => "bias",
                ImageType::Dark => "dark",
                ImageType::Flat => "flat",
                ImageType::Object => "object",
                ImageType::Focus => "focus",
            };
            let coorsys = match coorsys {
                CoorSys::Equatorial => "equatorial",
                CoorSys::Horizontal => "horizontal",
                CoorSys::GuideTle => "guidetle",
            };
            let _ = write!(
                out,
                "take-image gid={},uid={},imgtype={},coorsys={},coor1={},coor2={},expdur={},framecnt={}",
                addr.gid, addr.uid, image_type, coorsys, coor1, coor2, exp_dur, frame_count
            );
        }
        ProtocolRecord::StartAuto { addr } => {
            let _ = write!(out, "start-auto gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::StopAuto { addr } => {
            let _ = write!(out, "stop-auto gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::LoadPlan { addr } => {
            let _ = write!(out, "load-plan gid={},uid={}", addr.gid, addr.uid);
        }
        ProtocolRecord::Enable { addr, cid } => {
            let _ = write!(out, "enable gid={},uid={}", addr.gid, addr.uid);
            if let Some(cid) = cid {
                let _ = write!(out, ",cid={}", cid);
            }
        }
        ProtocolRecord::Disable { addr, cid } => {
            let _ = write!(out, "disable gid={},uid={}", addr.gid, addr.uid);
            if let Some(cid) = cid {
                let _ = write!(out, ",cid={}", cid);
            }
        }
        ProtocolRecord::Guide { addr, delta1, delta2 } => {
            let _ = write!(
                out,
                "guide gid={},uid={},delta1={},delta2={}",
                addr.gid, addr.uid, delta1, delta2
            );
        }
        ProtocolRecord::MirrorCover { addr, open } => {
            let _ = write!(
                out,
                "mirror-cover gid={},uid={},open={}",
                addr.gid,
                addr.uid,
                if *open { 1 } else { 0 }
            );
        }
        ProtocolRecord::Slit { gid, command: Some(command), state: None } => {
            let command = match command {
                SlitCommand::Open => "open",
                SlitCommand::Close => "close",
                SlitCommand::Stop => "stop",
            };
            let _ = write!(out, "slit gid={},command={}", gid, command);
        }
        ProtocolRecord::Rain { .. } | ProtocolRecord::Slit { .. } | ProtocolRecord::Fwhm { .. } => {
            unreachable!("rain and annex-originated slit state are never ASCII-encoded")
        }
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_mount_status() {
        let rec = ProtocolRecord::MountStatus {
            addr: Addr::new("G1", "U1"),
            utc: "20260727T120000".to_string(),
            state: MountState::Tracking,
            errcode: 0,
            ra: 120.0,
            dec: 30.0,
            azi: 10.0,
            alt: 45.0,
        };
        let wire = encode(&rec);
        assert_eq!(decode(&wire).unwrap(), rec);
    }

    #[test]
    fn round_trip_take_image() {
        let rec = ProtocolRecord::TakeImage {
            addr: Addr::new("G1", "U1"),
            image_type: ImageType::Object,
            coorsys: CoorSys::Equatorial,
            coor1: 120.0,
            coor2: 30.0,
            exp_dur: 3.0,
            frame_count: 2,
        };
        assert_eq!(decode(&encode(&rec)).unwrap(), rec);
    }

    #[test]
    fn unknown_type_rejected() {
        assert_eq!(
            decode("bogus gid=G1,uid=U1"),
            Err(AsciiError::UnknownType("bogus".to_string()))
        );
    }

    #[test]
    fn missing_key_rejected() {
        assert_eq!(
            decode("park uid=U1"),
            Err(AsciiError::MissingKey("gid".to_string()))
        );
    }

    #[test]
    fn case_insensitive_type_name() {
        assert_eq!(
            decode("PARK gid=G1,uid=U1").unwrap(),
            ProtocolRecord::Park {
                addr: Addr::new("G1", "U1")
            }
        );
    }

    #[test]
    fn round_trip_slit_command() {
        let rec = ProtocolRecord::Slit {
            gid: "G1".to_string(),
            command: Some(SlitCommand::Open),
            state: None,
        };
        assert_eq!(decode(&encode(&rec)).unwrap(), rec);
    }

    #[test]
    fn uid_wildcard_is_empty_string() {
        match decode("start-auto gid=G1,uid=").unwrap() {
            ProtocolRecord::StartAuto { addr } => assert_eq!(addr.uid, ""),
            other => panic!("unexpected {:?}", other),
        }
    }
}
