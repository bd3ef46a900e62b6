//! Annex compact protocol resolver.
//!
//! Wire shape: `g#<body>%` (framing strips the trailing `\n`). Four body
//! variants, all fixed-width apart from `rain`:
//!
//! - `rain<N>`                         — variable-length integer
//! - `<gg><uuu>slit<NN>`                — gid=2, uid=3, state/command=2 digits
//! - `<gg><uuu>focus<ccc><±NNNNN>`       — + cid=3, signed 5-digit µm position
//! - `<gg><uuu>fwhm<ccc><NNNN>`          — + cid=3, 4-digit pixels × 100
//!
//! Widths are fixed so the peer can parse positionally.

use thiserror::Error;

use super::record::{Addr, ProtocolRecord, SlitCommand, SlitState};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AnnexError {
    #[error("missing g# envelope")]
    MissingEnvelope,
    #[error("missing trailing %")]
    MissingTerminator,
    #[error("unrecognised annex body: '{0}'")]
    UnrecognisedBody(String),
    #[error("field '{0}' has the wrong width")]
    BadWidth(&'static str),
    #[error("field '{field}' is not a valid integer: '{value}'")]
    BadInteger { field: &'static str, value: String },
}

const GID_W: usize = 2;
const UID_W: usize = 3;
const CID_W: usize = 3;
const SLIT_W: usize = 2;
const FOCUS_W: usize = 6; // sign + 5 digits
const FWHM_W: usize = 4;

fn slit_state_from_code(code: i32) -> SlitState {
    match code {
        0 => SlitState::Unknown,
        1 => SlitState::Error,
        2 => SlitState::Opening,
        3 => SlitState::Open,
        4 => SlitState::Closing,
        5 => SlitState::Closed,
        6 => SlitState::Freeze,
        _ => SlitState::Unknown,
    }
}

fn slit_state_to_code(state: SlitState) -> i32 {
    match state {
        SlitState::Unknown => 0,
        SlitState::Error => 1,
        SlitState::Opening => 2,
        SlitState::Open => 3,
        SlitState::Closing => 4,
        SlitState::Closed => 5,
        SlitState::Freeze => 6,
    }
}

fn slit_command_from_code(code: i32) -> Result<SlitCommand, AnnexError> {
    Ok(match code {
        0 => SlitCommand::Close,
        1 => SlitCommand::Open,
        2 => SlitCommand::Stop,
        _ => {
            return Err(AnnexError::BadInteger {
                field: "slit command",
                value: code.to_string(),
            });
        }
    })
}

fn slit_command_to_code(cmd: SlitCommand) -> i32 {
    match cmd {
        SlitCommand::Close => 0,
        SlitCommand::Open => 1,
        SlitCommand::Stop => 2,
    }
}

/// Decodes one annex frame (without its trailing `\n`) into a tagged
/// [`ProtocolRecord`].
pub fn decode(line: &str) -> Result<ProtocolRecord, AnnexError> {
    let body = line.strip_prefix("g#").ok_or(AnnexError::MissingEnvelope)?;
    let body = body
        .strip_suffix('%')
        .ok_or(AnnexError::MissingTerminator)?;

    if let Some(rest) = body.strip_prefix("rain") {
        let value: i32 = rest.parse().map_err(|_| AnnexError::BadInteger {
            field: "rain",
            value: rest.to_string(),
        })?;
        return Ok(ProtocolRecord::Rain { value });
    }

    if body.len() < GID_W + UID_W {
        return Err(AnnexError::UnrecognisedBody(body.to_string()));
    }
    let gid = &body[..GID_W];
    let uid = &body[GID_W..GID_W + UID_W];
    let tail = &body[GID_W + UID_W..];

    if let Some(rest) = tail.strip_prefix("slit") {
        if rest.len() != SLIT_W {
            return Err(AnnexError::BadWidth("slit"));
        }
        let code: i32 = rest.parse().map_err(|_| AnnexError::BadInteger {
            field: "slit",
            value: rest.to_string(),
        })?;
        return Ok(ProtocolRecord::Slit {
            gid: gid.to_string(),
            command: None,
            state: Some(slit_state_from_code(code)),
        });
    }

    if let Some(rest) = tail.strip_prefix("focus") {
        if rest.len() < CID_W + FOCUS_W {
            return Err(AnnexError::BadWidth("focus"));
        }
        let cid = &rest[..CID_W];
        let num = &rest[CID_W..];
        if num.len() != FOCUS_W {
            return Err(AnnexError::BadWidth("focus"));
        }
        let position: i32 = num.parse().map_err(|_| AnnexError::BadInteger {
            field: "focus",
            value: num.to_string(),
        })?;
        return Ok(ProtocolRecord::FocusStatus {
            addr: Addr::new(gid, uid),
            cid: cid.to_string(),
            position,
        });
    }

    if let Some(rest) = tail.strip_prefix("fwhm") {
        if rest.len() < CID_W + FWHM_W {
            return Err(AnnexError::BadWidth("fwhm"));
        }
        let cid = &rest[..CID_W];
        let num = &rest[CID_W..];
        if num.len() != FWHM_W {
            return Err(AnnexError::BadWidth("fwhm"));
        }
        let hundredths: i32 = num.parse().map_err(|_| AnnexError::BadInteger {
            field: "fwhm",
            value: num.to_string(),
        })?;
        return Ok(ProtocolRecord::Fwhm {
            gid: gid.to_string(),
            uid: uid.to_string(),
            cid: cid.to_string(),
            value: hundredths as f64 / 100.0,
        });
    }

    Err(AnnexError::UnrecognisedBody(body.to_string()))
}

fn pad_left(s: &str, width: usize) -> String {
    format!("{:0>width$}", s, width = width)
}

/// Encodes a tagged [`ProtocolRecord`] back to its annex wire form
/// (without the trailing `\n`). Only `Rain`, `Slit`, `FocusStatus` and
/// `Fwhm` variants are representable on the annex wire; every other
/// variant belongs to the ASCII protocol.
pub fn encode(record: &ProtocolRecord) -> Result<String, AnnexError> {
    Ok(match record {
        ProtocolRecord::Rain { value } => format!("g#rain{}%", value),
        ProtocolRecord::Slit { gid, command, state } => {
            let code = if let Some(cmd) = command {
                slit_command_to_code(*cmd)
            } else if let Some(s) = state {
                slit_state_to_code(*s)
            } else {
                return Err(AnnexError::UnrecognisedBody(
                    "slit record with neither command nor state".to_string(),
                ));
            };
            format!(
                "g#{}{}slit{:02}%",
                pad_left(gid, GID_W),
                pad_left("", UID_W),
                code
            )
        }
        ProtocolRecord::FocusStatus { addr, cid, position } => {
            format!(
                "g#{}{}focus{}{:+06}%",
                pad_left(&addr.gid, GID_W),
                pad_left(&addr.uid, UID_W),
                pad_left(cid, CID_W),
                position
            )
        }
        ProtocolRecord::Fwhm { gid, uid, cid, value } => {
            let hundredths = (*value * 100.0).round() as i32;
            format!(
                "g#{}{}fwhm{}{:04}%",
                pad_left(gid, GID_W),
                pad_left(uid, UID_W),
                pad_left(cid, CID_W),
                hundredths
            )
        }
        other => {
            return Err(AnnexError::UnrecognisedBody(format!(
                "{:?} has no annex wire form",
                other
            )));
        }
    })
}

/// Encodes a dome-slit command addressed to a group. The Coordinator uses this directly
/// rather than building a `ProtocolRecord::Slit` with a command, since
/// outbound slit commands don't carry a `uid` of their own — they
/// target the whole group's dome session.
pub fn encode_slit_command(gid: &str, command: SlitCommand) -> String {
    format!(
        "g#{}{}slit{:02}%",
        pad_left(gid, GID_W),
        pad_left("", UID_W),
        slit_command_to_code(command)
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decode_rain() {
        assert_eq!(
            decode("g#rain5%").unwrap(),
            ProtocolRecord::Rain { value: 5 }
        );
    }

    #[test]
    fn decode_slit_state() {
        match decode("g#G1001slit03%").unwrap() {
            ProtocolRecord::Slit { gid, command, state } => {
                assert_eq!(gid, "G1");
                assert_eq!(command, None);
                assert_eq!(state, Some(SlitState::Open));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_focus_position_signed() {
        match decode("g#G1001focus001+09999%").unwrap() {
            ProtocolRecord::FocusStatus { addr, cid, position } => {
                assert_eq!(addr, Addr::new("G1", "001"));
                assert_eq!(cid, "001");
                assert_eq!(position, 9999);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_focus_max_width_is_accepted() {
        match decode("g#G1001focus001+99999%").unwrap() {
            ProtocolRecord::FocusStatus { position, .. } => assert_eq!(position, 99999),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_focus_six_digits_is_malformed() {
        assert!(decode("g#G1001focus001+999999%").is_err());
    }

    #[test]
    fn decode_fwhm_is_pixels_times_hundred() {
        match decode("g#G1001fwhm0010350%").unwrap() {
            ProtocolRecord::Fwhm { value, .. } => assert!((value - 3.50).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn decode_missing_envelope_rejected() {
        assert_eq!(decode("rain5%"), Err(AnnexError::MissingEnvelope));
    }

    #[test]
    fn decode_missing_terminator_rejected() {
        assert_eq!(decode("g#rain5"), Err(AnnexError::MissingTerminator));
    }

    #[test]
    fn encode_slit_command_round_trips_through_decode_as_state() {
        // The command encoding and the state encoding share the same two
        // digit slot; encoding a command produces the same digits a
        // receiver would parse back as a state code. This asserts only
        // that the wire shape is well-formed, not semantic round-trip.
        let wire = encode_slit_command("G1", SlitCommand::Open);
        assert!(decode(&wire).is_ok());
    }

    #[test]
    fn fwhm_round_trip() {
        let rec = ProtocolRecord::Fwhm {
            gid: "G1".to_string(),
            uid: "001".to_string(),
            cid: "001".to_string(),
            value: 2.75,
        };
        let wire = encode(&rec).unwrap();
        assert_eq!(decode(&wire).unwrap(), rec);
    }
}
