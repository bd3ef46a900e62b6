//! Wire protocol layer: framing, the two text protocol
//! families, and the tagged record type they both resolve to.

pub mod annex;
pub mod ascii;
pub mod framing;
pub mod record;

pub use framing::{Framer, FramingError};
pub use record::{
    Addr, CameraState, CoorSys, DeviceRole, ImageType, MountState, ProtocolRecord, SlitCommand,
    SlitState,
};

use thiserror::Error;

/// Errors from resolving a framed line into a [`ProtocolRecord`],
/// regardless of which text protocol produced it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error(transparent)]
    Ascii(#[from] ascii::AsciiError),
    #[error(transparent)]
    Annex(#[from] annex::AnnexError),
}

/// Resolves one framed line using the family implied by its first byte:
/// annex frames always start with `g#`; everything else
/// is ASCII key/value.
pub fn resolve(line: &str) -> Result<ProtocolRecord, ResolveError> {
    if line.starts_with("g#") {
        Ok(annex::decode(line)?)
    } else {
        Ok(ascii::decode(line)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn resolve_dispatches_annex_by_prefix() {
        assert!(matches!(
            resolve("g#rain0%").unwrap(),
            ProtocolRecord::Rain { value: 0 }
        ));
    }

    #[test]
    fn resolve_dispatches_ascii_otherwise() {
        assert!(matches!(
            resolve("park gid=G1,uid=U1").unwrap(),
            ProtocolRecord::Park { .. }
        ));
    }
}
