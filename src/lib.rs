//! Dispatch and plan-execution daemon for a distributed robotic
//! observatory: couples mount/camera/focus/dome-annex devices over TCP,
//! dispatches observation plans against sky-regime and weather
//! preconditions, and reports state to an external database.

pub mod astro;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod environment;
pub mod error;
pub mod ids;
pub mod net;
pub mod notify;
pub mod observation_system;
pub mod pidfile;
pub mod plan;
pub mod protocol;
