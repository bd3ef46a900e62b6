//! AstronomicalClock: per-site sky-time regime classification.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::info;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Duration};

use crate::astro::{self, Location};

/// Five-minute wake cadence for the clock sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkyRegime {
    Day,
    Flat,
    Night,
}

/// Sun-altitude thresholds, in radians, separating Day/Flat/Night.
/// Defaults: Day > −6°, Night < −12°, clamped so that `Day − Night ≥ 3°`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub day: f64,
    pub night: f64,
}

impl Thresholds {
    const MIN_SEPARATION_DEG: f64 = 3.0;

    pub fn from_degrees(day_deg: f64, night_deg: f64) -> Self {
        let (day_deg, night_deg) = if day_deg - night_deg < Self::MIN_SEPARATION_DEG {
            (night_deg + Self::MIN_SEPARATION_DEG, night_deg)
        } else {
            (day_deg, night_deg)
        };
        Thresholds {
            day: day_deg.to_radians(),
            night: night_deg.to_radians(),
        }
    }

    fn classify(&self, altitude: f64) -> SkyRegime {
        if altitude > self.day {
            SkyRegime::Day
        } else if altitude < self.night {
            SkyRegime::Night
        } else {
            SkyRegime::Flat
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds::from_degrees(-6.0, -12.0)
    }
}

/// Per-group site geometry and regime thresholds, loaded from
/// configuration.
#[derive(Debug, Clone, Copy)]
pub struct Site {
    pub location: Location,
    pub thresholds: Thresholds,
}

/// Emitted by a clock sweep. The Coordinator reacts to `RegimeEdge` by
/// possibly issuing a dome-slit command, and to `DayAdvance` by
/// triggering a `PlanStore` reload.
#[derive(Debug, Clone, PartialEq)]
pub enum ClockEvent {
    RegimeEdge { gid: String, regime: SkyRegime },
    DayAdvance,
}

pub struct AstronomicalClock {
    sites: HashMap<String, Site>,
    last_regime: HashMap<String, SkyRegime>,
    last_day: Option<NaiveDate>,
}

impl AstronomicalClock {
    pub fn new(sites: HashMap<String, Site>) -> Self {
        AstronomicalClock {
            sites,
            last_regime: HashMap::new(),
            last_day: None,
        }
    }

    /// Current classification for `gid`, independent of edge tracking.
    /// Used by `PlanStore::acquire` to check slit+regime compatibility
    /// without mutating clock state.
    pub fn regime_for(&self, gid: &str, now: DateTime<Utc>) -> Option<SkyRegime> {
        let site = self.sites.get(gid)?;
        let sun = astro::horizontal_from_sun(site.location, now);
        Some(site.thresholds.classify(sun.altitude))
    }

    /// True before local solar noon — the flat-field subroutine in
    /// `observation_system` uses this to pick which side of the sky to
    /// point a calibration slew at.
    pub fn before_local_noon(&self, gid: &str, now: DateTime<Utc>) -> Option<bool> {
        let site = self.sites.get(gid)?;
        let sun = astro::horizontal_from_sun(site.location, now);
        Some(sun.azimuth < std::f64::consts::PI)
    }

    /// Runs one sweep: classifies every site, returns the edges since
    /// the previous sweep, and advances internal state.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<ClockEvent> {
        let mut events = Vec::new();

        let gids: Vec<String> = self.sites.keys().cloned().collect();
        for gid in gids {
            let Some(regime) = self.regime_for(&gid, now) else {
                continue;
            };
            let changed = self.last_regime.get(&gid) != Some(&regime);
            if changed {
                info!("sky regime for {} transitioned to {:?}", gid, regime);
                events.push(ClockEvent::RegimeEdge {
                    gid: gid.clone(),
                    regime,
                });
                self.last_regime.insert(gid, regime);
            }
        }

        let today = now.date_naive();
        if self.last_day != Some(today) {
            if self.last_day.is_some() {
                events.push(ClockEvent::DayAdvance);
            }
            self.last_day = Some(today);
        }

        events
    }
}

/// Spawns the periodic clock sweep task: shared state behind
/// `Arc<Mutex<_>>`, polled from a background task on a fixed cadence.
pub fn spawn(clock: Arc<Mutex<AstronomicalClock>>, events: mpsc::UnboundedSender<ClockEvent>) {
    tokio::spawn(async move {
        loop {
            sleep(SWEEP_INTERVAL).await;
            let fired = clock.lock().await.tick(Utc::now());
            for event in fired {
                if events.send(event).is_err() {
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn onsala() -> Site {
        Site {
            location: Location {
                longitude: 0.20802143022,
                latitude: 1.00170457462,
            },
            thresholds: Thresholds::default(),
        }
    }

    #[test]
    fn classifies_midday_as_day() {
        let mut sites = HashMap::new();
        sites.insert("G1".to_string(), onsala());
        let clock = AstronomicalClock::new(sites);
        let noon = Utc.with_ymd_and_hms(2023, 6, 21, 12, 0, 0).unwrap();
        assert_eq!(clock.regime_for("G1", noon), Some(SkyRegime::Day));
    }

    #[test]
    fn classifies_midnight_as_night() {
        let mut sites = HashMap::new();
        sites.insert("G1".to_string(), onsala());
        let clock = AstronomicalClock::new(sites);
        let midnight = Utc.with_ymd_and_hms(2023, 12, 21, 23, 0, 0).unwrap();
        assert_eq!(clock.regime_for("G1", midnight), Some(SkyRegime::Night));
    }

    #[test]
    fn threshold_clamp_enforces_minimum_separation() {
        let t = Thresholds::from_degrees(-6.0, -7.0);
        assert!((t.day.to_degrees() - t.night.to_degrees()) >= 3.0 - 1e-9);
    }

    #[test]
    fn tick_emits_edge_only_on_transition() {
        let mut sites = HashMap::new();
        sites.insert("G1".to_string(), onsala());
        let mut clock = AstronomicalClock::new(sites);
        let noon = Utc.with_ymd_and_hms(2023, 6, 21, 12, 0, 0).unwrap();
        let first = clock.tick(noon);
        assert!(first
            .iter()
            .any(|e| matches!(e, ClockEvent::RegimeEdge { regime: SkyRegime::Day, .. })));
        let second = clock.tick(noon + chrono::Duration::minutes(5));
        assert!(second.is_empty() || matches!(second[0], ClockEvent::DayAdvance));
    }

    #[test]
    fn unknown_group_has_no_regime() {
        let clock = AstronomicalClock::new(HashMap::new());
        let now = Utc::now();
        assert_eq!(clock.regime_for("nope", now), None);
    }
}
