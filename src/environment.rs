//! EnvironmentInfo: per-dome-group weather and slit state,
//! owned by the Coordinator and read by ObservationSystems through a
//! snapshot accessor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::clock::SkyRegime;
use crate::protocol::record::SlitState;

/// Slit-command retries cap at this many attempts per regime edge
///.
pub const MAX_SLIT_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    pub gid: String,
    pub slit: Option<SlitState>,
    pub rain: i32,
    pub regime: Option<SkyRegime>,
    pub slit_retries: u32,
}

impl EnvironmentInfo {
    pub fn new(gid: impl Into<String>) -> Self {
        EnvironmentInfo {
            gid: gid.into(),
            slit: None,
            rain: 0,
            regime: None,
            slit_retries: 0,
        }
    }

    pub fn is_clear(&self) -> bool {
        self.rain == 0
    }

    /// Resets the retry counter — called whenever the sky regime
    /// changes, since each regime edge gets its own retry budget.
    pub fn reset_retries(&mut self) {
        self.slit_retries = 0;
    }

    /// Records one slit-command attempt. Returns `true` if the attempt
    /// is within budget, `false` once the 4th failure should be
    /// suppressed until the next edge.
    pub fn record_retry(&mut self) -> bool {
        self.slit_retries += 1;
        self.slit_retries <= MAX_SLIT_RETRIES
    }
}

/// Coordinator-owned table of per-group environment state, with a
/// snapshot accessor for ObservationSystems.
#[derive(Clone)]
pub struct EnvironmentTable {
    inner: Arc<Mutex<HashMap<String, EnvironmentInfo>>>,
}

impl EnvironmentTable {
    pub fn new() -> Self {
        EnvironmentTable {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn snapshot(&self, gid: &str) -> Option<EnvironmentInfo> {
        self.inner.lock().await.get(gid).cloned()
    }

    pub async fn update_rain(&self, gid: &str, value: i32) -> (i32, bool) {
        let mut table = self.inner.lock().await;
        let entry = table
            .entry(gid.to_string())
            .or_insert_with(|| EnvironmentInfo::new(gid));
        let previous = entry.rain;
        entry.rain = value;
        (previous, previous != 0 && value == 0)
    }

    pub async fn update_slit(&self, gid: &str, state: SlitState) {
        let mut table = self.inner.lock().await;
        let entry = table
            .entry(gid.to_string())
            .or_insert_with(|| EnvironmentInfo::new(gid));
        entry.slit = Some(state);
    }

    /// Applies a regime transition, resetting the retry counter.
    /// Returns the previous regime, if any.
    pub async fn update_regime(&self, gid: &str, regime: SkyRegime) -> Option<SkyRegime> {
        let mut table = self.inner.lock().await;
        let entry = table
            .entry(gid.to_string())
            .or_insert_with(|| EnvironmentInfo::new(gid));
        let previous = entry.regime;
        entry.regime = Some(regime);
        entry.reset_retries();
        previous
    }

    pub async fn record_retry(&self, gid: &str) -> bool {
        let mut table = self.inner.lock().await;
        match table.get_mut(gid) {
            Some(entry) => entry.record_retry(),
            None => false,
        }
    }
}

impl Default for EnvironmentTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rain_transition_to_clear_is_detected() {
        let table = EnvironmentTable::new();
        table.update_rain("G1", 5).await;
        let (previous, cleared) = table.update_rain("G1", 0).await;
        assert_eq!(previous, 5);
        assert!(cleared);
    }

    #[tokio::test]
    async fn regime_change_resets_retries() {
        let table = EnvironmentTable::new();
        table.update_regime("G1", SkyRegime::Day).await;
        table.record_retry("G1").await;
        table.record_retry("G1").await;
        table.update_regime("G1", SkyRegime::Flat).await;
        let snap = table.snapshot("G1").await.unwrap();
        assert_eq!(snap.slit_retries, 0);
    }

    #[tokio::test]
    async fn retries_are_capped() {
        let table = EnvironmentTable::new();
        table.update_regime("G1", SkyRegime::Day).await;
        assert!(table.record_retry("G1").await);
        assert!(table.record_retry("G1").await);
        assert!(table.record_retry("G1").await);
        assert!(!table.record_retry("G1").await);
    }
}
