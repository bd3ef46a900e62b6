//! XML configuration file, loaded with `quick-xml`'s serde
//! support.
//!
//! Grounded on `examples/original_source/gtoaes_hr/src/parameter.h`'s
//! `param_config`: network ports, NTP, database URL, plan root + daily
//! check time, per-site geography and per-system elevation limits, and
//! the day/night sun-altitude thresholds. The element layout here nests
//! the repeated `Site`/`System` entries under their own wrapper elements
//! rather than the original's flat sibling-tag scheme, since that's the
//! shape `quick-xml`'s serde integration deserializes cleanly.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::astro::Location;
use crate::clock::{Site, Thresholds};
use crate::ids::SystemId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: quick_xml::de::DeError,
    },
    #[error("failed to render default config: {0}")]
    Render(#[source] quick_xml::se::SeError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkServerConfig {
    #[serde(rename = "@Client")]
    pub client: u16,
    #[serde(rename = "@Mount")]
    pub mount: u16,
    #[serde(rename = "@Camera")]
    pub camera: u16,
    #[serde(rename = "@TelescopeGeneric")]
    pub telescope_generic: u16,
    #[serde(rename = "@Annex")]
    pub annex: u16,
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        NetworkServerConfig {
            client: 4010,
            mount: 4011,
            camera: 4012,
            telescope_generic: 4013,
            annex: 4014,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NtpConfig {
    #[serde(rename = "@Enabled")]
    pub enabled: bool,
    #[serde(rename = "@Host")]
    pub host: String,
    #[serde(rename = "@MaxDiffMs")]
    pub max_diff_ms: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            enabled: false,
            host: "172.28.1.3".to_string(),
            max_diff_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(rename = "@Enabled")]
    pub enabled: bool,
    #[serde(rename = "@Url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            enabled: false,
            url: "http://localhost:8080/".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObsPlanConfig {
    #[serde(rename = "@Path")]
    pub path: PathBuf,
    #[serde(rename = "@CheckLocalTime")]
    pub check_local_time: String,
}

impl Default for ObsPlanConfig {
    fn default() -> Self {
        ObsPlanConfig {
            path: PathBuf::from("/var/lib/obsdaemon/plans"),
            check_local_time: "17:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SunCenterAltConfig {
    #[serde(rename = "@Day")]
    pub day: f64,
    #[serde(rename = "@Night")]
    pub night: f64,
}

impl Default for SunCenterAltConfig {
    fn default() -> Self {
        SunCenterAltConfig { day: -6.0, night: -12.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteEntry {
    #[serde(rename = "@Gid")]
    pub gid: String,
    #[serde(rename = "@Name")]
    pub name: String,
    #[serde(rename = "@LonDeg")]
    pub lon_deg: f64,
    #[serde(rename = "@LatDeg")]
    pub lat_deg: f64,
    #[serde(rename = "@AltM")]
    pub alt_m: f64,
    #[serde(rename = "@Timezone")]
    pub timezone: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SitesConfig {
    #[serde(default, rename = "Site")]
    pub sites: Vec<SiteEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEntry {
    #[serde(rename = "@Gid")]
    pub gid: String,
    #[serde(rename = "@Uid")]
    pub uid: String,
    #[serde(rename = "@ElevationLimitDeg")]
    pub elevation_limit_deg: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemsConfig {
    #[serde(default, rename = "System")]
    pub systems: Vec<SystemEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename = "ObservatoryConfig")]
pub struct Config {
    #[serde(default)]
    pub network_server: NetworkServerConfig,
    #[serde(default)]
    pub ntp: NtpConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub obs_plan: ObsPlanConfig,
    #[serde(default)]
    pub sun_center_alt: SunCenterAltConfig,
    #[serde(default)]
    pub sites: SitesConfig,
    #[serde(default)]
    pub systems: SystemsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            network_server: NetworkServerConfig::default(),
            ntp: NtpConfig::default(),
            database: DatabaseConfig::default(),
            obs_plan: ObsPlanConfig::default(),
            sun_center_alt: SunCenterAltConfig::default(),
            sites: SitesConfig {
                sites: vec![SiteEntry {
                    gid: "001".to_string(),
                    name: "Xinglong".to_string(),
                    lon_deg: 117.574541_666_666_67,
                    lat_deg: 40.395_933_333_333_33,
                    alt_m: 900.0,
                    timezone: 8,
                }],
            },
            systems: SystemsConfig {
                systems: vec![SystemEntry {
                    gid: "001".to_string(),
                    uid: "001".to_string(),
                    elevation_limit_deg: 20.0,
                }],
            },
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        quick_xml::de::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Writes a commented, fully-populated default configuration to
    /// `path` — the daemon's `-d` CLI flag.
    pub async fn write_default(path: &Path) -> Result<(), ConfigError> {
        let config = Config::default();
        let xml = quick_xml::se::to_string(&config).map_err(ConfigError::Render)?;
        tokio::fs::write(path, xml)
            .await
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    /// Per-site astronomical geometry and regime thresholds, keyed by
    /// gid, as consumed by [`crate::clock::AstronomicalClock`].
    pub fn clock_sites(&self) -> std::collections::HashMap<String, Site> {
        let thresholds = Thresholds::from_degrees(self.sun_center_alt.day, self.sun_center_alt.night);
        self.sites
            .sites
            .iter()
            .map(|entry| {
                (
                    entry.gid.clone(),
                    Site {
                        location: Location {
                            longitude: entry.lon_deg.to_radians(),
                            latitude: entry.lat_deg.to_radians(),
                        },
                        thresholds,
                    },
                )
            })
            .collect()
    }

    /// The `(SystemId, elevation limit)` pairs the Coordinator registers
    /// at startup.
    pub fn registered_systems(&self) -> Vec<(SystemId, f64)> {
        self.systems
            .systems
            .iter()
            .map(|entry| (SystemId::new(entry.gid.clone(), entry.uid.clone()), entry.elevation_limit_deg))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_config_round_trips_through_xml() {
        let config = Config::default();
        let xml = quick_xml::se::to_string(&config).unwrap();
        let parsed: Config = quick_xml::de::from_str(&xml).unwrap();
        assert_eq!(parsed.network_server.client, 4010);
        assert_eq!(parsed.sites.sites.len(), 1);
        assert_eq!(parsed.systems.systems[0].gid, "001");
    }

    #[test]
    fn clock_sites_converts_degrees_to_radians() {
        let config = Config::default();
        let sites = config.clock_sites();
        let site = sites.get("001").unwrap();
        assert!((site.location.latitude - 40.395_933_333_333_33f64.to_radians()).abs() < 1e-9);
    }
}
