//! Station configuration: a TOML file, then environment overrides, then
//! command-line flags.
//!
//! ```toml
//! [station]
//! kind = "gcms"
//!
//! [relay]
//! url = "ws://192.168.58.8:8000/ws/room/gcms"
//! link = "room"
//!
//! [gcms]
//! base_url = "http://192.168.58.125:8082"
//! sequence_list = "sequences.txt"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Gcms,
    Hplc,
    /// Powder and liquid dispensing.
    Gypl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Link {
    Hub,
    #[default]
    Room,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    pub station: StationSection,
    pub relay: RelaySection,
    pub arm: ArmSection,
    pub balance: BalanceSection,
    pub gcms: GcmsSection,
    pub hplc: HplcSection,
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StationSection {
    pub kind: Kind,
    /// Name announced to the relay; defaults to the kind.
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySection {
    pub url: Option<String>,
    pub link: Link,
    /// Client id hub-mode replies are addressed to.
    pub reply_to: String,
    pub reconnect_secs: u64,
    /// Device status period; only stations with devices to report use it.
    pub status_interval_secs: Option<u64>,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            url: None,
            link: Link::Room,
            reply_to: lims_worker::DEFAULT_REPLY_TARGET.to_string(),
            reconnect_secs: 5,
            status_interval_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArmSection {
    pub address: String,
    pub timeout_secs: u64,
}

impl Default for ArmSection {
    fn default() -> Self {
        Self {
            address: "192.168.58.210:8055".to_string(),
            timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BalanceSection {
    pub port: String,
    pub baud: u32,
}

impl Default for BalanceSection {
    fn default() -> Self {
        Self {
            port: "COM21".to_string(),
            baud: 115_200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GcmsSection {
    pub base_url: String,
    pub qual_base_url: String,
    pub timeout_secs: u64,
    /// `index: file` lines.
    pub sequence_list: Option<PathBuf>,
    /// `index,sequence_file,data_name,data_path` table.
    pub sequence_params: Option<PathBuf>,
    pub default_sequence_file: Option<String>,
    pub msconvert: Option<PathBuf>,
    pub mzml_dir: PathBuf,
}

impl Default for GcmsSection {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.58.125:8082".to_string(),
            qual_base_url: "http://192.168.58.125:8082".to_string(),
            timeout_secs: 30,
            sequence_list: None,
            sequence_params: None,
            default_sequence_file: None,
            msconvert: None,
            mzml_dir: PathBuf::from("mzml"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HplcSection {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub cds_id: u32,
    pub timeout_secs: u64,
    pub remote_data: PathBuf,
    pub local_data: PathBuf,
}

impl Default for HplcSection {
    fn default() -> Self {
        Self {
            base_url: "http://192.168.58.131:9100".to_string(),
            username: "admin".to_string(),
            password: "agilent".to_string(),
            cds_id: 17,
            timeout_secs: 30,
            remote_data: PathBuf::from(r"\\192.168.58.132\Data"),
            local_data: PathBuf::from("Data"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    pub archive_dir: PathBuf,
    /// LIMS web API; task results are only submitted when set.
    pub task_store_url: Option<String>,
    pub task_store_token: Option<String>,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            archive_dir: PathBuf::from("archive"),
            task_store_url: None,
            task_store_token: None,
        }
    }
}

impl StationConfig {
    /// Read `path`, or start from defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply the environment variables the station processes honour.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(url) = var("LIMS_SERVER_URL") {
            self.storage.task_store_url = Some(url);
        }
        if let Some(url) = var("GCMS_QUAL_BASE_URL") {
            self.gcms.qual_base_url = url;
        }
        if let Some(url) = var("HPLC_BASE_URL") {
            self.hplc.base_url = url;
        }
        if let Some(user) = var("HPLC_USERNAME") {
            self.hplc.username = user;
        }
        if let Some(password) = var("HPLC_PASSWORD") {
            self.hplc.password = password;
        }
    }

    pub fn station_name(&self) -> String {
        self.station
            .name
            .clone()
            .unwrap_or_else(|| format!("{:?}", self.station.kind).to_lowercase())
    }

    /// The relay url, or the local default for this kind of station.
    pub fn relay_url(&self) -> String {
        if let Some(url) = &self.relay.url {
            return url.clone();
        }
        let name = self.station_name();
        match self.relay.link {
            Link::Room => format!("ws://127.0.0.1:8000/ws/room/{name}"),
            Link::Hub => format!("ws://127.0.0.1:8000/ws/relay/{name}"),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.relay.reconnect_secs)
    }

    pub fn status_interval(&self) -> Option<Duration> {
        match (self.station.kind, self.relay.status_interval_secs) {
            (_, Some(0)) => None,
            (_, Some(secs)) => Some(Duration::from_secs(secs)),
            // The dispensing station reports every second unless told otherwise.
            (Kind::Gypl, None) => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = StationConfig::parse("").unwrap();
        assert_eq!(config.station.kind, Kind::Gcms);
        assert_eq!(config.relay.link, Link::Room);
        assert_eq!(config.relay_url(), "ws://127.0.0.1:8000/ws/room/gcms");
        assert_eq!(config.hplc.cds_id, 17);
        assert_eq!(config.status_interval(), None);
    }

    #[test]
    fn sections_override_defaults() {
        let config = StationConfig::parse(
            r#"
            [station]
            kind = "gypl"
            name = "gypl_station_1"

            [relay]
            link = "hub"

            [balance]
            port = "/dev/ttyUSB0"
            "#,
        )
        .unwrap();
        assert_eq!(config.station.kind, Kind::Gypl);
        assert_eq!(config.relay_url(), "ws://127.0.0.1:8000/ws/relay/gypl_station_1");
        assert_eq!(config.balance.port, "/dev/ttyUSB0");
        assert_eq!(config.balance.baud, 115_200);
        assert_eq!(config.status_interval(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(StationConfig::parse("[station]\nkind = \"nmr\"\n").is_err());
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut config = StationConfig::parse("[hplc]\nusername = \"file\"\n").unwrap();
        let env: HashMap<&str, &str> = [
            ("HPLC_USERNAME", "env"),
            ("GCMS_QUAL_BASE_URL", "http://qual:1"),
            ("LIMS_SERVER_URL", "http://lims:8000"),
        ]
        .into();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.hplc.username, "env");
        assert_eq!(config.hplc.password, "agilent");
        assert_eq!(config.gcms.qual_base_url, "http://qual:1");
        assert_eq!(config.storage.task_store_url.as_deref(), Some("http://lims:8000"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let tmp = tempfile::tempdir().unwrap();
        let err = StationConfig::load(Some(&tmp.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
