/*! Persistent settings store.

Tunables and the fleet-server list live in `settings.conf`, a small INI
file under the configuration directory. Every change is written
through immediately so a power cut never loses the session counter.

Note the `Connnection` section name: the triple-n spelling is part of
the deployed file format and is kept for compatibility.
*/
use std::path::{Path, PathBuf};

use ini::Ini;
use log::warn;

use crate::{Error, Result};

/// Name of the settings file under the configuration directory.
pub const SETTINGS_FILE: &str = "settings.conf";

/// Largest number of servers kept in the failover list.
pub const SERVER_LIST_MAX: usize = 5;

const SECTION_NETWORK: &str = "Network";
const SECTION_CONNECTION: &str = "Connnection";
const SECTION_SERVER: &str = "Server";
const SECTION_CONFIG: &str = "Config";

/// All persisted tunables, pre-validated to their documented ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// VIN the stored session counter belongs to.
    pub last_vin: String,
    /// Login session counter, monotonically increasing per VIN.
    pub session: u16,
    /// Server answer timeout in seconds, 1..=600.
    pub answer_timeout: u32,
    /// Idle time before a heartbeat in seconds, 1..=240.
    pub heartbeat_timeout: u32,
    /// Normal report period in seconds, 1..=600.
    pub report_normal_timeout: u32,
    /// Emergency report period in seconds, 1..=600.
    pub report_emergency_timeout: u32,
    /// Decoded-log update period in milliseconds, 1..=60000.
    pub log_update_ms: u32,
    /// Fleet servers in failover order, `host[:port]`.
    pub servers: Vec<String>,
    /// Gravity event threshold pushed to the MCU, 0..=100.
    pub gravity_threshold: u8,
    /// Daily wake time (hour, minute), when configured.
    pub daily_alarm: Option<(u8, u8)>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_vin: String::new(),
            session: 0,
            answer_timeout: 60,
            heartbeat_timeout: 10,
            report_normal_timeout: 5,
            report_emergency_timeout: 1,
            log_update_ms: 10000,
            servers: Vec::new(),
            gravity_threshold: 0,
            daily_alarm: None,
        }
    }
}

impl Settings {
    /// Reset the server-tunable parameters to their defaults, keeping
    /// identity (VIN, session) and the server list.
    pub fn reset_tunables(&mut self) {
        let d = Settings::default();
        self.answer_timeout = d.answer_timeout;
        self.heartbeat_timeout = d.heartbeat_timeout;
        self.report_normal_timeout = d.report_normal_timeout;
        self.report_emergency_timeout = d.report_emergency_timeout;
        self.log_update_ms = d.log_update_ms;
    }
}

fn ranged(value: Option<&str>, min: u32, max: u32, default: u32) -> u32 {
    match value.and_then(|v| v.trim().parse::<u32>().ok()) {
        Some(v) if (min..=max).contains(&v) => v,
        _ => default,
    }
}

/// Settings plus the file they persist to.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    /// Current settings. Mutate and call [ConfigStore::sync].
    pub settings: Settings,
}

impl ConfigStore {
    /// Load `settings.conf` from `dir`.
    ///
    /// A missing or unparseable file keeps compiled-in defaults. The
    /// stored session counter only survives when the stored VIN
    /// matches `vin`.
    #[must_use]
    pub fn load(dir: &Path, vin: &str) -> Self {
        let path = dir.join(SETTINGS_FILE);
        let mut settings = Settings {
            last_vin: vin.to_string(),
            ..Settings::default()
        };
        match Ini::load_from_file(&path) {
            Ok(ini) => {
                let stored_vin = ini.get_from(Some(SECTION_NETWORK), "LastVIN").unwrap_or("");
                if stored_vin == vin {
                    settings.session = ini
                        .get_from(Some(SECTION_NETWORK), "LastSession")
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(0);
                }
                let get = |key: &str| ini.get_from(Some(SECTION_CONNECTION), key);
                settings.answer_timeout = ranged(get("AnswerTimeout"), 1, 600, 60);
                settings.heartbeat_timeout = ranged(get("HeartbeatTimeout"), 1, 240, 10);
                settings.report_normal_timeout = ranged(get("ReportNormalTimeout"), 1, 600, 5);
                settings.report_emergency_timeout =
                    ranged(get("ReportEmergencyTimeout"), 1, 600, 1);
                settings.log_update_ms = ranged(get("LocalLogUpdateTimeout"), 1, 60000, 10000);
                for i in 1..=SERVER_LIST_MAX {
                    if let Some(host) = ini.get_from(Some(SECTION_SERVER), &format!("Host{i}")) {
                        settings.servers.push(host.to_string());
                    }
                }
                if let Some(v) = ini.get_from(Some(SECTION_CONFIG), "GravityThreshold")
                    && let Ok(v) = v.trim().parse::<u32>()
                    && v <= 100
                {
                    settings.gravity_threshold = v as u8;
                }
                if let Some(h) = ini.get_from(Some(SECTION_CONFIG), "DailyAlarmClockHour")
                    && let Ok(h) = h.trim().parse::<u32>()
                    && h <= 23
                {
                    let m = ini
                        .get_from(Some(SECTION_CONFIG), "DailyAlarmClockMinute")
                        .and_then(|v| v.trim().parse::<u32>().ok())
                        .filter(|&m| m < 60)
                        .unwrap_or(0);
                    settings.daily_alarm = Some((h as u8, m as u8));
                }
            }
            Err(e) => {
                warn!("config: cannot load {}: {e}, using defaults", path.display());
            }
        }
        Self { path, settings }
    }

    /// Write the current settings through to disk.
    ///
    /// Keys this agent does not know about are preserved.
    pub fn sync(&self) -> Result<()> {
        let mut ini = Ini::load_from_file(&self.path).unwrap_or_default();
        let s = &self.settings;
        ini.with_section(Some(SECTION_NETWORK))
            .set("LastVIN", s.last_vin.clone())
            .set("LastSession", s.session.to_string());
        ini.with_section(Some(SECTION_CONNECTION))
            .set("AnswerTimeout", s.answer_timeout.to_string())
            .set("HeartbeatTimeout", s.heartbeat_timeout.to_string())
            .set("ReportNormalTimeout", s.report_normal_timeout.to_string())
            .set("ReportEmergencyTimeout", s.report_emergency_timeout.to_string())
            .set("LocalLogUpdateTimeout", s.log_update_ms.to_string());
        for (i, host) in s.servers.iter().take(SERVER_LIST_MAX).enumerate() {
            ini.with_section(Some(SECTION_SERVER))
                .set(format!("Host{}", i + 1), host.clone());
        }
        ini.with_section(Some(SECTION_CONFIG))
            .set("GravityThreshold", s.gravity_threshold.to_string());
        if let Some((h, m)) = s.daily_alarm {
            ini.with_section(Some(SECTION_CONFIG))
                .set("DailyAlarmClockHour", h.to_string())
                .set("DailyAlarmClockMinute", m.to_string());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        ini.write_to_file(&self.path)
            .map_err(|e| Error::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VIN: &str = "ABCDEFGHJKLMNPRST";

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path(), VIN);
        assert_eq!(store.settings.answer_timeout, 60);
        assert_eq!(store.settings.heartbeat_timeout, 10);
        assert_eq!(store.settings.report_normal_timeout, 5);
        assert_eq!(store.settings.report_emergency_timeout, 1);
        assert_eq!(store.settings.log_update_ms, 10000);
        assert_eq!(store.settings.session, 0);
        assert!(store.settings.servers.is_empty());
    }

    #[test]
    fn roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::load(dir.path(), VIN);
        store.settings.session = 41;
        store.settings.answer_timeout = 90;
        store.settings.heartbeat_timeout = 20;
        store.settings.servers = vec!["10.0.0.1:8700".into(), "10.0.0.2:8700".into()];
        store.settings.gravity_threshold = 35;
        store.settings.daily_alarm = Some((6, 30));
        store.sync().unwrap();

        let again = ConfigStore::load(dir.path(), VIN);
        assert_eq!(again.settings, store.settings);
    }

    #[test]
    fn session_resets_on_vin_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ConfigStore::load(dir.path(), VIN);
        store.settings.session = 7;
        store.sync().unwrap();

        let other = ConfigStore::load(dir.path(), "ANOTHERVIN0000001");
        assert_eq!(other.settings.session, 0);
        let same = ConfigStore::load(dir.path(), VIN);
        assert_eq!(same.settings.session, 7);
    }

    #[test]
    fn out_of_range_values_fall_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "[Connnection]\nAnswerTimeout=9999\nHeartbeatTimeout=0\nLocalLogUpdateTimeout=500\n",
        )
        .unwrap();
        let store = ConfigStore::load(dir.path(), VIN);
        assert_eq!(store.settings.answer_timeout, 60);
        assert_eq!(store.settings.heartbeat_timeout, 10);
        // 500 ms is within 1..=60000 and is kept.
        assert_eq!(store.settings.log_update_ms, 500);
    }

    #[test]
    fn unknown_keys_survive_sync() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            "[Extra]\nSomething=kept\n",
        )
        .unwrap();
        let store = ConfigStore::load(dir.path(), VIN);
        store.sync().unwrap();
        let text = std::fs::read_to_string(dir.path().join(SETTINGS_FILE)).unwrap();
        assert!(text.contains("Something=kept"));
        assert!(text.contains("[Connnection]"));
    }

    #[test]
    fn reset_tunables_keeps_identity() {
        let mut s = Settings {
            last_vin: VIN.into(),
            session: 12,
            answer_timeout: 90,
            servers: vec!["srv:1".into()],
            ..Settings::default()
        };
        s.reset_tunables();
        assert_eq!(s.answer_timeout, 60);
        assert_eq!(s.session, 12);
        assert_eq!(s.servers.len(), 1);
    }
}
