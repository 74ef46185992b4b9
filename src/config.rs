use crate::error::{Result, RotationError};
use rand::Rng;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_SA_JSON_FOLDER: &str = "/root/.config/rclone/accounts";
pub const DEFAULT_RCLONE_CONFIG_PATH: &str = "/root/.config/rclone/rclone.conf";
pub const DEFAULT_RCLONE_DEST_NAME: &str = "GoogleDrive";
/// 750 GB, decimal on purpose: the upstream daily quota is counted in GB.
pub const DEFAULT_SIZE_THRESHOLD: u64 = 750 * 1000 * 1000 * 1000;
pub const DEFAULT_STALL_POLLS: u32 = 100;
pub const DEFAULT_MAX_POLL_FAILURES: u32 = 3;
pub const RATE_LIMIT_MARKER: &str = "userRateLimitExceeded";
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 5573..=5582;

pub const RULE_SIZE_CAP: &str = "up_than_750";
pub const RULE_RATE_LIMIT: &str = "error_user_rate_limit";
pub const RULE_STALLED: &str = "zero_transferred_between_check_interval";
pub const RULE_ALL_IDLE: &str = "all_transfers_in_zero";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SyncAction {
    #[default]
    Copy,
    Move,
}

impl SyncAction {
    pub fn as_arg(&self) -> &'static str {
        match self {
            SyncAction::Copy => "copy",
            SyncAction::Move => "move",
        }
    }
}

/// How the chosen credential reaches rclone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchWay {
    /// Appends `--drive-service-account-file` to every launch.
    Runtime,
    /// Rewrites `service_account_file` of a remote in rclone.conf before every launch.
    Config {
        rclone_config_path: PathBuf,
        dest_name: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationRules {
    pub size_cap: bool,
    pub rate_limit_error: bool,
    pub stalled_transfer: bool,
    pub all_idle: bool,
}

impl Default for RotationRules {
    fn default() -> Self {
        Self {
            size_cap: true,
            rate_limit_error: true,
            stalled_transfer: true,
            all_idle: true,
        }
    }
}

impl RotationRules {
    pub fn none() -> Self {
        Self {
            size_cap: false,
            rate_limit_error: false,
            stalled_transfer: false,
            all_idle: false,
        }
    }

    pub fn enabled_count(&self) -> u32 {
        [
            self.size_cap,
            self.rate_limit_error,
            self.stalled_transfer,
            self.all_idle,
        ]
        .iter()
        .filter(|r| **r)
        .count() as u32
    }

    /// Parses a comma separated list of rule names.
    pub fn parse(list: &str) -> Result<Self> {
        let mut rules = Self::none();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match name {
                RULE_SIZE_CAP => rules.size_cap = true,
                RULE_RATE_LIMIT => rules.rate_limit_error = true,
                RULE_STALLED => rules.stalled_transfer = true,
                RULE_ALL_IDLE => rules.all_idle = true,
                other => {
                    return Err(RotationError::InvalidConfig(format!(
                        "unknown rotation rule '{}'",
                        other
                    )))
                }
            }
        }
        Ok(rules)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rc_addr: String,
    pub credential_dir: PathBuf,
    pub rclone_binary: String,
    pub size_threshold: u64,
    pub stall_polls: u32,
    pub warmup: Duration,
    pub poll_interval: Duration,
    pub rotation_level: u32,
    pub rules: RotationRules,
    pub rate_limit_marker: String,
    pub max_poll_failures: u32,
    pub switch_way: SwitchWay,
    pub lock_path: PathBuf,
    pub state_path: PathBuf,
    pub rclone_log_file: PathBuf,
    pub script_log_file: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::with_rc_addr("localhost:5572")
    }
}

impl Config {
    /// Defaults with every path derived from `rc_addr`.
    pub fn with_rc_addr(rc_addr: &str) -> Self {
        Self {
            rc_addr: rc_addr.to_string(),
            credential_dir: PathBuf::from(DEFAULT_SA_JSON_FOLDER),
            rclone_binary: "rclone".to_string(),
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            stall_polls: DEFAULT_STALL_POLLS,
            warmup: Duration::from_secs(5),
            poll_interval: Duration::from_secs(3),
            rotation_level: 2,
            rules: RotationRules::default(),
            rate_limit_marker: RATE_LIMIT_MARKER.to_string(),
            max_poll_failures: DEFAULT_MAX_POLL_FAILURES,
            switch_way: SwitchWay::Runtime,
            lock_path: PathBuf::from(format!("/tmp/autorclone_{rc_addr}.lock")),
            state_path: PathBuf::from(format!("/tmp/autorclone_{rc_addr}.conf")),
            rclone_log_file: PathBuf::from(format!("/tmp/rclone_{rc_addr}.log")),
            script_log_file: Some(PathBuf::from(format!("/tmp/autorclone_{rc_addr}.log"))),
            log_level: "info".to_string(),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let rc_addr = match get("RC_ADDR") {
            Some(addr) => normalize_rc_addr(&addr),
            None => random_rc_addr(),
        };
        let mut config = Self::with_rc_addr(&rc_addr);

        if let Some(dir) = get("SA_JSON_FOLDER") {
            config.credential_dir = PathBuf::from(dir);
        }
        if let Some(bin) = get("RCLONE_BINARY") {
            config.rclone_binary = bin;
        }
        config.size_threshold =
            parse_or("SWITCH_SA_SIZE_THRESHOLD", get("SWITCH_SA_SIZE_THRESHOLD"), config.size_threshold)?;
        config.stall_polls = parse_or("SWITCH_SA_STALL_POLLS", get("SWITCH_SA_STALL_POLLS"), config.stall_polls)?;
        config.warmup = Duration::from_secs(parse_or(
            "CHECK_AFTER_START_SECS",
            get("CHECK_AFTER_START_SECS"),
            config.warmup.as_secs(),
        )?);
        config.poll_interval = Duration::from_secs(parse_or(
            "CHECK_INTERVAL_SECS",
            get("CHECK_INTERVAL_SECS"),
            config.poll_interval.as_secs(),
        )?);
        config.rotation_level = parse_or("SWITCH_SA_LEVEL", get("SWITCH_SA_LEVEL"), config.rotation_level)?;
        if let Some(list) = get("SWITCH_SA_RULES") {
            config.rules = RotationRules::parse(&list)?;
        }

        config.switch_way = match get("SWITCH_SA_WAY").as_deref().map(str::to_lowercase).as_deref() {
            None | Some("runtime") => SwitchWay::Runtime,
            Some("config") => SwitchWay::Config {
                rclone_config_path: get("RCLONE_CONFIG_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_RCLONE_CONFIG_PATH)),
                dest_name: get("RCLONE_DEST_NAME")
                    .unwrap_or_else(|| DEFAULT_RCLONE_DEST_NAME.to_string()),
            },
            Some(other) => {
                return Err(RotationError::InvalidConfig(format!(
                    "SWITCH_SA_WAY must be 'runtime' or 'config', got '{}'",
                    other
                )))
            }
        };

        // Present but empty disables the script log file.
        match lookup("AUTORCLONE_LOG_FILE") {
            Some(v) if v.trim().is_empty() => config.script_log_file = None,
            Some(v) => config.script_log_file = Some(PathBuf::from(v)),
            None => {}
        }
        if let Some(level) = get("LOG_LEVEL") {
            config.log_level = level.to_lowercase();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let enabled = self.rules.enabled_count();
        if self.rotation_level == 0 {
            return Err(RotationError::InvalidConfig(
                "SWITCH_SA_LEVEL must be at least 1".to_string(),
            ));
        }
        if self.rotation_level > enabled {
            return Err(RotationError::InvalidConfig(format!(
                "SWITCH_SA_LEVEL {} exceeds the {} enabled rotation rules",
                self.rotation_level, enabled
            )));
        }
        if self.max_poll_failures == 0 {
            return Err(RotationError::InvalidConfig(
                "poll failure cap must be at least 1".to_string(),
            ));
        }
        if self.credential_dir.as_os_str().is_empty() {
            return Err(RotationError::InvalidConfig(
                "SA_JSON_FOLDER must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Finds the sync binary on `PATH` (or checks an explicit path) before anything is launched.
    pub fn resolve_rclone_binary(&self) -> Result<PathBuf> {
        which::which(&self.rclone_binary).map_err(|e| {
            RotationError::InvalidConfig(format!(
                "rclone binary '{}' not found: {}",
                self.rclone_binary, e
            ))
        })
    }
}

/// `:5572` becomes `localhost:5572`; anything else is kept.
pub fn normalize_rc_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("localhost{addr}")
    } else {
        addr.to_string()
    }
}

fn random_rc_addr() -> String {
    let port = rand::thread_rng().gen_range(RANDOM_PORT_RANGE);
    format!("localhost:{port}")
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T> {
    match raw {
        None => Ok(default),
        Some(v) => v.trim().parse().map_err(|_| {
            RotationError::InvalidConfig(format!("{} has an invalid value '{}'", key, v))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn prefixes_bare_port_with_localhost() {
        assert_eq!(normalize_rc_addr(":5572"), "localhost:5572");
        assert_eq!(normalize_rc_addr("127.0.0.1:5580"), "127.0.0.1:5580");
    }

    #[test]
    fn random_port_stays_in_range_and_derives_paths() {
        let config = Config::from_lookup(lookup(&[])).expect("defaults are valid");
        let port: u16 = config
            .rc_addr
            .strip_prefix("localhost:")
            .and_then(|p| p.parse().ok())
            .expect("localhost port");
        assert!(RANDOM_PORT_RANGE.contains(&port));
        assert_eq!(
            config.lock_path,
            PathBuf::from(format!("/tmp/autorclone_{}.lock", config.rc_addr))
        );
        assert_eq!(
            config.state_path,
            PathBuf::from(format!("/tmp/autorclone_{}.conf", config.rc_addr))
        );
    }

    #[test]
    fn reads_tunables_and_rule_list() {
        let config = Config::from_lookup(lookup(&[
            ("RC_ADDR", ":6000"),
            ("SWITCH_SA_LEVEL", "1"),
            ("SWITCH_SA_RULES", "error_user_rate_limit, all_transfers_in_zero"),
            ("CHECK_INTERVAL_SECS", "10"),
            ("SWITCH_SA_SIZE_THRESHOLD", "1000"),
            ("AUTORCLONE_LOG_FILE", ""),
        ]))
        .expect("valid config");
        assert_eq!(config.rc_addr, "localhost:6000");
        assert_eq!(config.rotation_level, 1);
        assert!(config.rules.rate_limit_error && config.rules.all_idle);
        assert!(!config.rules.size_cap && !config.rules.stalled_transfer);
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.size_threshold, 1000);
        assert_eq!(config.script_log_file, None);
    }

    #[test]
    fn rejects_level_above_enabled_rules() {
        let err = Config::from_lookup(lookup(&[
            ("SWITCH_SA_LEVEL", "3"),
            ("SWITCH_SA_RULES", "up_than_750,all_transfers_in_zero"),
        ]))
        .unwrap_err();
        assert!(matches!(err, RotationError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_unknown_rule_and_switch_way() {
        assert!(RotationRules::parse("up_than_750,bogus").is_err());
        let err = Config::from_lookup(lookup(&[("SWITCH_SA_WAY", "magic")])).unwrap_err();
        assert!(err.is_startup());
    }

    #[test]
    fn missing_rclone_binary_is_a_startup_error() {
        let mut config = Config::default();
        config.rclone_binary = "autorclone-no-such-binary".to_string();
        let err = config.resolve_rclone_binary().unwrap_err();
        assert!(err.is_startup());

        config.rclone_binary = "sh".to_string();
        assert!(config.resolve_rclone_binary().is_ok());
    }

    #[test]
    fn config_way_picks_up_remote_settings() {
        let config = Config::from_lookup(lookup(&[
            ("SWITCH_SA_WAY", "config"),
            ("RCLONE_DEST_NAME", "TeamDrive"),
        ]))
        .expect("valid config");
        assert_eq!(
            config.switch_way,
            SwitchWay::Config {
                rclone_config_path: PathBuf::from(DEFAULT_RCLONE_CONFIG_PATH),
                dest_name: "TeamDrive".to_string(),
            }
        );
    }
}
