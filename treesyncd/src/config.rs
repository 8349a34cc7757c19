use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::sync::local::ScanMode;
use crate::sync::paths::validate_sync_dir_name;

const DEFAULT_POLL_SECS: u64 = 30;
const DEFAULT_LISTEN: &str = "127.0.0.1:7070";
const APP_DIR: &str = "treesync";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("home directory is unavailable")]
    NoHome,
    #[error("invalid sync directory {name:?} in {var}")]
    InvalidDirectory { var: &'static str, name: String },
    #[error("invalid account entry {0:?}, expected name:password[:admin]")]
    InvalidAccount(String),
    #[error("invalid listen address {0:?}")]
    InvalidListen(String),
    #[error("invalid scan mode {0:?}, expected deep or shallow")]
    InvalidScanMode(String),
}

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server: String,
    pub account: String,
    pub password: String,
    pub sync_root: PathBuf,
    pub state_dir: PathBuf,
    pub directories: Vec<String>,
    pub history: bool,
    pub poll_interval: Duration,
    pub digest_pruning: bool,
    pub scan_mode: ScanMode,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = lookup("TREESYNC_SERVER").ok_or(ConfigError::Missing("TREESYNC_SERVER"))?;
        let account = lookup("TREESYNC_ACCOUNT").ok_or(ConfigError::Missing("TREESYNC_ACCOUNT"))?;
        let password = lookup("TREESYNC_PASSWORD").unwrap_or_default();
        let sync_root = lookup("TREESYNC_SYNC_ROOT")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join("TreeSync"));
        let state_dir = lookup("TREESYNC_STATE_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_state_dir);
        let directories = parse_directories(
            "TREESYNC_DIRECTORIES",
            lookup("TREESYNC_DIRECTORIES").as_deref().unwrap_or("default"),
        )?;
        let scan_mode = match lookup("TREESYNC_SCAN_MODE") {
            None => ScanMode::Deep,
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "deep" => ScanMode::Deep,
                "shallow" => ScanMode::Shallow,
                _ => return Err(ConfigError::InvalidScanMode(value)),
            },
        };

        Ok(Self {
            server,
            account,
            password,
            sync_root,
            state_dir,
            directories,
            history: read_bool(&lookup, "TREESYNC_HISTORY", true),
            poll_interval: Duration::from_secs(read_u64(
                &lookup,
                "TREESYNC_POLL_SECS",
                DEFAULT_POLL_SECS,
            )),
            digest_pruning: read_bool(&lookup, "TREESYNC_DIGEST_PRUNING", false),
            scan_mode,
        })
    }

    /// Store file of the configured account.
    pub fn store_path(&self) -> PathBuf {
        self.state_dir.join(format!("{}.db", self.account))
    }

    pub fn directory_root(&self, directory: &str) -> PathBuf {
        self.sync_root.join(directory)
    }

    pub fn history_root(&self, directory: &str) -> PathBuf {
        self.state_dir.join("history").join(directory)
    }
}

/// One entry of `TREESYNC_ACCOUNTS`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AccountSpec {
    pub name: String,
    pub password: String,
    pub admin: bool,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub data_dir: PathBuf,
    pub accounts: Vec<AccountSpec>,
    pub history: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHome)?;
        Self::from_lookup(|name| std::env::var(name).ok(), &home)
    }

    pub fn from_lookup<F>(lookup: F, home: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_raw = lookup("TREESYNC_LISTEN").unwrap_or_else(|| DEFAULT_LISTEN.to_string());
        let listen = listen_raw
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen_raw.clone()))?;
        let data_dir = lookup("TREESYNC_DATA_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(default_data_dir);
        let accounts = parse_accounts(
            &lookup("TREESYNC_ACCOUNTS").ok_or(ConfigError::Missing("TREESYNC_ACCOUNTS"))?,
        )?;

        Ok(Self {
            listen,
            data_dir,
            accounts,
            history: read_bool(&lookup, "TREESYNC_HISTORY", true),
        })
    }

    pub fn account_dir(&self, account: &str) -> PathBuf {
        self.data_dir.join(account)
    }
}

pub fn parse_accounts(raw: &str) -> Result<Vec<AccountSpec>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let name = parts.next().unwrap_or_default();
            let password = parts
                .next()
                .ok_or_else(|| ConfigError::InvalidAccount(entry.to_string()))?;
            let admin = match parts.next() {
                None => false,
                Some("admin") => true,
                Some(_) => return Err(ConfigError::InvalidAccount(entry.to_string())),
            };
            if validate_sync_dir_name(name).is_err() {
                return Err(ConfigError::InvalidAccount(entry.to_string()));
            }
            Ok(AccountSpec {
                name: name.to_string(),
                password: password.to_string(),
                admin,
            })
        })
        .collect()
}

fn parse_directories(var: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut out = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|name| !name.is_empty()) {
        validate_sync_dir_name(name).map_err(|_| ConfigError::InvalidDirectory {
            var,
            name: name.to_string(),
        })?;
        if !out.iter().any(|known| known == name) {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_DIR)
        .join("server")
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn expands_tilde_to_home() {
        let home = PathBuf::from("/tmp/home-user");
        assert_eq!(
            expand_with_home("~/TreeSync", &home),
            PathBuf::from("/tmp/home-user/TreeSync")
        );
        assert_eq!(expand_with_home("/abs", &home), PathBuf::from("/abs"));
    }

    #[test]
    fn client_config_uses_defaults() {
        let home = PathBuf::from("/home/u");
        let config = ClientConfig::from_lookup(
            vars(&[("TREESYNC_SERVER", "127.0.0.1:7070"), ("TREESYNC_ACCOUNT", "alice")]),
            &home,
        )
        .unwrap();

        assert_eq!(config.sync_root, PathBuf::from("/home/u/TreeSync"));
        assert_eq!(config.directories, vec!["default".to_string()]);
        assert_eq!(config.poll_interval, Duration::from_secs(DEFAULT_POLL_SECS));
        assert_eq!(config.scan_mode, ScanMode::Deep);
        assert!(config.history);
        assert!(!config.digest_pruning);
        assert!(config.store_path().ends_with("alice.db"));
    }

    #[test]
    fn client_config_reads_overrides() {
        let home = PathBuf::from("/home/u");
        let config = ClientConfig::from_lookup(
            vars(&[
                ("TREESYNC_SERVER", "host:1"),
                ("TREESYNC_ACCOUNT", "bob"),
                ("TREESYNC_SYNC_ROOT", "~/sync"),
                ("TREESYNC_DIRECTORIES", "docs, music,docs"),
                ("TREESYNC_HISTORY", "off"),
                ("TREESYNC_POLL_SECS", "0"),
                ("TREESYNC_SCAN_MODE", "Shallow"),
            ]),
            &home,
        )
        .unwrap();

        assert_eq!(config.sync_root, PathBuf::from("/home/u/sync"));
        assert_eq!(config.directories, vec!["docs".to_string(), "music".to_string()]);
        assert!(!config.history);
        assert_eq!(config.poll_interval, Duration::from_secs(DEFAULT_POLL_SECS));
        assert_eq!(config.scan_mode, ScanMode::Shallow);
    }

    #[test]
    fn client_config_rejects_bad_directory_names() {
        let result = ClientConfig::from_lookup(
            vars(&[
                ("TREESYNC_SERVER", "host:1"),
                ("TREESYNC_ACCOUNT", "bob"),
                ("TREESYNC_DIRECTORIES", "my docs"),
            ]),
            Path::new("/home/u"),
        );
        assert!(matches!(result, Err(ConfigError::InvalidDirectory { .. })));
    }

    #[test]
    fn client_config_requires_server() {
        let result = ClientConfig::from_lookup(vars(&[]), Path::new("/home/u"));
        assert!(matches!(result, Err(ConfigError::Missing("TREESYNC_SERVER"))));
    }

    #[test]
    fn parses_account_list() {
        let accounts = parse_accounts("alice:secret:admin, bob:pw").unwrap();
        assert_eq!(
            accounts,
            vec![
                AccountSpec {
                    name: "alice".into(),
                    password: "secret".into(),
                    admin: true,
                },
                AccountSpec {
                    name: "bob".into(),
                    password: "pw".into(),
                    admin: false,
                },
            ]
        );
        assert!(parse_accounts("nopassword").is_err());
        assert!(parse_accounts("a:b:root").is_err());
    }

    #[test]
    fn server_config_parses_listen_address() {
        let config = ServerConfig::from_lookup(
            vars(&[
                ("TREESYNC_LISTEN", "0.0.0.0:9000"),
                ("TREESYNC_ACCOUNTS", "alice:pw"),
                ("TREESYNC_DATA_DIR", "~/srv"),
            ]),
            Path::new("/home/u"),
        )
        .unwrap();
        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.account_dir("alice"), PathBuf::from("/home/u/srv/alice"));

        let bad = ServerConfig::from_lookup(
            vars(&[("TREESYNC_LISTEN", "nowhere"), ("TREESYNC_ACCOUNTS", "a:b")]),
            Path::new("/home/u"),
        );
        assert!(matches!(bad, Err(ConfigError::InvalidListen(_))));
    }
}
