use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backup::{self, BackupPlan};
use crate::credential::CredentialSource;
use crate::error::{DevboxError, Result};
use crate::persist::{PersistItem, PersistProfile};
use crate::probe::{ProcessProbe, RDP_SESSION_PATTERN, SSH_SESSION_PATTERN};

pub const DEFAULT_IDLE_THRESHOLD_SECS: u64 = 300;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;
pub const DEFAULT_CREDENTIAL_ENV: &str = "PUBKEY";
const DEFAULT_HOME_ROOT: &str = "/root";
const DEFAULT_DATA_ROOT: &str = "/data";
const PERSIST_DIR_NAME: &str = ".config_persistence";
const DEFAULT_AUTHORIZED_KEYS: &str = ".ssh/authorized_keys";
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SSH_USER: &str = "root";
const DEFAULT_SSHD: &str = "/usr/sbin/sshd";

/// On-disk TOML layout. Every key is optional; see [`SessionConfig::resolve`].
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub idle_threshold_seconds: Option<u64>,
    pub poll_interval_seconds: Option<u64>,
    pub home_root: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub persist_root: Option<PathBuf>,
    pub profile: Option<PersistProfile>,
    pub persist_items: Option<Vec<PersistItem>>,
    pub credential_env: Option<String>,
    pub authorized_keys: Option<PathBuf>,
    pub extra_packages: Option<Vec<String>>,
    pub services: Option<Vec<Vec<String>>>,
    pub probe_pattern: Option<String>,
    #[serde(default)]
    pub backup: BackupFileConfig,
    pub endpoint: Option<EndpointFileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackupFileConfig {
    pub source_root: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub exclude: Option<Vec<String>>,
    pub timeout_seconds: Option<u64>,
    pub restore_on_start: Option<bool>,
    pub tar_bin: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            DevboxError::config(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::parse(&raw).map_err(|err| {
            DevboxError::config(format!("failed to parse config {}: {err}", path.display()))
        })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Command-line values that win over the file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub home_root: Option<PathBuf>,
    pub persist_root: Option<PathBuf>,
    pub profile: Option<PersistProfile>,
    pub idle_threshold_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub endpoint_host: Option<String>,
    pub endpoint_port: Option<u16>,
    pub no_restore: bool,
}

/// Where the operator should connect once the session is up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ssh {}@{} -p {}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupSettings {
    pub plan: BackupPlan,
    pub timeout_secs: u64,
    pub restore_on_start: bool,
    pub tar_bin: PathBuf,
}

impl BackupSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Fully resolved and validated session settings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub idle_threshold_secs: u64,
    pub poll_interval_secs: u64,
    pub home_root: PathBuf,
    pub data_root: PathBuf,
    pub persist_root: PathBuf,
    pub persist_items: Vec<PersistItem>,
    pub credential: CredentialSource,
    pub authorized_keys: PathBuf,
    pub extra_packages: Vec<String>,
    pub services: Vec<Vec<String>>,
    pub probe_pattern: String,
    pub backup: BackupSettings,
    pub endpoint: Option<Endpoint>,
}

impl SessionConfig {
    pub fn resolve(file: FileConfig, overrides: Overrides) -> Result<Self> {
        let idle_threshold_secs = overrides
            .idle_threshold_secs
            .or(file.idle_threshold_seconds)
            .unwrap_or(DEFAULT_IDLE_THRESHOLD_SECS);
        let poll_interval_secs = overrides
            .poll_interval_secs
            .or(file.poll_interval_seconds)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
        if idle_threshold_secs == 0 {
            return Err(DevboxError::config("idle threshold must be positive"));
        }
        if poll_interval_secs == 0 {
            return Err(DevboxError::config("poll interval must be positive"));
        }

        let home_root = overrides
            .home_root
            .or(file.home_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_ROOT));
        let data_root = file
            .data_root
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        let persist_root = overrides
            .persist_root
            .or(file.persist_root)
            .unwrap_or_else(|| data_root.join(PERSIST_DIR_NAME));
        for (name, path) in [
            ("home_root", &home_root),
            ("data_root", &data_root),
            ("persist_root", &persist_root),
        ] {
            if !path.is_absolute() {
                return Err(DevboxError::config(format!(
                    "{name} must be an absolute path, got {}",
                    path.display()
                )));
            }
        }

        // An explicit item list stands alone unless a profile is named too.
        let profile = overrides.profile.or(file.profile);
        let persist_items = match (profile, file.persist_items) {
            (None, Some(items)) => dedup_items(items),
            (profile, extra) => {
                let mut items = profile.unwrap_or_default().items();
                items.extend(extra.unwrap_or_default());
                dedup_items(items)
            }
        };

        let credential_env = file
            .credential_env
            .unwrap_or_else(|| DEFAULT_CREDENTIAL_ENV.to_string());
        if credential_env.trim().is_empty() {
            return Err(DevboxError::config("credential_env must name a variable"));
        }
        let authorized_keys = file
            .authorized_keys
            .map(|p| home_root.join(p))
            .unwrap_or_else(|| home_root.join(DEFAULT_AUTHORIZED_KEYS));

        check_item_layout(&persist_items, &home_root, &authorized_keys)?;

        let default_pattern = match profile {
            Some(PersistProfile::Rdp) => RDP_SESSION_PATTERN,
            _ => SSH_SESSION_PATTERN,
        };
        let probe_pattern = file
            .probe_pattern
            .unwrap_or_else(|| default_pattern.to_string());
        if probe_pattern.trim().is_empty() {
            return Err(DevboxError::config("probe_pattern must not be empty"));
        }
        ProcessProbe::new(&probe_pattern)?;

        let backup = resolve_backup(file.backup, &home_root, &data_root, overrides.no_restore)?;
        let endpoint = resolve_endpoint(
            file.endpoint,
            overrides.endpoint_host,
            overrides.endpoint_port,
        );

        Ok(Self {
            idle_threshold_secs,
            poll_interval_secs,
            home_root,
            data_root,
            persist_root,
            persist_items,
            credential: CredentialSource::Env(credential_env),
            authorized_keys,
            extra_packages: file.extra_packages.unwrap_or_default(),
            services: file
                .services
                .unwrap_or_else(|| vec![vec![DEFAULT_SSHD.to_string()]]),
            probe_pattern,
            backup,
            endpoint,
        })
    }
}

fn dedup_items(items: Vec<PersistItem>) -> Vec<PersistItem> {
    let mut out: Vec<PersistItem> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

/// Linking replaces whole paths, so an item must not swallow the authorized
/// keys file or another item.
fn check_item_layout(items: &[PersistItem], home_root: &Path, authorized_keys: &Path) -> Result<()> {
    for (i, item) in items.iter().enumerate() {
        if authorized_keys.starts_with(home_root.join(item.relative_path())) {
            return Err(DevboxError::config(format!(
                "persist item {item} would replace the authorized keys file {}",
                authorized_keys.display()
            )));
        }
        for other in &items[i + 1..] {
            let (a, b) = (item.relative_path(), other.relative_path());
            if a.starts_with(b) || b.starts_with(a) {
                return Err(DevboxError::config(format!(
                    "persist items {item} and {other} overlap"
                )));
            }
        }
    }
    Ok(())
}

fn resolve_backup(
    file: BackupFileConfig,
    home_root: &Path,
    data_root: &Path,
    no_restore: bool,
) -> Result<BackupSettings> {
    let source_root = file.source_root.unwrap_or_else(|| home_root.to_path_buf());
    let destination = file
        .destination
        .unwrap_or_else(|| backup::default_destination(data_root, &source_root));
    let exclude = file.exclude.unwrap_or_else(|| {
        backup::DEFAULT_EXCLUDES
            .iter()
            .map(|p| p.to_string())
            .collect()
    });
    let timeout_secs = file
        .timeout_seconds
        .unwrap_or(backup::DEFAULT_TIMEOUT.as_secs());
    if timeout_secs == 0 {
        return Err(DevboxError::config("backup timeout must be positive"));
    }
    Ok(BackupSettings {
        plan: BackupPlan::new(source_root, exclude, destination)?,
        timeout_secs,
        restore_on_start: !no_restore && file.restore_on_start.unwrap_or(true),
        tar_bin: file.tar_bin.unwrap_or_else(|| PathBuf::from("tar")),
    })
}

fn resolve_endpoint(
    file: Option<EndpointFileConfig>,
    host: Option<String>,
    port: Option<u16>,
) -> Option<Endpoint> {
    let file = file.unwrap_or_default();
    let host = host.or(file.host)?;
    Some(Endpoint {
        host,
        port: port.or(file.port).unwrap_or(DEFAULT_SSH_PORT),
        user: file.user.unwrap_or_else(|| DEFAULT_SSH_USER.to_string()),
    })
}
