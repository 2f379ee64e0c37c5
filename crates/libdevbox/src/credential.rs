use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::unistd::Uid;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{DevboxError, IoContext, Result};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;
const SSH_DIR: &str = ".ssh";

/// Where the session's access token comes from.
#[derive(Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialSource {
    /// Name of an environment variable holding the token.
    Env(String),
    #[serde(skip_serializing)]
    Value(String),
}

impl CredentialSource {
    pub fn resolve(&self) -> Result<Credential> {
        match self {
            CredentialSource::Env(name) => Credential::from_env(name),
            CredentialSource::Value(raw) => Credential::new(raw.clone()),
        }
    }
}

impl fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Env(name) => f.debug_tuple("Env").field(name).finish(),
            CredentialSource::Value(_) => f.write_str("Value(<redacted>)"),
        }
    }
}

/// An opaque, non-empty authorization token such as an SSH public key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(DevboxError::config("credential is empty"));
        }
        if trimmed.contains('\n') {
            return Err(DevboxError::config("credential must be a single line"));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn from_env(var: &str) -> Result<Self> {
        let raw = std::env::var(var).map_err(|err| {
            DevboxError::config(format!("credential variable {var} is not readable: {err}"))
        })?;
        Self::new(raw).map_err(|err| match err {
            DevboxError::Config(msg) => DevboxError::config(format!("{var}: {msg}")),
            other => other,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectOutcome {
    Appended,
    AlreadyPresent,
}

/// Append `credential` to the authorized-access file at `target` unless the
/// exact line is already there.
pub fn inject(credential: &Credential, target: &Path) -> Result<InjectOutcome> {
    debug!(
        uid = Uid::effective().as_raw(),
        credential_len = credential.as_str().len(),
        target = %target.display(),
        "injecting credential"
    );

    if let Some(parent) = target.parent() {
        // Only a directory we create, or a dedicated .ssh, is ours to lock down.
        let created = !parent.exists();
        fs::create_dir_all(parent).at(parent)?;
        if created || parent.file_name().is_some_and(|name| name == SSH_DIR) {
            fs::set_permissions(parent, fs::Permissions::from_mode(DIR_MODE)).at(parent)?;
        }
    }

    let existing = read_existing(target)?;
    let outcome = if has_line(&existing, credential) {
        InjectOutcome::AlreadyPresent
    } else {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(FILE_MODE)
            .open(target)
            .at(target)?;
        let mut line = String::with_capacity(credential.as_str().len() + 2);
        if !existing.is_empty() && !existing.ends_with('\n') {
            line.push('\n');
        }
        line.push_str(credential.as_str());
        line.push('\n');
        file.write_all(line.as_bytes()).at(target)?;
        file.sync_all().at(target)?;
        InjectOutcome::Appended
    };

    // The file may predate us with looser permissions.
    fs::set_permissions(target, fs::Permissions::from_mode(FILE_MODE)).at(target)?;

    info!(target = %target.display(), ?outcome, "credential ready");
    Ok(outcome)
}

/// Whether `target` already grants `credential`. A missing file grants nothing.
pub fn is_present(credential: &Credential, target: &Path) -> Result<bool> {
    Ok(has_line(&read_existing(target)?, credential))
}

fn read_existing(target: &Path) -> Result<String> {
    match fs::read_to_string(target) {
        Ok(content) => Ok(content),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(DevboxError::io(target, err)),
    }
}

fn has_line(content: &str, credential: &Credential) -> bool {
    content.lines().any(|line| line.trim() == credential.as_str())
}
