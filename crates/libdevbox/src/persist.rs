use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{DevboxError, IoContext, Result};

/// A home-relative path that must survive session restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PersistItem(PathBuf);

impl PersistItem {
    pub fn new(raw: impl AsRef<Path>) -> Result<Self> {
        let raw = raw.as_ref();
        let mut clean = PathBuf::new();
        for component in raw.components() {
            match component {
                Component::Normal(seg) => clean.push(seg),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(DevboxError::config(format!(
                        "persist item '{}' must not contain '..'",
                        raw.display()
                    )));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(DevboxError::config(format!(
                        "persist item '{}' must be relative to the home root",
                        raw.display()
                    )));
                }
            }
        }
        if clean.as_os_str().is_empty() {
            return Err(DevboxError::config("persist item must not be empty"));
        }
        Ok(Self(clean))
    }

    pub fn relative_path(&self) -> &Path {
        &self.0
    }
}

impl TryFrom<String> for PersistItem {
    type Error = DevboxError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<PersistItem> for String {
    fn from(item: PersistItem) -> Self {
        item.0.to_string_lossy().into_owned()
    }
}

impl fmt::Display for PersistItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

const SSH_ITEMS: &[&str] = &[
    ".bash_history",
    ".bashrc",
    ".profile",
    ".viminfo",
    ".vimrc",
    ".gitconfig",
    ".ssh/config",
    ".ssh/known_hosts",
];

const RDP_ITEMS: &[&str] = &[
    ".config/xfce4",
    ".local/share/xfce4",
    ".cache/sessions",
    "Desktop",
    ".xsession",
];

/// Preset item lists for the kinds of session we launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistProfile {
    #[default]
    Ssh,
    Rdp,
    Gemini,
    Llm,
    Unsloth,
}

impl PersistProfile {
    pub fn items(self) -> Vec<PersistItem> {
        let extra: &[&str] = match self {
            PersistProfile::Ssh => &[],
            PersistProfile::Rdp => RDP_ITEMS,
            PersistProfile::Gemini => &[".config/gemini"],
            PersistProfile::Llm => &[".config/llm", ".models"],
            PersistProfile::Unsloth => &[".config/unsloth", ".models/unsloth"],
        };
        SSH_ITEMS
            .iter()
            .chain(extra)
            .map(|raw| PersistItem(PathBuf::from(raw)))
            .collect()
    }
}

impl FromStr for PersistProfile {
    type Err = DevboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "ssh" => Ok(PersistProfile::Ssh),
            "rdp" => Ok(PersistProfile::Rdp),
            "gemini" => Ok(PersistProfile::Gemini),
            "llm" => Ok(PersistProfile::Llm),
            "unsloth" => Ok(PersistProfile::Unsloth),
            other => Err(DevboxError::config(format!(
                "unknown persistence profile '{other}' (expected ssh|rdp|gemini|llm|unsloth)"
            ))),
        }
    }
}

/// What the linker found at the home path before linking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Displaced {
    File,
    Directory,
    ForeignLink,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Created,
    AlreadyLinked,
    Replaced(Displaced),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceBinding {
    pub item: PersistItem,
    pub home_path: PathBuf,
    pub volume_path: PathBuf,
    pub action: LinkAction,
}

#[derive(Debug, Default)]
pub struct LinkReport {
    pub bindings: Vec<PersistenceBinding>,
    pub skipped: Vec<(PersistItem, DevboxError)>,
}

impl LinkReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Replace each item under `home_root` with a symlink into `volume_root`.
///
/// Items fail independently: an item whose error is recoverable is logged
/// and recorded in [`LinkReport::skipped`], while permission, space and
/// read-only failures abort the whole run.
pub fn link(items: &[PersistItem], home_root: &Path, volume_root: &Path) -> Result<LinkReport> {
    info!(
        home_root = %home_root.display(),
        volume_root = %volume_root.display(),
        items = items.len(),
        "linking persistent configuration"
    );
    fs::create_dir_all(volume_root).at(volume_root)?;

    let mut report = LinkReport::default();
    for item in items {
        match link_one(item, home_root, volume_root) {
            Ok(binding) => {
                info!(
                    action = ?binding.action,
                    "linked {} -> {}",
                    binding.home_path.display(),
                    binding.volume_path.display()
                );
                report.bindings.push(binding);
            }
            Err(err) if err.is_unrecoverable() => return Err(err),
            Err(err) => {
                warn!(item = %item, "skipping persist item: {err}");
                report.skipped.push((item.clone(), err));
            }
        }
    }

    info!(
        linked = report.bindings.len(),
        skipped = report.skipped.len(),
        "done linking"
    );
    Ok(report)
}

fn link_one(item: &PersistItem, home_root: &Path, volume_root: &Path) -> Result<PersistenceBinding> {
    let home_path = home_root.join(item.relative_path());
    let volume_path = volume_root.join(item.relative_path());

    for path in [&home_path, &volume_path] {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).at(parent)?;
        }
    }

    let action = match fs::symlink_metadata(&home_path) {
        Err(err) if err.kind() == io::ErrorKind::NotFound => LinkAction::Created,
        Err(err) => return Err(DevboxError::io(&home_path, err)),
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(&home_path).at(&home_path)?;
            if target == volume_path {
                return Ok(PersistenceBinding {
                    item: item.clone(),
                    home_path,
                    volume_path,
                    action: LinkAction::AlreadyLinked,
                });
            }
            fs::remove_file(&home_path).at(&home_path)?;
            LinkAction::Replaced(Displaced::ForeignLink)
        }
        Ok(meta) if meta.is_dir() => {
            fs::remove_dir_all(&home_path).at(&home_path)?;
            LinkAction::Replaced(Displaced::Directory)
        }
        Ok(_) => {
            fs::remove_file(&home_path).at(&home_path)?;
            LinkAction::Replaced(Displaced::File)
        }
    };

    std::os::unix::fs::symlink(&volume_path, &home_path).at(&home_path)?;
    Ok(PersistenceBinding {
        item: item.clone(),
        home_path,
        volume_path,
        action,
    })
}
