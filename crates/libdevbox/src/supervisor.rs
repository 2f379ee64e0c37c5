use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::backup::{Archiver, BackupGuard, RestoreOutcome, TarArchiver};
use crate::config::{Endpoint, SessionConfig};
use crate::credential::{self, InjectOutcome};
use crate::error::{DevboxError, Result};
use crate::idle::{self, IdleTracker, MonitorExit};
use crate::persist::{self, LinkReport};
use crate::probe::{ActivityProbe, ProcessProbe};
use crate::provision;

/// What happened while bringing the session up.
#[derive(Debug)]
pub struct StartReport {
    pub restore: Option<RestoreOutcome>,
    pub credential: InjectOutcome,
    pub links: LinkReport,
    pub services_started: usize,
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct SessionReport {
    pub exit: Option<MonitorExit>,
    pub backup: Option<Result<PathBuf>>,
}

impl SessionReport {
    pub fn backup_succeeded(&self) -> bool {
        matches!(self.backup, Some(Ok(_)))
    }
}

/// Drives one session: restore, credential, links, provisioning, idle wait,
/// backup.
pub struct SessionSupervisor {
    config: SessionConfig,
    archiver: Arc<dyn Archiver>,
    probe: Arc<dyn ActivityProbe>,
}

impl SessionSupervisor {
    pub fn new(
        config: SessionConfig,
        archiver: Arc<dyn Archiver>,
        probe: Arc<dyn ActivityProbe>,
    ) -> Self {
        Self {
            config,
            archiver,
            probe,
        }
    }

    /// Supervisor backed by the real `tar` and the process-table probe.
    pub fn with_system_collaborators(config: SessionConfig) -> Result<Self> {
        let archiver = TarArchiver::new(&config.backup.tar_bin, config.backup.timeout());
        let probe = ProcessProbe::new(&config.probe_pattern)?;
        Ok(Self::new(config, Arc::new(archiver), Arc::new(probe)))
    }

    /// Bring the session up. Blocks on filesystem and package work.
    ///
    /// The backup is armed before anything can fail, so an error here still
    /// leaves exactly one snapshot behind (taken as the guard drops).
    pub fn start(self) -> Result<RunningSession> {
        let cfg = &self.config;

        let restore = if cfg.backup.restore_on_start {
            match self.archiver.restore(&cfg.backup.plan) {
                Ok(outcome) => Some(outcome),
                Err(err) => {
                    warn!("could not restore previous backup, continuing: {err}");
                    None
                }
            }
        } else {
            None
        };

        let guard = BackupGuard::arm(Arc::clone(&self.archiver), cfg.backup.plan.clone());

        let token = cfg.credential.resolve()?;
        let credential = credential::inject(&token, &cfg.authorized_keys)?;
        let links = persist::link(&cfg.persist_items, &cfg.home_root, &cfg.persist_root)?;
        if !credential::is_present(&token, &cfg.authorized_keys)? {
            return Err(DevboxError::config(format!(
                "linking persistent items removed {}; keep it out of persist_items",
                cfg.authorized_keys.display()
            )));
        }
        provision::install_packages(&cfg.extra_packages)?;
        let services_started = provision::start_services(&cfg.services);

        info!(
            linked = links.bindings.len(),
            skipped = links.skipped.len(),
            services = services_started,
            "session started"
        );
        Ok(RunningSession {
            config: self.config,
            probe: self.probe,
            guard,
            report: StartReport {
                restore,
                credential,
                links,
                services_started,
            },
            exit: None,
        })
    }

    /// Start on the blocking pool, call `on_ready` once the session is up,
    /// wait for idle expiry or `shutdown`, then stop.
    pub async fn run<F>(self, shutdown: watch::Receiver<bool>, on_ready: F) -> Result<SessionReport>
    where
        F: FnOnce(&RunningSession),
    {
        let mut session = tokio::task::spawn_blocking(move || self.start())
            .await
            .map_err(|err| DevboxError::Task(err.to_string()))??;
        on_ready(&session);
        session.wait_for_idle(shutdown).await;
        Ok(session.stop().await)
    }
}

/// A started session. Holds the armed backup until [`stop`](Self::stop); if
/// dropped instead, the backup runs from the drop.
pub struct RunningSession {
    config: SessionConfig,
    probe: Arc<dyn ActivityProbe>,
    guard: BackupGuard,
    report: StartReport,
    exit: Option<MonitorExit>,
}

impl RunningSession {
    pub fn start_report(&self) -> &StartReport {
        &self.report
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.config.endpoint.as_ref()
    }

    pub async fn wait_for_idle(&mut self, shutdown: watch::Receiver<bool>) -> MonitorExit {
        let mut tracker =
            IdleTracker::new(self.config.idle_threshold_secs, self.config.poll_interval_secs);
        let exit = idle::run(&mut tracker, self.probe.as_ref(), shutdown).await;
        self.exit = Some(exit);
        exit
    }

    /// Fire the backup and report. Never fails: a broken backup is logged and
    /// recorded, and shutdown proceeds.
    pub async fn stop(self) -> SessionReport {
        let RunningSession { guard, exit, .. } = self;
        let backup = guard.fire_blocking().await;
        match &backup {
            Some(Ok(path)) => info!(archive = %path.display(), "session stopped, backup saved"),
            Some(Err(err)) => warn!("session stopped, backup failed: {err}"),
            None => warn!("session stopped, backup had already run"),
        }
        SessionReport { exit, backup }
    }
}
