use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use regex::Regex;
use tracing::trace;

use crate::error::{DevboxError, Result};

/// Per-connection sshd child.
pub const SSH_SESSION_PATTERN: &str = "sshd: root@";
/// An xrdp session manager serving a display. The bare daemon we launch
/// ourselves carries no `:N` argument and must not count.
pub const RDP_SESSION_PATTERN: &str = "xrdp-sesman.*:";

/// Answers "is somebody connected right now".
pub trait ActivityProbe: Send + Sync {
    fn is_active(&self) -> Result<bool>;
}

/// Scans the process table for a command line matching a regex.
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    pattern: Regex,
}

impl ProcessProbe {
    pub fn new(pattern: &str) -> Result<Self> {
        let pattern = Regex::new(pattern).map_err(|err| {
            DevboxError::config(format!("invalid probe pattern '{pattern}': {err}"))
        })?;
        Ok(Self { pattern })
    }

    fn matches(&self, cmdline: &[String]) -> bool {
        self.pattern.is_match(&cmdline.join(" "))
    }
}

impl ActivityProbe for ProcessProbe {
    fn is_active(&self) -> Result<bool> {
        let own_pid = std::process::id() as i32;
        let processes = procfs::process::all_processes()
            .map_err(|err| DevboxError::Probe(format!("cannot list processes: {err}")))?;

        for process in processes {
            // Processes can exit between listing and reading; skip them.
            let Ok(process) = process else { continue };
            if process.pid == own_pid {
                continue;
            }
            let Ok(cmdline) = process.cmdline() else {
                continue;
            };
            if self.matches(&cmdline) {
                trace!(pid = process.pid, pattern = %self.pattern, "matched session process");
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Replays a fixed sequence of samples, then reports idle forever.
#[derive(Debug, Default)]
pub struct ScriptedProbe {
    samples: Mutex<VecDeque<Result<bool, String>>>,
    taken: AtomicUsize,
}

impl ScriptedProbe {
    pub fn new(samples: impl IntoIterator<Item = bool>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().map(Ok).collect()),
            taken: AtomicUsize::new(0),
        }
    }

    /// Queue a probe failure after the samples already queued.
    pub fn then_fail(self, message: impl Into<String>) -> Self {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push_back(Err(message.into()));
        }
        self
    }

    pub fn samples_taken(&self) -> usize {
        self.taken.load(Ordering::SeqCst)
    }
}

impl ActivityProbe for ScriptedProbe {
    fn is_active(&self) -> Result<bool> {
        self.taken.fetch_add(1, Ordering::SeqCst);
        let next = self
            .samples
            .lock()
            .map_err(|_| DevboxError::Probe("scripted probe poisoned".into()))?
            .pop_front();
        match next {
            Some(Ok(active)) => Ok(active),
            Some(Err(message)) => Err(DevboxError::Probe(message)),
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::process::{Command, Stdio};
    use std::time::{Duration, Instant};

    #[test]
    fn process_probe_finds_matching_command_line() {
        let mut child = Command::new("sleep")
            .arg("31.4159")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");

        let probe = ProcessProbe::new(r"sleep 31\.4159").expect("pattern");
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut seen = false;
        while Instant::now() < deadline {
            if probe.is_active().expect("probe") {
                seen = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let _ = child.kill();
        let _ = child.wait();
        assert!(seen, "expected the sleep process to be detected");
    }

    #[test]
    fn process_probe_reports_idle_without_match() {
        let probe = ProcessProbe::new("devbox-no-such-session-process").expect("pattern");
        assert!(!probe.is_active().expect("probe"));
    }

    fn argv(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn rdp_pattern_needs_a_display() {
        let probe = ProcessProbe::new(RDP_SESSION_PATTERN).expect("pattern");
        assert!(!probe.matches(&argv(&["/usr/sbin/xrdp-sesman"])));
        assert!(!probe.matches(&argv(&["/usr/sbin/xrdp-sesman", "--nodaemon"])));
        assert!(probe.matches(&argv(&["/usr/sbin/xrdp-sesman", ":10"])));
    }

    #[test]
    fn ssh_pattern_ignores_the_listener() {
        let probe = ProcessProbe::new(SSH_SESSION_PATTERN).expect("pattern");
        assert!(!probe.matches(&argv(&["sshd: /usr/sbin/sshd -D [listener] 0 of 10-100 startups"])));
        assert!(probe.matches(&argv(&["sshd: root@pts/0"])));
    }

    #[test]
    fn bare_sesman_daemon_is_not_a_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sesman = dir.path().join("xrdp-sesman");
        fs::copy("/bin/sh", &sesman).expect("copy sh");
        // `; true` keeps sh from exec-ing into sleep, so the name stays visible.
        let mut daemon = Command::new(&sesman)
            .args(["-c", "sleep 30; true"])
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn daemon stand-in");
        std::thread::sleep(Duration::from_millis(200));

        let probe = ProcessProbe::new(RDP_SESSION_PATTERN).expect("pattern");
        let active = probe.is_active();

        let _ = daemon.kill();
        let _ = daemon.wait();
        assert!(!active.expect("probe"), "daemon without a display counted as a session");
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let err = ProcessProbe::new("sshd: (root").expect_err("unbalanced group");
        assert!(matches!(err, DevboxError::Config(_)));
    }

    #[test]
    fn scripted_probe_replays_then_goes_idle() {
        let probe = ScriptedProbe::new([true, false]).then_fail("ps unavailable");
        assert!(probe.is_active().expect("first"));
        assert!(!probe.is_active().expect("second"));
        assert!(matches!(probe.is_active(), Err(DevboxError::Probe(_))));
        assert!(!probe.is_active().expect("exhausted"));
        assert_eq!(probe.samples_taken(), 4);
    }
}
