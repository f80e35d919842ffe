//! Binding to the real engine: PTY launcher, probe and discovery.

use std::path::{Path, PathBuf};
use std::time::Duration;

use engine_process::{EngineActor, EngineConfig, EngineHandle, EngineOutput, ProcessError};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatcher::{EngineLink, Launcher};
use crate::error::PhoneError;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

impl EngineLink for EngineHandle {
    async fn send_line(&self, line: &str) -> Result<(), ProcessError> {
        self.write_line(line).await
    }

    async fn shutdown(&self, grace: Duration) -> Result<(), ProcessError> {
        self.terminate(grace).await
    }
}

/// Launches the engine inside a PTY via [`EngineActor`]
#[derive(Clone, Debug, Default)]
pub struct PtyLauncher {
    pub working_dir: Option<String>,
}

impl Launcher for PtyLauncher {
    type Link = EngineHandle;

    fn launch(
        &self,
        program: &str,
        args: &[String],
    ) -> Result<(EngineHandle, mpsc::Receiver<EngineOutput>), ProcessError> {
        info!("Launching engine '{}'", program);
        EngineActor::spawn(EngineConfig {
            program: program.to_string(),
            args: args.to_vec(),
            working_dir: self.working_dir.clone(),
            ..Default::default()
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Printed usage text we recognise
    Ready,
    /// Ran, but the output does not look like the engine
    Unrecognized(String),
    /// No answer within the probe timeout
    TimedOut,
}

/// Run `<engine> --help` and check that it is the engine we drive
pub async fn probe_engine(path: &Path) -> Result<ProbeOutcome, PhoneError> {
    let output = Command::new(path)
        .arg("--help")
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
        Ok(result) => result.map_err(|e| {
            PhoneError::Spawn(format!("failed to run {}: {}", path.display(), e))
        })?,
        Err(_) => return Ok(ProbeOutcome::TimedOut),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    debug!(status = ?output.status, bytes = text.len(), "engine probe finished");

    if looks_like_engine(&text) {
        Ok(ProbeOutcome::Ready)
    } else {
        let first_line = text.lines().next().unwrap_or_default().to_string();
        Ok(ProbeOutcome::Unrecognized(first_line))
    }
}

fn looks_like_engine(help_text: &str) -> bool {
    help_text.contains("Usage:") || help_text.contains("pjsua")
}

/// Resolve the engine executable: the configured path as given, then the
/// working directory, then each `PATH` entry.
pub fn locate_engine(configured: &str) -> Option<PathBuf> {
    let configured_path = Path::new(configured);
    if configured_path.components().count() > 1 || configured_path.is_absolute() {
        return configured_path
            .is_file()
            .then(|| configured_path.to_path_buf());
    }

    let cwd_candidate = std::env::current_dir().ok()?.join(configured);
    let search_path = std::env::var_os("PATH").unwrap_or_default();
    locate_in(configured, Some(cwd_candidate), std::env::split_paths(&search_path))
}

fn locate_in(
    name: &str,
    cwd_candidate: Option<PathBuf>,
    dirs: impl IntoIterator<Item = PathBuf>,
) -> Option<PathBuf> {
    if let Some(candidate) = cwd_candidate.filter(|p| p.is_file()) {
        return Some(candidate);
    }

    dirs.into_iter().find_map(|dir| {
        executable_names(name)
            .into_iter()
            .map(|n| dir.join(n))
            .find(|p| p.is_file())
    })
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![format!("{}.exe", name), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognises_engine_help_text() {
        assert!(looks_like_engine("Usage:\n  pjsua [options] [SIP URL to call]"));
        assert!(looks_like_engine("pjsua 2.14 for Linux"));
        assert!(!looks_like_engine("bash: --help: invalid option"));
    }

    #[test]
    fn locate_prefers_working_directory() {
        let cwd = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(cwd.path().join("pjsua"), "").unwrap();
        std::fs::write(bin.path().join("pjsua"), "").unwrap();

        let found = locate_in(
            "pjsua",
            Some(cwd.path().join("pjsua")),
            vec![bin.path().to_path_buf()],
        );
        assert_eq!(found, Some(cwd.path().join("pjsua")));
    }

    #[test]
    fn locate_falls_back_to_search_path() {
        let empty = tempfile::tempdir().unwrap();
        let bin = tempfile::tempdir().unwrap();
        std::fs::write(bin.path().join("pjsua"), "").unwrap();

        let found = locate_in(
            "pjsua",
            Some(empty.path().join("pjsua")),
            vec![empty.path().to_path_buf(), bin.path().to_path_buf()],
        );
        assert_eq!(found, Some(bin.path().join("pjsua")));
    }

    #[test]
    fn locate_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join("pjsua-custom");
        assert!(locate_engine(engine.to_str().unwrap()).is_none());

        std::fs::write(&engine, "").unwrap();
        assert_eq!(locate_engine(engine.to_str().unwrap()), Some(engine));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_accepts_usage_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("fake-engine");
        std::fs::write(&script, "#!/bin/sh\necho 'Usage:'\necho '  pjsua [options]'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert_eq!(probe_engine(&script).await.unwrap(), ProbeOutcome::Ready);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn probe_rejects_other_programs() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("not-an-engine");
        std::fs::write(&script, "#!/bin/sh\necho \"unknown option $1\"\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let outcome = probe_engine(&script).await.unwrap();
        assert_eq!(
            outcome,
            ProbeOutcome::Unrecognized("unknown option --help".to_string())
        );
    }

    #[tokio::test]
    async fn probe_missing_executable_is_spawn_error() {
        let err = probe_engine(Path::new("/nonexistent/pjsua")).await.unwrap_err();
        assert_eq!(err.error_code(), "spawn_error");
    }
}
