//! SIPp process wrapper: write scripts, spawn one process per role, wait
//! under one shared deadline, keep diagnostics only on failure.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::{generate_scripts, roles, script_path, SippStep};
use crate::config::Transport;
use crate::definition::RunContext;
use crate::error::{ProcessError, ScenarioError};

/// First local port handed to the per-role processes.
const BASE_LOCAL_PORT: u16 = 5070;

pub struct SippProcess {
    pub role: String,
    pub script: PathBuf,
    pub stderr: PathBuf,
    child: Child,
}

impl SippProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Everything needed to launch the processes of one run.
pub struct Launch<'a> {
    pub binary: &'a str,
    pub target: &'a str,
    pub transport: Transport,
    pub dir: &'a Path,
    pub test: &'a str,
}

impl Launch<'_> {
    fn prefix(&self) -> String {
        format!("{} - {} - ", self.test, self.transport)
    }

    /// Remove leftovers of an earlier failed run of the same (test, transport).
    pub fn clear_stale(&self) -> std::io::Result<usize> {
        let prefix = self.prefix();
        let entries = match std::fs::read_dir(self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn spawn(
        &self,
        index: usize,
        role: &str,
        script: PathBuf,
    ) -> Result<SippProcess, ProcessError> {
        let stderr = script.with_extension("err");
        let err_file = File::create(&stderr)?;
        let port = BASE_LOCAL_PORT + index as u16;
        let child = Command::new(self.binary)
            .arg("-sf")
            .arg(&script)
            .args(["-t", self.transport.sipp_flag()])
            .args(["-p", &port.to_string()])
            .args(["-m", "1"])
            .arg(self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(err_file))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: self.binary.to_string(),
                source,
            })?;
        debug!(%role, pid = ?child.id(), script = %script.display(), "spawned call generator");
        Ok(SippProcess {
            role: role.to_string(),
            script,
            stderr,
            child,
        })
    }

    /// Write one script per role and start a process for each. On a spawn
    /// failure the processes already started are killed.
    pub fn start(
        &self,
        steps: &[SippStep],
        next_label: impl FnMut() -> u64,
    ) -> Result<Vec<SippProcess>, ProcessError> {
        std::fs::create_dir_all(self.dir)?;
        let scripts = generate_scripts(self.test, steps, next_label)?;
        let mut procs: Vec<SippProcess> = Vec::with_capacity(scripts.len());
        for (index, script) in scripts.into_iter().enumerate() {
            let path = script_path(self.dir, self.test, self.transport, &script.role);
            std::fs::write(&path, &script.xml)?;
            match self.spawn(index, &script.role, path) {
                Ok(p) => procs.push(p),
                Err(e) => {
                    for p in &mut procs {
                        let _ = p.child.start_kill();
                    }
                    return Err(e);
                }
            }
        }
        Ok(procs)
    }
}

/// Wait for every process under one shared deadline. Stragglers are killed
/// and reported as a timeout; otherwise any non-zero exit is a failure.
pub async fn wait_all(
    procs: &mut [SippProcess],
    timeout: Duration,
) -> Result<(), Vec<ProcessError>> {
    let waited = {
        let waits = procs.iter_mut().map(|p| p.child.wait());
        tokio::time::timeout(timeout, futures::future::join_all(waits)).await
    };

    let statuses: Vec<std::io::Result<ExitStatus>> = match waited {
        Ok(statuses) => statuses,
        Err(_) => {
            let mut killed = 0;
            for p in procs.iter_mut() {
                if matches!(p.child.try_wait(), Ok(None)) {
                    warn!(
                        role = %p.role,
                        pid = ?p.child.id(),
                        "killing call generator at deadline"
                    );
                    if let Err(e) = p.child.kill().await {
                        error!(role = %p.role, "failed to kill call generator: {}", e);
                    }
                    killed += 1;
                }
            }
            return Err(vec![ProcessError::TimedOut {
                count: killed,
                timeout,
            }]);
        }
    };

    let failures: Vec<ProcessError> = procs
        .iter()
        .zip(statuses)
        .filter_map(|(p, status)| match status {
            Ok(s) if s.success() => None,
            Ok(s) => Some(ProcessError::Exit {
                role: p.role.clone(),
                code: s.code(),
            }),
            Err(e) => Some(ProcessError::Io(e)),
        })
        .collect();
    if failures.is_empty() {
        Ok(())
    } else {
        Err(failures)
    }
}

fn remove_artifacts(procs: &[SippProcess]) {
    for p in procs {
        for path in [&p.script, &p.stderr] {
            if let Err(e) = std::fs::remove_file(path) {
                debug!(path = %path.display(), "could not remove artifact: {}", e);
            }
        }
    }
}

/// Files a launch may have left for `steps` in `dir`.
fn written_artifacts(launch: &Launch<'_>, steps: &[SippStep]) -> Vec<PathBuf> {
    roles(steps)
        .iter()
        .map(|role| script_path(launch.dir, launch.test, launch.transport, role))
        .flat_map(|script| [script.with_extension("err"), script])
        .filter(|path| path.exists())
        .collect()
}

/// The whole external-process flow for one run: scripts are generated,
/// processes spawned and awaited under the test's timeout, and artifacts
/// deleted on success or registered with the run on failure.
pub async fn run_scripts(run: &mut RunContext, steps: &[SippStep]) -> Result<(), ScenarioError> {
    let timeout = run.timeout();
    let deployment = &run.environment().deployment;
    let binary = deployment.sipp_binary.clone();
    let target = deployment.proxy_addr();
    let dir = deployment.artifact_dir.clone();
    let test = run.test_name().to_string();
    let launch = Launch {
        binary: &binary,
        target: &target,
        transport: run.transport(),
        dir: &dir,
        test: &test,
    };

    match launch.clear_stale() {
        Ok(0) => {}
        Ok(n) => debug!(removed = n, "cleared stale artifacts"),
        Err(e) => warn!("failed to clear stale artifacts: {}", e),
    }

    let labels = &*run;
    let started = launch.start(steps, || labels.next_label());
    let mut procs = match started {
        Ok(procs) => procs,
        Err(e) => {
            for path in written_artifacts(&launch, steps) {
                run.add_artifact(path);
            }
            return Err(e.into());
        }
    };
    info!(processes = procs.len(), ?timeout, "call generators running");

    match wait_all(&mut procs, timeout).await {
        Ok(()) => {
            remove_artifacts(&procs);
            Ok(())
        }
        Err(failures) => {
            for p in &procs {
                run.add_artifact(p.script.clone());
                run.add_artifact(p.stderr.clone());
            }
            let summary = failures
                .iter()
                .map(|f| f.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            if failures.iter().any(|f| matches!(f, ProcessError::TimedOut { .. })) {
                Err(ScenarioError::Timeout(summary))
            } else {
                Err(ScenarioError::Assertion(summary))
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// A fake call generator: a shell script that behaves per role name
    /// found in its `-sf` argument.
    fn fake_sipp(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-sipp.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn steps() -> Vec<SippStep> {
        vec![
            SippStep::send("caller", "callee", "MESSAGE sip:x SIP/2.0\nContent-Length: 0"),
            SippStep::send("callee", "caller", "SIP/2.0 200 OK\nContent-Length: 0"),
        ]
    }

    #[tokio::test]
    async fn success_removes_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_sipp(tmp.path(), "exit 0");
        let logs = tmp.path().join("logs");
        let bin_str = bin.to_string_lossy().to_string();
        let launch = Launch {
            binary: &bin_str,
            target: "127.0.0.1:5060",
            transport: Transport::Tcp,
            dir: &logs,
            test: "Msg",
        };
        let mut n = 0;
        let mut procs = launch
            .start(&steps(), || {
                n += 1;
                n
            })
            .unwrap();
        assert_eq!(procs.len(), 2);
        assert!(procs[0].script.ends_with("Msg - TCP - caller.xml"));
        assert!(procs[1].stderr.ends_with("Msg - TCP - callee.err"));

        wait_all(&mut procs, Duration::from_secs(10)).await.unwrap();
        remove_artifacts(&procs);
        assert_eq!(std::fs::read_dir(&logs).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported_per_role() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_sipp(
            tmp.path(),
            "case \"$2\" in *callee*) echo 'no 200 received' >&2; exit 1;; esac\nexit 0",
        );
        let logs = tmp.path().join("logs");
        let bin_str = bin.to_string_lossy().to_string();
        let launch = Launch {
            binary: &bin_str,
            target: "127.0.0.1:5060",
            transport: Transport::Udp,
            dir: &logs,
            test: "Msg",
        };
        let mut procs = launch.start(&steps(), || 1).unwrap();
        let failures = wait_all(&mut procs, Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(failures.len(), 1);
        assert!(matches!(
            &failures[0],
            ProcessError::Exit { role, code: Some(1) } if role == "callee"
        ));
        let err = std::fs::read_to_string(&procs[1].stderr).unwrap();
        assert!(err.contains("no 200 received"));
    }

    #[tokio::test]
    async fn deadline_kills_every_straggler() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = fake_sipp(tmp.path(), "exec sleep 30");
        let logs = tmp.path().join("logs");
        let bin_str = bin.to_string_lossy().to_string();
        let launch = Launch {
            binary: &bin_str,
            target: "127.0.0.1:5060",
            transport: Transport::Tcp,
            dir: &logs,
            test: "Hang",
        };
        let mut procs = launch.start(&steps(), || 1).unwrap();
        let started = std::time::Instant::now();
        let failures = wait_all(&mut procs, Duration::from_millis(300)).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(matches!(failures[0], ProcessError::TimedOut { count: 2, .. }));
        for p in procs.iter_mut() {
            assert!(p.child.try_wait().unwrap().is_some());
        }
    }

    #[test]
    fn clears_only_matching_stale_files() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("Msg - TCP - caller.err"), "old").unwrap();
        std::fs::write(tmp.path().join("Msg - UDP - caller.err"), "keep").unwrap();
        let launch = Launch {
            binary: "sipp",
            target: "x",
            transport: Transport::Tcp,
            dir: tmp.path(),
            test: "Msg",
        };
        assert_eq!(launch.clear_stale().unwrap(), 1);
        assert!(tmp.path().join("Msg - UDP - caller.err").exists());
    }

    #[tokio::test]
    async fn missing_binary_fails_spawn() {
        let tmp = tempfile::tempdir().unwrap();
        let launch = Launch {
            binary: "/nonexistent/sipp",
            target: "x",
            transport: Transport::Tcp,
            dir: tmp.path(),
            test: "Msg",
        };
        assert!(matches!(
            launch.start(&steps(), || 1),
            Err(ProcessError::Spawn { .. })
        ));
        assert_eq!(
            written_artifacts(&launch, &steps()),
            vec![
                tmp.path().join("Msg - TCP - caller.err"),
                tmp.path().join("Msg - TCP - caller.xml"),
            ]
        );
    }
}
