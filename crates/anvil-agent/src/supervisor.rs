//! Child process ownership: spawn, stdin, output pumps, sampling and stop escalation.

use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    process::Stdio,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anvil_process::{InstanceId, ResourceSample};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, Command},
    sync::{Notify, watch},
    task::JoinHandle,
};

use crate::{
    error::{AnvilError, Result},
    resources::Sampler,
};

const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Line written to stdin for a graceful stop.
    pub stop_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub generation: u64,
    pub code: Option<i32>,
    pub runtime_ms: u64,
}

/// Receives everything a supervised process emits. Calls for one process are
/// made in order: every output line is delivered before `on_exit`.
pub trait ProcessObserver: Send + Sync + 'static {
    /// Called once with the new generation, before any other callback.
    fn on_spawn(&self, _generation: u64) {}
    fn on_output(&self, generation: u64, line: String);
    fn on_sample(&self, generation: u64, sample: ResourceSample);
    fn on_exit(&self, exit: ExitInfo);
}

#[derive(Debug)]
struct ProcessSlot {
    instance_id: InstanceId,
    generation: u64,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stop_command: Option<String>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
    kill: Notify,
}

/// Cheap, clonable reference to one spawned process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    slot: Arc<ProcessSlot>,
}

impl ProcessHandle {
    pub fn instance_id(&self) -> &InstanceId {
        &self.slot.instance_id
    }

    pub fn generation(&self) -> u64 {
        self.slot.generation
    }

    pub fn pid(&self) -> Option<u32> {
        self.slot.pid
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.slot.exit_rx.borrow().clone()
    }

    pub fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    pub async fn wait_exit(&self) -> ExitInfo {
        let mut rx = self.slot.exit_rx.clone();
        let done = rx.wait_for(|v| v.is_some()).await.map(|r| r.clone());
        match done {
            Ok(Some(info)) => info,
            _ => ExitInfo {
                generation: self.slot.generation,
                ..ExitInfo::default()
            },
        }
    }

    async fn wait_exit_for(&self, d: Duration) -> Option<ExitInfo> {
        tokio::time::timeout(d, self.wait_exit()).await.ok()
    }

    fn signal(&self, sig: i32) {
        #[cfg(unix)]
        if let Some(pid) = self.slot.pid {
            // The child leads its own session, so its pid is the process group id.
            unsafe {
                libc::kill(-(pid as i32), sig);
            }
        }
        #[cfg(not(unix))]
        let _ = sig;
    }
}

#[cfg(unix)]
const SIGTERM: i32 = libc::SIGTERM;
#[cfg(unix)]
const SIGKILL: i32 = libc::SIGKILL;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(target_os = "linux")]
fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    /// How long a graceful stop command gets before SIGTERM.
    pub stop_timeout: Duration,
    /// How long SIGTERM gets before SIGKILL.
    pub term_grace: Duration,
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    procs: Arc<Mutex<HashMap<InstanceId, ProcessHandle>>>,
    next_generation: AtomicU64,
    sample_interval: Duration,
    policy: StopPolicy,
}

impl ProcessSupervisor {
    pub fn new(sample_interval: Duration, policy: StopPolicy) -> Self {
        Self {
            procs: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
            sample_interval,
            policy,
        }
    }

    fn procs(&self) -> std::sync::MutexGuard<'_, HashMap<InstanceId, ProcessHandle>> {
        self.procs.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn handle(&self, instance_id: &InstanceId) -> Option<ProcessHandle> {
        self.procs()
            .get(instance_id)
            .filter(|h| h.is_running())
            .cloned()
    }

    pub fn running(&self) -> Vec<ProcessHandle> {
        self.procs()
            .values()
            .filter(|h| h.is_running())
            .cloned()
            .collect()
    }

    pub fn spawn(
        &self,
        instance_id: &InstanceId,
        spec: LaunchSpec,
        observer: Arc<dyn ProcessObserver>,
    ) -> Result<ProcessHandle> {
        if self.handle(instance_id).is_some() {
            return Err(AnvilError::Spawn(format!(
                "a process is already running for instance {instance_id}"
            )));
        }
        if !spec.cwd.is_dir() {
            return Err(AnvilError::Spawn(format!(
                "working directory {} does not exist",
                spec.cwd.display()
            )));
        }

        let program = if spec.program.contains('/') && !spec.program.starts_with('/') {
            spec.cwd.join(&spec.program)
        } else {
            PathBuf::from(&spec.program)
        };

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                set_parent_death_signal()?;
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AnvilError::Spawn(format!("{}: {e}", program.display())))?;

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        observer.on_spawn(generation);
        let started = tokio::time::Instant::now();
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let handle = ProcessHandle {
            slot: Arc::new(ProcessSlot {
                instance_id: instance_id.clone(),
                generation,
                pid,
                stdin: tokio::sync::Mutex::new(child.stdin.take()),
                stop_command: spec.stop_command.clone(),
                exit_rx,
                kill: Notify::new(),
            }),
        };
        tracing::info!(
            instance_id = %instance_id,
            pid = ?pid,
            generation,
            program = %program.display(),
            "server process spawned"
        );

        let mut readers = Vec::new();
        if let Some(out) = child.stdout.take() {
            readers.push(spawn_reader(out, generation, observer.clone()));
        }
        if let Some(err) = child.stderr.take() {
            readers.push(spawn_reader(err, generation, observer.clone()));
        }

        if let Some(pid) = pid {
            self.spawn_sampler(handle.clone(), pid, observer.clone());
        }

        self.procs().insert(instance_id.clone(), handle.clone());

        let waiter_handle = handle.clone();
        let procs = self.procs.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                res = child.wait() => res,
                _ = waiter_handle.slot.kill.notified() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let code = match status {
                Ok(s) => s.code(),
                Err(e) => {
                    tracing::warn!(error = %e, "wait for server process failed");
                    None
                }
            };
            for r in readers {
                let _ = tokio::time::timeout(READER_DRAIN_TIMEOUT, r).await;
            }
            *waiter_handle.slot.stdin.lock().await = None;
            {
                let mut procs = procs.lock().unwrap_or_else(|p| p.into_inner());
                let id = &waiter_handle.slot.instance_id;
                if procs.get(id).is_some_and(|h| h.generation() == generation) {
                    procs.remove(id);
                }
            }

            let info = ExitInfo {
                generation,
                code,
                runtime_ms: started.elapsed().as_millis() as u64,
            };
            tracing::info!(
                instance_id = %waiter_handle.slot.instance_id,
                generation,
                exit_code = ?code,
                runtime_ms = info.runtime_ms,
                "server process exited"
            );
            let _ = exit_tx.send(Some(info.clone()));
            observer.on_exit(info);
        });

        Ok(handle)
    }

    fn spawn_sampler(&self, handle: ProcessHandle, pid: u32, observer: Arc<dyn ProcessObserver>) {
        let interval = self.sample_interval;
        tokio::spawn(async move {
            let mut sampler = Sampler::new(pid);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = handle.wait_exit() => break,
                }
                let Some(sample) = sampler.sample().await else {
                    break;
                };
                if !handle.is_running() {
                    break;
                }
                observer.on_sample(handle.slot.generation, sample);
            }
        });
    }

    /// Deliver one line to the process's stdin.
    pub async fn write_line(&self, handle: &ProcessHandle, text: &str) -> Result<()> {
        let not_running = || AnvilError::ProcessNotRunning(handle.slot.instance_id.clone());
        if !handle.is_running() {
            return Err(not_running());
        }
        let mut stdin = handle.slot.stdin.lock().await;
        let Some(w) = stdin.as_mut() else {
            return Err(not_running());
        };
        let mut line = text.trim_end_matches(['\r', '\n']).to_string();
        line.push('\n');
        if let Err(e) = async {
            w.write_all(line.as_bytes()).await?;
            w.flush().await
        }
        .await
        {
            tracing::debug!(instance_id = %handle.slot.instance_id, error = %e, "stdin write failed");
            *stdin = None;
            return Err(not_running());
        }
        Ok(())
    }

    /// Stop the process: optional stop command, then SIGTERM to the group, then SIGKILL.
    pub async fn terminate(&self, handle: &ProcessHandle, graceful: bool) -> Result<ExitInfo> {
        if let Some(info) = handle.exit_info() {
            return Ok(info);
        }
        let id = &handle.slot.instance_id;

        let mut sent_command = false;
        if graceful && let Some(cmd) = handle.slot.stop_command.clone() {
            sent_command = self.write_line(handle, &cmd).await.is_ok();
            if sent_command {
                tracing::info!(instance_id = %id, "sent stop command");
                if let Some(info) = handle.wait_exit_for(self.policy.stop_timeout).await {
                    return Ok(info);
                }
            }
        }

        tracing::info!(instance_id = %id, after_stop_command = sent_command, "sending SIGTERM");
        handle.signal(SIGTERM);
        if let Some(info) = handle.wait_exit_for(self.policy.term_grace).await {
            return Ok(info);
        }

        tracing::warn!(instance_id = %id, "process ignored SIGTERM; sending SIGKILL");
        handle.signal(SIGKILL);
        handle.slot.kill.notify_one();
        handle
            .wait_exit_for(KILL_WAIT)
            .await
            .ok_or_else(|| anyhow::anyhow!("process for instance {id} did not exit after SIGKILL").into())
    }

    /// Forcefully stop every live process.
    pub async fn kill_all(&self) {
        for h in self.running() {
            let _ = self.terminate(&h, false).await;
        }
    }
}

fn spawn_reader<R>(stream: R, generation: u64, observer: Arc<dyn ProcessObserver>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf);
                    observer.on_output(generation, line.trim_end_matches(['\r', '\n']).to_string());
                }
            }
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Seen {
        Line(String),
        Exit(ExitInfo),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl ProcessObserver for Recorder {
        fn on_output(&self, _generation: u64, line: String) {
            let _ = self.0.send(Seen::Line(line));
        }
        fn on_sample(&self, _generation: u64, _sample: ResourceSample) {}
        fn on_exit(&self, exit: ExitInfo) {
            let _ = self.0.send(Seen::Exit(exit));
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(
            Duration::from_millis(250),
            StopPolicy {
                stop_timeout: Duration::from_secs(2),
                term_grace: Duration::from_millis(300),
            },
        )
    }

    fn sh(script: &str, cwd: PathBuf) -> LaunchSpec {
        LaunchSpec {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd,
            env: BTreeMap::new(),
            stop_command: Some("stop".to_string()),
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn echoes_stdin_and_reports_exit_after_output() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = InstanceId::from("a");
        let h = sup
            .spawn(
                &id,
                sh("echo hello; read l; echo \"got $l\"; exit 3", dir.path().to_path_buf()),
                Arc::new(Recorder(tx)),
            )
            .unwrap();
        assert!(h.is_running());

        assert!(matches!(next(&mut rx).await, Seen::Line(l) if l == "hello"));
        sup.write_line(&h, "ping").await.unwrap();
        assert!(matches!(next(&mut rx).await, Seen::Line(l) if l == "got ping"));
        match next(&mut rx).await {
            Seen::Exit(info) => {
                assert_eq!(info.code, Some(3));
                assert_eq!(info.generation, h.generation());
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(!h.is_running());
        assert!(matches!(
            sup.write_line(&h, "late").await,
            Err(AnvilError::ProcessNotRunning(_))
        ));
        assert!(sup.handle(&id).is_none());
        assert!(sup.procs().is_empty());
    }

    #[tokio::test]
    async fn graceful_stop_uses_the_stop_command() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let (tx, _rx) = mpsc::unbounded_channel();
        let h = sup
            .spawn(
                &InstanceId::from("a"),
                sh(
                    "while read l; do [ \"$l\" = stop ] && exit 0; done",
                    dir.path().to_path_buf(),
                ),
                Arc::new(Recorder(tx)),
            )
            .unwrap();
        let info = sup.terminate(&h, true).await.unwrap();
        assert_eq!(info.code, Some(0));
    }

    #[tokio::test]
    async fn escalates_to_sigkill_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let (tx, _rx) = mpsc::unbounded_channel();
        let h = sup
            .spawn(
                &InstanceId::from("a"),
                sh(
                    "trap '' TERM; while true; do sleep 0.1; done",
                    dir.path().to_path_buf(),
                ),
                Arc::new(Recorder(tx)),
            )
            .unwrap();
        let info = sup.terminate(&h, false).await.unwrap();
        assert_eq!(info.code, None);
        assert!(!h.is_running());
    }

    #[tokio::test]
    async fn bad_launch_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let (tx, _rx) = mpsc::unbounded_channel();
        let obs: Arc<dyn ProcessObserver> = Arc::new(Recorder(tx));

        let missing_cwd = sh("true", dir.path().join("missing"));
        assert!(matches!(
            sup.spawn(&InstanceId::from("a"), missing_cwd, obs.clone()),
            Err(AnvilError::Spawn(_))
        ));

        let mut missing_exe = sh("true", dir.path().to_path_buf());
        missing_exe.program = "/nonexistent/server".to_string();
        assert!(matches!(
            sup.spawn(&InstanceId::from("a"), missing_exe, obs),
            Err(AnvilError::Spawn(_))
        ));
    }
}
