//! Child process abstraction used by the authenticating proxy supervisor
//!
//! Supervision only ever sees a stream of typed events and a kill switch, so
//! tests can drive it with a fake launcher instead of real subprocesses.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// What to run
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Port the process is expected to listen on
    pub port: u16,
}

/// Output and lifecycle events of a launched process
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    StdoutLine(String),
    StderrLine(String),
    /// Exit code, `None` when killed by a signal
    Exited(Option<i32>),
}

/// A running process as seen by its supervisor
///
/// Dropping `kill` (or sending on it) terminates the process. The event
/// stream always ends with exactly one `Exited`.
pub struct LaunchedProcess {
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
    pub kill: oneshot::Sender<()>,
}

pub trait ProcessLauncher: Send + Sync + 'static {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess>;
}

/// Launches real processes with `tokio::process`
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioLauncher;

impl ProcessLauncher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<LaunchedProcess> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let pid = child.id();
        let (event_tx, events) = mpsc::unbounded_channel();
        let (kill, kill_rx) = oneshot::channel::<()>();

        let stdout_done = child
            .stdout
            .take()
            .map(|out| tokio::spawn(pump_lines(out, event_tx.clone(), ProcessEvent::StdoutLine)));
        let stderr_done = child
            .stderr
            .take()
            .map(|err| tokio::spawn(pump_lines(err, event_tx.clone(), ProcessEvent::StderrLine)));

        tokio::spawn(async move {
            let exited = tokio::select! {
                status = child.wait() => Some(status),
                _ = kill_rx => None,
            };
            let status = match exited {
                Some(status) => status,
                None => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            // Flush remaining output before reporting the exit. Grandchildren may
            // keep the pipes open, so this is bounded.
            for pump in [stdout_done, stderr_done].into_iter().flatten() {
                let _ = tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, pump).await;
            }

            let code = status.ok().and_then(|s| s.code());
            debug!(?pid, ?code, "Process exited");
            let _ = event_tx.send(ProcessEvent::Exited(code));
        });

        Ok(LaunchedProcess { pid, events, kill })
    }
}

async fn pump_lines<R>(
    reader: R,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    wrap: fn(String) -> ProcessEvent,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(wrap(line)).is_err() {
            break;
        }
    }
}
