//! Process Supervisor (C3): owns a single `llama-server` child process,
//! its readiness handshake, and its shutdown sequence.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{Config, FlashAttention};
use crate::error::{Result, SwitchboardError};

const START_TIMEOUT: Duration = Duration::from_secs(60);
const STOP_GRACE: Duration = Duration::from_secs(5);
const LOG_BUFFER_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Absent,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// A running (or recently running) `llama-server` instance bound to a single
/// port, spawned with a fixed [`Config`].
pub struct Supervisor {
    config: Config,
    server_path: PathBuf,
    port: u16,
    status: Status,
    child: Option<Child>,
    log_buffer: Arc<Mutex<String>>,
    readiness_template: String,
    flash_attn_is_enum: bool,
}

impl Supervisor {
    /// Build a supervisor for `config`, allocating an ephemeral port if the
    /// config leaves `port` unset (or set to 0). `flash_attn_is_enum` comes
    /// from [`crate::installation::Installation::flash_attn_is_enum`] and
    /// decides which `--flash-attn` argument form [`Self::build_args`] emits.
    pub fn new(server_path: impl Into<PathBuf>, config: Config, flash_attn_is_enum: bool) -> Result<Self> {
        let port = match config.port {
            Some(p) if p != 0 => p,
            _ => allocate_ephemeral_port()?,
        };
        let readiness_template = default_readiness_template(config.effective_host(), port);
        Ok(Self {
            config,
            server_path: server_path.into(),
            port,
            status: Status::Absent,
            child: None,
            log_buffer: Arc::new(Mutex::new(String::new())),
            readiness_template,
            flash_attn_is_enum,
        })
    }

    /// Override the readiness substring scanned for on startup. Exists for
    /// callers running against a server build whose log line has drifted
    /// from the default template.
    pub fn with_readiness_template(mut self, template: impl Into<String>) -> Self {
        self.readiness_template = template.into();
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.config.effective_host(), self.port)
    }

    /// Build the argv for `llama-server`, in a fixed, conservative order:
    /// network, model, compute shape, then user-supplied flags last so they
    /// can override anything preceding them.
    fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        args.push("--host".into());
        args.push(self.config.effective_host().to_string());
        args.push("--port".into());
        args.push(self.port.to_string());
        args.push("--model".into());
        args.push(self.config.model_path.display().to_string());

        if let Some(threads) = self.config.threads {
            args.push("--threads".into());
            args.push(threads.to_string());
        }
        args.push("--ctx-size".into());
        args.push(self.config.effective_context_size().to_string());

        if let Some(gpu_layers) = self.config.effective_gpu_layers() {
            args.push("--gpu-layers".into());
            args.push(gpu_layers.to_string());
        }
        if self.config.effective_n_cpu_moe() > 0 {
            args.push("--n-cpu-moe".into());
            args.push(self.config.effective_n_cpu_moe().to_string());
        }
        if self.config.effective_embeddings() {
            args.push("--embeddings".into());
        }
        if self.config.effective_mlock() {
            args.push("--mlock".into());
        }
        if self.flash_attn_is_enum {
            let value = match self.config.effective_flash_attention() {
                FlashAttention::On => "on",
                FlashAttention::Off => "off",
                FlashAttention::Auto => "auto",
            };
            args.push("--flash-attn".into());
            args.push(value.into());
        } else if self.config.effective_flash_attention() == FlashAttention::On {
            args.push("--flash-attn".into());
        }
        for pattern in &self.config.override_tensors {
            args.push("--override-tensors".into());
            args.push(pattern.clone());
        }
        args.extend(self.config.args.iter().cloned());
        args
    }

    fn readiness_needle(&self) -> &str {
        &self.readiness_template
    }

    /// Spawn the child and block until either the readiness line appears on
    /// stdout or stderr, the process exits, or [`START_TIMEOUT`] elapses.
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.status, Status::Starting | Status::Running) {
            return Ok(());
        }
        self.status = Status::Starting;
        let args = self.build_args();
        debug!(?args, port = self.port, "spawning llama-server");

        let mut child = Command::new(&self.server_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SwitchboardError::Io)?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let needle = self.readiness_needle().to_string();

        let (ready_tx, mut ready_rx) = tokio::sync::mpsc::channel::<()>(1);
        spawn_log_reader(stdout, self.log_buffer.clone(), needle.clone(), ready_tx.clone());
        spawn_log_reader(stderr, self.log_buffer.clone(), needle, ready_tx);

        let wait_result = timeout(START_TIMEOUT, async {
            tokio::select! {
                _ = ready_rx.recv() => Ok(()),
                exit = child.wait() => {
                    let exit_code = exit.ok().and_then(|s| s.code());
                    Err(SwitchboardError::StartFailed {
                        output: self.log_buffer.lock().clone(),
                        exit_code,
                    })
                }
            }
        })
        .await;

        match wait_result {
            Ok(Ok(())) => {
                self.status = Status::Running;
                self.child = Some(child);
                info!(port = self.port, "llama-server ready");
                Ok(())
            }
            Ok(Err(e)) => {
                self.status = Status::Stopped;
                Err(e)
            }
            Err(_) => {
                self.status = Status::Stopped;
                let _ = child.start_kill();
                Err(SwitchboardError::Timeout {
                    after: START_TIMEOUT,
                })
            }
        }
    }

    /// Stop the child. `force` skips straight to [`Child::kill`]; otherwise
    /// the process is asked to terminate and given [`STOP_GRACE`] before
    /// being killed.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.status = Status::Absent;
            return Ok(());
        };
        self.status = Status::Stopping;

        if !force {
            #[cfg(unix)]
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as i32, libc::SIGTERM);
                }
            }
            if timeout(STOP_GRACE, child.wait()).await.is_ok() {
                self.status = Status::Stopped;
                return Ok(());
            }
            warn!(port = self.port, "server did not exit within grace period, killing");
        }

        child.kill().await.map_err(SwitchboardError::Io)?;
        let _ = child.wait().await;
        self.status = Status::Stopped;
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.stop(false).await?;
        self.start().await
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if child.start_kill().is_err() {
                warn!(port = self.port, "failed to kill child on drop");
            }
        }
    }
}

/// Default readiness substring: matches llama.cpp server's own log line at
/// the point it starts accepting connections. Overridable per-instance via
/// [`Supervisor::with_readiness_template`] for drifted server builds.
fn default_readiness_template(host: &str, port: u16) -> String {
    format!("main: server is listening on http://{host}:{port} - starting the main loop")
}

fn spawn_log_reader<R>(
    reader: R,
    buffer: Arc<Mutex<String>>,
    needle: String,
    ready_tx: tokio::sync::mpsc::Sender<()>,
) where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            {
                let mut buf = buffer.lock();
                buf.push_str(&line);
                buf.push('\n');
                if buf.len() > LOG_BUFFER_CAP {
                    let excess = buf.len() - LOG_BUFFER_CAP;
                    let cut = buf
                        .char_indices()
                        .map(|(i, _)| i)
                        .find(|&i| i >= excess)
                        .unwrap_or(buf.len());
                    buf.drain(..cut);
                }
            }
            if line.contains(&needle) {
                let _ = ready_tx.send(()).await;
            }
        }
    });
}

fn allocate_ephemeral_port() -> Result<u16> {
    // Bind-then-drop: the OS may hand the same port to another process
    // before `start()` binds it for real. Accepted as a rare, narrow race
    // rather than engineering a hold-open handoff.
    let listener = TcpListener::bind("127.0.0.1:0").map_err(SwitchboardError::Io)?;
    let port = listener.local_addr().map_err(SwitchboardError::Io)?.port();
    drop(listener);
    Ok(port)
}

pub fn find_install_server_path(root: &Path) -> PathBuf {
    root.join("llama-server")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> Config {
        Config::new("/models/m.gguf")
    }

    #[test]
    fn allocate_ephemeral_port_returns_distinct_values() {
        let a = allocate_ephemeral_port().unwrap();
        let b = allocate_ephemeral_port().unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[test]
    fn build_args_includes_model_and_port() {
        let sup = Supervisor::new("/opt/llama/llama-server", cfg(), false).unwrap();
        let args = sup.build_args();
        assert!(args.iter().any(|a| a == "--model"));
        assert!(args.windows(2).any(|w| w[0] == "--port" && w[1] == sup.port().to_string()));
    }

    #[test]
    fn build_args_flash_attn_auto_omits_bare_flag() {
        let sup = Supervisor::new("/opt/llama/llama-server", cfg(), false).unwrap();
        let args = sup.build_args();
        assert!(!args.iter().any(|a| a == "--flash-attn"));
    }

    #[test]
    fn build_args_flash_attn_enum_form_emits_auto_explicitly() {
        let sup = Supervisor::new("/opt/llama/llama-server", cfg(), true).unwrap();
        let args = sup.build_args();
        assert!(args.windows(2).any(|w| w[0] == "--flash-attn" && w[1] == "auto"));
    }

    #[test]
    fn build_args_flash_attn_bare_form_only_for_on() {
        let mut c = cfg();
        c = c.with_flash_attention(FlashAttention::On);
        let sup = Supervisor::new("/opt/llama/llama-server", c, false).unwrap();
        let args = sup.build_args();
        assert!(args.iter().any(|a| a == "--flash-attn"));
        assert!(!args.windows(2).any(|w| w[0] == "--flash-attn" && w[1] == "on"));

        let mut off = cfg();
        off = off.with_flash_attention(FlashAttention::Off);
        let sup = Supervisor::new("/opt/llama/llama-server", off, false).unwrap();
        let args = sup.build_args();
        assert!(!args.iter().any(|a| a == "--flash-attn"));
    }

    #[test]
    fn build_args_override_tensors_repeated() {
        let mut c = cfg();
        c.override_tensors = vec!["a=CPU".into(), "b=CPU".into()];
        let sup = Supervisor::new("/opt/llama/llama-server", c, false).unwrap();
        let args = sup.build_args();
        let count = args.iter().filter(|a| *a == "--override-tensors").count();
        assert_eq!(count, 2);
    }

    #[test]
    fn build_args_gpu_layers_flag_is_spec_name() {
        let c = cfg().with_gpu_layers(10);
        let sup = Supervisor::new("/opt/llama/llama-server", c, false).unwrap();
        let args = sup.build_args();
        assert!(args.iter().any(|a| a == "--gpu-layers"));
        assert!(!args.iter().any(|a| a == "--n-gpu-layers"));
    }

    #[test]
    fn new_port_is_explicit_when_set() {
        let mut c = cfg();
        c.port = Some(18080);
        let sup = Supervisor::new("/opt/llama/llama-server", c, false).unwrap();
        assert_eq!(sup.port(), 18080);
    }

    /// S1 from the testable-properties scenarios: a real server answers
    /// `GET /health` with 200 and `{"status":"ok"}` once started, and
    /// `stop()` actually terminates it. Requires a real `llama-server`
    /// binary and a small embedding model on disk, named by
    /// `LLAMA_SERVER_PATH` / `LLAMA_TEST_MODEL`.
    #[tokio::test]
    #[ignore = "needs a real llama-server binary and GGUF fixture on disk"]
    async fn health_check_round_trip() {
        let server_path = std::env::var("LLAMA_SERVER_PATH").expect("set LLAMA_SERVER_PATH to the llama-server binary");
        let model_path = std::env::var("LLAMA_TEST_MODEL").expect("set LLAMA_TEST_MODEL to a small embedding GGUF");

        let mut sup = Supervisor::new(server_path, Config::new(model_path).with_port(0), false).unwrap();
        sup.start().await.unwrap();
        assert_eq!(sup.status(), Status::Running);

        let resp = reqwest::get(format!("{}/health", sup.base_url())).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");

        sup.stop(false).await.unwrap();
        assert_eq!(sup.status(), Status::Stopped);
    }
}
