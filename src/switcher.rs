//! Process Switcher (C7): routes an incoming `(identifier, context size)`
//! request to a compatible running server, reusing it when possible and
//! swapping it out when not. Requests are serialized through a single slot
//! so only one server is ever starting or stopping at a time.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::Config;
use crate::error::{Result, SwitchboardError};
use crate::installation::Installation;
use crate::supervisor::Supervisor;

const FULL_OFFLOAD_GPU_LAYERS: u32 = 999;

/// A request for a server, abstracted from the concrete supervisor so the
/// switcher's reuse-or-swap logic can be tested without spawning real
/// processes.
#[async_trait]
pub trait ProcessSpec: Send + Sync + 'static {
    /// Would a server already running for `self` also satisfy `other`?
    fn accepts(&self, other: &Self) -> bool
    where
        Self: Sized;
    async fn start(&self) -> Result<Box<dyn ProcessContext>>;
}

/// A running server, abstracted from [`Supervisor`] for the same reason.
#[async_trait]
pub trait ProcessContext: Send + Sync {
    fn base_url(&self) -> String;
    async fn close(&mut self, force: bool) -> Result<()>;
}

#[async_trait]
impl ProcessContext for Supervisor {
    fn base_url(&self) -> String {
        Supervisor::base_url(self)
    }

    async fn close(&mut self, force: bool) -> Result<()> {
        self.stop(force).await
    }
}

/// The default [`ProcessSpec`]: a fixed model config run through a fixed
/// `llama-server` installation, with the switching-specific argument
/// overrides applied at start time (§4.7): bind broadly, auto-allocate the
/// port, and default to full GPU offload when CUDA is available and the
/// caller left `gpu_layers` unset.
#[derive(Clone)]
pub struct ServerSpec {
    pub installation: Arc<Installation>,
    pub config: Config,
}

impl ServerSpec {
    pub fn new(installation: Arc<Installation>, config: Config) -> Self {
        Self { installation, config }
    }
}

#[async_trait]
impl ProcessSpec for ServerSpec {
    fn accepts(&self, other: &Self) -> bool {
        self.config.accept(&other.config)
    }

    async fn start(&self) -> Result<Box<dyn ProcessContext>> {
        let server_path = self
            .installation
            .server_path()
            .ok_or_else(|| SwitchboardError::NotFound {
                what: "llama-server binary".into(),
            })?;

        let mut config = self.config.clone();
        config.host = Some("0.0.0.0".to_string());
        config.port = Some(0);
        if config.gpu_layers.is_none() && self.installation.has_cuda().await? {
            config.gpu_layers = Some(FULL_OFFLOAD_GPU_LAYERS);
        }
        let flash_attn_is_enum = self.installation.flash_attn_is_enum().await?;

        let mut supervisor = Supervisor::new(server_path, config, flash_attn_is_enum)?;
        supervisor.start().await?;
        Ok(Box::new(supervisor))
    }
}

struct Slot<S> {
    spec: S,
    context: Box<dyn ProcessContext>,
}

/// Single-slot switcher: at most one server is tracked at a time. Every
/// call to [`Switcher::with_context`] is serialized by an internal mutex,
/// which also gives callers FIFO fairness.
pub struct Switcher<S: ProcessSpec + Clone> {
    slot: Mutex<Option<Slot<S>>>,
}

impl<S: ProcessSpec + Clone> Default for Switcher<S> {
    fn default() -> Self {
        Self { slot: Mutex::new(None) }
    }
}

impl<S: ProcessSpec + Clone> Switcher<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reuse the running server if it accepts `pending`, otherwise stop it
    /// and start one that does, then run `body` against the resulting
    /// context. Held for the whole call, so concurrent callers queue.
    ///
    /// `body` returns a boxed future rather than a plain `Fut` type
    /// parameter because the future it returns borrows the `&mut dyn
    /// ProcessContext` argument: that borrow's lifetime is only known at
    /// the call site, so it has to be threaded through a `for<'a>` bound
    /// instead of a fixed associated type.
    pub async fn with_context<F, T>(&self, pending: S, body: F) -> Result<T>
    where
        F: for<'a> FnOnce(&'a mut dyn ProcessContext) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    {
        let mut guard = self.slot.lock().await;

        let needs_swap = match guard.as_ref() {
            Some(slot) => !slot.spec.accepts(&pending),
            None => true,
        };

        if needs_swap {
            if let Some(mut old) = guard.take() {
                info!("stopping current server to satisfy an incompatible request");
                old.context.close(false).await?;
            }
            let context = pending.start().await?;
            *guard = Some(Slot {
                spec: pending,
                context,
            });
        }

        let slot = guard.as_mut().expect("slot populated by the branch above");
        body(slot.context.as_mut()).await
    }

    /// Stop whatever server is currently running, if any.
    pub async fn stop(&self) -> Result<()> {
        let mut guard = self.slot.lock().await;
        if let Some(mut slot) = guard.take() {
            slot.context.close(false).await?;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}
