//! Exclusive device resources held for the lifetime of a playback session.
//!
//! Two leases: a best-effort keep-alive that stops the box from idling its
//! network/sleep state, and exclusive audio focus.  Lease mutation happens on
//! a single background worker fed through an unbounded channel, so the
//! control loop never blocks on it, and a release queued by one session is
//! always applied before the next session's acquire.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use tuner_proto::config::ResourcesConfig;
use tuner_proto::protocol::FocusChange;

/// Output volume while another source has ducked us.
pub const DUCK_VOLUME: f32 = 0.3;

/// One exclusive device capability.
pub trait LeaseBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn acquire(&self) -> anyhow::Result<()>;
    fn release(&self);
}

/// What the controller should do to the engine after a focus change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FocusAction {
    Pause,
    Duck(f32),
    Resume,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FocusState {
    #[default]
    Released,
    Held,
    Lost,
    LostTransient,
    Ducked,
}

#[derive(Debug, Clone, Copy)]
enum Lease {
    KeepAlive,
    AudioFocus,
}

enum LeaseOp {
    Acquire(Lease),
    Release(Lease),
    Flush(oneshot::Sender<()>),
}

/// Non-reference-counted holder of the session's leases.
pub struct ResourceArbiter {
    held: bool,
    focus: FocusState,
    ops: mpsc::UnboundedSender<LeaseOp>,
}

impl ResourceArbiter {
    /// Spawns the lease worker; must be called inside a tokio runtime.
    pub fn new(keep_alive: Arc<dyn LeaseBackend>, audio_focus: Arc<dyn LeaseBackend>) -> Self {
        let (ops, rx) = mpsc::unbounded_channel();
        tokio::spawn(lease_worker(rx, keep_alive, audio_focus));
        Self {
            held: false,
            focus: FocusState::Released,
            ops,
        }
    }

    /// Backends for the host system, per config.
    pub fn from_config(config: &ResourcesConfig) -> Self {
        let keep_alive: Arc<dyn LeaseBackend> = if config.keep_alive {
            Arc::new(IdleInhibitor::default())
        } else {
            Arc::new(NoLease("keep-alive"))
        };
        let audio_focus = Arc::new(FocusLockFile::new(config.audio_focus_lock.clone()));
        Self::new(keep_alive, audio_focus)
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn focus(&self) -> FocusState {
        self.focus
    }

    /// Take both leases.  No-op while already held.
    pub fn acquire(&mut self) {
        if self.held {
            debug!("resources: acquire while held, ignoring");
            return;
        }
        self.held = true;
        self.focus = FocusState::Held;
        self.send(LeaseOp::Acquire(Lease::KeepAlive));
        self.send(LeaseOp::Acquire(Lease::AudioFocus));
    }

    /// Drop whatever is held.  Safe to call repeatedly.
    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        self.send(LeaseOp::Release(Lease::KeepAlive));
        // permanent loss already gave focus back
        if self.focus != FocusState::Lost {
            self.send(LeaseOp::Release(Lease::AudioFocus));
        }
        self.focus = FocusState::Released;
    }

    /// React to a host focus signal.  Returns `None` when no session holds
    /// the leases.
    pub fn on_focus_change(&mut self, change: FocusChange) -> Option<FocusAction> {
        if !self.held {
            debug!("resources: focus change {:?} with no session", change);
            return None;
        }
        let action = match change {
            FocusChange::Loss => {
                info!("resources: audio focus lost, pausing");
                if self.focus != FocusState::Lost {
                    self.send(LeaseOp::Release(Lease::AudioFocus));
                }
                self.focus = FocusState::Lost;
                FocusAction::Pause
            }
            FocusChange::LossTransient => {
                info!("resources: audio focus lost transiently, pausing");
                self.focus = FocusState::LostTransient;
                FocusAction::Pause
            }
            FocusChange::LossTransientCanDuck => {
                info!("resources: audio focus duck, lowering volume");
                self.focus = FocusState::Ducked;
                FocusAction::Duck(DUCK_VOLUME)
            }
            FocusChange::Gain => {
                info!("resources: audio focus gained, resuming");
                if self.focus == FocusState::Lost {
                    self.send(LeaseOp::Acquire(Lease::AudioFocus));
                }
                self.focus = FocusState::Held;
                FocusAction::Resume
            }
        };
        Some(action)
    }

    /// Wait until every lease operation queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(LeaseOp::Flush(tx));
        let _ = rx.await;
    }

    fn send(&self, op: LeaseOp) {
        if self.ops.send(op).is_err() {
            warn!("resources: lease worker gone");
        }
    }
}

async fn lease_worker(
    mut rx: mpsc::UnboundedReceiver<LeaseOp>,
    keep_alive: Arc<dyn LeaseBackend>,
    audio_focus: Arc<dyn LeaseBackend>,
) {
    let mut keep_alive_held = false;
    let mut focus_held = false;
    while let Some(op) = rx.recv().await {
        match op {
            LeaseOp::Acquire(lease) => {
                let (backend, held) = match lease {
                    Lease::KeepAlive => (&keep_alive, &mut keep_alive_held),
                    Lease::AudioFocus => (&audio_focus, &mut focus_held),
                };
                if *held {
                    continue;
                }
                match backend.acquire() {
                    Ok(()) => {
                        debug!("resources: {} acquired", backend.name());
                        *held = true;
                    }
                    Err(e) => warn!("resources: failed to acquire {}: {}", backend.name(), e),
                }
            }
            LeaseOp::Release(lease) => {
                let (backend, held) = match lease {
                    Lease::KeepAlive => (&keep_alive, &mut keep_alive_held),
                    Lease::AudioFocus => (&audio_focus, &mut focus_held),
                };
                if *held {
                    backend.release();
                    debug!("resources: {} released", backend.name());
                    *held = false;
                }
            }
            LeaseOp::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    // Controller gone: never leak a lease past the process.
    if keep_alive_held {
        keep_alive.release();
    }
    if focus_held {
        audio_focus.release();
    }
}

/// Placeholder for a lease disabled in config.
pub struct NoLease(pub &'static str);

impl LeaseBackend for NoLease {
    fn name(&self) -> &'static str {
        self.0
    }

    fn acquire(&self) -> anyhow::Result<()> {
        Ok(())
    }

    fn release(&self) {}
}

/// Keeps the host from idling/sleeping by holding a `systemd-inhibit` child.
#[derive(Default)]
pub struct IdleInhibitor {
    child: Mutex<Option<std::process::Child>>,
}

impl LeaseBackend for IdleInhibitor {
    fn name(&self) -> &'static str {
        "keep-alive"
    }

    fn acquire(&self) -> anyhow::Result<()> {
        let child = std::process::Command::new("systemd-inhibit")
            .args([
                "--what=idle:sleep",
                "--who=tunerd",
                "--why=live playback",
                "--mode=block",
                "sleep",
                "infinity",
            ])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()?;
        let mut guard = self
            .child
            .lock()
            .map_err(|_| anyhow::anyhow!("inhibitor lock poisoned"))?;
        *guard = Some(child);
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut guard) = self.child.lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}

/// Exclusive audio output ownership marked by a lock file holding our pid.
pub struct FocusLockFile {
    path: PathBuf,
    owned: AtomicBool,
}

impl FocusLockFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            owned: AtomicBool::new(false),
        }
    }
}

impl LeaseBackend for FocusLockFile {
    fn name(&self) -> &'static str {
        "audio-focus"
    }

    fn acquire(&self) -> anyhow::Result<()> {
        use std::io::Write;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|e| anyhow::anyhow!("{} ({})", e, self.path.display()))?;
        writeln!(file, "{}", std::process::id())?;
        self.owned.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        if self.owned.swap(false, Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("resources: failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}
