//! Realtime connection state machine.
//!
//! Every connect is tagged with an operation from [`OperationStamp`]. Each
//! continuation re-checks that its operation is still live immediately
//! before acting; `stop()` and a newer `start()` invalidate older ones.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::config::ConnectionConfig;
use crate::domain::{
    AtomicConnectionStatus, ConnectionStatus, CoreError, CoreEvent, DiagnosticLevel,
    DiagnosticSource, OperationStamp,
};
use crate::engine::dispatch::{Dispatcher, Flow};
use crate::ports::{
    BackendApi, CaptureDevice, ConnectContext, OutboundMessage, RealtimeTransport,
    TransportControl, TransportLink, TransportTokenRequest,
};

/// Called once per connection attempt when it stops being active.
pub type TrackingResetHook = Arc<dyn Fn() + Send + Sync>;

/// Finalizes the backend session after the post-stop drain.
pub type FinalizeHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct Hooks {
    reset_tracking: Option<TrackingResetHook>,
    finalize_session: Option<FinalizeHook>,
}

struct ActiveLink {
    operation: u64,
    control: Arc<dyn TransportControl>,
    pump: JoinHandle<()>,
}

pub struct Orchestrator {
    config: ConnectionConfig,
    status: AtomicConnectionStatus,
    stamp: OperationStamp,
    input_paused: AtomicBool,
    stopping: AtomicBool,
    last_reset_operation: AtomicU64,
    backend: Arc<dyn BackendApi>,
    transport: Arc<dyn RealtimeTransport>,
    capture: Arc<dyn CaptureDevice>,
    dispatcher: Arc<Dispatcher>,
    events: broadcast::Sender<CoreEvent>,
    link: Mutex<Option<ActiveLink>>,
    hooks: RwLock<Hooks>,
}

impl Orchestrator {
    pub fn new(
        config: ConnectionConfig,
        backend: Arc<dyn BackendApi>,
        transport: Arc<dyn RealtimeTransport>,
        capture: Arc<dyn CaptureDevice>,
        dispatcher: Arc<Dispatcher>,
        events: broadcast::Sender<CoreEvent>,
    ) -> Self {
        Self {
            config,
            status: AtomicConnectionStatus::default(),
            stamp: OperationStamp::new(),
            input_paused: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            last_reset_operation: AtomicU64::new(0),
            backend,
            transport,
            capture,
            dispatcher,
            events,
            link: Mutex::new(None),
            hooks: RwLock::new(Hooks::default()),
        }
    }

    pub fn set_tracking_reset(&self, hook: TrackingResetHook) {
        self.hooks.write().reset_tracking = Some(hook);
    }

    pub fn set_finalize(&self, hook: FinalizeHook) {
        self.hooks.write().finalize_session = Some(hook);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.load()
    }

    /// The live operation, 0 when none.
    pub fn operation(&self) -> u64 {
        self.stamp.current()
    }

    pub fn is_input_paused(&self) -> bool {
        self.input_paused.load(Ordering::Acquire)
    }

    /// Open the realtime transport for `session_id`.
    ///
    /// Returns the operation that connected. A start that was overtaken by
    /// `stop()` or a newer start returns [`CoreError::Superseded`] without
    /// touching any state.
    pub async fn start(self: &Arc<Self>, session_id: &str) -> Result<u64, CoreError> {
        let from = self.status.load();
        if !from.can_start()
            || !self
                .status
                .compare_exchange(from, ConnectionStatus::Connecting)
        {
            return Err(CoreError::InvalidTransition {
                from: self.status.load(),
                action: "start",
            });
        }
        let operation = self.stamp.next();
        let generation = self.dispatcher.generation();
        let _ = self.events.send(CoreEvent::StatusChanged {
            from,
            to: ConnectionStatus::Connecting,
            operation,
        });
        info!(operation, session_id, "Starting realtime connection");

        if let Err(e) = self.capture.check_available() {
            warn!(operation, error = %e, "Capture device unavailable");
            if self.stamp.retire(operation) {
                self.diagnostic(DiagnosticSource::Capture, DiagnosticLevel::Error, e.to_string());
                self.set_status(ConnectionStatus::Error, operation);
            }
            return Err(e);
        }

        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if !self.stamp.is_current(operation) {
                return Err(self.superseded(operation));
            }

            match self.connect_once(operation, attempt, session_id).await {
                Ok(link) => {
                    if !self.stamp.is_current(operation) {
                        link.control.close().await;
                        return Err(self.superseded(operation));
                    }
                    if let Err(control) = self.install(operation, generation, link) {
                        control.close().await;
                        return Err(self.superseded(operation));
                    }
                    self.set_status(ConnectionStatus::Connected, operation);
                    info!(operation, attempt, "Realtime transport connected");
                    return Ok(operation);
                }
                Err(e) if e.is_superseded() => return Err(self.superseded(operation)),
                Err(e) => {
                    warn!(operation, attempt, max_attempts, error = %e, "Connect attempt failed");
                    self.diagnostic(
                        DiagnosticSource::Transport,
                        DiagnosticLevel::Warn,
                        format!("attempt {} failed: {}", attempt, e),
                    );
                    last_error = e.to_string();
                    if attempt < max_attempts {
                        let delay = self.config.backoff_ms * u64::from(attempt);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        if !self.stamp.retire(operation) {
            return Err(self.superseded(operation));
        }
        let err = CoreError::ConnectFailed {
            attempts: max_attempts,
            last_error,
        };
        error!(operation, error = %err, "Realtime connection failed");
        self.diagnostic(DiagnosticSource::Transport, DiagnosticLevel::Error, err.to_string());
        self.set_status(ConnectionStatus::Error, operation);
        Err(err)
    }

    async fn connect_once(
        &self,
        operation: u64,
        attempt: u32,
        session_id: &str,
    ) -> Result<TransportLink, CoreError> {
        let request = TransportTokenRequest {
            session_id: Some(session_id.to_string()),
            counterpart_id: None,
            scenario_id: None,
            voice: self.config.voice.clone(),
            language: self.config.language.clone(),
        };
        let token = self.backend.transport_token(&request).await?;
        if !self.stamp.is_current(operation) {
            return Err(CoreError::Superseded);
        }

        let context = ConnectContext {
            operation,
            attempt,
            session_id: session_id.to_string(),
            voice: self.config.voice.clone(),
            language: self.config.language.clone(),
            token,
        };
        debug!(operation, attempt, model = %context.token.model, "Negotiating transport");
        self.transport.negotiate(&context).await
    }

    /// Store the link and start its event pump. The stamp is re-checked
    /// under the slot lock; a stale link is handed back for closing.
    fn install(
        self: &Arc<Self>,
        operation: u64,
        generation: u64,
        link: TransportLink,
    ) -> Result<(), Arc<dyn TransportControl>> {
        let TransportLink {
            mut events,
            control,
        } = link;

        let mut slot = self.link.lock();
        if !self.stamp.is_current(operation) {
            return Err(control);
        }
        control.set_input_enabled(!self.is_input_paused());
        let weak = Arc::downgrade(self);
        let pump = tokio::spawn(async move {
            let mut reason = None;
            while let Some(event) = events.recv().await {
                let Some(this) = weak.upgrade() else {
                    return;
                };
                if !this.stamp.is_current(operation) {
                    return;
                }
                if let Flow::Closed(r) = this.dispatcher.dispatch(generation, event) {
                    reason = r;
                    break;
                }
            }
            if let Some(this) = weak.upgrade() {
                this.handle_remote_close(operation, reason).await;
            }
        });
        *slot = Some(ActiveLink {
            operation,
            control,
            pump,
        });
        Ok(())
    }

    async fn handle_remote_close(&self, operation: u64, reason: Option<String>) {
        if !self.stamp.retire(operation) {
            return;
        }
        let active = {
            let mut slot = self.link.lock();
            if slot.as_ref().is_some_and(|a| a.operation == operation) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(active) = active {
            active.control.close().await;
        }

        warn!(operation, reason = ?reason, "Realtime transport closed by remote");
        self.diagnostic(
            DiagnosticSource::Transport,
            DiagnosticLevel::Warn,
            reason.unwrap_or_else(|| "transport closed".to_string()),
        );
        self.set_status(ConnectionStatus::Idle, operation);
    }

    /// Tear down the transport, wait for in-flight transcript writes to
    /// land, finalize the session, then go idle.
    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::AcqRel) {
            debug!("Stop already in progress");
            return;
        }

        let operation = self.stamp.invalidate();
        let status = self.status.load();
        if !status.is_active() {
            if status == ConnectionStatus::Error {
                self.set_status(ConnectionStatus::Idle, operation);
            }
            self.stopping.store(false, Ordering::Release);
            return;
        }

        info!(operation, status = ?status, "Stopping realtime connection");
        let active = self.link.lock().take();
        if let Some(active) = active {
            active.pump.abort();
            active.control.close().await;
        }
        // Settle streaming turns while the session is still live.
        self.reset_tracking_once(operation);

        tokio::time::sleep(Duration::from_millis(self.config.drain_ms)).await;

        let finalize = self.hooks.read().finalize_session.clone();
        if let Some(finalize) = finalize {
            finalize().await;
        }

        self.input_paused.store(false, Ordering::Release);
        self.set_status(ConnectionStatus::Idle, operation);
        self.stopping.store(false, Ordering::Release);
    }

    /// Mute the microphone without leaving `connected`.
    pub fn pause(&self) -> Result<(), CoreError> {
        self.set_input_paused(true, "pause")
    }

    pub fn resume(&self) -> Result<(), CoreError> {
        self.set_input_paused(false, "resume")
    }

    fn set_input_paused(&self, paused: bool, action: &'static str) -> Result<(), CoreError> {
        let status = self.status.load();
        if !status.can_pause() {
            return Err(CoreError::InvalidTransition {
                from: status,
                action,
            });
        }

        let previous = self.input_paused.swap(paused, Ordering::AcqRel);
        if let Some(active) = self.link.lock().as_ref() {
            active.control.set_input_enabled(!paused);
        }
        if previous != paused {
            info!(paused, "Microphone input toggled");
            let _ = self.events.send(CoreEvent::InputPaused { paused });
        }
        Ok(())
    }

    /// Send a message over the data channel.
    pub fn send(&self, message: OutboundMessage) -> Result<(), CoreError> {
        let status = self.status.load();
        let control = match self.link.lock().as_ref() {
            Some(active) if status == ConnectionStatus::Connected => Arc::clone(&active.control),
            _ => {
                return Err(CoreError::InvalidTransition {
                    from: status,
                    action: "send",
                })
            }
        };
        control.send(message)
    }

    /// Forward a typed message to the counterpart.
    pub fn send_text(&self, text: &str) -> Result<(), CoreError> {
        self.send(OutboundMessage::UserText {
            text: text.to_string(),
        })
    }

    /// Connect shortly after a session becomes ready, unless something else
    /// starts or stops the connection first.
    pub async fn autostart(self: &Arc<Self>, session_id: &str) -> Result<u64, CoreError> {
        let mut baseline = self.stamp.issued();
        tokio::time::sleep(Duration::from_millis(self.config.autostart_delay_ms)).await;

        let attempts = self.config.autostart_attempts.max(1);
        let mut last = CoreError::Superseded;
        for attempt in 1..=attempts {
            if self.stamp.issued() != baseline || !self.status.load().can_start() {
                debug!(attempt, "Autostart skipped, connection already handled");
                return Err(CoreError::Superseded);
            }
            match self.start(session_id).await {
                Ok(operation) => return Ok(operation),
                Err(e) if e.is_superseded() || e == CoreError::NoCaptureDevice => return Err(e),
                Err(e) => {
                    warn!(attempt, error = %e, "Autostart attempt failed");
                    baseline = self.stamp.issued();
                    last = e;
                }
            }
        }
        Err(last)
    }

    fn set_status(&self, to: ConnectionStatus, operation: u64) {
        let from = self.status.swap(to);
        if from == to {
            return;
        }
        debug!(operation, from = ?from, to = ?to, "Connection status changed");
        let _ = self.events.send(CoreEvent::StatusChanged {
            from,
            to,
            operation,
        });

        if from.is_active() && !to.is_active() {
            self.reset_tracking_once(operation);
        }
    }

    fn reset_tracking_once(&self, operation: u64) {
        if self.last_reset_operation.swap(operation, Ordering::AcqRel) == operation {
            return;
        }
        let hook = self.hooks.read().reset_tracking.clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn superseded(&self, operation: u64) -> CoreError {
        debug!(operation, live = self.stamp.current(), "Dropping superseded connect");
        CoreError::Superseded
    }

    fn diagnostic(&self, source: DiagnosticSource, level: DiagnosticLevel, message: String) {
        let _ = self
            .events
            .send(CoreEvent::diagnostic(source, level, message));
    }
}
