use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_util::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep, timeout},
};
use tracing::{debug, error, info, warn};

use super::{
    events::{PoolEvent, RemovalReason},
    reconnect::ReconnectPolicy,
    session::{CreateOptions, HealthReport, PairingConfig, SessionStatus, TenantSession},
};
use crate::credentials::CredentialStore;
use crate::errors::PoolError;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::resilience::{
    BreakerConfig, BreakerRejection, BreakerSnapshot, CircuitBreaker, Decision, GuardError,
    GuardedOp, GuardedStore, PolicyTable, RateLimitBackend, RateLimitConfig, RateLimiter, guard,
};
use crate::shared_types::{
    MessagePayload, PairingKind, PairingMaterial, PhoneNumber, Recipient, SendOptions,
    SendReceipt, SessionState, TenantId,
};
use crate::transport::{
    CloseReason, ConnectionUpdate, OpenConfig, TransportAdapter, TransportConnection,
    TransportEvent, TransportHandle,
};

// -----------------------------------------------------------------------------
// ----- PoolConfig ------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Label shown in the phone's linked-devices list. Also names this
    /// instance's gateway-wide rate budget.
    pub device_name: String,
    pub restore_on_init: bool,
    pub maintenance_interval: Duration,
    pub event_buffer: usize,
    pub reconnect: ReconnectPolicy,
    pub breaker: BreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub gateway_rate_limit: RateLimitConfig,
    pub pairing: PairingConfig,
    pub guards: PolicyTable,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            device_name: "pairgate".to_string(),
            restore_on_init: true,
            maintenance_interval: Duration::from_secs(30),
            event_buffer: 256,
            reconnect: ReconnectPolicy::default(),
            breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::per_recipient(),
            gateway_rate_limit: RateLimitConfig::gateway(),
            pairing: PairingConfig::default(),
            guards: PolicyTable::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool -----------------------------------------------------------

/// Owns every tenant's session. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<Inner>,
}

struct Inner {
    config: PoolConfig,
    adapter: Arc<dyn TransportAdapter>,
    store: GuardedStore,
    breaker: CircuitBreaker,
    recipient_limiter: RateLimiter,
    gateway_limiter: RateLimiter,
    metrics: MetricsCollector,
    events: broadcast::Sender<PoolEvent>,

    sessions: Mutex<HashMap<TenantId, TenantSession>>,
    pending: Mutex<HashMap<TenantId, PendingCreation>>,
    next_generation: AtomicU64,

    shutting_down: AtomicBool,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

type CreationFuture = Shared<BoxFuture<'static, Result<SessionStatus, PoolError>>>;

/// One in-flight creation. `id` doubles as the generation of the session it
/// produces, so the task only ever removes its own entry.
struct PendingCreation {
    id: u64,
    options: CreateOptions,
    origin: Origin,
    future: CreationFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// Explicit create: tear down whatever exists and start clean.
    Caller,
    /// Scheduled reconnect of generation `replaces`: keep that session (and
    /// its attempt count) in place until the new connection is up, and drop
    /// the result if it is gone by then.
    Reconnect { replaces: u64 },
}

enum PairingStep {
    Ready(String),
    Ask(Arc<dyn TransportHandle>),
    Await(watch::Receiver<Option<PairingMaterial>>),
    Create,
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Static ---------------------------------------------------

impl SessionPool {
    pub fn new(
        config: PoolConfig,
        adapter: Arc<dyn TransportAdapter>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self::build(config, adapter, store, None)
    }

    /// Rate windows live in `backend` so several gateway instances share one
    /// budget per recipient.
    pub fn with_rate_limit_backend(
        config: PoolConfig,
        adapter: Arc<dyn TransportAdapter>,
        store: Arc<dyn CredentialStore>,
        backend: Arc<dyn RateLimitBackend>,
    ) -> Self {
        Self::build(config, adapter, store, Some(backend))
    }

    fn build(
        config: PoolConfig,
        adapter: Arc<dyn TransportAdapter>,
        store: Arc<dyn CredentialStore>,
        backend: Option<Arc<dyn RateLimitBackend>>,
    ) -> Self {
        let (recipient_limiter, gateway_limiter) = match backend {
            Some(backend) => (
                RateLimiter::with_backend(config.rate_limit, backend.clone()),
                RateLimiter::with_backend(config.gateway_rate_limit, backend),
            ),
            None => (
                RateLimiter::new(config.rate_limit),
                RateLimiter::new(config.gateway_rate_limit),
            ),
        };
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        Self {
            inner: Arc::new(Inner {
                store: GuardedStore::new(store, config.guards),
                breaker: CircuitBreaker::new(config.breaker),
                recipient_limiter,
                gateway_limiter,
                metrics: MetricsCollector::new(),
                events,
                adapter,
                config,
                sessions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                maintenance: Mutex::new(None),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Public ---------------------------------------------------

impl SessionPool {
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Restores a session for every tenant with stored credentials (when
    /// enabled) and starts periodic maintenance. Returns how many restored.
    pub async fn init(&self) -> Result<usize, PoolError> {
        self.start_maintenance();

        if !self.inner.config.restore_on_init {
            return Ok(0);
        }

        let tenants = self.inner.store.list().await?;
        let mut restored = 0;
        for tenant in &tenants {
            match self.ensure_session(tenant).await {
                Ok(_) => restored += 1,
                Err(err) => err.log("init"),
            }
        }

        info!(restored, stored = tenants.len(), "session pool initialized");
        Ok(restored)
    }

    /// Stops maintenance and every reconnect timer, closes all sessions, and
    /// rejects any further creation.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(task) = self.inner.maintenance.lock().take() {
            task.abort();
        }

        let drained: Vec<(TenantId, TenantSession)> =
            self.inner.sessions.lock().drain().collect();
        let closed = drained.len();
        for (tenant, session) in drained {
            self.finish_removal(&tenant, session, RemovalReason::Shutdown, true)
                .await;
        }

        info!(closed, "session pool shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    /// The live session if one exists (in any state), else the result of the
    /// in-flight creation, else a fresh creation.
    pub async fn get_or_create_session(&self, tenant_id: &str) -> Result<SessionStatus, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        self.ensure_session(&tenant).await
    }

    /// Replaces any existing session, discarding its stored credentials.
    /// Concurrent calls for one tenant share a single creation.
    pub async fn create_session(
        &self,
        tenant_id: &str,
        options: CreateOptions,
    ) -> Result<SessionStatus, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        self.ensure_running(&tenant)?;
        self.creation(&tenant, Some(options), Origin::Caller).await
    }

    /// No-op for an absent tenant.
    pub async fn remove_session(&self, tenant_id: &str) -> Result<(), PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        self.remove_entry(&tenant, None, RemovalReason::Requested, true)
            .await;
        Ok(())
    }

    pub async fn send_message(
        &self,
        tenant_id: &str,
        recipient: &str,
        payload: impl Into<MessagePayload>,
        options: SendOptions,
    ) -> Result<SendReceipt, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        let recipient = Recipient::parse(recipient)?;
        let payload = payload.into();
        validate_payload(&payload)?;

        self.dispatch(&tenant, &recipient, &payload, &options).await
    }

    /// An empty `emoji` removes the reaction.
    pub async fn send_reaction(
        &self,
        tenant_id: &str,
        recipient: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<SendReceipt, PoolError> {
        self.send_message(
            tenant_id,
            recipient,
            MessagePayload::reaction(message_id, emoji),
            SendOptions::default(),
        )
        .await
    }

    pub async fn request_pairing_code(
        &self,
        tenant_id: &str,
        phone_number: &str,
    ) -> Result<String, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        let phone = PhoneNumber::normalize(phone_number)
            .map_err(|e| PoolError::pairing(e.to_string(), false))?;

        let step = {
            let mut sessions = self.inner.sessions.lock();
            match sessions.get_mut(&tenant) {
                Some(session) => {
                    session.expire_pairing();
                    let wants_this_code = session.state == SessionState::Pairing
                        && session.options == CreateOptions::pairing_code(phone.clone());
                    match (&session.pairing, session.connected_handle()) {
                        (Some(material), _) if material.kind == PairingKind::Code => {
                            PairingStep::Ready(material.value.clone())
                        }
                        (_, Some(handle)) => PairingStep::Ask(handle),
                        _ if wants_this_code => PairingStep::Await(session.pairing_tx.subscribe()),
                        _ => PairingStep::Create,
                    }
                }
                None => PairingStep::Create,
            }
        };

        match step {
            PairingStep::Ready(code) => {
                debug!(tenant = %tenant, "returning outstanding pairing code");
                Ok(code)
            }
            PairingStep::Ask(handle) => handle
                .request_pairing_code(&phone)
                .await
                .map_err(|e| PoolError::pairing(e.to_string(), true)),
            PairingStep::Await(rx) => {
                debug!(tenant = %tenant, "waiting on the pairing session already in progress");
                self.wait_for_code(rx).await
            }
            PairingStep::Create => self.pair_with_code(&tenant, phone).await,
        }
    }

    /// Current unexpired pairing material. Expired material is cleared here.
    pub fn get_pairing_material(&self, tenant_id: &str) -> Result<Option<PairingMaterial>, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        let mut sessions = self.inner.sessions.lock();
        Ok(sessions.get_mut(&tenant).and_then(|session| {
            session.expire_pairing();
            session.pairing.clone()
        }))
    }

    pub fn get_session_status(&self, tenant_id: &str) -> Result<SessionStatus, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        Ok(self.status_of(&tenant))
    }

    pub fn get_active_sessions(&self) -> Vec<SessionStatus> {
        let sessions = self.inner.sessions.lock();
        let mut out: Vec<SessionStatus> = sessions
            .iter()
            .map(|(tenant, session)| session.status(tenant))
            .collect();
        out.sort_by(|a, b| a.tenant_id.as_str().cmp(b.tenant_id.as_str()));
        out
    }

    pub fn health_check(&self, tenant_id: &str) -> Result<HealthReport, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;

        if let Some(remaining) = self.inner.breaker.open_remaining(&tenant) {
            let secs = BreakerRejection { remaining }.remaining_secs();
            return Ok(HealthReport::unhealthy(format!("circuit open, retry in {secs}s")));
        }

        let state = self.inner.sessions.lock().get(&tenant).map(|s| s.state);
        Ok(match state {
            None => HealthReport::unhealthy("no session"),
            Some(SessionState::Connected) => HealthReport::healthy(),
            Some(state) => HealthReport::unhealthy(format!("session is {state}")),
        })
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.refresh_gauges();
        self.inner.metrics.snapshot()
    }

    pub fn circuit_breaker(&self, tenant_id: &str) -> Result<BreakerSnapshot, PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        Ok(self.inner.breaker.snapshot(&tenant))
    }

    /// Admin override: close the tenant's circuit immediately.
    pub fn reset_circuit_breaker(&self, tenant_id: &str) -> Result<(), PoolError> {
        let tenant = TenantId::parse(tenant_id)?;
        self.inner.breaker.reset(&tenant);
        info!(tenant = %tenant, "circuit breaker reset");
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Creation -------------------------------------------------

impl SessionPool {
    async fn ensure_session(&self, tenant: &TenantId) -> Result<SessionStatus, PoolError> {
        self.ensure_running(tenant)?;

        let creation = {
            let sessions = self.inner.sessions.lock();
            if let Some(session) = sessions.get(tenant) {
                return Ok(session.status(tenant));
            }
            // Still under the sessions lock: a creation finishing right now
            // cannot slip in between the check and the pending lookup.
            self.creation(tenant, None, Origin::Caller)
        };

        creation.await
    }

    /// Joins the tenant's in-flight creation or starts one. The pending entry
    /// is registered before this returns, and the detached task removes it
    /// when done, whether or not anyone is still waiting.
    ///
    /// `None` options join any caller-started creation (defaults otherwise).
    /// Explicit options only join one with the same options and origin. A
    /// creation that is not joined runs after the in-flight one and replaces
    /// it.
    fn creation(&self, tenant: &TenantId, options: Option<CreateOptions>, origin: Origin) -> CreationFuture {
        let mut pending = self.inner.pending.lock();
        let prior = match pending.get(tenant) {
            Some(existing)
                if match &options {
                    None => existing.origin == Origin::Caller,
                    Some(o) => *o == existing.options && origin == existing.origin,
                } =>
            {
                debug!(tenant = %tenant, "joining in-flight session creation");
                return existing.future.clone();
            }
            Some(existing) => {
                debug!(tenant = %tenant, "queueing behind in-flight session creation");
                Some(existing.future.clone())
            }
            None => None,
        };

        let options = options.unwrap_or_default();
        let id = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let pool = self.clone();
        let key = tenant.clone();
        let task_options = options.clone();

        let task = tokio::spawn(async move {
            if let Some(prior) = prior {
                let _ = prior.await;
            }
            let result = pool.create_now(&key, task_options, origin, id).await;

            let mut pending = pool.inner.pending.lock();
            if pending.get(&key).is_some_and(|p| p.id == id) {
                pending.remove(&key);
            }
            result
        });

        let future = async move {
            task.await.unwrap_or_else(|e| {
                Err(PoolError::connection(format!("session creation aborted: {e}")))
            })
        }
        .boxed()
        .shared();

        pending.insert(
            tenant.clone(),
            PendingCreation {
                id,
                options,
                origin,
                future: future.clone(),
            },
        );
        future
    }

    async fn create_now(
        &self,
        tenant: &TenantId,
        options: CreateOptions,
        origin: Origin,
        generation: u64,
    ) -> Result<SessionStatus, PoolError> {
        let inner = &self.inner;
        self.ensure_running(tenant)?;

        if let Err(rejection) = inner.breaker.check(tenant) {
            debug!(tenant = %tenant, "creation rejected by open circuit");
            return Err(PoolError::CircuitOpen {
                tenant: tenant.to_string(),
                remaining_secs: rejection.remaining_secs(),
            });
        }

        if origin == Origin::Caller {
            self.discard_existing(tenant).await;
        }

        let use_pairing_code = options.use_pairing_code;
        let open_config = OpenConfig {
            use_pairing_code,
            phone_number: options.phone_number.clone(),
            device_name: inner.config.device_name.clone(),
        };

        let opened = guard(&inner.config.guards, GuardedOp::Open, || {
            self.open_transport(tenant, &open_config)
        })
        .await
        .map_err(|e| match e {
            GuardError::Timeout { op, after } => PoolError::connection(format!(
                "transport {op} timed out after {}ms",
                after.as_millis()
            )),
            GuardError::Failed(err) => err,
        });

        let TransportConnection { handle, events } = match opened {
            Ok(connection) => connection,
            Err(err) => {
                self.record_creation_failure(tenant, &err);
                return Err(err);
            }
        };
        inner.breaker.record_success(tenant);

        let inserted = {
            let mut sessions = inner.sessions.lock();
            let superseded = match origin {
                Origin::Reconnect { replaces } => sessions
                    .get(tenant)
                    .is_none_or(|s| s.generation != replaces),
                Origin::Caller => false,
            };

            if inner.shutting_down.load(Ordering::Acquire) {
                Err("pool is shutting down")
            } else if superseded {
                Err("session was removed while reconnecting")
            } else {
                let mut session = TenantSession::new(generation, options, handle.clone());
                let previous = sessions.remove(tenant);
                if let (Origin::Reconnect { .. }, Some(previous)) = (origin, &previous) {
                    session.reconnect_attempts = previous.reconnect_attempts;
                    session.created_at = previous.created_at;
                }
                session.pump = Some(self.spawn_pump(tenant.clone(), generation, events));

                let status = session.status(tenant);
                sessions.insert(tenant.clone(), session);
                Ok((status, previous))
            }
        };

        let (status, previous) = match inserted {
            Ok(inserted) => inserted,
            Err(reason) => {
                debug!(tenant = %tenant, generation, reason, "discarding new connection");
                handle.close().await;
                return Err(PoolError::session(tenant, reason));
            }
        };
        if let Some(previous) = previous {
            close_handle(previous.detach(true)).await;
        }

        info!(tenant = %tenant, generation, use_pairing_code, "session created");
        self.emit(PoolEvent::SessionCreated {
            tenant_id: tenant.clone(),
            use_pairing_code,
        });
        self.refresh_gauges();

        Ok(status)
    }

    async fn open_transport(
        &self,
        tenant: &TenantId,
        open_config: &OpenConfig,
    ) -> Result<TransportConnection, PoolError> {
        let credentials = self.inner.store.load(tenant).await?;
        debug!(tenant = %tenant, restored = credentials.is_some(), "opening transport");
        Ok(self.inner.adapter.open(tenant, credentials, open_config).await?)
    }

    async fn discard_existing(&self, tenant: &TenantId) {
        let Some(stale) = self.take_session(tenant, None) else {
            return;
        };

        info!(tenant = %tenant, state = %stale.state, "replacing existing session");
        close_handle(stale.detach(true)).await;

        if let Err(e) = self.inner.store.delete(tenant).await {
            warn!(tenant = %tenant, "failed to discard stale credentials: {e}");
        }
    }

    fn record_creation_failure(&self, tenant: &TenantId, err: &PoolError) {
        err.log("create_session");
        self.emit(PoolEvent::Error {
            tenant_id: tenant.clone(),
            code: err.code(),
            message: err.to_string(),
        });

        if self.inner.breaker.record_failure(tenant) {
            if let Some(session) = self.inner.sessions.lock().get_mut(tenant) {
                session.state = SessionState::CircuitOpen;
            }
            self.emit(PoolEvent::CircuitOpened {
                tenant_id: tenant.clone(),
                cooldown_secs: self.inner.breaker.config().cooldown.as_secs(),
            });
        }
    }

    async fn pair_with_code(&self, tenant: &TenantId, phone: PhoneNumber) -> Result<String, PoolError> {
        let options = CreateOptions::pairing_code(phone);
        let created = match self.ensure_running(tenant) {
            Ok(()) => self.creation(tenant, Some(options), Origin::Caller).await,
            Err(err) => Err(err),
        };
        if let Err(err) = created {
            return Err(PoolError::pairing(
                format!("could not start pairing session: {err}"),
                err.retryable(),
            ));
        }

        let rx = self
            .inner
            .sessions
            .lock()
            .get(tenant)
            .map(|session| session.pairing_tx.subscribe())
            .ok_or_else(code_lost)?;

        self.wait_for_code(rx).await
    }

    /// Bounded by the configured code wait.
    async fn wait_for_code(
        &self,
        mut rx: watch::Receiver<Option<PairingMaterial>>,
    ) -> Result<String, PoolError> {
        let wait = self.inner.config.pairing.code_wait;
        let is_code = |m: &Option<PairingMaterial>| {
            m.as_ref().is_some_and(|m| m.kind == PairingKind::Code)
        };

        let code = match timeout(wait, rx.wait_for(is_code)).await {
            Ok(Ok(material)) => material.as_ref().map(|m| m.value.clone()),
            Ok(Err(_)) => None,
            Err(_) => {
                return Err(PoolError::pairing(
                    format!("no pairing code within {}s", wait.as_secs()),
                    true,
                ));
            }
        };

        code.ok_or_else(code_lost)
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Transport events -----------------------------------------

impl SessionPool {
    fn spawn_pump(
        &self,
        tenant: TenantId,
        generation: u64,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            loop {
                let event = events.recv().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let pool = SessionPool { inner };

                let current = match event {
                    Some(event) => pool.on_transport_event(&tenant, generation, event).await,
                    None => {
                        let reason = CloseReason::retryable("event stream ended");
                        pool.on_close(&tenant, generation, reason).await;
                        false
                    }
                };
                if !current {
                    break;
                }
            }
            debug!(tenant = %tenant, generation, "event pump stopped");
        })
    }

    /// Returns `false` once this generation is no longer the tenant's session.
    async fn on_transport_event(&self, tenant: &TenantId, generation: u64, event: TransportEvent) -> bool {
        match event {
            TransportEvent::PairingMaterial { kind, value } => {
                let ttl = self.inner.config.pairing.ttl(kind);
                let material = PairingMaterial::new(kind, value, ttl);
                let current = self
                    .with_session(tenant, generation, |s| {
                        s.set_pairing(Some(material));
                        s.touch();
                    })
                    .is_some();

                if current {
                    info!(tenant = %tenant, %kind, ttl_secs = ttl.as_secs(), "pairing material issued");
                    self.emit(PoolEvent::PairingMaterial {
                        tenant_id: tenant.clone(),
                        kind,
                    });
                }
                current
            }

            TransportEvent::StateChange(ConnectionUpdate::Connecting) => {
                debug!(tenant = %tenant, "transport connecting");
                self.with_session(tenant, generation, TenantSession::touch)
                    .is_some()
            }

            TransportEvent::StateChange(ConnectionUpdate::Open) => {
                let current = self
                    .with_session(tenant, generation, |s| {
                        s.state = SessionState::Connected;
                        s.reconnect_attempts = 0;
                        s.set_pairing(None);
                        s.touch();
                    })
                    .is_some();

                if current {
                    info!(tenant = %tenant, "session connected");
                    self.emit(PoolEvent::Connected {
                        tenant_id: tenant.clone(),
                    });
                    self.refresh_gauges();
                }
                current
            }

            TransportEvent::StateChange(ConnectionUpdate::Close(reason)) => {
                self.on_close(tenant, generation, reason).await;
                false
            }

            TransportEvent::Message(message) => {
                let current = self
                    .with_session(tenant, generation, TenantSession::touch)
                    .is_some();
                if current {
                    debug!(tenant = %tenant, id = %message.id, "message received");
                    self.emit(PoolEvent::MessageReceived {
                        tenant_id: tenant.clone(),
                        message,
                    });
                }
                current
            }

            TransportEvent::CredentialsUpdated(credentials) => {
                if self
                    .with_session(tenant, generation, TenantSession::touch)
                    .is_none()
                {
                    return false;
                }

                match self.inner.store.save(tenant, &credentials).await {
                    Ok(()) => debug!(tenant = %tenant, bytes = credentials.len(), "credentials persisted"),
                    Err(e) => {
                        let err = PoolError::from(e);
                        err.log("save_credentials");
                        self.emit(PoolEvent::Error {
                            tenant_id: tenant.clone(),
                            code: err.code(),
                            message: err.to_string(),
                        });
                    }
                }
                true
            }

            TransportEvent::Error(message) => {
                let current = self
                    .with_session(tenant, generation, TenantSession::touch)
                    .is_some();
                if current {
                    warn!(tenant = %tenant, "transport error: {message}");
                    let err = PoolError::connection(message);
                    self.emit(PoolEvent::Error {
                        tenant_id: tenant.clone(),
                        code: err.code(),
                        message: err.to_string(),
                    });
                }
                current
            }
        }
    }

    /// Runs on the pump task, so the pump is never aborted from here.
    async fn on_close(&self, tenant: &TenantId, generation: u64, reason: CloseReason) {
        if reason.logged_out {
            let current = self
                .with_session(tenant, generation, |s| s.state = SessionState::LoggedOut)
                .is_some();
            if !current {
                return;
            }

            warn!(tenant = %tenant, reason = %reason.message, "logged out, discarding credentials");
            self.emit(PoolEvent::Disconnected {
                tenant_id: tenant.clone(),
                reason: reason.message,
                logged_out: true,
            });
            self.emit(PoolEvent::LoggedOut {
                tenant_id: tenant.clone(),
            });

            if let Err(e) = self.inner.store.delete(tenant).await {
                warn!(tenant = %tenant, "failed to delete revoked credentials: {e}");
            }
            self.remove_entry(tenant, Some(generation), RemovalReason::LoggedOut, false)
                .await;
            return;
        }

        let handle = self.with_session(tenant, generation, |s| {
            s.state = SessionState::Reconnecting;
            s.set_pairing(None);
            s.handle.take()
        });
        let Some(handle) = handle else {
            return;
        };
        close_handle(handle).await;

        warn!(tenant = %tenant, reason = %reason.message, "connection closed");
        self.emit(PoolEvent::Disconnected {
            tenant_id: tenant.clone(),
            reason: reason.message,
            logged_out: false,
        });
        self.refresh_gauges();

        self.schedule_reconnect(tenant, generation).await;
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Reconnect ------------------------------------------------

impl SessionPool {
    async fn schedule_reconnect(&self, tenant: &TenantId, generation: u64) {
        let policy = self.inner.config.reconnect;

        let scheduled = self.with_session(tenant, generation, |s| {
            if policy.exhausted(s.reconnect_attempts) {
                return Err(s.reconnect_attempts);
            }

            s.reconnect_attempts += 1;
            let delay = policy.delay_for(s.reconnect_attempts);
            let timer = self.spawn_reconnect_timer(tenant.clone(), generation, delay);
            if let Some(previous) = s.reconnect_timer.replace(timer) {
                previous.abort();
            }
            Ok((s.reconnect_attempts, delay))
        });

        match scheduled {
            None => {}
            Some(Ok((attempt, delay))) => {
                info!(tenant = %tenant, attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                self.emit(PoolEvent::ReconnectScheduled {
                    tenant_id: tenant.clone(),
                    attempt,
                    delay_ms: delay.as_millis() as u64,
                });
            }
            Some(Err(attempts)) => self.give_up(tenant, generation, attempts).await,
        }
    }

    fn spawn_reconnect_timer(&self, tenant: TenantId, generation: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                SessionPool { inner }.run_reconnect(tenant, generation).await;
            }
        })
    }

    async fn run_reconnect(&self, tenant: TenantId, generation: u64) {
        // Fired: the timer is no longer ours to cancel.
        let Some(options) = self.with_session(&tenant, generation, |s| {
            s.reconnect_timer = None;
            s.options.clone()
        }) else {
            return;
        };

        debug!(tenant = %tenant, "reconnecting");
        let origin = Origin::Reconnect {
            replaces: generation,
        };
        let Err(err) = self.creation(&tenant, Some(options), origin).await else {
            return;
        };
        err.log("reconnect");

        let policy = self.inner.config.reconnect;
        let exhausted = self.with_session(&tenant, generation, |s| policy.exhausted(s.reconnect_attempts));
        let circuit_open = matches!(err, PoolError::CircuitOpen { .. })
            || self.inner.breaker.open_remaining(&tenant).is_some();

        match exhausted {
            None => {}
            Some(true) => {
                let attempts = policy.max_attempts;
                self.give_up(&tenant, generation, attempts).await;
            }
            Some(false) if circuit_open => {
                self.remove_entry(&tenant, Some(generation), RemovalReason::CircuitOpen, false)
                    .await;
            }
            Some(false) => self.schedule_reconnect(&tenant, generation).await,
        }
    }

    /// Terminal. `take_session` succeeds once, so the event fires once.
    async fn give_up(&self, tenant: &TenantId, generation: u64, attempts: u32) {
        let Some(session) = self.take_session(tenant, Some(generation)) else {
            return;
        };

        error!(tenant = %tenant, attempts, "reconnect attempts exhausted");
        self.emit(PoolEvent::ReconnectFailed {
            tenant_id: tenant.clone(),
            attempts,
        });
        self.finish_removal(tenant, session, RemovalReason::ReconnectFailed, false)
            .await;
    }
}

// -----------------------------------------------------------------------------
// ----- SessionPool: Private --------------------------------------------------

impl SessionPool {
    fn ensure_running(&self, tenant: &TenantId) -> Result<(), PoolError> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return Err(PoolError::session(tenant, "pool is shutting down"));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        tenant: &TenantId,
        recipient: &Recipient,
        payload: &MessagePayload,
        options: &SendOptions,
    ) -> Result<SendReceipt, PoolError> {
        self.admit(tenant, recipient).await?;
        self.ensure_session(tenant).await?;

        let handle = self
            .inner
            .sessions
            .lock()
            .get(tenant)
            .and_then(TenantSession::connected_handle)
            .ok_or_else(|| PoolError::session(tenant, "no active session"))?;

        let sent = guard(&self.inner.config.guards, GuardedOp::Send, || {
            handle.send(recipient, payload, options)
        })
        .await;

        match sent {
            Ok(message_id) => {
                if let Some(session) = self.inner.sessions.lock().get_mut(tenant) {
                    session.touch();
                }
                debug!(tenant = %tenant, kind = payload.kind(), id = %message_id, "message sent");
                self.emit(PoolEvent::MessageSent {
                    tenant_id: tenant.clone(),
                    message_id: message_id.clone(),
                });
                Ok(SendReceipt { message_id })
            }
            Err(e) => {
                let err = PoolError::connection(e.to_string());
                err.log("send_message");
                self.emit(PoolEvent::Error {
                    tenant_id: tenant.clone(),
                    code: err.code(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Per-recipient window first, then this instance's shared budget. A send
    /// refused by either leaves no trace in the other.
    async fn admit(&self, tenant: &TenantId, recipient: &Recipient) -> Result<(), PoolError> {
        let recipient_key = format!("{tenant}:{recipient}");
        let gateway_key = format!("gateway:{}", self.inner.config.device_name);

        let decision = self.inner.recipient_limiter.check(&recipient_key).await;
        if !decision.allowed {
            return Err(self.rate_limited(tenant, recipient_key, decision));
        }

        let decision = self.inner.gateway_limiter.check(&gateway_key).await;
        if !decision.allowed {
            self.inner.recipient_limiter.release(&recipient_key).await;
            return Err(self.rate_limited(tenant, gateway_key, decision));
        }
        Ok(())
    }

    fn rate_limited(&self, tenant: &TenantId, key: String, decision: Decision) -> PoolError {
        debug!(tenant = %tenant, key = %key, "rate limited");
        self.emit(PoolEvent::RateLimited {
            tenant_id: tenant.clone(),
            key: key.clone(),
        });
        PoolError::RateLimited {
            key,
            reset_after: decision.reset_after,
        }
    }

    fn status_of(&self, tenant: &TenantId) -> SessionStatus {
        if let Some(session) = self.inner.sessions.lock().get(tenant) {
            return session.status(tenant);
        }

        let state = if self.inner.breaker.open_remaining(tenant).is_some() {
            SessionState::CircuitOpen
        } else {
            SessionState::Uninitialized
        };
        SessionStatus::absent(tenant.clone(), state)
    }

    fn with_session<R>(
        &self,
        tenant: &TenantId,
        generation: u64,
        f: impl FnOnce(&mut TenantSession) -> R,
    ) -> Option<R> {
        let mut sessions = self.inner.sessions.lock();
        let session = sessions
            .get_mut(tenant)
            .filter(|s| s.generation == generation)?;
        Some(f(session))
    }

    /// Removes the entry, but only if it is still `generation` when given.
    fn take_session(&self, tenant: &TenantId, generation: Option<u64>) -> Option<TenantSession> {
        let mut sessions = self.inner.sessions.lock();
        match generation {
            Some(generation) if sessions.get(tenant)?.generation != generation => None,
            _ => sessions.remove(tenant),
        }
    }

    async fn remove_entry(
        &self,
        tenant: &TenantId,
        generation: Option<u64>,
        reason: RemovalReason,
        stop_pump: bool,
    ) -> bool {
        let Some(session) = self.take_session(tenant, generation) else {
            return false;
        };
        self.finish_removal(tenant, session, reason, stop_pump).await;
        true
    }

    async fn finish_removal(
        &self,
        tenant: &TenantId,
        session: TenantSession,
        reason: RemovalReason,
        stop_pump: bool,
    ) {
        close_handle(session.detach(stop_pump)).await;

        info!(tenant = %tenant, ?reason, "session removed");
        self.emit(PoolEvent::SessionRemoved {
            tenant_id: tenant.clone(),
            reason,
        });
        self.refresh_gauges();
    }

    fn emit(&self, event: PoolEvent) {
        self.inner.metrics.observe(&event);
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    fn refresh_gauges(&self) {
        let (active, connected) = {
            let sessions = self.inner.sessions.lock();
            let connected = sessions.values().filter(|s| s.state.is_connected()).count();
            (sessions.len(), connected)
        };
        self.inner.metrics.set_session_gauges(active, connected);
    }

    fn start_maintenance(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                SessionPool { inner }.run_maintenance();
            }
        });

        if let Some(previous) = self.inner.maintenance.lock().replace(task) {
            previous.abort();
        }
    }

    fn run_maintenance(&self) {
        let pruned = self.inner.recipient_limiter.prune() + self.inner.gateway_limiter.prune();

        let expired = self
            .inner
            .sessions
            .lock()
            .values_mut()
            .map(TenantSession::expire_pairing)
            .filter(|&cleared| cleared)
            .count();

        self.refresh_gauges();
        debug!(pruned, expired, "maintenance pass");
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

fn code_lost() -> PoolError {
    PoolError::pairing("session closed before a pairing code arrived", true)
}

async fn close_handle(handle: Option<Arc<dyn TransportHandle>>) {
    if let Some(handle) = handle {
        handle.close().await;
    }
}

fn validate_payload(payload: &MessagePayload) -> Result<(), PoolError> {
    match payload {
        MessagePayload::Text { body } if body.trim().is_empty() => {
            Err(PoolError::validation("payload", "text body is empty"))
        }
        MessagePayload::Reaction {
            target_message_id, ..
        } if target_message_id.trim().is_empty() => {
            Err(PoolError::validation("message_id", "reaction target is empty"))
        }
        _ => Ok(()),
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Credentials, MemoryCredentialStore};
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// Adapter whose handshake always fails.
    struct Unreachable {
        opens: AtomicU32,
    }

    #[async_trait]
    impl TransportAdapter for Unreachable {
        async fn open(
            &self,
            _tenant: &TenantId,
            _credentials: Option<Credentials>,
            _config: &OpenConfig,
        ) -> Result<TransportConnection, TransportError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::Handshake("connection refused".into()))
        }
    }

    /// Adapter whose handshake never completes.
    struct Hanging;

    #[async_trait]
    impl TransportAdapter for Hanging {
        async fn open(
            &self,
            _tenant: &TenantId,
            _credentials: Option<Credentials>,
            _config: &OpenConfig,
        ) -> Result<TransportConnection, TransportError> {
            std::future::pending().await
        }
    }

    fn pool_with(adapter: Arc<Unreachable>) -> SessionPool {
        SessionPool::new(
            PoolConfig::default(),
            adapter,
            Arc::new(MemoryCredentialStore::new()),
        )
    }

    fn unreachable() -> Arc<Unreachable> {
        Arc::new(Unreachable {
            opens: AtomicU32::new(0),
        })
    }

    #[tokio::test]
    async fn remove_absent_tenant_is_noop() {
        let pool = pool_with(unreachable());
        pool.remove_session("ghost").await.unwrap();
        pool.remove_session("ghost").await.unwrap();

        let status = pool.get_session_status("ghost").unwrap();
        assert_eq!(status.state, SessionState::Uninitialized);
        assert!(!status.connected);
        assert_eq!(pool.get_metrics().sessions_removed, 0);
    }

    #[tokio::test]
    async fn rejects_malformed_input_before_any_io() {
        let adapter = unreachable();
        let pool = pool_with(adapter.clone());

        let err = pool.get_or_create_session("bad tenant!").await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = pool
            .send_message("t1", "not a recipient!", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = pool
            .send_message("t1", "r1", "   ", SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");

        let err = pool.request_pairing_code("t1", "call-me-maybe").await.unwrap_err();
        assert_eq!(err.code(), "PAIRING_CODE_ERROR");
        assert!(!err.retryable());

        assert_eq!(adapter.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn creation_failure_is_a_connection_error() {
        let adapter = unreachable();
        let pool = pool_with(adapter.clone());
        let mut events = pool.subscribe();

        let err = pool.get_or_create_session("t1").await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.retryable());
        assert_eq!(pool.circuit_breaker("t1").unwrap().failures, 1);

        let event = events.recv().await.unwrap();
        assert!(matches!(event, PoolEvent::Error { code: "CONNECTION_ERROR", .. }));
        assert_eq!(pool.get_metrics().errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_short_circuits_the_adapter() {
        let adapter = unreachable();
        let pool = pool_with(adapter.clone());

        for _ in 0..5 {
            pool.get_or_create_session("t1").await.unwrap_err();
        }
        assert_eq!(adapter.opens.load(Ordering::SeqCst), 5);

        let err = pool.get_or_create_session("t1").await.unwrap_err();
        assert!(matches!(err, PoolError::CircuitOpen { remaining_secs: 300, .. }));
        assert_eq!(adapter.opens.load(Ordering::SeqCst), 5);

        assert_eq!(
            pool.get_session_status("t1").unwrap().state,
            SessionState::CircuitOpen
        );
        let health = pool.health_check("t1").unwrap();
        assert!(!health.healthy);

        pool.reset_circuit_breaker("t1").unwrap();
        assert_eq!(
            pool.get_session_status("t1").unwrap().state,
            SessionState::Uninitialized
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hung_handshake_times_out_and_frees_the_tenant() {
        let pool = SessionPool::new(
            PoolConfig::default(),
            Arc::new(Hanging),
            Arc::new(MemoryCredentialStore::new()),
        );

        let err = timeout(Duration::from_secs(3600), pool.get_or_create_session("t1"))
            .await
            .expect("creation must not hang")
            .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.retryable());
        assert_eq!(pool.circuit_breaker("t1").unwrap().failures, 1);
        assert!(pool.get_active_sessions().is_empty());

        // The failed creation is gone, so a later send starts a fresh one.
        let err = timeout(
            Duration::from_secs(3600),
            pool.send_message("t1", "r1", "hi", SendOptions::default()),
        )
        .await
        .expect("send must not hang")
        .unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert_eq!(pool.circuit_breaker("t1").unwrap().failures, 2);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_sessions() {
        let adapter = unreachable();
        let pool = pool_with(adapter.clone());
        pool.shutdown().await;

        let err = pool.get_or_create_session("t1").await.unwrap_err();
        assert_eq!(err.code(), "SESSION_ERROR");
        assert_eq!(adapter.opens.load(Ordering::SeqCst), 0);

        // idempotent
        pool.shutdown().await;
    }

    #[test]
    fn payload_validation() {
        assert!(validate_payload(&MessagePayload::text("hi")).is_ok());
        assert!(validate_payload(&MessagePayload::reaction("m1", "")).is_ok());
        assert!(validate_payload(&MessagePayload::reaction("", "👍")).is_err());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
