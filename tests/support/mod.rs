#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    time::timeout,
};

use pairgate::credentials::{Credentials, MemoryCredentialStore};
use pairgate::gateway::{PoolConfig, PoolEvent, SessionPool};
use pairgate::shared_types::{MessagePayload, PairingKind, PhoneNumber, Recipient, SendOptions, TenantId};
use pairgate::transport::{
    ConnectionUpdate, OpenConfig, TransportAdapter, TransportConnection, TransportError,
    TransportEvent, TransportHandle,
};

// -----------------------------------------------------------------------------
// ----- MockTransport ---------------------------------------------------------

/// Scriptable stand-in for the network. Every `open` hands back a fresh
/// channel; tests push events into the latest one per tenant with `emit`.
#[derive(Default)]
pub struct MockTransport {
    opens: AtomicU32,
    failing: AtomicBool,
    auto_connect: AtomicBool,
    code_on_open: Mutex<Option<String>>,
    open_delay: Mutex<Option<Duration>>,
    links: Mutex<HashMap<String, mpsc::UnboundedSender<TransportEvent>>>,
    configs: Mutex<HashMap<String, OpenConfig>>,
    credentials: Mutex<HashMap<String, Option<Credentials>>>,
    handles: Mutex<Vec<Arc<MockHandle>>>,
}

impl MockTransport {
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Every following `open` fails its handshake.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every following `open` reports the connection open straight away.
    pub fn set_auto_connect(&self, on: bool) {
        self.auto_connect.store(on, Ordering::SeqCst);
    }

    /// Opens that ask for a pairing code receive this one.
    pub fn set_code_on_open(&self, code: &str) {
        *self.code_on_open.lock() = Some(code.to_string());
    }

    /// Every following `open` takes this long to complete its handshake.
    pub fn set_open_delay(&self, delay: Duration) {
        *self.open_delay.lock() = Some(delay);
    }

    pub fn emit(&self, tenant: &str, event: TransportEvent) -> bool {
        self.links
            .lock()
            .get(tenant)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub fn open_config(&self, tenant: &str) -> Option<OpenConfig> {
        self.configs.lock().get(tenant).cloned()
    }

    pub fn credentials_seen(&self, tenant: &str) -> Option<Option<Credentials>> {
        self.credentials.lock().get(tenant).cloned()
    }

    pub fn messages_sent(&self) -> usize {
        self.handles.lock().iter().map(|h| h.sent.lock().len()).sum()
    }

    pub fn closed_handles(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|h| h.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn open(
        &self,
        tenant: &TenantId,
        credentials: Option<Credentials>,
        config: &OpenConfig,
    ) -> Result<TransportConnection, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let delay = *self.open_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake("scripted failure".into()));
        }

        let key = tenant.to_string();
        self.configs.lock().insert(key.clone(), config.clone());
        self.credentials.lock().insert(key.clone(), credentials);

        let (tx, rx) = mpsc::unbounded_channel();
        if config.use_pairing_code {
            if let Some(code) = self.code_on_open.lock().clone() {
                let _ = tx.send(TransportEvent::PairingMaterial {
                    kind: PairingKind::Code,
                    value: code,
                });
            }
        }
        if self.auto_connect.load(Ordering::SeqCst) {
            let _ = tx.send(TransportEvent::StateChange(ConnectionUpdate::Open));
        }
        self.links.lock().insert(key, tx);

        let handle = Arc::new(MockHandle::default());
        self.handles.lock().push(handle.clone());

        Ok(TransportConnection {
            handle,
            events: rx,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- MockHandle ------------------------------------------------------------

#[derive(Default)]
pub struct MockHandle {
    sent: Mutex<Vec<(Recipient, MessagePayload, SendOptions)>>,
    closed: AtomicBool,
    next_id: AtomicU32,
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn send(
        &self,
        recipient: &Recipient,
        payload: &MessagePayload,
        options: &SendOptions,
    ) -> Result<String, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent
            .lock()
            .push((recipient.clone(), payload.clone(), options.clone()));
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("msg-{n}"))
    }

    async fn request_pairing_code(&self, _phone: &PhoneNumber) -> Result<String, TransportError> {
        Ok("DIRECT-CODE".to_string())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// -----------------------------------------------------------------------------
// ----- Helpers ---------------------------------------------------------------

pub struct Harness {
    pub pool: SessionPool,
    pub transport: Arc<MockTransport>,
    pub store: Arc<MemoryCredentialStore>,
    pub events: broadcast::Receiver<PoolEvent>,
}

pub fn harness(config: PoolConfig) -> Harness {
    let transport = Arc::new(MockTransport::default());
    let store = Arc::new(MemoryCredentialStore::new());
    let pool = SessionPool::new(config, transport.clone(), store.clone());
    let events = pool.subscribe();

    Harness {
        pool,
        transport,
        store,
        events,
    }
}

/// Waits for the first event matching `pred`, skipping the rest.
pub async fn next_event<F>(rx: &mut broadcast::Receiver<PoolEvent>, mut pred: F) -> PoolEvent
where
    F: FnMut(&PoolEvent) -> bool,
{
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("pool event channel closed"),
            }
        }
    };

    timeout(Duration::from_secs(600), wait)
        .await
        .expect("timed out waiting for pool event")
}

/// Creates `tenant` with an auto-connecting transport and waits until it is
/// `CONNECTED`.
pub async fn connect(h: &mut Harness, tenant: &str) {
    h.transport.set_auto_connect(true);
    h.pool.get_or_create_session(tenant).await.unwrap();
    next_event(&mut h.events, |e| {
        matches!(e, PoolEvent::Connected { tenant_id } if tenant_id.as_str() == tenant)
    })
    .await;
    h.transport.set_auto_connect(false);
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
