//! Scripted connector and transport for unit tests.

use crate::error::TransportError;
use crate::transport::{Connector, Transport};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use wayfarer_core::{Channel, Credential};

pub(crate) fn credential(token: &str) -> Credential {
    Credential::new(token).unwrap()
}

/// Let spawned tasks run until they block.
pub(crate) async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

/// Server side of one mock connection.
#[derive(Clone)]
pub(crate) struct MockPeer {
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<Result<String, TransportError>>>>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl MockPeer {
    /// Deliver a text frame to the client.
    pub(crate) fn push(&self, frame: &str) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(Ok(frame.to_string()));
        }
    }

    /// Fail the client's next receive.
    pub(crate) fn fail(&self) {
        if let Some(tx) = self.inbound.lock().as_ref() {
            let _ = tx.send(Err(TransportError::Closed));
        }
    }

    /// Close the connection from the server side.
    pub(crate) fn hang_up(&self) {
        self.inbound.lock().take();
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct MockTransport {
    inbound: mpsc::UnboundedReceiver<Result<String, TransportError>>,
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.sent.lock().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Accepts every connection unless told to refuse, recording each attempt.
#[derive(Default)]
pub(crate) struct MockConnector {
    attempts: AtomicUsize,
    refuse: AtomicUsize,
    stall: AtomicBool,
    credentials: Mutex<Vec<Option<Credential>>>,
    peers: Mutex<Vec<MockPeer>>,
}

impl MockConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuse the next `n` connection attempts.
    pub(crate) fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::Release);
    }

    /// Leave every later handshake pending forever.
    pub(crate) fn stall_handshakes(&self) {
        self.stall.store(true, Ordering::Release);
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    pub(crate) fn credentials(&self) -> Vec<Option<Credential>> {
        self.credentials.lock().clone()
    }

    /// Peer of the `index`-th accepted connection.
    pub(crate) fn peer(&self, index: usize) -> MockPeer {
        self.peers.lock()[index].clone()
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        _channel: Channel,
        credential: Option<&Credential>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        self.credentials.lock().push(credential.cloned());

        if self.stall.load(Ordering::Acquire) {
            std::future::pending::<()>().await;
        }

        let refuse = self.refuse.load(Ordering::Acquire);
        if refuse > 0 {
            self.refuse.store(refuse - 1, Ordering::Release);
            return Err(TransportError::Refused("scripted refusal".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.peers.lock().push(MockPeer {
            inbound: Arc::new(Mutex::new(Some(tx))),
            sent: sent.clone(),
            closed: closed.clone(),
        });

        Ok(Box::new(MockTransport {
            inbound: rx,
            sent,
            closed,
        }))
    }
}
