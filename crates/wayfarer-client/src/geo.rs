//! Live geolocation client.
//!
//! A background task owns the [`GeoSnapshot`] and serializes everything that can
//! change it: socket state, peer messages, local position fixes and positioning
//! errors. Subscribers always receive the complete snapshot, never a delta.
//!
//! While connected, the local position source is watched and the latest fix is
//! sent to the server on a fixed broadcast interval (the first fix after
//! connecting is sent immediately). Losing the connection stops both; `disconnect`
//! additionally resets the snapshot to its default.

use crate::config::{GeoConfig, ReconnectPolicy};
use crate::listeners::{Handler, Listeners, Subscription};
use crate::position::{PositionError, PositionSource};
use crate::socket::{GeoProtocol, ReconnectingSocket, SocketEvent, SocketEventKind};
use crate::transport::Connector;
use parking_lot::ReentrantMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use wayfarer_core::{
    ConnectionState, Coordinates, Credential, FriendLocation, GeoInbound, GeoOutbound, UserId,
};

/// Everything a map view needs to render the live layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoSnapshot {
    pub friends: Vec<FriendLocation>,
    pub my_position: Option<Coordinates>,
    pub status: ConnectionState,
    /// Last positioning failure; cleared by a fresh fix or a new connection.
    pub error: Option<PositionError>,
}

impl GeoSnapshot {
    pub fn friend(&self, user_id: &UserId) -> Option<&FriendLocation> {
        self.friends.iter().find(|f| &f.user_id == user_id)
    }

    /// Replace the entry with the same user id, or append.
    fn upsert(&mut self, friend: FriendLocation) -> bool {
        match self.friends.iter_mut().find(|f| f.user_id == friend.user_id) {
            Some(existing) if *existing == friend => false,
            Some(existing) => {
                *existing = friend;
                true
            }
            None => {
                self.friends.push(friend);
                true
            }
        }
    }

    fn remove(&mut self, user_id: &UserId) -> bool {
        let before = self.friends.len();
        self.friends.retain(|f| &f.user_id != user_id);
        self.friends.len() != before
    }
}

enum GeoInput {
    State(ConnectionState),
    CredentialChanged,
    Message(GeoInbound),
    Fix(Coordinates),
    FixError(PositionError),
}

fn forward(tx: &mpsc::WeakUnboundedSender<GeoInput>, input: GeoInput) {
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(input);
    }
}

/// Held while a snapshot is published or handed to a new subscriber, so each
/// subscriber sees snapshots in publication order. Reentrant: handlers may
/// subscribe from inside a delivery.
type DeliveryLock = Arc<ReentrantMutex<()>>;

struct GeoShared {
    // the only strong sender: dropping the last client handle ends the task
    _input_tx: mpsc::UnboundedSender<GeoInput>,
    snapshot_rx: watch::Receiver<GeoSnapshot>,
    listeners: Listeners<(), GeoSnapshot>,
    delivery: DeliveryLock,
}

/// Handle to the geo channel. Clones share the connection and the snapshot.
#[derive(Clone)]
pub struct GeoClient {
    socket: ReconnectingSocket<GeoProtocol>,
    shared: Arc<GeoShared>,
}

impl std::fmt::Debug for GeoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeoClient")
            .field("snapshot", &*self.shared.snapshot_rx.borrow())
            .finish()
    }
}

impl GeoClient {
    /// Must be called from within a tokio runtime.
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        source: Arc<dyn PositionSource>,
        config: GeoConfig,
    ) -> Self {
        let socket = ReconnectingSocket::<GeoProtocol>::new(connector, policy);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(GeoSnapshot::default());
        let listeners = Listeners::new();
        let delivery = DeliveryLock::default();

        let weak = input_tx.downgrade();
        socket
            .on(SocketEventKind::StateChanged, move |event| {
                if let SocketEvent::StateChanged(state) = event {
                    forward(&weak, GeoInput::State(*state));
                }
            })
            .detach();
        let weak = input_tx.downgrade();
        socket
            .on(SocketEventKind::CredentialChanged, move |_| {
                forward(&weak, GeoInput::CredentialChanged)
            })
            .detach();
        let weak = input_tx.downgrade();
        socket
            .on(SocketEventKind::Message, move |event| {
                if let SocketEvent::Message(msg) = event {
                    forward(&weak, GeoInput::Message(msg.clone()));
                }
            })
            .detach();

        let task = GeoTask {
            socket: socket.clone(),
            source,
            input_weak: input_tx.downgrade(),
            input_rx,
            snapshot: GeoSnapshot::default(),
            snapshot_tx,
            listeners: listeners.clone(),
            delivery: delivery.clone(),
            tracking: None,
            broadcast: None,
            period: config.broadcast_interval(),
            announced: false,
        };
        tokio::spawn(task.run());

        Self {
            socket,
            shared: Arc::new(GeoShared {
                _input_tx: input_tx,
                snapshot_rx,
                listeners,
                delivery,
            }),
        }
    }

    /// Open the geo channel; `None` connects anonymously.
    pub fn connect(&self, credential: Option<Credential>) {
        self.socket.connect(credential);
    }

    /// Stop positioning, close the channel and reset the snapshot.
    pub fn disconnect(&self) {
        self.socket.disconnect();
    }

    pub fn state(&self) -> ConnectionState {
        self.socket.state()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        self.socket.wait_for_state(target).await
    }

    pub fn snapshot(&self) -> GeoSnapshot {
        self.shared.snapshot_rx.borrow().clone()
    }

    /// Wait for a snapshot satisfying `predicate`.
    pub async fn wait_for(&self, predicate: impl FnMut(&GeoSnapshot) -> bool) -> Option<GeoSnapshot> {
        let mut rx = self.shared.snapshot_rx.clone();
        rx.wait_for(predicate).await.ok().map(|s| s.clone())
    }

    /// Subscribe to snapshot changes. The handler is called once right away with
    /// the current snapshot.
    pub fn on_snapshot(&self, handler: impl Fn(&GeoSnapshot) + Send + Sync + 'static) -> Subscription {
        self.on_snapshot_handler(Arc::new(handler))
    }

    pub fn on_snapshot_handler(&self, handler: Handler<GeoSnapshot>) -> Subscription {
        let _delivering = self.shared.delivery.lock();
        let sub = self.shared.listeners.add((), Arc::clone(&handler));
        let current = self.snapshot();
        handler(&current);
        sub
    }

    pub fn off_snapshot(&self, handler: &Handler<GeoSnapshot>) -> usize {
        self.shared.listeners.remove((), handler)
    }

    /// Subscribe to raw socket lifecycle events, e.g. for a connection indicator.
    pub fn on_socket(
        &self,
        kind: SocketEventKind,
        handler: impl Fn(&SocketEvent<GeoInbound>) + Send + Sync + 'static,
    ) -> Subscription {
        self.socket.on(kind, handler)
    }
}

struct GeoTask {
    socket: ReconnectingSocket<GeoProtocol>,
    source: Arc<dyn PositionSource>,
    input_weak: mpsc::WeakUnboundedSender<GeoInput>,
    input_rx: mpsc::UnboundedReceiver<GeoInput>,
    snapshot: GeoSnapshot,
    snapshot_tx: watch::Sender<GeoSnapshot>,
    listeners: Listeners<(), GeoSnapshot>,
    delivery: DeliveryLock,
    tracking: Option<Subscription>,
    broadcast: Option<Interval>,
    period: Duration,
    announced: bool,
}

impl GeoTask {
    async fn run(mut self) {
        loop {
            tokio::select! {
                input = self.input_rx.recv() => match input {
                    Some(input) => self.handle(input),
                    None => break,
                },
                _ = next_tick(&mut self.broadcast) => self.broadcast_position(),
            }
        }
        self.stop_tracking();
        tracing::debug!("geo task exited");
    }

    fn handle(&mut self, input: GeoInput) {
        match input {
            GeoInput::State(state) => self.on_state(state),
            GeoInput::CredentialChanged => self.on_credential_changed(),
            GeoInput::Message(msg) => self.on_message(msg),
            GeoInput::Fix(position) => self.on_fix(position),
            GeoInput::FixError(error) => self.on_fix_error(error),
        }
    }

    fn on_state(&mut self, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                self.snapshot.status = state;
                self.snapshot.error = None;
                self.start_tracking();
                self.publish();
                if let Some(position) = self.snapshot.my_position {
                    self.send(position);
                    self.announced = true;
                }
            }
            ConnectionState::Connecting | ConnectionState::Error => {
                self.stop_tracking();
                if self.snapshot.status != state {
                    self.snapshot.status = state;
                    self.publish();
                }
            }
            ConnectionState::Idle => {
                self.stop_tracking();
                if self.snapshot != GeoSnapshot::default() {
                    self.snapshot = GeoSnapshot::default();
                    self.publish();
                }
            }
        }
    }

    /// Friends and errors belong to the previous user's session.
    fn on_credential_changed(&mut self) {
        if self.snapshot.friends.is_empty() && self.snapshot.error.is_none() {
            return;
        }
        self.snapshot.friends.clear();
        self.snapshot.error = None;
        self.publish();
    }

    fn on_message(&mut self, msg: GeoInbound) {
        let changed = match msg {
            GeoInbound::FriendLocation(friend) => self.snapshot.upsert(friend),
            GeoInbound::FriendOffline { user_id } => self.snapshot.remove(&user_id),
            GeoInbound::FriendsNearby(list) => {
                let mut next = GeoSnapshot::default();
                for friend in list {
                    next.upsert(friend);
                }
                let changed = next.friends != self.snapshot.friends;
                self.snapshot.friends = next.friends;
                changed
            }
        };
        if changed {
            self.publish();
        }
    }

    fn on_fix(&mut self, position: Coordinates) {
        if self.tracking.is_none() {
            return;
        }
        if !position.is_valid() {
            tracing::warn!("ignoring invalid position fix {:?}", position);
            return;
        }
        self.snapshot.my_position = Some(position);
        self.snapshot.error = None;
        self.publish();
        if !self.announced {
            self.send(position);
            self.announced = true;
        }
    }

    fn on_fix_error(&mut self, error: PositionError) {
        if self.tracking.is_none() {
            return;
        }
        tracing::warn!("positioning failed: {}", error);
        if self.snapshot.error.as_ref() != Some(&error) {
            self.snapshot.error = Some(error);
            self.publish();
        }
    }

    fn start_tracking(&mut self) {
        if self.tracking.is_none() {
            let on_fix = self.input_weak.clone();
            let on_error = self.input_weak.clone();
            self.tracking = Some(self.source.watch(
                Box::new(move |position| forward(&on_fix, GeoInput::Fix(position))),
                Box::new(move |error| forward(&on_error, GeoInput::FixError(error))),
            ));
        }
        let mut interval = tokio::time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.broadcast = Some(interval);
        self.announced = false;
    }

    fn stop_tracking(&mut self) {
        // dropping the subscription stops the source
        self.tracking = None;
        self.broadcast = None;
    }

    fn broadcast_position(&mut self) {
        if let Some(position) = self.snapshot.my_position {
            self.send(position);
        }
    }

    fn send(&self, position: Coordinates) {
        if let Err(e) = self.socket.send(GeoOutbound::LocationUpdate(position)) {
            tracing::debug!("position not sent: {}", e);
        }
    }

    fn publish(&self) {
        let _delivering = self.delivery.lock();
        self.snapshot_tx.send_replace(self.snapshot.clone());
        self.listeners.emit((), &self.snapshot);
    }
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::ManualPositionSource;
    use crate::testing::{MockConnector, credential, settle};
    use parking_lot::Mutex;

    struct Harness {
        client: GeoClient,
        connector: Arc<MockConnector>,
        source: ManualPositionSource,
    }

    fn harness() -> Harness {
        let connector = MockConnector::new();
        let source = ManualPositionSource::new();
        let client = GeoClient::new(
            connector.clone(),
            ReconnectPolicy::fixed(Duration::from_secs(1)),
            Arc::new(source.clone()),
            GeoConfig {
                broadcast_interval_ms: 5_000,
            },
        );
        Harness {
            client,
            connector,
            source,
        }
    }

    impl Harness {
        async fn connected(&self) {
            self.client.connect(None);
            assert!(self.client.wait_for_state(ConnectionState::Connected).await);
            settle().await;
        }
    }

    fn friend_frame(user: &str, lat: f64, lng: f64) -> String {
        format!(
            r#"{{"event":"friend:location","data":{{"userId":"{user}","username":"{user}","lat":{lat},"lng":{lng}}}}}"#
        )
    }

    fn record(client: &GeoClient) -> (Arc<Mutex<Vec<GeoSnapshot>>>, Subscription) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        let sub = client.on_snapshot(move |s| sink.lock().push(s.clone()));
        (log, sub)
    }

    fn positions(friends: &[FriendLocation]) -> Vec<(&str, f64, f64)> {
        friends
            .iter()
            .map(|f| (f.user_id.as_str(), f.lat, f.lng))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_sees_upserted_friends() {
        let h = harness();
        h.connected().await;
        let peer = h.connector.peer(0);
        peer.push(&friend_frame("u1", 1.0, 1.0));
        peer.push(&friend_frame("u1", 2.0, 2.0));
        peer.push(&friend_frame("u2", 3.0, 3.0));
        settle().await;

        let (log, _sub) = record(&h.client);
        let first = log.lock()[0].clone();

        assert_eq!(
            positions(&first.friends),
            vec![("u1", 2.0, 2.0), ("u2", 3.0, 3.0)]
        );
        assert_eq!(first.status, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_peer_is_removed() {
        let h = harness();
        h.connected().await;
        let peer = h.connector.peer(0);
        peer.push(&friend_frame("u1", 1.0, 1.0));
        peer.push(&friend_frame("u2", 2.0, 2.0));
        peer.push(r#"{"event":"friend:offline","data":{"userId":"u1"}}"#);
        settle().await;

        assert_eq!(positions(&h.client.snapshot().friends), vec![("u2", 2.0, 2.0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn nearby_list_replaces_friends() {
        let h = harness();
        h.connected().await;
        let peer = h.connector.peer(0);
        peer.push(&friend_frame("old", 0.0, 0.0));
        peer.push(
            r#"{"event":"friends:nearby","data":[
                {"userId":"a","username":"a","lat":1.0,"lng":1.0},
                {"userId":"b","username":"b","lat":2.0,"lng":2.0}]}"#,
        );
        settle().await;

        assert_eq!(
            positions(&h.client.snapshot().friends),
            vec![("a", 1.0, 1.0), ("b", 2.0, 2.0)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn every_change_delivers_a_full_snapshot() {
        let h = harness();
        let (log, _sub) = record(&h.client);
        h.connected().await;
        h.connector.peer(0).push(&friend_frame("u1", 1.0, 1.0));
        settle().await;
        h.source.push(Coordinates::new(5.0, 5.0));
        settle().await;

        let log = log.lock();
        let last = log.last().unwrap();
        assert_eq!(last.friends.len(), 1);
        assert_eq!(last.my_position, Some(Coordinates::new(5.0, 5.0)));
        assert_eq!(last.status, ConnectionState::Connected);
        // initial, connecting, connected, friend, fix
        assert_eq!(log.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fixes_are_sent_immediately_then_on_interval() {
        let h = harness();
        h.connected().await;
        h.source.push(Coordinates::new(10.0, 20.0));
        settle().await;
        assert_eq!(h.connector.peer(0).sent().len(), 1);

        h.source.push(Coordinates::new(11.0, 21.0));
        settle().await;
        assert_eq!(h.connector.peer(0).sent().len(), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        let sent = h.connector.peer(0).sent();
        assert_eq!(sent.len(), 2);
        let last: GeoOutbound = serde_json::from_str(&sent[1]).unwrap();
        assert_eq!(last, GeoOutbound::LocationUpdate(Coordinates::new(11.0, 21.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn positioning_error_is_sticky_and_keeps_last_position() {
        let h = harness();
        h.connected().await;
        h.source.push(Coordinates::new(1.0, 2.0));
        settle().await;
        h.source.fail(PositionError::PermissionDenied);
        settle().await;

        let snapshot = h.client.snapshot();
        assert_eq!(snapshot.error, Some(PositionError::PermissionDenied));
        assert_eq!(snapshot.my_position, Some(Coordinates::new(1.0, 2.0)));

        h.connector.peer(0).push(&friend_frame("u1", 0.0, 0.0));
        settle().await;
        assert_eq!(h.client.snapshot().error, Some(PositionError::PermissionDenied));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_resets_once_and_stops_source() {
        let h = harness();
        h.connected().await;
        h.source.push(Coordinates::new(1.0, 2.0));
        h.connector.peer(0).push(&friend_frame("u1", 1.0, 1.0));
        settle().await;
        assert_eq!(h.source.watchers(), 1);

        let (log, _sub) = record(&h.client);
        h.client.disconnect();
        settle().await;
        h.client.disconnect();
        settle().await;

        let log = log.lock();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1], GeoSnapshot::default());
        assert_eq!(h.source.watchers(), 0);
        assert_eq!(h.client.snapshot(), GeoSnapshot::default());
    }

    #[tokio::test(start_paused = true)]
    async fn fixes_after_disconnect_are_ignored() {
        let h = harness();
        h.connected().await;
        h.client.disconnect();
        settle().await;

        h.source.push(Coordinates::new(1.0, 1.0));
        settle().await;

        assert_eq!(h.client.snapshot().my_position, None);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_loss_pauses_tracking_until_reconnect() {
        let h = harness();
        h.connected().await;
        h.source.fail(PositionError::Timeout);
        settle().await;

        h.connector.peer(0).hang_up();
        settle().await;
        assert_eq!(h.client.snapshot().status, ConnectionState::Error);
        assert_eq!(h.source.watchers(), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.client.wait_for_state(ConnectionState::Connected).await);
        settle().await;

        let snapshot = h.client.snapshot();
        assert_eq!(snapshot.status, ConnectionState::Connected);
        assert_eq!(snapshot.error, None);
        assert_eq!(h.source.watchers(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_resends_known_position() {
        let h = harness();
        h.connected().await;
        h.source.push(Coordinates::new(4.0, 4.0));
        settle().await;

        h.connector.peer(0).hang_up();
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(h.client.wait_for_state(ConnectionState::Connected).await);
        settle().await;

        assert_eq!(h.connector.peer(1).sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn switching_user_drops_previous_session_state() {
        let h = harness();
        h.client.connect(Some(credential("alice")));
        assert!(h.client.wait_for_state(ConnectionState::Connected).await);
        settle().await;
        h.connector.peer(0).push(&friend_frame("alices-friend", 1.0, 1.0));
        h.source.push(Coordinates::new(3.0, 4.0));
        settle().await;
        h.source.fail(PositionError::PermissionDenied);
        settle().await;
        assert_eq!(h.client.snapshot().friends.len(), 1);

        h.client.connect(Some(credential("bob")));
        settle().await;

        let snapshot = h.client.snapshot();
        assert_eq!(h.connector.peer_count(), 2);
        assert!(h.connector.peer(0).is_closed());
        assert_eq!(snapshot.status, ConnectionState::Connected);
        assert!(snapshot.friends.is_empty());
        assert_eq!(snapshot.error, None);
        assert_eq!(snapshot.my_position, Some(Coordinates::new(3.0, 4.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn same_user_reconnect_keeps_friends() {
        let h = harness();
        h.client.connect(Some(credential("alice")));
        assert!(h.client.wait_for_state(ConnectionState::Connected).await);
        settle().await;
        h.connector.peer(0).push(&friend_frame("u1", 1.0, 1.0));
        settle().await;

        h.client.connect(Some(credential("alice")));
        settle().await;

        assert_eq!(h.connector.peer_count(), 1);
        assert_eq!(positions(&h.client.snapshot().friends), vec![("u1", 1.0, 1.0)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn subscribers_end_on_the_latest_snapshot() {
        let h = harness();
        h.client.connect(None);
        assert!(h.client.wait_for_state(ConnectionState::Connected).await);
        let peer = h.connector.peer(0);

        let updates = std::thread::spawn(move || {
            for i in 0..150 {
                peer.push(&friend_frame("u1", 0.0, f64::from(i)));
                std::thread::yield_now();
            }
        });
        let mut logs = Vec::new();
        for _ in 0..200 {
            logs.push(record(&h.client));
            tokio::task::yield_now().await;
        }
        updates.join().unwrap();

        let last = h
            .client
            .wait_for(|s| s.friend(&UserId::from("u1")).is_some_and(|f| f.lng == 149.0))
            .await
            .unwrap();
        // let the final delivery reach every handler
        tokio::time::sleep(Duration::from_millis(100)).await;

        for (log, _sub) in &logs {
            assert_eq!(log.lock().last(), Some(&last));
        }
    }
}
