//! The table facade: one handle per physical table.
//!
//! A [`Table`] owns the full client state for one device: the entity
//! collection, the playback timing tracker, and the connection flag. All
//! state flows in through [`Table::apply_update`], whether the payload
//! came from a command response or from the push channel; both paths are
//! serialized so updates merge in arrival order.
//!
//! A batch of fragments produces at most one listener notification, no
//! matter how many entities it touched. Identical re-delivery of current
//! state produces none. Connection transitions in either direction always
//! count as a change.
//!
//! The handle is cheap to clone and all methods take `&self`; reads are
//! synchronous snapshots of the last known state and never touch the
//! network.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    time::Duration,
};

use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    error::{Error, ErrorKind, Result},
    events::{self, Listener, ListenerId, Listeners},
    model::{Collection, Entity, EntityKind},
    playlist::Playlist,
    protocol::{Fragment, Update},
    socket,
    timing::TrackTime,
    track::Track,
    transport::{Commands, Transport},
};

/// Sentinel the firmware stores when no playlist is active.
const NO_ACTIVE_PLAYLIST: &str = "false";

/// Handle to one table.
///
/// Clones share the same underlying state.
#[derive(Clone)]
pub struct Table {
    inner: Arc<Inner>,
}

struct Inner {
    commands: Box<dyn Commands>,
    host: String,

    state: StdMutex<State>,

    /// Serializes ingestion across the command and push paths.
    ingest: AsyncMutex<()>,

    listeners: StdMutex<Listeners>,

    /// Wakes `wait_for` callers after every notified change.
    updated: Notify,

    shutdown: CancellationToken,
    push_task: StdMutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct State {
    collection: Collection,
    root_id: Option<String>,
    timing: TrackTime,
    connected: bool,
}

impl State {
    fn root(&self) -> Option<&Entity> {
        self.root_id.as_deref().and_then(|id| self.collection.get(id))
    }

    /// Re-evaluates which entities are live against the root's membership
    /// lists. Device records are always kept.
    fn reconcile_membership(&mut self) -> bool {
        let Some(root) = self.root() else {
            return false;
        };

        let mut live: HashSet<String> = root.id_list("playlist_ids").into_iter().collect();
        live.extend(root.id_list("track_ids"));

        self.collection
            .prune(|entity| entity.kind() == EntityKind::Device || live.contains(entity.id()))
    }
}

impl Table {
    /// Connects to the table at `host` and retrieves its initial state.
    ///
    /// Also starts the push channel, which keeps the handle's state
    /// synchronized until [`Table::close`].
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` or `DeadlineExceeded` when the table cannot
    /// be reached.
    pub async fn connect(config: &Config, host: &str) -> Result<Self> {
        let transport = Transport::new(config, host)?;
        let table = Self::with_commands(host, Box::new(transport));
        table.spawn_push_channel();

        table.send("connect", json!({})).await?;
        info!(
            "connected to {} at {host}",
            table.name().unwrap_or_else(|| String::from("unnamed table"))
        );

        Ok(table)
    }

    /// Creates a handle over an arbitrary command channel, without a push
    /// channel. Useful for driving the facade from a custom transport.
    #[must_use]
    pub fn with_commands(host: &str, commands: Box<dyn Commands>) -> Self {
        Self {
            inner: Arc::new(Inner {
                commands,
                host: host.to_owned(),
                state: StdMutex::new(State::default()),
                ingest: AsyncMutex::new(()),
                listeners: StdMutex::new(Listeners::new()),
                updated: Notify::new(),
                shutdown: CancellationToken::new(),
                push_task: StdMutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn spawn_push_channel(&self) {
        let handle = tokio::spawn(socket::run(
            self.inner.host.clone(),
            self.push_sink(),
            self.inner.shutdown.clone(),
        ));
        *self
            .inner
            .push_task
            .lock()
            .expect("push task mutex poisoned") = Some(handle);
    }

    /// The push channel holds the handle weakly so a dropped table shuts
    /// its channel down instead of being kept alive by it.
    fn push_sink(&self) -> socket::Sink {
        let weak = Arc::downgrade(&self.inner);
        Arc::new(move |update| {
            let weak: Weak<Inner> = Weak::clone(&weak);
            Box::pin(async move {
                let Some(inner) = weak.upgrade() else {
                    return false;
                };
                Table { inner }.apply_update(update).await;
                true
            })
        })
    }

    /// Merges one decoded update into local state.
    ///
    /// Fires at most one aggregate notification, after the whole batch is
    /// applied and membership is reconciled.
    pub async fn apply_update(&self, update: Update) {
        let _ingest = self.inner.ingest.lock().await;

        let changed = {
            let mut state = self.inner.state.lock().expect("state mutex poisoned");
            match update {
                Update::Batch(fragments) => {
                    let mut changed = !state.connected;
                    state.connected = true;

                    for fragment in fragments {
                        match fragment {
                            Fragment::Entity(entity) => {
                                let id = entity.id().to_owned();
                                let kind = entity.kind();
                                if state.collection.apply(entity) {
                                    changed = true;
                                }
                                if kind == EntityKind::Device && state.root_id.is_none() {
                                    debug!("designating {id} as the root device record");
                                    state.root_id = Some(id);
                                }
                            }
                            Fragment::Timing(timing) => {
                                // Timing carries its own freshness (the local
                                // receipt stamp), so it always counts as a
                                // change even when the numbers repeat.
                                state.timing.record(timing);
                                changed = true;
                            }
                            Fragment::Unknown(_) => {
                                trace!("skipping unrecognized update fragment");
                            }
                        }
                    }

                    if state.reconcile_membership() {
                        changed = true;
                    }
                    changed
                }
                Update::Disconnect => {
                    debug!("table reported gone");
                    state.connected = false;
                    true
                }
            }
        };

        if changed {
            self.notify_listeners().await;
        }
    }

    async fn notify_listeners(&self) {
        let snapshot = self
            .inner
            .listeners
            .lock()
            .expect("listeners mutex poisoned")
            .snapshot();
        events::notify_all(&snapshot).await;
        self.inner.updated.notify_waiters();
    }

    /// Sends a command and folds any state payload in its reply into the
    /// local snapshot.
    ///
    /// # Errors
    ///
    /// Fails with `FailedPrecondition` once the handle is closed or when
    /// the table rejects the command; transport failures additionally
    /// flip the handle to disconnected.
    pub(crate) async fn send(&self, endpoint: &str, params: Value) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::failed_precondition("table handle is closed"));
        }

        match self.inner.commands.send(endpoint, params).await {
            Ok(resp) => {
                if resp.is_null() {
                    trace!("{endpoint}: empty response");
                } else {
                    match Update::from_value(resp) {
                        Ok(update) => self.apply_update(update).await,
                        Err(e) => debug!("{endpoint}: ignoring non-state response: {e}"),
                    }
                }
                Ok(())
            }
            Err(e) => {
                if matches!(
                    e.kind,
                    ErrorKind::Unavailable
                        | ErrorKind::DeadlineExceeded
                        | ErrorKind::Aborted
                        | ErrorKind::DataLoss
                ) {
                    warn!("{endpoint}: transport failure: {e}");
                    self.apply_update(Update::Disconnect).await;
                }
                Err(e)
            }
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&State) -> T) -> T {
        let state = self.inner.state.lock().expect("state mutex poisoned");
        f(&state)
    }

    fn with_root<T>(&self, f: impl FnOnce(&Entity) -> T) -> Option<T> {
        self.with_state(|state| state.root().map(f))
    }

    /// Replaces one root field locally, echoing a command's effect ahead
    /// of the device's own update.
    pub(crate) fn set_root_field(&self, field: &str, value: Value) {
        let mut state = self.inner.state.lock().expect("state mutex poisoned");
        if let Some(id) = state.root_id.clone() {
            if let Some(root) = state.collection.get_mut(&id) {
                root.set(field, value);
            }
        }
    }

    // Connection and identity.

    /// Whether the last contact with the table succeeded.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.with_state(|state| state.connected)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    #[must_use]
    pub fn id(&self) -> Option<String> {
        self.with_root(|root| root.id().to_owned())
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.root_string("name")
    }

    /// The firmware version, e.g. `"1.3.1"`.
    #[must_use]
    pub fn firmware_version(&self) -> Option<String> {
        // The record also carries a `firmware_version` field, but it is
        // pinned at 1.0 on every table observed; `software_version` is
        // the one that tracks releases.
        self.root_string("software_version")
    }

    #[must_use]
    pub fn mac_address(&self) -> Option<String> {
        self.root_string("mac_address")
    }

    fn root_string(&self, field: &str) -> Option<String> {
        self.with_root(|root| root.str_field(field).map(str::to_owned))
            .flatten()
    }

    // Playback state.

    /// The device state word: `"playing"`, `"paused"`, `"homing"`, ...
    #[must_use]
    pub fn state(&self) -> Option<String> {
        self.root_string("state")
    }

    /// Ball light brightness in `[0, 1]`.
    #[must_use]
    pub fn brightness(&self) -> Option<f64> {
        self.with_root(|root| root.f64_field("brightness")).flatten()
    }

    /// Ball speed in `[0, 1]`.
    #[must_use]
    pub fn speed(&self) -> Option<f64> {
        self.with_root(|root| root.f64_field("speed")).flatten()
    }

    #[must_use]
    pub fn is_sleeping(&self) -> bool {
        self.root_bool("is_sleeping")
    }

    #[must_use]
    pub fn is_loop(&self) -> bool {
        self.root_bool("is_loop")
    }

    #[must_use]
    pub fn is_shuffle(&self) -> bool {
        self.root_bool("is_shuffle")
    }

    fn root_bool(&self, field: &str) -> bool {
        self.with_root(|root| root.bool_field(field))
            .flatten()
            .unwrap_or(false)
    }

    /// Remaining time on the active track, as of [`Table::time_as_of`].
    /// Zero before the first timing push arrives.
    #[must_use]
    pub fn remaining_time(&self) -> Duration {
        self.with_state(|state| state.timing.remaining())
    }

    /// Total length of the active track.
    #[must_use]
    pub fn total_time(&self) -> Duration {
        self.with_state(|state| state.timing.total())
    }

    /// Local receipt time of the last timing push.
    #[must_use]
    pub fn time_as_of(&self) -> Option<OffsetDateTime> {
        self.with_state(|state| state.timing.as_of())
    }

    // Views.

    /// The playlists loaded on the table, in the root's listed order.
    #[must_use]
    pub fn playlists(&self) -> Vec<Playlist> {
        self.with_root(|root| root.id_list("playlist_ids"))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.get_playlist_by_id(&id))
            .collect()
    }

    #[must_use]
    pub fn get_playlist_by_id(&self, id: &str) -> Option<Playlist> {
        let entity = self.with_state(|state| {
            state
                .collection
                .get(id)
                .filter(|entity| entity.kind() == EntityKind::Playlist)
                .cloned()
        })?;
        Some(Playlist::new(self.clone(), entity))
    }

    #[must_use]
    pub fn get_playlists_named(&self, name: &str) -> Vec<Playlist> {
        self.playlists()
            .into_iter()
            .filter(|playlist| playlist.name() == Some(name))
            .collect()
    }

    /// The track designs the table knows about, outside any playlist.
    #[must_use]
    pub fn tracks(&self) -> Vec<Track> {
        self.with_root(|root| root.id_list("track_ids"))
            .unwrap_or_default()
            .into_iter()
            .filter_map(|id| self.get_track_by_id(&id))
            .collect()
    }

    #[must_use]
    pub fn get_track_by_id(&self, id: &str) -> Option<Track> {
        let entity = self.with_state(|state| {
            state
                .collection
                .get(id)
                .filter(|entity| entity.kind() == EntityKind::Track)
                .cloned()
        })?;
        Some(Track::new(self.clone(), None, entity))
    }

    #[must_use]
    pub fn get_tracks_named(&self, name: &str) -> Vec<Track> {
        self.tracks()
            .into_iter()
            .filter(|track| track.name() == Some(name))
            .collect()
    }

    /// The active playlist, or `None` when a standalone track (or
    /// nothing) is playing.
    #[must_use]
    pub fn active_playlist(&self) -> Option<Playlist> {
        let id = self.root_string("active_playlist_id")?;
        if id == NO_ACTIVE_PLAYLIST {
            return None;
        }
        self.get_playlist_by_id(&id)
    }

    /// The track occurrence currently playing, owned by the active
    /// playlist when there is one.
    #[must_use]
    pub fn active_track(&self) -> Option<Track> {
        let payload = self
            .with_root(|root| root.get("active_track").cloned())
            .flatten()?;
        let Value::Object(map) = payload else {
            return None;
        };
        let entity = Entity::from_map(map).ok()?;
        Some(Track::new(self.clone(), self.active_playlist(), entity))
    }

    // Commands.

    /// Resumes playback. No-op when the table is already playing.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn play(&self) -> Result<()> {
        if self.state().as_deref() == Some("playing") {
            return Ok(());
        }
        self.send("play", json!({})).await
    }

    /// Pauses playback. No-op when the table is already paused.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn pause(&self) -> Result<()> {
        if self.state().as_deref() == Some("paused") {
            return Ok(());
        }
        self.send("pause", json!({})).await
    }

    /// Puts the table to sleep. No-op when already sleeping.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn sleep(&self) -> Result<()> {
        if self.is_sleeping() {
            return Ok(());
        }
        self.send("sleep_sisbot", json!({})).await
    }

    /// Wakes the table up. No-op when already awake.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn wakeup(&self) -> Result<()> {
        if !self.is_sleeping() {
            return Ok(());
        }
        self.send("wake_sisbot", json!({})).await
    }

    /// Sets the ball light brightness.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` for levels outside `[0, 1]`, before any
    /// network traffic.
    pub async fn set_brightness(&self, level: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&level) {
            return Err(Error::out_of_range(format!(
                "brightness must be within [0, 1], got {level}"
            )));
        }
        self.send("set_brightness", json!({"value": level})).await
    }

    /// Sets the ball speed.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` for speeds outside `[0, 1]`, before any
    /// network traffic.
    pub async fn set_speed(&self, speed: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&speed) {
            return Err(Error::out_of_range(format!(
                "speed must be within [0, 1], got {speed}"
            )));
        }
        self.send("set_speed", json!({"value": speed})).await
    }

    /// Sets whether playback loops.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn set_loop(&self, value: bool) -> Result<()> {
        self.send("set_loop", json!({"value": value.to_string()}))
            .await
    }

    /// Sets shuffle on the active playlist.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when no playlist is active.
    pub async fn set_shuffle(&self, value: bool) -> Result<()> {
        let playlist = self.active_playlist().ok_or_else(|| {
            Error::failed_precondition("cannot set shuffle: no active playlist")
        })?;
        playlist.set_shuffle(value).await?;

        // The device confirms through the push channel eventually; echo
        // locally so immediate reads agree with what was just commanded.
        self.set_root_field("is_shuffle", Value::String(value.to_string()));
        Ok(())
    }

    /// Asks the table for a full state and timing refresh.
    ///
    /// # Errors
    ///
    /// Propagates command channel failures.
    pub async fn refresh(&self) -> Result<()> {
        self.send("state", json!({})).await?;
        self.send("get_track_time", json!({})).await
    }

    // Listeners.

    /// Registers a change listener; fired once per notifiable change.
    pub fn add_listener(&self, listener: Listener) -> ListenerId {
        self.inner
            .listeners
            .lock()
            .expect("listeners mutex poisoned")
            .add(listener)
    }

    /// Removes a listener. Returns whether it was still registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner
            .listeners
            .lock()
            .expect("listeners mutex poisoned")
            .remove(id)
    }

    /// Waits until `pred` holds over the current state.
    ///
    /// The predicate is re-evaluated after every notified change; it is
    /// never polled on a timer.
    pub async fn wait_for<F>(&self, pred: F)
    where
        F: Fn(&Self) -> bool,
    {
        loop {
            let notified = self.inner.updated.notified();
            tokio::pin!(notified);
            // Register for the notification before evaluating, so a change
            // racing in between the check and the await is not missed.
            notified.as_mut().enable();
            if pred(self) {
                return;
            }
            notified.await;
        }
    }

    /// Shuts the handle down: stops the push channel and fails any
    /// further commands. Closing is terminal and idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inner.shutdown.cancel();
        let handle = self
            .inner
            .push_task
            .lock()
            .expect("push task mutex poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.inner
            .state
            .lock()
            .expect("state mutex poisoned")
            .connected = false;
        info!("closed table handle for {}", self.inner.host);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;
    use crate::events::sync_listener;

    #[derive(Clone, Default)]
    struct MockCommands {
        shared: Arc<MockShared>,
    }

    #[derive(Default)]
    struct MockShared {
        calls: StdMutex<Vec<(String, Value)>>,
        reply: StdMutex<Value>,
        fail: AtomicBool,
    }

    impl MockCommands {
        fn calls(&self) -> Vec<(String, Value)> {
            self.shared
                .calls
                .lock()
                .expect("calls mutex poisoned")
                .clone()
        }

        fn endpoints(&self) -> Vec<String> {
            self.calls().into_iter().map(|(endpoint, _)| endpoint).collect()
        }

        fn fail_next(&self) {
            self.shared.fail.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Commands for MockCommands {
        async fn send(&self, endpoint: &str, params: Value) -> Result<Value> {
            if self.shared.fail.swap(false, Ordering::SeqCst) {
                return Err(Error::unavailable("connection refused"));
            }

            self.shared
                .calls
                .lock()
                .expect("calls mutex poisoned")
                .push((endpoint.to_owned(), params));
            Ok(self.shared.reply.lock().expect("reply mutex poisoned").clone())
        }
    }

    fn harness() -> (Table, MockCommands) {
        let mock = MockCommands::default();
        let table = Table::with_commands("table.local", Box::new(mock.clone()));
        (table, mock)
    }

    async fn apply(table: &Table, payload: Value) {
        table
            .apply_update(Update::from_value(payload).expect("test payload"))
            .await;
    }

    fn counting_listener(table: &Table) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        table.add_listener(sync_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    fn full_state() -> Value {
        json!([
            {
                "id": "d1",
                "type": "device",
                "name": "Sisyphus",
                "state": "waiting",
                "is_sleeping": "false",
                "is_shuffle": "false",
                "is_loop": "false",
                "brightness": 0.8,
                "speed": 0.4,
                "active_playlist_id": "p1",
                "active_track": {"id": "t1", "type": "track", "name": "Erase"},
                "playlist_ids": ["p1"],
                "track_ids": ["t1", "t2"],
                "software_version": "1.3.1",
                "mac_address": "b8:27:eb:01:02:03",
            },
            {
                "id": "p1",
                "type": "playlist",
                "name": "Favorites",
                "description": "",
                "is_loop": "true",
                "is_shuffle": "false",
                "version": 1,
                "created_at": "2018-02-10 14:14:44",
                "updated_at": "2018-02-11 10:00:00",
                "active_track_index": 0,
                "sorted_tracks": [1, 0],
                "tracks": [
                    {"id": "t1", "name": "Erase", "_index": 0},
                    {"id": "t2", "name": "Hep", "_index": 1},
                ],
            },
            {"id": "t1", "type": "track", "name": "Erase"},
            {"id": "t2", "type": "track", "name": "Hep"},
        ])
    }

    #[tokio::test]
    async fn snapshot_exposes_device_properties() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;

        assert!(table.is_connected());
        assert_eq!(table.id().as_deref(), Some("d1"));
        assert_eq!(table.name().as_deref(), Some("Sisyphus"));
        assert_eq!(table.firmware_version().as_deref(), Some("1.3.1"));
        assert_eq!(table.mac_address().as_deref(), Some("b8:27:eb:01:02:03"));
        assert_eq!(table.state().as_deref(), Some("waiting"));
        assert_eq!(table.brightness(), Some(0.8));
        assert_eq!(table.speed(), Some(0.4));
        assert!(!table.is_sleeping());
        assert!(!table.is_loop());
        assert!(!table.is_shuffle());
    }

    #[tokio::test]
    async fn views_follow_the_membership_lists() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;

        let playlists = table.playlists();
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].name(), Some("Favorites"));

        assert_eq!(table.tracks().len(), 2);
        assert_eq!(table.get_tracks_named("Hep").len(), 1);

        let active = table.active_playlist().expect("active playlist");
        assert_eq!(active.id(), "p1");

        let track = table.active_track().expect("active track");
        assert_eq!(track.name(), Some("Erase"));
        assert_eq!(track.playlist_id(), Some("p1"));
    }

    #[tokio::test]
    async fn playlist_orders_tracks_by_sort_list() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;

        let playlist = table.get_playlist_by_id("p1").expect("playlist");
        let names: Vec<_> = playlist
            .tracks()
            .iter()
            .filter_map(|track| track.name().map(str::to_owned))
            .collect();
        assert_eq!(names, ["Hep", "Erase"]);

        assert!(playlist.is_loop());
        assert_eq!(playlist.version(), Some(1));
        assert_eq!(
            playlist
                .created_time()
                .expect("created_at parses")
                .to_string(),
            "2018-02-10 14:14:44.0"
        );
    }

    #[tokio::test]
    async fn duplicate_push_notifies_once() {
        let (table, _mock) = harness();
        let count = counting_listener(&table);

        apply(&table, full_state()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Same snapshot again: nothing observable changed.
        apply(&table, full_state()).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn connection_transitions_always_notify() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;
        let count = counting_listener(&table);

        apply(&table, Value::Null).await;
        assert!(!table.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Reconnection counts even when the snapshot is unchanged.
        apply(&table, full_state()).await;
        assert!(table.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timing_pushes_bypass_the_debounce() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;
        let count = counting_listener(&table);

        let timing = json!([{"remaining_time": 500, "total_time": 2000}]);
        apply(&table, timing.clone()).await;
        assert_eq!(table.remaining_time(), Duration::from_millis(500));
        assert_eq!(table.total_time(), Duration::from_secs(2));

        let as_of = table.time_as_of().expect("receipt stamp");
        let age = OffsetDateTime::now_utc() - as_of;
        assert!(age < time::Duration::seconds(5));

        // Identical numbers still notify; the stamp is fresh.
        apply(&table, timing).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shrinking_membership_prunes_and_notifies() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;
        let count = counting_listener(&table);

        apply(&table, json!({"id": "d1", "track_ids": ["t1"]})).await;

        assert!(table.get_track_by_id("t2").is_none());
        assert_eq!(table.tracks().len(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn brightness_and_speed_validate_before_sending() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        for bad in [-0.01, 1.01] {
            let err = table.set_brightness(bad).await.expect_err("out of range");
            assert_eq!(err.kind, ErrorKind::OutOfRange);
            let err = table.set_speed(bad).await.expect_err("out of range");
            assert_eq!(err.kind, ErrorKind::OutOfRange);
        }
        assert!(mock.calls().is_empty());

        table.set_brightness(0.0).await.expect("lower bound");
        table.set_speed(1.0).await.expect("upper bound");
        assert_eq!(mock.endpoints(), ["set_brightness", "set_speed"]);
        assert_eq!(mock.calls()[0].1, json!({"value": 0.0}));
    }

    #[tokio::test]
    async fn play_is_a_noop_while_playing() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;
        apply(&table, json!({"id": "d1", "state": "playing"})).await;

        table.play().await.expect("no-op play");
        assert!(mock.calls().is_empty());

        apply(&table, json!({"id": "d1", "state": "paused"})).await;
        table.play().await.expect("play");
        assert_eq!(mock.endpoints(), ["play"]);
    }

    #[tokio::test]
    async fn sleep_and_wakeup_are_stateful() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        table.wakeup().await.expect("already awake");
        assert!(mock.calls().is_empty());

        table.sleep().await.expect("sleep");
        assert_eq!(mock.endpoints(), ["sleep_sisbot"]);
    }

    #[tokio::test]
    async fn shuffle_requires_an_active_playlist() {
        let (table, mock) = harness();
        apply(
            &table,
            json!({"id": "d1", "type": "device", "active_playlist_id": "false"}),
        )
        .await;

        let err = table.set_shuffle(true).await.expect_err("no playlist");
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn shuffle_delegates_and_echoes_locally() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;
        assert!(!table.is_shuffle());

        table.set_shuffle(true).await.expect("set shuffle");
        assert_eq!(mock.calls(), [(
            String::from("set_shuffle"),
            json!({"value": "true"}),
        )]);
        assert!(table.is_shuffle());
    }

    #[tokio::test]
    async fn playlist_shuffle_noop_skips_the_network() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        let playlist = table.active_playlist().expect("active playlist");
        playlist.set_shuffle(false).await.expect("no-op");
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn playlist_play_selects_the_track() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        let playlist = table.get_playlist_by_id("p1").expect("playlist");
        let track = playlist
            .get_tracks_named("Hep")
            .into_iter()
            .next()
            .expect("track");

        playlist.play(Some(&track)).await.expect("play");

        let calls = mock.calls();
        assert_eq!(calls[0].0, "set_playlist");
        assert_eq!(calls[0].1.get("active_track_index"), Some(&json!(1)));
        assert_eq!(calls[0].1.get("active_track_id"), Some(&json!("t2")));
        assert_eq!(calls[1].0, "play");
    }

    #[tokio::test]
    async fn foreign_track_is_rejected_by_playlist_play() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        let playlist = table.get_playlist_by_id("p1").expect("playlist");
        let standalone = table.get_track_by_id("t1").expect("track");

        let err = playlist
            .play(Some(&standalone))
            .await
            .expect_err("foreign track");
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn transport_failure_marks_disconnected() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;
        let count = counting_listener(&table);

        mock.fail_next();
        let err = table.refresh().await.expect_err("transport down");
        assert_eq!(err.kind, ErrorKind::Unavailable);
        assert!(!table.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn command_response_payload_merges_into_state() {
        let (table, mock) = harness();
        *mock.shared.reply.lock().expect("reply mutex poisoned") = full_state();

        table.send("connect", json!({})).await.expect("connect");
        assert_eq!(table.name().as_deref(), Some("Sisyphus"));
        assert!(table.is_connected());
    }

    #[tokio::test]
    async fn closed_handle_rejects_commands() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        table.close().await;
        table.close().await; // idempotent

        assert!(table.is_closed());
        assert!(!table.is_connected());
        let err = table.pause().await.expect_err("closed");
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn wait_for_unblocks_on_matching_change() {
        let (table, _mock) = harness();

        let waiter = {
            let table = table.clone();
            tokio::spawn(async move {
                table.wait_for(Table::is_connected).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        apply(&table, full_state()).await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("waiter task");
    }

    #[tokio::test]
    async fn track_play_outside_a_playlist_sets_the_track() {
        let (table, mock) = harness();
        apply(&table, full_state()).await;

        let track = table.get_track_by_id("t2").expect("track");
        track.play().await.expect("play");

        let calls = mock.calls();
        assert_eq!(calls[0].0, "set_track");
        assert_eq!(calls[0].1.get("id"), Some(&json!("t2")));
        assert_eq!(calls[1].0, "play");
    }

    #[tokio::test]
    async fn thumbnail_urls_point_at_the_media_port() {
        let (table, _mock) = harness();
        apply(&table, full_state()).await;

        let track = table.get_track_by_id("t1").expect("track");
        assert_eq!(
            track.thumbnail_url(crate::track::ThumbnailSize::Large),
            "http://table.local:3001/thumbnail/400/t1"
        );
    }
}
