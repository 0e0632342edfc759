use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::server::events::ClientHandle;
use crate::server::queue::SendQueue;

/// Runtime state shared between one session's worker task and the directory.
///
/// The `TcpStream` itself is owned exclusively by the worker; everything the
/// rest of the server may touch lives here. The directory only mutates a
/// session after `connected` has been cleared.
pub struct ClientSession {
    handle: ClientHandle,
    connected: AtomicBool,
    authenticated: AtomicBool,
    send_queue: SendQueue,
    deadline: Mutex<Instant>,
    idle_timeout: Duration,
}

impl ClientSession {
    fn new(handle: ClientHandle, idle_timeout: Duration) -> Self {
        Self {
            handle,
            connected: AtomicBool::new(true),
            authenticated: AtomicBool::new(false),
            send_queue: SendQueue::new(),
            deadline: Mutex::new(Instant::now() + idle_timeout),
            idle_timeout,
        }
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn set_authenticated(&self, authenticated: bool) {
        self.authenticated.store(authenticated, Ordering::Release);
    }

    pub(crate) fn queue(&self) -> &SendQueue {
        &self.send_queue
    }

    /// Pushes the idle deadline out by the configured timeout. Called on any
    /// successful I/O.
    pub(crate) fn renew_deadline(&self) {
        *self.deadline.lock().unwrap() = Instant::now() + self.idle_timeout;
    }

    pub(crate) fn deadline_expired(&self, now: Instant) -> bool {
        now >= *self.deadline.lock().unwrap()
    }
}

struct Registered {
    session: Arc<ClientSession>,
    worker: JoinHandle<()>,
}

struct DirectoryInner {
    clients: HashMap<ClientHandle, Registered>,
    /// Handles whose workers have announced termination but have not been
    /// reaped yet. Every queued handle refers to a map entry that exists or
    /// has just been erased.
    pending_removal: VecDeque<ClientHandle>,
    handle_counter: ClientHandle,
}

/// Concurrency-safe registry of live sessions.
///
/// One structural lock guards the map, the pending-removal queue and the
/// handle counter. Registration happens only on the acceptor path; removal is
/// two-phase: a worker marks its session logically gone and queues its handle
/// (never erasing itself, which would mean joining its own task), and the
/// acceptor later reaps entries whose workers have actually finished.
pub struct ClientDirectory {
    inner: Mutex<DirectoryInner>,
}

impl ClientDirectory {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DirectoryInner {
                clients: HashMap::new(),
                pending_removal: VecDeque::new(),
                handle_counter: 0,
            }),
        }
    }

    /// Admits one accepted connection, or refuses it when `max_connections`
    /// sessions are already registered.
    ///
    /// On admission the next handle is assigned, `spawn_worker` is invoked to
    /// launch the session's task, and the entry is registered — all inside
    /// one critical section so the capacity bound can never be exceeded by a
    /// concurrent sweep observing a half-registered session. A refused
    /// connection consumes no handle.
    pub(crate) fn admit<F>(
        &self,
        max_connections: usize,
        idle_timeout: Duration,
        spawn_worker: F,
    ) -> Option<ClientHandle>
    where
        F: FnOnce(Arc<ClientSession>) -> JoinHandle<()>,
    {
        let mut inner = self.inner.lock().unwrap();
        if inner.clients.len() >= max_connections {
            return None;
        }
        inner.handle_counter += 1;
        let handle = inner.handle_counter;
        let session = Arc::new(ClientSession::new(handle, idle_timeout));
        let worker = spawn_worker(Arc::clone(&session));
        inner.clients.insert(handle, Registered { session, worker });
        Some(handle)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn session(&self, handle: ClientHandle) -> Option<Arc<ClientSession>> {
        let inner = self.inner.lock().unwrap();
        inner.clients.get(&handle).map(|r| Arc::clone(&r.session))
    }

    /// Second phase of a worker's exit: queue the handle for a later reap.
    pub(crate) fn mark_for_removal(&self, handle: ClientHandle) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(registered) = inner.clients.get(&handle) {
            registered.session.set_connected(false);
        }
        inner.pending_removal.push_back(handle);
        debug!(handle, "session queued for removal");
    }

    /// Drains the pending-removal queue, erasing every entry whose worker has
    /// finished. Handles whose workers are still winding down stay queued for
    /// the next sweep, so the sweep never waits on a task that has not yet
    /// observed its disconnect. Returns the join handles of the reaped
    /// workers; the caller awaits them outside the structural lock.
    pub(crate) fn sweep(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.inner.lock().unwrap();
        let mut reaped = Vec::new();
        let mut still_running = VecDeque::new();
        while let Some(handle) = inner.pending_removal.pop_front() {
            match inner.clients.get(&handle).map(|r| r.worker.is_finished()) {
                Some(true) => {
                    if let Some(registered) = inner.clients.remove(&handle) {
                        reaped.push(registered.worker);
                    }
                }
                Some(false) => still_running.push_back(handle),
                // Already erased by an earlier sweep or shutdown.
                None => {}
            }
        }
        inner.pending_removal = still_running;
        reaped
    }

    /// Unregisters every session at once. Used on shutdown, after the stage
    /// has flipped, so each worker exits at its next tick.
    pub(crate) fn drain_all(&self) -> Vec<JoinHandle<()>> {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_removal.clear();
        inner
            .clients
            .drain()
            .map(|(_, registered)| registered.worker)
            .collect()
    }
}

impl Default for ClientDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    const IDLE: Duration = Duration::from_secs(60);

    fn park_worker() -> (oneshot::Sender<()>, impl FnOnce(Arc<ClientSession>) -> JoinHandle<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        (tx, move |_session| {
            tokio::spawn(async move {
                let _ = rx.await;
            })
        })
    }

    #[tokio::test]
    async fn handles_are_assigned_monotonically() {
        let directory = ClientDirectory::new();
        let mut release = Vec::new();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let (tx, spawn) = park_worker();
            release.push(tx);
            handles.push(directory.admit(10, IDLE, spawn).unwrap());
        }
        assert_eq!(handles, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn admission_respects_capacity_and_refusal_burns_no_handle() {
        let directory = ClientDirectory::new();
        let (_tx1, spawn1) = park_worker();
        let (_tx2, spawn2) = park_worker();
        assert!(directory.admit(2, IDLE, spawn1).is_some());
        assert!(directory.admit(2, IDLE, spawn2).is_some());

        let (_tx3, spawn3) = park_worker();
        assert!(directory.admit(2, IDLE, spawn3).is_none());
        assert_eq!(directory.len(), 2);

        // The refused attempt must not have consumed handle 3.
        let (_tx4, spawn4) = park_worker();
        assert_eq!(directory.admit(3, IDLE, spawn4), Some(3));
    }

    #[tokio::test]
    async fn sweep_reaps_only_finished_workers() {
        let directory = ClientDirectory::new();
        let (tx, spawn) = park_worker();
        let handle = directory.admit(10, IDLE, spawn).unwrap();
        directory.mark_for_removal(handle);

        // Worker still parked on the channel: nothing to reap yet.
        assert!(directory.sweep().is_empty());
        assert_eq!(directory.len(), 1);

        tx.send(()).unwrap();
        let mut reaped = Vec::new();
        for _ in 0..100 {
            reaped = directory.sweep();
            if !reaped.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(reaped.len(), 1);
        for worker in reaped {
            worker.await.unwrap();
        }
        assert!(directory.is_empty());
    }

    #[tokio::test]
    async fn mark_for_removal_clears_connected_flag() {
        let directory = ClientDirectory::new();
        let (_tx, spawn) = park_worker();
        let handle = directory.admit(10, IDLE, spawn).unwrap();
        let session = directory.session(handle).unwrap();
        assert!(session.is_connected());
        directory.mark_for_removal(handle);
        assert!(!session.is_connected());
    }
}
