use std::sync::{Arc, Mutex};

use crate::server::Server;

/// Unique identifier for one accepted connection's session.
///
/// Handles are assigned from a monotonically increasing counter and are never
/// reused for the lifetime of the server process.
pub type ClientHandle = u64;

/// The cause reported through [`ServerEvents::on_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerReason {
    /// Binding the listening endpoint failed; the server is going down.
    InitialBindFail,
    /// The bound endpoint refused to listen; the server is going down.
    InitialListenFail,
    /// A connection passed admission control and a session was registered.
    ConnectionAccepted,
    /// A connection was refused by admission control and closed. This is a
    /// policy outcome, not an error.
    ConnectionRefused,
    /// At least one terminated session was reaped from the directory. Fired
    /// once per cleanup sweep, not once per session.
    ConnectionDeleted,
    /// The lifecycle worker has started running.
    ServerStarted,
    /// `stop()` was invoked; shutdown is in progress.
    ServerStopSignal,
    /// The lifecycle worker has fully terminated.
    ServerStopped,
}

/// The observer interface of the server.
///
/// One implementation is installed at construction time and receives every
/// lifecycle, connect, disconnect, data and authentication event. Callbacks
/// are serialized by the [`EventNotifier`]: at most one of them executes at a
/// time, across all sessions and the lifecycle worker, so implementations do
/// not need their own synchronization against concurrent invocation. They
/// should return quickly; session I/O for other connections proceeds
/// concurrently, but no other callback can be delivered while one runs.
///
/// Every method receives the owning [`Server`] so observers can respond
/// without holding their own reference to it, e.g. by calling
/// [`Server::send_to_client`].
#[allow(unused_variables)]
pub trait ServerEvents: Send + Sync {
    /// The server has bound its endpoint and entered the listening state.
    fn on_start_listening(&self, server: &Server) {}

    /// A client completed authentication and is now fully connected.
    fn on_client_connect(&self, server: &Server, handle: ClientHandle) {}

    /// A session ended, for any reason.
    fn on_client_disconnect(&self, server: &Server, handle: ClientHandle) {}

    /// An authenticated client delivered `data`. The server never interprets
    /// these bytes.
    fn on_client_receive_data(&self, server: &Server, handle: ClientHandle, data: &[u8]) {}

    /// A lifecycle update occurred. `os_error` carries the raw OS error code
    /// for the two fatal initialization reasons and is 0 otherwise.
    fn on_update(&self, server: &Server, reason: ServerReason, os_error: i32) {}

    /// An unauthenticated client sent `data` as a password attempt. Return
    /// `true` to admit the client. The default denies every attempt, which
    /// leaves unauthenticated clients re-prompted until their idle timeout.
    fn on_password_entered(&self, server: &Server, handle: ClientHandle, data: &[u8]) -> bool {
        false
    }
}

/// Serializes delivery of [`ServerEvents`] callbacks to the one registered
/// observer.
///
/// The dispatch lock is independent of the client directory's structural
/// lock: registration bookkeeping never executes user code, and user code
/// never runs under the structural lock.
pub struct EventNotifier {
    listener: Arc<dyn ServerEvents>,
    gate: Mutex<()>,
}

impl EventNotifier {
    pub fn new(listener: Arc<dyn ServerEvents>) -> Self {
        Self {
            listener,
            gate: Mutex::new(()),
        }
    }

    fn dispatch<R>(&self, call: impl FnOnce(&dyn ServerEvents) -> R) -> R {
        let _serialized = self.gate.lock().unwrap();
        call(&*self.listener)
    }

    pub fn start_listening(&self, server: &Server) {
        self.dispatch(|l| l.on_start_listening(server));
    }

    pub fn client_connect(&self, server: &Server, handle: ClientHandle) {
        self.dispatch(|l| l.on_client_connect(server, handle));
    }

    pub fn client_disconnect(&self, server: &Server, handle: ClientHandle) {
        self.dispatch(|l| l.on_client_disconnect(server, handle));
    }

    pub fn client_receive_data(&self, server: &Server, handle: ClientHandle, data: &[u8]) {
        self.dispatch(|l| l.on_client_receive_data(server, handle, data));
    }

    pub fn server_update(&self, server: &Server, reason: ServerReason, os_error: i32) {
        self.dispatch(|l| l.on_update(server, reason, os_error));
    }

    pub fn password_entered(&self, server: &Server, handle: ClientHandle, data: &[u8]) -> bool {
        self.dispatch(|l| l.on_password_entered(server, handle, data))
    }
}
