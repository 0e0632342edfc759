use std::sync::Arc;
use std::time::Instant;

use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::server::client::ClientSession;
use crate::server::Server;

/// Size of the per-session receive buffer.
const RECEIVE_BUFFER_SIZE: usize = 256;

const PASSWORD_PROMPT: &[u8] = b"password: ";
const WRONG_PASSWORD_MESSAGE: &[u8] = b"wrong password\n";

/// The per-session worker loop.
///
/// Each pass executes, in order: shutdown/disconnect check, idle-deadline
/// check, opportunistic drain of the send queue, socket-validity check, and a
/// bounded-timeout read. Any successful I/O renews the idle deadline. The
/// loop never blocks indefinitely; every suspension is a tick sleep or a
/// readiness wait with a timeout.
///
/// On exit, whatever the reason, the worker fires the disconnect callback,
/// releases the connection and queues its handle for the directory's next
/// cleanup sweep. It never erases itself from the directory, which would
/// amount to joining its own task.
pub(crate) async fn run_client(server: Arc<Server>, session: Arc<ClientSession>, stream: TcpStream) {
    let handle = session.handle();
    let tick = server.config().tick_interval();
    let read_timeout = server.config().read_timeout();
    let mut buffer = [0u8; RECEIVE_BUFFER_SIZE];

    trace!(handle, "session worker started");
    sleep(tick).await;
    session.queue().push(PASSWORD_PROMPT);
    session.renew_deadline();

    while session.is_connected() && !server.is_shutting_down() {
        sleep(tick).await;

        if session.deadline_expired(Instant::now()) {
            debug!(handle, "idle timeout expired");
            session.set_connected(false);
            break;
        }

        // Flush whatever the socket will take right now. Progress renews the
        // idle deadline; a hard error ends the session; a full socket simply
        // leaves the remainder for a later pass.
        while !session.queue().is_empty() {
            match session.queue().send(&stream) {
                Ok(0) => break,
                Ok(_) => session.renew_deadline(),
                Err(e) => {
                    debug!(handle, error = %e, "send failed");
                    session.set_connected(false);
                    break;
                }
            }
        }
        if !session.is_connected() {
            break;
        }

        let ready = match timeout(read_timeout, stream.ready(Interest::READABLE)).await {
            // Nothing to read within the timeout; next tick.
            Err(_) => continue,
            Ok(Err(e)) => {
                debug!(handle, error = %e, "socket invalid");
                break;
            }
            Ok(Ok(ready)) => ready,
        };

        if ready.is_readable() {
            match stream.try_read(&mut buffer) {
                // Zero bytes on a readable socket: peer closed.
                Ok(0) => break,
                Ok(n) => {
                    route_bytes(&server, &session, &buffer[..n]);
                    session.renew_deadline();
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!(handle, error = %e, "receive failed");
                    break;
                }
            }
        } else if ready.is_read_closed() {
            break;
        }
    }

    session.set_connected(false);
    server.notifier().client_disconnect(&server, handle);
    drop(stream);
    server.directory().mark_for_removal(handle);
    trace!(handle, "session worker finished");
}

/// Routes received bytes through the password gate until the session is
/// authenticated, then delivers them as opaque data.
fn route_bytes(server: &Arc<Server>, session: &Arc<ClientSession>, data: &[u8]) {
    let handle = session.handle();
    if session.is_authenticated() {
        server.notifier().client_receive_data(server, handle, data);
        return;
    }
    if server.notifier().password_entered(server, handle, data) {
        session.set_authenticated(true);
        debug!(handle, "client authenticated");
        server.notifier().client_connect(server, handle);
    } else {
        session.queue().push(WRONG_PASSWORD_MESSAGE);
        session.queue().push(PASSWORD_PROMPT);
    }
}
