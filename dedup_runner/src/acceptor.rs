// dedup_runner/src/acceptor.rs
//! Listening socket and accept loop.
//!
//! The loop runs on its own thread and hands every accepted socket to the
//! registry. Admitted sockets get a dedicated reader thread that feeds lines
//! through a [`LineRouter`]; rejected sockets are closed before any byte is
//! read.
//!
//! The listener is non-blocking and polled, so the loop always observes a
//! lifecycle change within [`ACCEPT_POLL`] and `stop` can join it.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::connection::LineConnection;
use crate::error::{Result, ServerError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::registry::{Admission, ConnectionRegistry};
use crate::sink::LineRouter;
use crate::throttle::WarnThrottle;

/// Idle sleep between accept attempts and while the server is still starting.
pub const ACCEPT_POLL: Duration = Duration::from_millis(50);

struct AcceptorRuntime {
    local_addr: SocketAddr,
    handle: JoinHandle<()>,
}

pub struct Acceptor {
    addr: SocketAddr,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<ConnectionRegistry>,
    runtime: Mutex<Option<AcceptorRuntime>>,
}

impl Acceptor {
    pub fn new(addr: SocketAddr, lifecycle: Arc<Lifecycle>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            addr,
            lifecycle,
            registry,
            runtime: Mutex::new(None),
        }
    }

    /// Binds the listener and launches the accept loop. Calling it again while
    /// the loop is alive only returns the bound address.
    ///
    /// Meant to be called while the lifecycle is `Starting`; the loop holds
    /// off accepting until the state becomes `Running` and exits without
    /// accepting if it moves anywhere else.
    pub fn start(&self, router: LineRouter) -> Result<SocketAddr> {
        let mut runtime = self.runtime.lock();
        if let Some(running) = runtime.as_ref() {
            return Ok(running.local_addr);
        }

        let listener = TcpListener::bind(self.addr).map_err(|source| ServerError::Bind {
            addr: self.addr,
            source,
        })?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        info!("listening for clients on {}", local_addr);

        let accept_loop = AcceptLoop {
            listener,
            lifecycle: self.lifecycle.clone(),
            registry: self.registry.clone(),
            router,
            accept_errors: WarnThrottle::new("acceptor"),
            read_errors: Arc::new(WarnThrottle::new("client-read")),
        };
        let handle = thread::Builder::new()
            .name("dedup-acceptor".to_string())
            .spawn(move || accept_loop.run())?;

        *runtime = Some(AcceptorRuntime { local_addr, handle });
        Ok(local_addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.runtime.lock().as_ref().map(|r| r.local_addr)
    }

    /// Ends the accept loop, releases the listener and closes every admitted
    /// connection. The lifecycle must already have left `Running`, otherwise
    /// the loop would keep accepting.
    pub fn stop(&self) {
        let runtime = self.runtime.lock().take();
        if let Some(AcceptorRuntime { local_addr, handle }) = runtime {
            // The listener is owned by the loop and closed when it returns.
            if handle.join().is_err() {
                warn!("accept loop panicked");
            }
            debug!("acceptor on {} stopped", local_addr);
        }
        self.registry.close_all();
    }
}

struct AcceptLoop {
    listener: TcpListener,
    lifecycle: Arc<Lifecycle>,
    registry: Arc<ConnectionRegistry>,
    router: LineRouter,
    accept_errors: WarnThrottle,
    read_errors: Arc<WarnThrottle>,
}

impl AcceptLoop {
    fn run(self) {
        loop {
            match self.lifecycle.state() {
                LifecycleState::Running => {}
                LifecycleState::Starting => {
                    thread::sleep(ACCEPT_POLL);
                    continue;
                }
                _ => break,
            }
            match self.listener.accept() {
                Ok((stream, _)) => {
                    // Some platforms hand out sockets that inherit O_NONBLOCK.
                    if let Err(e) = stream.set_nonblocking(false) {
                        self.accept_errors
                            .warn(format_args!("could not configure accepted socket: {}", e));
                        let _ = stream.shutdown(Shutdown::Both);
                        continue;
                    }
                    self.admit(stream);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.accept_errors
                        .warn(format_args!("error while accepting socket: {}", e));
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
        debug!("accept loop exited");
    }

    fn admit(&self, stream: TcpStream) {
        let connection = match self.registry.try_admit(stream) {
            Admission::Admitted(connection) => connection,
            Admission::Rejected(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };

        let id = connection.id();
        let registry = self.registry.clone();
        let router = self.router.clone();
        let read_errors = self.read_errors.clone();
        let reader = connection.clone();
        let spawned = thread::Builder::new()
            .name(format!("dedup-conn-{}", id))
            .spawn(move || serve(reader, registry, router, read_errors));
        if let Err(e) = spawned {
            self.read_errors
                .warn(format_args!("could not spawn reader for connection {}: {}", id, e));
            connection.stop();
            self.registry.remove(id);
        }
    }
}

fn serve(
    connection: Arc<LineConnection>,
    registry: Arc<ConnectionRegistry>,
    router: LineRouter,
    read_errors: Arc<WarnThrottle>,
) {
    let id = connection.id();
    connection.run(
        |line| router.route(id, line),
        |e| {
            read_errors.warn(format_args!("read failed on connection {}: {}", id, e));
        },
    );
    connection.stop();
    registry.remove(id);
}
