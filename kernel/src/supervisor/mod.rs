//! The supervisor: worker lifecycle, port bookkeeping and message routing.
//!
//! Every message in the tree passes through one shared outbox. A single
//! routing task drains it and either handles the message itself (port
//! control, addressed to id `0`) or forwards it to the addressed worker's
//! inbox. Before forwarding, reply-expecting messages are checked against
//! the spawn tree: a worker may only block on one of its own ancestors, so
//! blocking calls always point toward the root and can never form a cycle.

mod ports;
mod registry;

pub use ports::PortClosed;

use parking_lot::{Mutex, RwLock};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::infrastructure::config::DebugSettings;
use crate::mailbox::{Mailbox, MailboxError};
use crate::message::{Headers, Id, Message, MessageType, ReplyRx};
use crate::worker::{WorkerContext, WorkerError};

use ports::PortTable;
use registry::Registry;

/// Errors raised by supervisor operations and sent back as `error` replies.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    /// The supervisor has been stopped.
    #[error("supervisor stopped")]
    Cancelled,

    /// No worker is registered under this id.
    #[error("no worker={0}")]
    NoWorker(Id),

    /// The port is not open.
    #[error("no port={port} worker={worker}")]
    NoPort {
        /// Owning worker.
        worker: Id,
        /// Requested port.
        port: Id,
    },

    /// The port is already open.
    #[error("port already open worker={worker} port={port}")]
    PortAlreadyOpen {
        /// Owning worker.
        worker: Id,
        /// Requested port.
        port: Id,
    },

    /// A message to the supervisor that is neither `open` nor `close`.
    #[error("unrecognized message type={kind} in message from worker={from}")]
    UnrecognizedType {
        /// Offending type.
        kind: MessageType,
        /// Sender.
        from: Id,
    },

    /// A reply-expecting message to a worker that is not an ancestor.
    #[error("can only sync system call parent or ancestor vats")]
    NotAncestor,

    /// A reply-expecting message addressed outside the spawn tree.
    #[error("unsupported address {0}")]
    UnsupportedAddress(Id),
}

impl From<MailboxError> for SupervisorError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Cancelled => Self::Cancelled,
        }
    }
}

struct SupervisorInner {
    cancel: CancellationToken,
    tasks: TaskTracker,
    registry: RwLock<Registry>,
    ports: Mutex<PortTable>,
    open_ports: watch::Sender<usize>,
    outbox: Mailbox,
    started: AtomicBool,
    debug: DebugSettings,
}

/// Handle to a supervision tree. Clones share the same tree.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("workers", &self.inner.registry.read().len())
            .field("open_ports", &*self.inner.open_ports.borrow())
            .field("stopped", &self.inner.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    /// Creates a supervisor with its own root cancellation scope.
    #[must_use]
    pub fn new(debug: DebugSettings) -> Self {
        Self::with_cancellation(CancellationToken::new(), debug)
    }

    /// Creates a supervisor whose scope is `cancel`; cancelling it has the
    /// same effect as [`Supervisor::stop`].
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken, debug: DebugSettings) -> Self {
        let (open_ports, _) = watch::channel(0);
        Self {
            inner: Arc::new(SupervisorInner {
                cancel,
                tasks: TaskTracker::new(),
                registry: RwLock::new(Registry::default()),
                ports: Mutex::new(PortTable::default()),
                open_ports,
                outbox: Mailbox::new(),
                started: AtomicBool::new(false),
                debug,
            }),
        }
    }

    /// Debug toggles this tree was created with.
    #[must_use]
    pub fn debug(&self) -> DebugSettings {
        self.inner.debug
    }

    /// Spawns a worker under `parent` and returns its new id.
    ///
    /// The worker's inbox and empty port map exist before this returns.
    /// `entry` runs as its own task under a child of the supervisor's
    /// cancellation scope. A worker that fails with anything other than a
    /// shutdown condition aborts the process.
    pub fn spawn<F, Fut>(&self, parent: Id, entry: F) -> Id
    where
        F: FnOnce(WorkerContext) -> Fut,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let (id, inbox) = {
            let mut registry = self.inner.registry.write();
            let (id, inbox) = registry.register(parent);
            self.inner.ports.lock().add_worker(id);
            (id, inbox)
        };

        let track = self.inner.debug.track_handles;
        if track {
            info!(worker = %id, parent = %parent, "+1 worker");
        }

        let ctx = WorkerContext::new(
            id,
            parent,
            self.inner.cancel.child_token(),
            inbox,
            self.clone(),
        );
        let worker = entry(ctx);

        self.inner.tasks.spawn(async move {
            let outcome = worker.await;
            if track {
                info!(worker = %id, "-1 worker");
            }
            match outcome {
                Ok(()) => debug!(worker = %id, "Worker finished"),
                Err(e) if e.is_shutdown() => debug!(worker = %id, reason = %e, "Worker shut down"),
                Err(e) => {
                    error!(worker = %id, error = %e, "Worker failed, aborting");
                    std::process::abort();
                }
            }
        });

        id
    }

    /// Sends a message into the tree through the shared outbox.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Cancelled`] once the tree has stopped.
    pub fn deliver(&self, message: Message) -> Result<(), SupervisorError> {
        self.inner
            .outbox
            .deliver(&self.inner.cancel, message)
            .map_err(Into::into)
    }

    /// Asks the routing task to open `port` on `worker`.
    ///
    /// The returned channel resolves with `ok` or an `error` reply.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Cancelled`] once the tree has stopped.
    pub fn open_port(&self, worker: Id, port: Id) -> Result<ReplyRx, SupervisorError> {
        self.port_control(MessageType::Open, worker, port)
    }

    /// Asks the routing task to close `port` on `worker`.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Cancelled`] once the tree has stopped.
    pub fn close_port(&self, worker: Id, port: Id) -> Result<ReplyRx, SupervisorError> {
        self.port_control(MessageType::Close, worker, port)
    }

    fn port_control(
        &self,
        kind: MessageType,
        worker: Id,
        port: Id,
    ) -> Result<ReplyRx, SupervisorError> {
        let headers = Headers::new(kind)
            .with_from(worker)
            .with_to(Id::SUPERVISOR)
            .with_port(port);
        let (request, reply) = Message::request(headers);
        self.deliver(request)?;
        Ok(reply)
    }

    /// Returns a handle that resolves once `port` on `worker` closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is unknown or the port is not open.
    pub fn port_closed(&self, worker: Id, port: Id) -> Result<PortClosed, SupervisorError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        let slot = self.inner.ports.lock().subscribe(worker, port)?;
        Ok(PortClosed::new(
            worker,
            port,
            slot,
            self.inner.cancel.clone(),
        ))
    }

    /// Number of ports currently open across the tree.
    #[must_use]
    pub fn open_port_count(&self) -> usize {
        *self.inner.open_ports.borrow()
    }

    /// Whether `caller` may block on a reply from `callee`.
    #[must_use]
    pub fn can_block(&self, caller: Id, callee: Id) -> bool {
        self.inner.registry.read().can_block(caller, callee)
    }

    /// Parent of `worker`, if it is registered.
    #[must_use]
    pub fn parent_of(&self, worker: Id) -> Option<Id> {
        self.inner.registry.read().parent(worker)
    }

    /// Launches the routing task. Calling it again has no effect.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            warn!("Supervisor already started");
            return;
        }
        let supervisor = self.clone();
        self.inner.tasks.spawn(async move { supervisor.route_until_stopped().await });
    }

    /// Cancels the whole tree. Blocked fetches and deliveries return
    /// promptly and the routing task exits.
    pub fn stop(&self) {
        debug!("Stopping supervisor");
        self.inner.cancel.cancel();
    }

    /// Returns `true` once [`Supervisor::stop`] has been called.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Waits until every opened port has been closed, or the tree stops.
    ///
    /// A return after [`Supervisor::stop`] does not mean the ports closed;
    /// check [`Supervisor::open_port_count`] when that matters.
    pub async fn wait_ports(&self) {
        let mut open = self.inner.open_ports.subscribe();
        loop {
            if *open.borrow_and_update() == 0 {
                return;
            }
            tokio::select! {
                () = self.inner.cancel.cancelled() => return,
                changed = open.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    /// Waits until the routing task and every worker task have exited.
    pub async fn wait(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    pub(crate) fn outbox(&self) -> &Mailbox {
        &self.inner.outbox
    }

    async fn route_until_stopped(self) {
        let track = self.inner.debug.track_handles;
        if track {
            info!("+1 supervisor");
        }
        while let Ok(batch) = self.inner.outbox.fetch(&self.inner.cancel).await {
            for message in batch {
                self.route(message);
            }
        }
        if track {
            info!("-1 supervisor");
        }
    }

    fn route(&self, mut message: Message) {
        if self.inner.debug.trace_messages {
            trace_message(&message);
        }

        let to = message.headers.to;
        if to.is_supervisor() {
            self.handle_control(message);
            return;
        }

        if message.expects_reply() && !self.can_block(message.headers.from, to) {
            if message.headers.sync {
                message.respond_error(SupervisorError::NotAncestor.to_string());
            } else {
                message.respond_with(MessageType::Ack);
            }
        }

        if to.is_unsupervised() {
            if message.expects_reply() {
                message.respond_error(SupervisorError::UnsupportedAddress(to).to_string());
            } else {
                warn!(to = %to, kind = %message.headers.kind, "Dropping message to unsupported address");
            }
            return;
        }

        let inbox = self.inner.registry.read().inbox(to);
        match inbox {
            Some(inbox) => {
                if let Err(e) = inbox.deliver(&self.inner.cancel, message) {
                    debug!(to = %to, error = %e, "Delivery abandoned");
                }
            }
            None if message.expects_reply() => {
                message.respond_error(SupervisorError::NoWorker(to).to_string());
            }
            None => {
                warn!(to = %to, kind = %message.headers.kind, "Return to sender, address unknown");
            }
        }
    }

    fn handle_control(&self, mut message: Message) {
        let worker = message.headers.from;
        let port = message.headers.port;

        let result = match message.headers.kind {
            MessageType::Open => {
                let mut ports = self.inner.ports.lock();
                ports.open(worker, port).map(|()| ports.open_count())
            }
            MessageType::Close => {
                let mut ports = self.inner.ports.lock();
                ports
                    .close(worker, port, &message.headers)
                    .map(|()| ports.open_count())
            }
            kind => Err(SupervisorError::UnrecognizedType { kind, from: worker }),
        };

        match result {
            Ok(open) => {
                self.inner.open_ports.send_replace(open);
                if self.inner.debug.track_handles {
                    let sign = if message.headers.kind == MessageType::Open { "+1" } else { "-1" };
                    info!(worker = %worker, port = %port, "{sign} port");
                }
                message.respond_with(MessageType::Ok);
            }
            Err(e) => {
                debug!(worker = %worker, port = %port, error = %e, "Control message rejected");
                message.respond_error(e.to_string());
            }
        }
    }
}

fn trace_message(message: &Message) {
    let headers = serde_json::to_string(&message.headers).unwrap_or_default();
    info!(
        headers = %headers,
        body = %String::from_utf8_lossy(&message.body),
        "Routing message"
    );
}
