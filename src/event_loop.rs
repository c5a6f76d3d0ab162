//! Event loop task and its client handles.
//!
//! [`EventLoop::spawn`] moves a [`Manager`] onto a tokio task that processes
//! stack events and caller commands in arrival order. Callers interact with
//! it through cheaply cloneable [`Client`] handles.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::conn::{AppId, ConnId};
use crate::manager::{Manager, Reply};
use crate::remote::RemoteService;
use crate::stack::{Stack, StackEvent, Value, ValueChanged};
use crate::table::{ServerId, Service, ServiceDesc, ServiceId};
use crate::target::Request;
use crate::watch::SubscriptionId;
use crate::{Absent, Addr, Error, Result, Uuid};

/// Caller command executed on the event loop task.
#[derive(Debug)]
enum Cmd {
    OpenServer(Uuid, oneshot::Sender<Result<(ServerId, Reply<AppId>)>>),
    CloseServer(ServerId, oneshot::Sender<bool>),
    AddService(
        ServerId,
        ServiceDesc,
        oneshot::Sender<Result<(ServiceId, Reply<ServiceId>)>>,
    ),
    RemoveService(ServiceId, oneshot::Sender<Reply<()>>),
    Services(oneshot::Sender<Vec<(ServiceId, Service)>>),
    Connect(AppId, Addr, oneshot::Sender<Reply<ConnId>>),
    Disconnect(AppId, oneshot::Sender<Result<Reply<()>>>),
    Discover(Addr, oneshot::Sender<Reply<Vec<RemoteService>>>),
    Read(Request, oneshot::Sender<Result<Reply<Vec<Value>>>>),
    Write(Request, Vec<Value>, oneshot::Sender<Result<Reply<()>>>),
    Observe(
        Request,
        mpsc::UnboundedSender<ValueChanged>,
        oneshot::Sender<Result<(SubscriptionId, Reply<()>)>>,
    ),
    Release(SubscriptionId),
    DumpTable,
    Stop,
}

/// Handle to the task running a [`Manager`]. Resolves to the manager once the
/// task stops.
#[derive(Debug)]
pub struct EventLoop<S> {
    h: tokio::task::JoinHandle<Manager<S>>,
    cmd: mpsc::WeakUnboundedSender<Cmd>,
}

impl<S: Stack + Send + 'static> EventLoop<S> {
    /// Spawns a task that runs the manager. `events` must receive all events
    /// emitted by the manager's stack. The task stops when all clients and
    /// subscriptions are dropped.
    pub fn spawn(m: Manager<S>, events: mpsc::UnboundedReceiver<StackEvent>) -> (Self, Client) {
        let (cmd, cmds) = mpsc::unbounded_channel();
        let task = Task { m, events, cmds };
        let this = Self {
            h: tokio::spawn(task.run()),
            cmd: cmd.downgrade(),
        };
        (this, Client(cmd))
    }
}

impl<S> EventLoop<S> {
    /// Stops the task and returns the manager. Operations that are still in
    /// flight fail with [`Error::NotAvailable`] once the manager is dropped.
    pub async fn stop(self) -> Manager<S> {
        if let Some(cmd) = self.cmd.upgrade() {
            let _ = cmd.send(Cmd::Stop);
        }
        self.await
    }
}

impl<S> Future for EventLoop<S> {
    type Output = Manager<S>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match ready!(Pin::new(&mut self.h).poll(cx)) {
            Ok(m) => Poll::Ready(m),
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }
}

/// Event loop state.
struct Task<S> {
    m: Manager<S>,
    events: mpsc::UnboundedReceiver<StackEvent>,
    cmds: mpsc::UnboundedReceiver<Cmd>,
}

impl<S: Stack> Task<S> {
    async fn run(mut self) -> Manager<S> {
        debug!("Event loop started");
        loop {
            tokio::select! {
                biased;
                ev = self.events.recv() => match ev {
                    Some(ev) => self.m.on_stack_event(ev),
                    None => {
                        warn!("Stack event channel closed");
                        break;
                    }
                },
                cmd = self.cmds.recv() => match cmd {
                    Some(Cmd::Stop) | None => break,
                    Some(cmd) => self.exec(cmd),
                },
            }
        }
        debug!("Event loop terminating");
        self.m
    }

    fn exec(&mut self, cmd: Cmd) {
        trace!("{cmd:?}");
        let m = &mut self.m;
        // Send errors mean that the caller stopped waiting
        match cmd {
            Cmd::OpenServer(uuid, tx) => {
                let _ = tx.send(m.open_server(uuid));
            }
            Cmd::CloseServer(id, tx) => {
                let _ = tx.send(m.close_server(id));
            }
            Cmd::AddService(server, desc, tx) => {
                let _ = tx.send(m.add_service(server, desc));
            }
            Cmd::RemoveService(id, tx) => {
                let _ = tx.send(m.remove_service(id));
            }
            Cmd::Services(tx) => {
                let _ = tx.send(m.services().map(|(id, s)| (id, s.clone())).collect());
            }
            Cmd::Connect(app, addr, tx) => {
                let _ = tx.send(m.connect(app, addr));
            }
            Cmd::Disconnect(app, tx) => {
                let _ = tx.send(m.disconnect(app));
            }
            Cmd::Discover(addr, tx) => {
                let _ = tx.send(m.discover_services(addr));
            }
            Cmd::Read(req, tx) => {
                let _ = tx.send(m.read(&req));
            }
            Cmd::Write(req, values, tx) => {
                let _ = tx.send(m.write(&req, values));
            }
            Cmd::Observe(req, sink, tx) => {
                if let Err(Ok((id, _))) = tx.send(m.observe(&req, sink)) {
                    m.release(id);
                }
            }
            Cmd::Release(id) => {
                m.release(id);
            }
            Cmd::DumpTable => m.table().dump(),
            Cmd::Stop => {}
        }
    }
}

/// Caller handle to an [`EventLoop`]. All operations fail with
/// [`Error::NotAvailable`] after the loop stops.
#[derive(Clone, Debug)]
pub struct Client(mpsc::UnboundedSender<Cmd>);

impl Client {
    /// Registers a new server application and returns its ids.
    pub async fn open_server(&self, uuid: Uuid) -> Result<(ServerId, AppId)> {
        let (id, app) = self.call(|tx| Cmd::OpenServer(uuid, tx)).await??;
        Ok((id, app.await?))
    }

    /// Closes a server and all of its services. Returns `false` if the server
    /// does not exist.
    pub async fn close_server(&self, id: ServerId) -> Result<bool> {
        self.call(|tx| Cmd::CloseServer(id, tx)).await
    }

    /// Adds a service to a server and waits until it is started.
    pub async fn add_service(&self, server: ServerId, desc: ServiceDesc) -> Result<ServiceId> {
        let (_, reg) = self.call(|tx| Cmd::AddService(server, desc, tx)).await??;
        reg.await
    }

    /// Removes a service.
    pub async fn remove_service(&self, id: ServiceId) -> Result<()> {
        self.call(|tx| Cmd::RemoveService(id, tx)).await?.await
    }

    /// Returns a snapshot of all local services.
    pub async fn services(&self) -> Result<Vec<(ServiceId, Service)>> {
        self.call(Cmd::Services).await
    }

    /// Opens a GATT client connection to a remote device on behalf of `app`.
    pub async fn connect(&self, app: AppId, addr: Addr) -> Result<ConnId> {
        self.call(|tx| Cmd::Connect(app, addr, tx)).await?.await
    }

    /// Closes the GATT client connection of `app`.
    pub async fn disconnect(&self, app: AppId) -> Result<()> {
        self.call(|tx| Cmd::Disconnect(app, tx)).await??.await
    }

    /// Discovers the services of a remote device.
    pub async fn discover_services(&self, addr: Addr) -> Result<Vec<RemoteService>> {
        self.call(|tx| Cmd::Discover(addr, tx)).await?.await
    }

    /// Reads one or more attribute values.
    pub async fn read(&self, req: Request) -> Result<Vec<Value>> {
        self.call(|tx| Cmd::Read(req, tx)).await??.await
    }

    /// Writes one or more attribute values.
    pub async fn write(&self, req: Request, values: Vec<Value>) -> Result<()> {
        self.call(|tx| Cmd::Write(req, values, tx)).await??.await
    }

    /// Subscribes to value changes and waits until all required watches are
    /// enabled.
    pub async fn observe(&self, req: Request) -> Result<Subscription> {
        let (sink, rx) = mpsc::unbounded_channel();
        let (id, reply) = self.call(|tx| Cmd::Observe(req, sink, tx)).await??;
        let sub = Subscription {
            id,
            rx,
            cmd: self.0.clone(),
        };
        reply.await?;
        Ok(sub)
    }

    /// Logs the local resource table.
    pub fn dump_table(&self) -> Result<()> {
        self.send(Cmd::DumpTable)
    }

    /// Asks the event loop to stop.
    pub fn stop(&self) -> Result<()> {
        self.send(Cmd::Stop)
    }

    async fn call<T>(&self, f: impl FnOnce(oneshot::Sender<T>) -> Cmd) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(f(tx))?;
        rx.await.map_err(|_| Error::NotAvailable(Absent::Stack))
    }

    #[inline]
    fn send(&self, cmd: Cmd) -> Result<()> {
        (self.0.send(cmd)).map_err(|_| Error::NotAvailable(Absent::Stack))
    }
}

/// Active subscription. Dropping it releases the subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<ValueChanged>,
    cmd: mpsc::UnboundedSender<Cmd>,
}

impl Subscription {
    /// Returns the subscription id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Receives the next value change. Returns `None` after the event loop
    /// stops.
    #[inline]
    pub async fn next(&mut self) -> Option<ValueChanged> {
        self.rx.recv().await
    }

    /// Returns the next value change if one is queued.
    #[inline]
    pub fn try_next(&mut self) -> Option<ValueChanged> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cmd.send(Cmd::Release(self.id));
    }
}
