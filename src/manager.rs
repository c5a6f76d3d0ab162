//! Resource manager core.
//!
//! [`Manager`] owns the resource table, the connection map, the remote service
//! cache, and the watch set, and is the only component that talks to the
//! stack. It runs on one task: caller operations validate their input
//! synchronously, issue at most one stack call per step, and park the
//! continuation in a map of pending transactions until the stack delivers the
//! matching [`StackEvent::Complete`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use smallvec::{smallvec, SmallVec};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::conn::{AppId, ConnId, ConnMap};
use crate::reg::{Registration, Step};
use crate::remote::{RemoteAttr, RemoteDb, RemoteService};
use crate::stack::{
    Outcome, Peer, ReadOp, Stack, StackError, StackEvent, Tx, Value, ValueChanged, WriteOp,
};
use crate::table::{AttrRef, Server, ServerId, Service, ServiceDesc, ServiceId, Table};
use crate::target::{Request, Target};
use crate::watch::{CharId, SubscriptionId, Watch, WatchKey, Watches};
use crate::{Absent, Addr, Error, Result, Uuid};

#[cfg(test)]
mod tests;

/// Outcome of an asynchronous operation. Resolves to
/// [`Error::NotAvailable`] if the manager goes away before the operation
/// completes.
#[derive(Debug)]
#[must_use]
pub struct Reply<T>(oneshot::Receiver<Result<T>>);

impl<T> Reply<T> {
    #[inline]
    fn channel() -> (oneshot::Sender<Result<T>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self(rx))
    }

    #[inline]
    fn ready(r: Result<T>) -> Self {
        let (tx, this) = Self::channel();
        let _ = tx.send(r);
        this
    }

    /// Returns the outcome without waiting, or `None` if the operation is
    /// still in progress. The reply must not be polled after an outcome was
    /// taken.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        use oneshot::error::TryRecvError;
        match self.0.try_recv() {
            Ok(r) => Some(r),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(Error::NotAvailable(Absent::Stack))),
        }
    }
}

impl<T> Future for Reply<T> {
    type Output = Result<T>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        (Pin::new(&mut self.0).poll(cx))
            .map(|r| r.unwrap_or_else(|_| Err(Error::NotAvailable(Absent::Stack))))
    }
}

/// Continuation of an in-flight stack transaction.
#[derive(Debug)]
enum Pending {
    OpenServer {
        id: ServerId,
        reply: oneshot::Sender<Result<AppId>>,
    },
    Register {
        app: AppId,
        reg: Registration,
        reply: oneshot::Sender<Result<ServiceId>>,
    },
    RemoveService {
        id: ServiceId,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        app: AppId,
        addr: Addr,
        reply: oneshot::Sender<Result<ConnId>>,
    },
    Disconnect {
        app: AppId,
        reply: oneshot::Sender<Result<()>>,
    },
    Discover {
        addr: Addr,
        reply: oneshot::Sender<Result<Vec<RemoteService>>>,
    },
    Read(oneshot::Sender<Result<Vec<Value>>>),
    Write(oneshot::Sender<Result<()>>),
    Enable(Arc<Watch>),
    Disable(WatchKey),
    /// Best-effort teardown. Failures are only logged.
    Cleanup(&'static str),
}

/// Request destination.
#[derive(Clone, Copy, Debug)]
enum Route {
    Local,
    Remote(Addr, Peer),
}

/// GATT resource manager.
#[derive(Debug)]
pub struct Manager<S> {
    stack: S,
    cfg: Config,
    table: Table,
    conns: ConnMap,
    remote: RemoteDb,
    watches: Watches,
    pending: HashMap<Tx, Pending>,
    next_tx: u64,
}

impl<S: Stack> Manager<S> {
    /// Creates a manager that uses the specified stack.
    #[must_use]
    pub fn new(stack: S, cfg: Config) -> Self {
        Self {
            stack,
            cfg,
            table: Table::new(),
            conns: ConnMap::new(),
            remote: RemoteDb::new(),
            watches: Watches::new(),
            pending: HashMap::new(),
            next_tx: 0,
        }
    }

    /// Returns the configuration.
    #[inline(always)]
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.cfg
    }

    /// Returns the local resource table.
    #[inline(always)]
    #[must_use]
    pub const fn table(&self) -> &Table {
        &self.table
    }

    /// Returns the connection map.
    #[inline(always)]
    #[must_use]
    pub const fn conns(&self) -> &ConnMap {
        &self.conns
    }

    /// Returns the discovered remote service listings.
    #[inline(always)]
    #[must_use]
    pub const fn remote(&self) -> &RemoteDb {
        &self.remote
    }

    /// Returns the watch set.
    #[inline(always)]
    #[must_use]
    pub const fn watches(&self) -> &Watches {
        &self.watches
    }

    /// Returns the stack.
    #[inline(always)]
    pub fn stack_mut(&mut self) -> &mut S {
        &mut self.stack
    }

    /// Returns the number of stack transactions in flight.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Returns all local services in creation order.
    #[inline]
    pub fn services(&self) -> impl Iterator<Item = (ServiceId, &Service)> {
        self.table.services()
    }

    /// Returns the specified local service.
    #[inline]
    #[must_use]
    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.table.service(id)
    }

    /// Opens a local server and registers its application with the stack.
    /// The reply carries the stack-assigned application id.
    pub fn open_server(&mut self, uuid: Uuid) -> Result<(ServerId, Reply<AppId>)> {
        let id = self.table.add_server(uuid)?;
        let tx = self.next_tx();
        debug!("Opening {id} <{uuid:?}> ({tx})");
        self.stack.add_application(tx, uuid);
        let (reply_tx, reply) = Reply::channel();
        self.pending.insert(tx, Pending::OpenServer { id, reply: reply_tx });
        Ok((id, reply))
    }

    /// Closes a local server, removing all of its services. Returns `false` if
    /// the server does not exist.
    pub fn close_server(&mut self, id: ServerId) -> bool {
        let Some(srv) = self.table.remove_server(id) else {
            return false;
        };
        if let Some(app) = srv.app() {
            self.cleanup_app(app);
        }
        info!("Closed {id}");
        true
    }

    /// Adds a service to a local server and starts its registration. Input
    /// validation fails synchronously. The reply resolves once the service is
    /// started or its registration failed, in which case the service was
    /// already removed.
    pub fn add_service(
        &mut self,
        server: ServerId,
        desc: ServiceDesc,
    ) -> Result<(ServiceId, Reply<ServiceId>)> {
        let srv = self.table.server(server).ok_or(Error::NotFound("server"))?;
        let app = srv.app().ok_or(Error::NotAvailable(server.into()))?;
        let id = self.table.add_service(server, desc)?;
        let mut reg = match Registration::new(&self.table, id) {
            Ok(reg) => reg,
            Err(e) => {
                self.table.remove_service(id);
                return Err(e);
            }
        };
        let step = reg.start();
        let (reply_tx, reply) = Reply::channel();
        self.register_step(app, reg, step, reply_tx);
        Ok((id, reply))
    }

    /// Removes a local service. A started service is removed from the stack
    /// first. Removing the last service of a server also closes the server.
    /// Removing an unknown service succeeds immediately.
    pub fn remove_service(&mut self, id: ServiceId) -> Reply<()> {
        let Some(s) = self.table.service(id) else {
            return Reply::ready(Ok(()));
        };
        let app = self.table.server(s.server()).and_then(Server::app);
        match (app, s.handle(), s.is_started()) {
            (Some(app), Some(hdl), true) => {
                let tx = self.next_tx();
                debug!("Removing {id} ({tx})");
                self.stack.remove_service(tx, app, hdl);
                let (reply_tx, reply) = Reply::channel();
                (self.pending).insert(tx, Pending::RemoveService { id, reply: reply_tx });
                reply
            }
            (app, hdl, _) => {
                // Registration in flight fails at its next step
                if let (Some(app), Some(hdl)) = (app, hdl) {
                    let tx = self.next_tx();
                    self.stack.remove_service(tx, app, hdl);
                    self.pending.insert(tx, Pending::Cleanup("remove service"));
                }
                self.service_removed(id);
                Reply::ready(Ok(()))
            }
        }
    }

    /// Opens a GATT client connection for an application.
    pub fn connect(&mut self, app: AppId, addr: Addr) -> Reply<ConnId> {
        let tx = self.next_tx();
        debug!("Connecting {app} to {addr} ({tx})");
        self.stack.connect(tx, app, addr);
        let (reply_tx, reply) = Reply::channel();
        (self.pending).insert(tx, Pending::Connect { app, addr, reply: reply_tx });
        reply
    }

    /// Closes the GATT client connection of an application.
    pub fn disconnect(&mut self, app: AppId) -> Result<Reply<()>> {
        let dev = self.conns.lookup(app)?;
        let tx = self.next_tx();
        debug!("Disconnecting {app} from {} ({tx})", dev.addr);
        self.stack.disconnect(tx, dev.conn);
        let (reply_tx, reply) = Reply::channel();
        (self.pending).insert(tx, Pending::Disconnect { app, reply: reply_tx });
        Ok(reply)
    }

    /// Discovers the services of a remote device. The listing replaces any
    /// previously discovered one.
    pub fn discover_services(&mut self, addr: Addr) -> Reply<Vec<RemoteService>> {
        let peer = self.peer_for(addr);
        let tx = self.next_tx();
        debug!("Discovering services of {peer} ({tx})");
        self.stack.discover_services(tx, peer);
        let (reply_tx, reply) = Reply::channel();
        (self.pending).insert(tx, Pending::Discover { addr, reply: reply_tx });
        reply
    }

    /// Reads the target values. Local targets are served from the resource
    /// table without contacting the stack.
    pub fn read(&mut self, req: &Request) -> Result<Reply<Vec<Value>>> {
        let t = req.target.resolve()?;
        match self.route(req)? {
            Route::Local => {
                let attrs = self.resolve_local(&t)?;
                let v = (attrs.iter())
                    .map(|&(id, at)| {
                        (self.table.service(id).and_then(|s| s.value(at)))
                            .map(<[u8]>::to_vec)
                            .ok_or(Error::NotFound("attribute"))
                    })
                    .collect::<Result<Vec<_>>>()?;
                trace!("Read {} local value(s)", v.len());
                Ok(Reply::ready(Ok(v)))
            }
            Route::Remote(addr, peer) => {
                let op = self.remote_op(addr, &t)?;
                let tx = self.next_tx();
                debug!("Reading {op:?} from {peer} ({tx})");
                self.stack.read(tx, peer, &op);
                let (reply_tx, reply) = Reply::channel();
                self.pending.insert(tx, Pending::Read(reply_tx));
                Ok(reply)
            }
        }
    }

    /// Writes the target values, one per target attribute. Local
    /// characteristic writes are delivered to local observers.
    pub fn write(&mut self, req: &Request, values: Vec<Value>) -> Result<Reply<()>> {
        let t = req.target.resolve()?;
        if values.len() != t.len() {
            return Err(Error::InvalidParam("value count does not match the target"));
        }
        match self.route(req)? {
            Route::Local => {
                self.write_local(&t, values)?;
                Ok(Reply::ready(Ok(())))
            }
            Route::Remote(addr, peer) => {
                let op = write_op(self.remote_op(addr, &t)?, values);
                let tx = self.next_tx();
                debug!("Writing {op:?} to {peer} ({tx})");
                self.stack.write(tx, peer, &op);
                let (reply_tx, reply) = Reply::channel();
                self.pending.insert(tx, Pending::Write(reply_tx));
                Ok(reply)
            }
        }
    }

    /// Subscribes `sink` to value changes of the target characteristic(s).
    /// Watches that already exist are shared; at most one enable request is
    /// issued per new watch. The reply resolves once every watch of the
    /// subscription is active. Release the subscription with
    /// [`Self::release`].
    pub fn observe(
        &mut self,
        req: &Request,
        sink: mpsc::UnboundedSender<ValueChanged>,
    ) -> Result<(SubscriptionId, Reply<()>)> {
        let t = req.target.resolve()?;
        let route = self.route(req)?;
        let keys = self.watch_keys(route, &t)?;
        let peer = match route {
            Route::Local => None,
            Route::Remote(addr, peer) => {
                self.check_limit(addr, &keys)?;
                Some(peer)
            }
        };
        let mut ws = SmallVec::with_capacity(keys.len());
        for (key, chr) in keys {
            let (w, created) = self.watches.acquire(key, chr, peer);
            if let (true, Some(peer)) = (created, peer) {
                let tx = self.next_tx();
                debug!("Enabling watch {key} via {peer} ({tx})");
                self.stack.enable_watch(tx, peer, &key);
                self.pending.insert(tx, Pending::Enable(Arc::clone(&w)));
            }
            ws.push(w);
        }
        let (reply_tx, reply) = Reply::channel();
        let id = self.watches.subscribe(ws, sink, reply_tx);
        Ok((id, reply))
    }

    /// Releases a subscription. Returns `false` if it was already released.
    pub fn release(&mut self, id: SubscriptionId) -> bool {
        let ok = self.watches.release(id);
        self.reap();
        ok
    }

    /// Handles an event delivered by the stack.
    pub fn on_stack_event(&mut self, ev: StackEvent) {
        match ev {
            StackEvent::Complete { tx, result } => match self.pending.remove(&tx) {
                Some(p) => self.complete(tx, p, result),
                None => warn!("Completion for unknown {tx}"),
            },
            StackEvent::ValueChanged(v) => {
                let n = self.watches.fan_out(&v);
                if n == 0 {
                    trace!("Dropped value change for {:?}/{:?}", v.service, v.characteristic);
                } else {
                    trace!("Delivered value change to {n} subscriber(s)");
                }
            }
            StackEvent::Disconnected { conn } => {
                if let Some((app, dev)) = self.conns.unbind_conn(conn) {
                    info!("{app} lost connection to {}", dev.addr);
                }
            }
        }
        self.reap();
    }

    fn complete(&mut self, tx: Tx, p: Pending, r: std::result::Result<Outcome, StackError>) {
        trace!("{tx} completed with {r:?}");
        match p {
            Pending::OpenServer { id, reply } => {
                let r = match r {
                    Ok(Outcome::App(app)) => self.server_opened(id, app),
                    Ok(out) => unexpected(out),
                    Err(e) => Err(e.into()),
                };
                if r.is_err() && self.table.remove_server(id).is_some() {
                    warn!("Failed to open {id}");
                }
                let _ = reply.send(r);
            }
            Pending::Register { app, mut reg, reply } => {
                let step = reg.advance(&mut self.table, r);
                self.register_step(app, reg, step, reply);
            }
            Pending::RemoveService { id, reply } => {
                let r = done(r).map(|()| self.service_removed(id));
                let _ = reply.send(r);
            }
            Pending::Connect { app, addr, reply } => {
                let r = match r {
                    Ok(Outcome::Conn(conn)) => {
                        self.conns.bind(app, addr, conn);
                        Ok(conn)
                    }
                    Ok(out) => unexpected(out),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(r);
            }
            Pending::Disconnect { app, reply } => {
                let r = done(r).map(|()| {
                    self.conns.unbind(app);
                });
                let _ = reply.send(r);
            }
            Pending::Discover { addr, reply } => {
                let r = match r {
                    Ok(Outcome::Services(v)) => {
                        self.remote.update(addr, v.clone());
                        Ok(v)
                    }
                    Ok(out) => unexpected(out),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(r);
            }
            Pending::Read(reply) => {
                let r = match r {
                    Ok(Outcome::Values(v)) => Ok(v),
                    Ok(out) => unexpected(out),
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(r);
            }
            Pending::Write(reply) => {
                let _ = reply.send(done(r));
            }
            Pending::Enable(w) => self.watches.enabled(&w, done(r)),
            Pending::Disable(key) => match done(r) {
                Ok(()) => debug!("Disabled watch {key}"),
                Err(e) => warn!("Failed to disable watch {key}: {e}"),
            },
            Pending::Cleanup(what) => {
                if let Err(e) = done(r) {
                    warn!("Failed to {what}: {e}");
                }
            }
        }
    }

    /// Issues the next registration step or reports the final outcome.
    fn register_step(
        &mut self,
        app: AppId,
        mut reg: Registration,
        mut step: Step,
        reply: oneshot::Sender<Result<ServiceId>>,
    ) {
        loop {
            if let Step::Done(r) = step {
                if let Ok(id) = r {
                    info!("Started {id}");
                    if self.cfg.dump_table {
                        self.table.dump();
                    }
                } else if let Some(hdl) = reg.orphan() {
                    let tx = self.next_tx();
                    debug!("Removing partial declaration of {} ({tx})", reg.service());
                    self.stack.remove_service(tx, app, hdl);
                    self.pending.insert(tx, Pending::Cleanup("remove service"));
                }
                let _ = reply.send(r);
                return;
            }
            let tx = self.next_tx();
            match self.issue_step(tx, app, reg.service(), &step) {
                Ok(()) => {
                    (self.pending).insert(tx, Pending::Register { app, reg, reply });
                    return;
                }
                Err(e) => step = reg.fail(&mut self.table, e),
            }
        }
    }

    fn issue_step(&mut self, tx: Tx, app: AppId, id: ServiceId, step: &Step) -> Result<()> {
        let s = self.table.service(id).ok_or(Error::NotFound("service"))?;
        trace!("{id} step {step:?} ({tx})");
        match *step {
            Step::AddService => self.stack.add_service(tx, app, s),
            Step::AddItem(at) => {
                let hdl = s.handle().ok_or(Error::NotFound("service handle"))?;
                let ch = s.characteristic(at).ok_or(Error::NotFound("characteristic"))?;
                match at {
                    AttrRef::Characteristic(_) => self.stack.add_characteristic(tx, app, hdl, ch),
                    AttrRef::Descriptor(_, d) => {
                        let d = ch.descriptors().get(d).ok_or(Error::NotFound("descriptor"))?;
                        self.stack.add_descriptor(tx, app, hdl, d);
                    }
                }
            }
            Step::Start => {
                let hdl = s.handle().ok_or(Error::NotFound("service handle"))?;
                self.stack.start_service(tx, app, hdl);
            }
            Step::Done(_) => {}
        }
        Ok(())
    }

    fn server_opened(&mut self, id: ServerId, app: AppId) -> Result<AppId> {
        if let Err(e) = self.table.set_app(id, app) {
            // Closed before the stack responded
            self.cleanup_app(app);
            return Err(e);
        }
        info!("Opened {id} as {app}");
        Ok(app)
    }

    fn service_removed(&mut self, id: ServiceId) {
        let Some(s) = self.table.remove_service(id) else {
            return;
        };
        info!("Removed {id} <{:?}>", s.uuid());
        let server = s.server();
        let empty = self.table.server(server).map(|srv| srv.services().next().is_none());
        if empty == Some(true) {
            debug!("Last service of {server} removed");
            self.close_server(server);
        }
    }

    fn cleanup_app(&mut self, app: AppId) {
        let tx = self.next_tx();
        debug!("Removing {app} ({tx})");
        self.stack.remove_application(tx, app);
        self.pending.insert(tx, Pending::Cleanup("remove application"));
    }

    /// Issues one disable request per retired watch.
    fn reap(&mut self) {
        for (key, peer) in self.watches.reap() {
            let tx = self.next_tx();
            debug!("Disabling watch {key} via {peer} ({tx})");
            self.stack.disable_watch(tx, peer, &key);
            self.pending.insert(tx, Pending::Disable(key));
        }
    }

    fn route(&self, req: &Request) -> Result<Route> {
        match (req.device, req.app_id) {
            (None, None) => Ok(Route::Local),
            (dev, Some(app)) => {
                let c = self.conns.lookup(app)?;
                if dev.map_or(false, |a| a != c.addr) {
                    return Err(Error::InvalidParam("device does not match the appId connection"));
                }
                Ok(Route::Remote(c.addr, Peer::Conn(c.conn)))
            }
            (Some(addr), None) => Ok(Route::Remote(addr, self.peer_for(addr))),
        }
    }

    /// Prefers connection addressing when the device has a live connection.
    #[inline]
    fn peer_for(&self, addr: Addr) -> Peer {
        self.conns.conn_for(addr).map_or(Peer::Addr(addr), Peer::Conn)
    }

    /// Resolves a local target to attributes of started services. Batches are
    /// resolved completely before anything is returned.
    fn resolve_local(&self, t: &Target) -> Result<SmallVec<[(ServiceId, AttrRef); 4]>> {
        let mut v = SmallVec::with_capacity(t.len());
        match *t {
            Target::Handle(h) => {
                let r = self.table.lookup_handle(h)?;
                if !self.is_started(r.0) {
                    return Err(Error::InvalidHandle(h));
                }
                v.push(r);
            }
            Target::Path {
                service,
                characteristic,
                descriptor,
            } => v.push(self.lookup_local(service, characteristic, descriptor)?),
            Target::Characteristics { service, ref chars } => {
                for &c in chars {
                    v.push(self.lookup_local(service, c, None)?);
                }
            }
            Target::Descriptors {
                service,
                characteristic,
                ref descs,
            } => {
                for &d in descs {
                    v.push(self.lookup_local(service, characteristic, Some(d))?);
                }
            }
        }
        Ok(v)
    }

    fn lookup_local(
        &self,
        svc: Uuid,
        chr: Uuid,
        desc: Option<Uuid>,
    ) -> Result<(ServiceId, AttrRef)> {
        let r = self.table.lookup_path(svc, chr, desc)?;
        if !self.is_started(r.0) {
            return Err(Error::InvalidService(svc));
        }
        Ok(r)
    }

    #[inline]
    fn is_started(&self, id: ServiceId) -> bool {
        self.table.service(id).map_or(false, Service::is_started)
    }

    fn write_local(&mut self, t: &Target, values: Vec<Value>) -> Result<()> {
        let attrs = self.resolve_local(t)?;
        let mut changes = SmallVec::<[ValueChanged; 4]>::new();
        for (&(id, at), v) in attrs.iter().zip(values) {
            self.table.set_value(id, at, v.clone())?;
            let AttrRef::Characteristic(_) = at else {
                continue;
            };
            let Some(s) = self.table.service(id) else {
                continue;
            };
            if let Some(ch) = s.characteristic(at) {
                changes.push(ValueChanged {
                    addr: None,
                    service: s.uuid(),
                    characteristic: ch.uuid(),
                    handle: ch.handle(),
                    value: v,
                });
            }
        }
        debug!("Wrote {} local value(s)", attrs.len());
        for c in &changes {
            self.watches.fan_out(c);
        }
        self.reap();
        Ok(())
    }

    /// Validates a remote target against the discovered listing and returns
    /// the matching read operation.
    fn remote_op(&self, addr: Addr, t: &Target) -> Result<ReadOp> {
        Ok(match *t {
            Target::Handle(h) => {
                self.remote.resolve_handle(addr, h)?;
                ReadOp::Handle(h)
            }
            Target::Path {
                service,
                characteristic,
                descriptor: None,
            } => {
                self.remote.resolve_path(addr, service, characteristic, None)?;
                ReadOp::Characteristics {
                    service,
                    chars: smallvec![characteristic],
                }
            }
            Target::Path {
                service,
                characteristic,
                descriptor: Some(d),
            } => {
                self.remote.resolve_path(addr, service, characteristic, Some(d))?;
                ReadOp::Descriptors {
                    service,
                    characteristic,
                    descs: smallvec![d],
                }
            }
            Target::Characteristics { service, ref chars } => {
                for &c in chars {
                    self.remote.resolve_path(addr, service, c, None)?;
                }
                ReadOp::Characteristics {
                    service,
                    chars: chars.clone(),
                }
            }
            Target::Descriptors {
                service,
                characteristic,
                ref descs,
            } => {
                for &d in descs {
                    self.remote.resolve_path(addr, service, characteristic, Some(d))?;
                }
                ReadOp::Descriptors {
                    service,
                    characteristic,
                    descs: descs.clone(),
                }
            }
        })
    }

    /// Resolves an observe target to watch keys and characteristic UUIDs.
    fn watch_keys(&self, route: Route, t: &Target) -> Result<SmallVec<[(WatchKey, Uuid); 4]>> {
        let addr = match route {
            Route::Local => None,
            Route::Remote(addr, _) => Some(addr),
        };
        let path = |service: Uuid, chr: Uuid| -> Result<(WatchKey, Uuid)> {
            match addr {
                None => {
                    self.lookup_local(service, chr, None)?;
                }
                Some(a) => {
                    self.remote.resolve_path(a, service, chr, None)?;
                }
            }
            let id = CharId::Uuid(chr);
            Ok((WatchKey { addr, service, id }, chr))
        };
        let mut v = SmallVec::with_capacity(t.len());
        match *t {
            Target::Handle(h) => {
                let (service, chr) = match addr {
                    None => {
                        let (id, at) = self.table.lookup_handle(h)?;
                        let s = (self.table.service(id))
                            .filter(|s| s.is_started())
                            .ok_or(Error::InvalidHandle(h))?;
                        if !matches!(at, AttrRef::Characteristic(_)) {
                            return Err(Error::InvalidParam("descriptors cannot be observed"));
                        }
                        let chr = s.attr_uuid(at).ok_or(Error::InvalidHandle(h))?;
                        (s.uuid(), chr)
                    }
                    Some(a) => match self.remote.resolve_handle(a, h)? {
                        RemoteAttr {
                            descriptor: Some(_),
                            ..
                        } => return Err(Error::InvalidParam("descriptors cannot be observed")),
                        r => (r.service, r.characteristic),
                    },
                };
                let id = CharId::Handle(h);
                v.push((WatchKey { addr, service, id }, chr));
            }
            Target::Path {
                service,
                characteristic,
                descriptor: None,
            } => v.push(path(service, characteristic)?),
            Target::Characteristics { service, ref chars } => {
                for &c in chars {
                    v.push(path(service, c)?);
                }
            }
            Target::Path { .. } | Target::Descriptors { .. } => {
                return Err(Error::InvalidParam("descriptors cannot be observed"));
            }
        }
        Ok(v)
    }

    /// Enforces the per-device watch limit before any stack call is issued.
    fn check_limit(&self, addr: Addr, keys: &[(WatchKey, Uuid)]) -> Result<()> {
        let Some(max) = self.cfg.max_watches_per_device else {
            return Ok(());
        };
        let new = keys.iter().filter(|(k, _)| self.watches.get(k).is_none()).count();
        let live = self.watches.live_for(addr);
        if live + new > max {
            warn!("Watch limit of {addr} reached ({live} live, {new} requested)");
            return Err(Error::NotAvailable(addr.into()));
        }
        Ok(())
    }

    #[inline]
    fn next_tx(&mut self) -> Tx {
        self.next_tx += 1;
        Tx(self.next_tx)
    }
}

/// Converts a read operation into a write of the specified values.
fn write_op(op: ReadOp, mut values: Vec<Value>) -> WriteOp {
    match op {
        ReadOp::Characteristics { service, chars } => WriteOp::Characteristics {
            service,
            chars,
            values,
        },
        ReadOp::Descriptors {
            service,
            characteristic,
            descs,
        } => WriteOp::Descriptors {
            service,
            characteristic,
            descs,
            values,
        },
        ReadOp::Handle(h) => WriteOp::Handle(h, values.pop().unwrap_or_default()),
    }
}

#[inline]
fn done(r: std::result::Result<Outcome, StackError>) -> Result<()> {
    match r {
        Ok(Outcome::Done) => Ok(()),
        Ok(out) => unexpected(out),
        Err(e) => Err(e.into()),
    }
}

#[inline]
fn unexpected<T>(out: Outcome) -> Result<T> {
    warn!("Unexpected stack outcome: {out:?}");
    Err(StackError::UNEXPECTED.into())
}
