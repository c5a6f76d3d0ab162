//! In-process stack that serves simulated remote devices.
//!
//! Every operation completes immediately by posting a [`StackEvent`] to the
//! event channel. Writes to a watched remote characteristic are echoed back
//! as value changes, which makes the loopback useful for exercising the whole
//! observe path without a radio.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::trace;

use super::*;
use crate::remote::RemoteCharacteristic;
use crate::watch::CharId;

/// Loopback stack.
#[derive(Debug)]
pub struct Loopback {
    events: mpsc::UnboundedSender<StackEvent>,
    devices: HashMap<Addr, Vec<RemoteService>>,
    values: HashMap<(Addr, Handle), Value>,
    watched: HashSet<(Addr, Handle)>,
    conns: HashMap<ConnId, Addr>,
    next_app: i32,
    next_conn: i32,
    next_hdl: u16,
}

impl Loopback {
    /// ATT "Invalid Handle" status.
    pub const INVALID_HANDLE: StackError = StackError(0x01);
    /// ATT "Attribute Not Found" status.
    pub const NOT_FOUND: StackError = StackError(0x0A);
    /// "Connection Failed to be Established" status.
    pub const CONN_FAILED: StackError = StackError(0x3E);

    /// Creates a loopback stack that posts events to `events`.
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<StackEvent>) -> Self {
        Self {
            events,
            devices: HashMap::new(),
            values: HashMap::new(),
            watched: HashSet::new(),
            conns: HashMap::new(),
            next_app: 0,
            next_conn: 0,
            next_hdl: 0,
        }
    }

    /// Adds a simulated remote device with the specified services.
    pub fn add_device(&mut self, addr: Addr, svcs: Vec<RemoteService>) {
        self.devices.insert(addr, svcs);
    }

    /// Sets the value of a remote characteristic or descriptor.
    pub fn set_value(&mut self, addr: Addr, hdl: Handle, v: Value) {
        self.values.insert((addr, hdl), v);
    }

    fn complete(&self, tx: Tx, result: Result<Outcome, StackError>) {
        trace!("Loopback {tx} -> {result:?}");
        let _ = self.events.send(StackEvent::Complete { tx, result });
    }

    fn addr(&self, peer: Peer) -> Result<Addr, StackError> {
        match peer {
            Peer::Addr(a) if self.devices.contains_key(&a) => Ok(a),
            Peer::Conn(c) => self.conns.get(&c).copied().ok_or(Self::CONN_FAILED),
            Peer::Addr(_) => Err(Self::CONN_FAILED),
        }
    }

    fn find(&self, addr: Addr, svc: Uuid, chr: Uuid) -> Result<&RemoteCharacteristic, StackError> {
        (self.devices.get(&addr))
            .and_then(|v| v.iter().find(|s| s.uuid == svc))
            .and_then(|s| s.characteristics.iter().find(|c| c.uuid == chr))
            .ok_or(Self::NOT_FOUND)
    }

    fn find_handle(&self, addr: Addr, hdl: Handle) -> Result<(Uuid, Uuid), StackError> {
        (self.devices.get(&addr).into_iter().flatten())
            .find_map(|s| {
                (s.characteristics.iter())
                    .find(|c| c.handle == hdl || c.descriptors.iter().any(|d| d.handle == hdl))
                    .map(|c| (s.uuid, c.uuid))
            })
            .ok_or(Self::INVALID_HANDLE)
    }

    /// Resolves the attribute handles named by an operation.
    fn handles(&self, addr: Addr, op: &ReadOp) -> Result<Vec<Handle>, StackError> {
        match *op {
            ReadOp::Characteristics { service, ref chars } => (chars.iter())
                .map(|&c| self.find(addr, service, c).map(|c| c.handle))
                .collect(),
            ReadOp::Descriptors {
                service,
                characteristic,
                ref descs,
            } => {
                let c = self.find(addr, service, characteristic)?;
                (descs.iter())
                    .map(|&d| {
                        (c.descriptors.iter())
                            .find(|x| x.uuid == d)
                            .map(|x| x.handle)
                            .ok_or(Self::NOT_FOUND)
                    })
                    .collect()
            }
            ReadOp::Handle(h) => self.find_handle(addr, h).map(|_| vec![h]),
        }
    }

    fn do_read(&self, peer: Peer, op: &ReadOp) -> Result<Outcome, StackError> {
        let addr = self.addr(peer)?;
        let hdls = self.handles(addr, op)?;
        let v = (hdls.iter())
            .map(|&h| self.values.get(&(addr, h)).cloned().unwrap_or_default())
            .collect();
        Ok(Outcome::Values(v))
    }

    fn do_write(
        &mut self,
        peer: Peer,
        op: &WriteOp,
        echo: &mut Vec<ValueChanged>,
    ) -> Result<Outcome, StackError> {
        let addr = self.addr(peer)?;
        let (rop, values) = match op.clone() {
            WriteOp::Characteristics {
                service,
                chars,
                values,
            } => (ReadOp::Characteristics { service, chars }, values),
            WriteOp::Descriptors {
                service,
                characteristic,
                descs,
                values,
            } => (
                ReadOp::Descriptors {
                    service,
                    characteristic,
                    descs,
                },
                values,
            ),
            WriteOp::Handle(h, v) => (ReadOp::Handle(h), vec![v]),
        };
        let hdls = self.handles(addr, &rop)?;
        for (h, v) in hdls.into_iter().zip(values) {
            self.values.insert((addr, h), v.clone());
            if !self.watched.contains(&(addr, h)) {
                continue;
            }
            let (service, characteristic) = self.find_handle(addr, h)?;
            echo.push(ValueChanged {
                addr: Some(addr),
                service,
                characteristic,
                handle: Some(h),
                value: v,
            });
        }
        Ok(Outcome::Done)
    }

    fn watch_handle(&self, peer: Peer, key: &WatchKey) -> Result<(Addr, Handle), StackError> {
        let addr = self.addr(peer)?;
        let h = match key.id {
            CharId::Uuid(c) => self.find(addr, key.service, c)?.handle,
            CharId::Handle(h) => h,
        };
        Ok((addr, h))
    }

    fn alloc_hdl(&mut self) -> Result<Outcome, StackError> {
        self.next_hdl = self.next_hdl.wrapping_add(1);
        Handle::new(self.next_hdl)
            .map(Outcome::Handle)
            .ok_or(Self::INVALID_HANDLE)
    }
}

impl Stack for Loopback {
    fn add_application(&mut self, tx: Tx, _: Uuid) {
        self.next_app += 1;
        self.complete(tx, Ok(Outcome::App(AppId(self.next_app))));
    }

    fn remove_application(&mut self, tx: Tx, _: AppId) {
        self.complete(tx, Ok(Outcome::Done));
    }

    fn add_service(&mut self, tx: Tx, _: AppId, _: &Service) {
        let r = self.alloc_hdl();
        self.complete(tx, r);
    }

    fn add_characteristic(&mut self, tx: Tx, _: AppId, _: Handle, _: &Characteristic) {
        let r = self.alloc_hdl();
        self.complete(tx, r);
    }

    fn add_descriptor(&mut self, tx: Tx, _: AppId, _: Handle, _: &Descriptor) {
        let r = self.alloc_hdl();
        self.complete(tx, r);
    }

    fn start_service(&mut self, tx: Tx, _: AppId, _: Handle) {
        self.complete(tx, Ok(Outcome::Done));
    }

    fn remove_service(&mut self, tx: Tx, _: AppId, _: Handle) {
        self.complete(tx, Ok(Outcome::Done));
    }

    fn connect(&mut self, tx: Tx, _: AppId, addr: Addr) {
        let r = if self.devices.contains_key(&addr) {
            self.next_conn += 1;
            let conn = ConnId(self.next_conn);
            self.conns.insert(conn, addr);
            Ok(Outcome::Conn(conn))
        } else {
            Err(Self::CONN_FAILED)
        };
        self.complete(tx, r);
    }

    fn disconnect(&mut self, tx: Tx, conn: ConnId) {
        self.conns.remove(&conn);
        self.complete(tx, Ok(Outcome::Done));
    }

    fn discover_services(&mut self, tx: Tx, peer: Peer) {
        let r = (self.addr(peer))
            .and_then(|a| self.devices.get(&a).cloned().ok_or(Self::CONN_FAILED))
            .map(Outcome::Services);
        self.complete(tx, r);
    }

    fn read(&mut self, tx: Tx, peer: Peer, op: &ReadOp) {
        let r = self.do_read(peer, op);
        self.complete(tx, r);
    }

    fn write(&mut self, tx: Tx, peer: Peer, op: &WriteOp) {
        let mut echo = Vec::new();
        let r = self.do_write(peer, op, &mut echo);
        // Completion precedes the echoed value changes
        self.complete(tx, r);
        for v in echo {
            let _ = self.events.send(StackEvent::ValueChanged(v));
        }
    }

    fn enable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey) {
        let r = self.watch_handle(peer, key).map(|k| {
            self.watched.insert(k);
            Outcome::Done
        });
        self.complete(tx, r);
    }

    fn disable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey) {
        let r = self.watch_handle(peer, key).map(|k| {
            self.watched.remove(&k);
            Outcome::Done
        });
        self.complete(tx, r);
    }
}
