//! Interface to the Bluetooth stack plugin.
//!
//! Every [`Stack`] method returns immediately. The stack reports the result
//! later by delivering exactly one [`StackEvent::Complete`] carrying the same
//! [`Tx`], on the thread that runs the [`Manager`](crate::manager::Manager).
//! Value changes and link loss arrive as unsolicited events.

use std::fmt::{Display, Formatter};

use smallvec::SmallVec;

use crate::conn::{AppId, ConnId};
use crate::remote::RemoteService;
use crate::table::{Characteristic, Descriptor, Handle, Service};
use crate::watch::WatchKey;
use crate::{Addr, Uuid};

pub mod loopback;
#[cfg(test)]
pub(crate) mod mock;

/// Attribute value.
pub type Value = Vec<u8>;

/// UUID list of a batched request.
pub type Uuids = SmallVec<[Uuid; 4]>;

/// Stack transaction identifier.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Tx(pub u64);

impl Display for Tx {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// Failure status reported by the stack.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("stack operation failed with status {0:#04X}")]
pub struct StackError(pub i32);

impl StackError {
    /// Status used when the stack completes an operation with a result of the
    /// wrong kind.
    pub const UNEXPECTED: Self = Self(-1);
}

/// Remote device addressing mode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Peer {
    /// Raw device address.
    Addr(Addr),
    /// Live GATT client connection to the device.
    Conn(ConnId),
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Addr(a) => Display::fmt(&a, f),
            Self::Conn(c) => Display::fmt(&c, f),
        }
    }
}

/// Remote read operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOp {
    /// Read one or more characteristics of one service.
    Characteristics { service: Uuid, chars: Uuids },
    /// Read one or more descriptors of one characteristic.
    Descriptors {
        service: Uuid,
        characteristic: Uuid,
        descs: Uuids,
    },
    /// Read the attribute with the specified handle.
    Handle(Handle),
}

/// Remote write operation. Values are in the same order as the UUIDs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WriteOp {
    Characteristics {
        service: Uuid,
        chars: Uuids,
        values: Vec<Value>,
    },
    Descriptors {
        service: Uuid,
        characteristic: Uuid,
        descs: Uuids,
        values: Vec<Value>,
    },
    Handle(Handle, Value),
}

/// Outbound stack operations.
pub trait Stack {
    /// Registers a server application. Completes with [`Outcome::App`].
    fn add_application(&mut self, tx: Tx, uuid: Uuid);

    /// Unregisters a server application. Completes with [`Outcome::Done`].
    fn remove_application(&mut self, tx: Tx, app: AppId);

    /// Declares a service. Completes with [`Outcome::Handle`] containing the
    /// service handle.
    fn add_service(&mut self, tx: Tx, app: AppId, svc: &Service);

    /// Declares the next characteristic of a service being registered.
    /// Completes with [`Outcome::Handle`].
    fn add_characteristic(&mut self, tx: Tx, app: AppId, svc: Handle, ch: &Characteristic);

    /// Declares a descriptor of the most recently added characteristic.
    /// Completes with [`Outcome::Handle`].
    fn add_descriptor(&mut self, tx: Tx, app: AppId, svc: Handle, d: &Descriptor);

    /// Starts a fully declared service. Completes with [`Outcome::Done`].
    fn start_service(&mut self, tx: Tx, app: AppId, svc: Handle);

    /// Stops and removes a service. Completes with [`Outcome::Done`].
    fn remove_service(&mut self, tx: Tx, app: AppId, svc: Handle);

    /// Opens a GATT client connection. Completes with [`Outcome::Conn`].
    fn connect(&mut self, tx: Tx, app: AppId, addr: Addr);

    /// Closes a GATT client connection. Completes with [`Outcome::Done`].
    fn disconnect(&mut self, tx: Tx, conn: ConnId);

    /// Discovers remote services. Completes with [`Outcome::Services`].
    fn discover_services(&mut self, tx: Tx, peer: Peer);

    /// Reads remote attributes. Completes with [`Outcome::Values`].
    fn read(&mut self, tx: Tx, peer: Peer, op: &ReadOp);

    /// Writes remote attributes. Completes with [`Outcome::Done`].
    fn write(&mut self, tx: Tx, peer: Peer, op: &WriteOp);

    /// Enables value change notifications. Completes with [`Outcome::Done`].
    fn enable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey);

    /// Disables value change notifications. Completes with [`Outcome::Done`].
    fn disable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey);
}

/// Successful stack operation result.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Outcome {
    Done,
    App(AppId),
    Handle(Handle),
    Conn(ConnId),
    Values(Vec<Value>),
    Services(Vec<RemoteService>),
}

/// Event delivered by the stack.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum StackEvent {
    /// Completion of the operation started with `tx`.
    Complete {
        tx: Tx,
        result: Result<Outcome, StackError>,
    },
    /// Characteristic value change reported by a remote device.
    ValueChanged(ValueChanged),
    /// GATT client connection was lost.
    Disconnected { conn: ConnId },
}

/// Characteristic value change. `addr` is `None` for local characteristics.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValueChanged {
    pub addr: Option<Addr>,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub handle: Option<Handle>,
    pub value: Value,
}
