//! Stack that records outbound calls for inspection by tests.

use tokio::sync::mpsc::{self, unbounded_channel, UnboundedReceiver};

use super::*;

/// Stack that forwards every call to a channel.
#[derive(Debug)]
pub(crate) struct MockStack(mpsc::UnboundedSender<Call>);

impl MockStack {
    /// Creates a mock stack and the receiver of its calls.
    pub fn new() -> (Self, UnboundedReceiver<Call>) {
        let (tx, rx) = unbounded_channel();
        (Self(tx), rx)
    }

    fn send(&self, c: Call) {
        let _ = self.0.send(c);
    }
}

/// Outbound stack call. Completions are fed back by the test.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Call {
    AddApplication(Tx, Uuid),
    RemoveApplication(Tx, AppId),
    AddService(Tx, AppId, Uuid),
    AddCharacteristic(Tx, Handle, Uuid),
    AddDescriptor(Tx, Handle, Uuid),
    StartService(Tx, Handle),
    RemoveService(Tx, Handle),
    Connect(Tx, AppId, Addr),
    Disconnect(Tx, ConnId),
    Discover(Tx, Peer),
    Read(Tx, Peer, ReadOp),
    Write(Tx, Peer, WriteOp),
    EnableWatch(Tx, Peer, WatchKey),
    DisableWatch(Tx, Peer, WatchKey),
}

impl Call {
    /// Returns the transaction id of the call.
    pub const fn tx(&self) -> Tx {
        use Call::*;
        match *self {
            AddApplication(tx, ..)
            | RemoveApplication(tx, ..)
            | AddService(tx, ..)
            | AddCharacteristic(tx, ..)
            | AddDescriptor(tx, ..)
            | StartService(tx, ..)
            | RemoveService(tx, ..)
            | Connect(tx, ..)
            | Disconnect(tx, ..)
            | Discover(tx, ..)
            | Read(tx, ..)
            | Write(tx, ..)
            | EnableWatch(tx, ..)
            | DisableWatch(tx, ..) => tx,
        }
    }
}

impl Stack for MockStack {
    fn add_application(&mut self, tx: Tx, uuid: Uuid) {
        self.send(Call::AddApplication(tx, uuid));
    }

    fn remove_application(&mut self, tx: Tx, app: AppId) {
        self.send(Call::RemoveApplication(tx, app));
    }

    fn add_service(&mut self, tx: Tx, app: AppId, svc: &Service) {
        self.send(Call::AddService(tx, app, svc.uuid()));
    }

    fn add_characteristic(&mut self, tx: Tx, _: AppId, svc: Handle, ch: &Characteristic) {
        self.send(Call::AddCharacteristic(tx, svc, ch.uuid()));
    }

    fn add_descriptor(&mut self, tx: Tx, _: AppId, svc: Handle, d: &Descriptor) {
        self.send(Call::AddDescriptor(tx, svc, d.uuid()));
    }

    fn start_service(&mut self, tx: Tx, _: AppId, svc: Handle) {
        self.send(Call::StartService(tx, svc));
    }

    fn remove_service(&mut self, tx: Tx, _: AppId, svc: Handle) {
        self.send(Call::RemoveService(tx, svc));
    }

    fn connect(&mut self, tx: Tx, app: AppId, addr: Addr) {
        self.send(Call::Connect(tx, app, addr));
    }

    fn disconnect(&mut self, tx: Tx, conn: ConnId) {
        self.send(Call::Disconnect(tx, conn));
    }

    fn discover_services(&mut self, tx: Tx, peer: Peer) {
        self.send(Call::Discover(tx, peer));
    }

    fn read(&mut self, tx: Tx, peer: Peer, op: &ReadOp) {
        self.send(Call::Read(tx, peer, op.clone()));
    }

    fn write(&mut self, tx: Tx, peer: Peer, op: &WriteOp) {
        self.send(Call::Write(tx, peer, op.clone()));
    }

    fn enable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey) {
        self.send(Call::EnableWatch(tx, peer, *key));
    }

    fn disable_watch(&mut self, tx: Tx, peer: Peer, key: &WatchKey) {
        self.send(Call::DisableWatch(tx, peer, *key));
    }
}
