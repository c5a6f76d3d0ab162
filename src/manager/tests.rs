use std::collections::HashSet;

use matches::assert_matches;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

use super::*;
use crate::remote::{RemoteCharacteristic, RemoteDescriptor};
use crate::stack::mock::{Call, MockStack};
use crate::table::{CharacteristicDesc, DescriptorDesc, Handle, Perm, Prop};
use crate::target::TargetSpec;

const APP: Uuid = Uuid::from_u16(0xA000);
const U1: Uuid = Uuid::from_u16(0x180D);
const U2: Uuid = Uuid::from_u16(0x180F);
const C1: Uuid = Uuid::from_u16(0x2A37);
const C2: Uuid = Uuid::from_u16(0x2A38);
const CCC: Uuid = Uuid::from_u16(0x2902);

fn dev() -> Addr {
    "AA:BB:CC:DD:EE:FF".parse().unwrap()
}

fn h(v: u16) -> Handle {
    Handle::new(v).unwrap()
}

fn chr(uuid: Uuid, value: &[u8], descs: &[Uuid]) -> CharacteristicDesc {
    CharacteristicDesc {
        uuid,
        props: Prop::READ | Prop::WRITE | Prop::NOTIFY,
        perms: Perm::READ | Perm::WRITE,
        value: value.to_vec(),
        descriptors: (descs.iter())
            .map(|&uuid| DescriptorDesc {
                uuid,
                perms: Perm::READ,
                value: vec![0, 0],
            })
            .collect(),
    }
}

fn svc(uuid: Uuid, chars: Vec<CharacteristicDesc>) -> ServiceDesc {
    ServiceDesc {
        uuid: Some(uuid),
        characteristics: chars,
        ..ServiceDesc::default()
    }
}

/// Manager connected to a recording stack.
struct Harness {
    m: Manager<MockStack>,
    calls: UnboundedReceiver<Call>,
    next_hdl: u16,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(cfg: Config) -> Self {
        let (stack, calls) = MockStack::new();
        Self {
            m: Manager::new(stack, cfg),
            calls,
            next_hdl: 0,
        }
    }

    /// Returns the next outbound stack call.
    fn call(&mut self) -> Call {
        self.calls.try_recv().expect("no stack call")
    }

    fn no_calls(&mut self) {
        assert_matches!(self.calls.try_recv(), Err(_));
    }

    fn complete(&mut self, tx: Tx, result: std::result::Result<Outcome, StackError>) {
        self.m.on_stack_event(StackEvent::Complete { tx, result });
    }

    fn hdl(&mut self) -> Outcome {
        self.next_hdl += 1;
        Outcome::Handle(h(self.next_hdl))
    }

    fn open(&mut self) -> ServerId {
        let (id, mut reply) = self.m.open_server(APP).unwrap();
        let c = self.call();
        assert_eq!(c, Call::AddApplication(c.tx(), APP));
        self.complete(c.tx(), Ok(Outcome::App(AppId(7))));
        assert_eq!(reply.try_take(), Some(Ok(AppId(7))));
        id
    }

    /// Registers a service, completing every step successfully.
    fn register(&mut self, srv: ServerId, desc: ServiceDesc) -> ServiceId {
        let (id, mut reply) = self.m.add_service(srv, desc).unwrap();
        loop {
            let c = self.call();
            let out = match c {
                Call::StartService(..) => Outcome::Done,
                Call::AddService(..) | Call::AddCharacteristic(..) | Call::AddDescriptor(..) => {
                    self.hdl()
                }
                c => panic!("unexpected {c:?}"),
            };
            self.complete(c.tx(), Ok(out));
            if let Some(r) = reply.try_take() {
                assert_eq!(r, Ok(id));
                return id;
            }
        }
    }

    fn observe(
        &mut self,
        req: &Request,
    ) -> (SubscriptionId, Reply<()>, UnboundedReceiver<ValueChanged>) {
        let (tx, rx) = unbounded_channel();
        let (id, reply) = self.m.observe(req, tx).unwrap();
        (id, reply, rx)
    }

    /// Installs a remote listing for `dev()` through service discovery.
    fn discover(&mut self) {
        let mut reply = self.m.discover_services(dev());
        let c = self.call();
        assert_eq!(c, Call::Discover(c.tx(), Peer::Addr(dev())));
        let listing = vec![RemoteService {
            uuid: U1,
            handle: Handle::new(0x10),
            characteristics: vec![
                RemoteCharacteristic {
                    uuid: C1,
                    handle: h(0x12),
                    props: Prop::READ | Prop::NOTIFY,
                    descriptors: vec![RemoteDescriptor {
                        uuid: CCC,
                        handle: h(0x13),
                    }],
                },
                RemoteCharacteristic {
                    uuid: C2,
                    handle: h(0x15),
                    props: Prop::READ | Prop::NOTIFY,
                    descriptors: vec![],
                },
            ],
        }];
        self.complete(c.tx(), Ok(Outcome::Services(listing)));
        assert_matches!(reply.try_take(), Some(Ok(v)) if v.len() == 1);
    }
}

fn remote_c1() -> Request {
    Request::remote(dev(), TargetSpec::path(U1, C1))
}

fn change(c: Uuid, v: u8) -> ValueChanged {
    ValueChanged {
        addr: Some(dev()),
        service: U1,
        characteristic: c,
        handle: None,
        value: vec![v],
    }
}

#[test]
fn register_and_read() {
    let mut t = Harness::new();
    let srv = t.open();
    let desc = svc(U1, vec![chr(C1, b"init", &[])]);
    let (id, mut reply) = t.m.add_service(srv, desc).unwrap();

    let c = t.call();
    assert_eq!(c, Call::AddService(c.tx(), AppId(7), U1));
    t.complete(c.tx(), Ok(Outcome::Handle(h(1))));
    let c = t.call();
    assert_eq!(c, Call::AddCharacteristic(c.tx(), h(1), C1));
    t.no_calls();
    t.complete(c.tx(), Ok(Outcome::Handle(h(2))));
    let c = t.call();
    assert_eq!(c, Call::StartService(c.tx(), h(1)));
    assert!(reply.try_take().is_none());
    assert!(!t.m.service(id).unwrap().is_started());
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(reply.try_take(), Some(Ok(id)));
    assert!(t.m.service(id).unwrap().is_started());

    let mut r = t.m.read(&Request::local(TargetSpec::path(U1, C1))).unwrap();
    assert_eq!(r.try_take(), Some(Ok(vec![b"init".to_vec()])));
    let mut r = t.m.read(&Request::local(TargetSpec::instance(2))).unwrap();
    assert_eq!(r.try_take(), Some(Ok(vec![b"init".to_vec()])));
    t.no_calls();
    assert_eq!(t.m.pending(), 0);
}

#[test]
fn descriptor_order() {
    let mut t = Harness::new();
    let srv = t.open();
    let desc = svc(U1, vec![chr(C1, &[], &[CCC]), chr(C2, &[], &[])]);
    let _ = t.m.add_service(srv, desc).unwrap();
    let mut order = Vec::new();
    loop {
        let c = t.call();
        let out = match c {
            Call::AddService(..) => Outcome::Handle(h(1)),
            Call::AddCharacteristic(_, _, u) | Call::AddDescriptor(_, _, u) => {
                order.push(u);
                t.hdl()
            }
            Call::StartService(..) => {
                t.complete(c.tx(), Ok(Outcome::Done));
                break;
            }
            c => panic!("unexpected {c:?}"),
        };
        t.complete(c.tx(), Ok(out));
        // One step in flight at a time
        t.no_calls();
    }
    assert_eq!(order, [C1, CCC, C2]);
}

#[test]
fn zero_characteristics() {
    let mut t = Harness::new();
    let srv = t.open();
    assert_matches!(t.m.add_service(srv, svc(U1, vec![])), Err(Error::InvalidParam(_)));
    assert!(t.m.services().next().is_none());
    t.no_calls();
    assert_eq!(t.m.pending(), 0);
}

#[test]
fn failure_at_each_step() {
    // AddService, AddCharacteristic, AddDescriptor, StartService
    for k in 0..4 {
        let mut t = Harness::new();
        let srv = t.open();
        let other = t.register(srv, svc(U2, vec![chr(C2, &[], &[])]));
        let before: Vec<_> = t.m.services().map(|(id, _)| id).collect();

        let desc = svc(U1, vec![chr(C1, &[], &[CCC])]);
        let (id, mut reply) = t.m.add_service(srv, desc).unwrap();
        for i in 0..=k {
            let c = t.call();
            if i < k {
                let out = if matches!(c, Call::StartService(..)) {
                    Outcome::Done
                } else {
                    t.hdl()
                };
                t.complete(c.tx(), Ok(out));
            } else {
                t.complete(c.tx(), Err(StackError(0x85)));
            }
        }
        assert_eq!(
            reply.try_take(),
            Some(Err(Error::StackOperationFailed(StackError(0x85))))
        );
        // Stack drops a partially declared service
        if k > 0 {
            let c = t.call();
            assert_eq!(c, Call::RemoveService(c.tx(), h(3)));
            t.complete(c.tx(), Err(StackError(0x85)));
        }
        t.no_calls();
        assert_eq!(t.m.pending(), 0);
        assert!(t.m.service(id).is_none());
        assert_eq!(t.m.services().map(|(id, _)| id).collect::<Vec<_>>(), before);
        assert!(t.m.table().service_by_uuid(U1).is_none());
        // Handles of the failed service are released
        for v in 3..=t.next_hdl {
            assert_matches!(t.m.table().lookup_handle(h(v)), Err(Error::InvalidHandle(_)));
        }
        assert!(t.m.service(other).unwrap().is_started());
        assert!(t.m.table().server(srv).is_some());
    }
}

#[test]
fn concurrent_registration() {
    let mut t = Harness::new();
    let srv = t.open();
    let (a, mut ra) = t.m.add_service(srv, svc(U1, vec![chr(C1, &[], &[])])).unwrap();
    let (b, mut rb) = t.m.add_service(srv, svc(U2, vec![chr(C2, &[], &[])])).unwrap();
    let (ca, cb) = (t.call(), t.call());
    assert_eq!(ca, Call::AddService(ca.tx(), AppId(7), U1));
    assert_eq!(cb, Call::AddService(cb.tx(), AppId(7), U2));

    // Completions interleave across services
    t.complete(cb.tx(), Ok(Outcome::Handle(h(10))));
    t.complete(ca.tx(), Ok(Outcome::Handle(h(1))));
    let (cb, ca) = (t.call(), t.call());
    assert_eq!(cb, Call::AddCharacteristic(cb.tx(), h(10), C2));
    assert_eq!(ca, Call::AddCharacteristic(ca.tx(), h(1), C1));
    t.complete(cb.tx(), Ok(Outcome::Handle(h(11))));
    // Stack hands out a handle that is already taken
    t.complete(ca.tx(), Ok(Outcome::Handle(h(11))));
    assert_matches!(ra.try_take(), Some(Err(Error::InvalidHandle(_))));
    assert!(t.m.service(a).is_none());

    let (cb, ca) = (t.call(), t.call());
    assert_eq!(cb, Call::StartService(cb.tx(), h(10)));
    assert_eq!(ca, Call::RemoveService(ca.tx(), h(1)));
    t.complete(ca.tx(), Ok(Outcome::Done));
    t.complete(cb.tx(), Ok(Outcome::Done));
    assert_eq!(rb.try_take(), Some(Ok(b)));
    t.no_calls();
    assert_eq!(t.m.table().lookup_handle(h(11)).unwrap().0, b);
}

#[test]
fn handles_injective() {
    let mut t = Harness::new();
    let srv = t.open();
    let mut ids = Vec::new();
    for (i, u) in [U1, U2, Uuid::from_u16(0x1810)].into_iter().enumerate() {
        let chars = (0..=i)
            .map(|j| chr(Uuid::from_u16(0x2A00 + j as u16), &[], &[CCC]))
            .collect();
        ids.push(t.register(srv, svc(u, chars)));
    }
    let mut seen = HashSet::new();
    for (id, s) in t.m.services() {
        for at in s.attrs() {
            let hdl = s.attr_handle(at).unwrap();
            assert!(seen.insert(hdl));
            assert_eq!(t.m.table().lookup_handle(hdl).unwrap(), (id, at));
        }
    }
    assert_eq!(seen.len(), 2 + 4 + 6);
}

#[test]
fn unknown_instance_id() {
    let mut t = Harness::new();
    let srv = t.open();
    t.register(srv, svc(U1, vec![chr(C1, &[], &[])]));
    let req = Request::local(TargetSpec::instance("999"));
    assert_matches!(t.m.read(&req), Err(Error::InvalidHandle(h)) if u16::from(h) == 999);
    assert_matches!(t.m.write(&req, vec![vec![1]]), Err(Error::InvalidHandle(_)));
    let req = Request::local(TargetSpec::path(U2, C1));
    assert_eq!(t.m.read(&req).err(), Some(Error::InvalidService(U2)));
    t.no_calls();
}

#[test]
fn local_write_read() {
    let mut t = Harness::new();
    let srv = t.open();
    t.register(srv, svc(U1, vec![chr(C1, &[0], &[CCC]), chr(C2, &[0], &[])]));
    let path = Request::local(TargetSpec::path(U1, C1));
    let (_, mut reply, mut rx) = t.observe(&path);
    assert_eq!(reply.try_take(), Some(Ok(())));

    let mut w = t.m.write(&path, vec![vec![1, 2, 3]]).unwrap();
    assert_eq!(w.try_take(), Some(Ok(())));
    let mut r = t.m.read(&path).unwrap();
    assert_eq!(r.try_take(), Some(Ok(vec![vec![1, 2, 3]])));
    let v = rx.try_recv().unwrap();
    assert_eq!((v.addr, v.characteristic, v.value), (None, C1, vec![1, 2, 3]));

    // Descriptor writes are not value changes
    let ccc = Request::local(TargetSpec {
        descriptor: Some(CCC),
        ..TargetSpec::path(U1, C1)
    });
    t.m.write(&ccc, vec![vec![1, 0]]).unwrap().try_take().unwrap().unwrap();
    assert!(rx.try_recv().is_err());
    t.no_calls();
}

#[test]
fn batch_all_or_nothing() {
    let mut t = Harness::new();
    let srv = t.open();
    t.register(srv, svc(U1, vec![chr(C1, &[1], &[]), chr(C2, &[2], &[])]));
    let batch = |chars: Vec<Uuid>| {
        Request::local(TargetSpec {
            service: Some(U1),
            characteristics: chars,
            ..TargetSpec::default()
        })
    };
    let bad = batch(vec![C1, CCC]);
    assert_eq!(
        t.m.write(&bad, vec![vec![9], vec![9]]).err(),
        Some(Error::InvalidCharacteristic(CCC))
    );
    assert_matches!(t.m.write(&batch(vec![C1, C2]), vec![vec![9]]), Err(Error::InvalidParam(_)));
    let mut r = t.m.read(&batch(vec![C1, C2])).unwrap();
    assert_eq!(r.try_take(), Some(Ok(vec![vec![1], vec![2]])));

    t.discover();
    let bad = Request::remote(dev(), bad.target);
    assert_eq!(t.m.read(&bad).err(), Some(Error::InvalidCharacteristic(CCC)));
    t.no_calls();
    let good = Request::remote(dev(), batch(vec![C1, C2]).target);
    let _ = t.m.read(&good).unwrap();
    let c = t.call();
    assert_matches!(
        c,
        Call::Read(_, _, ReadOp::Characteristics { chars, .. }) if chars[..] == [C1, C2]
    );
}

#[test]
fn two_observers() {
    let mut t = Harness::new();
    t.discover();
    let (s1, mut r1, mut rx1) = t.observe(&remote_c1());
    let (s2, mut r2, mut rx2) = t.observe(&remote_c1());

    let c = t.call();
    let key = WatchKey {
        addr: Some(dev()),
        service: U1,
        id: CharId::Uuid(C1),
    };
    assert_eq!(c, Call::EnableWatch(c.tx(), Peer::Addr(dev()), key));
    t.no_calls();
    assert!(r1.try_take().is_none());
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(r1.try_take(), Some(Ok(())));
    assert_eq!(r2.try_take(), Some(Ok(())));
    assert_eq!(t.m.watches().ref_count(&key), 2);

    t.m.on_stack_event(StackEvent::ValueChanged(change(C1, 5)));
    assert_eq!(rx1.try_recv().unwrap().value, [5]);
    assert_eq!(rx2.try_recv().unwrap().value, [5]);
    // Nobody watches C2
    t.m.on_stack_event(StackEvent::ValueChanged(change(C2, 6)));
    assert!(rx1.try_recv().is_err());

    assert!(t.m.release(s1));
    t.no_calls();
    assert!(!t.m.release(s1));
    assert_eq!(t.m.watches().ref_count(&key), 1);
    t.no_calls();

    assert!(t.m.release(s2));
    let c = t.call();
    assert_eq!(c, Call::DisableWatch(c.tx(), Peer::Addr(dev()), key));
    assert!(!t.m.release(s2));
    t.no_calls();
    t.complete(c.tx(), Err(StackError(0x0E)));
    assert_eq!(t.m.pending(), 0);
    assert_eq!(t.m.watches().live(), 0);
}

#[test]
fn enable_failure() {
    let mut t = Harness::new();
    t.discover();
    let (_, mut r1, _rx1) = t.observe(&remote_c1());
    let (_, mut r2, _rx2) = t.observe(&remote_c1());
    let c = t.call();
    t.complete(c.tx(), Err(StackError(0x03)));
    assert_eq!(r1.try_take(), Some(Err(StackError(0x03).into())));
    assert_eq!(r2.try_take(), Some(Err(StackError(0x03).into())));
    assert_eq!(t.m.watches().subscriptions(), 0);
    // Never enabled, nothing to disable
    t.no_calls();

    let (_, _, _rx) = t.observe(&remote_c1());
    assert_matches!(t.call(), Call::EnableWatch(..));
}

#[test]
fn failure_keeps_registered_watch() {
    let mut t = Harness::new();
    t.discover();
    let (s1, _, mut rx1) = t.observe(&remote_c1());
    let c = t.call();
    t.complete(c.tx(), Ok(Outcome::Done));

    // Batch joins the registered C1 watch and creates a C2 watch that fails
    let batch = Request::remote(
        dev(),
        TargetSpec {
            service: Some(U1),
            characteristics: vec![C1, C2],
            ..TargetSpec::default()
        },
    );
    let (s2, mut r2, _rx2) = t.observe(&batch);
    let c = t.call();
    assert_matches!(c, Call::EnableWatch(_, _, k) if k.id == CharId::Uuid(C2));
    t.complete(c.tx(), Err(StackError(0x03)));
    assert_matches!(r2.try_take(), Some(Err(Error::StackOperationFailed(_))));
    assert!(!t.m.release(s2));
    t.no_calls();

    t.m.on_stack_event(StackEvent::ValueChanged(change(C1, 1)));
    assert_eq!(rx1.try_recv().unwrap().value, [1]);
    assert!(t.m.release(s1));
    assert_matches!(t.call(), Call::DisableWatch(_, _, k) if k.id == CharId::Uuid(C1));
}

#[test]
fn release_before_enable() {
    let mut t = Harness::new();
    t.discover();
    let (s, mut reply, _rx) = t.observe(&remote_c1());
    let c = t.call();
    assert!(t.m.release(s));
    t.no_calls();
    assert_eq!(reply.try_take(), Some(Err(Error::NotAvailable(Absent::Stack))));

    // The stack enabled it anyway
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_matches!(t.call(), Call::DisableWatch(..));
    t.no_calls();
}

#[test]
fn dropped_sink_releases() {
    let mut t = Harness::new();
    t.discover();
    let (_, _, rx) = t.observe(&remote_c1());
    let c = t.call();
    t.complete(c.tx(), Ok(Outcome::Done));
    drop(rx);
    t.m.on_stack_event(StackEvent::ValueChanged(change(C1, 1)));
    assert_matches!(t.call(), Call::DisableWatch(..));
    assert_eq!(t.m.watches().subscriptions(), 0);
}

#[test]
fn observe_validation() {
    let mut t = Harness::new();
    let (tx, _rx) = unbounded_channel();
    assert_matches!(
        t.m.observe(&remote_c1(), tx.clone()),
        Err(Error::NotAvailable(Absent::Device(_)))
    );
    t.discover();
    let req = Request::remote(dev(), TargetSpec::path(U1, U2));
    let err = t.m.observe(&req, tx.clone()).err();
    assert_eq!(err, Some(Error::InvalidCharacteristic(U2)));
    let req = Request::remote(dev(), TargetSpec::path(U2, C1));
    let err = t.m.observe(&req, tx.clone()).err();
    assert_eq!(err, Some(Error::InvalidService(U2)));
    let req = Request::remote(
        dev(),
        TargetSpec {
            descriptor: Some(CCC),
            ..TargetSpec::path(U1, C1)
        },
    );
    assert_matches!(t.m.observe(&req, tx), Err(Error::InvalidParam(_)));
    t.no_calls();
    assert_eq!(t.m.watches().live(), 0);
}

#[test]
fn observe_by_handle() {
    let mut t = Harness::new();
    t.discover();
    let (_, mut reply, mut rx) = t.observe(&Request::remote(dev(), TargetSpec::instance(0x12)));
    let c = t.call();
    assert_matches!(
        c,
        Call::EnableWatch(_, _, k) if k.service == U1 && matches!(k.id, CharId::Handle(_))
    );
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(reply.try_take(), Some(Ok(())));
    let v = ValueChanged {
        handle: Some(h(0x12)),
        ..change(C1, 3)
    };
    t.m.on_stack_event(StackEvent::ValueChanged(v));
    assert_eq!(rx.try_recv().unwrap().value, [3]);
}

#[test]
fn remote_descriptor_handle() {
    let mut t = Harness::new();
    t.discover();
    let (tx, _rx) = unbounded_channel();
    let req = Request::remote(dev(), TargetSpec::instance(0x13));
    assert_matches!(t.m.observe(&req, tx), Err(Error::InvalidParam(_)));
    t.no_calls();
    assert_eq!(t.m.watches().live(), 0);
    assert_eq!(t.m.pending(), 0);

    // Descriptor handles remain readable
    let _ = t.m.read(&req).unwrap();
    assert_matches!(t.call(), Call::Read(_, _, ReadOp::Handle(hdl)) if hdl == h(0x13));
}

#[test]
fn watch_limit() {
    let mut t = Harness::with_config(Config {
        max_watches_per_device: Some(1),
        ..Config::default()
    });
    t.discover();
    let (_, _, _rx1) = t.observe(&remote_c1());
    assert_matches!(t.call(), Call::EnableWatch(..));
    // Joining an existing watch does not count against the limit
    let (_, _, _rx2) = t.observe(&remote_c1());
    let (tx, _rx) = unbounded_channel();
    let req = Request::remote(dev(), TargetSpec::path(U1, C2));
    assert_matches!(t.m.observe(&req, tx), Err(Error::NotAvailable(Absent::Device(_))));
    t.no_calls();
}

#[test]
fn remote_addressing() {
    let mut t = Harness::new();
    t.discover();
    let _ = t.m.read(&remote_c1()).unwrap();
    assert_matches!(t.call(), Call::Read(_, Peer::Addr(_), _));

    let mut conn = t.m.connect(AppId(3), dev());
    let c = t.call();
    assert_eq!(c, Call::Connect(c.tx(), AppId(3), dev()));
    t.complete(c.tx(), Ok(Outcome::Conn(ConnId(30))));
    assert_eq!(conn.try_take(), Some(Ok(ConnId(30))));

    let mut r = t.m.read(&remote_c1()).unwrap();
    let c = t.call();
    assert_matches!(c, Call::Read(_, Peer::Conn(ConnId(30)), _));
    t.complete(c.tx(), Ok(Outcome::Values(vec![vec![0x64]])));
    assert_eq!(r.try_take(), Some(Ok(vec![vec![0x64]])));

    let by_app = Request {
        app_id: Some(AppId(3)),
        ..Request::local(TargetSpec::instance(0x13))
    };
    let mut w = t.m.write(&by_app, vec![vec![1, 0]]).unwrap();
    let c = t.call();
    assert_eq!(
        c,
        Call::Write(c.tx(), Peer::Conn(ConnId(30)), WriteOp::Handle(h(0x13), vec![1, 0]))
    );
    t.complete(c.tx(), Err(StackError(0x05)));
    assert_eq!(w.try_take(), Some(Err(Error::StackOperationFailed(StackError(0x05)))));

    let mut d = t.m.disconnect(AppId(3)).unwrap();
    let c = t.call();
    assert_eq!(c, Call::Disconnect(c.tx(), ConnId(30)));
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(d.try_take(), Some(Ok(())));
    assert_matches!(t.m.read(&by_app), Err(Error::NotAvailable(Absent::App(AppId(3)))));
    assert_matches!(t.m.disconnect(AppId(3)), Err(Error::NotAvailable(_)));
}

#[test]
fn link_loss_unbinds() {
    let mut t = Harness::new();
    let _ = t.m.connect(AppId(1), dev());
    let c = t.call();
    t.complete(c.tx(), Ok(Outcome::Conn(ConnId(9))));
    assert!(t.m.conns().lookup(AppId(1)).is_ok());
    t.m.on_stack_event(StackEvent::Disconnected { conn: ConnId(9) });
    assert!(t.m.conns().lookup(AppId(1)).is_err());
    assert_eq!(t.m.conns().conn_for(dev()), None);
}

#[test]
fn server_lifecycle() {
    let mut t = Harness::new();
    let (srv, mut reply) = t.m.open_server(APP).unwrap();
    assert_eq!(t.m.open_server(APP).err(), Some(Error::AlreadyRegistered(APP)));
    // Application id is not known yet
    assert_matches!(
        t.m.add_service(srv, svc(U1, vec![chr(C1, &[], &[])])),
        Err(Error::NotAvailable(Absent::Server(_)))
    );
    let c = t.call();
    t.complete(c.tx(), Err(StackError(0x01)));
    assert_matches!(reply.try_take(), Some(Err(Error::StackOperationFailed(_))));
    assert!(t.m.table().server(srv).is_none());

    let srv = t.open();
    let a = t.register(srv, svc(U1, vec![chr(C1, &[], &[])]));
    let b = t.register(srv, svc(U2, vec![chr(C2, &[], &[])]));

    let mut r = t.m.remove_service(a);
    let c = t.call();
    assert_eq!(c, Call::RemoveService(c.tx(), h(1)));
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(r.try_take(), Some(Ok(())));
    assert!(t.m.service(a).is_none());
    assert!(t.m.table().server(srv).is_some());
    t.no_calls();

    // Removing the last service closes the server
    let _ = t.m.remove_service(b);
    let c = t.call();
    t.complete(c.tx(), Ok(Outcome::Done));
    assert_eq!(t.call(), Call::RemoveApplication(Tx(c.tx().0 + 1), AppId(7)));
    assert!(t.m.table().server(srv).is_none());
    assert_eq!(t.m.remove_service(b).try_take(), Some(Ok(())));
    assert!(!t.m.close_server(srv));
}

#[test]
fn remove_failure_keeps_service() {
    let mut t = Harness::new();
    let srv = t.open();
    let id = t.register(srv, svc(U1, vec![chr(C1, &[], &[])]));
    let mut r = t.m.remove_service(id);
    let c = t.call();
    t.complete(c.tx(), Err(StackError(0x81)));
    assert_eq!(r.try_take(), Some(Err(StackError(0x81).into())));
    assert!(t.m.service(id).is_some());
}

#[test]
fn close_during_registration() {
    let mut t = Harness::new();
    let srv = t.open();
    let (id, mut reply) = t.m.add_service(srv, svc(U1, vec![chr(C1, &[], &[])])).unwrap();
    let c = t.call();
    assert!(t.m.close_server(srv));
    assert_matches!(t.call(), Call::RemoveApplication(_, AppId(7)));
    t.complete(c.tx(), Ok(Outcome::Handle(h(1))));
    assert_matches!(reply.try_take(), Some(Err(Error::NotFound(_))));
    assert!(t.m.service(id).is_none());
    t.no_calls();
}

#[test]
fn unknown_completion() {
    let mut t = Harness::new();
    t.complete(Tx(1234), Ok(Outcome::Done));
    t.no_calls();
    assert_eq!(t.m.pending(), 0);
}

#[tokio::test]
async fn reply_after_drop() {
    let mut t = Harness::new();
    let reply = t.m.connect(AppId(1), dev());
    drop(t);
    assert_eq!(reply.await, Err(Error::NotAvailable(Absent::Stack)));
}
