//! Resource table of locally hosted GATT servers.
//!
//! Owns every server, service, characteristic, and descriptor declared by
//! local applications, indexed by service UUID and by stack-assigned handle.
//! Entities are addressed by generated ids that are never reused, so a removed
//! entry cannot be reached through a stale index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::{Display, Formatter};

use tracing::{debug, info};

pub use {handle::*, prop::*};

use crate::conn::AppId;
use crate::{Error, Result, Uuid};

mod handle;
mod prop;

/// Local server identifier.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ServerId(u32);

impl Display for ServerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "server#{}", self.0)
    }
}

/// Local service identifier.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ServiceId(u32);

impl Display for ServiceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "service#{}", self.0)
    }
}

/// Service type ([Vol 3] Part G, Section 3.1).
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Eq,
    PartialEq,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
    serde::Deserialize,
    serde::Serialize,
)]
#[repr(u8)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[default]
    Primary = 0,
    Secondary = 1,
}

/// Caller-supplied service definition.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ServiceDesc {
    pub uuid: Option<Uuid>,
    #[serde(default, rename = "type")]
    pub typ: ServiceType,
    #[serde(default)]
    pub includes: Vec<Uuid>,
    #[serde(default)]
    pub characteristics: Vec<CharacteristicDesc>,
}

/// Caller-supplied characteristic definition.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CharacteristicDesc {
    pub uuid: Uuid,
    #[serde(default)]
    pub props: Prop,
    #[serde(default)]
    pub perms: Perm,
    #[serde(default)]
    pub value: Vec<u8>,
    #[serde(default)]
    pub descriptors: Vec<DescriptorDesc>,
}

/// Caller-supplied descriptor definition.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DescriptorDesc {
    pub uuid: Uuid,
    #[serde(default)]
    pub perms: Perm,
    #[serde(default)]
    pub value: Vec<u8>,
}

/// Reference to a characteristic or descriptor within its service. Indices
/// follow declaration order, which never changes after the service is added.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AttrRef {
    Characteristic(usize),
    Descriptor(usize, usize),
}

impl AttrRef {
    /// Returns the index of the characteristic that owns this attribute.
    #[inline]
    #[must_use]
    pub const fn characteristic(self) -> usize {
        match self {
            Self::Characteristic(c) | Self::Descriptor(c, _) => c,
        }
    }
}

/// Locally registered GATT application.
#[derive(Debug)]
pub struct Server {
    uuid: Uuid,
    app: Option<AppId>,
    services: BTreeSet<ServiceId>,
}

impl Server {
    /// Returns the caller-chosen application UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the stack-assigned application id, once known.
    #[inline]
    #[must_use]
    pub const fn app(&self) -> Option<AppId> {
        self.app
    }

    /// Returns the ids of all services owned by this server.
    #[inline]
    pub fn services(&self) -> impl Iterator<Item = ServiceId> + '_ {
        self.services.iter().copied()
    }
}

/// Service hosted by exactly one [`Server`].
#[derive(Clone, Debug)]
pub struct Service {
    server: ServerId,
    uuid: Uuid,
    typ: ServiceType,
    includes: Vec<Uuid>,
    chars: Vec<Characteristic>,
    hdl: Option<Handle>,
    started: bool,
}

impl Service {
    /// Returns the owning server.
    #[inline]
    #[must_use]
    pub const fn server(&self) -> ServerId {
        self.server
    }

    /// Returns the service UUID.
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Returns the service type.
    #[inline]
    #[must_use]
    pub const fn typ(&self) -> ServiceType {
        self.typ
    }

    /// Returns included service UUIDs.
    #[inline]
    #[must_use]
    pub fn includes(&self) -> &[Uuid] {
        &self.includes
    }

    /// Returns the characteristics in declaration order.
    #[inline]
    #[must_use]
    pub fn characteristics(&self) -> &[Characteristic] {
        &self.chars
    }

    /// Returns the stack-assigned service handle, once registered.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        self.hdl
    }

    /// Returns whether the stack has started the service.
    #[inline]
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }

    /// Returns all characteristics and descriptors in registration order:
    /// each characteristic followed by its descriptors.
    pub fn attrs(&self) -> impl Iterator<Item = AttrRef> + '_ {
        (self.chars.iter().enumerate()).flat_map(|(c, ch)| {
            std::iter::once(AttrRef::Characteristic(c))
                .chain((0..ch.descs.len()).map(move |d| AttrRef::Descriptor(c, d)))
        })
    }

    /// Returns the characteristic that owns `at`.
    #[inline]
    #[must_use]
    pub fn characteristic(&self, at: AttrRef) -> Option<&Characteristic> {
        self.chars.get(at.characteristic())
    }

    /// Returns the UUID of the referenced attribute.
    #[must_use]
    pub fn attr_uuid(&self, at: AttrRef) -> Option<Uuid> {
        match at {
            AttrRef::Characteristic(c) => self.chars.get(c).map(|ch| ch.uuid),
            AttrRef::Descriptor(c, d) => self.desc(c, d).map(|d| d.uuid),
        }
    }

    /// Returns the handle of the referenced attribute.
    #[must_use]
    pub fn attr_handle(&self, at: AttrRef) -> Option<Handle> {
        match at {
            AttrRef::Characteristic(c) => self.chars.get(c).and_then(|ch| ch.hdl),
            AttrRef::Descriptor(c, d) => self.desc(c, d).and_then(|d| d.hdl),
        }
    }

    /// Returns the value of the referenced attribute.
    #[must_use]
    pub fn value(&self, at: AttrRef) -> Option<&[u8]> {
        match at {
            AttrRef::Characteristic(c) => self.chars.get(c).map(|ch| ch.value.as_slice()),
            AttrRef::Descriptor(c, d) => self.desc(c, d).map(|d| d.value.as_slice()),
        }
    }

    #[inline]
    fn desc(&self, c: usize, d: usize) -> Option<&Descriptor> {
        self.chars.get(c).and_then(|ch| ch.descs.get(d))
    }

    fn slot_mut(&mut self, at: AttrRef) -> Option<(&mut Option<Handle>, &mut Vec<u8>)> {
        match at {
            AttrRef::Characteristic(c) => {
                (self.chars.get_mut(c)).map(|ch| (&mut ch.hdl, &mut ch.value))
            }
            AttrRef::Descriptor(c, d) => (self.chars.get_mut(c))
                .and_then(|ch| ch.descs.get_mut(d))
                .map(|d| (&mut d.hdl, &mut d.value)),
        }
    }
}

/// Characteristic of a local [`Service`].
#[derive(Clone, Debug)]
pub struct Characteristic {
    uuid: Uuid,
    props: Prop,
    perms: Perm,
    value: Vec<u8>,
    hdl: Option<Handle>,
    descs: Vec<Descriptor>,
}

impl Characteristic {
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    #[must_use]
    pub const fn props(&self) -> Prop {
        self.props
    }

    #[inline]
    #[must_use]
    pub const fn perms(&self) -> Perm {
        self.perms
    }

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        self.hdl
    }

    #[inline]
    #[must_use]
    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descs
    }

    /// Returns the index of the first descriptor with the specified UUID.
    #[inline]
    #[must_use]
    pub fn find_descriptor(&self, uuid: Uuid) -> Option<usize> {
        self.descs.iter().position(|d| d.uuid == uuid)
    }
}

/// Descriptor of a local [`Characteristic`].
#[derive(Clone, Debug)]
pub struct Descriptor {
    uuid: Uuid,
    perms: Perm,
    value: Vec<u8>,
    hdl: Option<Handle>,
}

impl Descriptor {
    #[inline]
    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    #[must_use]
    pub const fn perms(&self) -> Perm {
        self.perms
    }

    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Option<Handle> {
        self.hdl
    }
}

/// Handle-indexed table of all local servers and their services.
#[derive(Debug, Default)]
pub struct Table {
    servers: BTreeMap<ServerId, Server>,
    services: BTreeMap<ServiceId, Service>,
    by_uuid: HashMap<Uuid, ServiceId>,
    by_hdl: HashMap<Handle, (ServiceId, AttrRef)>,
    next_id: u32,
}

impl Table {
    /// Creates an empty table.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a server for the specified application UUID.
    pub fn add_server(&mut self, uuid: Uuid) -> Result<ServerId> {
        if self.servers.values().any(|s| s.uuid == uuid) {
            return Err(Error::AlreadyRegistered(uuid));
        }
        let id = ServerId(self.alloc_id());
        self.servers.insert(
            id,
            Server {
                uuid,
                app: None,
                services: BTreeSet::new(),
            },
        );
        debug!("Added {id} for app {uuid:?}");
        Ok(id)
    }

    /// Returns the specified server.
    #[inline]
    #[must_use]
    pub fn server(&self, id: ServerId) -> Option<&Server> {
        self.servers.get(&id)
    }

    /// Records the stack-assigned application id of a server.
    pub fn set_app(&mut self, id: ServerId, app: AppId) -> Result<()> {
        let s = self.servers.get_mut(&id).ok_or(Error::NotFound("server"))?;
        s.app = Some(app);
        Ok(())
    }

    /// Adds an unregistered service to a server.
    pub fn add_service(&mut self, server: ServerId, desc: ServiceDesc) -> Result<ServiceId> {
        let Some(uuid) = desc.uuid else {
            return Err(Error::InvalidParam("service UUID is required"));
        };
        if desc.characteristics.is_empty() {
            return Err(Error::InvalidParam("service has no characteristics"));
        }
        if self.by_uuid.contains_key(&uuid) {
            return Err(Error::InvalidParam("service UUID already exists"));
        }
        if !self.servers.contains_key(&server) {
            return Err(Error::NotFound("server"));
        }
        let chars = (desc.characteristics.into_iter())
            .map(|c| Characteristic {
                uuid: c.uuid,
                props: c.props,
                perms: c.perms,
                value: c.value,
                hdl: None,
                descs: (c.descriptors.into_iter())
                    .map(|d| Descriptor {
                        uuid: d.uuid,
                        perms: d.perms,
                        value: d.value,
                        hdl: None,
                    })
                    .collect(),
            })
            .collect();
        let id = ServiceId(self.alloc_id());
        self.services.insert(
            id,
            Service {
                server,
                uuid,
                typ: desc.typ,
                includes: desc.includes,
                chars,
                hdl: None,
                started: false,
            },
        );
        self.by_uuid.insert(uuid, id);
        if let Some(s) = self.servers.get_mut(&server) {
            s.services.insert(id);
        }
        debug!("Added {id} <{uuid:?}> to {server}");
        Ok(id)
    }

    /// Returns the specified service.
    #[inline]
    #[must_use]
    pub fn service(&self, id: ServiceId) -> Option<&Service> {
        self.services.get(&id)
    }

    /// Returns the service with the specified UUID.
    #[inline]
    #[must_use]
    pub fn service_by_uuid(&self, uuid: Uuid) -> Option<(ServiceId, &Service)> {
        let id = *self.by_uuid.get(&uuid)?;
        self.services.get(&id).map(|s| (id, s))
    }

    /// Returns an iterator over all services in creation order.
    #[inline]
    pub fn services(&self) -> impl Iterator<Item = (ServiceId, &Service)> {
        self.services.iter().map(|(&id, s)| (id, s))
    }

    /// Records the stack-assigned service handle.
    pub fn set_service_handle(&mut self, id: ServiceId, hdl: Handle) -> Result<()> {
        let s = self.services.get_mut(&id).ok_or(Error::NotFound("service"))?;
        s.hdl = Some(hdl);
        Ok(())
    }

    /// Marks the service as started.
    pub fn set_started(&mut self, id: ServiceId) -> Result<()> {
        let s = self.services.get_mut(&id).ok_or(Error::NotFound("service"))?;
        s.started = true;
        Ok(())
    }

    /// Records a stack-assigned characteristic or descriptor handle. Handles
    /// are unique across the whole table.
    pub fn assign_handle(&mut self, id: ServiceId, at: AttrRef, hdl: Handle) -> Result<()> {
        if let Some(&(owner, prev)) = self.by_hdl.get(&hdl) {
            if (owner, prev) != (id, at) {
                return Err(Error::InvalidHandle(hdl));
            }
        }
        let s = self.services.get_mut(&id).ok_or(Error::NotFound("service"))?;
        let (slot, _) = s.slot_mut(at).ok_or(Error::NotFound("attribute"))?;
        if let Some(old) = slot.replace(hdl) {
            self.by_hdl.remove(&old);
        }
        self.by_hdl.insert(hdl, (id, at));
        Ok(())
    }

    /// Returns the service and attribute that own the specified handle.
    #[inline]
    pub fn lookup_handle(&self, hdl: Handle) -> Result<(ServiceId, AttrRef)> {
        self.by_hdl.get(&hdl).copied().ok_or(Error::InvalidHandle(hdl))
    }

    /// Resolves a service/characteristic[/descriptor] UUID path.
    pub fn lookup_path(
        &self,
        svc: Uuid,
        chr: Uuid,
        desc: Option<Uuid>,
    ) -> Result<(ServiceId, AttrRef)> {
        let (id, s) = self.service_by_uuid(svc).ok_or(Error::InvalidService(svc))?;
        let c = (s.chars.iter().position(|c| c.uuid == chr))
            .ok_or(Error::InvalidCharacteristic(chr))?;
        let Some(desc) = desc else {
            return Ok((id, AttrRef::Characteristic(c)));
        };
        let d = s.chars[c].find_descriptor(desc).ok_or(Error::InvalidDescriptor(desc))?;
        Ok((id, AttrRef::Descriptor(c, d)))
    }

    /// Replaces the value of a characteristic or descriptor.
    pub fn set_value(&mut self, id: ServiceId, at: AttrRef, v: Vec<u8>) -> Result<()> {
        let s = self.services.get_mut(&id).ok_or(Error::NotFound("service"))?;
        let (_, val) = s.slot_mut(at).ok_or(Error::NotFound("attribute"))?;
        *val = v;
        Ok(())
    }

    /// Removes a service and all of its handles. Removing an unknown service
    /// is a no-op.
    pub fn remove_service(&mut self, id: ServiceId) -> Option<Service> {
        let s = self.services.remove(&id)?;
        self.by_uuid.remove(&s.uuid);
        for hdl in s.attrs().filter_map(|at| s.attr_handle(at)) {
            self.by_hdl.remove(&hdl);
        }
        if let Some(srv) = self.servers.get_mut(&s.server) {
            srv.services.remove(&id);
        }
        debug!("Removed {id} <{:?}>", s.uuid);
        Some(s)
    }

    /// Removes a server and all of its services. Removing an unknown server is
    /// a no-op.
    pub fn remove_server(&mut self, id: ServerId) -> Option<Server> {
        let srv = self.servers.get(&id)?;
        let svcs: Vec<_> = srv.services().collect();
        for svc in svcs {
            self.remove_service(svc);
        }
        let srv = self.servers.remove(&id);
        debug!("Removed {id}");
        srv
    }

    /// Logs table contents.
    pub fn dump(&self) {
        fn hdl(h: Option<Handle>) -> String {
            h.map_or_else(|| "------".to_owned(), |h| format!("{:#06X}", u16::from(h)))
        }
        info!("GATT resource table:");
        for (id, srv) in &self.servers {
            info!("{id} <{:?}> app={:?}", srv.uuid, srv.app);
            for s in srv.services().filter_map(|svc| self.services.get(&svc)) {
                let state = if s.started { "started" } else { "pending" };
                info!("|__ [{}] {:?} Service <{:?}> ({state})", hdl(s.hdl), s.typ, s.uuid);
                for c in &s.chars {
                    info!("    |__ [{}] Characteristic <{:?}> {:?}", hdl(c.hdl), c.uuid, c.props);
                    for d in &c.descs {
                        info!("        |__ [{}] Descriptor <{:?}>", hdl(d.hdl), d.uuid);
                    }
                }
            }
        }
    }

    fn alloc_id(&mut self) -> u32 {
        self.next_id = self.next_id.wrapping_add(1);
        self.next_id
    }
}
