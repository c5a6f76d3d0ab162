//! Discovered remote service listings.

use std::collections::HashMap;

use tracing::debug;

use crate::table::{Handle, Prop};
use crate::{Addr, Error, Result, Uuid};

/// Service discovered on a remote device.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteService {
    pub uuid: Uuid,
    #[serde(default)]
    pub handle: Option<Handle>,
    #[serde(default)]
    pub characteristics: Vec<RemoteCharacteristic>,
}

/// Characteristic discovered on a remote device.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteCharacteristic {
    pub uuid: Uuid,
    pub handle: Handle,
    #[serde(default)]
    pub props: Prop,
    #[serde(default)]
    pub descriptors: Vec<RemoteDescriptor>,
}

/// Descriptor discovered on a remote device.
#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct RemoteDescriptor {
    pub uuid: Uuid,
    pub handle: Handle,
}

/// Remote attribute named by a handle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteAttr {
    pub service: Uuid,
    pub characteristic: Uuid,
    /// Set if the handle names a descriptor of `characteristic`.
    pub descriptor: Option<Uuid>,
}

/// Latest service listing of every device that completed discovery.
#[derive(Debug, Default)]
pub struct RemoteDb(HashMap<Addr, Vec<RemoteService>>);

impl RemoteDb {
    /// Creates an empty cache.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the listing of a device.
    pub fn update(&mut self, addr: Addr, svcs: Vec<RemoteService>) {
        debug!("Discovered {} service(s) on {addr}", svcs.len());
        self.0.insert(addr, svcs);
    }

    /// Returns the listing of a device.
    #[inline]
    #[must_use]
    pub fn services(&self, addr: Addr) -> Option<&[RemoteService]> {
        self.0.get(&addr).map(Vec::as_slice)
    }

    /// Resolves a service/characteristic[/descriptor] UUID path on a device.
    pub fn resolve_path(
        &self,
        addr: Addr,
        svc: Uuid,
        chr: Uuid,
        desc: Option<Uuid>,
    ) -> Result<&RemoteCharacteristic> {
        let svcs = self.services(addr).ok_or(Error::NotAvailable(addr.into()))?;
        let s = (svcs.iter().find(|s| s.uuid == svc)).ok_or(Error::InvalidService(svc))?;
        let c = (s.characteristics.iter().find(|c| c.uuid == chr))
            .ok_or(Error::InvalidCharacteristic(chr))?;
        if let Some(d) = desc {
            if !c.descriptors.iter().any(|x| x.uuid == d) {
                return Err(Error::InvalidDescriptor(d));
            }
        }
        Ok(c)
    }

    /// Resolves a characteristic or descriptor handle on a device.
    pub fn resolve_handle(&self, addr: Addr, hdl: Handle) -> Result<RemoteAttr> {
        let svcs = self.services(addr).ok_or(Error::NotAvailable(addr.into()))?;
        for s in svcs {
            for c in &s.characteristics {
                let descriptor = if c.handle == hdl {
                    None
                } else if let Some(d) = c.descriptors.iter().find(|d| d.handle == hdl) {
                    Some(d.uuid)
                } else {
                    continue;
                };
                return Ok(RemoteAttr {
                    service: s.uuid,
                    characteristic: c.uuid,
                    descriptor,
                });
            }
        }
        Err(Error::InvalidHandle(hdl))
    }
}
