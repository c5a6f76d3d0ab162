//! Inbound target descriptions.
//!
//! A request names its target in exactly one of two ways: a UUID path
//! (`service` + `characteristic` [+ `descriptor`], or a `characteristics` /
//! `descriptors` batch under one service), or a stack-assigned `instanceId`.

use smallvec::SmallVec;

use crate::conn::AppId;
use crate::stack::Uuids;
use crate::table::Handle;
use crate::{Addr, Error, Result, Uuid};

/// Target description as supplied by a caller.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TargetSpec {
    pub service: Option<Uuid>,
    pub characteristic: Option<Uuid>,
    pub descriptor: Option<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub characteristics: Vec<Uuid>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub descriptors: Vec<Uuid>,
    pub instance_id: Option<String>,
}

/// Validated target.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// Characteristic or descriptor with the specified handle.
    Handle(Handle),
    /// One characteristic, or one of its descriptors.
    Path {
        service: Uuid,
        characteristic: Uuid,
        descriptor: Option<Uuid>,
    },
    /// Several characteristics of one service.
    Characteristics { service: Uuid, chars: Uuids },
    /// Several descriptors of one characteristic.
    Descriptors {
        service: Uuid,
        characteristic: Uuid,
        descs: Uuids,
    },
}

impl Target {
    /// Returns the number of attributes named by the target.
    #[must_use]
    pub fn len(&self) -> usize {
        match *self {
            Self::Handle(_) | Self::Path { .. } => 1,
            Self::Characteristics { ref chars, .. } => chars.len(),
            Self::Descriptors { ref descs, .. } => descs.len(),
        }
    }

    /// Returns whether the target names no attributes. Always `false` for a
    /// resolved target.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl TargetSpec {
    /// Creates a UUID path target.
    #[must_use]
    pub fn path(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service: Some(service),
            characteristic: Some(characteristic),
            ..Self::default()
        }
    }

    /// Creates a handle target.
    #[must_use]
    pub fn instance(h: impl ToString) -> Self {
        Self {
            instance_id: Some(h.to_string()),
            ..Self::default()
        }
    }

    /// Validates the addressing style and returns the target.
    pub fn resolve(&self) -> Result<Target> {
        let has_path = self.service.is_some()
            || self.characteristic.is_some()
            || self.descriptor.is_some()
            || !self.characteristics.is_empty()
            || !self.descriptors.is_empty();
        if let Some(ref id) = self.instance_id {
            if has_path {
                return Err(Error::InvalidParam("instanceId combined with a UUID path"));
            }
            return (id.parse())
                .map(Target::Handle)
                .map_err(|()| Error::InvalidParam("malformed instanceId"));
        }
        let Some(service) = self.service else {
            return Err(Error::InvalidParam("either service or instanceId is required"));
        };
        if !self.characteristics.is_empty() {
            if self.characteristic.is_some()
                || self.descriptor.is_some()
                || !self.descriptors.is_empty()
            {
                return Err(Error::InvalidParam("characteristics batch combined with others"));
            }
            return Ok(Target::Characteristics {
                service,
                chars: dedup(&self.characteristics),
            });
        }
        let Some(characteristic) = self.characteristic else {
            return Err(Error::InvalidParam("characteristic is required"));
        };
        if !self.descriptors.is_empty() {
            if self.descriptor.is_some() {
                return Err(Error::InvalidParam("descriptors batch combined with a descriptor"));
            }
            return Ok(Target::Descriptors {
                service,
                characteristic,
                descs: dedup(&self.descriptors),
            });
        }
        Ok(Target::Path {
            service,
            characteristic,
            descriptor: self.descriptor,
        })
    }
}

/// Removes repeated UUIDs, keeping the first occurrence of each.
fn dedup(v: &[Uuid]) -> Uuids {
    let mut out = SmallVec::with_capacity(v.len());
    for &u in v {
        if !out.contains(&u) {
            out.push(u);
        }
    }
    out
}

/// Caller request. A request without `device` and `appId` addresses the local
/// resource table. `appId` selects that application's GATT client connection.
#[derive(Clone, Debug, Default, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Request {
    pub device: Option<Addr>,
    pub app_id: Option<AppId>,
    #[serde(flatten)]
    pub target: TargetSpec,
}

impl Request {
    /// Creates a request for a local target.
    #[inline]
    #[must_use]
    pub fn local(target: TargetSpec) -> Self {
        Self {
            target,
            ..Self::default()
        }
    }

    /// Creates a request for a target on a remote device.
    #[inline]
    #[must_use]
    pub fn remote(device: Addr, target: TargetSpec) -> Self {
        Self {
            device: Some(device),
            target,
            ..Self::default()
        }
    }
}
