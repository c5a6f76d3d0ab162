//! Map of logical GATT client connections.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use tracing::debug;

use crate::{Addr, Error, Result};

/// Application identifier. Assigned by the stack to registered servers and
/// used by callers to name their GATT client connections.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct AppId(pub i32);

impl Display for AppId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "app#{}", self.0)
    }
}

/// Stack-assigned identifier of one GATT client connection.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ConnId(pub i32);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Remote device and connection bound to one application.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnectedDevice {
    pub addr: Addr,
    pub conn: ConnId,
}

/// Map of application ids to their connected remote devices. Several
/// applications may be connected to the same device, but each application has
/// at most one connection.
#[derive(Debug, Default)]
pub struct ConnMap(HashMap<AppId, ConnectedDevice>);

impl ConnMap {
    /// Creates an empty map.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds or rebinds an application to a device connection.
    pub fn bind(&mut self, app: AppId, addr: Addr, conn: ConnId) {
        let dev = ConnectedDevice { addr, conn };
        if let Some(old) = self.0.insert(app, dev) {
            debug!("Rebound {app} from {} {} to {addr} {conn}", old.addr, old.conn);
        } else {
            debug!("Bound {app} to {addr} {conn}");
        }
    }

    /// Returns the device connection of the specified application.
    #[inline]
    pub fn lookup(&self, app: AppId) -> Result<ConnectedDevice> {
        self.0.get(&app).copied().ok_or(Error::NotAvailable(app.into()))
    }

    /// Removes the binding of the specified application.
    #[inline]
    pub fn unbind(&mut self, app: AppId) -> Option<ConnectedDevice> {
        let dev = self.0.remove(&app);
        if let Some(ref d) = dev {
            debug!("Unbound {app} from {} {}", d.addr, d.conn);
        }
        dev
    }

    /// Removes the binding with the specified connection id, returning its
    /// application.
    pub fn unbind_conn(&mut self, conn: ConnId) -> Option<(AppId, ConnectedDevice)> {
        let app = *self.0.iter().find(|(_, d)| d.conn == conn)?.0;
        self.unbind(app).map(|d| (app, d))
    }

    /// Returns any live connection to the specified device. The lowest
    /// application id wins so that the choice is stable.
    #[must_use]
    pub fn conn_for(&self, addr: Addr) -> Option<ConnId> {
        (self.0.iter())
            .filter(|(_, d)| d.addr == addr)
            .min_by_key(|(app, _)| **app)
            .map(|(_, d)| d.conn)
    }
}
