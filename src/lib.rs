//! GATT resource manager for a Bluetooth profile service.
//!
//! Models local GATT servers as a handle-indexed [`table::Table`], registers
//! new services with the underlying stack one attribute at a time
//! ([`reg::Registration`]), and multiplexes any number of caller
//! subscriptions onto at most one stack-level notification watch per target
//! ([`watch::Watches`]). The stack itself is an external collaborator reached
//! through the [`stack::Stack`] trait; all of its operations complete
//! asynchronously via [`stack::StackEvent`]s processed by a single
//! [`manager::Manager`] on one event loop task.

#![warn(missing_debug_implementations)]
#![warn(non_ascii_idents)]
#![warn(single_use_lifetimes)]
#![warn(unused_extern_crates)]
#![warn(unused_import_braces)]
#![warn(unused_lifetimes)]
#![warn(unused_qualifications)]
#![warn(clippy::nursery)]
#![warn(clippy::pedantic)]
#![allow(clippy::inline_always)]
#![allow(clippy::module_name_repetitions)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::empty_drop)]
#![warn(clippy::get_unwrap)]
#![warn(clippy::mod_module_files)]
#![warn(clippy::print_stdout)]
#![warn(clippy::str_to_string)]
#![warn(clippy::todo)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::fmt::{Display, Formatter};

pub use {addr::*, uuid::*};

use crate::conn::AppId;
use crate::stack::StackError;
use crate::table::{Handle, ServerId};

mod addr;
pub mod config;
pub mod conn;
pub mod event_loop;
pub mod manager;
pub mod reg;
pub mod remote;
pub mod stack;
pub mod table;
pub mod target;
mod uuid;
pub mod watch;

/// Error type returned by all resource manager operations.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("{0} not available")]
    NotAvailable(Absent),
    #[error("invalid parameter: {0}")]
    InvalidParam(&'static str),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("invalid service {0:?}")]
    InvalidService(Uuid),
    #[error("invalid characteristic {0:?}")]
    InvalidCharacteristic(Uuid),
    #[error("invalid descriptor {0:?}")]
    InvalidDescriptor(Uuid),
    #[error("invalid {0}")]
    InvalidHandle(Handle),
    #[error("{0:?} already registered")]
    AlreadyRegistered(Uuid),
    #[error(transparent)]
    StackOperationFailed(#[from] StackError),
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Entity named by [`Error::NotAvailable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Absent {
    /// Remote device is not connected or has no discovered services.
    Device(Addr),
    /// Application has no live connection.
    App(AppId),
    /// Server is not yet registered with the stack.
    Server(ServerId),
    /// Stack or event loop has gone away.
    Stack,
}

impl Display for Absent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Device(a) => write!(f, "device {a}"),
            Self::App(a) => write!(f, "{a}"),
            Self::Server(s) => write!(f, "{s}"),
            Self::Stack => f.write_str("stack"),
        }
    }
}

impl From<Addr> for Absent {
    #[inline]
    fn from(a: Addr) -> Self {
        Self::Device(a)
    }
}

impl From<AppId> for Absent {
    #[inline]
    fn from(a: AppId) -> Self {
        Self::App(a)
    }
}

impl From<ServerId> for Absent {
    #[inline]
    fn from(s: ServerId) -> Self {
        Self::Server(s)
    }
}
