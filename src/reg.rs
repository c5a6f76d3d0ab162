//! Service registration pipeline.
//!
//! A service is registered one step at a time: the service declaration, then
//! each characteristic followed by its descriptors, then the start request.
//! [`Registration`] only says which stack call comes next; the caller issues
//! it and feeds the completion back through [`Registration::advance`]. Steps of
//! one service are therefore strictly serialized, while different services may
//! be in flight at the same time.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::stack::{Outcome, StackError};
use crate::table::{AttrRef, Handle, ServiceId, Table};
use crate::{Error, Result};

/// Registration stage of one service.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Declared,
    AddingService,
    RegisteringItems,
    Starting,
    Started,
    Failed,
}

/// Next action required to make progress.
#[derive(Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Step {
    /// Issue the service declaration.
    AddService,
    /// Issue the characteristic or descriptor declaration.
    AddItem(AttrRef),
    /// Issue the start request.
    Start,
    /// Registration finished. On failure, the service was already removed
    /// from the table, and [`Registration::orphan`] names any declaration
    /// left behind in the stack.
    Done(Result<ServiceId>),
}

/// Registration state machine of one service.
#[derive(Debug)]
pub struct Registration {
    svc: ServiceId,
    stage: Stage,
    items: VecDeque<AttrRef>,
    cur: Option<AttrRef>,
    orphan: Option<Handle>,
}

impl Registration {
    /// Creates a pipeline for a service that was just added to the table.
    pub fn new(table: &Table, svc: ServiceId) -> Result<Self> {
        let s = table.service(svc).ok_or(Error::NotFound("service"))?;
        if s.characteristics().is_empty() {
            return Err(Error::InvalidParam("service has no characteristics"));
        }
        Ok(Self {
            svc,
            stage: Stage::Declared,
            items: s.attrs().collect(),
            cur: None,
            orphan: None,
        })
    }

    /// Returns the service being registered.
    #[inline(always)]
    #[must_use]
    pub const fn service(&self) -> ServiceId {
        self.svc
    }

    /// Returns the current stage.
    #[inline(always)]
    #[must_use]
    pub const fn stage(&self) -> Stage {
        self.stage
    }

    /// Returns the stack handle of a service declaration that must be
    /// removed after a failed registration.
    #[inline(always)]
    #[must_use]
    pub const fn orphan(&self) -> Option<Handle> {
        self.orphan
    }

    /// Leaves the `Declared` stage.
    pub fn start(&mut self) -> Step {
        debug_assert_eq!(self.stage, Stage::Declared);
        debug!("Registering {}", self.svc);
        self.stage = Stage::AddingService;
        Step::AddService
    }

    /// Consumes the completion of the last issued step and returns the next
    /// one. Any failure removes the service from the table.
    pub fn advance(
        &mut self,
        table: &mut Table,
        r: std::result::Result<Outcome, StackError>,
    ) -> Step {
        match self.try_advance(table, r) {
            Ok(step) => step,
            Err(e) => self.fail(table, e),
        }
    }

    /// Aborts registration and removes the service from the table.
    pub fn fail(&mut self, table: &mut Table, e: Error) -> Step {
        warn!("Registration of {} failed in {:?}: {e}", self.svc, self.stage);
        self.stage = Stage::Failed;
        // None if the owner already removed the service and its declaration
        self.orphan = table.remove_service(self.svc).and_then(|s| s.handle());
        Step::Done(Err(e))
    }

    fn try_advance(
        &mut self,
        table: &mut Table,
        r: std::result::Result<Outcome, StackError>,
    ) -> Result<Step> {
        if table.service(self.svc).is_none() {
            return Err(Error::NotFound("service"));
        }
        let out = r?;
        match (self.stage, out) {
            (Stage::AddingService, Outcome::Handle(hdl)) => {
                debug!("{} declared at {hdl}", self.svc);
                table.set_service_handle(self.svc, hdl)?;
                self.stage = Stage::RegisteringItems;
                Ok(self.next_item())
            }
            (Stage::RegisteringItems, Outcome::Handle(hdl)) => {
                let at = self.cur.take().ok_or(Error::NotFound("attribute"))?;
                debug!("{} {at:?} registered at {hdl}", self.svc);
                table.assign_handle(self.svc, at, hdl)?;
                Ok(self.next_item())
            }
            (Stage::Starting, _) => {
                table.set_started(self.svc)?;
                self.stage = Stage::Started;
                debug!("{} started", self.svc);
                Ok(Step::Done(Ok(self.svc)))
            }
            (_, out) => {
                warn!("Unexpected {out:?} in {:?}", self.stage);
                Err(StackError::UNEXPECTED.into())
            }
        }
    }

    fn next_item(&mut self) -> Step {
        if let Some(at) = self.items.pop_front() {
            self.cur = Some(at);
            Step::AddItem(at)
        } else {
            self.stage = Stage::Starting;
            Step::Start
        }
    }
}
