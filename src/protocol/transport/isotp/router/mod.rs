//! Live conversation set of one bus connection. Matches inbound frames and
//! transmit echoes to the owning conversation and keeps the round-robin
//! bookkeeping used by the scheduler.
use alloc::vec::Vec;

use crate::error::IsoTpError;
use crate::protocol::transport::can_frame::CanFrame;
use crate::protocol::transport::isotp::conversation::ConversationCell;

#[derive(Clone, Copy)]
struct Route<'a> {
    cell: &'a ConversationCell,
    /// Pass stamp of the last data frame sent for this conversation.
    last_served: u64,
}

/// Registered conversations, in registration order.
#[derive(Default)]
pub struct Router<'a> {
    routes: Vec<Route<'a>>,
}

impl<'a> Router<'a> {
    pub const fn new() -> Self {
        Self { routes: Vec::new() }
    }

    /// Add a conversation. Fails when its inbound traffic could not be told
    /// apart from an already registered one.
    pub fn register(&mut self, cell: &'a ConversationCell) -> Result<(), IsoTpError> {
        let endpoint = cell.endpoint();
        if self
            .routes
            .iter()
            .any(|route| route.cell.endpoint().conflicts_with(endpoint))
        {
            return Err(IsoTpError::DuplicateEndpoint);
        }
        self.routes.push(Route {
            cell,
            last_served: 0,
        });
        Ok(())
    }

    /// Remove a conversation. Returns `false` when it was not registered.
    pub fn unregister(&mut self, cell: &ConversationCell) -> bool {
        let before = self.routes.len();
        self.routes
            .retain(|route| !core::ptr::eq(route.cell, cell));
        self.routes.len() != before
    }

    pub fn contains(&self, cell: &ConversationCell) -> bool {
        self.routes.iter().any(|route| core::ptr::eq(route.cell, cell))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Drop every registration, returning the conversations.
    pub fn clear(&mut self) -> Vec<&'a ConversationCell> {
        self.routes.drain(..).map(|route| route.cell).collect()
    }

    /// Registered conversations, in registration order.
    pub fn conversations(&self) -> Vec<&'a ConversationCell> {
        self.routes.iter().map(|route| route.cell).collect()
    }

    /// Owner of an inbound frame; first match wins.
    pub fn route(&self, frame: &CanFrame) -> Option<&'a ConversationCell> {
        self.routes
            .iter()
            .find(|route| route.cell.endpoint().accepts(frame))
            .map(|route| route.cell)
    }

    /// Owner of one of our own frames echoed back by the bus. Conversations
    /// may share a transmit identifier (functional 0x7DF), so the one holding
    /// an identical frame in flight wins over the first owner.
    pub fn route_transmitted(&self, frame: &CanFrame) -> Option<&'a ConversationCell> {
        let mut owners = self
            .routes
            .iter()
            .filter(|route| route.cell.endpoint().owns_transmitted(frame));
        let first = owners.next()?.cell;
        if first.awaits_echo(frame) {
            return Some(first);
        }
        Some(
            owners
                .find(|route| route.cell.awaits_echo(frame))
                .map_or(first, |route| route.cell),
        )
    }

    /// Among the conversations for which `ready` holds, the one served least
    /// recently. Ties go to the earliest registered.
    pub fn least_recently_served(
        &self,
        mut ready: impl FnMut(&ConversationCell) -> bool,
    ) -> Option<&'a ConversationCell> {
        let mut best: Option<&Route<'a>> = None;
        for route in &self.routes {
            if !ready(route.cell) {
                continue;
            }
            if best.map_or(true, |current| route.last_served < current.last_served) {
                best = Some(route);
            }
        }
        best.map(|route| route.cell)
    }

    /// Record that `cell` was served at pass `stamp`.
    pub fn mark_served(&mut self, cell: &ConversationCell, stamp: u64) {
        if let Some(route) = self
            .routes
            .iter_mut()
            .find(|route| core::ptr::eq(route.cell, cell))
        {
            route.last_served = stamp;
        }
    }
}
