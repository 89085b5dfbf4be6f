//! Forwarding between links and dispatch of local frames
//!
//! Every node runs one [Router]. A frame addressed to the node itself goes to
//! the handler registered for its type; a frame for another node is
//! re-encoded onto the link leading there, which may use a different wire
//! format than the link it came in on.

use std::{collections::HashMap, fmt};

use log::{debug, warn};

use crate::{
    error::Error,
    frame::{Destination, Frame, FrameType},
};

/// A physical link of a node
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkId(pub u8);

impl LinkId {
    /// USB to the host, on the application processor
    pub const USB: LinkId = LinkId(0);
    /// UART to the battery management board, on the application processor
    pub const BMS: LinkId = LinkId(1);
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link {}", self.0)
    }
}

/// Something frames can be written to
pub trait FrameSink {
    /// Send a frame, returning any frames received while doing so.
    fn send_frame(&mut self, frame: &Frame) -> Result<Vec<Frame>, Error>;
}

/// Consumer of locally addressed frames of one type
pub trait FrameHandler {
    fn handle(&mut self, frame: Frame) -> Result<(), Error>;
}

impl<F> FrameHandler for F
where
    F: FnMut(Frame) -> Result<(), Error>,
{
    fn handle(&mut self, frame: Frame) -> Result<(), Error> {
        self(frame)
    }
}

/// Why a frame went nowhere
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    NoRoute,
    /// The only route leads back where the frame came from
    Echo,
    /// The route names a link that is not attached
    NoLink,
    CrcError,
}

/// Routing decision for one frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Local,
    Forward(LinkId),
    Drop(DropReason),
}

/// Result of handing a local frame to its handler
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dispatched {
    Handled,
    Dropped,
}

/// What became of a frame passed to [Router::handle]
#[derive(Debug, PartialEq, Eq)]
pub enum Handled {
    /// Sent on, with whatever came back during the exchange
    Forwarded { link: LinkId, replies: Vec<Frame> },
    Local(Dispatched),
    Dropped(DropReason),
}

/// Per-node routing table and handler registry
pub struct Router {
    local: Destination,
    routes: HashMap<Destination, LinkId>,
    handlers: HashMap<FrameType, Box<dyn FrameHandler>>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.local)
            .field("routes", &self.routes)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Router {
    pub fn new(local: Destination) -> Self {
        Router {
            local,
            routes: HashMap::new(),
            handlers: HashMap::new(),
        }
    }

    /// Routing of the application processor: BMS behind its UART, the host behind USB
    pub fn application_processor() -> Self {
        let mut router = Router::new(Destination::ApplicationProcessor);
        router.add_route(Destination::BatteryManagementSystem, LinkId::BMS);
        router.add_route(Destination::Base, LinkId::USB);
        router
    }

    /// The host terminates everything it receives
    pub fn host() -> Self {
        Router::new(Destination::Base)
    }

    pub fn local(&self) -> Destination {
        self.local
    }

    pub fn add_route(&mut self, dest: Destination, link: LinkId) {
        self.routes.insert(dest, link);
    }

    /// Register the handler for locally addressed frames of `frame_type`.
    pub fn register<H>(&mut self, frame_type: FrameType, handler: H) -> Result<(), Error>
    where
        H: FrameHandler + 'static,
    {
        if self.handlers.contains_key(&frame_type) {
            return Err(Error::DuplicateHandler(frame_type));
        }

        self.handlers.insert(frame_type, Box::new(handler));
        Ok(())
    }

    pub fn route(&self, frame: &Frame, arrived_on: LinkId) -> Route {
        if !frame.is_valid() {
            return Route::Drop(DropReason::CrcError);
        }

        if frame.destination == self.local {
            return Route::Local;
        }

        match self.routes.get(&frame.destination) {
            Some(link) if *link == arrived_on => Route::Drop(DropReason::Echo),
            Some(link) => Route::Forward(*link),
            None => Route::Drop(DropReason::NoRoute),
        }
    }

    /// Forward or dispatch a frame which arrived on `arrived_on`.
    ///
    /// `sinks` is indexed by link number.
    pub fn handle(
        &mut self,
        frame: Frame,
        arrived_on: LinkId,
        sinks: &mut [&mut dyn FrameSink],
    ) -> Result<Handled, Error> {
        match self.route(&frame, arrived_on) {
            Route::Local => Ok(Handled::Local(self.dispatch(frame)?)),
            Route::Forward(link) => {
                let Some(sink) = sinks.get_mut(usize::from(link.0)) else {
                    warn!("No {link} attached for {} frames", frame.destination);
                    return Ok(Handled::Dropped(DropReason::NoLink));
                };

                debug!("Forwarding {} frame to {} on {link}", frame.frame_type, frame.destination);
                let replies = sink.send_frame(&frame)?;
                Ok(Handled::Forwarded { link, replies })
            }
            Route::Drop(reason) => {
                warn!(
                    "Dropping {} frame for {} from {arrived_on}: {reason:?}",
                    frame.frame_type, frame.destination
                );
                Ok(Handled::Dropped(reason))
            }
        }
    }

    /// Hand a local frame to the handler for its type.
    pub fn dispatch(&mut self, frame: Frame) -> Result<Dispatched, Error> {
        if !frame.is_valid() {
            warn!("Not dispatching {} frame which failed its CRC", frame.frame_type);
            return Ok(Dispatched::Dropped);
        }

        match self.handlers.get_mut(&frame.frame_type) {
            Some(handler) => {
                handler.handle(frame)?;
                Ok(Dispatched::Handled)
            }
            None => {
                warn!("No handler for {} frames, dropping", frame.frame_type);
                Ok(Dispatched::Dropped)
            }
        }
    }
}
