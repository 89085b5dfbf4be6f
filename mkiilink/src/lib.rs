//! Framed, flow-controlled UART link for MKII sensor nodes
//!
//! mkiilink carries typed frames between the host, the application processor
//! and the battery management system of a sensor node, and implements the
//! bootloader command protocol spoken over those frames.
//!
//! ## As an application
//!
//! The `mkiilink` binary bootloads a node, listens to it, sends it data and
//! decodes captured byte streams:
//!
//! ```bash
//! mkiilink bootload --hello --erase-start 1 --erase-end 7 --program app.bin --boot
//! ```
//!
//! ## As a library
//!
//! The codecs, transport, router and bootloader state machines can be used
//! without the command-line interface by disabling the default features:
//!
//! ```toml
//! mkiilink = { version = "0.1", default-features = false }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub use self::{
    codec::{Codec, FrameCodec, WireFormat},
    error::Error,
    flasher::Flasher,
    frame::{Destination, Frame, FrameType},
    router::Router,
};

pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod flash;
pub mod flasher;
pub mod frame;
pub mod link;
pub mod progress;
pub mod router;
pub mod target;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
#[cfg(feature = "serialport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
pub mod interface;
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging;
