//! rawpipe: a GPU compute-graph engine for raw image processing.
//!
//! A pipeline is declared as high-level *modules* (demosaic, exposure,
//! ...) wired by typed connectors. Each module expands into one or more
//! *nodes*, the individual compute kernels. The engine negotiates buffer
//! geometry from the sinks back to the sources, reserves image memory
//! from reference-counted arenas so producers and consumers alias one
//! heap, records a single command buffer with the layout barriers and
//! staging copies in dependency order, and submits it to the compute
//! queue.
//!
//! The flow, in the order [`graph::Graph::run`] executes it:
//! * forward ROI pass (full extents travel source to sink)
//! * reverse ROI pass + node expansion (requests travel sink to source)
//! * reference counting and the two allocation walks
//! * command recording, submission, staging upload/download
//!
//! Module classes live in a [`registry::Registry`]; the builtin set is in
//! [`modules`]. The GPU surface required is minimal and wrapped in
//! [`device::Device`].

pub mod alloc;
pub mod connector;
pub mod device;
pub mod error;
pub mod graph;
pub mod module;
pub mod modules;
pub mod node;
pub mod params;
pub mod registry;
pub mod token;

pub use crate::error::{Error, Result, WireError};
pub use crate::graph::{Graph, GraphRun};
pub use crate::registry::Registry;
pub use crate::token::Token;
