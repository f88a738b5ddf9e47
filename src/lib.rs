//! Span Segment Flusher: a background worker that incrementally assembles
//! distributed-tracing segments in an external segment buffer and emits
//! completed segments to a downstream message topic.
//!
//! See the individual modules for the component breakdown:
//! [`buffer`] (the Segment Buffer abstraction and its bindings), [`sink`]
//! (the downstream Sink abstraction and its bindings), [`worker`] (the
//! Flusher Worker), [`stage`] (the Flusher Stage pipeline adapter), and
//! [`shared`] (the three cross-boundary primitives that tie them together).

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod shared;
pub mod sink;
pub mod stage;
pub mod worker;
