//! Log ingestion and atomization: resources, boundary-detecting
//! atomizers, rollover-aware streams and bounded multi-source ordering.

pub mod atom;
pub mod atomizer;
pub mod config;
pub mod handler;
pub mod model;
pub mod pipeline;
pub mod resource;
pub mod stream;
pub mod sync;
