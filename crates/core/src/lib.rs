//! Core crate for the ltxgate image-to-video worker: readiness gate, graph
//! templates, parameter binding, job lifecycle and response assembly.

pub mod backend;
pub mod binder;
pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod handler;
pub mod lifecycle;
pub mod logging;
pub mod readiness;
pub mod request;
pub mod response;
pub mod runtime;
pub mod server;
pub mod templates;

pub use error::HandlerError;
pub use handler::Handler;
pub use readiness::{wait_until_ready, BackendReady, Readiness};
pub use templates::{Mode, TemplateStore};
