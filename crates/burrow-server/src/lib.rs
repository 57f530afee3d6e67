//! Tunnel server: accept loop and wiring around the control plane.

mod service;

pub use service::ServerService;
