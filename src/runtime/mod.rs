//! Runtime surface: request handling and the execution server.

pub mod control;
pub mod server;

pub use control::{Controller, ExecutionRequest, RequestAction, RequestStatus};
pub use server::ExecutionServer;
