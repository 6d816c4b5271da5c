//! Call lifecycle: the controller task and the status it publishes.

pub mod controller;
pub mod state;

pub use controller::{CallCommand, CallComponents, CallController, CallError};
pub use state::{
    lock_status, new_shared_status, Alert, AlertKind, CallState, CallStatus, Counters,
    SharedStatus,
};
