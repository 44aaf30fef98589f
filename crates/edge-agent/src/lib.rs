//! Edge agent binary support: the cloud sync plane and the local control
//! API. The coordinator in `main.rs` wires these over the application
//! managers.

pub mod api;
pub mod sync;
