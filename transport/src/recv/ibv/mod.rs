//! Receiving with InfiniBand verbs: the NIC writes raw Ethernet frames straight into
//!  registered memory, bypassing the kernel's network stack.
//!
//! The device library is reached through the [Verbs] trait, which the application provides.
//!  Each device object lives in an owner that releases it on drop, and the owners are held in
//!  reverse order of creation, so that teardown (including a partially failed setup) always
//!  happens in the reverse of the setup order:
//!
//! ```ascii
//! event channel -> connection id -> bind -> protection domain -> completion channel
//!   -> send / receive CQ -> queue pair -> memory region -> flow steering rule
//! ```

mod reader;
mod resources;
pub mod verbs;

#[cfg(test)]
pub(crate) mod fake_verbs;

pub use verbs::{RawHandle, Verbs, WorkCompletion};
