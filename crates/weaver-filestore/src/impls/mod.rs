//! Impls - concrete adapters for the ports.
//!
//! - **LocalBackingStore**: directory-backed object store
//! - **InMemoryController**: records task completions
//! - **SignalProbe** / **FakeProbe**: process liveness

pub mod inmem_controller;
pub mod local_store;
pub mod process_probe;

pub use self::inmem_controller::{CommittedTask, InMemoryController};
pub use self::local_store::LocalBackingStore;
pub use self::process_probe::{FakeProbe, SignalProbe};
