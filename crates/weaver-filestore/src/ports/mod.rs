//! Ports: the traits at the seams of the file store.
//!
//! Each trait hides an external collaborator (object store, controller,
//! operating system) so the staging logic can be tested against in-memory
//! or directory-backed adapters from `impls`.

pub mod backing_store;
pub mod clock;
pub mod controller;
pub mod id_generator;
pub mod process_probe;

pub use self::backing_store::{BackingStore, ObjectReader, ObjectWriter};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::controller::TaskController;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::process_probe::ProcessProbe;
