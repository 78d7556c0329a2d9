//! IdGenerator port.
//!
//! Ids and object keys are ULIDs built from the injected clock plus random
//! bits, so they stay unique across processes without coordination.

use ulid::Ulid;

use crate::domain::ids::TaskId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_ulid(&self) -> Ulid;

    fn generate_task_id(&self) -> TaskId {
        TaskId::from(self.generate_ulid())
    }
}

/// ULID generator driven by a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_ulid(&self) -> Ulid {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Ulid::from_parts(timestamp_ms, rand::random())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{FixedClock, SystemClock};
    use chrono::{TimeZone, Utc};

    #[test]
    fn generates_unique_ids() {
        let ids = UlidGenerator::new(SystemClock);
        let a = ids.generate_task_id();
        let b = ids.generate_task_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fixed_clock_pins_the_timestamp_part() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let ids = UlidGenerator::new(FixedClock::new(at));

        let a = ids.generate_ulid();
        let b = ids.generate_ulid();
        assert_ne!(a, b);
        assert_eq!(a.timestamp_ms(), b.timestamp_ms());
        assert_eq!(a.timestamp_ms(), at.timestamp_millis() as u64);
    }

    #[test]
    fn task_ids_carry_their_prefix() {
        let ids = UlidGenerator::new(SystemClock);
        assert!(ids.generate_task_id().to_string().starts_with("task-"));
    }
}
