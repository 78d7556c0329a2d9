//! ProcessProbe port - is the process behind a pid still running?

/// Liveness check for a process on this node.
///
/// Implementations must answer "alive" whenever they cannot prove the
/// process is gone: state of a live task must never be reclaimed.
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}
