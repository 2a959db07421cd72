//! Fail-fast path for header protocol violations.

use super::HeaderWord;

/// Report a header transition whose precondition did not hold and stop.
///
/// A mismatch means the shared header and the allocation table disagree, or
/// another process wrote the header out of turn. Continuing would spread the
/// corruption to every process mapping the same bucket file. Release builds
/// use `panic = "abort"`, so this terminates the process.
#[cold]
#[track_caller]
pub fn protocol_violation(op: &str, expected: &str, observed: HeaderWord) -> ! {
    tracing::error!(
        op,
        expected,
        observed = %observed,
        raw = observed.to_u64(),
        "Buffer header protocol violation"
    );
    panic!("header protocol violation in {op}: expected {expected}, observed {observed}");
}
