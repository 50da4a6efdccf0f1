//! Bulk copy with fallback.
//!
//! Staging moves records from the capture buffer into a landing buffer
//! before each file write. On the appliance this hop is an accelerated copy
//! engine that can stall or fault; the contract here is that a failed or
//! timed-out accelerated copy degrades to a plain copy instead of failing
//! the pipeline.

use std::time::Duration;

use tracing::warn;

/// Why an accelerated copy did not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyError {
    /// Completion signal never arrived within the bound.
    Timeout,
    /// The engine reported a transfer fault.
    Fault,
}

/// A copy engine. Implementations may block on a completion signal up to
/// `timeout`.
pub trait BulkCopy: Send {
    fn copy(&mut self, src: &[u8], dst: &mut [u8], timeout: Duration)
    -> Result<(), CopyError>;
}

/// Plain synchronous copy. Never fails; also the fallback for every other
/// engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareCopy;

impl BulkCopy for SoftwareCopy {
    fn copy(&mut self, src: &[u8], dst: &mut [u8], _timeout: Duration) -> Result<(), CopyError> {
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// Run the engine copy, degrading to [`SoftwareCopy`] on timeout or fault.
/// The destination always ends up holding `src`.
pub fn copy_with_fallback(
    engine: &mut dyn BulkCopy,
    src: &[u8],
    dst: &mut [u8],
    timeout: Duration,
) {
    if let Err(e) = engine.copy(src, dst, timeout) {
        warn!(error = ?e, len = src.len(), "bulk copy failed, falling back to plain copy");
        dst[..src.len()].copy_from_slice(src);
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FlakyCopy;
    use super::*;

    #[test]
    fn software_copy_round_trips() {
        let mut dst = [0u8; 4];
        SoftwareCopy
            .copy(b"abcd", &mut dst, Duration::from_secs(1))
            .unwrap();
        assert_eq!(&dst, b"abcd");
    }

    #[test]
    fn fallback_masks_engine_failure() {
        let mut engine = FlakyCopy {
            failures: 1,
            calls: 0,
        };
        let mut dst = [0u8; 4];
        copy_with_fallback(&mut engine, b"abcd", &mut dst, Duration::from_millis(1));
        assert_eq!(&dst, b"abcd");
        // Recovered engine serves the next copy itself.
        let mut dst2 = [0u8; 4];
        copy_with_fallback(&mut engine, b"wxyz", &mut dst2, Duration::from_millis(1));
        assert_eq!(&dst2, b"wxyz");
        assert_eq!(engine.calls, 2);
    }
}
