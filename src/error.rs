//! Diagnostics reported by `free` (§7) and the typed error returned
//! by pool construction.  The reference implementation calls
//! `ngx_slab_error`, a thin wrapper over `ngx_log_error` with a
//! caller-supplied context suffix; we keep the same "log and swallow"
//! policy but route through the `log` facade and a real enum instead
//! of bare string literals.
use std::fmt;

/// Non-fatal diagnostics raised while freeing a chunk. Every variant
/// is logged at `Level::Error` and then swallowed — `free` never
/// propagates these to its caller (§7).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Diagnostic {
    /// `free` called with an address outside `[data_begin, data_end)`.
    OutsideOfPool,
    /// Multi-page free whose head descriptor is not an allocation-run head.
    PageAlreadyFree,
    /// Multi-page free that landed on an interior/busy page of a run.
    WrongPage,
    /// Small/exact/big free whose address is not chunk-aligned.
    WrongChunk,
    /// The targeted bit was already clear: a double free.
    ChunkAlreadyFree,
    /// `allocate` found a slot page advertised as partial with no
    /// free bit in its bitmap: an invariant violation.
    PageIsBusy,
}

impl Diagnostic {
    fn message(self) -> &'static str {
        match self {
            Diagnostic::OutsideOfPool => "free(): outside of pool",
            Diagnostic::PageAlreadyFree => "free(): page is already free",
            Diagnostic::WrongPage => "free(): pointer to wrong page",
            Diagnostic::WrongChunk => "free(): pointer to wrong chunk",
            Diagnostic::ChunkAlreadyFree => "free(): chunk is already free",
            Diagnostic::PageIsBusy => "allocate(): page is busy",
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Logs `diagnostic`, appending `log_context` the way the reference
/// implementation appends `pool->log_ctx` to every `ngx_slab_error`
/// call.
pub fn report(diagnostic: Diagnostic, log_context: &str) {
    log::error!(target: "slabpool", "{}{}", diagnostic, log_context);
}

/// Logs an out-of-memory condition. Rate limiting is the caller's
/// job via `log_nomem`; this is only called when that flag is set.
/// Out-of-memory is the loudest condition this crate reports — louder
/// than the free-time diagnostics above, since it means the pool as a
/// whole can no longer serve its caller, not just one bad pointer.
pub fn report_no_memory(log_context: &str) {
    log::error!(target: "slabpool", "allocate() failed: no memory{}", log_context);
}

/// Failures building or attaching a `Pool`. Unlike the steady-state
/// diagnostics above, these are returned to the caller: a
/// misconfigured region is a programming error that should be caught
/// before any allocation traffic starts, not silently logged.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError {
    /// The region is too small to hold even the header, tables, and
    /// one data page.
    RegionTooSmall { needed: usize, available: usize },
    /// `min_shift` must leave room for at least one size class below
    /// `exact_shift`.
    InvalidMinShift { min_shift: u32, exact_shift: u32 },
    /// The region's base address is not aligned to the page size
    /// `Pool::init` was given, so page arithmetic over it would be
    /// unsound.
    MisalignedRegion,
    /// `Pool::attach` found a header whose magic/version does not
    /// match this crate's: either an uninitialized region, or one
    /// initialized by an incompatible version.
    NotInitialized,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::RegionTooSmall { needed, available } => write!(
                f,
                "region too small: need at least {} bytes, got {}",
                needed, available
            ),
            InitError::InvalidMinShift {
                min_shift,
                exact_shift,
            } => write!(
                f,
                "invalid min_shift {} (must be in [3, {}])",
                min_shift, exact_shift
            ),
            InitError::MisalignedRegion => {
                f.write_str("region base address is not page-aligned")
            }
            InitError::NotInitialized => {
                f.write_str("region header is not a valid slabpool header")
            }
        }
    }
}

impl std::error::Error for InitError {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn diagnostic_messages_are_distinct() {
        let variants = [
            Diagnostic::OutsideOfPool,
            Diagnostic::PageAlreadyFree,
            Diagnostic::WrongPage,
            Diagnostic::WrongChunk,
            Diagnostic::ChunkAlreadyFree,
            Diagnostic::PageIsBusy,
        ];

        for (i, a) in variants.iter().enumerate() {
            for (j, b) in variants.iter().enumerate() {
                if i != j {
                    assert_ne!(a.message(), b.message());
                }
            }
        }
    }

    #[test]
    fn init_error_display() {
        let err = InitError::RegionTooSmall {
            needed: 100,
            available: 10,
        };
        assert!(format!("{}", err).contains("100"));
    }
}
