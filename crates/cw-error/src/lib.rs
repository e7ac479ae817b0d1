#![forbid(unsafe_code)]
//! Error types for csumwalk.
//!
//! Two-layer model: `ParseError` (in `cw-types`) covers on-disk format
//! violations found while decoding bytes; `CwError` (this crate) is the
//! single user-facing error returned by lookups and the CLI.
//!
//! `cw-error` is intentionally independent of `cw-types` so the parsing
//! layer never depends on runtime error policy. Crates that hold both
//! convert at their boundary via `CwError::Parse(err.to_string())`.
//!
//! Propagation policy: every error is fatal to the enclosing operation.
//! There are no retries and no partial-result reporting beyond whatever
//! was emitted before the failure. The CLI translates the error into a
//! process exit code via [`CwError::exit_code`].

use thiserror::Error;

/// Unified error type for all csumwalk operations.
#[derive(Debug, Error)]
pub enum CwError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid on-disk format (bad magic, unsupported checksum algorithm,
    /// geometry out of range).
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error surfaced to the user.
    ///
    /// Carries the string form of a `cw_types::ParseError` so diagnostic
    /// detail survives the crate boundary.
    #[error("parse error: {0}")]
    Parse(String),

    /// The underlying tree search failed before reaching a leaf.
    #[error("tree search failed: {0}")]
    SearchFailed(String),

    /// A required item does not exist: no predecessor covers the start
    /// address, or the tree was exhausted before enough checksums were
    /// produced.
    #[error("not found: {0}")]
    NotFound(String),

    /// An item with the wrong key type sits where a checksum item was
    /// expected. Signals checksum-tree corruption or a cursor-positioning
    /// logic error.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The next item in key order does not pick up at the expected
    /// continuation address.
    #[error("checksum coverage gap: expected item at {expected}, found {found}")]
    Gap { expected: u64, found: u64 },

    /// A checksum item payload is not a whole, positive number of
    /// checksum values.
    #[error("corrupt checksum item at {bytenr}: size {size} is not a positive multiple of {csum_size}")]
    InvalidItemSize {
        bytenr: u64,
        size: usize,
        csum_size: u16,
    },

    /// The fs tree does not contain a usable extent record for the inode.
    #[error("extent lookup failed: {0}")]
    ExtentLookupFailed(String),

    /// The requested start address is not sector-aligned.
    #[error("address {bytenr} is not aligned to sector size {sector_size}")]
    UnalignedAddress { bytenr: u64, sector_size: u32 },
}

impl CwError {
    /// Process exit code for this error.
    ///
    /// The match is exhaustive — adding a variant without assigning a code
    /// is a compile error. Codes follow sysexits: 65 (`EX_DATAERR`) for
    /// bad on-disk data, 66 (`EX_NOINPUT`) for missing records, 74
    /// (`EX_IOERR`) for I/O.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Io(_) => 74,
            Self::Format(_)
            | Self::Parse(_)
            | Self::InvalidKey(_)
            | Self::Gap { .. }
            | Self::InvalidItemSize { .. }
            | Self::UnalignedAddress { .. } => 65,
            Self::SearchFailed(_) | Self::NotFound(_) | Self::ExtentLookupFailed(_) => 66,
        }
    }
}

/// Result alias using `CwError`.
pub type Result<T> = std::result::Result<T, CwError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_cover_all_variants() {
        let cases: Vec<(CwError, i32)> = vec![
            (CwError::Io(std::io::Error::other("test")), 74),
            (CwError::Format("bad magic".into()), 65),
            (CwError::Parse("truncated".into()), 65),
            (CwError::SearchFailed("root unreadable".into()), 66),
            (CwError::NotFound("no predecessor".into()), 66),
            (CwError::InvalidKey("type 108".into()), 65),
            (
                CwError::Gap {
                    expected: 4096,
                    found: 8192,
                },
                65,
            ),
            (
                CwError::InvalidItemSize {
                    bytenr: 0,
                    size: 7,
                    csum_size: 4,
                },
                65,
            ),
            (CwError::ExtentLookupFailed("inode 261".into()), 66),
            (
                CwError::UnalignedAddress {
                    bytenr: 100,
                    sector_size: 4096,
                },
                65,
            ),
        ];

        for (error, expected) in &cases {
            assert_eq!(error.exit_code(), *expected, "wrong code for {error:?}");
        }
    }

    #[test]
    fn display_formatting() {
        let gap = CwError::Gap {
            expected: 16384,
            found: 20480,
        };
        assert_eq!(
            gap.to_string(),
            "checksum coverage gap: expected item at 16384, found 20480"
        );

        let unaligned = CwError::UnalignedAddress {
            bytenr: 100,
            sector_size: 4096,
        };
        assert_eq!(
            unaligned.to_string(),
            "address 100 is not aligned to sector size 4096"
        );

        let nf = CwError::NotFound("csum tree exhausted".into());
        assert!(nf.to_string().starts_with("not found:"));
    }
}
