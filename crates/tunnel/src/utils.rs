//! Helper macros used across the crate.

/// Returns early with `$error` unless `$predicate` holds.
///
/// Like `assert!`, but for checks on untrusted input that should surface as an error rather than a panic.
///
/// ```ignore
/// ensure!(id_len <= MAX_CORRELATION_ID_LEN, ProtocolError::malformed_frame("correlation id too long"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
