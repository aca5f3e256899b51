//! Encode a relative stable-name path into a single filename that is safe
//! to use as a claim-index directory name.
//!
//! `/` becomes the four-byte sequence `\x2f`, `\` becomes `\x5c`, and every
//! other byte is copied through unchanged. This is the on-disk escaping
//! contract for the claim index (§3 of the design doc) and must not change
//! without a coordinated migration of anything that reads `/run/phantom/links`.

/// Size of the scratch buffer used by [`escape_name`]. Generous enough that
/// no realistic `/dev` stable name overflows it; the buffer-based
/// [`escape`] primitive below still implements the overflow fallback
/// byte-for-byte for callers that size their own buffer tighter.
const SCRATCH_LEN: usize = 4096;

/// Escape `src` into the caller-provided buffer `out`.
///
/// Returns the unterminated length of the escaped form. `out` is always
/// left NUL-terminated. If the escaped form (plus its terminator) would not
/// fit in `out`, the buffer is reset to an empty, NUL-terminated string and
/// `0` is returned — this collision-prone fallback is intentional (see
/// `DESIGN.md`) and must be preserved exactly, not "fixed" silently.
pub fn escape(src: &str, out: &mut [u8]) -> usize {
    debug_assert!(!out.is_empty(), "escape buffer must hold at least a NUL");

    let mut len = 0usize;
    for byte in src.bytes() {
        let single;
        let token: &[u8] = match byte {
            b'/' => b"\\x2f",
            b'\\' => b"\\x5c",
            other => {
                single = [other];
                &single
            }
        };

        match push_token(out, len, token) {
            Some(new_len) => len = new_len,
            None => {
                out[0] = 0;
                return 0;
            }
        }
    }

    out[len] = 0;
    len
}

fn push_token(out: &mut [u8], len: usize, token: &[u8]) -> Option<usize> {
    let new_len = len.checked_add(token.len())?;
    // Need room for the token plus a trailing NUL.
    if new_len + 1 > out.len() {
        return None;
    }
    out[len..new_len].copy_from_slice(token);
    Some(new_len)
}

/// Owned-`String` convenience wrapper around [`escape`]. Sized generously
/// enough (4 KiB) that the degraded overflow path is unreachable for any
/// practical stable name, while still calling through the exact same
/// buffer-based logic as [`escape`].
pub fn escape_name(relative_stable_name: &str) -> String {
    let mut buf = vec![0u8; SCRATCH_LEN];
    let len = escape(relative_stable_name, &mut buf);
    String::from_utf8_lossy(&buf[..len]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_for_plain_names() {
        assert_eq!(escape_name("disk/by-id/ata-ST1"), "disk\\x2fby-id\\x2fata-ST1");
    }

    #[test]
    fn escapes_slash_and_backslash() {
        assert_eq!(escape_name("a/b\\c"), "a\\x2fb\\x5cc");
    }

    #[test]
    fn empty_input_escapes_to_empty() {
        assert_eq!(escape_name(""), "");
    }

    #[test]
    fn overflow_resets_to_empty_not_truncated() {
        let mut buf = [0u8; 4];
        // "/" alone needs 5 bytes (4 for the token + NUL); buffer only holds 4.
        let len = escape("/", &mut buf);
        assert_eq!(len, 0);
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn exact_fit_does_not_overflow() {
        let mut buf = [0u8; 5];
        // "ab" + NUL fits exactly in 5 bytes (2 + NUL, room to spare) but
        // check the boundary case of a single escaped byte fitting exactly.
        let len = escape("ab", &mut buf);
        assert_eq!(len, 2);
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn injective_over_inputs_that_fit() {
        let mut buf_a = [0u8; 64];
        let mut buf_b = [0u8; 64];
        let a = escape("disk/by-id/x", &mut buf_a);
        let b = escape("disk-by-id-x", &mut buf_b);
        assert_ne!(&buf_a[..a], &buf_b[..b]);
    }
}
