use std::{
    ffi::{OsStr, OsString},
    io,
    os::unix::prelude::OsStrExt,
};
use tracing::warn;

/// name of the node this process runs on, used to keep staging files of different nodes apart
pub fn hostname() -> OsString {
    match nix::unistd::gethostname() {
        Ok(hostname) => hostname,
        Err(error) => {
            warn!(error = ?error, "Failed to retrieve hostname, falling back to 'unknown'");

            OsString::from("unknown")
        }
    }
}

/// join `prefix` and `name` without going through `String`
pub fn prefixed(prefix: &OsStr, name: &OsStr) -> OsString {
    let mut joined = OsString::with_capacity(prefix.len() + name.len());
    joined.push(prefix);
    joined.push(name);

    joined
}

/// Parse the ordinal out of a file name of the form `{prefix}{ordinal}{suffix}`.
/// Leading zeros and signs are rejected so every ordinal has exactly one file name.
pub fn parse_ordinal(file_name: &OsStr, prefix: &str, suffix: &str) -> Option<u32> {
    let bytes = file_name.as_bytes();
    let digits = bytes
        .strip_prefix(prefix.as_bytes())?
        .strip_suffix(suffix.as_bytes())?;

    if digits.is_empty()
        || (digits.len() > 1 && digits[0] == b'0')
        || !digits.iter().all(u8::is_ascii_digit)
    {
        return None;
    }

    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// true if the error was caused by renaming across file systems
pub fn is_cross_device(error: &io::Error) -> bool {
    error.raw_os_error() == Some(nix::errno::Errno::EXDEV as i32)
}
