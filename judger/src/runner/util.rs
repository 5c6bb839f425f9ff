use std::ffi::CStr;

pub fn is_recoverable_error(e: &bollard::errors::Error) -> bool {
    matches!(
        &e,
        bollard::errors::Error::JsonDataError { .. }
            | bollard::errors::Error::JsonSerdeError { .. }
            | bollard::errors::Error::StrParseError { .. }
            | bollard::errors::Error::StrFmtError { .. }
            | bollard::errors::Error::URLEncodedError { .. }
    )
}

/// Describe a signal number, e.g. `11` -> `Segmentation fault`.
#[cfg(unix)]
pub fn strsignal(signal: i32) -> String {
    // SAFETY: strsignal returns a pointer to a static or thread-local string.
    let c_buf = unsafe { libc::strsignal(signal as libc::c_int) };
    if c_buf.is_null() {
        return format!("signal {}", signal);
    }
    let c_str = unsafe { CStr::from_ptr(c_buf) };
    c_str.to_string_lossy().into_owned()
}

#[cfg(not(unix))]
pub fn strsignal(signal: i32) -> String {
    format!("signal {}", signal)
}

/// Truncate a diagnostic string to at most `max` bytes on a char boundary.
pub fn truncate_message(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_owned();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}\n--- truncated at {} bytes ---", &s[..end], max)
}
