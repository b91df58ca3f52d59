//! Result value carried to user callbacks.

use std::fmt;
use std::io;

/// Error namespace a [`NetState`] code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// OS errno namespace.
    System,
}

/// Success, or an error described by `(category, code)`.
///
/// The textual message is derived on demand from the pair, so carrying a
/// `NetState` through the hot path costs two words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetState {
    error: Option<(Category, i32)>,
}

impl NetState {
    /// The success value.
    #[inline]
    pub fn ok() -> Self {
        NetState { error: None }
    }

    /// A system error carrying an OS errno value.
    #[inline]
    pub fn system(code: i32) -> Self {
        NetState {
            error: Some((Category::System, code)),
        }
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Reset to success in place.
    #[inline]
    pub fn clear(&mut self) {
        self.error = None;
    }

    pub fn category(&self) -> Option<Category> {
        self.error.map(|(c, _)| c)
    }

    /// The numeric error code, or 0 on success.
    pub fn code(&self) -> i32 {
        self.error.map(|(_, code)| code).unwrap_or(0)
    }
}

impl Default for NetState {
    fn default() -> Self {
        NetState::ok()
    }
}

impl fmt::Display for NetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error {
            None => write!(f, "ok"),
            Some((Category::System, code)) => {
                write!(f, "system error {code}: {}", io::Error::from_raw_os_error(code))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_state() {
        let state = NetState::ok();
        assert!(state.is_ok());
        assert_eq!(state.code(), 0);
        assert!(state.category().is_none());
    }

    #[test]
    fn system_state_carries_errno() {
        let state = NetState::system(libc::ECONNRESET);
        assert!(!state.is_ok());
        assert_eq!(state.code(), libc::ECONNRESET);
        assert_eq!(state.category(), Some(Category::System));
    }

    #[test]
    fn clear_resets_to_ok() {
        let mut state = NetState::system(libc::EPIPE);
        state.clear();
        assert!(state.is_ok());
    }

    #[test]
    fn display_formats_the_os_message() {
        let text = NetState::system(libc::ECONNRESET).to_string();
        assert!(text.contains(&libc::ECONNRESET.to_string()));
        assert_eq!(NetState::ok().to_string(), "ok");
    }
}
