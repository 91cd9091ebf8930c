//! Wrapper around [`colored::Colorize`] to conditionally
//! use colors when the terminal is TTY.
use crate::config::get_config;
use colored::Colorize;

/// Use terminal colors only if terminal is TTY.
pub trait MaybeColorize {
    /// Make text green.
    fn green(&self) -> String;
    /// Make text yellow.
    fn yellow(&self) -> String;
}

impl MaybeColorize for &str {
    fn green(&self) -> String {
        if get_config().http.tty {
            Colorize::green(*self).to_string()
        } else {
            self.to_string()
        }
    }

    fn yellow(&self) -> String {
        if get_config().http.tty {
            Colorize::yellow(*self).to_string()
        } else {
            self.to_string()
        }
    }
}

impl MaybeColorize for String {
    fn green(&self) -> String {
        MaybeColorize::green(&self.as_str())
    }

    fn yellow(&self) -> String {
        MaybeColorize::yellow(&self.as_str())
    }
}
