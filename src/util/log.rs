//! Logging macros used throughout xpibridge.
//!
//! On the board these forward to `defmt`, and hence to RTT.  The protocol
//! core is also built on the host for testing, where `defmt` is not
//! available, so without the `defmt` feature the macros evaluate (and then
//! discard) their arguments.  Modules import the macros as they would the
//! `defmt` ones:
//!
//! ```ignore
//! #[allow(unused_imports)]
//! use crate::util::log::{debug, error, info, trace, warn};
//! ```

// Copyright (c) 2025 Piers Finlayson <piers@piers.rocks>
//
// GPLv3 licensed - see https://www.gnu.org/licenses/gpl-3.0.html

#[cfg(feature = "defmt")]
mod imp {
    macro_rules! trace {
        ($($arg:tt)*) => { defmt::trace!($($arg)*) };
    }
    macro_rules! debug {
        ($($arg:tt)*) => { defmt::debug!($($arg)*) };
    }
    macro_rules! info {
        ($($arg:tt)*) => { defmt::info!($($arg)*) };
    }
    // `warn` clashes with the built-in attribute when re-exported.
    macro_rules! warn_ {
        ($($arg:tt)*) => { defmt::warn!($($arg)*) };
    }
    macro_rules! error {
        ($($arg:tt)*) => { defmt::error!($($arg)*) };
    }
    pub(crate) use {debug, error, info, trace, warn_ as warn};
}

#[cfg(not(feature = "defmt"))]
mod imp {
    // Arguments are still borrowed, so unused variable warnings behave the
    // same with and without the feature.
    macro_rules! discard {
        ($fmt:literal $(, $arg:expr)* $(,)?) => {{
            $( let _ = &$arg; )*
        }};
    }
    macro_rules! trace {
        ($($arg:tt)*) => { $crate::util::log::discard!($($arg)*) };
    }
    macro_rules! debug {
        ($($arg:tt)*) => { $crate::util::log::discard!($($arg)*) };
    }
    macro_rules! info {
        ($($arg:tt)*) => { $crate::util::log::discard!($($arg)*) };
    }
    // `warn` clashes with the built-in attribute when re-exported.
    macro_rules! warn_ {
        ($($arg:tt)*) => { $crate::util::log::discard!($($arg)*) };
    }
    macro_rules! error {
        ($($arg:tt)*) => { $crate::util::log::discard!($($arg)*) };
    }
    pub(crate) use {debug, discard, error, info, trace, warn_ as warn};
}

#[allow(unused_imports)]
pub(crate) use imp::*;
