//! Process exit codes: the broker's contract with its callers.
//!
//! Code 2 (usage errors) is produced by clap itself and has no constant
//! here. Fatal signals exit with `64 + signum` from the rescue handler.

/// Everything requested was done.
pub const SUCCESS: u8 = 0;

/// No box available, or a release was refused.
pub const UNAVAILABLE: u8 = 1;

/// A box id outside `[0, box_count)`.
pub const INVALID_BOX_ID: u8 = 3;

/// Free mode invoked without a box id.
pub const NO_BOX_ID: u8 = 4;

/// A pass-through option failed validation.
pub const INVALID_OPTION: u8 = 7;

/// The probe or the lock directory bootstrap failed.
pub const SETUP_FAILED: u8 = 10;

/// `/proc/<pid>/stat` could not be read at startup.
pub const STAT_UNREADABLE: u8 = 11;

/// `/proc/<pid>/stat` could not be parsed at startup.
pub const STAT_UNPARSABLE: u8 = 12;

/// `isolate --init` failed after a successful lock.
pub const INIT_FAILED: u8 = 20;
