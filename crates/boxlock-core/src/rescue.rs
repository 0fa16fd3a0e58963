//! Fatal-signal half of the signal harness.
//!
//! A broker that dies while holding boxes must put them back, and it must do
//! so from a signal handler, where almost nothing is allowed. The whole
//! release therefore reduces to calls that POSIX lists as async-signal-safe:
//! `rename(2)` of paths rendered to `CString`s at startup, one `write(2)` of
//! a pre-rendered message, and `_exit(2)`.
//!
//! The table of paths and held flags is prepared once, before any box can be
//! acquired; afterwards the protocol layer only flips per-box atomics, which
//! the handler reads without locks or allocation.

use std::ffi::CString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::config::BrokerConfig;

/// Signals that abort the broker and trigger the rescue path.
pub const FATAL_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGQUIT,
    Signal::SIGILL,
    Signal::SIGSEGV,
    Signal::SIGTERM,
];

struct RescueSlot {
    held: AtomicBool,
    lock_path: CString,
    free_path: CString,
}

struct RescueTable {
    slots: Vec<RescueSlot>,
    /// One pre-rendered stderr line per fatal signal.
    messages: Vec<(libc::c_int, Vec<u8>)>,
}

impl RescueTable {
    fn of(config: &BrokerConfig) -> Self {
        let slots = (0..config.box_count)
            .map(|box_id| RescueSlot {
                held: AtomicBool::new(false),
                lock_path: path_cstring(config.lock_path(box_id)),
                free_path: path_cstring(config.free_path(box_id)),
            })
            .collect();
        let messages = FATAL_SIGNALS
            .iter()
            .map(|signal| {
                let line = format!("Signal {}: {signal}\n", *signal as libc::c_int);
                (*signal as libc::c_int, line.into_bytes())
            })
            .collect();
        Self { slots, messages }
    }

    /// The rename sweep the handler runs. Only async-signal-safe calls.
    #[allow(unsafe_code)]
    fn rescue_held(&self) {
        for slot in &self.slots {
            if slot.held.load(Ordering::Relaxed) {
                // SAFETY: rename(2) is async-signal-safe; both paths were
                // NUL-terminated at prepare time and live for the process
                // lifetime. A failed rename leaves a dead holder line that
                // the next contender reclaims.
                let _ = unsafe { libc::rename(slot.lock_path.as_ptr(), slot.free_path.as_ptr()) };
            }
        }
    }
}

static TABLE: OnceLock<RescueTable> = OnceLock::new();

/// Pre-renders the per-box paths and per-signal messages. Must run before
/// the first acquisition; calling it again is a no-op.
pub fn prepare(config: &BrokerConfig) {
    let _ = TABLE.set(RescueTable::of(config));
}

/// Marks a box as held by this broker. No-op before [`prepare`].
pub fn mark_held(box_id: u32) {
    set_held(box_id, true);
}

/// Marks a box as no longer held by this broker.
pub fn mark_released(box_id: u32) {
    set_held(box_id, false);
}

fn set_held(box_id: u32, held: bool) {
    if let Some(slot) = TABLE.get().and_then(|t| t.slots.get(box_id as usize)) {
        slot.held.store(held, Ordering::Relaxed);
    }
}

/// Installs the rescue handler for every fatal signal.
#[allow(unsafe_code)]
pub fn install_fatal_handlers() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(on_fatal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in FATAL_SIGNALS {
        // SAFETY: `on_fatal` restricts itself to async-signal-safe calls
        // (rename, write, _exit) over data that is immutable or atomic
        // after `prepare`.
        unsafe { sigaction(signal, &action) }?;
    }
    Ok(())
}

#[allow(unsafe_code)]
extern "C" fn on_fatal(signum: libc::c_int) {
    if let Some(table) = TABLE.get() {
        table.rescue_held();
        for (signal, message) in &table.messages {
            if *signal == signum {
                // SAFETY: write(2) to stderr with a valid buffer is
                // async-signal-safe; partial writes are acceptable here.
                let _ = unsafe { libc::write(2, message.as_ptr().cast(), message.len()) };
                break;
            }
        }
    }
    // SAFETY: _exit(2) is async-signal-safe and never returns.
    unsafe { libc::_exit(64 + signum) }
}

fn path_cstring(path: PathBuf) -> CString {
    // Interior NULs cannot occur in paths assembled from the config; an
    // empty CString merely turns the rescue rename into a no-op.
    CString::new(path.into_os_string().into_vec()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn table_for(root: &std::path::Path, box_count: u32) -> (BrokerConfig, RescueTable) {
        let config = BrokerConfig::new(box_count, PathBuf::from("/tmp/sb"), root.to_path_buf());
        crate::lockdir::ensure_lock_dirs(root).expect("ensure dirs");
        let table = RescueTable::of(&config);
        (config, table)
    }

    #[test]
    fn rescue_renames_only_the_held_boxes() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (config, table) = table_for(tmp.path(), 3);

        fs::write(config.lock_path(0), "100:1\n").expect("seed box 0");
        fs::write(config.lock_path(1), "100:1\n").expect("seed box 1");
        table.slots[1].held.store(true, Ordering::Relaxed);

        table.rescue_held();

        assert!(config.lock_path(0).exists(), "unheld box must stay put");
        assert!(!config.lock_path(1).exists());
        assert!(config.free_path(1).exists());
        assert_eq!(fs::read_to_string(config.free_path(1)).expect("read"), "100:1\n");
    }

    #[test]
    fn rescue_tolerates_a_missing_lock_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (config, table) = table_for(tmp.path(), 1);

        table.slots[0].held.store(true, Ordering::Relaxed);
        table.rescue_held();

        assert!(!config.free_path(0).exists());
    }

    #[test]
    fn messages_cover_every_fatal_signal() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let (_, table) = table_for(tmp.path(), 1);

        assert_eq!(table.messages.len(), FATAL_SIGNALS.len());
        let term = libc::SIGTERM;
        let line = table
            .messages
            .iter()
            .find(|(signal, _)| *signal == term)
            .map(|(_, message)| String::from_utf8_lossy(message).into_owned())
            .expect("SIGTERM message");
        assert!(line.starts_with(&format!("Signal {term}: ")));
    }
}
