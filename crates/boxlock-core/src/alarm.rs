//! Interval-timer half of the signal harness.
//!
//! A single process-wide `ITIMER_REAL` drives every acquisition deadline.
//! Its `SIGALRM` handler does exactly one thing: set a sticky flag. The
//! signal's purpose is to interrupt whatever blocking call the acquirer is
//! sitting in (`flock` on the latch, the inotify read); the interrupted call
//! comes back with `EINTR`, the caller consults [`alarmed`], and decides.
//!
//! The timer is programmed with the requested deadline as its initial value
//! and a 100 ms repeat as a backstop, so an alarm that lands in the gap
//! before a blocking call is entered does not strand the broker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Backstop re-fire interval after the deadline expires.
const BACKSTOP: Duration = Duration::from_millis(100);

static ALARM_FIRED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_alarm(_signum: libc::c_int) {
    ALARM_FIRED.store(true, Ordering::Relaxed);
}

/// Reads and clears the sticky timeout flag.
#[must_use]
pub fn alarmed() -> bool {
    ALARM_FIRED.swap(false, Ordering::Relaxed)
}

/// Installs the `SIGALRM` handler.
///
/// `SA_RESTART` is deliberately absent: the acquirer's blocking calls must
/// return `EINTR` instead of resuming, or the timeout would never be
/// observed.
#[allow(unsafe_code)]
pub fn install_alarm_handler() -> Result<(), Errno> {
    let action = SigAction::new(
        SigHandler::Handler(on_alarm),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: `on_alarm` only stores to a static atomic, which is
    // async-signal-safe, and it replaces no handler the runtime depends on.
    unsafe { sigaction(Signal::SIGALRM, &action) }?;
    Ok(())
}

/// An armed interval timer; disarmed on drop.
///
/// There is one real timer per process, so at most one guard should be live
/// at a time; the broker's single-threaded control flow guarantees that.
#[derive(Debug)]
pub struct TimerGuard {
    armed: bool,
}

impl TimerGuard {
    /// Arms the timer for `deadline`. A zero deadline is the block-forever
    /// regime: nothing is armed and [`alarmed`] stays false.
    #[must_use]
    pub fn arm(deadline: Duration) -> Self {
        if deadline.is_zero() {
            return Self { armed: false };
        }
        // A stale flag from an earlier expiry must not cut this wait short.
        let _ = alarmed();
        set_itimer(deadline, BACKSTOP);
        Self { armed: true }
    }
}

impl Drop for TimerGuard {
    fn drop(&mut self) {
        if self.armed {
            set_itimer(Duration::ZERO, Duration::ZERO);
        }
    }
}

#[allow(unsafe_code)]
fn set_itimer(value: Duration, interval: Duration) {
    let timer = libc::itimerval {
        it_interval: timeval_of(interval),
        it_value: timeval_of(value),
    };
    // SAFETY: `setitimer` reads the `itimerval` we point it at and the null
    // old-value pointer is explicitly allowed. A zero value disarms.
    let rc = unsafe { libc::setitimer(libc::ITIMER_REAL, &timer, std::ptr::null_mut()) };
    debug_assert_eq!(rc, 0, "setitimer rejected a well-formed interval");
}

fn timeval_of(duration: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: libc::time_t::try_from(duration.as_secs()).unwrap_or(libc::time_t::MAX),
        tv_usec: libc::suseconds_t::try_from(duration.subsec_micros()).unwrap_or(0),
    }
}
