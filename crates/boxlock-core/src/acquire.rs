//! Multi-lock acquisition strategy.
//!
//! Getting `k` boxes is cheap when the pool is slack and delicate when it is
//! not. The strategy runs in three phases, each cut short as soon as enough
//! boxes are held:
//!
//! 1. a shuffled sweep of `free/`, so brokers started together spread out
//!    instead of colliding on the same entries;
//! 2. a full scan from a random offset, which also reclaims dead holders;
//! 3. the wait path: release whatever partial set was collected (a broker
//!    camping on part of its request would deadlock against another doing
//!    the same), take the `free/` latch when more than one box is wanted,
//!    and re-sweep on every inotify wake until the interval timer fires.
//!
//! The latch serialises multi-box acquirers: without it, two brokers each
//! wanting two of the last two boxes grab one apiece and starve. Single-box
//! requests bypass it; they cannot deadlock against themselves.

use std::fs::File;
use std::io;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, warn};

use crate::alarm::{self, TimerGuard};
use crate::flock;
use crate::pidlock::{Broker, PidlockError};

impl Broker {
    /// Acquires up to `want` boxes, any identities.
    ///
    /// Timeout regimes: negative never blocks, zero blocks until satisfied
    /// or fatally signalled, positive blocks for that many seconds. A
    /// positive timeout requires [`crate::alarm::install_alarm_handler`] to
    /// have run, or the timer's expiry terminates the process. On any
    /// outcome short of `want`, every box taken along the way is released
    /// again, and the return value is the number still held afterwards --
    /// zero unless a release itself failed.
    pub fn acquire_any(&mut self, want: usize, timeout: f64) -> Result<usize, PidlockError> {
        self.scan_free(want)?;
        self.scan_all(want)?;
        if self.held().len() >= want {
            return Ok(self.held().len());
        }

        self.release_all_held();
        if timeout < 0.0 {
            return Ok(self.held().len());
        }

        self.wait_for_any(want, deadline_of(timeout))?;
        if self.held().len() < want {
            self.release_all_held();
        }
        Ok(self.held().len())
    }

    /// Acquires the specific boxes in `ids`, returning the ones still
    /// missing afterwards.
    ///
    /// With a positive timeout the missing ids are retried under the
    /// `free/` watch until the deadline. Unlike [`Self::acquire_any`], boxes
    /// already taken are kept across the wait: the caller asked for exactly
    /// these identities, and partial grants are part of the list contract.
    pub fn acquire_listed(
        &mut self,
        ids: &[u32],
        timeout: f64,
    ) -> Result<Vec<u32>, PidlockError> {
        let mut missing = Vec::new();
        for &box_id in ids {
            if !self.try_acquire(box_id)? {
                missing.push(box_id);
            }
        }
        if missing.is_empty() || timeout <= 0.0 {
            return Ok(missing);
        }

        let _timer = TimerGuard::arm(deadline_of(timeout));
        let Some(watch) = watch_free_dir(&self.config().free_dir()) else {
            return Ok(missing);
        };

        loop {
            let mut still = Vec::with_capacity(missing.len());
            for &box_id in &missing {
                if !self.try_acquire(box_id)? {
                    still.push(box_id);
                }
            }
            missing = still;
            if missing.is_empty() || alarm::alarmed() {
                return Ok(missing);
            }
            match watch.read_events() {
                Ok(_) => {}
                Err(Errno::EINTR) => {} // alarm or stray signal; loop re-checks
                Err(error) => {
                    warn!(%error, "free/ watch failed");
                    return Ok(missing);
                }
            }
        }
    }

    /// The blocking tail of [`Self::acquire_any`]: latch, watch, re-sweep.
    fn wait_for_any(&mut self, want: usize, deadline: Duration) -> Result<(), PidlockError> {
        let free_dir = self.config().free_dir();
        let _timer = TimerGuard::arm(deadline);

        let _latch = if want > 1 {
            match latch_free_dir(&free_dir) {
                Ok(latch) => Some(latch),
                // EINTR here is the timer; anything else makes waiting
                // pointless. Either way the caller sees an empty grant.
                Err(error) => {
                    debug!(%error, "free/ latch not acquired");
                    return Ok(());
                }
            }
        } else {
            None
        };
        if alarm::alarmed() {
            return Ok(());
        }

        let Some(watch) = watch_free_dir(&free_dir) else {
            return Ok(());
        };

        // Boxes freed between the scans and the watch registration would
        // otherwise produce no event; sweep once before blocking.
        self.scan_free(want)?;

        while self.held().len() < want {
            if alarm::alarmed() {
                break;
            }
            match watch.read_events() {
                // Any change is a reason to re-sweep; filtering on event
                // names would miss queue-overflow drops.
                Ok(_) => self.scan_free(want)?,
                Err(Errno::EINTR) => {}
                Err(error) => {
                    warn!(%error, "free/ watch failed");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Quick pass over `free/`, shuffled to keep simultaneous brokers off
    /// each other's toes.
    fn scan_free(&mut self, want: usize) -> Result<(), PidlockError> {
        if self.held().len() >= want {
            return Ok(());
        }
        let mut candidates = free_candidates(&self.config().free_dir(), self.config().box_count);
        candidates.shuffle(&mut rand::thread_rng());
        for box_id in candidates {
            if self.held().len() >= want {
                break;
            }
            self.try_acquire(box_id)?;
        }
        Ok(())
    }

    /// Full scan from a random offset; the slow path that also reclaims
    /// boxes whose holders died without a trace in `free/`.
    fn scan_all(&mut self, want: usize) -> Result<(), PidlockError> {
        let count = self.config().box_count;
        if self.held().len() >= want || count == 0 {
            return Ok(());
        }
        let offset = rand::thread_rng().gen_range(0..count);
        for step in 0..count {
            if self.held().len() >= want {
                break;
            }
            self.try_acquire((offset + step) % count)?;
        }
        Ok(())
    }
}

/// Valid box ids with a pidlock file currently on the free side.
fn free_candidates(free_dir: &Path, box_count: u32) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(free_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_ok_and(|kind| kind.is_file()))
        .filter_map(|entry| parse_pidlock_name(&entry.file_name()))
        .filter(|box_id| *box_id < box_count)
        .collect()
}

fn parse_pidlock_name(name: &std::ffi::OsStr) -> Option<u32> {
    name.to_str()?.strip_suffix(".pidlock")?.parse().ok()
}

/// Opens `free/` and takes the blocking exclusive latch on its descriptor.
/// Dropping the returned file releases it.
fn latch_free_dir(free_dir: &Path) -> io::Result<File> {
    let latch = File::open(free_dir)?;
    flock::lock_exclusive(&latch)?;
    Ok(latch)
}

/// Installs a creation/rename watch on `free/`. `None` degrades the caller
/// to its timeout; a broker that cannot watch can still be woken by the
/// backstop alarm, but has nothing to wait on beyond it.
fn watch_free_dir(free_dir: &Path) -> Option<Inotify> {
    let watch = match Inotify::init(InitFlags::empty()) {
        Ok(watch) => watch,
        Err(error) => {
            warn!(%error, "inotify unavailable");
            return None;
        }
    };
    match watch.add_watch(free_dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO) {
        Ok(_) => Some(watch),
        Err(error) => {
            warn!(%error, "could not watch free/");
            None
        }
    }
}

fn deadline_of(timeout: f64) -> Duration {
    // Non-finite values fold into the block-forever regime rather than
    // panicking inside Duration.
    if timeout > 0.0 && timeout.is_finite() {
        Duration::from_secs_f64(timeout)
    } else {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::pidlock::testutil::{live_foreign_stamp, test_broker};

    fn seed_free(root: &Path, box_id: u32) {
        fs::write(
            root.join("free").join(format!("{box_id}.pidlock")),
            "100:1\n",
        )
        .expect("seed free box");
    }

    fn seed_held(root: &Path, box_id: u32) {
        let holder = live_foreign_stamp();
        fs::write(
            root.join("lock").join(format!("{box_id}.pidlock")),
            format!("{holder}\n"),
        )
        .expect("seed held box");
    }

    fn free_ids(root: &Path) -> BTreeSet<u32> {
        free_candidates(&root.join("free"), u32::MAX).into_iter().collect()
    }

    #[test]
    fn takes_from_the_free_side_first() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        for box_id in 0..4 {
            seed_free(tmp.path(), box_id);
        }

        let got = broker.acquire_any(2, -1.0).expect("acquire");
        assert_eq!(got, 2);
        assert_eq!(broker.held().len(), 2);
        assert_eq!(free_ids(tmp.path()).len(), 2);
    }

    #[test]
    fn full_scan_reclaims_boxes_with_no_free_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        // Empty tree: nothing in free/, nothing in lock/. Only the full
        // scan can find these boxes.
        let got = broker.acquire_any(3, -1.0).expect("acquire");
        assert_eq!(got, 3);
    }

    #[test]
    fn nonblocking_failure_consumes_nothing() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        seed_free(tmp.path(), 0);
        seed_free(tmp.path(), 1);
        seed_held(tmp.path(), 2);
        seed_held(tmp.path(), 3);

        let before = free_ids(tmp.path());
        let got = broker.acquire_any(3, -1.0).expect("acquire");

        assert_eq!(got, 0);
        assert!(broker.held().is_empty());
        assert_eq!(free_ids(tmp.path()), before);
    }

    #[test]
    fn oversubscribed_pool_fails_clean() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        for box_id in 0..4 {
            seed_held(tmp.path(), box_id);
        }

        let got = broker.acquire_any(2, -1.0).expect("acquire");
        assert_eq!(got, 0);
        assert!(free_ids(tmp.path()).is_empty());
    }

    // Serialised with every other test that reads the alarm flag.
    #[test]
    #[serial_test::serial(alarm)]
    fn wait_path_wakes_on_a_freed_box() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        for box_id in 0..4 {
            seed_held(tmp.path(), box_id);
        }

        // Another holder frees two boxes shortly after we start waiting.
        let free_dir = tmp.path().join("free");
        let lock_dir = tmp.path().join("lock");
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(120));
            for box_id in [1u32, 3u32] {
                fs::rename(
                    lock_dir.join(format!("{box_id}.pidlock")),
                    free_dir.join(format!("{box_id}.pidlock")),
                )
                .expect("release from helper");
            }
        });

        // Zero timeout: block until satisfied. The helper guarantees
        // progress, so this terminates without a timer.
        let got = broker.acquire_any(2, 0.0).expect("acquire");
        releaser.join().expect("join helper");

        assert_eq!(got, 2);
        let held: BTreeSet<u32> = broker.held().iter().copied().collect();
        assert_eq!(held, BTreeSet::from([1, 3]));
    }

    #[test]
    fn listed_acquisition_reports_the_busy_ones() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        seed_held(tmp.path(), 2);

        let missing = broker.acquire_listed(&[2, 3], 0.0).expect("acquire listed");
        assert_eq!(missing, vec![2]);
        assert_eq!(broker.held(), &[3]);
    }

    #[test]
    #[serial_test::serial(alarm)]
    fn listed_acquisition_waits_for_a_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);
        seed_held(tmp.path(), 0);

        alarm::install_alarm_handler().expect("install alarm handler");

        let free_dir = tmp.path().join("free");
        let lock_dir = tmp.path().join("lock");
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(120));
            fs::rename(lock_dir.join("0.pidlock"), free_dir.join("0.pidlock"))
                .expect("release from helper");
        });

        // Generous deadline; the helper wakes us long before it expires.
        let missing = broker.acquire_listed(&[0], 30.0).expect("acquire listed");
        releaser.join().expect("join helper");

        assert!(missing.is_empty());
        assert_eq!(broker.held(), &[0]);
    }

    #[test]
    fn free_candidates_filters_names_and_range() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let free_dir = tmp.path().join("free");
        fs::create_dir_all(&free_dir).expect("mkdir");
        for name in ["0.pidlock", "3.pidlock", "9.pidlock", "x.pidlock", "3.tmp"] {
            fs::write(free_dir.join(name), "1:1\n").expect("seed");
        }

        let mut ids = free_candidates(&free_dir, 4);
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 3]);
    }

    #[test]
    fn deadlines_clamp_to_the_three_regimes() {
        assert_eq!(deadline_of(-1.0), Duration::ZERO);
        assert_eq!(deadline_of(0.0), Duration::ZERO);
        assert_eq!(deadline_of(0.5), Duration::from_millis(500));
    }
}
