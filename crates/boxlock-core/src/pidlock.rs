//! The per-box pidlock protocol.
//!
//! A box is represented by exactly one file at rest: `lock/<b>.pidlock`
//! while held or contested, `free/<b>.pidlock` while available. The
//! crossover between the two is an atomic rename, so no participant ever
//! observes a box in both states.
//!
//! Contention is decided by queue election. Contenders open the lock-side
//! file for append, and the first line whose `<pid>:<start_ticks>` identity
//! is still live is the holder. A contender that finds no live line appends
//! its own identity and re-scans: O_APPEND ordering on a local filesystem is
//! total, so exactly one appender reads itself back as the first live line.
//! The winner then replaces the whole queue with a single line naming the
//! broker's *parent* -- the process the lock is actually for -- by renaming a
//! freshly written free-side file over the lock-side path.
//!
//! Holdings are deliberately not RAII: a successful broker exit leaves the
//! lock files in place for the parent, and only an explicit release or the
//! fatal-signal rescue path puts a box back.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::BrokerConfig;
use crate::identity::{IdentityError, ProcessStamp};
use crate::rescue;
use crate::sandbox::SandboxTool;

/// Upper bound for one queue read. Entries are tens of bytes; 64 KiB
/// absorbs thousands of dead contenders without unbounded allocation.
const MAX_QUEUE_SIZE: u64 = 64 * 1024;

/// Upper bound for the single holder line read on release.
const MAX_RECORD_SIZE: u64 = 1024;

/// The lock tree is unusable for this user; acquisition cannot proceed.
#[derive(Debug, Error)]
#[error("Could not open {path}. Check user permissions.")]
pub struct PidlockError {
    /// The pidlock file the failure was on.
    pub path: String,
    /// Underlying I/O error.
    #[source]
    pub source: io::Error,
}

/// A single release that did not go through.
#[derive(Debug, Error)]
pub enum ReleaseError {
    /// No lock-side pidlock file; the box is not held.
    #[error("Could not access lock file for box_id={box_id}.")]
    NoLockFile {
        /// Box the release was for.
        box_id: u32,
    },

    /// The holder record did not parse.
    #[error("Invalid pidlock file data for box_id={box_id}.")]
    InvalidRecord {
        /// Box the release was for.
        box_id: u32,
    },

    /// The recorded holder is neither our parent nor ourselves.
    #[error("Cannot unlock box_id={box_id} - it does not belong to you.")]
    NotYours {
        /// Box the release was for.
        box_id: u32,
    },

    /// The rename back to the free side failed.
    #[error("Could not remove lock on box_id={box_id} - user has insufficient privileges.")]
    RenameFailed {
        /// Box the release was for.
        box_id: u32,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
}

/// One broker invocation: configuration, the two identities it acts under,
/// and the boxes it currently holds.
///
/// Queue slots are claimed under the broker's *own* identity (it is the
/// process doing the contending); committed locks carry the *parent*
/// identity (it is the process that outlives the broker and owns the box).
pub struct Broker {
    config: BrokerConfig,
    tool: SandboxTool,
    own: ProcessStamp,
    parent: ProcessStamp,
    held: Vec<u32>,
}

impl Broker {
    /// Stamps the calling process and its parent and binds them to the
    /// configuration. Fails when `/proc` does not yield either stamp.
    pub fn new(config: BrokerConfig, tool: SandboxTool) -> Result<Self, IdentityError> {
        Ok(Self {
            config,
            tool,
            own: ProcessStamp::current()?,
            parent: ProcessStamp::parent()?,
            held: Vec::new(),
        })
    }

    pub(crate) fn with_stamps(
        config: BrokerConfig,
        tool: SandboxTool,
        own: ProcessStamp,
        parent: ProcessStamp,
    ) -> Self {
        Self {
            config,
            tool,
            own,
            parent,
            held: Vec::new(),
        }
    }

    /// The configuration this broker operates under.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The sandbox tool handle, for the driver's init pass.
    #[must_use]
    pub fn tool(&self) -> &SandboxTool {
        &self.tool
    }

    /// Boxes currently held, in acquisition order.
    #[must_use]
    pub fn held(&self) -> &[u32] {
        &self.held
    }

    /// Attempts to take box `box_id` for the parent. `Ok(false)` means a
    /// live holder or a concurrent winner got there first; errors mean the
    /// lock tree itself is unusable.
    pub fn try_acquire(&mut self, box_id: u32) -> Result<bool, PidlockError> {
        if self.held.contains(&box_id) {
            // Already committed by this invocation; nothing to elect.
            return Ok(false);
        }

        let lock_path = self.config.lock_path(box_id);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&lock_path)
            .map_err(|source| PidlockError {
                path: lock_path.display().to_string(),
                source,
            })?;

        match self.first_live_entry(&mut file, &lock_path)? {
            Some(holder) if holder != self.own => {
                debug!(box_id, %holder, "box has a live holder");
                return Ok(false);
            }
            Some(_) => {
                // Our own line from an earlier attempt whose commit rename
                // failed; the queue slot is still ours.
            }
            None => {
                // Election: append our identity, then re-read. The first
                // live line after the append is the winner, full identity
                // compared so a recycled PID cannot masquerade as us.
                writeln!(file, "{}", self.own)
                    .and_then(|()| file.flush())
                    .map_err(|source| PidlockError {
                        path: lock_path.display().to_string(),
                        source,
                    })?;
                match self.first_live_entry(&mut file, &lock_path)? {
                    Some(winner) if winner == self.own => {}
                    _ => {
                        debug!(box_id, "lost the queue election");
                        return Ok(false);
                    }
                }
            }
        }

        Ok(self.commit(box_id, &lock_path))
    }

    /// Scans the queue from the start for the first line whose identity is
    /// live. Malformed lines are skipped; they must never wedge a box.
    fn first_live_entry(
        &self,
        file: &mut File,
        lock_path: &Path,
    ) -> Result<Option<ProcessStamp>, PidlockError> {
        let mut content = String::new();
        file.seek(SeekFrom::Start(0))
            .and_then(|_| std::io::Read::by_ref(&mut *file).take(MAX_QUEUE_SIZE).read_to_string(&mut content))
            .map_err(|source| PidlockError {
                path: lock_path.display().to_string(),
                source,
            })?;

        for line in content.lines() {
            let Some(stamp) = ProcessStamp::parse(line) else {
                continue;
            };
            if stamp.is_live() {
                return Ok(Some(stamp));
            }
        }
        Ok(None)
    }

    /// Converts a won election into the definitive holder record: a single
    /// parent-identity line staged at the box's free-side path and renamed
    /// over the queue in one atomic step.
    ///
    /// Any failure abandons the attempt without rolling back the queue
    /// append; our line goes dead with this process and later contenders
    /// scan past it.
    fn commit(&mut self, box_id: u32, lock_path: &Path) -> bool {
        let staging = self.config.free_path(box_id);
        let write = || -> io::Result<()> {
            let mut record = File::create(&staging)?;
            writeln!(record, "{}", self.parent)
        };
        if let Err(error) = write() {
            warn!(box_id, %error, "could not stage the holder record");
            return false;
        }
        match fs::rename(&staging, lock_path) {
            Ok(()) => {
                self.held.push(box_id);
                rescue::mark_held(box_id);
                debug!(box_id, parent = %self.parent, "acquired");
                true
            }
            Err(error) => {
                warn!(box_id, %error, "commit rename failed");
                false
            }
        }
    }

    /// Releases box `box_id` back to the free side.
    ///
    /// The ownership test accepts the recorded PID matching either our
    /// parent or ourselves; start ticks are logged but not compared, so a
    /// re-exec'd parent can still free through a fresh child invocation.
    /// Sandbox cleanup runs first and is best-effort by contract.
    pub fn release(&mut self, box_id: u32, opts: &[String]) -> Result<(), ReleaseError> {
        let lock_path = self.config.lock_path(box_id);
        let file = File::open(&lock_path).map_err(|_| ReleaseError::NoLockFile { box_id })?;

        let mut line = String::new();
        BufReader::new(file.take(MAX_RECORD_SIZE))
            .read_line(&mut line)
            .map_err(|_| ReleaseError::InvalidRecord { box_id })?;
        let holder =
            ProcessStamp::parse(&line).ok_or(ReleaseError::InvalidRecord { box_id })?;

        if holder.pid != self.parent.pid && holder.pid != self.own.pid {
            return Err(ReleaseError::NotYours { box_id });
        }
        debug!(box_id, %holder, "releasing");

        self.tool.cleanup_box(box_id, opts);

        fs::rename(&lock_path, self.config.free_path(box_id))
            .map_err(|source| ReleaseError::RenameFailed { box_id, source })?;
        self.forget(box_id);
        Ok(())
    }

    /// Releases every held box in acquisition order. Boxes that fail to
    /// release stay held; the count of those is returned.
    pub fn release_all_held(&mut self) -> usize {
        for box_id in self.held.clone() {
            if let Err(error) = self.release(box_id, &[]) {
                warn!(box_id, %error, "could not release held box");
            }
        }
        self.held.len()
    }

    fn forget(&mut self, box_id: u32) {
        self.held.retain(|held| *held != box_id);
        rescue::mark_released(box_id);
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use std::path::Path;
    use std::path::PathBuf;

    use super::Broker;
    use crate::config::BrokerConfig;
    use crate::identity::ProcessStamp;
    use crate::sandbox::SandboxTool;

    /// A broker rooted in `root` whose own and parent identities are both
    /// the test process, with a sandbox tool that cannot spawn (cleanup is
    /// ignored by contract, so that is harmless).
    pub(crate) fn test_broker(root: &Path, box_count: u32) -> Broker {
        let config = BrokerConfig::new(box_count, PathBuf::from("/tmp/sb"), root.to_path_buf());
        crate::lockdir::ensure_lock_dirs(root).expect("ensure lock dirs");
        let own = ProcessStamp::current().expect("stamp self");
        Broker::with_stamps(
            config,
            SandboxTool::with_command("boxlock-test-no-such-tool"),
            own,
            own,
        )
    }

    /// A stamp that is guaranteed live for the duration of any test: PID 1
    /// under its real start ticks.
    pub(crate) fn live_foreign_stamp() -> ProcessStamp {
        ProcessStamp::of(1).expect("stamp pid 1")
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::testutil::{live_foreign_stamp, test_broker};
    use super::*;

    #[test]
    fn acquires_a_fresh_box_and_records_the_parent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        assert!(broker.try_acquire(0).expect("try_acquire"));
        assert_eq!(broker.held(), &[0]);

        let content = fs::read_to_string(broker.config().lock_path(0)).expect("read lock");
        let recorded = ProcessStamp::parse(&content).expect("parse record");
        assert_eq!(recorded, ProcessStamp::current().expect("stamp self"));
        assert!(!broker.config().free_path(0).exists());
    }

    #[test]
    fn defers_to_a_live_holder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        let holder = live_foreign_stamp();
        fs::write(broker.config().lock_path(2), format!("{holder}\n")).expect("seed holder");

        assert!(!broker.try_acquire(2).expect("try_acquire"));
        assert!(broker.held().is_empty());

        // A live holder short-circuits the election: no append, no commit.
        let content = fs::read_to_string(broker.config().lock_path(2)).expect("read lock");
        let first = ProcessStamp::parse(content.lines().next().expect("first line"));
        assert_eq!(first, Some(holder));
    }

    #[test]
    fn reclaims_a_dead_holder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        fs::write(broker.config().lock_path(1), "999999:1\n").expect("seed dead holder");

        assert!(broker.try_acquire(1).expect("try_acquire"));
        let content = fs::read_to_string(broker.config().lock_path(1)).expect("read lock");
        assert_eq!(
            ProcessStamp::parse(&content),
            Some(ProcessStamp::current().expect("stamp self"))
        );
    }

    #[test]
    fn scans_past_garbage_lines() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        fs::write(
            broker.config().lock_path(3),
            "not a record\n999999:1\n:::\n",
        )
        .expect("seed garbage");

        assert!(broker.try_acquire(3).expect("try_acquire"));
    }

    #[test]
    fn acquiring_from_the_free_side_consumes_the_free_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        fs::write(broker.config().free_path(2), "100:1\n").expect("seed free record");

        assert!(broker.try_acquire(2).expect("try_acquire"));
        assert!(broker.config().lock_path(2).exists());
        assert!(!broker.config().free_path(2).exists());
    }

    #[test]
    fn does_not_reelect_a_box_it_already_holds() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        assert!(broker.try_acquire(0).expect("first acquire"));
        assert!(!broker.try_acquire(0).expect("second acquire"));
        assert_eq!(broker.held(), &[0]);
    }

    #[test]
    fn release_round_trip_moves_the_record_back() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        assert!(broker.try_acquire(0).expect("acquire"));
        broker.release(0, &[]).expect("release");

        assert!(broker.held().is_empty());
        assert!(broker.config().free_path(0).exists());
        assert!(!broker.config().lock_path(0).exists());

        // Releasing again: the lock-side file is gone.
        assert!(matches!(
            broker.release(0, &[]),
            Err(ReleaseError::NoLockFile { box_id: 0 })
        ));
    }

    #[test]
    fn release_refuses_a_foreign_holder() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        let holder = live_foreign_stamp();
        fs::write(broker.config().lock_path(3), format!("{holder}\n")).expect("seed holder");

        assert!(matches!(
            broker.release(3, &[]),
            Err(ReleaseError::NotYours { box_id: 3 })
        ));
        assert!(broker.config().lock_path(3).exists());
    }

    #[test]
    fn release_rejects_a_malformed_record() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        fs::write(broker.config().lock_path(1), "not a record\n").expect("seed garbage");

        assert!(matches!(
            broker.release(1, &[]),
            Err(ReleaseError::InvalidRecord { box_id: 1 })
        ));
    }

    #[test]
    fn release_all_held_keeps_the_failures() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut broker = test_broker(tmp.path(), 4);

        assert!(broker.try_acquire(0).expect("acquire 0"));
        assert!(broker.try_acquire(1).expect("acquire 1"));

        // Sabotage box 0: its lock file vanishes out from under us.
        fs::remove_file(broker.config().lock_path(0)).expect("remove lock 0");

        assert_eq!(broker.release_all_held(), 1);
        assert_eq!(broker.held(), &[0]);
        assert!(broker.config().free_path(1).exists());
    }
}
