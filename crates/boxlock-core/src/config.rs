//! Process-scoped broker configuration.
//!
//! Everything here is read once at startup: the box count and sandbox
//! directory come from the tool probe, the lock root from a compiled-in
//! default with an environment seam for test harnesses and packaging.

use std::env;
use std::path::PathBuf;

/// Compiled-in root of the pidlock state tree.
pub const DEFAULT_LOCK_ROOT: &str = "/var/lock/boxlock";

/// Environment override for the lock state root.
pub const LOCK_ROOT_ENV: &str = "BOXLOCK_LOCK_ROOT";

/// Environment override for the sandbox tool command.
pub const SANDBOX_TOOL_ENV: &str = "BOXLOCK_ISOLATE";

/// Name of the held/contested subdirectory under the lock root.
const LOCK_SUBDIR: &str = "lock";

/// Name of the available subdirectory under the lock root.
const FREE_SUBDIR: &str = "free";

/// Configuration shared by every operation of one broker invocation.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Number of sandbox boxes the host is provisioned with.
    pub box_count: u32,
    /// Sandbox working directory reported by the tool probe.
    pub sandbox_dir: PathBuf,
    /// Root of the pidlock state tree.
    pub lock_root: PathBuf,
}

impl BrokerConfig {
    /// Builds a configuration from probed values and a lock root.
    #[must_use]
    pub fn new(box_count: u32, sandbox_dir: PathBuf, lock_root: PathBuf) -> Self {
        Self {
            box_count,
            sandbox_dir,
            lock_root,
        }
    }

    /// Resolves the lock root: the environment override when set and
    /// non-empty, the compiled-in default otherwise.
    #[must_use]
    pub fn resolve_lock_root() -> PathBuf {
        match env::var(LOCK_ROOT_ENV) {
            Ok(root) if !root.trim().is_empty() => PathBuf::from(root),
            _ => PathBuf::from(DEFAULT_LOCK_ROOT),
        }
    }

    /// The held/contested directory.
    #[must_use]
    pub fn lock_dir(&self) -> PathBuf {
        self.lock_root.join(LOCK_SUBDIR)
    }

    /// The available directory.
    #[must_use]
    pub fn free_dir(&self) -> PathBuf {
        self.lock_root.join(FREE_SUBDIR)
    }

    /// Path of a box's pidlock file while held or contested.
    #[must_use]
    pub fn lock_path(&self, box_id: u32) -> PathBuf {
        self.lock_dir().join(pidlock_name(box_id))
    }

    /// Path of a box's pidlock file while available.
    #[must_use]
    pub fn free_path(&self, box_id: u32) -> PathBuf {
        self.free_dir().join(pidlock_name(box_id))
    }

    /// Whether `box_id` names a box on this host.
    #[must_use]
    pub fn is_valid_box(&self, box_id: i64) -> bool {
        (0..i64::from(self.box_count)).contains(&box_id)
    }
}

fn pidlock_name(box_id: u32) -> String {
    format!("{box_id}.pidlock")
}
