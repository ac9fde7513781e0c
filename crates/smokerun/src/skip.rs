//! Known-incompatible tests.
//!
//! Some tests cannot pass under particular session modes because of how the
//! test infrastructure works, not because of server bugs. They are matched by
//! file name, containing directory, or `dir/file` against the tables below.

use crate::suite::TestUnit;

/// Tests that interfere with each other when run against a small-oplog pair.
const SMALL_OPLOG_SKIPS: &[&str] = &["cursor8.js", "indexh.js", "dropdb.js"];

/// `dir/file` entries that cannot run with authentication enabled.
const AUTH_SKIPS: &[&str] = &[
    "sharding/sync3.js",
    "sharding/sync6.js",
    "sharding/parallel.js",
    "sharding/sync_conn_cmd.js",
    "sharding/gle_with_conf_servers.js",
    "sharding/read_pref.js",
    "sharding/read_pref_cmd.js",
    "sharding/read_pref_rs_client.js",
    "jstests/bench_test1.js",
    "jstests/bench_test2.js",
    "jstests/bench_test3.js",
];

/// Directories whose tests manage authentication themselves.
const AUTH_DIRS: &[&str] = &["auth", "tool"];

/// Tests the debug build's mutex checker rejects.
const DEBUG_BUILD_SKIPS: &[&str] = &["sharding/remove2.js"];

/// Session properties the skip decision depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipContext {
    /// Small-oplog replication mode.
    pub small_oplog: bool,
    /// Auth mode or a key file is active.
    pub auth: bool,
    /// The primary reported a debug build.
    pub debug_build: bool,
}

impl SkipContext {
    /// Returns why `unit` must be skipped, if it must.
    #[must_use]
    pub fn reason(&self, unit: &TestUnit) -> Option<&'static str> {
        let file = unit.file_name();
        let short = unit.short_name();

        if self.small_oplog && SMALL_OPLOG_SKIPS.contains(&file) {
            return Some("not safe under small-oplog replication");
        }

        if self.auth {
            if AUTH_DIRS.contains(&unit.parent_dir_name()) || file.contains("auth") {
                return Some("manages authentication itself");
            }
            if AUTH_SKIPS.contains(&short.as_str()) {
                return Some("incompatible with authentication");
            }
        }

        if self.debug_build && DEBUG_BUILD_SKIPS.contains(&short.as_str()) {
            return Some("rejected by debug build checks");
        }

        None
    }

    /// Returns true when `unit` must not run.
    #[must_use]
    pub fn should_skip(&self, unit: &TestUnit) -> bool {
        self.reason(unit).is_some()
    }
}
