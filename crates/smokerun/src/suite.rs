//! Test units and suite expansion.
//!
//! A suite name expands to a sorted list of [`TestUnit`]s found under the
//! repository root. The resulting order can then be filtered, shuffled or
//! resumed part-way with [`skip_until`].

use rand::seq::SliceRandom;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// A single test to execute.
///
/// Identity is the path string; ordering is lexicographic by path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestUnit {
    /// Script, binary, or literal command line.
    pub path: String,
    /// Whether the test expects a running server.
    pub requires_server: bool,
}

impl TestUnit {
    /// Creates a new test unit.
    pub fn new(path: impl Into<String>, requires_server: bool) -> Self {
        Self {
            path: path.into(),
            requires_server,
        }
    }

    /// Last path component.
    #[must_use]
    pub fn file_name(&self) -> &str {
        Path::new(&self.path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.path)
    }

    /// Name of the directory that contains the test.
    #[must_use]
    pub fn parent_dir_name(&self) -> &str {
        Path::new(&self.path)
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("")
    }

    /// `parent/file` form used by the exclusion tables.
    #[must_use]
    pub fn short_name(&self) -> String {
        let parent = self.parent_dir_name();
        if parent.is_empty() {
            self.file_name().to_string()
        } else {
            format!("{}/{}", parent, self.file_name())
        }
    }

    /// File name without the `.js` suffix.
    #[must_use]
    pub fn test_name(&self) -> &str {
        let name = self.file_name();
        name.strip_suffix(".js").unwrap_or(name)
    }

    /// Extension including the dot, or empty.
    #[must_use]
    pub fn extension(&self) -> String {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default()
    }
}

/// A named directory of script tests.
#[derive(Debug, Clone, Copy)]
struct ScriptSuite {
    name: &'static str,
    /// Directory under `jstests/` (empty = `jstests/` itself).
    dir: &'static str,
    /// `[!_]*.js`: leading underscores mark helper files.
    skip_underscored: bool,
    uses_server: bool,
}

const SCRIPT_SUITES: &[ScriptSuite] = &[
    ScriptSuite { name: "js", dir: "", skip_underscored: true, uses_server: true },
    ScriptSuite { name: "quota", dir: "quota", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "jsPerf", dir: "perf", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "disk", dir: "disk", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "jsSlowNightly", dir: "slowNightly", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "jsSlowWeekly", dir: "slowWeekly", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "parallel", dir: "parallel", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "clone", dir: "clone", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "repl", dir: "repl", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "replSets", dir: "replsets", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "dur", dir: "dur", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "auth", dir: "auth", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "sharding", dir: "sharding", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "tool", dir: "tool", skip_underscored: false, uses_server: false },
    ScriptSuite { name: "aggregation", dir: "aggregation", skip_underscored: false, uses_server: true },
    ScriptSuite { name: "multiVersion", dir: "multiVersion", skip_underscored: false, uses_server: true },
];

const ALL_SUITES: &[&str] = &[
    "test", "perf", "client", "js", "jsPerf", "jsSlowNightly", "jsSlowWeekly", "clone",
    "parallel", "repl", "auth", "sharding", "tool",
];

const CLIENT_PROGRAMS: &[&str] = &[
    "firstExample",
    "secondExample",
    "whereExample",
    "authTest",
    "clientTest",
    "httpClientTest",
];

/// Appends `.exe` on Windows.
#[must_use]
pub fn executable_name(name: &str) -> String {
    if cfg!(windows) && !name.ends_with(".exe") {
        format!("{name}.exe")
    } else {
        name.to_string()
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl ScriptSuite {
    fn directory(&self, repo_root: &Path) -> PathBuf {
        let base = repo_root.join("jstests");
        if self.dir.is_empty() {
            base
        } else {
            base.join(self.dir)
        }
    }

    /// Sorted script files of this suite.
    fn files(&self, repo_root: &Path) -> Result<Vec<PathBuf>> {
        let dir = self.directory(repo_root);
        if !dir.is_dir() {
            debug!("suite {} has no directory {:?}", self.name, dir);
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".js") || name.starts_with('.') {
                continue;
            }
            if self.skip_underscored && name.starts_with('_') {
                continue;
            }
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort_by_key(|p| path_string(p));
        Ok(files)
    }
}

/// Expands suite names into an ordered list of test units.
///
/// # Errors
///
/// Returns [`Error::UnknownSuite`] for a name that is neither a suite nor an
/// existing path, or an IO error while listing suite directories.
pub fn expand_suites(
    names: &[String],
    repo_root: &Path,
    test_path: Option<&Path>,
) -> Result<Vec<TestUnit>> {
    let mut tests = Vec::new();

    for name in names {
        match name.as_str() {
            "all" => {
                let all: Vec<String> = ALL_SUITES.iter().map(|s| (*s).to_string()).collect();
                return expand_suites(&all, repo_root, test_path);
            }
            "test" | "perf" => {
                let program = executable_name(if name == "test" { "test" } else { "perftest" });
                let path = repo_root.join(program);
                if path.exists() {
                    tests.push(TestUnit::new(path_string(&path), false));
                }
            }
            "client" => {
                let mut programs: Vec<String> =
                    CLIENT_PROGRAMS.iter().map(|p| executable_name(p)).collect();
                let shared: Vec<String> = programs
                    .iter()
                    .map(|p| format!("sharedclient/{p}"))
                    .filter(|p| repo_root.join(p).exists())
                    .collect();
                programs.extend(shared);
                for program in programs {
                    let path = match test_path {
                        Some(_) => PathBuf::from(&program),
                        None => repo_root.join(&program),
                    };
                    tests.push(TestUnit::new(path_string(&path), false));
                }
            }
            "mongosTest" => {
                let path = repo_root.join(executable_name("mongos"));
                tests.push(TestUnit::new(path_string(&path), false));
            }
            other => {
                if let Some(suite) = SCRIPT_SUITES.iter().find(|s| s.name == other) {
                    for path in suite.files(repo_root)? {
                        tests.push(TestUnit::new(path_string(&path), suite.uses_server));
                    }
                } else if Path::new(other).exists() {
                    let path = repo_root.join(other);
                    let uses_server = suite_requirement_for(&path, repo_root)?;
                    tests.push(TestUnit::new(path_string(&path), uses_server));
                } else {
                    return Err(Error::UnknownSuite(other.to_string()));
                }
            }
        }
    }

    Ok(tests)
}

/// Server requirement of a single file, taken from the suite that owns it.
fn suite_requirement_for(path: &Path, repo_root: &Path) -> Result<bool> {
    let Ok(canonical) = path.canonicalize() else {
        return Ok(true);
    };
    for suite in SCRIPT_SUITES {
        for file in suite.files(repo_root)? {
            if file.canonicalize().map(|f| f == canonical).unwrap_or(false) {
                return Ok(suite.uses_server);
            }
        }
    }
    Ok(true)
}

/// Files mode: every argument is a test path that needs a server.
///
/// # Errors
///
/// Returns an error if a path cannot be made absolute.
pub fn units_from_files(paths: &[String]) -> Result<Vec<TestUnit>> {
    paths
        .iter()
        .map(|p| {
            let absolute = std::path::absolute(p)?;
            Ok(TestUnit::new(path_string(&absolute), true))
        })
        .collect()
}

/// Literal command lines, run as-is against a server.
#[must_use]
pub fn units_from_commands(commands: &[String]) -> Vec<TestUnit> {
    commands.iter().map(|c| TestUnit::new(c.clone(), true)).collect()
}

/// Reads test arguments one per line; `-` reads stdin.
///
/// # Errors
///
/// Returns an IO error if the source cannot be read.
pub fn read_arguments(source: &str) -> Result<Vec<String>> {
    let lines: Vec<String> = if source == "-" {
        std::io::stdin().lock().lines().collect::<std::io::Result<_>>()?
    } else {
        std::fs::read_to_string(source)?
            .lines()
            .map(str::to_string)
            .collect()
    };
    Ok(lines
        .into_iter()
        .map(|l| l.trim_end_matches('\r').to_string())
        .filter(|l| !l.trim().is_empty())
        .collect())
}

/// Drops every test whose path matches the regular expression `pattern`
/// anywhere.
///
/// # Errors
///
/// Returns [`Error::Config`] if `pattern` is not a valid regular expression.
pub fn ignore_matching(tests: Vec<TestUnit>, pattern: &str) -> Result<Vec<TestUnit>> {
    let re = Regex::new(pattern)
        .map_err(|e| Error::Config(format!("invalid --ignore pattern '{pattern}': {e}")))?;
    Ok(tests.into_iter().filter(|t| !re.is_match(&t.path)).collect())
}

/// Shuffles the run order.
pub fn shuffle(tests: &mut [TestUnit]) {
    tests.shuffle(&mut rand::thread_rng());
}

/// Keeps tests whose path sorts at or after `dir/name` in their own directory.
///
/// A path without a separator is compared against itself minus its last
/// character, followed by `/name`.
#[must_use]
pub fn skip_until(tests: Vec<TestUnit>, name: &str) -> Vec<TestUnit> {
    tests
        .into_iter()
        .filter(|t| {
            let dir = match t.path.rfind('/') {
                Some(i) => &t.path[..i],
                None => t.path.char_indices().last().map_or("", |(i, _)| &t.path[..i]),
            };
            t.path.as_str() >= format!("{dir}/{name}").as_str()
        })
        .collect()
}

#[cfg(test)]
#[path = "suite_tests.rs"]
mod suite_tests;
