//! Spawning, terminating and reaping server processes.
//!
//! Termination targets the whole process tree, since the server may run
//! under a wrapper (buildlogger) that starts it as a grandchild. On unix the
//! server leads its own process group; on Windows it is placed in a job
//! object.

use std::io::{self, Write};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Environment switch that routes command output through buildlogger.
pub const BUILDLOGGER_ENV: &str = "MONGO_USE_BUILDLOGGER";

/// Prefixes `argv` with the buildlogger forwarder when it is enabled.
///
/// `global` marks the server's own stream rather than a single test's.
#[must_use]
pub fn buildlogger_wrap(argv: Vec<String>, global: bool) -> Vec<String> {
    let enabled = std::env::var(BUILDLOGGER_ENV)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if !enabled {
        return argv;
    }

    let mut wrapped = vec![
        "python".to_string(),
        "buildscripts/buildlogger.py".to_string(),
    ];
    if global {
        wrapped.push("-g".to_string());
    }
    wrapped.extend(argv);
    wrapped
}

/// A running server process and whatever is needed to kill its tree.
#[derive(Debug)]
pub struct ServerProcess {
    child: Child,
    #[cfg(windows)]
    job: job::JobObject,
}

impl ServerProcess {
    /// Spawns `argv[0]` with the remaining arguments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Spawn`] if the program cannot be started.
    pub fn spawn(argv: &[String], quiet: bool) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Bug("empty server command line".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(if quiet { Stdio::null() } else { Stdio::inherit() })
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;

        #[cfg(windows)]
        let job = job::JobObject::for_child(&child)?;

        Ok(Self {
            child,
            #[cfg(windows)]
            job,
        })
    }

    /// OS process id, while the process has not been reaped.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Terminates the process tree, waits for the exit, flushes output.
    ///
    /// Safe to call when the process already died on its own.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the process cannot be signalled or reaped.
    pub async fn terminate(&mut self) -> Result<()> {
        terminate_process_tree(self)?;

        #[cfg(windows)]
        tokio::time::sleep(std::time::Duration::from_secs(5)).await;

        let status = self.child.wait().await?;
        debug!("server process exited: {}", status);

        let _ = io::stderr().flush();
        let _ = io::stdout().flush();
        Ok(())
    }
}

/// Sends SIGTERM to the server's process group, falling back to SIGKILL on
/// the direct child when the signal cannot be delivered.
#[cfg(unix)]
pub fn terminate_process_tree(process: &mut ServerProcess) -> io::Result<()> {
    let Some(pid) = process.child.id() else {
        // Already reaped.
        return Ok(());
    };
    let Ok(pgid) = libc::pid_t::try_from(pid) else {
        return process.child.start_kill();
    };

    // SAFETY: the group was created for a child we spawned and have not reaped.
    let rc = unsafe { libc::kill(-pgid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    warn!("SIGTERM to process group {} failed ({}), killing", pgid, err);
    process.child.start_kill()
}

/// Terminates every process in the server's job object.
#[cfg(windows)]
pub fn terminate_process_tree(process: &mut ServerProcess) -> io::Result<()> {
    match process.job.terminate() {
        Ok(()) => Ok(()),
        Err(err) => {
            warn!("TerminateJobObject failed ({}), killing", err);
            process.child.start_kill()
        }
    }
}

/// Kills the direct child; no tree handling on this platform.
#[cfg(not(any(unix, windows)))]
pub fn terminate_process_tree(process: &mut ServerProcess) -> io::Result<()> {
    process.child.start_kill()
}

#[cfg(windows)]
mod job {
    use std::ffi::c_void;
    use std::io;
    use tokio::process::Child;
    use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
    use windows_sys::Win32::System::JobObjects::{
        AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
        SetInformationJobObject, TerminateJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
    };

    /// Job object with kill-on-close, so the tree dies with the harness too.
    #[derive(Debug)]
    pub struct JobObject(HANDLE);

    // SAFETY: a job handle may be used from any thread.
    unsafe impl Send for JobObject {}
    // SAFETY: every operation on the handle is a thread-safe kernel call.
    unsafe impl Sync for JobObject {}

    impl JobObject {
        pub fn for_child(child: &Child) -> io::Result<Self> {
            let process = child
                .raw_handle()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "child already reaped"))?;

            // SAFETY: plain Win32 calls on handles owned by this function or the child.
            unsafe {
                let handle = CreateJobObjectW(std::ptr::null(), std::ptr::null());
                if handle.is_null() {
                    return Err(io::Error::last_os_error());
                }
                let job = Self(handle);

                let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
                info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
                let ok = SetInformationJobObject(
                    job.0,
                    JobObjectExtendedLimitInformation,
                    std::ptr::addr_of!(info).cast::<c_void>(),
                    std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
                );
                if ok == 0 {
                    return Err(io::Error::last_os_error());
                }

                if AssignProcessToJobObject(job.0, process as HANDLE) == 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(job)
            }
        }

        pub fn terminate(&self) -> io::Result<()> {
            // SAFETY: the handle is valid until drop.
            if unsafe { TerminateJobObject(self.0, u32::MAX) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        }
    }

    impl Drop for JobObject {
        fn drop(&mut self) {
            // SAFETY: the handle is owned and closed exactly once.
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}
