//! Server command lines and data directory layout.

use std::path::{Path, PathBuf};

use crate::config::{OplogMode, ServerOptions};
use crate::shell::REPLICA_SET_NAME;

use super::{PeerRef, Role};

/// Oplog size, in megabytes, for small-oplog modes.
pub const SMALL_OPLOG_MB: u32 = 511;

/// PEM file handed to servers running with TLS.
pub const TLS_PEM_FILE: &str = "jstests/libs/smoke.pem";

/// Data directory of a server with the given role.
#[must_use]
pub fn data_dir(prefix: &Path, role: Role) -> PathBuf {
    let leaf = match role {
        Role::Primary => "sconsTests",
        Role::Secondary => "sconsTestsSlave",
    };
    prefix.join("data").join("db").join(leaf)
}

/// Creates the scratch directories tests and servers expect.
///
/// # Errors
///
/// Returns an IO error if a directory cannot be created.
pub fn ensure_test_dirs(prefix: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(prefix.join("tmp").join("unittest"))?;
    std::fs::create_dir_all(prefix.join("data").join("db"))?;
    Ok(())
}

/// Removes every server data directory left by earlier runs.
///
/// # Errors
///
/// Returns an IO error if an existing directory cannot be removed.
pub fn clean_data_root(prefix: &Path) -> std::io::Result<()> {
    let root = prefix.join("data").join("db");
    if root.exists() {
        std::fs::remove_dir_all(&root)?;
    }
    Ok(())
}

/// Computes the flags (without the executable) for one server launch.
///
/// A master/slave secondary only receives the replication source and the
/// session-wide log and extra flags; everything else applies to both roles.
#[must_use]
pub fn server_args(
    options: &ServerOptions,
    role: Role,
    db_path: &Path,
    peer: Option<&PeerRef>,
) -> Vec<String> {
    let mut argv = vec![
        "--port".to_string(),
        role.port_for(options).to_string(),
        "--dbpath".to_string(),
        db_path.display().to_string(),
        "--setParameter".to_string(),
        "enableTestCommands=1".to_string(),
    ];

    let slave_only = options.oplog == OplogMode::MasterSlave && role == Role::Secondary;

    match options.oplog {
        OplogMode::Default => {}
        OplogMode::MasterSlave => {
            if role == Role::Primary {
                argv.extend(["--master".to_string(), "--oplogSize".to_string()]);
                argv.push(SMALL_OPLOG_MB.to_string());
            }
        }
        OplogMode::ReplicaSet => {
            argv.extend(["--replSet".to_string(), REPLICA_SET_NAME.to_string()]);
            argv.extend(["--oplogSize".to_string(), SMALL_OPLOG_MB.to_string()]);
        }
    }

    if slave_only {
        if let Some(peer) = peer {
            argv.extend([
                "--slave".to_string(),
                "--source".to_string(),
                format!("localhost:{}", peer.port),
            ]);
        }
    } else {
        if !options.journal {
            argv.push("--nojournal".to_string());
        }
        if !options.prealloc_journal {
            argv.push("--nopreallocj".to_string());
        }
        if options.auth.is_enabled() {
            argv.push("--auth".to_string());
            if let crate::config::AuthMode::Mechanism(name) = &options.auth {
                argv.push(format!("--setParameter=authenticationMechanisms={name}"));
            }
        }
    }

    if let Some(log) = &options.server_log {
        argv.push("--logpath".to_string());
        argv.push(log.display().to_string());
    }

    argv.extend(options.extra_flags.iter().cloned());

    if options.tls && !slave_only {
        argv.extend([
            "--sslOnNormalPorts".to_string(),
            "--sslPEMKeyFile".to_string(),
            TLS_PEM_FILE.to_string(),
        ]);
    }

    argv
}
