//! Command channel to a running server.
//!
//! The harness never speaks the server's wire protocol itself. Administrative
//! commands are evaluated through the shell interpreter (`--quiet --eval`),
//! each wrapped so the shell prints exactly one JSON line:
//! `{"ok":1,"value":...}` on success or `{"ok":0,"errmsg":"..."}` on failure.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};
use crate::replication::CollectionDigests;

/// Replica set name used in replica-set mode.
pub const REPLICA_SET_NAME: &str = "foo";

/// Database whose content digest is compared after a replicated run.
pub const DIGEST_DATABASE: &str = "test";

/// Bound on the replication fence write, in milliseconds.
pub const FENCE_TIMEOUT_MS: u64 = 5 * 60 * 1000;

/// Server commands the orchestrator depends on.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Whether the server reports a debug build.
    async fn is_debug_build(&self, port: u16) -> Result<bool>;

    /// Creates the administrative account.
    async fn add_admin_user(&self, port: u16) -> Result<()>;

    /// Whether every replication source has a "synced to" timestamp.
    async fn sources_synced(&self, port: u16) -> Result<bool>;

    /// Initiates a two-member replica set.
    async fn initiate_replica_set(&self, primary_port: u16, secondary_port: u16) -> Result<()>;

    /// Whether the node reports itself as primary.
    async fn is_master(&self, port: u16) -> Result<bool>;

    /// Write acknowledged by `nodes` members within `timeout_ms`.
    async fn acknowledged_write(&self, port: u16, nodes: u32, timeout_ms: u64) -> Result<()>;

    /// Per-collection content digest of `database`.
    async fn content_digest(&self, port: u16, database: &str) -> Result<CollectionDigests>;
}

/// [`CommandChannel`] backed by the shell interpreter.
#[derive(Debug, Clone)]
pub struct ShellChannel {
    shell: PathBuf,
    tls: bool,
}

impl ShellChannel {
    /// Creates a channel that evaluates commands with `shell`.
    pub fn new(shell: impl Into<PathBuf>, tls: bool) -> Self {
        Self {
            shell: shell.into(),
            tls,
        }
    }

    /// Evaluates a function body on the server and returns its value.
    async fn eval(&self, port: u16, command: &str, body: &str) -> Result<Value> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("--port").arg(port.to_string()).arg("--quiet");
        if self.tls {
            cmd.arg("--ssl");
        }
        cmd.arg("--eval").arg(wrap_script(body));

        debug!("eval {} on port {}", command, port);
        let output = cmd.output().await.map_err(|source| Error::Spawn {
            program: self.shell.display().to_string(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        match parse_reply(&stdout) {
            Some(reply) => reply.map_err(|message| Error::Command {
                command: command.to_string(),
                message,
            }),
            None => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let detail = if stderr.trim().is_empty() {
                    stdout.trim().to_string()
                } else {
                    stderr.trim().to_string()
                };
                Err(Error::Command {
                    command: command.to_string(),
                    message: format!("no reply from shell ({}): {}", output.status, detail),
                })
            }
        }
    }
}

/// Wraps a function body so the shell prints one JSON reply line.
#[must_use]
pub fn wrap_script(body: &str) -> String {
    format!(
        "var __smoke; try {{ __smoke = {{ ok: 1, value: (function () {{ {body} }})() }}; }} \
         catch (e) {{ __smoke = {{ ok: 0, errmsg: String(e) }}; }} \
         print(JSON.stringify(__smoke));"
    )
}

/// Finds the reply line in shell output.
///
/// Returns `None` when the shell printed no reply at all (for example when it
/// could not connect), otherwise the value or the server's error message.
#[must_use]
pub fn parse_reply(stdout: &str) -> Option<std::result::Result<Value, String>> {
    stdout.lines().rev().find_map(|line| {
        let parsed: Value = serde_json::from_str(line.trim()).ok()?;
        let obj = parsed.as_object()?;
        let ok = obj.get("ok")?.as_f64()?;
        if ok >= 1.0 {
            Some(Ok(obj.get("value").cloned().unwrap_or(Value::Null)))
        } else {
            let message = obj
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Some(Err(message))
        }
    })
}

fn expect_bool(command: &str, value: Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| Error::Command {
        command: command.to_string(),
        message: format!("expected a boolean, got {value}"),
    })
}

#[async_trait]
impl CommandChannel for ShellChannel {
    async fn is_debug_build(&self, port: u16) -> Result<bool> {
        let value = self
            .eval(
                port,
                "buildInfo",
                "return db.getSiblingDB('admin').runCommand({ buildInfo: 1 }).debug === true;",
            )
            .await?;
        expect_bool("buildInfo", value)
    }

    async fn add_admin_user(&self, port: u16) -> Result<()> {
        self.eval(
            port,
            "addUser",
            "db.getSiblingDB('admin').addUser('admin', 'password'); return true;",
        )
        .await
        .map(|_| ())
    }

    async fn sources_synced(&self, port: u16) -> Result<bool> {
        let value = self
            .eval(
                port,
                "sources",
                "db.getMongo().setSlaveOk(); \
                 return db.getSiblingDB('local').sources.find().toArray()\
                 .every(function (s) { return !!s.syncedTo; });",
            )
            .await?;
        expect_bool("sources", value)
    }

    async fn initiate_replica_set(&self, primary_port: u16, secondary_port: u16) -> Result<()> {
        let body = format!(
            "var r = db.getSiblingDB('admin').runCommand({{ replSetInitiate: {{ _id: '{REPLICA_SET_NAME}', members: [\
             {{ _id: 0, host: 'localhost:{primary_port}' }}, \
             {{ _id: 1, host: 'localhost:{secondary_port}', priority: 0 }}] }} }}); \
             if (!r.ok) throw r.errmsg; return true;"
        );
        self.eval(primary_port, "replSetInitiate", &body)
            .await
            .map(|_| ())
    }

    async fn is_master(&self, port: u16) -> Result<bool> {
        let value = self
            .eval(
                port,
                "ismaster",
                "return db.getSiblingDB('admin').runCommand({ ismaster: 1 }).ismaster === true;",
            )
            .await?;
        expect_bool("ismaster", value)
    }

    async fn acknowledged_write(&self, port: u16, nodes: u32, timeout_ms: u64) -> Result<()> {
        let body = format!(
            "var t = db.getSiblingDB('{DIGEST_DATABASE}'); t.smokeWait.insert({{}}); \
             var r = t.runCommand({{ getLastError: 1, w: {nodes}, wtimeout: {timeout_ms} }}); \
             if (r.err) throw r.err; return true;"
        );
        self.eval(port, "smokeWait", &body).await.map(|_| ())
    }

    async fn content_digest(&self, port: u16, database: &str) -> Result<CollectionDigests> {
        let body = format!(
            "db.getMongo().setSlaveOk(); \
             var r = db.getSiblingDB('{database}').runCommand('dbhash'); \
             if (!r.ok) throw r.errmsg; return r.collections;"
        );
        let value = self.eval(port, "dbhash", &body).await?;
        let map = value.as_object().ok_or_else(|| Error::Command {
            command: "dbhash".to_string(),
            message: format!("expected a collection map, got {value}"),
        })?;

        Ok(map
            .iter()
            .map(|(name, hash)| {
                let digest = hash
                    .as_str()
                    .map_or_else(|| hash.to_string(), str::to_string);
                (name.clone(), digest)
            })
            .collect())
    }
}
