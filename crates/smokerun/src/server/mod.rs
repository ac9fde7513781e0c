//! Server lifecycle management.
//!
//! Callers hold a `Box<dyn ServerControl>` and never branch on whether a real
//! server exists: [`ManagedServer`] owns a subprocess, [`NullServer`] stands in
//! when the session does not start servers.

pub mod args;
pub mod probe;
pub mod process;

use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{OplogMode, ServerOptions, SmokeConfig};
use crate::error::{Error, Result};
use crate::poll::{poll_until, PollConfig};
use crate::replication::CollectionDigests;
use crate::shell::{CommandChannel, DIGEST_DATABASE, FENCE_TIMEOUT_MS};

use self::process::{buildlogger_wrap, ServerProcess};

/// Role of a server in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The server tests run against.
    Primary,
    /// Replicates from the primary in replication modes.
    Secondary,
}

impl Role {
    /// Port a server in this role binds.
    #[must_use]
    pub fn port_for(self, options: &ServerOptions) -> u16 {
        match self {
            Self::Primary => options.port,
            Self::Secondary => options.port.saturating_add(1),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

/// The primary a secondary was created against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRef {
    /// Primary's port.
    pub port: u16,
    /// Primary's data directory.
    pub db_path: PathBuf,
}

/// A launched server. Exists exactly as long as the process does.
#[derive(Debug)]
pub struct ServerHandle {
    /// Bound port.
    pub port: u16,
    /// Data directory.
    pub db_path: PathBuf,
    /// Role in the session.
    pub role: Role,
    /// Whether the server enforces authentication.
    pub auth_enabled: bool,
    /// Options the server was launched with.
    pub options: ServerOptions,
    process: ServerProcess,
}

impl ServerHandle {
    /// OS process id.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }
}

/// Lifecycle and command surface of one server.
#[async_trait]
pub trait ServerControl: Send + Sync {
    /// Role of this server.
    fn role(&self) -> Role;

    /// Port while running.
    fn port(&self) -> Option<u16>;

    /// Whether the running server reported a debug build.
    fn is_debug_build(&self) -> bool {
        false
    }

    /// Launches the server and waits until it is usable.
    async fn start(&mut self) -> Result<()>;

    /// Terminates the server's process tree and reaps it.
    async fn stop(&mut self) -> Result<()>;

    /// Best-effort reachability probe.
    async fn is_alive(&self) -> bool;

    /// Blocks until a write is acknowledged by both replication members.
    async fn replication_fence(&self) -> Result<()>;

    /// Initiates a two-member replica set and waits for a primary.
    async fn initiate_replica_set(&self, secondary_port: u16) -> Result<()>;

    /// Per-collection digest of the test database.
    async fn content_digest(&self) -> Result<CollectionDigests>;
}

/// Stand-in used when the session does not start servers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullServer;

#[async_trait]
impl ServerControl for NullServer {
    fn role(&self) -> Role {
        Role::Primary
    }

    fn port(&self) -> Option<u16> {
        None
    }

    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn replication_fence(&self) -> Result<()> {
        Ok(())
    }

    async fn initiate_replica_set(&self, _secondary_port: u16) -> Result<()> {
        Ok(())
    }

    async fn content_digest(&self) -> Result<CollectionDigests> {
        Ok(CollectionDigests::new())
    }
}

/// A real server subprocess.
pub struct ManagedServer {
    role: Role,
    options: ServerOptions,
    executable: PathBuf,
    peer: Option<PeerRef>,
    channel: Arc<dyn CommandChannel>,
    poll: PollConfig,
    quiet: bool,
    handle: Option<ServerHandle>,
    debug_build: bool,
}

impl fmt::Debug for ManagedServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedServer")
            .field("role", &self.role)
            .field("executable", &self.executable)
            .field("peer", &self.peer)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ManagedServer {
    /// Creates the primary for a session. Nothing is launched yet.
    pub fn primary(config: &SmokeConfig, channel: Arc<dyn CommandChannel>) -> Self {
        Self::with_role(config, channel, Role::Primary, None)
    }

    /// Creates a secondary bound to the session's primary.
    pub fn secondary(config: &SmokeConfig, channel: Arc<dyn CommandChannel>) -> Self {
        let peer = PeerRef {
            port: Role::Primary.port_for(&config.server),
            db_path: args::data_dir(&config.server.db_prefix, Role::Primary),
        };
        Self::with_role(config, channel, Role::Secondary, Some(peer))
    }

    fn with_role(
        config: &SmokeConfig,
        channel: Arc<dyn CommandChannel>,
        role: Role,
        peer: Option<PeerRef>,
    ) -> Self {
        Self {
            role,
            options: config.server.clone(),
            executable: config.paths.server_executable.clone(),
            peer,
            channel,
            poll: config.poll_config(),
            quiet: config.run.quiet,
            handle: None,
            debug_build: false,
        }
    }

    /// The launched server, if any.
    #[must_use]
    pub fn handle(&self) -> Option<&ServerHandle> {
        self.handle.as_ref()
    }

    /// The primary this server replicates from.
    #[must_use]
    pub fn peer(&self) -> Option<&PeerRef> {
        self.peer.as_ref()
    }

    /// Master/slave secondaries get only the replication source flags.
    fn is_slave_only(&self) -> bool {
        self.role == Role::Secondary && self.options.oplog == OplogMode::MasterSlave
    }

    fn running_port(&self) -> Result<u16> {
        self.handle
            .as_ref()
            .map(|h| h.port)
            .ok_or_else(|| Error::Bug(format!("{} server is not running", self.role)))
    }

    async fn wait_for_port(&self, port: u16) -> Result<()> {
        poll_until(&self.poll, &format!("{} port {}", self.role, port), || async move {
            Ok(probe::is_port_open(port).await)
        })
        .await
        .map_err(|_| Error::Launch {
            port,
            attempts: self.poll.max_attempts,
        })
    }

    /// Everything after the port opens: build info, admin user, source sync.
    async fn bootstrap(&mut self, port: u16, auth_enabled: bool) -> Result<()> {
        match self.channel.is_debug_build(port).await {
            Ok(debug_build) => self.debug_build = debug_build,
            Err(e) => warn!("could not query build info on port {}: {}", port, e),
        }

        if auth_enabled {
            match self.channel.add_admin_user(port).await {
                Ok(()) => debug!("admin user created on port {}", port),
                Err(Error::Command { ref message, .. }) if message.contains("need to login") => {
                    debug!("admin user already exists on port {}", port);
                }
                Err(e) => return Err(e),
            }
        }

        if self.role == Role::Secondary {
            let channel = Arc::clone(&self.channel);
            poll_until(&self.poll, "replication sources sync", || {
                let channel = Arc::clone(&channel);
                async move { channel.sources_synced(port).await }
            })
            .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl ServerControl for ManagedServer {
    fn role(&self) -> Role {
        self.role
    }

    fn port(&self) -> Option<u16> {
        self.handle.as_ref().map(|h| h.port)
    }

    fn is_debug_build(&self) -> bool {
        self.debug_build
    }

    async fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            warn!("probable bug: {} server already running in start()", self.role);
            return Ok(());
        }

        args::ensure_test_dirs(&self.options.db_prefix)?;
        let db_path = args::data_dir(&self.options.db_prefix, self.role);
        std::fs::create_dir_all(&db_path)?;

        let port = self.role.port_for(&self.options);
        let mut argv = vec![self.executable.display().to_string()];
        argv.extend(args::server_args(
            &self.options,
            self.role,
            &db_path,
            self.peer.as_ref(),
        ));
        let argv = buildlogger_wrap(argv, true);

        if !self.quiet {
            info!("running {}", argv.join(" "));
        }
        let mut process = ServerProcess::spawn(&argv, self.quiet)?;

        if let Err(e) = self.wait_for_port(port).await {
            warn!("timeout starting {} server on port {}", self.role, port);
            if let Err(stop_err) = process.terminate().await {
                warn!("failed to reap unresponsive server: {}", stop_err);
            }
            return Err(e);
        }

        let auth_enabled = self.options.auth.is_enabled() && !self.is_slave_only();
        self.handle = Some(ServerHandle {
            port,
            db_path,
            role: self.role,
            auth_enabled,
            options: self.options.clone(),
            process,
        });

        if let Err(e) = self.bootstrap(port, auth_enabled).await {
            if let Err(stop_err) = self.stop().await {
                warn!("failed to stop {} server after bootstrap error: {}", self.role, stop_err);
            }
            return Err(e);
        }

        info!("{} server ready on port {}", self.role, port);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let mut handle = self
            .handle
            .take()
            .ok_or_else(|| Error::Bug(format!("{} server handle unset in stop()", self.role)))?;

        debug!("stopping {} server (pid {:?})", self.role, handle.pid());
        handle.process.terminate().await
    }

    async fn is_alive(&self) -> bool {
        match self.port() {
            Some(port) => probe::is_port_open(port).await,
            None => false,
        }
    }

    async fn replication_fence(&self) -> Result<()> {
        let port = self.running_port()?;
        info!("waiting for secondary to catch up");
        self.channel
            .acknowledged_write(port, 2, FENCE_TIMEOUT_MS)
            .await?;
        info!("caught up");
        Ok(())
    }

    async fn initiate_replica_set(&self, secondary_port: u16) -> Result<()> {
        let port = self.running_port()?;
        self.channel
            .initiate_replica_set(port, secondary_port)
            .await?;

        let channel = Arc::clone(&self.channel);
        poll_until(&self.poll, "replica set primary election", || {
            let channel = Arc::clone(&channel);
            async move { channel.is_master(port).await }
        })
        .await
    }

    async fn content_digest(&self) -> Result<CollectionDigests> {
        let port = self.running_port()?;
        self.channel.content_digest(port, DIGEST_DATABASE).await
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod server_tests;
