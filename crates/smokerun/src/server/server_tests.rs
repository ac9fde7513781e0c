//! Tests for server lifecycle management.

use super::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;
use tokio::net::TcpListener;

use crate::config::AuthMode;

/// Records calls and answers with canned replies.
#[derive(Default)]
struct FakeChannel {
    calls: Mutex<Vec<String>>,
    debug_build: bool,
    admin_error: Option<String>,
    /// `is_master` turns true on this call number.
    master_after: u32,
    master_calls: AtomicU32,
}

impl FakeChannel {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandChannel for FakeChannel {
    async fn is_debug_build(&self, port: u16) -> Result<bool> {
        self.record(format!("buildInfo:{port}"));
        Ok(self.debug_build)
    }

    async fn add_admin_user(&self, port: u16) -> Result<()> {
        self.record(format!("addUser:{port}"));
        match &self.admin_error {
            Some(message) => Err(Error::Command {
                command: "addUser".into(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    async fn sources_synced(&self, port: u16) -> Result<bool> {
        self.record(format!("sources:{port}"));
        Ok(true)
    }

    async fn initiate_replica_set(&self, primary_port: u16, secondary_port: u16) -> Result<()> {
        self.record(format!("initiate:{primary_port}:{secondary_port}"));
        Ok(())
    }

    async fn is_master(&self, _port: u16) -> Result<bool> {
        let n = self.master_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(n >= self.master_after)
    }

    async fn acknowledged_write(&self, port: u16, nodes: u32, timeout_ms: u64) -> Result<()> {
        self.record(format!("fence:{port}:{nodes}:{timeout_ms}"));
        Ok(())
    }

    async fn content_digest(&self, port: u16, database: &str) -> Result<CollectionDigests> {
        self.record(format!("dbhash:{port}:{database}"));
        Ok(CollectionDigests::from([("a".to_string(), "h".to_string())]))
    }
}

struct Fixture {
    _dir: TempDir,
    config: SmokeConfig,
}

/// A config whose server is a long sleep; the port is opened by the test.
fn fixture(port: u16) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let server = dir.path().join("fake-server");
    std::fs::write(&server, "#!/bin/sh\nexec sleep 30\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&server, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    let mut config = SmokeConfig::default();
    config.server.port = port;
    config.server.db_prefix = dir.path().to_path_buf();
    config.paths.server_executable = server;
    config.run.quiet = true;
    config.run.startup_attempts = 3;
    config.run.poll_interval_ms = 10;
    Fixture { _dir: dir, config }
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

#[test]
fn test_role_ports() {
    let options = ServerOptions::default();

    assert_eq!(Role::Primary.port_for(&options), 27999);
    assert_eq!(Role::Secondary.port_for(&options), 28000);
    assert_eq!(Role::Secondary.to_string(), "secondary");
}

#[tokio::test]
async fn test_null_server_is_inert() {
    let mut server = NullServer;

    server.start().await.unwrap();
    assert!(server.is_alive().await);
    assert!(server.content_digest().await.unwrap().is_empty());
    assert_eq!(server.port(), None);
    server.stop().await.unwrap();
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_without_start_is_a_bug() {
    let fx = fixture(27999);
    let mut server = ManagedServer::primary(&fx.config, Arc::new(FakeChannel::default()));

    let err = server.stop().await.unwrap_err();

    assert!(matches!(err, Error::Bug(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_and_stop_primary() {
    // Arrange
    let (_listener, port) = listener().await;
    let fx = fixture(port);
    let channel = Arc::new(FakeChannel {
        debug_build: true,
        ..FakeChannel::default()
    });
    let mut server = ManagedServer::primary(&fx.config, channel.clone());

    // Act
    server.start().await.unwrap();

    // Assert
    let handle = server.handle().unwrap();
    assert_eq!(handle.port, port);
    assert_eq!(handle.role, Role::Primary);
    assert!(!handle.auth_enabled);
    assert!(handle.pid().is_some());
    assert!(handle.db_path.ends_with("data/db/sconsTests"));
    assert!(handle.db_path.is_dir());
    assert!(server.is_debug_build());
    assert!(server.is_alive().await);
    assert_eq!(channel.calls(), vec![format!("buildInfo:{port}")]);

    server.stop().await.unwrap();
    assert!(server.handle().is_none());
    assert!(!server.is_alive().await);
}

#[cfg(unix)]
#[tokio::test]
async fn test_start_twice_keeps_first_process() {
    let (_listener, port) = listener().await;
    let fx = fixture(port);
    let mut server = ManagedServer::primary(&fx.config, Arc::new(FakeChannel::default()));
    server.start().await.unwrap();
    let pid = server.handle().unwrap().pid();

    server.start().await.unwrap();

    assert_eq!(server.handle().unwrap().pid(), pid);
    server.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_launch_failure_when_port_never_opens() {
    // Arrange: reserve a port and release it so nothing listens
    let port = {
        let (_listener, port) = listener().await;
        port
    };
    let fx = fixture(port);
    let mut server = ManagedServer::primary(&fx.config, Arc::new(FakeChannel::default()));

    // Act
    let err = server.start().await.unwrap_err();

    // Assert
    assert!(matches!(err, Error::Launch { port: p, attempts: 3 } if p == port));
    assert_eq!(err.exit_code(), 2);
    assert!(server.handle().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_auth_bootstrap_swallows_need_to_login() {
    let (_listener, port) = listener().await;
    let mut fx = fixture(port);
    fx.config.server.auth = AuthMode::Legacy;
    let channel = Arc::new(FakeChannel {
        admin_error: Some("need to login".into()),
        ..FakeChannel::default()
    });
    let mut server = ManagedServer::primary(&fx.config, channel.clone());

    server.start().await.unwrap();

    assert!(server.handle().unwrap().auth_enabled);
    assert!(channel.calls().contains(&format!("addUser:{port}")));
    server.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_auth_bootstrap_error_stops_server() {
    let (_listener, port) = listener().await;
    let mut fx = fixture(port);
    fx.config.server.auth = AuthMode::Legacy;
    let channel = Arc::new(FakeChannel {
        admin_error: Some("unauthorized".into()),
        ..FakeChannel::default()
    });
    let mut server = ManagedServer::primary(&fx.config, channel);

    let err = server.start().await.unwrap_err();

    assert!(matches!(err, Error::Command { ref message, .. } if message == "unauthorized"));
    assert!(server.handle().is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn test_secondary_waits_for_sources() {
    // Arrange: the secondary binds primary port + 1
    let (_listener, port) = listener().await;
    let mut fx = fixture(port - 1);
    fx.config.server.oplog = OplogMode::MasterSlave;
    fx.config.server.auth = AuthMode::Legacy;
    let channel = Arc::new(FakeChannel::default());
    let mut server = ManagedServer::secondary(&fx.config, channel.clone());

    // Act
    server.start().await.unwrap();

    // Assert
    assert_eq!(server.peer().map(|p| p.port), Some(port - 1));
    let handle = server.handle().unwrap();
    assert_eq!(handle.port, port);
    assert!(!handle.auth_enabled);
    assert!(handle.db_path.ends_with("data/db/sconsTestsSlave"));
    let calls = channel.calls();
    assert!(calls.contains(&format!("sources:{port}")));
    assert!(!calls.iter().any(|c| c.starts_with("addUser")));
    server.stop().await.unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_replica_set_commands_target_primary() {
    // Arrange
    let (_listener, port) = listener().await;
    let fx = fixture(port);
    let channel = Arc::new(FakeChannel {
        master_after: 3,
        ..FakeChannel::default()
    });
    let mut server = ManagedServer::primary(&fx.config, channel.clone());
    server.start().await.unwrap();

    // Act
    server.initiate_replica_set(port + 1).await.unwrap();
    server.replication_fence().await.unwrap();
    let digest = server.content_digest().await.unwrap();

    // Assert
    assert_eq!(channel.master_calls.load(Ordering::SeqCst), 3);
    let calls = channel.calls();
    assert!(calls.contains(&format!("initiate:{port}:{}", port + 1)));
    assert!(calls.contains(&format!("fence:{port}:2:{FENCE_TIMEOUT_MS}")));
    assert!(calls.contains(&format!("dbhash:{port}:{DIGEST_DATABASE}")));
    assert_eq!(digest.len(), 1);
    server.stop().await.unwrap();
}

#[tokio::test]
async fn test_commands_require_running_server() {
    let fx = fixture(27999);
    let server = ManagedServer::primary(&fx.config, Arc::new(FakeChannel::default()));

    assert!(matches!(server.replication_fence().await, Err(Error::Bug(_))));
    assert!(matches!(server.content_digest().await, Err(Error::Bug(_))));
}
