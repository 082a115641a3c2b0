use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info};
use uuid::Uuid;

use crate::control::ControlClient;
use crate::error::CoordError;
use crate::lock::{LockRecord, LockStore, default_lock_path, now_ms};
use crate::ports::{PortManager, bind_probe};
use crate::proxy::{self, ProxyHandle, ProxyMetadata, ProxyOptions};

/// Default budget for [`InstanceManager::wait_for_port`].
pub const DEFAULT_WAIT_FOR_PORT: Duration = Duration::from_secs(10);

/// Interval between bind probes while waiting for the port to free up.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// What this process currently is to the shared port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Unknown,
    Primary,
    Secondary,
}

/// Composes the lock store, control client and port manager into the
/// operations the coordinator drives.
///
/// Owns the lock file for as long as the role is [`Role::Primary`], and the
/// proxy handle for as long as it is [`Role::Secondary`] in HTTP mode.
pub struct InstanceManager {
    target_port: u16,
    version: String,
    lock: LockStore,
    control: ControlClient,
    ports: PortManager,
    role: Role,
    held_lock: Option<LockRecord>,
    proxy: Option<ProxyHandle>,
}

impl InstanceManager {
    pub fn new(
        target_port: u16,
        version: impl Into<String>,
        lock_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let path = lock_path.unwrap_or_else(|| default_lock_path(target_port));
        Ok(Self {
            target_port,
            version: version.into(),
            lock: LockStore::new(path),
            control: ControlClient::new()?,
            ports: PortManager::new(),
            role: Role::Unknown,
            held_lock: None,
            proxy: None,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn target_port(&self) -> u16 {
        self.target_port
    }

    pub fn lock_store(&self) -> &LockStore {
        &self.lock
    }

    pub fn held_lock(&self) -> Option<&LockRecord> {
        self.held_lock.as_ref()
    }

    pub fn proxy_port(&self) -> Option<u16> {
        self.proxy.as_ref().map(|p| p.port())
    }

    /// `true` iff `pid` maps to a live process on this host. Nonpositive
    /// PIDs never do. EPERM from the null-signal probe still means alive.
    pub fn pid_alive(pid: i32) -> bool {
        if pid <= 0 {
            return false;
        }
        #[cfg(unix)]
        {
            let rc = unsafe { libc::kill(pid, 0) };
            if rc == 0 {
                return true;
            }
            return std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
        }
        #[cfg(not(unix))]
        {
            // No portable probe: only our own PID is known-alive.
            pid as u32 == std::process::id()
        }
    }

    /// Attempt to win the election by exclusive-creating the lock file.
    ///
    /// Idempotent for the owner: losing the create to a lock that carries
    /// our own PID still counts as winning.
    pub async fn try_become_main(&mut self) -> Result<bool, CoordError> {
        let record = LockRecord::for_current_process(&self.version);
        if self.lock.try_create(&record).await? {
            self.role = Role::Primary;
            self.held_lock = Some(record);
            return Ok(true);
        }

        if let Some(existing) = self.lock.read().await
            && existing.pid == std::process::id()
        {
            debug!("lock already held by this process");
            self.role = Role::Primary;
            self.held_lock = Some(existing);
            return Ok(true);
        }

        Ok(false)
    }

    pub async fn read_lock(&self) -> Option<LockRecord> {
        self.lock.read().await
    }

    /// Rotate the held record in place (fresh timestamp, current version).
    pub async fn write_lock(&mut self) -> Result<(), CoordError> {
        let record = LockRecord::for_current_process(&self.version);
        self.lock.overwrite(&record).await?;
        self.held_lock = Some(record);
        Ok(())
    }

    pub async fn remove_lock(&mut self) -> Result<(), CoordError> {
        self.lock.remove().await?;
        if self.role == Role::Primary {
            self.role = Role::Unknown;
        }
        self.held_lock = None;
        Ok(())
    }

    pub async fn fetch_main_version(&self) -> Option<String> {
        self.control.fetch_version(self.target_port).await
    }

    pub async fn request_main_shutdown(&self) -> bool {
        self.control.request_shutdown(self.target_port).await
    }

    pub async fn request_main_transition(&self) -> bool {
        self.control.request_transition(self.target_port).await
    }

    /// Wait for the target port to become bindable, probing every 300 ms.
    ///
    /// The first probe happens before the deadline check, so a zero timeout
    /// still answers truthfully for a free port.
    pub async fn wait_for_port(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if bind_probe(self.target_port).await {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Free the target port for this process, evicting holders when
    /// allowed. Maps the boolean contract onto the typed error taxonomy.
    pub async fn ensure_target_port(&self, may_kill: bool) -> Result<(), CoordError> {
        if self.ports.ensure_port_available(self.target_port, may_kill).await {
            return Ok(());
        }
        if may_kill {
            Err(CoordError::PortStillInUse {
                port: self.target_port,
            })
        } else {
            Err(CoordError::PortHeldNoKill {
                port: self.target_port,
            })
        }
    }

    pub fn port_manager(&self) -> &PortManager {
        &self.ports
    }

    /// Start the secondary-side reverse proxy on a kernel-assigned port.
    /// Returns the bound listen port.
    pub async fn start_proxy(&mut self, main_version: Option<&str>) -> anyhow::Result<u16> {
        if let Some(existing) = &self.proxy {
            return Ok(existing.port());
        }

        let metadata = ProxyMetadata {
            main_version: main_version.unwrap_or("unknown").to_string(),
            main_port: self.target_port,
            instance_id: Uuid::new_v4().to_string(),
            started_at_ms: now_ms(),
        };
        let handle = proxy::start(ProxyOptions {
            listen_port: 0,
            target_port: self.target_port,
            metadata: Some(metadata),
        })
        .await?;

        let port = handle.port();
        self.proxy = Some(handle);
        self.role = Role::Secondary;
        info!(proxy_port = port, main_port = self.target_port, "instance running as secondary");
        Ok(port)
    }

    /// Stop the proxy and drain its in-flight requests. Idempotent.
    pub async fn stop_proxy(&mut self) {
        if let Some(mut handle) = self.proxy.take() {
            handle.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir, port: u16, version: &str) -> InstanceManager {
        InstanceManager::new(port, version, Some(dir.path().join("mgr.lock"))).expect("manager")
    }

    #[test]
    fn pid_alive_boundaries() {
        assert!(!InstanceManager::pid_alive(0));
        assert!(!InstanceManager::pid_alive(-1));
        assert!(InstanceManager::pid_alive(std::process::id() as i32));
        // Far above any default pid_max, so effectively never live.
        assert!(!InstanceManager::pid_alive(i32::MAX));
    }

    #[tokio::test]
    async fn become_main_is_idempotent_for_the_owner() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = manager(&dir, 18989, "1.0.0");

        assert!(mgr.try_become_main().await.expect("first"));
        assert_eq!(mgr.role(), Role::Primary);
        // Second call: the lock on disk carries our PID, so still true.
        assert!(mgr.try_become_main().await.expect("second"));
    }

    #[tokio::test]
    async fn become_main_defers_to_a_foreign_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = manager(&dir, 18989, "1.0.0");

        // A lock owned by someone else (init's PID is never ours).
        mgr.lock_store()
            .overwrite(&LockRecord {
                pid: 1,
                version: "0.9.0".to_string(),
                timestamp: now_ms(),
            })
            .await
            .expect("plant lock");

        assert!(!mgr.try_become_main().await.expect("attempt"));
        assert_eq!(mgr.role(), Role::Unknown);
    }

    #[tokio::test]
    async fn wait_for_port_zero_timeout_answers_immediately() {
        // Held port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let held = listener.local_addr().expect("addr").port();
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(&dir, held, "1.0.0");
        assert!(!mgr.wait_for_port(Duration::ZERO).await);

        // Free port.
        drop(listener);
        assert!(mgr.wait_for_port(Duration::ZERO).await);
    }

    #[tokio::test]
    async fn wait_for_port_sees_a_late_release() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let dir = tempfile::tempdir().expect("tempdir");
        let mgr = manager(&dir, port, "1.0.0");

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            drop(listener);
        });

        assert!(mgr.wait_for_port(Duration::from_secs(3)).await);
    }

    #[tokio::test]
    async fn remove_lock_releases_primary_state() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = manager(&dir, 18989, "1.0.0");

        assert!(mgr.try_become_main().await.expect("become main"));
        assert!(mgr.held_lock().is_some());

        mgr.remove_lock().await.expect("remove");
        assert_eq!(mgr.role(), Role::Unknown);
        assert!(mgr.held_lock().is_none());
        assert_eq!(mgr.read_lock().await, None);
    }
}
