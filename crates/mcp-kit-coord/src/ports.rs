use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CoordError;

/// Probe budget for [`PortManager::find_available_port`].
pub const DEFAULT_FIND_RETRIES: u32 = 10;

/// Grace between the polite and the forceful termination signal.
const TERM_GRACE: Duration = Duration::from_millis(150);

/// Detects and evicts processes holding a TCP port.
///
/// Detection shells out to `lsof`; every subprocess failure is treated as
/// "no holders" so a host without `lsof` degrades to bind-time errors
/// instead of failing startup outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortManager;

impl PortManager {
    pub fn new() -> Self {
        Self
    }

    /// Is anything holding `port`? Port 0 is kernel-assigned and always
    /// reported free.
    pub async fn is_port_in_use(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match lsof_stdout(port).await {
            Some(out) => !out.trim().is_empty(),
            None => false,
        }
    }

    /// PIDs currently holding `port`. Unparseable `lsof` lines are skipped.
    pub async fn port_holders(&self, port: u16) -> Vec<i32> {
        if port == 0 {
            return Vec::new();
        }
        match lsof_stdout(port).await {
            Some(out) => parse_pid_lines(&out),
            None => Vec::new(),
        }
    }

    /// Politely terminate every holder of `port`, then force-kill the
    /// survivors after a short grace. Individual failures are logged and do
    /// not abort the pass. Returns `true` iff at least one PID was seen.
    pub async fn kill_port_holders(&self, port: u16) -> bool {
        let pids = self.port_holders(port).await;
        if pids.is_empty() {
            return false;
        }

        for &pid in &pids {
            debug!(pid, port, "sending SIGTERM to port holder");
            if let Err(e) = send_signal(pid, Signal::Term) {
                warn!(pid, port, error = %e, "failed to terminate port holder");
            }
        }

        tokio::time::sleep(TERM_GRACE).await;

        for &pid in &pids {
            if !pid_probe(pid) {
                continue;
            }
            debug!(pid, port, "port holder survived SIGTERM, sending SIGKILL");
            if let Err(e) = send_signal(pid, Signal::Kill) {
                warn!(pid, port, error = %e, "failed to kill port holder");
            }
        }

        true
    }

    /// First free port at or above `start`, probing at most `max_retries`
    /// candidates and never past 65535.
    pub async fn find_available_port(
        &self,
        start: u16,
        max_retries: u32,
    ) -> Result<u16, CoordError> {
        let exhausted = CoordError::NoFreePort {
            start,
            attempts: max_retries,
        };

        for offset in 0..max_retries {
            let Some(candidate) = (start as u32).checked_add(offset).and_then(|p| {
                u16::try_from(p).ok()
            }) else {
                break;
            };
            if !self.is_port_in_use(candidate).await {
                return Ok(candidate);
            }
        }
        Err(exhausted)
    }

    /// Make `port` usable: free already, or freed by evicting its holders
    /// when `may_kill` allows. The post-kill confirmation is a real bind
    /// probe, which does not race TIME_WAIT sockets the way the `lsof`
    /// heuristic can.
    pub async fn ensure_port_available(&self, port: u16, may_kill: bool) -> bool {
        if !self.is_port_in_use(port).await {
            return true;
        }
        if !may_kill {
            return false;
        }
        self.kill_port_holders(port).await;
        bind_probe(port).await
    }
}

/// Can we bind `port` on loopback right now?
pub(crate) async fn bind_probe(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    tokio::net::TcpListener::bind(addr).await.is_ok()
}

/// Run `lsof -ti :<port>`. `None` covers both "command failed to spawn"
/// and the non-zero exit `lsof` uses for "no matches".
async fn lsof_stdout(port: u16) -> Option<String> {
    let output = Command::new("lsof")
        .arg("-ti")
        .arg(format!(":{port}"))
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn parse_pid_lines(stdout: &str) -> Vec<i32> {
    let mut pids: Vec<i32> = stdout
        .lines()
        .filter_map(|l| l.trim().parse::<i32>().ok())
        .filter(|&p| p > 0)
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn send_signal(pid: i32, signal: Signal) -> std::io::Result<()> {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // ESRCH means the holder already exited, which is the outcome we want.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(err)
}

#[cfg(not(unix))]
fn send_signal(_pid: i32, _signal: Signal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "signal-based termination is only available on unix",
    ))
}

#[cfg(unix)]
fn pid_probe(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_probe(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_lines_parse_leniently() {
        let out = "1234\n  5678 \n\nnot-a-pid\n-3\n1234\n";
        assert_eq!(parse_pid_lines(out), vec![1234, 5678]);
    }

    #[test]
    fn empty_output_means_no_holders() {
        assert!(parse_pid_lines("").is_empty());
        assert!(parse_pid_lines("   \n\t\n").is_empty());
    }

    #[tokio::test]
    async fn port_zero_is_always_free() {
        let pm = PortManager::new();
        assert!(!pm.is_port_in_use(0).await);
        assert!(pm.port_holders(0).await.is_empty());
        assert!(pm.ensure_port_available(0, false).await);
    }

    #[tokio::test]
    async fn bind_probe_sees_a_held_port() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();

        assert!(!bind_probe(port).await);
        drop(listener);
        assert!(bind_probe(port).await);
    }

    #[tokio::test]
    async fn find_available_port_returns_a_free_start_immediately() {
        // Pick a port that was just free, then release it; the finder must
        // hand it straight back.
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let pm = PortManager::new();
        let found = pm.find_available_port(port, 1).await.expect("free port");
        assert_eq!(found, port);
    }

    #[tokio::test]
    async fn find_available_port_never_probes_past_the_u16_range() {
        let pm = PortManager::new();
        // 65535 free -> returned; the probe window past it must not wrap.
        match pm.find_available_port(65535, 10).await {
            Ok(p) => assert_eq!(p, 65535),
            Err(CoordError::NoFreePort { start, .. }) => assert_eq!(start, 65535),
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn killing_with_no_holders_reports_false() {
        // A port nobody holds: observed-PID count is zero.
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let pm = PortManager::new();
        assert!(!pm.kill_port_holders(port).await);
    }
}
