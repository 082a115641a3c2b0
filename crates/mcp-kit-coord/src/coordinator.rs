use std::time::Duration;

use tracing::{info, warn};

use crate::error::CoordError;
use crate::instance::{DEFAULT_WAIT_FOR_PORT, InstanceManager};

/// Why this process ended up primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimaryReason {
    /// Won the very first lock attempt.
    Initial,
    /// The lock file was absent or unreadable and the retry won.
    LockMissing,
    /// The lock named a dead PID; we reclaimed it.
    StaleLock,
    /// An older primary yielded the port on request.
    VersionTransition,
}

/// The role decision, produced exactly once per startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleOutcome {
    Primary {
        reason: PrimaryReason,
        /// Version of the primary we displaced; only set for
        /// [`PrimaryReason::VersionTransition`].
        previous_version: Option<String>,
    },
    Secondary {
        /// Version the existing primary reported. Always equals the local
        /// version: a differing or unreachable primary is transitioned
        /// instead of joined.
        main_version: String,
    },
}

#[derive(Debug, Clone)]
pub struct Coordinator {
    /// How long to wait for the shared port after a transition is accepted.
    pub wait_for_port_timeout: Duration,
    /// Whether locks naming dead PIDs (or unreadable ones) may be reclaimed.
    pub remove_stale_lock: bool,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self {
            wait_for_port_timeout: DEFAULT_WAIT_FOR_PORT,
            remove_stale_lock: true,
        }
    }
}

impl Coordinator {
    /// Decide whether this process is primary or secondary.
    ///
    /// Strictly sequential: one filesystem or network operation at a time.
    /// Lock contention, unreadable locks and unreachable primaries are
    /// absorbed here; only transition refusal and losing the post-transition
    /// race escape as errors.
    pub async fn run(&self, mgr: &mut InstanceManager) -> Result<RoleOutcome, CoordError> {
        if mgr.try_become_main().await? {
            info!(port = mgr.target_port(), "elected primary");
            return Ok(RoleOutcome::Primary {
                reason: PrimaryReason::Initial,
                previous_version: None,
            });
        }

        if self.remove_stale_lock
            && let Some(outcome) = self.reclaim_stale_lock(mgr).await?
        {
            return Ok(outcome);
        }

        // A live lock holder: compare versions over the control plane.
        let main_version = mgr.fetch_main_version().await;
        if main_version.as_deref() == Some(mgr.version()) {
            let main_version = main_version.unwrap_or_default();
            info!(%main_version, "joining existing primary as secondary");
            return Ok(RoleOutcome::Secondary { main_version });
        }

        // Unknown counts as different: an unreachable-but-locked primary is
        // assumed unhealthy enough to yield or be displaced.
        self.transition(mgr, main_version).await
    }

    /// Reclaim a lock whose holder is gone or whose content is garbage.
    /// `Ok(None)` means the lock looked live (or another process re-won it
    /// mid-reclaim) and election must continue down the version path.
    async fn reclaim_stale_lock(
        &self,
        mgr: &mut InstanceManager,
    ) -> Result<Option<RoleOutcome>, CoordError> {
        let existing = mgr.read_lock().await;
        let stale = match &existing {
            None => true,
            Some(rec) => !InstanceManager::pid_alive(rec.pid as i32),
        };
        if !stale {
            return Ok(None);
        }

        match &existing {
            Some(rec) => warn!(pid = rec.pid, "removing stale lock of dead primary"),
            None => warn!("removing unreadable lock file"),
        }
        mgr.remove_lock().await?;

        if mgr.try_become_main().await? {
            let reason = if existing.is_some() {
                PrimaryReason::StaleLock
            } else {
                PrimaryReason::LockMissing
            };
            info!(?reason, "elected primary after stale-lock reclaim");
            return Ok(Some(RoleOutcome::Primary {
                reason,
                previous_version: None,
            }));
        }

        // Someone else won the reclaim race; treat them as the new primary.
        Ok(None)
    }

    async fn transition(
        &self,
        mgr: &mut InstanceManager,
        main_version: Option<String>,
    ) -> Result<RoleOutcome, CoordError> {
        info!(
            main_version = main_version.as_deref().unwrap_or("unknown"),
            local_version = mgr.version(),
            "requesting version transition from running primary"
        );

        if !mgr.request_main_transition().await {
            return Err(CoordError::TransitionDenied);
        }

        if !mgr.wait_for_port(self.wait_for_port_timeout).await {
            // Not fatal: the election attempt below is the arbiter.
            warn!(
                port = mgr.target_port(),
                "shared port did not free up within the transition window"
            );
        }

        // The departing primary should have removed its lock; clear the
        // window where it has not gotten to it yet.
        mgr.remove_lock().await?;

        if mgr.try_become_main().await? {
            info!("elected primary after version transition");
            return Ok(RoleOutcome::Primary {
                reason: PrimaryReason::VersionTransition,
                previous_version: main_version,
            });
        }
        Err(CoordError::TransitionRaceLost)
    }
}
