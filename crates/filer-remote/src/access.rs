//! Waiting for a share instance's access rules to settle

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessRulesStatus {
    Active,
    Syncing,
    Error,
}

/// Where the current access rules status of a share instance is read from
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn access_rules_status(&self, instance_id: &str) -> Result<AccessRulesStatus>;
}

/// Poll until the instance's access rules are active.
///
/// Sleeps `1.414^tries` seconds between polls. An `Error` status or running
/// past `timeout` fails with [`Error::MigrationFailed`].
pub async fn wait_for_access_update<S>(
    source: &S,
    instance_id: &str,
    timeout: Duration,
) -> Result<()>
where
    S: StatusSource + ?Sized,
{
    let deadline = Instant::now() + timeout;
    let mut tries: i32 = 0;

    loop {
        let status = source.access_rules_status(instance_id).await?;
        if status == AccessRulesStatus::Active {
            return Ok(());
        }

        tries = tries.saturating_add(1);
        if status == AccessRulesStatus::Error {
            return Err(Error::MigrationFailed {
                reason: format!("Failed to update access rules on share instance {instance_id}"),
            });
        }
        if Instant::now() > deadline {
            return Err(Error::MigrationFailed {
                reason: format!(
                    "Timeout trying to update access rules on share instance {instance_id}. Timeout was {} seconds.",
                    timeout.as_secs()
                ),
            });
        }

        // 1.414 = square root of 2
        let pause = Duration::try_from_secs_f64(1.414_f64.powi(tries)).unwrap_or(timeout);
        tracing::debug!("Access rules for {instance_id} are {status:?}, polling again in {pause:?}");
        tokio::time::sleep(pause).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Replays a fixed sequence of statuses, repeating the last one
    struct Scripted(Mutex<Vec<AccessRulesStatus>>);

    impl Scripted {
        fn new(mut statuses: Vec<AccessRulesStatus>) -> Self {
            statuses.reverse();
            Self(Mutex::new(statuses))
        }
    }

    #[async_trait]
    impl StatusSource for Scripted {
        async fn access_rules_status(&self, _instance_id: &str) -> Result<AccessRulesStatus> {
            let mut statuses = self.0.lock().unwrap();
            if statuses.len() > 1 {
                Ok(statuses.pop().unwrap())
            } else {
                Ok(statuses[0])
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_once_active() {
        let source = Scripted::new(vec![
            AccessRulesStatus::Syncing,
            AccessRulesStatus::Syncing,
            AccessRulesStatus::Active,
        ]);
        let start = Instant::now();

        wait_for_access_update(&source, "inst-1", Duration::from_secs(60))
            .await
            .unwrap();

        // 1.414s then ~2s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3400), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_status_fails_immediately() {
        let source = Scripted::new(vec![AccessRulesStatus::Error]);

        let err = wait_for_access_update(&source, "inst-2", Duration::from_secs(60))
            .await
            .unwrap_err();

        match err {
            Error::MigrationFailed { reason } => {
                assert_eq!(reason, "Failed to update access rules on share instance inst-2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_when_never_active() {
        let source = Scripted::new(vec![AccessRulesStatus::Syncing]);

        let err = wait_for_access_update(&source, "inst-3", Duration::from_secs(5))
            .await
            .unwrap_err();

        match err {
            Error::MigrationFailed { reason } => {
                assert!(reason.starts_with("Timeout trying to update access rules"));
                assert!(reason.ends_with("Timeout was 5 seconds."));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
