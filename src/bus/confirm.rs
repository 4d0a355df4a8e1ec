//! Publisher confirmation bookkeeping.
//!
//! A confirm-mode session numbers its publishes 1, 2, 3, ... and expects
//! exactly one acknowledgement per publish, in order. Anything else means the
//! channel is out of sync and the session must not be reused.

use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use super::{BusError, Result};

/// Broker acknowledgement of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub delivery_tag: u64,
    pub ack: bool,
}

/// Per-session confirmation tracker.
#[derive(Debug)]
pub struct ConfirmTracker {
    next_tag: u64,
    wait: Duration,
    poisoned: bool,
}

impl ConfirmTracker {
    pub fn new(wait: Duration) -> Self {
        Self {
            next_tag: 1,
            wait,
            poisoned: false,
        }
    }

    /// Tag the next publish is expected to be confirmed with.
    pub fn next_tag(&self) -> u64 {
        self.next_tag
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Fails once a previous confirmation left the session out of sync.
    pub fn check(&self) -> Result<()> {
        if self.poisoned {
            return Err(BusError::Publish(
                "session is out of sync with the broker".to_string(),
            ));
        }
        Ok(())
    }

    /// Wait for the confirmation of the publish just sent.
    ///
    /// Returns the settled delivery tag on ack.
    pub async fn settle<F>(&mut self, confirmation: F) -> Result<u64>
    where
        F: Future<Output = Result<Confirmation>>,
    {
        self.check()?;
        let expected = self.next_tag;
        self.next_tag += 1;

        let confirmation = match tokio::time::timeout(self.wait, confirmation).await {
            Ok(Ok(c)) => c,
            Ok(Err(e)) => {
                self.poisoned = true;
                return Err(e);
            }
            Err(_) => {
                self.poisoned = true;
                error!(delivery_tag = expected, wait = ?self.wait, "publish confirmation timed out");
                return Err(BusError::PublishTimeout {
                    delivery_tag: expected,
                });
            }
        };

        if confirmation.delivery_tag != expected {
            self.poisoned = true;
            error!(
                expected,
                got = confirmation.delivery_tag,
                "publish confirmation out of sequence"
            );
            return Err(BusError::SequenceMismatch {
                expected,
                got: confirmation.delivery_tag,
            });
        }
        if !confirmation.ack {
            warn!(delivery_tag = expected, "broker rejected publish");
            return Err(BusError::PublishRejected {
                delivery_tag: expected,
            });
        }
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(delivery_tag: u64) -> Confirmation {
        Confirmation {
            delivery_tag,
            ack: true,
        }
    }

    #[tokio::test]
    async fn test_tags_start_at_one_and_increase() {
        let mut tracker = ConfirmTracker::new(Duration::from_secs(1));
        assert_eq!(tracker.next_tag(), 1);
        assert_eq!(tracker.settle(async { Ok(ack(1)) }).await.unwrap(), 1);
        assert_eq!(tracker.settle(async { Ok(ack(2)) }).await.unwrap(), 2);
        assert_eq!(tracker.next_tag(), 3);
    }

    #[tokio::test]
    async fn test_nack_is_rejected_but_session_survives() {
        let mut tracker = ConfirmTracker::new(Duration::from_secs(1));
        let nack = Confirmation {
            delivery_tag: 1,
            ack: false,
        };
        let err = tracker.settle(async move { Ok(nack) }).await.unwrap_err();
        assert!(matches!(err, BusError::PublishRejected { delivery_tag: 1 }));
        assert!(!tracker.is_poisoned());
        assert_eq!(tracker.settle(async { Ok(ack(2)) }).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sequence_mismatch_poisons_session() {
        let mut tracker = ConfirmTracker::new(Duration::from_secs(1));
        let err = tracker.settle(async { Ok(ack(7)) }).await.unwrap_err();
        assert!(matches!(
            err,
            BusError::SequenceMismatch {
                expected: 1,
                got: 7
            }
        ));
        assert!(tracker.is_poisoned());
        assert!(tracker.settle(async { Ok(ack(2)) }).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_ack_times_out() {
        let mut tracker = ConfirmTracker::new(Duration::from_millis(20));
        let err = tracker
            .settle(std::future::pending::<Result<Confirmation>>())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::PublishTimeout { delivery_tag: 1 }));
        assert!(tracker.is_poisoned());
    }
}
