//! Channels between the background monitors and the foreground loop

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::types::TargetResource;

/// Producer side of the current-target channel
#[derive(Debug)]
pub struct TargetPublisher {
    tx: watch::Sender<Option<TargetResource>>,
}

impl TargetPublisher {
    /// Publish `target` if its id differs from the current one
    pub fn publish(&self, target: TargetResource) -> bool {
        self.tx.send_if_modified(|current| {
            let changed = current
                .as_ref()
                .map_or(true, |c| c.resource_id != target.resource_id);
            if changed {
                debug!("Publishing new target {}", target.resource_id);
                *current = Some(target);
            }
            changed
        })
    }

    pub fn current_id(&self) -> Option<u64> {
        self.tx.borrow().as_ref().map(|t| t.resource_id)
    }

    pub fn subscribe(&self) -> TargetWatch {
        TargetWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Consumer side: polled for changes without consuming them
#[derive(Debug, Clone)]
pub struct TargetWatch {
    rx: watch::Receiver<Option<TargetResource>>,
}

impl TargetWatch {
    /// A target newer than the last acknowledged one is waiting
    pub fn changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }

    /// Mark the current target as seen and return it
    pub fn acknowledge(&mut self) -> Option<TargetResource> {
        self.rx.borrow_and_update().clone()
    }

    pub fn current(&self) -> Option<TargetResource> {
        self.rx.borrow().clone()
    }
}

/// `initial` counts as already acknowledged
pub fn target_channel(initial: Option<TargetResource>) -> (TargetPublisher, TargetWatch) {
    let (tx, rx) = watch::channel(initial);
    (TargetPublisher { tx }, TargetWatch { rx })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaceRequest {
    pub reason: String,
}

/// Cloneable handle for asking the foreground loop to replace the target
#[derive(Debug, Clone)]
pub struct ReplaceRequester {
    tx: mpsc::UnboundedSender<ReplaceRequest>,
}

impl ReplaceRequester {
    /// False once the foreground loop is gone
    pub fn request(&self, reason: &str) -> bool {
        self.tx
            .send(ReplaceRequest {
                reason: reason.to_string(),
            })
            .is_ok()
    }
}

pub fn replace_channel() -> (ReplaceRequester, mpsc::UnboundedReceiver<ReplaceRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReplaceRequester { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(id: u64) -> TargetResource {
        TargetResource::new(id, id * 10, "a", 0, 0, 100)
    }

    #[test]
    fn test_same_target_is_not_a_change() {
        let (publisher, mut watch) = target_channel(Some(target(1)));
        assert!(!watch.changed());

        assert!(!publisher.publish(target(1)));
        assert!(!watch.changed());

        assert!(publisher.publish(target(2)));
        assert!(watch.changed());
        // Clones observe the same pending change
        assert!(watch.clone().changed());

        assert_eq!(watch.acknowledge().unwrap().resource_id, 2);
        assert!(!watch.changed());
        assert_eq!(publisher.current_id(), Some(2));
    }

    #[tokio::test]
    async fn test_replace_requests_queue_in_order() {
        let (requester, mut rx) = replace_channel();
        assert!(requester.clone().request("manual"));
        assert!(requester.request("failed cycles"));

        assert_eq!(rx.recv().await.unwrap().reason, "manual");
        assert_eq!(rx.recv().await.unwrap().reason, "failed cycles");

        drop(rx);
        assert!(!requester.request("late"));
    }

    #[test]
    fn test_request_wakes_the_waiting_loop() {
        let (requester, mut rx) = replace_channel();
        let mut recv = tokio_test::task::spawn(rx.recv());
        tokio_test::assert_pending!(recv.poll());

        requester.request("manual");
        assert!(recv.is_woken());
        let request = tokio_test::assert_ready!(recv.poll());
        assert_eq!(request.unwrap().reason, "manual");
    }
}
