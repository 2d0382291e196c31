use browser_proto::HostMessage;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Sending half of one viewer websocket.
///
/// The socket's writer task owns the receiver; once that task exits the
/// channel closes and [`ViewerHandle::is_open`] turns false.
#[derive(Debug, Clone)]
pub struct ViewerHandle {
    id: Uuid,
    tx: mpsc::Sender<HostMessage>,
}

impl ViewerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HostMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Queues a control message, waiting for room. Returns false if the
    /// viewer is gone.
    pub async fn send(&self, message: HostMessage) -> bool {
        if !self.is_open() {
            return false;
        }
        self.tx.send(message).await.is_ok()
    }

    /// Offers a frame without waiting; a full queue drops it.
    pub fn offer_frame(&self, frame: HostMessage) -> FrameDelivery {
        match self.tx.try_send(frame) {
            Ok(()) => FrameDelivery::Queued,
            Err(TrySendError::Full(_)) => FrameDelivery::Dropped,
            Err(TrySendError::Closed(_)) => FrameDelivery::ViewerGone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDelivery {
    Queued,
    Dropped,
    ViewerGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: i64) -> HostMessage {
        HostMessage::Frame {
            data: String::new(),
            timestamp: n,
            session_id: "s1".into(),
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn full_queue_drops_frames_but_not_control_messages() {
        let (viewer, mut rx) = ViewerHandle::channel(1);
        assert_eq!(viewer.offer_frame(frame(1)), FrameDelivery::Queued);
        assert_eq!(viewer.offer_frame(frame(2)), FrameDelivery::Dropped);

        assert_eq!(rx.recv().await, Some(frame(1)));
        assert!(
            viewer
                .send(HostMessage::StreamingStopped {
                    session_id: "s1".into()
                })
                .await
        );
        assert!(matches!(
            rx.recv().await,
            Some(HostMessage::StreamingStopped { .. })
        ));
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dropped_receiver_marks_viewer_gone() {
        let (viewer, rx) = ViewerHandle::channel(4);
        drop(rx);
        assert!(!viewer.is_open());
        assert_eq!(viewer.offer_frame(frame(1)), FrameDelivery::ViewerGone);
        assert!(!viewer.send(HostMessage::error(None, "late")).await);
    }
}
