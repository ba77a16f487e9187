use crate::stream::{MediaKind, MediaStream};
use crate::MediaDevice;
use log::{debug, info, warn};
use room_core::Error;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Held {
    stream: Option<MediaStream>,
    /// Counts successful acquire calls, including ones that reuse the stream
    acquisitions: u64,
}

/// Identifies one successful `acquire` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTicket(u64);

/// Lazily acquires the local audio stream and shares it with every
/// outgoing connection until released.
pub struct CaptureManager {
    device: Arc<dyn MediaDevice>,
    held: Mutex<Held>,
}

impl CaptureManager {
    pub fn new(device: Arc<dyn MediaDevice>) -> Self {
        Self {
            device,
            held: Mutex::new(Held::default()),
        }
    }

    /// Return the held stream, opening the device if none is held.
    ///
    /// Concurrent callers wait on the same acquisition, so the device is
    /// opened at most once per held stream.
    pub async fn acquire(&self) -> Result<MediaStream, Error> {
        self.acquire_with_ticket().await.map(|(stream, _)| stream)
    }

    /// Like `acquire`, also returning a ticket for `release_if_unclaimed`
    pub async fn acquire_with_ticket(&self) -> Result<(MediaStream, CaptureTicket), Error> {
        let mut held = self.held.lock().await;
        if let Some(stream) = held.stream.clone() {
            held.acquisitions += 1;
            return Ok((stream, CaptureTicket(held.acquisitions)));
        }

        match self.device.acquire(MediaKind::Audio).await {
            Ok(stream) => {
                info!("Acquired local audio stream {}", stream.id());
                held.stream = Some(stream.clone());
                held.acquisitions += 1;
                Ok((stream, CaptureTicket(held.acquisitions)))
            }
            Err(Error::CaptureDenied(reason)) => {
                warn!("Audio capture denied: {}", reason);
                Err(Error::CaptureDenied(reason))
            }
            Err(other) => {
                warn!("Audio capture failed: {}", other);
                Err(Error::CaptureDenied(other.to_string()))
            }
        }
    }

    /// Stop and discard the held stream, if any
    pub async fn release(&self) {
        let stream = self.held.lock().await.stream.take();
        if let Some(stream) = stream {
            stream.stop();
            info!("Released local audio stream {}", stream.id());
        }
    }

    /// Release the held stream only if nobody acquired it after `ticket`.
    /// Returns whether a stream was released.
    pub async fn release_if_unclaimed(&self, ticket: CaptureTicket) -> bool {
        let mut held = self.held.lock().await;
        if held.acquisitions != ticket.0 {
            return false;
        }
        match held.stream.take() {
            Some(stream) => {
                stream.stop();
                info!("Released unclaimed local audio stream {}", stream.id());
                true
            }
            None => false,
        }
    }

    /// Enable or disable every local track. No-op without a held stream.
    pub async fn set_local_muted(&self, muted: bool) {
        match self.held.lock().await.stream.as_ref() {
            Some(stream) => {
                stream.set_enabled(!muted);
                debug!("Local audio {}", if muted { "muted" } else { "unmuted" });
            }
            None => debug!("No local stream held, ignoring mute change"),
        }
    }

    pub async fn current(&self) -> Option<MediaStream> {
        self.held.lock().await.stream.clone()
    }

    pub async fn is_held(&self) -> bool {
        self.held.lock().await.stream.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MockMediaDevice;
    use tokio_test::assert_ok;

    fn counting_device(times: usize) -> MockMediaDevice {
        let mut device = MockMediaDevice::new();
        device
            .expect_acquire()
            .times(times)
            .returning(|_| Ok(MediaStream::detached()));
        device
    }

    #[tokio::test]
    async fn acquire_is_idempotent_while_held() {
        let manager = CaptureManager::new(Arc::new(counting_device(1)));

        let first = assert_ok!(manager.acquire().await);
        let second = assert_ok!(manager.acquire().await);

        assert!(first.ptr_eq(&second));
        assert!(manager.is_held().await);
    }

    #[tokio::test]
    async fn concurrent_acquire_opens_device_once() {
        let manager = Arc::new(CaptureManager::new(Arc::new(counting_device(1))));

        let (a, b) = tokio::join!(manager.acquire(), manager.acquire());
        assert!(a.unwrap().ptr_eq(&b.unwrap()));
    }

    #[tokio::test]
    async fn release_stops_and_allows_reacquire() {
        let manager = CaptureManager::new(Arc::new(counting_device(2)));

        let first = manager.acquire().await.unwrap();
        manager.release().await;
        assert!(first.is_stopped());
        assert!(!manager.is_held().await);

        let second = manager.acquire().await.unwrap();
        assert!(!second.ptr_eq(&first));
    }

    #[tokio::test]
    async fn release_without_stream_is_noop() {
        let manager = CaptureManager::new(Arc::new(counting_device(0)));
        manager.release().await;
        manager.release().await;
        assert!(!manager.is_held().await);
    }

    #[tokio::test]
    async fn denial_is_reported_and_nothing_held() {
        let mut device = MockMediaDevice::new();
        device
            .expect_acquire()
            .returning(|_| Err(Error::CaptureDenied("permission denied".to_string())));
        let manager = CaptureManager::new(Arc::new(device));

        let result = manager.acquire().await;
        assert!(matches!(result, Err(Error::CaptureDenied(_))));
        assert!(!manager.is_held().await);
    }

    #[tokio::test]
    async fn device_failure_maps_to_capture_denied() {
        let mut device = MockMediaDevice::new();
        device
            .expect_acquire()
            .returning(|_| Err(Error::Audio("device busy".to_string())));
        let manager = CaptureManager::new(Arc::new(device));

        assert!(matches!(manager.acquire().await, Err(Error::CaptureDenied(_))));
    }

    #[tokio::test]
    async fn unclaimed_release_respects_later_acquires() {
        let manager = CaptureManager::new(Arc::new(counting_device(2)));

        let (_, first) = assert_ok!(manager.acquire_with_ticket().await);
        let (_, second) = assert_ok!(manager.acquire_with_ticket().await);
        assert!(!manager.release_if_unclaimed(first).await);
        assert!(manager.is_held().await);

        assert!(manager.release_if_unclaimed(second).await);
        assert!(!manager.is_held().await);
        assert!(!manager.release_if_unclaimed(second).await);

        let (_, third) = assert_ok!(manager.acquire_with_ticket().await);
        assert_ne!(third, second);
    }

    #[tokio::test]
    async fn mute_toggles_tracks() {
        let manager = CaptureManager::new(Arc::new(counting_device(1)));
        // Without a stream this must not panic
        manager.set_local_muted(true).await;

        let stream = manager.acquire().await.unwrap();
        manager.set_local_muted(true).await;
        assert!(!stream.tracks()[0].is_enabled());
        manager.set_local_muted(false).await;
        assert!(stream.tracks()[0].is_enabled());
    }
}
