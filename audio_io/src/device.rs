use crate::stream::{CaptureGuard, LocalAudioTrack, MediaKind, MediaStream};
use async_trait::async_trait;
use log::{debug, warn};
use room_core::{AudioBuffer, Error, FRAME_MS, FRAME_SAMPLES, SAMPLE_RATE};
use std::time::Duration;
use tokio::task::AbortHandle;

/// Source of local media. Acquisition may be refused by the user or the OS.
#[cfg_attr(any(test, feature = "test_utils"), mockall::automock)]
#[async_trait]
pub trait MediaDevice: Send + Sync {
    /// Open the device and start producing frames into the returned stream.
    /// Refusal surfaces as `Error::CaptureDenied`.
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, Error>;
}

/// Synthetic microphone producing a continuous sine tone.
pub struct ToneDevice {
    frequency_hz: f32,
    amplitude: f32,
}

impl ToneDevice {
    pub fn new(frequency_hz: f32) -> Self {
        Self {
            frequency_hz,
            amplitude: 0.5,
        }
    }
}

struct TaskGuard(AbortHandle);

impl CaptureGuard for TaskGuard {
    fn stop(&self) {
        self.0.abort();
    }
}

#[async_trait]
impl MediaDevice for ToneDevice {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, Error> {
        let MediaKind::Audio = kind;
        let stream_id = uuid::Uuid::new_v4().to_string();
        let track = LocalAudioTrack::new(&stream_id);
        let pump_track = track.clone();
        let frequency = self.frequency_hz;
        let amplitude = self.amplitude;

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(FRAME_MS));
            let mut phase = 0.0f32;
            loop {
                ticker.tick().await;
                let frame = tone_frame(frequency, amplitude, &mut phase);
                if let Err(e) = pump_track.write_frame(&frame).await {
                    warn!("Tone track write failed: {}", e);
                }
            }
        });

        debug!("Tone device started at {} Hz", frequency);
        Ok(MediaStream::new(
            stream_id,
            vec![track],
            Some(Box::new(TaskGuard(task.abort_handle()))),
        ))
    }
}

/// One frame of sine tone, advancing `phase`
pub fn tone_frame(frequency_hz: f32, amplitude: f32, phase: &mut f32) -> AudioBuffer {
    let step = 2.0 * std::f32::consts::PI * frequency_hz / SAMPLE_RATE as f32;
    let mut frame = Vec::with_capacity(FRAME_SAMPLES);
    for _ in 0..FRAME_SAMPLES {
        frame.push(phase.sin() * amplitude);
        *phase = (*phase + step) % (2.0 * std::f32::consts::PI);
    }
    frame
}
