//! Hardware microphone capture via cpal.
//!
//! cpal streams are not `Send`, so each acquisition owns a dedicated thread
//! that builds the input stream, keeps it alive and drops it on stop.

use crate::stream::{CaptureGuard, LocalAudioTrack, MediaKind, MediaStream};
use crate::MediaDevice;
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use log::{debug, error, info, warn};
use room_core::{AudioBuffer, Error, FRAME_SAMPLES, SAMPLE_RATE};
use std::sync::mpsc as std_mpsc;
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Default (or named) system input device
pub struct CpalMicrophone {
    /// Device name, empty for the system default
    device_name: String,
}

impl CpalMicrophone {
    pub fn new(device_name: impl Into<String>) -> Self {
        Self {
            device_name: device_name.into(),
        }
    }
}

impl Default for CpalMicrophone {
    fn default() -> Self {
        Self::new("")
    }
}

/// Downmixes interleaved device audio and decimates it to the wire rate,
/// emitting fixed-size frames.
struct Downsampler {
    channels: usize,
    ratio: f64,
    position: f64,
    acc: f32,
    count: u32,
    frame: AudioBuffer,
}

impl Downsampler {
    fn new(device_rate: u32, channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            ratio: device_rate as f64 / SAMPLE_RATE as f64,
            position: 0.0,
            acc: 0.0,
            count: 0,
            frame: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    fn push(&mut self, interleaved: &[f32], mut emit: impl FnMut(AudioBuffer)) {
        for chunk in interleaved.chunks(self.channels) {
            let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.acc += mono;
            self.count += 1;
            self.position += 1.0;

            if self.position >= self.ratio {
                self.position -= self.ratio;
                self.frame.push(self.acc / self.count as f32);
                self.acc = 0.0;
                self.count = 0;

                if self.frame.len() == FRAME_SAMPLES {
                    let full = std::mem::replace(&mut self.frame, Vec::with_capacity(FRAME_SAMPLES));
                    emit(full);
                }
            }
        }
    }
}

struct MicrophoneGuard {
    stop_tx: Mutex<Option<std_mpsc::Sender<()>>>,
    pump: AbortHandle,
}

impl CaptureGuard for MicrophoneGuard {
    fn stop(&self) {
        // Dropping the sender wakes the capture thread, which drops the stream
        if let Ok(mut slot) = self.stop_tx.lock() {
            slot.take();
        }
        self.pump.abort();
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames_tx: mpsc::Sender<AudioBuffer>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut downsampler = Downsampler::new(config.sample_rate.0, config.channels as usize);
    let mut scratch: Vec<f32> = Vec::new();

    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            scratch.clear();
            scratch.extend(data.iter().map(|s| s.to_sample::<f32>()));
            downsampler.push(&scratch, |frame| {
                // Never block the audio callback; a slow consumer loses frames
                let _ = frames_tx.try_send(frame);
            });
        },
        |err| error!("Microphone stream error: {}", err),
        None,
    )
}

fn open_device(name: &str) -> Result<cpal::Device, Error> {
    let host = cpal::default_host();
    let device = if name.is_empty() {
        host.default_input_device()
    } else {
        host.input_devices()
            .map_err(|e| Error::CaptureDenied(format!("Cannot enumerate input devices: {}", e)))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
    };
    device.ok_or_else(|| Error::CaptureDenied(format!("No input device available ({:?})", name)))
}

/// Runs on the capture thread: build and start the stream, report the
/// outcome, then hold the stream until asked to stop.
fn run_capture(
    device_name: String,
    frames_tx: mpsc::Sender<AudioBuffer>,
    ready_tx: oneshot::Sender<Result<(), Error>>,
    stop_rx: std_mpsc::Receiver<()>,
) {
    let started = (|| {
        let device = open_device(&device_name)?;
        let supported = device
            .default_input_config()
            .map_err(|e| Error::CaptureDenied(format!("No usable input config: {}", e)))?;
        let sample_format = supported.sample_format();
        let config: cpal::StreamConfig = supported.into();

        let stream = match sample_format {
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, frames_tx),
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, frames_tx),
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, frames_tx),
            other => {
                return Err(Error::CaptureDenied(format!(
                    "Unsupported sample format {:?}",
                    other
                )))
            }
        }
        .map_err(|e| Error::CaptureDenied(format!("Failed to open input stream: {}", e)))?;

        stream
            .play()
            .map_err(|e| Error::CaptureDenied(format!("Failed to start input stream: {}", e)))?;

        info!(
            "Microphone capture started: {} Hz, {} channel(s)",
            config.sample_rate.0, config.channels
        );
        Ok(stream)
    })();

    match started {
        Ok(stream) => {
            let _ = ready_tx.send(Ok(()));
            // Blocks until the guard drops its sender
            let _ = stop_rx.recv();
            drop(stream);
            info!("Microphone capture stopped");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

#[async_trait]
impl MediaDevice for CpalMicrophone {
    async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, Error> {
        let MediaKind::Audio = kind;
        let (frames_tx, mut frames_rx) = mpsc::channel::<AudioBuffer>(50);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel();

        let device_name = self.device_name.clone();
        std::thread::Builder::new()
            .name("microphone-capture".to_string())
            .spawn(move || run_capture(device_name, frames_tx, ready_tx, stop_rx))
            .map_err(|e| Error::CaptureDenied(format!("Failed to spawn capture thread: {}", e)))?;

        ready_rx
            .await
            .map_err(|_| Error::CaptureDenied("Capture thread exited".to_string()))??;

        let stream_id = uuid::Uuid::new_v4().to_string();
        let track = LocalAudioTrack::new(&stream_id);
        let pump_track = track.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if let Err(e) = pump_track.write_frame(&frame).await {
                    warn!("Microphone track write failed: {}", e);
                }
            }
            debug!("Microphone frame pump ended");
        });

        Ok(MediaStream::new(
            stream_id,
            vec![track],
            Some(Box::new(MicrophoneGuard {
                stop_tx: Mutex::new(Some(stop_tx)),
                pump: pump.abort_handle(),
            })),
        ))
    }
}
