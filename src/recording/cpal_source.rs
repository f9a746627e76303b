//! Microphone capture through cpal
//!
//! The cpal stream is not Send, so it lives on its own thread for as long as
//! capture runs. The callback converts to interleaved i16 and pushes into a
//! ring buffer that `read` drains from the audio worker.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::Sender;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapRb};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::AudioConfig;
use crate::encoding::encoder::Result;
use crate::encoding::{EncoderError, PcmChunk, PcmSource};

/// Seconds of audio the ring buffer holds before dropping samples
const RING_SECONDS: usize = 2;

/// Interleaved samples per 10 ms at the configured format
fn chunk_len(config: &AudioConfig) -> usize {
    (config.sample_rate as usize / 100) * config.channels as usize
}

struct StreamThread {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// PCM source backed by the default cpal input device
pub struct CpalPcmSource {
    config: AudioConfig,
    consumer: Option<HeapCons<i16>>,
    stream: Option<StreamThread>,
    dropped: Arc<AtomicU64>,
}

impl CpalPcmSource {
    pub fn new(config: &AudioConfig) -> Result<Self> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| EncoderError::Capture("no default input device".into()))?;
        log::info!(
            "[Audio] cpal input: {}",
            device.name().unwrap_or_else(|_| "unknown".into())
        );
        Ok(Self {
            config: config.clone(),
            consumer: None,
            stream: None,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PcmSource for CpalPcmSource {
    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let capacity = self.config.sample_rate as usize * self.config.channels as usize * RING_SECONDS;
        let (mut producer, consumer) = HeapRb::<i16>::new(capacity).split();
        let stream_config = cpal::StreamConfig {
            channels: self.config.channels,
            sample_rate: cpal::SampleRate(self.config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let dropped = self.dropped.clone();

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);
        let (shutdown, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("mediarecorder-cpal".into())
            .spawn(move || {
                let Some(device) = cpal::default_host().default_input_device() else {
                    let _ = ready_tx.send(Err("input device disappeared".into()));
                    return;
                };

                let mut converted: Vec<i16> = Vec::new();
                let stream = device.build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        converted.clear();
                        converted.extend(data.iter().map(|s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16));
                        let pushed = producer.push_slice(&converted);
                        if pushed < converted.len() {
                            dropped.fetch_add((converted.len() - pushed) as u64, Ordering::Relaxed);
                        }
                    },
                    |err| log::warn!("[Audio] cpal stream error: {}", err),
                    None,
                );

                let stream = match stream.map_err(|e| e.to_string()).and_then(|s| {
                    s.play().map_err(|e| e.to_string())?;
                    Ok(s)
                }) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                // Keep the stream alive until stop() or the source is dropped
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.consumer = Some(consumer);
                self.stream = Some(StreamThread { shutdown, handle });
                log::info!(
                    "[Audio] cpal capture started ({} Hz, {} ch)",
                    self.config.sample_rate,
                    self.config.channels
                );
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(EncoderError::Capture(format!("Failed to open input stream: {}", e)))
            }
            Err(_) => {
                let _ = handle.join();
                Err(EncoderError::Capture("input stream thread exited".into()))
            }
        }
    }

    fn read(&mut self, timeout: Duration) -> Result<Option<PcmChunk>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Err(EncoderError::Capture("capture not started".into()));
        };

        let wanted = chunk_len(&self.config).max(1);
        let deadline = Instant::now() + timeout;
        while consumer.occupied_len() < wanted && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }

        let available = consumer.occupied_len();
        if available == 0 {
            return Ok(None);
        }
        let mut samples = vec![0i16; available];
        let read = consumer.pop_slice(&mut samples);
        samples.truncate(read);
        Ok(Some(PcmChunk::new(samples)))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown.send(());
            if stream.handle.join().is_err() {
                log::error!("[Audio] cpal stream thread panicked");
            }
        }
        self.consumer = None;

        let dropped = self.dropped_samples();
        if dropped > 0 {
            log::warn!("[Audio] Ring buffer overflowed, {} samples dropped", dropped);
        }
        Ok(())
    }
}

impl Drop for CpalPcmSource {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_is_ten_milliseconds() {
        let config = AudioConfig {
            sample_rate: 48_000,
            channels: 2,
            ..AudioConfig::default()
        };
        assert_eq!(chunk_len(&config), 960);
    }
}
