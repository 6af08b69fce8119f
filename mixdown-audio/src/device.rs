//! Output device - runs the mixer inside a cpal output stream

use crate::error::{AudioError, Result};
use crate::mixer::Mixer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{bounded, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// Output stream running on its own thread.
///
/// cpal streams cannot move between threads, so the stream is built, played
/// and dropped on a dedicated thread that parks until told to stop.
pub(crate) struct OutputDevice {
    stop: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl OutputDevice {
    /// Open the default output device and start pulling from `mixer`
    pub(crate) fn start(mixer: Mixer, channels: usize, sample_rate: u32) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("mixdown-output".into())
            .spawn(move || {
                let stream = match build_stream(mixer, channels, sample_rate) {
                    Ok((stream, name)) => {
                        let _ = ready_tx.send(Ok(name));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                // Park until the session stops us, then drop the stream here
                let _ = stop_rx.recv();
                drop(stream);
                debug!("Output stream closed");
            })
            .map_err(|e| AudioError::invalid_operation(format!("failed to spawn output thread: {e}")))?;

        let outcome = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(AudioError::invalid_operation("output thread exited early")));

        match outcome {
            Ok(name) => {
                info!("Output stream started on '{}' ({} Hz, {} ch)", name, sample_rate, channels);
                Ok(Self {
                    stop: stop_tx,
                    thread: Some(thread),
                })
            }
            Err(e) => {
                let _ = thread.join();
                Err(e)
            }
        }
    }

    /// Stop the stream and join its thread
    pub(crate) fn stop(&mut self) {
        let _ = self.stop.try_send(());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Output thread panicked");
            }
        }
    }
}

impl Drop for OutputDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_stream(
    mut mixer: Mixer,
    channels: usize,
    sample_rate: u32,
) -> Result<(cpal::Stream, String)> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::invalid_operation("no audio output device found"))?;
    let name = device.name().unwrap_or_else(|_| "unknown".into());

    let config = cpal::StreamConfig {
        channels: channels as cpal::ChannelCount,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mixer.process(data);
            },
            |err| {
                error!("Audio stream error: {}", err);
            },
            None,
        )
        .map_err(|e| AudioError::invalid_operation(format!("failed to create audio stream: {e}")))?;

    stream
        .play()
        .map_err(|e| AudioError::invalid_operation(format!("failed to start audio: {e}")))?;

    Ok((stream, name))
}
