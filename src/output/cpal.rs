//! Portable output through cpal's default host.
//!
//! cpal streams are not `Send` on every platform, so each stream is built and
//! owned by its own thread and driven over a channel.

use std::thread::{self, JoinHandle};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, StreamConfig};
use crossbeam_channel::{Sender, bounded};
use tracing::{debug, error, warn};

use super::{OutputBackend, OutputDevice, OutputStream, RenderFn};
use crate::error::EngineError;

/// Backend over cpal's default output device.
#[derive(Default)]
pub struct CpalBackend;

impl CpalBackend {
    /// New backend; devices are resolved on demand.
    pub fn new() -> Self {
        Self
    }
}

fn default_device() -> Result<(cpal::Device, cpal::SupportedStreamConfig), EngineError> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or(EngineError::DeviceUnavailable)?;
    let config = device.default_output_config().map_err(|err| {
        warn!(%err, "default output has no usable configuration");
        EngineError::DeviceUnavailable
    })?;
    Ok((device, config))
}

impl OutputBackend for CpalBackend {
    fn default_output(&self) -> Result<OutputDevice, EngineError> {
        let (device, config) = default_device()?;
        Ok(OutputDevice {
            id: 0,
            name: device.name().unwrap_or_else(|_| "default output".into()),
            sample_rate: config.sample_rate().0 as f64,
            channels: config.channels() as usize,
        })
    }

    fn open(
        &self,
        device: &OutputDevice,
        mut render: RenderFn,
    ) -> Result<Box<dyn OutputStream>, EngineError> {
        let (built_tx, built_rx) = bounded(1);
        let (control_tx, control_rx) = bounded::<Control>(4);
        let expected_channels = device.channels;

        let thread = thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || {
                let stream = default_device().and_then(|(device, supported)| {
                    if supported.sample_format() != SampleFormat::F32 {
                        return Err(EngineError::CallbackInstallFailed(format!(
                            "unsupported sample format {:?}",
                            supported.sample_format()
                        )));
                    }
                    let config: StreamConfig = supported.config();
                    if config.channels as usize != expected_channels {
                        return Err(EngineError::CallbackInstallFailed(
                            "default output changed while opening".into(),
                        ));
                    }
                    device
                        .build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| render(data),
                            |err| error!(%err, "output stream error"),
                            None,
                        )
                        .map_err(|err| EngineError::CallbackInstallFailed(err.to_string()))
                });
                let stream = match stream {
                    Ok(stream) => {
                        let _ = built_tx.send(Ok(()));
                        stream
                    }
                    Err(err) => {
                        let _ = built_tx.send(Err(err));
                        return;
                    }
                };

                for message in control_rx {
                    match message {
                        Control::Play(reply) => {
                            let result = stream
                                .play()
                                .map_err(|err| EngineError::StartFailed(err.to_string()));
                            let _ = reply.send(result);
                        }
                        Control::Pause => {
                            if let Err(err) = stream.pause() {
                                debug!(%err, "pause failed");
                            }
                        }
                        Control::Close => break,
                    }
                }
            })
            .map_err(|err| EngineError::CallbackInstallFailed(err.to_string()))?;

        match built_rx.recv() {
            Ok(Ok(())) => Ok(Box::new(CpalStream {
                control: control_tx,
                thread: Some(thread),
            })),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::CallbackInstallFailed(
                    "output thread exited".into(),
                ))
            }
        }
    }
}

enum Control {
    Play(Sender<Result<(), EngineError>>),
    Pause,
    Close,
}

struct CpalStream {
    control: Sender<Control>,
    thread: Option<JoinHandle<()>>,
}

impl OutputStream for CpalStream {
    fn start(&mut self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = bounded(1);
        self.control
            .send(Control::Play(reply_tx))
            .map_err(|_| EngineError::StartFailed("output thread exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| EngineError::StartFailed("output thread exited".into()))?
    }

    fn stop(&mut self) {
        let _ = self.control.send(Control::Pause);
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        let _ = self.control.send(Control::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
