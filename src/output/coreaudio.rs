//! CoreAudio HAL output: default device lookup and an IOProc per stream.

use std::ffi::{CStr, c_void};
use std::mem::size_of;
use std::ptr;
use std::slice;

use coreaudio_sys::{
    AudioBufferList, AudioDeviceCreateIOProcID, AudioDeviceDestroyIOProcID, AudioDeviceID,
    AudioDeviceIOProcID, AudioDeviceStart, AudioDeviceStop, AudioObjectGetPropertyData,
    AudioObjectGetPropertyDataSize, AudioObjectID, AudioObjectPropertyAddress, AudioTimeStamp,
    OSStatus, kAudioDevicePropertyDeviceName, kAudioDevicePropertyNominalSampleRate,
    kAudioDevicePropertyStreamConfiguration, kAudioDeviceUnknown,
    kAudioHardwarePropertyDefaultOutputDevice, kAudioObjectPropertyScopeGlobal,
    kAudioObjectPropertyScopeOutput, kAudioObjectSystemObject,
};
use tracing::debug;

use super::{OutputBackend, OutputDevice, OutputStream, RenderFn};
use crate::error::EngineError;

const ELEMENT_MAIN: u32 = 0;

fn address(selector: u32, scope: u32) -> AudioObjectPropertyAddress {
    AudioObjectPropertyAddress {
        mSelector: selector,
        mScope: scope,
        mElement: ELEMENT_MAIN,
    }
}

/// Read a fixed size property. `None` on any non-zero status.
unsafe fn get_property<T: Copy>(object: AudioObjectID, addr: &AudioObjectPropertyAddress, mut value: T) -> Option<T> {
    let mut size = size_of::<T>() as u32;
    let status = unsafe {
        AudioObjectGetPropertyData(
            object,
            addr,
            0,
            ptr::null(),
            &mut size,
            &mut value as *mut T as *mut c_void,
        )
    };
    (status == 0).then_some(value)
}

fn default_output_id() -> Option<AudioDeviceID> {
    let addr = address(
        kAudioHardwarePropertyDefaultOutputDevice,
        kAudioObjectPropertyScopeGlobal,
    );
    let id = unsafe { get_property::<AudioDeviceID>(kAudioObjectSystemObject, &addr, kAudioDeviceUnknown)? };
    (id != kAudioDeviceUnknown).then_some(id)
}

fn device_name(device: AudioDeviceID) -> String {
    let addr = address(kAudioDevicePropertyDeviceName, kAudioObjectPropertyScopeGlobal);
    let raw = unsafe { get_property::<[u8; 256]>(device, &addr, [0u8; 256]) };
    raw.and_then(|bytes| {
        CStr::from_bytes_until_nul(&bytes)
            .ok()
            .map(|name| name.to_string_lossy().into_owned())
    })
    .unwrap_or_else(|| format!("device {device}"))
}

fn sample_rate(device: AudioDeviceID) -> f64 {
    let addr = address(kAudioDevicePropertyNominalSampleRate, kAudioObjectPropertyScopeGlobal);
    unsafe { get_property::<f64>(device, &addr, 0.0) }.unwrap_or(0.0)
}

/// Channels of the first output buffer, which is the one we render.
fn output_channels(device: AudioDeviceID) -> Option<usize> {
    let addr = address(
        kAudioDevicePropertyStreamConfiguration,
        kAudioObjectPropertyScopeOutput,
    );
    let mut size = 0u32;
    let status = unsafe { AudioObjectGetPropertyDataSize(device, &addr, 0, ptr::null(), &mut size) };
    if status != 0 || (size as usize) < size_of::<AudioBufferList>() {
        return None;
    }
    // u64 backing keeps the list suitably aligned.
    let mut storage = vec![0u64; (size as usize).div_ceil(size_of::<u64>())];
    let status = unsafe {
        AudioObjectGetPropertyData(
            device,
            &addr,
            0,
            ptr::null(),
            &mut size,
            storage.as_mut_ptr() as *mut c_void,
        )
    };
    if status != 0 {
        return None;
    }
    let list = unsafe { &*(storage.as_ptr() as *const AudioBufferList) };
    if list.mNumberBuffers == 0 {
        return None;
    }
    Some(list.mBuffers[0].mNumberChannels as usize)
}

/// Backend over the system default output device.
#[derive(Default)]
pub struct CoreAudioBackend;

impl CoreAudioBackend {
    /// New backend; devices are resolved on demand.
    pub fn new() -> Self {
        Self
    }
}

impl OutputBackend for CoreAudioBackend {
    fn default_output(&self) -> Result<OutputDevice, EngineError> {
        let id = default_output_id().ok_or(EngineError::DeviceUnavailable)?;
        let channels = output_channels(id).ok_or(EngineError::DeviceUnavailable)?;
        Ok(OutputDevice {
            id,
            name: device_name(id),
            sample_rate: sample_rate(id),
            channels,
        })
    }

    fn open(&self, device: &OutputDevice, render: RenderFn) -> Result<Box<dyn OutputStream>, EngineError> {
        let state = Box::into_raw(Box::new(RenderState { render }));
        let mut proc_id: AudioDeviceIOProcID = None;
        let status = unsafe {
            AudioDeviceCreateIOProcID(device.id, Some(io_proc), state as *mut c_void, &mut proc_id)
        };
        if status != 0 || proc_id.is_none() {
            // SAFETY: the HAL did not take ownership of the state.
            drop(unsafe { Box::from_raw(state) });
            return Err(EngineError::CallbackInstallFailed(format!("OSStatus {status}")));
        }
        debug!(device = device.id, "io proc installed");
        Ok(Box::new(CoreAudioStream {
            device: device.id,
            proc_id,
            state,
            running: false,
        }))
    }
}

struct RenderState {
    render: RenderFn,
}

unsafe extern "C" fn io_proc(
    _device: AudioObjectID,
    _now: *const AudioTimeStamp,
    _input: *const AudioBufferList,
    _input_time: *const AudioTimeStamp,
    output: *mut AudioBufferList,
    _output_time: *const AudioTimeStamp,
    client_data: *mut c_void,
) -> OSStatus {
    if output.is_null() || client_data.is_null() {
        return 0;
    }
    let state = unsafe { &mut *(client_data as *mut RenderState) };
    let list = unsafe { &mut *output };
    if list.mNumberBuffers == 0 {
        return 0;
    }
    let buffers = unsafe {
        slice::from_raw_parts_mut(list.mBuffers.as_mut_ptr(), list.mNumberBuffers as usize)
    };
    for (index, buffer) in buffers.iter_mut().enumerate() {
        if buffer.mData.is_null() {
            continue;
        }
        let samples = buffer.mDataByteSize as usize / size_of::<f32>();
        let out = unsafe { slice::from_raw_parts_mut(buffer.mData as *mut f32, samples) };
        if index == 0 {
            (state.render)(out);
        } else {
            out.fill(0.0);
        }
    }
    0
}

struct CoreAudioStream {
    device: AudioDeviceID,
    proc_id: AudioDeviceIOProcID,
    state: *mut RenderState,
    running: bool,
}

// The raw state pointer is only dereferenced by the HAL IO thread and in Drop
// after the IOProc has been destroyed.
unsafe impl Send for CoreAudioStream {}

impl OutputStream for CoreAudioStream {
    fn start(&mut self) -> Result<(), EngineError> {
        if self.running {
            return Ok(());
        }
        let status = unsafe { AudioDeviceStart(self.device, self.proc_id) };
        if status != 0 {
            return Err(EngineError::StartFailed(format!("OSStatus {status}")));
        }
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        if self.running {
            let status = unsafe { AudioDeviceStop(self.device, self.proc_id) };
            if status != 0 {
                debug!(device = self.device, status, "AudioDeviceStop failed");
            }
            self.running = false;
        }
    }
}

impl Drop for CoreAudioStream {
    fn drop(&mut self) {
        self.stop();
        unsafe {
            AudioDeviceDestroyIOProcID(self.device, self.proc_id);
            drop(Box::from_raw(self.state));
        }
    }
}
