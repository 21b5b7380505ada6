//! Audio output devices.
//!
//! The pipeline renders interleaved 16-bit PCM into an [`Output`]. Outputs
//! expose how many frames they can take without blocking, so the render loop
//! paces itself against the device instead of the other way around.
//!
//! [`CpalOutput`] plays through the system's default output device.
//! [`Capture`] records everything written to it and is used in tests.

use std::{
    collections::VecDeque,
    fmt,
    sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    FromSample, Sample, SampleFormat, SizedSample, StreamConfig,
};

use crate::{
    error::{Error, Result},
    util,
};

/// Sample rate and channel count of 16-bit signed PCM.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    /// Bytes per sample of signed 16-bit PCM.
    pub const SAMPLE_BYTES: usize = 2;

    #[must_use]
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Bytes in one frame, which is one sample for every channel.
    #[must_use]
    pub fn frame_bytes(&self) -> usize {
        Self::SAMPLE_BYTES * usize::from(self.channels)
    }

    /// Whole frames that play in `duration`.
    #[must_use]
    pub fn frames_in(&self, duration: Duration) -> u64 {
        util::frames_in(duration, self.sample_rate)
    }

    /// Play time of `frames` frames.
    #[must_use]
    pub fn duration_of(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        let nanos = u128::from(frames) * 1_000_000_000 / u128::from(self.sample_rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(44_100, 2)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} Hz, {} channel(s), s16le",
            self.sample_rate, self.channels
        )
    }
}

/// A sink for interleaved PCM frames.
pub trait Output: Send {
    fn format(&self) -> AudioFormat;

    /// Frames that can be written right now without overrunning the device.
    fn write_available(&self) -> usize;

    /// Writes whole frames of interleaved samples.
    ///
    /// # Errors
    ///
    /// Returns an error when the device is gone.
    fn write(&mut self, samples: &[i16]) -> Result<()>;

    /// Drops samples that were written but not yet played.
    fn clear(&mut self);
}

/// Plays through the default output device of the default host.
///
/// `cpal` streams cannot move between threads on every platform, so the
/// stream is built and owned by a dedicated thread. Samples reach the
/// device callback through a shared queue that holds [`Self::BUFFER_TIME`]
/// of audio.
pub struct CpalOutput {
    format: AudioFormat,
    queue: Arc<Mutex<VecDeque<i16>>>,
    capacity: usize,
    stop_tx: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Audio queued ahead of the device.
    pub const BUFFER_TIME: Duration = Duration::from_millis(250);

    /// Opens the default output device at `format`.
    ///
    /// # Errors
    ///
    /// Returns an error when there is no output device or it does not
    /// support `format`.
    pub fn open(format: AudioFormat) -> Result<Self> {
        let frames = usize::try_from(format.frames_in(Self::BUFFER_TIME)).unwrap_or(usize::MAX);
        let capacity = frames.saturating_mul(usize::from(format.channels));
        let queue = Arc::new(Mutex::new(VecDeque::with_capacity(capacity)));

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<()>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let shared = Arc::clone(&queue);
        let thread = thread::Builder::new()
            .name("audio-output".to_owned())
            .spawn(move || {
                let stream = match Self::build(format, shared) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.into()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Park until the output is dropped.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("audio stream closed");
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::internal("audio output thread exited during setup"))??;

        Ok(Self {
            format,
            queue,
            capacity,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    fn build(format: AudioFormat, queue: Arc<Mutex<VecDeque<i16>>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| Error::unavailable("no default output device"))?;
        let name = device.name().unwrap_or_else(|_| "unknown".to_owned());

        let sample_format = Self::sample_format(&device, format)?;
        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        info!("audio output: {name} ({format}, device format {sample_format})");

        match sample_format {
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &config, queue),
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &config, queue),
            SampleFormat::I32 => Self::build_stream::<i32>(&device, &config, queue),
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &config, queue),
            SampleFormat::F64 => Self::build_stream::<f64>(&device, &config, queue),
            other => Err(Error::unimplemented(format!(
                "unsupported device sample format {other}"
            ))),
        }
    }

    /// Picks the device sample format for `format`, preferring 16-bit
    /// integers so samples pass through unconverted.
    fn sample_format(device: &cpal::Device, format: AudioFormat) -> Result<SampleFormat> {
        let supported: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| Error::unavailable(e.to_string()))?
            .filter(|config| {
                config.channels() == format.channels
                    && config.min_sample_rate().0 <= format.sample_rate
                    && config.max_sample_rate().0 >= format.sample_rate
            })
            .map(|config| config.sample_format())
            .collect();

        [SampleFormat::I16, SampleFormat::F32]
            .into_iter()
            .find(|preferred| supported.contains(preferred))
            .or_else(|| supported.first().copied())
            .ok_or_else(|| Error::invalid_argument(format!("output device does not support {format}")))
    }

    fn build_stream<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        queue: Arc<Mutex<VecDeque<i16>>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + FromSample<i16>,
    {
        let stream = device.build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
                for sample in data.iter_mut() {
                    *sample = queue.pop_front().map_or(T::EQUILIBRIUM, T::from_sample);
                }
            },
            |err| error!("audio stream error: {err}"),
            None,
        )?;

        Ok(stream)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<i16>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Output for CpalOutput {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write_available(&self) -> usize {
        let queued = self.lock().len();
        self.capacity.saturating_sub(queued) / usize::from(self.format.channels)
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        if self.thread.as_ref().is_none_or(JoinHandle::is_finished) {
            return Err(Error::unavailable("audio output is closed"));
        }
        self.lock().extend(samples);
        Ok(())
    }

    fn clear(&mut self) {
        self.lock().clear();
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("audio output thread panicked");
            }
        }
    }
}

/// Records every written sample.
///
/// Clones share the same recording, so a test can keep one clone while the
/// pipeline owns the other.
#[derive(Clone, Debug)]
pub struct Capture {
    format: AudioFormat,
    samples: Arc<Mutex<Vec<i16>>>,
    available: usize,
}

impl Capture {
    /// Frames accepted per render cycle.
    pub const AVAILABLE: usize = 1024;

    #[must_use]
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            samples: Arc::default(),
            available: Self::AVAILABLE,
        }
    }

    /// Everything written so far.
    #[must_use]
    pub fn samples(&self) -> Vec<i16> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<i16>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Output for Capture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn write_available(&self) -> usize {
        self.available
    }

    fn write(&mut self, samples: &[i16]) -> Result<()> {
        self.lock().extend_from_slice(samples);
        Ok(())
    }

    fn clear(&mut self) {}
}
