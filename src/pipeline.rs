//! Decrypt, transcode and render one stream at a time.
//!
//! ```text
//! Feed::write -> Decrypt -> Transcoder -> render thread -> gain -> Output
//! ```
//!
//! Ingest and rendering are guarded by separate locks. A download that
//! blocks on a full transcoder therefore never stalls the render thread, and
//! control operations only briefly contend with audio.
//!
//! Every [`Pipeline::reset`] starts a new stream with its own decryptor and
//! transcoder and hands out a [`Feed`] for it. Feeds of earlier streams are
//! rejected, so bytes of an old track can never reach a new one.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant, SystemTime},
};

use crate::{
    clock::{elapsed_since, SharedClock},
    decrypt::{Decrypt, Key},
    error::{Error, Result},
    output::{AudioFormat, Output},
    transcode::Transcoder,
    util::ToF32,
};

/// Where a new stream should start rendering.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Alignment {
    /// Render from the first decoded frame.
    Start,

    /// The track started playing at this instant; skip everything that
    /// should already have played.
    Anchor(SystemTime),

    /// Skip this much audio.
    Offset(Duration),
}

struct Ingest {
    stream: u64,
    decrypt: Option<Decrypt>,
    failed: bool,
}

struct Render {
    output: Box<dyn Output>,
    alignment: Option<Alignment>,
    /// Frames written to or skipped before the output in this stream.
    frames: u64,
    /// Bumped whenever buffered audio is dropped.
    generation: u64,
}

#[derive(Default)]
struct Gate {
    playing: bool,
    shutdown: bool,
}

struct Shared {
    ingest: Mutex<Ingest>,
    render: Mutex<Render>,
    transcoder: Mutex<Arc<dyn Transcoder>>,
    gate: Mutex<Gate>,
    unpaused: Condvar,
    volume: AtomicU32,
    format: AudioFormat,
    clock: SharedClock,
}

impl Shared {
    fn ingest(&self) -> MutexGuard<'_, Ingest> {
        self.ingest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn render(&self) -> MutexGuard<'_, Render> {
        self.render.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transcoder(&self) -> Arc<dyn Transcoder> {
        Arc::clone(
            &self
                .transcoder
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Blocks while paused. Returns `false` on shutdown.
    fn wait_unpaused(&self) -> bool {
        let mut gate = self.gate();
        while !gate.playing && !gate.shutdown {
            gate = self
                .unpaused
                .wait(gate)
                .unwrap_or_else(PoisonError::into_inner);
        }
        !gate.shutdown
    }

    fn render_loop(&self) {
        let frame_bytes = self.format.frame_bytes();
        while self.wait_unpaused() {
            // The transcoder is swapped under the render lock, so it always
            // matches the generation read with it.
            let (available, generation, transcoder) = {
                let render = self.render();
                (
                    render.output.write_available(),
                    render.generation,
                    self.transcoder(),
                )
            };
            if available == 0 {
                thread::sleep(Pipeline::DEVICE_WAIT);
                continue;
            }

            let bytes = transcoder.read(available * frame_bytes);
            if bytes.is_empty() {
                if transcoder.is_finished() {
                    // End of stream: reads no longer wait.
                    thread::sleep(Pipeline::DEVICE_WAIT);
                }
                continue;
            }

            let mut samples: Vec<i16> = bytes
                .chunks_exact(AudioFormat::SAMPLE_BYTES)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                .collect();
            apply_gain(&mut samples, self.volume());

            let mut render = self.render();
            if render.generation != generation {
                // Flushed while reading: these samples belong to dropped audio.
                continue;
            }
            let channels = usize::from(self.format.channels);
            let skip = render.skip_frames(samples.len() / channels, self);
            let skip_samples = skip * channels;
            render.frames += u64::try_from(skip).unwrap_or(u64::MAX);
            if skip_samples < samples.len() {
                let written = &samples[skip_samples..];
                if let Err(e) = render.output.write(written) {
                    error!("audio output failed: {e}");
                    drop(render);
                    thread::sleep(Pipeline::DEVICE_WAIT);
                    continue;
                }
                render.frames += u64::try_from(written.len() / channels).unwrap_or(u64::MAX);
            }
        }
        debug!("render thread stopped");
    }
}

impl Render {
    /// Frames of a block of `frames` to drop to satisfy the alignment, if
    /// any. Clears the alignment once it is met.
    fn skip_frames(&mut self, frames: usize, shared: &Shared) -> usize {
        let target = match self.alignment {
            None | Some(Alignment::Start) => {
                self.alignment = None;
                return 0;
            }
            Some(Alignment::Offset(offset)) => offset,
            Some(Alignment::Anchor(started_at)) => elapsed_since(shared.clock.now(), started_at),
        };

        let behind = shared.format.frames_in(target).saturating_sub(self.frames);
        let skip = usize::try_from(behind).unwrap_or(usize::MAX).min(frames);
        if skip < frames {
            if behind > 0 {
                debug!("aligned stream at {:.1}s", target.as_secs_f32());
            }
            self.alignment = None;
        }
        skip
    }
}

/// Scales `samples` by `gain` and clips to the `i16` range.
#[expect(clippy::cast_possible_truncation)]
pub fn apply_gain(samples: &mut [i16], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples {
        let scaled = (sample.to_f32_lossy() * gain).round();
        *sample = scaled.clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16;
    }
}

/// Writes bytes of one stream into the pipeline.
///
/// Feeds are cheap to clone and can be moved to a download task.
#[derive(Clone)]
pub struct Feed {
    shared: Arc<Shared>,
    stream: u64,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

impl Feed {
    /// Decrypts `chunk` and queues it for decoding. Chunks are processed in
    /// the order of the calls.
    ///
    /// # Errors
    ///
    /// * `Cancelled` when the pipeline moved on to another stream
    /// * `DataLoss` when decryption failed
    /// * `Aborted` when the transcoder failed or was closed
    pub fn write(&self, chunk: &[u8]) -> Result<()> {
        let mut ingest = self.shared.ingest();
        if ingest.stream != self.stream {
            return Err(Error::cancelled("stream was replaced"));
        }
        if ingest.failed {
            return Err(Error::aborted("stream failed earlier"));
        }

        let mut bytes = chunk.to_vec();
        if let Some(decrypt) = ingest.decrypt.as_mut() {
            if let Err(e) = decrypt.apply(&mut bytes) {
                ingest.failed = true;
                return Err(e);
            }
        }

        // Held across the write so that chunks stay in order.
        let result = self.shared.transcoder().write(&bytes);
        if result.is_err() {
            ingest.failed = true;
        }
        result
    }

    /// Signals that the stream is complete.
    pub fn finish(&self) {
        if self.shared.ingest().stream == self.stream {
            self.shared.transcoder().finish();
        }
    }

    #[must_use]
    pub fn is_current(&self) -> bool {
        self.shared.ingest().stream == self.stream
    }
}

/// The decrypt and pace stage with its render thread.
pub struct Pipeline {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Pause between checks of a full output device.
    pub const DEVICE_WAIT: Duration = Duration::from_millis(5);

    /// Interval at which [`Self::close`] checks whether the render thread
    /// exited.
    const JOIN_POLL: Duration = Duration::from_millis(5);

    /// Starts a paused pipeline rendering into `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the render thread cannot be started.
    pub fn new(
        output: Box<dyn Output>,
        transcoder: Arc<dyn Transcoder>,
        volume: f32,
        clock: SharedClock,
    ) -> Result<Self> {
        let format = output.format();
        let shared = Arc::new(Shared {
            ingest: Mutex::new(Ingest {
                stream: 0,
                decrypt: None,
                failed: false,
            }),
            render: Mutex::new(Render {
                output,
                alignment: None,
                frames: 0,
                generation: 0,
            }),
            transcoder: Mutex::new(transcoder),
            gate: Mutex::default(),
            unpaused: Condvar::new(),
            volume: AtomicU32::new(sanitize_volume(volume).to_bits()),
            format,
            clock,
        });

        let thread = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("audio-render".to_owned())
                .spawn(move || shared.render_loop())?
        };

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    #[must_use]
    pub fn format(&self) -> AudioFormat {
        self.shared.format
    }

    /// Starts a new stream, replacing the current one.
    ///
    /// The previous transcoder is closed within `timeout` and all of its
    /// audio is dropped. Chunks written to the new feed are decrypted with
    /// `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if `key` cannot be used. The pipeline then has no
    /// current stream.
    pub fn reset(
        &self,
        key: Option<&Key>,
        transcoder: Arc<dyn Transcoder>,
        alignment: Alignment,
        timeout: Duration,
    ) -> Result<Feed> {
        // Closing first unblocks a feed waiting on a full transcoder.
        let previous = self.shared.transcoder();
        if let Err(e) = previous.close(timeout) {
            warn!("failed to close transcoder: {e}");
        }

        let decrypt = key.map(Decrypt::new).transpose();

        let mut ingest = self.shared.ingest();
        ingest.stream = ingest.stream.wrapping_add(1);
        let stream = ingest.stream;
        let result = match decrypt {
            Ok(decrypt) => {
                ingest.decrypt = decrypt;
                ingest.failed = false;
                self.install(transcoder, Some(alignment));
                Ok(Feed {
                    shared: Arc::clone(&self.shared),
                    stream,
                })
            }
            Err(e) => {
                ingest.decrypt = None;
                ingest.failed = true;
                self.install(transcoder, Some(Alignment::Start));
                Err(e)
            }
        };
        drop(ingest);
        result
    }

    /// Makes `transcoder` current and drops audio buffered in the output.
    ///
    /// With an alignment, frame counting starts anew for a new stream.
    /// Both happen under the render lock, so the render thread never
    /// pairs the new transcoder with the previous generation.
    fn install(&self, transcoder: Arc<dyn Transcoder>, alignment: Option<Alignment>) {
        let mut render = self.shared.render();
        *self
            .shared
            .transcoder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = transcoder;
        render.output.clear();
        if let Some(alignment) = alignment {
            render.alignment = Some(alignment);
            render.frames = 0;
        }
        render.generation = render.generation.wrapping_add(1);
    }

    /// Stops consuming decoded audio. Ingest continues until the transcoder
    /// queues are full.
    pub fn pause(&self) {
        self.shared.gate().playing = false;
    }

    pub fn resume(&self) {
        self.shared.gate().playing = true;
        self.shared.unpaused.notify_all();
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.shared.gate().playing
    }

    /// Drops all audio of the current stream that is not yet rendered and
    /// continues the stream on `transcoder`.
    ///
    /// A decoder holds audio beyond its queues, so the previous transcoder
    /// is closed within `timeout` rather than flushed. Decryption carries
    /// on where it was, and chunks written after the flush go to
    /// `transcoder`.
    pub fn flush(&self, transcoder: Arc<dyn Transcoder>, timeout: Duration) {
        let previous = self.shared.transcoder();
        // Releases a feed blocked on a full input queue, which holds the
        // ingest lock.
        previous.flush();

        let ingest = self.shared.ingest();
        self.install(transcoder, None);
        drop(ingest);

        if let Err(e) = previous.close(timeout) {
            warn!("failed to close transcoder: {e}");
        }
    }

    /// Sets the linear gain for subsequently rendered blocks.
    pub fn set_volume(&self, volume: f32) {
        self.shared
            .volume
            .store(sanitize_volume(volume).to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.shared.volume()
    }

    /// Audio rendered or skipped in the current stream.
    #[must_use]
    pub fn position(&self) -> Duration {
        let frames = self.shared.render().frames;
        self.shared.format.duration_of(frames)
    }

    /// Stops the render thread and closes the transcoder, each within
    /// `timeout`. A render thread that does not stop in time is detached.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` when the render thread did not stop in
    /// time.
    pub fn close(&mut self, timeout: Duration) -> Result<()> {
        {
            let mut gate = self.shared.gate();
            gate.shutdown = true;
            gate.playing = false;
        }
        self.shared.unpaused.notify_all();

        let deadline = Instant::now() + timeout;
        if let Err(e) = self.shared.transcoder().close(timeout) {
            warn!("failed to close transcoder: {e}");
        }

        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                return Err(Error::deadline_exceeded(
                    "render thread did not stop in time",
                ));
            }
            thread::sleep(Self::JOIN_POLL);
        }
        if thread.join().is_err() {
            error!("render thread panicked");
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let mut gate = self.shared.gate();
            gate.shutdown = true;
            drop(gate);
            self.shared.unpaused.notify_all();
        }
    }
}

fn sanitize_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.max(0.0)
    } else {
        0.0
    }
}
