//! Playback controller.
//!
//! The [`Player`] is what the client loop drives: it loads tracks into the
//! pipeline with a fresh transcoder, and maps transport changes onto pause,
//! resume and flush.

use std::{sync::Arc, time::Duration};

use crate::{
    clock::SharedClock,
    config::Config,
    decrypt::Key,
    error::Result,
    output::{AudioFormat, CpalOutput, Output},
    pipeline::{Alignment, Feed, Pipeline},
    playback::{Playback, State},
    track::Track,
    transcode::{Passthrough, Subprocess, Transcoder},
};

/// Creates a transcoder for every loaded track.
pub type TranscoderFactory = Box<dyn Fn(AudioFormat) -> Result<Arc<dyn Transcoder>> + Send>;

pub struct Player {
    pipeline: Pipeline,
    new_transcoder: TranscoderFactory,
    track: Option<Track>,
    state: State,
    close_timeout: Duration,
}

impl Player {
    /// Creates a stopped player rendering into `output`.
    ///
    /// # Errors
    ///
    /// Returns an error if the render thread cannot be started.
    pub fn new(
        output: Box<dyn Output>,
        new_transcoder: TranscoderFactory,
        volume: f32,
        close_timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self> {
        let idle = Self::idle(output.format());
        let pipeline = Pipeline::new(output, idle, volume, clock)?;

        Ok(Self {
            pipeline,
            new_transcoder,
            track: None,
            state: State::Stopped,
            close_timeout,
        })
    }

    /// Creates a player decoding with the configured decoder program and
    /// rendering to the default audio device.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if the decoder cannot run, or an error
    /// opening the audio device.
    pub fn from_config(config: &Config, clock: SharedClock) -> Result<Self> {
        Subprocess::check_available(&config.decoder)?;
        let output = CpalOutput::open(AudioFormat::new(config.sample_rate, config.channels))?;

        let decoder = config.decoder.clone();
        let new_transcoder: TranscoderFactory = Box::new(move |format| {
            let transcoder = Subprocess::ffmpeg(&decoder, format)?;
            Ok(Arc::new(transcoder) as Arc<dyn Transcoder>)
        });

        Self::new(
            Box::new(output),
            new_transcoder,
            config.volume,
            config.close_timeout,
            clock,
        )
    }

    /// A transcoder that has ended, for when nothing is loaded.
    fn idle(format: AudioFormat) -> Arc<dyn Transcoder> {
        let idle = Passthrough::new(format.frame_bytes());
        idle.finish();
        Arc::new(idle)
    }

    /// Loads `track` at the position of `playback` and returns the feed for
    /// its audio. Whatever played before is dropped.
    ///
    /// A playing track is anchored at the instant it started, so rendering
    /// begins where the host is by the time audio arrives. A paused track
    /// skips to its reported position.
    ///
    /// # Errors
    ///
    /// Returns an error if no transcoder can be created or `key` is unusable.
    /// The player is stopped in that case.
    pub fn load(&mut self, track: Track, key: Option<&Key>, playback: &Playback) -> Result<Feed> {
        self.pipeline.pause();
        self.track = None;
        self.state = State::Stopped;

        let alignment = match playback.state {
            State::Playing => Alignment::Anchor(playback.started_at()),
            State::Paused => Alignment::Offset(playback.position()),
            State::Stopped => Alignment::Start,
        };

        let feed = (self.new_transcoder)(self.pipeline.format()).and_then(|transcoder| {
            self.pipeline
                .reset(key, transcoder, alignment, self.close_timeout)
        });
        let feed = match feed {
            Ok(feed) => feed,
            Err(e) => {
                self.unload();
                return Err(e);
            }
        };

        info!("loaded {track} ({:?})", playback.state);
        self.track = Some(track);
        self.state = playback.state;
        if self.state.is_playing() {
            self.pipeline.resume();
        }

        Ok(feed)
    }

    pub fn pause(&mut self) {
        if self.state == State::Playing {
            self.pipeline.pause();
            self.state = State::Paused;
            debug!("paused");
        }
    }

    pub fn resume(&mut self) {
        if self.state == State::Paused {
            self.pipeline.resume();
            self.state = State::Playing;
            debug!("resumed");
        }
    }

    /// Stops playback, drops all buffered audio and ends the current stream.
    pub fn stop(&mut self) {
        if let Some(track) = self.track.take() {
            info!("stopped {track}");
        }
        self.state = State::Stopped;
        self.pipeline.pause();
        // Closes the transcoder, which drops everything not yet rendered.
        self.unload();
    }

    /// Replaces the current stream with an ended one, which closes the
    /// transcoder and invalidates its feed.
    fn unload(&mut self) {
        let idle = Self::idle(self.pipeline.format());
        if let Err(e) = self
            .pipeline
            .reset(None, idle, Alignment::Start, self.close_timeout)
        {
            error!("failed to unload stream: {e}");
        }
    }

    /// Sets the linear output gain, clamped to `0.0..=1.0`.
    pub fn set_volume(&mut self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.pipeline.set_volume(volume);
        info!("volume set to {:.0}%", volume * 100.0);
    }

    #[must_use]
    pub fn volume(&self) -> f32 {
        self.pipeline.volume()
    }

    #[must_use]
    pub fn track(&self) -> Option<&Track> {
        self.track.as_ref()
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Position within the current track as rendered.
    #[must_use]
    pub fn position(&self) -> Duration {
        self.pipeline.position()
    }

    /// Stops playback and shuts down the pipeline within the close timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeadlineExceeded` when the pipeline did not stop in time.
    pub fn close(&mut self) -> Result<()> {
        self.stop();
        self.pipeline.close(self.close_timeout)
    }
}
