//! Turning compressed audio into raw PCM.
//!
//! A [`Transcoder`] is a byte-in, byte-out pipe. Compressed bytes go in with
//! [`Transcoder::write`] and whole PCM frames come out of
//! [`Transcoder::read`]. Input and output are decoupled by bounded queues, so
//! a slow audio device never stalls the download until those queues fill.
//!
//! [`Subprocess`] runs an external decoder (`ffmpeg` by default) with three
//! worker threads:
//!
//! * a writer feeding queued input to the decoder's stdin,
//! * a reader draining the decoder's stdout into the output queue,
//! * a logger forwarding the decoder's stderr.
//!
//! [`Passthrough`] hands bytes straight through, for input that already is
//! PCM and for tests.

use std::{
    collections::VecDeque,
    io::{BufRead, BufReader, Read, Write},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    output::AudioFormat,
};

/// A decoder turning compressed bytes into interleaved PCM frames.
pub trait Transcoder: Send + Sync {
    /// Queues compressed bytes, blocking only while the input queue is full.
    ///
    /// # Errors
    ///
    /// Returns `Aborted` when the decoder failed or was closed.
    fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Takes up to `max` bytes of whole decoded frames, waiting briefly when
    /// none are ready. Returns an empty buffer when nothing arrived in time.
    fn read(&self, max: usize) -> Vec<u8>;

    /// Takes every whole decoded frame that is available without waiting.
    fn read_all(&self) -> Vec<u8>;

    /// Drops queued input and decoded output without ending the decoder.
    ///
    /// Bytes the decoder already took in still come out afterwards. To drop
    /// those as well, close the transcoder instead.
    fn flush(&self);

    /// Signals the end of input. Output keeps flowing until drained.
    fn finish(&self);

    /// Whether the decoder is done and all of its output was read.
    fn is_finished(&self) -> bool;

    /// Ends input, waits up to `timeout` for the decoder to exit and joins
    /// its workers. A decoder still running at the deadline is killed.
    ///
    /// Closing an already closed transcoder does nothing.
    ///
    /// # Errors
    ///
    /// Returns an error when the decoder could not be reaped.
    fn close(&self, timeout: Duration) -> Result<()>;
}

#[derive(Debug, Default)]
struct Queue {
    buf: VecDeque<u8>,
    closed: bool,
    generation: u64,
}

/// A bounded byte queue shared between threads.
///
/// Clearing the queue bumps its generation, so that a producer blocked on a
/// full queue drops the chunk it was holding instead of adding stale bytes
/// after the clear.
#[derive(Debug)]
struct ByteQueue {
    inner: Mutex<Queue>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl ByteQueue {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::default(),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `bytes` once the queue is below capacity. Returns `false` if
    /// the queue is closed.
    fn push(&self, bytes: &[u8]) -> bool {
        let mut queue = self.lock();
        let generation = queue.generation;
        while queue.buf.len() >= self.capacity
            && !queue.closed
            && queue.generation == generation
        {
            queue = self
                .writable
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if queue.closed {
            return false;
        }
        if queue.generation == generation {
            queue.buf.extend(bytes);
            self.readable.notify_all();
        }
        true
    }

    /// Takes up to `max` bytes in multiples of `align`, waiting up to `wait`
    /// for at least one aligned unit.
    fn pop(&self, max: usize, align: usize, wait: Duration) -> Vec<u8> {
        let mut queue = self.lock();
        if queue.buf.len() < align && !queue.closed && !wait.is_zero() {
            queue = self
                .readable
                .wait_timeout(queue, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        let len = queue.buf.len().min(max);
        let len = len - len % align.max(1);
        let bytes: Vec<u8> = queue.buf.drain(..len).collect();
        if !bytes.is_empty() {
            self.writable.notify_all();
        }
        bytes
    }

    /// Takes everything queued, waiting until something is. Returns `None`
    /// once the queue is closed and empty.
    fn pop_blocking(&self) -> Option<Vec<u8>> {
        let mut queue = self.lock();
        while queue.buf.is_empty() && !queue.closed {
            queue = self
                .readable
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if queue.buf.is_empty() {
            return None;
        }
        let bytes = queue.buf.drain(..).collect();
        self.writable.notify_all();
        Some(bytes)
    }

    fn clear(&self) {
        let mut queue = self.lock();
        queue.buf.clear();
        queue.generation = queue.generation.wrapping_add(1);
        self.writable.notify_all();
    }

    fn close(&self) {
        self.lock().closed = true;
        self.readable.notify_all();
        self.writable.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Closed with fewer than `align` bytes left.
    fn is_drained(&self, align: usize) -> bool {
        let queue = self.lock();
        queue.closed && queue.buf.len() < align.max(1)
    }
}

/// An external decoder process.
pub struct Subprocess {
    program: String,
    child: Mutex<Child>,
    input: Arc<ByteQueue>,
    output: Arc<ByteQueue>,
    failed: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    frame_bytes: usize,
    closed: AtomicBool,
}

impl Subprocess {
    /// Compressed bytes queued ahead of the decoder.
    pub const INPUT_CAPACITY: usize = 4 * 1024 * 1024;

    /// Decoded bytes queued ahead of the audio device.
    pub const OUTPUT_CAPACITY: usize = 8 * 1024 * 1024;

    /// Size of a single read from the decoder.
    pub const CHUNK_SIZE: usize = 4096;

    /// How long [`Transcoder::read`] waits for decoded frames.
    pub const READ_WAIT: Duration = Duration::from_millis(10);

    /// Interval at which [`Transcoder::close`] checks whether the decoder
    /// exited.
    const EXIT_POLL: Duration = Duration::from_millis(10);

    /// Spawns an `ffmpeg` compatible `program` decoding its stdin to raw
    /// `format` PCM on its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be started.
    pub fn ffmpeg(program: &str, format: AudioFormat) -> Result<Self> {
        let mut command = Command::new(program);
        command
            .args(["-hide_banner", "-loglevel", "error"])
            .args(["-i", "pipe:0"])
            .args(["-f", "s16le"])
            .args(["-ar", &format.sample_rate.to_string()])
            .args(["-ac", &format.channels.to_string()])
            .arg("pipe:1");

        Self::spawn(command, format.frame_bytes())
    }

    /// Spawns `command` with piped stdio, reading its output in units of
    /// `frame_bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error when the process cannot be started.
    pub fn spawn(mut command: Command, frame_bytes: usize) -> Result<Self> {
        let program = command.get_program().to_string_lossy().into_owned();
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::unavailable(format!("failed to start {program}: {e}")))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(Error::internal(format!("{program} has no piped stdio")));
        };

        let input = Arc::new(ByteQueue::new(Self::INPUT_CAPACITY));
        let output = Arc::new(ByteQueue::new(Self::OUTPUT_CAPACITY));
        let failed = Arc::new(AtomicBool::new(false));

        let workers = Self::spawn_workers(&program, (stdin, stdout, stderr), &input, &output, &failed);
        let threads = match workers {
            Ok(threads) => threads,
            Err(e) => {
                input.close();
                output.close();
                let _ = child.kill();
                let _ = child.wait();
                return Err(e.into());
            }
        };

        debug!("started decoder {program} (pid {})", child.id());
        Ok(Self {
            program,
            child: Mutex::new(child),
            input,
            output,
            failed,
            threads: Mutex::new(threads),
            frame_bytes,
            closed: AtomicBool::new(false),
        })
    }

    fn spawn_workers(
        program: &str,
        (stdin, stdout, stderr): (ChildStdin, ChildStdout, ChildStderr),
        input: &Arc<ByteQueue>,
        output: &Arc<ByteQueue>,
        failed: &Arc<AtomicBool>,
    ) -> std::io::Result<Vec<JoinHandle<()>>> {
        let writer = Self::spawn_writer(stdin, input, failed)?;
        let reader = Self::spawn_reader(stdout, output, failed)?;

        let program = program.to_owned();
        let logger = thread::Builder::new()
            .name("decoder-stderr".to_owned())
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(std::result::Result::ok) {
                    warn!("{program}: {line}");
                }
            })?;

        Ok(vec![writer, reader, logger])
    }

    fn spawn_writer(
        mut stdin: ChildStdin,
        input: &Arc<ByteQueue>,
        failed: &Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let input = Arc::clone(input);
        let failed = Arc::clone(failed);
        thread::Builder::new()
            .name("decoder-writer".to_owned())
            .spawn(move || {
                while let Some(bytes) = input.pop_blocking() {
                    if let Err(e) = stdin.write_all(&bytes) {
                        if !input.is_closed() {
                            error!("decoder stopped accepting input: {e}");
                            failed.store(true, Ordering::Release);
                        }
                        input.close();
                        break;
                    }
                }
                // Dropping stdin signals end of input.
            })
    }

    fn spawn_reader(
        mut stdout: ChildStdout,
        output: &Arc<ByteQueue>,
        failed: &Arc<AtomicBool>,
    ) -> std::io::Result<JoinHandle<()>> {
        let output = Arc::clone(output);
        let failed = Arc::clone(failed);
        thread::Builder::new()
            .name("decoder-reader".to_owned())
            .spawn(move || {
                let mut buf = vec![0; Self::CHUNK_SIZE];
                loop {
                    match stdout.read(&mut buf) {
                        Ok(0) => break,
                        // Once closed, keep draining so the decoder can exit.
                        Ok(n) => {
                            output.push(&buf[..n]);
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!("failed reading decoder output: {e}");
                            failed.store(true, Ordering::Release);
                            break;
                        }
                    }
                }
                output.close();
            })
    }

    /// Checks that `program` can be started.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` when `program -version` does not run
    /// successfully.
    pub fn check_available(program: &str) -> Result<()> {
        let status = Command::new(program)
            .arg("-version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| Error::failed_precondition(format!("{program} is not available: {e}")))?;

        if !status.success() {
            return Err(Error::failed_precondition(format!(
                "{program} -version exited with {status}"
            )));
        }
        Ok(())
    }

    fn lock_child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits for the decoder to exit until `deadline`, then kills it.
    fn reap(&self, deadline: Instant) -> Result<()> {
        let mut child = self.lock_child();
        loop {
            if let Some(status) = child.try_wait()? {
                debug!("decoder {} exited with {status}", self.program);
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(Self::EXIT_POLL);
        }

        warn!("decoder {} did not exit in time, killing it", self.program);
        // Fails only when the process exited in the meantime.
        let _ = child.kill();
        child.wait()?;
        Ok(())
    }
}

impl Transcoder for Subprocess {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(Error::aborted(format!("decoder {} failed", self.program)));
        }
        if !self.input.push(bytes) {
            return Err(Error::aborted(format!("decoder {} is closed", self.program)));
        }
        Ok(())
    }

    fn read(&self, max: usize) -> Vec<u8> {
        self.output.pop(max, self.frame_bytes, Self::READ_WAIT)
    }

    fn read_all(&self) -> Vec<u8> {
        self.output.pop(usize::MAX, self.frame_bytes, Duration::ZERO)
    }

    fn flush(&self) {
        self.input.clear();
        self.output.clear();
    }

    fn finish(&self) {
        self.input.close();
    }

    fn is_finished(&self) -> bool {
        self.output.is_drained(self.frame_bytes)
    }

    fn close(&self, timeout: Duration) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let deadline = Instant::now() + timeout;

        self.input.clear();
        self.input.close();
        self.output.clear();
        self.output.close();
        let reaped = self.reap(deadline);

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for thread in threads {
            if thread.join().is_err() {
                error!("decoder worker thread panicked");
            }
        }

        reaped
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            self.input.close();
            self.output.close();
            let _ = self.lock_child().kill();
        }
    }
}

/// Passes bytes through unchanged.
pub struct Passthrough {
    queue: ByteQueue,
    frame_bytes: usize,
}

impl Passthrough {
    #[must_use]
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            queue: ByteQueue::new(usize::MAX),
            frame_bytes,
        }
    }
}

impl Transcoder for Passthrough {
    fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.queue.push(bytes) {
            return Err(Error::aborted("transcoder is closed"));
        }
        Ok(())
    }

    fn read(&self, max: usize) -> Vec<u8> {
        self.queue.pop(max, self.frame_bytes, Subprocess::READ_WAIT)
    }

    fn read_all(&self) -> Vec<u8> {
        self.queue.pop(usize::MAX, self.frame_bytes, Duration::ZERO)
    }

    fn flush(&self) {
        self.queue.clear();
    }

    fn finish(&self) {
        self.queue.close();
    }

    fn is_finished(&self) -> bool {
        self.queue.is_drained(self.frame_bytes)
    }

    fn close(&self, _timeout: Duration) -> Result<()> {
        self.queue.clear();
        self.queue.close();
        Ok(())
    }
}
