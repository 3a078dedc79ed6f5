//! Still-capture camera driven by an external command.
//!
//! The command must write exactly one JPEG image to stdout and exit within
//! the capture timeout. A non-zero exit, a timeout, empty output or output
//! that is not a JPEG means no buffer was ready; failing to start the command
//! at all is a driver fault.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::CaptureConfig;
use crate::frame::{Frame, FrameError, FrameSource};

const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

const WAIT_POLL: Duration = Duration::from_millis(10);

pub struct CommandCamera {
    program: String,
    args: Vec<String>,
    pool_size: usize,
    timeout: Duration,
    outstanding: usize,
}

impl CommandCamera {
    pub fn new(program: impl Into<String>, args: Vec<String>, pool_size: usize) -> Self {
        Self {
            program: program.into(),
            args,
            pool_size: pool_size.max(1),
            timeout: DEFAULT_CAPTURE_TIMEOUT,
            outstanding: 0,
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone(), config.pool_size)
            .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    /// Longest a single capture may run before it is killed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Probes the command once. Any failure here is fatal for this boot.
    pub fn init(&mut self) -> Result<(), FrameError> {
        debug!(program = %self.program, "initializing camera");

        match self.capture() {
            Ok(Some(data)) => {
                info!(program = %self.program, bytes = data.len(), "camera ready");
                Ok(())
            }
            Ok(None) => Err(FrameError::init(format!(
                "`{}` did not produce a JPEG image",
                self.program
            ))),
            Err(FrameError::Fault { reason }) | Err(FrameError::Init { reason }) => {
                Err(FrameError::Init { reason })
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    fn capture(&self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| FrameError::fault(format!("failed to run `{}`: {err}", self.program)))?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let Some(status) = self.wait_with_deadline(&mut child)? else {
            return Ok(None);
        };

        if !status.success() {
            let stderr = stderr.recv_timeout(WAIT_POLL).unwrap_or_default();
            warn!(
                program = %self.program,
                status = %status,
                stderr = %String::from_utf8_lossy(&stderr).trim(),
                "capture command failed"
            );
            return Ok(None);
        }

        // The pipe may still be held open by a grandchild, so reading is
        // bounded by the same timeout.
        let Ok(image) = stdout.recv_timeout(self.timeout) else {
            warn!(program = %self.program, "capture command left its output open");
            return Ok(None);
        };

        if !image.starts_with(&JPEG_SOI) {
            warn!(
                program = %self.program,
                bytes = image.len(),
                "capture command produced no JPEG data"
            );
            return Ok(None);
        }

        Ok(Some(image))
    }

    /// Polls the child until it exits. On timeout the child is killed and
    /// reaped and `None` is returned.
    fn wait_with_deadline(&self, child: &mut Child) -> Result<Option<ExitStatus>, FrameError> {
        let start = Instant::now();
        loop {
            let polled = child
                .try_wait()
                .map_err(|err| FrameError::fault(format!("failed to wait for `{}`: {err}", self.program)))?;
            if let Some(status) = polled {
                return Ok(Some(status));
            }

            if start.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                warn!(
                    program = %self.program,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "capture command timed out; killed"
                );
                return Ok(None);
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

/// Reads a child pipe to the end on its own thread so a large image cannot
/// fill the pipe and stall the child.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            if pipe.read_to_end(&mut buf).is_ok() {
                let _ = tx.send(buf);
            }
        });
    }
    rx
}

impl FrameSource for CommandCamera {
    fn acquire(&mut self) -> Result<Option<Frame>, FrameError> {
        debug!("getting snapshot");

        if self.outstanding >= self.pool_size {
            warn!(
                outstanding = self.outstanding,
                pool_size = self.pool_size,
                "no free frame buffer"
            );
            return Ok(None);
        }

        let Some(data) = self.capture()? else {
            return Ok(None);
        };

        self.outstanding += 1;
        info!(bytes = data.len(), "snapshot obtained");
        Ok(Some(Frame::new(data)))
    }

    fn release(&mut self, frame: Frame) {
        debug!(bytes = frame.len(), "returning frame buffer");
        self.outstanding = self.outstanding.saturating_sub(1);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn shell(script: &str, pool_size: usize) -> CommandCamera {
        CommandCamera::new("sh", vec!["-c".into(), script.into()], pool_size)
    }

    #[test]
    fn jpeg_output_becomes_a_frame() {
        let mut camera = shell(r"printf '\377\330\377\340data'", 2);

        let frame = camera.acquire().unwrap().expect("frame");

        assert_eq!(&frame.data[..2], &JPEG_SOI);
        assert_eq!(camera.outstanding(), 1);
        camera.release(frame);
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn failing_command_means_no_buffer() {
        let mut camera = shell("exit 3", 2);
        assert!(camera.acquire().unwrap().is_none());
    }

    #[test]
    fn non_jpeg_output_means_no_buffer() {
        let mut camera = shell("printf 'not an image'", 2);
        assert!(camera.acquire().unwrap().is_none());
    }

    #[test]
    fn missing_program_is_a_fault() {
        let mut camera = CommandCamera::new("/nonexistent/capture-tool", Vec::new(), 2);
        assert!(matches!(camera.acquire(), Err(FrameError::Fault { .. })));
        assert!(matches!(camera.init(), Err(FrameError::Init { .. })));
    }

    #[test]
    fn hung_command_is_killed_at_timeout() {
        let mut camera = shell("sleep 5", 2).with_timeout(Duration::from_millis(200));

        let started = Instant::now();
        assert!(camera.acquire().unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(camera.outstanding(), 0);
    }

    #[test]
    fn large_image_is_read_while_command_runs() {
        // Larger than a pipe buffer: the command only exits once it is read.
        let mut camera = shell(r"printf '\377\330'; head -c 200000 /dev/zero", 1);

        let frame = camera.acquire().unwrap().expect("frame");
        assert_eq!(frame.len(), 200_002);
        camera.release(frame);
    }

    #[test]
    fn exhausted_pool_returns_no_buffer() {
        let mut camera = shell(r"printf '\377\330x'", 1);

        let held = camera.acquire().unwrap().expect("first frame");
        assert!(camera.acquire().unwrap().is_none());

        camera.release(held);
        assert!(camera.acquire().unwrap().is_some());
    }
}
