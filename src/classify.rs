//! One-shot multipart upload of a frame to the classification backend.

use std::io::{self, Cursor, Read};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::frame::FrameGuard;

pub const BOUNDARY: &str = "camera_module";
pub const UPLOAD_CHUNK_SIZE: usize = 1024;

const PART_FILENAME: &str = "capture-node.jpg";
const USER_AGENT: &str = concat!("capture-node/", env!("CARGO_PKG_VERSION"));

pub trait Uploader {
    /// Uploads the frame and returns the raw response text, or an empty
    /// string when the backend could not be reached or did not answer in time.
    fn upload(&mut self, frame: FrameGuard<'_>) -> String;
}

#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub endpoint: String,
}

impl BackendOptions {
    pub fn url(&self) -> String {
        format!("http://{}:{}{}", self.host, self.port, self.endpoint)
    }
}

pub struct HttpUploader {
    options: BackendOptions,
    agent: ureq::Agent,
}

impl HttpUploader {
    pub fn new(options: BackendOptions) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(options.timeout)
            .timeout_read(options.timeout)
            .timeout_write(options.timeout)
            .user_agent(USER_AGENT)
            .build();
        Self { options, agent }
    }
}

impl Uploader for HttpUploader {
    fn upload(&mut self, frame: FrameGuard<'_>) -> String {
        let url = self.options.url();
        let body = MultipartBody::new(frame);

        info!(url = %url, bytes = body.content_length(), "uploading snapshot to backend server");
        let result = self
            .agent
            .post(&url)
            .set("Content-Length", &body.content_length().to_string())
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .set("Accept", "text/plain")
            .set("Accept-Charset", "ISO-8859-1,utf-8;q=0.7,*;q=0.7")
            .send(body);

        let response = match result {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                warn!(url = %url, status, "backend server answered with an error status");
                response
            }
            Err(err) => {
                error!(url = %url, error = %err, "upload to backend server failed");
                return String::new();
            }
        };

        match response.into_string() {
            Ok(text) => text.replace('\r', ""),
            Err(err) => {
                error!(url = %url, error = %err, "failed to read response from backend server");
                String::new()
            }
        }
    }
}

/// Request body streamed as multipart head, image in
/// [`UPLOAD_CHUNK_SIZE`] pieces, then the closing boundary.
///
/// The frame goes back to its source as soon as the last image byte has been
/// handed to the transport, before the response is awaited.
struct MultipartBody<'a> {
    head: Cursor<Vec<u8>>,
    frame: Option<FrameGuard<'a>>,
    image_len: usize,
    offset: usize,
    tail: Cursor<Vec<u8>>,
}

impl<'a> MultipartBody<'a> {
    fn new(frame: FrameGuard<'a>) -> Self {
        let head = format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"image\"; filename=\"{PART_FILENAME}\"\r\n\
             Content-Type: image/jpeg\r\n\
             \r\n"
        );
        let tail = format!("\r\n--{BOUNDARY}--\r\n");
        Self {
            head: Cursor::new(head.into_bytes()),
            image_len: frame.len(),
            frame: Some(frame),
            offset: 0,
            tail: Cursor::new(tail.into_bytes()),
        }
    }

    fn content_length(&self) -> usize {
        self.head.get_ref().len() + self.image_len + self.tail.get_ref().len()
    }
}

impl Read for MultipartBody<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.head.read(buf)?;
        if n > 0 {
            return Ok(n);
        }

        if let Some(image) = self.frame.as_deref() {
            let rest = &image[self.offset..];
            if !rest.is_empty() {
                let n = rest.len().min(UPLOAD_CHUNK_SIZE).min(buf.len());
                buf[..n].copy_from_slice(&rest[..n]);
                self.offset += n;
                return Ok(n);
            }
        }
        if self.frame.take().is_some() {
            debug!(bytes = self.image_len, "image sent; releasing frame");
        }

        self.tail.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::rc::Rc;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::frame::{Frame, FrameError, FrameSource};

    struct StaticSource {
        image: Vec<u8>,
        released: Rc<Cell<usize>>,
    }

    impl StaticSource {
        fn new(image: Vec<u8>) -> Self {
            Self {
                image,
                released: Rc::default(),
            }
        }
    }

    impl FrameSource for StaticSource {
        fn acquire(&mut self) -> Result<Option<Frame>, FrameError> {
            Ok(Some(Frame::new(self.image.clone())))
        }

        fn release(&mut self, _frame: Frame) {
            self.released.set(self.released.get() + 1);
        }
    }

    fn options(port: u16, timeout_ms: u64) -> BackendOptions {
        BackendOptions {
            host: "127.0.0.1".into(),
            port,
            timeout: Duration::from_millis(timeout_ms),
            endpoint: "/image-classification".into(),
        }
    }

    /// Reads one request: head up to the blank line, then `Content-Length` bytes.
    fn read_request(stream: &mut TcpStream) -> (String, Vec<u8>) {
        let mut data = Vec::new();
        let mut chunk = [0u8; 2048];
        let head_end = loop {
            if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0);
            data.extend_from_slice(&chunk[..n]);
        };

        let head = String::from_utf8(data[..head_end].to_vec()).unwrap();
        let length: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        while data.len() < head_end + length {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0);
            data.extend_from_slice(&chunk[..n]);
        }
        (head, data[head_end..head_end + length].to_vec())
    }

    #[test]
    fn body_streams_image_in_chunks_and_releases_before_tail() {
        let image: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let mut source = StaticSource::new(image.clone());
        let released = source.released.clone();

        let frame = FrameGuard::acquire(&mut source).unwrap().unwrap();
        let mut body = MultipartBody::new(frame);
        let expected_len = body.content_length();

        let mut buf = [0u8; 4096];
        let mut sent = Vec::new();
        let mut image_reads = Vec::new();
        loop {
            let before = sent.len();
            let n = body.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            sent.extend_from_slice(&buf[..n]);
            if before >= body.head.get_ref().len() && released.get() == 0 {
                image_reads.push(n);
            }
        }

        assert_eq!(image_reads, vec![1024, 1024, 452]);
        assert_eq!(released.get(), 1);
        assert_eq!(sent.len(), expected_len);
        assert!(sent.ends_with(b"\r\n--camera_module--\r\n"));
    }

    #[test]
    fn uploads_multipart_body_and_reads_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let image: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let expected_image = image.clone();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let (head, body) = read_request(&mut stream);

            assert!(head.starts_with("POST /image-classification HTTP/1.1\r\n"));
            assert!(head.contains("Content-Type: multipart/form-data; boundary=camera_module\r\n"));
            assert!(!head.to_ascii_lowercase().contains("transfer-encoding"));

            let mut expected = b"--camera_module\r\nContent-Disposition: form-data; name=\"image\"; filename=\"capture-node.jpg\"\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
            expected.extend_from_slice(&expected_image);
            expected.extend_from_slice(b"\r\n--camera_module--\r\n");
            assert_eq!(body, expected);

            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nConnection: close\r\n\r\ncat\r\nscore: 0.9\r\n",
                )
                .unwrap();
        });

        let mut source = StaticSource::new(image);
        let released = source.released.clone();
        let frame = FrameGuard::acquire(&mut source).unwrap().unwrap();
        let response = HttpUploader::new(options(port, 2000)).upload(frame);

        assert_eq!(response, "cat\nscore: 0.9\n");
        assert_eq!(released.get(), 1);
        server.join().unwrap();
    }

    #[test]
    fn error_status_still_returns_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            stream
                .write_all(b"HTTP/1.1 500 Internal Server Error\r\nConnection: close\r\n\r\nmodel offline")
                .unwrap();
        });

        let mut source = StaticSource::new(vec![0xFF, 0xD8]);
        let frame = FrameGuard::acquire(&mut source).unwrap().unwrap();

        assert_eq!(HttpUploader::new(options(port, 2000)).upload(frame), "model offline");
        server.join().unwrap();
    }

    #[test]
    fn connect_failure_returns_empty_and_releases() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let mut source = StaticSource::new(vec![0xFF, 0xD8]);
        let released = source.released.clone();
        let frame = FrameGuard::acquire(&mut source).unwrap().unwrap();

        assert_eq!(HttpUploader::new(options(port, 200)).upload(frame), "");
        assert_eq!(released.get(), 1);
    }

    #[test]
    fn silent_server_times_out_with_empty_response() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            read_request(&mut stream);
            thread::sleep(Duration::from_millis(800));
        });

        let mut source = StaticSource::new(vec![0xFF, 0xD8, 0x00]);
        let frame = FrameGuard::acquire(&mut source).unwrap().unwrap();

        let started = Instant::now();
        assert_eq!(HttpUploader::new(options(port, 150)).upload(frame), "");
        assert!(started.elapsed() < Duration::from_millis(800));
        server.join().unwrap();
    }
}
