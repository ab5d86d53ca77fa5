//! Standard stream wiring for sandbox instances

use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream lock poisoned")
}

const REPLACEMENT: &[u8] = "\u{FFFD}".as_bytes();

/// Writer plus the tail of a UTF-8 sequence split across two writes.
struct Utf8Stream {
    writer: Box<dyn Write + Send>,
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(bytes);

        let mut out = Vec::with_capacity(buf.len());
        let mut rest = buf.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.extend_from_slice(valid.as_bytes());
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.extend_from_slice(valid);
                    match e.error_len() {
                        Some(len) => {
                            out.extend_from_slice(REPLACEMENT);
                            rest = &after[len..];
                        }
                        // incomplete, the next write may finish it
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        if !out.is_empty() {
            self.writer.write_all(&out)?;
        }
        self.writer.flush()
    }

    /// Emit a held-back incomplete sequence as U+FFFD.
    fn finish(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.pending.clear();
        self.writer.write_all(REPLACEMENT)?;
        self.writer.flush()
    }
}

impl Drop for Utf8Stream {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

/// Where a sandbox's standard output goes.
///
/// Script strings are raw bytes; they are transcoded to UTF-8 on the way out,
/// so valid UTF-8 passes through unchanged and invalid sequences become U+FFFD.
/// A multibyte character split across writes is held back until it completes.
#[derive(Clone, Default)]
pub struct OutputSink {
    target: Option<Arc<Mutex<Utf8Stream>>>,
}

impl OutputSink {
    /// A sink that accepts and drops everything.
    pub fn discard() -> Self {
        Self { target: None }
    }

    pub fn stream(writer: impl Write + Send + 'static) -> Self {
        Self {
            target: Some(Arc::new(Mutex::new(Utf8Stream {
                writer: Box::new(writer),
                pending: Vec::new(),
            }))),
        }
    }

    pub fn is_discard(&self) -> bool {
        self.target.is_none()
    }

    pub fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        target.lock().map_err(|_| poisoned())?.write(bytes)
    }

    /// Write out an unfinished trailing sequence. Also done when the last
    /// clone of the sink is dropped.
    pub fn finish(&self) -> io::Result<()> {
        let Some(target) = &self.target else {
            return Ok(());
        };
        target.lock().map_err(|_| poisoned())?.finish()
    }
}

impl std::fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_discard() {
            "OutputSink::Discard"
        } else {
            "OutputSink::Stream"
        })
    }
}

/// Where a sandbox's standard input comes from.
#[derive(Clone, Default)]
pub struct InputSource {
    source: Option<Arc<Mutex<Box<dyn BufRead + Send>>>>,
}

impl InputSource {
    /// A source that is already at end of input.
    pub fn empty() -> Self {
        Self { source: None }
    }

    pub fn stream(reader: impl Read + Send + 'static) -> Self {
        Self {
            source: Some(Arc::new(Mutex::new(Box::new(BufReader::new(reader))))),
        }
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self::stream(io::Cursor::new(bytes.into()))
    }

    pub fn is_empty_source(&self) -> bool {
        self.source.is_none()
    }

    fn lock(&self) -> io::Result<Option<MutexGuard<'_, Box<dyn BufRead + Send>>>> {
        match &self.source {
            None => Ok(None),
            Some(source) => source.lock().map(Some).map_err(|_| poisoned()),
        }
    }

    /// Next line, `None` at end of input.
    pub fn read_line(&self, keep_newline: bool) -> io::Result<Option<Vec<u8>>> {
        let Some(mut source) = self.lock()? else {
            return Ok(None);
        };
        let mut line = Vec::new();
        if source.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if !keep_newline && line.last() == Some(&b'\n') {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        Ok(Some(line))
    }

    /// Up to `count` bytes, `None` at end of input.
    pub fn read_bytes(&self, count: usize) -> io::Result<Option<Vec<u8>>> {
        let Some(mut source) = self.lock()? else {
            return Ok(None);
        };
        let mut buf = Vec::with_capacity(count.min(64 * 1024));
        source.by_ref().take(count as u64).read_to_end(&mut buf)?;
        if buf.is_empty() && count > 0 {
            return Ok(None);
        }
        Ok(Some(buf))
    }

    /// Everything that is left; empty at end of input.
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut source) = self.lock()? {
            source.read_to_end(&mut buf)?;
        }
        Ok(buf)
    }
}

impl std::fmt::Debug for InputSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(if self.is_empty_source() {
            "InputSource::Empty"
        } else {
            "InputSource::Stream"
        })
    }
}

/// In-memory writer whose contents stay readable after it is handed to a sandbox.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer(Arc<Mutex<Vec<u8>>>);

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().map(|buf| buf.clone()).unwrap_or_default()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }

    pub fn clear(&self) {
        if let Ok(mut buf) = self.0.lock() {
            buf.clear();
        }
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0
            .lock()
            .map_err(|_| poisoned())?
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
