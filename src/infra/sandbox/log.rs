use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::warn;

const READ_CHUNK: usize = 8 * 1024;

/// Byte buffer that keeps the first `limit` bytes and counts the rest.
#[derive(Debug)]
pub struct LogBuffer {
    limit: usize,
    bytes: Vec<u8>,
    omitted: u64,
}

impl LogBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            bytes: Vec::new(),
            omitted: 0,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.omitted += (chunk.len() - kept) as u64;
    }

    /// Append another buffer, carrying over its omitted count.
    pub fn append(&mut self, other: LogBuffer) {
        self.push(&other.bytes);
        self.omitted += other.omitted;
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty() && self.omitted == 0
    }

    pub fn finish(mut self) -> Bytes {
        if self.omitted > 0 {
            if !self.bytes.ends_with(b"\n") && !self.bytes.is_empty() {
                self.bytes.push(b'\n');
            }
            self.bytes.extend_from_slice(
                format!("[log truncated: {} bytes omitted]\n", self.omitted).as_bytes(),
            );
        }
        Bytes::from(self.bytes)
    }
}

/// Output of both converter pipes, interleaved in arrival order.
///
/// Readers run as spawned tasks so the buffer outlives a timed-out run; whatever was
/// read before the process group died is still there afterwards.
#[derive(Debug, Clone)]
pub struct SharedLog {
    inner: Arc<Mutex<LogBuffer>>,
    limit: usize,
}

impl SharedLog {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogBuffer::new(limit))),
            limit,
        }
    }

    pub fn push(&self, chunk: &[u8]) {
        self.lock().push(chunk);
    }

    /// Drain `reader` to EOF on its own task.
    pub fn spawn_capture<R>(&self, reader: Option<R>) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = self.clone();
        tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return;
            };
            let mut chunk = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(read) => shared.push(&chunk[..read]),
                }
            }
        })
    }

    /// Take the captured bytes, leaving an empty buffer behind.
    pub fn take(&self) -> LogBuffer {
        std::mem::replace(&mut *self.lock(), LogBuffer::new(self.limit))
    }

    fn lock(&self) -> MutexGuard<'_, LogBuffer> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(
                    target = "texcompiler::sandbox",
                    op = "sandbox::log",
                    result = "poisoned_recovered",
                    "Recovered from poisoned log buffer"
                );
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_logs_pass_through_untouched() {
        let mut buffer = LogBuffer::new(64);
        buffer.push(b"This is pdfTeX\n");
        buffer.push(b"Output written on paper.pdf\n");

        insta::assert_snapshot!(String::from_utf8_lossy(&buffer.finish()), @r"
        This is pdfTeX
        Output written on paper.pdf
        ");
    }

    #[test]
    fn overflow_is_counted_and_reported() {
        let mut buffer = LogBuffer::new(10);
        buffer.push(b"0123456");
        buffer.push(b"789abcdef");

        insta::assert_snapshot!(String::from_utf8_lossy(&buffer.finish()), @r"
        0123456789
        [log truncated: 6 bytes omitted]
        ");
    }

    #[test]
    fn appended_buffer_keeps_its_omitted_count() {
        let mut captured = LogBuffer::new(4);
        captured.push(b"stdout line");
        let mut combined = LogBuffer::new(64);
        combined.push(b"autotex\n");
        combined.append(captured);

        insta::assert_snapshot!(String::from_utf8_lossy(&combined.finish()), @r"
        autotex
        stdo
        [log truncated: 7 bytes omitted]
        ");
    }

    #[tokio::test]
    async fn spawned_captures_share_one_buffer() {
        let log = SharedLog::new(1024);
        let out = log.spawn_capture(Some(&b"line one\n"[..]));
        out.await.expect("capture task");
        let err = log.spawn_capture(Some(&b"line two\n"[..]));
        err.await.expect("capture task");

        assert_eq!(&log.take().finish()[..], b"line one\nline two\n");
        assert!(log.take().is_empty());
    }
}
