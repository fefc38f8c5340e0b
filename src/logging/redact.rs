//! Secret masking for log output.
//!
//! Run-task bodies carry a Terraform access token and Google calls carry
//! OAuth tokens; neither may reach the logs.

use regex::Regex;
use std::io::{self, Write};
use std::sync::LazyLock;
use tracing_subscriber::fmt::MakeWriter;

static RE_BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bearer [a-zA-Z0-9._\-]+").expect("failed to compile regex: bearer")
});

static RE_GOOGLE_OAUTH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"ya29\.[a-zA-Z0-9._\-]+").expect("failed to compile regex: google_oauth")
});

static RE_JSON_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("(?:access_token|token|secret)"\s*:\s*)"[^"]*""#)
        .expect("failed to compile regex: json_token")
});

static RE_QUERY_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(key|token)=([a-zA-Z0-9]{40,})").expect("failed to compile regex: query_secret")
});

pub fn redact_string(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }

    let mut result = RE_BEARER.replace_all(input, "[REDACTED]").into_owned();
    result = RE_GOOGLE_OAUTH
        .replace_all(&result, "[REDACTED]")
        .into_owned();
    result = RE_JSON_TOKEN
        .replace_all(&result, r#"$1"[REDACTED]""#)
        .into_owned();
    result = RE_QUERY_SECRET
        .replace_all(&result, "$1=[REDACTED]")
        .into_owned();
    result
}

/// Line-buffered writer that redacts each complete line.
pub struct RedactingWriter<W: Write> {
    inner: W,
    buffer: Vec<u8>,
}

const MAX_BUFFER_BYTES: usize = 8192;

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
        }
    }

    fn write_redacted(&mut self, line: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(line);
        self.inner.write_all(redact_string(&text).as_bytes())
    }

    fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.buffer);
        self.write_redacted(&pending)
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        self.buffer.extend_from_slice(buf);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.write_redacted(&line[..line.len() - 1])?;
            self.inner.write_all(b"\n")?;
        }
        if self.buffer.len() > MAX_BUFFER_BYTES {
            self.flush_buffer()?;
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_buffer()?;
        self.inner.flush()
    }
}

impl<W: Write> Drop for RedactingWriter<W> {
    fn drop(&mut self) {
        let _ = self.flush_buffer();
        let _ = self.inner.flush();
    }
}

pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
    M::Writer: Write,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}
