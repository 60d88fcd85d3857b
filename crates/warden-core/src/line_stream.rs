//! Byte streams to clean text lines.
//!
//! Both supervised processes write irregular output: plain pipes for the server,
//! a pseudo-terminal full of cursor control for the tunnel agent. Everything is turned
//! into newline-delimited, escape-free UTF-8 lines here before anyone else looks at it.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read};

use tokio::io::{AsyncRead, AsyncReadExt};

const READ_CHUNK_BYTES: usize = 8 * 1024;
// A server printing a single giant line must not grow memory without bound.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Removes terminal escape sequences, Minecraft `§` formatting codes and stray
/// control characters (tabs survive).
pub fn strip_escapes(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\u{1b}' => match chars.next() {
                // CSI: parameters and intermediates up to a final byte in @..~
                Some('[') => {
                    for c in chars.by_ref() {
                        if ('@'..='~').contains(&c) {
                            break;
                        }
                    }
                }
                // OSC / DCS / SOS / PM / APC: terminated by BEL or ESC \
                Some(']' | 'P' | 'X' | '^' | '_') => {
                    while let Some(c) = chars.next() {
                        if c == '\u{07}' {
                            break;
                        }
                        if c == '\u{1b}' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                // Charset designation takes one more character.
                Some('(' | ')' | '*' | '+') => {
                    chars.next();
                }
                _ => {}
            },
            '\u{9b}' => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            '§' => {
                chars.next();
            }
            '\t' => out.push(c),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }

    out
}

/// Incremental splitter: feed arbitrary byte chunks, get complete lines back.
///
/// A bare `\r` behaves like a terminal carriage return: whatever follows on the same
/// line overwrites what came before, so progress redraws collapse to their final state.
/// `\r\n` is treated as a plain line break.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
    cr_pending: bool,
}

impl LineDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in bytes {
            match b {
                b'\n' => {
                    self.cr_pending = false;
                    out.push(self.take_line());
                }
                b'\r' => self.cr_pending = true,
                b => {
                    if self.cr_pending {
                        self.cr_pending = false;
                        self.pending.clear();
                    }
                    self.pending.push(b);
                    if self.pending.len() >= MAX_LINE_BYTES {
                        out.push(self.take_line());
                    }
                }
            }
        }
        out
    }

    /// Flushes a trailing unterminated line at end-of-stream.
    pub fn finish(&mut self) -> Option<String> {
        self.cr_pending = false;
        if self.pending.is_empty() {
            return None;
        }
        Some(self.take_line())
    }

    fn take_line(&mut self) -> String {
        let raw = std::mem::take(&mut self.pending);
        strip_escapes(&String::from_utf8_lossy(&raw))
    }
}

/// Async line reader over a pipe. One instance per process run; it is not reused
/// after end-of-stream.
pub struct LineStream<R> {
    reader: R,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    buf: Box<[u8]>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: LineDecoder::default(),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
            eof: false,
        }
    }

    /// `Ok(None)` once the stream is closed and every buffered line was returned.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }

            let n = match self.reader.read(&mut self.buf).await {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.eof = true;
                self.ready.extend(self.decoder.finish());
                continue;
            }
            self.ready.extend(self.decoder.push(&self.buf[..n]));
        }
    }
}

/// Blocking counterpart for pseudo-terminal masters, which only offer `std::io::Read`.
pub struct BlockingLineStream<R> {
    reader: R,
    decoder: LineDecoder,
    ready: VecDeque<String>,
    buf: Box<[u8]>,
    eof: bool,
}

impl<R: Read> BlockingLineStream<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            decoder: LineDecoder::default(),
            ready: VecDeque::new(),
            buf: vec![0u8; READ_CHUNK_BYTES].into_boxed_slice(),
            eof: false,
        }
    }

    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Ok(Some(line));
            }
            if self.eof {
                return Ok(None);
            }

            let n = match self.reader.read(&mut self.buf) {
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_pty_hangup(&e) => 0,
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.eof = true;
                self.ready.extend(self.decoder.finish());
                continue;
            }
            self.ready.extend(self.decoder.push(&self.buf[..n]));
        }
    }
}

/// Linux reports EIO on a PTY master once the last slave descriptor closes.
fn is_pty_hangup(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::EIO)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_csi_osc_and_section_codes() {
        assert_eq!(strip_escapes("\u{1b}[1;32mready\u{1b}[0m"), "ready");
        assert_eq!(
            strip_escapes("\u{1b}]0;window title\u{07}after"),
            "after"
        );
        assert_eq!(strip_escapes("\u{1b}]8;;http://x\u{1b}\\link"), "link");
        assert_eq!(strip_escapes("§aSteve§r joined"), "Steve joined");
        assert_eq!(strip_escapes("\u{1b}(Bplain\u{07}"), "plain");
        assert_eq!(strip_escapes("a\tb"), "a\tb");
    }

    #[test]
    fn decoder_joins_chunks_and_handles_crlf() {
        let mut d = LineDecoder::default();
        assert!(d.push(b"hel").is_empty());
        assert_eq!(d.push(b"lo\r\nwor"), vec!["hello".to_string()]);
        assert_eq!(d.push(b"ld\n"), vec!["world".to_string()]);
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn bare_carriage_return_overwrites_line() {
        let mut d = LineDecoder::default();
        let lines = d.push(b"progress 10%\rprogress 55%\rprogress 100%\ndone");
        assert_eq!(lines, vec!["progress 100%".to_string()]);
        assert_eq!(d.finish().as_deref(), Some("done"));
    }

    #[test]
    fn decoder_is_lossy_across_split_utf8() {
        let mut d = LineDecoder::default();
        let bytes = "héllo\n".as_bytes();
        assert!(d.push(&bytes[..2]).is_empty());
        assert_eq!(d.push(&bytes[2..]), vec!["héllo".to_string()]);

        assert_eq!(d.push(b"bad \xff byte\n"), vec!["bad \u{fffd} byte".to_string()]);
    }

    #[test]
    fn overlong_lines_are_split() {
        let mut d = LineDecoder::default();
        let big = vec![b'x'; MAX_LINE_BYTES + 10];
        let lines = d.push(&big);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(d.finish().map(|s| s.len()), Some(10));
    }

    #[tokio::test]
    async fn async_stream_yields_lines_then_none() {
        let data: &[u8] = b"one\ntwo\r\n\x1b[31mthree";
        let mut s = LineStream::new(data);
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(s.next_line().await.unwrap().as_deref(), Some("three"));
        assert_eq!(s.next_line().await.unwrap(), None);
        assert_eq!(s.next_line().await.unwrap(), None);
    }

    #[test]
    fn blocking_stream_reads_cursor() {
        let mut s = BlockingLineStream::new(std::io::Cursor::new(b"a\nb\n".to_vec()));
        assert_eq!(s.next_line().unwrap().as_deref(), Some("a"));
        assert_eq!(s.next_line().unwrap().as_deref(), Some("b"));
        assert_eq!(s.next_line().unwrap(), None);
    }
}
