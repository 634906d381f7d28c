//! Diagnostics setup.
//!
//! Events go through `tracing`. In the foreground they are printed to
//! stderr; when daemonized (or on request) each formatted event becomes
//! one syslog record under the `logecho` identity.

use std::ffi::{c_int, CStr, CString};
use std::io;
use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const IDENT: &CStr = c"logecho";

/// Install the global subscriber.
pub fn init(level: &str, syslog: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if syslog {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Syslog::open())
            .with_ansi(false)
            .without_time()
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
    }
}

/// Release the syslog connection, if one was opened.
pub fn close(syslog: bool) {
    if syslog {
        // SAFETY: closelog takes no arguments and is safe to call at any time.
        unsafe { libc::closelog() };
    }
}

/// `MakeWriter` that turns each event into one syslog record.
#[derive(Debug, Clone, Copy)]
pub struct Syslog;

impl Syslog {
    pub fn open() -> Self {
        // SAFETY: IDENT is 'static, so the pointer openlog keeps stays valid.
        unsafe { libc::openlog(IDENT.as_ptr(), libc::LOG_PID, libc::LOG_USER) };
        Syslog
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogRecord;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogRecord::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogRecord::new(priority(meta.level()))
    }
}

/// Buffers one formatted event and submits it when dropped.
#[derive(Debug)]
pub struct SyslogRecord {
    priority: c_int,
    buf: Vec<u8>,
}

impl SyslogRecord {
    fn new(priority: c_int) -> Self {
        Self {
            priority,
            buf: Vec::with_capacity(128),
        }
    }
}

impl io::Write for SyslogRecord {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogRecord {
    fn drop(&mut self) {
        let Some(message) = record_message(&self.buf) else {
            return;
        };
        // SAFETY: both pointers are valid NUL-terminated strings, and the
        // message is passed as an argument so '%' in it is not interpreted.
        unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
    }
}

/// Trailing newlines removed, interior NULs dropped. `None` if nothing is left.
fn record_message(buf: &[u8]) -> Option<CString> {
    let end = buf.iter().rposition(|&b| b != b'\n')? + 1;
    let bytes: Vec<u8> = buf[..end].iter().copied().filter(|&b| b != 0).collect();
    CString::new(bytes).ok()
}

fn priority(level: &Level) -> c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}
