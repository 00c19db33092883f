//! `tracing` writer that forwards formatted events to the local syslog

use std::ffi::{CStr, CString};
use std::io;

use tracing::{Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;

const IDENT: &CStr = c"beamline-agent";
const FORMAT: &CStr = c"%s";

/// Factory handed to `tracing_subscriber::fmt::layer().with_writer(..)`.
#[derive(Debug, Clone, Copy)]
pub struct Syslog;

impl Syslog {
    /// Open the connection to the system logger.
    pub fn open() -> Self {
        // SAFETY: IDENT is a 'static NUL terminated string, as openlog requires.
        unsafe { libc::openlog(IDENT.as_ptr(), libc::LOG_PID, libc::LOG_USER) };
        Syslog
    }
}

pub struct SyslogWriter {
    priority: libc::c_int,
}

fn priority_for(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let line = String::from_utf8_lossy(buf);
        let line = line.trim_end().replace('\0', " ");
        if !line.is_empty() {
            let message = CString::new(line).map_err(io::Error::other)?;
            // SAFETY: FORMAT consumes exactly one string argument.
            unsafe { libc::syslog(self.priority, FORMAT.as_ptr(), message.as_ptr()) };
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter {
            priority: libc::LOG_INFO,
        }
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter {
            priority: priority_for(meta.level()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_mapping() {
        assert_eq!(priority_for(&Level::ERROR), libc::LOG_ERR);
        assert_eq!(priority_for(&Level::WARN), libc::LOG_WARNING);
        assert_eq!(priority_for(&Level::TRACE), libc::LOG_DEBUG);
    }
}
