use std::ffi::CStr;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

use super::error::Result;

/// Byte value handed to the guest when the console has nothing to read.
pub const EOF_SENTINEL: u8 = 0xFF;

/// Per-guest console: a pseudoterminal pair behind port `0xE9`.
///
/// The guest-facing end is the master; a supervisor attaches to the
/// slave (see [`PtyConsole::path`]). Both ends stay open for the life of
/// the guest so console output is never lost between attachments.
pub struct PtyConsole {
    master: File,
    slave: File,
}

impl PtyConsole {
    /// Allocates the pty pair. The slave is configured raw: the port is
    /// byte-oriented, so the line discipline must not rewrite the stream.
    pub fn open() -> Result<Self> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;

        // SAFETY: out-pointers are valid; name, termios and winsize may
        // all be null.
        let rc = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        // SAFETY: openpty succeeded and returned two fresh descriptors
        // that nothing else owns.
        let (master, slave) = unsafe { (File::from_raw_fd(master), File::from_raw_fd(slave)) };

        // SAFETY: termios is plain old data; tcgetattr overwrites it.
        let mut termios: libc::termios = unsafe { std::mem::zeroed() };
        // SAFETY: slave is a live tty descriptor and termios is a valid
        // out-parameter.
        if unsafe { libc::tcgetattr(slave.as_raw_fd(), &mut termios) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: termios was filled in by tcgetattr above.
        unsafe { libc::cfmakeraw(&mut termios) };
        // SAFETY: same descriptor, fully initialized termios.
        if unsafe { libc::tcsetattr(slave.as_raw_fd(), libc::TCSANOW, &termios) } != 0 {
            return Err(std::io::Error::last_os_error().into());
        }

        Ok(Self { master, slave })
    }

    /// Path of the slave device, for a supervisor to attach to.
    pub fn path(&self) -> Result<PathBuf> {
        let mut buf = [0 as libc::c_char; 128];
        // SAFETY: buf is a live buffer of the advertised length.
        let rc = unsafe { libc::ptsname_r(self.master.as_raw_fd(), buf.as_mut_ptr(), buf.len()) };
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc).into());
        }
        // SAFETY: ptsname_r wrote a nul-terminated name into buf.
        let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
        Ok(PathBuf::from(name.to_string_lossy().into_owned()))
    }

    /// Guest `OUT 0xE9`: forward the exit data onto the terminal.
    pub fn handle_out(&mut self, data: &[u8]) -> Result<()> {
        self.master.write_all(data)?;
        Ok(())
    }

    /// Guest `IN 0xE9`: one byte from the terminal, EOF sentinel on a
    /// short read.
    pub fn handle_in(&mut self, data: &mut [u8]) -> Result<()> {
        let mut byte = [0u8; 1];
        let filled = match self.master.read(&mut byte)? {
            1 => byte[0],
            _ => EOF_SENTINEL,
        };
        for b in data.iter_mut() {
            *b = filled;
        }
        Ok(())
    }

    /// Duplicate handle to the slave end, for an in-process supervisor.
    pub fn slave_handle(&self) -> Result<File> {
        Ok(self.slave.try_clone()?)
    }
}
