use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::hv::{OpPermit, OpToken};

use super::console::EOF_SENTINEL;

// Operation codes sent by the guest as 32-bit words while idle.
const OP_FINISH: u32 = 0;
const OP_OPEN: u32 = 1;
const OP_CLOSE: u32 = 2;
const OP_READ: u32 = 3;
const OP_WRITE: u32 = 4;

/// Longest accepted filename; one byte is reserved for the terminator.
const MAX_NAME: usize = 49;

/// Flag bits that mean the guest intends to modify the file.
const WRITE_INTENT: u32 =
    (libc::O_RDWR | libc::O_WRONLY | libc::O_TRUNC | libc::O_APPEND) as u32;

/// One open-file record of a guest.
///
/// A record is appended when an OPEN starts and removed when a CLOSE
/// completes for its descriptor. A record whose open failed keeps the
/// `-1` descriptor and stays in the table, unreachable by CLOSE.
struct HostFile {
    handle: Option<File>,
    fd: RawFd,
    flags: u32,
    mode: u32,
    name: Vec<u8>,
    name_done: bool,
    rejected: bool,
}

impl HostFile {
    fn new() -> Self {
        Self {
            handle: None,
            fd: -1,
            flags: 0,
            mode: 0,
            name: Vec::new(),
            name_done: false,
            rejected: false,
        }
    }

    fn push_name_byte(&mut self, byte: u8) {
        if self.name_done {
            return;
        }
        if byte == 0 {
            self.name_done = true;
        } else if self.name.len() >= MAX_NAME {
            // Name no longer fits the bounded buffer: the whole open is
            // rejected rather than truncated.
            self.rejected = true;
        } else {
            self.name.push(byte);
        }
    }

    /// Closes the host descriptor, reporting the raw close status.
    fn close(self) -> i32 {
        match self.handle {
            Some(handle) => {
                let fd = handle.into_raw_fd();
                // SAFETY: into_raw_fd transferred ownership of fd to us;
                // nothing else will close it.
                unsafe { libc::close(fd) }
            }
            None => -1,
        }
    }
}

/// Protocol register: which operation is in flight, together with the
/// cross-guest permit that serializes it. No permit can exist outside an
/// operation and no operation without a permit.
enum OpState {
    Idle,
    Open {
        _permit: OpPermit,
        current: usize,
        got_flags: bool,
    },
    Close {
        _permit: OpPermit,
        current: Option<usize>,
    },
    Read {
        _permit: OpPermit,
        current: Option<usize>,
    },
    Write {
        _permit: OpPermit,
        current: Option<usize>,
    },
}

/// Engine behind port `0x278`: executes open/close/read/write requests
/// against the host on behalf of one guest, inside a per-guest file
/// namespace (`vm_<id>_<name>`).
pub struct FilePort {
    guest_id: u64,
    token: Arc<OpToken>,
    root: PathBuf,
    state: OpState,
    files: Vec<HostFile>,
}

impl FilePort {
    pub(crate) fn new(guest_id: u64, token: Arc<OpToken>, root: PathBuf) -> Self {
        Self {
            guest_id,
            token,
            root,
            state: OpState::Idle,
            files: Vec::new(),
        }
    }

    /// Guest `OUT` on the file port. The instruction width picks the
    /// message kind: words carry opcodes, descriptors, flags and mode;
    /// bytes carry filename and payload data.
    pub fn handle_out(&mut self, data: &[u8]) {
        match data {
            [byte] => self.byte_out(*byte),
            &[a, b, c, d] => self.word_out(u32::from_le_bytes([a, b, c, d])),
            _ => {}
        }
    }

    /// Guest `IN` on the file port: answers a descriptor (OPEN), a
    /// status word (CLOSE) or a data byte (READ), depending on the
    /// operation in flight. The buffer is left untouched otherwise.
    pub fn handle_in(&mut self, data: &mut [u8]) {
        match data.len() {
            1 => {
                if let Some(byte) = self.byte_in() {
                    data[0] = byte;
                }
            }
            4 => {
                if let Some(word) = self.word_in() {
                    data.copy_from_slice(&word.to_le_bytes());
                }
            }
            _ => {}
        }
    }

    fn word_out(&mut self, word: u32) {
        match std::mem::replace(&mut self.state, OpState::Idle) {
            OpState::Idle => self.start(word),
            OpState::Open {
                _permit,
                current,
                got_flags: false,
            } => {
                self.files[current].flags = word;
                self.state = OpState::Open {
                    _permit,
                    current,
                    got_flags: true,
                };
            }
            OpState::Open {
                _permit,
                current,
                got_flags: true,
            } => {
                self.files[current].mode = word;
                self.resolve_open(current);
                self.state = OpState::Open {
                    _permit,
                    current,
                    got_flags: true,
                };
            }
            // FINISH outside OPEN ends the operation; dropping the moved
            // state releases the permit.
            _ if word == OP_FINISH => {}
            OpState::Close { _permit, .. } => {
                let current = self.lookup(word as RawFd);
                self.state = OpState::Close { _permit, current };
            }
            OpState::Read { _permit, .. } => {
                let current = self.lookup(word as RawFd);
                self.state = OpState::Read { _permit, current };
            }
            OpState::Write { _permit, .. } => {
                let current = self.lookup(word as RawFd);
                self.state = OpState::Write { _permit, current };
            }
        }
    }

    /// First word of an operation. Blocks on the cross-guest token, so a
    /// guest stalls here while another guest is mid-operation.
    fn start(&mut self, opcode: u32) {
        match opcode {
            OP_OPEN => {
                let permit = self.token.acquire();
                self.files.push(HostFile::new());
                self.state = OpState::Open {
                    _permit: permit,
                    current: self.files.len() - 1,
                    got_flags: false,
                };
            }
            OP_CLOSE => {
                self.state = OpState::Close {
                    _permit: self.token.acquire(),
                    current: None,
                }
            }
            OP_READ => {
                self.state = OpState::Read {
                    _permit: self.token.acquire(),
                    current: None,
                }
            }
            OP_WRITE => {
                self.state = OpState::Write {
                    _permit: self.token.acquire(),
                    current: None,
                }
            }
            // FINISH (or garbage) with no operation in flight must not
            // touch the token.
            _ => tracing::debug!(
                guest = self.guest_id,
                opcode,
                "ignoring stray word outside an operation"
            ),
        }
    }

    fn byte_out(&mut self, byte: u8) {
        match &mut self.state {
            OpState::Open { current, .. } => self.files[*current].push_name_byte(byte),
            OpState::Write {
                current: Some(index),
                ..
            } => {
                if let Some(handle) = self.files[*index].handle.as_mut() {
                    if let Err(err) = handle.write_all(&[byte]) {
                        tracing::debug!(guest = self.guest_id, %err, "guest write dropped");
                    }
                }
            }
            // Bytes for an unknown descriptor (or no operation) are
            // discarded.
            _ => {}
        }
    }

    fn byte_in(&mut self) -> Option<u8> {
        match &mut self.state {
            OpState::Read {
                current: Some(index),
                ..
            } => {
                let byte = match self.files[*index].handle.as_mut() {
                    Some(handle) => {
                        let mut buf = [0u8; 1];
                        match handle.read(&mut buf) {
                            Ok(1) => buf[0],
                            _ => EOF_SENTINEL,
                        }
                    }
                    None => EOF_SENTINEL,
                };
                Some(byte)
            }
            OpState::Read { current: None, .. } => Some(EOF_SENTINEL),
            _ => None,
        }
    }

    fn word_in(&mut self) -> Option<i32> {
        match std::mem::replace(&mut self.state, OpState::Idle) {
            // Answering the descriptor completes the OPEN; the permit is
            // dropped with the moved state.
            OpState::Open { current, .. } => Some(self.files[current].fd),
            OpState::Close { _permit, current } => {
                let status = match current {
                    Some(index) => self.files.remove(index).close(),
                    None => -1,
                };
                // The operation stays open until the guest's FINISH.
                self.state = OpState::Close {
                    _permit,
                    current: None,
                };
                Some(status)
            }
            other => {
                self.state = other;
                None
            }
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<usize> {
        self.files.iter().position(|file| file.fd == fd)
    }

    /// Flags and mode are complete: resolve the name against the guest
    /// namespace and open the host file. Failures leave the descriptor
    /// at `-1`; the guest learns about them in-band.
    fn resolve_open(&mut self, current: usize) {
        let guest_id = self.guest_id;
        let file = &mut self.files[current];
        if file.rejected || !file.name_done {
            return;
        }

        let sandboxed = self.root.join(sandboxed_name(guest_id, &file.name));
        let opened = if sandboxed.exists() {
            open_with(&sandboxed, file.flags, file.mode)
        } else if file.flags & WRITE_INTENT != 0 {
            // Copy-on-open: materialize the private copy first, then
            // honor the guest's own flags against it.
            create_sandboxed(&sandboxed).and_then(|()| open_with(&sandboxed, file.flags, file.mode))
        } else {
            // Read-only opens fall through to the shared seed inputs.
            open_with(&self.root.join(OsStr::from_bytes(&file.name)), file.flags, file.mode)
        };

        match opened {
            Ok(handle) => {
                file.fd = handle.as_raw_fd();
                file.handle = Some(handle);
                tracing::debug!(
                    guest = guest_id,
                    fd = file.fd,
                    name = %String::from_utf8_lossy(&file.name),
                    "opened host file"
                );
            }
            Err(err) => {
                tracing::debug!(
                    guest = guest_id,
                    name = %String::from_utf8_lossy(&file.name),
                    %err,
                    "guest open failed"
                );
            }
        }
    }
}

/// `vm_<id>_<name>`: the per-guest rewrite of a guest-visible filename.
/// The engine always prepends its own id, so no guest can reach into
/// another guest's namespace.
fn sandboxed_name(guest_id: u64, name: &[u8]) -> OsString {
    let mut sandboxed = OsString::from(format!("vm_{guest_id}_"));
    sandboxed.push(OsStr::from_bytes(name));
    sandboxed
}

fn create_sandboxed(path: &Path) -> io::Result<()> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o777)
        .open(path)
        .map(|_| ())
}

/// Opens a host path with the guest-supplied POSIX flags and mode.
fn open_with(path: &Path, flags: u32, mode: u32) -> io::Result<File> {
    let flags = flags as i32;
    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => {
            opts.read(true);
        }
    }
    opts.append(flags & libc::O_APPEND != 0);
    opts.truncate(flags & libc::O_TRUNC != 0);
    opts.create(flags & libc::O_CREAT != 0);
    opts.custom_flags(flags & !(libc::O_ACCMODE | libc::O_APPEND | libc::O_TRUNC | libc::O_CREAT));
    opts.mode(mode);
    opts.open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn engine_with(guest_id: u64, token: &Arc<OpToken>, root: &TempDir) -> FilePort {
        FilePort::new(guest_id, Arc::clone(token), root.path().to_path_buf())
    }

    fn engine(root: &TempDir) -> FilePort {
        engine_with(0, &Arc::new(OpToken::new()), root)
    }

    fn word_out(fp: &mut FilePort, word: u32) {
        fp.handle_out(&word.to_le_bytes());
    }

    fn byte_out(fp: &mut FilePort, byte: u8) {
        fp.handle_out(&[byte]);
    }

    fn word_in(fp: &mut FilePort) -> i32 {
        let mut data = [0u8; 4];
        fp.handle_in(&mut data);
        i32::from_le_bytes(data)
    }

    fn byte_in(fp: &mut FilePort) -> u8 {
        let mut data = [0xAAu8; 1];
        fp.handle_in(&mut data);
        data[0]
    }

    fn open(fp: &mut FilePort, name: &[u8], flags: u32, mode: u32) -> i32 {
        word_out(fp, OP_OPEN);
        for &byte in name {
            byte_out(fp, byte);
        }
        byte_out(fp, 0);
        word_out(fp, flags);
        word_out(fp, mode);
        word_in(fp)
    }

    fn close(fp: &mut FilePort, fd: i32) -> i32 {
        word_out(fp, OP_CLOSE);
        word_out(fp, fd as u32);
        let status = word_in(fp);
        word_out(fp, OP_FINISH);
        status
    }

    fn write_bytes(fp: &mut FilePort, fd: i32, payload: &[u8]) {
        word_out(fp, OP_WRITE);
        word_out(fp, fd as u32);
        for &byte in payload {
            byte_out(fp, byte);
        }
        word_out(fp, OP_FINISH);
    }

    fn read_bytes(fp: &mut FilePort, fd: i32, count: usize) -> Vec<u8> {
        word_out(fp, OP_READ);
        word_out(fp, fd as u32);
        let bytes = (0..count).map(|_| byte_in(fp)).collect();
        word_out(fp, OP_FINISH);
        bytes
    }

    const WR_CREATE: u32 = (libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC) as u32;
    const RDONLY: u32 = libc::O_RDONLY as u32;

    #[test]
    fn write_lands_in_guest_namespace() {
        let root = TempDir::new().unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"log.txt", WR_CREATE, 0o644);
        assert!(fd >= 0);
        write_bytes(&mut fp, fd, b"hello");
        assert_eq!(close(&mut fp, fd), 0);

        assert_eq!(
            std::fs::read(root.path().join("vm_0_log.txt")).unwrap(),
            b"hello"
        );
        assert!(!root.path().join("log.txt").exists());
    }

    #[test]
    fn readonly_open_falls_back_to_shared_seed() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("primer.txt"), b"HELLO").unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"primer.txt", RDONLY, 0);
        assert!(fd >= 0);
        assert_eq!(read_bytes(&mut fp, fd, 5), b"HELLO");
        assert_eq!(close(&mut fp, fd), 0);

        // The shared seed is never copied on a read-only open.
        assert!(!root.path().join("vm_0_primer.txt").exists());
    }

    #[test]
    fn existing_sandboxed_copy_shadows_the_seed() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("seed.txt"), b"SEED").unwrap();
        std::fs::write(root.path().join("vm_0_seed.txt"), b"MINE").unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"seed.txt", RDONLY, 0);
        assert_eq!(read_bytes(&mut fp, fd, 4), b"MINE");
        close(&mut fp, fd);
    }

    #[test]
    fn written_bytes_read_back_under_same_name() {
        let root = TempDir::new().unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"note.txt", WR_CREATE, 0o644);
        write_bytes(&mut fp, fd, b"B");
        close(&mut fp, fd);

        // A fresh open of the same name resolves to the sandboxed copy.
        let fd = open(&mut fp, b"note.txt", RDONLY, 0);
        assert_eq!(read_bytes(&mut fp, fd, 1), b"B");
        close(&mut fp, fd);
    }

    #[test]
    fn read_past_end_returns_sentinel() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("tiny.txt"), b"x").unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"tiny.txt", RDONLY, 0);
        assert_eq!(read_bytes(&mut fp, fd, 3), vec![b'x', EOF_SENTINEL, EOF_SENTINEL]);
        close(&mut fp, fd);
    }

    #[test]
    fn unknown_descriptor_reads_sentinel_and_close_fails() {
        let root = TempDir::new().unwrap();
        let mut fp = engine(&root);

        assert_eq!(read_bytes(&mut fp, 42, 2), vec![EOF_SENTINEL, EOF_SENTINEL]);
        assert_eq!(close(&mut fp, 42), -1);
    }

    #[test]
    fn open_of_missing_seed_reports_negative_descriptor() {
        let root = TempDir::new().unwrap();
        let mut fp = engine(&root);

        assert_eq!(open(&mut fp, b"nope.txt", RDONLY, 0), -1);
    }

    #[test]
    fn name_at_limit_succeeds_one_past_is_rejected() {
        let root = TempDir::new().unwrap();
        let mut fp = engine(&root);

        let longest = vec![b'a'; MAX_NAME];
        let fd = open(&mut fp, &longest, WR_CREATE, 0o644);
        assert!(fd >= 0);
        close(&mut fp, fd);

        let too_long = vec![b'a'; MAX_NAME + 1];
        assert_eq!(open(&mut fp, &too_long, WR_CREATE, 0o644), -1);
    }

    #[test]
    fn guests_share_names_but_not_files() {
        let root = TempDir::new().unwrap();
        let token = Arc::new(OpToken::new());
        let mut first = engine_with(0, &token, &root);
        let mut second = engine_with(1, &token, &root);

        let fd = open(&mut first, b"log.txt", WR_CREATE, 0o644);
        write_bytes(&mut first, fd, b"A");
        close(&mut first, fd);

        let fd = open(&mut second, b"log.txt", WR_CREATE, 0o644);
        write_bytes(&mut second, fd, b"B");
        close(&mut second, fd);

        assert_eq!(std::fs::read(root.path().join("vm_0_log.txt")).unwrap(), b"A");
        assert_eq!(std::fs::read(root.path().join("vm_1_log.txt")).unwrap(), b"B");
        assert!(!root.path().join("log.txt").exists());
    }

    #[test]
    fn dropping_an_engine_mid_operation_frees_the_token() {
        let root = TempDir::new().unwrap();
        let token = Arc::new(OpToken::new());
        let mut stalled = engine_with(0, &token, &root);

        // Start an OPEN and never finish it; the permit is now held.
        word_out(&mut stalled, OP_OPEN);
        drop(stalled);

        // A second guest must be able to run a full operation.
        let (tx, rx) = mpsc::channel();
        let root_path = root.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            let mut fp = FilePort::new(1, token, root_path);
            let fd = open(&mut fp, b"after.txt", WR_CREATE, 0o644);
            tx.send(fd).unwrap();
        });
        let fd = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("token was not released by the dropped engine");
        assert!(fd >= 0);
        handle.join().unwrap();
    }

    #[test]
    fn stray_finish_while_idle_does_not_take_the_token() {
        let root = TempDir::new().unwrap();
        let token = Arc::new(OpToken::new());
        let mut fp = engine_with(0, &token, &root);

        word_out(&mut fp, OP_FINISH);
        word_out(&mut fp, 99); // unknown opcode

        // If either word had taken the token, this OPEN would block.
        let (tx, rx) = mpsc::channel();
        let root_path = root.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            let mut other = FilePort::new(1, token, root_path);
            tx.send(open(&mut other, b"free.txt", WR_CREATE, 0o644)).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("token wedged") >= 0);
        handle.join().unwrap();
    }

    #[test]
    fn finish_mid_read_returns_to_idle() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("seed.txt"), b"abc").unwrap();
        let mut fp = engine(&root);

        let fd = open(&mut fp, b"seed.txt", RDONLY, 0);
        word_out(&mut fp, OP_READ);
        word_out(&mut fp, fd as u32);
        assert_eq!(byte_in(&mut fp), b'a');
        word_out(&mut fp, OP_FINISH);

        // Back at idle: a whole new operation runs on the same engine,
        // and reads untouched by the abandoned one.
        let fd = open(&mut fp, b"seed.txt", RDONLY, 0);
        assert_eq!(read_bytes(&mut fp, fd, 1), b"a");
        close(&mut fp, fd);
    }

    #[test]
    fn operations_of_two_guests_do_not_interleave() {
        let root = TempDir::new().unwrap();
        let token = Arc::new(OpToken::new());
        let mut first = engine_with(0, &token, &root);

        // First guest is mid-OPEN; the second guest's opcode word must
        // block until the first answers its descriptor.
        word_out(&mut first, OP_OPEN);

        let (tx, rx) = mpsc::channel();
        let contender = Arc::clone(&token);
        let root_path = root.path().to_path_buf();
        let handle = std::thread::spawn(move || {
            let mut second = FilePort::new(1, contender, root_path);
            word_out(&mut second, OP_OPEN);
            tx.send(()).unwrap();
            // Unwind cleanly so the permit is not leaked.
            drop(second);
        });
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        // Finish the first operation; the second may now start.
        for &byte in b"a\0" {
            byte_out(&mut first, byte);
        }
        word_out(&mut first, WR_CREATE);
        word_out(&mut first, 0o644);
        let _ = word_in(&mut first);

        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }
}
