use thiserror::Error as ThisError;
use vm_memory::{GuestMemoryError, mmap::FromRangesError};

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("virtualization node unavailable: {0}")]
    EnvUnavailable(#[source] kvm_ioctls::Error),

    #[error("run-region size query failed: {0}")]
    RunRegionSize(#[source] kvm_ioctls::Error),

    #[error("kvm error: {0}")]
    Kvm(#[from] kvm_ioctls::Error),

    #[error("guest memory error: {0}")]
    GuestMemory(#[from] GuestMemoryError),

    #[error("from ranges error: {0}")]
    FromRanges(#[from] FromRangesError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("guest memory size {0:#x} must be a non-zero multiple of 2 MiB, at most 1 GiB")]
    BadMemSize(usize),

    #[error("image of {image} bytes does not fit at load address {load_addr:#x} in {mem_size:#x} bytes of guest memory")]
    ImageTooLarge {
        image: usize,
        load_addr: u64,
        mem_size: usize,
    },

    #[error("unexpected vCPU exit: {0}")]
    UnexpectedExit(String),

    #[error("guest I/O to unhandled port {0:#x}")]
    UnknownPort(u16),

    #[error("kvm reported a guest internal error")]
    GuestFault,
}

pub type Result<T> = std::result::Result<T, Error>;
