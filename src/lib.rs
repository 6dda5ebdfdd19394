pub mod hv;
pub mod vm;

pub use hv::Hypervisor;
pub use vm::x64::PageSize;
pub use vm::{Error, Guest, Result};
