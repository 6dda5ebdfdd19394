pub mod console;
pub mod error;
pub mod fileport;
pub mod x64;

pub use self::error::{Error, Result};

use std::fs::File;
use std::path::PathBuf;

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use vm_memory::{Bytes, GuestAddress, GuestMemoryBackend, GuestMemoryMmap};

use crate::hv::Hypervisor;

use self::console::PtyConsole;
use self::fileport::FilePort;
use self::x64::PageSize;

pub const CONSOLE_PORT: u16 = 0xE9;
pub const FILE_PORT: u16 = 0x278;

const GUEST_BASE: GuestAddress = GuestAddress(0);

/// One guest VM: kernel handles, its slice of host memory, the console
/// pty and the file-protocol engine. Runs on a dedicated thread.
pub struct Guest {
    id: u64,
    _vm: VmFd,
    vcpu: VcpuFd,
    mem: GuestMemoryMmap<()>,
    mem_size: usize,
    load_addr: u64,
    console: PtyConsole,
    fileport: FilePort,
}

impl Guest {
    /// Builds a guest ready to boot: VM + memory slot 0 + vCPU (its run
    /// region is mapped here, at the size the hypervisor queried), long
    /// mode enabled and registers at the entry state. Any step failing
    /// unwinds the acquisitions made before it.
    pub fn new(hv: &Hypervisor, mem_size: usize, page_size: PageSize) -> Result<Self> {
        x64::validate_mem_size(mem_size)?;

        let vm = hv.kvm().create_vm()?;

        let mem: GuestMemoryMmap<()> = GuestMemoryMmap::from_ranges(&[(GUEST_BASE, mem_size)])?;

        // Register the guest memory region with KVM.
        unsafe {
            vm.set_user_memory_region(kvm_userspace_memory_region {
                slot: 0,
                guest_phys_addr: GUEST_BASE.0,
                memory_size: mem_size as u64,
                userspace_addr: mem.get_host_address(GUEST_BASE).unwrap() as u64,
                flags: 0,
            })?;
        }

        let vcpu = vm.create_vcpu(0)?;

        let load_addr = x64::setup_long_mode(&vcpu, &mem, mem_size, page_size)?;
        x64::setup_registers(&vcpu)?;

        let console = PtyConsole::open()?;

        let id = hv.next_guest_id();
        let fileport = FilePort::new(id, hv.op_token(), hv.fs_root().to_path_buf());

        tracing::info!(guest = id, mem_size, load_addr, "guest created");

        Ok(Self {
            id,
            _vm: vm,
            vcpu,
            mem,
            mem_size,
            load_addr,
            console,
            fileport,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Guest-physical address the raw image must be copied to; also the
    /// byte that guest-virtual 0 resolves to once paging is on.
    pub fn load_addr(&self) -> u64 {
        self.load_addr
    }

    /// Path of the console's slave pty, for a supervisor to attach to.
    pub fn console_path(&self) -> Result<PathBuf> {
        self.console.path()
    }

    /// Duplicate handle to the console's slave pty.
    pub fn console_handle(&self) -> Result<File> {
        self.console.slave_handle()
    }

    /// Copies a raw image verbatim into guest memory at the load address.
    pub fn load_image(&mut self, image: &[u8]) -> Result<()> {
        let fits = (self.load_addr as usize)
            .checked_add(image.len())
            .is_some_and(|end| end <= self.mem_size);
        if !fits {
            return Err(Error::ImageTooLarge {
                image: image.len(),
                load_addr: self.load_addr,
                mem_size: self.mem_size,
            });
        }

        self.mem.write_slice(image, GuestAddress(self.load_addr))?;
        Ok(())
    }

    /// Reference to the guest physical memory. This is primarily used
    /// by tests so that they can inspect memory after the VM has executed.
    pub fn memory(&self) -> &GuestMemoryMmap<()> {
        &self.mem
    }

    /// The vCPU loop: re-enter the guest, dispatch the exit, repeat
    /// until the guest stops. `Ok` on HLT or shutdown; `Err` on kernel
    /// entry failures, guest faults and unhandled exits or ports.
    ///
    /// Every host-visible effect of an exit is committed before the next
    /// re-entry.
    pub fn run(&mut self) -> Result<()> {
        let Self {
            id,
            vcpu,
            console,
            fileport,
            ..
        } = self;
        let id = *id;

        loop {
            match vcpu.run()? {
                VcpuExit::IoOut(port, data) => match port {
                    CONSOLE_PORT => console.handle_out(data)?,
                    FILE_PORT => fileport.handle_out(data),
                    other => {
                        tracing::error!(guest = id, port = other, "guest wrote to unhandled port");
                        return Err(Error::UnknownPort(other));
                    }
                },
                VcpuExit::IoIn(port, data) => match port {
                    CONSOLE_PORT => console.handle_in(data)?,
                    FILE_PORT => fileport.handle_in(data),
                    other => {
                        tracing::error!(guest = id, port = other, "guest read from unhandled port");
                        return Err(Error::UnknownPort(other));
                    }
                },
                VcpuExit::Hlt => {
                    tracing::info!(guest = id, "guest halted");
                    return Ok(());
                }
                VcpuExit::Shutdown => {
                    tracing::info!(guest = id, "guest shutdown");
                    return Ok(());
                }
                VcpuExit::InternalError => {
                    tracing::error!(guest = id, "kvm reported a guest internal error");
                    return Err(Error::GuestFault);
                }
                other => {
                    tracing::error!(guest = id, exit = ?other, "unexpected vCPU exit");
                    return Err(Error::UnexpectedExit(format!("{other:?}")));
                }
            }
        }
    }
}
