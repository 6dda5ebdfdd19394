use std::path::PathBuf;

use clap::Parser;

use lodge::{Guest, Hypervisor, PageSize};

/// lodge: boots raw 64-bit images as KVM guests, one vCPU each.
#[derive(Parser)]
#[command(name = "lodge", version, about)]
struct Cli {
    /// Guest memory size in MiB; must be a multiple of 2.
    #[arg(long)]
    memory: usize,

    /// Page granularity of the guest mapping: 2 (MiB pages) or 4 (KiB pages).
    #[arg(long, value_parser = parse_page)]
    page: PageSize,

    /// Accepted for compatibility; every image always runs in its own guest.
    #[arg(long)]
    guest: bool,

    /// Raw guest images, each loaded into its own guest and run concurrently.
    #[arg(required = true)]
    images: Vec<PathBuf>,
}

fn parse_page(arg: &str) -> Result<PageSize, String> {
    match arg {
        "2" => Ok(PageSize::Mib2),
        "4" => Ok(PageSize::Kib4),
        _ => Err(String::from("page size must be 2 (MiB) or 4 (KiB)")),
    }
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(true) => {}
        // A guest stopped with an error; the others already ran to
        // completion, so only the exit code reports it.
        Ok(false) => std::process::exit(1),
        Err(err) => {
            tracing::error!("initialization failed: {err}");
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> Result<bool, Box<dyn std::error::Error>> {
    if cli.guest {
        tracing::debug!("--guest accepted; guests are always isolated");
    }
    let mem_size = cli.memory << 20;

    let hv = Hypervisor::new()?;
    tracing::debug!(run_region_size = hv.run_region_size(), "hypervisor ready");

    let mut guests = Vec::new();
    for image_path in &cli.images {
        let image = std::fs::read(image_path)?;
        let mut guest = Guest::new(&hv, mem_size, cli.page)?;
        guest.load_image(&image)?;
        let console = guest.console_path()?;
        tracing::info!(
            guest = guest.id(),
            image = %image_path.display(),
            console = %console.display(),
            "guest loaded"
        );
        guests.push(guest);
    }

    let mut handles = Vec::new();
    for mut guest in guests {
        let handle = std::thread::Builder::new()
            .name(format!("guest-{}", guest.id()))
            .spawn(move || {
                let id = guest.id();
                match guest.run() {
                    Ok(()) => true,
                    Err(err) => {
                        tracing::error!(guest = id, "guest stopped with error: {err}");
                        false
                    }
                }
            })?;
        handles.push(handle);
    }

    let mut all_clean = true;
    for handle in handles {
        all_clean &= handle.join().unwrap_or(false);
    }
    Ok(all_clean)
}
