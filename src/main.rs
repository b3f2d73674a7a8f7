use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::PathBuf;
use std::process;

use clap::Parser;

use rv64emu::emulator::Emulator;

#[derive(Parser, Debug)]
#[command(author, version, about = "RV64GC full-system emulator", long_about = None)]
struct Args {
    /// Guest image to run: an ELF executable or a raw RV64 binary.
    #[arg(short, long)]
    binary: PathBuf,

    /// Disk image backing the VirtIO block device (e.g. xv6 fs.img).
    /// Opened read/write; guest writes are applied in place.
    #[arg(long)]
    rfsimg: Option<PathBuf>,

    /// Enable the riscv-tests termination convention: a store to the
    /// tohost word exits with the reported test number.
    #[arg(long)]
    riscv_test: bool,

    /// DRAM size in MiB.
    #[arg(long, default_value_t = 64)]
    mem_mib: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let dram_size = args
        .mem_mib
        .checked_mul(1024 * 1024)
        .ok_or("requested memory size is too large")?;

    let mut image = Vec::new();
    File::open(&args.binary)?.read_to_end(&mut image)?;
    log::info!(
        "loaded {} ({} bytes), DRAM {} MiB",
        args.binary.display(),
        image.len(),
        args.mem_mib
    );

    let disk = match &args.rfsimg {
        Some(path) => {
            let mut file = OpenOptions::new().read(true).write(true).open(path)?;
            let mut contents = Vec::new();
            file.read_to_end(&mut contents)?;
            log::info!("disk image {} ({} bytes)", path.display(), contents.len());
            Some((contents, Some(file)))
        }
        None => None,
    };

    let mut emu = Emulator::new(dram_size, disk);
    if args.riscv_test {
        emu.enable_riscv_test();
    } else {
        // Interactive run: hand stdin to the guest console.
        emu.bus.uart.spawn_input_thread();
    }
    emu.load_image(&image)?;

    process::exit(emu.run());
}
