#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use block_file::BlockFile;
use clap::{Parser, Subcommand};
use demand_vm::{BlockDevice, Vm, VmConfig, SECTORS_PER_PAGE, SECTOR_SIZE};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

mod block_file;
mod host_file;
mod logging;
mod workload;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Frames in the user pool
    #[arg(short, long, default_value_t = 16)]
    frames: usize,

    /// Swap image, created or truncated on start
    #[arg(short, long, default_value = "swap.img")]
    swap: PathBuf,

    /// Pages the swap image can hold
    #[arg(long, default_value_t = 256)]
    swap_pages: usize,

    /// Seed of the random data patterns
    #[arg(long, default_value_t = 0)]
    seed: u64,

    #[command(subcommand)]
    workload: Workload,
}

#[derive(Subcommand)]
enum Workload {
    /// Anonymous pages churned through swap
    Anon {
        #[arg(short, long, default_value_t = 64)]
        pages: usize,
        #[arg(short, long, default_value_t = 4)]
        rounds: usize,
    },
    /// Fork followed by copy-on-write in the child
    Fork {
        #[arg(short, long, default_value_t = 32)]
        pages: usize,
    },
    /// A host file rewritten through a mapping
    Mmap {
        #[arg(long)]
        file: PathBuf,
    },
}

fn open_swap(path: &Path, pages: usize) -> std::io::Result<Arc<dyn BlockDevice>> {
    let f = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    f.set_len((pages * SECTORS_PER_PAGE * SECTOR_SIZE) as u64)?;
    Ok(Arc::new(BlockFile(Mutex::new(f))))
}

fn run(cli: &Cli) -> std::io::Result<Arc<Vm>> {
    let swap = open_swap(&cli.swap, cli.swap_pages)?;
    let vm = Vm::new(VmConfig::default().with_user_frames(cli.frames), swap);
    let mut rng = StdRng::seed_from_u64(cli.seed);
    match &cli.workload {
        Workload::Anon { pages, rounds } => workload::anon(&vm, *pages, *rounds, &mut rng)?,
        Workload::Fork { pages } => workload::fork(&vm, *pages, &mut rng)?,
        Workload::Mmap { file } => workload::mmap(&vm, file, &mut rng)?,
    }
    Ok(vm)
}

fn main() -> std::io::Result<()> {
    logging::init();
    let cli = Cli::parse();

    println!(
        "Running on {} frames with swap image {}...",
        cli.frames,
        cli.swap.display()
    );
    let vm = run(&cli)?;
    let stats = vm.stats();
    println!("Workload verified.");
    println!(
        "faults {}, evictions {}, swap-outs {}, swap-ins {}, cow breaks {}, write-backs {}",
        stats.faults,
        stats.evictions,
        stats.swap_outs,
        stats.swap_ins,
        stats.cow_breaks,
        stats.write_backs
    );
    println!(
        "frames {}/{} free, swap {}/{} used",
        stats.frames_free, stats.frames_total, stats.swap_used, stats.swap_slots
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vm-sim-{}-{name}", std::process::id()))
    }

    fn cli(name: &str, frames: usize, swap_pages: usize, workload: Workload) -> Cli {
        Cli {
            frames,
            swap: temp_path(&format!("{name}.img")),
            swap_pages,
            seed: 7,
            workload,
        }
    }

    #[test]
    fn swap_image_has_requested_size() -> std::io::Result<()> {
        let path = temp_path("size.img");
        let device = open_swap(&path, 3)?;
        assert_eq!(device.num_blocks(), 3 * SECTORS_PER_PAGE);
        let sector = [0xa5u8; SECTOR_SIZE];
        device.write_block(5, &sector);
        let mut back = [0u8; SECTOR_SIZE];
        device.read_block(5, &mut back);
        assert_eq!(back, sector);
        std::fs::remove_file(path)
    }

    #[test]
    fn anon_workload_round_trips_through_swap() -> std::io::Result<()> {
        let cli = cli("anon", 4, 32, Workload::Anon { pages: 16, rounds: 2 });
        let vm = run(&cli)?;
        let stats = vm.stats();
        assert!(stats.swap_outs > 0);
        assert!(stats.swap_ins > 0);
        assert_eq!(stats.frames_free, 4);
        assert_eq!(stats.swap_used, 0);
        std::fs::remove_file(&cli.swap)
    }

    #[test]
    fn fork_workload_breaks_sharing() -> std::io::Result<()> {
        let cli = cli("fork", 8, 64, Workload::Fork { pages: 12 });
        let vm = run(&cli)?;
        let stats = vm.stats();
        assert!(stats.cow_breaks > 0);
        assert_eq!(stats.frames_free, 8);
        std::fs::remove_file(&cli.swap)
    }

    #[test]
    fn mmap_workload_writes_the_host_file() -> std::io::Result<()> {
        let data_path = temp_path("mapped.bin");
        let mut data = vec![0u8; 5 * demand_vm::PAGE_SIZE + 123];
        rand::thread_rng().fill(&mut data[..]);
        std::fs::write(&data_path, &data)?;
        let cli = cli(
            "mmap",
            4,
            32,
            Workload::Mmap {
                file: data_path.clone(),
            },
        );
        let vm = run(&cli)?;
        assert!(vm.stats().write_backs > 0);
        assert_ne!(std::fs::read(&data_path)?, data);
        std::fs::remove_file(&cli.swap)?;
        std::fs::remove_file(data_path)
    }
}
