//! hotswap CLI - redirect a function of a running process into new code.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use atoi::FromRadix16;
use clap::{Parser, Subcommand};
use hotswap::{
    symbols::{BinaryImage, SymbolTable},
    MemoryMap, RemotePatch, STUB_LEN,
};

#[derive(Parser)]
#[command(name = "hotswap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Redirect a function of a running process into an already loaded object
    Patch {
        /// Process to modify
        #[arg(short, long)]
        pid: i32,

        /// Object file holding the replacement symbol
        #[arg(short, long)]
        obj: PathBuf,

        /// Directory a relative --obj is looked up in
        #[arg(long, env = "HOTSWAP_OBJ_DIR")]
        obj_dir: Option<PathBuf>,

        /// Symbol to replace, looked up in the process' executable
        #[arg(long)]
        old: String,

        /// Replacement symbol, looked up in --obj
        #[arg(long)]
        new: String,
    },

    /// Put back bytes saved by an earlier `patch`
    Restore {
        #[arg(short, long)]
        pid: i32,

        /// Patched address (hex)
        #[arg(long, value_parser = parse_addr)]
        addr: u64,

        /// Original bytes as printed by `patch` (hex)
        #[arg(long, value_parser = parse_original)]
        original: [u8; STUB_LEN],
    },

    /// Print where a function lives inside an image
    Resolve {
        path: PathBuf,
        symbol: String,
    },
}

fn main() -> anyhow::Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Patch {
            pid,
            obj,
            obj_dir,
            old,
            new,
        } => {
            let obj = object_path(obj, obj_dir)?;
            patch(pid, &obj, &old, &new)?;
        }
        Commands::Restore {
            pid,
            addr,
            original,
        } => {
            restore(pid, addr, original)?;
        }
        Commands::Resolve { path, symbol } => {
            resolve(&path, &symbol)?;
        }
    }

    Ok(())
}

fn object_path(obj: PathBuf, obj_dir: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if obj.is_absolute() {
        return Ok(obj);
    }
    let dir = match obj_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(dir.join(obj))
}

fn patch(pid: i32, obj: &Path, old: &str, new: &str) -> anyhow::Result<()> {
    let exe = fs::read_link(format!("/proc/{pid}/exe"))
        .with_context(|| format!("cannot find the executable of pid {pid}"))?;
    let map = MemoryMap::of_pid(pid).with_context(|| format!("cannot read maps of pid {pid}"))?;

    let old_addr = hotswap::resolve_in(&map, &exe, old)
        .with_context(|| format!("resolving {old} in {}", exe.display()))?;
    let new_addr = hotswap::resolve_in(&map, obj, new)
        .with_context(|| format!("resolving {new} in {}", obj.display()))?;
    log::info!("{old} at 0x{old_addr:x}, {new} at 0x{new_addr:x}");

    let mut patch = RemotePatch::new(pid, old_addr, new_addr);
    patch.attach()?;
    patch.patch()?;
    patch.detach()?;

    if let Some(original) = patch.original() {
        let original = to_hex(original);
        log::info!("Original bytes at 0x{old_addr:x}: {original}");
        println!("hotswap restore --pid {pid} --addr 0x{old_addr:x} --original {original}");
    }
    Ok(())
}

fn restore(pid: i32, addr: u64, original: [u8; STUB_LEN]) -> anyhow::Result<()> {
    let mut patch = RemotePatch::with_original(pid, addr, original);
    patch.attach()?;
    patch.restore()?;
    patch.detach()?;
    Ok(())
}

fn resolve(path: &Path, symbol: &str) -> anyhow::Result<()> {
    let image =
        BinaryImage::open(path).with_context(|| format!("cannot read {}", path.display()))?;
    let table = SymbolTable::parse(&image)?;
    let Some(func) = table.lookup(symbol) else {
        bail!("could not find symbol {symbol:?} in {}", path.display());
    };
    println!(
        "{}: address 0x{:x} size {} file offset 0x{:x}",
        func.name, func.entry, func.size, func.file_offset
    );
    Ok(())
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_hex_u64(digits: &str) -> Option<u64> {
    let digits = digits.trim_start_matches("0x").as_bytes();
    let (value, used) = u64::from_radix_16(digits);
    (used == digits.len() && used > 0).then_some(value)
}

fn parse_addr(arg: &str) -> Result<u64, String> {
    parse_hex_u64(arg).ok_or_else(|| format!("not a hex address: {arg}"))
}

fn parse_original(arg: &str) -> Result<[u8; STUB_LEN], String> {
    let digits = arg.as_bytes();
    if digits.len() != STUB_LEN * 2 {
        return Err(format!("expected {} hex digits", STUB_LEN * 2));
    }
    let mut bytes = [0u8; STUB_LEN];
    for (byte, pair) in bytes.iter_mut().zip(digits.chunks(2)) {
        let (value, used) = u8::from_radix_16(pair);
        if used != 2 {
            return Err(format!("not hex: {arg}"));
        }
        *byte = value;
    }
    Ok(bytes)
}
