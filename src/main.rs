use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use fatdrive::{FatError, FatFs};

/// Inspect and modify FAT32 disk images.
#[derive(Parser)]
#[command(name = "fatdrive", version = env!("FATDRIVE_VERSION"))]
struct Cli {
    /// Raw FAT32 image (no partition table)
    #[arg(short, long)]
    image: PathBuf,
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show volume geometry and free space
    Info,
    /// List a directory
    Ls {
        #[arg(default_value = "/")]
        path: String,
    },
    /// Print a file to stdout
    Cat { path: String },
    /// Create an empty file
    Touch { dir: String, name: String },
    /// Create a directory
    Mkdir { dir: String, name: String },
    /// Write stdin (or --input) into a file, creating it if needed
    Write {
        path: String,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Delete a file
    Rm { path: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();

    let device = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&cli.image)
        .with_context(|| format!("cannot open {}", cli.image.display()))?;
    let mut fs = FatFs::mount(device)
        .with_context(|| format!("cannot mount {}", cli.image.display()))?;

    let outcome = run(&mut fs, cli.command);
    // unmount even when the command failed, so FAT and FSInfo stay consistent
    fs.unmount().context("unmount failed")?;
    outcome
}

fn run(fs: &mut FatFs<std::fs::File>, command: Command) -> Result<()> {
    match command {
        Command::Info => {
            println!("{}", fs.volume());
            println!("free clusters:    {} (FSInfo)", fs.free_cluster_hint());
            println!("free clusters:    {} (scan)", fs.free_cluster_count()?);
        }
        Command::Ls { path } => {
            let dir = fs.open_dir(&path)?;
            for e in dir.entries() {
                let kind = if e.is_directory() { "<DIR>" } else { "" };
                println!(
                    "{:<5} {:>10} {:<19} {}",
                    kind,
                    e.size,
                    e.modified.to_string(),
                    e.name()
                );
            }
            dir.close();
        }
        Command::Cat { path } => {
            let stdout = io::stdout();
            let mut out = stdout.lock();
            fs.write_file_to(&path, &mut out)?;
            out.flush()?;
        }
        Command::Touch { dir, name } => {
            if fs.create_file(&dir, &name)?.is_none() {
                info!("{name} already exists");
            }
        }
        Command::Mkdir { dir, name } => {
            if fs.create_directory(&dir, &name)?.is_none() {
                bail!("{name} already exists in {dir}");
            }
        }
        Command::Write { path, input } => {
            let mut data = Vec::new();
            match input {
                Some(p) => {
                    data = std::fs::read(&p)
                        .with_context(|| format!("cannot read {}", p.display()))?;
                }
                None => {
                    io::stdin().read_to_end(&mut data)?;
                }
            }
            write_file(fs, &path, &data)?;
        }
        Command::Rm { path } => fs.delete_file(&path)?,
    }
    Ok(())
}

/// Replace the contents of `path`, creating it in its parent when missing.
fn write_file(fs: &mut FatFs<std::fs::File>, path: &str, data: &[u8]) -> Result<()> {
    let Some((parent, name)) = path.rsplit_once('/') else {
        bail!("path must be absolute: {path}");
    };
    let parent = if parent.is_empty() { "/" } else { parent };
    match fs.resolve_path(path) {
        Ok(_) => {}
        Err(FatError::PathNotFound(_)) => {
            fs.create_file(parent, name)?;
        }
        Err(e) => return Err(e.into()),
    }
    let mut file = fs.open_file(path)?;
    file.write(fs, 0, data)?;
    file.truncate(fs, data.len() as u64)?;
    let entry = file.close(fs)?;
    info!("wrote {} bytes to {}", entry.size, path);
    Ok(())
}
