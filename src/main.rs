//! mftkit CLI
//!
//! Command-line interface for inspecting NTFS volume images.

use clap::{Parser, Subcommand};
use console::style;
use mftkit::ntfs::runs::{decode_run_list, CookedRuns, ExtentId};
use mftkit::ntfs::source::{ByteSource, FileSource, MmapSource};
use mftkit::ntfs::{AttributeBody, RecordStatus};
use mftkit::{format_filetime, format_size, MftError, NtfsVolume, VolumeConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// mftkit - NTFS master file table inspector
///
/// Reads MFT records, run lists and directory indexes straight from a
/// volume image.
#[derive(Parser)]
#[command(name = "mftkit")]
#[command(author = "mftkit Contributors")]
#[command(version)]
#[command(about = "NTFS master file table inspector", long_about = None)]
struct Cli {
    /// Memory-map the image instead of reading it through a file handle
    #[arg(long, global = true)]
    mmap: bool,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Write log lines to this file
    #[arg(long, global = true)]
    log: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Override the fixup stride taken from the boot sector
    #[arg(long, global = true)]
    sector_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode a hex run list and show its VCN to LCN mapping
    Runs {
        /// Run list bytes, e.g. "31 04 10 00 00" (use -- before values starting with -)
        #[arg(allow_hyphen_values = true, num_args = 1..)]
        hex: Vec<String>,
    },

    /// Dump the attributes of one MFT record
    Record {
        image: PathBuf,
        record: u64,
    },

    /// List a directory
    Ls {
        image: PathBuf,

        /// Directory path (default: root)
        path: Option<String>,
    },

    /// Copy a file's data stream to stdout or a file
    Cat {
        image: PathBuf,
        path: String,

        /// Named data stream
        #[arg(short, long)]
        stream: Option<String>,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Walk every MFT record and count valid, free and corrupt ones
    Check {
        image: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    if let Err(e) = mftkit::logging::init(cli.log.as_deref(), level) {
        eprintln!("{} {}", style("Warning:").yellow().bold(), e);
    }

    let opts = Options {
        mmap: cli.mmap,
        json: cli.json,
        sector_size: cli.sector_size,
    };

    let result = match cli.command {
        Commands::Runs { hex } => cmd_runs(&hex.join(" "), &opts),
        Commands::Record { image, record } => cmd_record(&image, record, &opts),
        Commands::Ls { image, path } => cmd_ls(&image, path.as_deref(), &opts),
        Commands::Cat {
            image,
            path,
            stream,
            output,
        } => cmd_cat(&image, &path, stream.as_deref(), output.as_deref(), &opts),
        Commands::Check { image } => cmd_check(&image, &opts),
    };

    mftkit::logging::flush();

    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }
}

struct Options {
    mmap: bool,
    json: bool,
    sector_size: Option<usize>,
}

fn open_volume(image: &Path, opts: &Options) -> mftkit::Result<NtfsVolume> {
    let source: Arc<dyn ByteSource> = if opts.mmap {
        Arc::new(MmapSource::open(image)?)
    } else {
        Arc::new(FileSource::open(image, false)?)
    };
    let mut config = VolumeConfig::default();
    if let Some(sector_size) = opts.sector_size {
        config = config.with_sector_size(sector_size);
    }
    NtfsVolume::open(source, config)
}

fn parse_hex(text: &str) -> mftkit::Result<Vec<u8>> {
    let digits: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ',')
        .collect();
    let digits = digits.trim_start_matches("0x");
    if digits.len() % 2 != 0 {
        return Err(MftError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "odd number of hex digits",
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16).map_err(|e| {
                MftError::IoError(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{:?}: {}", &digits[i..i + 2], e),
                ))
            })
        })
        .collect()
}

/// Run list command
fn cmd_runs(hex: &str, opts: &Options) -> mftkit::Result<()> {
    let bytes = parse_hex(hex)?;
    let (runs, consumed) = decode_run_list(&bytes, 0)?;
    let cooked = CookedRuns::cook(&runs, 0, ExtentId(0))?;

    if opts.json {
        let out = serde_json::json!({
            "bytes_consumed": consumed,
            "runs": runs,
            "cooked": cooked.runs(),
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(());
    }

    println!(
        "{} {} run(s) in {} bytes",
        style("→").cyan().bold(),
        runs.len(),
        consumed
    );
    println!();
    for (run, cooked) in runs.iter().zip(cooked.iter()) {
        let target = if cooked.is_sparse {
            style("sparse".to_string()).dim()
        } else {
            style(format!("lcn {}..{}", cooked.start_lcn, cooked.start_lcn + cooked.length)).green()
        };
        println!(
            "  {} vcn {}..{} {}",
            style(format!("{:>12}", run.to_string())).yellow(),
            cooked.start_vcn,
            cooked.end_vcn(),
            target
        );
    }
    Ok(())
}

/// Record dump command
fn cmd_record(image: &Path, record_number: u64, opts: &Options) -> mftkit::Result<()> {
    let volume = open_volume(image, opts)?;
    let record = volume.mft().read_record(record_number)?;

    if opts.json {
        let out = serde_json::json!({
            "record": record_number,
            "header": &record.header,
            "attributes": record.attributes(),
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(());
    }

    let header = &record.header;
    println!(
        "{} Record {} (sequence {}, {} of {} bytes used)",
        style("→").cyan().bold(),
        style(record_number).yellow(),
        header.sequence_number,
        header.used_size,
        header.allocated_size
    );
    println!(
        "  flags {:#06x}{}{}",
        header.flags,
        if record.is_in_use() { " in-use" } else { "" },
        if record.is_directory() { " directory" } else { "" }
    );
    if !record.is_base_record() {
        println!("  extension of {}", style(record.base_reference()).cyan());
    }
    println!();

    for attr in record.attributes() {
        let name = attr.name.as_deref().map(|n| format!(":{}", n)).unwrap_or_default();
        match &attr.body {
            AttributeBody::Resident(r) => println!(
                "  {} {}{} id {} resident, {} bytes",
                style("•").green(),
                style(attr.attr_type).cyan(),
                name,
                attr.id,
                r.data.len()
            ),
            AttributeBody::NonResident(nr) => {
                println!(
                    "  {} {}{} id {} vcn {}..={}, {} real / {} allocated{}",
                    style("•").green(),
                    style(attr.attr_type).cyan(),
                    name,
                    attr.id,
                    nr.start_vcn,
                    nr.last_vcn,
                    format_size(nr.real_size),
                    format_size(nr.allocated_size),
                    if attr.is_compressed() { ", compressed" } else { "" }
                );
                let runs: Vec<String> = nr.runs.iter().map(|r| r.to_string()).collect();
                println!("      {} {}", style("runs:").dim(), runs.join(" "));
            }
        }
    }
    Ok(())
}

/// Directory listing command
fn cmd_ls(image: &Path, path: Option<&str>, opts: &Options) -> mftkit::Result<()> {
    let volume = open_volume(image, opts)?;
    let dir = match path {
        Some(path) => volume.lookup_path(path)?,
        None => volume.root_directory()?,
    };
    let entries = volume.read_dir(&dir)?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&entries).unwrap_or_default());
        return Ok(());
    }

    for entry in &entries {
        let icon = if entry.is_directory { "📁" } else { "📄" };
        println!(
            "  {} {} {} {}",
            style(format!("{:>12}", format_size(entry.size))).yellow(),
            style(format_filetime(entry.modified)).dim(),
            icon,
            if entry.is_directory {
                style(&entry.name).cyan()
            } else {
                style(&entry.name)
            }
        );
    }
    println!();
    println!("  {} entries", style(entries.len()).green());
    Ok(())
}

/// File contents command
fn cmd_cat(
    image: &Path,
    path: &str,
    stream: Option<&str>,
    output: Option<&Path>,
    opts: &Options,
) -> mftkit::Result<()> {
    let volume = open_volume(image, opts)?;
    let file = volume.lookup_path(path)?;
    let mut data = volume.open_data(&file, stream)?;

    let copied = match output {
        Some(output) => {
            let mut out = std::fs::File::create(output)?;
            let copied = std::io::copy(&mut data, &mut out)?;
            out.flush()?;
            copied
        }
        None => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            let copied = std::io::copy(&mut data, &mut out)?;
            out.flush()?;
            copied
        }
    };
    log::debug!("copied {} bytes of {}", copied, path);

    if let Some(output) = output {
        eprintln!(
            "{} Wrote {} to {}",
            style("✓").green(),
            format_size(copied),
            style(output.display()).yellow()
        );
    }
    Ok(())
}

/// Consistency check command
fn cmd_check(image: &Path, opts: &Options) -> mftkit::Result<()> {
    let volume = open_volume(image, opts)?;
    let mft = volume.mft();
    let start = Instant::now();

    let (mut valid, mut free) = (0u64, 0u64);
    let mut corrupt = Vec::new();
    for n in 0..mft.record_count() {
        match mft.inspect(n)? {
            RecordStatus::InUse(_) => valid += 1,
            RecordStatus::Free => free += 1,
            RecordStatus::Corrupt(e) => {
                log::warn!("record {}: {}", n, e);
                corrupt.push((n, e.to_string()));
            }
        }
    }

    if opts.json {
        let out = serde_json::json!({
            "records": mft.record_count(),
            "valid": valid,
            "free": free,
            "corrupt": corrupt
                .iter()
                .map(|(n, e)| serde_json::json!({ "record": n, "error": e }))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out).unwrap_or_default());
        return Ok(());
    }

    println!(
        "{} Checked {} records in {:.2}s",
        style("→").cyan().bold(),
        mft.record_count(),
        start.elapsed().as_secs_f64()
    );
    println!("  {} {}", style("Valid:").bold(), style(valid).green());
    println!("  {} {}", style("Free:").bold(), free);
    println!("  {} {}", style("Corrupt:").bold(), style(corrupt.len()).red());
    for (n, e) in &corrupt {
        println!("    {} {}: {}", style("✗").red(), n, e);
    }
    Ok(())
}
