#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use log::*;
use structopt::StructOpt;

use flatezip::zip::{ZipArchive, ZipWriter, METHOD_DEFLATED, METHOD_STORED};
use flatezip::{Strategy, Wrapper};

////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, StructOpt)]
#[structopt(name = "flatezip", about = "DEFLATE compressor, decompressor and ZIP tool")]
struct Opts {
    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[structopt(short = "v", long = "verbose", parse(from_occurrences), global = true)]
    verbose: usize,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Compress a file or stdin
    Compress {
        /// Stream format: gzip, zlib or raw
        #[structopt(short, long, default_value = "gzip")]
        format: String,
        /// Block strategy: stored, fixed or dynamic
        #[structopt(short, long, default_value = "dynamic")]
        strategy: String,
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
        /// Output file (stdout when omitted)
        #[structopt(short, long)]
        output: Option<PathBuf>,
    },
    /// Decompress a file or stdin
    Decompress {
        /// Stream format: gzip, zlib or raw
        #[structopt(short, long, default_value = "gzip")]
        format: String,
        /// Input file (stdin when omitted)
        input: Option<PathBuf>,
        /// Output file (stdout when omitted)
        #[structopt(short, long)]
        output: Option<PathBuf>,
    },
    /// List the entries of a ZIP archive
    List {
        archive: PathBuf,
    },
    /// Extract one entry from a ZIP archive
    Extract {
        archive: PathBuf,
        entry: String,
        /// Output file (stdout when omitted)
        #[structopt(short, long)]
        output: Option<PathBuf>,
    },
    /// Create a ZIP archive from the given files
    Create {
        archive: PathBuf,
        files: Vec<PathBuf>,
        /// Store entries without compression
        #[structopt(long)]
        stored: bool,
    },
}

////////////////////////////////////////////////////////////////////////////////

fn parse_format(format: &str) -> Result<Wrapper> {
    match format {
        "gzip" => Ok(Wrapper::Gzip),
        "zlib" => Ok(Wrapper::Zlib),
        "raw" => Ok(Wrapper::Raw),
        other => bail!("unknown format {:?} (expected gzip, zlib or raw)", other),
    }
}

fn parse_strategy(strategy: &str) -> Result<Strategy> {
    match strategy {
        "stored" => Ok(Strategy::Stored),
        "fixed" => Ok(Strategy::Fixed),
        "dynamic" => Ok(Strategy::Dynamic),
        other => bail!(
            "unknown strategy {:?} (expected stored, fixed or dynamic)",
            other
        ),
    }
}

fn open_input(path: &Option<PathBuf>) -> Result<Box<dyn BufRead>> {
    Ok(match path {
        Some(path) => {
            let file =
                File::open(path).with_context(|| format!("failed to open {:?}", path))?;
            Box::new(BufReader::new(file))
        }
        None => Box::new(BufReader::new(io::stdin())),
    })
}

fn open_output(path: &Option<PathBuf>) -> Result<Box<dyn Write>> {
    Ok(match path {
        Some(path) => {
            let file =
                File::create(path).with_context(|| format!("failed to create {:?}", path))?;
            Box::new(BufWriter::new(file))
        }
        None => Box::new(BufWriter::new(io::stdout())),
    })
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}

////////////////////////////////////////////////////////////////////////////////

fn main() -> Result<()> {
    let opts = Opts::from_args();
    stderrlog::new()
        .verbosity(opts.verbose + 1)
        .timestamp(stderrlog::Timestamp::Off)
        .init()?;

    match opts.command {
        Command::Compress {
            format,
            strategy,
            input,
            output,
        } => {
            let wrapper = parse_format(&format)?;
            let strategy = parse_strategy(&strategy)?;
            let reader = open_input(&input)?;
            let mut writer = open_output(&output)?;
            let written = flatezip::compress(reader, &mut writer, wrapper, strategy)?;
            writer.flush()?;
            info!("wrote {} compressed bytes", written);
        }
        Command::Decompress {
            format,
            input,
            output,
        } => {
            let wrapper = parse_format(&format)?;
            let reader = open_input(&input)?;
            let mut writer = open_output(&output)?;
            let written = flatezip::decompress(reader, &mut writer, wrapper)?;
            writer.flush()?;
            info!("wrote {} decompressed bytes", written);
        }
        Command::List { archive } => {
            let file = File::open(&archive)
                .with_context(|| format!("failed to open {:?}", archive))?;
            let archive = ZipArchive::new(BufReader::new(file))?;
            println!("{:>12} {:>12}  name", "size", "packed");
            for entry in archive.entries() {
                println!(
                    "{:>12} {:>12}  {}",
                    entry.uncompressed_size, entry.compressed_size, entry.name
                );
            }
        }
        Command::Extract {
            archive,
            entry,
            output,
        } => {
            let file = File::open(&archive)
                .with_context(|| format!("failed to open {:?}", archive))?;
            let mut archive = ZipArchive::new(BufReader::new(file))?;
            let data = archive.read_by_name(&entry)?;
            let mut writer = open_output(&output)?;
            writer.write_all(&data)?;
            writer.flush()?;
            info!("extracted {} bytes from {:?}", data.len(), entry);
        }
        Command::Create {
            archive,
            files,
            stored,
        } => {
            let method = if stored { METHOD_STORED } else { METHOD_DEFLATED };
            let file = File::create(&archive)
                .with_context(|| format!("failed to create {:?}", archive))?;
            let mut writer = ZipWriter::new(BufWriter::new(file));
            for path in &files {
                let mut data = Vec::new();
                File::open(path)
                    .with_context(|| format!("failed to open {:?}", path))?
                    .read_to_end(&mut data)?;
                let name = entry_name(path);
                debug!("adding {:?} ({} bytes)", name, data.len());
                writer.add(&name, &data, method)?;
            }
            writer.finish()?.flush()?;
            info!("created {:?} with {} entries", archive, files.len());
        }
    }
    Ok(())
}
