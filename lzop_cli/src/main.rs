use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use serde::Serialize;

use lzop_codecs::{codec_by_name, codec_for_method, Lzo1xCodec};
use lzop_core::format::{ContainerHeader, DEFAULT_BLOCK_SIZE, HEADER_SIZE};
use lzop_core::index::{self, FsIndexStore};
use lzop_core::{
    BlockSink, ChecksumKind, DataRange, ErrorPolicy, FileDesc, FileRangeStream, HeaderCache,
    RangeOrchestrator, RangeQueue, RangeRole, ScanConfig, ScanRange, WriteSink, Writer, WriterOptions,
};

// ── CLI definition ─────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "lzop-scan",
    about = "Write, inspect, index, and range-parallel decode lzop files",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compress a file into lzop format
    Compress {
        /// Source file to compress ("-" reads stdin)
        input: PathBuf,
        /// Destination lzop file (default: input + ".lzo")
        output: Option<PathBuf>,
        /// Codec to use: lzo1x_1 | lzo1x_1_15 | lzo1x_999 | stored
        #[arg(short, long, default_value = "lzo1x_1")]
        codec: String,
        /// Raw bytes per block
        #[arg(short, long, default_value_t = DEFAULT_BLOCK_SIZE)]
        block_size: u32,
        /// Checksum over decompressed blocks: adler32 | crc32 | none
        #[arg(long, default_value = "adler32", value_parser = parse_checksum)]
        checksum: ChecksumKind,
        /// Checksum over compressed blocks: adler32 | crc32 | none
        #[arg(long, default_value = "none", value_parser = parse_checksum)]
        input_checksum: ChecksumKind,
        /// Also write the companion .index file
        #[arg(long)]
        index: bool,
    },
    /// Decompress an lzop file sequentially
    Decompress {
        /// Source lzop file
        input: PathBuf,
        /// Destination file ("-" writes to stdout)
        output: PathBuf,
        /// Skip block checksum verification
        #[arg(long)]
        no_verify: bool,
    },
    /// Print header fields and index statistics
    Inspect {
        /// lzop file to inspect
        file: PathBuf,
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Build the .index file that makes an lzop file splittable
    Index {
        /// lzop files to index
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Decode files in parallel ranges and report what each file produced
    Scan {
        /// lzop files to scan
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Bytes per planned range
        #[arg(short, long, default_value_t = 64 * 1024 * 1024)]
        split_size: u64,
        /// JSON file with scan options
        #[arg(long)]
        config: Option<PathBuf>,
        /// Verify block checksums
        #[arg(long)]
        verify_checksums: bool,
        /// Fail on the first bad block instead of skipping it
        #[arg(long)]
        strict: bool,
        /// Emit the summary as JSON
        #[arg(long)]
        json: bool,
        /// Write the decoded bytes of every file, in file order, to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

// ── Helpers ────────────────────────────────────────────────────────────────

fn parse_checksum(s: &str) -> Result<ChecksumKind, String> {
    match s {
        "adler32" => Ok(ChecksumKind::Adler32),
        "crc32" => Ok(ChecksumKind::Crc32),
        "none" => Ok(ChecksumKind::None),
        other => Err(format!("unknown checksum '{other}'. Valid options: adler32, crc32, none")),
    }
}

fn human_bytes(n: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut v = n as f64;
    let mut unit = 0;
    while v >= 1024.0 && unit < UNITS.len() - 1 {
        v /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", n)
    } else {
        format!("{:.2} {}", v, UNITS[unit])
    }
}

/// Parse the header at the start of `path`.
fn read_header(path: &Path) -> anyhow::Result<ContainerHeader> {
    let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
    let mut span = Vec::with_capacity(HEADER_SIZE);
    file.take(HEADER_SIZE as u64).read_to_end(&mut span)?;
    ContainerHeader::parse(&span).with_context(|| format!("reading header of {:?}", path))
}

/// Counts what a range produced without keeping it.
#[derive(Default)]
struct CountingSink {
    blocks: usize,
    bytes: u64,
}

impl BlockSink for CountingSink {
    fn consume(&mut self, block: Bytes) -> io::Result<()> {
        self.blocks += 1;
        self.bytes += block.len() as u64;
        Ok(())
    }
}

// ── Subcommand implementations ─────────────────────────────────────────────

fn run_compress(
    input: PathBuf,
    output: Option<PathBuf>,
    codec_name: &str,
    block_size: u32,
    checksum: ChecksumKind,
    input_checksum: ChecksumKind,
    write_index: bool,
) -> anyhow::Result<()> {
    let from_stdin = input.to_str() == Some("-");
    let output = match output {
        Some(path) => path,
        None if from_stdin => anyhow::bail!("an output path is required when reading stdin"),
        None => {
            let mut name = input.clone().into_os_string();
            name.push(".lzo");
            PathBuf::from(name)
        }
    };
    let codec = codec_by_name(codec_name)?;
    let codec_display = codec.name();

    let mut options = WriterOptions {
        block_size,
        output_checksum: checksum,
        input_checksum,
        ..WriterOptions::default()
    };
    let mut src: Box<dyn Read> = if from_stdin {
        Box::new(io::stdin().lock())
    } else {
        let file = File::open(&input).with_context(|| format!("opening input file {:?}", input))?;
        let meta = file.metadata()?;
        if let Ok(mtime) = meta.modified() {
            options.mtime = mtime.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        }
        if let Some(name) = input.file_name() {
            options.name = name.to_string_lossy().into_owned().into_bytes();
        }
        Box::new(BufReader::new(file))
    };

    let t0 = Instant::now();
    let mut writer = Writer::create(&output, codec, options)?;
    let mut buf = vec![0u8; block_size as usize];
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write(&buf[..n])?;
    }
    let summary = writer.finish()?;
    let elapsed = t0.elapsed();

    if write_index {
        let index_file = index::index_path(&output);
        index::write_index(&index_file, &summary.block_offsets)
            .with_context(|| format!("writing index {:?}", index_file))?;
    }

    let ratio = summary.raw_bytes as f64 / summary.file_bytes.max(1) as f64;
    eprintln!("  codec       : {}", codec_display);
    eprintln!("  block size  : {}", human_bytes(block_size as u64));
    eprintln!("  blocks      : {}", summary.block_offsets.len());
    eprintln!("  raw size    : {}", human_bytes(summary.raw_bytes));
    eprintln!("  compressed  : {}", human_bytes(summary.file_bytes));
    eprintln!("  ratio       : {:.2}x", ratio);
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

fn run_decompress(input: PathBuf, output: PathBuf, no_verify: bool) -> anyhow::Result<()> {
    let header = Arc::new(read_header(&input)?);
    let codec = codec_for_method(header.method);
    let config = ScanConfig::strict().with_checksums(!no_verify);

    let stream = FileRangeStream::open(&input, ScanRange::new(0, u64::MAX))?;
    let range = DataRange::open(&input, header, codec, config, stream)?;

    let dst: Box<dyn Write> = if output.to_str() == Some("-") {
        Box::new(io::stdout().lock())
    } else {
        Box::new(
            File::create(&output).with_context(|| format!("creating output file {:?}", output))?,
        )
    };
    let mut sink = WriteSink(BufWriter::new(dst));

    let t0 = Instant::now();
    let report = range.drain_into(&mut sink)?;
    sink.0.flush()?;
    let elapsed = t0.elapsed();

    eprintln!("  blocks      : {}", report.blocks);
    eprintln!("  raw size    : {}", human_bytes(report.bytes));
    eprintln!(
        "  throughput  : {}/s",
        human_bytes((report.bytes as f64 / elapsed.as_secs_f64().max(1e-9)) as u64)
    );
    eprintln!("  elapsed     : {:.3}s", elapsed.as_secs_f64());
    Ok(())
}

#[derive(Serialize)]
struct HeaderInfo {
    file: PathBuf,
    file_size: u64,
    version: String,
    lib_version: String,
    version_needed: String,
    method: &'static str,
    level: u8,
    flags: String,
    mode: String,
    mtime: u64,
    name: String,
    header_size: usize,
    output_checksum: ChecksumKind,
    input_checksum: ChecksumKind,
    extra_field_len: Option<usize>,
    indexed_blocks: usize,
    splittable: bool,
}

fn run_inspect(file: PathBuf, json: bool) -> anyhow::Result<()> {
    let mut header = read_header(&file)?;
    header.block_offsets = index::read_index(&FsIndexStore, &file)?;
    let file_size = std::fs::metadata(&file)?.len();

    let info = HeaderInfo {
        file: file.clone(),
        file_size,
        version: format!("0x{:04x}", header.version),
        lib_version: format!("0x{:04x}", header.lib_version),
        version_needed: format!("0x{:04x}", header.version_needed),
        method: header.method.name(),
        level: header.level,
        flags: format!("0x{:08x}", header.flags),
        mode: format!("{:o}", header.mode),
        mtime: (u64::from(header.mtime_high) << 32) | u64::from(header.mtime_low),
        name: header.name_lossy(),
        header_size: header.header_size,
        output_checksum: header.output_checksum,
        input_checksum: header.input_checksum,
        extra_field_len: header.extra_field.as_ref().map(Vec::len),
        indexed_blocks: header.block_offsets.len(),
        splittable: header.is_splittable(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("=== lzop file: {:?} ===", info.file);
    println!();
    println!("  version         : {}", info.version);
    println!("  lzo lib version : {}", info.lib_version);
    println!("  version needed  : {}", info.version_needed);
    println!("  method          : {} (level {})", info.method, info.level);
    println!("  flags           : {}", info.flags);
    println!("  mode            : {}", info.mode);
    println!("  mtime           : {}", info.mtime);
    println!("  original name   : {}", info.name);
    println!("  header size     : {}", info.header_size);
    println!("  output checksum : {:?}", info.output_checksum);
    println!("  input checksum  : {:?}", info.input_checksum);
    if let Some(len) = info.extra_field_len {
        println!("  extra field     : {}", human_bytes(len as u64));
    }
    println!("  file on disk    : {}", human_bytes(info.file_size));
    println!("  indexed blocks  : {}", info.indexed_blocks);
    println!("  splittable      : {}", info.splittable);
    Ok(())
}

fn run_index(files: Vec<PathBuf>) -> anyhow::Result<()> {
    for file in files {
        let t0 = Instant::now();
        let src = File::open(&file).with_context(|| format!("opening {:?}", file))?;
        let offsets = index::build_index(BufReader::new(src))
            .with_context(|| format!("indexing {:?}", file))?;
        let index_file = index::index_path(&file);
        index::write_index(&index_file, &offsets)
            .with_context(|| format!("writing index {:?}", index_file))?;
        eprintln!(
            "  {:?}: {} blocks indexed in {:.3}s",
            file,
            offsets.len(),
            t0.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

#[derive(Debug, Default, Serialize)]
struct FileSummary {
    file: PathBuf,
    ranges: usize,
    blocks: usize,
    bytes: u64,
    skipped_errors: Vec<String>,
    failed: Option<String>,
}

fn run_scan(
    files: Vec<PathBuf>,
    split_size: u64,
    config_path: Option<PathBuf>,
    verify_checksums: bool,
    strict: bool,
    json: bool,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = match config_path {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config {:?}", path))?;
            serde_json::from_str::<ScanConfig>(&text)
                .with_context(|| format!("parsing config {:?}", path))?
        }
        None => ScanConfig::default(),
    };
    if verify_checksums {
        config = config.with_checksums(true);
    }
    if strict {
        config = config.with_error_policy(ErrorPolicy::Abort);
    }

    let mut descs = HashMap::new();
    let mut order = Vec::new();
    for path in files {
        let len = std::fs::metadata(&path)
            .with_context(|| format!("reading metadata of {:?}", path))?
            .len();
        order.push(path.clone());
        descs.insert(path.clone(), FileDesc::with_split_size(path, len, split_size));
    }

    let cache = HeaderCache::new();
    let queue = RangeQueue::new();
    let orchestrator = RangeOrchestrator::new(
        config,
        Arc::new(Lzo1xCodec::default()),
        &cache,
        &FsIndexStore,
        &queue,
    );
    let initial: Vec<FileDesc> = order.iter().filter_map(|p| descs.get(p).cloned()).collect();
    orchestrator.issue_initial_ranges(&initial);

    let t0 = Instant::now();
    let mut summaries: HashMap<PathBuf, FileSummary> = order
        .iter()
        .map(|p| {
            let summary = FileSummary {
                file: p.clone(),
                ..FileSummary::default()
            };
            (p.clone(), summary)
        })
        .collect();

    let keep_output = output.is_some();
    let mut decoded: Vec<(usize, u64, Vec<Bytes>)> = Vec::new();

    // The first batch is all header-only ranges; each one queues its file's data ranges.
    loop {
        let batch = queue.drain();
        if batch.is_empty() {
            break;
        }
        let results: Vec<_> = batch
            .par_iter()
            .map(|(path, range)| {
                let result = descs
                    .get(path)
                    .context("range issued for an unknown file")
                    .and_then(|desc| {
                        let stream = FileRangeStream::open(path, *range)?;
                        let mut blocks: Vec<Bytes> = Vec::new();
                        let report = if keep_output {
                            orchestrator.scan_range(desc, stream, &mut blocks)?
                        } else {
                            orchestrator.scan_range(desc, stream, &mut CountingSink::default())?
                        };
                        Ok((report, blocks))
                    });
                (path.clone(), *range, result)
            })
            .collect();

        for (path, range, result) in results {
            let Some(summary) = summaries.get_mut(&path) else {
                continue;
            };
            match result {
                Ok((report, blocks)) => {
                    if !blocks.is_empty() {
                        let position = order.iter().position(|p| *p == path).unwrap_or(usize::MAX);
                        decoded.push((position, range.offset, blocks));
                    }
                    if report.role == RangeRole::Data {
                        summary.ranges += 1;
                    }
                    summary.blocks += report.blocks;
                    summary.bytes += report.bytes;
                    summary
                        .skipped_errors
                        .extend(report.recovered.iter().map(ToString::to_string));
                }
                Err(e) => {
                    tracing::error!(file = %path.display(), error = %e, "range failed");
                    if summary.failed.is_none() {
                        summary.failed = Some(format!("{e:#}"));
                    }
                }
            }
        }
    }
    let elapsed = t0.elapsed();

    if let Some(path) = output {
        // Ranges finish in any order; file order is restored here.
        decoded.sort_unstable_by_key(|(file, offset, _)| (*file, *offset));
        let mut dst = BufWriter::new(
            File::create(&path).with_context(|| format!("creating output file {:?}", path))?,
        );
        for block in decoded.iter().flat_map(|(_, _, blocks)| blocks) {
            dst.write_all(block)?;
        }
        dst.flush()?;
    }

    let summaries: Vec<FileSummary> = order
        .iter()
        .filter_map(|p| summaries.remove(p))
        .collect();
    let failures = summaries.iter().filter(|s| s.failed.is_some()).count();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    } else {
        println!(
            "  {:<40}  {:>7}  {:>8}  {:>12}  {:>8}",
            "file", "ranges", "blocks", "raw", "skipped"
        );
        println!("  {}", "-".repeat(83));
        for s in &summaries {
            println!(
                "  {:<40}  {:>7}  {:>8}  {:>12}  {:>8}{}",
                s.file.display().to_string(),
                s.ranges,
                s.blocks,
                human_bytes(s.bytes),
                s.skipped_errors.len(),
                s.failed.as_deref().map(|e| format!("  FAILED: {e}")).unwrap_or_default()
            );
        }
        eprintln!(
            "  files {}, failed {}, files fully issued {}, elapsed {:.3}s",
            summaries.len(),
            failures,
            queue.files_completed(),
            elapsed.as_secs_f64()
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} file(s) could not be scanned");
    }
    Ok(())
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compress {
            input,
            output,
            codec,
            block_size,
            checksum,
            input_checksum,
            index,
        } => run_compress(input, output, &codec, block_size, checksum, input_checksum, index),
        Commands::Decompress {
            input,
            output,
            no_verify,
        } => run_decompress(input, output, no_verify),
        Commands::Inspect { file, json } => run_inspect(file, json),
        Commands::Index { files } => run_index(files),
        Commands::Scan {
            files,
            split_size,
            config,
            verify_checksums,
            strict,
            json,
            output,
        } => run_scan(files, split_size, config, verify_checksums, strict, json, output),
    }
}
