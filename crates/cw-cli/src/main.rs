#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use cw_core::Image;
use cw_csum::{CsumEntry, WalkMode};
use cw_error::CwError;
use cw_types::InodeNumber;
use serde::Serialize;
use std::env;
use std::fmt::Write as _;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Files smaller than this carry too little data to be worth dumping;
/// matches the kernel tool's minimum-size gate.
const MIN_FILE_SIZE: u64 = 1024;

const VALUES_PER_ROW: usize = 8;

#[derive(Debug, Serialize)]
struct JsonEntry {
    bytenr: u64,
    csum: String,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        let code = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<CwError>())
            .map_or(1, CwError::exit_code);
        std::process::exit(code);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "dump-csum" => {
            let Some(file) = args.next() else {
                bail!("dump-csum requires <file> <device>");
            };
            let Some(device) = args.next() else {
                bail!("dump-csum requires <file> <device>");
            };
            let json = args.any(|arg| arg == "--json");
            dump_csum(Path::new(&file), Path::new(&device), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("csumwalk\n");
    println!("USAGE:");
    println!("  csumwalk dump-csum <file> <device> [--json]");
}

fn dump_csum(file: &Path, device: &Path, json: bool) -> Result<()> {
    let meta = std::fs::metadata(file)
        .with_context(|| format!("failed to stat {}", file.display()))?;
    if meta.size() < MIN_FILE_SIZE {
        bail!(
            "{} is only {} bytes; files below {MIN_FILE_SIZE} bytes are not dumped",
            file.display(),
            meta.size()
        );
    }
    let ino = InodeNumber(meta.ino());

    let image = Image::open(device)
        .with_context(|| format!("failed to open image {}", device.display()))?;
    let entries = image
        .dump_csums_for_inode(WalkMode::ReadOnly, ino)
        .with_context(|| format!("checksum dump failed for inode {ino}"))?;
    tracing::debug!(ino = ino.0, count = entries.len(), "dump complete");

    if json {
        let output: Vec<JsonEntry> = entries
            .iter()
            .map(|entry| JsonEntry {
                bytenr: entry.bytenr,
                csum: hex(&entry.csum),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", render_rows(&entries));
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

/// Text rendering: one hex value per checksum, eight per row. The row
/// position is tracked locally so concurrent or repeated dumps cannot
/// interleave their layout state.
fn render_rows(entries: &[CsumEntry]) -> String {
    let mut out = String::new();
    let mut in_row = 0_usize;
    for entry in entries {
        out.push_str(&hex(&entry.csum));
        in_row += 1;
        if in_row == VALUES_PER_ROW {
            out.push('\n');
            in_row = 0;
        } else {
            out.push(' ');
        }
    }
    if in_row != 0 {
        out.pop();
        out.push('\n');
    }
    out
}
