//! # ovdb CLI
//!
//! Offline verification, repair, and scanning of overview files.
//!
//! ## Usage
//!
//! ```bash
//! # Verify a file end to end (rescan mode 0)
//! ovdb verify <file>
//!
//! # Rescan with an explicit mode (0-4, 997, 998, 999)
//! ovdb rescan --mode 999 --group misc.test <file>
//!
//! # Print records 100..200
//! ovdb scan --group misc.test --from 100 --to 200 [--field subject] <file>
//! ```
//!
//! Structural violations exit non-zero so the tool can gate maintenance
//! scripts.

use std::path::PathBuf;

use eyre::{bail, Result};
use ovdb::scan::{rescan, scan_overview, RescanMode, ScanField};
use ovdb::storage::hash_from_path;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Ok(true);
    }

    match args[1].as_str() {
        "--help" | "-h" => {
            print_usage();
            Ok(true)
        }
        "--version" | "-v" => {
            println!("ovdb {}", env!("CARGO_PKG_VERSION"));
            Ok(true)
        }
        "verify" => cmd_verify(&args[2..]),
        "rescan" => cmd_rescan(&args[2..]),
        "scan" => cmd_scan(&args[2..]),
        other => bail!("unknown command '{}'", other),
    }
}

fn cmd_verify(args: &[String]) -> Result<bool> {
    let mut file = None;
    for arg in args {
        match arg.as_str() {
            a if a.starts_with('-') => bail!("unknown option '{}'", a),
            path => set_file(&mut file, path)?,
        }
    }
    let path = file.ok_or_else(|| eyre::eyre!("verify: missing overview file"))?;

    // Cheap open/replay/close cycle first; the walk below is the deep pass.
    if let Err(e) = ovdb::storage::OverviewFile::verify(&path) {
        eprintln!("{}: open check failed: {:#}", path.display(), e);
        return Ok(false);
    }

    // Group is unknown here; field checks skip the xref/group comparison.
    let report = rescan(&path, "", RescanMode::FullVerify, false)?;
    println!(
        "{}: {} (last article {})",
        path.display(),
        if report.ok { "OK" } else { "CORRUPT" },
        report.last_article
    );
    Ok(report.ok)
}

fn cmd_rescan(args: &[String]) -> Result<bool> {
    let mut mode_code = 0u32;
    let mut group = String::new();
    let mut debug = false;
    let mut file = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--mode" | "-m" => {
                mode_code = next_value(args, &mut i, "--mode")?.parse()?;
            }
            "--group" | "-g" => {
                group = next_value(args, &mut i, "--group")?.to_string();
            }
            "--debug" => debug = true,
            a if a.starts_with('-') => bail!("unknown option '{}'", a),
            path => set_file(&mut file, path)?,
        }
        i += 1;
    }

    let path = file.ok_or_else(|| eyre::eyre!("rescan: missing overview file"))?;
    let mode = RescanMode::from_code(mode_code)
        .ok_or_else(|| eyre::eyre!("rescan: unknown mode {}", mode_code))?;

    // Sanity-check the file name carries a plausible group hash.
    if let Err(e) = hash_from_path(&path) {
        eprintln!("warning: {:#}", e);
    }

    let report = rescan(&path, &group, mode, debug)?;
    println!(
        "{}: mode {} -> {} (last article {})",
        path.display(),
        mode.code(),
        if report.ok { "OK" } else { "FAILED" },
        report.last_article
    );
    Ok(report.ok)
}

fn cmd_scan(args: &[String]) -> Result<bool> {
    let mut group = String::new();
    let mut from = 1u64;
    let mut to = 0u64;
    let mut field = ScanField::All;
    let mut file = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--group" | "-g" => {
                group = next_value(args, &mut i, "--group")?.to_string();
            }
            "--from" | "-a" => {
                from = next_value(args, &mut i, "--from")?.parse()?;
            }
            "--to" | "-b" => {
                to = next_value(args, &mut i, "--to")?.parse()?;
            }
            "--field" | "-f" => {
                let name = next_value(args, &mut i, "--field")?;
                field = ScanField::parse(name)
                    .ok_or_else(|| eyre::eyre!("scan: unknown field '{}'", name))?;
            }
            a if a.starts_with('-') => bail!("unknown option '{}'", a),
            path => set_file(&mut file, path)?,
        }
        i += 1;
    }

    let path = file.ok_or_else(|| eyre::eyre!("scan: missing overview file"))?;
    let mut stdout = std::io::stdout().lock();
    scan_overview(&path, &group, from, to, field, Some(&mut stdout), None)?;
    Ok(true)
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| eyre::eyre!("{} needs a value", flag))
}

fn set_file(slot: &mut Option<PathBuf>, path: &str) -> Result<()> {
    if slot.is_some() {
        bail!("multiple overview files specified");
    }
    *slot = Some(PathBuf::from(path));
    Ok(())
}

fn print_usage() {
    println!("ovdb - overview storage engine maintenance tool");
    println!();
    println!("Usage:");
    println!("  ovdb verify <file>                              full structural check");
    println!("  ovdb rescan --mode <m> [--group <g>] [--debug] <file>");
    println!("  ovdb scan [--group <g>] [--from a] [--to b] [--field f] <file>");
    println!();
    println!("Rescan modes:");
    println!("  0    full rescan with field verification");
    println!("  1    check only the header");
    println!("  2    check only the footer");
    println!("  3    header + footer + line counting");
    println!("  4    like 0 but the footer is checked after the walk");
    println!("  997  fast rebuild walk (framing only)");
    println!("  998  deep rebuild walk (field verification)");
    println!("  999  like 4 with footer repair");
    println!();
    println!("Scan fields: all, message-id, subject, from, date, references,");
    println!("             bytes, lines, xref");
}
