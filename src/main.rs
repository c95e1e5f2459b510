#![allow(non_snake_case)]

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "threadsieve", version, about = "Thread execution-state anomaly scanner")]
struct Args {
    /// Target process, defaults to this one.
    #[arg(long)]
    pid: Option<u32>,
    /// Scan a single thread.
    #[arg(long)]
    tid: Option<u32>,
    /// Write the report to a file instead of stdout.
    #[arg(long)]
    json: Option<PathBuf>,
    #[arg(long)]
    max_frames: Option<usize>,
    /// Context-scan threads regardless of their scheduling state.
    #[arg(long)]
    all_states: bool,
    /// Treat the target as a .NET process.
    #[arg(long)]
    managed: bool,
}

#[cfg(not(all(windows, target_arch = "x86_64")))]
fn main() {
    let _ = Args::parse();
    eprintln!("This CLI runs on 64-bit Windows only.");
}

#[cfg(all(windows, target_arch = "x86_64"))]
fn main() -> anyhow::Result<()> {
    live::run(Args::parse())
}

#[cfg(all(windows, target_arch = "x86_64"))]
mod live {
    use std::fs::File;
    use std::io::{BufWriter, Write};

    use anyhow::Context;
    use serde_json::{json, Value};
    use tracing::info;

    use ThreadSieve::config::{init_tracing, ScanOptions};
    use ThreadSieve::pe::build_export_table;
    use ThreadSieve::win::{enumerate_modules, list_threads, WinProcess};
    use ThreadSieve::{
        scan_threads, Collaborators, EntropyStatsCollector, Reportable, ScanError,
        X86CallSiteDecoder,
    };

    use super::Args;

    pub fn run(args: Args) -> anyhow::Result<()> {
        init_tracing();

        let pid = args.pid.unwrap_or_else(std::process::id);
        let mut options = ScanOptions::from_env();
        if let Some(max_frames) = args.max_frames {
            options.max_frames = max_frames;
        }
        if args.all_states {
            options.filter_by_state = false;
        }

        let process = WinProcess::open(pid).with_context(|| format!("opening process {}", pid))?;
        let modules = enumerate_modules(&process).context("listing modules")?;
        options.is_managed_process = args.managed || modules.has_managed_runtime();
        let exports = build_export_table(&process, modules.modules());

        let mut threads = list_threads(pid).context("listing threads")?;
        if let Some(tid) = args.tid {
            threads.retain(|t| t.tid == tid);
            if threads.is_empty() {
                return Err(ScanError::ThreadNotFound(tid))
                    .with_context(|| format!("selecting a thread of process {}", pid));
            }
        }
        info!(
            pid,
            wow64 = process.is_wow64(),
            modules = modules.len(),
            exports = exports.len(),
            threads = threads.len(),
            "scanning"
        );

        let stats = EntropyStatsCollector {
            max_read: options.entropy_max_read,
        };
        let decoder = X86CallSiteDecoder;
        let collab = Collaborators {
            process: &process,
            modules: &modules,
            exports: Some(&exports),
            symbols: None,
            stats: &stats,
            decoder: &decoder,
        };
        let reports = scan_threads(collab, &threads, options)?;

        let suspicious = reports.iter().filter(|r| r.is_suspicious()).count();
        let document = json!({
            "pid": pid,
            "scanned": reports.len(),
            "suspicious": suspicious,
            "threads": reports.iter().map(|r| r.to_json()).collect::<Vec<Value>>(),
        });

        match args.json {
            Some(path) => {
                let file = File::create(&path)
                    .with_context(|| format!("creating {}", path.display()))?;
                let mut writer = BufWriter::new(file);
                serde_json::to_writer_pretty(&mut writer, &document)?;
                writer.flush()?;
                println!("JSON report written: {}", path.display());
            }
            None => println!("{}", serde_json::to_string_pretty(&document)?),
        }
        Ok(())
    }
}
