use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

mod config;
mod delta;
mod driver;
mod exchange;
mod quantile;
mod rendezvous;
mod report;
mod syscheck;
mod table;
mod traits;

use config::TestParameters;
use exchange::FrameExchange;
use report::{LatencyRecorder, LatencySnapshot, SnapshotCell, NANOS_PER_MICRO};
use table::ReportTable;
use traits::NicTest;

/// Live table refresh interval (20 Hz).
const REPORT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(author, version, about = "A program to test NIC performance using raw sockets.", long_about = None)]
struct Args {
    /// Network interface card name; omit to run the cyclic timer test only
    #[arg(short, long)]
    nic: Option<String>,

    /// Number of iterations; omit to run until interrupted
    #[arg(short, long)]
    iterations: Option<u64>,

    /// Send sleep duration in microseconds
    #[arg(short, long, default_value_t = 1000)]
    send_sleep: u64,

    /// Send thread priority
    #[arg(long, default_value_t = 42)]
    send_priority: i32,

    /// Receive thread priority
    #[arg(long, default_value_t = 45)]
    receive_priority: i32,

    /// CPU core to use for the sender thread (default: last core)
    #[arg(long)]
    send_cpu: Option<usize>,

    /// CPU core to use for the receiver thread (default: last core)
    #[arg(long)]
    receive_cpu: Option<usize>,

    /// Bucket width in microseconds for counting occurrences (0 = period / 8)
    #[arg(short, long, default_value_t = 0)]
    bucket_width: u64,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Skip system configuration checks
    #[arg(long)]
    no_config: bool,

    /// Dump final statistics as JSON after the table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct FinalSummary {
    sender: LatencySnapshot,
    receiver: Option<LatencySnapshot>,
    hardware: Option<LatencySnapshot>,
    software: Option<LatencySnapshot>,
}

fn default_cpu_core() -> usize {
    thread::available_parallelism()
        .map(|cores| cores.get().saturating_sub(1))
        .unwrap_or(0)
}

/// cyclictest's latency trick: holding /dev/cpu_dma_latency open at zero
/// keeps the power management from entering deep C-states for the duration
/// of the run.
fn set_latency_target() -> Option<std::fs::File> {
    let mut file = match OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/cpu_dma_latency")
    {
        Ok(file) => file,
        Err(error) => {
            warn!("cannot open /dev/cpu_dma_latency: {error}");
            return None;
        }
    };
    if let Err(error) = file.write_all(&0i32.to_ne_bytes()) {
        warn!("error setting cpu_dma_latency to 0: {error}");
    }
    Some(file)
}

fn log_available_interfaces() {
    if let Ok(interfaces) = if_addrs::get_if_addrs() {
        let mut names: Vec<String> = interfaces.into_iter().map(|iface| iface.name).collect();
        names.sort();
        names.dedup();
        error!("interfaces with addresses on this host: {}", names.join(", "));
    }
}

fn report_loop(
    table: &ReportTable,
    rows: &[(&'static str, Arc<SnapshotCell>)],
    start: Instant,
    live: &AtomicBool,
) {
    let mut line_count = 0;
    // One extra pass after the run flag clears so the final numbers are on
    // screen.
    loop {
        let keep_running = live.load(Ordering::Acquire);

        let snapshots: Vec<(&str, LatencySnapshot)> = rows
            .iter()
            .map(|(label, cell)| (*label, cell.load()))
            .collect();
        if line_count > 0 {
            print!("\x1b[{line_count}A\x1b[J");
        }
        let rendered = table.render(&snapshots, start.elapsed());
        line_count = rendered.matches('\n').count();
        print!("{rendered}");
        let _ = std::io::stdout().flush();

        if !keep_running {
            break;
        }
        thread::sleep(REPORT_INTERVAL);
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();
    if args.send_sleep == 0 {
        bail!("--send-sleep must be positive");
    }

    let default_core = default_cpu_core();
    let params = TestParameters {
        nic_name: args.nic.clone(),
        iterations: args.iterations,
        send_sleep_ns: args.send_sleep * NANOS_PER_MICRO,
        send_priority: args.send_priority,
        receive_priority: args.receive_priority,
        send_cpu: args.send_cpu.unwrap_or(default_core),
        receive_cpu: args.receive_cpu.unwrap_or(default_core),
        verbose: args.verbose,
        bucket_width_ns: if args.bucket_width == 0 {
            (args.send_sleep * NANOS_PER_MICRO / 8).max(1)
        } else {
            args.bucket_width * NANOS_PER_MICRO
        },
    };

    if !args.no_config {
        syscheck::report_system_configuration(params.send_cpu, params.nic_name.as_deref());
    }

    if !nix::unistd::geteuid().is_root() {
        bail!(
            "not running as root; opening raw sockets and setting thread priorities will fail"
        );
    }

    nix::sys::mman::mlockall(
        nix::sys::mman::MlockAllFlags::MCL_CURRENT | nix::sys::mman::MlockAllFlags::MCL_FUTURE,
    )
    .context("failed to lock memory; swapping might occur")?;

    let _latency_fd = set_latency_target();

    let running = Arc::new(AtomicBool::new(true));
    let live_report = Arc::new(AtomicBool::new(true));
    let failed = Arc::new(AtomicBool::new(false));

    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received. Shutting down...");
            running.store(false, Ordering::Release);
        })?;
    }

    if let Some(iterations) = params.iterations {
        println!(
            "Estimated run time: {}",
            table::estimated_run_time(iterations, params.send_sleep_ns)
        );
    }
    println!(
        "Target period: {} us\n",
        params.send_sleep_ns / NANOS_PER_MICRO
    );

    let send_cell = Arc::new(SnapshotCell::default());
    let receive_cell = Arc::new(SnapshotCell::default());
    let hardware_cell = Arc::new(SnapshotCell::default());
    let software_cell = Arc::new(SnapshotCell::default());

    let table = ReportTable::new(params.bucket_width_ns, params.verbose);
    let start = Instant::now();

    let tester: Option<Arc<FrameExchange>> = match &params.nic_name {
        Some(nic) => {
            let hardware_report = LatencyRecorder::new(
                params.send_sleep_ns,
                params.bucket_width_ns,
                Some(hardware_cell.clone()),
            );
            let software_report = LatencyRecorder::new(
                params.send_sleep_ns,
                params.bucket_width_ns,
                Some(software_cell.clone()),
            );
            match FrameExchange::new(&params, hardware_report, software_report) {
                Ok(exchange) => Some(Arc::new(exchange)),
                Err(error) => {
                    error!("failed to set up frame exchange on {nic}: {error:#}");
                    log_available_interfaces();
                    return Err(error);
                }
            }
        }
        None => None,
    };

    let mut rows: Vec<(&'static str, Arc<SnapshotCell>)> = Vec::new();
    if tester.is_some() {
        rows.push(("Sender", send_cell.clone()));
        rows.push(("Receiver", receive_cell.clone()));
        if params.verbose {
            rows.push(("HW delta", hardware_cell.clone()));
            rows.push(("SW delta", software_cell.clone()));
        }
    } else {
        rows.push(("Cyclic", send_cell.clone()));
    }

    let receiver_handle = tester.as_ref().map(|tester| {
        let params = params.clone();
        let tester = tester.clone();
        let running = running.clone();
        let failed = failed.clone();
        let report = LatencyRecorder::new(
            params.send_sleep_ns,
            params.bucket_width_ns,
            Some(receive_cell.clone()),
        );
        thread::spawn(move || {
            let result = driver::configure_current_thread(
                params.receive_priority,
                params.receive_cpu,
            )
            .and_then(|_| driver::receiver_loop(&params, tester.as_ref(), report, &running));
            if let Err(error) = result {
                error!("Error occurred in Receiver Thread: {error:#}");
                failed.store(true, Ordering::Release);
                running.store(false, Ordering::Release);
            }
        })
    });

    let sender_handle = {
        let params = params.clone();
        let tester = tester.clone();
        let running = running.clone();
        let failed = failed.clone();
        let report = LatencyRecorder::new(
            params.send_sleep_ns,
            params.bucket_width_ns,
            Some(send_cell.clone()),
        );
        thread::spawn(move || {
            let result =
                driver::configure_current_thread(params.send_priority, params.send_cpu).and_then(
                    |_| {
                        driver::sender_loop(
                            &params,
                            tester.as_deref().map(|exchange| exchange as &dyn NicTest),
                            report,
                            &running,
                        )
                    },
                );
            if let Err(error) = result {
                error!("Error occurred in Sender Thread: {error:#}");
                failed.store(true, Ordering::Release);
                running.store(false, Ordering::Release);
            }
        })
    };

    let report_handle = {
        let live_report = live_report.clone();
        let rows = rows.clone();
        thread::spawn(move || report_loop(&table, &rows, start, &live_report))
    };

    match receiver_handle {
        Some(handle) => {
            // The receiver finishing (or failing) ends the run; the sender
            // then unblocks via the rendezvous timeout at the latest.
            let _ = handle.join();
            running.store(false, Ordering::Release);
            let _ = sender_handle.join();
        }
        None => {
            let _ = sender_handle.join();
            running.store(false, Ordering::Release);
        }
    }
    live_report.store(false, Ordering::Release);
    let _ = report_handle.join();

    if let Some(exchange) = &tester {
        let (hardware_anomalies, software_anomalies) = exchange.clock_anomalies();
        if hardware_anomalies > 0 || software_anomalies > 0 {
            info!(
                "dropped backward clock steps: hardware={hardware_anomalies}, software={software_anomalies}"
            );
        }
    }

    if args.json {
        let with_exchange = tester.is_some();
        let summary = FinalSummary {
            sender: send_cell.load(),
            receiver: with_exchange.then(|| receive_cell.load()),
            hardware: with_exchange.then(|| hardware_cell.load()),
            software: with_exchange.then(|| software_cell.load()),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
    }

    if failed.load(Ordering::Acquire) {
        bail!("run aborted by a thread failure");
    }
    Ok(())
}
