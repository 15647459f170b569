//! ANSI table rendering of the latency snapshots for the live console view.
//! Pure presentation: everything here consumes `LatencySnapshot` copies.

use std::fmt::Write;
use std::time::Duration;

use crate::report::{bucket_index, LatencySnapshot, BUCKET_COUNT, NANOS_PER_MICRO};

const GREEN: &str = "\x1b[32m";
const YELLOW_GREEN: &str = "\x1b[38;5;106m";
const ORANGE: &str = "\x1b[38;5;208m";
const RED: &str = "\x1b[31m";
const BOLD_RED: &str = "\x1b[38;5;196m";
const RESET: &str = "\x1b[0m";

const BUCKET_COLORS: [&str; BUCKET_COUNT] = [GREEN, YELLOW_GREEN, ORANGE, RED, BOLD_RED];

const DEFAULT_COLUMN_WIDTH: usize = 10;
const WIDE_COLUMN_WIDTH: usize = 15;
const ROW_LABEL_WIDTH: usize = 16;
const SEPARATOR: &str = " | ";

struct Column {
    label: String,
    width: usize,
}

pub struct ReportTable {
    bucket_width: u64,
    verbose: bool,
    columns: Vec<Column>,
}

impl ReportTable {
    pub fn new(bucket_width: u64, verbose: bool) -> Self {
        let mut columns = vec![Column {
            label: "Count".into(),
            width: WIDE_COLUMN_WIDTH,
        }];
        if verbose {
            for label in ["Min", "Mean", "Median"] {
                columns.push(Column {
                    label: label.into(),
                    width: DEFAULT_COLUMN_WIDTH,
                });
            }
        }
        let bucket_micros = bucket_width as f64 / NANOS_PER_MICRO as f64;
        for index in 0..BUCKET_COUNT - 1 {
            columns.push(Column {
                label: format!("< {:.0}us", bucket_micros * f64::from(1 << index)),
                width: if index == 0 {
                    WIDE_COLUMN_WIDTH
                } else {
                    DEFAULT_COLUMN_WIDTH
                },
            });
        }
        columns.push(Column {
            label: format!(
                ">= {:.0}us",
                bucket_micros * f64::from(1 << (BUCKET_COUNT - 2))
            ),
            width: DEFAULT_COLUMN_WIDTH,
        });
        columns.push(Column {
            label: "Max us".into(),
            width: DEFAULT_COLUMN_WIDTH,
        });
        columns.push(Column {
            label: "Max Index".into(),
            width: WIDE_COLUMN_WIDTH,
        });

        ReportTable {
            bucket_width,
            verbose,
            columns,
        }
    }

    /// Render the header, one row per report and the elapsed-time line.
    pub fn render(&self, reports: &[(&str, LatencySnapshot)], elapsed: Duration) -> String {
        let mut out = String::new();

        let _ = write!(out, "| {:>ROW_LABEL_WIDTH$}{SEPARATOR}", "Label");
        for column in &self.columns {
            let _ = write!(out, "{:>width$}{SEPARATOR}", column.label, width = column.width);
        }
        out.push('\n');

        let _ = write!(out, "|{:-<width$}+", "", width = ROW_LABEL_WIDTH + 2);
        for column in &self.columns {
            let _ = write!(out, "{:-<width$}+", "", width = column.width + 2);
        }
        out.push('\n');

        for (label, snapshot) in reports {
            self.render_row(&mut out, label, snapshot);
        }

        let _ = writeln!(out, "{}", format_duration(elapsed));
        out
    }

    fn render_row(&self, out: &mut String, label: &str, snapshot: &LatencySnapshot) {
        let _ = write!(out, "| {label:>ROW_LABEL_WIDTH$}{SEPARATOR}");
        let mut cells: Vec<String> = Vec::with_capacity(self.columns.len());

        cells.push(plain(snapshot.observations, WIDE_COLUMN_WIDTH));
        if self.verbose {
            let min_micros = if snapshot.observations == 0 {
                0
            } else {
                snapshot.min / NANOS_PER_MICRO
            };
            cells.push(plain(min_micros, DEFAULT_COLUMN_WIDTH));
            cells.push(plain(
                (snapshot.mean() / NANOS_PER_MICRO as f64) as u64,
                DEFAULT_COLUMN_WIDTH,
            ));
            cells.push(plain(
                (snapshot.median / NANOS_PER_MICRO as f64) as u64,
                DEFAULT_COLUMN_WIDTH,
            ));
        }
        for (index, count) in snapshot.buckets.iter().enumerate() {
            let width = if index == 0 {
                WIDE_COLUMN_WIDTH
            } else {
                DEFAULT_COLUMN_WIDTH
            };
            if *count == 0 {
                cells.push(plain(*count, width));
            } else {
                cells.push(colored(*count, width, BUCKET_COLORS[index]));
            }
        }

        // Max deviation gets the color of its own bucket.
        let max_micros = snapshot.max.saturating_sub(snapshot.target) / NANOS_PER_MICRO;
        let bucket_width_micros = (self.bucket_width / NANOS_PER_MICRO).max(1);
        let color = BUCKET_COLORS[bucket_index(max_micros, bucket_width_micros)];
        cells.push(colored(max_micros, DEFAULT_COLUMN_WIDTH, color));

        let max_index = snapshot
            .max_index
            .map_or_else(|| "-".to_string(), |index| index.to_string());
        cells.push(format!("{max_index:>WIDE_COLUMN_WIDTH$}"));

        for cell in cells {
            let _ = write!(out, "{cell}{SEPARATOR}");
        }
        out.push('\n');
    }
}

fn plain(value: u64, width: usize) -> String {
    format!("{value:>width$}")
}

fn colored(value: u64, width: usize, color: &str) -> String {
    format!("{color}{value:>width$}{RESET}")
}

pub fn format_duration(duration: Duration) -> String {
    let milliseconds = duration.as_millis() % 1_000;
    let full_seconds = duration.as_secs();
    let seconds = full_seconds % 60;
    let minutes = (full_seconds / 60) % 60;
    let hours = full_seconds / 3_600;
    format!("Duration: {hours:02}:{minutes:02}:{seconds:02}.{milliseconds:03}")
}

/// Wall-clock estimate for a bounded run, formatted as HH:MM:SS.mmm.
pub fn estimated_run_time(iterations: u64, sleep_ns: u64) -> String {
    let duration = Duration::from_nanos(iterations.saturating_mul(sleep_ns));
    format_duration(duration)
        .trim_start_matches("Duration: ")
        .to_string()
}
