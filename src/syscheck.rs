//! Advisory system-configuration checks run before a test: independent
//! pass/fail probes over `/proc` and `/sys`. None of them gate the run;
//! they tell the operator why latency numbers may disappoint.

use std::collections::BTreeSet;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Fail,
    Unknown,
}

#[derive(Debug)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub name: &'static str,
    pub reason: String,
}

impl CheckResult {
    fn pass(name: &'static str, reason: impl Into<String>) -> Self {
        CheckResult { status: CheckStatus::Pass, name, reason: reason.into() }
    }

    fn fail(name: &'static str, reason: impl Into<String>) -> Self {
        CheckResult { status: CheckStatus::Fail, name, reason: reason.into() }
    }

    fn unknown(name: &'static str, reason: impl Into<String>) -> Self {
        CheckResult { status: CheckStatus::Unknown, name, reason: reason.into() }
    }
}

/// Read-only view of the files the checks consult.
#[cfg_attr(test, mockall::automock)]
pub trait DataSource {
    fn read(&self, path: &str) -> Option<String>;
    fn cmdline_param(&self, key: &str) -> Option<String>;
}

pub struct FsDataSource;

impl DataSource for FsDataSource {
    fn read(&self, path: &str) -> Option<String> {
        fs::read_to_string(path).ok()
    }

    fn cmdline_param(&self, key: &str) -> Option<String> {
        cmdline_param_from(&self.read("/proc/cmdline")?, key)
    }
}

fn cmdline_param_from(cmdline: &str, key: &str) -> Option<String> {
    for token in cmdline.split_whitespace() {
        match token.split_once('=') {
            None if token == key => return Some(String::new()), // boolean-like flag
            Some((name, value)) if name == key => return Some(value.to_string()),
            _ => {}
        }
    }
    None
}

/// Parse CPU list strings like "1-3,5,7-8"; malformed tokens are ignored.
pub fn parse_cpu_list(raw: &str) -> BTreeSet<usize> {
    let mut cpus = BTreeSet::new();
    for token in raw.trim().split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match token.split_once('-') {
            None => {
                if let Ok(cpu) = token.parse() {
                    cpus.insert(cpu);
                }
            }
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.trim().parse::<usize>(), end.trim().parse::<usize>()) {
                    let (start, end) = if start <= end { (start, end) } else { (end, start) };
                    cpus.extend(start..=end);
                }
            }
        }
    }
    cpus
}

fn list_or_empty(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        "(empty)".to_string()
    } else {
        trimmed.to_string()
    }
}

pub fn preempt_rt_active(source: &dyn DataSource) -> CheckResult {
    const NAME: &str = "PREEMPT_RT active";
    if let Some(value) = source.read("/sys/kernel/realtime") {
        match value.trim() {
            "1" => return CheckResult::pass(NAME, "/sys/kernel/realtime=1"),
            "0" => return CheckResult::fail(NAME, "/sys/kernel/realtime=0"),
            _ => {}
        }
    }
    if let Some(version) = source.read("/proc/version") {
        if version.contains("PREEMPT_RT") || version.contains("PREEMPT RT") {
            return CheckResult::pass(NAME, format!("/proc/version: {}", version.trim()));
        }
    }
    CheckResult::fail(NAME, "No evidence of RT kernel")
}

pub fn swap_disabled(source: &dyn DataSource) -> CheckResult {
    const NAME: &str = "Swap disabled";
    let Some(swaps) = source.read("/proc/swaps") else {
        return CheckResult::unknown(NAME, "cannot read /proc/swaps");
    };
    let active: Vec<&str> = swaps
        .lines()
        .skip(1) // header
        .filter_map(|line| line.split_whitespace().next())
        .collect();
    if active.is_empty() {
        CheckResult::pass(NAME, "/proc/swaps empty")
    } else {
        CheckResult::fail(NAME, format!("active: {}", active.join(", ")))
    }
}

pub fn timer_migration_disabled(source: &dyn DataSource) -> CheckResult {
    const NAME: &str = "Timer migration disabled";
    match source.read("/proc/sys/kernel/timer_migration") {
        None => CheckResult::unknown(NAME, "cannot read timer_migration"),
        Some(value) if value.trim() == "0" => CheckResult::pass(NAME, "timer_migration=0"),
        Some(value) => CheckResult::fail(NAME, format!("timer_migration={}", value.trim())),
    }
}

pub fn rt_throttling_disabled(source: &dyn DataSource) -> CheckResult {
    const NAME: &str = "RT throttling disabled";
    match source.read("/proc/sys/kernel/sched_rt_runtime_us") {
        None => CheckResult::unknown(NAME, "cannot read sched_rt_runtime_us"),
        Some(value) if value.trim() == "-1" => {
            CheckResult::pass(NAME, "sched_rt_runtime_us=-1")
        }
        Some(value) => {
            CheckResult::fail(NAME, format!("sched_rt_runtime_us={}", value.trim()))
        }
    }
}

pub fn clocksource_stable(source: &dyn DataSource) -> CheckResult {
    const NAME: &str = "Clocksource stable";
    const BASE: &str = "/sys/devices/system/clocksource/clocksource0/";
    let Some(current) = source.read(&format!("{BASE}current_clocksource")) else {
        return CheckResult::unknown(NAME, "cannot read current_clocksource");
    };
    let current = current.trim().to_string();
    match current.as_str() {
        "tsc" | "hpet" => return CheckResult::pass(NAME, current),
        "arch_sys_counter" => {
            // The standard (and fine) clocksource on ARM.
            return CheckResult::pass(NAME, current);
        }
        _ => {}
    }
    let mut detail = current.clone();
    if let Some(available) = source.read(&format!("{BASE}available_clocksource")) {
        detail = format!("{current}; available={}", available.trim());
    }
    if current == "jiffies" {
        CheckResult::fail(NAME, detail)
    } else {
        CheckResult::unknown(NAME, detail)
    }
}

pub fn core_isolated(source: &dyn DataSource, cpu: usize) -> CheckResult {
    const NAME: &str = "RT core isolated";
    let Some(raw) = source.read("/sys/devices/system/cpu/isolated") else {
        return CheckResult::unknown(NAME, "no /sys/.../isolated");
    };
    let isolated = parse_cpu_list(&raw);
    if cpu == 0 {
        return CheckResult::fail(NAME, "CPU0 selected; choose non-CPU0");
    }
    if isolated.contains(&cpu) {
        CheckResult::pass(NAME, format!("isolated list: {}", list_or_empty(&raw)))
    } else {
        CheckResult::fail(
            NAME,
            format!("CPU{cpu} not in isolated: {}", list_or_empty(&raw)),
        )
    }
}

fn cpu_list_check(
    source: &dyn DataSource,
    cpu: usize,
    name: &'static str,
    sysfs_path: &str,
    cmdline_key: &str,
) -> CheckResult {
    if let Some(raw) = source.read(sysfs_path) {
        return if parse_cpu_list(&raw).contains(&cpu) {
            CheckResult::pass(name, format!("{cmdline_key} list: {}", list_or_empty(&raw)))
        } else {
            CheckResult::fail(
                name,
                format!("CPU{cpu} not in {cmdline_key}: {}", list_or_empty(&raw)),
            )
        };
    }
    if let Some(value) = source.cmdline_param(cmdline_key) {
        return if parse_cpu_list(&value).contains(&cpu) {
            CheckResult::pass(name, format!("cmdline {cmdline_key}={value}"))
        } else {
            CheckResult::fail(name, format!("RT core not in cmdline {cmdline_key}={value}"))
        };
    }
    CheckResult::unknown(name, "no sysfs entry and no cmdline param")
}

pub fn nohz_full(source: &dyn DataSource, cpu: usize) -> CheckResult {
    cpu_list_check(
        source,
        cpu,
        "nohz_full on RT core",
        "/sys/devices/system/cpu/nohz_full",
        "nohz_full",
    )
}

pub fn rcu_nocbs(source: &dyn DataSource, cpu: usize) -> CheckResult {
    cpu_list_check(
        source,
        cpu,
        "rcu_nocbs includes RT core",
        "/sys/devices/system/cpu/rcu_nocbs",
        "rcu_nocbs",
    )
}

pub fn cpu_governor(source: &dyn DataSource, cpu: usize) -> CheckResult {
    const NAME: &str = "CPU governor = performance";
    let path = format!("/sys/devices/system/cpu/cpu{cpu}/cpufreq/scaling_governor");
    match source.read(&path) {
        None => CheckResult::unknown(NAME, format!("no cpufreq governor for cpu{cpu}")),
        Some(governor) if governor.trim() == "performance" => {
            CheckResult::pass(NAME, format!("governor={}", governor.trim()))
        }
        Some(governor) => CheckResult::fail(NAME, format!("governor={}", governor.trim())),
    }
}

pub fn irq_affinity_avoids_core(source: &dyn DataSource, cpu: usize) -> CheckResult {
    const NAME: &str = "irqaffinity excludes RT core";
    let Some(value) = source.cmdline_param("irqaffinity") else {
        return CheckResult::unknown(NAME, "no irqaffinity kernel param");
    };
    let cpus = parse_cpu_list(&value);
    if cpus.is_empty() {
        CheckResult::unknown(NAME, "empty list")
    } else if cpus.contains(&cpu) {
        CheckResult::fail(NAME, format!("RT core present in irqaffinity: {value}"))
    } else {
        CheckResult::pass(NAME, value)
    }
}

fn nic_exists(source: &dyn DataSource, nic: &str) -> bool {
    source.read(&format!("/sys/class/net/{nic}/operstate")).is_some()
        || source.read(&format!("/sys/class/net/{nic}/carrier")).is_some()
        || source.read(&format!("/sys/class/net/{nic}/address")).is_some()
}

pub fn nic_present(source: &dyn DataSource, nic: &str) -> CheckResult {
    const NAME: &str = "NIC interface present";
    if nic_exists(source, nic) {
        CheckResult::pass(NAME, "exists")
    } else {
        CheckResult::unknown(NAME, "interface not found")
    }
}

pub fn nic_link_up(source: &dyn DataSource, nic: &str) -> CheckResult {
    const NAME: &str = "NIC link is UP";
    if !nic_exists(source, nic) {
        return CheckResult::unknown(NAME, "NIC not found");
    }
    if let Some(operstate) = source.read(&format!("/sys/class/net/{nic}/operstate")) {
        let operstate = operstate.trim();
        if operstate == "up" {
            return CheckResult::pass(NAME, "operstate=up");
        }
        if !operstate.is_empty() {
            return CheckResult::fail(NAME, format!("operstate={operstate}"));
        }
    }
    if let Some(carrier) = source.read(&format!("/sys/class/net/{nic}/carrier")) {
        match carrier.trim() {
            "1" => return CheckResult::pass(NAME, "carrier=1"),
            "0" => return CheckResult::fail(NAME, "carrier=0"),
            _ => {}
        }
    }
    CheckResult::unknown(NAME, "no operstate/carrier")
}

fn status_color(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "\x1b[32m",
        CheckStatus::Fail => "\x1b[31m",
        CheckStatus::Unknown => "\x1b[33m",
    }
}

fn status_emoji(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "\u{2714}\u{fe0f}",
        CheckStatus::Fail => "\u{274c}",
        CheckStatus::Unknown => "\u{2754}",
    }
}

fn print_result(result: &CheckResult) {
    const NAME_WIDTH: usize = 36;
    println!(
        "{:<NAME_WIDTH$}{}{}\x1b[0m   {}",
        result.name,
        status_color(result.status),
        status_emoji(result.status),
        result.reason
    );
}

fn print_section_header(title: &str) {
    println!("\n{title}");
    println!("{}", "\u{2501}".repeat(73));
}

/// Print the full advisory report for the selected RT core and NIC.
pub fn report_system_configuration(cpu: usize, nic: Option<&str>) {
    let source = FsDataSource;

    print_section_header("System Checks");
    for result in [
        preempt_rt_active(&source),
        swap_disabled(&source),
        timer_migration_disabled(&source),
        rt_throttling_disabled(&source),
        clocksource_stable(&source),
    ] {
        print_result(&result);
    }

    print_section_header(&format!("Core {cpu} Checks"));
    for result in [
        core_isolated(&source, cpu),
        nohz_full(&source, cpu),
        rcu_nocbs(&source, cpu),
        cpu_governor(&source, cpu),
        irq_affinity_avoids_core(&source, cpu),
    ] {
        print_result(&result);
    }

    if let Some(nic) = nic {
        print_section_header(&format!("NIC {nic} Checks"));
        let presence = nic_present(&source, nic);
        let nic_ok = presence.status == CheckStatus::Pass;
        print_result(&presence);
        if nic_ok {
            print_result(&nic_link_up(&source, nic));
        }
    }

    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use std::io::Write;

    #[test]
    fn cpu_lists_parse_ranges_and_singletons() {
        assert_eq!(parse_cpu_list("1-3,5,7-8"), BTreeSet::from([1, 2, 3, 5, 7, 8]));
        assert_eq!(parse_cpu_list(" 4 \n"), BTreeSet::from([4]));
        assert_eq!(parse_cpu_list("3-1"), BTreeSet::from([1, 2, 3]));
        assert!(parse_cpu_list("").is_empty());
        assert!(parse_cpu_list("junk,more-junk").is_empty());
    }

    #[test]
    fn cmdline_params_support_flags_and_values() {
        let cmdline = "quiet isolcpus=2,3 nohz_full=2-3 mitigations=off";
        assert_eq!(cmdline_param_from(cmdline, "nohz_full"), Some("2-3".into()));
        assert_eq!(cmdline_param_from(cmdline, "quiet"), Some(String::new()));
        assert_eq!(cmdline_param_from(cmdline, "rcu_nocbs"), None);
    }

    #[test]
    fn rt_throttling_requires_minus_one() {
        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/proc/sys/kernel/sched_rt_runtime_us"))
            .returning(|_| Some("-1\n".into()));
        assert_eq!(rt_throttling_disabled(&source).status, CheckStatus::Pass);

        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/proc/sys/kernel/sched_rt_runtime_us"))
            .returning(|_| Some("950000\n".into()));
        assert_eq!(rt_throttling_disabled(&source).status, CheckStatus::Fail);
    }

    #[test]
    fn nohz_full_falls_back_to_cmdline() {
        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/sys/devices/system/cpu/nohz_full"))
            .returning(|_| None);
        source
            .expect_cmdline_param()
            .with(eq("nohz_full"))
            .returning(|_| Some("2-3".into()));

        assert_eq!(nohz_full(&source, 3).status, CheckStatus::Pass);
    }

    #[test]
    fn isolated_cpu0_is_always_rejected() {
        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/sys/devices/system/cpu/isolated"))
            .returning(|_| Some("0-3\n".into()));
        assert_eq!(core_isolated(&source, 0).status, CheckStatus::Fail);
        assert_eq!(core_isolated(&source, 2).status, CheckStatus::Pass);
    }

    #[test]
    fn link_state_comes_from_operstate_then_carrier() {
        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/sys/class/net/eth1/operstate"))
            .returning(|_| Some("down\n".into()));
        assert_eq!(nic_link_up(&source, "eth1").status, CheckStatus::Fail);

        let mut source = MockDataSource::new();
        source
            .expect_read()
            .with(eq("/sys/class/net/eth1/operstate"))
            .returning(|_| None);
        source
            .expect_read()
            .with(eq("/sys/class/net/eth1/carrier"))
            .returning(|_| Some("1\n".into()));
        source
            .expect_read()
            .with(eq("/sys/class/net/eth1/address"))
            .returning(|_| None);
        assert_eq!(nic_link_up(&source, "eth1").status, CheckStatus::Pass);
    }

    #[test]
    fn swap_entries_fail_the_check() {
        let mut source = MockDataSource::new();
        source.expect_read().with(eq("/proc/swaps")).returning(|_| {
            Some(
                "Filename  Type  Size  Used  Priority\n/dev/sda2  partition  8388604  0  -2\n"
                    .into(),
            )
        });
        let result = swap_disabled(&source);
        assert_eq!(result.status, CheckStatus::Fail);
        assert!(result.reason.contains("/dev/sda2"));
    }

    #[test]
    fn fs_data_source_reads_real_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "performance\n").unwrap();

        let source = FsDataSource;
        let path = file.path().to_str().unwrap().to_string();
        assert_eq!(source.read(&path), Some("performance\n".into()));
        assert_eq!(source.read("/nonexistent/nicprobe-test"), None);
    }
}
