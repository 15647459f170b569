//! Sender and receiver thread loops, plus the real-time scheduling setup
//! applied to each role's thread before its loop starts.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use log::warn;
use nix::errno::Errno;
use nix::sched::{sched_setaffinity, CpuSet};
use nix::sys::time::TimeSpec;
use nix::time::{clock_gettime, clock_nanosleep, ClockId, ClockNanosleepFlags};
use nix::unistd::Pid;

use crate::config::TestParameters;
use crate::report::{LatencyRecorder, NANOS_PER_SEC};
use crate::traits::NicTest;

/// SCHED_FIFO priority plus CPU pinning for the calling thread.
pub fn configure_current_thread(priority: i32, cpu: usize) -> Result<()> {
    let mut sched_params: libc::sched_param = unsafe { mem::zeroed() };
    sched_params.sched_priority = priority;
    let rc = unsafe {
        libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &sched_params)
    };
    if rc != 0 {
        return Err(anyhow!(
            "failed to set thread priority to {priority}: {}",
            std::io::Error::from_raw_os_error(rc)
        ));
    }

    let mut cpu_set = CpuSet::new();
    cpu_set
        .set(cpu)
        .with_context(|| format!("CPU core {cpu} out of range"))?;
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .with_context(|| format!("failed to set the cpu affinity to core {cpu}"))?;
    Ok(())
}

pub fn monotonic_nanos() -> Result<u64> {
    let now = clock_gettime(ClockId::CLOCK_MONOTONIC).context("clock_gettime failed")?;
    Ok(now.tv_sec() as u64 * NANOS_PER_SEC + now.tv_nsec() as u64)
}

fn iterations_remain(iterations: Option<u64>, index: u64) -> bool {
    iterations.map_or(true, |count| index < count)
}

/// First and last iterations are warm-up/teardown and excluded from cadence
/// recording.
fn should_record(iterations: Option<u64>, index: u64) -> bool {
    index != 0 && iterations.map_or(true, |count| index != count - 1)
}

fn sleep_until(deadline_ns: u64) {
    let deadline = TimeSpec::new(
        (deadline_ns / NANOS_PER_SEC) as i64,
        (deadline_ns % NANOS_PER_SEC) as i64,
    );
    while matches!(
        clock_nanosleep(
            ClockId::CLOCK_MONOTONIC,
            ClockNanosleepFlags::TIMER_ABSTIME,
            &deadline,
        ),
        Err(Errno::EINTR)
    ) {}
}

/// Paced send loop. With `tester` absent this degenerates into the cyclic
/// timer jitter test. Each iteration records the loop's own cadence into
/// `report`, then sleeps to the next absolute deadline, skipping ahead when
/// the loop has fallen behind.
pub fn sender_loop(
    params: &TestParameters,
    tester: Option<&dyn NicTest>,
    mut report: LatencyRecorder,
    running: &AtomicBool,
) -> Result<()> {
    let mut index: u64 = 0;
    let mut next_ns = monotonic_nanos()?;
    let mut previous: u64 = 0;

    while running.load(Ordering::Acquire) && iterations_remain(params.iterations, index) {
        if let Some(tester) = tester {
            if let Err(error) = tester.send() {
                if !running.load(Ordering::Acquire) {
                    // Shutdown race: the receiver stopped first and the
                    // rendezvous ran out. Not a desynchronization.
                    break;
                }
                return Err(error);
            }
        }

        let current = monotonic_nanos()?;
        if should_record(params.iterations, index) {
            report.add_observation(current - previous, index);
        }

        next_ns += params.send_sleep_ns;
        while current > next_ns {
            next_ns += params.send_sleep_ns;
        }
        sleep_until(next_ns);

        previous = current;
        index += 1;
    }
    Ok(())
}

/// Receive loop. A transient miss is logged and skipped; the cadence
/// reference still advances so one miss does not pollute the next delta.
pub fn receiver_loop(
    params: &TestParameters,
    tester: &dyn NicTest,
    mut report: LatencyRecorder,
    running: &AtomicBool,
) -> Result<()> {
    let mut index: u64 = 0;
    let mut previous: u64 = 0;

    while running.load(Ordering::Acquire) && iterations_remain(params.iterations, index) {
        let received = tester.receive()?;

        let current = monotonic_nanos()?;
        if received {
            if should_record(params.iterations, index) {
                report.add_observation(current - previous, index);
            }
        } else {
            warn!("no frame received on iteration {index}");
        }

        previous = current;
        index += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::SnapshotCell;
    use crate::traits::MockNicTest;
    use mockall::Sequence;
    use std::sync::Arc;

    fn test_params(iterations: u64) -> TestParameters {
        TestParameters {
            nic_name: Some("lo".into()),
            iterations: Some(iterations),
            send_sleep_ns: 200_000,
            send_priority: 0,
            receive_priority: 0,
            send_cpu: 0,
            receive_cpu: 0,
            verbose: false,
            bucket_width_ns: 25_000,
        }
    }

    fn recorder_with_cell(params: &TestParameters) -> (LatencyRecorder, Arc<SnapshotCell>) {
        let cell = Arc::new(SnapshotCell::default());
        let recorder = LatencyRecorder::new(
            params.send_sleep_ns,
            params.bucket_width_ns,
            Some(cell.clone()),
        );
        (recorder, cell)
    }

    #[test]
    fn sender_sends_once_per_iteration_and_skips_edge_recordings() {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = test_params(3);
        let (recorder, cell) = recorder_with_cell(&params);
        let running = AtomicBool::new(true);

        let mut mock = MockNicTest::new();
        mock.expect_send().times(3).returning(|| Ok(()));

        sender_loop(&params, Some(&mock), recorder, &running).unwrap();

        // Of three iterations only the middle one is recorded.
        assert_eq!(cell.load().observations, 1);
    }

    #[test]
    fn sender_propagates_send_failures() {
        let params = test_params(5);
        let (recorder, _cell) = recorder_with_cell(&params);
        let running = AtomicBool::new(true);

        let mut mock = MockNicTest::new();
        mock.expect_send()
            .times(1)
            .returning(|| Err(anyhow!("link is down")));

        let result = sender_loop(&params, Some(&mock), recorder, &running);
        assert!(result.is_err());
    }

    #[test]
    fn sender_treats_post_shutdown_timeout_as_clean_exit() {
        let params = test_params(5);
        let (recorder, cell) = recorder_with_cell(&params);
        let running = Arc::new(AtomicBool::new(true));

        let flag = running.clone();
        let mut mock = MockNicTest::new();
        mock.expect_send().times(1).returning(move || {
            flag.store(false, Ordering::Release);
            Err(anyhow!("timed out waiting for receiver to be ready"))
        });

        sender_loop(&params, Some(&mock), recorder, &running).unwrap();
        assert_eq!(cell.load().observations, 0);
    }

    #[test]
    fn cyclic_mode_runs_without_a_tester() {
        let params = test_params(4);
        let (recorder, cell) = recorder_with_cell(&params);
        let running = AtomicBool::new(true);

        sender_loop(&params, None, recorder, &running).unwrap();

        assert_eq!(cell.load().observations, 2);
    }

    #[test]
    fn receiver_skips_misses_and_keeps_running() {
        let _ = env_logger::builder().is_test(true).try_init();
        let params = test_params(4);
        let (recorder, cell) = recorder_with_cell(&params);
        let running = AtomicBool::new(true);

        let mut seq = Sequence::new();
        let mut mock = MockNicTest::new();
        for received in [true, false, true, true] {
            mock.expect_receive()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move || Ok(received));
        }

        receiver_loop(&params, &mock, recorder, &running).unwrap();

        // Iteration 0 is never recorded, 1 missed, 3 is the excluded last
        // iteration: only iteration 2 lands in the report.
        assert_eq!(cell.load().observations, 1);
    }

    #[test]
    fn receiver_propagates_poll_failures() {
        let params = test_params(4);
        let (recorder, _cell) = recorder_with_cell(&params);
        let running = AtomicBool::new(true);

        let mut mock = MockNicTest::new();
        mock.expect_receive()
            .times(1)
            .returning(|| Err(anyhow!("error during frame polling on socket")));

        let result = receiver_loop(&params, &mock, recorder, &running);
        assert!(result.is_err());
    }

    #[test]
    fn cleared_run_flag_stops_both_loops_immediately() {
        let params = test_params(100);
        let running = AtomicBool::new(false);

        let mock = MockNicTest::new(); // no expectations: nothing may be called
        let (send_recorder, send_cell) = recorder_with_cell(&params);
        sender_loop(&params, Some(&mock), send_recorder, &running).unwrap();

        let (recv_recorder, recv_cell) = recorder_with_cell(&params);
        receiver_loop(&params, &mock, recv_recorder, &running).unwrap();

        assert_eq!(send_cell.load().observations, 0);
        assert_eq!(recv_cell.load().observations, 0);
    }
}
