/// Immutable parameters for one test run, supplied by the CLI layer.
#[derive(Debug, Clone)]
pub struct TestParameters {
    /// Interface under test; `None` runs the cyclic timer test only.
    pub nic_name: Option<String>,
    /// Bounded iteration count; `None` runs until interrupted.
    pub iterations: Option<u64>,
    /// Sender period in nanoseconds.
    pub send_sleep_ns: u64,
    pub send_priority: i32,
    pub receive_priority: i32,
    pub send_cpu: usize,
    pub receive_cpu: usize,
    pub verbose: bool,
    /// Base histogram bucket width in nanoseconds.
    pub bucket_width_ns: u64,
}
