//! Annotated stopwatch over Linux hardware performance counters.
//!
//! A [`PerfEvent`] owns the counter file descriptors and a set of named
//! parameters. Each [`PerfEventBlock`] resets and enables the counters when it
//! is created and, when dropped, stops them and records a [`Measurement`]
//! tagged with the current parameters. Counter values are divided by the
//! block's scale; time, IPC, CPUs and GHz are not.
//!
//! Counters are best-effort. In containers and VMs `perf_event_open` is often
//! refused, in which case only wall time is reported.

use std::fmt::{self, Display, Write as _};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

const METRIC_WIDTH: usize = 14;
const MIN_PARAM_WIDTH: usize = 10;

/// Events sampled by every block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Cycles,
    Instructions,
    L1dMisses,
    LlcMisses,
    BranchMisses,
    DtlbMisses,
    TaskClock,
}

impl Event {
    pub const ALL: [Event; 7] = [
        Event::Cycles,
        Event::Instructions,
        Event::L1dMisses,
        Event::LlcMisses,
        Event::BranchMisses,
        Event::DtlbMisses,
        Event::TaskClock,
    ];

    /// Events reported per unit of scale.
    pub const NORMALIZED: [Event; 6] = [
        Event::Cycles,
        Event::Instructions,
        Event::L1dMisses,
        Event::LlcMisses,
        Event::BranchMisses,
        Event::DtlbMisses,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Event::Cycles => "cycles",
            Event::Instructions => "instructions",
            Event::L1dMisses => "L1-misses",
            Event::LlcMisses => "LLC-misses",
            Event::BranchMisses => "branch-misses",
            Event::DtlbMisses => "dTLB-misses",
            Event::TaskClock => "task-clock",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// Counter values read at the end of a block. `None` means the counter could
/// not be opened.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Snapshot {
    values: [Option<u64>; Event::ALL.len()],
}

impl Snapshot {
    pub fn get(&self, event: Event) -> Option<u64> {
        self.values[event.index()]
    }

    pub fn with(mut self, event: Event, value: u64) -> Self {
        self.values[event.index()] = Some(value);
        self
    }
}

/// One finished measured block.
#[derive(Clone, Debug)]
pub struct Measurement {
    pub params: Vec<(String, String)>,
    pub elapsed: Duration,
    pub counters: Snapshot,
    pub scale: u64,
}

impl Measurement {
    pub fn per_scale(&self, event: Event) -> Option<f64> {
        let value = self.counters.get(event)?;
        Some(value as f64 / self.scale.max(1) as f64)
    }

    pub fn ipc(&self) -> Option<f64> {
        ratio(
            self.counters.get(Event::Instructions)?,
            self.counters.get(Event::Cycles)?,
        )
    }

    /// Average number of CPUs busy during the block.
    pub fn cpus(&self) -> Option<f64> {
        ratio(
            self.counters.get(Event::TaskClock)?,
            self.elapsed.as_nanos() as u64,
        )
    }

    pub fn ghz(&self) -> Option<f64> {
        ratio(
            self.counters.get(Event::Cycles)?,
            self.counters.get(Event::TaskClock)?,
        )
    }

    fn param_widths(&self) -> impl Iterator<Item = usize> + '_ {
        self.params
            .iter()
            .map(|(name, value)| name.len().max(value.len()).max(MIN_PARAM_WIDTH))
    }

    pub fn header(&self) -> String {
        let mut line = String::new();
        for ((name, _), width) in self.params.iter().zip(self.param_widths()) {
            let _ = write!(line, "{name:>width$}, ");
        }
        let _ = write!(line, "{:>METRIC_WIDTH$}", "time sec");
        for event in Event::NORMALIZED {
            let _ = write!(line, ", {:>METRIC_WIDTH$}", event.label());
        }
        for label in ["IPC", "CPUs", "GHz"] {
            let _ = write!(line, ", {label:>METRIC_WIDTH$}");
        }
        line
    }

    pub fn row(&self) -> String {
        let mut line = String::new();
        for ((_, value), width) in self.params.iter().zip(self.param_widths()) {
            let _ = write!(line, "{value:>width$}, ");
        }
        let _ = write!(line, "{:>METRIC_WIDTH$.6}", self.elapsed.as_secs_f64());
        for event in Event::NORMALIZED {
            let _ = write!(line, ", {:>METRIC_WIDTH$}", Metric(self.per_scale(event)));
        }
        for metric in [self.ipc(), self.cpus(), self.ghz()] {
            let _ = write!(line, ", {:>METRIC_WIDTH$}", Metric(metric));
        }
        line
    }
}

fn ratio(numerator: u64, denominator: u64) -> Option<f64> {
    (denominator != 0).then(|| numerator as f64 / denominator as f64)
}

struct Metric(Option<f64>);

impl Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(value) => fmt::Display::fmt(&format!("{value:.2}"), f),
            None => f.pad("-"),
        }
    }
}

pub struct PerfEvent {
    counters: HardwareCounters,
    params: Vec<(String, String)>,
    measurements: Vec<Measurement>,
    printed_header: Option<Vec<String>>,
    print: bool,
}

impl PerfEvent {
    /// Opens the hardware counters when `hw_counters` is set. Blocks report
    /// wall time only when none of them can be opened.
    pub fn new(hw_counters: bool) -> Self {
        let counters = HardwareCounters::new(hw_counters);
        if hw_counters && !counters.available() {
            warn!("hardware performance counters unavailable, reporting wall time only");
        }

        Self {
            counters,
            params: Vec::new(),
            measurements: Vec::new(),
            printed_header: None,
            print: true,
        }
    }

    /// Records measurements without printing them.
    pub fn quiet(mut self) -> Self {
        self.print = false;
        self
    }

    pub fn hw_available(&self) -> bool {
        self.counters.available()
    }

    /// Sets `name` for every following block, replacing an earlier value
    /// in place so column order is stable.
    pub fn set_param(&mut self, name: &str, value: impl Display) {
        let value = value.to_string();
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.params.push((name.to_owned(), value)),
        }
    }

    pub fn clear_params(&mut self) {
        self.params.clear();
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn measurements(&self) -> &[Measurement] {
        &self.measurements
    }

    fn record(&mut self, measurement: Measurement) {
        if self.print {
            let names: Vec<String> = measurement.params.iter().map(|(n, _)| n.clone()).collect();
            if self.printed_header.as_ref() != Some(&names) {
                println!("{}", measurement.header());
                self.printed_header = Some(names);
            }
            println!("{}", measurement.row());
        }
        self.measurements.push(measurement);
    }
}

/// A measured scope. Counting starts in [`PerfEventBlock::new`] and stops on
/// drop, where the result is recorded on the owning [`PerfEvent`].
pub struct PerfEventBlock<'a> {
    event: &'a mut PerfEvent,
    scale: u64,
    started: Instant,
}

impl<'a> PerfEventBlock<'a> {
    pub fn new(event: &'a mut PerfEvent, scale: u64) -> Self {
        event.counters.reset_and_enable();
        Self {
            event,
            scale,
            started: Instant::now(),
        }
    }
}

impl Drop for PerfEventBlock<'_> {
    fn drop(&mut self) {
        let elapsed = self.started.elapsed();
        self.event.counters.disable();
        let counters = self.event.counters.read();
        debug!(?elapsed, scale = self.scale, "measurement block closed");

        let measurement = Measurement {
            params: self.event.params.clone(),
            elapsed,
            counters,
            scale: self.scale,
        };
        self.event.record(measurement);
    }
}

#[cfg(target_os = "linux")]
use linux::HardwareCounters;

#[cfg(target_os = "linux")]
mod linux {
    use std::os::unix::io::RawFd;

    use tracing::debug;

    use super::{Event, Snapshot};

    /// Attribute structure for the perf_event_open syscall.
    ///
    /// Matches the first version of the kernel's `struct perf_event_attr`.
    #[repr(C)]
    #[derive(Clone, Copy)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period_or_freq: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        wakeup_events: u32,
        bp_type: u32,
        config1: u64,
        config2: u64,
    }

    impl PerfEventAttr {
        fn new(type_: u32, config: u64) -> Self {
            Self {
                type_,
                size: std::mem::size_of::<Self>() as u32,
                config,
                sample_period_or_freq: 0,
                sample_type: 0,
                read_format: PERF_FORMAT_TOTAL_TIME_ENABLED | PERF_FORMAT_TOTAL_TIME_RUNNING,
                flags: PERF_ATTR_FLAG_DISABLED
                    | PERF_ATTR_FLAG_EXCLUDE_KERNEL
                    | PERF_ATTR_FLAG_EXCLUDE_HV,
                wakeup_events: 0,
                bp_type: 0,
                config1: 0,
                config2: 0,
            }
        }
    }

    // See: https://man7.org/linux/man-pages/man2/perf_event_open.2.html
    const PERF_TYPE_HARDWARE: u32 = 0;
    const PERF_TYPE_SOFTWARE: u32 = 1;
    const PERF_TYPE_HW_CACHE: u32 = 3;

    const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
    const PERF_COUNT_HW_INSTRUCTIONS: u64 = 1;
    const PERF_COUNT_HW_BRANCH_MISSES: u64 = 5;
    const PERF_COUNT_SW_TASK_CLOCK: u64 = 1;

    const PERF_COUNT_HW_CACHE_L1D: u64 = 0;
    const PERF_COUNT_HW_CACHE_LL: u64 = 2;
    const PERF_COUNT_HW_CACHE_DTLB: u64 = 3;
    const PERF_COUNT_HW_CACHE_OP_READ: u64 = 0;
    const PERF_COUNT_HW_CACHE_RESULT_MISS: u64 = 1;

    const PERF_FORMAT_TOTAL_TIME_ENABLED: u64 = 1 << 1;
    const PERF_FORMAT_TOTAL_TIME_RUNNING: u64 = 1 << 2;

    const PERF_ATTR_FLAG_DISABLED: u64 = 1 << 0;
    const PERF_ATTR_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
    const PERF_ATTR_FLAG_EXCLUDE_HV: u64 = 1 << 6;

    // _IO('$', nr)
    const PERF_EVENT_IOC_ENABLE: libc::c_ulong = 0x2400;
    const PERF_EVENT_IOC_DISABLE: libc::c_ulong = 0x2401;
    const PERF_EVENT_IOC_RESET: libc::c_ulong = 0x2403;

    const fn cache_miss(cache: u64) -> u64 {
        cache | (PERF_COUNT_HW_CACHE_OP_READ << 8) | (PERF_COUNT_HW_CACHE_RESULT_MISS << 16)
    }

    fn attr(event: Event) -> PerfEventAttr {
        match event {
            Event::Cycles => PerfEventAttr::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_CPU_CYCLES),
            Event::Instructions => {
                PerfEventAttr::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_INSTRUCTIONS)
            }
            Event::L1dMisses => {
                PerfEventAttr::new(PERF_TYPE_HW_CACHE, cache_miss(PERF_COUNT_HW_CACHE_L1D))
            }
            Event::LlcMisses => {
                PerfEventAttr::new(PERF_TYPE_HW_CACHE, cache_miss(PERF_COUNT_HW_CACHE_LL))
            }
            Event::BranchMisses => {
                PerfEventAttr::new(PERF_TYPE_HARDWARE, PERF_COUNT_HW_BRANCH_MISSES)
            }
            Event::DtlbMisses => {
                PerfEventAttr::new(PERF_TYPE_HW_CACHE, cache_miss(PERF_COUNT_HW_CACHE_DTLB))
            }
            Event::TaskClock => PerfEventAttr::new(PERF_TYPE_SOFTWARE, PERF_COUNT_SW_TASK_CLOCK),
        }
    }

    /// Counter file descriptors for the calling thread, indexed by [`Event`].
    /// Unopened counters hold -1.
    #[derive(Debug)]
    pub(super) struct HardwareCounters {
        fds: [RawFd; Event::ALL.len()],
    }

    impl HardwareCounters {
        pub(super) fn new(enable: bool) -> Self {
            let mut counters = Self {
                fds: [-1; Event::ALL.len()],
            };
            if !enable {
                return counters;
            }

            for event in Event::ALL {
                let fd = perf_event_open(&attr(event));
                if fd < 0 {
                    debug!(
                        event = event.label(),
                        error = %std::io::Error::last_os_error(),
                        "perf_event_open failed"
                    );
                }
                counters.fds[event.index()] = fd;
            }
            counters
        }

        pub(super) fn available(&self) -> bool {
            self.fds.iter().any(|&fd| fd >= 0)
        }

        pub(super) fn reset_and_enable(&self) {
            for &fd in self.open() {
                unsafe {
                    libc::ioctl(fd, PERF_EVENT_IOC_RESET, 0);
                    libc::ioctl(fd, PERF_EVENT_IOC_ENABLE, 0);
                }
            }
        }

        pub(super) fn disable(&self) {
            for &fd in self.open() {
                unsafe {
                    libc::ioctl(fd, PERF_EVENT_IOC_DISABLE, 0);
                }
            }
        }

        pub(super) fn read(&self) -> Snapshot {
            let mut snapshot = Snapshot::default();
            for event in Event::ALL {
                if let Some(value) = read_scaled_counter(self.fds[event.index()]) {
                    snapshot = snapshot.with(event, value);
                }
            }
            snapshot
        }

        fn open(&self) -> impl Iterator<Item = &RawFd> {
            self.fds.iter().filter(|&&fd| fd >= 0)
        }
    }

    impl Drop for HardwareCounters {
        fn drop(&mut self) {
            for fd in &mut self.fds {
                if *fd >= 0 {
                    unsafe {
                        libc::close(*fd);
                    }
                    *fd = -1;
                }
            }
        }
    }

    fn perf_event_open(attr: &PerfEventAttr) -> RawFd {
        let ret = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                attr as *const PerfEventAttr,
                0 as libc::c_int,
                -1 as libc::c_int,
                -1 as libc::c_int,
                0 as libc::c_ulong,
            )
        };
        if ret < 0 {
            -1
        } else {
            ret as RawFd
        }
    }

    #[repr(C)]
    struct PerfRead {
        value: u64,
        time_enabled: u64,
        time_running: u64,
    }

    /// Reads a counter value, scaling for time-based multiplexing.
    fn read_scaled_counter(fd: RawFd) -> Option<u64> {
        if fd < 0 {
            return None;
        }
        let mut data = PerfRead {
            value: 0,
            time_enabled: 0,
            time_running: 0,
        };
        let bytes = unsafe {
            libc::read(
                fd,
                &mut data as *mut PerfRead as *mut libc::c_void,
                std::mem::size_of::<PerfRead>(),
            )
        };
        if bytes != std::mem::size_of::<PerfRead>() as isize {
            return None;
        }

        if data.time_running > 0 && data.time_enabled > data.time_running {
            let scaled =
                (data.value as f64) * (data.time_enabled as f64) / (data.time_running as f64);
            return Some(scaled as u64);
        }
        Some(data.value)
    }
}

#[cfg(not(target_os = "linux"))]
#[derive(Debug)]
struct HardwareCounters;

#[cfg(not(target_os = "linux"))]
impl HardwareCounters {
    fn new(_enable: bool) -> Self {
        Self
    }

    fn available(&self) -> bool {
        false
    }

    fn reset_and_enable(&self) {}

    fn disable(&self) {}

    fn read(&self) -> Snapshot {
        Snapshot::default()
    }
}
