//! # Simulated Device
//!
//! Buffer-object allocator and kernel channel backed by host memory, with an
//! interpreter for the records the core emits.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use bytemuck::Pod;
use spin::Mutex;

use basalt_cmd::{
    BufferEntry, CondMode, KernelChannel, LongReport, Record, ReportFormat, ReportKind,
    ShortReport, Submission, REPORT_SIZE,
};
use basalt_core::{
    BoHandle, ByteSize, Error, FenceTimeline, GpuAddr, MemoryDomain, Pipeline, Result, Timeout,
};
use basalt_mem::{Bo, BoAllocator, HostMemory};

/// First GPU virtual address handed out
const VA_BASE: u64 = 0x1_0000_0000;
/// Granularity of the virtual address space
const VA_ALIGN: u64 = 0x1_0000;
/// Clock ticks per executed record
const TICKS_PER_RECORD: u64 = 10;

// =============================================================================
// PUBLIC TYPES
// =============================================================================

/// When submitted work completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Every batch executes and signals at submission
    #[default]
    Immediate,
    /// Batches queue until waited on or retired
    Hold,
    /// Batches never complete
    Hang,
}

/// A batch as the kernel saw it
#[derive(Debug, Clone)]
pub struct SimSubmission {
    /// Fence sequence
    pub sequence: u64,
    /// Records in order
    pub records: Vec<Record>,
    /// Buffer list
    pub buffers: Vec<BufferEntry>,
}

/// Device statistics
#[derive(Debug, Clone, Default)]
pub struct SimStats {
    /// Batches submitted
    pub submissions: u64,
    /// Batches executed
    pub executed: u64,
    /// Draws executed
    pub draws: u64,
    /// Launches executed
    pub launches: u64,
    /// Draws and launches skipped by the render condition
    pub skipped: u64,
    /// Reports written
    pub reports: u64,
    /// Bytes moved by copy records
    pub bytes_copied: u64,
    /// Code words uploaded
    pub code_words: u64,
    /// Semaphore acquires whose value did not match
    pub semaphore_mismatches: u64,
}

// =============================================================================
// DEVICE STATE
// =============================================================================

#[derive(Debug)]
struct SimBo {
    size: u64,
    memory: Arc<HostMemory>,
}

#[derive(Debug, Default)]
struct Counters {
    samples: u64,
    generated: u64,
    emitted: u64,
    counting: bool,
}

#[derive(Debug)]
struct SimState {
    mode: ExecMode,
    next_handle: u64,
    next_addr: u64,
    budget: Option<u64>,
    used: u64,
    bos: BTreeMap<u64, SimBo>,
    timeline: Option<Arc<FenceTimeline>>,
    pending: VecDeque<SimSubmission>,
    history: Vec<SimSubmission>,
    counters: Counters,
    clock: u64,
    condition: [(CondMode, Option<GpuAddr>); 2],
    stats: SimStats,
}

impl SimState {
    fn new() -> Self {
        Self {
            mode: ExecMode::Immediate,
            next_handle: 1,
            next_addr: VA_BASE,
            budget: None,
            used: 0,
            bos: BTreeMap::new(),
            timeline: None,
            pending: VecDeque::new(),
            history: Vec::new(),
            counters: Counters::default(),
            clock: 0,
            condition: [(CondMode::Always, None); 2],
            stats: SimStats::default(),
        }
    }

    fn resolve(&self, addr: GpuAddr, len: u64) -> Result<(Arc<HostMemory>, u64)> {
        let (&base, bo) = self
            .bos
            .range(..=addr.raw())
            .next_back()
            .ok_or(Error::OutOfBounds)?;
        let offset = addr.raw() - base;
        if offset + len > bo.size {
            return Err(Error::OutOfBounds);
        }
        Ok((Arc::clone(&bo.memory), offset))
    }

    fn read(&self, addr: GpuAddr, out: &mut [u8]) -> Result<()> {
        let (memory, offset) = self.resolve(addr, out.len() as u64)?;
        memory.read(offset, out)
    }

    fn write(&self, addr: GpuAddr, data: &[u8]) -> Result<()> {
        let (memory, offset) = self.resolve(addr, data.len() as u64)?;
        memory.write(offset, data)
    }

    fn read_pod<T: Pod>(&self, addr: GpuAddr) -> Result<T> {
        let (memory, offset) = self.resolve(addr, core::mem::size_of::<T>() as u64)?;
        memory.read_pod(offset)
    }

    fn write_pod<T: Pod>(&self, addr: GpuAddr, value: &T) -> Result<()> {
        let (memory, offset) = self.resolve(addr, core::mem::size_of::<T>() as u64)?;
        memory.write_pod(offset, value)
    }

    fn counter(&self, kind: ReportKind) -> u64 {
        match kind {
            ReportKind::SampleCount => self.counters.samples,
            ReportKind::PrimitivesGenerated => self.counters.generated,
            ReportKind::PrimitivesEmitted => self.counters.emitted,
            ReportKind::Timestamp | ReportKind::Sequence => 0,
        }
    }

    fn condition_passes(&self, pipeline: Pipeline) -> bool {
        let (mode, addr) = self.condition[pipeline.index()];
        let addr = match (mode, addr) {
            (CondMode::Always, _) => return true,
            (CondMode::Never, _) => return false,
            (_, None) => return true,
            (_, Some(addr)) => addr,
        };
        let reports = self
            .read_pod::<ShortReport>(addr)
            .and_then(|end| Ok((end, self.read_pod::<ShortReport>(addr + REPORT_SIZE)?)));
        match reports {
            Ok((end, begin)) => match mode {
                CondMode::ResNonZero => end.value != 0,
                CondMode::Equal => end.value == begin.value,
                _ => end.value != begin.value,
            },
            Err(e) => {
                log::warn!("render condition at {} unreadable: {}", addr, e);
                true
            }
        }
    }

    fn execute(&mut self, batch: &SimSubmission) {
        for record in &batch.records {
            self.clock += TICKS_PER_RECORD;
            if let Err(e) = self.step(record) {
                log::warn!("seq {}: {:?} faulted: {}", batch.sequence, record, e);
            }
        }
        self.stats.executed += 1;
    }

    fn step(&mut self, record: &Record) -> Result<()> {
        match record {
            Record::Report {
                addr,
                sequence,
                kind,
                format,
                ..
            } => {
                let value = self.counter(*kind);
                match format {
                    ReportFormat::Short => self.write_pod(
                        *addr,
                        &ShortReport {
                            sequence: *sequence,
                            value: value as u32,
                            timestamp: self.clock,
                        },
                    )?,
                    ReportFormat::Long => self.write_pod(
                        *addr,
                        &LongReport {
                            value,
                            timestamp: self.clock,
                        },
                    )?,
                }
                self.stats.reports += 1;
            }
            Record::ResetCounter { kind } => match kind {
                ReportKind::SampleCount => self.counters.samples = 0,
                ReportKind::PrimitivesGenerated => self.counters.generated = 0,
                ReportKind::PrimitivesEmitted => self.counters.emitted = 0,
                ReportKind::Timestamp | ReportKind::Sequence => {}
            },
            Record::SampleCounting { enable } => self.counters.counting = *enable,
            Record::RenderCondition {
                pipeline,
                mode,
                addr,
            } => self.condition[pipeline.index()] = (*mode, *addr),
            Record::Draw {
                mode,
                count,
                instances,
                ..
            } => {
                if !self.condition_passes(Pipeline::Render) {
                    self.stats.skipped += 1;
                    return Ok(());
                }
                let instances = u64::from(*instances);
                let primitives = u64::from(mode.primitive_count(*count)) * instances;
                if self.counters.counting {
                    self.counters.samples += u64::from(*count) * instances;
                }
                self.counters.generated += primitives;
                self.counters.emitted += primitives;
                self.stats.draws += 1;
            }
            Record::Launch { .. } => {
                if self.condition_passes(Pipeline::Compute) {
                    self.stats.launches += 1;
                } else {
                    self.stats.skipped += 1;
                }
            }
            Record::CopyBuffer { src, dst, size } => {
                let mut bytes = vec![0u8; *size as usize];
                self.read(*src, &mut bytes)?;
                self.write(*dst, &bytes)?;
                self.stats.bytes_copied += size;
            }
            Record::UploadCode { addr, words } => {
                self.write(*addr, bytemuck::cast_slice(words))?;
                self.stats.code_words += words.len() as u64;
            }
            Record::SemaphoreAcquire { addr, value } => {
                let current: u32 = self.read_pod(*addr)?;
                if current != *value {
                    log::warn!("semaphore at {} holds {}, expected {}", addr, current, value);
                    self.stats.semaphore_mismatches += 1;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Execute and signal queued batches up to `sequence`
    fn complete_up_to(&mut self, sequence: u64) {
        while self.pending.front().is_some_and(|b| b.sequence <= sequence) {
            if let Some(batch) = self.pending.pop_front() {
                self.execute(&batch);
                if let Some(timeline) = &self.timeline {
                    timeline.signal(batch.sequence);
                }
            }
        }
    }
}

// =============================================================================
// SIM DEVICE
// =============================================================================

/// Simulated GPU; clones share one device
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl SimDevice {
    /// Create a device with unlimited memory that completes work immediately
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new())),
        }
    }

    /// Create a device that fails allocations beyond `bytes` in use
    pub fn with_budget(bytes: u64) -> Self {
        let device = Self::new();
        device.state.lock().budget = Some(bytes);
        device
    }

    /// Change when submitted work completes
    pub fn set_mode(&self, mode: ExecMode) {
        self.state.lock().mode = mode;
    }

    /// Current execution mode
    pub fn mode(&self) -> ExecMode {
        self.state.lock().mode
    }

    /// Complete every queued batch; a hung device stays hung
    pub fn retire_all(&self) {
        let mut state = self.state.lock();
        if state.mode == ExecMode::Hang {
            return;
        }
        state.complete_up_to(u64::MAX);
    }

    /// Batches queued but not executed
    pub fn pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Every batch submitted so far
    pub fn submissions(&self) -> Vec<SimSubmission> {
        self.state.lock().history.clone()
    }

    /// Records of every batch submitted so far, in order
    pub fn records(&self) -> Vec<Record> {
        self.state
            .lock()
            .history
            .iter()
            .flat_map(|b| b.records.iter().cloned())
            .collect()
    }

    /// Copy device memory
    pub fn read(&self, addr: GpuAddr, out: &mut [u8]) -> Result<()> {
        self.state.lock().read(addr, out)
    }

    /// Read a plain-old-data value from device memory
    pub fn read_pod<T: Pod>(&self, addr: GpuAddr) -> Result<T> {
        self.state.lock().read_pod(addr)
    }

    /// Bytes allocated and not freed
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().used
    }

    /// Get a snapshot of the statistics
    pub fn stats(&self) -> SimStats {
        self.state.lock().stats.clone()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl BoAllocator for SimDevice {
    fn alloc_bo(&mut self, size: ByteSize, domain: MemoryDomain) -> Result<Bo> {
        let bytes = size.as_bytes();
        if bytes == 0 {
            return Err(Error::InvalidParameter);
        }
        let mut state = self.state.lock();
        if state.budget.is_some_and(|budget| state.used + bytes > budget) {
            return Err(Error::OutOfDeviceMemory);
        }
        let handle = BoHandle::new(state.next_handle);
        state.next_handle += 1;
        let addr = state.next_addr;
        state.next_addr += bytes.div_ceil(VA_ALIGN) * VA_ALIGN;
        state.used += bytes;

        let memory = Arc::new(HostMemory::new(bytes as usize));
        state.bos.insert(
            addr,
            SimBo {
                size: bytes,
                memory: Arc::clone(&memory),
            },
        );
        log::trace!("sim: bo {:?} {:?} at {:#x} in {:?}", handle, size, addr, domain);
        Ok(Bo {
            handle,
            addr: GpuAddr::new(addr),
            size,
            domain,
            host: domain.is_host_visible().then_some(memory),
        })
    }

    fn free_bo(&mut self, bo: Bo) {
        let mut state = self.state.lock();
        if let Some(freed) = state.bos.remove(&bo.addr.raw()) {
            state.used -= freed.size;
        }
    }
}

impl KernelChannel for SimDevice {
    fn submit(&mut self, timeline: &Arc<FenceTimeline>, submission: &Submission<'_>) -> Result<()> {
        let batch = SimSubmission {
            sequence: submission.sequence,
            records: submission.records.to_vec(),
            buffers: submission.buffers.to_vec(),
        };
        let mut state = self.state.lock();
        state.timeline = Some(Arc::clone(timeline));
        state.stats.submissions += 1;
        state.history.push(batch.clone());
        match state.mode {
            ExecMode::Immediate => {
                state.execute(&batch);
                timeline.signal(batch.sequence);
            }
            ExecMode::Hold | ExecMode::Hang => state.pending.push_back(batch),
        }
        Ok(())
    }

    fn wait(&mut self, timeline: &Arc<FenceTimeline>, sequence: u64, _timeout: Timeout) -> Result<bool> {
        if timeline.is_reached(sequence) {
            return Ok(true);
        }
        let mut state = self.state.lock();
        if state.mode == ExecMode::Hang {
            return Ok(false);
        }
        state.complete_up_to(sequence);
        Ok(timeline.is_reached(sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_cmd::PrimitiveMode;

    fn submit(device: &mut SimDevice, timeline: &Arc<FenceTimeline>, records: Vec<Record>) -> u64 {
        let sequence = timeline.last_emitted() + 1;
        // Keep the timeline's emitted counter in step with the batches.
        let fence = basalt_core::Fence::new(timeline);
        assert_eq!(fence.emit().unwrap(), sequence);
        let submission = Submission {
            records: &records,
            buffers: &[],
            sequence,
        };
        device.submit(timeline, &submission).unwrap();
        sequence
    }

    #[test]
    fn test_only_gart_is_host_visible() {
        let mut device = SimDevice::new();
        let gart = device.alloc_bo(ByteSize::from_kib(4), MemoryDomain::Gart).unwrap();
        let vram = device.alloc_bo(ByteSize::from_kib(4), MemoryDomain::Vram).unwrap();
        assert!(gart.host.is_some());
        assert!(vram.host.is_none());
        assert_ne!(gart.addr, vram.addr);
        assert_eq!(device.live_bytes(), 8192);
        device.free_bo(vram);
        assert_eq!(device.live_bytes(), 4096);
    }

    #[test]
    fn test_budget() {
        let mut device = SimDevice::with_budget(4096);
        let bo = device.alloc_bo(ByteSize::from_kib(4), MemoryDomain::Vram).unwrap();
        assert_eq!(
            device.alloc_bo(ByteSize::from_bytes(1), MemoryDomain::Vram).map(|_| ()),
            Err(Error::OutOfDeviceMemory)
        );
        device.free_bo(bo);
        assert!(device.alloc_bo(ByteSize::from_kib(4), MemoryDomain::Vram).is_ok());
    }

    #[test]
    fn test_sample_report() {
        let mut device = SimDevice::new();
        let timeline = Arc::new(FenceTimeline::new());
        let bo = device.alloc_bo(ByteSize::from_bytes(256), MemoryDomain::Gart).unwrap();
        submit(
            &mut device,
            &timeline,
            vec![
                Record::ResetCounter {
                    kind: ReportKind::SampleCount,
                },
                Record::SampleCounting { enable: true },
                Record::Draw {
                    mode: PrimitiveMode::Triangles,
                    start: 0,
                    count: 6,
                    instances: 2,
                    indexed: false,
                },
                Record::Report {
                    pipeline: Pipeline::Render,
                    addr: bo.addr,
                    sequence: 7,
                    kind: ReportKind::SampleCount,
                    format: ReportFormat::Short,
                },
            ],
        );
        let report: ShortReport = device.read_pod(bo.addr).unwrap();
        assert_eq!(report.sequence, 7);
        assert_eq!(report.value, 12);
        assert!(report.timestamp > 0);
        assert!(timeline.is_reached(1));
    }

    #[test]
    fn test_hold_completes_on_wait() {
        let mut device = SimDevice::new();
        device.set_mode(ExecMode::Hold);
        let timeline = Arc::new(FenceTimeline::new());
        let first = submit(&mut device, &timeline, vec![Record::Serialize]);
        let second = submit(&mut device, &timeline, vec![Record::Serialize]);
        assert_eq!(device.pending(), 2);

        assert_eq!(device.wait(&timeline, first, Timeout::ZERO), Ok(true));
        assert!(!timeline.is_reached(second));
        device.retire_all();
        assert!(timeline.is_reached(second));
        assert_eq!(device.stats().executed, 2);
    }

    #[test]
    fn test_hang_never_completes() {
        let mut device = SimDevice::new();
        device.set_mode(ExecMode::Hang);
        let timeline = Arc::new(FenceTimeline::new());
        let seq = submit(&mut device, &timeline, vec![Record::Serialize]);
        device.retire_all();
        assert_eq!(device.wait(&timeline, seq, Timeout::from_millis(5)), Ok(false));
    }

    #[test]
    fn test_condition_skips_draw() {
        let mut device = SimDevice::new();
        let timeline = Arc::new(FenceTimeline::new());
        let draw = Record::Draw {
            mode: PrimitiveMode::Points,
            start: 0,
            count: 1,
            instances: 1,
            indexed: false,
        };
        submit(
            &mut device,
            &timeline,
            vec![
                Record::RenderCondition {
                    pipeline: Pipeline::Render,
                    mode: CondMode::Never,
                    addr: None,
                },
                draw.clone(),
                Record::RenderCondition {
                    pipeline: Pipeline::Render,
                    mode: CondMode::Always,
                    addr: None,
                },
                draw,
            ],
        );
        let stats = device.stats();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.draws, 1);
    }
}
