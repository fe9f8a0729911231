//! # Queries and Render Conditions
//!
//! A query brackets a range of commands with two reports the GPU writes into
//! a small slot of host-visible memory. Slots are never reused: every
//! begin/end cycle moves to the next slot of the query's slice, and a full
//! slice is dropped (its memory retires behind its fences) for a fresh one.
//!
//! ```text
//!  slice (256 B)
//!  ┌───────────────┬───────────────┬─────┬───────────────┐
//!  │ slot 0        │ slot 1        │ ... │ slot 7        │
//!  │ end   │ begin │ end   │ begin │     │ end   │ begin │
//!  │ +0    │ +16   │ +32   │ +48   │     │ +224  │ +240  │
//!  └───────────────┴───────────────┴─────┴───────────────┘
//! ```
//!
//! Occlusion queries prove completion by the sequence number the GPU writes
//! into the end report; every other kind captures the fence of the batch
//! carrying its end report.

use static_assertions::const_assert_eq;

use basalt_cmd::{CondMode, LongReport, Record, ReportFormat, ReportKind, ShortReport, REPORT_SIZE};
use basalt_core::{Access, Error, Fence, GpuAddr, MemoryDomain, Pipeline, Result};
use basalt_mem::{ResourceDesc, ResourceRef};

use crate::context::Context;
use crate::dirty::{ComputeDirty, RenderDirty};
use crate::screen::Screen;

/// Bytes per query slot: end report, then begin report
pub const QUERY_SLOT_SIZE: u64 = 2 * REPORT_SIZE;
/// Slots per slice
pub const SLOTS_PER_SLICE: u32 = 8;
/// Bytes per slice
pub const QUERY_SLICE_SIZE: u64 = QUERY_SLOT_SIZE * SLOTS_PER_SLICE as u64;
/// Ticks per second of reported timestamps
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

const END_OFFSET: u64 = 0;
const BEGIN_OFFSET: u64 = REPORT_SIZE;

const_assert_eq!(QUERY_SLICE_SIZE, 256);

// =============================================================================
// TYPES
// =============================================================================

/// What a query measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Samples passed
    OcclusionCounter,
    /// Any sample passed
    OcclusionPredicate,
    /// Primitives entering the pipeline
    PrimitivesGenerated,
    /// Primitives written to stream output
    PrimitivesEmitted,
    /// GPU time between begin and end
    TimeElapsed,
    /// GPU time at end
    Timestamp,
    /// Timestamp frequency and validity
    TimestampDisjoint,
    /// All prior work finished
    GpuFinished,
}

impl QueryKind {
    /// Counts samples
    pub const fn is_occlusion(self) -> bool {
        matches!(self, Self::OcclusionCounter | Self::OcclusionPredicate)
    }

    /// Brackets a range with begin and end
    pub const fn has_begin(self) -> bool {
        !matches!(self, Self::Timestamp | Self::GpuFinished)
    }

    /// Completion is proven by a fence rather than a report sequence
    const fn fence_proven(self) -> bool {
        !self.is_occlusion() && !matches!(self, Self::TimestampDisjoint)
    }

    const fn counter(self) -> ReportKind {
        match self {
            Self::OcclusionCounter | Self::OcclusionPredicate => ReportKind::SampleCount,
            Self::PrimitivesGenerated => ReportKind::PrimitivesGenerated,
            Self::PrimitivesEmitted => ReportKind::PrimitivesEmitted,
            Self::TimeElapsed | Self::Timestamp | Self::TimestampDisjoint => ReportKind::Timestamp,
            Self::GpuFinished => ReportKind::Sequence,
        }
    }

    const fn format(self) -> ReportFormat {
        if self.is_occlusion() {
            ReportFormat::Short
        } else {
            ReportFormat::Long
        }
    }
}

/// Query life cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Idle, or holding a fetched result
    Ready,
    /// Between begin and end
    Active,
    /// End recorded, result not fetched
    Ended,
    /// End recorded and flushed by a non-waiting poll
    Flushed,
}

/// Outcome of a poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryResult {
    /// The GPU has not written the result yet
    NotReady,
    /// Counter difference or timestamp
    Value(u64),
    /// Boolean result
    Predicate(bool),
    /// Timestamp-disjoint result
    Disjoint {
        /// Timestamp ticks per second
        frequency: u64,
        /// Timestamps in the range are unreliable
        disjoint: bool,
    },
}

/// GPU query
#[derive(Debug)]
pub struct Query {
    kind: QueryKind,
    state: QueryState,
    slice: Option<ResourceRef>,
    slot: u32,
    sequence: u32,
    fence: Option<Fence>,
    result: Option<QueryResult>,
    /// Began while another occlusion query was active
    nested: bool,
    slices: u64,
}

impl Query {
    /// Create an idle query; memory is allocated on first use
    pub fn new(kind: QueryKind) -> Self {
        Self {
            kind,
            state: QueryState::Ready,
            slice: None,
            slot: 0,
            sequence: 0,
            fence: None,
            result: None,
            nested: false,
            slices: 0,
        }
    }

    /// What the query measures
    pub fn kind(&self) -> QueryKind {
        self.kind
    }

    /// Life-cycle state
    pub fn state(&self) -> QueryState {
        self.state
    }

    /// Sequence of the current cycle
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Slot of the current cycle within its slice
    pub fn slot(&self) -> u32 {
        self.slot
    }

    /// Slices allocated so far
    pub fn slices(&self) -> u64 {
        self.slices
    }

    /// Address of the current cycle's end report
    pub fn report_addr(&self) -> Option<GpuAddr> {
        self.slice
            .as_ref()
            .map(|s| s.gpu_addr() + u64::from(self.slot) * QUERY_SLOT_SIZE + END_OFFSET)
    }

    fn slice(&self) -> Result<&ResourceRef> {
        self.slice.as_ref().ok_or(Error::InvalidState)
    }

    fn slot_offset(&self) -> u64 {
        u64::from(self.slot) * QUERY_SLOT_SIZE
    }

    /// Move to the next unused slot
    fn rotate(&mut self, screen: &Screen) -> Result<()> {
        if self.slice.is_some() && self.slot + 1 < SLOTS_PER_SLICE {
            self.slot += 1;
            return Ok(());
        }
        let slice = screen.create_resource(ResourceDesc::buffer(QUERY_SLICE_SIZE, MemoryDomain::Gart))?;
        if self.slice.is_some() {
            log::debug!("{:?} query: slice exhausted, moving to {}", self.kind, slice.gpu_addr());
        }
        self.slice = Some(slice);
        self.slot = 0;
        self.slices += 1;
        Ok(())
    }

    /// Start a new cycle in a fresh slot
    fn next_cycle(&mut self, screen: &Screen) -> Result<()> {
        self.rotate(screen)?;
        self.sequence = self.sequence.wrapping_add(1);
        self.result = None;
        self.fence = None;

        // Until the GPU writes them, the reports claim "previous cycle, passed".
        let slice = self.slice()?;
        let base = self.slot_offset();
        slice.write_pod_unsynchronized(
            base + END_OFFSET,
            &ShortReport {
                sequence: self.sequence.wrapping_sub(1),
                value: 1,
                timestamp: 0,
            },
        )?;
        slice.write_pod_unsynchronized(
            base + BEGIN_OFFSET,
            &ShortReport {
                sequence: self.sequence,
                value: 0,
                timestamp: 0,
            },
        )
    }

    fn is_complete(&self) -> Result<bool> {
        if self.kind.fence_proven() {
            return Ok(self.fence.as_ref().is_some_and(Fence::is_signalled));
        }
        let end: ShortReport = self.slice()?.read_pod_unsynchronized(self.slot_offset() + END_OFFSET)?;
        Ok(end.sequence == self.sequence)
    }

    fn read_result(&self) -> Result<QueryResult> {
        let slice = self.slice()?;
        let base = self.slot_offset();
        let short = || -> Result<(ShortReport, ShortReport)> {
            Ok((
                slice.read_pod_unsynchronized(base + END_OFFSET)?,
                slice.read_pod_unsynchronized(base + BEGIN_OFFSET)?,
            ))
        };
        let long = || -> Result<(LongReport, LongReport)> {
            Ok((
                slice.read_pod_unsynchronized(base + END_OFFSET)?,
                slice.read_pod_unsynchronized(base + BEGIN_OFFSET)?,
            ))
        };
        Ok(match self.kind {
            QueryKind::OcclusionCounter => {
                let (end, begin) = short()?;
                QueryResult::Value(u64::from(end.value.wrapping_sub(begin.value)))
            }
            QueryKind::OcclusionPredicate => {
                let (end, begin) = short()?;
                QueryResult::Predicate(end.value != begin.value)
            }
            QueryKind::PrimitivesGenerated | QueryKind::PrimitivesEmitted => {
                let (end, begin) = long()?;
                QueryResult::Value(end.value.wrapping_sub(begin.value))
            }
            QueryKind::TimeElapsed => {
                let (end, begin) = long()?;
                QueryResult::Value(end.timestamp.wrapping_sub(begin.timestamp))
            }
            QueryKind::Timestamp => QueryResult::Value(long()?.0.timestamp),
            QueryKind::GpuFinished => QueryResult::Predicate(true),
            QueryKind::TimestampDisjoint => QueryResult::Disjoint {
                frequency: TIMESTAMP_FREQUENCY,
                disjoint: false,
            },
        })
    }
}

// =============================================================================
// RENDER CONDITION
// =============================================================================

/// How a render condition treats an unfinished query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderConditionMode {
    /// Wait for the result
    Wait,
    /// Render if the result is unknown
    NoWait,
    /// Wait, per region
    ByRegionWait,
    /// Do not wait, per region
    ByRegionNoWait,
}

impl RenderConditionMode {
    /// Waits for the query
    pub const fn waits(self) -> bool {
        matches!(self, Self::Wait | Self::ByRegionWait)
    }
}

/// Predicate both pipelines execute under
#[derive(Debug, Clone)]
pub(crate) struct ConditionState {
    pub mode: CondMode,
    pub addr: Option<GpuAddr>,
    /// Slice holding the compared reports
    pub report: Option<ResourceRef>,
}

impl ConditionState {
    const fn fixed(mode: CondMode) -> Self {
        Self {
            mode,
            addr: None,
            report: None,
        }
    }
}

impl Default for ConditionState {
    fn default() -> Self {
        Self::fixed(CondMode::Always)
    }
}

// =============================================================================
// CONTEXT OPERATIONS
// =============================================================================

impl Context {
    /// Start measuring
    pub fn begin_query(&mut self, query: &mut Query) -> Result<()> {
        self.check_device()?;
        if query.state == QueryState::Active || !query.kind.has_begin() {
            return Err(Error::InvalidState);
        }
        if query.kind == QueryKind::TimestampDisjoint {
            query.result = None;
            query.state = QueryState::Active;
            return Ok(());
        }

        query.next_cycle(&self.screen)?;
        let slice = query.slice()?.clone();
        let addr = slice.gpu_addr() + query.slot_offset() + BEGIN_OFFSET;
        if query.kind.is_occlusion() {
            query.nested = self.active_occlusion > 0;
            if query.nested {
                let report = Record::Report {
                    pipeline: Pipeline::Render,
                    addr,
                    sequence: query.sequence,
                    kind: ReportKind::SampleCount,
                    format: ReportFormat::Short,
                };
                self.push.push_ref(report, &slice, Access::WRITE)?;
            } else {
                // The begin value stays the zero written above.
                self.push.push(Record::ResetCounter {
                    kind: ReportKind::SampleCount,
                })?;
                self.push.push(Record::SampleCounting { enable: true })?;
                self.push.reference(&slice, Access::WRITE);
            }
            self.active_occlusion += 1;
        } else {
            let report = Record::Report {
                pipeline: Pipeline::Render,
                addr,
                sequence: query.sequence,
                kind: query.kind.counter(),
                format: query.kind.format(),
            };
            self.push.push_ref(report, &slice, Access::WRITE)?;
        }
        query.state = QueryState::Active;
        Ok(())
    }

    /// Stop measuring
    pub fn end_query(&mut self, query: &mut Query) -> Result<()> {
        self.check_device()?;
        if query.kind == QueryKind::TimestampDisjoint {
            if query.state != QueryState::Active {
                return Err(Error::InvalidState);
            }
            query.result = Some(QueryResult::Disjoint {
                frequency: TIMESTAMP_FREQUENCY,
                disjoint: false,
            });
            query.state = QueryState::Ended;
            return Ok(());
        }
        if query.state != QueryState::Active {
            if query.kind.has_begin() {
                return Err(Error::InvalidState);
            }
            query.next_cycle(&self.screen)?;
        }

        let slice = query.slice()?.clone();
        let report = Record::Report {
            pipeline: Pipeline::Render,
            addr: slice.gpu_addr() + query.slot_offset() + END_OFFSET,
            sequence: query.sequence,
            kind: query.kind.counter(),
            format: query.kind.format(),
        };
        self.push.push_ref(report, &slice, Access::WRITE)?;
        if query.kind.fence_proven() {
            query.fence = Some(self.push.current_fence().clone());
        }
        if query.kind.is_occlusion() {
            self.active_occlusion = self.active_occlusion.saturating_sub(1);
            if self.active_occlusion == 0 {
                self.push.push(Record::SampleCounting { enable: false })?;
            }
        }
        query.state = QueryState::Ended;
        Ok(())
    }

    /// Fetch the result of the last cycle
    ///
    /// Without `wait`, the first poll of an unfinished query submits the
    /// pending work so that a later poll can succeed.
    pub fn get_query_result(&mut self, query: &mut Query, wait: bool) -> Result<QueryResult> {
        match query.state {
            QueryState::Active => return Err(Error::InvalidState),
            QueryState::Ready => return query.result.ok_or(Error::InvalidState),
            QueryState::Ended | QueryState::Flushed => {}
        }
        if let Some(result) = query.result {
            query.state = QueryState::Ready;
            return Ok(result);
        }

        if !query.is_complete()? {
            if !wait {
                if query.state == QueryState::Ended {
                    self.flush()?;
                    query.state = QueryState::Flushed;
                }
                return Ok(QueryResult::NotReady);
            }
            match query.fence.clone() {
                Some(fence) => self.wait_fence(&fence)?,
                None => {
                    let timeout = self.screen.config().fence_timeout;
                    let result = query.slice()?.wait(Access::WRITE, &mut self.push, timeout);
                    self.lost_on_fatal(result)?;
                }
            }
            if !query.is_complete()? {
                log::warn!(
                    "{:?} query: fence passed but report {} never landed",
                    query.kind,
                    query.sequence
                );
                return Err(Error::InvalidState);
            }
        }

        let result = query.read_result()?;
        query.result = Some(result);
        query.state = QueryState::Ready;
        Ok(result)
    }

    /// Predicate subsequent draws and dispatches on `query`
    ///
    /// `None` removes the predicate. With `condition` set, work executes when
    /// the query found nothing.
    pub fn render_condition(
        &mut self,
        query: Option<&Query>,
        condition: bool,
        mode: RenderConditionMode,
    ) -> Result<()> {
        self.check_device()?;
        let state = match query {
            None => ConditionState::default(),
            Some(query) => self.condition_for(query, condition, mode.waits())?,
        };
        log::trace!("render condition {:?}", state.mode);
        self.condition = state;
        self.render.dirty.mark(RenderDirty::CONDITION);
        self.compute.dirty.mark(ComputeDirty::CONDITION);
        Ok(())
    }

    fn condition_for(&mut self, query: &Query, condition: bool, wait: bool) -> Result<ConditionState> {
        if let Some(result) = query.result {
            let passed = match result {
                QueryResult::Value(v) => v != 0,
                QueryResult::Predicate(p) => p,
                QueryResult::NotReady | QueryResult::Disjoint { .. } => true,
            };
            let mode = if passed != condition {
                CondMode::Always
            } else {
                CondMode::Never
            };
            return Ok(ConditionState::fixed(mode));
        }
        if !query.kind.is_occlusion() {
            log::warn!("{:?} query cannot predicate rendering", query.kind);
            return Ok(ConditionState::default());
        }

        let mode = match (condition, query.nested, wait) {
            (false, false, _) => CondMode::ResNonZero,
            (false, true, true) => CondMode::NotEqual,
            (true, _, true) => CondMode::Equal,
            (false, true, false) | (true, _, false) => CondMode::Always,
        };
        if mode == CondMode::Always {
            return Ok(ConditionState::default());
        }

        let slice = query.slice()?.clone();
        let addr = query.report_addr().ok_or(Error::InvalidState)?;
        if wait {
            let acquire = Record::SemaphoreAcquire {
                addr,
                value: query.sequence,
            };
            self.push.push_ref(acquire, &slice, Access::READ)?;
        }
        Ok(ConditionState {
            mode,
            addr: Some(addr),
            report: Some(slice),
        })
    }
}
