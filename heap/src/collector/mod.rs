//! Garbage collectors and the vocabulary shared by all of them.
//!
//! A collector instance lives for a single run. The heap picks the
//! collector from its current [`CollectorType`] and the requested
//! [`GcType`], runs it with every lock it needs, and folds the resulting
//! [`Iteration`] into the cumulative [`CollectorStats`].

pub mod mark_sweep;
pub mod semi_space;
pub mod timing;

use std::{fmt, str::FromStr, time::Duration};

pub use mark_sweep::{MarkSweep, MarkSweepKind};
pub use semi_space::{SemiSpace, SemiSpaceMode};
pub use timing::{CumulativeTimings, TimingLogger};

use crate::{reference_queue::ReferenceStats, space::SpaceId};

// ── Collector and GC types ────────────────────────────────────────────

/// Collector families the heap can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum CollectorType {
    /// No collector, used while nothing is running.
    None = 0,
    /// Non-concurrent mark-sweep.
    Ms = 1,
    /// Mark-sweep with concurrent marking and sweeping.
    Cms = 2,
    /// Semi-space, copies every reachable movable object.
    Ss = 3,
    /// Generational semi-space, promotes survivors to the main space.
    Gss = 4,
    /// Marks the heap as busy while it is being trimmed.
    HeapTrim = 5,
    /// Keeps collections out while the heap is walked or its spaces change.
    CriticalSection = 6,
}

impl CollectorType {
    pub fn is_compacting(self) -> bool {
        matches!(self, CollectorType::Ss | CollectorType::Gss)
    }

    pub fn is_concurrent(self) -> bool {
        matches!(self, CollectorType::Cms)
    }

    pub fn name(self) -> &'static str {
        match self {
            CollectorType::None => "none",
            CollectorType::Ms => "MS",
            CollectorType::Cms => "CMS",
            CollectorType::Ss => "SS",
            CollectorType::Gss => "GSS",
            CollectorType::HeapTrim => "HeapTrim",
            CollectorType::CriticalSection => "CriticalSection",
        }
    }
}

impl From<u8> for CollectorType {
    fn from(value: u8) -> Self {
        match value {
            1 => CollectorType::Ms,
            2 => CollectorType::Cms,
            3 => CollectorType::Ss,
            4 => CollectorType::Gss,
            5 => CollectorType::HeapTrim,
            6 => CollectorType::CriticalSection,
            _ => CollectorType::None,
        }
    }
}

impl FromStr for CollectorType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MS" => Ok(CollectorType::Ms),
            "CMS" => Ok(CollectorType::Cms),
            "SS" => Ok(CollectorType::Ss),
            "GSS" => Ok(CollectorType::Gss),
            other => Err(format!("unknown collector type {other:?}")),
        }
    }
}

impl fmt::Display for CollectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// How much of the heap a collection covers. Ordered from the cheapest
/// to the most thorough.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum GcType {
    /// No collection ran.
    #[default]
    None,
    /// Only objects allocated since the last collection.
    Sticky,
    /// Everything except the image and zygote spaces.
    Partial,
    /// Everything except the image space.
    Full,
}

impl fmt::Display for GcType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcType::None => "none",
            GcType::Sticky => "sticky",
            GcType::Partial => "partial",
            GcType::Full => "full",
        })
    }
}

/// Why a collection was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// An allocation failed.
    ForAlloc,
    /// Concurrent collection requested by the allocation rate.
    Background,
    /// Requested through the heap API.
    Explicit,
    /// Native allocations passed their watermark.
    NativeAlloc,
    /// Objects were moved between spaces for a collector transition.
    CollectorTransition,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GcCause::ForAlloc => "Alloc",
            GcCause::Background => "Background",
            GcCause::Explicit => "Explicit",
            GcCause::NativeAlloc => "NativeAlloc",
            GcCause::CollectorTransition => "CollectorTransition",
        })
    }
}

// ── Runs ──────────────────────────────────────────────────────────────

/// One run of one collector.
pub enum Collector {
    MarkSweep(MarkSweep),
    SemiSpace(SemiSpace),
}

impl Collector {
    /// Collector the heap runs for a `gc_type` collection with
    /// `collector_type` installed. Compacting collectors evacuate `from`
    /// into `to`. `None` when the mark-sweep family has no collector for
    /// `gc_type`.
    pub fn new(
        collector_type: CollectorType,
        gc_type: GcType,
        from: SpaceId,
        to: SpaceId,
    ) -> Option<Self> {
        if collector_type.is_compacting() {
            let mode = if collector_type == CollectorType::Gss {
                SemiSpaceMode::Generational
            } else {
                SemiSpaceMode::Normal
            };
            return Some(Collector::SemiSpace(SemiSpace::new(mode, vec![from], to)));
        }
        MarkSweep::for_gc_type(gc_type, collector_type.is_concurrent()).map(Collector::MarkSweep)
    }

    pub fn name(&self) -> String {
        match self {
            Collector::MarkSweep(ms) => ms.name(),
            Collector::SemiSpace(ss) => ss.name().to_string(),
        }
    }
}

/// What a single collection did.
#[derive(Debug, Clone)]
pub struct Iteration {
    pub gc_type: GcType,
    pub cause: GcCause,
    pub clear_soft: bool,
    /// Negative when promotion took more room than the evacuation freed.
    pub freed_objects: i64,
    pub freed_bytes: i64,
    pub freed_large_objects: usize,
    pub freed_large_object_bytes: usize,
    pub pauses: Vec<Duration>,
    pub duration: Duration,
    pub timings: TimingLogger,
    pub references: ReferenceStats,
}

impl Iteration {
    pub fn new(name: &str, gc_type: GcType, cause: GcCause, clear_soft: bool) -> Self {
        Self {
            gc_type,
            cause,
            clear_soft,
            freed_objects: 0,
            freed_bytes: 0,
            freed_large_objects: 0,
            freed_large_object_bytes: 0,
            pauses: Vec::new(),
            duration: Duration::ZERO,
            timings: TimingLogger::new(name),
            references: ReferenceStats::default(),
        }
    }

    /// Freed bytes over every space, large objects included.
    pub fn total_freed_bytes(&self) -> i64 {
        self.freed_bytes + self.freed_large_object_bytes as i64
    }

    pub fn total_freed_objects(&self) -> i64 {
        self.freed_objects + self.freed_large_objects as i64
    }

    pub fn total_pause(&self) -> Duration {
        self.pauses.iter().sum()
    }

    pub(crate) fn record_free(&mut self, objects: usize, bytes: usize) {
        self.freed_objects += objects as i64;
        self.freed_bytes += bytes as i64;
    }

    pub(crate) fn record_free_large(&mut self, objects: usize, bytes: usize) {
        self.freed_large_objects += objects;
        self.freed_large_object_bytes += bytes;
    }
}

/// Totals of every run of one named collector.
#[derive(Debug, Default)]
pub struct CollectorStats {
    pub iterations: u64,
    pub total_duration: Duration,
    pub total_paused: Duration,
    pub freed_objects: i64,
    pub freed_bytes: i64,
    pub timings: CumulativeTimings,
}

impl CollectorStats {
    pub fn record(&mut self, iteration: &Iteration) {
        self.iterations += 1;
        self.total_duration += iteration.duration;
        self.total_paused += iteration.total_pause();
        self.freed_objects += iteration.total_freed_objects();
        self.freed_bytes += iteration.total_freed_bytes();
        self.timings.add(&iteration.timings);
    }

    pub fn dump(&self, name: &str) -> String {
        let seconds = self.total_duration.as_secs_f64();
        let (objects_per_second, bytes_per_second) = if seconds > 0.0 {
            (
                self.freed_objects as f64 / seconds,
                self.freed_bytes as f64 / seconds,
            )
        } else {
            (0.0, 0.0)
        };
        let mut out = self.timings.dump(name);
        out.push_str(&format!(
            "{name} total time: {}\n",
            timing::pretty_duration(self.total_duration)
        ));
        out.push_str(&format!(
            "{name} freed: {} objects with total size {}\n",
            self.freed_objects,
            timing::pretty_size(self.freed_bytes)
        ));
        out.push_str(&format!(
            "{name} throughput: {objects_per_second:.0}/s / {}/s\n",
            timing::pretty_size(bytes_per_second as i64)
        ));
        out
    }
}
