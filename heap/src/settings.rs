use std::{env, str::FromStr, time::Duration};

use bitflags::bitflags;

use crate::{OS_PAGE_SIZE, collector::CollectorType};

bitflags! {
    /// Heap verification passes run around collections.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VerifyFlags: u16 {
        const PRE_GC_HEAP = 1 << 0;
        const PRE_SWEEPING_HEAP = 1 << 1;
        const POST_GC_HEAP = 1 << 2;
        const PRE_GC_ROSALLOC = 1 << 3;
        const POST_GC_ROSALLOC = 1 << 4;
        const MISSING_CARD_MARKS = 1 << 5;
        const MOD_UNION_TABLES = 1 << 6;
    }
}

// ── Heap settings ─────────────────────────────────────────────────────

/// Configuration for the managed heap.
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Footprint the main space starts out with.
    pub initial_size: usize,
    /// Soft maximum of the heap. Can be lifted up to `capacity` with
    /// `Heap::clear_growth_limit`.
    pub growth_limit: usize,
    /// Reserved size of the main malloc space.
    pub capacity: usize,
    /// Reserved size of the non-moving space used next to compacting
    /// collectors, and of the post-zygote non-moving space.
    pub non_moving_capacity: usize,
    /// Upper bound for each bump pointer space (the real size is the
    /// smaller of this and `capacity`).
    pub bump_pointer_capacity: usize,
    /// Reserved size of the image space.
    pub image_capacity: usize,
    /// Reserved size of the region space, `0` disables it.
    pub region_capacity: usize,
    /// Size of one region. Must be a multiple of the OS page size.
    pub region_size: usize,
    /// Smallest amount of free memory kept available after a GC.
    pub min_free: usize,
    /// Largest amount of free memory kept available after a GC.
    pub max_free: usize,
    /// Ratio of live bytes to footprint the heap grows towards (0.0 - 1.0).
    pub target_utilization: f64,
    /// Collector used while the process is jank perceptible, and after the
    /// zygote fork.
    pub foreground_collector: CollectorType,
    /// Collector used while the process is in the background.
    pub background_collector: CollectorType,
    /// Whether the heap starts in zygote mode and waits for
    /// `pre_zygote_fork`.
    pub is_zygote: bool,
    /// Use thread-local allocation buffers in bump pointer spaces.
    pub use_tlab: bool,
    /// Use RosAlloc for the main space, DlMalloc otherwise.
    pub use_rosalloc: bool,
    /// Worker threads used while marking in a pause.
    pub parallel_gc_threads: usize,
    /// Worker threads used while marking concurrently.
    pub conc_gc_threads: usize,
    /// Trim RosAlloc runs eagerly.
    pub low_memory_mode: bool,
    /// Pauses longer than this get logged.
    pub long_pause_log_threshold: Duration,
    /// Collections longer than this get logged.
    pub long_gc_log_threshold: Duration,
    /// Never shrink or cap the footprint after a GC.
    pub ignore_max_footprint: bool,
    pub verify: VerifyFlags,
    /// Entries in each of the allocation and live stacks.
    pub allocation_stack_size: usize,
    /// Initial entries reserved for the mark stack.
    pub mark_stack_size: usize,
    /// Allocations of at least this many bytes go to the large object
    /// space, when their class allows it.
    pub large_object_threshold: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_size: 4 * 1024 * 1024,          // 4 MB
            growth_limit: 64 * 1024 * 1024,         // 64 MB
            capacity: 64 * 1024 * 1024,             // 64 MB
            non_moving_capacity: 16 * 1024 * 1024,  // 16 MB
            bump_pointer_capacity: 128 * 1024 * 1024, // 128 MB
            image_capacity: 4 * 1024 * 1024,        // 4 MB
            region_capacity: 0,
            region_size: 256 * 1024, // 256 KB
            min_free: 512 * 1024,    // 512 KB
            max_free: 2 * 1024 * 1024, // 2 MB
            target_utilization: 0.5, // 50%
            foreground_collector: CollectorType::Cms,
            background_collector: CollectorType::Ss,
            is_zygote: false,
            use_tlab: true,
            use_rosalloc: true,
            parallel_gc_threads: 1,
            conc_gc_threads: 1,
            low_memory_mode: false,
            long_pause_log_threshold: Duration::from_millis(5),
            long_gc_log_threshold: Duration::from_millis(100),
            ignore_max_footprint: false,
            verify: VerifyFlags::empty(),
            allocation_stack_size: 64 * 1024, // 64 K entries
            mark_stack_size: 8 * 1024,        // 8 K entries
            large_object_threshold: 3 * OS_PAGE_SIZE, // 12 KB
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_size == 0 || self.growth_limit == 0 || self.capacity == 0 {
            return Err("Sizes must be > 0");
        }
        if self.initial_size > self.growth_limit {
            return Err("initial_size must not exceed growth_limit");
        }
        if self.growth_limit > self.capacity {
            return Err("growth_limit must not exceed capacity");
        }
        if !self.capacity.is_multiple_of(OS_PAGE_SIZE)
            || !self.non_moving_capacity.is_multiple_of(OS_PAGE_SIZE)
            || !self.bump_pointer_capacity.is_multiple_of(OS_PAGE_SIZE)
            || !self.image_capacity.is_multiple_of(OS_PAGE_SIZE)
        {
            return Err("space capacities must match OS page alignment");
        }
        if self.non_moving_capacity == 0 || self.bump_pointer_capacity == 0 {
            return Err("non_moving_capacity and bump_pointer_capacity must be > 0");
        }
        if self.region_size == 0 || !self.region_size.is_multiple_of(OS_PAGE_SIZE) {
            return Err("region_size must be a multiple of the OS page size");
        }
        if !self.region_capacity.is_multiple_of(self.region_size) {
            return Err("region_capacity must be a multiple of region_size");
        }
        if !(self.target_utilization > 0.0 && self.target_utilization < 1.0) {
            return Err("target_utilization must be between 0.0 and 1.0");
        }
        if self.min_free > self.max_free {
            return Err("min_free must not exceed max_free");
        }
        if self.foreground_collector == CollectorType::None
            || self.background_collector == CollectorType::None
        {
            return Err("collector types must name a collector");
        }
        // leaving the compacting family moves the main space into the
        // bump pointer space
        if self.foreground_collector.is_compacting() != self.background_collector.is_compacting()
            && self.bump_pointer_capacity < self.growth_limit
        {
            return Err("bump_pointer_capacity must hold growth_limit when collector families mix");
        }
        if self.parallel_gc_threads == 0 || self.conc_gc_threads == 0 {
            return Err("gc thread counts must be > 0");
        }
        if self.allocation_stack_size == 0 || self.mark_stack_size == 0 {
            return Err("stack sizes must be > 0");
        }
        if self.large_object_threshold < OS_PAGE_SIZE {
            return Err("large_object_threshold must be at least one page");
        }
        Ok(())
    }

    /// Default settings overridden by `HEAP_*` environment variables.
    ///
    /// Sizes accept `k`, `m` and `g` suffixes, collectors use their short
    /// names (`MS`, `CMS`, `SS`, `GSS`).
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        let size = |key: &str, target: &mut usize| {
            if let Some(value) = env::var(key).ok().and_then(|v| parse_size(&v)) {
                *target = value;
            }
        };
        size("HEAP_INITIAL_SIZE", &mut settings.initial_size);
        size("HEAP_GROWTH_LIMIT", &mut settings.growth_limit);
        size("HEAP_CAPACITY", &mut settings.capacity);
        size("HEAP_NON_MOVING_CAPACITY", &mut settings.non_moving_capacity);
        size("HEAP_MIN_FREE", &mut settings.min_free);
        size("HEAP_MAX_FREE", &mut settings.max_free);
        size("HEAP_REGION_CAPACITY", &mut settings.region_capacity);
        if let Some(value) = env::var("HEAP_TARGET_UTILIZATION")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            settings.target_utilization = value;
        }
        if let Some(value) = env::var("HEAP_FOREGROUND_COLLECTOR")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            settings.foreground_collector = value;
        }
        if let Some(value) = env::var("HEAP_BACKGROUND_COLLECTOR")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            settings.background_collector = value;
        }
        if let Ok(value) = env::var("HEAP_VERIFY") {
            settings.verify = parse_verify_flags(&value);
        }
        settings
    }
}

/// Parses `"512"`, `"64k"`, `"16m"` or `"1g"` into bytes.
pub fn parse_size(text: &str) -> Option<usize> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last()? {
        (i, 'k' | 'K') => (&text[..i], 1024),
        (i, 'm' | 'M') => (&text[..i], 1024 * 1024),
        (i, 'g' | 'G') => (&text[..i], 1024 * 1024 * 1024),
        _ => (text, 1),
    };
    usize::from_str(digits).ok()?.checked_mul(multiplier)
}

/// Comma separated verification pass names, e.g. `"pre_gc,post_gc,cards"`.
pub fn parse_verify_flags(text: &str) -> VerifyFlags {
    let mut flags = VerifyFlags::empty();
    for name in text.split(',').map(str::trim) {
        flags |= match name {
            "pre_gc" => VerifyFlags::PRE_GC_HEAP,
            "pre_sweeping" => VerifyFlags::PRE_SWEEPING_HEAP,
            "post_gc" => VerifyFlags::POST_GC_HEAP,
            "pre_gc_rosalloc" => VerifyFlags::PRE_GC_ROSALLOC,
            "post_gc_rosalloc" => VerifyFlags::POST_GC_ROSALLOC,
            "cards" => VerifyFlags::MISSING_CARD_MARKS,
            "mod_union" => VerifyFlags::MOD_UNION_TABLES,
            "all" => VerifyFlags::all(),
            _ => {
                log::warn!(target: "heap", "unknown verification pass {name:?}");
                VerifyFlags::empty()
            }
        };
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_valid() {
        assert_eq!(HeapSettings::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_limits() {
        let settings = HeapSettings {
            initial_size: 128 * 1024 * 1024,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            target_utilization: 1.5,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());

        let settings = HeapSettings {
            min_free: 4 * 1024 * 1024,
            max_free: 1024 * 1024,
            ..HeapSettings::default()
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_mixed_families_need_a_bump_space_for_the_growth_limit() {
        let small_bump = HeapSettings {
            foreground_collector: CollectorType::Ms,
            background_collector: CollectorType::Ss,
            bump_pointer_capacity: 16 * 1024 * 1024,
            ..HeapSettings::default()
        };
        assert_eq!(
            small_bump.validate(),
            Err("bump_pointer_capacity must hold growth_limit when collector families mix")
        );

        let compacting_only = HeapSettings {
            foreground_collector: CollectorType::Ss,
            ..small_bump.clone()
        };
        assert_eq!(compacting_only.validate(), Ok(()), "nothing leaves the bump space");
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("512"), Some(512));
        assert_eq!(parse_size("64k"), Some(64 * 1024));
        assert_eq!(parse_size("16M"), Some(16 * 1024 * 1024));
        assert_eq!(parse_size("1g"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("m"), None);
        assert_eq!(parse_size("ten"), None);
    }

    #[test]
    fn test_parse_verify_flags() {
        let flags = parse_verify_flags("pre_gc, cards,bogus");
        assert!(flags.contains(VerifyFlags::PRE_GC_HEAP));
        assert!(flags.contains(VerifyFlags::MISSING_CARD_MARKS));
        assert!(!flags.contains(VerifyFlags::POST_GC_HEAP));
        assert_eq!(parse_verify_flags("all"), VerifyFlags::all());
    }
}
