use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};

/// Split timer for the phases of one collection.
#[derive(Debug, Clone, Default)]
pub struct TimingLogger {
    name: String,
    splits: Vec<(&'static str, Duration)>,
    current: Option<(&'static str, Instant)>,
}

impl TimingLogger {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ends the running split, if any, and starts `label`.
    pub fn new_split(&mut self, label: &'static str) {
        self.end_split();
        self.current = Some((label, Instant::now()));
    }

    pub fn end_split(&mut self) {
        if let Some((label, start)) = self.current.take() {
            self.splits.push((label, start.elapsed()));
        }
    }

    pub fn splits(&self) -> &[(&'static str, Duration)] {
        &self.splits
    }

    pub fn total(&self) -> Duration {
        self.splits.iter().map(|(_, duration)| *duration).sum()
    }

    pub fn dump(&self) -> String {
        let mut out = format!("{} [Exclusive time] [Total time]\n", self.name);
        for (label, duration) in &self.splits {
            out.push_str(&format!("  {} {label}\n", pretty_duration(*duration)));
        }
        out.push_str(&format!("{}: end, {}\n", self.name, pretty_duration(self.total())));
        out
    }
}

/// Per-label totals over many collections.
#[derive(Debug, Default)]
pub struct CumulativeTimings {
    totals: BTreeMap<&'static str, (u64, Duration)>,
    iterations: u64,
}

impl CumulativeTimings {
    pub fn add(&mut self, logger: &TimingLogger) {
        self.iterations += 1;
        for &(label, duration) in logger.splits() {
            let entry = self.totals.entry(label).or_default();
            entry.0 += 1;
            entry.1 += duration;
        }
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn total(&self, label: &str) -> Option<Duration> {
        self.totals.get(label).map(|(_, total)| *total)
    }

    pub fn dump(&self, name: &str) -> String {
        let mut out = format!("{name}: {} iterations\n", self.iterations);
        let mut rows: Vec<_> = self.totals.iter().collect();
        rows.sort_by(|a, b| b.1.1.cmp(&a.1.1));
        for (label, (count, total)) in rows {
            let mean = *total / (*count).max(1) as u32;
            out.push_str(&format!(
                "  {label}: Sum: {} Avg: {}\n",
                pretty_duration(*total),
                pretty_duration(mean)
            ));
        }
        out
    }
}

pub fn pretty_duration(duration: Duration) -> String {
    let nanos = duration.as_nanos();
    if nanos >= 1_000_000_000 {
        format!("{:.3}s", duration.as_secs_f64())
    } else if nanos >= 1_000_000 {
        format!("{:.3}ms", nanos as f64 / 1e6)
    } else if nanos >= 1_000 {
        format!("{:.3}us", nanos as f64 / 1e3)
    } else {
        format!("{nanos}ns")
    }
}

pub fn pretty_size(bytes: i64) -> String {
    let magnitude = bytes.unsigned_abs();
    let sign = if bytes < 0 { "-" } else { "" };
    if magnitude >= 1 << 30 {
        format!("{sign}{}GB", magnitude >> 30)
    } else if magnitude >= 1 << 20 {
        format!("{sign}{}MB", magnitude >> 20)
    } else if magnitude >= 1 << 10 {
        format!("{sign}{}KB", magnitude >> 10)
    } else {
        format!("{sign}{magnitude}B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_end_each_other() {
        let mut timings = TimingLogger::new("mark sweep");
        timings.new_split("MarkRoots");
        timings.new_split("RecursiveMark");
        timings.end_split();
        timings.end_split();
        let labels: Vec<_> = timings.splits().iter().map(|(label, _)| *label).collect();
        assert_eq!(labels, vec!["MarkRoots", "RecursiveMark"]);
        assert!(timings.dump().contains("RecursiveMark"));
    }

    #[test]
    fn test_cumulative_totals() {
        let mut first = TimingLogger::new("semispace");
        first.new_split("Copy");
        first.end_split();
        let mut cumulative = CumulativeTimings::default();
        cumulative.add(&first);
        cumulative.add(&first);
        assert_eq!(cumulative.iterations(), 2);
        assert_eq!(cumulative.total("Copy"), Some(first.total() * 2));
        assert_eq!(cumulative.total("Sweep"), None);
    }

    #[test]
    fn test_pretty_formatting() {
        assert_eq!(pretty_size(512), "512B");
        assert_eq!(pretty_size(3 << 20), "3MB");
        assert_eq!(pretty_size(-2048), "-2KB");
        assert_eq!(pretty_duration(Duration::from_nanos(12)), "12ns");
        assert_eq!(pretty_duration(Duration::from_millis(5)), "5.000ms");
    }
}
