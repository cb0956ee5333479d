use std::{
    collections::HashMap,
    fs::OpenOptions,
    io::{self, Write},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::bitonic::Phase;
use crate::comm::Tag;
use crate::exchange::ExchangeStats;

/// Time spent in one phase of the sort on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    /// Recursion depth of the group the phase ran in (0 = the caller's group)
    pub depth: usize,
    /// Size of the group the phase ran in
    pub group_size: usize,
    pub duration_ms: f64,
    /// Unix timestamp when the phase finished
    pub timestamp: u64,
}

/// One exchange-and-merge as seen by the calling worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub tag: Tag,
    pub depth: usize,
    pub partner: usize,
    pub sent: usize,
    pub received: usize,
    pub kept: usize,
    /// Rendezvous plus merge, in milliseconds
    pub duration_ms: f64,
    pub timestamp: u64,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn tag_label(tag: &Tag) -> String {
    match tag {
        Tag::Network { stage, step } => format!("network-{}-{}", stage, step),
        Tag::MergeIncreasing => "merge-increasing".to_string(),
        Tag::Gather { seq } => format!("gather-{}", seq),
        Tag::Vote => "vote".to_string(),
        Tag::Shift => "shift".to_string(),
    }
}

/// Collects phase and exchange timings of one worker across sorts.
#[derive(Debug, Default, Clone)]
pub struct TimingTracker {
    phase_timings: Vec<PhaseRecord>,
    exchange_timings: Vec<ExchangeRecord>,
}

impl TimingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_phase(&mut self, phase: Phase, depth: usize, group_size: usize, duration: Duration) {
        self.phase_timings.push(PhaseRecord {
            phase,
            depth,
            group_size,
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: unix_now(),
        });
    }

    pub fn record_exchange(&mut self, tag: Tag, depth: usize, stats: ExchangeStats, duration: Duration) {
        self.exchange_timings.push(ExchangeRecord {
            tag,
            depth,
            partner: stats.partner,
            sent: stats.sent,
            received: stats.received,
            kept: stats.kept,
            duration_ms: duration.as_secs_f64() * 1000.0,
            timestamp: unix_now(),
        });
    }

    pub fn phases(&self) -> &[PhaseRecord] {
        &self.phase_timings
    }

    pub fn exchanges(&self) -> &[ExchangeRecord] {
        &self.exchange_timings
    }

    pub fn clear(&mut self) {
        self.phase_timings.clear();
        self.exchange_timings.clear();
    }

    pub fn write_phase_timings_to_csv(&self, filename: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(filename)?;

        writeln!(file, "phase,depth,group_size,duration_ms,timestamp")?;
        for record in &self.phase_timings {
            writeln!(
                file,
                "{},{},{},{:.3},{}",
                record.phase, record.depth, record.group_size, record.duration_ms, record.timestamp
            )?;
        }
        Ok(())
    }

    pub fn write_exchange_timings_to_csv(&self, filename: &str) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(filename)?;

        writeln!(
            file,
            "tag,depth,partner,sent,received,kept,duration_ms,timestamp"
        )?;
        for record in &self.exchange_timings {
            writeln!(
                file,
                "{},{},{},{},{},{},{:.3},{}",
                tag_label(&record.tag),
                record.depth,
                record.partner,
                record.sent,
                record.received,
                record.kept,
                record.duration_ms,
                record.timestamp
            )?;
        }
        Ok(())
    }

    /// `(average ms, max ms, count)` per phase.
    pub fn get_phase_statistics(&self) -> HashMap<String, (f64, f64, usize)> {
        let mut stats = HashMap::new();

        for record in &self.phase_timings {
            let entry = stats
                .entry(record.phase.to_string())
                .or_insert((0.0f64, 0.0f64, 0));
            entry.0 += record.duration_ms;
            entry.1 = entry.1.max(record.duration_ms);
            entry.2 += 1;
        }

        for (_, stats) in stats.iter_mut() {
            stats.0 /= stats.2 as f64;
        }

        stats
    }

    /// `(average ms, max ms, count)` per exchange kind.
    pub fn get_exchange_statistics(&self) -> HashMap<String, (f64, f64, usize)> {
        let mut stats = HashMap::new();

        for record in &self.exchange_timings {
            let key = match record.tag {
                Tag::Network { .. } => "network",
                Tag::MergeIncreasing => "merge-increasing",
                _ => "collective",
            };
            let entry = stats.entry(key.to_string()).or_insert((0.0f64, 0.0f64, 0));
            entry.0 += record.duration_ms;
            entry.1 = entry.1.max(record.duration_ms);
            entry.2 += 1;
        }

        for (_, stats) in stats.iter_mut() {
            stats.0 /= stats.2 as f64;
        }

        stats
    }

    /// Elements this worker shipped to partners, summed over all exchanges.
    pub fn elements_sent(&self) -> usize {
        self.exchange_timings.iter().map(|r| r.sent).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(partner: usize) -> ExchangeStats {
        ExchangeStats {
            partner,
            sent: 3,
            received: 2,
            kept: 3,
        }
    }

    #[test]
    fn test_statistics_average_and_max() {
        let mut tracker = TimingTracker::new();
        tracker.record_phase(Phase::LocalSort, 0, 4, Duration::from_millis(2));
        tracker.record_phase(Phase::LocalSort, 1, 2, Duration::from_millis(4));
        tracker.record_phase(Phase::BinaryNetwork, 0, 4, Duration::from_millis(10));
        let phase_stats = tracker.get_phase_statistics();
        let (avg, max, count) = phase_stats["local-sort"];
        assert!((avg - 3.0).abs() < 1e-9);
        assert!((max - 4.0).abs() < 1e-9);
        assert_eq!(count, 2);
        assert_eq!(phase_stats["binary-network"].2, 1);
    }

    #[test]
    fn test_exchange_statistics_group_by_kind() {
        let mut tracker = TimingTracker::new();
        tracker.record_exchange(Tag::Network { stage: 2, step: 1 }, 0, stats(1), Duration::from_millis(1));
        tracker.record_exchange(Tag::Network { stage: 4, step: 2 }, 0, stats(2), Duration::from_millis(3));
        tracker.record_exchange(Tag::MergeIncreasing, 0, stats(3), Duration::from_millis(5));
        let exchange_stats = tracker.get_exchange_statistics();
        assert_eq!(exchange_stats["network"].2, 2);
        assert_eq!(exchange_stats["merge-increasing"].2, 1);
        assert_eq!(tracker.elements_sent(), 9);
    }

    #[test]
    fn test_csv_export() {
        let mut tracker = TimingTracker::new();
        tracker.record_phase(Phase::FinalPass, 0, 3, Duration::from_millis(1));
        tracker.record_exchange(Tag::MergeIncreasing, 0, stats(2), Duration::from_millis(1));
        let dir = std::env::temp_dir();
        let phases = dir.join(format!("distsort_phases_{}.csv", std::process::id()));
        let exchanges = dir.join(format!("distsort_exchanges_{}.csv", std::process::id()));
        tracker
            .write_phase_timings_to_csv(phases.to_str().unwrap())
            .unwrap();
        tracker
            .write_exchange_timings_to_csv(exchanges.to_str().unwrap())
            .unwrap();
        let phase_csv = std::fs::read_to_string(&phases).unwrap();
        let exchange_csv = std::fs::read_to_string(&exchanges).unwrap();
        assert!(phase_csv.starts_with("phase,depth"));
        assert!(phase_csv.lines().nth(1).unwrap().starts_with("final-pass,0,3,"));
        assert!(exchange_csv.lines().nth(1).unwrap().starts_with("merge-increasing,0,2,3,2,3,"));
        let _ = std::fs::remove_file(phases);
        let _ = std::fs::remove_file(exchanges);
    }
}
