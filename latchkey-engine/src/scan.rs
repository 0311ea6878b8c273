//! Scan Aggregator - merges streamed network reports into one ranked list

use std::cmp::Reverse;

use serde::Serialize;
use tracing::debug;

use latchkey_proto::NetworkReport;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkObservation {
    pub ssid: String,
    /// Higher is stronger; `None` ranks below every measured value
    pub signal_strength: Option<i32>,
}

#[derive(Debug)]
struct Entry {
    network: NetworkObservation,
    first_seen: u64,
}

/// Deduplicated networks of the current scan, strongest first.
///
/// Equal strengths keep first-observed order. Results that arrive after
/// [`finish`](Self::finish) are still merged.
#[derive(Debug, Default)]
pub struct ScanAggregator {
    entries: Vec<Entry>,
    next_seq: u64,
    finished: bool,
}

impl ScanAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new scan, forgetting previous results
    pub fn begin(&mut self) {
        self.clear();
    }

    /// Merge one batch; returns how many entries were added or strengthened
    pub fn merge(&mut self, reports: &[NetworkReport]) -> usize {
        let mut changed = 0;

        for report in reports {
            if report.ssid.is_empty() {
                continue;
            }
            match self.entries.iter_mut().find(|e| e.network.ssid == report.ssid) {
                Some(entry) => {
                    if report.rssi > entry.network.signal_strength {
                        entry.network.signal_strength = report.rssi;
                        changed += 1;
                    }
                }
                None => {
                    self.entries.push(Entry {
                        network: NetworkObservation {
                            ssid: report.ssid.clone(),
                            signal_strength: report.rssi,
                        },
                        first_seen: self.next_seq,
                    });
                    self.next_seq += 1;
                    changed += 1;
                }
            }
        }

        self.entries
            .sort_by_key(|e| (Reverse(e.network.signal_strength), e.first_seen));

        if self.finished && changed > 0 {
            debug!(changed, "merged scan results after scan finished");
        }
        changed
    }

    /// Freeze the list for presentation
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.next_seq = 0;
        self.finished = false;
    }

    pub fn contains(&self, ssid: &str) -> bool {
        self.entries.iter().any(|e| e.network.ssid == ssid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn networks(&self) -> Vec<NetworkObservation> {
        self.entries.iter().map(|e| e.network.clone()).collect()
    }
}
