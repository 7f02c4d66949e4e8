use std::collections::{HashMap, HashSet};

use crate::engine::clash::ConnectionEntry;
use crate::split_tunnel::PROXY_OUTBOUND;
use crate::state::TrafficStats;

/// Proxy-only traffic accounting across engine-connection churn.
///
/// The engine reports cumulative counters per live connection and forgets a
/// connection the moment it closes. Departed connections are folded into the
/// closed accumulators so published totals never lose their contribution.
#[derive(Debug, Default)]
pub struct Accounting {
    closed_upload: u64,
    closed_download: u64,
    tracked: HashMap<String, (u64, u64)>,
    last_upload: u64,
    last_download: u64,
}

impl Accounting {
    pub fn reset(&mut self) {
        *self = Accounting::default();
    }

    /// Folds one `/connections` snapshot into the totals and returns the
    /// stats to publish. Speeds are first differences per poll tick, clamped
    /// to zero against non-monotonic control-plane responses.
    pub fn ingest(&mut self, connections: &[ConnectionEntry]) -> TrafficStats {
        let present: HashSet<&str> = connections.iter().map(|c| c.id.as_str()).collect();

        let mut folded_upload = 0;
        let mut folded_download = 0;
        self.tracked.retain(|id, (upload, download)| {
            if present.contains(id.as_str()) {
                true
            } else {
                folded_upload += *upload;
                folded_download += *download;
                false
            }
        });
        self.closed_upload += folded_upload;
        self.closed_download += folded_download;

        let mut active_upload = 0;
        let mut active_download = 0;
        for entry in connections.iter().filter(|c| proxy_chained(c)) {
            active_upload += entry.upload;
            active_download += entry.download;
            self.tracked.insert(entry.id.clone(), (entry.upload, entry.download));
        }

        let upload = self.closed_upload + active_upload;
        let download = self.closed_download + active_download;
        let stats = TrafficStats {
            upload,
            download,
            up_speed: upload.saturating_sub(self.last_upload),
            down_speed: download.saturating_sub(self.last_download),
        };
        self.last_upload = upload;
        self.last_download = download;
        stats
    }
}

fn proxy_chained(entry: &ConnectionEntry) -> bool {
    entry.chains.iter().any(|chain| chain == PROXY_OUTBOUND)
}
