use chrono::Utc;

use crate::Map;
use crate::classad::{ATTR_DAEMON_START, ATTR_MY_TYPE, ATTR_NAME, ATTR_SEQUENCE, ClassAd};

/// Per-process counters of emitted ads.
///
/// Every emission of an ad with a given (`MyType`, `Name`) gets the next number, starting
/// at 1. The pair (`DaemonStartTime`, `UpdateSequenceNumber`) lets a consumer order updates
/// even across restarts of the publisher.
pub struct SequenceCounter {
    start_time: i64,
    counters: Map<(String, String), u64>,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new(Utc::now().timestamp())
    }
}

impl SequenceCounter {
    pub fn new(start_time: i64) -> Self {
        SequenceCounter {
            start_time,
            counters: Map::default(),
        }
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    pub fn next(&mut self, my_type: &str, name: &str) -> u64 {
        let counter = self
            .counters
            .entry((my_type.to_string(), name.to_string()))
            .or_insert(0);
        *counter += 1;
        *counter
    }

    pub fn stamp(&mut self, ad: &mut ClassAd) {
        let my_type = ad.get_str(ATTR_MY_TYPE).unwrap_or_default().to_string();
        let name = ad.get_str(ATTR_NAME).unwrap_or_default().to_string();
        let seq = self.next(&my_type, &name);
        ad.insert(ATTR_SEQUENCE, seq);
        ad.insert(ATTR_DAEMON_START, self.start_time);
    }

    pub fn stamp_all(&mut self, ads: &mut [ClassAd]) {
        for ad in ads {
            self.stamp(ad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classad::AdType;

    #[test]
    fn sequence_is_strictly_increasing_per_name() {
        let mut counter = SequenceCounter::new(100);
        let mut last = 0;
        for _ in 0..20 {
            let mut ad = ClassAd::new(AdType::Factory, "entry_a");
            counter.stamp(&mut ad);
            let seq = ad.get_int(ATTR_SEQUENCE).unwrap();
            assert!(seq > last);
            last = seq;
            assert_eq!(ad.get_int(ATTR_DAEMON_START), Some(100));
        }
        assert_eq!(last, 20);
    }

    #[test]
    fn sequences_are_independent() {
        let mut counter = SequenceCounter::new(0);
        assert_eq!(counter.next("glidefactory", "a"), 1);
        assert_eq!(counter.next("glidefactory", "a"), 2);
        assert_eq!(counter.next("glidefactory", "b"), 1);
        assert_eq!(counter.next("glidefactoryclient", "a"), 1);
    }
}
