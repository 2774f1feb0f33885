//! Folding raw samples into per-bucket aggregates and merging aggregates.
//!
//! Both paths apply the same take-minimum rule: an incoming RTT replaces the
//! stored one when it is lower or equal. A tie still replaces the timestamp,
//! so a site that keeps tying for best does not look stale.
use crate::bucket::AddressBucket;
use crate::metrics_defs::{SAMPLES_FOLDED, SAMPLES_INVALID_RTT, SAMPLES_UNKNOWN_SERVER};
use crate::registry::SiteRegistry;
use crate::types::{ClientGroup, RawSample, SiteId, SiteRtt};
use shared::counter;
use std::collections::{HashMap, HashSet};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    #[error("client groups of different buckets cannot be merged: {old} and {new}")]
    MismatchedBucket {
        old: AddressBucket,
        new: AddressBucket,
    },
    #[error("RTTs of different sites cannot be merged: {old} and {new}")]
    MismatchedSite { old: SiteId, new: SiteId },
}

/// Applies `new` onto `old` if its RTT is lower or equal. Reports whether
/// anything observable changed.
pub fn merge_site_rtt(old: &mut SiteRtt, new: &SiteRtt) -> Result<bool, MergeError> {
    if old.site_id != new.site_id {
        return Err(MergeError::MismatchedSite {
            old: old.site_id.clone(),
            new: new.site_id.clone(),
        });
    }
    if new.rtt > old.rtt || new.rtt.is_nan() {
        return Ok(false);
    }
    let changed = new.rtt < old.rtt || new.last_updated != old.last_updated;
    old.rtt = new.rtt;
    old.last_updated = new.last_updated;
    Ok(changed)
}

/// Merges `new` into `old` in place. `old` is untouched when the buckets differ.
pub fn merge_into(old: &mut ClientGroup, new: &ClientGroup) -> Result<bool, MergeError> {
    if old.bucket != new.bucket {
        return Err(MergeError::MismatchedBucket {
            old: old.bucket,
            new: new.bucket,
        });
    }

    let mut index: HashMap<SiteId, usize> = old
        .site_rtts
        .iter()
        .enumerate()
        .map(|(i, s)| (s.site_id.clone(), i))
        .collect();

    let mut changed = false;
    for incoming in &new.site_rtts {
        match index.get(&incoming.site_id) {
            Some(&i) => changed |= merge_site_rtt(&mut old.site_rtts[i], incoming)?,
            None => {
                index.insert(incoming.site_id.clone(), old.site_rtts.len());
                old.site_rtts.push(incoming.clone());
                changed = true;
            }
        }
    }

    // An unchanged, already ordered group is left exactly as it was, ties included.
    if changed || !old.is_sorted() {
        old.sort();
    }
    Ok(changed)
}

/// Merges freshly computed data into previously stored data, returning the
/// merged group and whether it differs from `old`.
pub fn merge_client_groups(
    old: &ClientGroup,
    new: &ClientGroup,
) -> Result<(ClientGroup, bool), MergeError> {
    let mut merged = old.clone();
    let changed = merge_into(&mut merged, new)?;
    Ok((merged, changed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOutcome {
    Created,
    Updated,
    Unchanged,
    UnknownServer,
    InvalidRtt,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FoldStats {
    pub folded: u64,
    pub unknown_server: u64,
    pub invalid_rtt: u64,
}

/// Builds the aggregate map for one ingestion run. Not meant to be shared
/// between tasks; folds happen sequentially on one owner.
pub struct Aggregator<'a> {
    registry: &'a dyn SiteRegistry,
    groups: HashMap<AddressBucket, ClientGroup>,
    // Buckets whose site list needs re-sorting before hand-off.
    unsorted: HashSet<AddressBucket>,
    stats: FoldStats,
}

impl<'a> Aggregator<'a> {
    pub fn new(registry: &'a dyn SiteRegistry) -> Self {
        Aggregator {
            registry,
            groups: HashMap::new(),
            unsorted: HashSet::new(),
            stats: FoldStats::default(),
        }
    }

    pub fn fold_sample(&mut self, sample: &RawSample) -> FoldOutcome {
        if !sample.rtt.is_finite() || sample.rtt < 0.0 {
            self.stats.invalid_rtt += 1;
            return FoldOutcome::InvalidRtt;
        }

        // Servers come and go; samples from unknown ones are dropped.
        let Some(site_id) = self.registry.site_for_server(sample.server_ip) else {
            self.stats.unknown_server += 1;
            return FoldOutcome::UnknownServer;
        };
        self.stats.folded += 1;

        let bucket = AddressBucket::of(sample.client_ip);
        let group = self
            .groups
            .entry(bucket)
            .or_insert_with(|| ClientGroup::new(bucket));

        let incoming = SiteRtt::new(site_id, sample.rtt, sample.logged_at);
        let outcome = match group
            .site_rtts
            .iter_mut()
            .find(|s| s.site_id == incoming.site_id)
        {
            None => {
                group.site_rtts.push(incoming);
                FoldOutcome::Created
            }
            Some(existing) => match merge_site_rtt(existing, &incoming) {
                Ok(true) => FoldOutcome::Updated,
                _ => FoldOutcome::Unchanged,
            },
        };

        if outcome != FoldOutcome::Unchanged {
            self.unsorted.insert(bucket);
        }
        outcome
    }

    pub fn fold_all<'s, I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = &'s RawSample>,
    {
        for sample in samples {
            self.fold_sample(sample);
        }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn stats(&self) -> &FoldStats {
        &self.stats
    }

    /// Sorts every touched bucket and hands the aggregate map over.
    pub fn finish(mut self) -> (HashMap<AddressBucket, ClientGroup>, FoldStats) {
        for bucket in self.unsorted.drain() {
            if let Some(group) = self.groups.get_mut(&bucket) {
                group.sort();
            }
        }

        counter!(SAMPLES_FOLDED).increment(self.stats.folded);
        counter!(SAMPLES_UNKNOWN_SERVER).increment(self.stats.unknown_server);
        counter!(SAMPLES_INVALID_RTT).increment(self.stats.invalid_rtt);

        (self.groups, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::bucket;
    use crate::testutils::{registry_with, sample, ts};

    fn group(key: &str, site_rtts: Vec<SiteRtt>) -> ClientGroup {
        ClientGroup::with_site_rtts(bucket(key).unwrap(), site_rtts)
    }

    #[test]
    fn test_merge_site_rtt_take_minimum() {
        let mut old = SiteRtt::new("abc01", 1.1, ts(100));
        let new = SiteRtt::new("abc01", 0.9, ts(200));
        assert_eq!(merge_site_rtt(&mut old, &new), Ok(true));
        assert_eq!(old.rtt, 0.9);
        assert_eq!(old.last_updated, ts(200));

        let mut old = SiteRtt::new("abc01", 0.1, ts(100));
        let new = SiteRtt::new("abc01", 1.1, ts(200));
        assert_eq!(merge_site_rtt(&mut old, &new), Ok(false));
        assert_eq!(old, SiteRtt::new("abc01", 0.1, ts(100)));
    }

    #[test]
    fn test_merge_site_rtt_tie_refreshes_timestamp() {
        let mut old = SiteRtt::new("abc01", 5.0, ts(100));
        let new = SiteRtt::new("abc01", 5.0, ts(300));
        assert_eq!(merge_site_rtt(&mut old, &new), Ok(true));
        assert_eq!(old.last_updated, ts(300));

        // Identical entry is not a change
        let same = old.clone();
        assert_eq!(merge_site_rtt(&mut old, &same), Ok(false));
    }

    #[test]
    fn test_merge_site_rtt_mismatched_site() {
        let mut old = SiteRtt::new("abc01", 1.0, ts(1));
        let new = SiteRtt::new("xyz01", 0.5, ts(2));
        assert!(matches!(
            merge_site_rtt(&mut old, &new),
            Err(MergeError::MismatchedSite { .. })
        ));
        assert_eq!(old.rtt, 1.0);
    }

    #[test]
    fn test_merge_client_groups() {
        let old = group(
            "10.0.0.0",
            vec![
                SiteRtt::new("abc01", 1.1, ts(1)),
                SiteRtt::new("def01", 3.0, ts(1)),
            ],
        );
        let new = group(
            "10.0.1.1",
            vec![
                SiteRtt::new("abc01", 5.0, ts(2)),
                SiteRtt::new("def01", 0.5, ts(2)),
                SiteRtt::new("ghi01", 2.0, ts(2)),
            ],
        );

        let (merged, changed) = merge_client_groups(&old, &new).unwrap();
        assert!(changed);
        assert_eq!(
            merged.site_rtts,
            vec![
                SiteRtt::new("def01", 0.5, ts(2)),
                SiteRtt::new("abc01", 1.1, ts(1)),
                SiteRtt::new("ghi01", 2.0, ts(2)),
            ]
        );
        assert!(merged.is_sorted());
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = group(
            "10.0.0.0",
            vec![
                SiteRtt::new("abc01", 1.0, ts(1)),
                SiteRtt::new("def01", 2.0, ts(1)),
            ],
        );
        let b = group(
            "10.0.0.0",
            vec![
                SiteRtt::new("def01", 2.0, ts(5)),
                SiteRtt::new("xyz01", 0.2, ts(5)),
            ],
        );

        let (once, changed) = merge_client_groups(&a, &b).unwrap();
        assert!(changed);
        let (twice, changed_again) = merge_client_groups(&once, &b).unwrap();
        assert!(!changed_again);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_with_self_is_noop() {
        // Ties included, the order must survive untouched
        let a = group(
            "10.0.0.0",
            vec![
                SiteRtt::new("abc01", 1.0, ts(1)),
                SiteRtt::new("def01", 1.0, ts(1)),
                SiteRtt::new("ghi01", 3.0, ts(1)),
            ],
        );
        let (merged, changed) = merge_client_groups(&a, &a).unwrap();
        assert!(!changed);
        assert_eq!(merged, a);
    }

    #[test]
    fn test_merge_mismatched_bucket() {
        let old = group("10.0.0.0", vec![SiteRtt::new("abc01", 1.0, ts(1))]);
        let new = group("10.0.4.0", vec![SiteRtt::new("abc01", 0.1, ts(2))]);
        let mut target = old.clone();

        assert_eq!(
            merge_into(&mut target, &new),
            Err(MergeError::MismatchedBucket {
                old: old.bucket,
                new: new.bucket
            })
        );
        assert_eq!(target, old);
    }

    #[test]
    fn test_fold_samples() {
        let registry = registry_with(&[("74.63.50.43", "lga01"), ("82.116.199.38", "lca01")]);
        let mut aggregator = Aggregator::new(&registry);

        assert_eq!(
            aggregator.fold_sample(&sample(1, "74.63.50.43", "154.54.36.18", 761.5)),
            FoldOutcome::Created
        );
        assert_eq!(
            aggregator.fold_sample(&sample(2, "82.116.199.38", "154.54.39.18", 62.0)),
            FoldOutcome::Created
        );
        // Worse RTT for an existing site
        assert_eq!(
            aggregator.fold_sample(&sample(3, "74.63.50.43", "154.54.37.1", 800.0)),
            FoldOutcome::Unchanged
        );
        // Tie refreshes the timestamp
        assert_eq!(
            aggregator.fold_sample(&sample(4, "82.116.199.38", "154.54.38.1", 62.0)),
            FoldOutcome::Updated
        );
        assert_eq!(
            aggregator.fold_sample(&sample(5, "1.2.3.4", "154.54.36.18", 1.0)),
            FoldOutcome::UnknownServer
        );
        assert_eq!(
            aggregator.fold_sample(&sample(6, "74.63.50.43", "154.54.36.18", -1.0)),
            FoldOutcome::InvalidRtt
        );
        assert_eq!(
            aggregator.fold_sample(&sample(7, "74.63.50.43", "154.54.36.18", f64::NAN)),
            FoldOutcome::InvalidRtt
        );

        let (groups, stats) = aggregator.finish();
        assert_eq!(
            stats,
            FoldStats {
                folded: 4,
                unknown_server: 1,
                invalid_rtt: 2
            }
        );
        assert_eq!(groups.len(), 1);

        let group = &groups[&bucket("154.54.36.0").unwrap()];
        assert_eq!(
            group.site_rtts,
            vec![
                SiteRtt::new("lca01", 62.0, ts(4)),
                SiteRtt::new("lga01", 761.5, ts(1)),
            ]
        );
    }

    #[test]
    fn test_fold_keeps_one_entry_per_site_and_sorted() {
        let registry = registry_with(&[("10.9.0.1", "aaa01"), ("10.9.0.2", "bbb01")]);
        let mut aggregator = Aggregator::new(&registry);
        let samples = vec![
            sample(1, "10.9.0.1", "192.168.0.1", 50.0),
            sample(2, "10.9.0.2", "192.168.0.2", 40.0),
            sample(3, "10.9.0.1", "192.168.0.3", 10.0),
            sample(4, "10.9.0.2", "192.168.0.4", 45.0),
        ];
        aggregator.fold_all(&samples);
        assert_eq!(aggregator.len(), 1);

        let (groups, _) = aggregator.finish();
        let group = groups.values().next().unwrap();
        assert_eq!(group.site_rtts.len(), 2);
        assert!(group.is_sorted());
        assert_eq!(group.site_rtts[0], SiteRtt::new("aaa01", 10.0, ts(3)));
        assert_eq!(group.site_rtts[1], SiteRtt::new("bbb01", 40.0, ts(2)));
    }
}
