//! Per-endpoint weight state fed by backend load reports

use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use log::trace;
use spin::Mutex as SpinMutex;

use crate::lb::EndpointAddressSet;

/// Registry of live endpoint weights, keyed by address set.
///
/// Entries are weak. A record unregisters itself when its last strong
/// reference drops, so weight state survives exactly as long as some list,
/// picker or report watcher still holds it, and is resurrected fresh
/// afterwards.
#[derive(Debug, Default)]
pub(crate) struct WeightMap {
    entries: SpinMutex<BTreeMap<EndpointAddressSet, Weak<EndpointWeight>>>,
}

impl WeightMap {
    /// Returns the live weight record for `key`, creating one if the map has
    /// none (or only a dead entry).
    pub(crate) fn get_or_create(map: &Arc<Self>, key: EndpointAddressSet) -> Arc<EndpointWeight> {
        let mut entries = map.entries.lock();
        if let Some(existing) = entries.get(&key).and_then(Weak::upgrade) {
            return existing;
        }
        let weight = Arc::new(EndpointWeight {
            map: Arc::clone(map),
            key: key.clone(),
            state: SpinMutex::new(WeightState::default()),
        });
        entries.insert(key, Arc::downgrade(&weight));
        weight
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &EndpointAddressSet) -> bool {
        self.entries.lock().contains_key(key)
    }
}

#[derive(Debug, Default)]
struct WeightState {
    weight: f32,
    /// When the current run of reports started; `None` until the first
    /// non-zero report arrives, and again after expiration or reconnect.
    non_empty_since: Option<Instant>,
    /// When the most recent non-zero report arrived.
    last_update_time: Option<Instant>,
}

/// Weight accumulator for one endpoint, shared between the policy, its
/// pickers and the report watchers.
#[derive(Debug)]
pub(crate) struct EndpointWeight {
    map: Arc<WeightMap>,
    key: EndpointAddressSet,
    state: SpinMutex<WeightState>,
}

impl Drop for EndpointWeight {
    fn drop(&mut self) {
        let mut entries = self.map.entries.lock();
        // A replacement record may already sit under this key; only remove
        // the entry if it is still ours.
        if let Some(entry) = entries.get(&self.key) {
            if std::ptr::eq(entry.as_ptr(), self) {
                entries.remove(&self.key);
            }
        }
    }
}

impl EndpointWeight {
    /// Folds one backend load report into the stored weight.
    ///
    /// The weight is `qps / (utilization + eps/qps * penalty)`. Reports that
    /// compute to zero are dropped without touching state, so a transient
    /// empty report cannot wipe a usable weight.
    pub(crate) fn maybe_update_weight(
        &self,
        qps: f64,
        eps: f64,
        utilization: f64,
        error_utilization_penalty: f32,
    ) {
        let mut weight = 0.0f32;
        if qps > 0.0 && utilization > 0.0 {
            let mut penalty = 0.0f64;
            if eps > 0.0 && error_utilization_penalty > 0.0 {
                penalty = eps / qps * f64::from(error_utilization_penalty);
            }
            weight = (qps / (utilization + penalty)) as f32;
        }
        if weight == 0.0 {
            trace!(
                "endpoint {}: qps={qps} eps={eps} utilization={utilization}: weight=0 (not updating)",
                self.key
            );
            return;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        trace!(
            "endpoint {}: qps={qps} eps={eps} utilization={utilization}: setting weight={weight} (was {})",
            self.key, state.weight
        );
        if state.non_empty_since.is_none() {
            state.non_empty_since = Some(now);
        }
        state.weight = weight;
        state.last_update_time = Some(now);
    }

    /// Usable weight at `now`, or 0.
    ///
    /// An expired weight reads as 0 and clears `non_empty_since`, so the
    /// blackout applies again if reports resume. A weight still inside the
    /// blackout window also reads as 0; backends that just started reporting
    /// understate their load while caches and queues fill.
    pub(crate) fn get_weight(
        &self,
        now: Instant,
        weight_expiration_period: Duration,
        blackout_period: Duration,
        num_not_yet_usable: &mut u64,
        num_stale: &mut u64,
    ) -> f32 {
        let mut state = self.state.lock();
        if let Some(last_update) = state.last_update_time {
            if now.saturating_duration_since(last_update) >= weight_expiration_period {
                *num_stale += 1;
                state.non_empty_since = None;
                return 0.0;
            }
        }
        if blackout_period > Duration::ZERO {
            let blacked_out = match state.non_empty_since {
                Some(since) => now.saturating_duration_since(since) < blackout_period,
                None => true,
            };
            if blacked_out {
                *num_not_yet_usable += 1;
                return 0.0;
            }
        }
        state.weight
    }

    /// Restarts the blackout window. Called when the endpoint re-enters
    /// READY, since reports from a fresh connection start cold again.
    pub(crate) fn reset_non_empty_since(&self) {
        self.state.lock().non_empty_since = None;
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn key(port: u16) -> EndpointAddressSet {
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        crate::lb::EndpointAddresses::from(addr).address_set()
    }

    fn weight_with_report(qps: f64, eps: f64, utilization: f64, penalty: f32) -> Arc<EndpointWeight> {
        let map = Arc::new(WeightMap::default());
        let weight = WeightMap::get_or_create(&map, key(8001));
        weight.maybe_update_weight(qps, eps, utilization, penalty);
        weight
    }

    fn usable_weight(weight: &EndpointWeight, now: Instant) -> f32 {
        let (mut unused_a, mut unused_b) = (0, 0);
        weight.get_weight(
            now,
            Duration::from_secs(180),
            Duration::ZERO,
            &mut unused_a,
            &mut unused_b,
        )
    }

    #[test]
    fn weight_is_qps_over_utilization() {
        let weight = weight_with_report(100.0, 0.0, 0.5, 1.0);
        assert_eq!(usable_weight(&weight, Instant::now()), 200.0);
    }

    #[test]
    fn errors_penalize_the_weight() {
        // 100 / (0.5 + 10/100 * 1.0) = 166.66..
        let weight = weight_with_report(100.0, 10.0, 0.5, 1.0);
        let value = usable_weight(&weight, Instant::now());
        assert!((value - 166.666).abs() < 0.01, "{value}");
    }

    #[test]
    fn zero_penalty_ignores_errors() {
        let weight = weight_with_report(100.0, 10.0, 0.5, 0.0);
        assert_eq!(usable_weight(&weight, Instant::now()), 200.0);
    }

    #[test]
    fn empty_report_does_not_clobber_state() {
        let weight = weight_with_report(100.0, 0.0, 0.5, 1.0);
        weight.maybe_update_weight(0.0, 0.0, 0.5, 1.0);
        weight.maybe_update_weight(100.0, 0.0, 0.0, 1.0);
        assert_eq!(usable_weight(&weight, Instant::now()), 200.0);
    }

    #[test]
    fn blackout_suppresses_fresh_weight() {
        let weight = weight_with_report(100.0, 0.0, 0.5, 1.0);
        let now = Instant::now();
        let blackout = Duration::from_secs(10);
        let expiration = Duration::from_secs(180);

        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(now, expiration, blackout, &mut not_yet_usable, &mut stale);
        assert_eq!(value, 0.0);
        assert_eq!((not_yet_usable, stale), (1, 0));

        // Past the blackout window the weight is served.
        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            now + Duration::from_secs(11),
            expiration,
            blackout,
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 200.0);
        assert_eq!((not_yet_usable, stale), (0, 0));
    }

    #[test]
    fn never_reported_endpoint_counts_as_not_yet_usable() {
        let map = Arc::new(WeightMap::default());
        let weight = WeightMap::get_or_create(&map, key(8002));
        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            Instant::now(),
            Duration::from_secs(180),
            Duration::from_secs(10),
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 0.0);
        assert_eq!((not_yet_usable, stale), (1, 0));
    }

    #[test]
    fn expiration_clears_weight_and_reapplies_blackout() {
        let weight = weight_with_report(100.0, 0.0, 0.5, 1.0);
        let now = Instant::now();
        let blackout = Duration::from_secs(10);
        let expiration = Duration::from_secs(180);

        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            now + Duration::from_secs(181),
            expiration,
            blackout,
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 0.0);
        assert_eq!((not_yet_usable, stale), (0, 1));

        // Reports resume: the blackout runs again from the new report.
        weight.maybe_update_weight(100.0, 0.0, 0.5, 1.0);
        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            Instant::now() + Duration::from_secs(1),
            expiration,
            blackout,
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 0.0);
        assert_eq!((not_yet_usable, stale), (1, 0));
    }

    #[test]
    fn reset_non_empty_since_restarts_the_blackout() {
        let weight = weight_with_report(100.0, 0.0, 0.5, 1.0);
        let now = Instant::now();
        let blackout = Duration::from_secs(10);
        let expiration = Duration::from_secs(180);

        // Past the blackout the weight is usable, then a reconnect resets it.
        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            now + Duration::from_secs(11),
            expiration,
            blackout,
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 200.0);

        weight.reset_non_empty_since();
        let (mut not_yet_usable, mut stale) = (0, 0);
        let value = weight.get_weight(
            now + Duration::from_secs(12),
            expiration,
            blackout,
            &mut not_yet_usable,
            &mut stale,
        );
        assert_eq!(value, 0.0);
        assert_eq!((not_yet_usable, stale), (1, 0));
    }

    #[test]
    fn map_reuses_live_records() {
        let map = Arc::new(WeightMap::default());
        let first = WeightMap::get_or_create(&map, key(8003));
        let second = WeightMap::get_or_create(&map, key(8003));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &WeightMap::get_or_create(&map, key(8004))));
    }

    #[test]
    fn dropping_the_last_reference_removes_the_entry() {
        let map = Arc::new(WeightMap::default());
        let first = WeightMap::get_or_create(&map, key(8005));
        let second = WeightMap::get_or_create(&map, key(8005));
        drop(first);
        assert!(map.contains(&key(8005)));
        drop(second);
        assert!(!map.contains(&key(8005)));

        // A later appearance of the same key starts from scratch.
        let fresh = WeightMap::get_or_create(&map, key(8005));
        assert_eq!(usable_weight(&fresh, Instant::now()), 0.0);
    }
}
