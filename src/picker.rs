//! Data-plane picker with the periodic scheduler rebuild
//!
//! A picker freezes the endpoints that were READY when it was published.
//! Picks run lock-free against the current scheduler; a timer task rebuilds
//! the scheduler from fresh weights every `weight_update_period` until the
//! picker is dropped.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use arc_swap::ArcSwapOption;
use log::{debug, trace};
use spin::Mutex as SpinMutex;
use tokio::{task::JoinHandle, time};

use crate::{
    config::WeightedRoundRobinConfig,
    endpoint_weight::EndpointWeight,
    lb::{CallFinishArgs, PickArgs, PickResult, SubchannelCallTracker, SubchannelPicker},
    metrics,
    policy::PolicyShared,
    scheduler::StaticStrideScheduler,
};

/// Snapshot entry: one READY endpoint's picker and weight record.
struct PickerEndpoint {
    picker: Arc<dyn SubchannelPicker>,
    weight: Arc<EndpointWeight>,
}

/// Weighted-round-robin picker over the endpoints READY at snapshot time.
pub(crate) struct WrrPicker {
    shared: Arc<PolicyShared>,
    config: Arc<WeightedRoundRobinConfig>,
    /// Channel target, captured for metric labels.
    target: String,
    endpoints: Vec<PickerEndpoint>,
    /// Current scheduler; absent when fewer than two endpoints had usable
    /// weights, in which case picks fall back to round-robin. Readers copy
    /// the reference and work on the frozen scheduler outside any lock.
    scheduler: ArcSwapOption<StaticStrideScheduler>,
    /// Pending rebuild timer. The rebuild task re-checks this slot under the
    /// lock before running, so clearing it (on drop) is a cancellation that
    /// also covers a timer that has already fired.
    timer_handle: SpinMutex<Option<JoinHandle<()>>>,
    /// Cursor for the round-robin fallback, seeded randomly so pickers do
    /// not gang up on one endpoint after a rebuild churn.
    last_picked_index: AtomicUsize,
    weak_self: Weak<WrrPicker>,
}

impl WrrPicker {
    /// Builds the picker, its first scheduler, and arms the rebuild timer.
    ///
    /// `endpoints` must be non-empty; the policy only publishes a weighted
    /// picker when at least one endpoint is READY.
    pub(crate) fn new(
        shared: Arc<PolicyShared>,
        config: Arc<WeightedRoundRobinConfig>,
        target: String,
        endpoints: Vec<(Arc<dyn SubchannelPicker>, Arc<EndpointWeight>)>,
    ) -> Arc<Self> {
        let picker = Arc::new_cyclic(|weak_self| Self {
            shared,
            config,
            target,
            endpoints: endpoints
                .into_iter()
                .map(|(picker, weight)| PickerEndpoint { picker, weight })
                .collect(),
            scheduler: ArcSwapOption::empty(),
            timer_handle: SpinMutex::new(None),
            last_picked_index: AtomicUsize::new(rand::random::<u32>() as usize),
            weak_self: weak_self.clone(),
        });
        debug!(
            "created picker with {} ready endpoints",
            picker.endpoints.len()
        );
        // Hold the timer slot across the initial build so the first timer
        // task cannot fire before its handle is recorded.
        let mut timer_handle = picker.timer_handle.lock();
        picker.build_scheduler_and_start_timer(&mut timer_handle);
        drop(timer_handle);
        picker
    }

    /// Reads every endpoint's current weight, swaps in a new scheduler (or
    /// none), and arms the next rebuild. Runs under the timer slot lock.
    fn build_scheduler_and_start_timer(&self, timer_handle: &mut Option<JoinHandle<()>>) {
        let now = Instant::now();
        let target = self.target.as_str();
        let locality = self.shared.locality.as_str();
        let mut weights = Vec::with_capacity(self.endpoints.len());
        let mut num_not_yet_usable = 0u64;
        let mut num_stale = 0u64;
        for endpoint in &self.endpoints {
            let weight = endpoint.weight.get_weight(
                now,
                self.config.weight_expiration_period,
                self.config.blackout_period,
                &mut num_not_yet_usable,
                &mut num_stale,
            );
            metrics::ENDPOINT_WEIGHTS
                .with_label_values(&[target, locality])
                .observe(f64::from(weight));
            weights.push(weight);
        }
        metrics::ENDPOINT_WEIGHT_NOT_YET_USABLE
            .with_label_values(&[target, locality])
            .inc_by(num_not_yet_usable);
        metrics::ENDPOINT_WEIGHT_STALE
            .with_label_values(&[target, locality])
            .inc_by(num_stale);
        trace!("new weights: {weights:?}");

        let shared = self.shared.clone();
        let scheduler = StaticStrideScheduler::new(
            &weights,
            Box::new(move || shared.scheduler_sequence.fetch_add(1, Ordering::Relaxed)),
        );
        if scheduler.is_none() {
            debug!("insufficient usable weights, falling back to round-robin");
            metrics::RR_FALLBACK
                .with_label_values(&[target, locality])
                .inc();
        }
        self.scheduler.store(scheduler.map(Arc::new));

        let weak_self = self.weak_self.clone();
        let period = self.config.weight_update_period;
        trace!("scheduling weight rebuild in {period:?}");
        *timer_handle = Some(tokio::spawn(async move {
            time::sleep(period).await;
            let Some(picker) = weak_self.upgrade() else {
                return;
            };
            let mut timer_handle = picker.timer_handle.lock();
            // An empty slot means the picker was orphaned between the
            // upgrade and taking the lock.
            if timer_handle.is_some() {
                picker.build_scheduler_and_start_timer(&mut timer_handle);
            }
        }));
    }

    fn pick_index(&self) -> usize {
        if let Some(scheduler) = self.scheduler.load_full() {
            return scheduler.pick();
        }
        // No scheduler: either all weights were unusable or only one
        // endpoint is in the snapshot. Plain round-robin.
        self.last_picked_index.fetch_add(1, Ordering::Relaxed) % self.endpoints.len()
    }
}

impl SubchannelPicker for WrrPicker {
    fn pick(&self, args: PickArgs<'_>) -> PickResult {
        let index = self.pick_index();
        let endpoint = &self.endpoints[index];
        let mut result = endpoint.picker.pick(args);
        // With out-of-band reports disabled, weights come from per-call
        // trailers: wrap the call tracker to harvest them.
        if !self.config.enable_oob_load_report {
            if let PickResult::Complete(complete) = &mut result {
                complete.call_tracker = Some(Box::new(PerCallReportTracker {
                    weight: endpoint.weight.clone(),
                    error_utilization_penalty: self.config.error_utilization_penalty,
                    child_tracker: complete.call_tracker.take(),
                }));
            }
        }
        result
    }
}

impl Drop for WrrPicker {
    fn drop(&mut self) {
        if let Some(handle) = self.timer_handle.lock().take() {
            handle.abort();
        }
        trace!("picker destroyed");
    }
}

/// Call tracker harvesting the backend metric report from call trailers.
struct PerCallReportTracker {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
    child_tracker: Option<Box<dyn SubchannelCallTracker>>,
}

impl SubchannelCallTracker for PerCallReportTracker {
    fn start(&mut self) {
        if let Some(child) = &mut self.child_tracker {
            child.start();
        }
    }

    fn finish(mut self: Box<Self>, args: CallFinishArgs<'_>) {
        if let Some(child) = self.child_tracker.take() {
            child.finish(args);
        }
        let (mut qps, mut eps, mut utilization) = (0.0, 0.0, 0.0);
        if let Some(report) = args.backend_metrics {
            qps = report.qps;
            eps = report.eps;
            utilization = report.application_utilization;
            if utilization <= 0.0 {
                utilization = report.cpu_utilization;
            }
        }
        self.weight
            .maybe_update_weight(qps, eps, utilization, self.error_utilization_penalty);
    }
}
