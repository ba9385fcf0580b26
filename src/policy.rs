//! Top-level weighted-round-robin policy
//!
//! Owns the endpoint lists (active and pending) and the policy-wide weight
//! registry, turns resolver updates into endpoint generations, and publishes
//! pickers through the channel controller as aggregate connectivity evolves.
//!
//! Every method here runs in the host's work-serializer domain; only the
//! pickers it publishes are shared with the data plane.

use std::{
    collections::BTreeMap,
    sync::{Arc, atomic::AtomicU32},
};

use log::{debug, info, trace};

use crate::{
    config::WeightedRoundRobinConfig,
    endpoint_list::EndpointList,
    endpoint_weight::WeightMap,
    lb::{
        ChannelController, ConnectivityState, EndpointAddressSet, EndpointAddresses,
        EndpointHandle, QueuePicker, ResolverUpdate, Status, SubchannelPicker,
    },
    metrics,
    picker::WrrPicker,
};

/// State shared with pickers and weight records, which outlive list swaps
/// and may outlive the policy itself.
pub(crate) struct PolicyShared {
    pub(crate) weight_map: Arc<WeightMap>,
    /// Sequence source for every scheduler generation, so the schedule
    /// position carries across rebuilds.
    pub(crate) scheduler_sequence: AtomicU32,
    /// Locality this policy serves, used as a metric label.
    pub(crate) locality: String,
}

/// Client-side weighted-round-robin load balancing policy.
pub struct WeightedRoundRobin {
    shared: Arc<PolicyShared>,
    config: Arc<WeightedRoundRobinConfig>,
    /// Current endpoint list serving picks.
    endpoint_list: Option<EndpointList>,
    /// List built from the latest resolver update, waiting to become
    /// active until the promotion criteria hold.
    latest_pending_endpoint_list: Option<EndpointList>,
    next_list_seq: u64,
    shutdown: bool,
}

impl WeightedRoundRobin {
    /// Creates a policy serving the given locality (may be empty).
    pub fn new(locality: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PolicyShared {
                weight_map: Arc::new(WeightMap::default()),
                scheduler_sequence: AtomicU32::new(rand::random()),
                locality: locality.into(),
            }),
            config: Arc::new(WeightedRoundRobinConfig::default()),
            endpoint_list: None,
            latest_pending_endpoint_list: None,
            next_list_seq: 0,
            shutdown: false,
        }
    }

    /// Processes one resolver update.
    ///
    /// Child construction errors are collected into the returned status but
    /// do not abort the update. A resolver error keeps the existing list
    /// serving; an empty address list becomes active immediately and reports
    /// TRANSIENT_FAILURE.
    pub fn update(
        &mut self,
        controller: &mut dyn ChannelController,
        update: ResolverUpdate,
    ) -> Result<(), Status> {
        let ResolverUpdate {
            addresses,
            config,
            resolution_note,
        } = update;
        self.config = Arc::new(config);
        let (addresses, resolver_status) = match addresses {
            Ok(addresses) => {
                metrics::WRR_UPDATES
                    .with_label_values(&[controller.target()])
                    .inc();
                debug!("received update with {} endpoints", addresses.len());
                // Deduplicate and order by address set so endpoints that
                // survive an update keep their indices when the membership
                // around them does not move.
                let mut ordered: BTreeMap<EndpointAddressSet, EndpointAddresses> = BTreeMap::new();
                for endpoint in addresses {
                    ordered.entry(endpoint.address_set()).or_insert(endpoint);
                }
                (ordered.into_values().collect::<Vec<_>>(), None)
            }
            Err(status) => {
                debug!("received update with resolver error: {status}");
                if self.endpoint_list.is_some() {
                    // Keep serving from the existing list; surface the error.
                    return Err(status);
                }
                (Vec::new(), Some(status))
            }
        };
        if self.latest_pending_endpoint_list.is_some() {
            debug!("replacing previous pending endpoint list");
        }
        let seq = self.next_list_seq;
        self.next_list_seq += 1;
        let mut errors = Vec::new();
        self.latest_pending_endpoint_list = Some(EndpointList::new(
            seq,
            addresses,
            resolution_note,
            &self.config,
            &self.shared.weight_map,
            controller,
            &mut errors,
        ));
        let pending_is_empty = self
            .latest_pending_endpoint_list
            .as_ref()
            .is_some_and(EndpointList::is_empty);
        if pending_is_empty {
            // Nothing to wait for: promote and fail picks right away.
            self.endpoint_list = self.latest_pending_endpoint_list.take();
            let status =
                resolver_status.unwrap_or_else(|| Status::unavailable("empty address list"));
            if let Some(list) = &self.endpoint_list {
                list.report_transient_failure(controller, status.clone());
            }
            return Err(status);
        }
        if self.endpoint_list.is_none() {
            self.endpoint_list = self.latest_pending_endpoint_list.take();
        }
        if !errors.is_empty() {
            return Err(Status::unavailable(format!(
                "errors from children: [{}]",
                errors.join("; ")
            )));
        }
        Ok(())
    }

    /// Delivers a connectivity notification for one endpoint.
    ///
    /// `handle` is the one the endpoint was created with; notifications for
    /// retired list generations are ignored. Children attach their current
    /// picker to READY notifications.
    pub fn on_endpoint_state_update(
        &mut self,
        controller: &mut dyn ChannelController,
        handle: EndpointHandle,
        new_state: ConnectivityState,
        status: Option<Status>,
        child_picker: Option<Arc<dyn SubchannelPicker>>,
    ) {
        if self.shutdown {
            return;
        }
        let list = match (&mut self.endpoint_list, &mut self.latest_pending_endpoint_list) {
            (Some(list), _) if list.seq() == handle.list => list,
            (_, Some(list)) if list.seq() == handle.list => list,
            _ => {
                trace!("ignoring state notification for retired list {}", handle.list);
                return;
            }
        };
        if !list.apply_state_update(handle.index, new_state, child_picker) {
            return;
        }
        self.maybe_update_aggregated_connectivity_state(controller, handle.list, status);
    }

    /// Promotes the pending list when eligible, then publishes the aggregate
    /// state computed from the current list's counters. Both the state
    /// notification path and the update path end up here, so the rules
    /// cannot diverge.
    fn maybe_update_aggregated_connectivity_state(
        &mut self,
        controller: &mut dyn ChannelController,
        list_seq: u64,
        status_for_tf: Option<Status>,
    ) {
        // Swap in the pending list when the active one has no READY
        // endpoint left, when the pending list is usable (some READY
        // endpoint and every endpoint heard from), or when the pending list
        // has wholly failed and the control plane should see that.
        if let (Some(pending), Some(active)) =
            (&self.latest_pending_endpoint_list, &self.endpoint_list)
        {
            if pending.seq() == list_seq
                && (active.num_ready() == 0
                    || (pending.num_ready() > 0 && pending.all_endpoints_seen_initial_state())
                    || pending.num_transient_failure() == pending.len())
            {
                info!(
                    "swapping out endpoint list ({}) in favor of pending list ({})",
                    active.counters_string(),
                    pending.counters_string()
                );
                self.endpoint_list = self.latest_pending_endpoint_list.take();
            }
        }
        let Some(list) = &mut self.endpoint_list else {
            return;
        };
        // Only the current list publishes.
        if list.seq() != list_seq {
            return;
        }
        if list.num_ready() > 0 {
            let endpoints = list.ready_endpoints();
            if endpoints.is_empty() {
                // A READY endpoint whose child has not delivered a picker
                // yet; queue until it does.
                debug!("READY endpoints without pickers yet; queueing picks");
                controller.update_state(ConnectivityState::Connecting, None, Arc::new(QueuePicker));
                return;
            }
            debug!(
                "reporting READY with {} of {} endpoints",
                endpoints.len(),
                list.len()
            );
            let picker = WrrPicker::new(
                self.shared.clone(),
                self.config.clone(),
                controller.target().to_owned(),
                endpoints,
            );
            controller.update_state(ConnectivityState::Ready, None, picker);
        } else if list.num_connecting() > 0 {
            debug!("reporting CONNECTING ({})", list.counters_string());
            controller.update_state(ConnectivityState::Connecting, None, Arc::new(QueuePicker));
        } else if list.num_transient_failure() == list.len() {
            if let Some(status) = status_for_tf {
                list.set_last_failure(Status::unavailable(format!(
                    "connections to all backends failing; last error: {status}"
                )));
            }
            let status = list
                .last_failure()
                .cloned()
                .unwrap_or_else(|| Status::unavailable("connections to all backends failing"));
            list.report_transient_failure(controller, status);
        }
    }

    /// Drops both endpoint lists. The destruction cascade releases the
    /// children and, once the last picker goes, the weight map entries.
    pub fn shutdown(&mut self) {
        debug!("shutting down");
        self.shutdown = true;
        self.endpoint_list = None;
        self.latest_pending_endpoint_list = None;
    }

    /// Resets connection backoff on every endpoint of both lists.
    pub fn reset_backoff(&self) {
        if let Some(list) = &self.endpoint_list {
            list.reset_backoff();
        }
        if let Some(list) = &self.latest_pending_endpoint_list {
            list.reset_backoff();
        }
    }

    #[cfg(test)]
    pub(crate) fn weight_map(&self) -> &Arc<WeightMap> {
        &self.shared.weight_map
    }
}
