//! Endpoint bookkeeping: per-endpoint connectivity plus aggregate counters

use std::sync::Arc;

use log::{debug, trace, warn};

use crate::{
    config::WeightedRoundRobinConfig,
    endpoint_weight::{EndpointWeight, WeightMap},
    lb::{
        BackendMetricData, ChannelController, ConnectivityState, EndpointAddresses,
        EndpointChild, EndpointHandle, FailurePicker, LoadReportWatcher, Status,
        SubchannelPicker,
    },
};

/// One endpoint of a list generation.
struct Endpoint {
    addresses: EndpointAddresses,
    weight: Arc<EndpointWeight>,
    /// `None` when the controller failed to build the endpoint; it then
    /// stays unconnected for this generation.
    child: Option<Box<dyn EndpointChild>>,
    /// `None` until the first state notification arrives.
    state: Option<ConnectivityState>,
    /// Latest picker published by the endpoint's child.
    picker: Option<Arc<dyn SubchannelPicker>>,
}

/// Out-of-band report subscription handed to the child at creation.
struct OobReportWatcher {
    weight: Arc<EndpointWeight>,
    error_utilization_penalty: f32,
}

impl LoadReportWatcher for OobReportWatcher {
    fn on_load_report(&self, report: &BackendMetricData) {
        let mut utilization = report.application_utilization;
        if utilization <= 0.0 {
            utilization = report.cpu_utilization;
        }
        self.weight
            .maybe_update_weight(report.qps, report.eps, utilization, self.error_utilization_penalty);
    }
}

/// One generation of endpoints with aggregated connectivity counters.
///
/// IDLE is counted as CONNECTING throughout; an IDLE endpoint is asked to
/// connect immediately, so the distinction never reaches the aggregate.
pub(crate) struct EndpointList {
    seq: u64,
    endpoints: Vec<Endpoint>,
    resolution_note: Option<String>,
    num_ready: usize,
    num_connecting: usize,
    num_transient_failure: usize,
    last_failure: Option<Status>,
}

impl EndpointList {
    pub(crate) fn new(
        seq: u64,
        addresses: Vec<EndpointAddresses>,
        resolution_note: Option<String>,
        config: &WeightedRoundRobinConfig,
        weight_map: &Arc<WeightMap>,
        controller: &mut dyn ChannelController,
        errors: &mut Vec<String>,
    ) -> Self {
        let mut endpoints = Vec::with_capacity(addresses.len());
        for (index, addresses) in addresses.into_iter().enumerate() {
            let weight = WeightMap::get_or_create(weight_map, addresses.address_set());
            let handle = EndpointHandle { list: seq, index };
            let child = match controller.create_endpoint(handle, &addresses) {
                Ok(child) => {
                    if config.enable_oob_load_report {
                        child.watch_load_reports(
                            config.oob_reporting_period,
                            Arc::new(OobReportWatcher {
                                weight: weight.clone(),
                                error_utilization_penalty: config.error_utilization_penalty,
                            }),
                        );
                    }
                    Some(child)
                }
                Err(status) => {
                    warn!("endpoint {addresses}: {status}");
                    errors.push(format!("endpoint {addresses}: {status}"));
                    None
                }
            };
            endpoints.push(Endpoint {
                addresses,
                weight,
                child,
                state: None,
                picker: None,
            });
        }
        Self {
            seq,
            endpoints,
            resolution_note,
            num_ready: 0,
            num_connecting: 0,
            num_transient_failure: 0,
            last_failure: None,
        }
    }

    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub(crate) fn num_ready(&self) -> usize {
        self.num_ready
    }

    pub(crate) fn num_connecting(&self) -> usize {
        self.num_connecting
    }

    pub(crate) fn num_transient_failure(&self) -> usize {
        self.num_transient_failure
    }

    pub(crate) fn all_endpoints_seen_initial_state(&self) -> bool {
        self.endpoints.iter().all(|endpoint| endpoint.state.is_some())
    }

    pub(crate) fn counters_string(&self) -> String {
        format!(
            "num_endpoints={} num_ready={} num_connecting={} num_transient_failure={}",
            self.endpoints.len(),
            self.num_ready,
            self.num_connecting,
            self.num_transient_failure
        )
    }

    /// Applies one state notification to endpoint `index`; returns false for
    /// an index this generation does not have.
    pub(crate) fn apply_state_update(
        &mut self,
        index: usize,
        new_state: ConnectivityState,
        picker: Option<Arc<dyn SubchannelPicker>>,
    ) -> bool {
        if index >= self.endpoints.len() {
            warn!(
                "state notification for unknown endpoint index {index} (list has {})",
                self.endpoints.len()
            );
            return false;
        }
        let old_state = self.endpoints[index].state;
        trace!(
            "endpoint {} (index {index} of {}): {} -> {new_state}",
            self.endpoints[index].addresses,
            self.endpoints.len(),
            match old_state {
                Some(state) => state.to_string(),
                None => "N/A".to_owned(),
            },
        );
        match new_state {
            ConnectivityState::Idle => {
                debug!(
                    "endpoint {} reported IDLE; requesting connection",
                    self.endpoints[index].addresses
                );
                if let Some(child) = &self.endpoints[index].child {
                    child.exit_idle();
                }
            }
            ConnectivityState::Ready => {
                // A reconnect gets a fresh blackout window: the first
                // reports off a new connection reflect an empty backend.
                // The initial notification of a new generation is exempt so
                // weight state inherited across address updates stays
                // usable.
                if old_state.is_some() && old_state != Some(ConnectivityState::Ready) {
                    self.endpoints[index].weight.reset_non_empty_since();
                }
            }
            _ => {}
        }
        if let Some(picker) = picker {
            self.endpoints[index].picker = Some(picker);
        }
        if old_state != Some(new_state) {
            self.update_state_counters(old_state, new_state);
        }
        self.endpoints[index].state = Some(new_state);
        true
    }

    fn update_state_counters(
        &mut self,
        old_state: Option<ConnectivityState>,
        new_state: ConnectivityState,
    ) {
        if let Some(old_state) = old_state {
            match old_state {
                ConnectivityState::Ready => {
                    debug_assert!(self.num_ready > 0);
                    self.num_ready -= 1;
                }
                ConnectivityState::Connecting | ConnectivityState::Idle => {
                    debug_assert!(self.num_connecting > 0);
                    self.num_connecting -= 1;
                }
                ConnectivityState::TransientFailure => {
                    debug_assert!(self.num_transient_failure > 0);
                    self.num_transient_failure -= 1;
                }
            }
        }
        match new_state {
            ConnectivityState::Ready => self.num_ready += 1,
            ConnectivityState::Connecting | ConnectivityState::Idle => self.num_connecting += 1,
            ConnectivityState::TransientFailure => self.num_transient_failure += 1,
        }
    }

    /// Snapshot of the endpoints currently READY, for a new picker.
    pub(crate) fn ready_endpoints(
        &self,
    ) -> Vec<(Arc<dyn SubchannelPicker>, Arc<EndpointWeight>)> {
        self.endpoints
            .iter()
            .filter(|endpoint| endpoint.state == Some(ConnectivityState::Ready))
            .filter_map(|endpoint| {
                endpoint
                    .picker
                    .clone()
                    .map(|picker| (picker, endpoint.weight.clone()))
            })
            .collect()
    }

    pub(crate) fn set_last_failure(&mut self, status: Status) {
        self.last_failure = Some(status);
    }

    pub(crate) fn last_failure(&self) -> Option<&Status> {
        self.last_failure.as_ref()
    }

    /// Publishes TRANSIENT_FAILURE with a failing picker, appending the
    /// resolution note when one was attached to this generation's update.
    pub(crate) fn report_transient_failure(
        &self,
        controller: &mut dyn ChannelController,
        status: Status,
    ) {
        let status = match &self.resolution_note {
            Some(note) if !note.is_empty() => Status::unavailable(format!("{status} ({note})")),
            _ => status,
        };
        debug!("reporting TRANSIENT_FAILURE: {status}");
        controller.update_state(
            ConnectivityState::TransientFailure,
            Some(status.clone()),
            Arc::new(FailurePicker::new(status)),
        );
    }

    pub(crate) fn reset_backoff(&self) {
        for endpoint in &self.endpoints {
            if let Some(child) = &endpoint.child {
                child.reset_backoff();
            }
        }
    }
}
