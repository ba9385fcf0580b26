//! Interface layer between the policy and its host channel
//!
//! The policy sits between a resolver feeding it endpoint lists and a data
//! plane calling [`SubchannelPicker::pick`] once per request. Everything the
//! policy consumes from the surrounding channel is expressed here as a trait:
//! the channel-control helper ([`ChannelController`]), the per-endpoint child
//! ([`EndpointChild`]) and the backend-metric report sources
//! ([`SubchannelCallTracker`], [`LoadReportWatcher`]).
//!
//! Control-plane methods take `&mut` receivers; the host is expected to
//! serialize them on a single-writer executor. Pickers are shared with the
//! data plane and must stay cheap and lock-free.

use std::{
    collections::BTreeSet,
    fmt,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use crate::config::WeightedRoundRobinConfig;

/// Connectivity state of one endpoint, or of the whole policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Idle => f.write_str("IDLE"),
            Self::Connecting => f.write_str("CONNECTING"),
            Self::Ready => f.write_str("READY"),
            Self::TransientFailure => f.write_str("TRANSIENT_FAILURE"),
        }
    }
}

/// Failure status carried by state updates and failed picks.
///
/// Every failure this policy produces is an unavailability. The message is
/// reference counted so pickers can hand out clones on the request path
/// without allocating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct Status {
    message: Arc<str>,
}

impl Status {
    /// Creates an UNAVAILABLE status with the given message.
    pub fn unavailable(message: impl AsRef<str>) -> Self {
        Self {
            message: Arc::from(message.as_ref()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Backend load report, from per-call trailers or an out-of-band watcher.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BackendMetricData {
    /// Queries per second handled by the backend.
    pub qps: f64,
    /// Errors per second observed by the backend.
    pub eps: f64,
    /// Application-specific utilization, preferred when positive.
    pub application_utilization: f64,
    /// CPU utilization, used when no application utilization is reported.
    pub cpu_utilization: f64,
}

/// Arguments for a single pick. Opaque to this policy, forwarded unchanged
/// to the chosen endpoint's picker.
#[derive(Debug, Default, Clone, Copy)]
pub struct PickArgs<'a> {
    /// Request path, when the caller has one.
    pub path: Option<&'a str>,
}

/// Connection handle produced by a successful pick. The policy never looks
/// inside it.
pub trait Subchannel: fmt::Debug + Send + Sync {}

/// Observes the lifecycle of a call placed on a picked subchannel.
///
/// `finish` receives the trailing metadata's backend metric report when the
/// backend attached one.
pub trait SubchannelCallTracker: Send {
    fn start(&mut self);
    fn finish(self: Box<Self>, args: CallFinishArgs<'_>);
}

/// Arguments passed to [`SubchannelCallTracker::finish`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFinishArgs<'a> {
    pub backend_metrics: Option<&'a BackendMetricData>,
}

/// A successful pick: the subchannel to use plus an optional call tracker.
pub struct CompletePick {
    pub subchannel: Arc<dyn Subchannel>,
    pub call_tracker: Option<Box<dyn SubchannelCallTracker>>,
}

impl fmt::Debug for CompletePick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletePick")
            .field("subchannel", &self.subchannel)
            .field("has_call_tracker", &self.call_tracker.is_some())
            .finish()
    }
}

/// Outcome of a pick.
#[derive(Debug)]
pub enum PickResult {
    /// Use this subchannel.
    Complete(CompletePick),
    /// No subchannel is usable yet; queue until a new picker is published.
    Queue,
    /// Fail the request with this status.
    Fail(Status),
}

/// Services data-plane picks. Implementations must be cheap: they run once
/// per request on arbitrary threads.
pub trait SubchannelPicker: Send + Sync {
    fn pick(&self, args: PickArgs<'_>) -> PickResult;
}

/// Picker that queues every pick until a new picker is published.
#[derive(Debug, Default)]
pub struct QueuePicker;

impl SubchannelPicker for QueuePicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Queue
    }
}

/// Picker that fails every pick with a fixed status.
#[derive(Debug)]
pub struct FailurePicker {
    status: Status,
}

impl FailurePicker {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl SubchannelPicker for FailurePicker {
    fn pick(&self, _args: PickArgs<'_>) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}

/// Receives periodic out-of-band backend load reports.
pub trait LoadReportWatcher: Send + Sync {
    fn on_load_report(&self, report: &BackendMetricData);
}

/// Host-side handle for one endpoint's connection machinery.
///
/// The host delivers connectivity changes for the endpoint through
/// [`crate::policy::WeightedRoundRobin::on_endpoint_state_update`], quoting
/// the [`EndpointHandle`] the endpoint was created with.
pub trait EndpointChild: Send {
    /// Asks an IDLE endpoint to start connecting.
    fn exit_idle(&self);
    /// Resets the endpoint's connection backoff.
    fn reset_backoff(&self);
    /// Subscribes a periodic out-of-band load report watcher on the
    /// endpoint's connections.
    fn watch_load_reports(&self, period: Duration, watcher: Arc<dyn LoadReportWatcher>);
}

/// Channel-control helper consumed by the policy. All methods run in the
/// host's work-serializer domain.
pub trait ChannelController {
    /// Creates the connection machinery for one endpoint.
    fn create_endpoint(
        &mut self,
        handle: EndpointHandle,
        addresses: &EndpointAddresses,
    ) -> Result<Box<dyn EndpointChild>, Status>;

    /// Publishes a new aggregate state and picker to the channel.
    fn update_state(
        &mut self,
        state: ConnectivityState,
        status: Option<Status>,
        picker: Arc<dyn SubchannelPicker>,
    );

    /// Target string of the channel, used as a metric label.
    fn target(&self) -> &str;
}

/// Identifies an endpoint within one generation of the endpoint list.
///
/// Handed to [`ChannelController::create_endpoint`] and echoed back with
/// every state notification; notifications quoting a retired generation are
/// ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointHandle {
    pub(crate) list: u64,
    pub(crate) index: usize,
}

/// Addresses of one logical endpoint (one backend, possibly multihomed).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddresses {
    addresses: Vec<SocketAddr>,
}

impl EndpointAddresses {
    pub fn new(addresses: Vec<SocketAddr>) -> Self {
        Self { addresses }
    }

    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Order-insensitive identity of this endpoint.
    pub fn address_set(&self) -> EndpointAddressSet {
        EndpointAddressSet(self.addresses.iter().copied().collect())
    }
}

impl From<SocketAddr> for EndpointAddresses {
    fn from(addr: SocketAddr) -> Self {
        Self::new(vec![addr])
    }
}

impl fmt::Display for EndpointAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, addr) in self.addresses.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("]")
    }
}

/// Unordered-set identity of an endpoint, used to match weight state across
/// resolver updates. Ordered lexicographically over the sorted addresses
/// (std `SocketAddr` order: IP, then port).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct EndpointAddressSet(BTreeSet<SocketAddr>);

impl fmt::Display for EndpointAddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("}")
    }
}

/// One resolver update delivered to the policy.
#[derive(Debug)]
pub struct ResolverUpdate {
    /// Resolved endpoints, or the resolver's error status.
    pub addresses: Result<Vec<EndpointAddresses>, Status>,
    /// Policy configuration attached to this update.
    pub config: WeightedRoundRobinConfig,
    /// Optional note describing how resolution went; appended to failure
    /// statuses reported while this update's list is current.
    pub resolution_note: Option<String>,
}
