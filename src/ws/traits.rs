//! Seams between the connection layer and its collaborators.

use tokio::sync::mpsc;

use crate::frame::{Acknowledgement, InboundFrame, TelemetryUpdate};

/// Frame codec trait for converting raw binary frames to and from the frame model.
///
/// The default implementation is [`crate::proto::ProtoCodec`]. Swapping the codec lets the
/// connection layer speak a different wire schema without touching dispatch or lifecycle code.
///
/// # Example
///
/// ```ignore
/// pub struct MyCodec;
///
/// impl FrameCodec for MyCodec {
///     fn decode(&self, bytes: &[u8]) -> crate::Result<InboundFrame> {
///         Ok(InboundFrame::Unknown)
///     }
///
///     fn encode_ack(&self, ack: &Acknowledgement) -> crate::Result<Vec<u8>> {
///         Ok(Vec::new())
///     }
/// }
/// ```
pub trait FrameCodec: Send + Sync + 'static {
    /// Decode one inbound binary frame.
    ///
    /// Payload variants the codec does not recognize must decode to [`InboundFrame::Unknown`]
    /// rather than an error.
    fn decode(&self, bytes: &[u8]) -> crate::Result<InboundFrame>;

    /// Encode an acknowledgment for transmission.
    fn encode_ack(&self, ack: &Acknowledgement) -> crate::Result<Vec<u8>>;
}

/// Destination for decoded vehicle telemetry.
///
/// Called from the connection task for every frame, so implementations must return quickly
/// and hand any slow work to a channel or spawned task.
pub trait TelemetrySink: Send + Sync + 'static {
    fn on_update(&self, update: TelemetryUpdate);

    /// Called when the service announces the vehicles assigned to the account.
    fn on_assigned_vehicles(&self, vins: &[String]) {
        _ = vins;
    }
}

impl TelemetrySink for mpsc::UnboundedSender<TelemetryUpdate> {
    fn on_update(&self, update: TelemetryUpdate) {
        if self.send(update).is_err() {
            #[cfg(feature = "tracing")]
            tracing::debug!("Telemetry receiver dropped, discarding update");
        }
    }
}

/// Sink that drops every update. Used until [`crate::ws::ConnectionManager::connect`]
/// registers a real one.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardTelemetry;

impl TelemetrySink for DiscardTelemetry {
    fn on_update(&self, update: TelemetryUpdate) {
        #[cfg(feature = "tracing")]
        tracing::trace!(vin = %update.vin, "No telemetry sink registered, dropping update");
        #[cfg(not(feature = "tracing"))]
        let _ = &update;
    }
}
