//! Routing of decoded push frames.
//!
//! The [`Dispatcher`] decides, for every [`InboundFrame`], which collaborator sees it and
//! which [`Acknowledgement`] the service expects back. It never touches the socket; the
//! connection task writes whatever acknowledgment is returned.

use std::fmt;
use std::sync::Arc;

use crate::command::{CommandError, CommandState, CommandTracker};
use crate::frame::{Acknowledgement, CommandStatusBatch, InboundFrame, TelemetryBatch};
use crate::ws::TelemetrySink;

pub struct Dispatcher {
    tracker: CommandTracker,
    sink: Arc<dyn TelemetrySink>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(tracker: CommandTracker, sink: Arc<dyn TelemetrySink>) -> Self {
        Self { tracker, sink }
    }

    /// Route one frame and return the acknowledgment to send, if any.
    pub fn dispatch(&self, frame: InboundFrame) -> Option<Acknowledgement> {
        #[cfg(feature = "tracing")]
        tracing::trace!(kind = frame.kind(), "Dispatching frame");

        match frame {
            InboundFrame::Telemetry(batch) => self.on_telemetry(batch),
            InboundFrame::CommandStatus(batch) => self.on_command_status(batch),
            InboundFrame::AssignedVehicles(vins) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(count = vins.len(), "Assigned vehicles updated");

                self.sink.on_assigned_vehicles(&vins);
                Some(Acknowledgement::AssignedVehicles)
            }
            InboundFrame::ServiceStatus {
                sequence_number,
                vins,
            } => {
                #[cfg(feature = "tracing")]
                tracing::debug!(?vins, "Service status changed");
                #[cfg(not(feature = "tracing"))]
                let _ = &vins;

                sequence_number
                    .map(|sequence_number| Acknowledgement::ServiceStatus { sequence_number })
            }
            InboundFrame::UserData { sequence_number } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("User data changed");

                sequence_number.map(|sequence_number| Acknowledgement::UserData { sequence_number })
            }
            InboundFrame::Debug(text) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(%text, "Debug message from service");
                #[cfg(not(feature = "tracing"))]
                let _ = &text;

                None
            }
            InboundFrame::PendingCommandRequest => {
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    pending = self.tracker.len(),
                    "Service requested pending commands"
                );

                None
            }
            InboundFrame::Unknown => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Ignoring frame with unknown payload");

                None
            }
        }
    }

    fn on_telemetry(&self, batch: TelemetryBatch) -> Option<Acknowledgement> {
        for update in batch.updates {
            #[cfg(feature = "tracing")]
            tracing::trace!(
                vin = %update.vin,
                full = update.full_update,
                attributes = update.attributes.len(),
                "Telemetry update"
            );

            self.sink.on_update(update);
        }

        batch
            .sequence_number
            .map(|sequence_number| Acknowledgement::Telemetry { sequence_number })
    }

    fn on_command_status(&self, batch: CommandStatusBatch) -> Option<Acknowledgement> {
        for status in batch.statuses {
            let state = CommandState::from_code(status.state);

            #[cfg(feature = "tracing")]
            tracing::debug!(
                vin = %status.vin,
                request_id = %status.request_id,
                command_type = status.command_type,
                %state,
                "Command status update"
            );

            match state {
                CommandState::Finished => {
                    self.tracker.settle(&status.request_id, Ok(()));
                }
                CommandState::Failed => {
                    let error = CommandError::Failed {
                        request_id: status.request_id.clone(),
                        errors: status.errors,
                    };
                    self.tracker.settle(&status.request_id, Err(error));
                }
                // Not terminal yet; the command stays pending.
                _ => {}
            }
        }

        batch
            .sequence_number
            .map(|sequence_number| Acknowledgement::CommandStatus { sequence_number })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio::sync::oneshot::error::TryRecvError;

    use super::*;
    use crate::frame::{
        Attribute, AttributeMap, AttributeValue, CommandErrorDetail, CommandStatusUpdate,
        TelemetryUpdate,
    };

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn dispatcher() -> (
        Dispatcher,
        CommandTracker,
        mpsc::UnboundedReceiver<TelemetryUpdate>,
    ) {
        let tracker = CommandTracker::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(tracker.clone(), Arc::new(tx)), tracker, rx)
    }

    fn status(request_id: &str, state: i32) -> InboundFrame {
        InboundFrame::CommandStatus(CommandStatusBatch::new(
            Some(11),
            vec![CommandStatusUpdate::new(
                "WDD0001".to_owned(),
                request_id.to_owned(),
                state,
            )],
        ))
    }

    #[tokio::test]
    async fn telemetry_reaches_sink_and_is_acknowledged() {
        let (dispatcher, _, mut rx) = dispatcher();
        let mut attributes = AttributeMap::new();
        attributes.insert(
            "rangeelectric".to_owned(),
            Attribute::new(Some(AttributeValue::Double(212.5)), 0),
        );
        let frame = InboundFrame::Telemetry(TelemetryBatch::new(
            Some(3),
            vec![
                TelemetryUpdate::new("WDD0001".to_owned(), false, attributes),
                TelemetryUpdate::new("WDD0002".to_owned(), true, AttributeMap::new()),
            ],
        ));

        let ack = dispatcher.dispatch(frame);

        assert_eq!(ack, Some(Acknowledgement::Telemetry { sequence_number: 3 }));
        let first = rx.recv().await.unwrap();
        assert_eq!(first.vin, "WDD0001");
        assert!(!first.full_update, "partial update expected");
        assert!(first.attributes.contains_key("rangeelectric"), "attribute lost");
        let second = rx.recv().await.unwrap();
        assert!(second.full_update, "full update expected");
    }

    #[tokio::test]
    async fn telemetry_without_sequence_number_is_not_acknowledged() {
        let (dispatcher, _, _rx) = dispatcher();

        let ack = dispatcher.dispatch(InboundFrame::Telemetry(TelemetryBatch::default()));

        assert_eq!(ack, None);
    }

    #[tokio::test]
    async fn finished_status_resolves_pending_command() {
        let (dispatcher, tracker, _rx) = dispatcher();
        let receiver = tracker.register("abc", TIMEOUT).unwrap();

        let ack = dispatcher.dispatch(status("abc", 5));

        assert_eq!(
            ack,
            Some(Acknowledgement::CommandStatus {
                sequence_number: 11
            })
        );
        assert_eq!(receiver.await.unwrap(), Ok(()));
        assert!(tracker.is_empty(), "entry should be removed");
    }

    #[tokio::test]
    async fn failed_status_rejects_with_composed_error() {
        let (dispatcher, tracker, _rx) = dispatcher();
        let receiver = tracker.register("abc", TIMEOUT).unwrap();
        let frame = InboundFrame::CommandStatus(CommandStatusBatch::new(
            None,
            vec![
                CommandStatusUpdate::new("WDD0001".to_owned(), "abc".to_owned(), 6)
                    .with_errors(vec![CommandErrorDetail::new("42", "denied")]),
            ],
        ));

        let ack = dispatcher.dispatch(frame);

        assert_eq!(ack, None);
        let error = receiver.await.unwrap().unwrap_err();
        let message = error.to_string();
        assert!(message.contains("denied"), "{message}");
        assert!(message.contains("42"), "{message}");
    }

    #[tokio::test]
    async fn intermediate_states_leave_command_pending() {
        let (dispatcher, tracker, _rx) = dispatcher();
        let mut receiver = tracker.register("abc", TIMEOUT).unwrap();

        for state in [0, 1, 2, 3, 4, 77] {
            dispatcher.dispatch(status("abc", state));
        }

        assert!(tracker.contains("abc"), "non-terminal state settled the command");
        assert_eq!(receiver.try_recv(), Err(TryRecvError::Empty));
    }

    #[tokio::test]
    async fn unknown_request_id_has_no_effect() {
        let (dispatcher, tracker, _rx) = dispatcher();
        let _receiver = tracker.register("abc", TIMEOUT).unwrap();

        let ack = dispatcher.dispatch(status("zzz", 5));

        assert_eq!(
            ack,
            Some(Acknowledgement::CommandStatus {
                sequence_number: 11
            })
        );
        assert!(tracker.contains("abc"), "unrelated command settled");
    }

    #[tokio::test]
    async fn administrative_frames_get_their_acknowledgements() {
        let (dispatcher, _, _rx) = dispatcher();

        assert_eq!(
            dispatcher.dispatch(InboundFrame::AssignedVehicles(vec!["WDD0001".to_owned()])),
            Some(Acknowledgement::AssignedVehicles)
        );
        assert_eq!(
            dispatcher.dispatch(InboundFrame::ServiceStatus {
                sequence_number: Some(4),
                vins: vec!["WDD0001".to_owned()],
            }),
            Some(Acknowledgement::ServiceStatus { sequence_number: 4 })
        );
        assert_eq!(
            dispatcher.dispatch(InboundFrame::UserData {
                sequence_number: Some(5)
            }),
            Some(Acknowledgement::UserData { sequence_number: 5 })
        );
        assert_eq!(
            dispatcher.dispatch(InboundFrame::Debug("hello".to_owned())),
            None
        );
        assert_eq!(dispatcher.dispatch(InboundFrame::PendingCommandRequest), None);
        assert_eq!(dispatcher.dispatch(InboundFrame::Unknown), None);
    }
}
