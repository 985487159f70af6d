//! Protobuf envelope of the push channel and the default [`FrameCodec`].
//!
//! Only the envelope fields the connection layer routes on are modelled here. Business
//! payloads (command bodies, attribute semantics) stay opaque.
#![expect(
    clippy::exhaustive_structs,
    clippy::exhaustive_enums,
    reason = "Wire schema types mirror the protobuf definition one to one"
)]

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use prost::Message;
use uuid::Uuid;

use crate::Result;
use crate::frame::{
    Acknowledgement, Attribute, AttributeMap, AttributeValue, CommandErrorDetail,
    CommandStatusBatch, CommandStatusUpdate, InboundFrame, TelemetryBatch, TelemetryUpdate,
};
use crate::ws::FrameCodec;

/// Message pushed by the service.
#[derive(Clone, PartialEq, Message)]
pub struct PushMessage {
    #[prost(string, tag = "1")]
    pub tracking_id: String,
    #[prost(oneof = "push_message::Msg", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub msg: Option<push_message::Msg>,
}

pub mod push_message {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Msg {
        #[prost(message, tag = "2")]
        VepUpdates(super::VepUpdates),
        #[prost(message, tag = "3")]
        CommandStatusUpdates(super::CommandStatusUpdates),
        #[prost(string, tag = "4")]
        DebugMessage(String),
        #[prost(message, tag = "5")]
        AssignedVehicles(super::AssignedVehicles),
        #[prost(message, tag = "6")]
        PendingCommandRequest(super::PendingCommandRequest),
        #[prost(message, tag = "7")]
        ServiceStatusUpdates(super::ServiceStatusUpdates),
        #[prost(message, tag = "8")]
        UserDataUpdate(super::UserDataUpdate),
    }
}

/// Vehicle state updates keyed by VIN.
#[derive(Clone, PartialEq, Message)]
pub struct VepUpdates {
    #[prost(map = "string, message", tag = "1")]
    pub updates: HashMap<String, VepUpdate>,
    #[prost(int32, optional, tag = "2")]
    pub sequence_number: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VepUpdate {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(bool, tag = "2")]
    pub full_update: bool,
    #[prost(int64, tag = "3")]
    pub emit_timestamp_in_ms: i64,
    #[prost(map = "string, message", tag = "4")]
    pub attributes: HashMap<String, AttributeStatus>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AttributeStatus {
    #[prost(int64, tag = "1")]
    pub timestamp_in_ms: i64,
    #[prost(int32, tag = "2")]
    pub status: i32,
    #[prost(oneof = "attribute_status::Value", tags = "3, 4, 5, 6")]
    pub value: Option<attribute_status::Value>,
}

pub mod attribute_status {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Value {
        #[prost(bool, tag = "3")]
        BoolValue(bool),
        #[prost(int64, tag = "4")]
        IntValue(i64),
        #[prost(double, tag = "5")]
        DoubleValue(f64),
        #[prost(string, tag = "6")]
        StringValue(String),
    }
}

/// Command progress keyed by VIN.
#[derive(Clone, PartialEq, Message)]
pub struct CommandStatusUpdates {
    #[prost(map = "string, message", tag = "1")]
    pub updates_by_vin: HashMap<String, VehicleCommandStatuses>,
    #[prost(int32, optional, tag = "2")]
    pub sequence_number: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct VehicleCommandStatuses {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(message, repeated, tag = "2")]
    pub statuses: Vec<CommandStatus>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommandStatus {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(int32, tag = "2")]
    pub command_type: i32,
    #[prost(int32, tag = "3")]
    pub state: i32,
    #[prost(message, repeated, tag = "4")]
    pub errors: Vec<CommandErrorStatus>,
    #[prost(int64, tag = "5")]
    pub timestamp_in_ms: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct CommandErrorStatus {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AssignedVehicles {
    #[prost(string, repeated, tag = "1")]
    pub vins: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct PendingCommandRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceStatusUpdates {
    #[prost(int32, optional, tag = "1")]
    pub sequence_number: Option<i32>,
    #[prost(message, repeated, tag = "2")]
    pub updates: Vec<ServiceStatusUpdate>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ServiceStatusUpdate {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(map = "int32, int32", tag = "2")]
    pub services: HashMap<i32, i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct UserDataUpdate {
    #[prost(int32, optional, tag = "1")]
    pub sequence_number: Option<i32>,
}

/// Message sent by the client.
#[derive(Clone, PartialEq, Message)]
pub struct ClientMessage {
    #[prost(string, tag = "1")]
    pub tracking_id: String,
    #[prost(oneof = "client_message::Msg", tags = "2, 3, 4, 5, 6, 7")]
    pub msg: Option<client_message::Msg>,
}

pub mod client_message {
    use prost::Oneof;

    #[derive(Clone, PartialEq, Oneof)]
    pub enum Msg {
        #[prost(message, tag = "2")]
        AcknowledgeVepUpdates(super::SequenceAcknowledgement),
        #[prost(message, tag = "3")]
        AcknowledgeCommandStatusUpdates(super::SequenceAcknowledgement),
        #[prost(message, tag = "4")]
        AcknowledgeAssignedVehicles(super::AcknowledgeAssignedVehicles),
        #[prost(message, tag = "5")]
        AcknowledgeServiceStatusUpdates(super::SequenceAcknowledgement),
        #[prost(message, tag = "6")]
        AcknowledgeUserDataUpdate(super::SequenceAcknowledgement),
        #[prost(message, tag = "7")]
        CommandRequest(super::CommandRequest),
    }
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct SequenceAcknowledgement {
    #[prost(int32, tag = "1")]
    pub sequence_number: i32,
}

#[derive(Clone, Copy, PartialEq, Message)]
pub struct AcknowledgeAssignedVehicles {}

#[derive(Clone, PartialEq, Message)]
pub struct CommandRequest {
    #[prost(string, tag = "1")]
    pub vin: String,
    #[prost(string, tag = "2")]
    pub request_id: String,
    #[prost(int32, tag = "3")]
    pub command_type: i32,
    /// Serialized business payload of the command
    #[prost(bytes = "vec", tag = "4")]
    pub body: Vec<u8>,
}

/// [`FrameCodec`] for the protobuf envelope above.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtoCodec;

impl ProtoCodec {
    /// Wrap an already serialized command body into a client frame ready for
    /// [`crate::ws::ConnectionManager::send_command`].
    #[must_use]
    pub fn encode_command(
        &self,
        vin: &str,
        request_id: &str,
        command_type: i32,
        body: Vec<u8>,
    ) -> Vec<u8> {
        client_frame(client_message::Msg::CommandRequest(CommandRequest {
            vin: vin.to_owned(),
            request_id: request_id.to_owned(),
            command_type,
            body,
        }))
    }
}

impl FrameCodec for ProtoCodec {
    fn decode(&self, bytes: &[u8]) -> Result<InboundFrame> {
        let message = PushMessage::decode(bytes)?;
        Ok(message.into())
    }

    fn encode_ack(&self, ack: &Acknowledgement) -> Result<Vec<u8>> {
        use client_message::Msg;

        let msg = match *ack {
            Acknowledgement::Telemetry { sequence_number } => {
                Msg::AcknowledgeVepUpdates(SequenceAcknowledgement { sequence_number })
            }
            Acknowledgement::CommandStatus { sequence_number } => {
                Msg::AcknowledgeCommandStatusUpdates(SequenceAcknowledgement { sequence_number })
            }
            Acknowledgement::AssignedVehicles => {
                Msg::AcknowledgeAssignedVehicles(AcknowledgeAssignedVehicles {})
            }
            Acknowledgement::ServiceStatus { sequence_number } => {
                Msg::AcknowledgeServiceStatusUpdates(SequenceAcknowledgement { sequence_number })
            }
            Acknowledgement::UserData { sequence_number } => {
                Msg::AcknowledgeUserDataUpdate(SequenceAcknowledgement { sequence_number })
            }
        };

        Ok(client_frame(msg))
    }
}

fn client_frame(msg: client_message::Msg) -> Vec<u8> {
    ClientMessage {
        tracking_id: Uuid::new_v4().to_string(),
        msg: Some(msg),
    }
    .encode_to_vec()
}

fn timestamp(millis: i64) -> Option<DateTime<Utc>> {
    if millis == 0 {
        return None;
    }
    DateTime::from_timestamp_millis(millis)
}

/// Map keys and embedded VINs are both populated by the service; prefer the embedded one.
fn vin_or_key(vin: String, key: String) -> String {
    if vin.is_empty() { key } else { vin }
}

impl From<PushMessage> for InboundFrame {
    fn from(message: PushMessage) -> Self {
        use push_message::Msg;

        match message.msg {
            Some(Msg::VepUpdates(updates)) => InboundFrame::Telemetry(updates.into()),
            Some(Msg::CommandStatusUpdates(updates)) => {
                InboundFrame::CommandStatus(updates.into())
            }
            Some(Msg::DebugMessage(text)) => InboundFrame::Debug(text),
            Some(Msg::AssignedVehicles(assigned)) => InboundFrame::AssignedVehicles(assigned.vins),
            Some(Msg::PendingCommandRequest(_)) => InboundFrame::PendingCommandRequest,
            Some(Msg::ServiceStatusUpdates(updates)) => InboundFrame::ServiceStatus {
                sequence_number: updates.sequence_number,
                vins: updates.updates.into_iter().map(|update| update.vin).collect(),
            },
            Some(Msg::UserDataUpdate(update)) => InboundFrame::UserData {
                sequence_number: update.sequence_number,
            },
            None => InboundFrame::Unknown,
        }
    }
}

impl From<VepUpdates> for TelemetryBatch {
    fn from(message: VepUpdates) -> Self {
        let mut updates: Vec<TelemetryUpdate> = message
            .updates
            .into_iter()
            .map(|(key, update)| {
                let attributes: AttributeMap = update
                    .attributes
                    .into_iter()
                    .map(|(name, status)| (name, status.into()))
                    .collect();

                TelemetryUpdate::new(vin_or_key(update.vin, key), update.full_update, attributes)
                    .with_emitted_at(timestamp(update.emit_timestamp_in_ms))
            })
            .collect();
        updates.sort_by(|a, b| a.vin.cmp(&b.vin));

        TelemetryBatch::new(message.sequence_number, updates)
    }
}

impl From<AttributeStatus> for Attribute {
    fn from(status: AttributeStatus) -> Self {
        use attribute_status::Value;

        let value = status.value.map(|value| match value {
            Value::BoolValue(v) => AttributeValue::Bool(v),
            Value::IntValue(v) => AttributeValue::Int(v),
            Value::DoubleValue(v) => AttributeValue::Double(v),
            Value::StringValue(v) => AttributeValue::Text(v),
        });

        Attribute::new(value, status.status).with_changed_at(timestamp(status.timestamp_in_ms))
    }
}

impl From<CommandStatusUpdates> for CommandStatusBatch {
    fn from(message: CommandStatusUpdates) -> Self {
        let mut by_vin: Vec<(String, VehicleCommandStatuses)> =
            message.updates_by_vin.into_iter().collect();
        by_vin.sort_by(|a, b| a.0.cmp(&b.0));

        let statuses = by_vin
            .into_iter()
            .flat_map(|(key, vehicle)| {
                let vin = vin_or_key(vehicle.vin, key);
                vehicle.statuses.into_iter().map(move |status| {
                    let errors = status
                        .errors
                        .into_iter()
                        .map(|error| CommandErrorDetail::new(error.code, error.message))
                        .collect();

                    CommandStatusUpdate::new(vin.clone(), status.request_id, status.state)
                        .with_command_type(status.command_type)
                        .with_errors(errors)
                })
            })
            .collect();

        CommandStatusBatch::new(message.sequence_number, statuses)
    }
}
