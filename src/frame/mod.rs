//! Decoded frames exchanged on the push channel.
//!
//! These types are codec independent: a [`crate::ws::FrameCodec`] turns raw bytes into an
//! [`InboundFrame`] and turns an [`Acknowledgement`] back into bytes. Nothing in
//! [`crate::dispatch`] or [`crate::ws`] looks at the wire format itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Flat attribute map handed to the telemetry sink, keyed by attribute name.
pub type AttributeMap = BTreeMap<String, Attribute>;

/// One decoded push message. Exactly one variant is populated per frame.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Vehicle state updates, one entry per vehicle
    Telemetry(TelemetryBatch),
    /// Progress of previously submitted commands
    CommandStatus(CommandStatusBatch),
    /// Free-form diagnostic text from the service
    Debug(String),
    /// The set of vehicles currently assigned to the account
    AssignedVehicles(Vec<String>),
    /// The service asks the client about commands it still considers open
    PendingCommandRequest,
    /// Availability of vehicle services changed
    ServiceStatus {
        sequence_number: Option<i32>,
        vins: Vec<String>,
    },
    /// Account level data changed
    UserData { sequence_number: Option<i32> },
    /// A payload variant this client does not know about
    Unknown,
}

impl InboundFrame {
    /// Short variant name used in log fields.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Telemetry(_) => "telemetry",
            Self::CommandStatus(_) => "command_status",
            Self::Debug(_) => "debug",
            Self::AssignedVehicles(_) => "assigned_vehicles",
            Self::PendingCommandRequest => "pending_command_request",
            Self::ServiceStatus { .. } => "service_status",
            Self::UserData { .. } => "user_data",
            Self::Unknown => "unknown",
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TelemetryBatch {
    /// Present when the service expects the batch to be acknowledged
    pub sequence_number: Option<i32>,
    pub updates: Vec<TelemetryUpdate>,
}

impl TelemetryBatch {
    #[must_use]
    pub fn new(sequence_number: Option<i32>, updates: Vec<TelemetryUpdate>) -> Self {
        Self {
            sequence_number,
            updates,
        }
    }
}

/// State update for a single vehicle, as delivered to the telemetry sink.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelemetryUpdate {
    pub vin: String,
    /// `true` when `attributes` is a full snapshot rather than a delta
    pub full_update: bool,
    pub emitted_at: Option<DateTime<Utc>>,
    pub attributes: AttributeMap,
}

impl TelemetryUpdate {
    #[must_use]
    pub fn new(vin: String, full_update: bool, attributes: AttributeMap) -> Self {
        Self {
            vin,
            full_update,
            emitted_at: None,
            attributes,
        }
    }

    #[must_use]
    pub fn with_emitted_at(mut self, emitted_at: Option<DateTime<Utc>>) -> Self {
        self.emitted_at = emitted_at;
        self
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Attribute {
    pub value: Option<AttributeValue>,
    /// Service specific validity code, `0` meaning valid
    pub status: i32,
    pub changed_at: Option<DateTime<Utc>>,
}

impl Attribute {
    #[must_use]
    pub fn new(value: Option<AttributeValue>, status: i32) -> Self {
        Self {
            value,
            status,
            changed_at: None,
        }
    }

    #[must_use]
    pub fn with_changed_at(mut self, changed_at: Option<DateTime<Utc>>) -> Self {
        self.changed_at = changed_at;
        self
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
}

#[non_exhaustive]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandStatusBatch {
    pub sequence_number: Option<i32>,
    pub statuses: Vec<CommandStatusUpdate>,
}

impl CommandStatusBatch {
    #[must_use]
    pub fn new(sequence_number: Option<i32>, statuses: Vec<CommandStatusUpdate>) -> Self {
        Self {
            sequence_number,
            statuses,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandStatusUpdate {
    pub vin: String,
    pub request_id: String,
    pub command_type: i32,
    /// Raw state code, see [`crate::command::CommandState::from_code`]
    pub state: i32,
    pub errors: Vec<CommandErrorDetail>,
}

impl CommandStatusUpdate {
    #[must_use]
    pub fn new(vin: String, request_id: String, state: i32) -> Self {
        Self {
            vin,
            request_id,
            command_type: 0,
            state,
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_command_type(mut self, command_type: i32) -> Self {
        self.command_type = command_type;
        self
    }

    #[must_use]
    pub fn with_errors(mut self, errors: Vec<CommandErrorDetail>) -> Self {
        self.errors = errors;
        self
    }
}

/// Error detail attached to a failed command.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandErrorDetail {
    pub code: String,
    pub message: String,
}

impl CommandErrorDetail {
    #[must_use]
    pub fn new<C: Into<String>, M: Into<String>>(code: C, message: M) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Acknowledgment frames the client owes the service for certain push messages.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    Telemetry { sequence_number: i32 },
    CommandStatus { sequence_number: i32 },
    AssignedVehicles,
    ServiceStatus { sequence_number: i32 },
    UserData { sequence_number: i32 },
}
