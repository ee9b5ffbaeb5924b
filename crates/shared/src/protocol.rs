use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    domain::{ControllerSchema, Field, FieldValue, LightState, Mode, ParamName},
    error::{ApiError, CodecError},
};

/// A single requested change, as carried by a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Change {
    Power { on: bool },
    Mode { mode: Mode },
    SetParam { name: ParamName, value: i64 },
}

impl Change {
    pub fn from_parts(field: Field, value: FieldValue) -> Option<Self> {
        match (field, value) {
            (Field::Power, FieldValue::Switch(on)) => Some(Self::Power { on }),
            (Field::Mode, FieldValue::Mode(mode)) => Some(Self::Mode { mode }),
            (Field::Param(name), FieldValue::Level(value)) => Some(Self::SetParam { name, value }),
            _ => None,
        }
    }

    pub fn field(&self) -> Field {
        match self {
            Self::Power { .. } => Field::Power,
            Self::Mode { .. } => Field::Mode,
            Self::SetParam { name, .. } => Field::Param(name.clone()),
        }
    }

    pub fn value(&self) -> FieldValue {
        match self {
            Self::Power { on } => FieldValue::Switch(*on),
            Self::Mode { mode } => FieldValue::Mode(mode.clone()),
            Self::SetParam { value, .. } => FieldValue::Level(*value),
        }
    }

    pub fn validate(&self, schema: &ControllerSchema) -> Result<(), CodecError> {
        match self {
            Self::Power { .. } => Ok(()),
            Self::Mode { mode } if schema.knows_mode(mode) => Ok(()),
            Self::Mode { mode } => Err(CodecError::UnknownMode(mode.to_string())),
            Self::SetParam { name, value } => {
                let spec = schema
                    .param(name)
                    .ok_or_else(|| CodecError::malformed(format!("unknown parameter {name}")))?;
                if spec.contains(*value) {
                    Ok(())
                } else {
                    Err(CodecError::malformed(format!(
                        "parameter {name} value {value} outside [{}, {}]",
                        spec.min, spec.max
                    )))
                }
            }
        }
    }
}

/// Wire-level request sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub seq: u64,
    #[serde(flatten)]
    pub change: Change,
}

/// Full or partial state pushed by the controller.
///
/// `ack_seq` names the latest command this frame reflects, or 0 when the push
/// was not caused by a command from this client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFrame {
    #[serde(default)]
    pub ack_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<ParamName, i64>,
    #[serde(flatten)]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl StateFrame {
    pub fn full(state: &LightState, ack_seq: u64) -> Self {
        Self {
            ack_seq,
            power: Some(state.power),
            mode: Some(state.mode.clone()),
            parameters: state.parameters.clone(),
            extensions: state.extensions.clone(),
        }
    }

    pub fn is_unsolicited(&self) -> bool {
        self.ack_seq == 0
    }

    pub fn value(&self, field: &Field) -> Option<FieldValue> {
        match field {
            Field::Power => self.power.map(FieldValue::Switch),
            Field::Mode => self.mode.clone().map(FieldValue::Mode),
            Field::Param(name) => self.parameters.get(name).copied().map(FieldValue::Level),
        }
    }

    /// Fields this frame carries a value for, in a stable order.
    pub fn mentioned_fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if self.power.is_some() {
            fields.push(Field::Power);
        }
        if self.mode.is_some() {
            fields.push(Field::Mode);
        }
        fields.extend(self.parameters.keys().cloned().map(Field::Param));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    Command(Command),
    Sync,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControllerMessage {
    State(StateFrame),
    Schema(ControllerSchema),
    Error(ApiError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeRequest {
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRequest {
    pub value: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeqQuery {
    #[serde(default)]
    pub seq: Option<u64>,
}
