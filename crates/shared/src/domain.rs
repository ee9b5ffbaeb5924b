use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use serde::{Deserialize, Serialize};

macro_rules! name_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

name_newtype!(Mode);
name_newtype!(ParamName);

/// Declared range of a numeric parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: ParamName,
    pub min: i64,
    pub max: i64,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: ParamName::new(name),
            min,
            max,
        }
    }

    pub fn contains(&self, value: i64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Mode set and parameter schema advertised by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerSchema {
    pub modes: Vec<Mode>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl ControllerSchema {
    pub fn knows_mode(&self, mode: &Mode) -> bool {
        self.modes.contains(mode)
    }

    pub fn param(&self, name: &ParamName) -> Option<&ParamSpec> {
        self.params.iter().find(|spec| &spec.name == name)
    }

    /// The state a freshly started controller reports: off, first mode,
    /// every parameter at its minimum.
    pub fn initial_state(&self) -> LightState {
        LightState {
            power: false,
            mode: self.modes.first().cloned().unwrap_or_else(|| Mode::new("")),
            parameters: self
                .params
                .iter()
                .map(|spec| (spec.name.clone(), spec.min))
                .collect(),
            extensions: serde_json::Map::new(),
        }
    }

    /// Brings `state` back inside this schema after the schema changed.
    pub fn normalize(&self, state: &mut LightState) {
        if !self.knows_mode(&state.mode) {
            if let Some(first) = self.modes.first() {
                state.mode = first.clone();
            }
        }
        state
            .parameters
            .retain(|name, value| self.param(name).is_some_and(|spec| spec.contains(*value)));
        for spec in &self.params {
            state
                .parameters
                .entry(spec.name.clone())
                .or_insert(spec.min);
        }
    }
}

impl Default for ControllerSchema {
    fn default() -> Self {
        Self {
            modes: ["foo", "bar", "baz", "boo"].into_iter().map(Mode::from).collect(),
            params: vec![ParamSpec::new("foo", 25, 175)],
        }
    }
}

/// Last-known-good state of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LightState {
    pub power: bool,
    pub mode: Mode,
    pub parameters: BTreeMap<ParamName, i64>,
    /// Optional fields this build does not understand, kept verbatim.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extensions: serde_json::Map<String, serde_json::Value>,
}

impl LightState {
    pub fn value(&self, field: &Field) -> Option<FieldValue> {
        match field {
            Field::Power => Some(FieldValue::Switch(self.power)),
            Field::Mode => Some(FieldValue::Mode(self.mode.clone())),
            Field::Param(name) => self.parameters.get(name).copied().map(FieldValue::Level),
        }
    }

    /// Writes a single field. Callers validate against the schema first.
    pub fn set(&mut self, field: &Field, value: FieldValue) {
        match (field, value) {
            (Field::Power, FieldValue::Switch(on)) => self.power = on,
            (Field::Mode, FieldValue::Mode(mode)) => self.mode = mode,
            (Field::Param(name), FieldValue::Level(level)) => {
                self.parameters.insert(name.clone(), level);
            }
            _ => {}
        }
    }

    pub fn fields(&self) -> BTreeSet<Field> {
        let mut fields = BTreeSet::from([Field::Power, Field::Mode]);
        fields.extend(self.parameters.keys().cloned().map(Field::Param));
        fields
    }
}

/// Addressable piece of light state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Field {
    Power,
    Mode,
    Param(ParamName),
}

impl Field {
    pub fn param(name: impl Into<String>) -> Self {
        Self::Param(ParamName::new(name))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power => f.write_str("power"),
            Self::Mode => f.write_str("mode"),
            Self::Param(name) => write!(f, "param:{name}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Switch(bool),
    Mode(Mode),
    Level(i64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(true) => f.write_str("on"),
            Self::Switch(false) => f.write_str("off"),
            Self::Mode(mode) => write!(f, "{mode}"),
            Self::Level(level) => write!(f, "{level}"),
        }
    }
}
