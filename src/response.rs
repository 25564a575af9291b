//! The `S_OK` / `S_ERROR` result envelope.
//!
//! On the wire an envelope is a map: `{"OK": true, "Value": v}` or
//! `{"OK": false, "Message": m, "Errno": code}`. Handlers produce raw
//! [`Value`]s which are checked with [`Envelope::from_value`] before they are
//! allowed onto the connection.

use rmpv::Value;

use crate::errors::DispatchError;

const KEY_OK: &str = "OK";
const KEY_VALUE: &str = "Value";
const KEY_MESSAGE: &str = "Message";
const KEY_ERRNO: &str = "Errno";

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Ok(Value),
    Error { message: String, code: Option<i64> },
}

impl Envelope {
    pub fn ok(value: impl Into<Value>) -> Self {
        Self::Ok(value.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: i64) -> Self {
        Self::Error {
            message: message.into(),
            code: Some(code),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Self::Ok(value) => Some(value),
            Self::Error { .. } => None,
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::Error { message, .. } => Some(message),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            Self::Ok(value) => Value::Map(vec![
                (Value::from(KEY_OK), Value::Boolean(true)),
                (Value::from(KEY_VALUE), value),
            ]),
            Self::Error { message, code } => {
                let mut entries = vec![
                    (Value::from(KEY_OK), Value::Boolean(false)),
                    (Value::from(KEY_MESSAGE), Value::from(message)),
                ];
                if let Some(code) = code {
                    entries.push((Value::from(KEY_ERRNO), Value::from(code)));
                }
                Value::Map(entries)
            }
        }
    }

    /// Checks that `value` is a well-formed envelope.
    pub fn from_value(value: Value) -> Result<Self, String> {
        let Value::Map(entries) = value else {
            return Err(format!("expected an S_OK/S_ERROR map, got {}", kind_name(&value)));
        };

        let mut ok = None;
        let mut inner = None;
        let mut message = None;
        let mut code = None;
        for (key, entry) in entries {
            match key.as_str() {
                Some(KEY_OK) => ok = Some(entry),
                Some(KEY_VALUE) => inner = Some(entry),
                Some(KEY_MESSAGE) => message = Some(entry),
                Some(KEY_ERRNO) => code = Some(entry),
                _ => {}
            }
        }

        match ok {
            Some(Value::Boolean(true)) => inner
                .map(Self::Ok)
                .ok_or_else(|| "S_OK without a Value entry".to_string()),
            Some(Value::Boolean(false)) => {
                let message = match message {
                    Some(Value::String(message)) => message
                        .into_str()
                        .ok_or_else(|| "S_ERROR Message is not valid UTF-8".to_string())?,
                    Some(other) => {
                        return Err(format!("S_ERROR Message is {}, expected str", kind_name(&other)))
                    }
                    None => return Err("S_ERROR without a Message entry".to_string()),
                };
                let code = match code {
                    None | Some(Value::Nil) => None,
                    Some(value) => Some(
                        value
                            .as_i64()
                            .ok_or_else(|| "S_ERROR Errno is not an integer".to_string())?,
                    ),
                };
                Ok(Self::Error { message, code })
            }
            Some(other) => Err(format!("OK entry is {}, expected bool", kind_name(&other))),
            None => Err("missing OK entry".to_string()),
        }
    }
}

impl From<DispatchError> for Envelope {
    fn from(err: DispatchError) -> Self {
        Envelope::error(err.to_string())
    }
}

/// `S_OK(value)` as a raw value, the form handlers return.
pub fn s_ok(value: impl Into<Value>) -> Value {
    Envelope::ok(value).into_value()
}

/// `S_ERROR(message)` as a raw value, the form handlers return.
pub fn s_error(message: impl Into<String>) -> Value {
    Envelope::error(message).into_value()
}

fn kind_name(value: &Value) -> &'static str {
    crate::arguments::ValueType::of(value).name()
}
