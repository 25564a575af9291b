//! Declared argument types for exported methods and messages.

use std::fmt;

use rmpv::Value;

use crate::errors::DispatchError;

/// Coarse kind of a [`Value`], the unit argument specs are written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Nil,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Map,
    Ext,
}

impl ValueType {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Nil => Self::Nil,
            Value::Boolean(_) => Self::Bool,
            Value::Integer(_) => Self::Int,
            Value::F32(_) | Value::F64(_) => Self::Float,
            Value::String(_) => Self::Str,
            Value::Binary(_) => Self::Bytes,
            Value::Array(_) => Self::List,
            Value::Map(_) => Self::Map,
            Value::Ext(_, _) => Self::Ext,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nil => "none",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Str => "str",
            Self::Bytes => "bytes",
            Self::List => "list",
            Self::Map => "dict",
            Self::Ext => "ext",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Constraint on one positional slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeConstraint {
    Any,
    Exactly(ValueType),
    OneOf(Vec<ValueType>),
}

impl TypeConstraint {
    pub fn accepts(&self, value: &Value) -> bool {
        let actual = ValueType::of(value);
        match self {
            Self::Any => true,
            Self::Exactly(expected) => *expected == actual,
            Self::OneOf(accepted) => accepted.contains(&actual),
        }
    }
}

impl From<ValueType> for TypeConstraint {
    fn from(value: ValueType) -> Self {
        Self::Exactly(value)
    }
}

impl fmt::Display for TypeConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Exactly(kind) => kind.fmt(f),
            Self::OneOf(kinds) => {
                let names: Vec<_> = kinds.iter().map(|kind| kind.name()).collect();
                write!(f, "one of ({})", names.join(", "))
            }
        }
    }
}

/// Ordered per-position constraints declared once per exported name.
///
/// Extra actual arguments beyond the declared slots are tolerated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArgumentSpec {
    slots: Vec<TypeConstraint>,
}

impl ArgumentSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slots<I, C>(slots: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<TypeConstraint>,
    {
        Self {
            slots: slots.into_iter().map(Into::into).collect(),
        }
    }

    pub fn arg(mut self, constraint: impl Into<TypeConstraint>) -> Self {
        self.slots.push(constraint.into());
        self
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn validate(&self, name: &str, args: &[Value]) -> Result<(), DispatchError> {
        if args.len() < self.slots.len() {
            return Err(DispatchError::TooFewArguments {
                name: name.to_string(),
                expected: self.slots.len(),
                actual: args.len(),
            });
        }

        for (position, (slot, arg)) in self.slots.iter().zip(args).enumerate() {
            if !slot.accepts(arg) {
                return Err(DispatchError::ArgumentType {
                    name: name.to_string(),
                    position,
                    expected: slot.to_string(),
                    actual: ValueType::of(arg).to_string(),
                });
            }
        }

        Ok(())
    }
}

/// How call arguments appear in the per-request log line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArgumentLogPolicy {
    /// Only the kinds of the arguments are logged.
    #[default]
    Masked,
    Verbatim,
}

impl ArgumentLogPolicy {
    pub fn summarize(self, args: &[Value]) -> String {
        let parts: Vec<String> = match self {
            Self::Masked => args.iter().map(|arg| ValueType::of(arg).to_string()).collect(),
            Self::Verbatim => args.iter().map(|arg| arg.to_string()).collect(),
        };
        format!("({})", parts.join(", "))
    }
}
