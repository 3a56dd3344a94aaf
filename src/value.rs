use std::{collections::BTreeMap, future::Future, rc::Rc};

use futures_util::{
    FutureExt,
    future::{LocalBoxFuture, Shared},
};

use crate::{
    error::RenderResult,
    eventually::Eventually,
    renderable::Renderable,
    scope::Environment,
};

type NativeFn = dyn Fn(&Environment, Vec<Value>) -> Eventually<Value>;

/// A host function callable from templates.
///
/// Functions receive the environment of the block that called them, so a
/// builtin can reach the fragment resolver or the caller's embedded contents.
#[derive(Clone)]
pub struct Function(Rc<NativeFn>);

impl Function {
    /// A plain synchronous function of its arguments.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> Value + 'static,
    {
        Self(Rc::new(move |_, args| Eventually::ready(f(&args))))
    }

    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&[Value]) -> RenderResult<Value> + 'static,
    {
        Self(Rc::new(move |_, args| Eventually::Ready(f(&args))))
    }

    pub fn with_env<F>(f: F) -> Self
    where
        F: Fn(&Environment, Vec<Value>) -> Eventually<Value> + 'static,
    {
        Self(Rc::new(f))
    }

    /// A function whose result arrives later, e.g. from IO.
    pub fn deferred<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + 'static,
        Fut: Future<Output = RenderResult<Value>> + 'static,
    {
        Self(Rc::new(move |_, args| Eventually::defer(f(args))))
    }

    pub fn call(&self, env: &Environment, args: Vec<Value>) -> Eventually<Value> {
        (self.0)(env, args)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Function")
    }
}

/// A value still being computed. Cloning shares the computation, so any
/// number of readers await one result.
#[derive(Clone)]
pub struct Deferred(Shared<LocalBoxFuture<'static, RenderResult<Value>>>);

impl Deferred {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = RenderResult<Value>> + 'static,
    {
        // A deferred that settles to another deferred is awaited through.
        let flattened = async move { Eventually::from_value(future.await?).await };
        Self(flattened.boxed_local().shared())
    }

    /// The settled result, if the computation has already completed.
    pub fn peek(&self) -> Option<&RenderResult<Value>> {
        self.0.peek()
    }

    pub fn eventually(&self) -> Eventually<Value> {
        match self.peek() {
            Some(result) => Eventually::Ready(result.clone()),
            None => Eventually::Pending(self.0.clone().boxed_local()),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.peek() {
            Some(result) => f.debug_tuple("Deferred").field(result).finish(),
            None => f.write_str("Deferred(<pending>)"),
        }
    }
}

/// A dynamically typed template value.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<Vec<Value>>),
    Object(Rc<BTreeMap<String, Value>>),
    Function(Function),
    Renderable(Renderable),
    Deferred(Deferred),
}

/// Formats a number the way templates print it: integers without a fraction,
/// very large and very small magnitudes in exponent form.
pub fn format_number(number: f64) -> String {
    if number.is_nan() {
        return "NaN".to_string();
    }
    if number.is_infinite() {
        return if number > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if number == 0.0 {
        return "0".to_string();
    }
    let magnitude = number.abs();
    if !(1e-6..1e21).contains(&magnitude) {
        let formatted = format!("{:e}", number);
        return match formatted.split_once('e') {
            Some((mantissa, exponent)) if !exponent.starts_with('-') => {
                format!("{}e+{}", mantissa, exponent)
            }
            _ => formatted,
        };
    }
    format!("{}", number)
}

/// Parses a string as a number with loose rules: surrounding whitespace is
/// ignored and the empty string is zero.
fn parse_number(text: &str) -> f64 {
    let trimmed = text.trim();
    match trimmed {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ if trimmed
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-')) =>
        {
            trimmed.parse().unwrap_or(f64::NAN)
        }
        _ => f64::NAN,
    }
}

/// `number` as an index below `len`, if it is a whole number in range.
pub fn as_index(number: f64, len: usize) -> Option<usize> {
    if number.fract() != 0.0 || number < 0.0 || !number.is_finite() {
        return None;
    }
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "checked non-negative and integral above"
    )]
    let index = number as usize;
    (index < len).then_some(index)
}

impl Value {
    pub fn string<S: AsRef<str>>(text: S) -> Self {
        Self::String(Rc::from(text.as_ref()))
    }

    pub fn array<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Self>,
    {
        Self::Array(Rc::new(items.into_iter().map(Into::into).collect()))
    }

    pub fn object<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Self>,
    {
        Self::Object(Rc::new(
            fields
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ))
    }

    pub const fn is_undefined(&self) -> bool {
        matches!(self, Self::Undefined)
    }

    /// `undefined` or `null`.
    pub const fn is_nullish(&self) -> bool {
        matches!(self, Self::Undefined | Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(text) => Some(text),
            _ => None,
        }
    }

    pub const fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(number) => Some(*number),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Self]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Object(fields) => Some(fields),
            _ => None,
        }
    }

    pub const fn as_renderable(&self) -> Option<&Renderable> {
        match self {
            Self::Renderable(renderable) => Some(renderable),
            _ => None,
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::Undefined => "undefined",
            Self::Null => "null",
            Self::Bool(_) => "boolean",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Function(_) => "function",
            Self::Renderable(_) => "template",
            Self::Deferred(_) => "deferred",
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Self::Undefined | Self::Null => false,
            Self::Bool(value) => *value,
            Self::Number(number) => *number != 0.0 && !number.is_nan(),
            Self::String(text) => !text.is_empty(),
            Self::Array(_) | Self::Object(_) | Self::Function(_) | Self::Renderable(_) => true,
            Self::Deferred(deferred) => match deferred.peek() {
                Some(Ok(value)) => value.truthy(),
                Some(Err(_)) | None => true,
            },
        }
    }

    /// Whether an unsettled deferred value sits anywhere inside this one.
    pub fn has_deferred(&self) -> bool {
        match self {
            Self::Deferred(deferred) => match deferred.peek() {
                Some(Ok(value)) => value.has_deferred(),
                Some(Err(_)) | None => true,
            },
            Self::Array(items) => items.iter().any(Self::has_deferred),
            Self::Object(fields) => fields.values().any(Self::has_deferred),
            Self::Undefined
            | Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Function(_)
            | Self::Renderable(_) => false,
        }
    }

    pub fn to_number(&self) -> f64 {
        match self {
            Self::Null => 0.0,
            Self::Bool(value) => f64::from(u8::from(*value)),
            Self::Number(number) => *number,
            Self::String(text) => parse_number(text),
            Self::Array(_) => parse_number(&self.to_string()),
            Self::Deferred(deferred) => match deferred.peek() {
                Some(Ok(value)) => value.to_number(),
                Some(Err(_)) | None => f64::NAN,
            },
            Self::Undefined | Self::Object(_) | Self::Function(_) | Self::Renderable(_) => {
                f64::NAN
            }
        }
    }

    /// Whether `+` joins this value as text rather than adding it.
    pub const fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::String(_)
                | Self::Array(_)
                | Self::Object(_)
                | Self::Function(_)
                | Self::Renderable(_)
        )
    }

    /// `value.name`; missing members are undefined.
    pub fn property(&self, name: &str) -> Self {
        match self {
            Self::Object(fields) => fields.get(name).cloned().unwrap_or_default(),
            Self::Array(items) if name == "length" => Self::from(items.len()),
            Self::Array(items) => {
                let number = parse_number(name);
                as_index(number, items.len())
                    .and_then(|index| items.get(index).cloned())
                    .unwrap_or_default()
            }
            Self::String(text) if name == "length" => Self::from(text.chars().count()),
            Self::Undefined
            | Self::Null
            | Self::Bool(_)
            | Self::Number(_)
            | Self::String(_)
            | Self::Function(_)
            | Self::Renderable(_)
            | Self::Deferred(_) => Self::Undefined,
        }
    }

    /// `value[index]`; out-of-range and missing entries are undefined.
    pub fn index(&self, index: &Self) -> Self {
        match (self, index) {
            (Self::Array(items), Self::Number(number)) => as_index(*number, items.len())
                .and_then(|i| items.get(i).cloned())
                .unwrap_or_default(),
            (Self::String(text), Self::Number(number)) => {
                as_index(*number, text.chars().count())
                    .and_then(|i| text.chars().nth(i))
                    .map_or(Self::Undefined, |c| Self::string(c.to_string()))
            }
            _ => self.property(&index.to_string()),
        }
    }

    /// Loose equality: `null == undefined`, and numbers, strings and
    /// booleans compare after numeric conversion.
    pub fn loose_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Deferred(deferred), _) => match deferred.peek() {
                Some(Ok(value)) => value.loose_eq(other),
                Some(Err(_)) | None => false,
            },
            (_, Self::Deferred(_)) => other.loose_eq(self),
            (Self::Undefined | Self::Null, Self::Undefined | Self::Null) => true,
            (Self::Undefined | Self::Null, _) | (_, Self::Undefined | Self::Null) => false,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => Rc::ptr_eq(a, b),
            (Self::Object(a), Self::Object(b)) => Rc::ptr_eq(a, b),
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Renderable(a), Self::Renderable(b)) => a.ptr_eq(b),
            (Self::Bool(_), _) => Self::Number(self.to_number()).loose_eq(other),
            (_, Self::Bool(_)) => self.loose_eq(&Self::Number(other.to_number())),
            (Self::Number(a), Self::String(_)) => *a == other.to_number(),
            (Self::String(_), Self::Number(b)) => self.to_number() == *b,
            (Self::Array(_) | Self::Object(_), Self::Number(_) | Self::String(_)) => {
                Self::string(self.to_string()).loose_eq(other)
            }
            (Self::Number(_) | Self::String(_), Self::Array(_) | Self::Object(_)) => {
                self.loose_eq(&Self::string(other.to_string()))
            }
            _ => false,
        }
    }
}

/// Structural equality on data; functions, templates and deferred values are
/// equal only to themselves.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Undefined, Self::Undefined) | (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (Self::Function(a), Self::Function(b)) => a.ptr_eq(b),
            (Self::Renderable(a), Self::Renderable(b)) => a.ptr_eq(b),
            (Self::Deferred(a), Self::Deferred(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

/// The text a value contributes to template output.
impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Undefined | Self::Null | Self::Function(_) | Self::Renderable(_) => Ok(()),
            Self::Bool(value) => write!(f, "{}", value),
            Self::Number(number) => f.write_str(&format_number(*number)),
            Self::String(text) => f.write_str(text),
            Self::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{}", item)?;
                }
                Ok(())
            }
            Self::Object(_) => f.write_str("[object Object]"),
            Self::Deferred(deferred) => match deferred.peek() {
                Some(Ok(value)) => write!(f, "{}", value),
                Some(Err(_)) | None => Ok(()),
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<i64> for Value {
    #[allow(clippy::cast_precision_loss, reason = "template numbers are f64")]
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<usize> for Value {
    #[allow(clippy::cast_precision_loss, reason = "template numbers are f64")]
    fn from(value: usize) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(Rc::from(value))
    }
}

impl<V: Into<Self>> From<Vec<V>> for Value {
    fn from(value: Vec<V>) -> Self {
        Self::array(value)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(value: BTreeMap<String, Self>) -> Self {
        Self::Object(Rc::new(value))
    }
}

impl From<Function> for Value {
    fn from(value: Function) -> Self {
        Self::Function(value)
    }
}

impl From<Renderable> for Value {
    fn from(value: Renderable) -> Self {
        Self::Renderable(value)
    }
}

impl From<Deferred> for Value {
    fn from(value: Deferred) -> Self {
        Self::Deferred(value)
    }
}

impl<V: Into<Self>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map_or(Self::Undefined, Into::into)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> serde::de::Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("any template value")
            }

            fn visit_bool<E: serde::de::Error>(self, value: bool) -> Result<Value, E> {
                Ok(Value::Bool(value))
            }

            fn visit_i64<E: serde::de::Error>(self, value: i64) -> Result<Value, E> {
                Ok(Value::from(value))
            }

            #[allow(clippy::cast_precision_loss, reason = "template numbers are f64")]
            fn visit_u64<E: serde::de::Error>(self, value: u64) -> Result<Value, E> {
                Ok(Value::Number(value as f64))
            }

            fn visit_f64<E: serde::de::Error>(self, value: f64) -> Result<Value, E> {
                Ok(Value::Number(value))
            }

            fn visit_str<E: serde::de::Error>(self, value: &str) -> Result<Value, E> {
                Ok(Value::string(value))
            }

            fn visit_string<E: serde::de::Error>(self, value: String) -> Result<Value, E> {
                Ok(Value::from(value))
            }

            fn visit_none<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                serde::Deserialize::deserialize(deserializer)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
            where
                A: serde::de::SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(Rc::new(items)))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Value, A::Error>
            where
                A: serde::de::MapAccess<'de>,
            {
                let mut fields = BTreeMap::new();
                while let Some((key, value)) = map.next_entry::<String, Value>()? {
                    fields.insert(key, value);
                }
                Ok(Value::Object(Rc::new(fields)))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}
