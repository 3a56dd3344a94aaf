use std::{
    future::{Future, IntoFuture},
    rc::Rc,
};

use futures_util::{
    FutureExt,
    future::{self, LocalBoxFuture},
};

use crate::{
    error::{RenderError, RenderResult},
    value::{Deferred, Value},
};

/// A result that is either available now or will be once a future settles.
///
/// Work that never touches a deferred value stays `Ready` end to end, so a
/// fully synchronous render allocates no futures.
pub enum Eventually<T> {
    Ready(RenderResult<T>),
    Pending(LocalBoxFuture<'static, RenderResult<T>>),
}

impl<T: 'static> Eventually<T> {
    pub const fn ready(value: T) -> Self {
        Self::Ready(Ok(value))
    }

    pub const fn failed(error: RenderError) -> Self {
        Self::Ready(Err(error))
    }

    pub fn defer<F>(future: F) -> Self
    where
        F: Future<Output = RenderResult<T>> + 'static,
    {
        Self::Pending(future.boxed_local())
    }

    pub const fn is_ready(&self) -> bool {
        matches!(self, Self::Ready(_))
    }

    /// The result, if no waiting is needed.
    pub fn now(self) -> Option<RenderResult<T>> {
        match self {
            Self::Ready(result) => Some(result),
            Self::Pending(_) => None,
        }
    }

    pub fn map<U, F>(self, f: F) -> Eventually<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        match self {
            Self::Ready(result) => Eventually::Ready(result.map(f)),
            Self::Pending(pending) => Eventually::defer(pending.map(|result| result.map(f))),
        }
    }

    pub fn and_then<U, F>(self, f: F) -> Eventually<U>
    where
        U: 'static,
        F: FnOnce(T) -> Eventually<U> + 'static,
    {
        match self {
            Self::Ready(Ok(value)) => f(value),
            Self::Ready(Err(error)) => Eventually::Ready(Err(error)),
            Self::Pending(pending) => Eventually::defer(async move { f(pending.await?).await }),
        }
    }

    pub fn map_err<F>(self, f: F) -> Self
    where
        F: FnOnce(RenderError) -> RenderError + 'static,
    {
        match self {
            Self::Ready(result) => Self::Ready(result.map_err(f)),
            Self::Pending(pending) => Self::defer(pending.map(|result| result.map_err(f))),
        }
    }

    /// Both results; waits on whichever side is pending.
    pub fn zip<U: 'static>(self, other: Eventually<U>) -> Eventually<(T, U)> {
        match (self, other) {
            (Self::Ready(left), Eventually::Ready(right)) => {
                Eventually::Ready(left.and_then(|left| right.map(|right| (left, right))))
            }
            (Self::Ready(Err(error)), Eventually::Pending(_)) => Eventually::Ready(Err(error)),
            (left, right) => {
                Eventually::defer(future::try_join(left.into_future(), right.into_future()))
            }
        }
    }

    /// Every result, in input order regardless of completion order.
    pub fn all<I>(items: I) -> Eventually<Vec<T>>
    where
        I: IntoIterator<Item = Self>,
    {
        let items: Vec<Self> = items.into_iter().collect();
        if items.iter().all(Self::is_ready) {
            return Eventually::Ready(items.into_iter().filter_map(Self::now).collect());
        }
        Eventually::defer(future::try_join_all(
            items.into_iter().map(IntoFuture::into_future),
        ))
    }
}

impl<T: 'static> IntoFuture for Eventually<T> {
    type Output = RenderResult<T>;
    type IntoFuture = LocalBoxFuture<'static, RenderResult<T>>;

    fn into_future(self) -> Self::IntoFuture {
        match self {
            Self::Ready(result) => future::ready(result).boxed_local(),
            Self::Pending(pending) => pending,
        }
    }
}

impl<T> From<RenderResult<T>> for Eventually<T> {
    fn from(result: RenderResult<T>) -> Self {
        Self::Ready(result)
    }
}

impl<T> From<RenderError> for Eventually<T> {
    fn from(error: RenderError) -> Self {
        Self::Ready(Err(error))
    }
}

impl<T> std::fmt::Debug for Eventually<T>
where
    T: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Pending(_) => f.write_str("Pending"),
        }
    }
}

impl Eventually<Value> {
    /// Lifts a value, waiting on it if it is itself deferred.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Deferred(deferred) => deferred.eventually(),
            value => Self::Ready(Ok(value)),
        }
    }

    /// Lifts a value with every deferred value inside it settled, however
    /// deeply it sits in arrays and objects. Order and shape are kept.
    pub fn settle(value: Value) -> Self {
        if !value.has_deferred() {
            return Self::Ready(Ok(value));
        }
        match value {
            Value::Deferred(deferred) => deferred.eventually().and_then(Self::settle),
            Value::Array(items) => Eventually::all(items.iter().cloned().map(Self::settle))
                .map(|items| Value::Array(Rc::new(items))),
            Value::Object(fields) => {
                let names: Vec<String> = fields.keys().cloned().collect();
                Eventually::all(fields.values().cloned().map(Self::settle)).map(move |values| {
                    Value::Object(Rc::new(names.into_iter().zip(values).collect()))
                })
            }
            other @ (Value::Undefined
            | Value::Null
            | Value::Bool(_)
            | Value::Number(_)
            | Value::String(_)
            | Value::Function(_)
            | Value::Renderable(_)) => Self::Ready(Ok(other)),
        }
    }

    /// Lowers into a value that can be stored in a scope; pending work
    /// becomes a deferred value.
    pub fn into_value(self) -> RenderResult<Value> {
        match self {
            Self::Ready(result) => result,
            Self::Pending(pending) => Ok(Value::Deferred(Deferred::new(pending))),
        }
    }
}

/// An ordered, arbitrarily nested collection of output fragments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tree<T> {
    Leaf(T),
    Branch(Vec<Tree<T>>),
}

pub type RenderTree = Tree<String>;

impl<T> Tree<T> {
    pub const fn empty() -> Self {
        Self::Branch(Vec::new())
    }

    /// The leaves in order.
    pub fn flatten(self) -> Vec<T> {
        let mut leaves = Vec::new();
        let mut stack = vec![self];
        while let Some(tree) = stack.pop() {
            match tree {
                Self::Leaf(leaf) => leaves.push(leaf),
                Self::Branch(children) => stack.extend(children.into_iter().rev()),
            }
        }
        leaves
    }
}

impl Tree<String> {
    pub fn concat(&self) -> String {
        fn collect(tree: &Tree<String>, out: &mut String) {
            match tree {
                Tree::Leaf(text) => out.push_str(text),
                Tree::Branch(children) => {
                    for child in children {
                        collect(child, out);
                    }
                }
            }
        }

        let mut out = String::new();
        collect(self, &mut out);
        out
    }
}

impl From<String> for Tree<String> {
    fn from(text: String) -> Self {
        Self::Leaf(text)
    }
}
