use std::{collections::BTreeMap, rc::Rc};

use crate::{
    ast::{BinaryOp, EMBEDDED_CONTENTS, ExprKind, Expression, ObjectLiteral, UnaryOp},
    error::RenderError,
    eventually::Eventually,
    scope::Environment,
    value::Value,
};

/// Evaluates `expression` in `env`.
///
/// Missing names, and members of `undefined` or `null`, evaluate to
/// `undefined`. Deferred values read from scope are awaited, so operators only
/// ever see settled operands.
pub fn evaluate(expression: &Expression, env: &Environment) -> Eventually<Value> {
    match &expression.kind {
        ExprKind::Undefined => Eventually::ready(Value::Undefined),
        ExprKind::Null => Eventually::ready(Value::Null),
        ExprKind::Boolean(value) => Eventually::ready(Value::Bool(*value)),
        ExprKind::Number(number) => Eventually::ready(Value::Number(*number)),
        ExprKind::String(text) => Eventually::ready(Value::string(text)),
        ExprKind::Identifier(name) => Eventually::from_value(env.get(name)),
        ExprKind::Property { object, name } => match evaluate(object, env) {
            Eventually::Ready(Ok(value)) => Eventually::from_value(value.property(name)),
            other => {
                let name = name.clone();
                other.and_then(move |value| Eventually::from_value(value.property(&name)))
            }
        },
        ExprKind::Index { object, index } => evaluate(object, env)
            .zip(evaluate(index, env))
            .and_then(|(value, index)| Eventually::from_value(value.index(&index))),
        ExprKind::Application { callee, args } => {
            let function = evaluate(callee, env);
            let args = Eventually::all(args.iter().map(|arg| evaluate(arg, env)));
            match function.zip(args) {
                Eventually::Ready(Ok((function, args))) => call(function, args, callee, env),
                Eventually::Ready(Err(error)) => Eventually::failed(error),
                pending => {
                    let callee = callee.as_ref().clone();
                    let env = env.clone();
                    pending.and_then(move |(function, args)| call(function, args, &callee, &env))
                }
            }
        }
        ExprKind::Unary { op, right } => {
            let op = *op;
            evaluate(right, env).map(move |value| unary(op, &value))
        }
        ExprKind::Binary {
            op: BinaryOp::Pipe,
            left,
            right,
        } => match evaluate(left, env).zip(evaluate(right, env)) {
            Eventually::Ready(Ok((argument, function))) => {
                call(function, vec![argument], right, env)
            }
            Eventually::Ready(Err(error)) => Eventually::failed(error),
            pending => {
                let right = right.as_ref().clone();
                let env = env.clone();
                pending.and_then(move |(argument, function)| {
                    call(function, vec![argument], &right, &env)
                })
            }
        },
        ExprKind::Binary { op, left, right } => {
            let op = *op;
            evaluate(left, env)
                .zip(evaluate(right, env))
                .map(move |(left, right)| binary(op, &left, &right))
        }
        ExprKind::Array(items) => Eventually::all(items.iter().map(|item| evaluate(item, env)))
            .map(|items| Value::Array(Rc::new(items))),
        ExprKind::Object(object) => evaluate_object(object, env).map(|fields| Value::Object(Rc::new(fields))),
        ExprKind::Extension { object, extension } => evaluate(object, env)
            .zip(evaluate_object(extension, env))
            .map(|(base, fields)| extend(base, fields)),
    }
}

fn evaluate_object(
    object: &ObjectLiteral,
    env: &Environment,
) -> Eventually<BTreeMap<String, Value>> {
    let keys: Vec<String> = object.fields.iter().map(|(key, _)| key.clone()).collect();
    Eventually::all(object.fields.iter().map(|(_, value)| evaluate(value, env)))
        .map(move |values| keys.into_iter().zip(values).collect())
}

/// `base{...}`: a template takes the fields as named parameters, an object
/// is copied with the fields merged over it, anything else is replaced.
fn extend(base: Value, fields: BTreeMap<String, Value>) -> Value {
    match base {
        Value::Renderable(renderable) => Value::Renderable(renderable.assign_params(&fields)),
        Value::Object(existing) => {
            let mut merged = Rc::unwrap_or_clone(existing);
            merged.extend(fields);
            Value::Object(Rc::new(merged))
        }
        Value::Undefined
        | Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Array(_)
        | Value::Function(_)
        | Value::Deferred(_) => Value::Object(Rc::new(fields)),
    }
}

/// Calls `function` with `args`. Templates also receive the caller's
/// embedded contents.
pub fn call(
    function: Value,
    args: Vec<Value>,
    callee: &Expression,
    env: &Environment,
) -> Eventually<Value> {
    match function {
        Value::Function(function) => function.call(env, args),
        Value::Renderable(renderable) => {
            let mut applied = renderable.apply(args);
            if let Value::Renderable(contents) = env.get(EMBEDDED_CONTENTS) {
                applied = applied.assign_contents(Some(contents));
            }
            Eventually::ready(Value::Renderable(applied))
        }
        Value::Undefined
        | Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Array(_)
        | Value::Object(_)
        | Value::Deferred(_) => Eventually::failed(RenderError::new(
            format!(
                "Cannot apply `{}`: {} is not a function or template",
                callee,
                function.type_name()
            ),
            callee.location.clone(),
        )),
    }
}

pub(crate) fn unary(op: UnaryOp, value: &Value) -> Value {
    match op {
        UnaryOp::Plus => Value::Number(value.to_number()),
        UnaryOp::Minus => Value::Number(-value.to_number()),
        UnaryOp::Not => Value::Bool(!value.truthy()),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => left.to_number().partial_cmp(&right.to_number()),
    }
}

/// Applies a binary operator to two settled operands. `|` is handled by the
/// evaluator, which needs the environment to call its right operand.
pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add if left.is_textual() || right.is_textual() => {
            Value::from(format!("{}{}", left, right))
        }
        BinaryOp::Add => Value::Number(left.to_number() + right.to_number()),
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Lt => Value::Bool(compare(left, right).is_some_and(std::cmp::Ordering::is_lt)),
        BinaryOp::Le => Value::Bool(compare(left, right).is_some_and(std::cmp::Ordering::is_le)),
        BinaryOp::Gt => Value::Bool(compare(left, right).is_some_and(std::cmp::Ordering::is_gt)),
        BinaryOp::Ge => Value::Bool(compare(left, right).is_some_and(std::cmp::Ordering::is_ge)),
        BinaryOp::Eq => Value::Bool(left.loose_eq(right)),
        BinaryOp::Ne => Value::Bool(!left.loose_eq(right)),
        BinaryOp::And => {
            if left.truthy() {
                right.clone()
            } else {
                left.clone()
            }
        }
        BinaryOp::Or => {
            if left.truthy() {
                left.clone()
            } else {
                right.clone()
            }
        }
        // Applied as a call in `evaluate`.
        BinaryOp::Pipe => Value::Undefined,
    }
}
