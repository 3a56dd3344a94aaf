use std::{collections::BTreeMap, rc::Rc, sync::Arc};

use tracing::debug;

use crate::{
    ast::{AssignOp, Block, BlockKind, Child, ExprKind, Expression, THIS_CONTENTS, Template},
    error::{RenderError, RenderResult},
    eval::{binary, evaluate},
    eventually::{Eventually, RenderTree, Tree},
    interface::Context,
    parser::{DEFAULT_SOURCE_NAME, parse_source},
    renderable::Renderable,
    scope::{Environment, RenderContext},
    stdlib::{escape_html, stdlib},
    value::{Value, as_index},
};

/// What [`render`] accepts: source text, or an already parsed template.
#[derive(Debug, Clone)]
pub enum Source {
    Text(String),
    Template(Arc<Template>),
}

impl From<&str> for Source {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for Source {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<Template> for Source {
    fn from(template: Template) -> Self {
        Self::Template(Arc::new(template))
    }
}

impl From<Arc<Template>> for Source {
    fn from(template: Arc<Template>) -> Self {
        Self::Template(template)
    }
}

/// Renders `source` against `context` with the standard library.
///
/// The result is ready immediately unless something in the template is
/// deferred; await it (it implements `IntoFuture`) or take it with `now()`.
pub fn render<S: Into<Source>>(source: S, context: &Context) -> Eventually<String> {
    let render = RenderContext::new(context.to_scope(), stdlib());
    render_with(source, Rc::new(render))
}

/// Renders `source` with an explicit render context, for callers that
/// supply their own standard library or fragment resolver.
#[tracing::instrument(level = "debug", skip_all)]
pub fn render_with<S: Into<Source>>(source: S, render: Rc<RenderContext>) -> Eventually<String> {
    let template = match source.into() {
        Source::Text(text) => match parse_source(&text, DEFAULT_SOURCE_NAME) {
            Ok(template) => Arc::new(template),
            Err(error) => return Eventually::failed(error.into()),
        },
        Source::Template(template) => template,
    };
    let root = match Renderable::closure(template, &Environment::root(Rc::clone(&render))) {
        Ok(root) => root,
        Err(error) => return Eventually::failed(error),
    };
    let output = root.render(&render);
    if !output.is_ready() {
        debug!("render suspended on a deferred value");
    }
    output.map(|tree| tree.concat())
}

/// Evaluates a block's expression with `thisContents` bound to a closure
/// over the block's own contents.
pub fn eval_block(
    expression: &Expression,
    contents: Option<&Arc<Template>>,
    env: &Environment,
) -> Eventually<Value> {
    let Some(contents) = contents else {
        return evaluate(expression, env);
    };
    match Renderable::closure(Arc::clone(contents), env) {
        Ok(this) => evaluate(expression, &env.extend([(THIS_CONTENTS, Value::from(this))])),
        Err(error) => Eventually::failed(error),
    }
}

/// Renders one instance of `template` over a fresh child of `env`'s page.
/// Output keeps child order whatever order deferred parts settle in.
pub fn render_instance(template: &Template, env: &Environment) -> Eventually<RenderTree> {
    let env = env.with_page(env.page().child());
    for definition in template.members.iter().filter(|member| !member.is_static) {
        let block = &definition.block;
        match eval_block(&block.expression, block.contents.as_ref(), &env).into_value() {
            Ok(value) => env.bind(definition.name.clone(), value),
            Err(error) => return Eventually::failed(error),
        }
    }

    let mut parts = Vec::with_capacity(template.children.len());
    for child in &template.children {
        let part = match child {
            Child::Text(text) => Eventually::ready(Tree::Leaf(text.clone())),
            Child::Block(block) => render_block(block, &env),
        };
        if let Eventually::Ready(Err(error)) = part {
            return Eventually::failed(error);
        }
        parts.push(part);
    }
    Eventually::all(parts).map(Tree::Branch)
}

fn render_block(block: &Block, env: &Environment) -> Eventually<RenderTree> {
    let contents = match &block.contents {
        Some(template) => match Renderable::closure(Arc::clone(template), env) {
            Ok(contents) => Some(contents),
            Err(error) => return Eventually::failed(error),
        },
        None => None,
    };
    let names: Vec<String> = block
        .injections
        .iter()
        .map(|injection| injection.target.clone())
        .collect();
    let injected = Eventually::all(block.injections.iter().map(|injection| {
        eval_block(&injection.expression, injection.contents.as_ref(), env)
    }))
    .map(move |values| names.into_iter().zip(values).collect::<BTreeMap<String, Value>>());

    let expression = block.expression.clone();
    let this = contents.clone();
    let outer = env.clone();
    let evaluated = injected.and_then(move |named| {
        let local = outer.extend(
            named
                .iter()
                .map(|(name, value)| (name.clone(), value.clone()))
                .chain(this.map(|this| (THIS_CONTENTS.to_string(), Value::from(this)))),
        );
        evaluate(&expression, &local).map(move |value| (value, named))
    });

    match &block.kind {
        BlockKind::Assignment { target, operator } => {
            let value = evaluated.map(|(value, _)| value);
            match assign(target, *operator, value, env) {
                Ok(()) => Eventually::ready(Tree::empty()),
                Err(error) => Eventually::failed(error),
            }
        }
        BlockKind::Output => {
            let block = block.clone();
            let env = env.clone();
            evaluated.and_then(move |(value, named)| {
                Eventually::from_value(value)
                    .and_then(move |value| render_result(&block, value, &named, contents, &env))
            })
        }
    }
}

/// Turns a block's settled value into output. Templates and helpers get the
/// block's injections and contents, then render; anything else is printed
/// once every deferred value inside it has settled.
fn render_result(
    block: &Block,
    value: Value,
    named: &BTreeMap<String, Value>,
    contents: Option<Renderable>,
    env: &Environment,
) -> Eventually<RenderTree> {
    let escape = block.escape;
    let Value::Renderable(renderable) = value else {
        return Eventually::settle(value).map(move |value| {
            let text = value.to_string();
            Tree::Leaf(if escape { escape_html(&text) } else { text })
        });
    };
    let output = renderable
        .assign_params(named)
        .assign_contents(contents)
        .render(env.render_context());
    if escape {
        output.map(|tree| Tree::Leaf(escape_html(&tree.concat())))
    } else {
        output
    }
}

/// Renders a value a helper chose to output: templates render, deferred
/// values are awaited, anything else is printed.
pub fn render_value(value: Value, context: &Rc<RenderContext>) -> Eventually<RenderTree> {
    match value {
        Value::Renderable(renderable) => renderable.render(context),
        Value::Deferred(deferred) => {
            let context = Rc::clone(context);
            deferred
                .eventually()
                .and_then(move |value| render_value(value, &context))
        }
        Value::Array(_) | Value::Object(_) => {
            Eventually::settle(value).map(|value| Tree::Leaf(value.to_string()))
        }
        Value::Undefined
        | Value::Null
        | Value::Bool(_)
        | Value::Number(_)
        | Value::String(_)
        | Value::Function(_) => Eventually::ready(Tree::Leaf(value.to_string())),
    }
}

/// One step from an assignment target's root identifier to the slot being
/// written.
enum Key {
    Name(String),
    Index(Value),
}

impl Key {
    fn describe(&self) -> String {
        match self {
            Self::Name(name) => name.clone(),
            Self::Index(index) => index.to_string(),
        }
    }
}

fn assign(
    target: &Expression,
    operator: AssignOp,
    value: Eventually<Value>,
    env: &Environment,
) -> RenderResult<()> {
    let value = match operator {
        AssignOp::Assign => value,
        AssignOp::Compound(op) => evaluate(target, env)
            .zip(value)
            .map(move |(current, value)| binary(op, &current, &value)),
    };
    let value = value.into_value()?;

    let mut keys = Vec::new();
    let mut node = target;
    let root = loop {
        match &node.kind {
            ExprKind::Identifier(name) => break name,
            ExprKind::Property { object, name } => {
                keys.push(Key::Name(name.clone()));
                node = &**object;
            }
            ExprKind::Index { object, index } => {
                let index = evaluate(index, env).now().ok_or_else(|| {
                    RenderError::new(
                        "Assignment index must not be deferred",
                        node.location.clone(),
                    )
                })??;
                keys.push(Key::Index(index));
                node = &**object;
            }
            ExprKind::Undefined
            | ExprKind::Null
            | ExprKind::Boolean(_)
            | ExprKind::Number(_)
            | ExprKind::String(_)
            | ExprKind::Application { .. }
            | ExprKind::Unary { .. }
            | ExprKind::Binary { .. }
            | ExprKind::Array(_)
            | ExprKind::Object(_)
            | ExprKind::Extension { .. } => {
                return Err(RenderError::new(
                    format!("Cannot assign to `{}`", target),
                    target.location.clone(),
                ));
            }
        }
    };
    keys.reverse();

    let current = if keys.is_empty() {
        Value::Undefined
    } else {
        env.get(root)
    };
    let updated = set_path(current, &keys, value)
        .map_err(|message| RenderError::new(message, target.location.clone()))?;
    env.bind(root.clone(), updated);
    Ok(())
}

/// Writes `value` at `keys` inside `container`, copying every container on
/// the way so values shared with other bindings are left alone.
fn set_path(container: Value, keys: &[Key], value: Value) -> Result<Value, String> {
    let Some((key, rest)) = keys.split_first() else {
        return Ok(value);
    };
    match container {
        Value::Undefined | Value::Null => set_path(Value::Object(Rc::default()), keys, value),
        Value::Object(fields) => {
            let mut fields = Rc::unwrap_or_clone(fields);
            let name = key.describe();
            let child = fields.remove(&name).unwrap_or_default();
            fields.insert(name, set_path(child, rest, value)?);
            Ok(Value::Object(Rc::new(fields)))
        }
        Value::Array(items) => {
            let index = match key {
                Key::Index(Value::Number(number)) => as_index(*number, items.len().saturating_add(1)),
                Key::Index(_) | Key::Name(_) => None,
            };
            let mut items = Rc::unwrap_or_clone(items);
            if index == Some(items.len()) {
                items.push(Value::Undefined);
            }
            let Some(slot) = index.and_then(|index| items.get_mut(index)) else {
                return Err(format!("Cannot assign `{}` of an array", key.describe()));
            };
            let child = std::mem::take(slot);
            *slot = set_path(child, rest, value)?;
            Ok(Value::Array(Rc::new(items)))
        }
        other => Err(format!(
            "Cannot assign `{}` of a {}",
            key.describe(),
            other.type_name()
        )),
    }
}
