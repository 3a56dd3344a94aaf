use std::{rc::Rc, sync::Arc};

use tracing::debug;

use crate::{
    ast::EMBEDDED_CONTENTS,
    error::RenderError,
    eventually::{Eventually, RenderTree, Tree},
    parser::parse_source,
    renderable::Renderable,
    render::render_value,
    resolver::unresolved,
    scope::{Environment, Scope},
    value::{Function, Value},
};

/// Replaces `<`, `>`, `"` and `&` with HTML entities.
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '&' => escaped.push_str("&amp;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// A fresh scope holding the builtins: `let` (and its alias `with`), `if`,
/// `each`, `include`, `import` and `escape`.
pub fn stdlib() -> Scope {
    let scope = Scope::new();
    let let_function = Value::from(Function::new(let_helper));
    scope.bind("let", let_function.clone());
    scope.bind("with", let_function);
    scope.bind("if", Value::from(if_helper()));
    scope.bind("each", Value::from(each_helper()));
    scope.bind("include", Value::from(include_helper()));
    scope.bind("import", Value::from(Function::with_env(import)));
    scope.bind(
        "escape",
        Value::from(Function::new(|args| {
            let text = args.first().map(ToString::to_string).unwrap_or_default();
            Value::from(escape_html(&text))
        })),
    );
    scope
}

/// `[[+let(a, b) -> x, y]]...[[-let]]` renders its contents with the
/// arguments bound to the contents' parameters.
fn let_helper(args: &[Value]) -> Value {
    let args = args.to_vec();
    Value::from(Renderable::helper(Vec::<String>::new(), move |env| {
        match env.local(EMBEDDED_CONTENTS) {
            Value::Renderable(contents) => contents
                .apply(args.clone())
                .render(env.render_context()),
            _ => Eventually::ready(Tree::empty()),
        }
    }))
}

/// `[[+if(test)]]...[[-if]]`, with optional `then` and `else` injections.
fn if_helper() -> Renderable {
    Renderable::helper(["test", "then", "else"], |env| {
        let env = env.clone();
        Eventually::from_value(env.local("test")).and_then(move |test| {
            let branch = if test.truthy() {
                match env.local("then") {
                    Value::Undefined => env.local(EMBEDDED_CONTENTS),
                    then => then,
                }
            } else {
                env.local("else")
            };
            render_value(branch, env.render_context())
        })
    })
}

/// `[[+each(list) -> item, index]]...[[-each]]` renders its contents once
/// per element; objects give each value with its key.
fn each_helper() -> Renderable {
    Renderable::helper(["list", "body"], |env| {
        let body = match env.local("body") {
            Value::Undefined => env.local(EMBEDDED_CONTENTS),
            body => body,
        };
        let Value::Renderable(body) = body else {
            return Eventually::ready(Tree::empty());
        };
        let context = Rc::clone(env.render_context());
        Eventually::from_value(env.local("list")).and_then(move |list| {
            let rows: Vec<Eventually<RenderTree>> = match list {
                Value::Array(items) => items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| {
                        body.apply(vec![item.clone(), Value::from(index)])
                            .render(&context)
                    })
                    .collect(),
                Value::Object(fields) => fields
                    .iter()
                    .map(|(key, item)| {
                        body.apply(vec![item.clone(), Value::string(key)])
                            .render(&context)
                    })
                    .collect(),
                _ => Vec::new(),
            };
            Eventually::all(rows).map(Tree::Branch)
        })
    })
}

/// Parses fragment source and closes it over a fresh page.
fn load_fragment(env: &Environment, module_path: String) -> Eventually<Renderable> {
    let Some(resolver) = env.resolver() else {
        debug!(module_path = %module_path, "no fragment resolver configured");
        return Eventually::failed(unresolved(&module_path));
    };
    debug!(module_path = %module_path, "loading fragment");
    let root = Environment::root(Rc::clone(env.render_context()));
    resolver
        .resolve(&module_path)
        .and_then(move |source| {
            let template = match parse_source(&source, &module_path) {
                Ok(template) => template,
                Err(error) => return Eventually::failed(RenderError::from(error)),
            };
            Eventually::Ready(Renderable::closure(Arc::new(template), &root))
        })
}

/// `[[include("nav")]]` renders a fragment in place. With contents, the
/// contents are rendered instead, receiving the fragment as an argument.
fn include_helper() -> Renderable {
    Renderable::helper(["file"], |env| {
        let file = env.local("file").to_string();
        let contents = env.local(EMBEDDED_CONTENTS);
        let context = Rc::clone(env.render_context());
        load_fragment(env, file).and_then(move |fragment| match contents {
            Value::Renderable(contents) => contents
                .apply(vec![Value::from(fragment)])
                .render(&context),
            _ => fragment.render(&context),
        })
    })
}

/// `import("a.b")` evaluates to the fragment as a template value.
fn import(env: &Environment, args: Vec<Value>) -> Eventually<Value> {
    let module_path = args.first().map(ToString::to_string).unwrap_or_default();
    load_fragment(env, module_path).map(Value::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>\"Q&A\"</b>"),
            "&lt;b&gt;&quot;Q&amp;A&quot;&lt;/b&gt;"
        );
        assert_eq!(escape_html("plain 'text'"), "plain 'text'");
        assert_eq!(escape_html("&amp;"), "&amp;amp;");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stdlib_names() {
        let scope = stdlib();
        for name in ["let", "with", "if", "each", "include", "import", "escape"] {
            assert!(scope.binds_locally(name), "missing builtin {}", name);
        }
        assert_eq!(
            scope.get("if").map(|value| value.type_name()),
            Some("template")
        );
        assert_eq!(
            scope.get("escape").map(|value| value.type_name()),
            Some("function")
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_stdlib_scopes_are_independent() {
        let first = stdlib();
        let second = stdlib();
        first.bind("if", Value::Null);
        assert_eq!(second.get("if").map(|value| value.type_name()), Some("template"));
    }
}
