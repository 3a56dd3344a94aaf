use std::{collections::BTreeMap, rc::Rc, sync::Arc};

use crate::{
    ast::{EMBEDDED_CONTENTS, Template},
    error::RenderResult,
    eventually::{Eventually, RenderTree},
    render::{eval_block, render_instance},
    scope::{Environment, RenderContext, Scope},
    value::Value,
};

/// Renders a host helper. The environment's page is the helper's own scope,
/// holding whatever parameters and embedded contents were bound to it.
pub type HelperFn = dyn Fn(&Environment) -> Eventually<RenderTree>;

#[derive(Clone)]
enum Body {
    Template(Arc<Template>),
    Helper {
        params: Rc<[String]>,
        render: Rc<HelperFn>,
    },
}

/// Something a block can render: a template closed over the scope it was
/// defined in, or a host helper.
///
/// Renderables are immutable. Binding parameters or contents returns a new
/// renderable sharing the same body over a child scope.
#[derive(Clone)]
pub struct Renderable {
    body: Body,
    scope: Scope,
}

impl Renderable {
    /// Closes `template` over the page scope of `env`, evaluating its static
    /// members once into a layer shared by every instance.
    pub fn closure(template: Arc<Template>, env: &Environment) -> RenderResult<Self> {
        let mut scope = env.page().clone();
        let mut statics = template
            .members
            .iter()
            .filter(|definition| definition.is_static)
            .peekable();
        if statics.peek().is_some() {
            scope = scope.child();
            let env = env.with_page(scope.clone());
            for definition in statics {
                let block = &definition.block;
                let value = eval_block(&block.expression, block.contents.as_ref(), &env);
                scope.bind(definition.name.clone(), value.into_value()?);
            }
        }
        Ok(Self {
            body: Body::Template(template),
            scope,
        })
    }

    /// A host-implemented block helper taking the named parameters.
    pub fn helper<P, S, F>(params: P, render: F) -> Self
    where
        P: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Environment) -> Eventually<RenderTree> + 'static,
    {
        Self {
            body: Body::Helper {
                params: params.into_iter().map(Into::into).collect(),
                render: Rc::new(render),
            },
            scope: Scope::new(),
        }
    }

    pub fn params(&self) -> &[String] {
        match &self.body {
            Body::Template(template) => &template.params,
            Body::Helper { params, .. } => params,
        }
    }

    pub fn template(&self) -> Option<&Arc<Template>> {
        match &self.body {
            Body::Template(template) => Some(template),
            Body::Helper { .. } => None,
        }
    }

    pub const fn scope(&self) -> &Scope {
        &self.scope
    }

    fn with_scope(&self, scope: Scope) -> Self {
        Self {
            body: self.body.clone(),
            scope,
        }
    }

    /// Binds leading parameters to `args`. A renderable argument beyond the
    /// last parameter becomes the embedded contents.
    ///
    /// Returns an unchanged copy when there is nothing to bind.
    pub fn apply(&self, args: Vec<Value>) -> Self {
        let params = self.params();
        let contents = args
            .get(params.len())
            .filter(|extra| matches!(extra, Value::Renderable(_)))
            .cloned();
        if (params.is_empty() && contents.is_none()) || args.is_empty() {
            return self.clone();
        }

        let scope = self.scope.child();
        for (param, arg) in params.iter().zip(args) {
            scope.bind(param.clone(), arg);
        }
        if let Some(contents) = contents {
            scope.bind(EMBEDDED_CONTENTS, contents);
        }
        self.with_scope(scope)
    }

    /// Binds the parameters named in `named`, ignoring names that are not
    /// parameters.
    pub fn assign_params(&self, named: &BTreeMap<String, Value>) -> Self {
        let mut matching = self
            .params()
            .iter()
            .filter_map(|param| named.get(param).map(|value| (param, value)))
            .peekable();
        if matching.peek().is_none() {
            return self.clone();
        }

        let scope = self.scope.child();
        for (param, value) in matching {
            scope.bind(param.clone(), value.clone());
        }
        self.with_scope(scope)
    }

    /// Binds the embedded contents slot; `None` binds it to `undefined`.
    pub fn assign_contents(&self, contents: Option<Self>) -> Self {
        let scope = self.scope.child();
        scope.bind(EMBEDDED_CONTENTS, Value::from(contents));
        self.with_scope(scope)
    }

    pub fn render(&self, context: &Rc<RenderContext>) -> Eventually<RenderTree> {
        let env = Environment::new(self.scope.clone(), Rc::clone(context));
        match &self.body {
            Body::Template(template) => render_instance(template, &env),
            Body::Helper { render, .. } => (**render)(&env),
        }
    }

    /// Whether both share one body and one scope.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        let same_body = match (&self.body, &other.body) {
            (Body::Template(a), Body::Template(b)) => Arc::ptr_eq(a, b),
            (Body::Helper { render: a, .. }, Body::Helper { render: b, .. }) => Rc::ptr_eq(a, b),
            (Body::Template(_), Body::Helper { .. }) | (Body::Helper { .. }, Body::Template(_)) => {
                false
            }
        };
        same_body && self.scope.ptr_eq(&other.scope)
    }
}

impl std::fmt::Debug for Renderable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.body {
            Body::Template(_) => "Template",
            Body::Helper { .. } => "Helper",
        };
        f.debug_struct("Renderable")
            .field("kind", &kind)
            .field("params", &self.params())
            .finish_non_exhaustive()
    }
}
