use std::{cell::RefCell, collections::HashMap, rc::Rc};

use crate::{resolver::FragmentResolver, value::Value};

struct Frame {
    symbols: RefCell<HashMap<String, Value>>,
    parent: Option<Scope>,
}

/// One frame of a parent-linked chain of symbol tables.
///
/// Binding only ever writes to the frame it is called on; a child shadows its
/// parents and never changes them.
#[derive(Clone)]
pub struct Scope(Rc<Frame>);

impl Scope {
    pub fn new() -> Self {
        Self::from_symbols(HashMap::new())
    }

    pub fn from_symbols(symbols: HashMap<String, Value>) -> Self {
        Self(Rc::new(Frame {
            symbols: RefCell::new(symbols),
            parent: None,
        }))
    }

    /// A new empty frame layered over this one.
    pub fn child(&self) -> Self {
        Self(Rc::new(Frame {
            symbols: RefCell::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    /// Looks `name` up through the chain. `None` means no frame binds it;
    /// `Some(Value::Undefined)` means a frame binds it to `undefined`.
    pub fn get(&self, name: &str) -> Option<Value> {
        let mut scope = Some(self);
        while let Some(current) = scope {
            let found = current.0.symbols.borrow().get(name).cloned();
            if found.is_some() {
                return found;
            }
            scope = current.0.parent.as_ref();
        }
        None
    }

    pub fn bind<S: Into<String>>(&self, name: S, value: Value) {
        self.0.symbols.borrow_mut().insert(name.into(), value);
    }

    /// Whether this frame itself, ignoring parents, binds `name`.
    pub fn binds_locally(&self, name: &str) -> bool {
        self.0.symbols.borrow().contains_key(name)
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Into<String>> FromIterator<(S, Value)> for Scope {
    fn from_iter<I: IntoIterator<Item = (S, Value)>>(iter: I) -> Self {
        Self::from_symbols(
            iter.into_iter()
                .map(|(name, value)| (name.into(), value))
                .collect(),
        )
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.0.symbols.borrow().keys().cloned().collect();
        names.sort();
        f.debug_struct("Scope")
            .field("names", &names)
            .field("parent", &self.0.parent)
            .finish()
    }
}

/// What a single render call shares with everything it renders: the caller's
/// data, the builtins, and where imported fragments come from.
pub struct RenderContext {
    pub context: Scope,
    pub stdlib: Scope,
    pub resolver: Option<Rc<dyn FragmentResolver>>,
}

impl RenderContext {
    pub const fn new(context: Scope, stdlib: Scope) -> Self {
        Self {
            context,
            stdlib,
            resolver: None,
        }
    }

    #[must_use]
    pub fn with_resolver(mut self, resolver: Rc<dyn FragmentResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("context", &self.context)
            .field("resolver", &self.resolver.is_some())
            .finish_non_exhaustive()
    }
}

/// Where expressions look names up: the page scope first, then the caller's
/// context, then the standard library.
#[derive(Debug, Clone)]
pub struct Environment {
    page: Scope,
    render: Rc<RenderContext>,
}

impl Environment {
    pub const fn new(page: Scope, render: Rc<RenderContext>) -> Self {
        Self { page, render }
    }

    /// An environment over a fresh, empty page.
    pub fn root(render: Rc<RenderContext>) -> Self {
        Self::new(Scope::new(), render)
    }

    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.page
            .get(name)
            .or_else(|| self.render.context.get(name))
            .or_else(|| self.render.stdlib.get(name))
    }

    /// Unbound names are `undefined`.
    pub fn get(&self, name: &str) -> Value {
        self.lookup(name).unwrap_or_default()
    }

    /// Looks `name` up in the page scope chain only.
    pub fn local(&self, name: &str) -> Value {
        self.page.get(name).unwrap_or_default()
    }

    pub fn bind<S: Into<String>>(&self, name: S, value: Value) {
        self.page.bind(name, value);
    }

    /// A child environment whose new page frame holds `bindings`.
    pub fn extend<I, S>(&self, bindings: I) -> Self
    where
        I: IntoIterator<Item = (S, Value)>,
        S: Into<String>,
    {
        let page = self.page.child();
        for (name, value) in bindings {
            page.bind(name, value);
        }
        self.with_page(page)
    }

    pub fn with_page(&self, page: Scope) -> Self {
        Self::new(page, Rc::clone(&self.render))
    }

    pub const fn page(&self) -> &Scope {
        &self.page
    }

    pub const fn render_context(&self) -> &Rc<RenderContext> {
        &self.render
    }

    pub fn resolver(&self) -> Option<&Rc<dyn FragmentResolver>> {
        self.render.resolver.as_ref()
    }
}
