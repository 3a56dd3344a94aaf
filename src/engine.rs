use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    rc::Rc,
    sync::Arc,
};

use tracing::debug;

use crate::{
    ast::Template,
    error::{BloxError, BloxResult},
    eventually::Eventually,
    interface::{BloxInterface, Context},
    parser::{DEFAULT_SOURCE_NAME, parse_source},
    render::render_with,
    resolver::{DEFAULT_FRAGMENT_EXTENSION, DirResolver, FragmentResolver},
    scope::{RenderContext, Scope},
    stdlib::stdlib,
    value::Value,
};

/// Settings for an [`Engine`].
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// Where `import` and `include` read fragments from. Without it, and
    /// without an explicit resolver, fragments cannot be loaded.
    pub fragment_directory: Option<PathBuf>,
    pub fragment_extension: String,
    /// Source name reported in errors for templates given as bare text.
    pub default_source_name: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fragment_directory: None,
            fragment_extension: DEFAULT_FRAGMENT_EXTENSION.to_string(),
            default_source_name: DEFAULT_SOURCE_NAME.to_string(),
        }
    }
}

/// `Engine` is the primary implementation of [`BloxInterface`]: it owns a set
/// of named, parsed templates along with the builtins and fragment resolver
/// every render uses.
///
/// # Examples
///
/// ```
/// use blox::{BloxInterface, Context, Engine};
///
/// let mut engine = Engine::new();
/// engine.add_template("greeting", "Hello, [[name]]!").unwrap();
///
/// let context = Context::new().with("name", "World");
/// let output = engine.render_sync("greeting", Some(&context)).unwrap();
/// assert_eq!(output, "Hello, World!");
/// ```
pub struct Engine {
    templates: HashMap<String, Arc<Template>>,
    stdlib: Scope,
    resolver: Option<Rc<dyn FragmentResolver>>,
    options: EngineOptions,
}

impl Engine {
    /// Creates an engine with no templates and the standard library.
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let resolver = options.fragment_directory.as_ref().map(|directory| {
            let resolver = DirResolver::new(directory).with_extension(&options.fragment_extension);
            Rc::new(resolver) as Rc<dyn FragmentResolver>
        });
        Self {
            templates: HashMap::new(),
            stdlib: stdlib(),
            resolver,
            options,
        }
    }

    /// Replaces the fragment resolver.
    #[must_use]
    pub fn with_resolver<R: FragmentResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Rc::new(resolver));
        self
    }

    /// Replaces the standard library with `stdlib`. Values added with
    /// [`Engine::define`] go into a layer over it; `stdlib` itself is
    /// never written to.
    #[must_use]
    pub fn with_stdlib(mut self, stdlib: Scope) -> Self {
        self.stdlib = stdlib.child();
        self
    }

    /// Makes `value` visible to every template rendered by this engine,
    /// alongside the builtins.
    ///
    /// ```
    /// use blox::{Context, Engine, Function, Value};
    ///
    /// let mut engine = Engine::new();
    /// engine.define("shout", Function::new(|args| {
    ///     Value::from(args.first().map(|v| v.to_string().to_uppercase()).unwrap_or_default())
    /// }));
    /// let output = engine.render_str("[[shout(\"hi\")]]", None).now().unwrap().unwrap();
    /// assert_eq!(output, "HI");
    /// ```
    pub fn define<N: Into<String>, V: Into<Value>>(&mut self, name: N, value: V) -> &mut Self {
        self.stdlib.bind(name, value.into());
        self
    }

    pub const fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn template<N: AsRef<str>>(&self, name: N) -> Option<&Arc<Template>> {
        self.templates.get(name.as_ref())
    }

    fn render_context(&self, context: Option<&Context>) -> Rc<RenderContext> {
        let context = context.map_or_else(Scope::new, Context::to_scope);
        let mut render = RenderContext::new(context, self.stdlib.clone());
        if let Some(resolver) = &self.resolver {
            render = render.with_resolver(Rc::clone(resolver));
        }
        Rc::new(render)
    }

    /// Parses and renders `text` without registering it.
    pub fn render_str<T: AsRef<str>>(&self, text: T, context: Option<&Context>) -> Eventually<String> {
        match parse_source(text.as_ref(), &self.options.default_source_name) {
            Ok(template) => render_with(template, self.render_context(context)),
            Err(error) => Eventually::failed(error.into()),
        }
    }

    /// Renders a named template, failing if it needs to wait on a deferred
    /// value.
    ///
    /// # Errors
    /// - If the template name is not found.
    /// - If rendering fails or does not complete synchronously.
    pub fn render_sync<N: AsRef<str>>(
        &self,
        template_name: N,
        context: Option<&Context>,
    ) -> BloxResult<String> {
        let name = template_name.as_ref();
        match self.render(name, context)?.now() {
            Some(result) => Ok(result?),
            None => Err(BloxError::render(format!(
                "Template {} did not render synchronously",
                name
            ))),
        }
    }

    /// Reads, parses and renders the template file at `path`. The path is
    /// used as the source name in errors.
    ///
    /// # Errors
    /// - If the file cannot be read.
    /// - If its contents do not parse.
    pub fn render_file<P: AsRef<Path>>(
        &self,
        path: P,
        context: Option<&Context>,
    ) -> BloxResult<Eventually<String>> {
        let path = path.as_ref();
        let source_name = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|error| BloxError::Io {
            path: source_name.clone(),
            message: error.to_string(),
        })?;
        let template = parse_source(&text, &source_name)?;
        debug!(path = %source_name, "rendering file");
        Ok(render_with(template, self.render_context(context)))
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.templates.keys().collect();
        names.sort();
        f.debug_struct("Engine")
            .field("templates", &names)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BloxInterface for Engine {
    /// Parses `content` and registers it under `name`. The name doubles as
    /// the source name in parse and render errors.
    ///
    /// # Examples
    ///
    /// ```
    /// use blox::{BloxError, BloxInterface, Engine};
    ///
    /// let mut engine = Engine::new();
    /// engine.add_template("page", "[[+each(items) -> item]][[item]][[-each]]").unwrap();
    /// assert!(matches!(
    ///     engine.add_template("page", "again"),
    ///     Err(BloxError::TemplateExists { .. })
    /// ));
    /// ```
    fn add_template<N: AsRef<str>, C: AsRef<str>>(
        &mut self,
        name: N,
        content: C,
    ) -> BloxResult<()> {
        let name = name.as_ref();

        if self.templates.contains_key(name) {
            return Err(BloxError::TemplateExists {
                template_name: name.to_string(),
            });
        }

        let template = parse_source(content.as_ref(), name)?;
        self.templates.insert(name.to_string(), Arc::new(template));
        debug!(template = name, "added template");

        Ok(())
    }

    /// Renders the template registered as `template_name`.
    ///
    /// # Examples
    ///
    /// ```
    /// use blox::{BloxInterface, Context, Engine};
    ///
    /// let mut engine = Engine::new();
    /// engine.add_template("sum", "[[a]] + [[b]] = [[a + b]]").unwrap();
    ///
    /// let context = Context::new().with("a", 2).with("b", 3);
    /// let output = engine.render("sum", Some(&context)).unwrap().now().unwrap().unwrap();
    /// assert_eq!(output, "2 + 3 = 5");
    /// ```
    fn render<N: AsRef<str>>(
        &self,
        template_name: N,
        context: Option<&Context>,
    ) -> BloxResult<Eventually<String>> {
        let name = template_name.as_ref();
        let template = self
            .templates
            .get(name)
            .ok_or_else(|| BloxError::MissingTemplate {
                template_name: name.to_string(),
            })?;
        debug!(template = name, "rendering template");
        Ok(render_with(Arc::clone(template), self.render_context(context)))
    }
}
