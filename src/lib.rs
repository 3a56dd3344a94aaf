//! blox is a templating language built from bracketed blocks: `[[x]]` prints,
//! `[[+f]]...[[-f]]` passes contents to a helper or template, and `[[x = 1]]`
//! binds a name. Templates are closures, so they can be stored, passed and
//! called like functions, and any value may be deferred until a future settles.

mod ast;
mod engine;
mod error;
mod eval;
mod eventually;
mod interface;
mod parser;
mod render;
mod renderable;
mod resolver;
mod scope;
mod stdlib;
mod value;

// Public exports.
pub use ast::{
    AssignOp, BinaryOp, Block, BlockKind, Child, Definition, EMBEDDED_CONTENTS, ExprKind,
    Expression, Injection, Location, ObjectLiteral, RESERVED_WORDS, THIS_CONTENTS, Template,
    UnaryOp,
};
pub use engine::{Engine, EngineOptions};
pub use error::{BloxError, BloxResult, ParseError, RenderError, RenderResult};
pub use eval::evaluate;
pub use eventually::{Eventually, RenderTree, Tree};
pub use interface::{BloxInterface, Context};
pub use parser::{DEFAULT_SOURCE_NAME, parse, parse_source};
pub use render::{Source, render, render_value, render_with};
pub use renderable::{HelperFn, Renderable};
pub use resolver::{DEFAULT_FRAGMENT_EXTENSION, DirResolver, FragmentResolver, MapResolver};
pub use scope::{Environment, RenderContext, Scope};
pub use stdlib::{escape_html, stdlib};
pub use value::{Deferred, Function, Value};
