use std::sync::Arc;

use crate::value::format_number;

/// Name bound, for the duration of one block's evaluation, to a closure over
/// that block's own contents.
pub const THIS_CONTENTS: &str = "thisContents";

/// Name of the slot holding the contents a caller passed to a template or
/// helper (`[[+greeting]]...[[-greeting]]`).
pub const EMBEDDED_CONTENTS: &str = "embeddedContents";

/// Words which parse as literals and can never be used as identifiers.
pub const RESERVED_WORDS: [&str; 4] = ["true", "false", "null", "undefined"];

/// A position in template source, 1-indexed.
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub source: String,
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new<S: Into<String>>(source: S, line: usize, column: usize) -> Self {
        Self {
            source: source.into(),
            line,
            column,
        }
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Plus,
    Minus,
    Not,
}

impl UnaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Not => "!",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Mul,
    Div,
    Rem,
    Add,
    Sub,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
    /// `left | right` applies `right` to `left`.
    Pipe,
}

impl BinaryOp {
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        Some(match symbol {
            "*" => Self::Mul,
            "/" => Self::Div,
            "%" => Self::Rem,
            "+" => Self::Add,
            "-" => Self::Sub,
            "<" => Self::Lt,
            "<=" => Self::Le,
            ">" => Self::Gt,
            ">=" => Self::Ge,
            "==" => Self::Eq,
            "!=" => Self::Ne,
            "&&" => Self::And,
            "||" => Self::Or,
            "|" => Self::Pipe,
            _ => return None,
        })
    }

    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::And => "&&",
            Self::Or => "||",
            Self::Pipe => "|",
        }
    }

    /// Binding strength; higher binds tighter.
    pub const fn precedence(self) -> u8 {
        match self {
            Self::Mul | Self::Div | Self::Rem => 80,
            Self::Add | Self::Sub => 70,
            Self::Lt | Self::Le | Self::Gt | Self::Ge => 60,
            Self::Eq | Self::Ne => 50,
            Self::And => 30,
            Self::Or => 20,
            Self::Pipe => 10,
        }
    }
}

/// An object literal. Keys keep their first-seen order; a repeated key
/// replaces the earlier value.
#[derive(Debug, Clone, Default)]
pub struct ObjectLiteral {
    pub fields: Vec<(String, Expression)>,
}

impl ObjectLiteral {
    pub fn insert(&mut self, key: String, value: Expression) {
        match self.fields.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = value,
            None => self.fields.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Expression> {
        self.fields.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

impl PartialEq for ObjectLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(key, value)| other.get(key) == Some(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    Undefined,
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
    Identifier(String),
    Property {
        object: Box<Expression>,
        name: String,
    },
    Index {
        object: Box<Expression>,
        index: Box<Expression>,
    },
    Application {
        callee: Box<Expression>,
        args: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        right: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Array(Vec<Expression>),
    Object(ObjectLiteral),
    /// `object{key: value}` merges the literal onto the preceding value.
    Extension {
        object: Box<Expression>,
        extension: ObjectLiteral,
    },
}

/// An expression node. Equality is structural and ignores locations.
#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub location: Location,
}

impl PartialEq for Expression {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Expression {
    pub const fn new(kind: ExprKind, location: Location) -> Self {
        Self { kind, location }
    }

    pub fn identifier<S: Into<String>>(name: S, location: Location) -> Self {
        Self::new(ExprKind::Identifier(name.into()), location)
    }

    pub fn as_identifier(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Identifier(name) => Some(name),
            _ => None,
        }
    }

    /// Identifiers, properties and indexes may be assigned to.
    pub const fn is_lvalue(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Identifier(_) | ExprKind::Property { .. } | ExprKind::Index { .. }
        )
    }

    /// Whether a closing tag naming `target` may close a block opened with
    /// `self`.
    ///
    /// Beyond structural equality, a call may be closed by its function part
    /// (`[[+each(items)]]...[[-each]]`) and a pipeline by its left operand
    /// (`[[+items | each]]...[[-items]]`).
    pub fn can_close(&self, target: &Self) -> bool {
        if self == target {
            return true;
        }
        match &self.kind {
            ExprKind::Application { callee, .. } => callee.can_close(target),
            ExprKind::Binary {
                op: BinaryOp::Pipe,
                left,
                ..
            } => left.can_close(target),
            _ => false,
        }
    }
}

fn write_list(f: &mut std::fmt::Formatter<'_>, items: &[Expression]) -> std::fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

fn write_object(f: &mut std::fmt::Formatter<'_>, object: &ObjectLiteral) -> std::fmt::Result {
    f.write_str("{")?;
    for (i, (key, value)) in object.fields.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}: {}", key, value)?;
    }
    f.write_str("}")
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            ExprKind::Undefined => f.write_str("undefined"),
            ExprKind::Null => f.write_str("null"),
            ExprKind::Boolean(value) => write!(f, "{}", value),
            ExprKind::Number(value) => f.write_str(&format_number(*value)),
            ExprKind::String(value) => write!(f, "{:?}", value),
            ExprKind::Identifier(name) => f.write_str(name),
            ExprKind::Property { object, name } => write!(f, "{}.{}", object, name),
            ExprKind::Index { object, index } => write!(f, "{}[{}]", object, index),
            ExprKind::Application { callee, args } => {
                write!(f, "{}(", callee)?;
                write_list(f, args)?;
                f.write_str(")")
            }
            ExprKind::Unary { op, right } => write!(f, "{}{}", op.symbol(), right),
            ExprKind::Binary { op, left, right } => {
                write!(f, "{}{}{}", left, op.symbol(), right)
            }
            ExprKind::Array(items) => {
                f.write_str("[")?;
                write_list(f, items)?;
                f.write_str("]")
            }
            ExprKind::Object(object) => write_object(f, object),
            ExprKind::Extension { object, extension } => {
                write!(f, "{}", object)?;
                write_object(f, extension)
            }
        }
    }
}

/// How an assignment block combines its value with the target.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    /// `+=`, `-=`, `*=`, `/=`, `%=`.
    Compound(BinaryOp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    /// Contributes the value of its expression to the output.
    Output,
    /// Binds its value to `target` and contributes nothing.
    Assignment { target: Expression, operator: AssignOp },
}

/// One `[[...]]` directive that is not pure text.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub kind: BlockKind,
    pub expression: Expression,
    pub contents: Option<Arc<Template>>,
    pub escape: bool,
    pub optional: bool,
    pub injections: Vec<Injection>,
    pub location: Location,
}

impl Block {
    pub const fn new(expression: Expression, location: Location) -> Self {
        Self {
            kind: BlockKind::Output,
            expression,
            contents: None,
            escape: false,
            optional: false,
            injections: Vec::new(),
            location,
        }
    }

    pub const fn is_assignment(&self) -> bool {
        matches!(self.kind, BlockKind::Assignment { .. })
    }
}

/// A named parameter supplied to the nearest enclosing open block
/// (`[[name: expr]]` or `[[:name]]...[[-name]]`).
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    pub target: String,
    pub expression: Expression,
    pub contents: Option<Arc<Template>>,
    pub location: Location,
}

/// A named template member, evaluated either once per closure (`static`) or
/// on every instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Definition {
    pub name: String,
    pub block: Block,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Child {
    Text(String),
    Block(Block),
}

/// A parsed template. Immutable once built and safe to share between any
/// number of concurrent renders.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub children: Vec<Child>,
    pub params: Vec<String>,
    pub members: Vec<Definition>,
    pub location: Location,
}

impl Template {
    pub const fn new(params: Vec<String>, location: Location) -> Self {
        Self {
            children: Vec::new(),
            params,
            members: Vec::new(),
            location,
        }
    }

    /// The concatenated text of a template that holds no blocks.
    pub fn plain_text(&self) -> Option<String> {
        let mut text = String::new();
        for child in &self.children {
            match child {
                Child::Text(run) => text.push_str(run),
                Child::Block(_) => return None,
            }
        }
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(column: usize) -> Location {
        Location::new("<test>", 1, column)
    }

    fn id(name: &str, column: usize) -> Expression {
        Expression::identifier(name, loc(column))
    }

    fn call(callee: Expression, args: Vec<Expression>) -> Expression {
        Expression::new(
            ExprKind::Application {
                callee: Box::new(callee),
                args,
            },
            loc(1),
        )
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_equality_ignores_location() {
        assert_eq!(id("x", 1), id("x", 40));
        assert_ne!(id("x", 1), id("y", 1));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_can_close_through_application() {
        let open = call(id("each", 1), vec![id("items", 6)]);
        assert!(open.can_close(&id("each", 3)));
        assert!(open.can_close(&call(id("each", 1), vec![id("items", 6)])));
        assert!(!open.can_close(&id("items", 1)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_can_close_through_pipe() {
        let open = Expression::new(
            ExprKind::Binary {
                op: BinaryOp::Pipe,
                left: Box::new(call(id("wrap", 1), vec![])),
                right: Box::new(id("each", 9)),
            },
            loc(1),
        );
        assert!(open.can_close(&id("wrap", 1)));
        assert!(!open.can_close(&id("each", 1)));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_object_literal_equality_is_unordered() {
        let mut a = ObjectLiteral::default();
        a.insert("x".to_string(), id("one", 1));
        a.insert("y".to_string(), id("two", 1));
        let mut b = ObjectLiteral::default();
        b.insert("y".to_string(), id("two", 1));
        b.insert("x".to_string(), id("one", 1));
        assert_eq!(a, b);

        b.insert("x".to_string(), id("three", 1));
        assert_ne!(a, b);
        assert_eq!(b.fields.len(), 2);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_display_reproduces_source() {
        let expr = call(
            Expression::new(
                ExprKind::Property {
                    object: Box::new(id("user", 1)),
                    name: "greet".to_string(),
                },
                loc(1),
            ),
            vec![
                Expression::new(ExprKind::String("hi".to_string()), loc(1)),
                Expression::new(ExprKind::Number(2.5), loc(1)),
            ],
        );
        assert_eq!(expr.to_string(), "user.greet(\"hi\", 2.5)");
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_precedence_table() {
        assert!(BinaryOp::Mul.precedence() > BinaryOp::Add.precedence());
        assert!(BinaryOp::Add.precedence() > BinaryOp::Lt.precedence());
        assert!(BinaryOp::Lt.precedence() > BinaryOp::Eq.precedence());
        assert!(BinaryOp::Eq.precedence() > BinaryOp::And.precedence());
        assert!(BinaryOp::And.precedence() > BinaryOp::Or.precedence());
        assert!(BinaryOp::Or.precedence() > BinaryOp::Pipe.precedence());
        assert_eq!(BinaryOp::from_symbol("<="), Some(BinaryOp::Le));
        assert_eq!(BinaryOp::from_symbol("=>"), None);
    }
}
