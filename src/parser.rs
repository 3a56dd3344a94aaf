use std::sync::Arc;

use tracing::trace;

use crate::{
    ast::{
        AssignOp, BinaryOp, Block, BlockKind, Child, Definition, ExprKind, Expression, Injection,
        Location, ObjectLiteral, RESERVED_WORDS, THIS_CONTENTS, Template, UnaryOp,
    },
    error::ParseError,
};

/// Source name used when the caller does not supply one.
pub const DEFAULT_SOURCE_NAME: &str = "<template source>";

/// Name of the builtin invoked by the `@=` and `@:` import sugar.
pub const IMPORT_FUNCTION: &str = "import";

type ParseResult<T> = Result<T, ParseError>;

/// Leading modifier directly after `[[`.
#[derive(Debug, Default)]
struct BlockMods {
    comment: bool,
    open: bool,
    close: bool,
    implicit: bool,
    assign_this: Option<AssignToken>,
}

/// `=`, `:`, optionally prefixed by an arithmetic sigil or `@`.
#[derive(Debug, Clone)]
struct AssignToken {
    sigil: Option<char>,
    inject: bool,
    location: Location,
}

impl AssignToken {
    fn arithmetic(&self) -> Option<BinaryOp> {
        self.sigil
            .filter(|sigil| *sigil != '@')
            .and_then(|sigil| BinaryOp::from_symbol(sigil.encode_utf8(&mut [0; 4])))
    }

    const fn is_import(&self) -> bool {
        matches!(self.sigil, Some('@'))
    }
}

/// Trailing modifiers directly before `]]`.
#[derive(Debug)]
struct Suffix {
    escape: bool,
    optional: bool,
    is_static: bool,
    instance: bool,
    location: Location,
}

#[derive(Debug)]
enum Role {
    Output,
    Assignment { target: Expression, operator: AssignOp },
    Injection { target: String },
    Definition { name: String, is_static: bool },
}

/// A block whose contents are still being parsed.
#[derive(Debug)]
struct PendingBlock {
    role: Role,
    expression: Expression,
    escape: bool,
    optional: bool,
    /// `[[@=name]]a.b[[-name]]`: the body names the fragment to import.
    import_body: bool,
    injections: Vec<Injection>,
    location: Location,
}

enum Finished {
    Child(Block),
    Injection(Injection),
    Definition(Definition),
}

fn import_call(argument: Expression, location: Location) -> Expression {
    Expression::new(
        ExprKind::Application {
            callee: Box::new(Expression::identifier(IMPORT_FUNCTION, location.clone())),
            args: vec![argument],
        },
        location,
    )
}

impl PendingBlock {
    const fn accepts_injections(&self) -> bool {
        !matches!(self.role, Role::Injection { .. })
    }

    fn finish(self, contents: Option<Template>) -> ParseResult<Finished> {
        let mut expression = self.expression;
        let contents = if self.import_body {
            let text = contents
                .as_ref()
                .and_then(Template::plain_text)
                .ok_or_else(|| {
                    ParseError::new(
                        "Import block body must be plain text",
                        self.location.clone(),
                    )
                })?;
            let path = Expression::new(
                ExprKind::String(text.trim().to_string()),
                self.location.clone(),
            );
            expression = import_call(path, self.location.clone());
            None
        } else {
            contents.map(Arc::new)
        };

        let block = |kind| Block {
            kind,
            expression: expression.clone(),
            contents: contents.clone(),
            escape: self.escape,
            optional: self.optional,
            injections: self.injections.clone(),
            location: self.location.clone(),
        };

        Ok(match self.role {
            Role::Output => Finished::Child(block(BlockKind::Output)),
            Role::Assignment { target, operator } => {
                Finished::Child(block(BlockKind::Assignment { target, operator }))
            }
            Role::Injection { target } => Finished::Injection(Injection {
                target,
                expression: expression.clone(),
                contents: contents.clone(),
                location: self.location.clone(),
            }),
            Role::Definition { name, is_static } => Finished::Definition(Definition {
                name,
                block: block(BlockKind::Output),
                is_static,
            }),
        })
    }
}

struct Frame {
    pending: PendingBlock,
    /// Expression a closing tag must match; `None` for implicitly closed
    /// (`[[*...]]`) blocks.
    id: Option<Expression>,
    template: Template,
}

/// Open blocks, innermost last, over the root template.
struct BlockStack {
    root: Template,
    frames: Vec<Frame>,
}

impl BlockStack {
    const fn new(root: Template) -> Self {
        Self {
            root,
            frames: Vec::new(),
        }
    }

    fn template(&mut self) -> &mut Template {
        match self.frames.last_mut() {
            Some(frame) => &mut frame.template,
            None => &mut self.root,
        }
    }

    fn has_enclosing_block(&self) -> bool {
        self.frames
            .iter()
            .any(|frame| frame.pending.accepts_injections())
    }

    fn push(&mut self, pending: PendingBlock, id: Option<Expression>, template: Template) {
        trace!(
            depth = self.frames.len() + 1,
            id = %id.as_ref().map_or_else(|| "*".to_string(), ToString::to_string),
            "open block"
        );
        self.frames.push(Frame {
            pending,
            id,
            template,
        });
    }

    fn attach(&mut self, finished: Finished) -> ParseResult<()> {
        match finished {
            Finished::Child(block) => self.template().children.push(Child::Block(block)),
            Finished::Definition(definition) => self.template().members.push(definition),
            Finished::Injection(injection) => {
                let owner = self
                    .frames
                    .iter_mut()
                    .rev()
                    .map(|frame| &mut frame.pending)
                    .find(|pending| pending.accepts_injections());
                match owner {
                    Some(pending) => pending.injections.push(injection),
                    None => {
                        return Err(ParseError::new(
                            "Cannot inject template parameters unless inside a block",
                            injection.location,
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    /// Pops every frame from `index` upwards, attaching each to its parent.
    fn unwind(&mut self, index: usize) -> ParseResult<()> {
        while self.frames.len() > index {
            let Some(frame) = self.frames.pop() else {
                break;
            };
            trace!(depth = self.frames.len(), "close block");
            let finished = frame.pending.finish(Some(frame.template))?;
            self.attach(finished)?;
        }
        Ok(())
    }

    /// Closes the innermost explicitly opened block, together with any
    /// implicit blocks opened inside it.
    fn close(&mut self, id: &Expression) -> ParseResult<()> {
        let Some(index) = self.frames.iter().rposition(|frame| frame.id.is_some()) else {
            return Err(ParseError::new(
                "Unexpected closing tag",
                id.location.clone(),
            ));
        };
        if let Some(open) = self.frames.get(index).and_then(|frame| frame.id.as_ref()) {
            // `[[-each(other)]]` closes `[[+each(items)]]`
            let through_call = match &id.kind {
                ExprKind::Application { callee, .. } => open.can_close(callee),
                _ => false,
            };
            if !open.can_close(id) && !through_call {
                return Err(ParseError::new(
                    format!("Expected [[-{}]]", open),
                    id.location.clone(),
                ));
            }
        }
        self.unwind(index)
    }

    /// Closes the root at end of input.
    fn finish(mut self, end: Location) -> ParseResult<Template> {
        if let Some(open) = self.frames.iter().rev().find_map(|frame| frame.id.as_ref()) {
            return Err(ParseError::new(format!("Expected [[-{}]]", open), end));
        }
        self.unwind(0)?;
        Ok(self.root)
    }
}

struct Parser<'a> {
    input: &'a str,
    source: &'a str,
    pos: usize,
    /// Current line number (1-indexed)
    line: usize,
    /// The starting location of the current line
    line_start_pos: usize,
}

impl<'a> Parser<'a> {
    const fn new(input: &'a str, source: &'a str) -> Self {
        Parser {
            input,
            source,
            pos: 0,
            line: 1,
            line_start_pos: 0,
        }
    }

    fn current_column(&self) -> usize {
        self.input
            .get(self.line_start_pos..self.pos)
            .map_or(0, |line| line.chars().count())
            + 1
    }

    fn location(&self) -> Location {
        Location::new(self.source, self.line, self.current_column())
    }

    fn make_error<M: Into<String>>(&self, message: M) -> ParseError {
        ParseError::new(message, self.location())
    }

    /// Advances past `current_char`, updating the line if it is a newline.
    #[inline]
    fn advance_by_char(&mut self, current_char: char) {
        let char_len = current_char.len_utf8();
        if current_char == '\n' {
            self.line += 1;
            self.line_start_pos = self.pos + char_len;
        }
        self.pos += char_len;
    }

    /// Advances by `len` bytes which must not contain a newline.
    #[inline]
    fn advance_bytes_no_newline(&mut self, len: usize) {
        self.pos += len;
    }

    fn eof(&self) -> bool {
        self.pos >= self.input.len()
    }

    fn rest(&self) -> &'a str {
        self.input.get(self.pos..).unwrap_or_default()
    }

    fn peek(&self, s: &str) -> bool {
        self.rest().starts_with(s)
    }

    fn peek_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// Consume `s` if the remaining input starts with it.
    /// Assumes `s` does not contain newlines.
    fn consume(&mut self, s: &str) -> bool {
        if self.peek(s) {
            self.advance_bytes_no_newline(s.len());
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if !c.is_whitespace() {
                break;
            }
            self.advance_by_char(c);
        }
    }

    /// Skips whitespace, then consumes `s`, returning where it started.
    fn token(&mut self, s: &str) -> Option<Location> {
        self.skip_whitespace();
        let location = self.location();
        self.consume(s).then_some(location)
    }

    fn expect_token(&mut self, s: &str, message: &str) -> ParseResult<Location> {
        self.token(s).ok_or_else(|| self.make_error(message))
    }

    // --- Text and blocks ---

    /// The maximal run of text up to the next `[[`.
    fn parse_text(&mut self) -> Option<String> {
        let start = self.pos;
        while let Some(c) = self.peek_char() {
            if self.peek("[[") {
                break;
            }
            self.advance_by_char(c);
        }
        self.input
            .get(start..self.pos)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    }

    fn skip_comment(&mut self, opener: Location) -> ParseResult<()> {
        while let Some(c) = self.peek_char() {
            if self.consume("#]]") {
                return Ok(());
            }
            self.advance_by_char(c);
        }
        Err(ParseError::new("Unterminated comment", opener))
    }

    fn parse_block_mods(&mut self) -> BlockMods {
        let mut mods = BlockMods::default();
        let location = self.location();
        let rest = self.rest();
        if rest.starts_with('#') {
            mods.comment = true;
        } else if rest.starts_with('-') {
            mods.close = true;
        } else if rest.starts_with('+') {
            mods.open = true;
        } else if rest.starts_with('*') {
            mods.open = true;
            mods.implicit = true;
        } else {
            let import = rest.starts_with('@');
            let operator = if import {
                rest.strip_prefix('@').unwrap_or(rest)
            } else {
                rest
            };
            let inject = match operator.chars().next() {
                Some('=') => false,
                Some(':') => true,
                _ => return mods,
            };
            mods.open = true;
            mods.assign_this = Some(AssignToken {
                sigil: import.then_some('@'),
                inject,
                location,
            });
            self.advance_bytes_no_newline(usize::from(import));
        }
        self.advance_bytes_no_newline(1);
        mods
    }

    fn parse_assignment(&mut self) -> Option<AssignToken> {
        self.skip_whitespace();
        let location = self.location();
        let mut chars = self.rest().chars();
        let first = chars.next()?;
        let (sigil, operator) = match first {
            '+' | '-' | '*' | '/' | '%' | '@' => (Some(first), chars.next()?),
            _ => (None, first),
        };
        let inject = match operator {
            '=' => false,
            ':' => true,
            _ => return None,
        };
        self.advance_bytes_no_newline(if sigil.is_some() { 2 } else { 1 });
        Some(AssignToken {
            sigil,
            inject,
            location,
        })
    }

    fn parse_params(&mut self) -> ParseResult<Option<(Vec<String>, Location)>> {
        let Some(location) = self.token("->") else {
            return Ok(None);
        };
        let params = self.parse_sequence(
            |parser| Ok(parser.parse_identifier()?.map(|(name, _)| name)),
            "parameter name",
        )?;
        if params.is_empty() {
            return Err(self.make_error("Expected parameter list"));
        }
        Ok(Some((params, location)))
    }

    fn parse_suffix(&mut self) -> Suffix {
        self.skip_whitespace();
        let mut suffix = Suffix {
            escape: false,
            optional: false,
            is_static: false,
            instance: false,
            location: self.location(),
        };
        while let Some(c) = self.peek_char() {
            match c {
                '!' => suffix.escape = true,
                '?' => suffix.optional = true,
                's' => suffix.is_static = true,
                'i' => suffix.instance = true,
                _ => break,
            }
            self.advance_bytes_no_newline(1);
        }
        suffix
    }

    fn parse_block(&mut self, stack: &mut BlockStack) -> ParseResult<()> {
        let location = self.location();
        self.advance_bytes_no_newline(2);

        let mods = self.parse_block_mods();
        if mods.comment {
            return self.skip_comment(location);
        }

        let mut expression = self
            .parse_expression()?
            .ok_or_else(|| self.make_error("Expected expression for block"))?;
        let mut assignment = None;
        if let Some(token) = self.parse_assignment() {
            let value = self
                .parse_expression()?
                .ok_or_else(|| self.make_error("Expected expression for block"))?;
            assignment = Some((std::mem::replace(&mut expression, value), token));
        }
        let params = self.parse_params()?;
        let suffix = self.parse_suffix();
        if !self.consume("]]") {
            return Err(self.make_error("Expected ]]"));
        }

        if mods.close {
            if let Some((_, params_location)) = params {
                return Err(ParseError::new(
                    "Closing block may not have parameters",
                    params_location,
                ));
            }
            if let Some((_, token)) = assignment {
                return Err(ParseError::new(
                    "Closing block may not contain an assignment",
                    token.location,
                ));
            }
            if suffix.escape || suffix.optional || suffix.is_static || suffix.instance {
                return Err(ParseError::new(
                    "Closing block may not have suffixes",
                    suffix.location,
                ));
            }
            return stack.close(&expression);
        }

        if !mods.open {
            if let Some((_, params_location)) = params {
                return Err(ParseError::new(
                    "Only open blocks can have parameters",
                    params_location,
                ));
            }
        }

        let id = (mods.open && !mods.implicit).then(|| expression.clone());
        let import_body = mods.assign_this.as_ref().is_some_and(AssignToken::is_import);
        let role = Self::block_role(mods.assign_this, assignment, &mut expression, &suffix)?;
        if matches!(role, Role::Injection { .. }) && !stack.has_enclosing_block() {
            return Err(ParseError::new(
                "Cannot inject template parameters unless inside a block",
                location,
            ));
        }

        let pending = PendingBlock {
            role,
            expression,
            escape: suffix.escape,
            optional: suffix.optional,
            import_body,
            injections: Vec::new(),
            location: location.clone(),
        };
        if mods.open {
            let params = params.map(|(names, _)| names).unwrap_or_default();
            stack.push(pending, id, Template::new(params, location));
            Ok(())
        } else {
            stack.attach(pending.finish(None)?)
        }
    }

    /// Decides what a block does with its value, rewriting `expression` for
    /// the `=name`, `:name` and `@` forms.
    fn block_role(
        assign_this: Option<AssignToken>,
        assignment: Option<(Expression, AssignToken)>,
        expression: &mut Expression,
        suffix: &Suffix,
    ) -> ParseResult<Role> {
        let assignment = match (assign_this, assignment) {
            (Some(_), Some((_, inline))) => {
                return Err(ParseError::new(
                    "Multiple assignment operators",
                    inline.location,
                ));
            }
            (Some(this), None) => {
                let contents = Expression::identifier(THIS_CONTENTS, this.location.clone());
                Some((std::mem::replace(expression, contents), this))
            }
            (None, Some((target, inline))) => {
                if inline.is_import() {
                    let path = std::mem::replace(
                        expression,
                        Expression::new(ExprKind::Undefined, inline.location.clone()),
                    );
                    *expression = import_call(path, inline.location.clone());
                }
                Some((target, inline))
            }
            (None, None) => None,
        };

        let Some((target, token)) = assignment else {
            if suffix.is_static || suffix.instance {
                return Err(ParseError::new(
                    "Only definitions may use static or instance suffixes",
                    suffix.location.clone(),
                ));
            }
            return Ok(Role::Output);
        };

        if suffix.escape || suffix.optional {
            return Err(ParseError::new(
                "Assignments cannot use escape or optional suffixes",
                suffix.location.clone(),
            ));
        }
        if suffix.is_static && suffix.instance {
            return Err(ParseError::new(
                "Definition cannot be both static and instance",
                suffix.location.clone(),
            ));
        }

        if token.inject {
            if token.arithmetic().is_some() {
                return Err(ParseError::new(
                    "Injections cannot use compound operators",
                    token.location,
                ));
            }
            if suffix.is_static || suffix.instance {
                return Err(ParseError::new(
                    "Only definitions may use static or instance suffixes",
                    suffix.location.clone(),
                ));
            }
            let Some(name) = target.as_identifier() else {
                return Err(ParseError::new("Not an identifier", target.location));
            };
            return Ok(Role::Injection {
                target: name.to_string(),
            });
        }

        if suffix.is_static || suffix.instance {
            if token.arithmetic().is_some() {
                return Err(ParseError::new(
                    "Definitions cannot use compound operators",
                    token.location,
                ));
            }
            let Some(name) = target.as_identifier() else {
                return Err(ParseError::new("Not an identifier", target.location));
            };
            return Ok(Role::Definition {
                name: name.to_string(),
                is_static: suffix.is_static,
            });
        }

        if !target.is_lvalue() {
            return Err(ParseError::new("Not an lvalue", target.location));
        }
        let operator = token.arithmetic().map_or(AssignOp::Assign, AssignOp::Compound);
        Ok(Role::Assignment { target, operator })
    }

    // --- Expressions ---

    /// Binary expressions by precedence climbing over explicit operand and
    /// operator stacks. Equal precedence reduces first, so every operator is
    /// left-associative.
    fn parse_expression(&mut self) -> ParseResult<Option<Expression>> {
        let Some(first) = self.parse_primary()? else {
            return Ok(None);
        };
        let mut values = vec![first];
        let mut operators: Vec<(BinaryOp, Location)> = Vec::new();

        while let Some((op, location)) = self.parse_binary() {
            let Some(operand) = self.parse_primary()? else {
                return Err(self.make_error("Expected operand"));
            };
            while operators
                .last()
                .is_some_and(|(top, _)| top.precedence() >= op.precedence())
            {
                Self::reduce(&mut values, &mut operators);
            }
            operators.push((op, location));
            values.push(operand);
        }

        while !operators.is_empty() {
            Self::reduce(&mut values, &mut operators);
        }
        Ok(values.pop())
    }

    fn reduce(values: &mut Vec<Expression>, operators: &mut Vec<(BinaryOp, Location)>) {
        if let (Some((op, location)), Some(right), Some(left)) =
            (operators.pop(), values.pop(), values.pop())
        {
            values.push(Expression::new(
                ExprKind::Binary {
                    op,
                    left: Box::new(left),
                    right: Box::new(right),
                },
                location,
            ));
        }
    }

    fn parse_binary(&mut self) -> Option<(BinaryOp, Location)> {
        self.skip_whitespace();
        let rest = self.rest();
        let next = rest.as_bytes().get(1).copied();
        let symbol = ["<=", ">=", "==", "!=", "&&", "||"]
            .into_iter()
            .find(|symbol| rest.starts_with(symbol))
            .or_else(|| {
                let first = rest.get(..1)?;
                match first {
                    // `+=` and friends belong to the assignment
                    "*" | "/" | "%" | "+" if !matches!(next, Some(b'=' | b':')) => Some(first),
                    "-" if !matches!(next, Some(b'=' | b':' | b'>')) => Some(first),
                    "<" | ">" | "|" => Some(first),
                    _ => None,
                }
            })?;
        let op = BinaryOp::from_symbol(symbol)?;
        let location = self.location();
        self.advance_bytes_no_newline(symbol.len());
        Some((op, location))
    }

    fn parse_unary(&mut self) -> Option<(UnaryOp, Location)> {
        self.skip_whitespace();
        let op = match self.peek_char()? {
            '+' => UnaryOp::Plus,
            '-' => UnaryOp::Minus,
            '!' => UnaryOp::Not,
            _ => return None,
        };
        let location = self.location();
        self.advance_bytes_no_newline(1);
        Some((op, location))
    }

    /// Unary prefixes, an atom, then any chain of call, extension, index and
    /// property postfixes.
    fn parse_primary(&mut self) -> ParseResult<Option<Expression>> {
        let mut prefixes = Vec::new();
        while let Some(prefix) = self.parse_unary() {
            prefixes.push(prefix);
        }

        let Some(mut expr) = self.parse_atom()? else {
            if prefixes.is_empty() {
                return Ok(None);
            }
            return Err(self.make_error("Expected operand"));
        };

        loop {
            if let Some(location) = self.token("(") {
                let args = self.parse_sequence(Self::parse_expression, "expression")?;
                self.expect_token(")", "Expected closing parenthesis after argument list")?;
                expr = Expression::new(
                    ExprKind::Application {
                        callee: Box::new(expr),
                        args,
                    },
                    location,
                );
            } else if let Some((extension, location)) =
                self.parse_object_literal("object extension")?
            {
                expr = Expression::new(
                    ExprKind::Extension {
                        object: Box::new(expr),
                        extension,
                    },
                    location,
                );
            } else if let Some(location) = self.token("[") {
                let index = self
                    .parse_expression()?
                    .ok_or_else(|| self.make_error("Expected expression for index"))?;
                self.expect_token("]", "Expected closing bracket for index")?;
                expr = Expression::new(
                    ExprKind::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    },
                    location,
                );
            } else if let Some(location) = self.token(".") {
                let (name, _) = self
                    .parse_identifier()?
                    .ok_or_else(|| self.make_error("Expected identifier for property name"))?;
                expr = Expression::new(
                    ExprKind::Property {
                        object: Box::new(expr),
                        name,
                    },
                    location,
                );
            } else {
                break;
            }
        }

        while let Some((op, location)) = prefixes.pop() {
            expr = Expression::new(
                ExprKind::Unary {
                    op,
                    right: Box::new(expr),
                },
                location,
            );
        }
        Ok(Some(expr))
    }

    fn parse_atom(&mut self) -> ParseResult<Option<Expression>> {
        if let Some(number) = self.parse_number()? {
            return Ok(Some(number));
        }
        if let Some(string) = self.parse_string()? {
            return Ok(Some(string));
        }
        if let Some((word, location)) = self.scan_word() {
            let kind = match word {
                "null" => ExprKind::Null,
                "undefined" => ExprKind::Undefined,
                "true" => ExprKind::Boolean(true),
                "false" => ExprKind::Boolean(false),
                name => ExprKind::Identifier(name.to_string()),
            };
            return Ok(Some(Expression::new(kind, location)));
        }
        if self.token("(").is_some() {
            let nested = self
                .parse_expression()?
                .ok_or_else(|| self.make_error("Expected expression after opening parenthesis"))?;
            self.expect_token(")", "Expected closing parenthesis after nested expression")?;
            return Ok(Some(nested));
        }
        if let Some(location) = self.token("[") {
            let items = self.parse_sequence(Self::parse_expression, "value in array literal")?;
            self.expect_token("]", "Expected closing bracket after array literal")?;
            return Ok(Some(Expression::new(ExprKind::Array(items), location)));
        }
        if let Some((object, location)) = self.parse_object_literal("object literal")? {
            return Ok(Some(Expression::new(ExprKind::Object(object), location)));
        }
        Ok(None)
    }

    fn parse_object_literal(
        &mut self,
        description: &str,
    ) -> ParseResult<Option<(ObjectLiteral, Location)>> {
        let Some(location) = self.token("{") else {
            return Ok(None);
        };
        let mut object = ObjectLiteral::default();
        while let Some((key, _)) = self.parse_identifier()? {
            if self.token(":").is_none() {
                return Err(self.make_error(format!(
                    "Expected colon after identifier in {}",
                    description
                )));
            }
            let Some(value) = self.parse_expression()? else {
                return Err(self.make_error(format!("Expected value for property {}", key)));
            };
            object.insert(key, value);
            if self.token(",").is_none() {
                break;
            }
        }
        if self.token("}").is_none() {
            return Err(self.make_error(format!("Expected closing brace after {}", description)));
        }
        Ok(Some((object, location)))
    }

    /// Zero or more comma separated items.
    fn parse_sequence<T>(
        &mut self,
        mut parse_one: impl FnMut(&mut Self) -> ParseResult<Option<T>>,
        description: &str,
    ) -> ParseResult<Vec<T>> {
        let Some(first) = parse_one(self)? else {
            return Ok(Vec::new());
        };
        let mut items = vec![first];
        while self.token(",").is_some() {
            match parse_one(self)? {
                Some(item) => items.push(item),
                None => return Err(self.make_error(format!("Expected {}", description))),
            }
        }
        Ok(items)
    }

    // --- Literals ---

    /// `[a-zA-Z_$][\w$]*`
    fn scan_word(&mut self) -> Option<(&'a str, Location)> {
        self.skip_whitespace();
        let rest = self.rest();
        let is_start = |c: char| c.is_ascii_alphabetic() || c == '_' || c == '$';
        let is_part = |c: char| c.is_ascii_alphanumeric() || c == '_' || c == '$';
        if !rest.chars().next().is_some_and(is_start) {
            return None;
        }
        let len = rest
            .char_indices()
            .find(|&(_, c)| !is_part(c))
            .map_or(rest.len(), |(i, _)| i);
        let location = self.location();
        self.advance_bytes_no_newline(len);
        rest.get(..len).map(|word| (word, location))
    }

    /// An identifier where a name is required; reserved words are rejected.
    fn parse_identifier(&mut self) -> ParseResult<Option<(String, Location)>> {
        match self.scan_word() {
            Some((word, location)) if RESERVED_WORDS.contains(&word) => Err(ParseError::new(
                format!("Cannot use reserved word \"{}\" as identifier", word),
                location,
            )),
            Some((word, location)) => Ok(Some((word.to_string(), location))),
            None => Ok(None),
        }
    }

    /// `(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?`
    fn parse_number(&mut self) -> ParseResult<Option<Expression>> {
        self.skip_whitespace();
        let rest = self.rest();
        let bytes = rest.as_bytes();
        let digits = |from: usize| {
            bytes
                .get(from..)
                .map_or(0, |tail| tail.iter().take_while(|b| b.is_ascii_digit()).count())
        };

        let integer = digits(0);
        let mut len = if integer > 0 {
            if bytes.get(integer) == Some(&b'.') {
                integer + 1 + digits(integer + 1)
            } else {
                integer
            }
        } else if bytes.first() == Some(&b'.') && digits(1) > 0 {
            1 + digits(1)
        } else {
            return Ok(None);
        };
        if matches!(bytes.get(len), Some(b'e' | b'E')) {
            let sign = usize::from(matches!(bytes.get(len + 1), Some(b'+' | b'-')));
            let exponent = digits(len + 1 + sign);
            if exponent > 0 {
                len += 1 + sign + exponent;
            }
        }

        let location = self.location();
        let text = rest.get(..len).unwrap_or_default();
        let value = text.parse::<f64>().map_err(|_| {
            ParseError::new(format!("Invalid number literal {}", text), location.clone())
        })?;
        self.advance_bytes_no_newline(len);
        Ok(Some(Expression::new(ExprKind::Number(value), location)))
    }

    /// A double quoted string. `\n` and `\t` are translated, any other
    /// escaped character (including a newline) stands for itself.
    fn parse_string(&mut self) -> ParseResult<Option<Expression>> {
        self.skip_whitespace();
        let location = self.location();
        if !self.consume("\"") {
            return Ok(None);
        }
        let mut value = String::new();
        loop {
            match self.peek_char() {
                None | Some('\n') => return Err(self.make_error("Unterminated string literal")),
                Some('"') => {
                    self.advance_bytes_no_newline(1);
                    break;
                }
                Some('\\') => {
                    self.advance_bytes_no_newline(1);
                    let Some(escaped) = self.peek_char() else {
                        return Err(self.make_error("Unterminated string literal"));
                    };
                    self.advance_by_char(escaped);
                    value.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                Some(c) => {
                    self.advance_by_char(c);
                    value.push(c);
                }
            }
        }
        Ok(Some(Expression::new(ExprKind::String(value), location)))
    }
}

/// Parses template source named [`DEFAULT_SOURCE_NAME`].
pub fn parse(text: &str) -> Result<Template, ParseError> {
    parse_source(text, DEFAULT_SOURCE_NAME)
}

/// Parses template source, naming it `source_name` in locations.
///
/// Stops at the first malformed construct; the error never points before
/// the last character that was successfully consumed.
#[tracing::instrument(level = "debug", skip(text), fields(len = text.len()))]
pub fn parse_source(text: &str, source_name: &str) -> Result<Template, ParseError> {
    let mut parser = Parser::new(text, source_name);
    let mut stack = BlockStack::new(Template::new(Vec::new(), parser.location()));

    while !parser.eof() {
        if let Some(run) = parser.parse_text() {
            stack.template().children.push(Child::Text(run));
        }
        if parser.peek("[[") {
            parser.parse_block(&mut stack)?;
        }
    }

    let end = parser.location();
    stack.finish(end)
}

/// Tests for individual functions in the parser module.
#[cfg(test)]
mod test_utils {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_columns_count_characters() {
        let mut parser = Parser::new("é\nab", "<test>");
        parser.advance_by_char('é');
        assert_eq!(parser.location(), Location::new("<test>", 1, 2));
        parser.advance_by_char('\n');
        parser.advance_bytes_no_newline(1);
        assert_eq!(parser.location(), Location::new("<test>", 2, 2));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_binary_does_not_take_assignment_or_arrow() {
        assert!(Parser::new("+= 1", "").parse_binary().is_none());
        assert!(Parser::new("-> x", "").parse_binary().is_none());
        assert!(Parser::new("= 1", "").parse_binary().is_none());
        assert_eq!(
            Parser::new(" || x", "").parse_binary().map(|(op, _)| op),
            Some(BinaryOp::Or)
        );
        assert_eq!(
            Parser::new("| x", "").parse_binary().map(|(op, _)| op),
            Some(BinaryOp::Pipe)
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_number_forms() {
        for (text, expected) in [("42", 42.0), ("3.14", 3.14), (".5", 0.5), ("1e3", 1000.0), ("2.5E-1", 0.25)] {
            let parsed = Parser::new(text, "").parse_number().unwrap().unwrap();
            assert_eq!(parsed.kind, ExprKind::Number(expected), "parsing {}", text);
        }
        assert!(Parser::new("abc", "").parse_number().unwrap().is_none());
    }
}
