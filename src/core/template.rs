/// Prompt template runtime — parsing, function pipes, and rendering.
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
    #[error("unknown template function '{0}'")]
    UnknownFunction(String),
    #[error("template function '{name}' failed: {message}")]
    Function { name: String, message: String },
}

impl TemplateError {
    fn parse(offset: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            offset,
            message: message.into(),
        }
    }
}

/// A segment of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text, emitted as-is. Escaped `$${...}` lands here as `${...}`.
    Literal(String),
    /// An embedded `${path|fn(args)}` expression.
    Expr(Expression),
}

/// One step of a context path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Plain key lookup: `name`.
    Key(String),
    /// List projection: `name[*]`. The rest of the path is evaluated
    /// against every element.
    Wildcard(String),
}

/// A single `|name("arg", ...)` pipe stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeCall {
    pub name: String,
    pub args: Vec<String>,
}

/// A parsed `${...}` expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    pub path: Vec<PathSegment>,
    pub pipes: Vec<PipeCall>,
    source: String,
}

/// A parsed template — a sequence of segments.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub segments: Vec<Segment>,
}

impl Template {
    /// Parse a template string into a sequence of segments.
    ///
    /// Syntax:
    /// - `${a.b.c}` → path lookup against the context
    /// - `${items[*].name}` → project a list, then continue the path per element
    /// - `${path|join(", ")|default("none")}` → pipe through functions
    /// - `$${...}` → literal `${...}`, not evaluated
    /// - Everything else → `Literal`
    pub fn parse(input: &str) -> Result<Template, TemplateError> {
        let mut segments = Vec::new();
        let mut literal_buf = String::new();
        let chars: Vec<char> = input.chars().collect();
        let len = chars.len();
        let mut i = 0;

        while i < len {
            if chars[i] == '$' {
                // Escaped expression
                if i + 2 < len && chars[i + 1] == '$' && chars[i + 2] == '{' {
                    let end = find_expression_end(&chars, i + 3, i)?;
                    literal_buf.extend(&chars[i + 1..=end]);
                    i = end + 1;
                    continue;
                }

                if i + 1 < len && chars[i + 1] == '{' {
                    if !literal_buf.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal_buf)));
                    }

                    let end = find_expression_end(&chars, i + 2, i)?;
                    let content: String = chars[i + 2..end].iter().collect();
                    segments.push(Segment::Expr(Expression::parse(&content, i)?));
                    i = end + 1;
                    continue;
                }
            }

            literal_buf.push(chars[i]);
            i += 1;
        }

        if !literal_buf.is_empty() {
            segments.push(Segment::Literal(literal_buf));
        }

        Ok(Template { segments })
    }

    /// All expressions in source order.
    pub fn expressions(&self) -> impl Iterator<Item = &Expression> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Expr(e) => Some(e),
            Segment::Literal(_) => None,
        })
    }

    /// Names of every pipe function the template calls, deduplicated.
    pub fn referenced_functions(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for expr in self.expressions() {
            for pipe in &expr.pipes {
                if !names.contains(&pipe.name.as_str()) {
                    names.push(&pipe.name);
                }
            }
        }
        names
    }

    /// Context paths the template reads, in dotted form (`items[*].value`),
    /// deduplicated.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = Vec::new();
        for expr in self.expressions() {
            let dotted = expr.dotted_path();
            if !paths.contains(&dotted) {
                paths.push(dotted);
            }
        }
        paths
    }

    /// Render against `context` using the given function registry.
    ///
    /// Output is produced only when every expression evaluates; an unknown
    /// function or a failing pipe yields an error and no partial text.
    pub fn render(
        &self,
        context: &Value,
        functions: &FunctionRegistry,
    ) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Expr(expr) => {
                    let value = expr.evaluate(context, functions)?;
                    out.push_str(&display_value(value.as_ref()));
                }
            }
        }
        Ok(out)
    }
}

/// Scan forward from `start` to the `}` closing an expression opened at
/// `open`. Braces inside double-quoted arguments do not count.
fn find_expression_end(chars: &[char], start: usize, open: usize) -> Result<usize, TemplateError> {
    let mut in_string = false;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' if in_string => i += 1,
            '"' => in_string = !in_string,
            '{' if !in_string => {
                return Err(TemplateError::parse(i, "nested braces are not allowed"));
            }
            '}' if !in_string => return Ok(i),
            _ => {}
        }
        i += 1;
    }
    Err(TemplateError::parse(open, "unclosed expression"))
}

impl Expression {
    fn parse(content: &str, offset: usize) -> Result<Expression, TemplateError> {
        let pieces = split_outside_quotes(content, '|');
        let mut pieces = pieces.into_iter();

        let path_src = pieces.next().unwrap_or_default();
        let path_src = path_src.trim();
        if path_src.is_empty() {
            return Err(TemplateError::parse(offset, "empty expression"));
        }

        let mut path = Vec::new();
        for raw in path_src.split('.') {
            let raw = raw.trim();
            let segment = if let Some(name) = raw.strip_suffix("[*]") {
                check_identifier(name, offset)?;
                PathSegment::Wildcard(name.to_string())
            } else {
                check_identifier(raw, offset)?;
                PathSegment::Key(raw.to_string())
            };
            path.push(segment);
        }

        let mut pipes = Vec::new();
        for raw in pieces {
            pipes.push(parse_pipe(raw.trim(), offset)?);
        }

        Ok(Expression {
            path,
            pipes,
            source: content.trim().to_string(),
        })
    }

    /// The expression as written between `${` and `}`.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn dotted_path(&self) -> String {
        self.path
            .iter()
            .map(|s| match s {
                PathSegment::Key(k) => k.clone(),
                PathSegment::Wildcard(k) => format!("{k}[*]"),
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Evaluate to a value; `None` means absent.
    pub fn evaluate(
        &self,
        context: &Value,
        functions: &FunctionRegistry,
    ) -> Result<Option<Value>, TemplateError> {
        let mut value = resolve_path(&self.path, context);
        for pipe in &self.pipes {
            value = functions.call(&pipe.name, value, &pipe.args)?;
        }
        Ok(value)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}}}", self.source)
    }
}

fn check_identifier(name: &str, offset: usize) -> Result<(), TemplateError> {
    if name.is_empty() {
        return Err(TemplateError::parse(offset, "empty path segment"));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(TemplateError::parse(
            offset,
            format!("invalid path segment '{name}'"),
        ));
    }
    Ok(())
}

fn parse_pipe(raw: &str, offset: usize) -> Result<PipeCall, TemplateError> {
    let (name, args) = match raw.find('(') {
        Some(open) => {
            let Some(inner) = raw[open + 1..].strip_suffix(')') else {
                return Err(TemplateError::parse(
                    offset,
                    format!("unclosed argument list in '{raw}'"),
                ));
            };
            (raw[..open].trim(), parse_args(inner, offset)?)
        }
        None => (raw, Vec::new()),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(TemplateError::parse(
            offset,
            format!("invalid function name '{name}'"),
        ));
    }

    Ok(PipeCall {
        name: name.to_string(),
        args,
    })
}

/// Parse a comma-separated list of double-quoted string literals.
fn parse_args(src: &str, offset: usize) -> Result<Vec<String>, TemplateError> {
    let chars: Vec<char> = src.chars().collect();
    let len = chars.len();
    let mut args = Vec::new();
    let mut i = 0;

    let skip_ws = |i: &mut usize| {
        while *i < len && chars[*i].is_whitespace() {
            *i += 1;
        }
    };

    skip_ws(&mut i);
    if i == len {
        return Ok(args);
    }

    loop {
        skip_ws(&mut i);
        if i == len || chars[i] != '"' {
            return Err(TemplateError::parse(
                offset,
                "function arguments must be double-quoted strings",
            ));
        }
        i += 1;

        let mut arg = String::new();
        loop {
            if i == len {
                return Err(TemplateError::parse(offset, "unterminated string argument"));
            }
            match chars[i] {
                '"' => break,
                '\\' if i + 1 < len => {
                    i += 1;
                    arg.push(match chars[i] {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
                c => arg.push(c),
            }
            i += 1;
        }
        i += 1;
        args.push(arg);

        skip_ws(&mut i);
        if i == len {
            return Ok(args);
        }
        if chars[i] != ',' {
            return Err(TemplateError::parse(
                offset,
                "expected ',' between function arguments",
            ));
        }
        i += 1;
    }
}

fn split_outside_quotes(src: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in src.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_string = !in_string;
                current.push(c);
            }
            c if c == sep && !in_string => parts.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    parts.push(current);
    parts
}

/// Walk `path` through `value`. Missing keys anywhere yield `None`.
fn resolve_path(path: &[PathSegment], value: &Value) -> Option<Value> {
    let Some((head, rest)) = path.split_first() else {
        return Some(value.clone());
    };

    match head {
        PathSegment::Key(key) => value.as_object()?.get(key).and_then(|v| resolve_path(rest, v)),
        PathSegment::Wildcard(key) => {
            let items = value.as_object()?.get(key)?.as_array()?;
            let nested = rest.iter().any(|s| matches!(s, PathSegment::Wildcard(_)));
            let mut projected = Vec::with_capacity(items.len());
            for item in items {
                match resolve_path(rest, item) {
                    Some(Value::Array(inner)) if nested => projected.extend(inner),
                    Some(v) => projected.push(v),
                    None => {}
                }
            }
            Some(Value::Array(projected))
        }
    }
}

/// Text form of a value as it appears in rendered output.
pub fn display_value(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

/// Signature shared by all pipe functions: current value and string
/// arguments in, new value out. Errors are plain messages.
pub type TemplateFunction =
    Arc<dyn Fn(Option<Value>, &[String]) -> Result<Option<Value>, String> + Send + Sync>;

/// Named pipe functions available to templates.
#[derive(Clone)]
pub struct FunctionRegistry {
    functions: FxHashMap<String, TemplateFunction>,
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.functions.keys().collect();
        names.sort();
        f.debug_struct("FunctionRegistry").field("functions", &names).finish()
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FunctionRegistry {
    /// A registry with no functions at all.
    pub fn empty() -> Self {
        Self {
            functions: FxHashMap::default(),
        }
    }

    /// The built-in set: `join`, `default`, `json`, `upper`, `lower`,
    /// `trim`, `first`, `count`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("join", |value, args| {
            let sep = single_arg("join", args)?;
            Ok(match value {
                Some(Value::Array(items)) => Some(Value::String(
                    items
                        .iter()
                        .filter(|v| !v.is_null())
                        .map(|v| display_value(Some(v)))
                        .collect::<Vec<_>>()
                        .join(sep),
                )),
                other => other,
            })
        });
        registry.register("default", |value, args| {
            let fallback = single_arg("default", args)?;
            if is_empty(value.as_ref()) {
                Ok(Some(Value::String(fallback.to_string())))
            } else {
                Ok(value)
            }
        });
        registry.register("json", |value, args| {
            no_args("json", args)?;
            let value = value.unwrap_or(Value::Null);
            Ok(Some(Value::String(value.to_string())))
        });
        registry.register("upper", |value, args| {
            no_args("upper", args)?;
            Ok(map_string(value, |s| s.to_uppercase()))
        });
        registry.register("lower", |value, args| {
            no_args("lower", args)?;
            Ok(map_string(value, |s| s.to_lowercase()))
        });
        registry.register("trim", |value, args| {
            no_args("trim", args)?;
            Ok(map_string(value, |s| s.trim().to_string()))
        });
        registry.register("first", |value, args| {
            no_args("first", args)?;
            Ok(match value {
                Some(Value::Array(items)) => items.into_iter().next(),
                other => other,
            })
        });
        registry.register("count", |value, args| {
            no_args("count", args)?;
            let n = match &value {
                None | Some(Value::Null) => 0,
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                Some(Value::String(s)) => s.chars().count(),
                Some(_) => 1,
            };
            Ok(Some(Value::from(n)))
        });
        registry
    }

    /// Register (or replace) a function under `name`.
    pub fn register<F>(&mut self, name: &str, function: F)
    where
        F: Fn(Option<Value>, &[String]) -> Result<Option<Value>, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.to_string(), Arc::new(function));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn call(
        &self,
        name: &str,
        value: Option<Value>,
        args: &[String],
    ) -> Result<Option<Value>, TemplateError> {
        let function = self
            .functions
            .get(name)
            .ok_or_else(|| TemplateError::UnknownFunction(name.to_string()))?;
        function(value, args).map_err(|message| TemplateError::Function {
            name: name.to_string(),
            message,
        })
    }
}

fn single_arg<'a>(name: &str, args: &'a [String]) -> Result<&'a str, String> {
    match args {
        [arg] => Ok(arg),
        _ => Err(format!("{name} expects 1 argument, got {}", args.len())),
    }
}

fn no_args(name: &str, args: &[String]) -> Result<(), String> {
    if args.is_empty() {
        Ok(())
    } else {
        Err(format!("{name} takes no arguments, got {}", args.len()))
    }
}

fn map_string(value: Option<Value>, f: impl Fn(&str) -> String) -> Option<Value> {
    match value {
        Some(Value::String(s)) => Some(Value::String(f(&s))),
        other => other,
    }
}

/// Compiles templates against a fixed function registry.
///
/// Compilation rejects templates that call functions the registry does not
/// know, so a compiled template can only fail at render time through a
/// function's own argument checks.
#[derive(Debug, Clone, Default)]
pub struct TemplateEngine {
    functions: FunctionRegistry,
}

impl TemplateEngine {
    pub fn new(functions: FunctionRegistry) -> Self {
        Self { functions }
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Parse and check function references.
    pub fn compile(&self, source: &str) -> Result<Template, TemplateError> {
        let template = Template::parse(source)?;
        if let Some(unknown) = template
            .referenced_functions()
            .into_iter()
            .find(|name| !self.functions.contains(name))
        {
            return Err(TemplateError::UnknownFunction(unknown.to_string()));
        }
        Ok(template)
    }

    pub fn render(&self, template: &Template, context: &Value) -> Result<String, TemplateError> {
        template.render(context, &self.functions)
    }

    /// Compile and render in one step.
    pub fn render_str(&self, source: &str, context: &Value) -> Result<String, TemplateError> {
        let template = self.compile(source)?;
        self.render(&template, context)
    }
}

/// Render `source` against `context` with the built-in functions.
pub fn render(source: &str, context: &Value) -> Result<String, TemplateError> {
    TemplateEngine::default().render_str(source, context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_literal_only() {
        let t = Template::parse("Hello, world.").unwrap();
        assert_eq!(t.segments, vec![Segment::Literal("Hello, world.".to_string())]);
    }

    #[test]
    fn parse_path_segments() {
        let t = Template::parse("A ${world.name} B").unwrap();
        assert_eq!(t.segments.len(), 3);
        let Segment::Expr(expr) = &t.segments[1] else {
            panic!("expected expression");
        };
        assert_eq!(
            expr.path,
            vec![
                PathSegment::Key("world".to_string()),
                PathSegment::Key("name".to_string())
            ]
        );
        assert!(expr.pipes.is_empty());
    }

    #[test]
    fn parse_wildcard_and_pipes() {
        let t = Template::parse(r#"${items[*].value|join(", ")|default("none")}"#).unwrap();
        let expr = t.expressions().next().unwrap();
        assert_eq!(expr.path[0], PathSegment::Wildcard("items".to_string()));
        assert_eq!(expr.path[1], PathSegment::Key("value".to_string()));
        assert_eq!(
            expr.pipes,
            vec![
                PipeCall {
                    name: "join".to_string(),
                    args: vec![", ".to_string()]
                },
                PipeCall {
                    name: "default".to_string(),
                    args: vec!["none".to_string()]
                },
            ]
        );
    }

    #[test]
    fn parse_pipe_without_parens() {
        let t = Template::parse("${a|json}").unwrap();
        let expr = t.expressions().next().unwrap();
        assert_eq!(expr.pipes[0].name, "json");
        assert!(expr.pipes[0].args.is_empty());
    }

    #[test]
    fn parse_argument_escapes() {
        let t = Template::parse(r#"${a|join("\n- ")|default("say \"hi\"")}"#).unwrap();
        let expr = t.expressions().next().unwrap();
        assert_eq!(expr.pipes[0].args, vec!["\n- ".to_string()]);
        assert_eq!(expr.pipes[1].args, vec!["say \"hi\"".to_string()]);
    }

    #[test]
    fn parse_brace_inside_argument() {
        let t = Template::parse(r#"${a|default("{}")}"#).unwrap();
        assert_eq!(t.expressions().count(), 1);
    }

    #[test]
    fn parse_escape_is_literal() {
        let t = Template::parse("$${value} and $$ alone").unwrap();
        assert_eq!(
            t.segments,
            vec![Segment::Literal("${value} and $$ alone".to_string())]
        );
    }

    #[test]
    fn parse_errors() {
        assert!(Template::parse("Bad ${} here").is_err());
        assert!(Template::parse("Bad ${unclosed here").is_err());
        assert!(Template::parse("Bad ${outer${inner}} here").is_err());
        assert!(Template::parse("Bad ${a..b}").is_err());
        assert!(Template::parse("Bad ${a[0]}").is_err());
        assert!(Template::parse("Bad ${a|join(, )}").is_err());
        assert!(Template::parse("Bad ${a|join(\"x\"}").is_err());
        assert!(Template::parse("Bad ${a|join(bare)}").is_err());
    }

    #[test]
    fn dollar_without_brace_is_literal() {
        let out = render("costs $5 or ${price}", &json!({"price": 7})).unwrap();
        assert_eq!(out, "costs $5 or 7");
    }

    #[test]
    fn render_simple_path() {
        let ctx = json!({"user": {"name": "Alice"}});
        assert_eq!(render("Hello ${user.name}!", &ctx).unwrap(), "Hello Alice!");
    }

    #[test]
    fn render_wildcard_join() {
        let ctx = json!({"items": [{"value": "Alpha"}, {"value": "Beta"}, {"value": "Gamma"}]});
        let out = render(r#"${items[*].value|join(", ")}"#, &ctx).unwrap();
        assert_eq!(out, "Alpha, Beta, Gamma");
    }

    #[test]
    fn wildcard_skips_elements_missing_the_key() {
        let ctx = json!({"items": [{"value": "A"}, {"other": 1}, {"value": "C"}]});
        let out = render(r#"${items[*].value|join("/")}"#, &ctx).unwrap();
        assert_eq!(out, "A/C");
    }

    #[test]
    fn nested_wildcards_flatten() {
        let ctx = json!({"groups": [
            {"members": [{"n": "a"}, {"n": "b"}]},
            {"members": [{"n": "c"}]}
        ]});
        let out = render(r#"${groups[*].members[*].n|join(",")}"#, &ctx).unwrap();
        assert_eq!(out, "a,b,c");
    }

    #[test]
    fn render_default_on_missing() {
        assert_eq!(
            render(r#"${missing|default("fallback")}"#, &json!({})).unwrap(),
            "fallback"
        );
    }

    #[test]
    fn default_applies_to_empty_string_and_list() {
        let ctx = json!({"s": "", "l": []});
        assert_eq!(render(r#"${s|default("x")}"#, &ctx).unwrap(), "x");
        assert_eq!(render(r#"${l|join(",")|default("y")}"#, &ctx).unwrap(), "y");
    }

    #[test]
    fn default_keeps_present_value() {
        let ctx = json!({"s": "kept"});
        assert_eq!(render(r#"${s|default("x")}"#, &ctx).unwrap(), "kept");
    }

    #[test]
    fn render_escape() {
        let ctx = json!({"value": "ignored"});
        assert_eq!(render("$${value}", &ctx).unwrap(), "${value}");
    }

    #[test]
    fn missing_path_renders_empty() {
        let ctx = json!({"a": {"b": 1}});
        assert_eq!(render("[${a.c.d}]", &ctx).unwrap(), "[]");
        assert_eq!(render("[${a.b.c}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn unknown_function_fails() {
        let err = render("x ${a|shout}", &json!({"a": "b"})).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFunction(ref n) if n == "shout"));
    }

    #[test]
    fn unknown_function_fails_at_render_without_compile() {
        let t = Template::parse("${a|shout}").unwrap();
        let err = t.render(&json!({"a": "b"}), &FunctionRegistry::builtin()).unwrap_err();
        assert!(matches!(err, TemplateError::UnknownFunction(_)));
    }

    #[test]
    fn join_passes_non_list_through() {
        let ctx = json!({"a": "solo"});
        assert_eq!(render(r#"${a|join(", ")}"#, &ctx).unwrap(), "solo");
    }

    #[test]
    fn json_serializes_compactly() {
        let ctx = json!({"m": {"k": [1, 2]}, "s": "q"});
        assert_eq!(render("${m|json}", &ctx).unwrap(), r#"{"k":[1,2]}"#);
        assert_eq!(render("${s|json}", &ctx).unwrap(), r#""q""#);
        assert_eq!(render("${nothing|json}", &ctx).unwrap(), "null");
    }

    #[test]
    fn wrong_arity_is_function_error() {
        let err = render("${a|join}", &json!({"a": []})).unwrap_err();
        assert!(matches!(err, TemplateError::Function { ref name, .. } if name == "join"));
    }

    #[test]
    fn scalars_render_as_text() {
        let ctx = json!({"n": 3, "f": 1.5, "b": true, "z": null});
        assert_eq!(render("${n} ${f} ${b} [${z}]", &ctx).unwrap(), "3 1.5 true []");
    }

    #[test]
    fn extra_builtins() {
        let ctx = json!({"s": "  Mixed  ", "l": ["x", "y"]});
        assert_eq!(render("${s|trim|upper}", &ctx).unwrap(), "MIXED");
        assert_eq!(render("${s|trim|lower}", &ctx).unwrap(), "mixed");
        assert_eq!(render("${l|first}", &ctx).unwrap(), "x");
        assert_eq!(render("${l|count}", &ctx).unwrap(), "2");
        assert_eq!(render("${missing|count}", &ctx).unwrap(), "0");
    }

    #[test]
    fn custom_function_registration() {
        let mut functions = FunctionRegistry::builtin();
        functions.register("shout", |value, _| {
            Ok(value.map(|v| Value::String(format!("{}!", display_value(Some(&v))))))
        });
        let engine = TemplateEngine::new(functions);
        assert_eq!(engine.render_str("${a|shout}", &json!({"a": "hey"})).unwrap(), "hey!");
    }

    #[test]
    fn compile_rejects_unknown_functions() {
        let engine = TemplateEngine::default();
        assert!(matches!(
            engine.compile("${a|nope}"),
            Err(TemplateError::UnknownFunction(_))
        ));
    }

    #[test]
    fn rendering_is_deterministic() {
        let ctx = json!({"m": {"b": 1, "a": 2}, "l": ["x"]});
        let src = "${m|json} ${l|join(\"-\")}";
        assert_eq!(render(src, &ctx).unwrap(), render(src, &ctx).unwrap());
    }

    #[test]
    fn referenced_functions_deduplicated() {
        let t = Template::parse("${a|trim|upper} ${b|trim}").unwrap();
        assert_eq!(t.referenced_functions(), vec!["trim", "upper"]);
    }

    #[test]
    fn paths_in_dotted_form() {
        let t = Template::parse(r#"${a.b} ${items[*].v|join(",")} ${a.b|upper}"#).unwrap();
        assert_eq!(t.paths(), vec!["a.b".to_string(), "items[*].v".to_string()]);
    }
}
