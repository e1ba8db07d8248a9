/// Context builders — shape worlds and modules into template contexts.
///
/// Every builder is a pure function of already-loaded values. The produced
/// shape is what the prompt templates address with paths such as
/// `module.fields[*].line` or `others[*].brief`.
use serde_json::{json, Map, Value};

use crate::core::registry::ModuleRegistry;
use crate::schema::definition::{FieldDefinition, ModuleDefinition};
use crate::schema::module::WorldModule;
use crate::schema::world::World;

/// Inputs shared by all builders.
#[derive(Debug, Clone, Copy)]
pub struct ContextInput<'a> {
    pub world: &'a World,
    pub definition: &'a ModuleDefinition,
    pub module: &'a WorldModule,
    /// Sibling modules of the same world. The target module may be included;
    /// it is skipped.
    pub others: &'a [WorldModule],
    pub focus_note: Option<&'a str>,
    pub prior_text: Option<&'a str>,
    pub instruction: Option<&'a str>,
}

impl<'a> ContextInput<'a> {
    pub fn new(
        world: &'a World,
        definition: &'a ModuleDefinition,
        module: &'a WorldModule,
        others: &'a [WorldModule],
    ) -> Self {
        Self {
            world,
            definition,
            module,
            others,
            focus_note: None,
            prior_text: None,
            instruction: None,
        }
    }

    pub fn with_focus_note(mut self, note: Option<&'a str>) -> Self {
        self.focus_note = note;
        self
    }

    pub fn with_prior_text(mut self, text: Option<&'a str>) -> Self {
        self.prior_text = text;
        self
    }

    pub fn with_instruction(mut self, instruction: Option<&'a str>) -> Self {
        self.instruction = instruction;
        self
    }
}

/// Context for the draft stage: the model proposes field values.
pub fn module_draft_context(input: &ContextInput<'_>, registry: &ModuleRegistry) -> Value {
    let mut ctx = base_context(input, registry);
    let missing: Vec<Value> = input
        .definition
        .fields
        .iter()
        .filter(|f| is_blank(input.module.field(&f.key)))
        .map(|f| json!({ "key": f.key, "label": f.label, "spec": field_spec(f) }))
        .collect();
    ctx.insert("missing".to_string(), Value::Array(missing));
    ctx.insert("stage".to_string(), json!("draft"));
    Value::Object(ctx)
}

/// Context for the final stage: the model writes the module's full prose.
pub fn module_final_context(input: &ContextInput<'_>, registry: &ModuleRegistry) -> Value {
    let mut ctx = base_context(input, registry);
    ctx.insert("stage".to_string(), json!("final"));
    Value::Object(ctx)
}

/// Context for refining one field's text.
pub fn field_refine_context(
    input: &ContextInput<'_>,
    field: &FieldDefinition,
    registry: &ModuleRegistry,
) -> Value {
    let mut ctx = base_context(input, registry);
    ctx.insert(
        "field".to_string(),
        json!({
            "key": field.key,
            "label": field.label,
            "required": field.required,
            "minLength": field.min_length,
            "maxLength": field.max_length,
            "focus": field.focus,
            "lengthHint": length_hint(field),
        }),
    );
    ctx.insert("stage".to_string(), json!("refine"));
    Value::Object(ctx)
}

fn base_context(input: &ContextInput<'_>, registry: &ModuleRegistry) -> Map<String, Value> {
    let mut ctx = Map::new();
    ctx.insert("world".to_string(), world_value(input.world));
    ctx.insert(
        "module".to_string(),
        module_value(input.definition, input.module),
    );

    let others: Vec<Value> = registry
        .all()
        .iter()
        .filter(|d| d.key != input.module.module_key)
        .filter_map(|d| {
            let sibling = input.others.iter().find(|m| m.module_key == d.key)?;
            sibling_value(d, sibling)
        })
        .collect();
    ctx.insert("others".to_string(), Value::Array(others));

    ctx.insert("focusNote".to_string(), optional_text(input.focus_note));
    ctx.insert("priorText".to_string(), optional_text(input.prior_text));
    ctx.insert("instruction".to_string(), optional_text(input.instruction));
    ctx
}

fn world_value(world: &World) -> Value {
    json!({
        "id": world.id,
        "name": world.name,
        "tagline": world.tagline,
        "themes": world.themes,
        "status": world.status.as_str(),
        "version": world.version,
    })
}

fn module_value(definition: &ModuleDefinition, module: &WorldModule) -> Value {
    let values: Map<String, Value> = module
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    json!({
        "key": definition.key,
        "label": definition.label,
        "description": definition.description,
        "status": module.status.as_str(),
        "fields": definition.fields.iter().map(|f| field_value(f, module)).collect::<Vec<_>>(),
        "values": values,
        "content": module.full_content,
    })
}

fn field_value(field: &FieldDefinition, module: &WorldModule) -> Value {
    let value = module.field(&field.key).map(str::trim).filter(|v| !v.is_empty());
    let mut entry = json!({
        "key": field.key,
        "label": field.label,
        "required": field.required,
        "minLength": field.min_length,
        "maxLength": field.max_length,
        "value": value,
        "spec": field_spec(field),
    });
    // `line` only exists for filled fields so projections skip the rest.
    if let (Some(v), Value::Object(map)) = (value, &mut entry) {
        map.insert("line".to_string(), json!(format!("{}: {}", field.label, v)));
    }
    entry
}

/// Siblings with neither content nor any filled field are left out.
fn sibling_value(definition: &ModuleDefinition, module: &WorldModule) -> Option<Value> {
    let lines: Vec<String> = definition
        .fields
        .iter()
        .filter_map(|f| {
            let v = module.field(&f.key).map(str::trim).filter(|v| !v.is_empty())?;
            Some(format!("{}: {}", f.label, v))
        })
        .collect();
    let content = module
        .full_content
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty());

    if lines.is_empty() && content.is_none() {
        return None;
    }

    let body = match content {
        Some(c) => c.to_string(),
        None => lines.join("\n"),
    };
    Some(json!({
        "key": definition.key,
        "label": definition.label,
        "status": module.status.as_str(),
        "lines": lines,
        "content": content,
        "brief": format!("## {}\n{}", definition.label, body),
    }))
}

fn field_spec(field: &FieldDefinition) -> String {
    let mut spec = format!("- {} ({}", field.key, field.label);
    if field.required {
        spec.push_str(", required");
    }
    if let Some(hint) = length_hint(field) {
        spec.push_str(", ");
        spec.push_str(&hint);
    }
    spec.push(')');
    if let Some(focus) = &field.focus {
        spec.push_str(": ");
        spec.push_str(focus);
    }
    spec
}

fn length_hint(field: &FieldDefinition) -> Option<String> {
    match (field.min_length, field.max_length) {
        (Some(min), Some(max)) => Some(format!("{min}-{max} characters")),
        (Some(min), None) => Some(format!("at least {min} characters")),
        (None, Some(max)) => Some(format!("at most {max} characters")),
        (None, None) => None,
    }
}

fn optional_text(text: Option<&str>) -> Value {
    match text.map(str::trim) {
        Some(t) if !t.is_empty() => Value::String(t.to_string()),
        _ => Value::Null,
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}
