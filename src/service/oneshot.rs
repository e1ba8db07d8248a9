/// One-shot generation: draft a module's fields, or rewrite a single field.
/// Both run inline with the caller instead of going through the queue.

use chrono::Utc;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument};

use crate::core::context::{field_refine_context, module_draft_context, ContextInput};
use crate::core::prompts::PromptStage;
use crate::core::template::display_value;
use crate::error::ServiceError;
use crate::llm::GenerationError;
use crate::schema::definition::ModuleDefinition;
use crate::schema::ids::{OwnerId, WorldId};
use crate::schema::job::JobStatus;
use crate::schema::module::{content_hash, ModuleStatus, WorldModule};
use crate::service::engine::{module_or_new, WorldEngine};
use crate::store::{jobs, modules};

impl WorldEngine {
    /// Ask the model for field values and merge the ones it returns. Fields
    /// it leaves out keep their text. The module ends up `READY`.
    ///
    /// A module whose publish job is still waiting or running is refused
    /// with `Conflict`; the job would overwrite the draft.
    #[instrument(skip(self), fields(world_id = %world_id, module_key = %module_key))]
    pub async fn generate_module(
        &self,
        world_id: &WorldId,
        module_key: &str,
        owner: &OwnerId,
    ) -> Result<WorldModule, ServiceError> {
        let definition = self.registry.require(module_key)?;
        let (world, module, siblings) = self.load_scope(world_id, owner, definition)?;
        self.db.with_tx(|tx| ensure_not_queued(tx, world_id, module_key))?;

        let credentials = self.credentials_for(&world)?;
        let input = ContextInput::new(&world, definition, &module, &siblings);
        let context = module_draft_context(&input, &self.registry);
        let prompt = self.render_prompt(PromptStage::Draft, &input, &context)?;

        let reply = self.call_generator(&prompt, &credentials, true).await?;
        let proposed = parse_field_object(&reply, definition)?;
        debug!(fields = proposed.len(), "draft reply parsed");

        self.db.with_tx(|tx| {
            ensure_not_queued(tx, world_id, module_key)?;
            let mut module = module_or_new(tx, world_id, definition)?;
            module.fields.extend(proposed);
            module.status = ModuleStatus::Ready;
            module.content_hash = Some(content_hash(&module.fields));
            module.touch(Some(owner), Utc::now());
            modules::save(tx, &module)?;
            info!("module drafted");
            Ok(module)
        })
    }

    /// Rewrite the text of one field. The result is returned, not saved.
    #[instrument(skip(self, text, instruction), fields(world_id = %world_id, module_key = %module_key, field_key = %field_key))]
    pub async fn refine_field(
        &self,
        world_id: &WorldId,
        module_key: &str,
        field_key: &str,
        owner: &OwnerId,
        text: &str,
        instruction: Option<&str>,
    ) -> Result<String, ServiceError> {
        if text.trim().is_empty() {
            return Err(ServiceError::Validation("text to refine must not be blank".to_string()));
        }
        let definition = self.registry.require(module_key)?;
        let field = self.registry.require_field(module_key, field_key)?;

        let (world, module, siblings) = self.load_scope(world_id, owner, definition)?;

        let credentials = self.credentials_for(&world)?;
        let input = ContextInput::new(&world, definition, &module, &siblings)
            .with_focus_note(field.focus.as_deref())
            .with_prior_text(Some(text))
            .with_instruction(instruction);
        let context = field_refine_context(&input, field, &self.registry);
        let prompt = self.render_prompt(PromptStage::Refine, &input, &context)?;

        let reply = self.call_generator(&prompt, &credentials, false).await?;
        let refined = reply.trim();
        if refined.is_empty() {
            return Err(GenerationError::EmptyResponse.into());
        }
        Ok(refined.to_string())
    }
}

fn ensure_not_queued(conn: &Connection, world_id: &WorldId, module_key: &str) -> Result<(), ServiceError> {
    match jobs::find(conn, world_id, module_key)? {
        Some(job) if matches!(job.status, JobStatus::Waiting | JobStatus::Running) => {
            Err(ServiceError::Conflict(format!(
                "module {module_key} has a {} generation job",
                job.status.as_str()
            )))
        }
        _ => Ok(()),
    }
}

/// Parse a draft reply into values for fields the module defines. Unknown
/// keys, nulls, nested objects and blank strings are dropped.
fn parse_field_object(
    reply: &str,
    definition: &ModuleDefinition,
) -> Result<Vec<(String, String)>, GenerationError> {
    let value: Value = serde_json::from_str(strip_code_fence(reply))
        .map_err(|e| GenerationError::MalformedResponse(format!("draft reply is not JSON: {e}")))?;
    let Value::Object(object) = value else {
        return Err(GenerationError::MalformedResponse(
            "draft reply is not a JSON object".to_string(),
        ));
    };
    Ok(field_values(object, definition))
}

fn field_values(object: Map<String, Value>, definition: &ModuleDefinition) -> Vec<(String, String)> {
    object
        .into_iter()
        .filter(|(key, _)| definition.field(key).is_some())
        .filter_map(|(key, value)| {
            let text = match &value {
                Value::String(_) | Value::Number(_) | Value::Bool(_) => display_value(Some(&value)),
                Value::Array(items) => items
                    .iter()
                    .filter(|v| v.is_string() || v.is_number())
                    .map(|v| display_value(Some(v)))
                    .collect::<Vec<_>>()
                    .join("\n"),
                Value::Null | Value::Object(_) => return None,
            };
            let text = text.trim();
            (!text.is_empty()).then(|| (key, text.to_string()))
        })
        .collect()
}

/// Models like to wrap JSON in a Markdown fence.
fn strip_code_fence(reply: &str) -> &str {
    let trimmed = reply.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}
