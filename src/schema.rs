//! JSON Schema (Draft 2020-12) validation helpers built on the `jsonschema`
//! crate, in the same style the teacher's tool-call path uses: compile, then
//! validate, folding the first failure into a gateway error.

use serde_json::Value;

use crate::error::{Error, Result};

/// Validate `instance` against `schema`, returning `Err(Error::Validation)`
/// carrying `{schema_id, error, path}` on the first failing assertion.
///
/// `schema_id` is caller-supplied context (e.g. the tool name) used only to
/// populate the error's `details` — it plays no role in validation itself.
pub fn validate(schema: &Value, instance: &Value, schema_id: &str) -> Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| Error::internal(format!("schema compilation error: {e}")))?;

    if let Err(mut errors) = compiled.validate(instance) {
        let first = errors.next().expect("validate() Err implies at least one error");
        let path = first.instance_path.to_string();
        let message = format!("{schema_id}: {first} at {path}");
        return Err(Error::ValidationWithDetails(
            message,
            serde_json::json!({
                "schema_id": schema_id,
                "error": first.to_string(),
                "path": path,
            }),
        ));
    }

    Ok(())
}
