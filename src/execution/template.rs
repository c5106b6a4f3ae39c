//! `${path}` interpolation for human-readable messages.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

use super::context::ExecutionContext;
use super::mapper::get_path;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\s*([^}\s]+)\s*\}").expect("placeholder pattern is valid"));

/// Replaces every `${path}` in `template` with the value found in the
/// execution data, then the variables, then the caller's input. Unknown
/// placeholders are left as written.
///
/// ```
/// use flowrunner::execution::{template::interpolate, ExecutionContext, ExecutionOptions};
/// use serde_json::{json, Map};
/// use std::time::Duration;
///
/// let mut ctx = ExecutionContext::new(
///     "e1", "wf", &Map::new(), Map::new(), &ExecutionOptions::default(), Duration::from_secs(5),
/// );
/// ctx.variables.insert("sku".into(), json!("A-1"));
/// assert_eq!(interpolate("Reorder ${sku} (${qty})", &ctx), "Reorder A-1 (${qty})");
/// ```
pub fn interpolate(template: &str, ctx: &ExecutionContext) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            let path = &caps[1];
            let value = get_path(&ctx.execution_data, path)
                .or_else(|| get_path(&ctx.variables, path))
                .or_else(|| get_path(&ctx.input_data, path));

            match value {
                Some(Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}
