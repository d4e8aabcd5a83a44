use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Instant;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;

use common::proto::RunReply;

use super::file::{apply_mode, dry_run_reply, write_if_changed};
use super::{elapsed_ms, missing_arg, Action};

/// Pattern for `${variable_name}` placeholders.
static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("constant regex pattern is valid")
});

/// Renders a `${var}` template against a JSON variable map and writes the
/// result with the same hash-based change detection as `write_file`.
pub struct TemplateFileAction;

#[async_trait]
impl Action for TemplateFileAction {
    async fn execute(
        &self,
        request_id: &str,
        args: &HashMap<String, String>,
        dry_run: bool,
    ) -> RunReply {
        let start = Instant::now();

        let Some(path) = args.get("path").filter(|p| !p.is_empty()) else {
            return RunReply::error(request_id, missing_arg("template_file", "path"), 0);
        };
        let Some(template) = args.get("template").filter(|t| !t.is_empty()) else {
            return RunReply::error(request_id, missing_arg("template_file", "template"), 0);
        };

        let vars: HashMap<String, Value> = match args.get("vars").filter(|v| !v.is_empty()) {
            Some(raw) => match serde_json::from_str(raw) {
                Ok(map) => map,
                Err(err) => {
                    return RunReply::error(
                        request_id,
                        format!("vars parse error: {err}"),
                        elapsed_ms(start),
                    )
                }
            },
            None => HashMap::new(),
        };

        let rendered = render(template, &vars);

        if dry_run {
            return dry_run_reply(request_id, path, rendered.as_bytes(), start).await;
        }

        let mut changed = match write_if_changed(path, rendered.as_bytes()).await {
            Ok(wrote) => wrote,
            Err(err) => {
                return RunReply::error(
                    request_id,
                    format!("failed to write {path}: {err}"),
                    elapsed_ms(start),
                )
            }
        };

        if let Some(mode) = args.get("mode").filter(|m| !m.is_empty()) {
            match apply_mode(path, mode).await {
                Ok(mode_changed) => changed |= mode_changed,
                Err(err) => {
                    return RunReply::error(request_id, format!("{err:#}"), elapsed_ms(start))
                }
            }
        }

        RunReply::completed(request_id, changed, 0, "", "", elapsed_ms(start))
    }
}

/// Substitutes `${name}` placeholders; unknown variables are left as-is.
/// String values substitute verbatim, other JSON values via their canonical
/// rendering.
pub(crate) fn render(template: &str, vars: &HashMap<String, Value>) -> String {
    VAR_PATTERN
        .replace_all(template, |caps: &regex::Captures| match vars.get(&caps[1]) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => caps[0].to_string(),
        })
        .to_string()
}
