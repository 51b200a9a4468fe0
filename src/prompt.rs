//! Conversation turn assembly.
//!
//! The system turn is rendered fresh for every prompt from a minijinja
//! template and the caller's application context; it is never stored in the
//! history.

use minijinja::{Environment, UndefinedBehavior};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::protocol::Turn;

const DEFAULT_SYSTEM_PROMPT_TEMPLATE: &str = r#"You are a helpful assistant for developers inspecting a running web application.
Answer concisely and prefer concrete code examples over general advice.
{% if framework %}
The application is built with {{ framework }}.{% if theme %} The active theme is {{ theme }}.{% endif %}
{% endif %}
{% if libraries %}
Loaded libraries: {{ libraries | join(", ") }}.
{% endif %}
{% if control %}
The user has selected a {{ control.type }} control with id "{{ control.id }}". Questions usually refer to it.
{% endif %}"#;

/// Application state the UI reports alongside a prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppContext {
    pub framework: Option<String>,
    pub theme: Option<String>,
    pub libraries: Vec<String>,
    pub control: Option<ControlInfo>,
}

/// Snapshot of the control selected in the UI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControlInfo {
    #[serde(rename = "type")]
    pub control_type: String,
    pub id: String,
    /// The control's own properties, not inherited ones.
    pub properties: Map<String, Value>,
    pub binding_count: usize,
}

/// Builds the turn sequence sent with `prompt-streaming`.
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    template: Option<String>,
}

impl PromptBuilder {
    /// `template` overrides the built-in system prompt. A template that fails
    /// to render falls back to the built-in one.
    pub fn new(template: Option<String>) -> Self {
        Self { template }
    }

    /// `[system] ++ history ++ [user]`.
    pub fn build_turns(&self, user_message: &str, history: &[Turn], ctx: &AppContext) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(history.len() + 2);
        turns.push(self.system_turn(ctx));
        turns.extend(history.iter().cloned());
        turns.push(user_turn(user_message, ctx));
        turns
    }

    pub fn system_turn(&self, ctx: &AppContext) -> Turn {
        Turn::system(self.render_system_prompt(ctx))
    }

    fn render_system_prompt(&self, ctx: &AppContext) -> String {
        if let Some(template) = self.template.as_deref() {
            match render_prompt_template(template, ctx) {
                Ok(rendered) => return rendered,
                Err(error) => log::warn!(
                    "Failed to render system prompt template: {error}; falling back to default template"
                ),
            }
        }

        match render_prompt_template(DEFAULT_SYSTEM_PROMPT_TEMPLATE, ctx) {
            Ok(rendered) => rendered,
            Err(error) => {
                log::error!("Failed to render default system prompt template: {error}");
                String::new()
            }
        }
    }
}

fn render_prompt_template(template: &str, ctx: &AppContext) -> Result<String, String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template("system_prompt", template)
        .map_err(|error| error.to_string())?;

    let output = env
        .get_template("system_prompt")
        .map_err(|error| error.to_string())?
        .render(ctx)
        .map_err(|error| error.to_string())?;

    Ok(collapse_blank_lines(&output.replace("\r\n", "\n")))
}

/// Squeezes each run of blank lines (left by skipped template blocks) down to
/// one and trims leading and trailing blanks.
fn collapse_blank_lines(text: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut pending_blank = false;
    for line in text.lines().map(str::trim_end) {
        if line.is_empty() {
            pending_blank = !lines.is_empty();
            continue;
        }
        if pending_blank {
            lines.push("");
            pending_blank = false;
        }
        lines.push(line);
    }
    lines.join("\n")
}

/// The user's message, preceded by a description of the selected control when
/// there is one.
pub fn user_turn(message: &str, ctx: &AppContext) -> Turn {
    match &ctx.control {
        Some(control) => Turn::user(format!("{}\n\n{}", describe_control(control), message)),
        None => Turn::user(message),
    }
}

fn describe_control(control: &ControlInfo) -> String {
    let properties =
        serde_json::to_string_pretty(&Value::Object(control.properties.clone())).unwrap_or_default();
    format!(
        "Selected control:\n- Type: {}\n- ID: {}\n- Properties:\n{}\n- Bindings: {}",
        control.control_type, control.id, properties, control.binding_count
    )
}
