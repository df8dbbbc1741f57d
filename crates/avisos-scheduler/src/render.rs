//! Template renderer: turns a rule's message spec plus a recipient's context
//! into a ready-to-send [`OutboundMessage`].
//!
//! Free text: `{name}` or `{{name}}` placeholders are interpolated from the
//! context; an unknown name fails the render instead of leaving a hole.
//! Provider templates: the rule's parameter list must match the catalog
//! definition exactly (arity, order, kind) before values are bound.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use uuid::Uuid;

use avisos_core::error::ConfigurationError;
use avisos_core::message::{
    BoundParameter, MessageBody, OutboundMessage, Recipient, RenderContext, TemplateDefinition,
};
use avisos_core::model::{DedupScope, MessageSpec, NotificationRule};

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}|\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("valid regex")
});

/// Everything besides the spec and the context that ends up on the message.
#[derive(Debug, Clone, Copy)]
pub struct RenderMeta<'a> {
    pub tenant_id: &'a str,
    pub rule: &'a NotificationRule,
    pub scope: DedupScope,
    pub sender_id: Option<&'a str>,
    pub recipient: &'a Recipient,
}

/// Interpolate `{var}` / `{{var}}` placeholders.
pub fn interpolate(text: &str, context: &RenderContext) -> Result<String, ConfigurationError> {
    let mut missing: Option<String> = None;
    let rendered = PLACEHOLDER.replace_all(text, |caps: &Captures| {
        let name = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        match context.get(name) {
            Some(value) => value.clone(),
            None => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigurationError::UnresolvedPlaceholder(name)),
        None => Ok(rendered.into_owned()),
    }
}

fn render_body(
    spec: &MessageSpec,
    definition: Option<&TemplateDefinition>,
    context: &RenderContext,
) -> Result<MessageBody, ConfigurationError> {
    match spec {
        MessageSpec::FreeText { text } => {
            if text.trim().is_empty() {
                return Err(ConfigurationError::NoRenderableContent);
            }
            Ok(MessageBody::Text {
                text: interpolate(text, context)?,
            })
        }
        MessageSpec::ProviderTemplate {
            name,
            language,
            parameters,
        } => {
            let definition = definition.ok_or_else(|| ConfigurationError::UnknownTemplate {
                name: name.clone(),
                language: language.clone(),
            })?;
            if definition.parameters.len() != parameters.len() {
                return Err(ConfigurationError::ArityMismatch {
                    name: name.clone(),
                    expected: definition.parameters.len(),
                    actual: parameters.len(),
                });
            }
            let mut bound = Vec::with_capacity(parameters.len());
            let declared = parameters.iter().zip(&definition.parameters);
            for (index, (param, expected)) in declared.enumerate() {
                if param.kind != *expected {
                    return Err(ConfigurationError::ParameterKindMismatch {
                        index,
                        expected: expected.as_str().to_string(),
                        actual: param.kind.as_str().to_string(),
                    });
                }
                let value = context
                    .get(&param.binding)
                    .ok_or_else(|| ConfigurationError::MissingBinding(param.binding.clone()))?;
                bound.push(BoundParameter {
                    kind: param.kind,
                    value: value.clone(),
                });
            }
            Ok(MessageBody::Template {
                name: name.clone(),
                language: language.clone(),
                parameters: bound,
            })
        }
    }
}

/// Render one message. Never returns a partially rendered body.
pub fn render(
    spec: &MessageSpec,
    definition: Option<&TemplateDefinition>,
    context: &RenderContext,
    meta: RenderMeta<'_>,
) -> Result<OutboundMessage, ConfigurationError> {
    let body = render_body(spec, definition, context)?;
    Ok(OutboundMessage {
        correlation_id: Uuid::new_v4(),
        tenant_id: meta.tenant_id.to_string(),
        rule_id: meta.rule.id.clone(),
        rule_kind: meta.rule.kind.clone(),
        scope: meta.scope,
        recipient_id: meta.recipient.id.clone(),
        recipient_name: meta.recipient.name.clone(),
        address: meta.recipient.address.clone(),
        appointment_id: meta.recipient.appointment_id.clone(),
        sender_id: meta.sender_id.map(str::to_string),
        body,
    })
}
