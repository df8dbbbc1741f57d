//! WhatsApp Business Cloud API channel.
//!
//! Uses the official WhatsApp Business Platform (Cloud API) for outbound
//! notifications: free-form text and pre-approved message templates.
//! Requires: Access Token + Phone Number ID (+ Business Account ID for the
//! template catalog) from Meta Business Suite.

use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use avisos_core::config::WhatsAppSettings;
use avisos_core::error::{AvisosError, ProviderError, Result};
use avisos_core::message::{
    BoundParameter, DeliveryAck, MessageBody, OutboundMessage, TemplateDefinition,
};
use avisos_core::model::ParameterKind;
use avisos_core::traits::{DispatchClient, TemplateCatalog};
use regex::Regex;
use tokio::sync::RwLock;

/// How long a fetched template definition is trusted.
const CATALOG_TTL: Duration = Duration::from_secs(600);

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// WhatsApp Business channel implementation.
pub struct WhatsAppChannel {
    config: WhatsAppSettings,
    token: String,
    client: reqwest::Client,
    request_timeout: Duration,
    catalog_cache: RwLock<HashMap<(String, String), (Instant, Option<TemplateDefinition>)>>,
}

impl WhatsAppChannel {
    /// Build the channel. Fails when no access token is configured.
    pub fn new(config: WhatsAppSettings) -> Result<Self> {
        let token = config.resolved_token().ok_or_else(|| {
            AvisosError::Config(
                "WhatsApp access_token not configured \
                 (set whatsapp.access_token or META_WHATSAPP_TOKEN)"
                    .into(),
            )
        })?;
        Ok(Self {
            config,
            token,
            client: reqwest::Client::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            catalog_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Per-request HTTP timeout. The dispatcher applies its own bound on top.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.api_version,
            path
        )
    }

    /// Build the Cloud API request body for a rendered message.
    pub fn build_payload(to: &str, body: &MessageBody) -> serde_json::Value {
        match body {
            MessageBody::Text { text } => serde_json::json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": {
                    "preview_url": false,
                    "body": text
                }
            }),
            MessageBody::Template {
                name,
                language,
                parameters,
            } => {
                let mut template = serde_json::json!({
                    "name": name,
                    "language": { "code": language }
                });
                // Meta rejects `"components": []`; omit the field instead.
                if !parameters.is_empty() {
                    let params: Vec<serde_json::Value> =
                        parameters.iter().map(parameter_json).collect();
                    template["components"] = serde_json::json!([
                        { "type": "body", "parameters": params }
                    ]);
                }
                serde_json::json!({
                    "messaging_product": "whatsapp",
                    "recipient_type": "individual",
                    "to": to,
                    "type": "template",
                    "template": template
                })
            }
        }
    }

    async fn post_message(
        &self,
        sender: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<String, ProviderError> {
        let url = self.api_url(&format!("{sender}/messages"));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Content-Type", "application/json")
            .json(payload)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(self.request_timeout)
                } else {
                    ProviderError::Network(format!("WhatsApp API request failed: {e}"))
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Rejected {
                status,
                body: error_text,
            });
        }

        let result: serde_json::Value = response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("Invalid WhatsApp response: {e}"))
        })?;

        result["messages"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("no message id in {result}")))
    }

    async fn fetch_definition(
        &self,
        name: &str,
        language: &str,
    ) -> Result<Option<TemplateDefinition>> {
        if self.config.business_account_id.is_empty() {
            return Err(AvisosError::Config(
                "WhatsApp business_account_id not configured; template catalog unavailable".into(),
            ));
        }
        let url = self.api_url(&format!("{}/message_templates", self.config.business_account_id));

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .query(&[("name", name), ("fields", "name,language,status,components")])
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| {
                AvisosError::resolution(format!("WhatsApp template catalog unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(AvisosError::resolution(format!(
                "WhatsApp template catalog error {status}: {text}"
            )));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AvisosError::resolution(format!("Invalid template catalog response: {e}"))
        })?;

        Ok(parse_catalog(&body, name, language))
    }
}

fn parameter_json(param: &BoundParameter) -> serde_json::Value {
    match param.kind {
        ParameterKind::Text => serde_json::json!({ "type": "text", "text": param.value }),
        ParameterKind::DateTime => serde_json::json!({
            "type": "date_time",
            "date_time": { "fallback_value": param.value }
        }),
        ParameterKind::Currency => match parse_currency(&param.value) {
            Some((code, amount_1000)) => serde_json::json!({
                "type": "currency",
                "currency": {
                    "fallback_value": param.value,
                    "code": code,
                    "amount_1000": amount_1000
                }
            }),
            None => serde_json::json!({ "type": "text", "text": param.value }),
        },
    }
}

/// `"ARS 1500.50"` → `("ARS", 1500500)`.
fn parse_currency(value: &str) -> Option<(String, i64)> {
    let (code, amount) = value.trim().split_once(' ')?;
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    let amount: f64 = amount.trim().replace(',', ".").parse().ok()?;
    Some((code.to_ascii_uppercase(), (amount * 1000.0).round() as i64))
}

static PLACEHOLDER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*(\d+)\s*\}\}").expect("valid regex"));

/// Pick the approved template matching `(name, language)` and count its body
/// placeholders. Every `{{n}}` is a text parameter.
fn parse_catalog(
    body: &serde_json::Value,
    name: &str,
    language: &str,
) -> Option<TemplateDefinition> {
    let entries = body["data"].as_array()?;
    let entry = entries.iter().find(|t| {
        t["name"].as_str() == Some(name) && t["language"].as_str() == Some(language)
    })?;

    if let Some(status) = entry["status"].as_str() {
        if !status.eq_ignore_ascii_case("APPROVED") {
            tracing::warn!("WhatsApp template '{name}' ({language}) is {status}, not APPROVED");
            return None;
        }
    }

    let body_text = entry["components"]
        .as_array()
        .and_then(|components| {
            components
                .iter()
                .find(|c| c["type"].as_str().is_some_and(|t| t.eq_ignore_ascii_case("BODY")))
        })
        .and_then(|c| c["text"].as_str())
        .unwrap_or("");

    let arity = PLACEHOLDER_RE
        .captures_iter(body_text)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .max()
        .unwrap_or(0);

    Some(TemplateDefinition {
        name: name.to_string(),
        language: language.to_string(),
        parameters: vec![ParameterKind::Text; arity],
    })
}

#[async_trait]
impl DispatchClient for WhatsAppChannel {
    fn name(&self) -> &str {
        "whatsapp"
    }

    async fn send(
        &self,
        address: &str,
        message: &OutboundMessage,
    ) -> std::result::Result<DeliveryAck, ProviderError> {
        let sender = message
            .sender_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.config.phone_number_id);
        if sender.is_empty() {
            return Err(ProviderError::Unconfigured(
                "WhatsApp phone_number_id not configured".into(),
            ));
        }

        let payload = Self::build_payload(address, &message.body);
        let message_id = self.post_message(sender, &payload).await?;

        tracing::debug!(
            "WhatsApp message sent: {} → {} [{}]",
            message_id,
            address,
            message.correlation_id
        );
        Ok(DeliveryAck { message_id })
    }
}

#[async_trait]
impl TemplateCatalog for WhatsAppChannel {
    async fn template_definition(
        &self,
        name: &str,
        language: &str,
    ) -> Result<Option<TemplateDefinition>> {
        let key = (name.to_string(), language.to_string());
        if let Some((fetched_at, def)) = self.catalog_cache.read().await.get(&key) {
            if fetched_at.elapsed() < CATALOG_TTL {
                return Ok(def.clone());
            }
        }

        let def = self.fetch_definition(name, language).await?;
        self.catalog_cache
            .write()
            .await
            .insert(key, (Instant::now(), def.clone()));
        Ok(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avisos_core::model::{DedupScope, RuleKind};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(base_url: &str) -> WhatsAppSettings {
        WhatsAppSettings {
            access_token: "test-token".into(),
            phone_number_id: "1111".into(),
            business_account_id: "waba-1".into(),
            api_version: "v22.0".into(),
            base_url: base_url.into(),
        }
    }

    fn message(body: MessageBody, sender: Option<&str>) -> OutboundMessage {
        OutboundMessage {
            correlation_id: uuid::Uuid::new_v4(),
            tenant_id: "acme".into(),
            rule_id: "daily_agents".into(),
            rule_kind: RuleKind::Digest,
            scope: DedupScope::Automatic,
            recipient_id: "agent-1".into(),
            recipient_name: "Ana".into(),
            address: "5491100000001".into(),
            appointment_id: None,
            sender_id: sender.map(str::to_string),
            body,
        }
    }

    #[test]
    fn test_template_payload_omits_empty_components() {
        let payload = WhatsAppChannel::build_payload(
            "549111",
            &MessageBody::Template {
                name: "daily_digest".into(),
                language: "es".into(),
                parameters: vec![],
            },
        );
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["language"]["code"], "es");
        assert!(payload["template"].get("components").is_none());
    }

    #[test]
    fn test_template_payload_keeps_parameter_order() {
        let payload = WhatsAppChannel::build_payload(
            "549111",
            &MessageBody::Template {
                name: "recordatorio".into(),
                language: "es".into(),
                parameters: vec![
                    BoundParameter { kind: ParameterKind::Text, value: "Ana".into() },
                    BoundParameter { kind: ParameterKind::Text, value: "18:00".into() },
                ],
            },
        );
        let params = &payload["template"]["components"][0]["parameters"];
        assert_eq!(params[0]["text"], "Ana");
        assert_eq!(params[1]["text"], "18:00");
    }

    #[test]
    fn test_parse_currency() {
        assert_eq!(parse_currency("ARS 1500.50"), Some(("ARS".into(), 1_500_500)));
        assert_eq!(parse_currency("usd 10"), Some(("USD".into(), 10_000)));
        assert_eq!(parse_currency("1500"), None);
    }

    #[test]
    fn test_parse_catalog_counts_placeholders() {
        let body = serde_json::json!({
            "data": [
                {"name": "recordatorio", "language": "en", "status": "APPROVED", "components": []},
                {"name": "recordatorio", "language": "es", "status": "APPROVED", "components": [
                    {"type": "HEADER", "format": "TEXT", "text": "Recordatorio"},
                    {"type": "BODY", "text": "Hola {{1}}, tu turno es a las {{2}}. Te esperamos {{1}}."}
                ]}
            ]
        });
        let def = parse_catalog(&body, "recordatorio", "es").unwrap();
        assert_eq!(def.parameters, vec![ParameterKind::Text, ParameterKind::Text]);
        assert_eq!(parse_catalog(&body, "recordatorio", "en").unwrap().parameters.len(), 0);
        assert!(parse_catalog(&body, "recordatorio", "pt_BR").is_none());
    }

    #[test]
    fn test_parse_catalog_skips_unapproved() {
        let body = serde_json::json!({
            "data": [{"name": "x", "language": "es", "status": "PENDING", "components": []}]
        });
        assert!(parse_catalog(&body, "x", "es").is_none());
    }

    #[tokio::test]
    async fn test_send_text_uses_tenant_sender() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v22.0/2222/messages"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "wamid.ABC"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WhatsAppChannel::new(settings(&server.uri())).unwrap();
        let ack = channel
            .send(
                "5491100000001",
                &message(MessageBody::Text { text: "hola".into() }, Some("2222")),
            )
            .await
            .unwrap();
        assert_eq!(ack.message_id, "wamid.ABC");
    }

    #[tokio::test]
    async fn test_send_rejection_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v22.0/1111/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid recipient"))
            .mount(&server)
            .await;

        let channel = WhatsAppChannel::new(settings(&server.uri())).unwrap();
        let err = channel
            .send("123", &message(MessageBody::Text { text: "hola".into() }, None))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 400, .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_request_timeout_is_applied() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v22.0/1111/messages"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"messages": [{"id": "wamid.LATE"}]}))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let timeout = Duration::from_millis(100);
        let channel = WhatsAppChannel::new(settings(&server.uri()))
            .unwrap()
            .with_request_timeout(timeout);
        let err = channel
            .send("5491100000001", &message(MessageBody::Text { text: "hola".into() }, None))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::Timeout(timeout));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_catalog_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v22.0/waba-1/message_templates"))
            .and(query_param("name", "daily_digest"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"name": "daily_digest", "language": "es", "status": "APPROVED",
                          "components": [{"type": "BODY", "text": "Buen día"}]}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let channel = WhatsAppChannel::new(settings(&server.uri())).unwrap();
        let first = channel.template_definition("daily_digest", "es").await.unwrap();
        let second = channel.template_definition("daily_digest", "es").await.unwrap();
        assert_eq!(first, second);
        assert!(first.unwrap().parameters.is_empty());
    }
}
