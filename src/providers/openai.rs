//! OpenAI 兼容文本模型
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）。
//! 错误按可重试性分类：鉴权问题不重试，网络与上游波动交给重试策略。

use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
};
use async_openai::Client;
use async_trait::async_trait;

use crate::config::LlmSection;
use crate::core::AssistantError;
use crate::providers::traits::TextModel;

/// OpenAI 兼容客户端：单轮 prompt 进、文本出
pub struct OpenAiTextModel {
    client: Client<OpenAIConfig>,
    model: String,
    temperature: f32,
}

impl OpenAiTextModel {
    pub fn new(
        base_url: Option<&str>,
        model: &str,
        temperature: f32,
        api_key: Option<&str>,
    ) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            temperature,
        }
    }

    /// 从配置创建；没有可用的 API Key 时返回 None，调用方退回 mock
    pub fn from_config(cfg: &LlmSection) -> Option<Self> {
        let key = std::env::var("OPENAI_API_KEY").ok();
        if key.as_deref().unwrap_or("").is_empty() {
            tracing::debug!("text model skipped: no OPENAI_API_KEY");
            return None;
        }
        Some(Self::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            cfg.temperature,
            key.as_deref(),
        ))
    }

    async fn run(
        &self,
        messages: Vec<ChatCompletionRequestMessage>,
        json_mode: bool,
    ) -> Result<String, AssistantError> {
        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.model)
            .temperature(self.temperature)
            .messages(messages);
        if json_mode {
            builder.response_format(ResponseFormat::JsonObject);
        }
        let request = builder
            .build()
            .map_err(|e| AssistantError::Internal(format!("chat request: {e}")))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| classify_upstream_error(&e.to_string()))?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "model call usage"
            );
        }

        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// 上游错误分类：鉴权类 → UpstreamAuth，其余（网络、配额、5xx）→ TransientIo
fn classify_upstream_error(text: &str) -> AssistantError {
    let lower = text.to_lowercase();
    if lower.contains("api key")
        || lower.contains("unauthorized")
        || lower.contains("authentication")
        || lower.contains("invalid_api_key")
    {
        AssistantError::UpstreamAuth(text.to_string())
    } else {
        AssistantError::TransientIo(text.to_string())
    }
}

#[async_trait]
impl TextModel for OpenAiTextModel {
    async fn complete(&self, prompt: &str) -> Result<String, AssistantError> {
        let messages = vec![ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()
                .map_err(|e| AssistantError::Internal(format!("chat message: {e}")))?,
        )];
        self.run(messages, false).await
    }

    async fn complete_json(
        &self,
        prompt: &str,
        schema: &serde_json::Value,
    ) -> Result<String, AssistantError> {
        let system = format!(
            "You are a precise classifier. Respond with a single JSON object that \
             conforms to this JSON schema, with no prose around it:\n{}",
            serde_json::to_string_pretty(schema)
                .map_err(|e| AssistantError::Internal(format!("schema render: {e}")))?
        );
        let messages = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system)
                    .build()
                    .map_err(|e| AssistantError::Internal(format!("chat message: {e}")))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt.to_string())
                    .build()
                    .map_err(|e| AssistantError::Internal(format!("chat message: {e}")))?,
            ),
        ];
        self.run(messages, true).await
    }
}
