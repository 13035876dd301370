use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestMessageContentPartImageArgs,
    ChatCompletionRequestMessageContentPartTextArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionRequestUserMessageContent, ChatCompletionRequestUserMessageContentPart,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    ImageUrlArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

use crate::config::Settings;
use crate::language::{InvalidLanguage, LanguageCode};
use crate::retry::{retry_transient, RetryError, RetryPolicy, Retryable};

#[derive(Debug, thiserror::Error)]
pub(crate) enum TranslateError {
    #[error(transparent)]
    UnsupportedLanguage(#[from] InvalidLanguage),
    #[error("OPENAI_API_KEY is not set; translation is unavailable")]
    MissingCredential,
    #[error("failed to build request: {0}")]
    Request(#[source] OpenAIError),
    #[error("translation service error: {0}")]
    Transient(String),
    #[error("translation request rejected: {0}")]
    Rejected(String),
    #[error("malformed translation response: {0}")]
    MalformedResponse(String),
    #[error("translation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<TranslateError>,
    },
}

impl Retryable for TranslateError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<OpenAIError> for TranslateError {
    fn from(err: OpenAIError) -> Self {
        match err {
            OpenAIError::Reqwest(e) => Self::Transient(e.to_string()),
            OpenAIError::ApiError(api) => {
                let code = api.code.as_deref().unwrap_or_default();
                let kind = api.r#type.as_deref().unwrap_or_default();
                if code == "invalid_api_key" || kind == "insufficient_quota" {
                    Self::Rejected(api.message)
                } else {
                    Self::Transient(api.message)
                }
            }
            // Error statuses with a non-JSON body, such as a gateway's HTML page.
            OpenAIError::JSONDeserialize(e) => Self::Transient(e.to_string()),
            other => Self::Request(other),
        }
    }
}

/// Transport for chat completions, split out so the retry and parsing logic
/// can run against a scripted backend.
#[async_trait]
pub(crate) trait ChatBackend: Send + Sync {
    async fn complete(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, TranslateError>;
}

pub(crate) struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    timeout: Duration,
}

/// Client with its built-in rate-limit backoff switched off, so every failure
/// surfaces to the caller's [`RetryPolicy`].
fn chat_client(config: OpenAIConfig) -> Client<OpenAIConfig> {
    Client::with_config(config).with_backoff(
        ExponentialBackoffBuilder::new()
            .with_max_elapsed_time(Some(Duration::ZERO))
            .build(),
    )
}

impl OpenAiBackend {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self, TranslateError> {
        let api_key = settings
            .api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or(TranslateError::MissingCredential)?;
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(api_base) = &settings.api_base {
            config = config.with_api_base(api_base);
        }
        Ok(Self {
            client: chat_client(config),
            timeout: settings.request_timeout,
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn complete(
        &self,
        request: CreateChatCompletionRequest,
    ) -> Result<CreateChatCompletionResponse, TranslateError> {
        tokio::time::timeout(self.timeout, self.client.chat().create(request))
            .await
            .map_err(|_| TranslateError::Transient(format!("no response within {:?}", self.timeout)))?
            .map_err(TranslateError::from)
    }
}

pub(crate) struct Translator<B> {
    backend: B,
    model: String,
    max_tokens: u32,
    policy: RetryPolicy,
}

pub(crate) fn prompt(text: &str, source: LanguageCode, target: LanguageCode) -> String {
    format!(
        "Translate the following audio description for the frames of this video from {} to {}. \
         Respond with the translation only. If the audio description does not match the image, \
         please ignore the image. Respond with a translation only. \
         This is the audio description to translate: \n {}",
        source.name(),
        target.name(),
        text
    )
}

impl<B: ChatBackend> Translator<B> {
    pub(crate) fn new(backend: B, settings: &Settings) -> Self {
        Self {
            backend,
            model: settings.chat_model.clone(),
            max_tokens: settings.max_tokens,
            policy: settings.retry.clone(),
        }
    }

    fn build_request(
        &self,
        prompt: String,
        images: &[String],
    ) -> Result<CreateChatCompletionRequest, OpenAIError> {
        CreateChatCompletionRequestArgs::default()
            .model(self.model.as_str())
            .max_tokens(self.max_tokens)
            .messages([ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(ChatCompletionRequestUserMessageContent::Array(
                        [
                            vec![ChatCompletionRequestUserMessageContentPart::Text(
                                ChatCompletionRequestMessageContentPartTextArgs::default()
                                    .text(prompt)
                                    .build()?,
                            )],
                            images
                                .iter()
                                .map(|image| -> Result<_, OpenAIError> {
                                    Ok(ChatCompletionRequestUserMessageContentPart::ImageUrl(
                                        ChatCompletionRequestMessageContentPartImageArgs::default()
                                            .image_url(ImageUrlArgs::default().url(image).build()?)
                                            .build()?,
                                    ))
                                })
                                .collect::<Result<_, _>>()?,
                        ]
                        .concat(),
                    ))
                    .build()?,
            )])
            .build()
    }

    /// Translates `text` from `source` to `target`, attaching `images`
    /// (data URIs) as visual context.
    pub(crate) async fn translate(
        &self,
        text: &str,
        images: &[String],
        source: &str,
        target: &str,
    ) -> Result<String, TranslateError> {
        let source: LanguageCode = source.parse()?;
        let target: LanguageCode = target.parse()?;

        let prompt = prompt(text, source, target);
        info!(
            model = %self.model,
            max_tokens = self.max_tokens,
            images = images.len(),
            %prompt,
            "sending translation request"
        );
        let request = self
            .build_request(prompt, images)
            .map_err(TranslateError::Request)?;

        // No attempt may outlive the retry budget.
        let deadline = Instant::now() + self.policy.max_elapsed;
        let response = retry_transient(&self.policy, "translation", || {
            let request = request.clone();
            async move {
                match tokio::time::timeout_at(deadline, self.backend.complete(request)).await {
                    Ok(reply) => reply,
                    Err(_) => Err(TranslateError::Transient(
                        "retry budget spent awaiting a reply".to_string(),
                    )),
                }
            }
        })
        .await
        .map_err(|err| match err {
            RetryError::Permanent(e) => e,
            RetryError::Exhausted { last, attempts } => TranslateError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
        })?;
        info!(id = %response.id, "received translation response");

        tokio::time::sleep(self.policy.rate_limit_delay()).await;

        first_message(response)
    }
}

fn first_message(response: CreateChatCompletionResponse) -> Result<String, TranslateError> {
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| TranslateError::MalformedResponse("response has no choices".to_string()))?;
    choice
        .message
        .content
        .ok_or_else(|| TranslateError::MalformedResponse("first choice has no content".to_string()))
}
