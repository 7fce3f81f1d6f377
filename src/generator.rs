use tracing::{info, warn};

use crate::ai_provider::{AIProvider, AIProviderClient, ChatMessage, ProviderError};
use crate::config::Config;
use crate::core::{LetterError, Result, Theme};
use crate::persona::{Persona, PromptTemplate, Slot, SlotValues, EMOTION_TEMPLATE, STRUCTURE_TEMPLATE};

/// Default for `LETTER_FALLBACK`, delivered in place of a letter whose generation failed.
pub const FALLBACK_LETTER: &str = "\
今夜は、うまく言葉がまとまらなかった。
書こうとしたことはちゃんとあったんだ。…また今度、ちゃんと書くから。
それまで、あんまり無理すんなよ。

麻理より";

const STRUCTURE_SYSTEM_PROMPT: &str = "\
あなたは手紙の構成を考える編集者です。麻理というキャラクターがユーザーに宛てる手紙の骨組みを、
簡潔な箇条書きで作成してください。";

/// What the generator needs to know about one letter.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationContext {
    pub theme: Theme,
    pub affinity: Option<u8>,
    /// Themes of the user's most recent earlier letters, newest first.
    pub previous_themes: Vec<Theme>,
}

impl GenerationContext {
    pub fn new(theme: Theme) -> Self {
        GenerationContext {
            theme,
            affinity: None,
            previous_themes: Vec::new(),
        }
    }

    fn slot_values(&self) -> SlotValues {
        let previous = if self.previous_themes.is_empty() {
            "なし".to_string()
        } else {
            self.previous_themes
                .iter()
                .take(2)
                .map(|t| t.prompt_label().to_string())
                .collect::<Vec<_>>()
                .join("、")
        };
        SlotValues::new()
            .with(Slot::Theme, self.theme.prompt_label())
            .with(Slot::PreviousThemes, previous)
            .with(
                Slot::Affinity,
                self.affinity.map(|a| a.to_string()).unwrap_or_else(|| "不明".to_string()),
            )
    }
}

/// Two-stage letter writer: one model outlines, another writes it out in
/// the persona's voice.
pub struct LetterGenerator {
    structure_client: AIProviderClient,
    emotion_client: AIProviderClient,
    persona_prompt: String,
    structure_template: PromptTemplate,
    emotion_template: PromptTemplate,
}

impl LetterGenerator {
    pub fn new(structure_client: AIProviderClient, emotion_client: AIProviderClient, persona: &Persona) -> Result<Self> {
        let parse = |source: &str| PromptTemplate::parse(source).map_err(|e| LetterError::Config(e.to_string()));
        Ok(LetterGenerator {
            structure_client,
            emotion_client,
            persona_prompt: persona.system_prompt.clone(),
            structure_template: parse(STRUCTURE_TEMPLATE)?,
            emotion_template: parse(EMOTION_TEMPLATE)?,
        })
    }

    /// Groq writes the outline, Together the finished letter.
    pub fn from_config(config: &Config, persona: &Persona) -> Result<Self> {
        let structure = AIProviderClient::new(config.get_ai_config(AIProvider::Groq, None)?)?;
        let emotion = AIProviderClient::new(config.get_ai_config(AIProvider::Together, None)?)?;
        Self::new(structure, emotion, persona)
    }

    pub async fn generate(&self, context: &GenerationContext) -> std::result::Result<String, ProviderError> {
        let mut values = context.slot_values();

        info!("Generating letter structure for theme {}", context.theme);
        let structure_prompt = self.structure_template.render(&values);
        let structure = self
            .structure_client
            .chat(vec![ChatMessage::user(structure_prompt)], Some(STRUCTURE_SYSTEM_PROMPT.to_string()))
            .await?
            .content;
        if structure.is_empty() {
            return Err(ProviderError::InvalidResponse("empty letter structure".to_string()));
        }

        values.set(Slot::Structure, structure);
        let emotion_prompt = self.emotion_template.render(&values);
        let letter = match self
            .emotion_client
            .chat(vec![ChatMessage::user(emotion_prompt)], Some(self.persona_prompt.clone()))
            .await
        {
            Ok(response) => response.content,
            Err(e) => {
                // A bare outline is not a letter.
                warn!("Emotion stage failed, discarding structure: {}", e);
                return Err(e);
            }
        };
        if letter.is_empty() {
            return Err(ProviderError::InvalidResponse("empty letter body".to_string()));
        }

        info!("Letter generated ({} chars)", letter.chars().count());
        Ok(letter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_provider::AIConfig;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(provider: AIProvider, server: &MockServer, prefix: &str) -> AIProviderClient {
        let mut config = AIConfig::new(provider);
        config.api_key = Some("k".to_string());
        config.base_url = Some(format!("{}{}", server.uri(), prefix));
        config.retry_delay_ms = 1;
        AIProviderClient::new(config).unwrap()
    }

    fn completion(text: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": text } }]
        }))
    }

    fn generator(server: &MockServer) -> LetterGenerator {
        LetterGenerator::new(
            client(AIProvider::Groq, server, "/groq"),
            client(AIProvider::Together, server, "/together"),
            &Persona::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_two_stage_generation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groq/chat/completions"))
            .and(body_string_contains("感謝"))
            .and(body_string_contains("旅行"))
            .respond_with(completion("- 書き出し\n- 本文\n- 結び"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/together/chat/completions"))
            .and(body_string_contains("書き出し"))
            .respond_with(completion("あんたへ。ありがとな。"))
            .expect(1)
            .mount(&server)
            .await;

        let mut context = GenerationContext::new(Theme::Gratitude);
        context.previous_themes = vec![Theme::Travel];
        context.affinity = Some(60);

        let letter = generator(&server).generate(&context).await.unwrap();
        assert_eq!(letter, "あんたへ。ありがとな。");
    }

    #[tokio::test]
    async fn test_emotion_failure_discards_structure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groq/chat/completions"))
            .respond_with(completion("- 構成だけ"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/together/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(&GenerationContext::new(Theme::Daily))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_structure_failure_skips_emotion_stage() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groq/chat/completions"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/together/chat/completions"))
            .respond_with(completion("unused"))
            .expect(0)
            .mount(&server)
            .await;

        let result = generator(&server).generate(&GenerationContext::new(Theme::Romance)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_body_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/groq/chat/completions"))
            .respond_with(completion("- 構成"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/together/chat/completions"))
            .respond_with(completion("   "))
            .mount(&server)
            .await;

        let err = generator(&server)
            .generate(&GenerationContext::new(Theme::Daily))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse(_)));
    }
}
