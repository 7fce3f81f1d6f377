use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ai_provider::{AIProvider, AIProviderClient, ChatMessage};
use crate::config::Config;
use crate::core::{Letter, LetterError, Result};
use crate::memory::MemoryManager;
use crate::persona::{Persona, PromptTemplate, Slot, SlotValues, DIALOGUE_TEMPLATE};
use crate::rate_limit::{ChatLimiter, SLOW_DOWN_REPLY};
use crate::relationship::{AffinityChange, Relationship, RelationshipStage, SentimentAnalyzer};
use crate::request::RequestManager;
use crate::scene::{transition_message, Scene, SceneDetector};

pub const MAX_INPUT_LENGTH: usize = 200;
const HISTORY_TURNS: usize = 5;
const OFFLINE_REPLY: &str = "は？何それ。あたしに話しかけてるの？";
const FAILURE_REPLY: &str = "（ごめん、システムの調子が悪いみたいだ。）";
const HIDDEN_OPEN: &str = "[HIDDEN:";

/// Piece of a reply. Hidden pieces are the persona's unspoken thoughts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Segment {
    Visible(String),
    Hidden(String),
}

/// Splits `[HIDDEN:...]` spans out of a reply, in order. An unterminated
/// marker is kept as visible text.
pub fn split_hidden(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut rest = text;

    while let Some(start) = rest.find(HIDDEN_OPEN) {
        let after = &rest[start + HIDDEN_OPEN.len()..];
        let Some(end) = after.find(']') else {
            break;
        };
        if start > 0 {
            segments.push(Segment::Visible(rest[..start].to_string()));
        }
        let hidden = after[..end].trim();
        if !hidden.is_empty() {
            segments.push(Segment::Hidden(hidden.to_string()));
        }
        rest = &after[end + 1..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Visible(rest.to_string()));
    }
    segments
}

/// The reply as spoken aloud, hidden spans removed.
pub fn visible_text(text: &str) -> String {
    split_hidden(text)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Visible(text) => Some(text),
            Segment::Hidden(_) => None,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn validate_input(message: &str) -> Result<()> {
    if message.trim().is_empty() {
        return Err(LetterError::InvalidRequest("message is empty".to_string()));
    }
    let length = message.chars().count();
    if length > MAX_INPUT_LENGTH {
        return Err(LetterError::InvalidRequest(format!(
            "message is {} characters, the limit is {}",
            length, MAX_INPUT_LENGTH
        )));
    }
    if message.chars().any(char::is_control) {
        return Err(LetterError::InvalidRequest("message contains control characters".to_string()));
    }
    Ok(())
}

pub fn sanitize(message: &str) -> String {
    message
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Shared, read-only pieces every session talks through.
pub struct ChatEngine {
    dialogue_client: Option<AIProviderClient>,
    scene_detector: SceneDetector,
    sentiment: SentimentAnalyzer,
    persona: Persona,
    template: PromptTemplate,
}

impl ChatEngine {
    pub fn new(dialogue_client: Option<AIProviderClient>, scene_detector: SceneDetector, persona: Persona) -> Result<Self> {
        let template = PromptTemplate::parse(DIALOGUE_TEMPLATE).map_err(|e| LetterError::Config(e.to_string()))?;
        Ok(ChatEngine {
            dialogue_client,
            scene_detector,
            sentiment: SentimentAnalyzer::new(),
            persona,
            template,
        })
    }

    /// Gemini for dialogue and Groq for scene detection, each only when its
    /// key is configured.
    pub fn from_config(config: &Config) -> Result<Self> {
        let dialogue_client = if config.has_api_key(AIProvider::Gemini) {
            Some(AIProviderClient::new(config.get_ai_config(AIProvider::Gemini, None)?)?)
        } else {
            warn!("GEMINI_API_KEY not set, chat runs with canned replies");
            None
        };
        let scene_client = if config.has_api_key(AIProvider::Groq) {
            let mut scene_config = config.get_ai_config(AIProvider::Groq, None)?;
            scene_config.temperature = Some(0.2);
            scene_config.max_tokens = Some(150);
            Some(AIProviderClient::new(scene_config)?)
        } else {
            None
        };

        Self::new(dialogue_client, SceneDetector::new(scene_client), Persona::from_config(config))
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }
}

/// Reply to one user message plus what changed on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    pub text: String,
    pub affinity: u8,
    pub change: Option<AffinityChange>,
    pub stage: RelationshipStage,
    pub new_scene: Option<Scene>,
}

/// Everything one conversation carries between messages.
#[derive(Debug, Clone)]
pub struct ChatSession {
    pub user_id: String,
    pub relationship: Relationship,
    pub scene: Scene,
    pub messages: Vec<ChatMessage>,
    pub memory: MemoryManager,
    pub limiter: ChatLimiter,
}

impl ChatSession {
    pub fn new(user_id: Option<String>) -> Self {
        ChatSession {
            user_id: user_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            relationship: Relationship::default(),
            scene: Scene::default(),
            messages: Vec::new(),
            memory: MemoryManager::default(),
            limiter: ChatLimiter::default(),
        }
    }

    pub fn affinity(&self) -> u8 {
        self.relationship.affinity
    }

    pub fn stage(&self) -> RelationshipStage {
        self.relationship.stage()
    }

    /// Same user, fresh conversation.
    pub fn reset(&mut self) {
        *self = ChatSession::new(Some(self.user_id.clone()));
        info!("Session for {} reset", self.user_id);
    }

    /// Last few (user, reply) pairs, oldest first.
    fn recent_turns(&self) -> Vec<(String, String)> {
        let users = self.messages.iter().filter(|m| m.role == "user");
        let replies = self.messages.iter().filter(|m| m.role == "assistant");
        let turns: Vec<(String, String)> = users
            .zip(replies)
            .map(|(u, a)| (u.content.clone(), a.content.clone()))
            .collect();
        turns[turns.len().saturating_sub(HISTORY_TURNS)..].to_vec()
    }

    pub async fn process_message(&mut self, message: &str, engine: &ChatEngine) -> Result<ChatReply> {
        validate_input(message)?;
        let message = sanitize(message);

        if !self.limiter.check() {
            debug!("Session {} is sending too fast", self.user_id);
            self.push_exchange(&message, SLOW_DOWN_REPLY);
            return Ok(ChatReply {
                text: SLOW_DOWN_REPLY.to_string(),
                affinity: self.affinity(),
                change: None,
                stage: self.stage(),
                new_scene: None,
            });
        }

        let history = self.recent_turns();

        let change = engine.sentiment.update(&mut self.relationship, &message);
        if change.delta != 0 {
            info!(
                "Affinity {} ({:+}): {}",
                self.relationship.affinity, change.delta, change.reason
            );
        }

        let new_scene = engine.scene_detector.detect(&history, &message, self.scene).await;
        let mut instruction = format!("ユーザーの発言「{}」に応答してください。", message);
        if let Some(scene) = new_scene {
            instruction = format!("【特別指示】{}。{}", transition_message(self.scene, scene), instruction);
            self.scene = scene;
        }

        let messages = std::mem::take(&mut self.messages);
        self.messages = self.memory.compress(messages);

        let reply = self.generate_reply(engine, &history, &instruction).await;
        self.push_exchange(&message, &reply);

        Ok(ChatReply {
            text: reply,
            affinity: self.affinity(),
            change: Some(change),
            stage: self.stage(),
            new_scene,
        })
    }

    async fn generate_reply(&self, engine: &ChatEngine, history: &[(String, String)], instruction: &str) -> String {
        let Some(client) = &engine.dialogue_client else {
            return OFFLINE_REPLY.to_string();
        };

        let history_text = history
            .iter()
            .map(|(user, reply)| format!("ユーザー: {}\n麻理: {}", user, reply))
            .collect::<Vec<_>>()
            .join("\n");
        let summary = self.memory.summary();
        let memory = if summary.is_empty() {
            String::new()
        } else {
            format!("# 過去の記憶\n{}\n", summary)
        };

        let prompt = engine.template.render(
            &SlotValues::new()
                .with(Slot::Scene, self.scene.display_name())
                .with(Slot::Affinity, self.affinity().to_string())
                .with(Slot::Stage, self.stage().label())
                .with(Slot::Memory, memory)
                .with(Slot::History, history_text)
                .with(Slot::Instruction, instruction),
        );

        match client
            .chat(vec![ChatMessage::user(prompt)], Some(engine.persona.dialogue_prompt()))
            .await
        {
            Ok(response) if !response.content.is_empty() => response.content,
            Ok(_) => {
                warn!("Empty dialogue reply");
                "…なんて言えばいいか分からない。".to_string()
            }
            Err(e) => {
                warn!("Dialogue generation failed: {}", e);
                FAILURE_REPLY.to_string()
            }
        }
    }

    fn push_exchange(&mut self, message: &str, reply: &str) {
        self.messages.push(ChatMessage::user(message));
        self.messages.push(ChatMessage::assistant(reply));
    }

    /// Brings a received letter into the conversation.
    pub fn reflect_letter(&mut self, letter: &Letter) -> Result<()> {
        let content = letter
            .content
            .as_deref()
            .ok_or_else(|| LetterError::InvalidRequest(format!("letter {} has no content yet", letter.id)))?;

        let excerpt: String = content.chars().take(200).collect();
        let theme = letter.theme.prompt_label();
        self.memory.add_important_memory(
            "letter_content",
            &format!("手紙のテーマ「{}」について麻理が書いた内容: {}...", theme, excerpt),
        );
        self.push_exchange(
            &format!("この前書いてくれた「{}」についての手紙、読ませてもらったよ。", theme),
            &format!(
                "あの手紙、読んでくれたんだ...。「{}」について書いたとき、あなたのことを思いながら一生懸命考えたんだ。どう思った？",
                theme
            ),
        );
        info!("Letter {} reflected into session {}", letter.id, self.user_id);
        Ok(())
    }

    /// Asks for a letter at the session's current affinity.
    pub fn request_letter(&self, requests: &RequestManager, theme: &str, hour: u32, now: DateTime<Utc>) -> Result<Letter> {
        requests.submit(&self.user_id, theme, hour, self.affinity(), now, &Local)
    }
}
