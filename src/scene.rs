use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

use crate::ai_provider::{AIProviderClient, ChatMessage};
use crate::persona::{PromptTemplate, Slot, SlotValues, SCENE_TEMPLATE};

/// Where the conversation is taking place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scene {
    #[default]
    Default,
    RoomNight,
    BeachSunset,
    FestivalNight,
    ShrineDay,
    CafeAfternoon,
    AquariumNight,
}

impl Scene {
    pub const ALL: [Scene; 7] = [
        Scene::Default,
        Scene::RoomNight,
        Scene::BeachSunset,
        Scene::FestivalNight,
        Scene::ShrineDay,
        Scene::CafeAfternoon,
        Scene::AquariumNight,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Scene::Default => "default",
            Scene::RoomNight => "room_night",
            Scene::BeachSunset => "beach_sunset",
            Scene::FestivalNight => "festival_night",
            Scene::ShrineDay => "shrine_day",
            Scene::CafeAfternoon => "cafe_afternoon",
            Scene::AquariumNight => "aquarium_night",
        }
    }

    pub fn from_id(id: &str) -> Option<Scene> {
        Scene::ALL.into_iter().find(|scene| scene.id() == id.trim())
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scene::Default => "デフォルトの部屋",
            Scene::RoomNight => "夜の部屋・寝室",
            Scene::BeachSunset => "夕日のビーチ・海岸",
            Scene::FestivalNight => "夜祭り・花火大会",
            Scene::ShrineDay => "昼間の神社・寺院",
            Scene::CafeAfternoon => "午後のカフェ・喫茶店",
            Scene::AquariumNight => "夜の水族館",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Scene::Default => "デフォルトの部屋",
            Scene::RoomNight => "夜の部屋",
            Scene::BeachSunset => "夕日のビーチ",
            Scene::FestivalNight => "夜祭り",
            Scene::ShrineDay => "昼間の神社",
            Scene::CafeAfternoon => "午後のカフェ",
            Scene::AquariumNight => "夜の水族館",
        }
    }

    pub fn background_url(&self) -> &'static str {
        match self {
            Scene::Default => "https://images.unsplash.com/photo-1586023492125-27b2c045efd7?w=1200&h=800&fit=crop",
            Scene::RoomNight => "https://images.unsplash.com/photo-1505142468610-359e7d316be0?w=1200&h=800&fit=crop",
            Scene::BeachSunset => "https://images.unsplash.com/photo-1507525428034-b723cf961d3e?w=1200&h=800&fit=crop",
            Scene::FestivalNight => "https://images.unsplash.com/photo-1533174072545-7a4b6ad7a6c3?w=1200&h=800&fit=crop",
            Scene::ShrineDay => "https://images.unsplash.com/photo-1545569341-9eb8b30979d9?w=1200&h=800&fit=crop",
            Scene::CafeAfternoon => "https://images.unsplash.com/photo-1554118811-1e0d58224f24?w=1200&h=800&fit=crop",
            Scene::AquariumNight => "https://images.unsplash.com/photo-1544551763-46a013bb70d5?w=1200&h=800&fit=crop",
        }
    }

    fn keywords(&self) -> &'static [&'static str] {
        match self {
            Scene::Default => &[],
            Scene::RoomNight => &["部屋", "寝室", "ベッド", "家の中", "リビング"],
            Scene::BeachSunset => &["ビーチ", "海", "砂浜", "海岸", "海辺", "浜辺", "夕日", "夕焼け", "潮風"],
            Scene::FestivalNight => &["祭り", "花火", "屋台", "縁日", "浴衣", "夜店", "フェスティバル"],
            Scene::ShrineDay => &["神社", "お寺", "寺院", "鳥居", "境内", "お参り", "参拝", "おみくじ"],
            Scene::CafeAfternoon => &["カフェ", "喫茶店", "コーヒー", "ラテ", "エスプレッソ", "紅茶"],
            Scene::AquariumNight => &["水族館", "アクアリウム", "水槽", "イルカ", "クラゲ", "海の生き物"],
        }
    }
}

impl fmt::Display for Scene {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

const MOVEMENT_KEYWORDS: &[&str] = &[
    "行く", "行こう", "向かう", "着いた", "到着", "移動", "出かける", "来た", "にいる",
    "店", "レストラン", "家", "室内", "屋内", "夜", "波", "お茶", "祈り", "魚",
];

/// Cheap check run before spending a model call on scene detection.
pub fn has_location_keywords(text: &str) -> bool {
    MOVEMENT_KEYWORDS.iter().any(|k| text.contains(k))
        || Scene::ALL.iter().any(|scene| scene.keywords().iter().any(|k| text.contains(k)))
}

pub fn transition_message(old: Scene, new: Scene) -> String {
    format!("シーンが「{}」から「{}」に変更されました", old.display_name(), new.display_name())
}

#[derive(Debug, Deserialize)]
struct SceneReply {
    scene: String,
    #[serde(default)]
    reason: Option<String>,
}

pub struct SceneDetector {
    client: Option<AIProviderClient>,
}

impl SceneDetector {
    pub fn new(client: Option<AIProviderClient>) -> Self {
        SceneDetector { client }
    }

    /// Keyword matching only.
    pub fn offline() -> Self {
        SceneDetector { client: None }
    }

    /// New scene if the conversation moved somewhere else, `None` otherwise.
    pub async fn detect(&self, history: &[(String, String)], message: &str, current: Scene) -> Option<Scene> {
        let recent = &history[history.len().saturating_sub(5)..];
        let history_text = recent
            .iter()
            .map(|(user, reply)| format!("ユーザー: {}\n麻理: {}", user, reply))
            .collect::<Vec<_>>()
            .join("\n");

        if !has_location_keywords(message) && !has_location_keywords(&history_text) {
            debug!("No location keywords, skipping scene detection");
            return None;
        }

        let detected = match &self.client {
            Some(client) => match self.ask_model(client, &history_text, message, current).await {
                Ok(scene) => scene,
                Err(e) => {
                    warn!("Scene detection call failed, using keywords: {}", e);
                    keyword_scene(message).or_else(|| keyword_scene(&history_text))
                }
            },
            None => keyword_scene(message).or_else(|| keyword_scene(&history_text)),
        };

        match detected {
            Some(scene) if scene != current => {
                info!("Scene change detected: {} -> {}", current, scene);
                Some(scene)
            }
            _ => None,
        }
    }

    async fn ask_model(
        &self,
        client: &AIProviderClient,
        history_text: &str,
        message: &str,
        current: Scene,
    ) -> anyhow::Result<Option<Scene>> {
        let candidates = Scene::ALL
            .iter()
            .map(|scene| format!("{} ({})", scene.id(), scene.description()))
            .collect::<Vec<_>>()
            .join(", ");

        let template = PromptTemplate::parse(SCENE_TEMPLATE)?;
        let prompt = template.render(
            &SlotValues::new()
                .with(Slot::Scene, format!("{} ({})", current.id(), current.description()))
                .with(Slot::History, history_text)
                .with(Slot::Message, message)
                .with(Slot::Instruction, candidates),
        );

        let response = client.chat_json(vec![ChatMessage::user(prompt)], None).await?;
        Ok(parse_scene_reply(&response.content))
    }
}

/// Reads `{"scene": "..."}` out of a model reply, tolerating text around it.
fn parse_scene_reply(content: &str) -> Option<Scene> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end < start {
        return None;
    }
    let reply: SceneReply = match serde_json::from_str(&content[start..=end]) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Unparseable scene reply: {}", e);
            return None;
        }
    };
    debug!("Scene reply: {} ({})", reply.scene, reply.reason.as_deref().unwrap_or("-"));
    Scene::from_id(&reply.scene)
}

fn keyword_scene(text: &str) -> Option<Scene> {
    Scene::ALL
        .into_iter()
        .find(|scene| scene.keywords().iter().any(|k| text.contains(k)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_provider::{AIConfig, AIProvider};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_scene_ids_round_trip() {
        for scene in Scene::ALL {
            assert_eq!(Scene::from_id(scene.id()), Some(scene));
        }
        assert_eq!(Scene::from_id("moon_base"), None);
        assert_eq!(serde_json::to_string(&Scene::BeachSunset).unwrap(), "\"beach_sunset\"");
    }

    #[test]
    fn test_every_scene_has_its_own_background() {
        let urls: std::collections::HashSet<_> = Scene::ALL.iter().map(|s| s.background_url()).collect();
        assert_eq!(urls.len(), Scene::ALL.len());
        assert!(urls.iter().all(|url| url.starts_with("https://")));
    }

    #[test]
    fn test_location_prefilter() {
        assert!(has_location_keywords("一緒に神社に行こうよ"));
        assert!(has_location_keywords("クラゲがきれい"));
        assert!(!has_location_keywords("元気？"));
    }

    #[test]
    fn test_transition_message() {
        assert_eq!(
            transition_message(Scene::Default, Scene::CafeAfternoon),
            "シーンが「デフォルトの部屋」から「午後のカフェ」に変更されました"
        );
    }

    #[test]
    fn test_parse_scene_reply() {
        assert_eq!(parse_scene_reply("{\"scene\": \"shrine_day\"}"), Some(Scene::ShrineDay));
        assert_eq!(
            parse_scene_reply("```json\n{\"scene\": \"aquarium_night\", \"reason\": \"水槽\"}\n```"),
            Some(Scene::AquariumNight)
        );
        assert_eq!(parse_scene_reply("{\"scene\": \"none\"}"), None);
        assert_eq!(parse_scene_reply("not json"), None);
    }

    #[tokio::test]
    async fn test_offline_keyword_detection() {
        let detector = SceneDetector::offline();
        let history = vec![("こんにちは".to_string(), "…何".to_string())];

        let scene = detector.detect(&history, "海辺で夕日を見よう", Scene::Default).await;
        assert_eq!(scene, Some(Scene::BeachSunset));

        // Already there.
        let same = detector.detect(&history, "海辺で夕日を見よう", Scene::BeachSunset).await;
        assert_eq!(same, None);

        let none = detector.detect(&[], "元気？", Scene::Default).await;
        assert_eq!(none, None);
    }

    #[tokio::test]
    async fn test_model_detection_and_fallback() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "{\"scene\": \"festival_night\", \"reason\": \"花火\"}" } }]
            })))
            .mount(&server)
            .await;

        let mut config = AIConfig::new(AIProvider::Groq);
        config.api_key = Some("k".to_string());
        config.base_url = Some(server.uri());
        config.retry_delay_ms = 1;
        let detector = SceneDetector::new(Some(AIProviderClient::new(config.clone()).unwrap()));

        let scene = detector.detect(&[], "花火を見に行こう", Scene::Default).await;
        assert_eq!(scene, Some(Scene::FestivalNight));

        // Unreachable provider falls back to keywords.
        config.base_url = Some("http://127.0.0.1:9".to_string());
        config.max_retries = 1;
        let broken = SceneDetector::new(Some(AIProviderClient::new(config).unwrap()));
        let scene = broken.detect(&[], "カフェでコーヒー飲もう", Scene::Default).await;
        assert_eq!(scene, Some(Scene::CafeAfternoon));
    }
}
