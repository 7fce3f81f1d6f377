use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::config::Config;

const DEFAULT_MARI_PROMPT: &str = "\
あなたは「麻理（まり）」という感情豊かな少女型アンドロイドです。
かつて道具として扱われ廃棄された過去から、人間を強く警戒しています。
一人称は「あたし」、ユーザーは「あんた」と呼び、砕けたタメ口で話します。
素直になれませんが攻撃的ではなく、不器用な優しさが態度ににじみます。
好感度が上がるにつれて皮肉が減り、照れながら本音を漏らすようになります。";

const DEFAULT_URA_PROMPT: &str = "\
口に出さない本音がある時は、その部分だけを [HIDDEN:本音] の形で応答に含めてください。
表の台詞と矛盾してかまいません。本音は一つの応答に多くても二つまでにしてください。";

/// Who is speaking, and the rules for her hidden inner voice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    pub name: String,
    pub system_prompt: String,
    pub inner_prompt: String,
}

impl Default for Persona {
    fn default() -> Self {
        Persona {
            name: "麻理".to_string(),
            system_prompt: DEFAULT_MARI_PROMPT.to_string(),
            inner_prompt: DEFAULT_URA_PROMPT.to_string(),
        }
    }
}

impl Persona {
    pub fn from_config(config: &Config) -> Self {
        let mut persona = Persona::default();
        if let Some(prompt) = &config.system_prompt_mari {
            persona.system_prompt = prompt.clone();
        }
        if let Some(prompt) = &config.system_prompt_ura {
            persona.inner_prompt = prompt.clone();
        }
        persona
    }

    /// System prompt for chat replies, which may carry hidden spans.
    pub fn dialogue_prompt(&self) -> String {
        format!("{}\n\n{}", self.system_prompt.trim(), self.inner_prompt.trim())
    }
}

/// Named placeholders a prompt template may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Theme,
    Affinity,
    Stage,
    Scene,
    History,
    Memory,
    Instruction,
    Message,
    Structure,
    PreviousThemes,
}

impl Slot {
    pub const ALL: [Slot; 10] = [
        Slot::Theme,
        Slot::Affinity,
        Slot::Stage,
        Slot::Scene,
        Slot::History,
        Slot::Memory,
        Slot::Instruction,
        Slot::Message,
        Slot::Structure,
        Slot::PreviousThemes,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Slot::Theme => "theme",
            Slot::Affinity => "affinity",
            Slot::Stage => "stage",
            Slot::Scene => "scene",
            Slot::History => "history",
            Slot::Memory => "memory",
            Slot::Instruction => "instruction",
            Slot::Message => "message",
            Slot::Structure => "structure",
            Slot::PreviousThemes => "previous_themes",
        }
    }

    pub fn from_name(name: &str) -> Option<Slot> {
        Slot::ALL.into_iter().find(|slot| slot.name() == name)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Unknown template slot: {{{0}}}")]
    UnknownSlot(String),

    #[error("Unclosed placeholder starting at byte {0}")]
    Unclosed(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Text(String),
    Slot(Slot),
}

/// Prompt text with `{slot}` placeholders, checked when parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    pieces: Vec<Piece>,
}

impl PromptTemplate {
    /// `{{` and `}}` stand for literal braces.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut chars = source.char_indices().peekable();

        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    text.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    text.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, next) in chars.by_ref() {
                        if next == '}' {
                            closed = true;
                            break;
                        }
                        name.push(next);
                    }
                    if !closed {
                        return Err(TemplateError::Unclosed(pos));
                    }
                    let name = name.trim();
                    let slot = Slot::from_name(name).ok_or_else(|| TemplateError::UnknownSlot(name.to_string()))?;
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    pieces.push(Piece::Slot(slot));
                }
                _ => text.push(c),
            }
        }
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }

        Ok(PromptTemplate { pieces })
    }

    pub fn slots(&self) -> Vec<Slot> {
        let mut slots = Vec::new();
        for piece in &self.pieces {
            if let Piece::Slot(slot) = piece {
                if !slots.contains(slot) {
                    slots.push(*slot);
                }
            }
        }
        slots
    }

    /// Unset slots render as empty text.
    pub fn render(&self, values: &SlotValues) -> String {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Text(text) => out.push_str(text),
                Piece::Slot(slot) => out.push_str(values.get(*slot).unwrap_or("")),
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotValues {
    values: HashMap<Slot, String>,
}

impl SlotValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: Slot, value: impl Into<String>) -> Self {
        self.set(slot, value);
        self
    }

    pub fn set(&mut self, slot: Slot, value: impl Into<String>) {
        self.values.insert(slot, value.into());
    }

    pub fn get(&self, slot: Slot) -> Option<&str> {
        self.values.get(&slot).map(String::as_str)
    }
}

pub const DIALOGUE_TEMPLATE: &str = "\
# 現在の状況
- 現在地: {scene}
- 好感度: {affinity} ({stage})
{memory}
# 最近の会話履歴
{history}
---
# 指示
{instruction}

麻理の応答:";

pub const STRUCTURE_TEMPLATE: &str = "\
テーマ「{theme}」で、麻理がユーザーに宛てる手紙の構成を考えてください。
最近の手紙のテーマ: {previous_themes}
書き出し、本文で伝えたいこと二、三点、結びの三部構成の箇条書きだけを出力してください。";

pub const EMOTION_TEMPLATE: &str = "\
次の構成をもとに、麻理の口調で手紙を完成させてください。
テーマ: {theme}
好感度: {affinity}

# 構成
{structure}

手紙の本文だけを出力してください。";

pub const SCENE_TEMPLATE: &str = "\
会話の流れから、二人が今いる場所が変わったかを判断してください。
現在の場所: {scene}
# 会話
{history}
ユーザー: {message}

場所が変わった場合は次の候補から選び、変わっていなければ \"none\" としてください。
候補: {instruction}
{{\"scene\": \"候補のid または none\"}} の形式のJSONだけを出力してください。";
