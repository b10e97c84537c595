//! Language detection and per-stage, per-language prompt templates.
//!
//! Templates are validated once at registry construction: an unknown
//! placeholder in a template is a fail-fast configuration error rather than
//! a silently-unfilled `{field}` surfacing in a prompt later.

use std::collections::HashMap;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported languages. Unrecognised/ambiguous input defaults to [`Language::En`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Ko,
    En,
}

impl Language {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Ko => "ko",
            Language::En => "en",
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detect the dominant language of a string using a majority-character
/// heuristic: if more than half of the alphabetic-ish characters fall in
/// the Hangul Unicode block, the text is Korean; otherwise English.
#[must_use]
pub fn detect(text: &str) -> Language {
    let mut hangul = 0usize;
    let mut other = 0usize;
    for ch in text.chars() {
        if ch.is_whitespace() || ch.is_ascii_punctuation() {
            continue;
        }
        if is_hangul(ch) {
            hangul += 1;
        } else if ch.is_alphanumeric() {
            other += 1;
        }
    }
    if hangul > other {
        Language::Ko
    } else {
        Language::En
    }
}

fn is_hangul(ch: char) -> bool {
    let c = ch as u32;
    (0xAC00..=0xD7A3).contains(&c) || (0x1100..=0x11FF).contains(&c) || (0x3130..=0x318F).contains(&c)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TemplateId {
    Clarification,
    ResearchBrief,
    Supervisor,
    Researcher,
    Compression,
    FinalReport,
}

impl TemplateId {
    fn placeholders(self) -> &'static [&'static str] {
        match self {
            TemplateId::Clarification => &["question"],
            TemplateId::ResearchBrief => &["question", "clarified_goal"],
            TemplateId::Supervisor => &["brief", "summaries", "iteration"],
            TemplateId::Researcher => &["question", "snippets"],
            TemplateId::Compression => &["summaries"],
            TemplateId::FinalReport => &["brief", "compressed"],
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("template {template:?}/{language} references unknown placeholder `{placeholder}`")]
    #[diagnostic(code(deepresearch::registry::unknown_placeholder))]
    UnknownPlaceholder {
        template: TemplateId,
        language: Language,
        placeholder: String,
    },

    #[error("no template registered for {template:?}/{language}")]
    #[diagnostic(code(deepresearch::registry::missing_template))]
    MissingTemplate { template: TemplateId, language: Language },

    #[error("missing value for placeholder `{0}`")]
    #[diagnostic(code(deepresearch::registry::missing_value))]
    MissingValue(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Compiled, validated set of prompt templates.
pub struct PromptRegistry {
    templates: HashMap<(TemplateId, Language), String>,
}

impl PromptRegistry {
    /// Build the registry with the built-in English and Korean templates,
    /// validating every placeholder against [`TemplateId::placeholders`].
    pub fn new() -> Result<Self> {
        let mut templates = HashMap::new();
        for (id, lang, text) in default_templates() {
            templates.insert((id, lang), text.to_string());
        }
        let registry = Self { templates };
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<()> {
        for ((id, lang), text) in &self.templates {
            for placeholder in extract_placeholders(text) {
                if !id.placeholders().contains(&placeholder.as_str()) {
                    return Err(RegistryError::UnknownPlaceholder {
                        template: *id,
                        language: *lang,
                        placeholder,
                    });
                }
            }
        }
        Ok(())
    }

    /// Render a template for the given language, substituting `{name}`
    /// placeholders from `values`. Falls back to English if the language
    /// has no dedicated template.
    pub fn render(
        &self,
        template: TemplateId,
        language: Language,
        values: &HashMap<&str, String>,
    ) -> Result<String> {
        let text = self
            .templates
            .get(&(template, language))
            .or_else(|| self.templates.get(&(template, Language::En)))
            .ok_or(RegistryError::MissingTemplate { template, language })?;

        let mut rendered = text.clone();
        for placeholder in template.placeholders() {
            let value = values
                .get(placeholder)
                .ok_or_else(|| RegistryError::MissingValue((*placeholder).to_string()))?;
            rendered = rendered.replace(&format!("{{{placeholder}}}"), value);
        }
        Ok(rendered)
    }
}

fn extract_placeholders(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, ch)) = chars.next() {
        if ch == '{' {
            if let Some(end) = text[i + 1..].find('}') {
                out.push(text[i + 1..i + 1 + end].to_string());
            }
        }
    }
    out
}

fn default_templates() -> Vec<(TemplateId, Language, &'static str)> {
    vec![
        (
            TemplateId::Clarification,
            Language::En,
            "Restate the user's research question as a single, unambiguous goal: {question}",
        ),
        (
            TemplateId::Clarification,
            Language::Ko,
            "사용자의 연구 질문을 명확한 목표 하나로 다시 작성하세요: {question}",
        ),
        (
            TemplateId::ResearchBrief,
            Language::En,
            "Goal: {clarified_goal}\nOriginal question: {question}\nWrite a short research brief covering the angles worth investigating.",
        ),
        (
            TemplateId::ResearchBrief,
            Language::Ko,
            "목표: {clarified_goal}\n원래 질문: {question}\n조사할 가치가 있는 관점을 다루는 짧은 연구 개요를 작성하세요.",
        ),
        (
            TemplateId::Supervisor,
            Language::En,
            "Brief: {brief}\nExisting findings: {summaries}\nIteration: {iteration}\nPropose up to the allowed number of new, non-duplicate research subtasks, or none if the brief is sufficiently covered.",
        ),
        (
            TemplateId::Supervisor,
            Language::Ko,
            "개요: {brief}\n기존 결과: {summaries}\n반복 횟수: {iteration}\n허용된 개수만큼 새롭고 중복되지 않는 조사 하위 과제를 제안하거나, 개요가 충분히 다뤄졌다면 제안하지 마세요.",
        ),
        (
            TemplateId::Researcher,
            Language::En,
            "Subtask: {question}\nSearch snippets:\n{snippets}\nSummarise the findings relevant to the subtask, citing sources.",
        ),
        (
            TemplateId::Researcher,
            Language::Ko,
            "하위 과제: {question}\n검색 스니펫:\n{snippets}\n하위 과제와 관련된 내용을 출처와 함께 요약하세요.",
        ),
        (
            TemplateId::Compression,
            Language::En,
            "Consolidate the following findings into one coherent intermediate document, preserving citations:\n{summaries}",
        ),
        (
            TemplateId::Compression,
            Language::Ko,
            "다음 결과들을 출처를 유지하며 하나의 일관된 중간 문서로 통합하세요:\n{summaries}",
        ),
        (
            TemplateId::FinalReport,
            Language::En,
            "Brief: {brief}\nConsolidated findings: {compressed}\nWrite the final research report with a citation list.",
        ),
        (
            TemplateId::FinalReport,
            Language::Ko,
            "개요: {brief}\n통합된 결과: {compressed}\n출처 목록을 포함한 최종 연구 보고서를 작성하세요.",
        ),
    ]
}
