//! Live facility identification through a web-search-backed language model.
//!
//! Opt-in alternative to the offline candidate set. The answer is free text
//! that should contain one JSON object; it is extracted and coerced into a
//! `LiveAnswer`, never trusted as-is.

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::error::LookupError;
use crate::models::{Facility, FacilityKind, PlaceRecord};

pub const DEFAULT_LOOKUP_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_LOOKUP_MODEL: &str = "gpt-5";

const MAX_SOURCE_LINKS: usize = 5;
const MAX_RAW_CHARS: usize = 5000;

/// Structured answer from the lookup service
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LiveAnswer {
    pub name: Option<String>,
    pub iata: Option<String>,
    pub icao: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub confidence_pct: Option<u8>,
    pub reasoning: Option<String>,
}

impl LiveAnswer {
    /// Whether the answer names anything at all
    pub fn identifies_facility(&self) -> bool {
        self.name.is_some() || self.iata.is_some() || self.icao.is_some()
    }

    /// Display label: name, else a code
    pub fn label(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.iata.as_deref())
            .or(self.icao.as_deref())
    }

    /// The facility, when the answer carries valid coordinates
    pub fn facility(&self, kind: FacilityKind) -> Option<Facility> {
        let (lat, lon) = (self.latitude?, self.longitude?);
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
            return None;
        }
        let mut facility = Facility::new(self.label()?, kind, lat, lon);
        facility.iata = self.iata.clone();
        facility.icao = self.icao.clone();
        Some(facility)
    }
}

#[async_trait]
pub trait LiveLookup: Send + Sync {
    async fn lookup(&self, place: &PlaceRecord, kind: FacilityKind) -> Result<LiveAnswer, LookupError>;
}

pub fn build_prompt(place: &PlaceRecord, kind: FacilityKind) -> String {
    let location = format!(
        "{}, {} (coordinates: {:.5}, {:.5})",
        place.name, place.country, place.latitude, place.longitude
    );
    let (task, definition, code_fields) = match kind {
        FacilityKind::Airport => (
            format!("Identify the nearest international airport to {}.", location),
            "International airport = has scheduled international passenger service.",
            "  \"iata\": string | null,\n  \"icao\": string | null,\n",
        ),
        FacilityKind::Hospital => (
            format!("Identify the nearest hospital to {}.", location),
            "Hospital = general hospital with an emergency department.",
            "",
        ),
    };
    format!(
        "You are a rigorous web research assistant. Use the web_search tool to search the web, \
         then answer strictly based on reputable sources.\n\n\
         Task: {}\nDefinition: {}\n\
         Return JSON ONLY with this exact schema and field names:\n\
         {{\n  \"name\": string,\n{}  \"latitude\": number | null,\n  \"longitude\": number | null,\n  \
         \"confidence_pct\": number (0-100),\n  \"reasoning\": string (1-3 sentences),\n  \
         \"sources\": [string URL, ...]\n}}",
        task, definition, code_fields
    )
}

fn fenced_json() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"```json\s*(\{[\s\S]*?\})\s*```").ok())
        .as_ref()
}

fn braced_json() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{[\s\S]*\}").ok()).as_ref()
}

/// First JSON object in `text`: fenced ```json blocks first, then the widest
/// `{...}` span.
pub fn extract_first_json(text: &str) -> Option<Value> {
    let fenced = fenced_json()
        .into_iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|c| c.get(1).map(|m| m.as_str()));
    let braced = braced_json().and_then(|re| re.find(text)).map(|m| m.as_str());

    fenced
        .chain(braced)
        .find_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .filter(Value::is_object)
}

fn first_str(payload: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| payload.get(*k))
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

fn first_f64(payload: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().filter_map(|k| payload.get(*k)).find_map(|v| match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Coerce a loosely-shaped answer object into a `LiveAnswer`
pub fn coerce_answer(payload: &Value) -> LiveAnswer {
    let confidence_pct = first_f64(payload, &["confidence_pct", "airport_confidence_pct", "confidence"])
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as u8);

    let mut reasoning = first_str(payload, &["reasoning"]);
    let sources: Vec<String> = ["sources", "urls"]
        .iter()
        .filter_map(|k| payload.get(*k).and_then(Value::as_array))
        .find(|a| !a.is_empty())
        .map(|a| {
            a.iter()
                .take(MAX_SOURCE_LINKS)
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect()
        })
        .unwrap_or_default();
    if !sources.is_empty() {
        let links = sources.join(", ");
        reasoning = Some(match reasoning {
            Some(r) => format!("{} | Sources: {}", r, links),
            None => format!("Sources: {}", links),
        });
    }

    LiveAnswer {
        name: first_str(payload, &["name", "airport_name", "hospital_name"]),
        iata: first_str(payload, &["iata", "airport_iata"]),
        icao: first_str(payload, &["icao", "airport_icao"]),
        latitude: first_f64(payload, &["latitude", "airport_latitude", "lat"]),
        longitude: first_f64(payload, &["longitude", "airport_longitude", "lon", "lng"]),
        confidence_pct,
        reasoning,
    }
}

/// Text of a Responses API reply: `output_text` if present, else every
/// `output_text` content part joined by newlines.
fn response_text(body: &Value) -> Option<String> {
    if let Some(text) = body.get("output_text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return Some(text.to_string());
        }
    }
    let chunks: Vec<&str> = body
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("content").and_then(Value::as_array))
        .flatten()
        .filter(|c| c.get("type").and_then(Value::as_str) == Some("output_text"))
        .filter_map(|c| c.get("text").and_then(Value::as_str))
        .collect();
    (!chunks.is_empty()).then(|| chunks.join("\n"))
}

/// Parse raw answer text into a `LiveAnswer`
pub fn parse_answer_text(text: &str) -> Result<LiveAnswer, LookupError> {
    if text.trim().is_empty() {
        return Err(LookupError::EmptyOutput);
    }
    let payload = extract_first_json(text).ok_or_else(|| LookupError::Unparsable {
        raw: text.chars().take(MAX_RAW_CHARS).collect(),
    })?;
    let answer = coerce_answer(&payload);
    if answer.identifies_facility() {
        Ok(answer)
    } else {
        Err(LookupError::NoFacility)
    }
}

/// OpenAI Responses API client with the `web_search` tool enabled
pub struct OpenAiLookup {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
    timeout: Duration,
}

impl OpenAiLookup {
    pub fn new(
        client: Client,
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
            timeout,
        }
    }
}

#[async_trait]
impl LiveLookup for OpenAiLookup {
    async fn lookup(&self, place: &PlaceRecord, kind: FacilityKind) -> Result<LiveAnswer, LookupError> {
        let body = json!({
            "model": self.model,
            "input": format!(
                "System: Follow instructions exactly. Do not fabricate sources. Return ONLY JSON.\n\n{}",
                build_prompt(place, kind)
            ),
            "tools": [{"type": "web_search"}],
        });

        let url = format!("{}/responses", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(LookupError::Http(response.status().as_u16()));
        }

        let reply: Value = response.json().await?;
        let text = response_text(&reply).ok_or(LookupError::EmptyOutput)?;
        debug!("Live lookup answer for {}: {} chars", place.name, text.len());
        parse_answer_text(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Source;

    #[test]
    fn test_extract_fenced_block() {
        let text = "Here you go:\n```json\n{\"name\": \"Innsbruck Airport\", \"iata\": \"INN\"}\n```\nBye";
        let value = extract_first_json(text).unwrap();
        assert_eq!(value["iata"], "INN");
    }

    #[test]
    fn test_extract_bare_object() {
        let text = "Answer: {\"name\": \"Verona Villafranca\", \"latitude\": 45.395}";
        let value = extract_first_json(text).unwrap();
        assert_eq!(value["name"], "Verona Villafranca");
        assert!(extract_first_json("no json here").is_none());
    }

    #[test]
    fn test_coerce_variants_and_clamp() {
        let payload = json!({
            "airport_name": "Munich Airport",
            "airport_iata": "MUC",
            "icao": "EDDM",
            "lat": "48.3538",
            "lng": 11.7861,
            "confidence_pct": 140.2,
            "reasoning": "Largest nearby hub.",
            "sources": ["a", "b", "c", "d", "e", "f"]
        });
        let answer = coerce_answer(&payload);
        assert_eq!(answer.name.as_deref(), Some("Munich Airport"));
        assert_eq!(answer.iata.as_deref(), Some("MUC"));
        assert_eq!(answer.icao.as_deref(), Some("EDDM"));
        assert_eq!(answer.latitude, Some(48.3538));
        assert_eq!(answer.longitude, Some(11.7861));
        assert_eq!(answer.confidence_pct, Some(100));
        assert_eq!(
            answer.reasoning.as_deref(),
            Some("Largest nearby hub. | Sources: a, b, c, d, e")
        );

        let negative = coerce_answer(&json!({"name": "x", "confidence_pct": -3}));
        assert_eq!(negative.confidence_pct, Some(0));
    }

    #[test]
    fn test_parse_answer_errors() {
        assert_eq!(parse_answer_text("  "), Err(LookupError::EmptyOutput));
        assert!(matches!(
            parse_answer_text("I could not find it"),
            Err(LookupError::Unparsable { .. })
        ));
        assert_eq!(
            parse_answer_text("{\"reasoning\": \"unsure\"}"),
            Err(LookupError::NoFacility)
        );
    }

    #[test]
    fn test_answer_without_coordinates_has_no_facility() {
        let answer = parse_answer_text("{\"name\": \"Bolzano Airport\", \"iata\": \"BZO\"}").unwrap();
        assert!(answer.facility(FacilityKind::Airport).is_none());

        let answer = parse_answer_text(
            "{\"name\": \"Bolzano Airport\", \"iata\": \"BZO\", \"latitude\": 46.46, \"longitude\": 11.33}",
        )
        .unwrap();
        let facility = answer.facility(FacilityKind::Airport).unwrap();
        assert_eq!(facility.iata.as_deref(), Some("BZO"));
    }

    #[test]
    fn test_response_text_from_output_parts() {
        let reply = json!({
            "output": [
                {"type": "web_search_call", "status": "completed"},
                {"type": "message", "content": [
                    {"type": "output_text", "text": "{\"name\": \"Salzburg Airport\"}"}
                ]}
            ]
        });
        assert_eq!(
            response_text(&reply).as_deref(),
            Some("{\"name\": \"Salzburg Airport\"}")
        );
        assert_eq!(response_text(&json!({"output": []})), None);
    }

    #[test]
    fn test_prompt_mentions_place() {
        let place = PlaceRecord::new("Lienz", 46.83, 12.77, Source::Gazetteer)
            .unwrap()
            .with_country("AT");
        let prompt = build_prompt(&place, FacilityKind::Airport);
        assert!(prompt.contains("Lienz, AT"));
        assert!(prompt.contains("\"iata\""));
        assert!(!build_prompt(&place, FacilityKind::Hospital).contains("\"iata\""));
    }
}
