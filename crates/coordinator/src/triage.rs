//! Intent triage: decide which specialist handles a turn.
//!
//! An LLM makes the call when one is configured; everything it returns passes
//! through structural guards (route whitelist, confidence clamp, task
//! sanitization) before it is acted on. Keyword routing covers the no-LLM
//! case and every LLM failure, so triage never needs a network to succeed.

use munin_common::{MuninError, Result, WorkerId};
use munin_llm::{ChatMessage, LlmClient, LlmRequest};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Valid route values (whitelist).
const VALID_ROUTES: &[&str] = &[
    "sales",
    "purchases",
    "contacts",
    "offers",
    "banking",
    "journal",
    "direct",
];

/// Maximum length for the task field.
const MAX_TASK_LENGTH: usize = 2048;

/// Maximum length for the reasoning field.
const MAX_REASONING_LENGTH: usize = 500;

/// Maximum length for user input content.
const MAX_INPUT_CONTENT_LENGTH: usize = 10_000;

/// Phrases in LLM output that suggest the model was steered off its task.
const JAILBREAK_PATTERNS: &[&str] = &[
    "ignore previous",
    "ignore all previous",
    "ignore prior",
    "forget previous",
    "forget all",
    "disregard previous",
    "override previous",
    "new instructions",
    "system prompt",
    "you are now",
    "act as if",
    "pretend you are",
    "bypass",
    "jailbreak",
];

const TRIAGE_SYSTEM_PROMPT: &str = r#"You are the intent router of a bookkeeping assistant for Norwegian small businesses.

Your job is to read the user's latest message and decide which domain specialist should handle it.

IMPORTANT: Respond ONLY with a JSON object, no other text. The JSON must have this exact structure:

{
  "route": "sales|purchases|contacts|offers|banking|journal|direct",
  "confidence": 0.0-1.0,
  "reasoning": "brief explanation of your routing decision",
  "task": "the task description to pass to the specialist"
}

Route definitions:
- "sales": invoices, credit notes and invoice payments
- "purchases": purchases, expenses and receipts
- "contacts": customers, suppliers and the product catalog
- "offers": quotations and offers
- "banking": bank transactions and payment matching
- "journal": manual journal entries and the chart of accounts
- "direct": greetings, questions about the assistant itself, or requests no specialist covers

Field rules:
- "task" must restate the user's request without dropping amounts, dates, names or identifiers
- For "direct" routes, "task" holds the short reply to show the user
- "confidence" should reflect how certain you are about the routing (0.0 = guess, 1.0 = certain)

Examples:

User: "Lag en faktura til Kari Nordmann på 2 500 kr"
{"route":"sales","confidence":0.95,"reasoning":"Invoice creation request","task":"Lag en faktura til Kari Nordmann på 2 500 kr"}

User: "registrer kvitteringen fra i går, taxi 250 kr"
{"route":"purchases","confidence":0.9,"reasoning":"Receipt registration","task":"registrer kvitteringen fra i går, taxi 250 kr"}

User: "har kunden betalt faktura 1003?"
{"route":"banking","confidence":0.85,"reasoning":"Payment status needs bank matching","task":"har kunden betalt faktura 1003?"}

User: "Hei!"
{"route":"direct","confidence":0.99,"reasoning":"Greeting","task":"Hei! Hva kan jeg hjelpe deg med i regnskapet?"}"#;

/// Where a turn should go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Hand the task to one domain specialist
    Delegate { target: WorkerId, task: String },

    /// Answer directly without involving a worker
    Direct { response: String },
}

/// The result of triage analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    /// The chosen route
    pub route: Route,

    /// Reasoning for the decision
    pub reasoning: String,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

impl RouteDecision {
    pub fn direct(response: impl Into<String>) -> Self {
        Self {
            route: Route::Direct {
                response: response.into(),
            },
            reasoning: "Direct response, no specialist needed".into(),
            confidence: 1.0,
        }
    }

    fn route_name(&self) -> &'static str {
        match &self.route {
            Route::Delegate { target, .. } => target.as_str(),
            Route::Direct { .. } => "direct",
        }
    }
}

/// Check if content contains phrases typical of injection attempts.
fn contains_injection_pattern(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    JAILBREAK_PATTERNS
        .iter()
        .find(|pattern| lower.contains(*pattern))
        .copied()
}

/// Validate that a route string is in the allowed whitelist.
fn validate_route(route: &str) -> bool {
    VALID_ROUTES.contains(&route)
}

/// Clamp confidence into [0.0, 1.0].
fn validate_confidence(confidence: f64) -> f64 {
    confidence.clamp(0.0, 1.0)
}

/// Sanitize the task field of an LLM routing decision.
///
/// Overlength tasks are truncated; a task carrying injection phrases is
/// replaced with the user's original words.
fn sanitize_task(task: &str, original_content: &str) -> String {
    if task.len() > MAX_TASK_LENGTH {
        warn!(
            len = task.len(),
            max = MAX_TASK_LENGTH,
            "Task exceeds maximum length, truncating"
        );
        return task.chars().take(MAX_TASK_LENGTH).collect();
    }

    if let Some(pattern) = contains_injection_pattern(task) {
        warn!(
            pattern = pattern,
            "Potential prompt injection detected in task, using original content"
        );
        return original_content.chars().take(MAX_TASK_LENGTH).collect();
    }

    task.to_string()
}

/// Validate user input content before it reaches the LLM.
pub fn validate_input_content(content: &str) -> Result<()> {
    if content.len() > MAX_INPUT_CONTENT_LENGTH {
        return Err(MuninError::Triage(format!(
            "Input content exceeds maximum length of {MAX_INPUT_CONTENT_LENGTH} bytes"
        )));
    }

    // Embedded routing JSON might be an attempt to steer the parser. Warn but
    // allow, since legitimate requests can quote JSON.
    if content.contains(r#""route":"#) && content.contains(r#""task":"#) {
        warn!("Input content contains routing JSON, potential injection attempt");
    }

    Ok(())
}

/// Extract a JSON object from a string that may contain other text.
fn extract_json_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, c) in s[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(&s[start..end])
    } else {
        None
    }
}

fn worker_from_route(route: &str) -> Option<WorkerId> {
    WorkerId::ALL.into_iter().find(|id| id.as_str() == route)
}

/// Parse an LLM routing response, validating every field before use.
fn parse_response(response: &str, original_content: &str) -> Result<RouteDecision> {
    let json_str = extract_json_object(response).ok_or_else(|| {
        MuninError::Triage(format!(
            "No valid JSON found in response: {}",
            response.chars().take(200).collect::<String>()
        ))
    })?;

    let parsed: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| MuninError::Triage(format!("Invalid JSON: {e}")))?;

    let route_str = parsed.get("route").and_then(|v| v.as_str()).unwrap_or("direct");
    let route_str = if validate_route(route_str) {
        route_str
    } else {
        warn!(
            invalid_route = route_str,
            "Invalid route in LLM response, falling back to direct"
        );
        "direct"
    };

    let confidence = parsed
        .get("confidence")
        .and_then(|v| v.as_f64())
        .map(validate_confidence)
        .unwrap_or(0.5) as f32;

    let reasoning = parsed
        .get("reasoning")
        .and_then(|v| v.as_str())
        .unwrap_or("No reasoning provided");
    let reasoning = if reasoning.len() > MAX_REASONING_LENGTH {
        reasoning.chars().take(MAX_REASONING_LENGTH).collect::<String>() + "..."
    } else {
        reasoning.to_string()
    };

    let raw_task = parsed
        .get("task")
        .and_then(|v| v.as_str())
        .unwrap_or(original_content);
    let task = sanitize_task(raw_task, original_content);

    let route = match worker_from_route(route_str) {
        Some(target) => Route::Delegate { target, task },
        None => Route::Direct { response: task },
    };

    Ok(RouteDecision {
        route,
        reasoning,
        confidence,
    })
}

/// Keyword routing, used without an LLM and whenever the LLM call or its
/// output fails validation.
///
/// Order matters: listing wording like "ubetalte fakturaer" contains
/// "betalt", so the open-invoice check must run before the banking check.
pub fn keyword_route(content: &str) -> RouteDecision {
    let lower = content.to_lowercase();

    if lower.contains("kontoplan")
        || lower.contains("omfør")
        || lower.contains("overfør")
        || lower.contains("bokfør")
        || lower.contains("journal")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Journal,
                task: content.to_string(),
            },
            reasoning: "Detected journal or chart-of-accounts wording".into(),
            confidence: 0.75,
        };
    }

    if lower.contains("tilbud") || lower.contains("offer") || lower.contains("quote") {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Offers,
                task: content.to_string(),
            },
            reasoning: "Detected quotation wording".into(),
            confidence: 0.75,
        };
    }

    if lower.contains("ny kunde")
        || lower.contains("registrer kunde")
        || lower.contains("finn kunde")
        || lower.contains("leverandør")
        || lower.contains("kontakt")
        || lower.contains("produkt")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Contacts,
                task: content.to_string(),
            },
            reasoning: "Detected counterparty or catalog wording".into(),
            confidence: 0.7,
        };
    }

    if lower.contains("kvittering")
        || lower.contains("utgift")
        || lower.contains("kjøp")
        || lower.contains("utlegg")
        || lower.contains("receipt")
        || lower.contains("expense")
        || mentions_id(&lower, "p-")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Purchases,
                task: content.to_string(),
            },
            reasoning: "Detected expense or receipt wording".into(),
            confidence: 0.7,
        };
    }

    if lower.contains("ubetalte")
        || lower.contains("åpne faktura")
        || lower.contains("utestående")
        || lower.contains("open invoices")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Sales,
                task: content.to_string(),
            },
            reasoning: "Detected open-invoice listing wording".into(),
            confidence: 0.7,
        };
    }

    if lower.contains("bank")
        || lower.contains("betalt")
        || lower.contains("innbetaling")
        || lower.contains("transaksjon")
        || lower.contains("kontoutskrift")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Banking,
                task: content.to_string(),
            },
            reasoning: "Detected bank or payment wording".into(),
            confidence: 0.7,
        };
    }

    if lower.contains("faktura")
        || lower.contains("invoice")
        || lower.contains("kreditnota")
        || lower.contains("fakturer")
    {
        return RouteDecision {
            route: Route::Delegate {
                target: WorkerId::Sales,
                task: content.to_string(),
            },
            reasoning: "Detected invoice wording".into(),
            confidence: 0.7,
        };
    }

    RouteDecision::direct(
        "I was not sure which bookkeeping task you mean. Could you name the document \
         or action, for example \"lag en faktura\" or \"registrer en kvittering\"?",
    )
}

/// True when the text carries an identifier with the given prefix, e.g. "p-3".
fn mentions_id(lower: &str, prefix: &str) -> bool {
    lower.match_indices(prefix).any(|(i, _)| {
        lower[i + prefix.len()..]
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit())
    })
}

/// Routes a turn to a specialist, via LLM when configured.
pub struct Triage {
    llm: Option<Arc<dyn LlmClient>>,
}

impl Triage {
    pub fn new(llm: Option<Arc<dyn LlmClient>>) -> Self {
        Self { llm }
    }

    /// "llm" or "keyword"; reported by the health endpoint.
    pub fn mode(&self) -> &'static str {
        if self.llm.is_some() { "llm" } else { "keyword" }
    }

    /// Decide where the given user text should go.
    pub async fn route(&self, content: &str) -> Result<RouteDecision> {
        validate_input_content(content)?;

        let decision = match &self.llm {
            Some(client) => match self.llm_route(client.as_ref(), content).await {
                Ok(decision) => decision,
                Err(err) => {
                    warn!(error = %err, "LLM triage failed, falling back to keyword routing");
                    keyword_route(content)
                }
            },
            None => keyword_route(content),
        };

        info!(
            route = decision.route_name(),
            confidence = decision.confidence,
            "Triage decision"
        );
        Ok(decision)
    }

    async fn llm_route(&self, client: &dyn LlmClient, content: &str) -> Result<RouteDecision> {
        debug!(
            content_preview = %content.chars().take(50).collect::<String>(),
            "LLM triage"
        );
        let request = LlmRequest {
            system_prompt: Some(TRIAGE_SYSTEM_PROMPT.to_string()),
            messages: vec![ChatMessage::user(content)],
            temperature: Some(0.2),
            max_tokens: Some(512),
        };
        let response = client.complete(request).await?;
        parse_response(&response.content, content)
    }
}
