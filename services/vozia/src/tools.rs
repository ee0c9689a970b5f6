//! Client-side tools the tutor can call, and the task that answers them.
//!
//! Each tool shows its result to the learner through a [`Display`] channel and
//! acknowledges the call to the model after a short delay.

use async_trait::async_trait;
use gemini_realtime::{
    FunctionCall, FunctionDeclaration, FunctionResponse, LiveEvent, Subscription, ToolCall,
    ToolResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vozia_core::SessionController;

/// Pause before a tool call is acknowledged, so the result is on screen first.
pub const RESPONSE_DELAY: Duration = Duration::from_millis(200);

/// Something a tool wants to show the learner.
#[derive(Debug, Clone, PartialEq)]
pub enum Display {
    Quiz(Vec<QuizItem>),
    /// A Vega or Vega-Lite specification.
    Graph(Value),
}

/// A client-side function exposed to the model.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn declaration(&self) -> FunctionDeclaration;

    /// Runs the call and returns the `output` sent back to the model.
    async fn handle(&self, call: &FunctionCall) -> Value;
}

// --- Quiz ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuizItem {
    pub question: String,
    pub answers: Vec<String>,
    pub correct_answer_index: usize,
}

#[derive(Debug, Deserialize)]
struct QuizArgs {
    quiz_data: Vec<QuizItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizResult {
    pub question: String,
    pub selected_answer: String,
    pub is_correct: bool,
}

/// `create_quiz`: shows multiple-choice questions and keeps them for grading.
pub struct QuizTool {
    display: mpsc::UnboundedSender<Display>,
    current: Mutex<Option<Vec<QuizItem>>>,
}

impl QuizTool {
    pub fn new(display: mpsc::UnboundedSender<Display>) -> Self {
        Self {
            display,
            current: Mutex::new(None),
        }
    }

    pub fn current_quiz(&self) -> Option<Vec<QuizItem>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Grades the current quiz. `selections` holds one zero-based answer per
    /// question; missing or out-of-range entries count as unanswered.
    pub fn grade(&self, selections: &[Option<usize>]) -> Option<Vec<QuizResult>> {
        let quiz = self.current_quiz()?;
        Some(grade(&quiz, selections))
    }
}

pub fn grade(quiz: &[QuizItem], selections: &[Option<usize>]) -> Vec<QuizResult> {
    quiz.iter()
        .enumerate()
        .map(|(i, item)| {
            let selected = selections
                .get(i)
                .copied()
                .flatten()
                .filter(|&s| s < item.answers.len());
            QuizResult {
                question: item.question.clone(),
                selected_answer: selected
                    .map(|s| item.answers[s].clone())
                    .unwrap_or_else(|| "No answer selected".to_string()),
                is_correct: selected == Some(item.correct_answer_index),
            }
        })
        .collect()
}

/// The user turn reporting quiz results back to the tutor.
pub fn results_message(results: &[QuizResult]) -> String {
    let json = serde_json::to_string(results).unwrap_or_else(|_| "[]".to_string());
    format!("User submitted quiz results: {json}")
}

#[async_trait]
impl ToolHandler for QuizTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: "create_quiz".to_string(),
            description: concat!(
                "Creates a quiz with a list of questions and their answers, ",
                "then displays it to the user."
            )
            .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "quiz_data": {
                        "type": "ARRAY",
                        "description": "An array of quiz questions.",
                        "items": {
                            "type": "OBJECT",
                            "properties": {
                                "question": {"type": "STRING", "description": "The quiz question text."},
                                "answers": {
                                    "type": "ARRAY",
                                    "description": "An array of possible answers for the question.",
                                    "items": {"type": "STRING", "description": "A single answer text."}
                                },
                                "correct_answer_index": {
                                    "type": "NUMBER",
                                    "description": "The zero-based index of the correct answer in the answers array."
                                }
                            },
                            "required": ["question", "answers", "correct_answer_index"]
                        }
                    }
                },
                "required": ["quiz_data"]
            }),
        }
    }

    async fn handle(&self, call: &FunctionCall) -> Value {
        match serde_json::from_value::<QuizArgs>(call.args.clone()) {
            Ok(args) => {
                info!(questions = args.quiz_data.len(), "Showing quiz");
                *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(args.quiz_data.clone());
                let _ = self.display.send(Display::Quiz(args.quiz_data));
                json!({"success": true})
            }
            Err(e) => {
                warn!(error = %e, "Malformed create_quiz arguments");
                json!({"success": false, "error": e.to_string()})
            }
        }
    }
}

// --- Graph ---

/// `display_graph`: renders a Vega or Vega-Lite chart.
pub struct GraphTool {
    display: mpsc::UnboundedSender<Display>,
}

impl GraphTool {
    pub fn new(display: mpsc::UnboundedSender<Display>) -> Self {
        Self { display }
    }
}

#[async_trait]
impl ToolHandler for GraphTool {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration {
            name: "display_graph".to_string(),
            description: concat!(
                "Displays a graph visualization based on a Vega-Lite or Vega JSON specification. ",
                "Use this tool when the user asks to visualize data, create charts, ",
                "or display graphs."
            )
            .to_string(),
            parameters: json!({
                "type": "OBJECT",
                "properties": {
                    "vega_spec": {
                        "type": "STRING",
                        "description": "The JSON string of the Vega-Lite or Vega specification for the graph."
                    }
                },
                "required": ["vega_spec"]
            }),
        }
    }

    async fn handle(&self, call: &FunctionCall) -> Value {
        let spec = call
            .args
            .get("vega_spec")
            .and_then(Value::as_str)
            .map(serde_json::from_str::<Value>);
        match spec {
            Some(Ok(spec)) => {
                let _ = self.display.send(Display::Graph(spec));
                json!({"success": true})
            }
            Some(Err(e)) => {
                warn!(error = %e, "vega_spec is not valid JSON");
                json!({"success": false, "error": format!("vega_spec is not valid JSON: {e}")})
            }
            None => json!({"success": false, "error": "missing vega_spec"}),
        }
    }
}

// --- Dispatch ---

pub struct ToolRegistry {
    handlers: Vec<Arc<dyn ToolHandler>>,
    response_delay: Duration,
}

impl ToolRegistry {
    pub fn new(handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        Self {
            handlers,
            response_delay: RESPONSE_DELAY,
        }
    }

    pub fn with_response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        self.handlers.iter().map(|h| h.declaration()).collect()
    }

    /// Runs every function call and builds one response answering all of them.
    pub async fn respond(&self, call: &ToolCall) -> ToolResponse {
        let mut function_responses = Vec::with_capacity(call.function_calls.len());
        for fc in &call.function_calls {
            let handler = self
                .handlers
                .iter()
                .find(|h| h.declaration().name == fc.name);
            let output = match handler {
                Some(handler) => handler.handle(fc).await,
                None => {
                    warn!(name = %fc.name, "Model called an unknown function");
                    json!({"success": false, "error": format!("unknown function '{}'", fc.name)})
                }
            };
            function_responses.push(FunctionResponse::output(fc.id.clone(), output));
        }
        tokio::time::sleep(self.response_delay).await;
        ToolResponse { function_responses }
    }
}

/// Answers tool calls until the subscription ends.
pub async fn run_tool_responder(
    registry: Arc<ToolRegistry>,
    controller: Arc<SessionController>,
    mut events: Subscription,
) {
    while let Some(event) = events.recv().await {
        match event {
            LiveEvent::ToolCall(call) if !call.function_calls.is_empty() => {
                let response = registry.respond(&call).await;
                if let Err(e) = controller.send_tool_response(&response) {
                    // cancelled calls and closed sessions end up here
                    debug!(error = %e, "Tool response not sent");
                }
            }
            LiveEvent::ToolCallCancellation(cancellation) => {
                info!(ids = ?cancellation.ids, "Tool calls cancelled");
            }
            _ => {}
        }
    }
}
