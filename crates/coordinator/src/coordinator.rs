//! The turn pipeline: one user turn in, one reply and an updated
//! transcript out.
//!
//! Per turn the coordinator rebuilds task state from the transcript, applies
//! conversation-level safety policy, routes via triage (or continues a live
//! proposal/question), delegates over the channel, and appends what happened
//! back onto the transcript. Workers never write to the transcript; every
//! mutation happens here.

use crate::channel::DelegationChannel;
use crate::config::ConversationConfig;
use crate::policy::{self, PROPOSE_PREFIX, PendingProposal, REQUEST_INPUT_ACTION, TaskState};
use crate::triage::{Route, Triage};
use chrono::{Local, NaiveDate};
use munin_common::{
    ActionOutcome, ActionRecord, AttachmentSet, DelegationRequest, MuninError, ParticipantId,
    ProposedAction, Result, Role, Transcript, Turn, WorkerId,
};
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Progress events emitted while a turn is processed, in order. `Done` is
/// always last and carries the full updated transcript.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TurnEvent {
    /// A chunk of user-facing reply text
    Delta { text: String },

    /// A worker is invoking a side-effecting action
    Action { worker: WorkerId, action: String },

    /// The action finished
    Outcome {
        worker: WorkerId,
        action: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Something went wrong behind the scenes; the reply text stays clean
    Error { message: String },

    /// Turn complete
    Done { transcript: Transcript },
}

/// The finished turn: reply text plus the transcript to post back next turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub text: String,
    pub transcript: Transcript,
}

/// Entry point for conversation turns.
pub struct Coordinator {
    channel: Arc<DelegationChannel>,
    triage: Triage,
    config: ConversationConfig,
    today: Option<NaiveDate>,
}

impl Coordinator {
    pub fn new(channel: Arc<DelegationChannel>, triage: Triage, config: ConversationConfig) -> Self {
        Self {
            channel,
            triage,
            config,
            today: None,
        }
    }

    /// Pin the date used for relative date resolution instead of reading
    /// the clock.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    /// Which triage backend is active, for health reporting.
    pub fn triage_mode(&self) -> &'static str {
        self.triage.mode()
    }

    /// Process one turn without streaming.
    pub async fn process(
        &self,
        transcript: Transcript,
        attachments: AttachmentSet,
    ) -> Result<TurnReply> {
        let (events, receiver) = mpsc::channel(8);
        // No listener: sends fail fast and the turn proceeds regardless.
        drop(receiver);
        self.process_turn(transcript, attachments, &events).await
    }

    /// Process one turn, emitting progress events as work happens.
    ///
    /// The transcript must end with the user turn being processed; the
    /// returned transcript extends it with action records and the reply.
    pub async fn process_turn(
        &self,
        transcript: Transcript,
        attachments: AttachmentSet,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnReply> {
        if !matches!(
            transcript.turns().last(),
            Some(Turn::Message {
                role: Role::User,
                ..
            })
        ) {
            return Err(MuninError::Triage(
                "transcript must end with a user turn".into(),
            ));
        }
        let user_text = transcript
            .last_user_text()
            .ok_or_else(|| MuninError::Triage("user turn carries no text".into()))?;

        if let Some(question) = policy::is_destructive_or_bulk(&user_text) {
            info!("Refusing bulk destructive request");
            return Ok(self.finish(transcript, question, events).await);
        }

        let state = TaskState::scan(&transcript);

        if let Some(pending) = state.pending.clone() {
            if policy::is_acknowledgement(&user_text) {
                info!(
                    worker = %pending.worker,
                    action = %pending.action,
                    "User confirmed pending proposal"
                );
                return self
                    .run_confirmed(transcript, attachments, &state, &pending, events)
                    .await;
            }
            if policy::is_rejection(&user_text) {
                info!(action = %pending.action, "User rejected pending proposal");
                return Ok(self
                    .finish(
                        transcript,
                        "Understood, nothing has been recorded. What would you like to do \
                         instead?"
                            .into(),
                        events,
                    )
                    .await);
            }
            // Anything else is a revision: merge it into the task that
            // produced the proposal and let the same worker re-propose.
            let task = format!("{} {}", pending.task, user_text).trim().to_string();
            return self
                .delegate_and_reply(transcript, attachments, &state, pending.worker, task, None, events)
                .await;
        }

        if let Some(question) = state.open_question.clone() {
            // The answer goes straight back to the asker, merged into the
            // original task. No fresh triage: "inkl. mva" alone routes
            // nowhere sensible.
            let task = format!("{} {}", question.task, user_text).trim().to_string();
            return self
                .delegate_and_reply(transcript, attachments, &state, question.worker, task, None, events)
                .await;
        }

        if policy::is_acknowledgement(&user_text) {
            return Ok(self
                .finish(
                    transcript,
                    "Nothing is awaiting confirmation right now. What would you like me to do?"
                        .into(),
                    events,
                )
                .await);
        }

        let decision = match self.triage.route(&user_text).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(error = %err, "Triage rejected the input");
                return Ok(self
                    .finish(
                        transcript,
                        "That message is too long for me to process in one go. Please split \
                         it into smaller steps."
                            .into(),
                        events,
                    )
                    .await);
            }
        };

        match decision.route {
            Route::Direct { response } => Ok(self.finish(transcript, response, events).await),
            Route::Delegate { target, task } => {
                self.delegate_and_reply(transcript, attachments, &state, target, task, None, events)
                    .await
            }
        }
    }

    async fn run_confirmed(
        &self,
        transcript: Transcript,
        attachments: AttachmentSet,
        state: &TaskState,
        pending: &PendingProposal,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnReply> {
        let confirmed = json!({
            "action": pending.action,
            "inputs": pending.inputs,
            "fingerprint": pending.fingerprint,
        });
        // The task names what was already agreed; workers execute from the
        // confirmed inputs, not from re-parsing this text.
        let task = format!("confirmed: {}", pending.summary);
        self.delegate_and_reply(
            transcript,
            attachments,
            state,
            pending.worker,
            task,
            Some(confirmed),
            events,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn delegate_and_reply(
        &self,
        mut transcript: Transcript,
        attachments: AttachmentSet,
        state: &TaskState,
        target: WorkerId,
        task: String,
        confirmed: Option<Value>,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnReply> {
        let context = self.build_context(state, &attachments, confirmed);
        let request = DelegationRequest::new(ParticipantId::Coordinator, target, task.clone())?
            .with_context(context)
            .with_transcript(transcript.clone());

        let timeout = Duration::from_millis(self.config.turn_timeout_ms);
        let response = match tokio::time::timeout(timeout, self.channel.send(request, &attachments))
            .await
        {
            Ok(response) => response,
            Err(_) => {
                warn!(
                    %target,
                    timeout_ms = self.config.turn_timeout_ms,
                    "Delegation timed out"
                );
                let _ = events
                    .send(TurnEvent::Error {
                        message: format!("delegation to {target} timed out"),
                    })
                    .await;
                let text = format!(
                    "The {target} specialist did not answer in time. Nothing further was \
                     done; please try again."
                );
                return Ok(self.finish(transcript, text, events).await);
            }
        };

        if !response.success {
            let error = response.error.unwrap_or_else(|| "unknown error".into());
            warn!(%target, error = %error, "Delegation failed");
            let _ = events.send(TurnEvent::Error { message: error }).await;
            let text = format!(
                "The {target} specialist could not complete this request right now. \
                 Please try again in a moment."
            );
            return Ok(self.finish(transcript, text, events).await);
        }
        let Some(reply) = response.reply else {
            let text = format!(
                "The {target} specialist could not complete this request right now. \
                 Please try again in a moment."
            );
            return Ok(self.finish(transcript, text, events).await);
        };

        for record in &reply.actions {
            let _ = events
                .send(TurnEvent::Action {
                    worker: record.worker,
                    action: record.action.clone(),
                })
                .await;
            let _ = events
                .send(TurnEvent::Outcome {
                    worker: record.worker,
                    action: record.action.clone(),
                    success: record.outcome.success,
                    message: record.outcome.message.clone(),
                })
                .await;
            transcript.push(Turn::action(record.clone()));
        }

        // Marker records make the proposal or question recoverable when the
        // client posts the transcript back next turn.
        if let Some(proposal) = &reply.pending {
            transcript.push(Turn::action(propose_marker(proposal, &task)));
        } else if reply.needs_input {
            transcript.push(Turn::action(request_input_marker(target, &task)));
        }

        Ok(self.finish(transcript, reply.text, events).await)
    }

    fn build_context(
        &self,
        state: &TaskState,
        attachments: &AttachmentSet,
        confirmed: Option<Value>,
    ) -> Value {
        let today = self.today.unwrap_or_else(|| Local::now().date_naive());
        let mut context = json!({
            "today": today.format("%Y-%m-%d").to_string(),
        });

        if !state.fingerprints.is_empty() {
            context["fingerprints"] = json!(state.fingerprints);
        }
        if !state.entities.is_empty() {
            let entities: BTreeMap<&str, &str> = state
                .entities
                .iter()
                .map(|(kind, id)| (kind.as_str(), id.as_str()))
                .collect();
            context["entities"] = json!(entities);
        }
        if let Some(confirmed) = confirmed {
            context["confirmed"] = confirmed;
        }

        // Staged files are re-offered every turn. Once some of them have
        // been booked, restrict what workers may do with the rest.
        if !attachments.is_empty() && !state.consumed_ordinals.is_empty() {
            let unconsumed: Vec<u32> = attachments
                .iter()
                .map(|a| a.ordinal)
                .filter(|ordinal| !state.consumed_ordinals.contains(ordinal))
                .collect();
            context["attachments"] = if unconsumed.is_empty() {
                let all: Vec<u32> = attachments.iter().map(|a| a.ordinal).collect();
                json!({"policy": "upload_only", "ordinals": all})
            } else {
                json!({"ordinals": unconsumed})
            };
        }

        context
    }

    async fn finish(
        &self,
        mut transcript: Transcript,
        text: String,
        events: &mpsc::Sender<TurnEvent>,
    ) -> TurnReply {
        transcript.push(Turn::assistant(text.clone()));
        let _ = events.send(TurnEvent::Delta { text: text.clone() }).await;
        let _ = events
            .send(TurnEvent::Done {
                transcript: transcript.clone(),
            })
            .await;
        TurnReply { text, transcript }
    }
}

fn propose_marker(proposal: &ProposedAction, task: &str) -> ActionRecord {
    ActionRecord::new(
        proposal.worker,
        format!("{PROPOSE_PREFIX}{}", proposal.action),
        ActionOutcome::ok()
            .with_message("awaiting user confirmation")
            .with_details(json!({"summary": proposal.summary, "task": task})),
    )
    .with_inputs(proposal.inputs.clone())
    .with_fingerprint(proposal.fingerprint.clone())
}

fn request_input_marker(worker: WorkerId, task: &str) -> ActionRecord {
    ActionRecord::new(
        worker,
        REQUEST_INPUT_ACTION,
        ActionOutcome::ok()
            .with_message("awaiting user input")
            .with_details(json!({"task": task})),
    )
}
