use crate::error::{Error, Result};
use crate::persona::Persona;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One utterance in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A language-model binding: ordered turns plus an instruction string in, one
/// reply out. Provider request/response shapes stay behind this trait.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn complete(&self, instructions: &str, turns: &[Turn]) -> Result<String>;
}

#[derive(Debug, Default)]
struct History {
    instructions: String,
    turns: Vec<Turn>,
    // Bumped on every reset/clear so a reply to an older history is not recorded.
    generation: u64,
}

/// Turn history and persona instructions for one session, bound to a single
/// language-model provider for its whole lifetime.
pub struct DialogueService {
    model: Box<dyn LanguageModel>,
    history: Mutex<History>,
    request_gate: tokio::sync::Mutex<()>,
}

impl DialogueService {
    pub fn new(model: Box<dyn LanguageModel>, persona: &Persona) -> Self {
        Self {
            model,
            history: Mutex::new(History {
                instructions: persona.instructions(),
                ..Default::default()
            }),
            request_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn history(&self) -> MutexGuard<'_, History> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn provider_name(&self) -> &'static str {
        self.model.name()
    }

    /// Exchanges one user utterance for one reply.
    ///
    /// The user turn is kept even when the provider fails, so a retry carries
    /// the failed attempt's context. Requests are strictly serialized.
    pub async fn send_message(&self, text: &str) -> Result<String> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::EmptyMessage);
        }

        let _in_flight = self.request_gate.lock().await;

        let (instructions, turns, generation) = {
            let mut history = self.history();
            history.turns.push(Turn::new(Role::User, text));
            (
                history.instructions.clone(),
                history.turns.clone(),
                history.generation,
            )
        };

        let started = Instant::now();
        let reply = self.model.complete(&instructions, &turns).await?;
        tracing::debug!(
            provider = self.model.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "reply received ({} chars)",
            reply.len()
        );

        let mut history = self.history();
        if history.generation != generation {
            tracing::debug!("history was reset while the request was in flight, reply not recorded");
        } else if !reply.trim().is_empty() {
            history.turns.push(Turn::new(Role::Assistant, reply.clone()));
        }
        Ok(reply)
    }

    /// Replaces the instructions and drops all turns. An in-flight request is
    /// not cancelled.
    pub fn reset_session(&self, persona: &Persona) {
        let mut history = self.history();
        history.instructions = persona.instructions();
        history.turns.clear();
        history.generation += 1;
    }

    pub fn clear_history(&self) {
        let mut history = self.history();
        history.turns.clear();
        history.generation += 1;
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.history().turns.clone()
    }

    pub fn turn_count(&self) -> usize {
        self.history().turns.len()
    }

    pub fn instructions(&self) -> String {
        self.history().instructions.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;
    use std::sync::Arc;
    use tokio::sync::Notify;

    fn persona(name: &str) -> Persona {
        Persona {
            name: name.to_string(),
            ..Persona::default()
        }
    }

    #[tokio::test]
    async fn send_message_records_both_turns() {
        let mut model = MockLanguageModel::new();
        model.expect_name().return_const("mock");
        model
            .expect_complete()
            .withf(|instructions, turns| {
                instructions.contains("Name: Alice")
                    && turns.len() == 1
                    && turns[0].role == Role::User
                    && turns[0].text == "hello there"
            })
            .times(1)
            .returning(|_, _| Ok("Hi! [smiles]".to_string()));

        let dialogue = DialogueService::new(Box::new(model), &persona("Alice"));
        let reply = dialogue.send_message("  hello there ").await.unwrap();

        assert_eq!(reply, "Hi! [smiles]");
        let turns = dialogue.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, Role::Assistant);
        assert_eq!(turns[1].text, "Hi! [smiles]");
    }

    #[tokio::test]
    async fn whitespace_never_becomes_a_turn() {
        let mut model = MockLanguageModel::new();
        model.expect_complete().never();

        let dialogue = DialogueService::new(Box::new(model), &Persona::default());
        assert!(matches!(
            dialogue.send_message(" \n\t").await,
            Err(Error::EmptyMessage)
        ));
        assert_eq!(dialogue.turn_count(), 0);
    }

    #[tokio::test]
    async fn failed_request_keeps_the_user_turn() {
        let mut model = MockLanguageModel::new();
        model.expect_name().return_const("mock");
        let mut seq = Sequence::new();
        model
            .expect_complete()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(Error::provider_status(503, "overloaded")));
        model
            .expect_complete()
            .withf(|_, turns| turns.len() == 2 && turns.iter().all(|t| t.role == Role::User))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("sorry, what?".to_string()));

        let dialogue = DialogueService::new(Box::new(model), &Persona::default());
        let err = dialogue.send_message("first").await.unwrap_err();
        assert!(matches!(err, Error::Provider { status: Some(503), .. }));
        assert_eq!(dialogue.turn_count(), 1);

        dialogue.send_message("second").await.unwrap();
        assert_eq!(dialogue.turn_count(), 3);
    }

    #[tokio::test]
    async fn reset_switches_persona_and_empties_history() {
        let mut model = MockLanguageModel::new();
        model.expect_name().return_const("mock");
        let mut seq = Sequence::new();
        model
            .expect_complete()
            .withf(|instructions, _| instructions.contains("Name: Alice"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("hello from Alice".to_string()));
        model
            .expect_complete()
            .withf(|instructions, turns| {
                instructions.contains("Name: Bob")
                    && !instructions.contains("Alice")
                    && turns.len() == 1
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("hello from Bob".to_string()));

        let dialogue = DialogueService::new(Box::new(model), &Persona::default());
        dialogue.reset_session(&persona("Alice"));
        dialogue.send_message("hi").await.unwrap();
        dialogue.reset_session(&persona("Bob"));
        assert_eq!(dialogue.turn_count(), 0);

        assert_eq!(dialogue.send_message("hi").await.unwrap(), "hello from Bob");
    }

    #[tokio::test]
    async fn clear_history_keeps_instructions() {
        let mut model = MockLanguageModel::new();
        model.expect_name().return_const("mock");
        model
            .expect_complete()
            .returning(|_, _| Ok("ok".to_string()));

        let dialogue = DialogueService::new(Box::new(model), &persona("Alice"));
        let before = dialogue.instructions();
        dialogue.send_message("hi").await.unwrap();
        dialogue.clear_history();

        assert_eq!(dialogue.turn_count(), 0);
        assert_eq!(dialogue.instructions(), before);
    }

    struct BlockingModel {
        release: Arc<Notify>,
    }

    #[async_trait]
    impl LanguageModel for BlockingModel {
        fn name(&self) -> &'static str {
            "blocking"
        }

        async fn complete(&self, _instructions: &str, _turns: &[Turn]) -> Result<String> {
            self.release.notified().await;
            Ok("late reply".to_string())
        }
    }

    #[tokio::test]
    async fn reply_to_a_reset_history_is_not_recorded() {
        let release = Arc::new(Notify::new());
        let dialogue = Arc::new(DialogueService::new(
            Box::new(BlockingModel {
                release: release.clone(),
            }),
            &Persona::default(),
        ));

        let pending = tokio::spawn({
            let dialogue = dialogue.clone();
            async move { dialogue.send_message("hello").await }
        });
        while dialogue.turn_count() == 0 {
            tokio::task::yield_now().await;
        }

        dialogue.reset_session(&persona("Bob"));
        release.notify_one();

        assert_eq!(pending.await.unwrap().unwrap(), "late reply");
        assert_eq!(dialogue.turn_count(), 0);
    }
}
