//! Auto-responder: answers routine confirmations with the profile's reply
//! keys, injected through the input mux so they interleave correctly with
//! user typing. Dangerous confirmations are always left to the human.

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::matcher::{AgentState, Transition};

pub struct AutoResponder {
    enabled: bool,
    reply_keys: Vec<u8>,
    inject_tx: mpsc::Sender<Vec<u8>>,
}

impl AutoResponder {
    pub fn new(enabled: bool, reply_keys: &str, inject_tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            enabled,
            reply_keys: reply_keys.as_bytes().to_vec(),
            inject_tx,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// React to a match-engine transition. Returns `true` when a reply was
    /// injected (the caller then records the reply with the engine).
    pub async fn on_transition(&self, transition: Transition) -> Result<bool> {
        match transition.to {
            AgentState::AwaitingConfirm if self.enabled => {
                info!("confirmation detected, sending reply keys");
                self.inject_tx
                    .send(self.reply_keys.clone())
                    .await
                    .map_err(|_| anyhow::anyhow!("inject channel closed"))?;
                Ok(true)
            }
            AgentState::AwaitingConfirm => {
                debug!("confirmation detected but auto-yes is off");
                Ok(false)
            }
            AgentState::AwaitingDangerous => {
                info!("dangerous confirmation detected, waiting for the user");
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(to: AgentState) -> Transition {
        Transition {
            from: AgentState::Ready,
            to,
        }
    }

    #[tokio::test]
    async fn test_replies_to_confirmation() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = AutoResponder::new(true, "\n", tx);

        let injected = responder
            .on_transition(transition(AgentState::AwaitingConfirm))
            .await
            .unwrap();
        assert!(injected);
        assert_eq!(rx.try_recv().unwrap(), b"\n");
    }

    #[tokio::test]
    async fn test_never_replies_to_dangerous() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = AutoResponder::new(true, "\n", tx);

        let injected = responder
            .on_transition(transition(AgentState::AwaitingDangerous))
            .await
            .unwrap();
        assert!(!injected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_responder_stays_silent() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = AutoResponder::new(false, "\n", tx);

        let injected = responder
            .on_transition(transition(AgentState::AwaitingConfirm))
            .await
            .unwrap();
        assert!(!injected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ignores_other_transitions() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = AutoResponder::new(true, "\n", tx);

        for state in [AgentState::Ready, AgentState::Working, AgentState::Terminated] {
            assert!(!responder.on_transition(transition(state)).await.unwrap());
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_custom_reply_keys() {
        let (tx, mut rx) = mpsc::channel(4);
        let responder = AutoResponder::new(true, "1\n", tx);

        responder
            .on_transition(transition(AgentState::AwaitingConfirm))
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), b"1\n");
    }
}
