//! Turn-taking state machine
//!
//! Exactly one state is active per session. The coordinator drives every
//! transition except the barge-in pair (`interrupt` / `finish_interrupt`),
//! which belongs to the transport.

use crate::{ParleyError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    #[default]
    Idle,
    CapturingUserAudio,
    Transcribing,
    GeneratingReply,
    SynthesizingSpeech,
    GeneratingImage,
    Interrupted,
}

impl TurnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::CapturingUserAudio => "capturing_user_audio",
            TurnState::Transcribing => "transcribing",
            TurnState::GeneratingReply => "generating_reply",
            TurnState::SynthesizingSpeech => "synthesizing_speech",
            TurnState::GeneratingImage => "generating_image",
            TurnState::Interrupted => "interrupted",
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == TurnState::Idle
    }

    /// Transitions the coordinator may take. Anything may go to `Interrupted`;
    /// leaving `Interrupted` is reserved for [`TurnStateMachine::finish_interrupt`].
    fn can_advance_to(self, to: TurnState) -> bool {
        use TurnState::*;
        match (self, to) {
            (Interrupted, _) => false,
            (_, Interrupted) => true,
            (from, to) if from == to => true,
            (Idle, CapturingUserAudio | Transcribing | GeneratingReply) => true,
            (CapturingUserAudio, Transcribing | Idle) => true,
            (Transcribing, GeneratingReply | Idle) => true,
            (GeneratingReply, SynthesizingSpeech | GeneratingImage | Idle) => true,
            (GeneratingImage, SynthesizingSpeech | Idle) => true,
            (SynthesizingSpeech, Idle) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type SharedTurnState = Arc<Mutex<TurnStateMachine>>;

#[derive(Debug, Default)]
pub struct TurnStateMachine {
    state: TurnState,
}

impl TurnStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedTurnState {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Move to `to`. Returns whether the state changed.
    pub fn advance(&mut self, to: TurnState) -> Result<bool> {
        if !self.state.can_advance_to(to) {
            return Err(ParleyError::InvalidTransition(format!("{} -> {}", self.state, to)));
        }
        let changed = self.state != to;
        self.state = to;
        Ok(changed)
    }

    /// Barge-in. Returns false when already idle or interrupted.
    pub fn interrupt(&mut self) -> bool {
        if matches!(self.state, TurnState::Idle | TurnState::Interrupted) {
            return false;
        }
        self.state = TurnState::Interrupted;
        true
    }

    /// Leave `Interrupted` once cancellation cleanup is done
    pub fn finish_interrupt(&mut self) -> bool {
        if self.state != TurnState::Interrupted {
            return false;
        }
        self.state = TurnState::Idle;
        true
    }

    /// Force back to idle after an error, from wherever the turn stopped
    pub fn reset(&mut self) -> bool {
        let changed = self.state != TurnState::Idle;
        self.state = TurnState::Idle;
        changed
    }
}
