//! Scripted transport doubles for loop and strategy tests.

use std::cell::RefCell;
use std::collections::VecDeque;

use tokio_util::sync::CancellationToken;

use crate::application::ports::{
    BufferClaim, ExclusivePublication, FragmentHeader, OfferRejection, PollError,
    SharedPublication, Subscription,
};

#[derive(Debug, Default)]
struct PublicationState {
    script: VecDeque<Option<OfferRejection>>,
    sent: Vec<Vec<u8>>,
    attempts: usize,
    aborted: usize,
    cancel_after: Option<(usize, CancellationToken)>,
}

/// Publication that replays a script of outcomes, then accepts everything.
///
/// `None` in the script means "accept this attempt".
#[derive(Debug, Default)]
pub struct ScriptedPublication {
    state: RefCell<PublicationState>,
}

impl ScriptedPublication {
    pub fn with_script(script: impl IntoIterator<Item = Option<OfferRejection>>) -> Self {
        let publication = Self::default();
        publication.state.borrow_mut().script = script.into_iter().collect();
        publication
    }

    /// Cancel `token` once `attempts` attempts have been made.
    pub fn cancel_after(self, attempts: usize, token: CancellationToken) -> Self {
        self.state.borrow_mut().cancel_after = Some((attempts, token));
        self
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.state.borrow().sent.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.borrow().attempts
    }

    pub fn aborted(&self) -> usize {
        self.state.borrow().aborted
    }

    fn attempt(&self) -> Result<(), OfferRejection> {
        let mut state = self.state.borrow_mut();
        state.attempts += 1;
        if let Some((after, token)) = &state.cancel_after
            && state.attempts >= *after
        {
            token.cancel();
        }
        state.script.pop_front().flatten().map_or(Ok(()), Err)
    }

    fn push(&self, bytes: Vec<u8>) -> i64 {
        let mut state = self.state.borrow_mut();
        state.sent.push(bytes);
        i64::try_from(state.sent.len()).unwrap()
    }
}

pub struct ScriptedClaim<'a> {
    owner: &'a ScriptedPublication,
    buffer: Vec<u8>,
    committed: bool,
}

impl BufferClaim for ScriptedClaim<'_> {
    fn buffer(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    fn commit(mut self) -> i64 {
        self.committed = true;
        let bytes = std::mem::take(&mut self.buffer);
        self.owner.push(bytes)
    }
}

impl Drop for ScriptedClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.owner.state.borrow_mut().aborted += 1;
        }
    }
}

impl ExclusivePublication for ScriptedPublication {
    type Claim<'a> = ScriptedClaim<'a>;

    fn try_claim(&mut self, length: usize) -> Result<Self::Claim<'_>, OfferRejection> {
        self.attempt()?;
        Ok(ScriptedClaim {
            owner: self,
            buffer: vec![0; length],
            committed: false,
        })
    }

    fn max_payload_length(&self) -> usize {
        1408
    }

    fn session_id(&self) -> i32 {
        7
    }
}

impl SharedPublication for ScriptedPublication {
    fn offer(&self, message: &[u8]) -> Result<i64, OfferRejection> {
        self.attempt()?;
        Ok(self.push(message.to_vec()))
    }

    fn session_id(&self) -> i32 {
        7
    }
}

/// One scripted poll result.
pub enum PollStep {
    Fragments(Vec<(FragmentHeader, Vec<u8>)>),
    Fail(PollError),
}

/// Subscription that replays scripted poll results.
///
/// Once drained it returns empty polls and cancels the optional token.
#[derive(Default)]
pub struct ScriptedSubscription {
    steps: VecDeque<PollStep>,
    on_drained: Option<CancellationToken>,
    pub polls: usize,
}

impl ScriptedSubscription {
    pub fn new(steps: impl IntoIterator<Item = PollStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn cancel_when_drained(mut self, token: CancellationToken) -> Self {
        self.on_drained = Some(token);
        self
    }
}

impl Subscription for ScriptedSubscription {
    fn poll<F>(&mut self, mut handler: F, fragment_limit: usize) -> Result<usize, PollError>
    where
        F: FnMut(&FragmentHeader, &[u8]),
    {
        self.polls += 1;
        match self.steps.pop_front() {
            Some(PollStep::Fragments(fragments)) => {
                assert!(fragments.len() <= fragment_limit, "script exceeds fragment limit");
                for (header, bytes) in &fragments {
                    handler(header, bytes);
                }
                Ok(fragments.len())
            }
            Some(PollStep::Fail(err)) => Err(err),
            None => {
                if let Some(token) = &self.on_drained {
                    token.cancel();
                }
                Ok(0)
            }
        }
    }
}
