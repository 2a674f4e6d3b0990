//! Message-passing owner for a piece of application state.
//!
//! A `Dispatcher` runs the state machine in its own task. Actions arrive on
//! an `mpsc` channel, are applied in order, and every resulting state is
//! published on a `watch` channel.

use std::fmt::Debug;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

/// Actions waiting to be applied before senders are made to wait.
const ACTION_BUFFER: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("State dispatcher has stopped")]
    Closed,

    #[error("State dispatcher queue is full")]
    Full,
}

/// A state machine: a state type and the actions that move it.
pub trait Reducer: Clone + Send + Sync + 'static {
    type Action: Debug + Send + 'static;

    fn reduce(&mut self, action: Self::Action);
}

struct Envelope<S: Reducer> {
    action: S::Action,
    applied: Option<oneshot::Sender<S>>,
}

/// Handle to a running state machine. Clone is cheap.
pub struct Dispatcher<S: Reducer> {
    actions: mpsc::Sender<Envelope<S>>,
    state: watch::Receiver<S>,
}

impl<S: Reducer> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            actions: self.actions.clone(),
            state: self.state.clone(),
        }
    }
}

impl<S: Reducer> Dispatcher<S> {
    pub fn spawn(initial: S) -> Self {
        Self::spawn_with_effect(initial, |_: &S| {})
    }

    /// `effect` runs with each new state before it is published.
    pub fn spawn_with_effect(initial: S, mut effect: impl FnMut(&S) + Send + 'static) -> Self {
        let (actions, mut inbox) = mpsc::channel::<Envelope<S>>(ACTION_BUFFER);
        let (publish, state) = watch::channel(initial);

        tokio::spawn(async move {
            while let Some(Envelope { action, applied }) = inbox.recv().await {
                debug!(action = ?action, "Applying action");
                let mut next = publish.borrow().clone();
                next.reduce(action);
                effect(&next);
                publish.send_replace(next.clone());
                if let Some(applied) = applied {
                    let _ = applied.send(next);
                }
            }
        });

        Self { actions, state }
    }

    /// Apply `action` and return the state it produced.
    pub async fn dispatch(&self, action: S::Action) -> Result<S, StateError> {
        let (applied, done) = oneshot::channel();
        self.actions
            .send(Envelope {
                action,
                applied: Some(applied),
            })
            .await
            .map_err(|_| StateError::Closed)?;
        done.await.map_err(|_| StateError::Closed)
    }

    /// Queue `action` without waiting for it.
    pub fn send(&self, action: S::Action) -> Result<(), StateError> {
        self.actions
            .try_send(Envelope { action, applied: None })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => StateError::Full,
                mpsc::error::TrySendError::Closed(_) => StateError::Closed,
            })
    }

    pub fn state(&self) -> S {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<S> {
        self.state.clone()
    }
}
