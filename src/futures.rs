use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::_typed_codec::Codec;
use crate::{Action, CtxInner, Event, OrchestrationContext};

/// Result of a resolved `DurableFuture`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableOutput {
    Activity(Result<String, String>),
    Timer,
    External(String),
}

/// A history-backed future. Scheduling is recorded on first poll;
/// resolution comes only from completion events already in history.
pub struct DurableFuture(pub(crate) Kind);

pub(crate) enum Kind {
    Activity {
        id: u64,
        name: String,
        input: String,
        ctx: OrchestrationContext,
    },
    Timer {
        id: u64,
        fire_at_ms: u64,
        ctx: OrchestrationContext,
    },
    External {
        id: u64,
        name: String,
        ctx: OrchestrationContext,
    },
}

impl DurableFuture {
    /// Correlation id shared by the scheduling event and its completion.
    pub fn correlation_id(&self) -> u64 {
        match &self.0 {
            Kind::Activity { id, .. } | Kind::Timer { id, .. } | Kind::External { id, .. } => *id,
        }
    }

    fn ctx(&self) -> &OrchestrationContext {
        match &self.0 {
            Kind::Activity { ctx, .. } | Kind::Timer { ctx, .. } | Kind::External { ctx, .. } => ctx,
        }
    }

    /// Record the scheduling event and its action unless history already has it.
    pub(crate) fn ensure_scheduled(&self, inner: &mut CtxInner) {
        match &self.0 {
            Kind::Activity { id, name, input, .. } => {
                let exists = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ActivityScheduled { id: cid, .. } if cid == id));
                if !exists {
                    inner.history.push(Event::ActivityScheduled {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                    inner.record_action(Action::CallActivity {
                        id: *id,
                        name: name.clone(),
                        input: input.clone(),
                    });
                }
            }
            Kind::Timer { id, fire_at_ms, .. } => {
                let exists = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::TimerCreated { id: cid, .. } if cid == id));
                if !exists {
                    inner.history.push(Event::TimerCreated {
                        id: *id,
                        fire_at_ms: *fire_at_ms,
                    });
                    inner.record_action(Action::CreateTimer {
                        id: *id,
                        fire_at_ms: *fire_at_ms,
                    });
                }
            }
            Kind::External { id, name, .. } => {
                let exists = inner
                    .history
                    .iter()
                    .any(|e| matches!(e, Event::ExternalSubscribed { id: cid, .. } if cid == id));
                if !exists {
                    inner.history.push(Event::ExternalSubscribed {
                        id: *id,
                        name: name.clone(),
                    });
                    inner.record_action(Action::WaitExternal {
                        id: *id,
                        name: name.clone(),
                    });
                }
            }
        }
    }

    /// History position of the event that would resolve this future, if any.
    pub(crate) fn completion_index(&self, inner: &CtxInner) -> Option<usize> {
        match &self.0 {
            Kind::Activity { id, .. } => inner.history.iter().position(|e| {
                matches!(e, Event::ActivityCompleted { id: cid, .. } | Event::ActivityFailed { id: cid, .. } if cid == id)
            }),
            Kind::Timer { id, .. } => {
                if inner.cancelled_ids.contains(id) {
                    return None;
                }
                inner
                    .history
                    .iter()
                    .position(|e| matches!(e, Event::TimerFired { id: cid, .. } if cid == id))
            }
            Kind::External { id, name, .. } => {
                if inner.cancelled_ids.contains(id) {
                    return None;
                }
                inner.first_unconsumed_external(name)
            }
        }
    }

    /// Consume the completion at `idx` and produce this future's output.
    pub(crate) fn take_output(&self, inner: &mut CtxInner, idx: usize) -> DurableOutput {
        inner.observe(idx);
        match (&self.0, &inner.history[idx]) {
            (Kind::Activity { .. }, Event::ActivityCompleted { result, .. }) => DurableOutput::Activity(Ok(result.clone())),
            (Kind::Activity { .. }, Event::ActivityFailed { error, .. }) => DurableOutput::Activity(Err(error.clone())),
            (Kind::External { .. }, Event::ExternalEvent { data, .. }) => {
                let data = data.clone();
                inner.consumed_externals.insert(idx);
                DurableOutput::External(data)
            }
            _ => DurableOutput::Timer,
        }
    }

    /// Abandon this future after losing a select. Timers that have not
    /// fired are cancelled; waits release their claim on buffered events.
    pub(crate) fn cancel(&self, inner: &mut CtxInner) {
        let id = self.correlation_id();
        inner.cancelled_ids.insert(id);
        if let Kind::Timer { .. } = &self.0 {
            let settled = inner.history.iter().any(|e| {
                matches!(e, Event::TimerFired { id: cid, .. } | Event::TimerCancelled { id: cid } if *cid == id)
            });
            if !settled {
                inner.history.push(Event::TimerCancelled { id });
                inner.record_action(Action::CancelTimer { id });
            }
        }
    }

    /// Await an activity result as a raw String.
    pub fn into_activity(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::Activity(v)) => Poll::Ready(v),
                    Poll::Ready(other) => Poll::Ready(Err(format!("into_activity used on non-activity future: {other:?}"))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Await an activity result decoded to a typed value.
    pub async fn into_activity_typed<Out: serde::de::DeserializeOwned>(self) -> Result<Out, String> {
        let s = self.into_activity().await?;
        crate::_typed_codec::Json::decode::<Out>(&s)
    }

    /// Resolve when the correlated timer fires.
    pub fn into_timer(self) -> impl Future<Output = Result<(), String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<(), String>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::Timer) => Poll::Ready(Ok(())),
                    Poll::Ready(other) => Poll::Ready(Err(format!("into_timer used on non-timer future: {other:?}"))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }

    /// Resolve with the payload of the next matching external event.
    pub fn into_event(self) -> impl Future<Output = Result<String, String>> {
        struct Map(DurableFuture);
        impl Future for Map {
            type Output = Result<String, String>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut self.0).poll(cx) {
                    Poll::Ready(DurableOutput::External(v)) => Poll::Ready(Ok(v)),
                    Poll::Ready(other) => Poll::Ready(Err(format!("into_event used on non-external future: {other:?}"))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
        Map(self)
    }
}

impl Future for DurableFuture {
    type Output = DurableOutput;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx().lock();
        this.ensure_scheduled(&mut inner);
        match this.completion_index(&inner) {
            Some(idx) => Poll::Ready(this.take_output(&mut inner, idx)),
            None => Poll::Pending,
        }
    }
}

/// Deterministic select: among children whose completion is in history,
/// the one whose completion appears first wins. Ties go to the lower
/// child index. Every other child is cancelled.
pub struct SelectFuture {
    ctx: OrchestrationContext,
    children: Vec<DurableFuture>,
}

impl SelectFuture {
    pub(crate) fn new(ctx: OrchestrationContext, children: Vec<DurableFuture>) -> Self {
        Self { ctx, children }
    }
}

impl Future for SelectFuture {
    type Output = (usize, DurableOutput);

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.ctx.lock();
        // Every child records its scheduling event, winner or not
        for child in &this.children {
            child.ensure_scheduled(&mut inner);
        }
        let winner = this
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, child)| child.completion_index(&inner).map(|h| (h, i)))
            .min();
        let Some((hidx, winner_idx)) = winner else {
            return Poll::Pending;
        };
        let output = this.children[winner_idx].take_output(&mut inner, hidx);
        for (i, child) in this.children.iter().enumerate() {
            if i != winner_idx {
                child.cancel(&mut inner);
            }
        }
        Poll::Ready((winner_idx, output))
    }
}
