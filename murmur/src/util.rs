//! Small helpers shared by the actors.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use pin_project::pin_project;

/// A slot in a `select!` loop which only sometimes holds a future.
///
/// An idle slot never resolves, so the branch is effectively disabled until a future is
/// armed.  Used for the batch tick of the worker and pending authentication signatures.
#[derive(Debug)]
#[pin_project(project = SlotProj, project_replace = SlotReplace)]
pub(crate) enum MaybeFuture<T> {
    Armed(#[pin] T),
    Idle,
}

impl<T> MaybeFuture<T> {
    pub(crate) fn idle() -> Self {
        Self::Idle
    }

    /// Replaces whatever the slot held with `fut`.
    pub(crate) fn arm(self: Pin<&mut Self>, fut: T) {
        self.project_replace(Self::Armed(fut));
    }

    /// Drops the held future, if any.
    pub(crate) fn disarm(self: Pin<&mut Self>) {
        self.project_replace(Self::Idle);
    }

    pub(crate) fn is_armed(&self) -> bool {
        matches!(self, Self::Armed(_))
    }
}

impl<T: Future> Future for MaybeFuture<T> {
    type Output = T::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            SlotProj::Armed(fut) => fut.poll(cx),
            SlotProj::Idle => Poll::Pending,
        }
    }
}
