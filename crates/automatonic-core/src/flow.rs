//! Cooperative coroutine runner.
//!
//! A [`Coroutine`] is resumed with the outcome of the previous step and hands
//! back either a future to await or its final value. [`run`] drives one to
//! completion, so a multi-step flow reads as straight-line code inside
//! `resume` without manual chaining.

use std::{future::Future, marker::PhantomData};

use futures::{FutureExt, future::BoxFuture};

use crate::error::CommandError;

/// Message of the error raised when a coroutine yields a plain value.
pub const YIELD_TYPE_ERROR: &str = "only future-like values may be yielded";

/// What a coroutine is resumed with.
#[derive(Debug)]
pub enum Resume<I> {
    /// First resumption.
    Start,
    /// The previously yielded future resolved.
    Value(I),
    /// The previously yielded future failed; the coroutine may recover.
    Error(CommandError),
}

/// A value handed out by a coroutine.
pub enum Yielded<I> {
    /// A future whose outcome is fed back into the coroutine.
    Future(BoxFuture<'static, Result<I, CommandError>>),
    /// A plain value. Not awaitable; the runner fails with a type error.
    Value(I),
}

impl<I> Yielded<I> {
    /// Box a future for yielding.
    pub fn future<F>(fut: F) -> Self
    where
        F: Future<Output = Result<I, CommandError>> + Send + 'static,
    {
        Self::Future(fut.boxed())
    }
}

/// Result of one resumption.
pub enum Step<I, O> {
    /// Suspend on a yielded value.
    Yield(Yielded<I>),
    /// Finish with the final value.
    Complete(O),
}

/// A resumable computation driven by [`run`].
pub trait Coroutine {
    /// Resolution type of yielded futures.
    type Input;
    /// Final value.
    type Output;

    /// Advance to the next suspension point.
    ///
    /// # Errors
    /// An error is an uncaught failure and ends the run.
    fn resume(
        &mut self,
        input: Resume<Self::Input>,
    ) -> Result<Step<Self::Input, Self::Output>, CommandError>;
}

/// Drive `coroutine` to completion.
///
/// # Errors
/// Fails with the coroutine's uncaught error, or with
/// [`CommandError::Type`] if it yields a plain value.
pub async fn run<C: Coroutine>(mut coroutine: C) -> Result<C::Output, CommandError> {
    let mut input = Resume::Start;
    loop {
        match coroutine.resume(input)? {
            Step::Complete(output) => return Ok(output),
            Step::Yield(Yielded::Value(_)) => {
                return Err(CommandError::Type(YIELD_TYPE_ERROR.to_string()));
            }
            Step::Yield(Yielded::Future(fut)) => {
                input = match fut.await {
                    Ok(value) => Resume::Value(value),
                    Err(err) => Resume::Error(err),
                };
            }
        }
    }
}

/// Coroutine that completes immediately with a value.
pub struct Ready<I, O> {
    value: Option<O>,
    _input: PhantomData<fn(I)>,
}

/// Wrap a plain value so [`run`] resolves with it immediately.
#[must_use]
pub const fn ready<I, O>(value: O) -> Ready<I, O> {
    Ready {
        value: Some(value),
        _input: PhantomData,
    }
}

impl<I, O> Coroutine for Ready<I, O> {
    type Input = I;
    type Output = O;

    fn resume(&mut self, _input: Resume<I>) -> Result<Step<I, O>, CommandError> {
        self.value
            .take()
            .map(Step::Complete)
            .ok_or_else(|| CommandError::Type("coroutine resumed after completion".to_string()))
    }
}

/// Coroutine backed by a closure.
pub struct FnCoroutine<F, I, O> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

/// Build a coroutine from a resume closure.
pub const fn from_fn<F, I, O>(f: F) -> FnCoroutine<F, I, O>
where
    F: FnMut(Resume<I>) -> Result<Step<I, O>, CommandError>,
{
    FnCoroutine {
        f,
        _types: PhantomData,
    }
}

impl<F, I, O> Coroutine for FnCoroutine<F, I, O>
where
    F: FnMut(Resume<I>) -> Result<Step<I, O>, CommandError>,
{
    type Input = I;
    type Output = O;

    fn resume(&mut self, input: Resume<I>) -> Result<Step<I, O>, CommandError> {
        (self.f)(input)
    }
}
