//! # Worker Modules
//!
//! What a worker can run. A [`Module`] is a named set of functions; a
//! [`ModuleRegistry`] maps script names to modules. Requests address a
//! function as `(script, fn)`.
//!
//! A function is either a plain call that settles once, or a generator that
//! suspends at every yield and is resumed by later requests.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use parwire::RemoteError;
use serde_json::Value;

type CallFn = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
type StartFn = Arc<dyn Fn(Vec<Value>) -> anyhow::Result<Box<dyn Generator>> + Send + Sync>;

/// A function exported by a module.
#[derive(Clone)]
pub enum RemoteFn {
    Call(CallFn),
    Generator(StartFn),
}

/// Input that drives a suspended generator.
#[derive(Debug, Clone)]
pub enum Resume {
    /// Continue, handing `value` to the paused yield.
    Next(Value),
    /// Finish early with `value` as the return value.
    Return(Value),
    /// Raise `error` at the paused yield.
    Throw(RemoteError),
}

/// What a generator produced for one `resume`.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Yield(Value),
    Complete(Value),
}

/// A resumable computation living on a worker.
///
/// # invariants
/// - After returning `Step::Complete` or an error, the generator is not resumed again.
#[async_trait::async_trait]
pub trait Generator: Send {
    async fn resume(&mut self, input: Resume) -> anyhow::Result<Step>;
}

/// Turns an iterator into a generator that returns `output` once exhausted.
pub struct IterGenerator<I> {
    iter: Option<I>,
    output: Value,
}

impl<I> IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    pub fn new(iter: I, output: Value) -> Self {
        Self { iter: Some(iter), output }
    }
}

#[async_trait::async_trait]
impl<I> Generator for IterGenerator<I>
where
    I: Iterator<Item = Value> + Send,
{
    async fn resume(&mut self, input: Resume) -> anyhow::Result<Step> {
        match input {
            Resume::Next(_) => match self.iter.as_mut().and_then(Iterator::next) {
                Some(value) => Ok(Step::Yield(value)),
                None => {
                    self.iter = None;
                    Ok(Step::Complete(self.output.take()))
                }
            },
            Resume::Return(value) => {
                self.iter = None;
                Ok(Step::Complete(value))
            }
            Resume::Throw(err) => {
                self.iter = None;
                Err(err.into())
            }
        }
    }
}

/// Turns a fallible stream into a generator that returns `output` once exhausted.
pub struct StreamGenerator {
    stream: Option<BoxStream<'static, anyhow::Result<Value>>>,
    output: Value,
}

impl StreamGenerator {
    pub fn new<S>(stream: S, output: Value) -> Self
    where
        S: futures::Stream<Item = anyhow::Result<Value>> + Send + 'static,
    {
        Self { stream: Some(stream.boxed()), output }
    }
}

#[async_trait::async_trait]
impl Generator for StreamGenerator {
    async fn resume(&mut self, input: Resume) -> anyhow::Result<Step> {
        match input {
            Resume::Next(_) => {
                let next = match self.stream.as_mut() {
                    Some(stream) => stream.next().await,
                    None => None,
                };
                match next {
                    Some(Ok(value)) => Ok(Step::Yield(value)),
                    Some(Err(err)) => {
                        self.stream = None;
                        Err(err)
                    }
                    None => {
                        self.stream = None;
                        Ok(Step::Complete(self.output.take()))
                    }
                }
            }
            Resume::Return(value) => {
                self.stream = None;
                Ok(Step::Complete(value))
            }
            Resume::Throw(err) => {
                self.stream = None;
                Err(err.into())
            }
        }
    }
}

/// A named set of functions, built fluently.
#[derive(Clone, Default)]
pub struct Module {
    functions: HashMap<String, RemoteFn>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports an async function.
    pub fn function<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let call: CallFn = Arc::new(move |args| Box::pin(f(args)));
        self.functions.insert(name.into(), RemoteFn::Call(call));
        self
    }

    /// Exports a blocking function. It runs on the worker's thread.
    pub fn function_sync<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let call: CallFn = Arc::new(move |args| {
            let f = Arc::clone(&f);
            Box::pin(async move { f(args) })
        });
        self.functions.insert(name.into(), RemoteFn::Call(call));
        self
    }

    /// Exports a generator. `start` builds a fresh generator for every call.
    pub fn generator<F, G>(mut self, name: impl Into<String>, start: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<G> + Send + Sync + 'static,
        G: Generator + 'static,
    {
        let start: StartFn = Arc::new(move |args| Ok(Box::new(start(args)?) as Box<dyn Generator>));
        self.functions.insert(name.into(), RemoteFn::Generator(start));
        self
    }

    pub fn get(&self, name: &str) -> Option<&RemoteFn> {
        self.functions.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }
}

/// Maps script names to modules.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Module>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, script: impl Into<String>, module: Module) -> Self {
        self.modules.insert(script.into(), module);
        self
    }

    pub fn contains(&self, script: &str) -> bool {
        self.modules.contains_key(script)
    }

    /// Finds `function` in `script`, failing with a `ReferenceError` the caller can see.
    pub fn resolve(&self, script: &str, function: &str) -> Result<RemoteFn, RemoteError> {
        let module = self
            .modules
            .get(script)
            .ok_or_else(|| RemoteError::reference(format!("module '{}' is not registered", script)))?;

        module
            .get(function)
            .cloned()
            .ok_or_else(|| RemoteError::reference(format!("'{}' is not a function exported by '{}'", function, script)))
    }
}
