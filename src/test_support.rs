//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::future::ready;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, mpsc};

use crate::cluster::{
    Cluster, ClusterError, ClusterFuture, ObjectRef, Propagation, Subscription, WatchEvent,
};
use crate::resources::{Resource, to_wire};
use crate::steps::{CommandOutput, CommandRunner, ProvisionError};
use crate::tunnel::{Dialer, TcpDialer};
use crate::ui::Ui;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cluster verb recorded by [`FakeCluster`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Verb {
    /// `create`
    Create,
    /// `get`
    Get,
    /// `list`
    List,
    /// `delete`
    Delete,
    /// `watch`
    Watch,
    /// VM `stop` subresource.
    Stop,
    /// Pod `portforward` subresource.
    PortForward,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::Get => "get",
            Self::List => "list",
            Self::Delete => "delete",
            Self::Watch => "watch",
            Self::Stop => "stop",
            Self::PortForward => "portforward",
        })
    }
}

/// One call made against [`FakeCluster`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Operation {
    /// Verb used.
    pub verb: Verb,
    /// Kind addressed.
    pub kind: &'static str,
    /// `namespace/name`, or the label selector for lists.
    pub target: String,
    /// Propagation policy of deletes.
    pub propagation: Option<Propagation>,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.verb, self.kind, self.target)
    }
}

type Key = (&'static str, Option<String>, String);

fn key_for<R: Resource>(target: &ObjectRef) -> Key {
    (R::KIND, target.namespace.clone(), target.name.clone())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum EventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug)]
struct ScriptedWatch {
    events: Vec<Result<(EventKind, Value), ClusterError>>,
    close: bool,
}

#[derive(Debug, Default)]
struct FakeState {
    objects: BTreeMap<Key, Value>,
    operations: Vec<Operation>,
    failures: Vec<(Verb, &'static str, ClusterError)>,
    watches: BTreeMap<Key, ScriptedWatch>,
    lingering_kinds: Vec<(&'static str, usize)>,
    finalizing: BTreeMap<Key, usize>,
    next_uid: u64,
}

impl FakeState {
    fn record(&mut self, verb: Verb, kind: &'static str, target: String) -> Result<(), ClusterError> {
        self.operations.push(Operation {
            verb,
            kind,
            target,
            propagation: None,
        });
        self.failures
            .iter()
            .position(|(failing_verb, failing_kind, _)| *failing_verb == verb && *failing_kind == kind)
            .map_or(Ok(()), |index| Err(self.failures.remove(index).2))
    }

    /// Counts one call against an object held by a finalizer, removing it
    /// once its remaining calls are used up.
    fn touch(&mut self, key: &Key) {
        let Some(remaining) = self.finalizing.get_mut(key) else {
            return;
        };
        if *remaining == 0 {
            self.finalizing.remove(key);
            self.objects.remove(key);
        } else {
            *remaining -= 1;
        }
    }

    fn store<R: Resource>(&mut self, resource: &R) -> Result<Value, ClusterError> {
        let mut value = to_wire(resource).map_err(|err| ClusterError::Decode {
            kind: R::KIND,
            message: err.to_string(),
        })?;
        self.next_uid += 1;
        let uid = format!("uid-{}", self.next_uid);
        if let Some(metadata) = value.get_mut("metadata").and_then(Value::as_object_mut) {
            metadata
                .entry("uid")
                .or_insert_with(|| Value::String(uid));
        }
        self.objects
            .insert(key_for::<R>(&ObjectRef::of(resource)), value.clone());
        Ok(value)
    }
}

fn decode<R: Resource>(value: Value) -> Result<R, ClusterError> {
    serde_json::from_value(value).map_err(|err| ClusterError::Decode {
        kind: R::KIND,
        message: err.to_string(),
    })
}

fn encode<R: Resource>(resource: &R) -> Value {
    to_wire(resource).unwrap_or(Value::Null)
}

fn matches_selector(value: &Value, selector: &str) -> bool {
    let labels = value
        .get("metadata")
        .and_then(|metadata| metadata.get("labels"));
    selector
        .split(',')
        .filter(|term| !term.trim().is_empty())
        .all(|term| {
            term.split_once('=').is_some_and(|(key, expected)| {
                labels
                    .and_then(|map| map.get(key.trim()))
                    .and_then(Value::as_str)
                    == Some(expected.trim())
            })
        })
}

/// In-memory [`Cluster`] with an operation log, one-shot failure injection,
/// and scripted watch streams.
///
/// Watches without a script replay the stored object as `Added` and then
/// stay open, like a real watch on an object that does not change.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCluster {
    /// Creates an empty cluster.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `resource` without logging an operation.
    pub fn insert<R: Resource>(&self, resource: &R) {
        lock(&self.state).store(resource).ok();
    }

    /// Stored object, if any.
    #[must_use]
    pub fn object<R: Resource>(&self, target: &ObjectRef) -> Option<R> {
        let value = lock(&self.state).objects.get(&key_for::<R>(target)).cloned()?;
        decode(value).ok()
    }

    /// Every stored object of kind `R`.
    #[must_use]
    pub fn objects<R: Resource>(&self) -> Vec<R> {
        lock(&self.state)
            .objects
            .iter()
            .filter(|((kind, _, _), _)| *kind == R::KIND)
            .filter_map(|(_, value)| decode(value.clone()).ok())
            .collect()
    }

    /// Calls made so far, rendered as `verb Kind namespace/name`.
    #[must_use]
    pub fn operations(&self) -> Vec<String> {
        lock(&self.state)
            .operations
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    /// Calls made so far.
    #[must_use]
    pub fn operation_log(&self) -> Vec<Operation> {
        lock(&self.state).operations.clone()
    }

    /// Keeps the next deleted object of `kind` visible for `calls` further
    /// `get` or `create` calls, like an owner waiting on a foreground
    /// deletion finalizer.
    pub fn linger_next_delete(&self, kind: &'static str, calls: usize) {
        lock(&self.state).lingering_kinds.push((kind, calls));
    }

    /// Makes the next `verb` on `kind` fail with `error`.
    pub fn fail_next(&self, verb: Verb, kind: &'static str, error: ClusterError) {
        lock(&self.state).failures.push((verb, kind, error));
    }

    /// Scripts the next watch on `target`; the stream stays open afterwards.
    pub fn script_watch<R: Resource>(&self, target: &ObjectRef, events: Vec<WatchEvent<R>>) {
        self.script::<R>(target, events, false);
    }

    /// Scripts the next watch on `target`; the stream ends afterwards.
    pub fn script_closing_watch<R: Resource>(
        &self,
        target: &ObjectRef,
        events: Vec<WatchEvent<R>>,
    ) {
        self.script::<R>(target, events, true);
    }

    /// Makes the next watch on `target` deliver `error`.
    pub fn script_watch_error<R: Resource>(&self, target: &ObjectRef, error: ClusterError) {
        lock(&self.state).watches.insert(
            key_for::<R>(target),
            ScriptedWatch {
                events: vec![Err(error)],
                close: false,
            },
        );
    }

    fn script<R: Resource>(&self, target: &ObjectRef, events: Vec<WatchEvent<R>>, close: bool) {
        let events = events
            .into_iter()
            .map(|event| {
                let kind = match &event {
                    WatchEvent::Added(_) => EventKind::Added,
                    WatchEvent::Modified(_) => EventKind::Modified,
                    WatchEvent::Deleted(_) => EventKind::Deleted,
                };
                Ok((kind, encode(event.object())))
            })
            .collect();
        lock(&self.state)
            .watches
            .insert(key_for::<R>(target), ScriptedWatch { events, close });
    }

    fn open_watch<R: Resource>(
        &self,
        target: &ObjectRef,
    ) -> Result<Subscription<R>, ClusterError> {
        let script = {
            let mut state = lock(&self.state);
            state.record(Verb::Watch, R::KIND, target.to_string())?;
            let key = key_for::<R>(target);
            state.watches.remove(&key).unwrap_or_else(|| ScriptedWatch {
                events: state
                    .objects
                    .get(&key)
                    .map(|value| Ok((EventKind::Added, value.clone())))
                    .into_iter()
                    .collect(),
                close: false,
            })
        };

        let (tx, rx) = mpsc::channel(script.events.len() + 1);
        for scripted in script.events {
            let event = scripted.and_then(|(kind, value)| {
                let object = decode::<R>(value)?;
                Ok(match kind {
                    EventKind::Added => WatchEvent::Added(object),
                    EventKind::Modified => WatchEvent::Modified(object),
                    EventKind::Deleted => WatchEvent::Deleted(object),
                })
            });
            tx.try_send(event).ok();
        }

        if script.close {
            return Ok(Subscription::new(rx, None));
        }
        let holder = tokio::spawn(async move {
            tx.closed().await;
        });
        Ok(Subscription::new(rx, Some(holder)))
    }
}

impl Cluster for FakeCluster {
    fn create<'a, R: Resource>(&'a self, resource: &'a R) -> ClusterFuture<'a, R> {
        let target = ObjectRef::of(resource);
        let result = (|| {
            let mut state = lock(&self.state);
            state.record(Verb::Create, R::KIND, target.to_string())?;
            let key = key_for::<R>(&target);
            state.touch(&key);
            if state.objects.contains_key(&key) {
                return Err(ClusterError::AlreadyExists {
                    kind: R::KIND,
                    target: target.to_string(),
                });
            }
            state.store(resource)
        })()
        .and_then(decode::<R>);
        Box::pin(ready(result))
    }

    fn get<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, R> {
        let result = (|| {
            let mut state = lock(&self.state);
            state.record(Verb::Get, R::KIND, target.to_string())?;
            let key = key_for::<R>(target);
            state.touch(&key);
            state
                .objects
                .get(&key)
                .cloned()
                .ok_or_else(|| ClusterError::NotFound {
                    kind: R::KIND,
                    target: target.to_string(),
                })
        })()
        .and_then(decode::<R>);
        Box::pin(ready(result))
    }

    fn list<'a, R: Resource>(
        &'a self,
        namespace: Option<&'a str>,
        label_selector: &'a str,
    ) -> ClusterFuture<'a, Vec<R>> {
        let result = (|| {
            let mut state = lock(&self.state);
            let scope = namespace.unwrap_or_default();
            state.record(Verb::List, R::KIND, format!("{scope}[{label_selector}]"))?;
            state
                .objects
                .iter()
                .filter(|((kind, object_namespace, _), value)| {
                    *kind == R::KIND
                        && (namespace.is_none() || object_namespace.as_deref() == namespace)
                        && matches_selector(value, label_selector)
                })
                .map(|(_, value)| decode::<R>(value.clone()))
                .collect()
        })();
        Box::pin(ready(result))
    }

    fn delete<'a, R: Resource>(
        &'a self,
        target: &'a ObjectRef,
        propagation: Propagation,
    ) -> ClusterFuture<'a, ()> {
        let result = (|| {
            let mut state = lock(&self.state);
            let outcome = state.record(Verb::Delete, R::KIND, target.to_string());
            if let Some(last) = state.operations.last_mut() {
                last.propagation = Some(propagation);
            }
            outcome?;
            let key = key_for::<R>(target);
            if !state.objects.contains_key(&key) {
                return Err(ClusterError::NotFound {
                    kind: R::KIND,
                    target: target.to_string(),
                });
            }
            let linger = state
                .lingering_kinds
                .iter()
                .position(|(kind, _)| *kind == R::KIND)
                .map(|index| state.lingering_kinds.remove(index).1);
            match linger {
                Some(calls) => {
                    state.finalizing.insert(key, calls);
                }
                None => {
                    state.objects.remove(&key);
                }
            }
            Ok(())
        })();
        Box::pin(ready(result))
    }

    fn watch<'a, R: Resource>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, Subscription<R>> {
        Box::pin(async move { self.open_watch::<R>(target) })
    }

    fn stop_virtual_machine<'a>(&'a self, target: &'a ObjectRef) -> ClusterFuture<'a, ()> {
        let result = (|| {
            let mut state = lock(&self.state);
            state.record(Verb::Stop, "VirtualMachine", target.to_string())?;
            let key = ("VirtualMachine", target.namespace.clone(), target.name.clone());
            if state.objects.contains_key(&key) {
                Ok(())
            } else {
                Err(ClusterError::NotFound {
                    kind: "VirtualMachine",
                    target: target.to_string(),
                })
            }
        })();
        Box::pin(ready(result))
    }

    /// Dials the pod address directly.
    fn pod_dialer(
        &self,
        pod: &ObjectRef,
        address: &str,
        port: u16,
    ) -> Result<Arc<dyn Dialer>, ClusterError> {
        lock(&self.state).record(Verb::PortForward, "Pod", pod.to_string())?;
        let ip: IpAddr = address.parse().map_err(|_| ClusterError::Transport {
            message: format!("invalid pod address `{address}`"),
        })?;
        Ok(Arc::new(TcpDialer::new(SocketAddr::new(ip, port))))
    }
}

#[derive(Debug, Default)]
struct UiLog {
    says: Vec<String>,
    messages: Vec<String>,
    errors: Vec<String>,
    prompts: Vec<String>,
}

/// [`Ui`] that records output and answers prompts from a queue.
///
/// Once the queue is empty, prompts fail with `UnexpectedEof`.
#[derive(Debug, Default)]
pub struct RecordingUi {
    log: Mutex<UiLog>,
    answers: Mutex<VecDeque<String>>,
}

impl RecordingUi {
    /// Creates a UI answering prompts with `answers` in order.
    #[must_use]
    pub fn with_answers(answers: &[&str]) -> Self {
        Self {
            log: Mutex::default(),
            answers: Mutex::new(answers.iter().map(|answer| (*answer).to_owned()).collect()),
        }
    }

    /// Headline messages.
    #[must_use]
    pub fn says(&self) -> Vec<String> {
        lock(&self.log).says.clone()
    }

    /// Detail messages.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        lock(&self.log).messages.clone()
    }

    /// Error messages.
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        lock(&self.log).errors.clone()
    }

    /// Prompts shown.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.log).prompts.clone()
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        lock(&self.log).says.push(message.to_owned());
    }

    fn message(&self, message: &str) {
        lock(&self.log).messages.push(message.to_owned());
    }

    fn error(&self, message: &str) {
        lock(&self.log).errors.push(message.to_owned());
    }

    fn ask(&self, prompt: &str) -> io::Result<String> {
        lock(&self.log).prompts.push(prompt.to_owned());
        lock(&self.answers)
            .pop_front()
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer"))
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Value of the environment variable `key`, if it was passed.
    #[must_use]
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a specific exit code.
    pub fn push_exit_code(&self, code: i32) {
        lock(&self.responses).push_back(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::new(),
        });
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        lock(&self.responses).push_back(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: String::from("simulated failure"),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(
        &self,
        program: &str,
        args: &[OsString],
        env: &[(String, String)],
    ) -> Result<CommandOutput, ProvisionError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| ProvisionError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
