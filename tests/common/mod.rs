//! Shared test fixtures: a scripted transport and mesh wiring helpers.
#![allow(dead_code)] // not every test binary uses every helper

use async_trait::async_trait;
use datapunk_mesh::{Instance, Transport};
use std::collections::VecDeque;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type ScriptedOutcome = Result<Vec<u8>, io::ErrorKind>;

/// Transport that plays back a script of outcomes, then a default.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedOutcome>>,
    default_fails: AtomicBool,
    delay: Mutex<Option<Duration>>,
    invocations: AtomicUsize,
}

impl ScriptedTransport {
    /// Succeeds on every call, echoing the payload.
    pub fn ok() -> SharedTransport {
        SharedTransport(Arc::new(Self::default()))
    }

    /// Fails the first `n` calls with `ConnectionReset`, then succeeds.
    pub fn failing_first(n: usize) -> SharedTransport {
        let transport = Self::default();
        {
            let mut script = transport.script.lock().unwrap();
            for _ in 0..n {
                script.push_back(Err(io::ErrorKind::ConnectionReset));
            }
        }
        SharedTransport(Arc::new(transport))
    }

    /// Fails every call.
    pub fn always_failing() -> SharedTransport {
        let transport = Self::default();
        transport.default_fails.store(true, Ordering::SeqCst);
        SharedTransport(Arc::new(transport))
    }

    /// Switch the post-script default between success and failure.
    pub fn set_failing(&self, failing: bool) {
        self.default_fails.store(failing, Ordering::SeqCst);
    }

    /// Delay every invocation (for timeout/cancellation tests).
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

/// Newtype over `Arc<ScriptedTransport>` so `Transport` can be implemented
/// for it locally (the orphan rule forbids implementing a foreign trait for
/// `Arc<Local>` directly since `Arc` isn't a fundamental type).
#[derive(Debug, Clone, Default)]
pub struct SharedTransport(Arc<ScriptedTransport>);

impl Deref for SharedTransport {
    type Target = ScriptedTransport;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[async_trait]
impl Transport for SharedTransport {
    type Error = io::Error;

    async fn invoke(
        &self,
        _instance: &Instance,
        _operation: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, Self::Error> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(kind)) => Err(io::Error::new(kind, "scripted failure")),
            None => {
                if self.default_fails.load(Ordering::SeqCst) {
                    Err(io::Error::new(io::ErrorKind::ConnectionReset, "scripted failure"))
                } else {
                    Ok(payload.to_vec())
                }
            }
        }
    }
}
