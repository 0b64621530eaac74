//! Recording transport for tests

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::traits::{PeerInfo, Transport, TransportError, TransportResult};
use crate::hid::ReportFrame;
use crate::session::LifecycleSender;

#[derive(Default)]
struct MockState {
    frames: Vec<ReportFrame>,
    fail_at: Option<usize>,
    accepts: usize,
    closes: usize,
    lifecycle: Option<LifecycleSender>,
    hold_accept: bool,
    shut_down: bool,
}

/// Shared view of a [`MockTransport`] kept by the test
#[derive(Clone, Default)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    accept_gate: Arc<Notify>,
}

impl MockHandle {
    pub fn frames(&self) -> Vec<ReportFrame> {
        self.state.lock().unwrap().frames.clone()
    }

    pub fn accepts(&self) -> usize {
        self.state.lock().unwrap().accepts
    }

    pub fn closes(&self) -> usize {
        self.state.lock().unwrap().closes
    }

    pub fn is_shut_down(&self) -> bool {
        self.state.lock().unwrap().shut_down
    }

    /// Fail the send that would store frame number `index` (0-based), once
    pub fn fail_at(&self, index: usize) {
        self.state.lock().unwrap().fail_at = Some(index);
    }

    /// Make `accept` wait for [`MockHandle::release_accept`]
    pub fn hold_accept(&self) {
        self.state.lock().unwrap().hold_accept = true;
    }

    pub fn release_accept(&self) {
        self.state.lock().unwrap().hold_accept = false;
        self.accept_gate.notify_waiters();
    }

    /// Lifecycle sender handed to the most recent accept
    pub fn lifecycle(&self) -> Option<LifecycleSender> {
        self.state.lock().unwrap().lifecycle.clone()
    }
}

pub struct MockTransport {
    handle: MockHandle,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let handle = MockHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn open(&mut self) -> TransportResult<()> {
        Ok(())
    }

    async fn accept(&mut self, events: LifecycleSender) -> TransportResult<PeerInfo> {
        loop {
            let notified = self.handle.accept_gate.notified();
            if !self.handle.state.lock().unwrap().hold_accept {
                break;
            }
            notified.await;
        }

        let mut state = self.handle.state.lock().unwrap();
        state.accepts += 1;
        state.lifecycle = Some(events);
        Ok(PeerInfo::new(format!("mock-{}", state.accepts)))
    }

    async fn send(&mut self, frame: &ReportFrame) -> TransportResult<()> {
        let mut state = self.handle.state.lock().unwrap();
        if state.fail_at == Some(state.frames.len()) {
            state.fail_at = None;
            return Err(TransportError::Disconnected("injected failure".into()));
        }
        state.frames.push(frame.clone());
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.handle.state.lock().unwrap().closes += 1;
        Ok(())
    }

    async fn shutdown(&mut self) -> TransportResult<()> {
        self.handle.state.lock().unwrap().shut_down = true;
        Ok(())
    }
}
