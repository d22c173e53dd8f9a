//! Message types shared by the integration tests.

use sessionbus_core::{Command, Event, MessageMeta, SessionId};

#[derive(Debug, Clone)]
pub struct TestCommand {
    pub meta: MessageMeta,
    pub payload: String,
}

impl TestCommand {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            meta: MessageMeta::new(),
            payload: payload.into(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.meta.session_id = session_id.into();
        self
    }
}

impl Command for TestCommand {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MessageMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone)]
pub struct AnotherTestCommand {
    pub meta: MessageMeta,
}

impl AnotherTestCommand {
    pub fn new() -> Self {
        Self {
            meta: MessageMeta::new(),
        }
    }
}

impl Command for AnotherTestCommand {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut MessageMeta {
        &mut self.meta
    }
}

#[derive(Debug, Clone)]
pub struct TestEvent {
    pub meta: MessageMeta,
    pub label: String,
}

impl TestEvent {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            meta: MessageMeta::new(),
            label: label.into(),
        }
    }

    pub fn in_session(label: impl Into<String>, session_id: impl Into<SessionId>) -> Self {
        Self {
            meta: MessageMeta::in_session(session_id),
            label: label.into(),
        }
    }
}

impl Event for TestEvent {
    fn meta(&self) -> &MessageMeta {
        &self.meta
    }
}
