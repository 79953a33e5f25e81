//! Message pipelines.
//!
//! A pipeline is an ordered chain of functions applied to messages before
//! they reach a handler (inbound) or the wire (outbound). Functions may
//! rewrite the payload in place; the first error aborts processing of that
//! message.

use std::sync::{Arc, RwLock};

use estuary_protocol::Message;

use crate::error::ServerError;
use crate::session::Session;

pub type PipelineFunc = Arc<dyn Fn(&Arc<Session>, &mut Message) -> Result<(), ServerError> + Send + Sync>;

/// One direction of a pipeline.
#[derive(Default)]
pub struct Channel {
    funcs: RwLock<Vec<PipelineFunc>>,
}

impl Channel {
    /// Prepend a processing function.
    pub fn push_front<F>(&self, func: F)
    where
        F: Fn(&Arc<Session>, &mut Message) -> Result<(), ServerError> + Send + Sync + 'static,
    {
        self.funcs.write().unwrap().insert(0, Arc::new(func));
    }

    /// Append a processing function.
    pub fn push_back<F>(&self, func: F)
    where
        F: Fn(&Arc<Session>, &mut Message) -> Result<(), ServerError> + Send + Sync + 'static,
    {
        self.funcs.write().unwrap().push(Arc::new(func));
    }

    /// Run the chain over `message`.
    pub fn process(&self, session: &Arc<Session>, message: &mut Message) -> Result<(), ServerError> {
        let funcs: Vec<PipelineFunc> = self.funcs.read().unwrap().clone();
        for func in funcs {
            func(session, message)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.read().unwrap().is_empty()
    }
}

/// Paired inbound/outbound chains, shared by the dispatcher and every
/// agent writer of a node.
#[derive(Clone, Default)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

#[derive(Default)]
struct PipelineInner {
    inbound: Channel,
    outbound: Channel,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied to decoded messages before dispatch.
    pub fn inbound(&self) -> &Channel {
        &self.inner.inbound
    }

    /// Applied to outgoing messages before the packet encoder.
    pub fn outbound(&self) -> &Channel {
        &self.inner.outbound
    }
}
