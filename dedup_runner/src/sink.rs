use std::sync::Arc;

use tracing::{debug, info};

use crate::connection::LineFlow;
use crate::validator::{classify, Classification};

/// What the connection side is allowed to do to the pipeline.
pub trait RecordSink: Send + Sync {
    /// Hands over one validated record. May block under backpressure.
    fn submit(&self, record: String);

    /// A client asked for global shutdown.
    fn terminate(&self);
}

/// Validates each line of one connection and routes it into a [`RecordSink`].
#[derive(Clone)]
pub struct LineRouter {
    sink: Arc<dyn RecordSink>,
    digits: u32,
    terminate_text: Arc<str>,
}

impl LineRouter {
    pub fn new(sink: Arc<dyn RecordSink>, digits: u32, terminate_text: impl Into<Arc<str>>) -> Self {
        Self {
            sink,
            digits,
            terminate_text: terminate_text.into(),
        }
    }

    /// Numbers keep the connection open; the terminate command stops the
    /// pipeline and then drops the sender; anything else only drops the sender.
    pub fn route(&self, connection_id: u64, line: &str) -> LineFlow {
        match classify(line, self.digits, &self.terminate_text) {
            Classification::Number(_) => {
                self.sink.submit(line.to_owned());
                LineFlow::Continue
            }
            Classification::Terminate => {
                info!("connection {} sent the terminate command", connection_id);
                self.sink.terminate();
                LineFlow::Close
            }
            Classification::Invalid => {
                debug!(
                    "connection {} sent an invalid record ({} bytes), closing",
                    connection_id,
                    line.len()
                );
                LineFlow::Close
            }
        }
    }
}
