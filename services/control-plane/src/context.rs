//! Explicit caller context threaded through engine operations.

use berth_events::ActorType;
use berth_id::RequestId;

/// Who is calling and under which request.
///
/// Engine components never read ambient session state; anything they need
/// to know about the caller arrives here.
#[derive(Debug, Clone)]
pub struct Context {
    pub request_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
}

impl Context {
    pub fn new(actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new().to_string(),
            actor_type,
            actor_id: actor_id.into(),
        }
    }

    /// Context for work the control plane starts on its own.
    pub fn system() -> Self {
        Self::new(ActorType::System, "system")
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}
