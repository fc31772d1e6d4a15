//! Application handlers for externally-managed objects and resources
//!
//! A handler receives every create/delete/read/write/execute for the objects
//! and resources it is bound to. The application context is whatever state
//! the handler owns; closures capture it directly.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::types::{InstanceId, ObjectId, ResourceId, ResourceInstanceId};

/// Operation a handler is asked to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateObjectInstance,
    DeleteObjectInstance,
    CreateResource,
    DeleteResource,
    Read,
    Write,
    Execute,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateObjectInstance => "CreateObjectInstance",
            Self::DeleteObjectInstance => "DeleteObjectInstance",
            Self::CreateResource => "CreateResource",
            Self::DeleteResource => "DeleteResource",
            Self::Read => "Read",
            Self::Write => "Write",
            Self::Execute => "Execute",
        };
        f.write_str(name)
    }
}

/// Result code returned by a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    Success,
    SuccessCreated,
    SuccessDeleted,
    SuccessChanged,
    SuccessContent,
    BadRequest,
    Unauthorized,
    NotFound,
    MethodNotAllowed,
    AlreadyExists,
    OutOfMemory,
    InternalError,
}

impl HandlerResult {
    /// Check if this is a success code
    pub fn is_success(self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::SuccessCreated
                | Self::SuccessDeleted
                | Self::SuccessChanged
                | Self::SuccessContent
        )
    }

    /// Check if this success code is a valid answer to `operation`
    pub fn is_valid_for(self, operation: Operation) -> bool {
        match operation {
            Operation::CreateObjectInstance | Operation::CreateResource => {
                self == Self::SuccessCreated
            }
            Operation::DeleteObjectInstance | Operation::DeleteResource => {
                self == Self::SuccessDeleted
            }
            Operation::Read => self == Self::SuccessContent,
            Operation::Write => matches!(self, Self::SuccessChanged | Self::Success),
            Operation::Execute => matches!(self, Self::Success | Self::SuccessChanged),
        }
    }
}

/// A single handler invocation
#[derive(Debug)]
pub struct HandlerCall<'a> {
    pub operation: Operation,
    pub object_id: ObjectId,
    pub instance_id: InstanceId,
    /// Unset for object-instance operations
    pub resource_id: Option<ResourceId>,
    /// Set for Read and Write, and for DeleteResource of one resource instance
    pub resource_instance_id: Option<ResourceInstanceId>,
    /// Read: the handler fills this with the current value.
    /// Write: the value to consume. Execute: the arguments.
    pub data: &'a mut Vec<u8>,
    /// Write: the handler sets this when the stored value actually changed
    pub changed: &'a mut bool,
}

/// Callback interface for externally-managed storage
pub trait ResourceHandler {
    /// Handle one operation
    fn handle(&mut self, call: &mut HandlerCall<'_>) -> HandlerResult;
}

impl<F> ResourceHandler for F
where
    F: FnMut(&mut HandlerCall<'_>) -> HandlerResult,
{
    fn handle(&mut self, call: &mut HandlerCall<'_>) -> HandlerResult {
        self(call)
    }
}

/// Handler shared between an object definition and its resources
pub type SharedHandler = Rc<RefCell<dyn ResourceHandler>>;

/// Wrap a handler for use in definitions
pub fn shared<H: ResourceHandler + 'static>(handler: H) -> SharedHandler {
    Rc::new(RefCell::new(handler))
}

/// Wrap a closure for use in definitions
pub fn from_fn<F>(f: F) -> SharedHandler
where
    F: FnMut(&mut HandlerCall<'_>) -> HandlerResult + 'static,
{
    shared(f)
}

/// Invoke a shared handler. A handler that is already borrowed (re-entered
/// from its own callback) answers `InternalError`.
pub(crate) fn invoke(handler: &SharedHandler, call: &mut HandlerCall<'_>) -> HandlerResult {
    match handler.try_borrow_mut() {
        Ok(mut handler) => handler.handle(call),
        Err(_) => {
            tracing::warn!(operation = %call.operation, "handler re-entered");
            HandlerResult::InternalError
        }
    }
}
