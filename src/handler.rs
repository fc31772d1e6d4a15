//! LWM2M Request Handler
//!
//! Transport-agnostic mapping of CoAP requests onto the object store. Plug it
//! into [`CoapTransport`](crate::transport::CoapTransport) or any other CoAP
//! server as an [`Endpoint`].
//!
//! | Method | Object         | Instance       | Resource            | Resource instance |
//! |--------|----------------|----------------|---------------------|-------------------|
//! | GET    | read           | read           | read                | read              |
//! | PUT    | 4.05           | replace        | replace             | replace           |
//! | POST   | create         | partial update | execute or update   | 4.00              |
//! | DELETE | 4.05           | delete         | delete              | delete            |

use tracing::{debug, warn};

use crate::callback::Operation;
use crate::codec::{Codec, JsonCodec, codec_for_u16};
use crate::coap_types::{Method, Request, Response, ResponseCode};
use crate::error::{ErrorKind, Lwm2mError, Result};
use crate::object_store::ObjectStore;
use crate::path::ResourcePath;
use crate::transport::Endpoint;
use crate::tree::{NodeKind, TreeNode};
use crate::tree_builder::{RequestOrigin, WriteMode, apply_tree, create_tree_from_path};

/// Main LWM2M request handler
///
/// Every request is treated as coming from a server, so resource
/// permissions are enforced.
///
/// # Example
/// ```ignore
/// let mut handler = RequestHandler::new(store);
/// let response = handler.handle(&request);
/// // Send response via your CoAP transport
/// ```
#[derive(Debug)]
pub struct RequestHandler {
    store: ObjectStore,
}

impl RequestHandler {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Get a reference to the object store
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Get a mutable reference to the object store
    pub fn store_mut(&mut self) -> &mut ObjectStore {
        &mut self.store
    }

    /// Handle an incoming request
    pub fn handle(&mut self, request: &Request) -> Response {
        debug!(method = %request.method, path = %request.path, "request");
        let path: ResourcePath = match request.path.parse() {
            Ok(path) => path,
            Err(e) => return error_response(&e),
        };

        let result = match request.method {
            Method::Get => self.handle_get(request, &path),
            Method::Put => self.handle_put(request, &path),
            Method::Post => self.handle_post(request, &path),
            Method::Delete => self.handle_delete(request, &path),
        };
        result.unwrap_or_else(|e| error_response(&e))
    }

    /// Handle GET - read the addressed node in the requested format
    fn handle_get(&self, request: &Request, path: &ResourcePath) -> Result<Response> {
        let codec: Box<dyn Codec> = match request.accept {
            Some(format) => match codec_for_u16(format) {
                Ok(codec) => codec,
                Err(_) => {
                    return Ok(Response::error(
                        ResponseCode::NotAcceptable,
                        &format!("cannot produce content format {}", format),
                    ));
                }
            },
            None => Box::new(JsonCodec::default()),
        };

        let tree = create_tree_from_path(&self.store, RequestOrigin::Server, path)?;
        let payload = codec.serialise(&tree, path)?;
        Ok(Response::content(payload, codec.content_format()))
    }

    /// Handle PUT - replace an instance, resource or resource instance
    fn handle_put(&mut self, request: &Request, path: &ResourcePath) -> Result<Response> {
        let (Some(object_id), Some(instance_id)) = (path.object_id, path.instance_id) else {
            return Ok(Response::method_not_allowed(request.method));
        };
        self.require_instance(object_id, instance_id)?;

        let tree = self.decode(request, path)?;
        apply_tree(
            &mut self.store,
            RequestOrigin::Server,
            WriteMode::Replace,
            path,
            &tree,
        )?;
        Ok(Response::changed())
    }

    /// Handle POST - create, partial update or execute depending on depth
    fn handle_post(&mut self, request: &Request, path: &ResourcePath) -> Result<Response> {
        match (
            path.object_id,
            path.instance_id,
            path.resource_id,
            path.resource_instance_id,
        ) {
            (None, ..) => Ok(Response::method_not_allowed(request.method)),
            (Some(o), None, ..) => self.create_instance(request, o),
            (Some(o), Some(i), None, _) => {
                self.require_instance(o, i)?;
                let tree = self.decode(request, path)?;
                self.write(path, &tree, WriteMode::Update)
            }
            (Some(o), Some(i), Some(r), None) => {
                let executable = self
                    .store
                    .definitions()
                    .resource(o, r)?
                    .operations
                    .can_execute();
                if executable {
                    let result = self.store.execute_resource(o, i, r, &request.payload)?;
                    if !result.is_success() {
                        return Err(Lwm2mError::Handler {
                            operation: Operation::Execute,
                            result,
                        });
                    }
                    return Ok(Response::changed());
                }
                self.require_instance(o, i)?;
                let tree = self.decode(request, path)?;
                self.write(path, &tree, WriteMode::Update)
            }
            (Some(_), Some(_), Some(_), Some(_)) => Err(Lwm2mError::Protocol(format!(
                "POST is not valid on resource instance {}",
                path
            ))),
        }
    }

    /// Handle DELETE - remove an instance, resource or resource instance
    fn handle_delete(&mut self, request: &Request, path: &ResourcePath) -> Result<Response> {
        match (
            path.object_id,
            path.instance_id,
            path.resource_id,
            path.resource_instance_id,
        ) {
            (Some(o), Some(i), None, _) => self.store.delete_object_instance(o, i)?,
            (Some(o), Some(i), Some(r), None) => {
                if self.store.definitions().resource(o, r)?.is_mandatory() {
                    return Err(Lwm2mError::Permission(format!(
                        "mandatory resource {} cannot be deleted",
                        path
                    )));
                }
                self.store.delete_resource(o, i, r)?;
            }
            (Some(o), Some(i), Some(r), Some(ri)) => {
                self.store.delete_resource_instance(o, i, r, ri)?
            }
            _ => return Ok(Response::method_not_allowed(request.method)),
        }
        Ok(Response::deleted())
    }

    /// Create an object instance. The instance ID is taken from the payload
    /// when one is given, otherwise the lowest free ID is used.
    fn create_instance(&mut self, request: &Request, object_id: u16) -> Result<Response> {
        let object_path = ResourcePath::object(object_id);
        let tree = if request.payload.is_empty() {
            None
        } else {
            Some(self.decode(request, &object_path)?)
        };

        let instance = match &tree {
            None => None,
            Some(tree) => match tree.children() {
                [instance] => Some(instance),
                children => {
                    return Err(Lwm2mError::Protocol(format!(
                        "create expects one object instance, got {}",
                        children.len()
                    )));
                }
            },
        };

        let instance_id = self
            .store
            .create_object_instance(object_id, instance.and_then(TreeNode::id))?;

        if let Some(instance) = instance {
            let path = ResourcePath::instance(object_id, instance_id);
            let applied = apply_tree(
                &mut self.store,
                RequestOrigin::Server,
                WriteMode::Update,
                &path,
                instance,
            );
            if let Err(e) = applied {
                warn!(%path, error = %e, "create failed, removing instance");
                self.store.delete_object_instance(object_id, instance_id)?;
                return Err(e);
            }
        }

        debug!(object_id, instance_id, "instance created by server");
        Ok(Response::created(format!("/{}/{}", object_id, instance_id)))
    }

    fn write(&mut self, path: &ResourcePath, tree: &TreeNode, mode: WriteMode) -> Result<Response> {
        apply_tree(&mut self.store, RequestOrigin::Server, mode, path, tree)?;
        Ok(Response::changed())
    }

    fn require_instance(&self, object_id: u16, instance_id: u16) -> Result<()> {
        self.store.definitions().object(object_id)?;
        if self.store.instance_exists(object_id, instance_id) {
            Ok(())
        } else {
            Err(Lwm2mError::NotFound(format!(
                "object instance /{}/{}",
                object_id, instance_id
            )))
        }
    }

    /// Decode the request payload into a tree rooted at `path`
    fn decode(&self, request: &Request, path: &ResourcePath) -> Result<TreeNode> {
        let format = request.content_format.ok_or_else(|| {
            Lwm2mError::Protocol("request payload has no content format".to_string())
        })?;
        let tree = codec_for_u16(format)?.deserialise(self.store.definitions(), path, &request.payload)?;
        if tree.kind() == NodeKind::Root {
            return Err(Lwm2mError::Protocol("cannot write the root".to_string()));
        }
        Ok(tree)
    }
}

impl Endpoint for RequestHandler {
    fn handle(&mut self, request: &Request) -> Response {
        RequestHandler::handle(self, request)
    }
}

/// Map an error onto the CoAP response code it is reported as
pub fn response_code(error: &Lwm2mError) -> ResponseCode {
    if let Lwm2mError::UnsupportedContentType(_) = error {
        return ResponseCode::UnsupportedContentFormat;
    }
    match error.kind() {
        ErrorKind::NotFound => ResponseCode::NotFound,
        ErrorKind::Permission => ResponseCode::MethodNotAllowed,
        ErrorKind::AlreadyExists | ErrorKind::Protocol | ErrorKind::Configuration => {
            ResponseCode::BadRequest
        }
        ErrorKind::Capacity => ResponseCode::RequestEntityTooLarge,
        ErrorKind::Transport | ErrorKind::Internal => ResponseCode::InternalServerError,
    }
}

fn error_response(error: &Lwm2mError) -> Response {
    let code = response_code(error);
    debug!(%code, error = %error, "request failed");
    Response::error(code, &error.to_string())
}
