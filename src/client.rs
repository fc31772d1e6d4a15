//! Running LWM2M client context
//!
//! [`Lwm2mClient::start`] consumes a [`ClientConfig`], binds the CoAP
//! socket and from then on serves one endpoint per defined object. The
//! configuration can still be read but no longer changed:
//!
//! ```compile_fail,E0599
//! use rust_lwm2m::{ClientConfig, Lwm2mClient};
//!
//! let mut builder = ClientConfig::builder();
//! builder.bootstrap_uri("coap://127.0.0.1:15683/").unwrap();
//! builder.endpoint_name("imagination1").unwrap();
//! builder.listen_address("127.0.0.1", 0).unwrap();
//! let client = Lwm2mClient::start(builder.build().unwrap()).unwrap();
//!
//! client.config().set_endpoint_name("imagination12");
//! ```

use std::cell::{Ref, RefCell, RefMut};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::config::ClientConfig;
use crate::definition::{DefinitionRegistry, ObjectDefinition, ResourceDefinition};
use crate::error::Result;
use crate::handler::RequestHandler;
use crate::object_store::ObjectStore;
use crate::transport::{CoapTransport, SharedEndpoint};
use crate::types::ObjectId;

/// A started client: configuration, object store and CoAP transport
pub struct Lwm2mClient {
    config: ClientConfig,
    handler: Rc<RefCell<RequestHandler>>,
    transport: CoapTransport,
}

impl Lwm2mClient {
    /// Bind the configured listen address and start serving
    pub fn start(config: ClientConfig) -> Result<Self> {
        let transport = CoapTransport::bind(config.transport_config()?)?;
        debug!(
            endpoint = config.endpoint_name(),
            addr = %transport.local_addr()?,
            "client started"
        );
        Ok(Self {
            config,
            handler: Rc::new(RefCell::new(RequestHandler::new(ObjectStore::new(
                DefinitionRegistry::new(),
            )))),
            transport,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Define an object type and serve it at `/<object ID>`
    pub fn define_object(&mut self, definition: ObjectDefinition) -> Result<()> {
        let object_id = definition.id;
        self.handler
            .borrow_mut()
            .store_mut()
            .definitions_mut()
            .register_object(definition)?;

        let endpoint: SharedEndpoint = self.handler.clone();
        self.transport
            .register_endpoint(&format!("/{}", object_id), endpoint)
    }

    /// Add a resource type to an already defined object
    pub fn define_resource(
        &mut self,
        object_id: ObjectId,
        definition: ResourceDefinition,
    ) -> Result<()> {
        self.handler
            .borrow_mut()
            .store_mut()
            .definitions_mut()
            .register_resource(object_id, definition)
    }

    pub fn store(&self) -> Ref<'_, ObjectStore> {
        Ref::map(self.handler.borrow(), RequestHandler::store)
    }

    pub fn store_mut(&mut self) -> RefMut<'_, ObjectStore> {
        RefMut::map(self.handler.borrow_mut(), RequestHandler::store_mut)
    }

    /// Transport for issuing requests of our own
    pub fn transport_mut(&mut self) -> &mut CoapTransport {
        &mut self.transport
    }

    /// Run one step of the event loop, waiting at most `timeout`
    pub fn process(&mut self, timeout: Duration) -> Result<usize> {
        self.transport.process(timeout)
    }
}

impl std::fmt::Debug for Lwm2mClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lwm2mClient")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .finish()
    }
}
