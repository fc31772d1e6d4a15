//! rust-lwm2m - device-side core of an LWM2M client over CoAP
//!
//! This library provides the object/resource data model with application
//! handlers, a resource tree used between the store and the wire codecs
//! (JSON, TLV, plain text, opaque and SenML-CBOR), and a UDP CoAP transport
//! that maps requests onto the store.
//!
//! # Example
//!
//! ```
//! use rust_lwm2m::coap_types::{ContentFormat, Method, Request, ResponseCode};
//! use rust_lwm2m::definition::{ObjectDefinition, ResourceDefinition};
//! use rust_lwm2m::types::ResourceType;
//! use rust_lwm2m::{DefinitionRegistry, ObjectStore, RequestHandler};
//!
//! // Define an object with one mandatory string resource
//! let mut definitions = DefinitionRegistry::new();
//! definitions.register_object(
//!     ObjectDefinition::new(1000, "Greeting")
//!         .with_resource(ResourceDefinition::new(0, "Message", ResourceType::String).mandatory()),
//! )?;
//!
//! // Create an instance and set its value
//! let mut store = ObjectStore::new(definitions);
//! store.create_object_instance(1000, Some(0))?;
//! store.set_value(1000, 0, 0, 0, "Hello there!")?;
//!
//! // Serve it
//! let mut handler = RequestHandler::new(store);
//! let request = Request::new(Method::Get, "/1000/0/0").with_accept(ContentFormat::Lwm2mText);
//! let response = handler.handle(&request);
//! assert_eq!(response.code, ResponseCode::Content);
//! assert_eq!(response.payload, b"Hello there!");
//! # Ok::<(), rust_lwm2m::Lwm2mError>(())
//! ```

pub mod callback;
pub mod client;
pub mod coap_types;
pub mod codec;
pub mod config;
pub mod definition;
pub mod device;
mod error;
pub mod handler;
pub mod object_store;
pub mod path;
pub mod transport;
pub mod tree;
pub mod tree_builder;
pub mod types;

pub use client::Lwm2mClient;
pub use codec::Codec;
pub use config::{ClientConfig, ClientConfigBuilder};
pub use definition::DefinitionRegistry;
pub use error::{ErrorKind, Lwm2mError, Result};
pub use handler::RequestHandler;
pub use object_store::ObjectStore;
pub use path::ResourcePath;
pub use transport::{CoapTransport, TransportConfig};
pub use tree::TreeNode;
pub use tree_builder::{RequestOrigin, WriteMode};
pub use types::{ResourceType, Value};
