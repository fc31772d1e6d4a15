//! Integration tests over the public API
//!
//! Network tests run two transports on loopback with ephemeral ports.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use rust_lwm2m::callback::{HandlerResult, Operation, from_fn};
use rust_lwm2m::coap_types::{ContentFormat, Method, Request, ResponseCode};
use rust_lwm2m::codec::{JsonCodec, TlvCodec};
use rust_lwm2m::definition::{ObjectDefinition, Operations, ResourceDefinition};
use rust_lwm2m::device::{DeviceInfo, device_object_definition, register_device_object};
use rust_lwm2m::transport::ClientResponse;
use rust_lwm2m::tree_builder::create_tree_from_path;
use rust_lwm2m::types::ObjectLink;
use rust_lwm2m::{
    ClientConfig, Codec, CoapTransport, DefinitionRegistry, ErrorKind, Lwm2mClient, Lwm2mError,
    ObjectStore, RequestOrigin, ResourcePath, ResourceType, TransportConfig, Value,
};

const SENSOR_OBJECT: u16 = 3303;

fn sensor_definition() -> ObjectDefinition {
    ObjectDefinition::new(SENSOR_OBJECT, "Temperature")
        .instances(0, 8)
        .with_resource(
            ResourceDefinition::new(5700, "SensorValue", ResourceType::Float)
                .operations(Operations::READ)
                .mandatory(),
        )
        .with_resource(ResourceDefinition::new(5701, "SensorUnits", ResourceType::String))
        .with_resource(ResourceDefinition::new(5605, "ResetMinMax", ResourceType::None).mandatory())
}

fn start_client() -> Lwm2mClient {
    let mut builder = ClientConfig::builder();
    builder
        .bootstrap_uri("coap://127.0.0.1:15683/")
        .unwrap()
        .endpoint_name("imagination1")
        .unwrap()
        .listen_address("127.0.0.1", 0)
        .unwrap();
    let mut client = Lwm2mClient::start(builder.build().unwrap()).unwrap();

    client.define_object(device_object_definition()).unwrap();
    client.define_object(sensor_definition()).unwrap();
    let info = DeviceInfo {
        manufacturer: "Open Mobile Alliance".into(),
        ..DeviceInfo::default()
    };
    register_device_object(&mut client.store_mut(), &info).unwrap();
    client
}

fn requester() -> CoapTransport {
    CoapTransport::bind(
        TransportConfig::new("127.0.0.1:0".parse().unwrap())
            .with_ack_timeout(Duration::from_millis(200)),
    )
    .unwrap()
}

/// Send one request to the client and pump both sides until it is answered
fn exchange(
    server: &mut CoapTransport,
    client: &mut Lwm2mClient,
    request: Request,
) -> ClientResponse {
    let slot = Rc::new(RefCell::new(None));
    let sink = slot.clone();
    let peer = client.local_addr().unwrap();
    server
        .send_request(peer, &request, move |response| {
            *sink.borrow_mut() = Some(response.clone());
        })
        .unwrap();

    for _ in 0..20 {
        client.process(Duration::from_millis(50)).unwrap();
        server.process(Duration::from_millis(50)).unwrap();
        if let Some(response) = slot.borrow_mut().take() {
            return response;
        }
    }
    panic!("no response to {} {}", request.method, request.path);
}

#[test]
fn test_read_device_object_over_coap() {
    let mut client = start_client();
    let mut server = requester();

    let response = exchange(
        &mut server,
        &mut client,
        Request::new(Method::Get, "/3/0/0").with_accept(ContentFormat::Lwm2mText),
    );
    assert_eq!(response.code, ResponseCode::Content);
    assert_eq!(response.content_format, Some(1541));
    assert_eq!(response.payload, b"Open Mobile Alliance");

    let response = exchange(&mut server, &mut client, Request::new(Method::Get, "/3/0"));
    assert_eq!(response.code, ResponseCode::Content);
    assert_eq!(response.content_format, Some(1543));
    let text = String::from_utf8(response.payload).unwrap();
    assert!(text.starts_with("{\"e\":[\n{\"n\":\"0\",\"sv\":\"Open Mobile Alliance\"},\n"));
}

#[test]
fn test_create_write_delete_over_coap() {
    let mut client = start_client();
    let mut server = requester();

    let create = Request::new(Method::Post, "/3303").with_payload(
        br#"{"e":[{"n":"4/5701","sv":"Cel"}]}"#.to_vec(),
        ContentFormat::Lwm2mJson,
    );
    let response = exchange(&mut server, &mut client, create);
    assert_eq!(response.code, ResponseCode::Created);
    assert_eq!(response.location.as_deref(), Some("/3303/4"));
    assert!(client.store().resource_exists(SENSOR_OBJECT, 4, 5700));

    let write = Request::new(Method::Put, "/3303/4/5701")
        .with_payload(b"Far".to_vec(), ContentFormat::Lwm2mText);
    let response = exchange(&mut server, &mut client, write);
    assert_eq!(response.code, ResponseCode::Changed);
    assert_eq!(
        client.store().get_value(SENSOR_OBJECT, 4, 5701, 0).unwrap(),
        Value::String("Far".into())
    );

    // sensor value is read-only for servers
    let write = Request::new(Method::Put, "/3303/4/5700")
        .with_payload(b"21.5".to_vec(), ContentFormat::Lwm2mText);
    let response = exchange(&mut server, &mut client, write);
    assert_eq!(response.code, ResponseCode::MethodNotAllowed);

    let response = exchange(&mut server, &mut client, Request::new(Method::Post, "/3303/4/5605"));
    assert_eq!(response.code, ResponseCode::Changed);

    let response = exchange(&mut server, &mut client, Request::new(Method::Delete, "/3303/4"));
    assert_eq!(response.code, ResponseCode::Deleted);
    assert!(!client.store().instance_exists(SENSOR_OBJECT, 4));

    let response = exchange(&mut server, &mut client, Request::new(Method::Get, "/3303/4"));
    assert_eq!(response.code, ResponseCode::NotFound);

    let response = exchange(&mut server, &mut client, Request::new(Method::Get, "/42"));
    assert_eq!(response.code, ResponseCode::NotFound);
}

#[test]
fn test_request_times_out() {
    let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    let uri = format!("coap://{}/3/0", silent.local_addr().unwrap());

    let mut transport = CoapTransport::bind(
        TransportConfig::new("127.0.0.1:0".parse().unwrap())
            .with_max_retransmit(1)
            .with_ack_timeout(Duration::from_millis(30)),
    )
    .unwrap();

    let result = Rc::new(RefCell::new(None));
    let sink = result.clone();
    transport
        .get_request(&uri, move |response| {
            *sink.borrow_mut() = Some((response.code, response.path.clone()));
        })
        .unwrap();

    for _ in 0..10 {
        transport.process(Duration::from_millis(50)).unwrap();
    }
    assert_eq!(
        *result.borrow(),
        Some((ResponseCode::GatewayTimeout, "/3/0".to_string()))
    );
}

#[test]
fn test_config_capacity_leaves_previous_value() {
    let mut builder = ClientConfig::builder();
    builder.endpoint_name("imagination1").unwrap();

    let err = builder.endpoint_name(&"1234567890".repeat(60)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Capacity);

    builder
        .bootstrap_uri("coap://127.0.0.1:15683/")
        .unwrap()
        .listen_address("0.0.0.0", 5683)
        .unwrap();
    assert_eq!(builder.build().unwrap().endpoint_name(), "imagination1");
}

#[test]
fn test_create_then_delete_leaves_nothing() {
    let mut definitions = DefinitionRegistry::new();
    definitions.register_object(sensor_definition()).unwrap();
    let mut store = ObjectStore::new(definitions);

    for instance_id in [0u16, 3, 7] {
        store
            .create_object_instance(SENSOR_OBJECT, Some(instance_id))
            .unwrap();
        store.set_value(SENSOR_OBJECT, instance_id, 5701, 0, "Cel").unwrap();
        store.delete_object_instance(SENSOR_OBJECT, instance_id).unwrap();

        for resource_id in [5700, 5701, 5605] {
            let err = store
                .get_resource_instance_value(SENSOR_OBJECT, instance_id, resource_id, 0)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NotFound, "resource {}", resource_id);
        }
    }
    assert!(store.instance_ids(SENSOR_OBJECT).is_empty());
}

#[test]
fn test_mandatory_resources_notify_handler() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let sink = log.clone();
    let handler = from_fn(move |call| {
        sink.borrow_mut().push((call.operation, call.resource_id));
        match call.operation {
            Operation::CreateObjectInstance | Operation::CreateResource => {
                HandlerResult::SuccessCreated
            }
            _ => HandlerResult::InternalError,
        }
    });

    let mut object = ObjectDefinition::new(2000, "Handled").handler(handler.clone());
    for resource_id in 0..4 {
        let mut resource = ResourceDefinition::new(resource_id, "R", ResourceType::Integer)
            .handler(handler.clone());
        if resource_id != 2 {
            resource = resource.mandatory();
        }
        object = object.with_resource(resource);
    }
    let mut definitions = DefinitionRegistry::new();
    definitions.register_object(object).unwrap();
    let mut store = ObjectStore::new(definitions);

    store.create_object_instance(2000, Some(0)).unwrap();
    let creates = log
        .borrow()
        .iter()
        .filter(|(operation, _)| *operation == Operation::CreateResource)
        .count();
    assert_eq!(creates, 3);
    assert_eq!(log.borrow()[0], (Operation::CreateObjectInstance, None));
}

#[test]
fn test_codecs_round_trip_all_types() {
    let mut definitions = DefinitionRegistry::new();
    definitions
        .register_object(
            ObjectDefinition::new(1000, "Mixed")
                .with_resource(ResourceDefinition::new(0, "S", ResourceType::String))
                .with_resource(ResourceDefinition::new(1, "I", ResourceType::Integer))
                .with_resource(ResourceDefinition::new(2, "F", ResourceType::Float))
                .with_resource(ResourceDefinition::new(3, "B", ResourceType::Boolean))
                .with_resource(ResourceDefinition::new(4, "O", ResourceType::Opaque))
                .with_resource(ResourceDefinition::new(5, "T", ResourceType::Time))
                .with_resource(ResourceDefinition::new(6, "L", ResourceType::ObjectLink))
                .with_resource(
                    ResourceDefinition::new(7, "A", ResourceType::Integer).multiple(4),
                ),
        )
        .unwrap();
    let mut store = ObjectStore::new(definitions);
    store.create_object_instance(1000, Some(0)).unwrap();
    store.set_value(1000, 0, 0, 0, "Open Mobile Alliance").unwrap();
    store.set_value(1000, 0, 1, 0, -1234567890123i64).unwrap();
    store.set_value(1000, 0, 2, 0, 5.23f64).unwrap();
    store.set_value(1000, 0, 3, 0, true).unwrap();
    store.set_value(1000, 0, 4, 0, Value::Opaque(vec![0, 1, 2, 0xff])).unwrap();
    store.set_value(1000, 0, 5, 0, Value::Time(2718619435)).unwrap();
    store.set_value(1000, 0, 6, 0, ObjectLink::new(3, 0)).unwrap();
    store.set_value(1000, 0, 7, 0, 1i64).unwrap();
    store.set_value(1000, 0, 7, 1, 3i64).unwrap();

    let path = ResourcePath::instance(1000, 0);
    let tree = create_tree_from_path(&store, RequestOrigin::Client, &path).unwrap();

    let codecs: [Box<dyn Codec>; 2] = [Box::new(JsonCodec::default()), Box::new(TlvCodec::default())];
    for codec in codecs {
        let bytes = codec.serialise(&tree, &path).unwrap();
        println!("{:?}: {}", codec.content_format(), hex::encode(&bytes));
        let decoded = codec.deserialise(store.definitions(), &path, &bytes).unwrap();
        assert_eq!(decoded, tree, "{:?}", codec.content_format());
    }
}

#[test]
fn test_malformed_payload_is_protocol_error() {
    let mut definitions = DefinitionRegistry::new();
    definitions.register_object(sensor_definition()).unwrap();

    let err = JsonCodec::default()
        .deserialise(&definitions, &ResourcePath::instance(SENSOR_OBJECT, 0), b"{\"e\":[{")
        .unwrap_err();
    assert!(matches!(err, Lwm2mError::Protocol(_)));
}
