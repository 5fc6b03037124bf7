//! Write pipeline behaviour across transports and transformer laws

use a3s_cloudevents::binding::{
    self, AddAttribute, AddExtension, DeleteAttribute, DeleteExtension, EventBuilder, EventMessage,
    Finisher, UpdateAttribute, UpdateExtension, Version,
};
use a3s_cloudevents::client::{handler_fn, Client, Inbound};
use a3s_cloudevents::protocol::http::{write_request, HttpMessage, HttpWriter};
use a3s_cloudevents::protocol::kafka::{write_record, KafkaMessage, KafkaRecord, KEY_EXTENSION};
use a3s_cloudevents::protocol::{amqp, memory, pubsub};
use a3s_cloudevents::{
    AttributeKind, CloudEventError, Context, Encoding, Event, Message, PipelineOptions, Sender,
    SpecVersion, TransformerFactory, Value,
};
use bytes::Bytes;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

fn event(id: &str) -> Event {
    let mut e = Event::new();
    e.set_id(id);
    e.set_type("com.example.test");
    e.set_source("/unit/test/client");
    e.set_data("application/json", &serde_json::json!({"sq": 42}))
        .unwrap();
    e
}

/// Run `event` through the binary direct path of an HTTP message
fn through_binary(event: &Event, transformers: &[&dyn TransformerFactory]) -> Event {
    let mut request = http::Request::new(Bytes::new());
    write_request(
        &mut EventMessage::new(event.clone()),
        &mut request,
        &[],
        &PipelineOptions::force_binary(),
    )
    .unwrap();
    let mut msg = HttpMessage::from_request(request);
    let mut builder = EventBuilder::new();
    binding::write(&mut msg, None, Some(&mut builder), transformers, &PipelineOptions::default())
        .unwrap();
    builder.into_event()
}

/// Run `event` through the event-form fallback
fn through_event(event: &Event, transformers: &[&dyn TransformerFactory]) -> Event {
    let mut builder = EventBuilder::new();
    binding::write(
        &mut EventMessage::new(event.clone()),
        None,
        Some(&mut builder),
        transformers,
        &PipelineOptions::default(),
    )
    .unwrap();
    builder.into_event()
}

#[derive(Debug, Clone, Copy)]
enum Transport {
    Http,
    Kafka,
    Amqp,
    Pubsub,
    Memory,
}

/// A minimal event of `version` carrying JSON data
fn versioned(version: SpecVersion, id: &str, n: u32) -> Event {
    let mut e = Event::with_version(version);
    e.set_id(id);
    e.set_type("com.example.test");
    e.set_source("/unit/test/client");
    e.set_data("application/json", &serde_json::json!({"n": n}))
        .unwrap();
    e
}

/// Write `event` onto `transport`, read it back and rebuild the event
fn round_trip(event: &Event, transport: Transport, options: &PipelineOptions) -> (Encoding, Event) {
    let mut source = EventMessage::new(event.clone());
    match transport {
        Transport::Http => {
            let mut request = http::Request::new(Bytes::new());
            let encoding = write_request(&mut source, &mut request, &[], options).unwrap();
            let mut msg = HttpMessage::from_request(request);
            (encoding, a3s_cloudevents::to_event(&mut msg).unwrap())
        }
        Transport::Kafka => {
            let (encoding, record) = write_record(&mut source, "events", &[], options).unwrap();
            (encoding, a3s_cloudevents::to_event(&mut KafkaMessage::new(record)).unwrap())
        }
        Transport::Amqp => {
            let (encoding, message) = amqp::write_message(&mut source, &[], options).unwrap();
            (encoding, a3s_cloudevents::to_event(&mut amqp::AmqpInbound::new(message)).unwrap())
        }
        Transport::Pubsub => {
            let (encoding, message) = pubsub::write_message(&mut source, &[], options).unwrap();
            (encoding, a3s_cloudevents::to_event(&mut pubsub::PubsubInbound::new(message)).unwrap())
        }
        Transport::Memory => {
            // feed the channel a message already in the requested encoding
            let mut request = http::Request::new(Bytes::new());
            let encoding = write_request(&mut source, &mut request, &[], options).unwrap();
            let (tx, rx) = memory::channel(1);
            let cx = Context::new();
            let mut received = tokio_test::block_on(async {
                tx.send(&cx, Box::new(HttpMessage::from_request(request)), &[]).await?;
                a3s_cloudevents::Receiver::receive(&rx, &cx).await
            })
            .unwrap()
            .unwrap();
            assert_eq!(received.encoding(), encoding);
            (encoding, a3s_cloudevents::to_event(received.as_mut()).unwrap())
        }
    }
}

proptest! {
    #[test]
    fn prop_transport_round_trip(
        version in prop_oneof![
            Just(SpecVersion::V01),
            Just(SpecVersion::V02),
            Just(SpecVersion::V03),
            Just(SpecVersion::V10),
        ],
        structured in any::<bool>(),
        transport in prop_oneof![
            Just(Transport::Http),
            Just(Transport::Kafka),
            Just(Transport::Amqp),
            Just(Transport::Pubsub),
            Just(Transport::Memory),
        ],
        id in "[a-zA-Z0-9-]{1,16}",
        n in any::<u32>(),
    ) {
        let e = versioned(version, &id, n);
        let (options, expected) = if structured {
            (PipelineOptions::force_structured(), Encoding::Structured)
        } else {
            (PipelineOptions::force_binary(), Encoding::Binary)
        };

        let (encoding, back) = round_trip(&e, transport, &options);
        prop_assert_eq!(encoding, expected);
        prop_assert_eq!(back.spec_version(), version);
        prop_assert_eq!(&back, &e);
    }

    #[test]
    fn prop_add_attribute_is_idempotent(
        subject in "[a-zA-Z0-9/]{1,24}",
        existing in proptest::option::of("[a-z]{1,8}"),
    ) {
        let mut e = event("1");
        if let Some(s) = &existing {
            e.set_subject(s);
        }
        let add = AddAttribute::new(AttributeKind::Subject, Value::String(subject.clone()));

        let once = through_binary(&e, &[&add]);
        let twice = through_binary(&once, &[&add]);
        prop_assert_eq!(&once, &twice);
        prop_assert_eq!(once.subject(), Some(existing.as_deref().unwrap_or(subject.as_str())));
        prop_assert_eq!(&through_event(&e, &[&add]), &once);
    }

    #[test]
    fn prop_delete_then_add_equals_update(
        old in "[a-zA-Z0-9]{1,16}",
        new in "[a-zA-Z0-9]{1,16}",
    ) {
        let mut e = event("1");
        e.set_extension("exta", old.as_str()).unwrap();

        let delete = DeleteExtension::new("exta");
        let add = AddExtension::new("exta", Value::String(new.clone()));
        let replacement = new.clone();
        let update = UpdateExtension::new("exta", move |_| Ok(Some(Value::String(replacement.clone()))));

        let composed = through_binary(&e, &[&delete, &add]);
        let updated = through_binary(&e, &[&update]);
        prop_assert_eq!(&composed, &updated);
        prop_assert_eq!(updated.extension("exta"), Some(&Value::String(new)));
    }

    #[test]
    fn prop_update_attribute_equals_delete_then_add(
        kind in prop_oneof![Just(AttributeKind::Subject), Just(AttributeKind::DataSchema)],
        old in "[a-z0-9]{1,12}",
        new in "[a-z0-9]{1,12}",
    ) {
        let value = |s: &str| match kind {
            AttributeKind::DataSchema => format!("http://example.com/{}", s),
            _ => s.to_string(),
        };
        let mut e = event("1");
        match kind {
            AttributeKind::DataSchema => e.set_data_schema(value(&old)),
            _ => e.set_subject(value(&old)),
        }

        let delete = DeleteAttribute::new(kind);
        let add = AddAttribute::new(kind, Value::String(value(&new)));
        let replacement = value(&new);
        let update = UpdateAttribute::new(kind, move |_| Ok(Some(Value::String(replacement.clone()))));

        let composed = through_binary(&e, &[&delete, &add]);
        let updated = through_binary(&e, &[&update]);
        prop_assert_eq!(&composed, &updated);
        prop_assert_eq!(&through_event(&e, &[&delete, &add]), &updated);
        prop_assert_eq!(&through_event(&e, &[&update]), &updated);
        match kind {
            AttributeKind::DataSchema => {
                prop_assert_eq!(updated.data_schema().map(|u| u.to_string()), Some(value(&new)));
            }
            _ => {
                prop_assert_eq!(updated.subject(), Some(new.as_str()));
            }
        }
    }

    #[test]
    fn prop_version_round_trip(
        id in "[a-zA-Z0-9-]{1,16}",
        subject in proptest::option::of("[a-z]{1,8}"),
        ext in "[a-zA-Z0-9]{1,12}",
    ) {
        let mut e = event(&id);
        if let Some(s) = &subject {
            e.set_subject(s);
        }
        e.set_extension("exta", ext.as_str()).unwrap();

        let down = Version::new(SpecVersion::V03);
        let up = Version::new(SpecVersion::V10);
        let v03 = through_binary(&e, &[&down]);
        prop_assert_eq!(v03.spec_version(), SpecVersion::V03);
        prop_assert_eq!(&through_binary(&v03, &[&up]), &e);
        prop_assert_eq!(&through_event(&through_event(&e, &[&down]), &[&up]), &e);
    }
}

#[tokio::test]
async fn test_memory_send_finishes_once() {
    let (tx, rx) = memory::channel(4);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let msg = EventMessage::new(event("1")).with_finisher(Finisher::new(move |err| {
        seen.lock().unwrap().push(err.map(|e| e.to_string()));
        Ok(())
    }));

    let cx = Context::new();
    tx.send(&cx, Box::new(msg), &[]).await.unwrap();
    assert_eq!(*calls.lock().unwrap(), vec![None]);

    // the receiver holds an independent copy
    let mut copy = a3s_cloudevents::Receiver::receive(&rx, &cx).await.unwrap().unwrap();
    assert_eq!(a3s_cloudevents::to_event(copy.as_mut()).unwrap().id(), "1");
    copy.finish(None).unwrap();
    assert_eq!(calls.lock().unwrap().len(), 1);
}

#[test]
fn test_failed_send_finishes_with_error() {
    let (tx, rx) = memory::channel(1);
    drop(rx);
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = calls.clone();
    let msg = EventMessage::new(event("1")).with_finisher(Finisher::new(move |err| {
        seen.lock().unwrap().push(err.is_some());
        Ok(())
    }));
    let outcome = tokio_test::block_on(tx.send(&Context::new(), Box::new(msg), &[]));
    assert!(outcome.is_err());
    assert_eq!(*calls.lock().unwrap(), vec![true]);
}

#[tokio::test]
async fn test_client_preserves_order() {
    let (tx, rx) = memory::channel(8);
    let client = Client::new().with_sender(tx).with_default_defaulters();
    let cx = Context::new();

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let handler = handler_fn(move |_cx, event: Event| {
        let sink = sink.clone();
        async move {
            sink.lock().unwrap().push(event.id().to_string());
            Ok::<_, CloudEventError>(None)
        }
    });

    for i in 0..20 {
        client.send(&cx, event(&i.to_string())).await.unwrap();
    }
    drop(client);

    Client::new()
        .start_receiver(&cx, Inbound::Receiver(Arc::new(rx)), Arc::new(handler))
        .await
        .unwrap();
    let expected: Vec<String> = (0..20).map(|i| i.to_string()).collect();
    assert_eq!(*received.lock().unwrap(), expected);
}

#[test]
fn test_http_binary_to_kafka_key() {
    let mut e = event("ABC-123");
    e.set_extension(KEY_EXTENSION, "aaa").unwrap();
    let mut request = http::Request::new(Bytes::new());
    write_request(&mut EventMessage::new(e), &mut request, &[], &PipelineOptions::default()).unwrap();
    assert_eq!(request.headers()["ce-key"], "aaa");

    let mut inbound = HttpMessage::from_request(request);
    let (encoding, record) =
        write_record(&mut inbound, "orders", &[], &PipelineOptions::default()).unwrap();
    assert_eq!(encoding, Encoding::Binary);
    assert_eq!(record.topic, "orders");
    assert_eq!(record.key.as_deref(), Some(&b"aaa"[..]));
    assert!(record.header("ce_key").is_none());

    let back = a3s_cloudevents::to_event(&mut KafkaMessage::new(record)).unwrap();
    assert_eq!(back.extension(KEY_EXTENSION), Some(&Value::String("aaa".into())));
    assert_eq!(back.id(), "ABC-123");
}

#[test]
fn test_kafka_structured_forwarded_to_http_verbatim() {
    let body = Bytes::from_static(
        b"{\"specversion\":\"1.0\",  \"id\":\"K\",\"type\":\"t\",\"source\":\"/s\"}",
    );
    let record = KafkaRecord {
        topic: "orders".to_string(),
        value: body.clone(),
        headers: vec![(
            "content-type".to_string(),
            Bytes::from_static(b"application/cloudevents+json"),
        )],
        ..Default::default()
    };
    let mut msg = KafkaMessage::new(record);
    assert_eq!(msg.encoding(), Encoding::Structured);

    let mut writer = HttpWriter::new();
    let encoding =
        binding::write(&mut msg, Some(&mut writer), None, &[], &PipelineOptions::default()).unwrap();
    assert_eq!(encoding, Encoding::Structured);
    let (headers, forwarded) = writer.into_parts();
    assert_eq!(headers["content-type"], "application/cloudevents+json");
    assert_eq!(forwarded, body);
}

#[test]
fn test_transformer_declines_structured_path() {
    let body = Bytes::from_static(
        b"{\"specversion\":\"1.0\",\"id\":\"K\",\"type\":\"t\",\"source\":\"/s\"}",
    );
    let mut headers = http::HeaderMap::new();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/cloudevents+json"),
    );
    let mut msg = HttpMessage::new(headers, body);
    let add = AddExtension::new("exta", Value::Bool(true));

    // structured writer only: the event form is re-encoded with the extension
    let mut writer = HttpWriter::new();
    let encoding =
        binding::write(&mut msg, Some(&mut writer), None, &[&add], &PipelineOptions::default()).unwrap();
    assert_eq!(encoding, Encoding::Structured);
    let (headers, body) = writer.into_parts();
    let mut out = HttpMessage::new(headers, body);
    assert_eq!(
        a3s_cloudevents::to_event(&mut out).unwrap().extension("exta"),
        Some(&Value::Bool(true))
    );
}
