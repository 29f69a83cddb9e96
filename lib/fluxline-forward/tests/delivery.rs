//! End-to-end delivery: measurements in, line-protocol batches out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fluxline_forward::{ForwardError, Proxy, SendError, Sender};
use fluxline_protocol::{
    time, Fields, FloatField, IntField, PointSet, StaticPointAllocator, Tags,
};

const TEST_TIMESTAMP: i64 = 1_136_214_245_000_000_000;

#[derive(Default)]
struct RecordingSender {
    batches: Mutex<Vec<Bytes>>,
}

#[async_trait]
impl Sender for RecordingSender {
    async fn send(&self, payload: Bytes) -> Result<(), SendError> {
        self.batches.lock().unwrap().push(payload);
        Ok(())
    }

    async fn close(&self) -> Result<(), ForwardError> {
        Ok(())
    }
}

#[tokio::test]
async fn point_set_flows_through_the_proxy() {
    time::set_fixed_timestamp(TEST_TIMESTAMP);

    let mut tags = Tags::new();
    tags.insert("host".to_string(), "example.local".to_string());

    let mut fields = Fields::new();
    fields.insert("count".to_string(), IntField::default().into());
    fields.insert("time_taken".to_string(), FloatField::default().into());

    let set = PointSet::new(StaticPointAllocator {
        key: "http_request".to_string(),
        tags,
        fields,
        identifier_tag: Some("path".to_string()),
        identifier_field: None,
    });

    let kittens = set.fields_for("/api/v1/kittens", None).unwrap();
    kittens["count"].as_int().unwrap().add(2);
    kittens["time_taken"].as_float().unwrap().add(1.7);

    let puppies = set.fields_for("/api/v1/puppies", None).unwrap();
    puppies["count"].as_int().unwrap().add(1);
    puppies["time_taken"].as_float().unwrap().add(0.1);

    let sender = Arc::new(RecordingSender::default());
    let proxy = Proxy::builder().build_with_sender(Arc::clone(&sender) as Arc<dyn Sender>);
    proxy.start(Duration::ZERO);

    proxy.write_measurement(&set).unwrap();
    proxy.flush().await.unwrap();

    let batches = sender.batches.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);

    let text = String::from_utf8(batches[0].to_vec()).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    lines.sort_unstable();
    assert_eq!(
        lines,
        [
            "http_request,host=example.local,path=/api/v1/kittens count=2i,time_taken=1.7 1136214245000000000",
            "http_request,host=example.local,path=/api/v1/puppies count=1i,time_taken=0.1 1136214245000000000",
        ]
    );

    proxy.close().await;
}

#[tokio::test]
async fn file_destination_receives_lines() {
    time::set_fixed_timestamp(TEST_TIMESTAMP);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.ln");
    let url = format!("file://{}", path.display());

    let proxy = Proxy::from_url(&url).await.unwrap();
    proxy.start(Duration::ZERO);

    let mut fields = Fields::new();
    fields.insert("value".to_string(), IntField::new(123).into());
    proxy.write_point("service.some_event", None, Tags::new(), fields).unwrap();

    // The shutdown flush carries the buffered line out.
    proxy.close().await;

    assert_eq!(
        std::fs::read_to_string(&path).unwrap(),
        "service.some_event value=123i 1136214245000000000\n"
    );
}
