use sdilog::address::SensorAddress;
use sdilog::codec::{Reading, ReadingSet};
use sdilog::config::LoggerConfig;
use sdilog::cycle::ReadingBatch;
use sdilog::link::BrokerLink;
use sdilog::sim::ScriptedBroker;
use sdilog::telemetry::{joined_payload, PayloadEncoding, PublishOutcome, TelemetryPublisher, TopicBuilder, VALUE_SEPARATOR};

fn batch(address: char, values: &[(f32, u8)]) -> ReadingBatch {
    let mut readings = ReadingSet::new();
    for &(value, precision) in values {
        readings.push(Reading::new(value, precision)).unwrap();
    }
    ReadingBatch {
        address: SensorAddress::new(address).unwrap(),
        readings,
        taken_at_ms: 0,
        retries: 0,
    }
}

fn connected(broker: ScriptedBroker) -> BrokerLink<ScriptedBroker> {
    let mut link = BrokerLink::new(broker, &LoggerConfig::default());
    link.service(0);
    link
}

fn publisher() -> TelemetryPublisher {
    TelemetryPublisher::new(TopicBuilder::new("acme", "north"))
}

fn published(link: &BrokerLink<ScriptedBroker>) -> Vec<(&str, &str)> {
    link.transport()
        .published()
        .iter()
        .map(|(topic, payload)| (topic.as_str(), payload.as_str()))
        .collect()
}

#[test]
fn test_joined_payload_separators() {
    let batch = batch('1', &[(1.0, 1), (2.25, 2), (-3.0, 0), (4.5, 1)]);
    let payload = joined_payload(&batch.readings);
    assert_eq!(payload, "1.0, 2.25, -3, 4.5");
    assert_eq!(payload.matches(VALUE_SEPARATOR).count(), 3);
    assert!(!payload.ends_with(' '));
}

#[test]
fn test_joined_publish_single_message() {
    let mut link = connected(ScriptedBroker::online());
    let mut publisher = publisher();

    let outcome = publisher.publish(&mut link, &batch('4', &[(12.3, 1), (-4.5, 1)]), PayloadEncoding::Joined, 0);

    assert_eq!(outcome, PublishOutcome::Published { messages: 1, retried: false });
    assert_eq!(published(&link), [("acme/north/4", "12.3, -4.5")]);
    assert_eq!(publisher.stats().batches_published, 1);
}

#[test]
fn test_segmented_publish_one_channel_per_value() {
    let mut link = connected(ScriptedBroker::online());
    let mut publisher = publisher();

    publisher.publish(&mut link, &batch('b', &[(0.5, 1), (21.0, 1), (7.0, 0)]), PayloadEncoding::Segmented, 0);

    assert_eq!(
        published(&link),
        [("acme/north/b/a", "0.5"), ("acme/north/b/b", "21.0"), ("acme/north/b/c", "7")]
    );
}

#[test]
fn test_failed_publish_retried_after_reconnect() {
    let mut link = connected(ScriptedBroker::online().failing_publishes(1));
    let mut publisher = publisher();

    let outcome = publisher.publish(&mut link, &batch('1', &[(1.0, 1)]), PayloadEncoding::Joined, 0);

    assert_eq!(outcome, PublishOutcome::Published { messages: 1, retried: true });
    assert_eq!(published(&link).len(), 1);
    assert_eq!(publisher.stats().reconnects_triggered, 1);
}

#[test]
fn test_second_failure_drops_batch() {
    let mut link = connected(ScriptedBroker::online().failing_publishes(2));
    let mut publisher = publisher();

    let outcome = publisher.publish(&mut link, &batch('1', &[(1.0, 1), (2.0, 1)]), PayloadEncoding::Segmented, 0);

    assert_eq!(outcome, PublishOutcome::Dropped { published: 0, total: 2 });
    assert!(published(&link).is_empty());
    assert_eq!(publisher.stats().batches_dropped, 1);
}

#[test]
fn test_segmented_retry_resumes_at_failed_value() {
    let mut link = connected(ScriptedBroker::online().failing_publishes(1));
    let mut publisher = publisher();

    let outcome = publisher.publish(&mut link, &batch('1', &[(1.0, 1), (2.0, 1), (3.0, 1)]), PayloadEncoding::Segmented, 0);

    assert_eq!(outcome, PublishOutcome::Published { messages: 3, retried: true });
    let topics: Vec<&str> = published(&link).into_iter().map(|(topic, _)| topic).collect();
    assert_eq!(topics, ["acme/north/1/a", "acme/north/1/b", "acme/north/1/c"]);
}

#[test]
fn test_publish_during_cooldown_drops_without_reconnect() {
    let mut config = LoggerConfig::default();
    config.retry.max_attempts = 1;
    let mut link = BrokerLink::new(ScriptedBroker::new().failing_connects(1), &config);
    link.service(0);
    assert!(link.in_cooldown(1));
    let attempts = link.transport().connect_attempts;

    let mut publisher = publisher();
    let outcome = publisher.publish(&mut link, &batch('1', &[(1.0, 1)]), PayloadEncoding::Joined, 1);

    assert_eq!(outcome, PublishOutcome::Dropped { published: 0, total: 1 });
    assert_eq!(link.transport().connect_attempts, attempts);
    assert_eq!(publisher.stats().reconnects_triggered, 0);
}

#[test]
fn test_too_many_segments_dropped() {
    let mut link = connected(ScriptedBroker::online());
    let mut publisher = publisher();
    let values: Vec<(f32, u8)> = (0..27).map(|i| (i as f32, 0)).collect();

    let outcome = publisher.publish(&mut link, &batch('1', &values), PayloadEncoding::Segmented, 0);

    assert_eq!(outcome, PublishOutcome::Dropped { published: 0, total: 27 });
    assert!(published(&link).is_empty());
}
