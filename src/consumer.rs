// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Handling
//!
//! The per-message state machine of a stage:
//! 1. Runs the stage processor on the delivery body
//! 2. Publishes a non-empty success payload to the success fanout exchange
//! 3. Publishes the failure reason to the failure fanout exchange
//! 4. Acknowledges the delivery, whatever happened before
//!
//! Once a message reached the processor it is consumed by this stage; retries
//! belong to whoever consumes the failure exchange. Errors never leave this
//! module, so a bad message cannot stop the consume loop.

use crate::{
    broker::{BrokerChannel, PendingDelivery},
    otel,
    processor::{self, ProcessResult},
    router::Stage,
};
use opentelemetry::{
    global::BoxedTracer,
    trace::{Span, Status},
};
use std::borrow::Cow;
use tracing::{debug, error, warn};

/// Routing key used when publishing; fanout exchanges ignore it.
pub const FANOUT_ROUTING_KEY: &str = "";
/// Published on the failure exchange when a processor gives no reason.
pub const EMPTY_FAILURE_REASON: &str = "processing failed";

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Success payload published to the success exchange.
    Forwarded,
    /// Success without a payload or without an output stage; nothing published.
    Dropped,
    /// Failure reason published to the failure exchange.
    FailureForwarded,
    /// Failure without an output stage; nothing published.
    FailureDiscarded,
    /// Publishing to the output exchange failed.
    PublishFailed,
}

/// Handles one delivery for `stage` on `channel` and acknowledges it.
pub(crate) async fn consume(
    tracer: &BoxedTracer,
    stage: &Stage,
    channel: &dyn BrokerChannel,
    delivery: PendingDelivery,
) -> Outcome {
    let (ctx, mut span) = otel::new_span(&delivery.headers, tracer, &stage.name);

    debug!(
        stage = stage.name.as_str(),
        delivery_tag = delivery.delivery_tag,
        "received message"
    );

    let result = processor::invoke(stage.processor.as_ref(), &delivery.body);

    let target = match (&result, &stage.outputs) {
        (ProcessResult::Success { payload }, Some(outputs)) if !payload.is_empty() => {
            Some((outputs.success.fanout(), payload.clone()))
        }
        (ProcessResult::Failure { reason }, Some(outputs)) => {
            let reason = if reason.is_empty() {
                EMPTY_FAILURE_REASON
            } else {
                reason.as_str()
            };
            Some((outputs.failure.fanout(), reason.as_bytes().to_vec()))
        }
        _ => None,
    };

    let outcome = match target {
        None if result.is_success() => {
            debug!(
                stage = stage.name.as_str(),
                "success without payload or output stage, not forwarded"
            );
            span.set_status(Status::Ok);
            Outcome::Dropped
        }
        None => {
            warn!(stage = stage.name.as_str(), "processing failed, no failure output configured");
            span.set_status(error_status("processing failed"));
            Outcome::FailureDiscarded
        }
        Some((exchange, body)) => {
            let headers = otel::outgoing_headers(&ctx, &span);
            match channel
                .publish(exchange, FANOUT_ROUTING_KEY, &body, &headers)
                .await
            {
                Ok(()) if result.is_success() => {
                    debug!(stage = stage.name.as_str(), exchange, "message forwarded");
                    span.set_status(Status::Ok);
                    Outcome::Forwarded
                }
                Ok(()) => {
                    debug!(stage = stage.name.as_str(), exchange, "failure forwarded");
                    span.set_status(error_status("processing failed"));
                    Outcome::FailureForwarded
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        stage = stage.name.as_str(),
                        exchange,
                        "failure to publish processing result"
                    );
                    span.record_error(&err);
                    span.set_status(error_status("error to publish result"));
                    Outcome::PublishFailed
                }
            }
        }
    };

    if let Err(err) = channel.acknowledge(delivery.delivery_tag).await {
        error!(
            error = err.to_string(),
            stage = stage.name.as_str(),
            delivery_tag = delivery.delivery_tag,
            "error whiling ack msg"
        );
        span.record_error(&err);
        span.set_status(error_status("error to ack msg"));
    }

    span.end();
    outcome
}

fn error_status(description: &'static str) -> Status {
    Status::Error {
        description: Cow::from(description),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::MockBrokerChannel,
        errors::BrokerError,
        exchange::ExchangePair,
        processor::{processor_fn, Passthrough},
        queue::QueueBinding,
        router::StageOutputs,
    };
    use mockall::predicate::eq;
    use opentelemetry::global;
    use std::sync::Arc;

    fn stage(processor: Arc<dyn processor::StageProcessor>, output: bool) -> Stage {
        Stage {
            name: "app.raw".to_owned(),
            input: ExchangePair::new("app.raw"),
            queue_binding: QueueBinding::new("app.raw.queue").exchange("app.raw.topic"),
            processor,
            outputs: output.then(|| StageOutputs {
                success: ExchangePair::new("app.next.success"),
                failure: ExchangePair::new("app.next.failure"),
            }),
        }
    }

    fn tracer() -> BoxedTracer {
        global::tracer("rabbitflow tests")
    }

    #[tokio::test]
    async fn success_is_published_then_acked() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, body, _| {
                exchange == "app.next.success.fanout" && key.is_empty() && body == b"ok"
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel
            .expect_acknowledge()
            .with(eq(7))
            .times(1)
            .returning(|_| Ok(()));

        let processor = Arc::new(processor_fn(|_: Vec<u8>| {
            ProcessResult::success(b"ok".to_vec())
        }));
        let outcome = consume(
            &tracer(),
            &stage(processor, true),
            &channel,
            PendingDelivery::new(7, b"in".to_vec()),
        )
        .await;

        assert_eq!(outcome, Outcome::Forwarded);
    }

    #[tokio::test]
    async fn failure_reason_is_published_to_failure_exchange() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, _, body, _| exchange == "app.next.failure.fanout" && body == b"bad")
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel.expect_acknowledge().times(1).returning(|_| Ok(()));

        let processor = Arc::new(processor_fn(|_: Vec<u8>| {
            ProcessResult::<Vec<u8>>::failure("bad")
        }));
        let outcome = consume(
            &tracer(),
            &stage(processor, true),
            &channel,
            PendingDelivery::new(1, b"in".to_vec()),
        )
        .await;

        assert_eq!(outcome, Outcome::FailureForwarded);
    }

    #[tokio::test]
    async fn empty_reason_uses_placeholder() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|_, _, body, _| body == EMPTY_FAILURE_REASON.as_bytes())
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel.expect_acknowledge().times(1).returning(|_| Ok(()));

        let processor = Arc::new(processor_fn(|_: Vec<u8>| {
            ProcessResult::<Vec<u8>>::failure("")
        }));
        consume(
            &tracer(),
            &stage(processor, true),
            &channel,
            PendingDelivery::new(1, b"in".to_vec()),
        )
        .await;
    }

    #[tokio::test]
    async fn empty_success_is_dropped_but_acked() {
        let mut channel = MockBrokerChannel::new();
        channel.expect_publish().never();
        channel.expect_acknowledge().times(1).returning(|_| Ok(()));

        let processor = Arc::new(processor_fn(|_: Vec<u8>| {
            ProcessResult::success(Vec::<u8>::new())
        }));
        let outcome = consume(
            &tracer(),
            &stage(processor, true),
            &channel,
            PendingDelivery::new(3, b"in".to_vec()),
        )
        .await;

        assert_eq!(outcome, Outcome::Dropped);
    }

    #[tokio::test]
    async fn without_output_stage_nothing_is_published() {
        for fails in [false, true] {
            let mut channel = MockBrokerChannel::new();
            channel.expect_publish().never();
            channel.expect_acknowledge().times(1).returning(|_| Ok(()));

            let processor = Arc::new(processor_fn(move |body: Vec<u8>| {
                if fails {
                    ProcessResult::failure("bad")
                } else {
                    ProcessResult::success(body)
                }
            }));
            let outcome = consume(
                &tracer(),
                &stage(processor, false),
                &channel,
                PendingDelivery::new(9, b"in".to_vec()),
            )
            .await;

            let expected = if fails {
                Outcome::FailureDiscarded
            } else {
                Outcome::Dropped
            };
            assert_eq!(outcome, expected);
        }
    }

    #[tokio::test]
    async fn publish_error_still_acknowledges() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(BrokerError::ChannelClosed("gone".to_owned())));
        channel
            .expect_acknowledge()
            .with(eq(11))
            .times(1)
            .returning(|_| Ok(()));

        let outcome = consume(
            &tracer(),
            &stage(Arc::new(Passthrough), true),
            &channel,
            PendingDelivery::new(11, b"hello".to_vec()),
        )
        .await;

        assert_eq!(outcome, Outcome::PublishFailed);
    }

    #[tokio::test]
    async fn panicking_processor_routes_to_failure() {
        let mut channel = MockBrokerChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, _, body, _| {
                exchange == "app.next.failure.fanout"
                    && body == processor::PROCESSOR_ERROR_REASON.as_bytes()
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        channel.expect_acknowledge().times(1).returning(|_| Ok(()));

        let processor = Arc::new(processor_fn(|_: Vec<u8>| -> ProcessResult<Vec<u8>> {
            panic!("processor bug")
        }));
        let outcome = consume(
            &tracer(),
            &stage(processor, true),
            &channel,
            PendingDelivery::new(2, b"in".to_vec()),
        )
        .await;

        assert_eq!(outcome, Outcome::FailureForwarded);
    }
}
