// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Processors
//!
//! A processor is the user-supplied step of a stage. It is written against
//! typed payloads ([`Payload`]) and erased into a [`StageProcessor`] when the
//! stage is registered, so stages with different payload types can share a
//! router.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    marker::PhantomData,
    panic::{catch_unwind, AssertUnwindSafe},
};
use tracing::error;

/// Reason reported when a processor panics instead of returning a result.
pub const PROCESSOR_ERROR_REASON: &str = "processor error";

/// Result of processing one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessResult<T> {
    /// Forward `payload` to the success output. An empty encoded payload is
    /// not forwarded.
    Success { payload: T },
    /// Forward `reason` to the failure output.
    Failure { reason: String },
}

impl<T> ProcessResult<T> {
    /// Creates a successful result.
    ///
    /// # Parameters
    /// * `payload` - Output forwarded to the success exchange of the next stage
    ///
    /// # Returns
    /// A `ProcessResult::Success` holding `payload`
    pub fn success(payload: T) -> Self {
        ProcessResult::Success { payload }
    }

    /// Creates a failed result.
    ///
    /// # Parameters
    /// * `reason` - Human-readable reason published to the failure exchange;
    ///   an empty reason is replaced by a generic one when published
    ///
    /// # Returns
    /// A `ProcessResult::Failure` holding `reason`
    pub fn failure(reason: impl Into<String>) -> Self {
        ProcessResult::Failure {
            reason: reason.into(),
        }
    }

    /// Returns true for `ProcessResult::Success`.
    pub fn is_success(&self) -> bool {
        matches!(self, ProcessResult::Success { .. })
    }

    /// Transforms the success payload, leaving a failure untouched.
    ///
    /// # Parameters
    /// * `f` - Conversion applied to the payload of a success
    ///
    /// # Returns
    /// The converted result
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ProcessResult<U> {
        match self {
            ProcessResult::Success { payload } => ProcessResult::Success {
                payload: f(payload),
            },
            ProcessResult::Failure { reason } => ProcessResult::Failure { reason },
        }
    }
}

/// Conversion between a message body and a typed payload.
pub trait Payload: Sized {
    /// Builds the payload from a delivery body.
    ///
    /// # Returns
    /// The payload, or the reason it could not be decoded
    fn decode(body: &[u8]) -> Result<Self, String>;

    /// Turns the payload into a message body.
    ///
    /// # Returns
    /// The body, or the reason the payload could not be encoded
    fn encode(self) -> Result<Vec<u8>, String>;
}

impl Payload for Vec<u8> {
    fn decode(body: &[u8]) -> Result<Self, String> {
        Ok(body.to_vec())
    }

    fn encode(self) -> Result<Vec<u8>, String> {
        Ok(self)
    }
}

impl Payload for String {
    fn decode(body: &[u8]) -> Result<Self, String> {
        String::from_utf8(body.to_vec()).map_err(|err| format!("invalid utf-8 payload: {}", err))
    }

    fn encode(self) -> Result<Vec<u8>, String> {
        Ok(self.into_bytes())
    }
}

/// A JSON document payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn decode(body: &[u8]) -> Result<Self, String> {
        serde_json::from_slice(body)
            .map(Json)
            .map_err(|err| format!("invalid json payload: {}", err))
    }

    fn encode(self) -> Result<Vec<u8>, String> {
        serde_json::to_vec(&self.0)
            .map_err(|err| format!("failure to serialize json payload: {}", err))
    }
}

/// A typed processing step.
pub trait Processor: Send + Sync + 'static {
    type Input: Payload;
    type Output: Payload;

    fn process(&self, message: Self::Input) -> ProcessResult<Self::Output>;
}

/// A processor with its payload types erased, as held by the router.
pub trait StageProcessor: Send + Sync {
    fn process(&self, body: &[u8]) -> ProcessResult<Vec<u8>>;
}

impl<P> StageProcessor for P
where
    P: Processor,
{
    fn process(&self, body: &[u8]) -> ProcessResult<Vec<u8>> {
        let input = match P::Input::decode(body) {
            Ok(input) => input,
            Err(reason) => return ProcessResult::Failure { reason },
        };

        match Processor::process(self, input) {
            ProcessResult::Success { payload } => match payload.encode() {
                Ok(body) => ProcessResult::Success { payload: body },
                Err(reason) => {
                    error!(reason = reason.as_str(), "processor output could not be encoded");
                    ProcessResult::Failure { reason }
                }
            },
            ProcessResult::Failure { reason } => ProcessResult::Failure { reason },
        }
    }
}

/// Runs a processor, turning a panic into a failure with a generic reason.
pub(crate) fn invoke(processor: &dyn StageProcessor, body: &[u8]) -> ProcessResult<Vec<u8>> {
    match catch_unwind(AssertUnwindSafe(|| processor.process(body))) {
        Ok(result) => result,
        Err(_) => {
            error!("processor panicked while handling a message");
            ProcessResult::failure(PROCESSOR_ERROR_REASON)
        }
    }
}

/// A processor backed by a closure.
pub struct FnProcessor<I, O, F> {
    f: F,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O, F> Processor for FnProcessor<I, O, F>
where
    I: Payload + 'static,
    O: Payload + 'static,
    F: Fn(I) -> ProcessResult<O> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn process(&self, message: I) -> ProcessResult<O> {
        (self.f)(message)
    }
}

/// Wraps a closure as a [`Processor`].
pub fn processor_fn<I, O, F>(f: F) -> FnProcessor<I, O, F>
where
    F: Fn(I) -> ProcessResult<O>,
{
    FnProcessor {
        f,
        _types: PhantomData,
    }
}

/// Passes every payload through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl Processor for Passthrough {
    type Input = Vec<u8>;
    type Output = Vec<u8>;

    fn process(&self, message: Vec<u8>) -> ProcessResult<Vec<u8>> {
        ProcessResult::success(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Reading {
        sensor: String,
        value: i64,
    }

    struct Doubler;

    impl Processor for Doubler {
        type Input = Json<Reading>;
        type Output = Json<Reading>;

        fn process(&self, Json(reading): Json<Reading>) -> ProcessResult<Json<Reading>> {
            if reading.value < 0 {
                return ProcessResult::failure("negative reading");
            }
            ProcessResult::success(Json(Reading {
                value: reading.value * 2,
                ..reading
            }))
        }
    }

    #[test]
    fn typed_processor_decodes_and_encodes() {
        let result = StageProcessor::process(&Doubler, br#"{"sensor":"a","value":21}"#);

        let ProcessResult::Success { payload } = result else {
            panic!("expected success");
        };
        let reading: Reading = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            reading,
            Reading {
                sensor: "a".to_owned(),
                value: 42
            }
        );
    }

    #[test]
    fn processor_failure_is_kept() {
        let result = StageProcessor::process(&Doubler, br#"{"sensor":"a","value":-1}"#);
        assert_eq!(result, ProcessResult::failure("negative reading"));
    }

    #[test]
    fn undecodable_payload_becomes_failure() {
        let result = StageProcessor::process(&Doubler, b"not json");

        let ProcessResult::Failure { reason } = result else {
            panic!("expected failure");
        };
        assert!(reason.starts_with("invalid json payload"));
    }

    #[test]
    fn unencodable_output_becomes_failure() {
        // JSON object keys must be strings
        let tuple_keys = processor_fn(|_: Vec<u8>| {
            ProcessResult::success(Json(BTreeMap::from([((1, 2), 3)])))
        });

        let result = invoke(&tuple_keys, b"anything");

        let ProcessResult::Failure { reason } = result else {
            panic!("expected failure, got {:?}", result);
        };
        assert!(reason.starts_with("failure to serialize json payload"));
    }

    #[test]
    fn panicking_processor_is_contained() {
        let exploding = processor_fn(|_: Vec<u8>| -> ProcessResult<Vec<u8>> {
            panic!("boom");
        });

        let result = invoke(&exploding, b"anything");

        assert_eq!(result, ProcessResult::failure(PROCESSOR_ERROR_REASON));
    }

    #[test]
    fn closures_work_as_processors() {
        let upper = processor_fn(|text: String| ProcessResult::success(text.to_uppercase()));

        assert_eq!(
            invoke(&upper, b"hello"),
            ProcessResult::success(b"HELLO".to_vec())
        );
        assert!(!invoke(&upper, &[0xff, 0xfe]).is_success());
    }
}
