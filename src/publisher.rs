// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! Conversion between the crate's plain string headers and the AMQP
//! properties lapin publishes and delivers.

use crate::broker::Headers;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Content type set on forwarded messages; payloads are opaque bytes.
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Properties for a message published by a stage.
///
/// Every message gets a fresh message id; headers are sent as long strings.
pub(crate) fn properties(headers: &Headers) -> BasicProperties {
    BasicProperties::default()
        .with_content_type(ShortString::from(OCTET_STREAM_CONTENT_TYPE))
        .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
        .with_headers(field_table(headers))
}

fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in headers {
        btree.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    FieldTable::from(btree)
}

/// Extracts the string-valued headers of a delivery. Other header types are
/// not needed for trace propagation and are skipped.
pub(crate) fn headers(props: &BasicProperties) -> Headers {
    let mut out = Headers::default();
    let Some(table) = props.headers() else {
        return out;
    };

    for (key, value) in table.inner() {
        let text = match value {
            AMQPValue::LongString(v) => String::from_utf8_lossy(v.as_bytes()).into_owned(),
            AMQPValue::ShortString(v) => v.to_string(),
            _ => continue,
        };
        out.insert(key.to_string(), text);
    }

    out
}
