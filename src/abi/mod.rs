//! Log decoding against registered ABI events.
//!
//! Each log filter carries an ABI; this module indexes the ABI's events by
//! selector (`topic0`) and decodes matching logs into named values.
//!
//! Indexed-parameter rules: value types (uint, int, bool, address,
//! bytes1–bytes32) are recovered from the topic word; reference types
//! (string, bytes, arrays, tuples) appear in topics as the keccak256 of
//! their encoding, so the raw 32-byte hash is returned instead.

use std::collections::HashMap;

use alloy_dyn_abi::{DynSolType, DynSolValue, Specifier};
use alloy_json_abi::Event;
use alloy_primitives::B256;

use crate::types::Log;
use crate::utils::error::{EvmIndexerError, Result};

/// One decoded event parameter.
#[derive(Debug, Clone)]
pub struct DecodedParam {
    pub name: String,
    pub value: DynSolValue,
}

/// A log decoded against an ABI event item.
#[derive(Debug, Clone)]
pub struct DecodedLog {
    pub event_name: String,
    /// Parameters in ABI declaration order (indexed and non-indexed
    /// interleaved as declared).
    pub params: Vec<DecodedParam>,
}

/// Per-filter index of ABI events by selector.
#[derive(Debug, Default)]
pub struct AbiEventRegistry {
    by_filter: HashMap<String, HashMap<B256, Event>>,
}

impl AbiEventRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every event of a filter's ABI under the filter name.
    pub fn register_filter(
        &mut self,
        filter_name: impl Into<String>,
        events: impl IntoIterator<Item = (B256, Event)>,
    ) {
        self.by_filter
            .entry(filter_name.into())
            .or_default()
            .extend(events);
    }

    /// The ABI event a filter registered for `selector`.
    #[must_use]
    pub fn event_for(&self, filter_name: &str, selector: B256) -> Option<&Event> {
        self.by_filter.get(filter_name)?.get(&selector)
    }

    /// Selectors registered for a filter.
    #[must_use]
    pub fn selectors_for(&self, filter_name: &str) -> Vec<B256> {
        self.by_filter
            .get(filter_name)
            .map(|events| events.keys().copied().collect())
            .unwrap_or_default()
    }

    /// The selector of `event_name` within a filter's ABI, if registered.
    #[must_use]
    pub fn selector_for(&self, filter_name: &str, event_name: &str) -> Option<B256> {
        self.by_filter
            .get(filter_name)?
            .iter()
            .find(|(_, event)| event.name == event_name)
            .map(|(selector, _)| *selector)
    }
}

fn is_hashed_when_indexed(ty: &DynSolType) -> bool {
    matches!(
        ty,
        DynSolType::String
            | DynSolType::Bytes
            | DynSolType::Array(_)
            | DynSolType::FixedArray(..)
            | DynSolType::Tuple(_)
    )
}

/// Decodes `log` against `event`.
///
/// # Errors
///
/// Returns `Decoding` when the topic count does not match the event's
/// indexed parameters, a type fails to resolve, or the data payload does not
/// ABI-decode as the non-indexed tuple.
pub fn decode_log(event: &Event, log: &Log) -> Result<DecodedLog> {
    let mut indexed = Vec::new();
    let mut body_types = Vec::new();
    for input in &event.inputs {
        let ty = input.resolve().map_err(|e| {
            EvmIndexerError::Decoding(format!(
                "{}.{}: unresolvable type '{}': {e}",
                event.name, input.name, input.ty
            ))
        })?;
        if input.indexed {
            indexed.push((input.name.clone(), ty));
        } else {
            body_types.push((input.name.clone(), ty));
        }
    }

    // Indexed values live in topics 1..=3 in declaration order.
    let mut indexed_values = Vec::with_capacity(indexed.len());
    for (slot, (name, ty)) in indexed.iter().enumerate() {
        let topic = log.topic(slot + 1).ok_or_else(|| {
            EvmIndexerError::Decoding(format!(
                "{}: missing topic{} for indexed parameter '{name}'",
                event.name,
                slot + 1
            ))
        })?;
        let value = if is_hashed_when_indexed(ty) {
            DynSolValue::FixedBytes(topic, 32)
        } else {
            ty.abi_decode(topic.as_slice()).map_err(|e| {
                EvmIndexerError::Decoding(format!(
                    "{}: bad topic{} for '{name}': {e}",
                    event.name,
                    slot + 1
                ))
            })?
        };
        indexed_values.push(value);
    }

    // Non-indexed values are the data payload, ABI-encoded as a tuple.
    let body_values = if body_types.is_empty() {
        Vec::new()
    } else {
        let tuple = DynSolType::Tuple(body_types.iter().map(|(_, ty)| ty.clone()).collect());
        match tuple.abi_decode(&log.data).map_err(|e| {
            EvmIndexerError::Decoding(format!("{}: bad data payload: {e}", event.name))
        })? {
            DynSolValue::Tuple(values) => values,
            other => vec![other],
        }
    };

    // Re-interleave into declaration order.
    let mut indexed_iter = indexed_values.into_iter();
    let mut body_iter = body_values.into_iter();
    let mut params = Vec::with_capacity(event.inputs.len());
    for input in &event.inputs {
        let value = if input.indexed {
            indexed_iter.next()
        } else {
            body_iter.next()
        }
        .ok_or_else(|| {
            EvmIndexerError::Decoding(format!(
                "{}: parameter count mismatch at '{}'",
                event.name, input.name
            ))
        })?;
        params.push(DecodedParam {
            name: input.name.clone(),
            value,
        });
    }

    Ok(DecodedLog {
        event_name: event.name.clone(),
        params,
    })
}
