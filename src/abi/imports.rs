//! Host functions exposed to the module.
//!
//! These are called from inside a running export. They read their
//! arguments out of linear memory through a freshly derived view and
//! operate on the [`HostState`].

use super::HostState;
use crate::codec;
use crate::error::{BridgeError, Result};
use crate::heap::SlotKey;
use crate::memory::ByteView;
use tracing::debug;

/// Import name of the structured-value parser
pub const PARSE_STRUCTURED: &str = "__wbindgen_json_parse";

/// Import name of the error raiser
pub const RAISE: &str = "__wbindgen_throw";

/// Parse the JSON text at `[ptr, ptr + len)` and register the value.
///
/// # Returns
/// * `Ok(key)` - Key of the new heap table entry
/// * `Err(_)` - The text is not valid UTF-8 or not valid JSON
pub fn parse_structured(
    state: &mut HostState,
    memory: ByteView<'_>,
    ptr: u32,
    len: u32,
) -> Result<SlotKey> {
    state.count_import();
    let text = codec::decode(memory, ptr, len)?;
    let value: serde_json::Value = serde_json::from_str(&text)?;
    state.heap_mut().add(value.into())
}

/// Decode the message at `[ptr, ptr + len)` into the error that unwinds
/// the current call.
pub fn raise(state: &mut HostState, memory: ByteView<'_>, ptr: u32, len: u32) -> BridgeError {
    state.count_import();
    match codec::decode(memory, ptr, len) {
        Ok(message) => {
            debug!(%message, "Module raised an error");
            BridgeError::ModuleFault(message)
        }
        Err(err) => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HostValue;
    use crate::memory::MemoryGeneration;
    use serde_json::json;

    fn view(bytes: &[u8]) -> ByteView<'_> {
        ByteView::new(bytes, MemoryGeneration::INITIAL)
    }

    #[test]
    fn test_parse_structured_registers_value() {
        let mut state = HostState::new();
        let memory = b"xx[\"2\"]yy";
        let key = parse_structured(&mut state, view(memory), 2, 5).unwrap();
        assert_eq!(
            state.heap().get(key).unwrap(),
            &HostValue::Json(json!(["2"]))
        );
        assert_eq!(state.import_calls(), 1);
    }

    #[test]
    fn test_parse_structured_rejects_bad_json() {
        let mut state = HostState::new();
        let err = parse_structured(&mut state, view(b"[1,"), 0, 3).unwrap_err();
        assert!(matches!(err, BridgeError::Serialization(_)));
        assert_eq!(state.heap().live_count(), 0);
    }

    #[test]
    fn test_raise_decodes_message() {
        let mut state = HostState::new();
        let err = raise(&mut state, view(b"..boom.."), 2, 4);
        assert!(matches!(err, BridgeError::ModuleFault(ref msg) if msg == "boom"));

        let err = raise(&mut state, view(&[0xff, 0xfe]), 0, 2);
        assert!(matches!(err, BridgeError::Decode { .. }));
    }
}
